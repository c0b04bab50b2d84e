// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error-detecting codes used by the archive formats.

mod crc32;

pub use crc32::Crc32;
