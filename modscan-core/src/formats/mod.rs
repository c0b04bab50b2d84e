// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! One module per supported format family. Each exposes a free function
//! (`handler`, or `asylum_handler`/`dsmi_handler` where one module covers
//! two unrelated formats sharing an extension) returning a boxed
//! [`crate::registry::FormatHandler`]; [`crate::registry::register_all`]
//! composes them in the documented sniffing order.

pub mod amf;
pub mod arcfs;
pub mod coconizer;
pub mod dsm;
pub mod dtt;
pub mod far;
pub mod gdm;
pub mod it;
pub mod liq;
pub mod lzx_archive;
pub mod masi;
pub mod med;
pub mod mtm;
pub mod protracker;
pub mod rtm;
pub mod s3m;
pub mod sixsixnine;
pub mod stm;
pub mod ult;
