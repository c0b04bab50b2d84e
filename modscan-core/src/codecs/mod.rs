// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! The two bitstream decompressors whose correctness depends on
//! fine-grained error handling: the IT compressed-sample scanner and the
//! classic-LZX depacker.

pub mod it_depacker;
pub mod lzx_depacker;

pub use it_depacker::scan_it_compressed_sample;
pub use lzx_depacker::{LzxDepacker, LzxOutput};
