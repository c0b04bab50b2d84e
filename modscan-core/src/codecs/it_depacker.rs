// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scans (but does not materialize) IT block-compressed sample streams.
//!
//! Each block starts with a `u16` byte count, after which a variable
//! bit-width delta stream runs until the block's sample quota is met. The
//! bit width starts at 9 (8-bit samples) or 17 (16-bit samples) and can
//! change mid-block through one of three encodings, selected by the
//! *current* width rather than the sample width:
//!
//! - width `1..=6`: the code equal to `1 << (width - 1)` is a "change
//!   width" escape; a few more bits follow giving the new width.
//! - width `7..=8` (8-bit) / `7..=16` (16-bit): a narrow band of codes
//!   just below the maximum value is reserved for width changes.
//! - width `9` (8-bit) / `17` (16-bit), i.e. the maximum: the high bit of
//!   the code signals a width change, the rest of the code is the new
//!   width minus one.
//!
//! A width that would exceed the format maximum is illegal: the scanner
//! flags it and abandons the rest of the current block (not the sample).

use crate::io::{BitReaderIt, ByteReader, ReadBytes};
use crate::error::Result;
use crate::model::CompressionStats;

fn max_width(is_16bit: bool) -> u32 {
    if is_16bit { 17 } else { 9 }
}

fn extra_bits(is_16bit: bool) -> u32 {
    if is_16bit { 4 } else { 3 }
}

/// Scans every block of a compressed sample's bitstream, starting at the
/// reader's current position, and returns aggregate statistics plus
/// whether an illegal bit width was observed anywhere in the sample.
///
/// The reader is left positioned immediately after the last block
/// consumed.
pub fn scan_it_compressed_sample(
    reader: &mut ByteReader<'_>,
    length_frames: u32,
    is_16bit: bool,
) -> Result<(CompressionStats, bool)> {
    let mut stats = CompressionStats {
        smallest_block_bytes: u32::MAX,
        smallest_block_samples: u32::MAX,
        ..Default::default()
    };
    let mut invalid_width = false;
    let mut remaining = length_frames;
    let max_w = max_width(is_16bit);
    let extra = extra_bits(is_16bit);
    let offset = 1u32 << (extra - 1);
    let max_mask: u32 = if is_16bit { 0xffff } else { 0xff };
    let high_bit: u32 = if is_16bit { 0x1_0000 } else { 0x100 };

    while remaining > 0 {
        let block_byte_count = reader.read_u16le()? as u32;
        let block_max_samples: u32 = if is_16bit { 0x4000 } else { 0x8000 };
        let block_sample_count = remaining.min(block_max_samples);

        let block_start = reader.position();
        reader.skip(block_byte_count as usize)?;

        let mut bits = BitReaderIt::new(reader.whole(), block_start, block_byte_count as usize);
        let mut width = max_w;
        let mut produced = 0u32;

        'block: while produced < block_sample_count {
            let code = match bits.read(width) {
                Ok(c) => c,
                Err(_) => break 'block,
            };

            if width < 7 {
                if code == (1 << (width - 1)) {
                    let v = match bits.read(extra) {
                        Ok(v) => v + 1,
                        Err(_) => break 'block,
                    };
                    width = if v < width { v } else { v + 1 };
                    if width > max_w {
                        invalid_width = true;
                        break 'block;
                    }
                    continue;
                }
            } else if width < max_w {
                let a = (max_mask >> (max_w - width)) + offset;
                let b = a - 2 * offset;
                if code > b && code <= a {
                    let v = code - b;
                    width = if v < width { v } else { v + 1 };
                    if width > max_w {
                        invalid_width = true;
                        break 'block;
                    }
                    continue;
                }
            } else if code & high_bit != 0 {
                width = (code & 0xff) + 1;
                if width > max_w {
                    invalid_width = true;
                    break 'block;
                }
                continue;
            }

            produced += 1;
        }

        stats.compressed_bytes += block_byte_count + 2;
        stats.uncompressed_bytes += produced * if is_16bit { 2 } else { 1 };
        stats.smallest_block_bytes = stats.smallest_block_bytes.min(block_byte_count);
        stats.largest_block_bytes = stats.largest_block_bytes.max(block_byte_count);
        stats.smallest_block_samples = stats.smallest_block_samples.min(produced);

        remaining -= block_sample_count;
    }

    if stats.smallest_block_bytes == u32::MAX {
        stats.smallest_block_bytes = 0;
    }
    if stats.smallest_block_samples == u32::MAX {
        stats.smallest_block_samples = 0;
    }

    Ok((stats, invalid_width))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One 8-bit sample, one block: width-change code (high bit set, new
    /// width 1) followed by a single 1-bit delta sample.
    #[test]
    fn single_sample_block_matches_byte_and_sample_totals() {
        // byte 0: contributes bits 0..7 of the first 9-bit code (all zero).
        // byte 1, bit 0: the 9th bit of that code, set -> code == 0x100.
        let data = [0x00u8, 0x01];
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u16.to_le_bytes()); // block byte count
        buf.extend_from_slice(&data);

        let mut reader = ByteReader::new(&buf);
        let (stats, invalid) = scan_it_compressed_sample(&mut reader, 1, false).unwrap();

        assert!(!invalid);
        assert_eq!(stats.compressed_bytes, 4);
        assert_eq!(stats.uncompressed_bytes, 1);
    }

    #[test]
    fn short_read_inside_block_does_not_fail_whole_scan() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.push(0xff);
        let mut reader = ByteReader::new(&buf);
        let (_, invalid) = scan_it_compressed_sample(&mut reader, 100, false).unwrap();
        assert!(!invalid);
    }
}
