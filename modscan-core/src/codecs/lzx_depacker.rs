// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Classic Amiga LZX decompression: canonical Huffman over a pretree,
//! main/offset tree, length tree, and aligned-offset tree, plus verbatim
//! and uncompressed block types and a three-slot recent-offset LRU.
//!
//! Block type numbering here (1 = uncompressed, 2 = verbatim, 3 = aligned)
//! is classic LZX's own, not CAB LZX's — the two assign the same numbers
//! to different block kinds.

use crate::error::{ParseError, Result};
use crate::io::BitReaderLzx;

const PRETREE_SYMBOLS: usize = 20;
const ALIGNED_SYMBOLS: usize = 8;
const LENGTH_SYMBOLS: usize = 249;

fn bad_packing(msg: &str) -> ParseError {
    ParseError::bad_packing(msg.to_string())
}

/// A canonical Huffman decode table built from an array of per-symbol
/// code lengths (`0` meaning "unused").
struct HuffmanTable {
    counts: [u32; 17],
    first_code: [u32; 17],
    first_symbol_index: [u32; 17],
    symbols: Vec<u16>,
}

impl HuffmanTable {
    fn build(lengths: &[u8]) -> Self {
        let mut counts = [0u32; 17];
        for &l in lengths {
            if l > 0 {
                counts[l as usize] += 1;
            }
        }

        let mut first_code = [0u32; 17];
        let mut code = 0u32;
        for len in 1..=16usize {
            first_code[len] = code;
            code = (code + counts[len]) << 1;
        }

        let mut first_symbol_index = [0u32; 17];
        let mut idx = 0u32;
        for len in 1..=16usize {
            first_symbol_index[len] = idx;
            idx += counts[len];
        }

        let mut cursor = first_symbol_index;
        let mut symbols = vec![0u16; idx as usize];
        for (sym, &l) in lengths.iter().enumerate() {
            if l == 0 {
                continue;
            }
            let pos = cursor[l as usize] as usize;
            symbols[pos] = sym as u16;
            cursor[l as usize] += 1;
        }

        HuffmanTable { counts, first_code, first_symbol_index, symbols }
    }

    /// Bit-reverses the next 16 bits, matches it against each code length
    /// in turn (classic LZX's own canonical assignment), and consumes the
    /// bits of whichever length matched.
    fn decode(&self, bits: &mut BitReaderLzx) -> Option<u16> {
        let peeked = bits.peek_huffman16() as u32;
        for len in 1..=16usize {
            if self.counts[len] == 0 {
                continue;
            }
            let candidate = peeked >> (16 - len);
            if candidate >= self.first_code[len] && candidate < self.first_code[len] + self.counts[len]
            {
                let sym_idx = self.first_symbol_index[len] + (candidate - self.first_code[len]);
                bits.advance(len as u32);
                return Some(self.symbols[sym_idx as usize]);
            }
        }
        None
    }
}

fn extra_bits_for_slot(slot: u32) -> u32 {
    if slot < 4 {
        0
    } else {
        (slot >> 1) - 1
    }
}

fn position_base(slot: u32) -> u32 {
    let mut base = 0u32;
    for s in 0..slot {
        base += 1 << extra_bits_for_slot(s);
    }
    base
}

/// Delta-decodes `lengths[start..end]` using a freshly-read 20-symbol,
/// 4-bit-width pretree, per the run-length escapes in the pretree
/// alphabet (codes 17/18/19).
fn decode_delta_segment(
    bits: &mut BitReaderLzx,
    lengths: &mut [u8],
    start: usize,
    end: usize,
) -> Result<()> {
    let mut pretree_lengths = [0u8; PRETREE_SYMBOLS];
    for l in &mut pretree_lengths {
        *l = bits.get_bits(4) as u8;
    }
    let pretree = HuffmanTable::build(&pretree_lengths);

    let apply_delta = |prev: u8, delta: u32| -> u8 {
        (((prev as i32) - (delta as i32)).rem_euclid(17)) as u8
    };

    let mut i = start;
    while i < end {
        let symbol = pretree
            .decode(bits)
            .ok_or_else(|| bad_packing("pretree decode failure"))?;
        match symbol {
            0..=16 => {
                lengths[i] = apply_delta(lengths[i], symbol as u32);
                i += 1;
            }
            17 => {
                let run = bits.get_bits(4) + 4;
                for _ in 0..run {
                    if i >= end {
                        break;
                    }
                    lengths[i] = 0;
                    i += 1;
                }
            }
            18 => {
                let run = bits.get_bits(5) + 20;
                for _ in 0..run {
                    if i >= end {
                        break;
                    }
                    lengths[i] = 0;
                    i += 1;
                }
            }
            19 => {
                let run = bits.get_bits(1) + 4;
                let delta_sym = pretree
                    .decode(bits)
                    .ok_or_else(|| bad_packing("pretree decode failure"))?;
                let value = apply_delta(lengths[i], delta_sym as u32);
                for _ in 0..run {
                    if i >= end {
                        break;
                    }
                    lengths[i] = value;
                    i += 1;
                }
            }
            _ => return Err(bad_packing("pretree symbol out of range")),
        }
    }
    Ok(())
}

fn read_footer_bits(
    bits: &mut BitReaderLzx,
    aligned_tree: Option<&HuffmanTable>,
    extra: u32,
) -> Result<u32> {
    if extra == 0 {
        return Ok(0);
    }
    if extra >= 3 {
        if let Some(tree) = aligned_tree {
            let high = bits.get_bits(extra - 3) << 3;
            let low = tree.decode(bits).ok_or_else(|| bad_packing("aligned tree decode failure"))?;
            return Ok(high | low as u32);
        }
    }
    Ok(bits.get_bits(extra))
}

fn resolve_offset(recent: &mut [u32; 3], c: u32) -> u32 {
    match c {
        0 => recent[0],
        1 => {
            let d = recent[1];
            recent.swap(0, 1);
            d
        }
        2 => {
            let d = recent[2];
            recent.swap(0, 2);
            d
        }
        _ => {
            let distance = c - 2;
            recent[2] = recent[1];
            recent[1] = recent[0];
            recent[0] = distance;
            distance
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LzxOutput {
    pub bytes: Vec<u8>,
    pub used_aligned_block: bool,
    pub used_uncompressed_block: bool,
}

pub struct LzxDepacker {
    window_bits: u32,
}

impl LzxDepacker {
    /// `window_bits` must be in `15..=21`; classic LZX assumes a fixed
    /// window but the decoder accepts it as a parameter so a
    /// counter-example archive can still be decoded.
    pub fn new(window_bits: u32) -> Result<Self> {
        if !(15..=21).contains(&window_bits) {
            return Err(ParseError::invalid(format!(
                "unsupported LZX window_bits: {}",
                window_bits
            )));
        }
        Ok(LzxDepacker { window_bits })
    }

    /// Decodes a packed LZX entry starting at `data[start..]`, stopping
    /// once `output_len` bytes have been produced.
    pub fn decompress(&self, data: &[u8], start: usize, output_len: usize) -> Result<LzxOutput> {
        let total_main_symbols = 256 + 8 * (self.window_bits as usize * 2);
        let mut main_lengths = vec![0u8; total_main_symbols];
        let mut length_lengths = [0u8; LENGTH_SYMBOLS];
        let mut recent: [u32; 3] = [1, 1, 1];

        let mut bits = BitReaderLzx::new(data, start);
        let mut out = LzxOutput::default();

        while out.bytes.len() < output_len {
            let block_type = bits.get_bits(3);

            let aligned_tree = if block_type == 3 {
                out.used_aligned_block = true;
                let mut aligned_lengths = [0u8; ALIGNED_SYMBOLS];
                for l in &mut aligned_lengths {
                    *l = bits.get_bits(3) as u8;
                }
                Some(HuffmanTable::build(&aligned_lengths))
            } else {
                None
            };

            let block_len =
                (bits.get_bits(8) << 16) | (bits.get_bits(8) << 8) | bits.get_bits(8);

            match block_type {
                1 => {
                    out.used_uncompressed_block = true;
                    bits.align_to_word_boundary();
                    let header = bits
                        .read_raw_bytes(12)
                        .ok_or_else(|| bad_packing("truncated uncompressed block header"))?;
                    recent[0] = u32::from_le_bytes(header[0..4].try_into().unwrap());
                    recent[1] = u32::from_le_bytes(header[4..8].try_into().unwrap());
                    recent[2] = u32::from_le_bytes(header[8..12].try_into().unwrap());
                    let payload = bits
                        .read_raw_bytes(block_len as usize)
                        .ok_or_else(|| bad_packing("truncated uncompressed payload"))?;
                    out.bytes.extend_from_slice(payload);
                }
                2 | 3 => {
                    decode_delta_segment(&mut bits, &mut main_lengths, 0, 256)?;
                    decode_delta_segment(&mut bits, &mut main_lengths, 256, total_main_symbols)?;
                    let main_tree = HuffmanTable::build(&main_lengths);

                    decode_delta_segment(&mut bits, &mut length_lengths, 0, LENGTH_SYMBOLS)?;
                    let length_tree = HuffmanTable::build(&length_lengths);

                    let mut produced = 0u32;
                    while produced < block_len {
                        let symbol = main_tree
                            .decode(&mut bits)
                            .ok_or_else(|| bad_packing("main tree decode failure"))?;

                        if symbol < 256 {
                            out.bytes.push(symbol as u8);
                            produced += 1;
                            continue;
                        }

                        let m = (symbol - 256) as u32;
                        let slot = m / 8;
                        let length_header = m % 8;
                        let extra = extra_bits_for_slot(slot);
                        let footer = read_footer_bits(&mut bits, aligned_tree.as_ref(), extra)?;
                        let c = if slot < 3 { slot } else { position_base(slot) + footer };
                        let distance = resolve_offset(&mut recent, c);

                        let length = if length_header == 7 {
                            let extra_len = length_tree
                                .decode(&mut bits)
                                .ok_or_else(|| bad_packing("length tree decode failure"))?;
                            9 + extra_len as u32
                        } else {
                            2 + length_header
                        };

                        if distance == 0 || distance as usize > out.bytes.len() {
                            return Err(bad_packing("match distance exceeds output produced so far"));
                        }
                        for _ in 0..length {
                            let b = out.bytes[out.bytes.len() - distance as usize];
                            out.bytes.push(b);
                        }
                        produced += length;
                    }
                }
                _ => return Err(bad_packing("invalid classic-LZX block type")),
            }

            if out.bytes.len() > output_len {
                out.bytes.truncate(output_len);
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_window_bits() {
        assert!(LzxDepacker::new(14).is_err());
        assert!(LzxDepacker::new(22).is_err());
        assert!(LzxDepacker::new(15).is_ok());
        assert!(LzxDepacker::new(21).is_ok());
    }

    #[test]
    fn decodes_a_single_uncompressed_block() {
        let payload = b"the quick brown fox";
        let mut stream_bits: u32 = 1; // block type 1, 3 bits
        let mut nbits = 3u32;
        // Helper closure-free manual bit packer (MSB-first semantics match
        // BitReaderLzx::get_bits, which reads the highest-order unconsumed
        // bits of each fetched 16-bit big-endian word first).
        let mut bytes: Vec<u8> = Vec::new();
        let mut push_bits = |value: u32, width: u32, bitbuf: &mut u32, bitcount: &mut u32, out: &mut Vec<u8>| {
            *bitbuf = (*bitbuf << width) | (value & ((1u32 << width) - 1));
            *bitcount += width;
            while *bitcount >= 16 {
                let word = ((*bitbuf >> (*bitcount - 16)) & 0xffff) as u16;
                out.extend_from_slice(&word.to_be_bytes());
                *bitcount -= 16;
            }
        };
        push_bits(1, 3, &mut stream_bits, &mut nbits, &mut bytes);
        push_bits(payload.len() as u32, 24, &mut stream_bits, &mut nbits, &mut bytes);
        // Align to word boundary: pad remaining bits with zero.
        if nbits % 16 != 0 {
            let pad = 16 - (nbits % 16);
            push_bits(0, pad, &mut stream_bits, &mut nbits, &mut bytes);
        }
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(payload);
        if bytes.len() % 2 != 0 {
            bytes.push(0);
        }

        let depacker = LzxDepacker::new(16).unwrap();
        let out = depacker.decompress(&bytes, 0, payload.len()).unwrap();
        assert_eq!(out.bytes, payload);
        assert!(out.used_uncompressed_block);
        assert!(!out.used_aligned_block);
    }

    #[test]
    fn recent_offset_lru_matches_spec_rules() {
        let mut recent = [10u32, 20, 30];
        assert_eq!(resolve_offset(&mut recent, 0), 10);
        assert_eq!(recent, [10, 20, 30]);

        assert_eq!(resolve_offset(&mut recent, 1), 20);
        assert_eq!(recent, [20, 10, 30]);

        assert_eq!(resolve_offset(&mut recent, 2), 30);
        assert_eq!(recent, [30, 20, 10]);

        assert_eq!(resolve_offset(&mut recent, 5), 3);
        assert_eq!(recent, [3, 30, 20]);
    }

    #[test]
    fn huffman_table_round_trips_simple_codes() {
        // 4 symbols, all length 2: canonical codes 00, 01, 10, 11.
        let lengths = [2u8, 2, 2, 2];
        let table = HuffmanTable::build(&lengths);
        // Construct a stream containing codes for symbols 2,0,3,1 in order.
        let codes = [2u32, 0, 3, 1];
        let mut acc: u32 = 0;
        let mut nbits = 0u32;
        let mut bytes = Vec::new();
        for &c in &codes {
            acc = (acc << 2) | c;
            nbits += 2;
            while nbits >= 16 {
                let word = ((acc >> (nbits - 16)) & 0xffff) as u16;
                bytes.extend_from_slice(&word.to_be_bytes());
                nbits -= 16;
            }
        }
        if nbits > 0 {
            let word = ((acc << (16 - nbits)) & 0xffff) as u16;
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        let mut bits = BitReaderLzx::new(&bytes, 0);
        for &expect in &codes {
            assert_eq!(table.decode(&mut bits).unwrap(), expect as u16);
        }
    }
}
