// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coconizer: headerless, identified only by structural plausibility
//! (channel count 4 or 8, a mandatory 0x0d byte inside every name field,
//! order/pattern offsets that fit the file). Because it carries no
//! magic at all it must be the very last handler the registry tries.
//!
//! A secondary variant, CoconizerSong, wraps the same module inside a
//! relocatable ARM executable; detecting it means disassembling just
//! enough of a fixed instruction pair (`ADD r10, pc, #imm` optionally
//! followed by `ADD r10, r10, #imm`) to compute where the real module
//! starts.

use crate::error::{ParseError, Result};
use crate::io::{read_padded, ByteReader, ReadBytes};
use crate::model::{Instrument, InstrumentKind, LoopKind, Module, OrderEntry, Pattern};
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::usage::Feature;

const NUM_ROWS: usize = 64;
const MAX_SAMPLE_BYTES: u32 = 1600 * 1024;
const PROBE_LEN: usize = 44;
const ARM_SCAN_LEN: usize = 1024;
const ADD_R10_PC: u32 = 0xe28f_a000;
const ADD_R10_R10: u32 = 0xe28a_a000;

fn instruction_class(instruction: u32) -> u32 {
    instruction & 0xffff_f000
}

fn instruction_immediate(instruction: u32) -> u32 {
    let value = instruction & 0xff;
    let rot = (instruction & 0xf00) >> 7;
    if rot == 0 {
        value
    } else {
        (value >> rot) | (value << (32 - rot))
    }
}

struct RelocHeader {
    start_address: u32,
    init_address: u32,
    finish_address: u32,
    service_handler: u32,
    title_address: u32,
    help_address: u32,
    keyword_address: u32,
}

fn u32le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Scans at most [`ARM_SCAN_LEN`] bytes of ARM code starting at the
/// wrapper's `finish_address` for the `ADD r10, pc` / `ADD r10, r10` pair
/// that computes the embedded module's start offset. Returns that offset
/// only if the byte it points at is a plausible Coconizer channel/flag
/// byte (0x04 or 0x08).
fn find_coconizer_song(probe: &[u8; PROBE_LEN], reader: &ByteReader<'_>) -> Option<usize> {
    let rmh = RelocHeader {
        start_address: u32le(probe, 0),
        init_address: u32le(probe, 4),
        finish_address: u32le(probe, 8),
        service_handler: u32le(probe, 12),
        title_address: u32le(probe, 16),
        help_address: u32le(probe, 20),
        keyword_address: u32le(probe, 24),
    };

    if rmh.start_address != 0 {
        return None;
    }
    if rmh.init_address < 0x2c || rmh.init_address >= 0x400 || rmh.init_address & 3 != 0 {
        return None;
    }
    if rmh.finish_address < 0x2c
        || rmh.finish_address >= 0x400
        || rmh.finish_address & 3 != 0
        || rmh.finish_address < rmh.init_address
    {
        return None;
    }
    if rmh.service_handler != 0 {
        return None;
    }
    if rmh.title_address != 0x1c {
        return None;
    }
    if rmh.help_address != 0
        && (rmh.help_address & 3 != 0 || rmh.help_address > rmh.init_address || rmh.help_address < 0x2c)
    {
        return None;
    }
    if rmh.keyword_address != 0
        && (rmh.keyword_address & 3 != 0
            || rmh.keyword_address > rmh.init_address
            || rmh.keyword_address < 0x2c
            || (rmh.help_address != 0 && rmh.keyword_address < rmh.help_address))
    {
        return None;
    }
    if &probe[28..44] != b"CoconizerSong\0\0\0" {
        return None;
    }

    let mut scan = reader.fork_at(rmh.finish_address as usize);
    let mut buffer = [0u8; ARM_SCAN_LEN];
    if !read_padded(&mut scan, &mut buffer) {
        return None;
    }

    let mut pos = 0usize;
    let mut pc = rmh.finish_address;
    while pos + 4 <= buffer.len() {
        let instruction = u32le(&buffer, pos);
        pos += 4;
        pc = pc.wrapping_add(4);
        if instruction_class(instruction) != ADD_R10_PC {
            continue;
        }
        let mut offset = pc.wrapping_add(4).wrapping_add(instruction_immediate(instruction));

        if pos + 4 <= buffer.len() {
            let next = u32le(&buffer, pos);
            pos += 4;
            pc = pc.wrapping_add(4);
            if instruction_class(next) == ADD_R10_R10 {
                offset = offset.wrapping_add(instruction_immediate(next));
            }
        }

        let mut check = reader.fork_at(offset as usize);
        let flag_byte = match check.read_u8() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if flag_byte == 0x04 || flag_byte == 0x08 {
            return Some(offset as usize);
        }
    }
    None
}

fn contains_lf(name: &[u8]) -> bool {
    name.iter().any(|&b| b == 0x0d)
}

struct RawInstrument {
    sample_offset: u32,
    length: u32,
    volume: u32,
    loop_start: u32,
    loop_length: u32,
    name: [u8; 11],
}

pub struct CoconizerHandler;

impl FormatHandler for CoconizerHandler {
    fn name(&self) -> &'static str {
        "Coconizer"
    }

    fn tag(&self) -> &'static str {
        "COCO"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let file_len = reader.length();
        if file_len < PROBE_LEN {
            return Err(ParseError::NotRecognized);
        }

        let mut probe = [0u8; PROBE_LEN];
        reader.read_bytes_into(&mut probe).map_err(|_| ParseError::NotRecognized)?;

        let song_offset = find_coconizer_song(&probe, reader);

        let header_bytes: [u8; 32] = if let Some(off) = song_offset {
            reader.seek(off).map_err(|_| ParseError::NotRecognized)?;
            let mut buf = [0u8; 32];
            reader.read_bytes_into(&mut buf).map_err(|_| ParseError::NotRecognized)?;
            buf
        } else {
            let mut buf = [0u8; 32];
            buf.copy_from_slice(&probe[..32]);
            reader.seek(32)?;
            buf
        };

        let info = header_bytes[0];
        let name_bytes = &header_bytes[1..21];
        let num_instruments = header_bytes[21] as usize;
        let num_orders = header_bytes[22] as usize;
        let num_patterns = header_bytes[23] as usize;
        let orders_offset = u32le(&header_bytes, 24) as usize;
        let patterns_offset = u32le(&header_bytes, 28) as usize;

        let fail = |song_offset: Option<usize>, reason: String| -> ParseError {
            if song_offset.is_some() {
                ParseError::invalid(reason)
            } else {
                ParseError::NotRecognized
            }
        };

        let num_channels = (info & 0x0f) as usize;
        if num_channels != 4 && num_channels != 8 {
            return Err(fail(song_offset, format!("bad channel count {}", num_channels)));
        }
        if !contains_lf(name_bytes) {
            return Err(fail(song_offset, "module name missing 0x0d".to_string()));
        }

        let pattern_bytes = 4 * NUM_ROWS * num_channels;
        let total_patterns_size = num_patterns * pattern_bytes;
        let offsets_fit = orders_offset <= file_len
            && patterns_offset <= file_len
            && num_orders <= file_len
            && total_patterns_size <= file_len
            && orders_offset <= file_len - num_orders
            && patterns_offset <= file_len - total_patterns_size;
        if !offsets_fit {
            return Err(fail(song_offset, "orders/patterns offset out of bounds".to_string()));
        }

        let mut raw_instruments = Vec::with_capacity(num_instruments);
        for i in 0..num_instruments {
            let mut buf = [0u8; 32];
            reader.read_bytes_into(&mut buf).map_err(|_| fail(song_offset, "short instrument read".to_string()))?;
            let raw = RawInstrument {
                sample_offset: u32le(&buf, 0),
                length: u32le(&buf, 4),
                volume: u32le(&buf, 8),
                loop_start: u32le(&buf, 12),
                loop_length: u32le(&buf, 16),
                name: buf[20..31].try_into().unwrap(),
            };

            if raw.length > MAX_SAMPLE_BYTES || raw.loop_start > MAX_SAMPLE_BYTES || raw.loop_length > MAX_SAMPLE_BYTES {
                return Err(fail(song_offset, format!("instrument {} implausible sample size", i)));
            }
            if raw.volume > 0xff {
                return Err(fail(song_offset, format!("instrument {} implausible volume", i)));
            }
            if !contains_lf(&raw.name) {
                return Err(fail(song_offset, format!("instrument {} name missing 0x0d", i)));
            }
            if info & 0x80 != 0 {
                let min_offset = 32 * (num_instruments as u32 + 1);
                let fits = raw.sample_offset >= min_offset
                    && (raw.sample_offset as usize) <= file_len
                    && (raw.length as usize) <= file_len
                    && (raw.sample_offset as usize) <= file_len - raw.length as usize;
                if !fits {
                    return Err(fail(song_offset, format!("instrument {} sample range out of bounds", i)));
                }
            }
            raw_instruments.push(raw);
        }

        let base = song_offset.unwrap_or(0);
        let mut module = Module::new("-", "Coconizer");
        module.display_name = String::from_utf8_lossy(name_bytes)
            .chars()
            .take_while(|&c| c != '\r')
            .collect::<String>()
            .trim()
            .to_string();
        module.channels = num_channels;
        module.num_instruments = num_instruments;
        module.num_patterns = num_patterns;
        if song_offset.is_some() {
            module.usage.set(Feature::CocoArmWrapped);
        }
        module.warn(format!("flags byte 0x{:02x}", info));

        for raw in raw_instruments {
            let mut ins = Instrument::empty(InstrumentKind::Sample);
            ins.display_name = String::from_utf8_lossy(&raw.name)
                .chars()
                .take_while(|&c| c != '\r')
                .collect::<String>()
                .trim()
                .to_string();
            ins.length = raw.length;
            ins.default_volume = (0xff - raw.volume.min(0xff)) as u8;
            ins.loop_start = raw.loop_start;
            ins.loop_end = raw.loop_start + raw.loop_length;
            ins.loop_kind = if raw.loop_length > 0 { LoopKind::Forward } else { LoopKind::None };
            module.instruments.push(ins);
        }

        reader.seek(orders_offset + base)?;
        let mut orders = vec![0u8; num_orders];
        reader.read_bytes_into(&mut orders)?;
        module.num_orders = num_orders;
        module.orders = orders.iter().map(|&o| OrderEntry::Pattern(o as u16)).collect();

        reader.seek(patterns_offset + base)?;
        for i in 0..num_patterns {
            let mut buf = vec![0u8; pattern_bytes];
            if !read_padded(reader, &mut buf) {
                module.usage.set(Feature::TruncatedRecordZeroFilled);
            }
            let mut pattern = Pattern::new(i, NUM_ROWS, num_channels);
            let mut pos = 0usize;
            for row in 0..NUM_ROWS {
                for ch in 0..num_channels {
                    let event = pattern.event_mut(row, ch);
                    event.note = buf[pos + 3];
                    event.instrument = buf[pos + 2];
                    event.effect = buf[pos + 1];
                    event.param = buf[pos];
                    pos += 4;
                }
            }
            module.patterns.push(pattern);
        }

        Ok(ParsedArtifact::Module(module))
    }
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(CoconizerHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_plain(num_channels: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 32];
        buf[0] = num_channels; // info: trackfile bit clear, channel count in low nibble
        let mut name = [0x20u8; 20];
        name[5] = 0x0d;
        buf[1..21].copy_from_slice(&name);
        buf[21] = 0; // num_instruments
        buf[22] = 0; // num_orders
        buf[23] = 0; // num_patterns
        buf[24..28].copy_from_slice(&0u32.to_le_bytes()); // orders_offset
        buf[28..32].copy_from_slice(&0u32.to_le_bytes()); // patterns_offset
        buf.extend_from_slice(&[0u8; 12]); // pad to 44 bytes for the initial probe read
        buf
    }

    #[test]
    fn rejects_too_short_input() {
        let data = [0u8; 16];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(CoconizerHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn rejects_bad_channel_count() {
        let buf = minimal_plain(3);
        let mut reader = ByteReader::new(&buf);
        assert!(matches!(CoconizerHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn accepts_plausible_plain_module() {
        let buf = minimal_plain(4);
        let mut reader = ByteReader::new(&buf);
        let artifact = CoconizerHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => {
                assert_eq!(m.channels, 4);
                assert!(!m.usage.is_set(Feature::CocoArmWrapped));
            }
            _ => panic!("expected Module"),
        }
    }

    #[test]
    fn rejects_name_without_lf() {
        let mut buf = minimal_plain(4);
        buf[1..21].copy_from_slice(&[0x20u8; 20]);
        let mut reader = ByteReader::new(&buf);
        assert!(matches!(CoconizerHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }
}
