// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scream Tracker 2 (STM): no real magic, only a fixed `eof`/`type` byte
//! pair and a printable tracker-id string to sniff on. Must run after the
//! S3M handler and itself rejects any stream carrying `SCRM` at offset 60
//! to avoid misclassifying a Scream Tracker 3 module.

use crate::error::{ParseError, Result};
use crate::io::{read_padded, ByteReader, ReadBytes};
use crate::model::{Instrument, InstrumentKind, LoopKind, Module, OrderEntry, Pattern};
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::usage::Feature;

const MAX_ORDERS: usize = 256;
const MAX_PATTERNS: usize = 64;
const TYPE_SONG: u8 = 1;
const TYPE_MODULE: u8 = 2;

pub struct StmHandler;

impl FormatHandler for StmHandler {
    fn name(&self) -> &'static str {
        "Scream Tracker 2"
    }

    fn tag(&self) -> &'static str {
        "STM"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        if reader.length() < 64 {
            return Err(ParseError::NotRecognized);
        }
        let mut name = [0u8; 20];
        reader.read_bytes_into(&mut name).map_err(|_| ParseError::NotRecognized)?;
        let mut tracker = [0u8; 8];
        reader.read_bytes_into(&mut tracker).map_err(|_| ParseError::NotRecognized)?;
        let eof = reader.read_u8().map_err(|_| ParseError::NotRecognized)?;
        let module_type = reader.read_u8().map_err(|_| ParseError::NotRecognized)?;
        let version_maj = reader.read_u8().map_err(|_| ParseError::NotRecognized)?;
        let version_min = reader.read_u8().map_err(|_| ParseError::NotRecognized)?;

        if eof != 0x1a || (module_type != TYPE_SONG && module_type != TYPE_MODULE) {
            return Err(ParseError::NotRecognized);
        }
        if !tracker.iter().all(|&c| (32..=126).contains(&c)) {
            return Err(ParseError::NotRecognized);
        }

        // libxmp-documented false-positive guard: an S3M carries "SCRM" at
        // offset 60; an STM never does.
        let mut probe = reader.fork_at(60);
        let mut scrm = [0u8; 4];
        if probe.read_bytes_into(&mut scrm).is_ok() && &scrm == b"SCRM" {
            return Err(ParseError::NotRecognized);
        }

        let (num_instruments, mut num_orders, mut num_patterns, tempo, channels, pattern_size, bytes_to_skip, global_volume);
        if version_maj == 1 {
            num_instruments = reader.read_u16le()?;
            num_orders = reader.read_u16le()?;
            num_patterns = reader.read_u16le()?;
            let _unknown = reader.read_u16le()?;
            let raw_tempo = reader.read_u8()?;
            channels = reader.read_u8()?;
            pattern_size = reader.read_u16le()?;
            let _unknown2 = reader.read_u16le()?;
            bytes_to_skip = reader.read_u16le()?;
            tempo = if version_min > 0 { (raw_tempo / 10) & 0x0f } else { raw_tempo & 0x0f };
            global_volume = 0;
            reader.skip(bytes_to_skip as usize)?;
        } else if version_maj >= 2 {
            let raw_tempo = reader.read_u8()?;
            num_patterns = reader.read_u8()? as u16;
            global_volume = reader.read_u8()?;
            num_instruments = 31;
            num_orders = if version_maj == 2 && version_min == 0 { 64 } else { 128 };
            channels = 4;
            pattern_size = 64;
            tempo = if version_min == 2 && version_min < 21 { (raw_tempo / 10) & 0x0f } else { raw_tempo >> 4 };
            let mut _unused = [0u8; 13];
            reader.read_bytes_into(&mut _unused)?;
        } else {
            return Err(ParseError::unsupported_version(format!("STM {}.{}", version_maj, version_min)));
        }

        if num_orders as usize > MAX_ORDERS {
            return Err(ParseError::invalid("order count out of range"));
        }
        if num_patterns as usize > MAX_PATTERNS {
            return Err(ParseError::invalid("pattern count out of range"));
        }

        let mut module = Module::new("", "Scream Tracker 2");
        module.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
        module.channels = channels as usize;
        module.initial_tempo = tempo as u16;
        module.initial_speed = tempo as u16;
        if module_type == TYPE_SONG {
            module.warn("STM song file (not a playable module)");
        }
        let _ = global_volume;

        for _ in 0..num_instruments {
            let mut buf = [0u8; 32];
            read_padded(reader, &mut buf);
            let mut ins = Instrument::empty(InstrumentKind::Sample);
            ins.file_name_hint = String::from_utf8_lossy(&buf[0..13]).trim_end_matches('\0').to_string();
            ins.length = u16::from_le_bytes([buf[16], buf[17]]) as u32;
            ins.loop_start = u16::from_le_bytes([buf[18], buf[19]]) as u32;
            ins.loop_end = u16::from_le_bytes([buf[20], buf[21]]) as u32;
            ins.default_volume = buf[22].min(64);
            ins.sample_rate = u16::from_le_bytes([buf[24], buf[25]]) as u32;
            ins.loop_kind = if ins.loop_end > ins.loop_start { LoopKind::Forward } else { LoopKind::None };
            module.instruments.push(ins);
        }
        module.num_instruments = num_instruments as usize;

        let mut orders = vec![0u8; num_orders as usize];
        read_padded(reader, &mut orders);

        let mut real_orders = 0usize;
        let mut patterns_alloc = num_patterns as usize;
        let mut order_entries = Vec::new();
        for &o in &orders {
            if o >= 99 {
                if o > 99 {
                    module.usage.set(Feature::OrderOutOfRange);
                }
                break;
            }
            if o >= 64 {
                module.usage.set(Feature::OrderOutOfRange);
                order_entries.push(OrderEntry::Invalid(o as u16));
            } else if (o as u16) >= num_patterns {
                order_entries.push(OrderEntry::Skip);
            } else {
                order_entries.push(OrderEntry::Pattern(o as u16));
            }
            patterns_alloc = patterns_alloc.max(o as usize + 1);
            real_orders += 1;
        }
        num_orders = real_orders as u16;
        module.num_orders = real_orders;
        module.orders = order_entries;
        let _ = patterns_alloc;

        for i in 0..num_patterns as usize {
            let mut pattern = Pattern::new(i, pattern_size as usize, channels as usize);
            for row in 0..pattern_size as usize {
                for ch in 0..channels as usize {
                    let a = reader.read_u8()?;
                    let event = pattern.event_mut(row, ch);
                    match a {
                        251 => {}
                        252 => event.note = 254,
                        253 => event.note = 255,
                        _ => {
                            let b = reader.read_u8()?;
                            let c = reader.read_u8()?;
                            let d = reader.read_u8()?;
                            event.note = a;
                            event.instrument = b >> 3;
                            event.volume = (b & 0x07) | ((c & 0xf0) >> 1);
                            event.effect = c & 0x0f;
                            event.param = d;
                        }
                    }
                }
            }
            module.patterns.push(pattern);
        }
        num_patterns = module.patterns.len() as u16;
        module.num_patterns = num_patterns as usize;

        Ok(ParsedArtifact::Module(module))
    }
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(StmHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_v2() -> Vec<u8> {
        let mut buf = vec![0u8; 20];
        buf.extend_from_slice(b"SomeTrk!");
        buf.push(0x1a);
        buf.push(TYPE_MODULE);
        buf.push(2);
        buf.push(0);
        buf.push(120); // tempo
        buf.push(0); // num_patterns
        buf.push(64); // global_volume
        buf.extend_from_slice(&[0u8; 13]); // unused
        buf
    }

    #[test]
    fn rejects_scrm_at_offset_60() {
        let mut buf = minimal_v2();
        while buf.len() < 60 {
            buf.push(0);
        }
        buf.truncate(60);
        buf.extend_from_slice(b"SCRM");
        let mut reader = ByteReader::new(&buf);
        assert!(matches!(StmHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn accepts_plain_v2_header() {
        let buf = minimal_v2();
        let mut reader = ByteReader::new(&buf);
        let artifact = StmHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => assert_eq!(m.channels, 4),
            _ => panic!("expected Module"),
        }
    }
}
