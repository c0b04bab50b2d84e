// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Farandole Composer (FAR): a fixed 16-column pattern grid whose row
//! count is derived from a per-pattern byte length rather than stored
//! directly, and a sparse bitmask selecting which of 64 instrument slots
//! are actually present in the file.

use crate::error::{ParseError, Result};
use crate::io::{ByteReader, ReadBytes};
use crate::model::{Instrument, InstrumentKind, LoopKind, Module, Pattern};
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::usage::Feature;

const MAGIC: &[u8; 4] = b"FAR\xfe";
const MAX_PATTERNS: usize = 256;
const MAX_INSTRUMENTS: usize = 64;
const COLUMNS: usize = 16;

pub struct FarHandler;

impl FormatHandler for FarHandler {
    fn name(&self) -> &'static str {
        "Farandole Composer"
    }

    fn tag(&self) -> &'static str {
        "FAR"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let mut magic = [0u8; 4];
        reader.read_bytes_into(&mut magic).map_err(|_| ParseError::NotRecognized)?;
        if &magic != MAGIC {
            return Err(ParseError::NotRecognized);
        }

        let mut name = [0u8; 40];
        reader.read_bytes_into(&mut name)?;
        let mut eof = [0u8; 3];
        reader.read_bytes_into(&mut eof)?;

        let mut module = Module::new("FAR", "Farandole Composer");
        module.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
        if eof != *b"\x0d\x0a\x1a" {
            module.warn("EOF marker area invalid");
        }

        let _header_length = reader.read_u16le()?;
        let version = reader.read_u8()?;
        if version != 0x10 {
            return Err(ParseError::unsupported_version(format!("FAR version {:#04x}", version)));
        }

        let mut _track_enabled = [0u8; 16];
        reader.read_bytes_into(&mut _track_enabled)?;
        let mut _editor_memory = [0u8; 10];
        reader.read_bytes_into(&mut _editor_memory)?;
        let mut _track_panning = [0u8; 16];
        reader.read_bytes_into(&mut _track_panning)?;
        let mut _editor_memory2 = [0u8; 4];
        reader.read_bytes_into(&mut _editor_memory2)?;

        let text_length = reader.read_u16le()? as usize;
        if text_length > 0 {
            let text = reader.read_bytes(text_length)?.to_vec();
            module.warn(String::from_utf8_lossy(&text).trim_end_matches('\0').to_string());
        }

        let mut orders = [0u8; MAX_PATTERNS];
        reader.read_bytes_into(&mut orders)?;
        let num_patterns_claimed = reader.read_u8()? as usize;
        let num_orders = reader.read_u8()? as usize;
        let loop_to = reader.read_u8()?;
        module.warn(format!("loop-to position {}", loop_to));

        let mut pattern_length = [0u16; MAX_PATTERNS];
        for p in pattern_length.iter_mut() {
            *p = reader.read_u16le()?;
        }

        let mut num_patterns = num_patterns_claimed;
        for (i, &len) in pattern_length.iter().enumerate() {
            if len != 0 && i + 1 > num_patterns {
                num_patterns = i + 1;
            }
        }

        module.num_orders = num_orders;
        module.orders = orders[..num_orders]
            .iter()
            .map(|&o| crate::model::OrderEntry::Pattern(o as u16))
            .collect();

        for i in 0..num_patterns {
            let len = pattern_length[i];
            if len == 0 {
                module.patterns.push(Pattern::new(i, 0, COLUMNS));
                continue;
            }
            let rows = ((len as usize).saturating_sub(2)) >> 6;
            let _break_location = reader.read_u8()?;
            let _tempo = reader.read_u8()?;
            let mut pattern = Pattern::new(i, rows, COLUMNS);
            for row in 0..rows {
                for ch in 0..COLUMNS {
                    let note = reader.read_u8()?;
                    let instrument = reader.read_u8()?;
                    let volume = reader.read_u8()?;
                    let effect = reader.read_u8()?;
                    let event = pattern.event_mut(row, ch);
                    event.note = note;
                    event.instrument = instrument;
                    event.volume = volume;
                    event.effect = effect;
                    if let Some(feature) = effect_feature(effect) {
                        module.usage.set(feature);
                    }
                }
            }
            module.patterns.push(pattern);
        }
        module.num_patterns = num_patterns;

        let mut sample_mask = [0u8; 8];
        reader.read_bytes_into(&mut sample_mask)?;
        let has_instrument = |i: usize| sample_mask[i >> 3] & (1 << (i & 7)) != 0;

        for i in 0..MAX_INSTRUMENTS {
            if !has_instrument(i) {
                continue;
            }
            let mut iname = [0u8; 32];
            reader.read_bytes_into(&mut iname)?;
            let length = reader.read_u32le()?;
            let finetune = reader.read_u8()?;
            let volume = reader.read_u8()?;
            let loop_start = reader.read_u32le()?;
            let loop_end = reader.read_u32le()?;
            let type_flags = reader.read_u8()?;
            let loop_flags = reader.read_u8()?;

            let mut ins = Instrument::empty(InstrumentKind::Sample);
            ins.display_name = String::from_utf8_lossy(&iname).trim_end_matches('\0').trim().to_string();
            ins.length = length;
            ins.finetune = finetune as i8;
            ins.default_volume = volume.min(64);
            ins.loop_start = loop_start;
            ins.loop_end = loop_end;
            ins.loop_kind = if loop_flags & 0x08 != 0 { LoopKind::Forward } else { LoopKind::None };
            let _ = type_flags;
            module.instruments.push(ins);

            reader.skip(length as usize)?;
        }
        module.num_instruments = module.instruments.len();

        Ok(ParsedArtifact::Module(module))
    }
}

fn effect_feature(effect: u8) -> Option<Feature> {
    match effect & 0xf0 {
        0x00 => match effect {
            0x01..=0x05 => Some(Feature::FarBreakTable),
            _ => None,
        },
        0x10..=0xf0 => Some(Feature::FarBreakTable),
        _ => None,
    }
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(FarHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&[0u8; 40]);
        buf.extend_from_slice(b"\x0d\x0a\x1a");
        buf.extend_from_slice(&0u16.to_le_bytes()); // header_length
        buf.push(0x10); // version
        buf.extend_from_slice(&[0u8; 16]); // track_enabled
        buf.extend_from_slice(&[0u8; 10]); // editor_memory
        buf.extend_from_slice(&[0u8; 16]); // track_panning
        buf.extend_from_slice(&[0u8; 4]); // editor_memory2
        buf.extend_from_slice(&0u16.to_le_bytes()); // text_length
        buf.extend_from_slice(&[0u8; MAX_PATTERNS]); // orders
        buf.push(0); // num_patterns claimed
        buf.push(0); // num_orders
        buf.push(0); // loop_to
        buf.extend_from_slice(&[0u8; MAX_PATTERNS * 2]); // pattern_length
        buf.extend_from_slice(&[0u8; 8]); // sample_mask
        buf
    }

    #[test]
    fn rejects_missing_magic() {
        let data = [0u8; 16];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(FarHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn accepts_empty_module() {
        let buf = minimal();
        let mut reader = ByteReader::new(&buf);
        let artifact = FarHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => assert_eq!(m.num_patterns, 0),
            _ => panic!("expected Module"),
        }
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut buf = minimal();
        buf[47] = 0x20;
        let mut reader = ByteReader::new(&buf);
        assert!(matches!(FarHandler.accept_and_parse(&mut reader), Err(ParseError::UnsupportedVersion(_))));
    }
}
