// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Composer 669 / UNIS 669: a two-byte magic ("if" or "JN"), a fixed
//! 8-channel/64-row grid, and per-pattern tempo/break bytes stored
//! separately from the event stream in the main header.

use crate::error::{ParseError, Result};
use crate::io::{ByteReader, ReadBytes};
use crate::model::{Instrument, InstrumentKind, Module, Pattern};
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::usage::Feature;

const MAX_SAMPLES: usize = 64;
const MAX_ORDERS: usize = 128;
const MAX_PATTERNS: usize = 128;
const NUM_ROWS: usize = 64;
const NUM_CHANNELS: usize = 8;

pub struct SixSixNineHandler;

impl FormatHandler for SixSixNineHandler {
    fn name(&self) -> &'static str {
        "Composer 669 / UNIS 669"
    }

    fn tag(&self) -> &'static str {
        "669"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let mut magic = [0u8; 2];
        reader.read_bytes_into(&mut magic).map_err(|_| ParseError::NotRecognized)?;
        let is_composer = &magic == b"if";
        let is_unis = &magic == b"JN";
        if !is_composer && !is_unis {
            return Err(ParseError::NotRecognized);
        }

        let message = reader.read_bytes(108)?.to_vec();
        let num_samples = reader.read_u8()? as usize;
        let num_patterns = reader.read_u8()? as usize;
        let repeat_pos = reader.read_u8()?;

        if num_samples > MAX_SAMPLES {
            return Err(ParseError::invalid(format!("sample count {} too high", num_samples)));
        }
        if num_patterns > MAX_PATTERNS {
            return Err(ParseError::invalid(format!("pattern count {} too high", num_patterns)));
        }

        let mut orders = [0u8; MAX_ORDERS];
        reader.read_bytes_into(&mut orders)?;
        let mut pattern_tempos = [0u8; MAX_PATTERNS];
        reader.read_bytes_into(&mut pattern_tempos)?;
        let mut pattern_breaks = [0u8; MAX_PATTERNS];
        reader.read_bytes_into(&mut pattern_breaks)?;

        let mut num_orders = 0;
        while num_orders < MAX_ORDERS && (orders[num_orders] as usize) <= num_patterns {
            num_orders += 1;
        }

        let mut module = Module::new(
            if is_composer { "if" } else { "JN" },
            if is_composer { "Composer 669" } else { "UNIS 669" },
        );
        module.display_name = String::from_utf8_lossy(&message[..20.min(message.len())])
            .trim_end_matches('\0')
            .trim()
            .to_string();
        module.channels = NUM_CHANNELS;
        module.num_instruments = num_samples;
        module.num_patterns = num_patterns;
        module.num_orders = num_orders;
        module.orders = orders[..num_orders]
            .iter()
            .map(|&o| crate::model::OrderEntry::Pattern(o as u16))
            .collect();
        module.warnings.push(format!("repeat position {}", repeat_pos));
        if is_composer {
            module.usage.set(Feature::SixSixNineComposerVariant);
        }

        for _ in 0..num_samples {
            let mut buf = [0u8; 25];
            let got = crate::io::read_padded(reader, &mut buf);
            if !got {
                module.usage.set(Feature::TruncatedRecordZeroFilled);
            }
            let mut ins = Instrument::empty(InstrumentKind::Sample);
            ins.file_name_hint = String::from_utf8_lossy(&buf[0..12]).trim_end_matches('\0').to_string();
            ins.length = u32::from_le_bytes([buf[13], buf[14], buf[15], buf[16]]);
            ins.loop_start = u32::from_le_bytes([buf[17], buf[18], buf[19], buf[20]]);
            ins.loop_end = u32::from_le_bytes([buf[21], buf[22], buf[23], buf[24]]);
            ins.loop_kind = if ins.loop_end > ins.loop_start {
                crate::model::LoopKind::Forward
            } else {
                crate::model::LoopKind::None
            };
            module.instruments.push(ins);
        }

        for i in 0..num_patterns {
            let mut buf = vec![0u8; NUM_ROWS * NUM_CHANNELS * 3];
            crate::io::read_padded(reader, &mut buf);
            let mut pattern = Pattern::new(i, NUM_ROWS, NUM_CHANNELS);
            pattern.packed_bytes = Some(buf.len());
            let mut pos = 0;
            for row in 0..NUM_ROWS {
                for ch in 0..NUM_CHANNELS {
                    let (a, b, c) = (buf[pos], buf[pos + 1], buf[pos + 2]);
                    pos += 3;
                    let event = pattern.event_mut(row, ch);
                    if a >= 0xfe {
                        event.note = a;
                    } else {
                        event.note = a >> 2;
                        event.instrument = ((a & 0x3) << 4) | (b >> 4);
                        event.volume = b & 0xf;
                        event.effect = c;
                    }
                }
            }
            module.warnings.push(format!(
                "pattern {} tempo={} break={}",
                i, pattern_tempos[i], pattern_breaks[i]
            ));
            module.patterns.push(pattern);
        }

        Ok(ParsedArtifact::Module(module))
    }
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(SixSixNineHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"if");
        buf.extend_from_slice(&[0u8; 108]);
        buf.push(0); // num_samples
        buf.push(0); // num_patterns
        buf.push(0); // repeat_pos
        buf.extend_from_slice(&[0xffu8; MAX_ORDERS]);
        buf.extend_from_slice(&[0u8; MAX_PATTERNS]);
        buf.extend_from_slice(&[0u8; MAX_PATTERNS]);
        buf
    }

    #[test]
    fn rejects_unknown_magic() {
        let data = [0u8; 16];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(SixSixNineHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn recognizes_composer_and_unis_magics() {
        let data = minimal();
        let mut reader = ByteReader::new(&data);
        let artifact = SixSixNineHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => assert_eq!(m.channels, NUM_CHANNELS),
            _ => panic!("expected Module"),
        }
    }
}
