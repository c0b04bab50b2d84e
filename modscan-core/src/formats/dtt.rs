// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! DigiTrakker (DTT/DTM): pattern and sample bodies can be stored
//! compressed, flagged by the high bit of their directory offset (the
//! real offset is the two's-complement negation). This core does not
//! implement DigiTrakker's pattern-compression codec — compressed bodies
//! are recorded as [`Feature::DttNestedChunk`] and skipped rather than
//! decoded, matching how an unimplemented depacker is handled upstream.

use crate::error::{ParseError, Result};
use crate::io::{ByteReader, ReadBytes};
use crate::model::{Instrument, InstrumentKind, Module, OrderEntry, Pattern};
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::usage::Feature;

const MAGIC_UNCOMPRESSED: &[u8; 4] = b"DskT";
const MAGIC_COMPRESSED: &[u8; 4] = b"EskT";
const MAX_CHANNELS: usize = 16;
const MAX_PATTERNS: usize = 256;
const MAX_SAMPLES: usize = 63;
const MAX_ORDERS: usize = 65536;

pub struct DttHandler;

impl FormatHandler for DttHandler {
    fn name(&self) -> &'static str {
        "Desktop Tracker"
    }

    fn tag(&self) -> &'static str {
        "DTT"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let mut magic = [0u8; 4];
        reader.read_bytes_into(&mut magic).map_err(|_| ParseError::NotRecognized)?;
        let song_compressed = if &magic == MAGIC_COMPRESSED {
            true
        } else if &magic == MAGIC_UNCOMPRESSED {
            false
        } else {
            return Err(ParseError::NotRecognized);
        };

        let name = reader.read_bytes(64)?.to_vec();
        let author = reader.read_bytes(64)?.to_vec();
        let _flags = reader.read_u32le()?;
        let num_channels = reader.read_u32le()? as usize;
        let num_orders = reader.read_u32le()? as usize;
        let mut panning = [0u8; 8];
        reader.read_bytes_into(&mut panning)?;
        let initial_speed = reader.read_u32le()?;
        let restart_pos = reader.read_u32le()?;
        let num_patterns = reader.read_u32le()? as usize;
        let num_samples = reader.read_u32le()? as usize;

        if num_channels > MAX_CHANNELS {
            return Err(ParseError::too_many_channels(format!("{} > {}", num_channels, MAX_CHANNELS)));
        }
        if num_patterns > MAX_PATTERNS {
            return Err(ParseError::too_many_blocks(format!("{} patterns > {}", num_patterns, MAX_PATTERNS)));
        }
        if num_samples > MAX_SAMPLES {
            return Err(ParseError::too_many_instruments(format!("{} > {}", num_samples, MAX_SAMPLES)));
        }
        if num_orders > MAX_ORDERS {
            return Err(ParseError::invalid(format!("{} orders exceeds sane bound {}", num_orders, MAX_ORDERS)));
        }

        let mut module = Module::new("DTT", "Desktop Tracker");
        module.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
        if !author.iter().all(|&b| b == 0) {
            module.warn(format!("author: {}", String::from_utf8_lossy(&author).trim_end_matches('\0')));
        }
        module.channels = num_channels.max(1);
        module.initial_speed = (initial_speed & 0xff) as u16;
        let _ = restart_pos;
        if song_compressed {
            module.usage.set(Feature::DttNestedChunk);
        }

        let orders = reader.read_bytes(num_orders)?.to_vec();
        if num_orders % 4 != 0 {
            reader.skip(4 - (num_orders % 4))?;
        }
        module.num_orders = num_orders;
        module.orders = orders.iter().map(|&o| OrderEntry::Pattern(o as u16)).collect();

        let mut pattern_offsets = Vec::with_capacity(num_patterns);
        for _ in 0..num_patterns {
            pattern_offsets.push(reader.read_u32le()?);
        }
        let mut pattern_rows = Vec::with_capacity(num_patterns);
        for _ in 0..num_patterns {
            pattern_rows.push(reader.read_u8()? as usize);
        }
        if num_patterns % 4 != 0 {
            reader.skip(4 - (num_patterns % 4))?;
        }

        for i in 0..num_samples {
            let rec = reader.read_bytes(64)?.to_vec();
            let sname = rec[28..60].to_vec();
            let length = u32::from_le_bytes([rec[24], rec[25], rec[26], rec[27]]);
            let loop_start = u32::from_le_bytes([rec[16], rec[17], rec[18], rec[19]]);
            let loop_length = u32::from_le_bytes([rec[20], rec[21], rec[22], rec[23]]);
            let offset = u32::from_le_bytes([rec[60], rec[61], rec[62], rec[63]]);
            let volume = rec[1];

            let mut ins = Instrument::empty(InstrumentKind::Sample);
            ins.display_name = String::from_utf8_lossy(&sname).trim_end_matches('\0').trim().to_string();
            ins.length = length;
            ins.loop_start = loop_start;
            ins.loop_end = loop_start.saturating_add(loop_length);
            ins.default_volume = volume.min(64);
            if is_compressed_offset(offset) {
                module.usage.set(Feature::DttNestedChunk);
            }
            let _ = i;
            module.instruments.push(ins);
        }
        module.num_instruments = num_samples;

        for (i, &offset) in pattern_offsets.iter().enumerate() {
            let rows = pattern_rows[i];
            let mut pattern = Pattern::new(i, rows.max(1), module.channels);

            if is_compressed_offset(offset) {
                module.usage.set(Feature::DttNestedChunk);
                module.patterns.push(pattern);
                continue;
            }

            if (offset as usize) > reader.length() {
                module.warn(format!("pattern {} offset out of range", i));
                module.patterns.push(pattern);
                continue;
            }
            reader.seek(offset as usize)?;

            for row in 0..rows {
                for ch in 0..module.channels {
                    let a = reader.read_u32le()?;
                    let multi = (a & 0x00fe_0000) != 0;
                    let event = pattern.event_mut(row, ch);
                    if multi {
                        let b = reader.read_u32le()?;
                        event.instrument = (a & 0x0000_001f) as u8;
                        event.note = ((a & 0x0000_0fc0) >> 6) as u8;
                        event.effect = ((a & 0x0001_f000) >> 12) as u8;
                        event.secondary[0] = ((a & 0x003e_0000) >> 17) as u8;
                        event.secondary[1] = ((a & 0x07c0_0000) >> 22) as u8;
                        event.secondary[2] = ((a & 0xf100_0000) >> 27) as u8;
                        event.secondary_len = 3;
                        event.volume = (b & 0xff) as u8;
                    } else {
                        event.instrument = (a & 0x0000_002f) as u8;
                        event.note = ((a & 0x0000_0fc0) >> 6) as u8;
                        event.effect = ((a & 0x0001_f000) >> 12) as u8;
                    }
                }
            }
            module.patterns.push(pattern);
        }
        module.num_patterns = num_patterns;

        Ok(ParsedArtifact::Module(module))
    }
}

fn is_compressed_offset(offset: u32) -> bool {
    offset & 0x8000_0000 != 0
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(DttHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC_UNCOMPRESSED);
        buf.extend_from_slice(&[0u8; 64]); // name
        buf.extend_from_slice(&[0u8; 64]); // author
        buf.extend_from_slice(&0u32.to_le_bytes()); // flags
        buf.extend_from_slice(&1u32.to_le_bytes()); // num_channels
        buf.extend_from_slice(&0u32.to_le_bytes()); // num_orders
        buf.extend_from_slice(&[0u8; 8]); // panning
        buf.extend_from_slice(&6u32.to_le_bytes()); // initial_speed
        buf.extend_from_slice(&0u32.to_le_bytes()); // restart_pos
        buf.extend_from_slice(&0u32.to_le_bytes()); // num_patterns
        buf.extend_from_slice(&0u32.to_le_bytes()); // num_samples
        buf
    }

    #[test]
    fn rejects_missing_magic() {
        let data = [0u8; 16];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(DttHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn accepts_eskt_variant() {
        let mut buf = minimal();
        buf[0..4].copy_from_slice(MAGIC_COMPRESSED);
        let mut reader = ByteReader::new(&buf);
        let artifact = DttHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => assert!(m.usage.is_set(Feature::DttNestedChunk)),
            _ => panic!("expected Module"),
        }
    }

    #[test]
    fn rejects_oversized_channel_count() {
        let mut buf = minimal();
        buf[68..72].copy_from_slice(&17u32.to_le_bytes());
        let mut reader = ByteReader::new(&buf);
        assert!(matches!(
            DttHandler.accept_and_parse(&mut reader),
            Err(ParseError::TooManyChannels(_))
        ));
    }
}
