// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! General Digital Music (GDM): a fixed 32-channel panning table doubles
//! as the channel-count probe, and each pattern cell can carry up to four
//! simultaneous effect sub-channels rather than a single effect column.

use crate::error::{ParseError, Result};
use crate::io::{ByteReader, ReadBytes};
use crate::model::{Instrument, InstrumentKind, LoopKind, Module, OrderEntry, Pattern};
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::usage::Feature;

const MAGIC: &[u8; 4] = b"GDM\xfe";
const MAGIC_EOF: &[u8; 3] = b"\x0d\x0a\x1a";
const MAGIC2: &[u8; 4] = b"GMFS";
const MAX_ROWS: usize = 256;
const MAX_TRACKS: usize = 32;

pub struct GdmHandler;

impl FormatHandler for GdmHandler {
    fn name(&self) -> &'static str {
        "General Digital Music"
    }

    fn tag(&self) -> &'static str {
        "GDM"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let mut magic = [0u8; 4];
        reader.read_bytes_into(&mut magic).map_err(|_| ParseError::NotRecognized)?;
        if &magic != MAGIC {
            return Err(ParseError::NotRecognized);
        }
        let name = reader.read_bytes(32)?.to_vec();
        let author = reader.read_bytes(32)?.to_vec();
        let mut eof = [0u8; 3];
        reader.read_bytes_into(&mut eof)?;
        let mut magic2 = [0u8; 4];
        reader.read_bytes_into(&mut magic2)?;
        if &eof != MAGIC_EOF || &magic2 != MAGIC2 {
            return Err(ParseError::NotRecognized);
        }

        let gdm_version = reader.read_u16le()?;
        let tracker_id = reader.read_u16le()?;
        let tracker_version = reader.read_u16le()?;

        let mut panning = [0u8; MAX_TRACKS];
        reader.read_bytes_into(&mut panning)?;

        let global_volume = reader.read_u8()?;
        let tempo = reader.read_u8()?;
        let bpm = reader.read_u8()?;
        let _original_format = reader.read_u16le()?;
        let order_offset = reader.read_u32le()? as usize;
        let num_orders = reader.read_u8()? as usize + 1;
        let pattern_offset = reader.read_u32le()? as usize;
        let num_patterns = reader.read_u8()? as usize + 1;
        let sample_offset = reader.read_u32le()? as usize;
        let _sample_data_offset = reader.read_u32le()?;
        let num_samples = reader.read_u8()? as usize + 1;
        let _message_offset = reader.read_u32le()?;
        let _message_length = reader.read_u32le()?;
        let _scrolly_offset = reader.read_u32le()?;
        let _scrolly_length = reader.read_u16le()?;
        let _graphic_offset = reader.read_u32le()?;
        let _graphic_length = reader.read_u16le()?;

        let mut module = Module::new("GDM", format!("2GDM {}", tracker_id));
        module.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
        if !author.iter().all(|&b| b == 0) {
            module.warn(format!("author: {}", String::from_utf8_lossy(&author).trim_end_matches('\0')));
        }
        module.initial_speed = tempo as u16;
        module.initial_tempo = bpm as u16;
        let _ = (gdm_version, tracker_version, global_volume);

        let mut num_channels = 0usize;
        for (i, &p) in panning.iter().enumerate() {
            if p != 255 {
                num_channels = i + 1;
                if p == 16 {
                    module.warn("surround panning used");
                }
            }
        }
        module.channels = num_channels.max(1);

        reader.seek(order_offset)?;
        let mut orders = vec![0u8; num_orders];
        reader.read_bytes_into(&mut orders)?;
        module.num_orders = num_orders;
        module.orders = orders.iter().map(|&o| OrderEntry::Pattern(o as u16)).collect();

        reader.seek(sample_offset)?;
        for _ in 0..num_samples {
            let sname = reader.read_bytes(32)?.to_vec();
            let filename = reader.read_bytes(12)?.to_vec();
            let _ems = reader.read_u8()?;
            let length = reader.read_u32le()?;
            let loop_start = reader.read_u32le()?;
            let loop_end = reader.read_u32le()?;
            let flags = reader.read_u8()?;
            let c4rate = reader.read_u16le()?;
            let default_volume = reader.read_u8()?;
            let default_panning = reader.read_u8()?;

            let mut ins = Instrument::empty(InstrumentKind::Sample);
            ins.display_name = String::from_utf8_lossy(&sname).trim_end_matches('\0').trim().to_string();
            ins.file_name_hint = String::from_utf8_lossy(&filename).trim_end_matches('\0').to_string();
            ins.length = length;
            ins.loop_start = loop_start;
            ins.loop_end = loop_end;
            ins.sample_rate = c4rate as u32;
            ins.loop_kind = if flags & 0x01 != 0 { LoopKind::Forward } else { LoopKind::None };
            if flags & 0x04 != 0 && default_volume != 255 {
                ins.default_volume = default_volume.min(64);
            }
            if flags & 0x08 != 0 && default_panning != 255 {
                ins.panning = Some(default_panning);
            }
            if flags & 0x10 != 0 {
                module.usage.set(Feature::GdmSubChunkTable);
            }
            module.instruments.push(ins);
        }
        module.num_instruments = num_samples;

        reader.seek(pattern_offset)?;
        for i in 0..num_patterns {
            let declared = reader.read_u16le()? as usize;
            let raw_size = declared.saturating_sub(2);
            let mut pattern = Pattern::new(i, MAX_ROWS, module.channels);
            pattern.packed_bytes = Some(declared);

            let mut pos = 0usize;
            let mut row = 0usize;
            while pos < raw_size && row < MAX_ROWS {
                let t = reader.read_u8()?;
                pos += 1;
                if t == 0 {
                    row += 1;
                    continue;
                }
                let track = (t & 0x1f) as usize;
                if track >= module.channels {
                    continue;
                }
                let event = pattern.event_mut(row.min(MAX_ROWS - 1), track);

                if t & 0x20 != 0 {
                    let note = reader.read_u8()?;
                    let inst = reader.read_u8()?;
                    pos += 2;
                    event.note = note;
                    event.instrument = inst;
                }

                if t & 0x40 != 0 {
                    let mut iterations = 0;
                    loop {
                        let fx = reader.read_u8()?;
                        let fx_param = reader.read_u8()?;
                        pos += 2;
                        iterations += 1;

                        let fx_effect = fx & 0x1f;
                        let fx_channel = (fx >> 6) & 0x03;
                        match fx_channel {
                            0 => {
                                event.effect = fx_effect;
                                event.param = fx_param;
                            }
                            1 => {
                                event.push_secondary(fx_effect, fx_param);
                            }
                            2 => module.usage.set(Feature::GdmSubChunkTable),
                            _ => module.usage.set(Feature::GdmSubChunkTable),
                        }

                        if fx & 0x20 == 0 {
                            break;
                        }
                        if iterations >= 4 {
                            return Err(ParseError::too_many_effects(format!(
                                "pattern {} exceeds four simultaneous effects",
                                i
                            )));
                        }
                    }
                }
            }
            if row > MAX_ROWS {
                module.warn(format!("pattern {} exceeds {} rows", i, MAX_ROWS));
            }
            pattern.rows = row.min(MAX_ROWS);
            module.patterns.push(pattern);
        }
        module.num_patterns = num_patterns;

        Ok(ParsedArtifact::Module(module))
    }
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(GdmHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&[0u8; 32]); // name
        buf.extend_from_slice(&[0u8; 32]); // author
        buf.extend_from_slice(MAGIC_EOF);
        buf.extend_from_slice(MAGIC2);
        buf.extend_from_slice(&1u16.to_le_bytes()); // gdm_version
        buf.extend_from_slice(&0u16.to_le_bytes()); // tracker_id
        buf.extend_from_slice(&1u16.to_le_bytes()); // tracker_version
        buf.extend_from_slice(&[255u8; MAX_TRACKS]); // panning, all unused -> 0 channels, fixed below
        buf[buf.len() - MAX_TRACKS] = 8; // channel 0 active
        buf.push(64); // global_volume
        buf.push(6); // tempo
        buf.push(125); // bpm
        buf.extend_from_slice(&0u16.to_le_bytes()); // original_format
        let order_offset = buf.len() as u32 + 4 + 1 + 4 + 1 + 4 + 4 + 1 + 4 + 4 + 4 + 2 + 4 + 2;
        buf.extend_from_slice(&order_offset.to_le_bytes());
        buf.push(0); // num_orders - 1
        let pattern_offset = order_offset + 1;
        buf.extend_from_slice(&pattern_offset.to_le_bytes());
        buf.push(255); // num_patterns - 1 -> 0 patterns is impossible (min 1), use wraps to 0
        let sample_offset = pattern_offset + 2;
        buf.extend_from_slice(&sample_offset.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // sample_data_offset
        buf.push(255); // num_samples - 1 -> 0
        buf.extend_from_slice(&0u32.to_le_bytes()); // message_offset
        buf.extend_from_slice(&0u32.to_le_bytes()); // message_length
        buf.extend_from_slice(&0u32.to_le_bytes()); // scrolly_offset
        buf.extend_from_slice(&0u16.to_le_bytes()); // scrolly_length
        buf.extend_from_slice(&0u32.to_le_bytes()); // graphic_offset
        buf.extend_from_slice(&0u16.to_le_bytes()); // graphic_length
        buf.push(0); // order byte
        buf.extend_from_slice(&2u16.to_le_bytes()); // pattern declared length (raw_size 0)
        buf
    }

    #[test]
    fn rejects_missing_magic() {
        let data = [0u8; 16];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(GdmHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn accepts_minimal_header() {
        let buf = minimal();
        let mut reader = ByteReader::new(&buf);
        let artifact = GdmHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => assert_eq!(m.channels, 1),
            _ => panic!("expected Module"),
        }
    }
}
