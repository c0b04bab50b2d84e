// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! MultiTracker (MTM): patterns do not own their rows directly. Each
//! pattern is a table of 16-bit indices into a shared pool of tracks, so
//! the same 64-row track can legitimately back several channels across
//! several patterns at once.

use crate::error::{ParseError, Result};
use crate::io::{ByteReader, ReadBytes};
use crate::model::{Instrument, InstrumentKind, LoopKind, Module, OrderEntry, Pattern};
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::usage::Feature;

const MAGIC: &[u8; 3] = b"MTM";
const MAX_CHANNELS: usize = 32;
const MAX_ORDERS: usize = 128;
const TRACK_ROWS: usize = 64;

pub struct MtmHandler;

impl FormatHandler for MtmHandler {
    fn name(&self) -> &'static str {
        "MultiTracker"
    }

    fn tag(&self) -> &'static str {
        "MTM"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let mut magic = [0u8; 3];
        reader.read_bytes_into(&mut magic).map_err(|_| ParseError::NotRecognized)?;
        if &magic != MAGIC {
            return Err(ParseError::NotRecognized);
        }
        let version = reader.read_u8()?;

        let name = reader.read_bytes(20)?.to_vec();
        let num_tracks = reader.read_u16le()? as usize;
        let last_pattern = reader.read_u8()? as usize;
        let last_order = reader.read_u8()? as usize;
        let _comment_length = reader.read_u16le()?;
        let num_samples = reader.read_u8()? as usize;
        let attribute = reader.read_u8()?;
        let num_rows = reader.read_u8()? as usize;
        let num_channels_raw = reader.read_u8()? as usize;
        let mut panning = [0u8; MAX_CHANNELS];
        reader.read_bytes_into(&mut panning)?;

        if num_channels_raw == 0 || num_channels_raw > MAX_CHANNELS {
            return Err(ParseError::too_many_channels(format!(
                "{} channels exceeds the 32-track panning table",
                num_channels_raw
            )));
        }

        let mut module = Module::new("MTM", format!("MultiTracker 0x{:02x}", version));
        module.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
        module.channels = num_channels_raw;
        let _ = attribute;
        if num_rows != TRACK_ROWS {
            module.warn(format!("track rows {} differs from the usual {}", num_rows, TRACK_ROWS));
        }

        for i in 0..num_samples {
            let sname = reader.read_bytes(22)?.to_vec();
            let length = reader.read_u32le()?;
            let loop_start = reader.read_u32le()?;
            let loop_end = reader.read_u32le()?;
            let finetune = reader.read_i8()?;
            let default_volume = reader.read_u8()?;
            let ins_attribute = reader.read_u8()?;

            let mut ins = Instrument::empty(InstrumentKind::Sample);
            ins.display_name = String::from_utf8_lossy(&sname).trim_end_matches('\0').trim().to_string();
            ins.length = length;
            ins.loop_start = loop_start;
            ins.loop_end = loop_end;
            ins.finetune = finetune;
            ins.default_volume = default_volume.min(64);
            ins.loop_kind = if loop_end > loop_start { LoopKind::Forward } else { LoopKind::None };
            if ins_attribute & 0x01 != 0 {
                module.usage.set(Feature::GdmSubChunkTable);
            }
            if i >= 255 {
                return Err(ParseError::too_many_instruments("more than 255 MTM samples"));
            }
            module.instruments.push(ins);
        }
        module.num_instruments = num_samples;

        let mut orders_raw = [0u8; MAX_ORDERS];
        reader.read_bytes_into(&mut orders_raw)?;
        let num_orders = (last_order + 1).min(MAX_ORDERS);
        module.num_orders = num_orders;
        module.orders = orders_raw[..num_orders]
            .iter()
            .map(|&o| OrderEntry::Pattern(o as u16))
            .collect();

        if num_tracks == 0 {
            return Err(ParseError::invalid("no tracks stored"));
        }

        let mut tracks = Vec::with_capacity(num_tracks + 1);
        tracks.push(Vec::new()); // track index 0 is always silent/unused
        for _ in 0..num_tracks {
            let raw = reader.read_bytes(TRACK_ROWS * 3)?;
            tracks.push(raw.to_vec());
        }

        let mut track_use_count = vec![0u32; num_tracks + 1];
        let num_patterns = last_pattern + 1;
        for p in 0..num_patterns {
            let mut indices = [0u16; MAX_CHANNELS];
            for slot in indices.iter_mut() {
                *slot = reader.read_u16le()?;
            }

            let mut pattern = Pattern::new(p, TRACK_ROWS, module.channels);
            for ch in 0..module.channels {
                let idx = indices[ch] as usize;
                if idx >= tracks.len() {
                    return Err(ParseError::invalid(format!(
                        "pattern {} channel {} references track {} beyond the {} stored",
                        p, ch, idx, num_tracks
                    )));
                }
                track_use_count[idx] += 1;
                if idx == 0 {
                    continue;
                }
                let track = &tracks[idx];
                for row in 0..TRACK_ROWS {
                    let a = track[row * 3];
                    let b = track[row * 3 + 1];
                    let c = track[row * 3 + 2];
                    let note = a >> 2;
                    if note == 0 && b == 0 && c == 0 {
                        continue;
                    }
                    let event = pattern.event_mut(row, ch);
                    event.note = note;
                    event.instrument = ((a & 0x03) << 4) | (b >> 4);
                    event.effect = b & 0x0f;
                    event.param = c;
                }
            }
            module.patterns.push(pattern);
        }
        module.num_patterns = num_patterns;

        if track_use_count.iter().filter(|&&c| c > 1).count() > 0 {
            module.usage.set(Feature::MtmSharedTrack);
        }

        Ok(ParsedArtifact::Module(module))
    }
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(MtmHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.push(0x10); // version
        buf.extend_from_slice(&[0u8; 20]); // name
        buf.extend_from_slice(&1u16.to_le_bytes()); // num_tracks
        buf.push(0); // last_pattern
        buf.push(0); // last_order
        buf.extend_from_slice(&0u16.to_le_bytes()); // comment_length
        buf.push(0); // num_samples
        buf.push(0); // attribute
        buf.push(64); // num_rows
        buf.push(1); // num_channels
        buf.extend_from_slice(&[0u8; MAX_CHANNELS]); // panning
        buf.extend_from_slice(&[0u8; TRACK_ROWS * 3]); // track 1, all silent
        buf.extend_from_slice(&[0u8; MAX_ORDERS]); // orders
        let mut indices = [0u16; MAX_CHANNELS];
        indices[0] = 1;
        for idx in indices {
            buf.extend_from_slice(&idx.to_le_bytes());
        }
        buf
    }

    #[test]
    fn rejects_missing_magic() {
        let data = [0u8; 16];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(MtmHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn accepts_minimal_module() {
        let buf = minimal();
        let mut reader = ByteReader::new(&buf);
        let artifact = MtmHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => {
                assert_eq!(m.channels, 1);
                assert_eq!(m.num_patterns, 1);
                assert_eq!(m.patterns[0].rows, TRACK_ROWS);
            }
            _ => panic!("expected Module"),
        }
    }

    #[test]
    fn flags_shared_track_reuse() {
        // Two channels in one pattern both pointing at track 1.
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.push(0x10);
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.push(0);
        buf.push(0);
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.push(0);
        buf.push(0);
        buf.push(64);
        buf.push(2); // num_channels
        buf.extend_from_slice(&[0u8; MAX_CHANNELS]);
        buf.extend_from_slice(&[0u8; TRACK_ROWS * 3]);
        buf.extend_from_slice(&[0u8; MAX_ORDERS]);
        let mut indices = [0u16; MAX_CHANNELS];
        indices[0] = 1;
        indices[1] = 1;
        for idx in indices {
            buf.extend_from_slice(&idx.to_le_bytes());
        }

        let mut reader = ByteReader::new(&buf);
        let artifact = MtmHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => assert!(m.usage.is_set(Feature::MtmSharedTrack)),
            _ => panic!("expected Module"),
        }
    }
}
