// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Two unrelated formats share the `.amf` extension and are handled here
//! as separate handlers sharing one module: ASYLUM Music Format (a fixed
//! 8-channel/64-row layout with a full 32-byte text magic) and DSMI AMF
//! (a versioned, variable-channel, shared-track format whose layout
//! changes at several version boundaries). Each gets its own
//! `FormatHandler`; [`asylum_handler`] must be registered before
//! [`dsmi_handler`] only because nothing else orders them — their magics
//! never collide.

use crate::error::{ParseError, Result};
use crate::io::{read_padded, ByteReader, ReadBytes};
use crate::model::{Instrument, InstrumentKind, LoopKind, Module, OrderEntry, Pattern};
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::usage::Feature;

const ASYLUM_MAGIC: &[u8; 32] = b"ASYLUM Music Format V1.0\0\0\0\0\0\0\0\0";
const ASYLUM_MAX_INSTRUMENTS: usize = 64;
const ASYLUM_CHANNELS: usize = 8;
const ASYLUM_ROWS: usize = 64;

pub struct AsylumHandler;

impl FormatHandler for AsylumHandler {
    fn name(&self) -> &'static str {
        "ASYLUM Music Format"
    }

    fn tag(&self) -> &'static str {
        "AMF"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let mut magic = [0u8; 32];
        reader.read_bytes_into(&mut magic).map_err(|_| ParseError::NotRecognized)?;
        if &magic != ASYLUM_MAGIC {
            return Err(ParseError::NotRecognized);
        }

        let initial_speed = reader.read_u8()?;
        let initial_tempo = reader.read_u8()?;
        let num_samples = reader.read_u8()? as usize;
        let num_patterns = reader.read_u8()? as usize;
        let num_orders = reader.read_u8()? as usize;
        let restart_byte = reader.read_u8()?;
        let mut orders = [0u8; 256];
        reader.read_bytes_into(&mut orders)?;

        if num_samples > ASYLUM_MAX_INSTRUMENTS {
            return Err(ParseError::too_many_instruments(format!(
                "{} exceeds the 64 ASYLUM instrument slots",
                num_samples
            )));
        }

        let mut module = Module::new("AMF", "ASYLUM Music Format");
        module.channels = ASYLUM_CHANNELS;
        module.initial_speed = initial_speed as u16;
        module.initial_tempo = initial_tempo as u16;
        module.num_orders = num_orders;
        module.orders = orders[..num_orders.min(orders.len())]
            .iter()
            .map(|&o| OrderEntry::Pattern(o as u16))
            .collect();
        module.warn(format!("restart position 0x{:02x}", restart_byte));
        module.usage.set(Feature::AmfAsylumVariant);

        // The on-disk layout always carries 64 instrument records
        // regardless of the declared sample count; only the first
        // `num_samples` are surfaced to the renderer.
        for i in 0..ASYLUM_MAX_INSTRUMENTS {
            let mut buf = [0u8; 37];
            if !read_padded(reader, &mut buf) {
                module.usage.set(Feature::TruncatedRecordZeroFilled);
            }
            if i >= num_samples {
                continue;
            }
            let mut ins = Instrument::empty(InstrumentKind::Sample);
            ins.display_name = String::from_utf8_lossy(&buf[0..22]).trim_end_matches('\0').trim().to_string();
            ins.finetune = buf[22] as i8;
            ins.default_volume = buf[23];
            let length = u32::from_le_bytes([buf[25], buf[26], buf[27], buf[28]]);
            let loop_start = u32::from_le_bytes([buf[29], buf[30], buf[31], buf[32]]);
            let loop_length = u32::from_le_bytes([buf[33], buf[34], buf[35], buf[36]]);
            ins.length = length;
            ins.loop_start = loop_start;
            ins.loop_end = loop_start + loop_length;
            ins.loop_kind = if loop_length > 0 { LoopKind::Forward } else { LoopKind::None };
            module.instruments.push(ins);
        }
        module.num_instruments = module.instruments.len();

        for i in 0..num_patterns {
            let mut buf = vec![0u8; ASYLUM_ROWS * ASYLUM_CHANNELS * 4];
            if !read_padded(reader, &mut buf) {
                module.usage.set(Feature::TruncatedRecordZeroFilled);
            }
            let mut pattern = Pattern::new(i, ASYLUM_ROWS, ASYLUM_CHANNELS);
            let mut pos = 0usize;
            for row in 0..ASYLUM_ROWS {
                for ch in 0..ASYLUM_CHANNELS {
                    let (note, instrument, effect, param) =
                        (buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]);
                    pos += 4;
                    if effect >= 16 {
                        module.usage.set(Feature::AmfAsylumFxOver16);
                    }
                    let event = pattern.event_mut(row, ch);
                    event.note = note;
                    event.instrument = instrument;
                    event.effect = effect;
                    event.param = param;
                }
            }
            module.patterns.push(pattern);
        }
        module.num_patterns = num_patterns;

        Ok(ParsedArtifact::Module(module))
    }
}

pub fn asylum_handler() -> Box<dyn FormatHandler> {
    Box::new(AsylumHandler)
}

const DSMI_MAGIC: &[u8; 3] = b"AMF";
const DSMI_MAX_CHANNELS: usize = 32;
const DSMI_MAX_TRACKS: usize = 256 * DSMI_MAX_CHANNELS;
const DSMI_TRACK_ROWS: usize = 64;

struct DsmiOrder {
    num_rows: usize,
    tracks: Vec<u16>,
}

pub struct DsmiAmfHandler;

impl FormatHandler for DsmiAmfHandler {
    fn name(&self) -> &'static str {
        "DSMI AMF"
    }

    fn tag(&self) -> &'static str {
        "AMF"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let mut magic = [0u8; 3];
        reader.read_bytes_into(&mut magic).map_err(|_| ParseError::NotRecognized)?;
        if &magic != DSMI_MAGIC {
            return Err(ParseError::NotRecognized);
        }

        let version = reader.read_u8()?;
        if version != 0x01 && !(0x08..=0x0E).contains(&version) {
            return Err(ParseError::unsupported_version(format!("AMF version 0x{:02x}", version)));
        }

        let name = reader.read_bytes(32)?.to_vec();
        let num_samples = reader.read_u8()? as usize;
        let num_orders = reader.read_u8()? as usize;
        let num_tracks = reader.read_u16le()? as usize;

        let num_channels = if version >= 0x09 { reader.read_u8()? as usize } else { 4 };
        if num_channels == 0 || num_channels > DSMI_MAX_CHANNELS {
            return Err(ParseError::too_many_channels(format!(
                "{} channels exceeds the DSMI AMF limit of {}",
                num_channels, DSMI_MAX_CHANNELS
            )));
        }
        if num_tracks > DSMI_MAX_TRACKS {
            return Err(ParseError::too_many_blocks(format!(
                "{} tracks exceeds the DSMI AMF limit of {}",
                num_tracks, DSMI_MAX_TRACKS
            )));
        }

        if version >= 0x0B {
            let num_panning = if version >= 0x0C { 32 } else { 16 };
            reader.skip(num_panning)?;
        } else if version >= 0x09 {
            reader.skip(16)?;
        }

        let (initial_tempo, initial_speed) = if version >= 0x0D {
            (reader.read_u8()? as u16, reader.read_u8()? as u16)
        } else {
            (125, 6)
        };

        let mut module = Module::new("AMF", format!("DSMI AMF 0x{:02x}", version));
        module.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
        module.channels = num_channels;
        module.initial_tempo = initial_tempo;
        module.initial_speed = initial_speed;
        module.num_orders = num_orders;

        let mut orders = Vec::with_capacity(num_orders);
        for _ in 0..num_orders {
            let num_rows = if version >= 0x0E { reader.read_u16le()? as usize } else { DSMI_TRACK_ROWS };
            let mut tracks = Vec::with_capacity(num_channels);
            for _ in 0..num_channels {
                tracks.push(reader.read_u16le()?);
            }
            orders.push(DsmiOrder { num_rows, tracks });
        }
        module.orders = (0..num_orders).map(|i| OrderEntry::Pattern(i as u16)).collect();

        for _ in 0..num_samples {
            let sample_type = reader.read_u8()?;
            let sname = reader.read_bytes(32)?.to_vec();
            let filename = reader.read_bytes(13)?.to_vec();
            let _index = reader.read_u32le()?;

            let (length, c4speed, volume, loop_start, loop_end) = if version >= 0x0A {
                (
                    reader.read_u32le()?,
                    reader.read_u16le()?,
                    reader.read_u8()?,
                    reader.read_u32le()?,
                    reader.read_u32le()?,
                )
            } else {
                (
                    reader.read_u16le()? as u32,
                    reader.read_u16le()?,
                    reader.read_u8()?,
                    reader.read_u16le()? as u32,
                    reader.read_u16le()? as u32,
                )
            };

            let mut ins = if sample_type == 0 {
                Instrument::empty(InstrumentKind::Empty)
            } else {
                Instrument::empty(InstrumentKind::Sample)
            };
            ins.display_name = String::from_utf8_lossy(&sname).trim_end_matches('\0').trim().to_string();
            ins.file_name_hint = String::from_utf8_lossy(&filename).trim_end_matches('\0').to_string();
            ins.length = length;
            ins.sample_rate = c4speed as u32;
            ins.default_volume = volume.min(64);
            ins.loop_start = loop_start;
            ins.loop_end = loop_end;
            ins.loop_kind = if loop_end > loop_start { LoopKind::Forward } else { LoopKind::None };
            module.instruments.push(ins);
        }
        module.num_instruments = num_samples;

        let mut track_table = vec![0u16; num_tracks + 1];
        let mut real_num_tracks = 0usize;
        for slot in track_table.iter_mut().skip(1) {
            *slot = reader.read_u16le()?;
            real_num_tracks = real_num_tracks.max(*slot as usize);
        }

        let mut track_events: Vec<Vec<crate::model::Event>> = Vec::with_capacity(real_num_tracks + 1);
        track_events.push(vec![crate::model::Event::empty(); DSMI_TRACK_ROWS]);
        let mut highest_fx_count = 0u8;
        for _ in 1..=real_num_tracks {
            let num_events = reader.read_u16le()? as usize;
            let _unknown = reader.read_u8()?;
            let raw_len = num_events * 3;
            let raw = if raw_len > 0 { reader.read_bytes(raw_len)?.to_vec() } else { Vec::new() };

            let mut events = vec![crate::model::Event::empty(); DSMI_TRACK_ROWS];
            for chunk in raw.chunks_exact(3) {
                let (row, cmd, param) = (chunk[0] as usize, chunk[1], chunk[2]);
                if row >= DSMI_TRACK_ROWS {
                    break;
                }
                let ev = &mut events[row];
                if cmd < 0x80 {
                    ev.note = cmd;
                    ev.volume = param;
                    if cmd == 0x7f {
                        module.usage.set(Feature::AmfNote7f);
                    }
                    if param == 0xff {
                        module.usage.set(Feature::AmfVolumeFf);
                    }
                } else if cmd == 0x80 {
                    ev.instrument = param;
                } else {
                    let fx_count = ev.secondary_len;
                    highest_fx_count = highest_fx_count.max(fx_count + 1);
                    if (fx_count as usize) < ev.secondary.len() / 2 {
                        ev.push_secondary(cmd, param);
                    }
                }
            }
            track_events.push(events);
        }

        if highest_fx_count > 1 {
            module.usage.set(Feature::AmfMultipleEffects);
        }
        if highest_fx_count > 4 {
            module.usage.set(Feature::AmfTooManyEffects);
        }
        if version == 0x01 {
            module.usage.set(Feature::AmfDsmiV1NumEventsAmbiguous);
        }

        for (p, order) in orders.iter().enumerate() {
            let rows = order.num_rows.min(DSMI_TRACK_ROWS);
            let mut pattern = Pattern::new(p, rows, num_channels);
            for (ch, &raw_track) in order.tracks.iter().enumerate() {
                let resolved = if raw_track as usize > num_tracks {
                    module.usage.set(Feature::AmfOutOfBoundsTrack);
                    0
                } else {
                    track_table[raw_track as usize] as usize
                };
                if resolved == 0 {
                    module.usage.set(Feature::AmfBlankTrack);
                    continue;
                }
                let Some(events) = track_events.get(resolved) else {
                    module.usage.set(Feature::AmfOutOfBoundsTrack);
                    continue;
                };
                for row in 0..rows {
                    *pattern.event_mut(row, ch) = events[row];
                }
            }
            module.patterns.push(pattern);
        }
        module.num_patterns = module.patterns.len();

        Ok(ParsedArtifact::Module(module))
    }
}

pub fn dsmi_handler() -> Box<dyn FormatHandler> {
    Box::new(DsmiAmfHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asylum_minimal() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(ASYLUM_MAGIC);
        buf.push(6); // initial_speed
        buf.push(125); // initial_tempo
        buf.push(0); // num_samples
        buf.push(0); // num_patterns
        buf.push(0); // num_orders
        buf.push(0); // restart_byte
        buf.extend_from_slice(&[0u8; 256]); // orders
        buf.extend_from_slice(&[0u8; ASYLUM_MAX_INSTRUMENTS * 37]); // instruments
        buf
    }

    #[test]
    fn asylum_rejects_unrelated_magic() {
        let data = *b"AMF\x0c0000000000000000000000000000";
        let mut reader = ByteReader::new(&data);
        assert!(matches!(AsylumHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn asylum_accepts_minimal_module() {
        let buf = asylum_minimal();
        let mut reader = ByteReader::new(&buf);
        let artifact = AsylumHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => {
                assert_eq!(m.channels, ASYLUM_CHANNELS);
                assert!(m.usage.is_set(Feature::AmfAsylumVariant));
            }
            _ => panic!("expected Module"),
        }
    }

    fn dsmi_minimal(version: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(DSMI_MAGIC);
        buf.push(version);
        buf.extend_from_slice(&[0u8; 32]); // name
        buf.push(0); // num_samples
        buf.push(0); // num_orders
        buf.extend_from_slice(&0u16.to_le_bytes()); // num_tracks
        if version >= 0x09 {
            buf.push(4); // num_channels
        }
        buf
    }

    #[test]
    fn dsmi_rejects_unknown_magic() {
        let data = [0u8; 16];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(DsmiAmfHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn dsmi_rejects_unsupported_version() {
        let buf = dsmi_minimal(0x02);
        let mut reader = ByteReader::new(&buf);
        assert!(matches!(
            DsmiAmfHandler.accept_and_parse(&mut reader),
            Err(ParseError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn dsmi_accepts_old_format_with_default_tempo() {
        let buf = dsmi_minimal(0x08);
        let mut reader = ByteReader::new(&buf);
        let artifact = DsmiAmfHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => {
                assert_eq!(m.initial_tempo, 125);
                assert_eq!(m.initial_speed, 6);
                assert_eq!(m.channels, 4);
            }
            _ => panic!("expected Module"),
        }
    }

    #[test]
    fn dsmi_flags_v1_ambiguous_num_events() {
        let buf = dsmi_minimal(0x01);
        let mut reader = ByteReader::new(&buf);
        let artifact = DsmiAmfHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => {
                assert!(m.usage.is_set(Feature::AmfDsmiV1NumEventsAmbiguous));
            }
            _ => panic!("expected Module"),
        }
    }
}
