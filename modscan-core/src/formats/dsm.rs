// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! DSIK Digital Sound Interface Kit (DSM): an IFF chunk stream wrapped
//! either in a RIFF container or carried bare, with `SONG`/`INST`/`PATT`
//! chunks. The old 1.0 `DSM\x10` header is a distinct, unsupported layout.

use crate::error::{ParseError, Result};
use crate::io::{ByteReader, ReadBytes};
use crate::model::{Event, Instrument, InstrumentKind, LoopKind, Module, OrderEntry, Pattern};
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::usage::Feature;

const MAX_ORDERS: usize = 128;
const MAX_SAMPLES: usize = 256;
const MAX_PATTERNS: usize = 256;
const MAX_CHANNELS: usize = 16;
const CHUNK_SIZE_WARN: u32 = 4 * 1024 * 1024;

pub struct DsmHandler;

impl FormatHandler for DsmHandler {
    fn name(&self) -> &'static str {
        "DSIK Digital Sound Interface Kit"
    }

    fn tag(&self) -> &'static str {
        "DSM"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let mut head = [0u8; 4];
        reader.read_bytes_into(&mut head).map_err(|_| ParseError::NotRecognized)?;

        if &head == b"RIFF" {
            let _riff_size = reader.read_u32le()?;
            let mut sig = [0u8; 4];
            reader.read_bytes_into(&mut sig)?;
            if &sig != b"DSMF" {
                return Err(ParseError::NotRecognized);
            }
        } else if &head == b"DSMF" {
            let mut _extra = [0u8; 4];
            reader.read_bytes_into(&mut _extra)?;
        } else if head == *b"DSM\x10" {
            return Err(ParseError::unsupported_version("DSM 1.0 header layout"));
        } else {
            return Err(ParseError::NotRecognized);
        }

        let mut module = Module::new("DSMF", "DSIK Digital Sound Interface Kit");
        let mut channels_seen = 0usize;

        while reader.position() + 8 <= reader.length() {
            let mut chunk_id = [0u8; 4];
            reader.read_bytes_into(&mut chunk_id)?;
            let chunk_len = reader.read_u32le()?;
            let chunk_start = reader.position();

            if chunk_len > CHUNK_SIZE_WARN {
                module.warn(format!(
                    "chunk {} exceeds 4 MiB ({} bytes)",
                    String::from_utf8_lossy(&chunk_id),
                    chunk_len
                ));
            }

            let body = reader.read_bytes(chunk_len as usize)?;
            match &chunk_id {
                b"SONG" => parse_song(body, &mut module, &mut channels_seen)?,
                b"INST" => parse_inst(body, &mut module)?,
                b"PATT" => parse_patt(body, channels_seen.max(1), &mut module)?,
                _ => {
                    module.usage.set(Feature::DsmChunkSkipped);
                }
            }

            reader.seek(chunk_start + chunk_len as usize)?;
        }

        Ok(ParsedArtifact::Module(module))
    }
}

fn parse_song(body: &[u8], module: &mut Module, channels_seen: &mut usize) -> Result<()> {
    if body.len() < 192 {
        return Err(ParseError::invalid("SONG chunk too short"));
    }
    let mut r = ByteReader::new(body);
    let name = r.read_bytes(28)?.to_vec();
    let _format_version = r.read_u16le()?;
    let _flags = r.read_u16le()?;
    let _unused = r.read_u32le()?;
    let num_orders = r.read_u16le()? as usize;
    let num_samples = r.read_u16le()? as usize;
    let num_patterns = r.read_u16le()? as usize;
    let num_channels = r.read_u16le()? as usize;

    if num_orders > MAX_ORDERS || num_samples > MAX_SAMPLES || num_patterns > MAX_PATTERNS || num_channels > MAX_CHANNELS {
        return Err(ParseError::invalid("SONG chunk counts out of range"));
    }

    let global_volume = r.read_u8()?;
    let _master_volume = r.read_u8()?;
    let initial_speed = r.read_u8()?;
    let initial_tempo = r.read_u8()?;
    let mut channel_map = [0u8; 16];
    r.read_bytes_into(&mut channel_map)?;
    let mut orders = [0u8; MAX_ORDERS];
    r.read_bytes_into(&mut orders[..128.min(MAX_ORDERS)])?;

    module.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
    module.channels = num_channels;
    module.num_orders = num_orders;
    module.num_patterns = num_patterns;
    module.num_instruments = num_samples;
    module.initial_speed = initial_speed as u16;
    module.initial_tempo = initial_tempo as u16;
    module.orders = orders[..num_orders]
        .iter()
        .map(|&o| OrderEntry::Pattern(o as u16))
        .collect();
    let _ = global_volume;
    *channels_seen = num_channels;
    Ok(())
}

fn parse_inst(body: &[u8], module: &mut Module) -> Result<()> {
    if body.len() < 64 {
        module.usage.set(Feature::DsmChunkSkipped);
        return Ok(());
    }
    let mut r = ByteReader::new(body);
    let filename = r.read_bytes(13)?.to_vec();
    let flags = r.read_u16le()?;
    let default_volume = r.read_u8()?;
    let length = r.read_u32le()?;
    let loop_start = r.read_u32le()?;
    let loop_end = r.read_u32le()?;
    let _ignore = r.read_u32le()?;
    let c4rate = r.read_u16le()?;
    let _period = r.read_u16le()?;
    let name = r.read_bytes(28)?.to_vec();

    let mut ins = Instrument::empty(InstrumentKind::Sample);
    ins.file_name_hint = String::from_utf8_lossy(&filename).trim_end_matches('\0').to_string();
    ins.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
    ins.length = length;
    ins.loop_start = loop_start;
    ins.loop_end = loop_end;
    ins.default_volume = default_volume.min(64);
    ins.sample_rate = c4rate as u32;
    ins.loop_kind = if flags & 0x0001 != 0 { LoopKind::Forward } else { LoopKind::None };
    module.instruments.push(ins);
    Ok(())
}

fn parse_patt(body: &[u8], num_channels: usize, module: &mut Module) -> Result<()> {
    if body.len() < 2 {
        module.usage.set(Feature::DsmChunkSkipped);
        return Ok(());
    }
    let declared = u16::from_le_bytes([body[0], body[1]]) as usize;
    let stream = &body[2..2 + declared.min(body.len().saturating_sub(2))];

    let mut rows: Vec<Vec<Event>> = vec![vec![Event::default(); num_channels.max(1)]];
    let mut pos = 0usize;
    while pos < stream.len() {
        let flag = stream[pos];
        pos += 1;
        if flag == 0 {
            rows.push(vec![Event::default(); num_channels.max(1)]);
            continue;
        }
        let channel = (flag & 0x0f) as usize;
        let current = rows.last_mut().unwrap();
        let ev_index = channel.min(current.len().saturating_sub(1));
        if flag & 0x80 != 0 {
            if pos >= stream.len() {
                break;
            }
            current[ev_index].note = stream[pos];
            pos += 1;
        }
        if flag & 0x40 != 0 {
            if pos >= stream.len() {
                break;
            }
            current[ev_index].instrument = stream[pos];
            pos += 1;
        }
        if flag & 0x20 != 0 {
            if pos >= stream.len() {
                break;
            }
            current[ev_index].volume = stream[pos];
            pos += 1;
        }
        if flag & 0x10 != 0 {
            if pos + 1 >= stream.len() {
                break;
            }
            current[ev_index].effect = stream[pos];
            current[ev_index].param = stream[pos + 1];
            pos += 2;
        }
    }

    if rows.last().map(|r| r.iter().all(|e| *e == Event::default())).unwrap_or(false) && rows.len() > 1 {
        rows.pop();
    }

    if rows.len() > 128 {
        module.warn(format!("pattern has {} rows (beyond 128)", rows.len()));
    } else if rows.len() > 64 {
        module.warn(format!("pattern has {} rows (beyond 64)", rows.len()));
    }

    let idx = module.patterns.len();
    let mut pattern = Pattern::new(idx, rows.len(), num_channels.max(1));
    for (row_idx, row) in rows.into_iter().enumerate() {
        for (ch, ev) in row.into_iter().enumerate() {
            *pattern.event_mut(row_idx, ch) = ev;
        }
    }
    module.patterns.push(pattern);
    Ok(())
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(DsmHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song_chunk() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0u8; 28]); // name
        body.extend_from_slice(&1u16.to_le_bytes()); // format_version
        body.extend_from_slice(&0u16.to_le_bytes()); // flags
        body.extend_from_slice(&0u32.to_le_bytes()); // unused
        body.extend_from_slice(&1u16.to_le_bytes()); // num_orders
        body.extend_from_slice(&0u16.to_le_bytes()); // num_samples
        body.extend_from_slice(&0u16.to_le_bytes()); // num_patterns
        body.extend_from_slice(&4u16.to_le_bytes()); // num_channels
        body.push(64); // global_volume
        body.push(64); // master_volume
        body.push(6); // initial_speed
        body.push(125); // initial_tempo
        body.extend_from_slice(&[0u8; 16]); // channel_map
        body.extend_from_slice(&[0u8; 128]); // orders
        body
    }

    fn wrap(id: &[u8; 4], body: Vec<u8>) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(id);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn rejects_unknown_magic() {
        let data = [0u8; 16];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(DsmHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn rejects_old_1_0_header() {
        let mut data = b"DSM\x10".to_vec();
        data.extend_from_slice(&[0u8; 16]);
        let mut reader = ByteReader::new(&data);
        assert!(matches!(DsmHandler.accept_and_parse(&mut reader), Err(ParseError::UnsupportedVersion(_))));
    }

    #[test]
    fn parses_bare_dsmf_with_song_chunk() {
        let mut data = b"DSMF".to_vec();
        data.extend_from_slice(&[0u8; 4]);
        data.extend_from_slice(&wrap(b"SONG", song_chunk()));
        let mut reader = ByteReader::new(&data);
        let artifact = DsmHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => assert_eq!(m.channels, 4),
            _ => panic!("expected Module"),
        }
    }
}
