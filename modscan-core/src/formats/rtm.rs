// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Real Tracker 2 (RTM): every section — the main header, each pattern,
//! each instrument, each sample — is framed by the same 42-byte object
//! header (a 4-byte tag, a name, a version, and a declared body size),
//! so sections can be skipped even when this crate doesn't care about
//! their contents.

use crate::error::{ParseError, Result};
use crate::io::{ByteReader, ReadBytes};
use crate::model::{Envelope, Instrument, InstrumentKind, LoopKind, Module, OrderEntry};
use crate::pattern::PatternBuilder;
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::usage::Feature;

const MAX_CHANNELS: usize = 32;
const MAX_ROWS: usize = 999;
const OBJECT_HEADER_SIZE: usize = 42;

const LINEAR_TABLE: u16 = 1 << 0;
const TRACK_NAMES_PRESENT: u16 = 1 << 1;

struct ObjectHeader {
    id: [u8; 4],
    name: String,
    version: u16,
    header_size: u16,
}

fn read_object_header(reader: &mut ByteReader<'_>, expected_id: &[u8; 4], minimum_size: u16) -> Result<ObjectHeader> {
    let mut id = [0u8; 4];
    reader.read_bytes_into(&mut id).map_err(|_| ParseError::NotRecognized)?;
    let _rc = reader.read_u8()?;
    let name = reader.read_bytes(32)?.to_vec();
    let _eof = reader.read_u8()?;
    let version = reader.read_u16le()?;
    let header_size = reader.read_u16le()?;

    if &id != expected_id {
        return Err(ParseError::NotRecognized);
    }
    if header_size < minimum_size {
        return Err(ParseError::unsupported_version(format!(
            "{} object declares a header_size of {}, below the minimum {}",
            String::from_utf8_lossy(expected_id),
            header_size,
            minimum_size
        )));
    }

    Ok(ObjectHeader {
        id,
        name: String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string(),
        version,
        header_size,
    })
}

/// Reads up to `fixed_size` bytes of a section body into a zero-padded
/// buffer, matching each sub-loader's tolerance for a short declared
/// `header_size`. Bytes declared beyond `fixed_size` are left unconsumed,
/// mirroring this format's own loaders (only the top-level header skips
/// its excess explicitly).
fn read_body(reader: &mut ByteReader<'_>, header_size: u16, fixed_size: usize) -> Result<Vec<u8>> {
    let want = (header_size as usize).min(fixed_size);
    let mut buf = vec![0u8; fixed_size];
    if want > 0 {
        let got = reader.read_bytes(want)?;
        buf[..want].copy_from_slice(got);
    }
    Ok(buf)
}

pub struct RtmHandler;

impl FormatHandler for RtmHandler {
    fn name(&self) -> &'static str {
        "Real Tracker 2"
    }

    fn tag(&self) -> &'static str {
        "RTM"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let obj = read_object_header(reader, b"RTMM", 98)?;

        let body = read_body(reader, obj.header_size, 130)?;
        let tracker = String::from_utf8_lossy(&body[0..20]).trim_end_matches('\0').trim().to_string();
        let author = String::from_utf8_lossy(&body[20..52]).trim_end_matches('\0').trim().to_string();
        let flags = u16::from_le_bytes([body[52], body[53]]);
        let num_channels = body[54] as usize;
        let num_instruments = body[55] as usize;
        let num_orders = u16::from_le_bytes([body[56], body[57]]) as usize;
        let num_patterns = u16::from_le_bytes([body[58], body[59]]) as usize;
        let initial_speed = body[60];
        let initial_tempo = body[61];
        let extra_data_length = u32::from_le_bytes([body[94], body[95], body[96], body[97]]);

        if num_channels > MAX_CHANNELS {
            return Err(ParseError::too_many_channels(format!("{} channels exceeds the RTM maximum of {}", num_channels, MAX_CHANNELS)));
        }

        if obj.header_size as usize > 130 {
            reader.skip(obj.header_size as usize - 130)?;
        }

        let mut module = Module::new("RTMM", format!("Real Tracker {}.{:02x}", obj.version >> 8, obj.version & 0xff));
        module.display_name = obj.name.clone();
        module.channels = num_channels;
        module.num_instruments = num_instruments;
        module.initial_speed = initial_speed as u16;
        module.initial_tempo = initial_tempo as u16;
        module.warn(format!("author: {}, tracker: {}", author, tracker));

        if flags & LINEAR_TABLE != 0 {
            // linear frequency table; no dedicated Feature variant for this
            // crate, kept as an ambient fact rather than a usage warning.
        }
        if flags & TRACK_NAMES_PRESENT != 0 {
            module.warn("module carries per-track names (not retained)");
        }

        let mut orders = Vec::with_capacity(num_orders);
        for _ in 0..num_orders {
            orders.push(reader.read_u16le()?);
        }
        let mut ext_read = num_orders * 2;

        if flags & TRACK_NAMES_PRESENT != 0 {
            for _ in 0..num_channels {
                reader.skip(16)?;
            }
            ext_read += num_channels * 16;
        }

        if extra_data_length as usize != ext_read {
            module.warn(format!("extra data length mismatch: expected {}, computed {}", extra_data_length, ext_read));
        }

        module.num_orders = num_orders;
        module.orders = orders.iter().map(|&o| OrderEntry::Pattern(o)).collect();

        // "Format doc explicitly states to seek to this position to continue."
        let offset = OBJECT_HEADER_SIZE + obj.header_size as usize + extra_data_length as usize;
        reader.seek(offset)?;

        for p in 0..num_patterns {
            if reader.at_end() {
                module.warn(format!("truncated before pattern {}", p));
                break;
            }
            match load_pattern(reader, p, num_channels, &mut module) {
                Ok(pattern) => module.patterns.push(pattern),
                Err(e) => {
                    module.warn(format!("error loading pattern {}: {}", p, e));
                    break;
                }
            }
        }
        module.num_patterns = module.patterns.len();

        for i in 0..num_instruments {
            if reader.at_end() {
                module.warn(format!("truncated before instrument {}", i));
                break;
            }
            match load_instrument(reader, i) {
                Ok(ins) => module.instruments.push(ins),
                Err(e) => {
                    module.warn(format!("error loading instrument {}: {}", i, e));
                    break;
                }
            }
        }

        Ok(ParsedArtifact::Module(module))
    }
}

fn load_pattern(reader: &mut ByteReader<'_>, index: usize, header_channels: usize, module: &mut Module) -> Result<crate::model::Pattern> {
    let obj = read_object_header(reader, b"RTND", 9)?;
    let flags = reader.read_u16le()?;
    let _ = flags; // documented as "always 1"
    let num_channels = reader.read_u8()? as usize;
    let num_rows = reader.read_u16le()? as usize;
    let data_size = reader.read_u32le()? as usize;

    let bound = num_rows.min(MAX_ROWS) * num_channels.min(MAX_CHANNELS) * 8;
    if num_rows > MAX_ROWS || num_channels > MAX_CHANNELS || data_size > bound {
        module.warn(format!("invalid pattern {} data: rows={} channels={} size={}", index, num_rows, num_channels, data_size));
        reader.skip(data_size)?;
        return Ok(crate::model::Pattern::new(index, 0, 0));
    }

    let data = reader.read_bytes(data_size)?;
    let channels = num_channels.max(header_channels.min(MAX_CHANNELS)).max(1);
    let mut builder = PatternBuilder::new(index, num_rows.max(1), channels);
    builder.set_packed_bytes(data_size);

    let mut pos = 0usize;
    let mut row = 0usize;
    let mut chn = 0usize;
    let mut any_extended_effect = false;

    while pos < data.len() && row < num_rows {
        let v = data[pos];
        pos += 1;
        if v == 0 {
            chn = 0;
            row += 1;
            continue;
        }

        if v & 0x01 != 0 {
            if pos >= data.len() {
                break;
            }
            chn = data[pos] as usize;
            pos += 1;
        }

        let mut note = 0u8;
        let mut instrument = 0u8;
        let mut command_1 = 0u8;
        let mut param_1 = 0u8;
        let mut command_2 = 0u8;
        let mut param_2 = 0u8;

        if v & 0x02 != 0 && pos < data.len() {
            note = data[pos];
            pos += 1;
        }
        if v & 0x04 != 0 && pos < data.len() {
            instrument = data[pos];
            pos += 1;
        }
        if v & 0x08 != 0 && pos < data.len() {
            command_1 = data[pos];
            pos += 1;
        }
        if v & 0x10 != 0 && pos < data.len() {
            param_1 = data[pos];
            pos += 1;
        }
        if v & 0x20 != 0 && pos < data.len() {
            command_2 = data[pos];
            pos += 1;
        }
        if v & 0x40 != 0 && pos < data.len() {
            param_2 = data[pos];
            pos += 1;
        }

        if command_1 != 0 || command_2 != 0 {
            any_extended_effect = true;
        }

        if chn < channels {
            let extras: &[(u8, u8)] = if command_2 != 0 || param_2 != 0 { &[(command_2, param_2)] } else { &[] };
            builder.write_event(row, chn, note, instrument, 0, (command_1, param_1), extras)?;
        }
        chn += 1;
    }

    if any_extended_effect {
        module.usage.set(Feature::RtmExtendedEffect);
    }
    let _ = obj.version;
    let _ = obj.id;
    if !obj.name.is_empty() {
        module.warn(format!("pattern {} name: {}", index, obj.name));
    }

    Ok(builder.finish())
}

fn load_instrument(reader: &mut ByteReader<'_>, index: usize) -> Result<Instrument> {
    let obj = read_object_header(reader, b"RTIN", 0)?;
    let body = read_body(reader, obj.header_size, 341)?;

    let num_samples = body[0] as usize;
    let fade_out = u16::from_le_bytes([body[331], body[332]]);
    let midi_channel = body[334];
    let midi_program = body[335];
    let midi_enable = body[336];

    let mut ins = Instrument::empty(InstrumentKind::Empty);
    ins.display_name = obj.name;
    ins.envelopes.push(read_envelope(&body, 123));
    ins.envelopes.push(read_envelope(&body, 225));
    if midi_enable != 0 {
        ins.midi_channel = Some(midi_channel);
        ins.midi_program = Some(midi_program);
    }
    let _ = fade_out;

    for s in 0..num_samples {
        load_sample(reader, index, s)?;
    }
    ins.kind = if num_samples > 0 { InstrumentKind::Sample } else { InstrumentKind::Empty };

    Ok(ins)
}

fn read_envelope(buf: &[u8], pos: usize) -> Envelope {
    let num_points = buf[pos] as usize;
    let sustain_point = buf[pos + 97];
    let loop_start = buf[pos + 98];
    let loop_end = buf[pos + 99];
    let flags = u16::from_le_bytes([buf[pos + 100], buf[pos + 101]]);

    let mut env = Envelope {
        enabled: flags & 0x01 != 0,
        sustain: flags & 0x02 != 0,
        looping: flags & 0x04 != 0,
        carry: false,
        filter_for_pitch: false,
        nodes: Vec::with_capacity(num_points.min(12)),
        loop_start,
        loop_end,
        sustain_start: sustain_point,
        sustain_end: sustain_point,
    };

    for i in 0..num_points.min(12) {
        let p = pos + 1 + i * 8;
        let x = i32::from_le_bytes([buf[p], buf[p + 1], buf[p + 2], buf[p + 3]]);
        let y = i32::from_le_bytes([buf[p + 4], buf[p + 5], buf[p + 6], buf[p + 7]]);
        env.nodes.push((x.clamp(i8::MIN as i32, i8::MAX as i32) as i8, y.clamp(0, u16::MAX as i32) as u16));
    }
    env
}

fn load_sample(reader: &mut ByteReader<'_>, ins_index: usize, sample_index: usize) -> Result<()> {
    let obj = read_object_header(reader, b"RTSM", 0)?;
    let body = read_body(reader, obj.header_size, 26)?;

    let length_bytes = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    let _loop_mode = body[8];
    let _loop_start_bytes = u32::from_le_bytes([body[12], body[13], body[14], body[15]]);
    let _loop_end_bytes = u32::from_le_bytes([body[16], body[17], body[18], body[19]]);
    let _base_frequency = u32::from_le_bytes([body[20], body[21], body[22], body[23]]);

    if reader.seek(reader.position() + length_bytes as usize).is_err() {
        return Err(ParseError::invalid(format!("instrument {} sample {} sample data runs past end of file", ins_index, sample_index)));
    }
    Ok(())
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(RtmHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_header(id: &[u8; 4], header_size: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(id);
        buf.push(0x20); // rc
        buf.extend_from_slice(&[0u8; 32]); // name
        buf.push(0x1a); // eof
        buf.extend_from_slice(&0u16.to_le_bytes()); // version
        buf.extend_from_slice(&header_size.to_le_bytes());
        buf
    }

    fn minimal_rtm() -> Vec<u8> {
        let mut buf = object_header(b"RTMM", 130);
        buf.extend_from_slice(&[0u8; 20]); // tracker
        buf.extend_from_slice(&[0u8; 32]); // author
        buf.extend_from_slice(&0u16.to_le_bytes()); // flags (Amiga tables)
        buf.push(1); // num_channels
        buf.push(0); // num_instruments
        buf.extend_from_slice(&0u16.to_le_bytes()); // num_orders
        buf.extend_from_slice(&0u16.to_le_bytes()); // num_patterns
        buf.push(6); // initial_speed
        buf.push(125); // initial_tempo
        buf.extend_from_slice(&[0i8 as u8; 32]); // initial panning
        buf.extend_from_slice(&0u32.to_le_bytes()); // extra_data_length
        buf.extend_from_slice(&[0u8; 32]); // original_name
        buf
    }

    #[test]
    fn rejects_wrong_magic() {
        let data = [0u8; 64];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(RtmHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn rejects_undersized_header() {
        let buf = object_header(b"RTMM", 10);
        let mut reader = ByteReader::new(&buf);
        assert!(matches!(RtmHandler.accept_and_parse(&mut reader), Err(ParseError::UnsupportedVersion(_))));
    }

    #[test]
    fn parses_minimal_module_with_no_patterns() {
        let buf = minimal_rtm();
        let mut reader = ByteReader::new(&buf);
        let artifact = RtmHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => {
                assert_eq!(m.channels, 1);
                assert_eq!(m.num_patterns, 0);
            }
            _ => panic!("expected Module"),
        }
    }
}
