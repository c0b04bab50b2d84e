// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Liquid Tracker, in its released form (`Liquid Module:`, track-major
//! patterns under a byte-opcode packer) and its beta `NO` form (fixed
//! 64-row patterns, one packed `u32` per cell, no packer at all).

use crate::error::{ParseError, Result};
use crate::io::{ByteReader, ReadBytes};
use crate::model::{Instrument, InstrumentKind, LoopKind, Module, OrderEntry};
use crate::pattern::PatternBuilder;
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::usage::Feature;

const LIQ_MAGIC: &[u8; 14] = b"Liquid Module:";
const NO_MAGIC: &[u8; 4] = b"NO\0\0";
const LIQ_PATTERN_MAGIC: &[u8; 4] = b"LP\0\0";
const LIQ_NO_PATTERN_MAGIC: &[u8; 4] = b"!!!!";
const LIQ_LDSS_MAGIC: &[u8; 4] = b"LDSS";
const LIQ_NO_LDSS_MAGIC: &[u8; 4] = b"????";

const MAX_CHANNELS: usize = 256;
const MAX_INSTRUMENTS: usize = 255;
const MAX_PATTERNS: usize = 256;

const NO_MAX_CHANNELS: usize = 255;
const NO_MAX_INSTRUMENTS: usize = 63;
const NO_MAX_PATTERNS: usize = 255;
const NO_ROWS: usize = 64;

/// Count of the 5 packable fields (note/instrument/volume/effect/param)
/// selected by each of the low 5 bits of a packed-event mask, indexed
/// directly by that mask.
const UNPACK_COUNTS: [usize; 32] = [
    0, 1, 1, 2, 1, 2, 2, 3, 1, 2, 2, 3, 2, 3, 3, 4, 1, 2, 2, 3, 2, 3, 3, 4, 2, 3, 3, 4, 3, 4, 4, 5,
];

pub struct LiqHandler;

impl FormatHandler for LiqHandler {
    fn name(&self) -> &'static str {
        "Liquid Tracker"
    }

    fn tag(&self) -> &'static str {
        "LIQ"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let mut magic14 = [0u8; 14];
        let checkpoint = reader.position();
        if reader.read_bytes_into(&mut magic14).is_ok() && &magic14 == LIQ_MAGIC {
            return parse_liq(reader);
        }
        reader.seek(checkpoint)?;

        let mut magic4 = [0u8; 4];
        reader.read_bytes_into(&mut magic4).map_err(|_| ParseError::NotRecognized)?;
        if &magic4 == NO_MAGIC {
            return parse_no(reader);
        }
        Err(ParseError::NotRecognized)
    }
}

fn parse_liq(reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
    let name = reader.read_bytes(31)?.to_vec();
    let author = reader.read_bytes(21)?.to_vec();
    let _eof = reader.read_u8()?;
    let tracker_name = reader.read_bytes(21)?.to_vec();
    let format_version = reader.read_u16le()?;
    let initial_speed = reader.read_u16le()?;
    let initial_bpm = reader.read_u16le()?;
    let _lowest_note = reader.read_u16le()?;
    let _highest_note = reader.read_u16le()?;
    let num_channels = reader.read_u16le()? as usize;
    let flags = reader.read_u32le()?;
    let num_patterns = reader.read_u16le()? as usize;
    let num_instruments = reader.read_u16le()? as usize;

    let (num_orders, header_bytes, num_orders_to_load, num_channels_to_load);
    if format_version >= 0x100 {
        num_orders = reader.read_u16le()? as usize;
        header_bytes = reader.read_u16le()?;
        num_orders_to_load = num_orders;
        num_channels_to_load = num_channels;
    } else {
        header_bytes = reader.read_u16le()?;
        reader.skip(3)?; // remaining reserved bytes
        num_orders = 0;
        num_channels_to_load = 64;
        num_orders_to_load = 256;
    }

    let mut module = Module::new("Liquid Module:", format!("Liquid Tracker {}.{:02x}", format_version >> 8, format_version & 0xff));
    module.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
    let _ = author;
    let _ = tracker_name;
    module.initial_speed = initial_speed;
    module.initial_tempo = initial_bpm;

    if flags & 0x02 != 0 {
        // ST3 compatibility mode
    } else {
        module.usage.set(Feature::LiqTrackFormat);
    }

    if num_channels > MAX_CHANNELS {
        return Err(ParseError::too_many_channels(format!("{} channels exceeds the LIQ maximum of {}", num_channels, MAX_CHANNELS)));
    }
    if num_patterns > MAX_PATTERNS {
        return Err(ParseError::too_many_blocks(format!("{} patterns exceeds the LIQ maximum of {}", num_patterns, MAX_PATTERNS)));
    }
    if num_instruments > MAX_INSTRUMENTS {
        return Err(ParseError::too_many_instruments(format!("{} instruments exceeds the LIQ maximum of {}", num_instruments, MAX_INSTRUMENTS)));
    }

    reader.skip(num_channels_to_load)?; // initial panning
    reader.skip(num_channels_to_load)?; // initial volume
    let mut orders = vec![0u8; num_orders_to_load];
    reader.read_bytes_into(&mut orders)?;

    let num_orders = if format_version < 0x100 {
        orders.iter().position(|&b| b == 0xff).unwrap_or(256)
    } else {
        num_orders
    };
    module.num_orders = num_orders;
    module.orders = orders[..num_orders].iter().map(|&o| OrderEntry::Pattern(o as u16)).collect();

    let base_header_size = reader.position();
    let mut header_remaining = if base_header_size > header_bytes as usize {
        if format_version > 0 {
            module.warn(format!("unreliable header bytes field: {}", header_bytes));
        }
        0
    } else {
        header_bytes as usize - base_header_size
    };

    if header_remaining > 0 && header_remaining < 4 {
        module.warn("header data too short to fit echo data");
        header_remaining = 0;
    }
    if format_version >= 0x101 && header_remaining >= 4 {
        let mut echo_magic = [0u8; 4];
        reader.read_bytes_into(&mut echo_magic)?;
        header_remaining -= 4;

        if &echo_magic == b"POOL" && header_remaining >= 4 + 4 * num_channels {
            reader.skip(4 * num_channels)?; // per-channel mix_setup/echo_amount
            header_remaining -= 4 * num_channels;

            let num_pools = reader.read_u32le()? as usize;
            header_remaining -= 4;
            if num_pools > 0 && header_remaining >= 20 * num_pools {
                reader.skip(20 * num_pools)?;
                header_remaining -= 20 * num_pools;
            } else {
                module.warn("header data too short to fit echo pools");
                header_remaining = 0;
            }
        } else {
            module.warn("header data too short to fit echo data");
            header_remaining = 0;
        }
    }

    if format_version >= 0x102 && header_remaining >= 2 {
        let _amplification = reader.read_u16le()?;
        header_remaining -= 2;
    }

    if header_remaining > 0 {
        module.warn(format!("unloaded header bytes: {}", header_remaining));
        reader.skip(header_remaining)?;
    }

    for p in 0..num_patterns {
        match load_liq_pattern(reader, p, num_channels) {
            Ok(pattern) => module.patterns.push(pattern),
            Err(ParseError::BadPacking(msg)) => {
                module.warn(format!("error loading pattern {}: {}", p, msg));
                module.patterns.push(crate::model::Pattern::new(p, 0, 0));
            }
            Err(e) => return Err(e),
        }
    }
    module.num_patterns = num_patterns;
    module.channels = num_channels;

    for _ in 0..num_instruments {
        let mut magic = [0u8; 4];
        reader.read_bytes_into(&mut magic)?;
        if &magic == LIQ_NO_LDSS_MAGIC {
            module.instruments.push(Instrument::empty(InstrumentKind::Empty));
            continue;
        }
        if &magic != LIQ_LDSS_MAGIC {
            module.warn("instrument magic mismatch");
        }

        let _format_version = reader.read_u16le()?;
        let sname = reader.read_bytes(31)?.to_vec();
        let software_name = reader.read_bytes(21)?.to_vec();
        let author_name = reader.read_bytes(21)?.to_vec();
        let _sound_board_id = reader.read_u8()?;
        let length = reader.read_u32le()?;
        let loopstart = reader.read_u32le()?;
        let loopend = reader.read_u32le()?;
        let rate = reader.read_u32le()?;
        let default_volume = reader.read_u8()?;
        let sample_flags = reader.read_u8()?;
        let default_pan = reader.read_u8()?;
        let _midi_patch = reader.read_u8()?;
        let _global_volume = reader.read_u8()?;
        let _chord_type = reader.read_u8()?;
        let _length_bytes = reader.read_u16le()?;
        let _compression_type = reader.read_u16le()?;
        let _crc32 = reader.read_u32le()?;
        let _midi_channel = reader.read_u8()?;
        let loop_type = reader.read_i8()?;
        reader.skip(10)?; // reserved
        let filename = reader.read_bytes(26)?.to_vec();

        let mut ins = Instrument::empty(InstrumentKind::Sample);
        ins.display_name = String::from_utf8_lossy(&sname).trim_end_matches('\0').trim().to_string();
        ins.file_name_hint = String::from_utf8_lossy(&filename).trim_end_matches('\0').to_string();
        ins.length = length;
        ins.loop_start = loopstart;
        ins.loop_end = loopend;
        ins.sample_rate = rate;
        ins.default_volume = default_volume.min(64);
        ins.panning = if default_pan <= 64 { Some(default_pan) } else { None };
        ins.loop_kind = if loopend == 0 {
            LoopKind::None
        } else if loop_type == 1 {
            LoopKind::PingPong
        } else {
            LoopKind::Forward
        };
        let _ = software_name;
        let _ = author_name;
        let _ = sample_flags; // 16-bit/stereo/signed bits; no dedicated usage flag for sample bit depth

        module.instruments.push(ins);
    }
    module.num_instruments = num_instruments;

    Ok(ParsedArtifact::Module(module))
}

fn load_liq_pattern(reader: &mut ByteReader<'_>, index: usize, num_channels: usize) -> Result<crate::model::Pattern> {
    let mut magic = [0u8; 4];
    reader.read_bytes_into(&mut magic)?;
    if &magic == LIQ_NO_PATTERN_MAGIC {
        return Ok(crate::model::Pattern::new(index, 0, 0));
    }

    let _name = reader.read_bytes(31)?.to_vec();
    let num_rows = reader.read_u16le()? as usize;
    let packed_bytes = reader.read_u32le()? as usize;
    let _reserved = reader.read_u32le()?;

    if &magic != LIQ_PATTERN_MAGIC {
        // kept as a soft mismatch: still attempt to decode.
    }

    if packed_bytes > reader.length() {
        return Err(ParseError::bad_packing(format!("pattern {} declares an implausible packed size {}", index, packed_bytes)));
    }

    let data = reader.read_bytes(packed_bytes)?;
    let mut builder = PatternBuilder::new(index, num_rows, num_channels).column_major();
    builder.set_packed_bytes(packed_bytes);

    let num_events = num_rows * num_channels;
    let mut row = 0usize;
    let mut pos = 0usize;
    let mut track_base = 0usize;

    while pos < data.len() {
        let value = data[pos];
        pos += 1;

        if value == 0xc0 {
            break;
        }
        if value == 0xa0 {
            track_base = row / num_rows.max(1) + 1;
            if track_base >= num_channels {
                break;
            }
            row = track_base * num_rows;
            continue;
        }
        if value == 0xe0 {
            if pos >= data.len() {
                return Err(ParseError::bad_packing("truncated skip-rows opcode"));
            }
            row += data[pos] as usize + 1;
            pos += 1;
            continue;
        }
        if value == 0x80 {
            row += 1;
            continue;
        }
        if value == 0xe1 {
            if pos >= data.len() {
                return Err(ParseError::bad_packing("truncated skip-tracks opcode"));
            }
            track_base = row / num_rows.max(1);
            track_base += data[pos] as usize + 1;
            pos += 1;
            if track_base >= num_channels {
                break;
            }
            row = track_base * num_rows;
            continue;
        }

        if value > 0xc0 && value < 0xe0 {
            let (note, instrument, volume, effect, param, consumed) = unpack_event(data, pos, value)?;
            if consumed == 0 || row >= num_events {
                return Err(ParseError::bad_packing("packed event decode failed"));
            }
            write_liq_event(&mut builder, row, num_rows, note, instrument, volume, effect, param)?;
            row += 1;
            pos += consumed;
        } else if value > 0xa0 && value < 0xc0 {
            if pos >= data.len() {
                return Err(ParseError::bad_packing("truncated repeat count"));
            }
            let mut count = data[pos] as usize + 1;
            pos += 1;
            while count > 0 {
                let (note, instrument, volume, effect, param, consumed) = unpack_event(data, pos, value)?;
                if consumed == 0 || row >= num_events {
                    return Err(ParseError::bad_packing("packed-repeat event decode failed"));
                }
                write_liq_event(&mut builder, row, num_rows, note, instrument, volume, effect, param)?;
                row += 1;
                pos += consumed;
                count -= 1;
            }
        } else if value > 0x80 && value < 0xa0 {
            if pos >= data.len() {
                return Err(ParseError::bad_packing("truncated RLE count"));
            }
            let count = data[pos] as usize + 1;
            pos += 1;
            let (note, instrument, volume, effect, param, consumed) = unpack_event(data, pos, value)?;
            if consumed == 0 || row + count > num_events {
                return Err(ParseError::bad_packing("RLE event decode failed"));
            }
            pos += consumed;
            for _ in 0..count {
                write_liq_event(&mut builder, row, num_rows, note, instrument, volume, effect, param)?;
                row += 1;
            }
        } else {
            let start = pos - 1;
            if data.len() - start < 5 {
                return Err(ParseError::bad_packing("truncated unpacked event"));
            }
            let note = data[start] + 1;
            let instrument = data[start + 1] + 1;
            let volume = data[start + 2] + 1;
            let effect = fix_effect(data[start + 3]);
            let param = data[start + 4];
            if row >= num_events {
                return Err(ParseError::bad_packing("unpacked event decode failed"));
            }
            write_liq_event(&mut builder, row, num_rows, note, instrument, volume, effect, param)?;
            row += 1;
            pos = start + 5;
        }
    }

    Ok(builder.finish())
}

fn fix_effect(fx: u8) -> u8 {
    if fx != 0xff {
        fx.wrapping_sub(b'@')
    } else {
        0
    }
}

#[allow(clippy::too_many_arguments)]
fn unpack_event(data: &[u8], pos: usize, mask: u8) -> Result<(u8, u8, u8, u8, u8, usize)> {
    let num = UNPACK_COUNTS[(mask & 31) as usize];
    if data.len() < pos + num {
        return Ok((0, 0, 0, 0, 0, 0));
    }
    let mut p = pos;
    let mut note = 0u8;
    let mut instrument = 0u8;
    let mut volume = 0u8;
    let mut effect = 0u8;
    let mut param = 0u8;
    if mask & 1 != 0 {
        note = data[p] + 1;
        p += 1;
    }
    if mask & 2 != 0 {
        instrument = data[p] + 1;
        p += 1;
    }
    if mask & 4 != 0 {
        volume = data[p] + 1;
        p += 1;
    }
    if mask & 8 != 0 {
        effect = fix_effect(data[p]);
        p += 1;
    }
    if mask & 16 != 0 {
        param = data[p];
        p += 1;
    }
    Ok((note, instrument, volume, effect, param, num))
}

fn write_liq_event(
    builder: &mut PatternBuilder,
    row: usize,
    num_rows: usize,
    note: u8,
    instrument: u8,
    volume: u8,
    effect: u8,
    param: u8,
) -> Result<()> {
    let track = row / num_rows.max(1);
    let local_row = row % num_rows.max(1);
    if track >= builder.channels() || local_row >= builder.rows() {
        return Ok(());
    }
    builder.write_event(local_row, track, note, instrument, volume, (effect, param), &[])
}

fn parse_no(reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
    let name_length = reader.read_u8()? as usize;
    let name = reader.read_bytes(29)?.to_vec();
    let num_patterns = reader.read_u8()? as usize;
    let _unknown_ff = reader.read_u8()?;
    let num_channels = reader.read_u8()? as usize;
    reader.skip(6)?; // unknown

    let mut orders = [0u8; 256];
    reader.read_bytes_into(&mut orders)?;
    let num_orders = orders.iter().position(|&b| b == 0xff).unwrap_or(256);

    if num_channels > NO_MAX_CHANNELS {
        return Err(ParseError::too_many_channels(format!("{} channels exceeds the LIQ-NO maximum of {}", num_channels, NO_MAX_CHANNELS)));
    }
    if num_patterns > NO_MAX_PATTERNS {
        return Err(ParseError::too_many_blocks(format!("{} patterns exceeds the LIQ-NO maximum of {}", num_patterns, NO_MAX_PATTERNS)));
    }

    let mut module = Module::new("NO\0\0", "Liquid Tracker beta (NO)");
    module.display_name = String::from_utf8_lossy(&name[..name_length.min(29)]).trim_end_matches('\0').to_string();
    module.usage.set(Feature::LiqNoFormat);
    module.num_orders = num_orders;
    module.orders = orders[..num_orders].iter().map(|&o| OrderEntry::Pattern(o as u16)).collect();
    module.channels = num_channels;

    let mut num_used = 0usize;
    for _ in 0..NO_MAX_INSTRUMENTS {
        let ins_name_length = reader.read_u8()? as usize;
        let ins_name = reader.read_bytes(30)?.to_vec();
        let default_volume = reader.read_u8()?;
        let rate = reader.read_u16le()?;
        let length = reader.read_u32le()?;
        let loop_start = reader.read_u32le()?;
        let loop_length = reader.read_u32le()?;

        let mut ins = Instrument::empty(if length > 0 { InstrumentKind::Sample } else { InstrumentKind::Empty });
        ins.display_name = String::from_utf8_lossy(&ins_name[..ins_name_length.min(30)]).trim_end_matches('\0').to_string();
        ins.default_volume = default_volume.min(64);
        ins.sample_rate = rate as u32;
        ins.length = length;
        ins.loop_start = loop_start;
        ins.loop_end = loop_start.saturating_add(loop_length);
        ins.loop_kind = if loop_length > 0 { LoopKind::Forward } else { LoopKind::None };
        if length > 0 {
            num_used += 1;
        }
        module.instruments.push(ins);
    }
    module.num_instruments = NO_MAX_INSTRUMENTS;
    if num_used == 0 {
        module.warn("no instruments contain sample data");
    }

    let pattern_size = num_channels * NO_ROWS * 4;
    for p in 0..num_patterns {
        if pattern_size == 0 || reader.position() + pattern_size > reader.length() {
            module.warn(format!("read error at pattern {}", p));
            module.patterns.push(crate::model::Pattern::new(p, 0, 0));
            continue;
        }
        let body = reader.read_bytes(pattern_size)?;
        let mut builder = PatternBuilder::new(p, NO_ROWS, num_channels);
        builder.set_packed_bytes(pattern_size);
        let mut off = 0usize;
        for row in 0..NO_ROWS {
            for ch in 0..num_channels {
                let pack = u32::from_le_bytes([body[off], body[off + 1], body[off + 2], body[off + 3]]);
                off += 4;
                let note = (((pack >> 0) & 0x3f).wrapping_add(1)) as u8 & 0x3f;
                let instrument = (((pack >> 6) & 0x7f).wrapping_add(1)) as u8 & 0x7f;
                let volume = (((pack >> 13) & 0x7f).wrapping_add(1)) as u8 & 0x7f;
                let effect = (((pack >> 20) & 0x0f).wrapping_add(1)) as u8 & 0x0f;
                let param = (pack >> 24) as u8;
                builder.write_event(row, ch, note, instrument, volume, (effect, param), &[])?;
            }
        }
        module.patterns.push(builder.finish());
    }
    module.num_patterns = num_patterns;

    Ok(ParsedArtifact::Module(module))
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(LiqHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_magic() {
        let data = [0u8; 32];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(LiqHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    fn minimal_liq() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(LIQ_MAGIC);
        buf.extend_from_slice(&[0u8; 30]); // name
        buf.extend_from_slice(&[0u8; 20]); // author
        buf.push(0x1a); // eof
        buf.extend_from_slice(&[0u8; 20]); // tracker_name
        buf.extend_from_slice(&0u16.to_le_bytes()); // format_version 0.00
        buf.extend_from_slice(&6u16.to_le_bytes()); // initial_speed
        buf.extend_from_slice(&125u16.to_le_bytes()); // initial_bpm
        buf.extend_from_slice(&0u16.to_le_bytes()); // lowest_note
        buf.extend_from_slice(&0u16.to_le_bytes()); // highest_note
        buf.extend_from_slice(&1u16.to_le_bytes()); // num_channels
        buf.extend_from_slice(&0u32.to_le_bytes()); // flags
        buf.extend_from_slice(&0u16.to_le_bytes()); // num_patterns
        buf.extend_from_slice(&0u16.to_le_bytes()); // num_instruments
        buf.extend_from_slice(&109u16.to_le_bytes()); // header_bytes (==base_header_size below)
        buf.extend_from_slice(&[0u8; 3]); // reserved
        buf.extend_from_slice(&[0u8; 64]); // initial pan (64 channels for version < 0x100)
        buf.extend_from_slice(&[0u8; 64]); // initial volume
        buf.extend_from_slice(&[0xffu8; 256]); // orders, empty song
        buf
    }

    #[test]
    fn parses_minimal_liq_header() {
        let buf = minimal_liq();
        let mut reader = ByteReader::new(&buf);
        let artifact = LiqHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => {
                assert_eq!(m.channels, 1);
                assert_eq!(m.num_orders, 0);
            }
            _ => panic!("expected Module"),
        }
    }

    #[test]
    fn parses_no_format_minimal() {
        let mut buf = Vec::new();
        buf.extend_from_slice(NO_MAGIC);
        buf.push(0); // name_length
        buf.extend_from_slice(&[0u8; 29]); // name
        buf.push(0); // num_patterns
        buf.push(0xff); // unknown_ff
        buf.push(1); // num_channels
        buf.extend_from_slice(&[0u8; 6]); // unknown
        buf.extend_from_slice(&[0xffu8; 256]); // orders, empty song
        for _ in 0..NO_MAX_INSTRUMENTS {
            buf.push(0); // name_length
            buf.extend_from_slice(&[0u8; 30]); // name
            buf.push(0); // default_volume
            buf.extend_from_slice(&0u16.to_le_bytes()); // rate
            buf.extend_from_slice(&0u32.to_le_bytes()); // length
            buf.extend_from_slice(&0u32.to_le_bytes()); // loop_start
            buf.extend_from_slice(&0u32.to_le_bytes()); // loop_length
        }
        let mut reader = ByteReader::new(&buf);
        let artifact = LiqHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => {
                assert_eq!(m.channels, 1);
                assert!(m.usage.is_set(Feature::LiqNoFormat));
            }
            _ => panic!("expected Module"),
        }
    }
}
