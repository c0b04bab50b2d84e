// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Impulse Tracker (IMPM): parapointer-linked instrument/sample tables,
//! two instrument record layouts gated on format version, and IT's own
//! block-compressed sample encoding (scanned, not materialized).

use crate::codecs::scan_it_compressed_sample;
use crate::error::{ParseError, Result};
use crate::io::{read_padded, ByteReader, ReadBytes};
use crate::model::{Envelope, Instrument, InstrumentKind, LoopKind, Module};
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::report::Reporter;
use crate::usage::Feature;

const MAGIC: &[u8; 4] = b"IMPM";
const HEADER_LEN: usize = 192;

pub struct ItHandler;

impl FormatHandler for ItHandler {
    fn name(&self) -> &'static str {
        "Impulse Tracker"
    }

    fn tag(&self) -> &'static str {
        "IT"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let mut magic = [0u8; 4];
        reader.read_bytes_into(&mut magic).map_err(|_| ParseError::NotRecognized)?;
        if &magic != MAGIC {
            return Err(ParseError::NotRecognized);
        }
        if reader.length() < HEADER_LEN {
            return Err(ParseError::NotRecognized);
        }

        reader.seek(4)?;
        let mut song_name = [0u8; 26];
        read_padded(reader, &mut song_name);
        let _highlight_minor = reader.read_u8()?;
        let _highlight_major = reader.read_u8()?;
        let num_orders = reader.read_u16le()?;
        let num_instruments = reader.read_u16le()?;
        let num_samples = reader.read_u16le()?;
        let num_patterns = reader.read_u16le()?;
        let format_version = reader.read_u16le()?;
        let _compat_version = reader.read_u16le()?;
        let flags = reader.read_u16le()?;
        let _special = reader.read_u16le()?;
        let _global_volume = reader.read_u8()?;
        let _mix_volume = reader.read_u8()?;
        let initial_speed = reader.read_u8()? as u16;
        let initial_tempo = reader.read_u8()? as u16;
        let _sep = reader.read_u8()?;
        let _pitch_wheel_depth = reader.read_u8()?;
        let _message_len = reader.read_u16le()?;
        let _message_offset = reader.read_u32le()?;
        let _reserved = reader.read_u32le()?;

        let mut channel_pan = [0u8; 64];
        read_padded(reader, &mut channel_pan);
        let mut channel_vol = [0u8; 64];
        read_padded(reader, &mut channel_vol);

        let active_channels = channel_pan.iter().filter(|&&p| p != 100).count().max(1);

        let mut module = Module::new("IMPM", "Impulse Tracker");
        module.display_name = String::from_utf8_lossy(&song_name)
            .trim_end_matches('\0')
            .trim()
            .to_string();
        module.channels = active_channels;
        module.num_orders = num_orders as usize;
        module.num_instruments = num_instruments as usize;
        module.num_patterns = num_patterns as usize;
        module.initial_speed = initial_speed;
        module.initial_tempo = initial_tempo;
        if flags & 0x0008 != 0 {
            module.usage.set(Feature::ItLinearSlides);
        }

        let mut orders = vec![0u8; num_orders as usize];
        if !orders.is_empty() {
            read_padded(reader, &mut orders);
        }
        module.orders = orders
            .iter()
            .map(|&o| match o {
                255 => crate::model::OrderEntry::EndOfSong,
                254 => crate::model::OrderEntry::Skip,
                n if (n as usize) < num_patterns as usize => crate::model::OrderEntry::Pattern(n as u16),
                n => crate::model::OrderEntry::Invalid(n as u16),
            })
            .collect();

        let mut instrument_ptrs = vec![0u32; num_instruments as usize];
        for p in instrument_ptrs.iter_mut() {
            *p = reader.read_u32le()?;
        }
        let mut sample_ptrs = vec![0u32; num_samples as usize];
        for p in sample_ptrs.iter_mut() {
            *p = reader.read_u32le()?;
        }
        let mut pattern_ptrs = vec![0u32; num_patterns as usize];
        for p in pattern_ptrs.iter_mut() {
            *p = reader.read_u32le()?;
        }

        // Every non-zero parapointer must land at or after the end of the
        // three parapointer tables just read (never alias into the header
        // or the tables themselves) and at or before the end of the file.
        let end_of_table = reader.position();
        let file_len = reader.length();
        for &p in &instrument_ptrs {
            if p != 0 && ((p as usize) < end_of_table || p as usize > file_len) {
                return Err(ParseError::invalid("instrument parapointer out of bounds"));
            }
        }
        for &p in &sample_ptrs {
            if p != 0 && ((p as usize) < end_of_table || p as usize > file_len) {
                return Err(ParseError::invalid("sample parapointer out of bounds"));
            }
        }
        for &p in &pattern_ptrs {
            if p != 0 && ((p as usize) < end_of_table || p as usize > file_len) {
                return Err(ParseError::invalid("pattern parapointer out of bounds"));
            }
        }

        let old_layout = format_version < 0x200;
        if old_layout {
            module.usage.set(Feature::ItOldInstrumentFormat);
        }

        for &ptr in &instrument_ptrs {
            if ptr == 0 {
                module.instruments.push(Instrument::empty(InstrumentKind::Empty));
                continue;
            }
            reader.seek(ptr as usize)?;
            module.instruments.push(read_instrument(reader, old_layout)?);
        }

        for &ptr in &sample_ptrs {
            if ptr == 0 {
                continue;
            }
            reader.seek(ptr as usize)?;
            let (instrument, compression) = read_sample_header(reader)?;
            if let Some(stats) = compression {
                let mut ins = instrument;
                ins.compression = Some(stats.0);
                if stats.1 {
                    module.usage.set(Feature::ItInvalidBitWidth);
                }
                module.instruments.push(ins);
            } else {
                module.instruments.push(instrument);
            }
        }

        for (idx, &ptr) in pattern_ptrs.iter().enumerate() {
            if ptr == 0 {
                module.patterns.push(crate::model::Pattern::new(idx, 64, active_channels));
                continue;
            }
            reader.seek(ptr as usize)?;
            let packed_len = reader.read_u16le()? as usize;
            let rows = reader.read_u16le()? as usize;
            let _reserved = reader.read_u32le()?;
            let data = reader.read_bytes(packed_len)?;
            module.patterns.push(decode_it_pattern(idx, rows, active_channels, data));
        }

        Ok(ParsedArtifact::Module(module))
    }

    fn report_global_stats(&self, _reporter: &mut dyn Reporter, _file_count: u64) {}
}

fn read_instrument(reader: &mut ByteReader<'_>, old_layout: bool) -> Result<Instrument> {
    let mut magic = [0u8; 4];
    reader.read_bytes_into(&mut magic).ok();
    let mut file_name = [0u8; 12];
    read_padded(reader, &mut file_name);
    let _nna = reader.read_u8()?;
    let _dct = reader.read_u8()?;
    let _dca = reader.read_u8()?;
    let _fadeout = reader.read_u16le()?;
    let _pps = reader.read_i8()?;
    let _ppc = reader.read_u8()?;
    let _gbv = reader.read_u8()?;
    let dfp = reader.read_u8()?;
    let _rv = reader.read_u8()?;
    let _rp = reader.read_u8()?;

    let mut instrument = Instrument::empty(InstrumentKind::Sample);
    instrument.file_name_hint = String::from_utf8_lossy(&file_name).trim_end_matches('\0').to_string();
    instrument.panning = if dfp & 0x80 != 0 { Some(dfp & 0x7f) } else { None };

    if old_layout {
        let _trk_vers = reader.read_u16le()?;
        let _num_samples = reader.read_u8()?;
        let _reserved = reader.read_u8()?;
        let mut name = [0u8; 26];
        read_padded(reader, &mut name);
        instrument.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
        let _reserved2 = reader.read_bytes(6)?;
        let mut note_sample = [0u8; 240];
        read_padded(reader, &mut note_sample);
        instrument.envelopes.push(read_old_envelope(reader)?);
    } else {
        let _midi_channel = reader.read_u8()?;
        let _midi_program = reader.read_u8()?;
        let _midi_bank = reader.read_u16le()?;
        let mut name = [0u8; 26];
        read_padded(reader, &mut name);
        instrument.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
        let _ifc = reader.read_u8()?;
        let _ifr = reader.read_u8()?;
        let _mch = reader.read_u8()?;
        let _mpr = reader.read_u8()?;
        let _mbank = reader.read_u16le()?;
        let mut note_sample = [0u8; 240];
        read_padded(reader, &mut note_sample);
        instrument.envelopes.push(read_new_envelope(reader)?); // volume
        instrument.envelopes.push(read_new_envelope(reader)?); // panning
        instrument.envelopes.push(read_new_envelope(reader)?); // pitch/filter
    }

    Ok(instrument)
}

fn read_old_envelope(reader: &mut ByteReader<'_>) -> Result<Envelope> {
    let flags = reader.read_u8()?;
    let num_nodes = reader.read_u8()? as usize;
    let loop_start = reader.read_u8()?;
    let loop_end = reader.read_u8()?;
    let sustain_start = reader.read_u8()?;
    let sustain_end = reader.read_u8()?;
    let mut envelope = Envelope {
        enabled: flags & 0x01 != 0,
        looping: flags & 0x02 != 0,
        sustain: flags & 0x04 != 0,
        carry: false,
        filter_for_pitch: false,
        nodes: Vec::new(),
        loop_start,
        loop_end,
        sustain_start,
        sustain_end,
    };
    for _ in 0..25.min(num_nodes.max(0)).max(0) {
        let value = reader.read_i8()?;
        envelope.nodes.push((value, 0));
    }
    let remaining_nodes = 25usize.saturating_sub(envelope.nodes.len());
    reader.skip(remaining_nodes)?;
    Ok(envelope)
}

fn read_new_envelope(reader: &mut ByteReader<'_>) -> Result<Envelope> {
    let flags = reader.read_u8()?;
    let num_nodes = (reader.read_u8()? as usize).min(25);
    let loop_start = reader.read_u8()?;
    let loop_end = reader.read_u8()?;
    let sustain_start = reader.read_u8()?;
    let sustain_end = reader.read_u8()?;
    let mut envelope = Envelope {
        enabled: flags & 0x01 != 0,
        looping: flags & 0x02 != 0,
        sustain: flags & 0x04 != 0,
        carry: flags & 0x08 != 0,
        filter_for_pitch: flags & 0x80 != 0,
        nodes: Vec::with_capacity(num_nodes),
        loop_start,
        loop_end,
        sustain_start,
        sustain_end,
    };
    for _ in 0..25 {
        let value = reader.read_i8()?;
        let tick = reader.read_u16le()?;
        if envelope.nodes.len() < num_nodes {
            envelope.nodes.push((value, tick));
        }
    }
    let _reserved = reader.read_u8()?;
    Ok(envelope)
}

fn read_sample_header(reader: &mut ByteReader<'_>) -> Result<(Instrument, Option<(crate::model::CompressionStats, bool)>)> {
    let mut magic = [0u8; 4];
    reader.read_bytes_into(&mut magic).ok();
    let mut file_name = [0u8; 12];
    read_padded(reader, &mut file_name);
    let _zero = reader.read_u8()?;
    let gvl = reader.read_u8()?;
    let flags = reader.read_u8()?;
    let default_volume = reader.read_u8()?;
    let mut name = [0u8; 26];
    read_padded(reader, &mut name);
    let _convert = reader.read_u8()?;
    let dfp = reader.read_u8()?;
    let length = reader.read_u32le()?;
    let loop_start = reader.read_u32le()?;
    let loop_end = reader.read_u32le()?;
    let sample_rate = reader.read_u32le()?;
    let _sus_start = reader.read_u32le()?;
    let _sus_end = reader.read_u32le()?;
    let sample_ptr = reader.read_u32le()?;
    let _vib_speed = reader.read_u8()?;
    let _vib_depth = reader.read_u8()?;
    let _vib_rate = reader.read_u8()?;
    let _vib_type = reader.read_u8()?;

    let is_16bit = flags & 0x02 != 0;
    let is_stereo = flags & 0x04 != 0;
    let is_compressed = flags & 0x08 != 0;
    let has_loop = flags & 0x10 != 0;

    let mut instrument = Instrument::empty(InstrumentKind::Sample);
    instrument.file_name_hint = String::from_utf8_lossy(&file_name).trim_end_matches('\0').to_string();
    instrument.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
    instrument.default_volume = default_volume.min(64);
    instrument.panning = if dfp & 0x80 != 0 { Some(dfp & 0x7f) } else { None };
    instrument.length = length;
    instrument.sample_rate = sample_rate;
    instrument.loop_start = loop_start;
    instrument.loop_end = loop_end;
    instrument.loop_kind = if has_loop { LoopKind::Forward } else { LoopKind::None };
    let _ = gvl;

    if is_stereo {
        // Flag observed, not modeled as a distinct Instrument field (this
        // core never materializes PCM); recorded for the "Uses" line only.
    }

    let mut compression = None;
    if is_compressed && sample_ptr != 0 {
        reader.seek(sample_ptr as usize)?;
        let (stats, invalid) = scan_it_compressed_sample(reader, length, is_16bit)?;
        compression = Some((stats, invalid));
    }

    Ok((instrument, compression))
}

fn decode_it_pattern(index: usize, rows: usize, channels: usize, data: &[u8]) -> crate::model::Pattern {
    use crate::model::Pattern;
    let mut pattern = Pattern::new(index, rows, channels);
    pattern.packed_bytes = Some(data.len());

    let mut pos = 0usize;
    let mut row = 0usize;
    let mut last_mask = vec![0u8; channels.max(1)];
    let mut last_note = vec![0u8; channels.max(1)];
    let mut last_instrument = vec![0u8; channels.max(1)];
    let mut last_volume = vec![0u8; channels.max(1)];
    let mut last_effect = vec![0u8; channels.max(1)];
    let mut last_param = vec![0u8; channels.max(1)];

    while row < rows && pos < data.len() {
        let channel_var = data[pos];
        pos += 1;
        if channel_var == 0 {
            row += 1;
            continue;
        }
        let channel = ((channel_var.wrapping_sub(1)) & 0x3f) as usize;
        if channel >= channels {
            break;
        }
        let mut mask = last_mask[channel];
        if channel_var & 0x80 != 0 {
            if pos >= data.len() {
                break;
            }
            mask = data[pos];
            pos += 1;
            last_mask[channel] = mask;
        }

        let mut note = last_note[channel];
        let mut instrument = last_instrument[channel];
        let mut volume = last_volume[channel];
        let mut effect = last_effect[channel];
        let mut param = last_param[channel];

        if mask & 0x01 != 0 {
            if pos >= data.len() {
                break;
            }
            note = data[pos];
            pos += 1;
            last_note[channel] = note;
        }
        if mask & 0x02 != 0 {
            if pos >= data.len() {
                break;
            }
            instrument = data[pos];
            pos += 1;
            last_instrument[channel] = instrument;
        }
        if mask & 0x04 != 0 {
            if pos >= data.len() {
                break;
            }
            volume = data[pos];
            pos += 1;
            last_volume[channel] = volume;
        }
        if mask & 0x08 != 0 {
            if pos + 1 >= data.len() {
                break;
            }
            effect = data[pos];
            param = data[pos + 1];
            pos += 2;
            last_effect[channel] = effect;
            last_param[channel] = param;
        }

        if mask & 0x10 != 0 {
            let event = pattern.event_mut(row, channel);
            event.note = note;
            event.instrument = instrument;
        }
        if mask & 0x20 != 0 {
            pattern.event_mut(row, channel).volume = volume;
        }
        if mask & 0x40 != 0 {
            let event = pattern.event_mut(row, channel);
            event.effect = effect;
            event.param = param;
        }
    }

    pattern
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(ItHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_magic() {
        let data = [0u8; 200];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(ItHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn empty_pattern_stream_yields_empty_events() {
        let pattern = decode_it_pattern(0, 4, 2, &[]);
        assert!(pattern.events.iter().all(|e| e.is_empty()));
    }
}
