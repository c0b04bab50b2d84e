// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scream Tracker 3 (SCRM): 16-byte-paragraph parapointers, the
//! non-little-endian sample-segment pointer, and `cwtv` tracker
//! fingerprinting.

use crate::error::{ParseError, Result};
use crate::io::{read_padded, ByteReader, ReadBytes};
use crate::model::{AdLibOperators, Instrument, InstrumentKind, LoopKind, Module};
use crate::pattern::PatternBuilder;
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::report::Reporter;
use crate::usage::Feature;

const MAGIC_OFFSET: usize = 44;
const MAGIC: &[u8; 4] = b"SCRM";

fn tracker_name(cwtv: u16) -> &'static str {
    if cwtv == 0x4100 {
        return "BeRoTracker";
    }
    match cwtv >> 12 {
        1 => "Scream Tracker 3",
        2 => "Imago Orpheus",
        3 => "Impulse Tracker",
        4 => "Schism Tracker",
        5 => "OpenMPT",
        6 => "BeRoTracker",
        7 => "CreamTracker",
        _ => "unknown tracker",
    }
}

pub struct S3mHandler;

impl FormatHandler for S3mHandler {
    fn name(&self) -> &'static str {
        "Scream Tracker 3"
    }

    fn tag(&self) -> &'static str {
        "S3M"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        if reader.length() < MAGIC_OFFSET + 4 {
            return Err(ParseError::NotRecognized);
        }
        let mut probe = reader.fork_at(MAGIC_OFFSET);
        let mut magic = [0u8; 4];
        probe.read_bytes_into(&mut magic).map_err(|_| ParseError::NotRecognized)?;
        if &magic != MAGIC {
            return Err(ParseError::NotRecognized);
        }

        reader.seek(0)?;
        let mut name = [0u8; 28];
        read_padded(reader, &mut name);
        let _type_byte = reader.read_u8()?;
        let _reserved = reader.read_u16le()?;
        let num_orders = reader.read_u16le()?;
        let num_instruments = reader.read_u16le()?;
        let num_patterns = reader.read_u16le()?;
        let flags = reader.read_u16le()?;
        let cwtv = reader.read_u16le()?;
        let _sample_format = reader.read_u16le()?;
        reader.seek(MAGIC_OFFSET + 4)?;
        let global_volume = reader.read_u8()?;
        let initial_speed = reader.read_u8()? as u16;
        let initial_tempo = reader.read_u8()? as u16;
        let _master_volume = reader.read_u8()?;
        let _ultraclick_removal = reader.read_u8()?;
        let _default_pan_present = reader.read_u8()?;
        let _reserved2 = reader.read_bytes(8)?;
        let _special = reader.read_u16le()?;

        let mut channel_settings = [0u8; 32];
        read_padded(reader, &mut channel_settings);
        let channels = channel_settings.iter().filter(|&&c| c & 0x80 == 0).count();
        if channels == 0 {
            return Err(ParseError::invalid("zero channel count"));
        }

        if num_instruments as usize > 255 {
            // no hard error in the source; recorded as a usage quirk.
        }

        let mut order_bytes = vec![0u8; num_orders as usize];
        if !order_bytes.is_empty() {
            read_padded(reader, &mut order_bytes);
        }

        let mut instrument_parapointers = vec![0u16; num_instruments as usize];
        for p in instrument_parapointers.iter_mut() {
            *p = reader.read_u16le()?;
        }
        let mut pattern_parapointers = vec![0u16; num_patterns as usize];
        for p in pattern_parapointers.iter_mut() {
            *p = reader.read_u16le()?;
        }

        let mut module = Module::new("SCRM", tracker_name(cwtv));
        module.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
        module.channels = channels;
        module.num_orders = num_orders as usize;
        module.num_instruments = num_instruments as usize;
        module.num_patterns = num_patterns as usize;
        module.initial_speed = initial_speed;
        module.initial_tempo = initial_tempo;
        let _ = global_volume;

        module.orders = order_bytes
            .iter()
            .map(|&o| match o {
                255 => crate::model::OrderEntry::EndOfSong,
                254 => crate::model::OrderEntry::Skip,
                n if (n as usize) < num_patterns as usize => crate::model::OrderEntry::Pattern(n as u16),
                n => crate::model::OrderEntry::Invalid(n as u16),
            })
            .collect();

        if num_instruments as usize > 255 {
            module.usage.set(Feature::S3mInstrumentCountOver255);
        }
        if num_patterns as usize > 256 {
            module.usage.set(Feature::S3mPatternCountOver256);
        }
        if num_orders as usize > 256 {
            module.usage.set(Feature::S3mOrderCountOver256);
        }
        let file_len = reader.length();
        let mut any_adlib_channel = false;
        for &c in &channel_settings {
            if c & 0x7f >= 16 && c & 0x80 == 0 {
                any_adlib_channel = true;
            }
        }

        let mut pcm_metas: Vec<S3mPcmMeta> = Vec::new();
        for &para in &instrument_parapointers {
            let offset = (para as usize) << 4;
            if offset > file_len {
                return Err(ParseError::invalid("instrument parapointer out of bounds"));
            }
            if para == 0 {
                module.instruments.push(Instrument::empty(InstrumentKind::Empty));
                continue;
            }
            reader.seek(offset)?;
            let (instrument, meta) = read_instrument(reader, flags)?;
            if let Some(meta) = meta {
                pcm_metas.push(meta);
            }
            module.instruments.push(instrument);
        }

        // ST3 sample-driver and ModPlug fingerprinting, gated on PCM
        // instruments with a non-zero length (`s3m_load.cpp`'s
        // `intgp_min`/`intgp_max` tracking).
        let mut intgp_min: u32 = u16::MAX as u32 + 1;
        let mut intgp_max: u32 = 0;
        for meta in &pcm_metas {
            let gp = meta.int_gp as u32;
            intgp_min = intgp_min.min(gp);
            intgp_max = intgp_max.max(gp);
            if meta.sample_flags & 0x02 != 0 {
                module.usage.set(Feature::S3mStereoSample);
            }
            if meta.sample_flags & 0x04 != 0 {
                module.usage.set(Feature::S3mSixteenBitSample);
            }
            if meta.packing == 4 {
                module.usage.set(Feature::S3mAdpcmSample);
            }
            if meta.high_segment {
                module.usage.set(Feature::S3mHighSampleSegment);
            }
            if cwtv == 0x1320 && (meta.packing == 4 || meta.int_gp == 0) {
                module.usage.set(Feature::S3mModPlug);
            }
        }
        if !pcm_metas.is_empty() && intgp_min >= 1 {
            if intgp_max == 1 {
                module.usage.set(Feature::S3mGpSoundBlaster);
            } else {
                module.usage.set(Feature::S3mGpGravisUltrasound);
            }
        }

        let has_adlib_instrument = module
            .instruments
            .iter()
            .any(|i| i.kind == InstrumentKind::AdLib);
        if has_adlib_instrument {
            if any_adlib_channel {
                module.usage.set(Feature::S3mAdLib);
            } else {
                module.usage.set(Feature::S3mAdLibInstrument);
            }
        }

        for (idx, &para) in pattern_parapointers.iter().enumerate() {
            let offset = (para as usize) << 4;
            if para == 0 || offset >= file_len {
                module.patterns.push(crate::model::Pattern::new(idx, 64, channels));
                continue;
            }
            reader.seek(offset)?;
            let packed_len = reader.read_u16le()? as usize;
            let data = reader.read_bytes(packed_len.saturating_sub(2).min(file_len - offset - 2))?;
            module.patterns.push(decode_s3m_pattern(idx, channels, data));
        }

        Ok(ParsedArtifact::Module(module))
    }

    fn report_global_stats(&self, _reporter: &mut dyn Reporter, _file_count: u64) {}
}

/// Per-PCM-instrument fields needed for the driver/tracker fingerprinting
/// pass, which only runs over samples (not AdLib instruments) that
/// declare a non-zero length.
struct S3mPcmMeta {
    packing: u8,
    int_gp: u16,
    sample_flags: u8,
    high_segment: bool,
}

fn read_instrument(
    reader: &mut ByteReader<'_>,
    module_flags: u16,
) -> Result<(Instrument, Option<S3mPcmMeta>)> {
    let type_byte = reader.read_u8()?;
    let mut dos_name = [0u8; 12];
    read_padded(reader, &mut dos_name);

    let seg_b0 = reader.read_u8()?;
    let seg_b1 = reader.read_u8()?;
    let seg_b2 = reader.read_u8()?;
    let sample_segment = ((seg_b0 as u32) << 16) | ((seg_b2 as u32) << 8) | seg_b1 as u32;

    let length = reader.read_u32le()?;
    let loop_start = reader.read_u32le()?;
    let loop_end = reader.read_u32le()?;
    let default_volume = reader.read_u8()?;
    let _reserved = reader.read_u8()?;
    let packing = reader.read_u8()?;
    let sample_flags = reader.read_u8()?;
    let sample_rate = reader.read_u32le()?;
    let int_gp = reader.read_u16le()?;
    let _int_512 = reader.read_u16le()?;
    let _int_last = reader.read_u32le()?;

    if type_byte == 1 {
        let _ = module_flags;
        let mut instrument = Instrument::empty(InstrumentKind::Sample);
        instrument.file_name_hint = String::from_utf8_lossy(&dos_name).trim_end_matches('\0').to_string();
        instrument.default_volume = default_volume.min(64);
        instrument.length = length;
        instrument.loop_start = loop_start;
        instrument.loop_end = loop_end;
        instrument.loop_kind = if sample_flags & 0x01 != 0 { LoopKind::Forward } else { LoopKind::None };
        instrument.sample_rate = sample_rate;

        let mut display_name = [0u8; 28];
        read_padded(reader, &mut display_name);
        instrument.display_name = String::from_utf8_lossy(&display_name).trim_end_matches('\0').trim().to_string();

        let meta = if length > 0 {
            Some(S3mPcmMeta { packing, int_gp, sample_flags, high_segment: seg_b0 != 0 })
        } else {
            None
        };

        Ok((instrument, meta))
    } else {
        let mut instrument = Instrument::empty(InstrumentKind::AdLib);
        instrument.file_name_hint = String::from_utf8_lossy(&dos_name).trim_end_matches('\0').to_string();
        instrument.default_volume = default_volume.min(64);

        let mut operator_bytes = [0u8; 12];
        operator_bytes[0] = (sample_segment & 0xff) as u8;
        operator_bytes[1] = ((sample_segment >> 8) & 0xff) as u8;
        operator_bytes[2] = (length & 0xff) as u8;
        operator_bytes[3] = ((length >> 8) & 0xff) as u8;
        operator_bytes[4] = ((length >> 16) & 0xff) as u8;
        operator_bytes[5] = ((length >> 24) & 0xff) as u8;
        operator_bytes[6] = (loop_start & 0xff) as u8;
        operator_bytes[7] = ((loop_start >> 8) & 0xff) as u8;
        operator_bytes[8] = (loop_end & 0xff) as u8;
        operator_bytes[9] = ((loop_end >> 8) & 0xff) as u8;
        operator_bytes[10] = 0;
        operator_bytes[11] = 0;
        instrument.adlib = Some(AdLibOperators { bytes: operator_bytes });

        let mut display_name = [0u8; 28];
        read_padded(reader, &mut display_name);
        instrument.display_name = String::from_utf8_lossy(&display_name).trim_end_matches('\0').trim().to_string();

        Ok((instrument, None))
    }
}

fn decode_s3m_pattern(index: usize, channels: usize, data: &[u8]) -> crate::model::Pattern {
    use crate::model::Pattern;
    let rows = 64;
    let mut pattern = Pattern::new(index, rows, channels);
    pattern.packed_bytes = Some(data.len());

    let mut pos = 0usize;
    let mut row = 0usize;
    while row < rows && pos < data.len() {
        let what = data[pos];
        pos += 1;
        if what == 0 {
            row += 1;
            continue;
        }
        let channel = (what & 0x1f) as usize;
        let mut note = 0u8;
        let mut instrument = 0u8;
        let mut volume = 0u8;
        let mut effect = 0u8;
        let mut param = 0u8;

        if what & 0x20 != 0 {
            if pos + 1 >= data.len() {
                break;
            }
            note = data[pos];
            instrument = data[pos + 1];
            pos += 2;
        }
        if what & 0x40 != 0 {
            if pos >= data.len() {
                break;
            }
            volume = data[pos];
            pos += 1;
        }
        if what & 0x80 != 0 {
            if pos + 1 >= data.len() {
                break;
            }
            effect = data[pos];
            param = data[pos + 1];
            pos += 2;
        }

        if channel < channels {
            write_cell(&mut pattern, row, channel, note, instrument, volume, effect, param);
        }
    }

    pattern
}

fn write_cell(
    pattern: &mut crate::model::Pattern,
    row: usize,
    channel: usize,
    note: u8,
    instrument: u8,
    volume: u8,
    effect: u8,
    param: u8,
) {
    let event = pattern.event_mut(row, channel);
    event.note = if note == 255 { 0 } else { note };
    event.instrument = instrument;
    event.volume = volume;
    event.effect = effect;
    event.param = param;
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(S3mHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3m_header_with_instrument(type_byte: u8, length: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 0x60];
        buf[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(MAGIC);
        // num_orders=0 at 0x1F, num_instruments=1 at 0x21, num_patterns=0 at 0x23.
        buf[0x21] = 1;
        // channel_settings at 0x40..0x60: channel 0 enabled, rest disabled.
        buf[0x40] = 0;
        for c in buf[0x41..0x60].iter_mut() {
            *c = 0xff;
        }
        // Instrument parapointer table starts at 0x60 (no order bytes).
        buf.extend_from_slice(&7u16.to_le_bytes()); // para 7 -> byte offset 0x70
        while buf.len() < 0x70 {
            buf.push(0);
        }
        buf.push(type_byte);
        buf.extend_from_slice(&[0u8; 12]); // dos name
        buf.extend_from_slice(&[0u8, 0, 0]); // sample segment
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // loop start
        buf.extend_from_slice(&0u32.to_le_bytes()); // loop end
        buf.push(64); // default volume
        buf.push(0);
        buf.push(0); // packing
        buf.push(0); // sample flags
        buf.extend_from_slice(&8363u32.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&[0u8; 28]); // display name
        buf
    }

    #[test]
    fn rejects_missing_magic() {
        let data = vec![0u8; 0x60];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(S3mHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn pcm_instrument_is_classified_as_sample() {
        let buf = s3m_header_with_instrument(1, 0x1000);
        let mut reader = ByteReader::new(&buf);
        let artifact = S3mHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => {
                assert_eq!(m.instruments.len(), 1);
                assert_eq!(m.instruments[0].kind, InstrumentKind::Sample);
            }
            _ => panic!("expected Module"),
        }
    }

    #[test]
    fn adlib_instrument_is_classified_as_adlib() {
        let buf = s3m_header_with_instrument(2, 0);
        let mut reader = ByteReader::new(&buf);
        let artifact = S3mHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => {
                assert_eq!(m.instruments[0].kind, InstrumentKind::AdLib);
                assert!(m.instruments[0].adlib.is_some());
            }
            _ => panic!("expected Module"),
        }
    }
}
