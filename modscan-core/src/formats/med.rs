// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! MED/OctaMED: a header of absolute file offsets (song, block array,
//! sample array, expansion) rather than a stream of sequential records.
//! MMD0 packs each event into 3 bytes with a cramped instrument-number
//! split across two fields; MMD1 widens that to 4 bytes per event and a
//! 16-bit track/row count. MMD2 and MMD3 reuse the MMD1 block and event
//! layout but change how the order list and per-track volumes are
//! stored, which this handler does not attempt to follow.
//!
//! The pre-MMD "MED2"/"MED3"/"MED4" tag family is an older, unrelated
//! on-disk layout with no surviving structural documentation and is
//! reported as an unsupported version rather than guessed at.

use crate::error::{ParseError, Result};
use crate::io::{ByteReader, ReadBytes};
use crate::model::{Instrument, InstrumentKind, LoopKind, Module, OrderEntry, Pattern};
use crate::pattern::PatternBuilder;
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::usage::Feature;

const MAX_BLOCKS: usize = 256;
const MAX_INSTRUMENTS: usize = 63;
const MAX_ORDERS: usize = 256;

struct SampleInfo {
    repeat_start: u16,
    repeat_length: u16,
    midi_channel: u8,
    midi_preset: u8,
    default_volume: u8,
}

pub struct MedHandler;

impl FormatHandler for MedHandler {
    fn name(&self) -> &'static str {
        "MED/OctaMED"
    }

    fn tag(&self) -> &'static str {
        "MED"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let mut magic = [0u8; 4];
        reader.read_bytes_into(&mut magic).map_err(|_| ParseError::NotRecognized)?;

        let mmd_version = match &magic {
            b"MMD0" => 0u8,
            b"MMD1" => 1,
            b"MMD2" => 2,
            b"MMD3" => 3,
            b"MED\x02" | b"MED\x03" | b"MED\x04" => {
                return Err(ParseError::unsupported_version(format!(
                    "old-style MED tag {:?} has no documented block layout",
                    String::from_utf8_lossy(&magic)
                )));
            }
            _ => return Err(ParseError::NotRecognized),
        };

        parse_mmd(reader, &magic, mmd_version)
    }
}

fn parse_mmd(reader: &mut ByteReader<'_>, magic: &[u8; 4], mmd_version: u8) -> Result<ParsedArtifact> {
    let _file_length = reader.read_u32be()?;
    let song_offset = reader.read_u32be()? as usize;
    let _reserved0 = reader.read_u32be()?;
    let block_array_offset = reader.read_u32be()? as usize;
    let _reserved1 = reader.read_u32be()?;
    let sample_array_offset = reader.read_u32be()? as usize;
    let _reserved2 = reader.read_u32be()?;
    let expansion_offset = reader.read_u32be()? as usize;
    let _reserved3 = reader.read_u32be()?;
    let _player_state = reader.read_u16be()?;
    let _player_line = reader.read_u16be()?;
    let _player_sequence = reader.read_u16be()?;
    let _actplayline = reader.read_u16be()?;
    let _counter = reader.read_u8()?;
    let num_extra_songs = reader.read_u8()?;

    let mut module = Module::new(
        String::from_utf8_lossy(magic).to_string(),
        format!("MED/OctaMED MMD{}", mmd_version),
    );
    if mmd_version == 0 {
        module.usage.set(Feature::MedOldPatternLayout);
    }
    if mmd_version >= 2 {
        module.usage.set(Feature::MedUnimplementedTail);
        module.warn("MMD2/MMD3 order list and per-track volume layout parsed using the MMD1 block format");
    }

    reader.seek(song_offset)?;

    let mut samples = Vec::with_capacity(MAX_INSTRUMENTS);
    for _ in 0..MAX_INSTRUMENTS {
        let repeat_start = reader.read_u16be()?;
        let repeat_length = reader.read_u16be()?;
        let midi_channel = reader.read_u8()?;
        let midi_preset = reader.read_u8()?;
        let default_volume = reader.read_u8()?;
        let _transpose = reader.read_i8()?;
        samples.push(SampleInfo { repeat_start, repeat_length, midi_channel, midi_preset, default_volume });
    }

    let num_blocks = reader.read_u16be()? as usize;
    let num_orders = (reader.read_u16be()? as usize).min(MAX_ORDERS);
    let mut orders_raw = [0u8; MAX_ORDERS];
    reader.read_bytes_into(&mut orders_raw)?;
    let default_tempo = reader.read_u16be()?;
    let _song_transpose = reader.read_i8()?;
    let flags = reader.read_u8()?;
    let flags2 = reader.read_u8()?;
    let tempo2 = reader.read_u8()?;
    let mut track_volume = [0u8; 16];
    reader.read_bytes_into(&mut track_volume)?;
    let _song_volume = reader.read_u8()?;
    let num_instruments = reader.read_u8()? as usize;

    if num_blocks > MAX_BLOCKS {
        return Err(ParseError::too_many_blocks(format!("{} blocks exceeds the 256 MED maximum", num_blocks)));
    }
    if num_instruments > MAX_INSTRUMENTS {
        return Err(ParseError::too_many_instruments(format!(
            "{} instruments exceeds the 63 MED maximum",
            num_instruments
        )));
    }

    module.num_orders = num_orders;
    module.orders = orders_raw[..num_orders].iter().map(|&o| OrderEntry::Pattern(o as u16)).collect();
    module.initial_tempo = default_tempo;
    module.initial_speed = tempo2 as u16;

    let is_bpm_mode = flags2 & 0x20 != 0;
    if is_bpm_mode {
        let beat_rows = (flags2 & 0x1f) + 1;
        if beat_rows != 4 {
            module.warn(format!("BPM-mode beat-rows is {} rather than the usual 4", beat_rows));
        }
    } else if (0x01..=0x0a).contains(&default_tempo) {
        module.warn("initial tempo is in the backward-compatible 1-10 BPM range");
    }
    if flags & 0x40 != 0 {
        module.warn("song uses OctaMED 5-8 channel mode");
    }
    if flags & 0x01 != 0 {
        module.warn("song has the resonant filter toggled on by default");
    }
    let _ = track_volume;

    reader.seek(block_array_offset)?;
    let mut pattern_offsets = vec![0usize; num_blocks];
    for slot in pattern_offsets.iter_mut() {
        *slot = reader.read_u32be()? as usize;
    }

    let mut max_tracks = 0usize;
    for &offset in &pattern_offsets {
        if offset == 0 {
            continue;
        }
        reader.seek(offset)?;
        let num_tracks = if mmd_version >= 1 { reader.read_u16be()? as usize } else { reader.read_u8()? as usize };
        max_tracks = max_tracks.max(num_tracks);
    }
    module.channels = max_tracks;

    let mut variable_tracks = false;
    for (i, &offset) in pattern_offsets.iter().enumerate() {
        if offset == 0 {
            module.patterns.push(Pattern::new(i, 0, 0));
            continue;
        }
        reader.seek(offset)?;
        let (num_tracks, num_rows) = if mmd_version >= 1 {
            let nt = reader.read_u16be()? as usize;
            let nr = reader.read_u16be()? as usize + 1;
            let _blockinfo_offset = reader.read_u32be()?;
            (nt, nr)
        } else {
            let nt = reader.read_u8()? as usize;
            let nr = reader.read_u8()? as usize + 1;
            (nt, nr)
        };
        if num_tracks < max_tracks {
            variable_tracks = true;
        }
        if num_rows > 256 {
            module.warn(format!("block {} has {} rows, beyond the usual 256", i, num_rows));
        }

        let mut builder = PatternBuilder::new(i, num_rows, num_tracks);
        for row in 0..num_rows {
            for track in 0..num_tracks {
                let a = reader.read_u8()?;
                let b = reader.read_u8()?;
                let c = reader.read_u8()?;
                let (note, instrument, effect, param) = if mmd_version >= 1 {
                    let d = reader.read_u8()?;
                    (a & 0x7f, b & 0x3f, c, d)
                } else {
                    let note = a & 0x3f;
                    let instrument = ((a & 0x80) >> 3) | ((a & 0x40) >> 1) | ((b & 0xf0) >> 4);
                    (note, instrument, b & 0x0f, c)
                };
                builder.write_event(row, track, note, instrument, 0, (effect, param), &[])?;
            }
        }
        module.patterns.push(builder.finish());
    }
    module.num_patterns = num_blocks;
    if variable_tracks {
        module.warn("blocks do not all share the same track count");
    }

    reader.seek(sample_array_offset)?;
    let mut instrument_offsets = vec![0usize; num_instruments];
    for slot in instrument_offsets.iter_mut() {
        *slot = reader.read_u32be()? as usize;
    }

    for i in 0..num_instruments {
        let sm = &samples[i];
        let mut ins = Instrument::empty(InstrumentKind::Sample);
        ins.default_volume = sm.default_volume.min(64);
        ins.loop_start = sm.repeat_start as u32 * 2;
        ins.loop_end = ins.loop_start + sm.repeat_length as u32 * 2;
        ins.loop_kind = if sm.repeat_length > 0 { LoopKind::Forward } else { LoopKind::None };
        if sm.midi_channel > 0 {
            ins.midi_channel = Some(sm.midi_channel);
            ins.midi_program = Some(sm.midi_preset);
        }

        let offset = instrument_offsets[i];
        if offset == 0 {
            module.instruments.push(ins);
            continue;
        }
        reader.seek(offset)?;
        let length = reader.read_u32be()?;
        let itype = reader.read_u16be()? as i16;
        ins.length = length;

        if itype < 0 {
            ins.kind = InstrumentKind::Synth;
            module.usage.set(Feature::MedExtendedInstrument);
        } else {
            let base_type = itype & 0x07;
            if base_type == 7 {
                module.usage.set(Feature::MedExtendedInstrument);
            } else if base_type >= 1 {
                ins.kind = InstrumentKind::IffOctaved;
                module.usage.set(Feature::MedExtendedInstrument);
            }
            if itype & 0x30 != 0 {
                module.usage.set(Feature::MedExtendedInstrument);
            }
        }
        module.instruments.push(ins);
    }
    module.num_instruments = num_instruments;

    if expansion_offset != 0 {
        reader.seek(expansion_offset)?;
        let nextmod_offset = reader.read_u32be()?;
        let _sample_ext_offset = reader.read_u32be()?;
        let _sample_ext_entries = reader.read_u16be()?;
        let _sample_ext_size = reader.read_u16be()?;
        let _annotation_offset = reader.read_u32be()?;
        let _annotation_length = reader.read_u32be()?;
        let instr_info_offset = reader.read_u32be()? as usize;
        let instr_info_entries = reader.read_u16be()? as usize;
        let instr_info_size = reader.read_u16be()? as usize;

        if num_extra_songs > 0 && nextmod_offset != 0 {
            module.warn("file contains additional songs after this one");
        }

        if instr_info_entries > 0 && instr_info_size >= 40 && instr_info_entries <= MAX_INSTRUMENTS {
            reader.seek(instr_info_offset)?;
            for i in 0..instr_info_entries {
                let name = reader.read_bytes(40)?.to_vec();
                if instr_info_size > 40 {
                    reader.skip(instr_info_size - 40)?;
                }
                if let Some(ins) = module.instruments.get_mut(i) {
                    ins.display_name = String::from_utf8_lossy(&name).trim_end_matches('\0').trim().to_string();
                }
            }
        }
    }

    Ok(ParsedArtifact::Module(module))
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(MedHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_mmd1() -> Vec<u8> {
        const HEADER_LEN: usize = 50;
        const SONG_LEN: usize = 63 * 8 + 2 + 2 + 256 + 2 + 1 + 1 + 1 + 1 + 16 + 1 + 1;

        let song_offset = HEADER_LEN;
        let block_array_offset = song_offset + SONG_LEN;
        let block_offset = block_array_offset + 4; // one pattern pointer
        let sample_array_offset = block_offset + 8; // 8-byte MMD1 block header, no rows

        let mut buf = Vec::new();
        buf.extend_from_slice(b"MMD1");
        buf.extend_from_slice(&0u32.to_be_bytes()); // file_length
        buf.extend_from_slice(&(song_offset as u32).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // reserved0
        buf.extend_from_slice(&(block_array_offset as u32).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // reserved1
        buf.extend_from_slice(&(sample_array_offset as u32).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // reserved2
        buf.extend_from_slice(&0u32.to_be_bytes()); // expansion_offset
        buf.extend_from_slice(&0u32.to_be_bytes()); // reserved3
        buf.extend_from_slice(&0u16.to_be_bytes()); // player_state
        buf.extend_from_slice(&0u16.to_be_bytes()); // player_line
        buf.extend_from_slice(&0u16.to_be_bytes()); // player_sequence
        buf.extend_from_slice(&0u16.to_be_bytes()); // actplayline
        buf.push(0); // counter
        buf.push(0); // num_extra_songs
        assert_eq!(buf.len(), HEADER_LEN);

        // MMD0song
        buf.extend_from_slice(&[0u8; 63 * 8]); // samples
        buf.extend_from_slice(&1u16.to_be_bytes()); // num_blocks
        buf.extend_from_slice(&1u16.to_be_bytes()); // num_orders
        buf.extend_from_slice(&[0u8; 256]); // orders
        buf.extend_from_slice(&125u16.to_be_bytes()); // default_tempo
        buf.push(0); // transpose
        buf.push(0); // flags
        buf.push(0); // flags2
        buf.push(6); // tempo2
        buf.extend_from_slice(&[0u8; 16]); // track_volume
        buf.push(64); // song_volume
        buf.push(0); // num_instruments
        assert_eq!(buf.len(), block_array_offset);

        // Block array: one pointer.
        buf.extend_from_slice(&(block_offset as u32).to_be_bytes());
        assert_eq!(buf.len(), block_offset);

        // MMD1 block: 1 track, 1 row (stored as 0), no blockinfo.
        buf.extend_from_slice(&1u16.to_be_bytes()); // num_tracks
        buf.extend_from_slice(&0u16.to_be_bytes()); // num_rows - 1
        buf.extend_from_slice(&0u32.to_be_bytes()); // blockinfo_offset
        buf.extend_from_slice(&[0u8; 4]); // one silent MMD1 event
        assert_eq!(buf.len(), sample_array_offset);

        buf
    }

    #[test]
    fn rejects_missing_magic() {
        let data = [0u8; 16];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(MedHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn rejects_old_med_tags_as_unsupported() {
        let mut data = b"MED\x02".to_vec();
        data.extend_from_slice(&[0u8; 16]);
        let mut reader = ByteReader::new(&data);
        assert!(matches!(
            MedHandler.accept_and_parse(&mut reader),
            Err(ParseError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn parses_minimal_mmd1_module() {
        let buf = minimal_mmd1();
        let mut reader = ByteReader::new(&buf);
        let artifact = MedHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => {
                assert_eq!(m.channels, 1);
                assert_eq!(m.num_patterns, 1);
                assert_eq!(m.patterns[0].rows, 1);
                assert!(!m.usage.is_set(Feature::MedOldPatternLayout));
            }
            _ => panic!("expected Module"),
        }
    }
}
