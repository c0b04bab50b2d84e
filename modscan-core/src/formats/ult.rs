// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ultra Tracker (ULT): the on-disk event stream is column-major (one
//! channel's 64 rows in a row before the next channel starts) and carries
//! its own byte-oriented run-length escape, independent of any pattern
//! packing the other formats use.

use crate::error::{ParseError, Result};
use crate::io::{ByteReader, ReadBytes};
use crate::model::{Instrument, InstrumentKind, LoopKind, Module, OrderEntry};
use crate::pattern::PatternBuilder;
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::usage::Feature;

const MAGIC: &[u8; 14] = b"MAS_UTrack_V00";
const V1_4: u8 = 2;
const V1_5: u8 = 3;
const V1_6: u8 = 4;
const ROWS: usize = 64;
const RLE_ESCAPE: u8 = 0xfc;

pub struct UltHandler;

impl FormatHandler for UltHandler {
    fn name(&self) -> &'static str {
        "Ultra Tracker"
    }

    fn tag(&self) -> &'static str {
        "ULT"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        let mut magic = [0u8; 14];
        reader.read_bytes_into(&mut magic).map_err(|_| ParseError::NotRecognized)?;
        if &magic != MAGIC {
            return Err(ParseError::NotRecognized);
        }
        let version_digit = reader.read_u8()?;
        if !(b'1'..=b'4').contains(&version_digit) {
            return Err(ParseError::unsupported_version(format!(
                "unknown ULT version byte 0x{:02x}",
                version_digit
            )));
        }
        let version = version_digit - b'0';

        let title = reader.read_bytes(32)?.to_vec();
        let mut module = Module::new("ULT", format!("Ultra Tracker V1.{}", version));
        module.display_name = String::from_utf8_lossy(&title).trim_end_matches('\0').trim().to_string();

        let text_length = reader.read_u8()?;
        if version >= V1_4 && text_length != 0 {
            reader.skip(text_length as usize * 32)?;
        }

        let num_samples = reader.read_u8()? as usize;
        for _ in 0..num_samples {
            let sname = reader.read_bytes(32)?.to_vec();
            let filename = reader.read_bytes(12)?.to_vec();
            let loop_start = reader.read_u32le()?;
            let loop_end = reader.read_u32le()?;
            let size_start = reader.read_u32le()?;
            let size_end = reader.read_u32le()?;
            let default_volume = reader.read_u8()?;
            let bidi = reader.read_u8()?;
            let c2speed = if version >= V1_6 { reader.read_u16le()? } else { 0 };
            let finetune = reader.read_i16le()?;

            let length = size_end.saturating_sub(size_start);
            let mut ins = Instrument::empty(InstrumentKind::Sample);
            ins.display_name = String::from_utf8_lossy(&sname).trim_end_matches('\0').trim().to_string();
            ins.file_name_hint = String::from_utf8_lossy(&filename).trim_end_matches('\0').to_string();
            ins.length = length;
            ins.loop_start = loop_start;
            ins.loop_end = loop_end;
            ins.default_volume = default_volume.min(64);
            ins.sample_rate = c2speed as u32;
            ins.finetune = (finetune & 0xff) as i8;
            ins.loop_kind = if bidi & 0x08 != 0 { LoopKind::None } else if loop_end > loop_start { LoopKind::Forward } else { LoopKind::None };

            if bidi & 0x04 != 0 {
                module.usage.set(Feature::UltLoopFlagsVariant);
            }
            if bidi & 0x10 != 0 {
                module.usage.set(Feature::UltLoopFlagsVariant);
            }
            if bidi & 0x80 != 0 {
                module.usage.set(Feature::UltLoopFlagsVariant);
            }
            module.instruments.push(ins);
        }
        module.num_instruments = num_samples;

        let mut orders = [0u8; 256];
        reader.read_bytes_into(&mut orders)?;
        let num_orders = orders.iter().position(|&b| b == 0xff).unwrap_or(256);
        module.num_orders = num_orders;
        module.orders = orders[..num_orders].iter().map(|&o| OrderEntry::Pattern(o as u16)).collect();

        let num_channels = reader.read_u8()? as usize + 1;
        let num_patterns = reader.read_u8()? as usize + 1;
        module.channels = num_channels;

        if version >= V1_5 {
            reader.skip(num_channels)?; // per-channel panning table
        }

        for p in 0..num_patterns {
            let mut builder = PatternBuilder::new(p, ROWS, num_channels).column_major();

            for ch in 0..num_channels {
                let mut row = 0usize;
                while row < ROWS {
                    let a = reader.read_bytes(5)?.to_vec();

                    if a[0] == RLE_ESCAPE {
                        let b = reader.read_bytes(2)?;
                        let note = a[2];
                        let sample = a[3];
                        let fx = a[4];
                        let param2 = b[0];
                        let param1 = b[1];
                        let mut count = a[1] as usize;
                        if count == 0 {
                            count = 1;
                        }
                        let primary = ((fx & 0xf0) >> 4, param1);
                        let secondary = (fx & 0x0f, param2);
                        while count > 0 && row < ROWS {
                            write_event(&mut builder, row, ch, note, sample, primary, secondary)?;
                            row += 1;
                            count -= 1;
                        }
                    } else {
                        let note = a[0];
                        let sample = a[1];
                        let fx = a[2];
                        let param2 = a[3];
                        let param1 = a[4];
                        let primary = ((fx & 0xf0) >> 4, param1);
                        let secondary = (fx & 0x0f, param2);
                        write_event(&mut builder, row, ch, note, sample, primary, secondary)?;
                        row += 1;
                    }
                }
            }
            module.patterns.push(builder.finish());
        }
        module.num_patterns = num_patterns;

        Ok(ParsedArtifact::Module(module))
    }
}

fn write_event(
    builder: &mut PatternBuilder,
    row: usize,
    channel: usize,
    note: u8,
    instrument: u8,
    primary: (u8, u8),
    secondary: (u8, u8),
) -> Result<()> {
    let extras: &[(u8, u8)] = if secondary.0 != 0 || secondary.1 != 0 { &[secondary] } else { &[] };
    builder.write_event(row, channel, note, instrument, 0, primary, extras)
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(UltHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.push(b'1'); // version 1 (V1.0)
        buf.extend_from_slice(&[0u8; 32]); // title
        buf.push(0); // text_length
        buf.push(0); // num_samples
        buf.extend_from_slice(&[0xffu8; 256]); // orders, empty song
        buf.push(0); // num_channels - 1
        buf.push(0); // num_patterns - 1
        // one pattern, one channel, 64 silent rows
        for _ in 0..ROWS {
            buf.extend_from_slice(&[0, 0, 0, 0, 0]);
        }
        buf
    }

    #[test]
    fn rejects_missing_magic() {
        let data = [0u8; 16];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(UltHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn rejects_unknown_version_digit() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.push(b'9');
        let mut reader = ByteReader::new(&buf);
        assert!(matches!(
            UltHandler.accept_and_parse(&mut reader),
            Err(ParseError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn accepts_minimal_module() {
        let buf = minimal();
        let mut reader = ByteReader::new(&buf);
        let artifact = UltHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => {
                assert_eq!(m.channels, 1);
                assert_eq!(m.num_patterns, 1);
                assert_eq!(m.num_orders, 0);
            }
            _ => panic!("expected Module"),
        }
    }

    #[test]
    fn rle_escape_repeats_event_across_rows() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.push(b'1');
        buf.extend_from_slice(&[0u8; 32]);
        buf.push(0);
        buf.push(0);
        buf.extend_from_slice(&[0xffu8; 256]);
        buf.push(0); // num_channels - 1
        buf.push(0); // num_patterns - 1
        // RLE: repeat note 40 for all 64 rows in the one channel.
        buf.extend_from_slice(&[RLE_ESCAPE, 64, 40, 1, 0, 0, 0]);
        let mut reader = ByteReader::new(&buf);
        let artifact = UltHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Module(m) => {
                assert_eq!(m.patterns[0].event(0, 0).note, 40);
                assert_eq!(m.patterns[0].event(63, 0).note, 40);
            }
            _ => panic!("expected Module"),
        }
    }
}
