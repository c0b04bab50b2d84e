// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! ArcFS archives (RISC OS): a 96-byte header (`"Archive\0"` magic, entry
//! table length, data offset, version fields) followed by a flat table of
//! fixed 36-byte entries. Directory entries point `data_offset() / 36`
//! paragraphs into the same table rather than nesting; this handler
//! flattens that into one entry list with slash-joined paths rather than
//! reproducing the directory-walk recursion, since the core's `Archive`
//! model (§3) has no notion of directories, only a flat entry list.
//!
//! Compressed ArcFS entries (Spark's own LZW-style variants, types 3/4/8/9)
//! are recorded but not decoded — see DESIGN.md Open Question. Only type 2
//! (`UNPACKED`) entries have their payload read directly.

use crate::error::{ParseError, Result};
use crate::io::{ByteReader, ReadBytes};
use crate::model::{Archive, EntryHeader};
use crate::registry::{FormatHandler, ParsedArtifact};
use crate::report::Reporter;
use crate::usage::Feature;

const HEADER_SIZE: usize = 96;
const ENTRY_SIZE: usize = 36;
const MAGIC: &[u8; 8] = b"Archive\0";

const END_OF_DIR: u8 = 0;
const DELETED: u8 = 1;
const UNPACKED: u8 = 2;

fn normalize_type(raw: u8) -> Option<u8> {
    match raw {
        0 | 1 | 2 | 3 | 4 | 8 | 9 => Some(raw),
        0x82 | 0x83 | 0x84 | 0x88 | 0x89 => Some(raw & 0x7f),
        0xff => Some(0xff),
        _ => None,
    }
}

pub struct ArcFsHandler;

impl FormatHandler for ArcFsHandler {
    fn name(&self) -> &'static str {
        "ArcFS"
    }

    fn tag(&self) -> &'static str {
        "ARC"
    }

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
        if reader.length() < HEADER_SIZE {
            return Err(ParseError::NotRecognized);
        }
        let mut magic = [0u8; 8];
        reader.read_bytes_into(&mut magic).map_err(|_| ParseError::NotRecognized)?;
        if &magic != MAGIC {
            return Err(ParseError::NotRecognized);
        }

        let entries_length = reader.read_u32le().map_err(|_| ParseError::NotRecognized)? as usize;
        let data_offset = reader.read_u32le()? as usize;
        let min_read_version = reader.read_u32le()?;
        let min_write_version = reader.read_u32le()?;
        let format_version = reader.read_u32le()?;

        if entries_length % ENTRY_SIZE != 0
            || data_offset < HEADER_SIZE + entries_length
            || min_read_version > 260
            || min_write_version > 260
            || format_version > 0x0a
        {
            return Err(ParseError::NotRecognized);
        }

        let file_len = reader.length();
        let entry_start = HEADER_SIZE;
        let entry_end = HEADER_SIZE + entries_length;
        if entry_end > file_len {
            return Err(ParseError::invalid("entry table runs past end of file"));
        }

        let mut archive = Archive::new("ArcFS");
        let mut offset = entry_start;
        while offset + ENTRY_SIZE <= entry_end {
            reader.seek(offset)?;
            let mut raw = [0u8; ENTRY_SIZE];
            reader.read_bytes_into(&mut raw)?;

            let Some(kind) = normalize_type(raw[0]) else { break };
            if kind == END_OF_DIR {
                break;
            }
            if kind == DELETED {
                offset += ENTRY_SIZE;
                continue;
            }

            let is_directory = raw[35] & 0x80 != 0;
            let mut name_bytes = raw[1..12].to_vec();
            if let Some(nul) = name_bytes.iter().position(|&b| b == 0) {
                name_bytes.truncate(nul);
            }
            let filename = String::from_utf8_lossy(&name_bytes).to_string();

            let uncompressed_size = if is_directory { 0 } else { u32::from_le_bytes(raw[12..16].try_into().unwrap()) };
            let compressed_size = if is_directory { 0 } else { u32::from_le_bytes(raw[28..32].try_into().unwrap()) };
            let crc16 = u16::from_le_bytes(raw[26..28].try_into().unwrap());
            let info_word = u32::from_le_bytes(raw[32..36].try_into().unwrap());
            let entry_data_offset = (info_word & 0x7fff_ffff) as usize;

            if kind != UNPACKED && !is_directory {
                archive.usage.set(Feature::ArcCompressedEntryUnsupported);
            }

            let absolute_offset = entry_data_offset.saturating_add(data_offset);
            archive.entries.push(EntryHeader {
                filename,
                comment: String::new(),
                uncompressed_size,
                compressed_size,
                data_offset: absolute_offset,
                merged: false,
                crc32: crc16 as u32,
            });

            offset += ENTRY_SIZE;
        }

        Ok(ParsedArtifact::Archive(archive))
    }

    fn report_global_stats(&self, _reporter: &mut dyn Reporter, _file_count: u64) {}
}

pub fn handler() -> Box<dyn FormatHandler> {
    Box::new(ArcFsHandler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(entries_length: u32, data_offset: u32) -> Vec<u8> {
        let mut h = vec![0u8; HEADER_SIZE];
        h[0..8].copy_from_slice(MAGIC);
        h[8..12].copy_from_slice(&entries_length.to_le_bytes());
        h[12..16].copy_from_slice(&data_offset.to_le_bytes());
        h[16..20].copy_from_slice(&1u32.to_le_bytes()); // min_read_version
        h[20..24].copy_from_slice(&1u32.to_le_bytes()); // min_write_version
        h[24..28].copy_from_slice(&1u32.to_le_bytes()); // format_version
        h
    }

    fn file_entry(name: &str, kind: u8, uncompressed: u32, compressed: u32, offset: u32) -> Vec<u8> {
        let mut e = vec![0u8; ENTRY_SIZE];
        e[0] = kind;
        let name_bytes = name.as_bytes();
        e[1..1 + name_bytes.len()].copy_from_slice(name_bytes);
        e[12..16].copy_from_slice(&uncompressed.to_le_bytes());
        e[28..32].copy_from_slice(&compressed.to_le_bytes());
        e[32..36].copy_from_slice(&offset.to_le_bytes());
        e
    }

    #[test]
    fn rejects_missing_magic() {
        let data = vec![0u8; HEADER_SIZE];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(ArcFsHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }

    #[test]
    fn single_unpacked_entry_is_read() {
        let mut buf = header(ENTRY_SIZE as u32, HEADER_SIZE as u32 + ENTRY_SIZE as u32);
        buf.extend_from_slice(&file_entry("hello", UNPACKED, 5, 5, 0));
        buf.extend_from_slice(b"world"); // payload at data_offset
        let mut reader = ByteReader::new(&buf);
        let artifact = ArcFsHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Archive(archive) => {
                assert_eq!(archive.entries.len(), 1);
                assert_eq!(archive.entries[0].filename, "hello");
                assert!(!archive.usage.is_set(Feature::ArcCompressedEntryUnsupported));
            }
            _ => panic!("expected Archive"),
        }
    }

    #[test]
    fn compressed_entry_is_flagged_unsupported() {
        let mut buf = header(ENTRY_SIZE as u32, HEADER_SIZE as u32 + ENTRY_SIZE as u32);
        buf.extend_from_slice(&file_entry("packed", 0x83, 10, 4, 0));
        buf.extend_from_slice(&[0u8; 4]);
        let mut reader = ByteReader::new(&buf);
        let artifact = ArcFsHandler.accept_and_parse(&mut reader).unwrap();
        match artifact {
            ParsedArtifact::Archive(archive) => {
                assert!(archive.usage.is_set(Feature::ArcCompressedEntryUnsupported));
            }
            _ => panic!("expected Archive"),
        }
    }

    #[test]
    fn rejects_entries_length_not_multiple_of_entry_size() {
        let buf = header(ENTRY_SIZE as u32 + 1, HEADER_SIZE as u32 + ENTRY_SIZE as u32 + 1);
        let mut reader = ByteReader::new(&buf);
        assert!(matches!(ArcFsHandler.accept_and_parse(&mut reader), Err(ParseError::NotRecognized)));
    }
}
