// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Composable byte- and bit-level I/O over an in-memory buffer.
//!
//! Every format handler in this crate works over a single backing byte
//! slice rather than a generic `std::io::Read` source: inputs here are
//! whole files, loaded once, and every handler needs arbitrary seeking
//! (parapointer tables, nested chunk offsets, merge-group slicing), so a
//! slice-backed reader is simpler and faster than buffering a stream.

mod bit_it;
mod bit_lzx;
mod byte_reader;

pub use bit_it::BitReaderIt;
pub use bit_lzx::BitReaderLzx;
pub use byte_reader::ByteReader;

use crate::error::{ParseError, Result};

/// Multi-byte integer reads, bounds-checked against the backing buffer.
///
/// On a short read, an implementation returns `Err` and becomes *sticky
/// EOF*: subsequent reads must fail immediately without attempting to
/// touch the buffer again.
pub trait ReadBytes {
    fn read_u8(&mut self) -> Result<u8>;
    fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    fn read_u16le(&mut self) -> Result<u16>;
    fn read_u16be(&mut self) -> Result<u16>;
    fn read_i16le(&mut self) -> Result<i16> {
        Ok(self.read_u16le()? as i16)
    }

    fn read_u24le(&mut self) -> Result<u32>;
    fn read_u24be(&mut self) -> Result<u32>;

    fn read_u32le(&mut self) -> Result<u32>;
    fn read_u32be(&mut self) -> Result<u32>;
    fn read_i32le(&mut self) -> Result<i32> {
        Ok(self.read_u32le()? as i32)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&[u8]>;
    fn read_bytes_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let slice = self.read_bytes(buf.len())?;
        buf.copy_from_slice(slice);
        Ok(())
    }

    fn skip(&mut self, n: usize) -> Result<()>;
    fn seek(&mut self, absolute: usize) -> Result<()>;
    fn position(&self) -> usize;
    fn length(&self) -> usize;
    fn at_end(&self) -> bool {
        self.position() >= self.length()
    }
}

/// Reads a fixed-size region into a sized buffer, padding with zero bytes
/// and returning `false` (never an error) if the source is short — the
/// behavior phase 4 of every handler needs for truncated records.
pub fn read_padded(reader: &mut ByteReader<'_>, buf: &mut [u8]) -> bool {
    let available = reader.length().saturating_sub(reader.position());
    let take = available.min(buf.len());
    if take > 0 {
        if let Ok(slice) = reader.read_bytes(take) {
            buf[..take].copy_from_slice(slice);
        }
    }
    for b in &mut buf[take..] {
        *b = 0;
    }
    take == buf.len()
}

pub(crate) fn short_read() -> ParseError {
    ParseError::ReadError("unexpected end of input".into())
}

pub(crate) fn out_of_bounds(what: &str) -> ParseError {
    ParseError::SeekError(format!("{} is out of bounds", what))
}
