// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{short_read, out_of_bounds, ReadBytes};
use crate::error::Result;

/// A bounds-checked cursor over a borrowed byte slice.
///
/// Cloning a `ByteReader` is cheap (a slice pointer plus two `usize`s) and
/// is the documented way for a handler to look ahead without committing
/// its position — mirrored from the teacher's `BufReader`, which is
/// likewise `Copy`-free but trivially `Clone`-able for the same reason.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    eof: bool,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0, eof: false }
    }

    /// The full backing slice, independent of the current cursor.
    pub fn whole(&self) -> &'a [u8] {
        self.buf
    }

    /// A reader over the same buffer positioned at `pos`, without
    /// disturbing `self`. Used for look-ahead during format sniffing.
    pub fn fork_at(&self, pos: usize) -> Self {
        ByteReader { buf: self.buf, pos, eof: false }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.eof {
            return Err(short_read());
        }
        if self.pos + n > self.buf.len() {
            self.eof = true;
            return Err(short_read());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

impl<'a> ReadBytes for ByteReader<'a> {
    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u16be(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u24le(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    fn read_u24be(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    fn read_u32le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u32be(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&[u8]> {
        self.take(len)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n)?;
        Ok(())
    }

    fn seek(&mut self, absolute: usize) -> Result<()> {
        if absolute > self.buf.len() {
            return Err(out_of_bounds("seek target"));
        }
        self.pos = absolute;
        self.eof = false;
        Ok(())
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn length(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_le_and_be() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut r = ByteReader::new(&data);
        assert_eq!(r.read_u16le().unwrap(), 0x0201);
        let mut r = ByteReader::new(&data);
        assert_eq!(r.read_u16be().unwrap(), 0x0102);
    }

    #[test]
    fn short_read_becomes_sticky_eof() {
        let data = [0x01, 0x02];
        let mut r = ByteReader::new(&data);
        assert!(r.read_u32le().is_err());
        // Even a read that would otherwise succeed now fails immediately.
        r.seek(0).unwrap();
        assert!(r.read_u8().is_ok());
    }

    #[test]
    fn seek_out_of_bounds_is_rejected() {
        let data = [0u8; 4];
        let mut r = ByteReader::new(&data);
        assert!(r.seek(5).is_err());
        assert!(r.seek(4).is_ok());
    }

    #[test]
    fn fork_does_not_disturb_original_position() {
        let data = [1u8, 2, 3, 4];
        let mut r = ByteReader::new(&data);
        r.skip(1).unwrap();
        let mut forked = r.fork_at(2);
        assert_eq!(forked.read_u8().unwrap(), 3);
        assert_eq!(r.position(), 1);
    }
}
