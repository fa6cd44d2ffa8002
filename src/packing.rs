//! Little-endian field cursors for the hand-packed metadata formats.

use crate::error::{Result, VdoError};

pub struct FieldWriter<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> FieldWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf[self.offset] = value;
        self.offset += 1;
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf[self.offset..self.offset + 2].copy_from_slice(&value.to_le_bytes());
        self.offset += 2;
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf[self.offset..self.offset + 4].copy_from_slice(&value.to_le_bytes());
        self.offset += 4;
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf[self.offset..self.offset + 8].copy_from_slice(&value.to_le_bytes());
        self.offset += 8;
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        self.offset += bytes.len();
    }

    pub fn skip(&mut self, count: usize) {
        self.offset += count;
    }
}

pub struct FieldReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.offset + count > self.buf.len() {
            return Err(VdoError::CorruptPage(format!(
                "field at offset {} overruns {}-byte buffer",
                self.offset,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        self.take(count)
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.take(count)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut buf = [0u8; 32];
        let mut writer = FieldWriter::new(&mut buf);
        writer.put_u8(0xAB);
        writer.put_u16(0x1234);
        writer.put_u32(0xDEAD_BEEF);
        writer.put_u64(0x0123_4567_89AB_CDEF);
        writer.put_bytes(b"xyz");

        let mut reader = FieldReader::new(&buf);
        assert_eq!(reader.get_u8().unwrap(), 0xAB);
        assert_eq!(reader.get_u16().unwrap(), 0x1234);
        assert_eq!(reader.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.get_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(reader.get_bytes(3).unwrap(), b"xyz");
    }

    #[test]
    fn overrun_is_an_error() {
        let buf = [0u8; 2];
        let mut reader = FieldReader::new(&buf);
        assert!(reader.get_u32().is_err());
    }
}
