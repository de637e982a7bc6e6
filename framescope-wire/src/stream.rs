use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::WireError;

/// Growable little-endian output buffer.
///
/// All serialization in the protocol goes through this type; a message is
/// built as one `OutputStream` and handed to the framing layer in one piece.
#[derive(Debug, Default)]
pub struct OutputStream {
    buf: Vec<u8>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        OutputStream {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.write_u8(v).unwrap();
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.write_i8(v).unwrap();
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.write_u16::<LittleEndian>(v).unwrap();
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.write_i16::<LittleEndian>(v).unwrap();
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.write_u32::<LittleEndian>(v).unwrap();
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.write_i32::<LittleEndian>(v).unwrap();
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.write_u64::<LittleEndian>(v).unwrap();
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.write_i64::<LittleEndian>(v).unwrap();
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.write_f32::<LittleEndian>(v).unwrap();
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// `u32 byte_length` followed by raw UTF-8 bytes, no trailing NUL.
    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// `u32 byte_length` (UTF-16 code units × 2) followed by UTF-16 LE.
    pub fn write_wide_str(&mut self, s: &str) {
        let units: Vec<u16> = s.encode_utf16().collect();
        self.write_u32((units.len() * 2) as u32);
        for unit in units {
            self.write_u16(unit);
        }
    }

    /// `u32 byte_length` followed by raw bytes (file attachments).
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }
}

/// Growable input buffer with a read cursor.
///
/// The server appends whatever it drained from the socket and the framing
/// layer consumes whole messages out of the front. Consumed space is
/// reclaimed on append, so a long-lived connection does not grow the buffer
/// beyond one partial frame.
#[derive(Debug, Default)]
pub struct InputStream {
    buf: Vec<u8>,
    pos: usize,
}

impl InputStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        InputStream {
            buf: bytes.to_vec(),
            pos: 0,
        }
    }

    /// Remaining unread bytes.
    pub fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&mut self, bytes: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    pub fn skip(&mut self, count: usize) {
        self.pos = (self.pos + count).min(self.buf.len());
    }

    fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Read a `u32` at `offset` past the cursor without consuming anything.
    pub fn peek_u32(&self, offset: usize) -> Option<u32> {
        let rest = self.remaining();
        if rest.len() < offset + 4 {
            return None;
        }
        Some(LittleEndian::read_u32(&rest[offset..offset + 4]))
    }

    fn take(&mut self, count: usize) -> Result<&[u8], WireError> {
        if self.len() < count {
            return Err(WireError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += count;
        Ok(&self.buf[start..start + count])
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, WireError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_i16(&mut self) -> Result<i16, WireError> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, WireError> {
        Ok(self.take(count)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadUtf8)
    }

    pub fn read_wide_string(&mut self) -> Result<String, WireError> {
        let byte_len = self.read_u32()? as usize;
        if byte_len % 2 != 0 {
            return Err(WireError::UnexpectedEof);
        }
        let bytes = self.take(byte_len)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .collect();
        String::from_utf16(&units).map_err(|_| WireError::BadUtf8)
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut out = OutputStream::new();
        out.write_u8(0xAB);
        out.write_u16(0xCDEF);
        out.write_u32(0xDEAD_BEEF);
        out.write_i32(-7);
        out.write_u64(u64::MAX - 1);
        out.write_i64(-1);
        out.write_f32(1.5);

        let mut input = InputStream::from_bytes(out.as_bytes());
        assert_eq!(input.read_u8().unwrap(), 0xAB);
        assert_eq!(input.read_u16().unwrap(), 0xCDEF);
        assert_eq!(input.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(input.read_i32().unwrap(), -7);
        assert_eq!(input.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(input.read_i64().unwrap(), -1);
        assert_eq!(input.read_f32().unwrap(), 1.5);
        assert!(input.is_empty());
    }

    #[test]
    fn strings_round_trip() {
        let mut out = OutputStream::new();
        out.write_str("UpdateAI");
        out.write_str("");
        out.write_wide_str("Frame β");

        let mut input = InputStream::from_bytes(out.as_bytes());
        assert_eq!(input.read_string().unwrap(), "UpdateAI");
        assert_eq!(input.read_string().unwrap(), "");
        assert_eq!(input.read_wide_string().unwrap(), "Frame β");
    }

    #[test]
    fn string_has_no_trailing_nul() {
        let mut out = OutputStream::new();
        out.write_str("ab");
        assert_eq!(out.as_bytes(), &[2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn short_reads_report_eof() {
        let mut input = InputStream::from_bytes(&[1, 2, 3]);
        assert_eq!(input.read_u32(), Err(WireError::UnexpectedEof));
        // A failed read consumes nothing.
        assert_eq!(input.len(), 3);
    }

    #[test]
    fn append_compacts_consumed_prefix() {
        let mut input = InputStream::new();
        input.append(&[0; 1024]);
        input.skip(1024);
        input.append(&[5]);
        assert_eq!(input.len(), 1);
        assert_eq!(input.buf.len(), 1);
        assert_eq!(input.read_u8().unwrap(), 5);
    }
}
