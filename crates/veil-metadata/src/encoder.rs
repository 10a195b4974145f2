//! Image encoding and decoding utilities
//!
//! Low-level little-endian writer and reader used by the module, signature and
//! instruction encoders.

use thiserror::Error;

/// Errors that can occur while decoding an image
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Unexpected end of the image
    #[error("Unexpected end of image at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid UTF-8 string
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// Invalid opcode
    #[error("Invalid opcode {0:#x} at offset {1}")]
    InvalidOpcode(u16, usize),

    /// Invalid element type in a signature
    #[error("Invalid element type {0:#x} at offset {1}")]
    InvalidElementType(u8, usize),

    /// Element count larger than the rest of the image could hold
    #[error("Count {count} exceeds the remaining image at offset {offset}")]
    InvalidCount { count: usize, offset: usize },

    /// Unknown discriminant for a tagged record
    #[error("Invalid {kind} tag {tag} at offset {offset}")]
    InvalidTag {
        kind: &'static str,
        tag: u8,
        offset: usize,
    },
}

/// Writer for the binary image format
pub struct ImageWriter {
    pub(crate) buffer: Vec<u8>,
}

impl ImageWriter {
    /// Create a new writer
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new writer with capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Get the bytes written so far
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get the current offset
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    // ===== Basic Emission =====

    /// Emit a raw byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a boolean as one byte
    pub fn emit_bool(&mut self, value: bool) {
        self.emit_u8(u8::from(value));
    }

    /// Emit a 16-bit unsigned integer (little-endian)
    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit unsigned integer (little-endian)
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit signed integer (little-endian)
    pub fn emit_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit signed integer (little-endian)
    pub fn emit_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit float (little-endian)
    pub fn emit_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit float (little-endian)
    pub fn emit_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a length-prefixed UTF-8 string
    pub fn emit_string(&mut self, value: &str) {
        self.emit_u32(value.len() as u32);
        self.buffer.extend_from_slice(value.as_bytes());
    }

    /// Emit an optional string (presence byte followed by the string)
    pub fn emit_opt_string(&mut self, value: Option<&str>) {
        match value {
            Some(s) => {
                self.emit_u8(1);
                self.emit_string(s);
            }
            None => self.emit_u8(0),
        }
    }

    /// Emit a length-prefixed byte blob
    pub fn emit_blob(&mut self, value: &[u8]) {
        self.emit_u32(value.len() as u32);
        self.buffer.extend_from_slice(value);
    }

    /// Patch a previously emitted u32 value at the given offset
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        let bytes = value.to_le_bytes();
        self.buffer[offset..offset + 4].copy_from_slice(&bytes);
    }
}

impl Default for ImageWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader for the binary image format
pub struct ImageReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> ImageReader<'a> {
    /// Create a new reader
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get the current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get the remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if there are more bytes to read
    pub fn has_more(&self) -> bool {
        self.position < self.buffer.len()
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if count > self.remaining() {
            return Err(DecodeError::UnexpectedEnd(self.position));
        }
        let bytes = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    // ===== Basic Reading =====

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Read a boolean byte
    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a 16-bit unsigned integer (little-endian)
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    /// Read a 32-bit unsigned integer (little-endian)
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Read a 32-bit signed integer (little-endian)
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    /// Read a 64-bit signed integer (little-endian)
    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Read a 32-bit float (little-endian)
    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    /// Read a 64-bit float (little-endian)
    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    /// Read the element count of a table or list.
    ///
    /// Every element takes at least one byte, so a count beyond the remaining
    /// input is rejected before anything is allocated for it.
    pub fn read_count(&mut self) -> Result<usize, DecodeError> {
        let offset = self.position;
        let count = self.read_u32()? as usize;
        if count > self.remaining() {
            return Err(DecodeError::InvalidCount { count, offset });
        }
        Ok(count)
    }

    /// Read a length-prefixed string (u32 length + UTF-8 bytes)
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let start = self.position;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8(start))
    }

    /// Read an optional string
    pub fn read_opt_string(&mut self) -> Result<Option<String>, DecodeError> {
        if self.read_bool()? {
            Ok(Some(self.read_string()?))
        } else {
            Ok(None)
        }
    }

    /// Read a length-prefixed byte blob
    pub fn read_blob(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Read a fixed number of bytes
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, DecodeError> {
        Ok(self.take(count)?.to_vec())
    }

    /// Read a record tag, checking it against the number of known variants
    pub fn read_tag(&mut self, kind: &'static str, variants: u8) -> Result<u8, DecodeError> {
        let offset = self.position;
        let tag = self.read_u8()?;
        if tag >= variants {
            return Err(DecodeError::InvalidTag { kind, tag, offset });
        }
        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_emission() {
        let mut writer = ImageWriter::new();
        writer.emit_u8(0x42);
        writer.emit_u16(0x1234);
        writer.emit_u32(0xABCD_EF01);

        let bytes = writer.buffer();
        assert_eq!(bytes[0], 0x42);
        assert_eq!(bytes[1], 0x34); // Little-endian
        assert_eq!(bytes[2], 0x12);
        assert_eq!(bytes[3], 0x01);
        assert_eq!(bytes[6], 0xAB);
    }

    #[test]
    fn test_reader_primitives() {
        let mut writer = ImageWriter::new();
        writer.emit_u8(0x42);
        writer.emit_u16(0x1234);
        writer.emit_i32(-42);
        writer.emit_i64(-1_000_000_000_000);
        writer.emit_f32(1.5);
        writer.emit_f64(2.25);
        writer.emit_bool(true);

        let mut reader = ImageReader::new(writer.buffer());
        assert_eq!(reader.read_u8().unwrap(), 0x42);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_i32().unwrap(), -42);
        assert_eq!(reader.read_i64().unwrap(), -1_000_000_000_000);
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        assert_eq!(reader.read_f64().unwrap(), 2.25);
        assert!(reader.read_bool().unwrap());
        assert!(!reader.has_more());
    }

    #[test]
    fn test_reader_bounds_checking() {
        let bytes = vec![0x01, 0x02];
        let mut reader = ImageReader::new(&bytes);

        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert!(matches!(
            reader.read_u32(),
            Err(DecodeError::UnexpectedEnd(1))
        ));
    }

    #[test]
    fn test_count_cannot_exceed_remaining_input() {
        let mut writer = ImageWriter::new();
        writer.emit_u32(2);
        writer.emit_u8(7);
        writer.emit_u8(8);
        writer.emit_u32(u32::MAX);

        let mut reader = ImageReader::new(writer.buffer());
        assert_eq!(reader.read_count().unwrap(), 2);
        reader.read_u8().unwrap();
        reader.read_u8().unwrap();
        assert!(matches!(
            reader.read_count(),
            Err(DecodeError::InvalidCount { offset: 6, .. })
        ));
    }

    #[test]
    fn test_strings() {
        let mut writer = ImageWriter::new();
        writer.emit_string("Реrson");
        writer.emit_opt_string(None);
        writer.emit_opt_string(Some("System"));

        let mut reader = ImageReader::new(writer.buffer());
        assert_eq!(reader.read_string().unwrap(), "Реrson");
        assert_eq!(reader.read_opt_string().unwrap(), None);
        assert_eq!(reader.read_opt_string().unwrap().as_deref(), Some("System"));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut writer = ImageWriter::new();
        writer.emit_blob(&[0xFF, 0xFE]);

        let mut reader = ImageReader::new(writer.buffer());
        assert!(matches!(reader.read_string(), Err(DecodeError::InvalidUtf8(4))));
    }

    #[test]
    fn test_invalid_tag() {
        let bytes = vec![7];
        let mut reader = ImageReader::new(&bytes);
        assert!(matches!(
            reader.read_tag("operand", 3),
            Err(DecodeError::InvalidTag { tag: 7, .. })
        ));
    }

    #[test]
    fn test_patch_u32() {
        let mut writer = ImageWriter::new();
        writer.emit_u32(0);
        writer.emit_u8(9);
        writer.patch_u32(0, 0xDEAD_BEEF);

        let mut reader = ImageReader::new(writer.buffer());
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.remaining(), 1);
    }
}
