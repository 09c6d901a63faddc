//! Byte codec for protocol packets
//!
//! A [`Packet`] is an owned, growable byte buffer with a read cursor. Writers
//! append little-endian fixed-width values; readers consume from the cursor and
//! fail with [`CodecError::TruncatedPacket`] rather than reading past the end.
//!
//! Format of composite values:
//! - string: `[i32 length][bytes]`
//! - blob: `[i32 length][bytes]`
//! - vec2/vec3/quat: consecutive f32 components (quat order x, y, z, w)
//! - bool: one byte, 0 or 1

use crate::util::{Quat, Vec2, Vec3};

/// Errors raised while decoding a packet
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Truncated packet: needed {needed} bytes at offset {offset}, buffer holds {len}")]
    TruncatedPacket {
        offset: usize,
        needed: usize,
        len: usize,
    },
    #[error("Negative length prefix: {0}")]
    NegativeLength(i32),
    #[error("String is not valid UTF-8")]
    InvalidString,
    #[error("Invalid {what} tag: {tag}")]
    InvalidTag { what: &'static str, tag: u8 },
}

/// Owned packet buffer with typed writers and a cursor-based reader
///
/// Instances are single-use per logical message: build, send, drop; or
/// receive, read, drop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    buffer: Vec<u8>,
    cursor: usize,
}

impl Packet {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            cursor: 0,
        }
    }

    /// Start an outgoing packet with its packet ID
    pub fn with_id(id: i32) -> Self {
        let mut packet = Self::new();
        packet.write_i32(id);
        packet
    }

    /// Wrap received bytes for reading
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            buffer: bytes,
            cursor: 0,
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Packet ID at the front of the buffer, wherever the cursor is
    pub fn packet_id(&self) -> Option<i32> {
        let bytes: [u8; 4] = self.buffer.get(..4)?.try_into().ok()?;
        Some(i32::from_le_bytes(bytes))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes left between the cursor and the end of the buffer
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    /// Clear contents and rewind the cursor
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
    }

    // ---- writers ----

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    #[inline]
    pub fn write_i16(&mut self, value: i16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(value as u8);
    }

    /// Append raw bytes with no length prefix
    #[inline]
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Append `[i32 length][bytes]`
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_i32(bytes.len() as i32);
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_blob(value.as_bytes());
    }

    pub fn write_vec2(&mut self, value: Vec2) {
        self.write_f32(value.x);
        self.write_f32(value.y);
    }

    pub fn write_vec3(&mut self, value: Vec3) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
    }

    pub fn write_quat(&mut self, value: Quat) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
        self.write_f32(value.w);
    }

    /// Write a one-byte element count, clamping at 255
    ///
    /// Returns the count actually written; callers must emit exactly that many elements.
    pub fn write_count_u8(&mut self, count: usize) -> usize {
        let clamped = count.min(u8::MAX as usize);
        self.write_u8(clamped as u8);
        clamped
    }

    /// Write a two-byte element count, clamping at `i16::MAX`
    pub fn write_count_i16(&mut self, count: usize) -> usize {
        let clamped = count.min(i16::MAX as usize);
        self.write_i16(clamped as i16);
        clamped
    }

    /// Prepend the current buffer length as an i32 at index 0
    pub fn write_length(&mut self) {
        let len = self.buffer.len() as i32;
        self.insert_i32(len);
    }

    /// Prepend an i32 at index 0 (datagram sender header)
    pub fn insert_i32(&mut self, value: i32) {
        self.buffer.splice(0..0, value.to_le_bytes());
    }

    // ---- readers ----

    fn take(&mut self, n: usize) -> Result<&[u8], CodecError> {
        let end = self
            .cursor
            .checked_add(n)
            .filter(|end| *end <= self.buffer.len())
            .ok_or(CodecError::TruncatedPacket {
                offset: self.cursor,
                needed: n,
                len: self.buffer.len(),
            })?;
        let slice = &self.buffer[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    /// Read exactly `n` raw bytes
    pub fn read_raw(&mut self, n: usize) -> Result<Vec<u8>, CodecError> {
        Ok(self.take(n)?.to_vec())
    }

    /// Read an i32 length that must not be negative
    pub fn read_len(&mut self) -> Result<usize, CodecError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(CodecError::NegativeLength(len));
        }
        Ok(len as usize)
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_len()?;
        self.read_raw(len)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidString)
    }

    pub fn read_vec2(&mut self) -> Result<Vec2, CodecError> {
        Ok(Vec2::new(self.read_f32()?, self.read_f32()?))
    }

    pub fn read_vec3(&mut self) -> Result<Vec3, CodecError> {
        Ok(Vec3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    pub fn read_quat(&mut self) -> Result<Quat, CodecError> {
        Ok(Quat::new(
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
        ))
    }

    pub fn read_count_i16(&mut self) -> Result<usize, CodecError> {
        let count = self.read_i16()?;
        if count < 0 {
            return Err(CodecError::NegativeLength(count as i32));
        }
        Ok(count as usize)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_layout_is_little_endian() {
        let mut p = Packet::new();
        p.write_u8(0xAB);
        p.write_i16(-2);
        p.write_i32(0x0403_0201);
        p.write_bool(true);
        assert_eq!(p.as_bytes(), &[0xAB, 0xFE, 0xFF, 1, 2, 3, 4, 1]);
    }

    #[test]
    fn test_read_primitives() {
        let mut p = Packet::new();
        p.write_i64(-9_000_000_000);
        p.write_f32(1.5);
        p.write_str("Village");
        p.write_vec3(Vec3::new(1.0, 2.0, 3.0));
        p.write_quat(Quat::IDENTITY);
        p.write_vec2(Vec2::new(-1.0, 0.5));

        let mut r = Packet::from_bytes(p.into_bytes());
        assert_eq!(r.read_i64().unwrap(), -9_000_000_000);
        assert_eq!(r.read_f32().unwrap(), 1.5);
        assert_eq!(r.read_string().unwrap(), "Village");
        assert_eq!(r.read_vec3().unwrap(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(r.read_quat().unwrap(), Quat::IDENTITY);
        assert_eq!(r.read_vec2().unwrap(), Vec2::new(-1.0, 0.5));
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_string_wire_format() {
        let mut p = Packet::new();
        p.write_str("ab");
        assert_eq!(p.as_bytes(), &[2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn test_truncated_read_fails() {
        let mut p = Packet::from_bytes(vec![1, 2, 3]);
        let err = p.read_i32().unwrap_err();
        assert_eq!(
            err,
            CodecError::TruncatedPacket {
                offset: 0,
                needed: 4,
                len: 3
            }
        );
        // cursor untouched on failure
        assert_eq!(p.cursor(), 0);
        assert_eq!(p.read_u8().unwrap(), 1);
    }

    #[test]
    fn test_string_length_past_end_fails() {
        let mut p = Packet::new();
        p.write_i32(100);
        p.write_raw(b"short");
        let mut r = Packet::from_bytes(p.into_bytes());
        assert!(matches!(
            r.read_string(),
            Err(CodecError::TruncatedPacket { needed: 100, .. })
        ));
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut p = Packet::new();
        p.write_i32(-5);
        let mut r = Packet::from_bytes(p.into_bytes());
        assert_eq!(r.read_blob(), Err(CodecError::NegativeLength(-5)));
    }

    #[test]
    fn test_write_length_prepends() {
        let mut p = Packet::with_id(9);
        p.write_raw(&[1, 2, 3, 4]);
        p.write_length();
        assert_eq!(p.as_bytes(), &[8, 0, 0, 0, 9, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_insert_i32_prepends_header() {
        let mut p = Packet::with_id(3);
        p.write_length();
        p.insert_i32(7);
        assert_eq!(
            p.as_bytes(),
            &[7, 0, 0, 0, 4, 0, 0, 0, 3, 0, 0, 0]
        );
    }

    #[test]
    fn test_packet_id_ignores_cursor() {
        let mut p = Packet::with_id(42);
        p.write_i32(7);
        assert_eq!(p.packet_id(), Some(42));
        p.read_i32().unwrap();
        assert_eq!(p.packet_id(), Some(42));
        assert_eq!(Packet::from_bytes(vec![1, 0]).packet_id(), None);
    }

    #[test]
    fn test_count_clamps() {
        let mut p = Packet::new();
        assert_eq!(p.write_count_u8(300), 255);
        assert_eq!(p.as_bytes(), &[255]);
    }

    #[test]
    fn test_reset() {
        let mut p = Packet::with_id(1);
        p.read_i32().unwrap();
        p.reset();
        assert!(p.is_empty());
        assert_eq!(p.cursor(), 0);
    }
}
