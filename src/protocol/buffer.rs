//! Growable frame buffer with cursor-based sequential access.
//!
//! Backed by `bytes::BytesMut` kept sized to capacity, with explicit
//! `position` and `limit` cursors. The buffer is either in write mode
//! (after [`clear`](FrameBuffer::clear): `position` is the write offset,
//! `limit` is the capacity) or in read mode (after
//! [`flip`](FrameBuffer::flip): `position` is the read offset, `limit`
//! marks the end of valid data). All integers are little-endian.
//!
//! Strings are encoded as `len:i32 | utf8 bytes | NUL`, with `len = -1`
//! meaning null; the length excludes the terminator but the NUL is always
//! present for non-null strings. Blobs are `len:i32 | raw bytes` with no
//! terminator.

use bytes::BytesMut;

use crate::error::{Error, Result};

/// Capacity grows in multiples of this block size and never shrinks.
const GROWTH_BLOCK: usize = 1024;

/// Growable byte buffer with write/read cursor discipline.
pub struct FrameBuffer {
    /// Backing store, always `capacity` bytes long.
    buf: BytesMut,
    /// Write offset in write mode, read offset in read mode.
    pos: usize,
    /// Capacity in write mode, end of valid data in read mode.
    limit: usize,
}

impl FrameBuffer {
    /// Create a buffer with the given initial capacity, in write mode.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::zeroed(capacity),
            pos: 0,
            limit: capacity,
        }
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Move the cursor to an absolute offset.
    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Current limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Total capacity of the backing store.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes between the cursor and the limit.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.pos)
    }

    /// Whether any bytes remain between the cursor and the limit.
    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Switch from write mode to read mode: the bytes written so far
    /// become the readable region.
    pub fn flip(&mut self) {
        self.limit = self.pos;
        self.pos = 0;
    }

    /// Reset to an empty write-mode buffer. Capacity is kept.
    pub fn clear(&mut self) {
        self.pos = 0;
        self.limit = self.buf.len();
    }

    /// Move the cursor back to the start, keeping the limit. Used to
    /// re-send an already-encoded request.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Guarantee `n` writable bytes past the cursor, growing capacity in
    /// fixed-size blocks. Existing content is preserved. Write mode only.
    pub fn reserve(&mut self, n: usize) {
        if self.limit - self.pos < n {
            let size = (self.pos + n + GROWTH_BLOCK) / GROWTH_BLOCK * GROWTH_BLOCK;
            self.buf.resize(size, 0);
            self.limit = size;
        }
    }

    /// The bytes written so far (write mode).
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    /// The readable region (read mode): cursor to limit.
    pub fn readable(&self) -> &[u8] {
        &self.buf[self.pos..self.limit]
    }

    /// The writable region past the cursor, for direct socket reads.
    /// Never empty: at least one growth block is reserved first.
    pub fn unfilled(&mut self) -> &mut [u8] {
        if self.remaining() == 0 {
            self.reserve(GROWTH_BLOCK);
        }
        &mut self.buf[self.pos..self.limit]
    }

    /// Record `n` bytes filled into [`unfilled`](Self::unfilled).
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.limit);
        self.pos += n;
    }

    // Write primitives.

    pub fn put_u8(&mut self, v: u8) {
        self.reserve(1);
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.reserve(4);
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    pub fn put_i32(&mut self, v: i32) {
        self.put_u32(v as u32);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.reserve(8);
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }

    pub fn put_i64(&mut self, v: i64) {
        self.put_u64(v as u64);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.put_u64(v.to_bits());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.reserve(v.len());
        self.buf[self.pos..self.pos + v.len()].copy_from_slice(v);
        self.pos += v.len();
    }

    /// Write a length-prefixed, NUL-terminated string. `None` is encoded
    /// as length -1 with no body.
    pub fn put_str(&mut self, v: Option<&str>) {
        match v {
            None => self.put_i32(-1),
            Some(s) => {
                self.put_i32(s.len() as i32);
                self.reserve(s.len() + 1);
                self.put_bytes(s.as_bytes());
                self.put_u8(0);
            }
        }
    }

    /// Write a length-prefixed blob, no terminator.
    pub fn put_blob(&mut self, v: &[u8]) {
        self.put_i32(v.len() as i32);
        self.put_bytes(v);
    }

    // Absolute writes used to patch a reserved header in place. These do
    // not move the cursors.

    pub fn patch_u8_at(&mut self, at: usize, v: u8) {
        self.buf[at] = v;
    }

    pub fn patch_bool_at(&mut self, at: usize, v: bool) {
        self.patch_u8_at(at, v as u8);
    }

    pub fn patch_u32_at(&mut self, at: usize, v: u32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn patch_u64_at(&mut self, at: usize, v: u64) {
        self.buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    // Read primitives. All fail with `Error::Corrupt` instead of reading
    // past the limit.

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(Error::Corrupt(format!(
                "need {} bytes, {} remaining",
                n,
                self.remaining()
            )));
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..start + n])
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? == 1)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    /// Read a length-prefixed string. Returns `None` for the -1 null
    /// marker. Fails on invalid length, missing terminator or bad UTF-8.
    pub fn get_str(&mut self) -> Result<Option<String>> {
        let len = self.get_i32()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(Error::Corrupt(format!("invalid string length: {}", len)));
        }
        let bytes = self.take(len as usize + 1)?;
        if bytes[len as usize] != 0 {
            return Err(Error::Corrupt("string missing NUL terminator".into()));
        }
        let s = std::str::from_utf8(&bytes[..len as usize])
            .map_err(|e| Error::Corrupt(format!("invalid utf-8 in string: {}", e)))?;
        Ok(Some(s.to_owned()))
    }

    /// Read a length-prefixed blob.
    pub fn get_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.get_i32()?;
        if len < 0 {
            return Err(Error::Corrupt(format!("invalid blob length: {}", len)));
        }
        Ok(self.take(len as usize)?.to_vec())
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("pos", &self.pos)
            .field("limit", &self.limit)
            .field("capacity", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let mut buf = FrameBuffer::with_capacity(64);
        buf.put_u8(0xAB);
        buf.put_bool(true);
        buf.put_i32(-5);
        buf.put_u32(7);
        buf.put_i64(-1_000_000_000_000);
        buf.put_u64(u64::MAX);
        buf.put_f64(1.25);

        buf.flip();
        assert_eq!(buf.get_u8().unwrap(), 0xAB);
        assert!(buf.get_bool().unwrap());
        assert_eq!(buf.get_i32().unwrap(), -5);
        assert_eq!(buf.get_u32().unwrap(), 7);
        assert_eq!(buf.get_i64().unwrap(), -1_000_000_000_000);
        assert_eq!(buf.get_u64().unwrap(), u64::MAX);
        assert_eq!(buf.get_f64().unwrap(), 1.25);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buf = FrameBuffer::with_capacity(16);
        buf.put_u32(0x0102_0304);
        assert_eq!(buf.written(), &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_string_round_trip_utf8() {
        let mut buf = FrameBuffer::with_capacity(64);
        buf.put_str(Some("héllo wörld ✓"));
        buf.put_str(None);
        buf.put_str(Some(""));

        buf.flip();
        assert_eq!(buf.get_str().unwrap().as_deref(), Some("héllo wörld ✓"));
        assert_eq!(buf.get_str().unwrap(), None);
        assert_eq!(buf.get_str().unwrap().as_deref(), Some(""));
    }

    #[test]
    fn test_string_wire_format() {
        let mut buf = FrameBuffer::with_capacity(16);
        buf.put_str(Some("ab"));
        // len:i32 (excludes terminator), utf8, NUL
        assert_eq!(buf.written(), &[2, 0, 0, 0, b'a', b'b', 0]);
    }

    #[test]
    fn test_blob_round_trip() {
        let mut buf = FrameBuffer::with_capacity(16);
        buf.put_blob(&[1, 2, 3]);
        buf.flip();
        assert_eq!(buf.get_blob().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_reserve_grows_and_preserves() {
        let mut buf = FrameBuffer::with_capacity(8);
        buf.put_u32(42);
        buf.reserve(4096);
        assert!(buf.capacity() >= 4 + 4096);
        assert_eq!(buf.capacity() % GROWTH_BLOCK, 0);

        buf.put_bytes(&vec![7u8; 4096]);
        buf.flip();
        assert_eq!(buf.get_u32().unwrap(), 42);
    }

    #[test]
    fn test_mode_transitions() {
        let mut buf = FrameBuffer::with_capacity(16);
        buf.put_u32(1);
        buf.put_u32(2);

        buf.flip();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 8);
        assert_eq!(buf.get_u32().unwrap(), 1);

        buf.rewind();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 8);
        assert_eq!(buf.get_u32().unwrap(), 1);

        buf.clear();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), buf.capacity());
    }

    #[test]
    fn test_read_past_limit_fails() {
        let mut buf = FrameBuffer::with_capacity(16);
        buf.put_u8(1);
        buf.flip();
        buf.get_u8().unwrap();
        assert!(buf.get_u32().is_err());
    }

    #[test]
    fn test_truncated_string_fails() {
        let mut buf = FrameBuffer::with_capacity(16);
        buf.put_i32(100); // claims 100 bytes that are not there
        buf.flip();
        assert!(buf.get_str().is_err());
    }

    #[test]
    fn test_unfilled_and_advance() {
        let mut buf = FrameBuffer::with_capacity(8);
        let n = {
            let dst = buf.unfilled();
            dst[0] = 0xEE;
            1
        };
        buf.advance(n);
        assert_eq!(buf.written(), &[0xEE]);

        // Filling to capacity forces growth on the next call.
        buf.advance(7);
        assert!(!buf.unfilled().is_empty());
    }

    #[test]
    fn test_patch_in_place() {
        let mut buf = FrameBuffer::with_capacity(32);
        buf.set_position(14);
        buf.put_u8(0xFF);
        buf.patch_u32_at(0, 15);
        buf.patch_u8_at(4, 4);
        buf.patch_bool_at(5, true);
        buf.patch_u64_at(6, 99);

        buf.flip();
        assert_eq!(buf.get_u32().unwrap(), 15);
        assert_eq!(buf.get_u8().unwrap(), 4);
        assert!(buf.get_bool().unwrap());
        assert_eq!(buf.get_u64().unwrap(), 99);
        assert_eq!(buf.get_u8().unwrap(), 0xFF);
    }
}
