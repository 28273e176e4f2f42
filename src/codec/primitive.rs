//! Little-endian primitive encode/decode for the aRPC wire format (spec §4.1).
//!
//! Every function pair (`u32`/`read_u32`, ...) mirrors a single primitive.
//! Decoders read from an in-memory slice rather than a stream: a whole
//! message is always buffered before it is parsed, so there is never a
//! partial read to retry (contrast the teacher's `CountBuffer`, which
//! exists because XDR messages arrive interleaved with RPC framing this
//! protocol doesn't have).

use byteorder::{ByteOrder, LittleEndian};

use crate::error::FabricError;

/// Cursor over a decode buffer. Tracks position so call sites read fields
/// in declaration order without re-slicing by hand.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FabricError> {
        if self.buf.len() < self.pos + n {
            return Err(FabricError::invalid("short buffer"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, FabricError> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, FabricError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64, FabricError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn i64(&mut self) -> Result<i64, FabricError> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    pub fn f64(&mut self) -> Result<f64, FabricError> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    pub fn bool(&mut self) -> Result<bool, FabricError> {
        Ok(self.u8()? != 0)
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, FabricError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn string(&mut self) -> Result<String, FabricError> {
        let raw = self.bytes()?;
        String::from_utf8(raw).map_err(|_| FabricError::invalid("invalid utf8"))
    }

    /// Nanoseconds-since-epoch timestamp (spec §4.1).
    pub fn timestamp(&mut self) -> Result<i64, FabricError> {
        self.i64()
    }

    pub fn array<T>(
        &mut self,
        mut elem: impl FnMut(&mut Self) -> Result<T, FabricError>,
    ) -> Result<Vec<T>, FabricError> {
        let count = self.u32()? as usize;
        let mut out = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            out.push(elem(self)?);
        }
        Ok(out)
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn string_map(&mut self) -> Result<Vec<(String, String)>, FabricError> {
        self.array(|d| Ok((d.string()?, d.string()?)))
    }
}

/// Accumulating encoder. Writes into a caller-supplied scratch buffer
/// (normally checked out of [`crate::codec::pool`]) and never reads its own
/// output back.
pub struct Encoder<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u32(&mut self, v: u32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn u64(&mut self, v: u64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_u64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn i64(&mut self, v: i64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_i64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn f64(&mut self, v: f64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_f64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn string(&mut self, v: &str) {
        self.bytes(v.as_bytes());
    }

    pub fn timestamp(&mut self, v: i64) {
        self.i64(v);
    }

    pub fn array<T>(&mut self, items: &[T], mut elem: impl FnMut(&mut Self, &T)) {
        self.u32(items.len() as u32);
        for item in items {
            elem(self, item);
        }
    }

    pub fn string_map(&mut self, items: &[(String, String)]) {
        self.array(items, |enc, (k, v)| {
            enc.string(k);
            enc.string(v);
        });
    }

    pub fn finish(self) -> &'a [u8] {
        self.buf
    }
}

/// Wraps `payload` with the 4-byte little-endian total-length header
/// required by every message on every stream (spec §4.1, §6).
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let total_len = (payload.len() + 4) as u32;
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&total_len.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validates the 4-byte length header against the buffer that follows it
/// (including the header itself), returning the payload slice.
pub fn unframe(buf: &[u8]) -> Result<&[u8], FabricError> {
    if buf.len() < 4 {
        return Err(FabricError::invalid("short buffer"));
    }
    let declared = LittleEndian::read_u32(&buf[..4]) as usize;
    if declared != buf.len() {
        return Err(FabricError::invalid("short buffer"));
    }
    Ok(&buf[4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives() {
        let mut scratch = Vec::new();
        let mut enc = Encoder::new(&mut scratch);
        enc.u32(42);
        enc.u64(u64::MAX);
        enc.i64(-7);
        enc.bool(true);
        enc.string("hello");
        enc.array(&[1u32, 2, 3], |e, v| e.u32(*v));
        let bytes = enc.finish().to_vec();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.u32().unwrap(), 42);
        assert_eq!(dec.u64().unwrap(), u64::MAX);
        assert_eq!(dec.i64().unwrap(), -7);
        assert!(dec.bool().unwrap());
        assert_eq!(dec.string().unwrap(), "hello");
        assert_eq!(dec.array(|d| d.u32()).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn frame_header_matches_total_length() {
        let payload = b"abc".to_vec();
        let framed = frame(&payload);
        assert_eq!(framed.len(), payload.len() + 4);
        assert_eq!(unframe(&framed).unwrap(), &payload[..]);
    }

    #[test]
    fn unframe_rejects_mismatched_length() {
        let mut framed = frame(b"abc");
        framed[0] = 0xff;
        assert!(unframe(&framed).is_err());
    }

    #[test]
    fn decoder_rejects_short_buffer() {
        let mut dec = Decoder::new(&[1, 2]);
        assert!(dec.u32().is_err());
    }
}
