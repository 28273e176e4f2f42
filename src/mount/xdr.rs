//! Big-endian XDR (RFC 4506) primitives for the loopback NFSv3/MOUNT
//! listener (spec §4.9). A separate codec from [`crate::codec`] on purpose:
//! aRPC is little-endian by this spec's own design (§4.1), while NFS's wire
//! format is fixed by RFC 1813 as big-endian XDR — the two are unrelated
//! protocols that happen to share a host process.

use crate::error::FabricError;

pub struct XdrDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> XdrDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FabricError> {
        if self.buf.len() < self.pos + n {
            return Err(FabricError::invalid("short XDR buffer"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u32(&mut self) -> Result<u32, FabricError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64, FabricError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn bool(&mut self) -> Result<bool, FabricError> {
        Ok(self.u32()? != 0)
    }

    /// Opaque variable-length data: u32 length, data, then padding to a
    /// 4-byte boundary (XDR alignment rule).
    pub fn opaque(&mut self) -> Result<Vec<u8>, FabricError> {
        let len = self.u32()? as usize;
        let data = self.take(len)?.to_vec();
        let pad = (4 - len % 4) % 4;
        self.take(pad)?;
        Ok(data)
    }

    pub fn string(&mut self) -> Result<String, FabricError> {
        String::from_utf8(self.opaque()?).map_err(|_| FabricError::invalid("invalid utf8 in XDR string"))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn fixed_opaque(&mut self, len: usize) -> Result<Vec<u8>, FabricError> {
        Ok(self.take(len)?.to_vec())
    }
}

pub struct XdrEncoder {
    buf: Vec<u8>,
}

impl XdrEncoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn bool(&mut self, v: bool) {
        self.u32(v as u32);
    }

    pub fn opaque(&mut self, data: &[u8]) {
        self.u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        let pad = (4 - data.len() % 4) % 4;
        self.buf.extend(std::iter::repeat(0u8).take(pad));
    }

    pub fn fixed_opaque(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn string(&mut self, v: &str) {
        self.opaque(v.as_bytes());
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for XdrEncoder {
    fn default() -> Self {
        Self::new()
    }
}
