//! The `Request`/`Response` message envelope (spec §3, §6).

use std::collections::BTreeMap;

use crate::codec::primitive::{frame, unframe, Decoder, Encoder};
use crate::error::{ErrorKind, FabricError};

/// Recognized request header requesting the direct-buffer streaming
/// protocol instead of a plain structured response (spec §3, §4.3).
pub const HEADER_DIRECT_BUFFER: &str = "X-Direct-Buffer";

/// A structured method invocation. Immutable once built — call sites
/// construct a fresh `Request` per call rather than mutating one in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(method: impl Into<String>, payload: Vec<u8>) -> Self {
        Self { method: method.into(), headers: BTreeMap::new(), payload }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn direct_buffer(mut self) -> Self {
        self.headers.insert(HEADER_DIRECT_BUFFER.to_string(), "true".to_string());
        self
    }

    pub fn wants_direct_buffer(&self) -> bool {
        self.headers.get(HEADER_DIRECT_BUFFER).map(|v| v == "true").unwrap_or(false)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut scratch = Vec::new();
        let mut enc = Encoder::new(&mut scratch);
        enc.string(&self.method);
        let headers: Vec<(String, String)> = self.headers.clone().into_iter().collect();
        enc.string_map(&headers);
        enc.bytes(&self.payload);
        frame(enc.finish())
    }

    pub fn decode(framed: &[u8]) -> Result<Self, FabricError> {
        let payload = unframe(framed)?;
        let mut dec = Decoder::new(payload);
        let method = dec.string()?;
        let headers = dec.string_map()?.into_iter().collect();
        let payload = dec.bytes()?;
        Ok(Self { method, headers, payload })
    }
}

/// Structured response: status code, short message, and opaque payload
/// (spec §3, §6). Status 213 ("direct-buffer stream follows") carries a
/// [`DirectBufferHeader`] as its payload instead of a regular body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u32,
    pub message: String,
    pub data: Vec<u8>,
}

pub const STATUS_OK: u32 = 200;
pub const STATUS_DIRECT_BUFFER: u32 = 213;
pub const STATUS_BAD_REQUEST: u32 = 400;
pub const STATUS_FORBIDDEN: u32 = 403;
pub const STATUS_NOT_FOUND: u32 = 404;
pub const STATUS_INTERNAL: u32 = 500;

impl Response {
    pub fn ok(data: Vec<u8>) -> Self {
        Self { status: STATUS_OK, message: "ok".to_string(), data }
    }

    pub fn error(err: &FabricError) -> Self {
        let mut scratch = Vec::new();
        let mut enc = Encoder::new(&mut scratch);
        enc.string(kind_wire_name(err.kind));
        enc.string(&err.message);
        Self { status: err.kind.status(), message: err.message.clone(), data: enc.finish().to_vec() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut scratch = Vec::new();
        let mut enc = Encoder::new(&mut scratch);
        enc.u32(self.status);
        enc.string(&self.message);
        enc.bytes(&self.data);
        frame(enc.finish())
    }

    pub fn decode(framed: &[u8]) -> Result<Self, FabricError> {
        let payload = unframe(framed)?;
        let mut dec = Decoder::new(payload);
        let status = dec.u32()?;
        let message = dec.string()?;
        let data = dec.bytes()?;
        Ok(Self { status, message, data })
    }

    /// Reconstitutes the typed error carried in `data` for a non-2xx
    /// response, falling back to the human-readable message if the kind
    /// can't be decoded (spec §9, "Error-across-the-wire").
    pub fn into_error(self) -> FabricError {
        let mut dec = Decoder::new(&self.data);
        if let (Ok(kind_str), Ok(message)) = (dec.string(), dec.string()) {
            if let Some(kind) = ErrorKind::parse(&kind_str) {
                return FabricError::new(kind, message);
            }
        }
        FabricError::internal(self.message)
    }
}

fn kind_wire_name(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "not-found",
        ErrorKind::Invalid => "invalid",
        ErrorKind::PermissionDenied => "permission-denied",
        ErrorKind::Io => "io",
        ErrorKind::Timeout => "timeout",
        ErrorKind::Canceled => "canceled",
        ErrorKind::Unsupported => "unsupported",
        ErrorKind::Internal => "invalid",
    }
}

/// Metadata header preceding the raw bytes of a direct-buffer response
/// (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectBufferHeader {
    pub bytes_available: u64,
    pub eof: bool,
}

impl DirectBufferHeader {
    /// Encodes the header as a bare payload (no length-prefix framing of
    /// its own) so it can be embedded directly as a [`Response`]'s `data`.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut scratch = Vec::new();
        let mut enc = Encoder::new(&mut scratch);
        enc.u64(self.bytes_available);
        enc.bool(self.eof);
        enc.finish().to_vec()
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, FabricError> {
        let mut dec = Decoder::new(payload);
        Ok(Self { bytes_available: dec.u64()?, eof: dec.bool()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = Request::new("job-1/ReadAt", vec![1, 2, 3]).direct_buffer();
        let framed = req.encode();
        let decoded = Request::decode(&framed).unwrap();
        assert_eq!(decoded, req);
        assert!(decoded.wants_direct_buffer());
    }

    #[test]
    fn response_round_trips() {
        let resp = Response { status: 200, message: "ok".into(), data: vec![9, 9] };
        let framed = resp.encode();
        assert_eq!(Response::decode(&framed).unwrap(), resp);
    }

    #[test]
    fn error_response_round_trips_kind() {
        let err = FabricError::not_found("no such handle");
        let resp = Response::error(&err);
        assert_eq!(resp.status, 404);
        let framed = resp.encode();
        let decoded = Response::decode(&framed).unwrap();
        let restored = decoded.into_error();
        assert_eq!(restored.kind, err.kind);
        assert_eq!(restored.message, err.message);
    }

    #[test]
    fn direct_buffer_header_round_trips() {
        let header = DirectBufferHeader { bytes_available: 4096, eof: false };
        let payload = header.encode_payload();
        assert_eq!(DirectBufferHeader::decode_payload(&payload).unwrap(), header);
    }

    #[test]
    fn zero_length_eof_header_is_valid_terminal_response() {
        let header = DirectBufferHeader { bytes_available: 0, eof: true };
        let payload = header.encode_payload();
        assert_eq!(DirectBufferHeader::decode_payload(&payload).unwrap(), header);
    }
}
