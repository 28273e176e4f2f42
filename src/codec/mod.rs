//! Binary codec (spec §4.1, C1): length-prefixed primitive encode/decode,
//! pooled scratch buffers, and the `Request`/`Response` wire envelope.

pub mod envelope;
pub mod pool;
pub mod primitive;

pub use envelope::{DirectBufferHeader, Request, Response};
pub use pool::{BufferPool, PooledBuffer};
pub use primitive::{frame, unframe, Decoder, Encoder};
