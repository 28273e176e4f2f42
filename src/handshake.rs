//! HTTP/1.1 `Upgrade: tcp` handshake that precedes multiplexing (spec §4.3, §6).
//!
//! Hand-rolled rather than built on an HTTP crate: the exchange is three
//! fixed lines in each direction, and the teacher's whole approach to wire
//! protocols (`parser/primitive.rs`, `parser/read_buffer.rs`) is to parse
//! bytes by hand instead of pulling in a framework for a fixed format.

use std::collections::BTreeMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FabricError;

/// Upgrade path used by both binaries; the spec names no particular value,
/// only the request shape (spec §6), so this crate fixes one.
pub const DEFAULT_UPGRADE_PATH: &str = "/arpc";

/// Identification carried by the client during the upgrade request.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub hostname: String,
    pub agent_version: String,
}

/// Performs the client side of the upgrade: sends the `GET` request and
/// waits for `101 Switching Protocols`. On success the socket is ready to
/// be handed to the multiplexer untouched (spec §4.3).
pub async fn connect_upgrade(
    socket: &mut (impl AsyncRead + AsyncWrite + Unpin),
    path: &str,
    host: &str,
    identity: &ClientIdentity,
) -> Result<(), FabricError> {
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: tcp\r\n\
         Connection: Upgrade\r\n\
         X-PBS-Agent: {}\r\n\
         X-PBS-Plus-Version: {}\r\n\
         \r\n",
        identity.hostname, identity.agent_version
    );
    socket.write_all(request.as_bytes()).await.map_err(FabricError::from)?;
    socket.flush().await.map_err(FabricError::from)?;

    let head = read_header_block(socket).await?;
    let mut lines = head.lines();
    let status_line = lines.next().ok_or_else(|| FabricError::io("empty upgrade response"))?;
    if !status_line.contains("101") {
        return Err(FabricError::io(format!("upgrade rejected: {status_line}")));
    }
    Ok(())
}

/// Result of a successful server-side upgrade accept: identification the
/// client volunteered, which the broker (C10) uses as the registry key.
#[derive(Debug, Clone)]
pub struct AcceptedUpgrade {
    pub hostname: Option<String>,
    pub agent_version: Option<String>,
}

/// Performs the server side of the upgrade: reads the request, validates
/// the `Upgrade`/`Connection` headers, and writes the `101` reply.
pub async fn accept_upgrade(
    socket: &mut (impl AsyncRead + AsyncWrite + Unpin),
) -> Result<AcceptedUpgrade, FabricError> {
    let head = read_header_block(socket).await?;
    let mut lines = head.lines();
    let request_line = lines.next().ok_or_else(|| FabricError::invalid("empty request"))?;
    if !request_line.starts_with("GET ") {
        return Err(FabricError::invalid("expected GET request line"));
    }

    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let upgrade_ok = headers.get("upgrade").map(|v| v.eq_ignore_ascii_case("tcp")).unwrap_or(false);
    let connection_ok =
        headers.get("connection").map(|v| v.eq_ignore_ascii_case("upgrade")).unwrap_or(false);
    if !upgrade_ok || !connection_ok {
        socket
            .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
            .await
            .map_err(FabricError::from)?;
        return Err(FabricError::invalid("missing Upgrade/Connection headers"));
    }

    socket
        .write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\n")
        .await
        .map_err(FabricError::from)?;
    socket.flush().await.map_err(FabricError::from)?;

    Ok(AcceptedUpgrade {
        hostname: headers.get("x-pbs-agent").cloned(),
        agent_version: headers.get("x-pbs-plus-version").cloned(),
    })
}

/// Reads bytes one at a time until the `\r\n\r\n` header terminator,
/// returning everything read as a UTF-8 string (the handshake is always
/// ASCII headers, never a body). Shared with the mount bridge's control
/// listener (`mount::control`), which parses the same fixed HTTP shape.
pub(crate) async fn read_header_block(
    socket: &mut (impl AsyncRead + Unpin),
) -> Result<String, FabricError> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = socket.read(&mut byte).await.map_err(FabricError::from)?;
        if n == 0 {
            return Err(FabricError::io("connection closed during handshake"));
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 16 * 1024 {
            return Err(FabricError::invalid("handshake header too large"));
        }
    }
    String::from_utf8(buf).map_err(|_| FabricError::invalid("non-utf8 handshake header"))
}
