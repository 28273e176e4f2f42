//! Out-of-band HTTP mount control surface (spec §6, "Out-of-band HTTP mount
//! endpoint"): `POST /plus/mount/<hostname-enc>/<volume-enc>` starts a job's
//! NFS export, `DELETE` on the same path tears it down. Hand-rolled parsing,
//! matching `handshake.rs`'s approach to a fixed, tiny HTTP shape rather than
//! pulling in a framework for two routes.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use whirlwind::ShardMap;

use crate::broker::Broker;
use crate::error::FabricError;
use crate::handshake::read_header_block;
use crate::mount::bridge::{MountBridge, MountHandle};

const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// RFC 4648 base32, unpadded on encode, padding-tolerant on decode (spec §9
/// open question: "preserves base32 for wire compatibility but does not rely
/// on its properties" — so either form round-trips here).
pub fn encode_base32(input: &str) -> String {
    let mut out = String::new();
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in input.as_bytes() {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

pub fn decode_base32(input: &str) -> Result<String, FabricError> {
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    let mut bytes = Vec::new();
    for ch in input.trim_end_matches('=').chars() {
        let upper = ch.to_ascii_uppercase();
        let value = BASE32_ALPHABET
            .iter()
            .position(|&c| c as char == upper)
            .ok_or_else(|| FabricError::invalid("invalid base32 character"))? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            bytes.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    String::from_utf8(bytes).map_err(|_| FabricError::invalid("base32 payload is not utf-8"))
}

/// Tracks mounts started through the control surface so `DELETE` can find
/// the matching [`MountHandle`] to tear down.
pub struct MountControl {
    bridge: MountBridge,
    broker: Arc<Broker>,
    active: ShardMap<String, MountHandle>,
}

impl MountControl {
    pub fn new(bridge: MountBridge, broker: Arc<Broker>) -> Self {
        Self { bridge, broker, active: ShardMap::new() }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), FabricError> {
        loop {
            let (socket, peer) = listener.accept().await.map_err(FabricError::from)?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.serve_one(socket).await {
                    tracing::warn!(%peer, error = %err, "mount control request failed");
                }
            });
        }
    }

    async fn serve_one(&self, mut socket: TcpStream) -> Result<(), FabricError> {
        let head = read_header_block(&mut socket).await?;
        let request_line =
            head.lines().next().ok_or_else(|| FabricError::invalid("empty request"))?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or_else(|| FabricError::invalid("missing method"))?.to_string();
        let path = parts.next().ok_or_else(|| FabricError::invalid("missing path"))?.to_string();

        let result = self.dispatch(&method, &path).await;
        let response = match result {
            Ok(()) => "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_string(),
            Err(err) => {
                let body = err.message.clone();
                format!(
                    "HTTP/1.1 {} {:?}\r\nContent-Length: {}\r\n\r\n{}",
                    err.kind.status(),
                    err.kind,
                    body.len(),
                    body
                )
            }
        };
        socket.write_all(response.as_bytes()).await.map_err(FabricError::from)?;
        socket.flush().await.map_err(FabricError::from)?;
        Ok(())
    }

    async fn dispatch(&self, method: &str, path: &str) -> Result<(), FabricError> {
        let (hostname, volume) = parse_mount_path(path)?;
        let job_id = derive_job_id(&hostname, &volume);
        match method {
            "POST" => self.start(&hostname, &job_id, &volume).await,
            "DELETE" => self.stop(&job_id).await,
            other => Err(FabricError::invalid(format!("unsupported method {other}"))),
        }
    }

    async fn start(&self, hostname: &str, job_id: &str, volume: &str) -> Result<(), FabricError> {
        let handle = self.bridge.prepare(&self.broker, hostname, job_id, volume).await?;
        self.active.insert(job_id.to_string(), handle).await;
        Ok(())
    }

    async fn stop(&self, job_id: &str) -> Result<(), FabricError> {
        let (_, handle) = self
            .active
            .remove(job_id)
            .await
            .ok_or_else(|| FabricError::not_found(format!("no active mount for job {job_id}")))?;
        self.bridge.teardown(&self.broker, handle).await
    }
}

fn parse_mount_path(path: &str) -> Result<(String, String), FabricError> {
    let trimmed = path.trim_start_matches('/');
    let mut segments = trimmed.split('/');
    match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some("plus"), Some("mount"), Some(host_enc), Some(vol_enc)) => {
            Ok((decode_base32(host_enc)?, decode_base32(vol_enc)?))
        }
        _ => Err(FabricError::invalid("expected /plus/mount/<hostname-enc>/<volume-enc>")),
    }
}

/// The control path names `(hostname, volume)`, not a job ID; this crate has
/// no persisted job/target store (spec §1 Non-goal), so the job ID a mount
/// is tracked under is derived deterministically from the pair.
fn derive_job_id(hostname: &str, volume: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' }).collect()
    };
    format!("{}__{}", sanitize(hostname), sanitize(volume))
}
