//! ONC RPC (RFC 5531) record-marking framing and call/reply headers, just
//! enough of it to serve NFSv3 and MOUNT3 over TCP (spec §4.9, §6 "NFS
//! export").

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FabricError;
use crate::mount::xdr::{XdrDecoder, XdrEncoder};

const LAST_FRAGMENT_BIT: u32 = 1 << 31;

/// Reads one complete RPC record, reassembling fragments per the record
/// marking standard (a record may span more than one fragment; this
/// listener only ever receives small NFS/MOUNT calls, but reassembly is
/// still implemented rather than assumed away).
pub async fn read_record<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, FabricError> {
    let mut record = Vec::new();
    loop {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.map_err(FabricError::from)?;
        let marker = u32::from_be_bytes(header);
        let len = (marker & !LAST_FRAGMENT_BIT) as usize;
        let last = marker & LAST_FRAGMENT_BIT != 0;

        let mut fragment = vec![0u8; len];
        stream.read_exact(&mut fragment).await.map_err(FabricError::from)?;
        record.extend_from_slice(&fragment);

        if last {
            return Ok(record);
        }
    }
}

/// Writes `payload` as a single-fragment record.
pub async fn write_record<W: AsyncWrite + Unpin>(stream: &mut W, payload: &[u8]) -> Result<(), FabricError> {
    let marker = LAST_FRAGMENT_BIT | payload.len() as u32;
    stream.write_all(&marker.to_be_bytes()).await.map_err(FabricError::from)?;
    stream.write_all(payload).await.map_err(FabricError::from)?;
    stream.flush().await.map_err(FabricError::from)?;
    Ok(())
}

/// Decoded ONC RPC call header (program/version/procedure plus the xid
/// the reply must echo). Credentials and verifiers are consumed but not
/// inspected — this listener trusts anything arriving on its loopback
/// socket, matching the spec's "no locking, no ACL" posture for the
/// loopback NFS export.
#[derive(Debug, Clone, Copy)]
pub struct CallHeader {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

pub const MSG_TYPE_CALL: u32 = 0;
pub const MSG_TYPE_REPLY: u32 = 1;
pub const REPLY_ACCEPTED: u32 = 0;
pub const ACCEPT_SUCCESS: u32 = 0;
pub const ACCEPT_PROG_UNAVAIL: u32 = 1;
pub const ACCEPT_PROG_MISMATCH: u32 = 2;
pub const ACCEPT_PROC_UNAVAIL: u32 = 3;

/// Parses the call header and leaves `dec` positioned at the start of the
/// procedure-specific arguments.
pub fn decode_call_header(dec: &mut XdrDecoder<'_>) -> Result<CallHeader, FabricError> {
    let xid = dec.u32()?;
    let msg_type = dec.u32()?;
    if msg_type != MSG_TYPE_CALL {
        return Err(FabricError::invalid("expected RPC call"));
    }
    let rpc_vers = dec.u32()?;
    if rpc_vers != 2 {
        return Err(FabricError::invalid("unsupported RPC version"));
    }
    let program = dec.u32()?;
    let version = dec.u32()?;
    let procedure = dec.u32()?;
    skip_opaque_auth(dec)?; // cred
    skip_opaque_auth(dec)?; // verf
    Ok(CallHeader { xid, program, version, procedure })
}

fn skip_opaque_auth(dec: &mut XdrDecoder<'_>) -> Result<(), FabricError> {
    let _flavor = dec.u32()?;
    let _body = dec.opaque()?;
    Ok(())
}

/// Writes the reply header (accepted, null verifier) followed by
/// `accept_stat`; the caller appends procedure-specific results.
pub fn encode_reply_header(enc: &mut XdrEncoder, xid: u32, accept_stat: u32) {
    enc.u32(xid);
    enc.u32(MSG_TYPE_REPLY);
    enc.u32(REPLY_ACCEPTED);
    enc.u32(0); // verifier flavor: AUTH_NONE
    enc.u32(0); // verifier body length
    enc.u32(accept_stat);
}
