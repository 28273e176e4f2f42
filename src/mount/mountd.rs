//! MOUNT protocol (RFC 1813 appendix I), version 3: just `NULL`, `MNT`,
//! `UMNT` — enough for the `mount -t nfs` client in [`crate::mount::bridge`]
//! to obtain a root filehandle and release it on teardown.

use crate::mount::remote_fs::RemoteFs;
use crate::mount::rpc::{self, CallHeader};
use crate::mount::xdr::{XdrDecoder, XdrEncoder};

pub const MOUNT_PROGRAM: u32 = 100_005;
pub const MOUNT_V3: u32 = 3;

pub const MOUNTPROC3_NULL: u32 = 0;
pub const MOUNTPROC3_MNT: u32 = 1;
pub const MOUNTPROC3_UMNT: u32 = 3;

const MNT3_OK: u32 = 0;
const MNT3ERR_NOENT: u32 = 2;
const AUTH_NONE: u32 = 0;

/// Dispatches one MOUNT3 call, returning the procedure result body.
pub fn dispatch(header: &CallHeader, dec: &mut XdrDecoder<'_>, fs: &dyn RemoteFs) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    match header.procedure {
        MOUNTPROC3_NULL => {}
        MOUNTPROC3_MNT => match dec.string() {
            Ok(_dirpath) => {
                enc.u32(MNT3_OK);
                enc.opaque(&fs.root().to_be_bytes());
                enc.u32(1); // auth flavor count
                enc.u32(AUTH_NONE);
            }
            Err(_) => enc.u32(MNT3ERR_NOENT),
        },
        MOUNTPROC3_UMNT => {
            let _ = dec.string();
            // void result
        }
        _ => {}
    }
    enc.into_vec()
}

pub fn handle_call(header: &CallHeader, dec: &mut XdrDecoder<'_>, fs: &dyn RemoteFs) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    rpc::encode_reply_header(&mut enc, header.xid, rpc::ACCEPT_SUCCESS);
    let mut reply = enc.into_vec();
    reply.extend(dispatch(header, dec, fs));
    reply
}
