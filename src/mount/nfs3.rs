//! A bounded NFSv3 (RFC 1813) procedure set: enough for a read-only backup
//! client to traverse and read a mounted tree. `NULL`, `GETATTR`, `LOOKUP`,
//! `READ`, `READDIR`, `ACCESS`, `FSSTAT`, `FSINFO`, `PATHCONF` are
//! implemented for real; every write-class procedure always answers
//! `NFS3ERR_ROFS`, matching the "does not perform write I/O" boundary.
//! This is not a complete NFSv3 server — there is no READDIRPLUS,
//! READLINK, or SETATTR support — it is the minimal real subset this
//! fabric's own backup-client traversal needs.

use crate::error::FabricError;
use crate::mount::remote_fs::RemoteFs;
use crate::mount::rpc::{self, CallHeader};
use crate::mount::xdr::{XdrDecoder, XdrEncoder};

pub const NFS_PROGRAM: u32 = 100_003;
pub const NFS_V3: u32 = 3;

pub const NFSPROC3_NULL: u32 = 0;
pub const NFSPROC3_GETATTR: u32 = 1;
pub const NFSPROC3_SETATTR: u32 = 2;
pub const NFSPROC3_LOOKUP: u32 = 3;
pub const NFSPROC3_ACCESS: u32 = 4;
pub const NFSPROC3_READLINK: u32 = 5;
pub const NFSPROC3_READ: u32 = 6;
pub const NFSPROC3_WRITE: u32 = 7;
pub const NFSPROC3_CREATE: u32 = 8;
pub const NFSPROC3_MKDIR: u32 = 9;
pub const NFSPROC3_SYMLINK: u32 = 10;
pub const NFSPROC3_MKNOD: u32 = 11;
pub const NFSPROC3_REMOVE: u32 = 12;
pub const NFSPROC3_RMDIR: u32 = 13;
pub const NFSPROC3_RENAME: u32 = 14;
pub const NFSPROC3_LINK: u32 = 15;
pub const NFSPROC3_READDIR: u32 = 16;
pub const NFSPROC3_READDIRPLUS: u32 = 17;
pub const NFSPROC3_FSSTAT: u32 = 18;
pub const NFSPROC3_FSINFO: u32 = 19;
pub const NFSPROC3_PATHCONF: u32 = 20;
pub const NFSPROC3_COMMIT: u32 = 21;

pub const NFS3_OK: u32 = 0;
pub const NFS3ERR_PERM: u32 = 1;
pub const NFS3ERR_NOENT: u32 = 2;
pub const NFS3ERR_IO: u32 = 5;
pub const NFS3ERR_ACCES: u32 = 13;
pub const NFS3ERR_NOTDIR: u32 = 20;
pub const NFS3ERR_ROFS: u32 = 30;
pub const NFS3ERR_NOTSUPP: u32 = 10_004;

pub const NF3REG: u32 = 1;
pub const NF3DIR: u32 = 2;

const ACCESS_READ: u32 = 0x0001;
const ACCESS_LOOKUP: u32 = 0x0002;
const ACCESS_EXECUTE: u32 = 0x0020;

/// Platform-neutral attributes translated from [`crate::agentfs::types::AgentFileInfo`].
#[derive(Debug, Clone, Copy)]
pub struct FileAttr {
    pub is_dir: bool,
    pub mode: u32,
    pub size: u64,
    pub fileid: u64,
    pub mtime_ns: i64,
}

impl FileAttr {
    fn encode(&self, enc: &mut XdrEncoder) {
        enc.u32(if self.is_dir { NF3DIR } else { NF3REG });
        enc.u32(self.mode & 0o7777);
        enc.u32(1); // nlink
        enc.u32(0); // uid
        enc.u32(0); // gid
        enc.u64(self.size);
        enc.u64(self.size); // used
        enc.u32(0); // rdev.specdata1
        enc.u32(0); // rdev.specdata2
        enc.u64(0); // fsid
        enc.u64(self.fileid);
        encode_nfstime(enc, self.mtime_ns); // atime
        encode_nfstime(enc, self.mtime_ns); // mtime
        encode_nfstime(enc, self.mtime_ns); // ctime
    }
}

fn encode_nfstime(enc: &mut XdrEncoder, ns: i64) {
    let ns = ns.max(0) as u64;
    enc.u32((ns / 1_000_000_000) as u32);
    enc.u32((ns % 1_000_000_000) as u32);
}

fn encode_post_op_attr(enc: &mut XdrEncoder, attr: Option<&FileAttr>) {
    match attr {
        Some(attr) => {
            enc.bool(true);
            attr.encode(enc);
        }
        None => enc.bool(false),
    }
}

/// `wcc_data`: pre-op and post-op attributes around a mutation. This
/// listener never mutates, so both sides are always absent.
fn encode_empty_wcc_data(enc: &mut XdrEncoder) {
    enc.bool(false); // pre_op_attr
    enc.bool(false); // post_op_attr
}

fn decode_handle(dec: &mut XdrDecoder<'_>) -> Result<u64, FabricError> {
    let bytes = dec.opaque()?;
    if bytes.len() != 8 {
        return Err(FabricError::invalid("malformed file handle"));
    }
    Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
}

fn encode_handle(enc: &mut XdrEncoder, id: u64) {
    enc.opaque(&id.to_be_bytes());
}

fn kind_to_nfsstat(err: &FabricError) -> u32 {
    use crate::error::ErrorKind;
    match err.kind {
        ErrorKind::NotFound => NFS3ERR_NOENT,
        ErrorKind::PermissionDenied => NFS3ERR_ACCES,
        ErrorKind::Invalid => NFS3ERR_NOTDIR,
        ErrorKind::Unsupported => NFS3ERR_NOTSUPP,
        _ => NFS3ERR_IO,
    }
}

/// Dispatches one decoded NFS3 call against `fs`, returning the procedure
/// result body (the caller has already written the RPC reply header).
pub async fn dispatch(
    header: &CallHeader,
    dec: &mut XdrDecoder<'_>,
    fs: &dyn RemoteFs,
) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    match header.procedure {
        NFSPROC3_NULL => {}
        NFSPROC3_GETATTR => match decode_handle(dec).and_then(|id| Ok((id, fs))) {
            Ok((id, fs)) => match fs.getattr(id).await {
                Ok(attr) => {
                    enc.u32(NFS3_OK);
                    attr.encode(&mut enc);
                }
                Err(err) => enc.u32(kind_to_nfsstat(&err)),
            },
            Err(err) => enc.u32(kind_to_nfsstat(&err)),
        },
        NFSPROC3_LOOKUP => match decode_handle(dec).and_then(|dir| Ok((dir, dec.string()?))) {
            Ok((dir, name)) => match fs.lookup(dir, &name).await {
                Ok((id, attr)) => {
                    enc.u32(NFS3_OK);
                    encode_handle(&mut enc, id);
                    encode_post_op_attr(&mut enc, Some(&attr));
                    encode_post_op_attr(&mut enc, None); // dir_attributes
                }
                Err(err) => {
                    enc.u32(kind_to_nfsstat(&err));
                    encode_post_op_attr(&mut enc, None);
                }
            },
            Err(err) => enc.u32(kind_to_nfsstat(&err)),
        },
        NFSPROC3_ACCESS => match decode_handle(dec).and_then(|id| Ok((id, dec.u32()?))) {
            Ok((id, requested)) => match fs.getattr(id).await {
                Ok(attr) => {
                    enc.u32(NFS3_OK);
                    encode_post_op_attr(&mut enc, Some(&attr));
                    // read-only export: grant only read/lookup/execute bits.
                    enc.u32(requested & (ACCESS_READ | ACCESS_LOOKUP | ACCESS_EXECUTE));
                }
                Err(err) => {
                    enc.u32(kind_to_nfsstat(&err));
                    encode_post_op_attr(&mut enc, None);
                }
            },
            Err(err) => enc.u32(kind_to_nfsstat(&err)),
        },
        NFSPROC3_READ => match decode_handle(dec).and_then(|id| Ok((id, dec.u64()?, dec.u32()?))) {
            Ok((id, offset, count)) => match fs.read(id, offset, count).await {
                Ok((bytes, eof)) => {
                    enc.u32(NFS3_OK);
                    encode_post_op_attr(&mut enc, None);
                    enc.u32(bytes.len() as u32);
                    enc.bool(eof);
                    enc.opaque(&bytes);
                }
                Err(err) => {
                    enc.u32(kind_to_nfsstat(&err));
                    encode_post_op_attr(&mut enc, None);
                }
            },
            Err(err) => enc.u32(kind_to_nfsstat(&err)),
        },
        NFSPROC3_READDIR => match decode_handle(dec).and_then(|id| {
            let _cookie = dec.u64()?;
            let _cookieverf = dec.fixed_opaque(8)?;
            let _count = dec.u32()?;
            Ok(id)
        }) {
            Ok(id) => match fs.readdir(id).await {
                Ok(entries) => {
                    enc.u32(NFS3_OK);
                    encode_post_op_attr(&mut enc, None);
                    enc.fixed_opaque(&[0u8; 8]); // cookieverf
                    for (cookie, (fileid, name)) in entries.iter().enumerate() {
                        enc.bool(true); // another entry follows
                        enc.u64(*fileid);
                        enc.string(name);
                        enc.u64(cookie as u64 + 1);
                    }
                    enc.bool(false); // no more entries
                    enc.bool(true); // eof: whole directory returned in one call
                }
                Err(err) => {
                    enc.u32(kind_to_nfsstat(&err));
                    encode_post_op_attr(&mut enc, None);
                }
            },
            Err(err) => enc.u32(kind_to_nfsstat(&err)),
        },
        NFSPROC3_FSSTAT => match decode_handle(dec) {
            Ok(id) => match fs.statfs(id).await {
                Ok(stat) => {
                    enc.u32(NFS3_OK);
                    encode_post_op_attr(&mut enc, None);
                    let block = stat.block_size.max(1) as u64;
                    enc.u64(stat.blocks_total * block);
                    enc.u64(stat.blocks_free * block);
                    enc.u64(stat.blocks_avail * block);
                    enc.u64(stat.inodes_total);
                    enc.u64(stat.inodes_free);
                    enc.u64(stat.inodes_free);
                    enc.u32(0); // invarsec
                }
                Err(err) => {
                    enc.u32(kind_to_nfsstat(&err));
                    encode_post_op_attr(&mut enc, None);
                }
            },
            Err(err) => enc.u32(kind_to_nfsstat(&err)),
        },
        NFSPROC3_FSINFO => match decode_handle(dec) {
            Ok(_id) => {
                enc.u32(NFS3_OK);
                encode_post_op_attr(&mut enc, None);
                const MAX_IO: u32 = 1 << 20;
                enc.u32(MAX_IO); // rtmax
                enc.u32(MAX_IO); // rtpref
                enc.u32(4096); // rtmult
                enc.u32(MAX_IO); // wtmax
                enc.u32(MAX_IO); // wtpref
                enc.u32(4096); // wtmult
                enc.u32(MAX_IO); // dtpref
                enc.u64(u64::MAX >> 1); // maxfilesize
                encode_nfstime(&mut enc, 1_000_000_000); // time_delta: 1s
                enc.u32(0x1 | 0x8); // FSF3_LINK unset, FSF3_SYMLINK unset, HOMOGENEOUS|CANSETTIME-ish flags kept minimal
            }
            Err(err) => enc.u32(kind_to_nfsstat(&err)),
        },
        NFSPROC3_PATHCONF => match decode_handle(dec) {
            Ok(_id) => {
                enc.u32(NFS3_OK);
                encode_post_op_attr(&mut enc, None);
                enc.u32(1); // linkmax
                enc.u32(255); // name_max
                enc.bool(true); // no_trunc
                enc.bool(true); // chown_restricted
                enc.bool(false); // case_insensitive
                enc.bool(true); // case_preserving
            }
            Err(err) => enc.u32(kind_to_nfsstat(&err)),
        },
        NFSPROC3_WRITE
        | NFSPROC3_CREATE
        | NFSPROC3_MKDIR
        | NFSPROC3_SYMLINK
        | NFSPROC3_MKNOD
        | NFSPROC3_REMOVE
        | NFSPROC3_RMDIR
        | NFSPROC3_RENAME
        | NFSPROC3_LINK
        | NFSPROC3_COMMIT
        | NFSPROC3_SETATTR => {
            enc.u32(NFS3ERR_ROFS);
            encode_empty_wcc_data(&mut enc);
        }
        NFSPROC3_READLINK | NFSPROC3_READDIRPLUS => {
            enc.u32(NFS3ERR_NOTSUPP);
            encode_post_op_attr(&mut enc, None);
        }
        _ => {
            enc.u32(NFS3ERR_NOTSUPP);
        }
    }
    enc.into_vec()
}

/// Encodes a full RPC reply (header + procedure body) for one NFS3 call,
/// used by [`crate::mount::bridge`]'s connection loop.
pub async fn handle_call(header: &CallHeader, dec: &mut XdrDecoder<'_>, fs: &dyn RemoteFs) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    rpc::encode_reply_header(&mut enc, header.xid, rpc::ACCEPT_SUCCESS);
    let mut reply = enc.into_vec();
    reply.extend(dispatch(header, dec, fs).await);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_attr_encodes_expected_type_bit() {
        let attr = FileAttr { is_dir: true, mode: 0o755, size: 0, fileid: 2, mtime_ns: 0 };
        let mut enc = XdrEncoder::new();
        attr.encode(&mut enc);
        let bytes = enc.into_vec();
        let mut dec = XdrDecoder::new(&bytes);
        assert_eq!(dec.u32().unwrap(), NF3DIR);
    }

    #[test]
    fn handle_round_trips() {
        let mut enc = XdrEncoder::new();
        encode_handle(&mut enc, 0xdead_beef);
        let bytes = enc.into_vec();
        let mut dec = XdrDecoder::new(&bytes);
        assert_eq!(decode_handle(&mut dec).unwrap(), 0xdead_beef);
    }
}
