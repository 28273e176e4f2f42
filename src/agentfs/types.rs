//! Wire request/response structs for the C6 file operation methods (spec §3, §4.6).

use crate::codec::{Decoder, Encoder};
use crate::error::FabricError;

/// `OpenFile` flag bits (spec §4.6: "If any of `{write-only, read-write,
/// append, create, truncate}` bits is set...").
pub const FLAG_WRONLY: u32 = 1 << 0;
pub const FLAG_RDWR: u32 = 1 << 1;
pub const FLAG_APPEND: u32 = 1 << 2;
pub const FLAG_CREATE: u32 = 1 << 3;
pub const FLAG_TRUNC: u32 = 1 << 4;
const WRITE_INTENT_MASK: u32 = FLAG_WRONLY | FLAG_RDWR | FLAG_APPEND | FLAG_CREATE | FLAG_TRUNC;

pub fn has_write_intent(flags: u32) -> bool {
    flags & WRITE_INTENT_MASK != 0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFileReq {
    pub path: String,
    pub flags: u32,
    pub perm: u32,
}

impl OpenFileReq {
    pub fn decode(payload: &[u8]) -> Result<Self, FabricError> {
        let mut dec = Decoder::new(payload);
        Ok(Self { path: dec.string()?, flags: dec.u32()?, perm: dec.u32()? })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut scratch = Vec::new();
        let mut enc = Encoder::new(&mut scratch);
        enc.string(&self.path);
        enc.u32(self.flags);
        enc.u32(self.perm);
        enc.finish().to_vec()
    }
}

pub fn decode_path_req(payload: &[u8]) -> Result<String, FabricError> {
    Decoder::new(payload).string()
}

pub fn encode_path_req(path: &str) -> Vec<u8> {
    let mut scratch = Vec::new();
    let mut enc = Encoder::new(&mut scratch);
    enc.string(path);
    enc.finish().to_vec()
}

/// `FileInfo (attr)` (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentFileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime_ns: i64,
    pub is_dir: bool,
    pub blocks: u64,
}

impl AgentFileInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut scratch = Vec::new();
        let mut enc = Encoder::new(&mut scratch);
        enc.string(&self.name);
        enc.u64(self.size);
        enc.u32(self.mode);
        enc.timestamp(self.mtime_ns);
        enc.bool(self.is_dir);
        enc.u64(self.blocks);
        enc.finish().to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FabricError> {
        let mut dec = Decoder::new(payload);
        Ok(Self {
            name: dec.string()?,
            size: dec.u64()?,
            mode: dec.u32()?,
            mtime_ns: dec.timestamp()?,
            is_dir: dec.bool()?,
            blocks: dec.u64()?,
        })
    }
}

/// `FileInfo (xattr)`: extends attr with the platform-fan-out fields (spec §3, §4.6.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentXattrInfo {
    pub base: AgentFileInfo,
    pub created_ns: i64,
    pub accessed_ns: i64,
    pub written_ns: i64,
    pub attr_flags: Vec<(String, bool)>,
    pub owner: String,
    pub group: String,
    pub win_acl: Vec<String>,
    pub posix_acl: Vec<String>,
}

impl AgentXattrInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut scratch = Vec::new();
        let mut enc = Encoder::new(&mut scratch);
        let base_bytes = self.base.encode();
        enc.bytes(&base_bytes);
        enc.timestamp(self.created_ns);
        enc.timestamp(self.accessed_ns);
        enc.timestamp(self.written_ns);
        enc.array(&self.attr_flags, |enc, (name, set)| {
            enc.string(name);
            enc.bool(*set);
        });
        enc.string(&self.owner);
        enc.string(&self.group);
        enc.array(&self.win_acl, |enc, ace| enc.string(ace));
        enc.array(&self.posix_acl, |enc, ace| enc.string(ace));
        enc.finish().to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FabricError> {
        let mut dec = Decoder::new(payload);
        let base = AgentFileInfo::decode(&dec.bytes()?)?;
        Ok(Self {
            base,
            created_ns: dec.timestamp()?,
            accessed_ns: dec.timestamp()?,
            written_ns: dec.timestamp()?,
            attr_flags: dec.array(|d| Ok((d.string()?, d.bool()?)))?,
            owner: dec.string()?,
            group: dec.string()?,
            win_acl: dec.array(|d| d.string())?,
            posix_acl: dec.array(|d| d.string())?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadAtReq {
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl ReadAtReq {
    pub fn decode(payload: &[u8]) -> Result<Self, FabricError> {
        let mut dec = Decoder::new(payload);
        Ok(Self { handle: dec.u64()?, offset: dec.u64()?, length: dec.u32()? })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut scratch = Vec::new();
        let mut enc = Encoder::new(&mut scratch);
        enc.u64(self.handle);
        enc.u64(self.offset);
        enc.u32(self.length);
        enc.finish().to_vec()
    }
}

/// `Lseek` whence values (spec §4.6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
    Data,
    Hole,
}

impl Whence {
    fn from_u8(v: u8) -> Result<Self, FabricError> {
        Ok(match v {
            0 => Whence::Start,
            1 => Whence::Current,
            2 => Whence::End,
            3 => Whence::Data,
            4 => Whence::Hole,
            other => return Err(FabricError::invalid(format!("unrecognized whence {other}"))),
        })
    }

    fn as_u8(self) -> u8 {
        match self {
            Whence::Start => 0,
            Whence::Current => 1,
            Whence::End => 2,
            Whence::Data => 3,
            Whence::Hole => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LseekReq {
    pub handle: u64,
    pub offset: i64,
    pub whence: Whence,
}

impl LseekReq {
    pub fn decode(payload: &[u8]) -> Result<Self, FabricError> {
        let mut dec = Decoder::new(payload);
        let handle = dec.u64()?;
        let offset = dec.i64()?;
        let whence = Whence::from_u8(dec.u8()?)?;
        Ok(Self { handle, offset, whence })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut scratch = Vec::new();
        let mut enc = Encoder::new(&mut scratch);
        enc.u64(self.handle);
        enc.i64(self.offset);
        enc.u8(self.whence.as_u8());
        enc.finish().to_vec()
    }
}

pub fn encode_u64(v: u64) -> Vec<u8> {
    let mut scratch = Vec::new();
    let mut enc = Encoder::new(&mut scratch);
    enc.u64(v);
    enc.finish().to_vec()
}

pub fn decode_u64(payload: &[u8]) -> Result<u64, FabricError> {
    Decoder::new(payload).u64()
}

pub fn decode_close_req(payload: &[u8]) -> Result<u64, FabricError> {
    decode_u64(payload)
}

/// `StatFS` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFsInfo {
    pub block_size: u32,
    pub blocks_total: u64,
    pub blocks_free: u64,
    pub blocks_avail: u64,
    pub inodes_total: u64,
    pub inodes_free: u64,
    pub max_name_len: u32,
}

impl StatFsInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut scratch = Vec::new();
        let mut enc = Encoder::new(&mut scratch);
        enc.u32(self.block_size);
        enc.u64(self.blocks_total);
        enc.u64(self.blocks_free);
        enc.u64(self.blocks_avail);
        enc.u64(self.inodes_total);
        enc.u64(self.inodes_free);
        enc.u32(self.max_name_len);
        enc.finish().to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FabricError> {
        let mut dec = Decoder::new(payload);
        Ok(Self {
            block_size: dec.u32()?,
            blocks_total: dec.u64()?,
            blocks_free: dec.u64()?,
            blocks_avail: dec.u64()?,
            inodes_total: dec.u64()?,
            inodes_free: dec.u64()?,
            max_name_len: dec.u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_intent_mask_catches_every_named_bit() {
        assert!(has_write_intent(FLAG_WRONLY));
        assert!(has_write_intent(FLAG_RDWR));
        assert!(has_write_intent(FLAG_APPEND));
        assert!(has_write_intent(FLAG_CREATE));
        assert!(has_write_intent(FLAG_TRUNC));
        assert!(!has_write_intent(0));
    }

    #[test]
    fn open_file_req_round_trips() {
        let req = OpenFileReq { path: "a/b.txt".into(), flags: 0, perm: 0o644 };
        assert_eq!(OpenFileReq::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn agent_file_info_round_trips() {
        let info = AgentFileInfo {
            name: "a.txt".into(),
            size: 42,
            mode: 0o644,
            mtime_ns: 123_456,
            is_dir: false,
            blocks: 1,
        };
        assert_eq!(AgentFileInfo::decode(&info.encode()).unwrap(), info);
    }

    #[test]
    fn xattr_info_round_trips() {
        let info = AgentXattrInfo {
            base: AgentFileInfo {
                name: "a.txt".into(),
                size: 42,
                mode: 0o644,
                mtime_ns: 1,
                is_dir: false,
                blocks: 1,
            },
            created_ns: 2,
            accessed_ns: 3,
            written_ns: 4,
            attr_flags: vec![("hidden".into(), false)],
            owner: "1000".into(),
            group: "1000".into(),
            win_acl: vec![],
            posix_acl: vec!["u::rw-".into()],
        };
        assert_eq!(AgentXattrInfo::decode(&info.encode()).unwrap(), info);
    }

    #[test]
    fn lseek_req_round_trips() {
        let req = LseekReq { handle: 7, offset: -1, whence: Whence::End };
        assert_eq!(LseekReq::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn statfs_round_trips() {
        let info = StatFsInfo {
            block_size: 4096,
            blocks_total: 100,
            blocks_free: 50,
            blocks_avail: 50,
            inodes_total: 1 << 20,
            inodes_free: 0,
            max_name_len: 255,
        };
        assert_eq!(StatFsInfo::decode(&info.encode()).unwrap(), info);
    }
}
