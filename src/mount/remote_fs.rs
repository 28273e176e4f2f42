//! Translates NFS3 filehandle-based operations into aRPC calls against a
//! job's `agentfs` method namespace (spec §4.9 step 2: "an in-process NFS
//! module that translates NFS operations into aRPC calls on the same
//! session").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use whirlwind::ShardMap;

use crate::agentfs::types::{
    decode_u64, encode_path_req, encode_u64, AgentFileInfo, OpenFileReq, ReadAtReq, StatFsInfo,
};
use crate::dirreader;
use crate::error::FabricError;
use crate::mount::nfs3::FileAttr;
use crate::session::ClientSession;

const CALL_DEADLINE: Duration = Duration::from_secs(30);
const ROOT_ID: u64 = 1;

#[async_trait]
pub trait RemoteFs: Send + Sync {
    fn root(&self) -> u64;
    async fn getattr(&self, id: u64) -> Result<FileAttr, FabricError>;
    async fn lookup(&self, dir: u64, name: &str) -> Result<(u64, FileAttr), FabricError>;
    async fn read(&self, id: u64, offset: u64, count: u32) -> Result<(Vec<u8>, bool), FabricError>;
    async fn readdir(&self, id: u64) -> Result<Vec<(u64, String)>, FabricError>;
    async fn statfs(&self, id: u64) -> Result<StatFsInfo, FabricError>;
}

/// One job's view translated through its [`ClientSession`]. Holds a path
/// table bridging NFS's opaque-handle model onto the agent FS server's
/// path-and-handle one, plus a lazily populated cache of open agent
/// handles since NFS `READ` carries no open/close lifecycle of its own.
pub struct AgentRemoteFs {
    session: Arc<ClientSession>,
    job_id: String,
    next_id: AtomicU64,
    id_to_path: ShardMap<u64, String>,
    path_to_id: ShardMap<String, u64>,
    open_handles: ShardMap<u64, u64>,
}

impl AgentRemoteFs {
    pub async fn new(session: Arc<ClientSession>, job_id: impl Into<String>) -> Self {
        let this = Self {
            session,
            job_id: job_id.into(),
            next_id: AtomicU64::new(ROOT_ID + 1),
            id_to_path: ShardMap::new(),
            path_to_id: ShardMap::new(),
            open_handles: ShardMap::new(),
        };
        this.id_to_path.insert(ROOT_ID, ".".to_string()).await;
        this.path_to_id.insert(".".to_string(), ROOT_ID).await;
        this
    }

    fn method(&self, verb: &str) -> String {
        format!("{}/{verb}", self.job_id)
    }

    async fn path_for(&self, id: u64) -> Result<String, FabricError> {
        self.id_to_path
            .get(&id)
            .await
            .map(|entry| entry.clone())
            .ok_or_else(|| FabricError::not_found(format!("no such file handle {id}")))
    }

    async fn id_for_path(&self, path: &str) -> u64 {
        if let Some(entry) = self.path_to_id.get(path).await {
            return *entry;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.path_to_id.insert(path.to_string(), id).await;
        self.id_to_path.insert(id, path.to_string()).await;
        id
    }

    async fn call_ok(&self, method: &str, payload: Vec<u8>) -> Result<Vec<u8>, FabricError> {
        let response = self.session.call(method, payload, CALL_DEADLINE).await?;
        if response.status != crate::codec::envelope::STATUS_OK {
            return Err(response.into_error());
        }
        Ok(response.data)
    }

    async fn attr_at(&self, path: &str) -> Result<FileAttr, FabricError> {
        let data = self.call_ok(&self.method("Attr"), encode_path_req(path)).await?;
        let info = AgentFileInfo::decode(&data)?;
        Ok(to_file_attr(&info))
    }

    /// Returns the agent-side handle for `path`, opening and caching it on
    /// first use. The handle is never closed until [`Self::shutdown`].
    async fn handle_for(&self, id: u64, path: &str) -> Result<u64, FabricError> {
        if let Some(entry) = self.open_handles.get(&id).await {
            return Ok(*entry);
        }
        let req = OpenFileReq { path: path.to_string(), flags: 0, perm: 0 };
        let data = self.call_ok(&self.method("OpenFile"), req.encode()).await?;
        let handle = decode_u64(&data)?;
        self.open_handles.insert(id, handle).await;
        Ok(handle)
    }

    pub async fn shutdown(&self) {
        for (_, handle) in self.open_handles.iter().await {
            let _ = self.call_ok(&self.method("Close"), encode_u64(*handle)).await;
        }
    }
}

fn to_file_attr(info: &AgentFileInfo) -> FileAttr {
    FileAttr { is_dir: info.is_dir, mode: info.mode, size: info.size, fileid: 0, mtime_ns: info.mtime_ns }
}

fn child_path(dir_path: &str, name: &str) -> String {
    if dir_path == "." {
        name.to_string()
    } else {
        format!("{dir_path}/{name}")
    }
}

#[async_trait]
impl RemoteFs for AgentRemoteFs {
    fn root(&self) -> u64 {
        ROOT_ID
    }

    async fn getattr(&self, id: u64) -> Result<FileAttr, FabricError> {
        let path = self.path_for(id).await?;
        let mut attr = self.attr_at(&path).await?;
        attr.fileid = id;
        Ok(attr)
    }

    async fn lookup(&self, dir: u64, name: &str) -> Result<(u64, FileAttr), FabricError> {
        let dir_path = self.path_for(dir).await?;
        let path = child_path(&dir_path, name);
        let mut attr = self.attr_at(&path).await?;
        let id = self.id_for_path(&path).await;
        attr.fileid = id;
        Ok((id, attr))
    }

    async fn read(&self, id: u64, offset: u64, count: u32) -> Result<(Vec<u8>, bool), FabricError> {
        let path = self.path_for(id).await?;
        let handle = self.handle_for(id, &path).await?;
        let req = ReadAtReq { handle, offset, length: count };
        let response = self
            .session
            .call_direct_buffer(&self.method("ReadAt"), req.encode(), CALL_DEADLINE)
            .await;
        match response {
            Ok((header, bytes)) => Ok((bytes, header.eof)),
            Err(err) => Err(err),
        }
    }

    async fn readdir(&self, id: u64) -> Result<Vec<(u64, String)>, FabricError> {
        let dir_path = self.path_for(id).await?;
        let data = self.call_ok(&self.method("ReadDir"), encode_path_req(&dir_path)).await?;
        let entries = dirreader::decode_entries(&data)?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = child_path(&dir_path, &entry.name);
            let child_id = self.id_for_path(&path).await;
            out.push((child_id, entry.name));
        }
        Ok(out)
    }

    async fn statfs(&self, _id: u64) -> Result<StatFsInfo, FabricError> {
        let data = self.call_ok(&self.method("StatFS"), Vec::new()).await?;
        StatFsInfo::decode(&data)
    }
}
