//! Agent FS server: per-job read-only file operation handlers over aRPC
//! (spec §4.6, C6). Grounded on the teacher's `examples/shadow_fs`
//! `ShadowFS` — a host-filesystem-backed VFS wrapper with the same
//! path-resolution and attribute-projection shape — generalized from NFS's
//! opaque `FileHandle` to this protocol's namespaced method calls.

mod path;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::FabricError;
use crate::handle_table::HandleTable;
use crate::mode::neutral_mode;
use crate::router::{HandlerReply, Router};
use crate::{dirreader, sparse};

use types::*;

/// One job's view of a snapshot root, with its own handle table so a job's
/// shutdown can tear down exactly its own open files (spec §5, "a job
/// shutdown closes all handles that were created under its method prefix").
pub struct AgentFs {
    root: PathBuf,
    handles: HandleTable,
    statfs: StatFsInfo,
}

impl AgentFs {
    /// Canonicalizes `root` once so every subsequent path resolution has a
    /// stable prefix to confine against.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, FabricError> {
        let root = tokio::fs::canonicalize(root.into()).await?;
        let statfs = query_statfs(&root)?;
        Ok(Self { root, handles: HandleTable::new(), statfs })
    }

    pub async fn open_file(&self, req: OpenFileReq) -> Result<u64, FabricError> {
        if has_write_intent(req.flags) {
            return Err(FabricError::permission_denied("write operations not allowed"));
        }
        let resolved = path::resolve(&self.root, &req.path).await?;
        let meta = tokio::fs::metadata(&resolved).await?;
        let file = tokio::fs::File::open(&resolved).await?;
        let id = self.handles.insert(req.path, file, meta.len(), meta.is_dir()).await;
        Ok(id)
    }

    pub async fn attr(&self, rel_path: &str) -> Result<AgentFileInfo, FabricError> {
        let resolved = path::resolve(&self.root, rel_path).await?;
        let meta = tokio::fs::symlink_metadata(&resolved).await?;
        Ok(file_info(&self.root, &resolved, &meta, self.statfs.block_size))
    }

    pub async fn xattr(&self, rel_path: &str) -> Result<AgentXattrInfo, FabricError> {
        let resolved = path::resolve(&self.root, rel_path).await?;
        let meta = tokio::fs::symlink_metadata(&resolved).await?;
        let base = file_info(&self.root, &resolved, &meta, self.statfs.block_size);
        Ok(extended_info(base, &meta))
    }

    pub async fn read_dir(&self, rel_path: &str) -> Result<Vec<u8>, FabricError> {
        let resolved = path::resolve(&self.root, rel_path).await?;
        let entries = dirreader::read_dir(&resolved).await?;
        Ok(dirreader::encode_entries(&entries))
    }

    /// Returns the direct-buffer reply for `ReadAt` (spec §4.6.4): clamps
    /// the requested length to the handle's cached size and streams the
    /// result using a positional read so concurrent reads on the same
    /// handle never interfere (spec §3 invariant, §9 "Concurrent per-handle
    /// reads").
    pub async fn read_at(&self, req: ReadAtReq) -> Result<HandlerReply, FabricError> {
        let handle = self.handles.get(req.handle).await?;
        if handle.is_dir {
            return Err(FabricError::invalid("handle is a directory"));
        }
        if req.offset >= handle.size {
            return Ok(HandlerReply::DirectBuffer { bytes: Vec::new(), eof: true });
        }
        let remaining = handle.size - req.offset;
        let to_read = (req.length as u64).min(remaining) as usize;

        let buf = {
            let file = handle.file.lock().await;
            read_at_positional(&file, req.offset, to_read).await?
        };
        let eof = req.offset + buf.len() as u64 >= handle.size;
        Ok(HandlerReply::DirectBuffer { bytes: buf, eof })
    }

    pub async fn lseek(&self, req: LseekReq) -> Result<u64, FabricError> {
        let handle = self.handles.get(req.handle).await?;
        if handle.is_dir {
            return Err(FabricError::invalid("handle is a directory"));
        }

        let mut position = handle.position.lock().await;
        let new_pos = match req.whence {
            Whence::Start | Whence::Current | Whence::End => {
                let base: i64 = match req.whence {
                    Whence::Start => 0,
                    Whence::Current => *position as i64,
                    Whence::End => handle.size as i64,
                    _ => unreachable!(),
                };
                let candidate = base
                    .checked_add(req.offset)
                    .ok_or_else(|| FabricError::invalid("seek overflow"))?;
                if candidate < 0 || candidate as u64 > handle.size {
                    return Err(FabricError::invalid("seek out of range"));
                }
                candidate as u64
            }
            Whence::Data | Whence::Hole => {
                let from = (*position as i64 + req.offset).max(0) as u64;
                let ranges = query_ranges_for(&handle).await?;
                match req.whence {
                    Whence::Data => sparse::seek_data(&ranges, from)?,
                    Whence::Hole => sparse::seek_hole(&ranges, from),
                    _ => unreachable!(),
                }
            }
        };
        *position = new_pos;
        Ok(new_pos)
    }

    pub async fn close(&self, handle_id: u64) -> Result<(), FabricError> {
        match self.handles.remove(handle_id).await {
            Some(_) => Ok(()),
            None => Err(FabricError::not_found(format!("no open handle {handle_id}"))),
        }
    }

    pub fn statfs(&self) -> StatFsInfo {
        self.statfs
    }

    /// Drops every open handle without touching the job's registration.
    /// Shared by job shutdown (`shutdown`, below) and by the session
    /// layer's reconnect-time reset hook (spec §5, §8 scenario 6): dropping
    /// each `Arc<OpenHandle>` here drops its `File`, which closes the
    /// underlying fd.
    async fn invalidate_handles(&self) {
        drop(self.handles.clear().await);
    }

    /// Closes every handle still open under this job, whether or not the
    /// client ever called `Close` (spec §5).
    async fn shutdown(&self) {
        self.invalidate_handles().await;
    }
}

fn file_info(
    root: &std::path::Path,
    resolved: &std::path::Path,
    meta: &std::fs::Metadata,
    block_size: u32,
) -> AgentFileInfo {
    let name = resolved
        .strip_prefix(root)
        .ok()
        .and_then(|rel| rel.file_name())
        .or_else(|| resolved.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let blocks = if meta.is_dir() {
        0
    } else {
        allocated_blocks(meta, block_size)
    };
    AgentFileInfo {
        name,
        size: meta.len(),
        mode: neutral_mode(meta),
        mtime_ns: mtime_ns(meta),
        is_dir: meta.is_dir(),
        blocks,
    }
}

fn extended_info(base: AgentFileInfo, meta: &std::fs::Metadata) -> AgentXattrInfo {
    AgentXattrInfo {
        base,
        created_ns: created_ns(meta),
        accessed_ns: accessed_ns(meta),
        written_ns: mtime_ns(meta),
        attr_flags: platform_attr_flags(meta),
        owner: owner_string(meta),
        group: group_string(meta),
        win_acl: Vec::new(),
        posix_acl: Vec::new(),
    }
}

fn mtime_ns(meta: &std::fs::Metadata) -> i64 {
    system_time_to_ns(meta.modified().ok())
}

fn accessed_ns(meta: &std::fs::Metadata) -> i64 {
    system_time_to_ns(meta.accessed().ok())
}

fn created_ns(meta: &std::fs::Metadata) -> i64 {
    system_time_to_ns(meta.created().ok())
}

fn system_time_to_ns(time: Option<std::time::SystemTime>) -> i64 {
    time.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// `ceil(allocation_size / bsize)` per spec §4.6.2, falling back to 4096
/// when the platform's block size is unknown.
fn allocated_blocks(meta: &std::fs::Metadata, block_size: u32) -> u64 {
    let bsize = if block_size == 0 { 4096 } else { block_size as u64 };
    let alloc_size = platform_allocated_size(meta);
    alloc_size.div_ceil(bsize)
}

#[cfg(unix)]
fn platform_allocated_size(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.blocks() * 512
}

#[cfg(not(unix))]
fn platform_allocated_size(meta: &std::fs::Metadata) -> u64 {
    meta.len()
}

#[cfg(unix)]
fn owner_string(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    meta.uid().to_string()
}

#[cfg(not(unix))]
fn owner_string(_meta: &std::fs::Metadata) -> String {
    String::new()
}

#[cfg(unix)]
fn group_string(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    meta.gid().to_string()
}

#[cfg(not(unix))]
fn group_string(_meta: &std::fs::Metadata) -> String {
    String::new()
}

/// Platform attribute-flag map (spec §4.6.3). Unix has no analogue of
/// Windows' hidden/system/archive bits, so the map is empty rather than
/// fabricated (spec §9, "unsupported sub-fields must come back as
/// empty/default, never as errors").
#[cfg(unix)]
fn platform_attr_flags(_meta: &std::fs::Metadata) -> Vec<(String, bool)> {
    Vec::new()
}

#[cfg(not(unix))]
fn platform_attr_flags(_meta: &std::fs::Metadata) -> Vec<(String, bool)> {
    Vec::new()
}

/// Reads `len` bytes at `offset` without disturbing any seek position
/// observable by a concurrent call on the same handle (spec §3, §9
/// "Concurrent per-handle reads"): `pread` on Unix, an independently
/// seeked clone of the fd elsewhere. Returns fewer than `len` bytes only
/// at genuine EOF.
#[cfg(unix)]
async fn read_at_positional(file: &tokio::fs::File, offset: u64, len: usize) -> Result<Vec<u8>, FabricError> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let offset = offset as i64;
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; len];
        let mut read_total = 0usize;
        while read_total < len {
            let n = unsafe {
                libc::pread(
                    fd,
                    buf.as_mut_ptr().add(read_total) as *mut libc::c_void,
                    len - read_total,
                    offset + read_total as i64,
                )
            };
            if n < 0 {
                return Err(FabricError::from(std::io::Error::last_os_error()));
            }
            if n == 0 {
                break;
            }
            read_total += n as usize;
        }
        buf.truncate(read_total);
        Ok(buf)
    })
    .await
    .map_err(|err| FabricError::internal(format!("read task failed: {err}")))?
}

#[cfg(not(unix))]
async fn read_at_positional(file: &tokio::fs::File, offset: u64, len: usize) -> Result<Vec<u8>, FabricError> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};
    let mut file = file.try_clone().await.map_err(FabricError::from)?;
    file.seek(std::io::SeekFrom::Start(offset)).await.map_err(FabricError::from)?;
    let mut buf = vec![0u8; len];
    let n = file.read(&mut buf).await.map_err(FabricError::from)?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(target_os = "linux")]
async fn query_ranges_for(handle: &crate::handle_table::OpenHandle) -> Result<Vec<sparse::Range>, FabricError> {
    use std::os::unix::io::AsRawFd;
    let file = handle.file.lock().await;
    let fd = file.as_raw_fd();
    let size = handle.size;
    Ok(tokio::task::spawn_blocking(move || sparse::query_ranges(fd, size))
        .await
        .map_err(|err| FabricError::internal(format!("seek task failed: {err}")))?)
}

#[cfg(not(target_os = "linux"))]
async fn query_ranges_for(handle: &crate::handle_table::OpenHandle) -> Result<Vec<sparse::Range>, FabricError> {
    Ok(vec![sparse::Range { offset: 0, length: handle.size }])
}

#[cfg(target_os = "linux")]
fn query_statfs(root: &std::path::Path) -> Result<StatFsInfo, FabricError> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(root.as_os_str().as_bytes())
        .map_err(|_| FabricError::invalid("path contains interior NUL"))?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(FabricError::from(std::io::Error::last_os_error()));
    }
    let stat = unsafe { stat.assume_init() };
    Ok(StatFsInfo {
        block_size: stat.f_frsize as u32,
        blocks_total: stat.f_blocks as u64,
        blocks_free: stat.f_bfree as u64,
        blocks_avail: stat.f_bavail as u64,
        inodes_total: stat.f_files as u64,
        inodes_free: stat.f_ffree as u64,
        max_name_len: stat.f_namemax as u32,
    })
}

/// Non-Linux fallback (spec §4.6.8): only total capacity is assumed known;
/// free/available report as zero and inode total is the sentinel `1<<20`.
#[cfg(not(target_os = "linux"))]
fn query_statfs(_root: &std::path::Path) -> Result<StatFsInfo, FabricError> {
    Ok(StatFsInfo {
        block_size: 4096,
        blocks_total: 0,
        blocks_free: 0,
        blocks_avail: 0,
        inodes_total: 1 << 20,
        inodes_free: 0,
        max_name_len: 255,
    })
}

/// Registers the eight namespaced handlers for one job (spec §4.6, §6
/// "Method namespace").
pub async fn register_job(job_id: &str, fs: Arc<AgentFs>, router: &Router) {
    macro_rules! method {
        ($verb:expr) => {
            format!("{job_id}/{}", $verb)
        };
    }

    // Spec §8 scenario 6: a reconnecting session must not be able to reach
    // handles opened before the transport dropped. The handle table itself
    // has no notion of connections, so the session layer clears it on our
    // behalf via this hook whenever it detects the serving connection died.
    {
        let fs = fs.clone();
        router
            .register_reset_hook(job_id, Arc::new(move || {
                let fs = fs.clone();
                Box::pin(async move { fs.invalidate_handles().await; })
            }))
            .await;
    }

    {
        let fs = fs.clone();
        router
            .register(
                method!("OpenFile"),
                Arc::new(move |req| {
                    let fs = fs.clone();
                    Box::pin(async move {
                        let parsed = OpenFileReq::decode(&req.payload)?;
                        let id = fs.open_file(parsed).await?;
                        Ok(HandlerReply::Struct(encode_u64(id)))
                    })
                }),
            )
            .await;
    }
    {
        let fs = fs.clone();
        router
            .register(
                method!("Attr"),
                Arc::new(move |req| {
                    let fs = fs.clone();
                    Box::pin(async move {
                        let path = decode_path_req(&req.payload)?;
                        let info = fs.attr(&path).await?;
                        Ok(HandlerReply::Struct(info.encode()))
                    })
                }),
            )
            .await;
    }
    {
        let fs = fs.clone();
        router
            .register(
                method!("Xattr"),
                Arc::new(move |req| {
                    let fs = fs.clone();
                    Box::pin(async move {
                        let path = decode_path_req(&req.payload)?;
                        let info = fs.xattr(&path).await?;
                        Ok(HandlerReply::Struct(info.encode()))
                    })
                }),
            )
            .await;
    }
    {
        let fs = fs.clone();
        router
            .register(
                method!("ReadDir"),
                Arc::new(move |req| {
                    let fs = fs.clone();
                    Box::pin(async move {
                        let path = decode_path_req(&req.payload)?;
                        let encoded = fs.read_dir(&path).await?;
                        Ok(HandlerReply::Struct(encoded))
                    })
                }),
            )
            .await;
    }
    {
        let fs = fs.clone();
        router
            .register(
                method!("ReadAt"),
                Arc::new(move |req| {
                    let fs = fs.clone();
                    Box::pin(async move {
                        let parsed = ReadAtReq::decode(&req.payload)?;
                        fs.read_at(parsed).await
                    })
                }),
            )
            .await;
    }
    {
        let fs = fs.clone();
        router
            .register(
                method!("Lseek"),
                Arc::new(move |req| {
                    let fs = fs.clone();
                    Box::pin(async move {
                        let parsed = LseekReq::decode(&req.payload)?;
                        let pos = fs.lseek(parsed).await?;
                        Ok(HandlerReply::Struct(encode_u64(pos)))
                    })
                }),
            )
            .await;
    }
    {
        let fs = fs.clone();
        router
            .register(
                method!("Close"),
                Arc::new(move |req| {
                    let fs = fs.clone();
                    Box::pin(async move {
                        let handle_id = decode_close_req(&req.payload)?;
                        fs.close(handle_id).await?;
                        Ok(HandlerReply::Message("closed".to_string(), Vec::new()))
                    })
                }),
            )
            .await;
    }
    {
        let fs = fs.clone();
        router
            .register(
                method!("StatFS"),
                Arc::new(move |_req| {
                    let fs = fs.clone();
                    Box::pin(async move { Ok(HandlerReply::Struct(fs.statfs().encode())) })
                }),
            )
            .await;
    }
    // Mount bridge control verbs (spec §4.9 steps 2/5): the snapshot root
    // this job serves is fixed at job-registration time rather than chosen
    // per mount, so `MountPrepare` only confirms the job is live and
    // `MountTeardown` releases whatever handles the mount accumulated
    // without unregistering the job itself.
    {
        router
            .register(
                method!("MountPrepare"),
                Arc::new(move |_req| {
                    Box::pin(async move { Ok(HandlerReply::Message("ready".to_string(), Vec::new())) })
                }),
            )
            .await;
    }
    {
        let fs = fs.clone();
        router
            .register(
                method!("MountTeardown"),
                Arc::new(move |_req| {
                    let fs = fs.clone();
                    Box::pin(async move {
                        fs.shutdown().await;
                        Ok(HandlerReply::Message("released".to_string(), Vec::new()))
                    })
                }),
            )
            .await;
    }
}

/// Unregisters a job's handlers and releases any handle it still owns
/// (spec §5, "a job shutdown closes all handles...").
pub async fn deregister_job(job_id: &str, fs: &AgentFs, router: &Router) {
    fs.shutdown().await;
    router.deregister_prefix(&format!("{job_id}/")).await;
    router.deregister_reset_hook(job_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sample_root() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("test2.txt"), b"test file 2 content with more data").unwrap();
        std::fs::create_dir(tmp.path().join("subdir")).unwrap();
        tmp
    }

    #[tokio::test]
    async fn open_file_rejects_write_intent_before_touching_os() {
        let tmp = sample_root().await;
        let fs = AgentFs::new(tmp.path()).await.unwrap();
        let req = OpenFileReq { path: "test2.txt".into(), flags: FLAG_WRONLY, perm: 0o644 };
        let err = fs.open_file(req).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::PermissionDenied);
        assert_eq!(err.message, "write operations not allowed");
    }

    #[tokio::test]
    async fn small_read_matches_spec_scenario() {
        let tmp = sample_root().await;
        let fs = AgentFs::new(tmp.path()).await.unwrap();
        let handle = fs
            .open_file(OpenFileReq { path: "test2.txt".into(), flags: 0, perm: 0 })
            .await
            .unwrap();

        let reply = fs
            .read_at(ReadAtReq { handle, offset: 10, length: 100 })
            .await
            .unwrap();
        match reply {
            HandlerReply::DirectBuffer { bytes, eof } => {
                assert_eq!(bytes, b"2 content with more data");
                assert!(eof);
            }
            _ => panic!("expected DirectBuffer"),
        }

        fs.close(handle).await.unwrap();
        let err = fs.close(handle).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn read_dir_filters_and_flags_directories() {
        let tmp = sample_root().await;
        let fs = AgentFs::new(tmp.path()).await.unwrap();
        let encoded = fs.read_dir(".").await.unwrap();
        let entries = dirreader::decode_entries(&encoded).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.name == "subdir" && e.mode & crate::mode::MODE_DIR != 0));
    }

    #[tokio::test]
    async fn lseek_end_equals_file_size() {
        let tmp = sample_root().await;
        let fs = AgentFs::new(tmp.path()).await.unwrap();
        let handle = fs
            .open_file(OpenFileReq { path: "test2.txt".into(), flags: 0, perm: 0 })
            .await
            .unwrap();
        let pos = fs.lseek(LseekReq { handle, offset: 0, whence: Whence::End }).await.unwrap();
        assert_eq!(pos, "test file 2 content with more data".len() as u64);
    }

    #[tokio::test]
    async fn path_escape_is_rejected() {
        let tmp = sample_root().await;
        let fs = AgentFs::new(tmp.path()).await.unwrap();
        let err = fs.attr("../../../etc/passwd").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Invalid);
    }
}
