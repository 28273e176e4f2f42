//! Mount bridge (spec §4.9, C9): per-job snapshot request, loopback NFSv3
//! export, mount-namespace child process, readiness poll, teardown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::agentfs::types::encode_path_req;
use crate::broker::Broker;
use crate::error::FabricError;
use crate::mount::mountd::{self, MOUNT_PROGRAM};
use crate::mount::nfs3::{self, NFS_PROGRAM};
use crate::mount::remote_fs::{AgentRemoteFs, RemoteFs};
use crate::mount::rpc::{self, CallHeader};
use crate::mount::xdr::XdrDecoder;

const MOUNT_PREPARE_DEADLINE: Duration = Duration::from_secs(10);
const MOUNT_TEARDOWN_DEADLINE: Duration = Duration::from_secs(10);
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MOUNT_RETRY_ATTEMPTS: u32 = 3;
const MOUNT_RETRY_SPACING: Duration = Duration::from_secs(2);

/// Deterministically derives the `(nfs_port, mount_port)` pair for a
/// volume identifier (spec §4.9 step 2: "a deterministic port derived
/// from the volume identifier").
fn derive_ports(volume: &str) -> (u16, u16) {
    let mut hash: u64 = 0xcbf29ce484222325; // FNV-1a offset basis
    for byte in volume.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    let base = 40_000u16 + ((hash % 4_000) as u16) * 2;
    (base, base + 1)
}

pub struct MountBridge {
    base_dir: PathBuf,
}

/// A live mount; dropping this struct does not tear anything down —
/// callers must call [`MountBridge::teardown`] explicitly so errors during
/// unmount surface instead of being silently swallowed.
pub struct MountHandle {
    pub mountpoint: PathBuf,
    job_id: String,
    hostname: String,
    child: Child,
    nfs_task: JoinHandle<()>,
    remote: Arc<AgentRemoteFs>,
}

impl MountBridge {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    /// Runs the full sequence of spec §4.9 steps 1-4 and returns the
    /// mounted path (step 5).
    pub async fn prepare(
        &self,
        broker: &Broker,
        hostname: &str,
        job_id: &str,
        volume: &str,
    ) -> Result<MountHandle, FabricError> {
        let session = broker
            .get(hostname)
            .await
            .ok_or_else(|| FabricError::not_found(format!("no live session for {hostname}")))?;

        session
            .call(&format!("{job_id}/MountPrepare"), encode_path_req(volume), MOUNT_PREPARE_DEADLINE)
            .await?;

        let mountpoint = self.base_dir.join(job_id);
        ensure_mountpoint(&mountpoint).await?;

        let remote = Arc::new(AgentRemoteFs::new(session, job_id).await);
        let (nfs_port, mount_port) = derive_ports(volume);
        let nfs_task = spawn_loopback_listeners(nfs_port, mount_port, remote.clone()).await?;

        match mount_with_retry(&mountpoint, nfs_port, mount_port).await {
            Ok(child) => Ok(MountHandle {
                mountpoint,
                job_id: job_id.to_string(),
                hostname: hostname.to_string(),
                child,
                nfs_task,
                remote,
            }),
            Err(err) => {
                nfs_task.abort();
                let _ = tokio::fs::remove_dir(&mountpoint).await;
                Err(err)
            }
        }
    }

    /// Spec §4.9 step 5 teardown: matching `DELETE` to the agent, unmount
    /// inside the child's mount namespace, remove the mountpoint.
    pub async fn teardown(&self, broker: &Broker, handle: MountHandle) -> Result<(), FabricError> {
        let MountHandle { mountpoint, job_id, hostname, mut child, nfs_task, remote } = handle;

        if let Some(pid) = child.id() {
            let _ = Command::new("nsenter")
                .args(["-t", &pid.to_string(), "-m", "--", "umount", &mountpoint.to_string_lossy()])
                .status()
                .await;
        }
        let _ = child.kill().await;
        nfs_task.abort();
        remote.shutdown().await;

        if let Some(session) = broker.get(&hostname).await {
            let _ = session
                .call(&format!("{job_id}/MountTeardown"), Vec::new(), MOUNT_TEARDOWN_DEADLINE)
                .await;
        }
        tokio::fs::remove_dir_all(&mountpoint).await.map_err(FabricError::from)?;
        Ok(())
    }
}

async fn ensure_mountpoint(path: &Path) -> Result<(), FabricError> {
    tokio::fs::create_dir_all(path).await.map_err(FabricError::from)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(FabricError::from)?;
    }
    let mut entries = tokio::fs::read_dir(path).await.map_err(FabricError::from)?;
    if entries.next_entry().await.map_err(FabricError::from)?.is_some() {
        return Err(FabricError::invalid("mountpoint is not empty"));
    }
    Ok(())
}

async fn mount_with_retry(mountpoint: &Path, nfs_port: u16, mount_port: u16) -> Result<Child, FabricError> {
    let mut last_err = None;
    for attempt in 1..=MOUNT_RETRY_ATTEMPTS {
        match try_mount_once(mountpoint, nfs_port, mount_port).await {
            Ok(child) => return Ok(child),
            Err(err) => {
                tracing::warn!(attempt, error = %err, "mount attempt failed, retrying");
                last_err = Some(err);
                sleep(MOUNT_RETRY_SPACING).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| FabricError::io("mount failed with no recorded error")))
}

/// Spawns the helper process that enters a fresh mount namespace, mounts
/// the loopback NFS export, then idles so the namespace stays alive for
/// the mount's lifetime, and polls until the mountpoint is readable.
async fn try_mount_once(mountpoint: &Path, nfs_port: u16, mount_port: u16) -> Result<Child, FabricError> {
    let options = format!(
        "ro,vers=3,proto=tcp,port={nfs_port},mountport={mount_port},noacl,nocto,actimeo=3600,lookupcache=positive,noatime"
    );
    let mount_cmd = format!(
        "mount -t nfs -o {options} 127.0.0.1:/ {} && sleep infinity",
        mountpoint.to_string_lossy()
    );

    let mut child = Command::new("unshare")
        .args(["--mount", "--", "sh", "-c", &mount_cmd])
        .kill_on_drop(true)
        .spawn()
        .map_err(FabricError::from)?;

    match poll_ready(mountpoint).await {
        Ok(()) => Ok(child),
        Err(err) => {
            let _ = child.kill().await;
            Err(err)
        }
    }
}

async fn poll_ready(mountpoint: &Path) -> Result<(), FabricError> {
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    loop {
        if tokio::fs::read_dir(mountpoint).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(FabricError::timeout("mountpoint did not become ready"));
        }
        sleep(READY_POLL_INTERVAL).await;
    }
}

/// Binds the NFS and MOUNT loopback ports and serves both off the same
/// [`RemoteFs`] until the returned task is aborted.
async fn spawn_loopback_listeners(
    nfs_port: u16,
    mount_port: u16,
    remote: Arc<dyn RemoteFs>,
) -> Result<JoinHandle<()>, FabricError> {
    let nfs_listener = TcpListener::bind(("127.0.0.1", nfs_port)).await.map_err(FabricError::from)?;
    let mount_listener = TcpListener::bind(("127.0.0.1", mount_port)).await.map_err(FabricError::from)?;

    let nfs_remote = remote.clone();
    let mount_remote = remote;
    Ok(tokio::spawn(async move {
        let nfs_loop = run_rpc_listener(nfs_listener, nfs_remote);
        let mount_loop = run_rpc_listener(mount_listener, mount_remote);
        tokio::join!(nfs_loop, mount_loop);
    }))
}

async fn run_rpc_listener(listener: TcpListener, remote: Arc<dyn RemoteFs>) {
    loop {
        let (socket, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "loopback rpc accept failed");
                return;
            }
        };
        let remote = remote.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_rpc_connection(socket, remote).await {
                tracing::debug!(error = %err, "loopback rpc connection ended");
            }
        });
    }
}

async fn serve_rpc_connection(mut socket: tokio::net::TcpStream, remote: Arc<dyn RemoteFs>) -> Result<(), FabricError> {
    loop {
        let record = rpc::read_record(&mut socket).await?;
        let mut dec = XdrDecoder::new(&record);
        let header = rpc::decode_call_header(&mut dec)?;
        let reply = route_call(&header, &mut dec, remote.as_ref()).await;
        rpc::write_record(&mut socket, &reply).await?;
    }
}

async fn route_call(header: &CallHeader, dec: &mut XdrDecoder<'_>, remote: &dyn RemoteFs) -> Vec<u8> {
    match header.program {
        NFS_PROGRAM => nfs3::handle_call(header, dec, remote).await,
        MOUNT_PROGRAM => mountd::handle_call(header, dec, remote),
        _ => {
            let mut enc = crate::mount::xdr::XdrEncoder::new();
            rpc::encode_reply_header(&mut enc, header.xid, rpc::ACCEPT_PROG_UNAVAIL);
            enc.into_vec()
        }
    }
}
