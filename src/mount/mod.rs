//! Mount bridge (spec §4.9, C9): snapshot request, loopback NFSv3 export,
//! mount-namespace child process, readiness poll, teardown.

mod bridge;
pub mod control;
mod mountd;
mod nfs3;
mod remote_fs;
mod rpc;
mod xdr;

pub use bridge::{MountBridge, MountHandle};
pub use control::MountControl;
pub use remote_fs::{AgentRemoteFs, RemoteFs};
