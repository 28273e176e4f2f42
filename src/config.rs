//! Typed configuration loaded from TOML (spec §1.3). Mirrors the teacher's
//! habit of one small config struct with `serde::Deserialize` plus sane
//! defaults, rather than a builder.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::FabricError;
use crate::session::ReconnectPolicy;

fn default_listen_addr() -> String {
    "0.0.0.0:8039".to_string()
}

fn default_mount_base_dir() -> PathBuf {
    PathBuf::from("/mnt/arpc-fabric-mounts")
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Top-level configuration document for either binary. The mTLS seam
/// (spec §1 Non-goals: "relies on transport-level mTLS") is represented
/// here only as certificate/key *paths* — this crate hands raw TCP to the
/// multiplexer and never touches TLS itself; a deployment wrapper is
/// expected to terminate mTLS in front of it or fill these in for a
/// future TLS layer (see `DESIGN.md`).
#[derive(Debug, Clone, Deserialize)]
pub struct FabricConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Overrides the router's default `max(1, cpu/2)` worker count (spec §4.3).
    pub worker_count: Option<usize>,

    #[serde(default = "default_mount_base_dir")]
    pub mount_base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

impl ReconnectConfig {
    pub fn to_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_backoff: std::time::Duration::from_millis(self.initial_backoff_ms),
            max_backoff: std::time::Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tls_cert_path: None,
            tls_key_path: None,
            reconnect: ReconnectConfig::default(),
            worker_count: None,
            mount_base_dir: default_mount_base_dir(),
        }
    }
}

impl FabricConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, FabricError> {
        toml::from_str(source).map_err(|err| FabricError::invalid(format!("invalid config: {err}")))
    }

    pub async fn load(path: &std::path::Path) -> Result<Self, FabricError> {
        let contents = tokio::fs::read_to_string(path).await.map_err(FabricError::from)?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_with_an_empty_document() {
        let config = FabricConfig::from_toml_str("").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8039");
        assert_eq!(config.reconnect.multiplier, 2.0);
        assert!(config.tls_cert_path.is_none());
    }

    #[test]
    fn overrides_apply_selectively() {
        let config = FabricConfig::from_toml_str(
            "listen_addr = \"127.0.0.1:9000\"\nworker_count = 4\n",
        )
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.worker_count, Some(4));
        assert_eq!(config.reconnect.initial_backoff_ms, 250);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(FabricConfig::from_toml_str("not = [valid").is_err());
    }
}
