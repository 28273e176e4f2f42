//! Registry / connection broker: hostname → live session, with a cached
//! liveness ping (spec §4.10, C10).

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use whirlwind::ShardMap;

use crate::error::FabricError;
use crate::session::ClientSession;

const PING_METHOD: &str = "ping";
const PING_TIMEOUT: Duration = Duration::from_secs(2);
const PING_CACHE_TTL: Duration = Duration::from_secs(10);

/// Maps agent hostname to its live [`ClientSession`]. Replaces rather than
/// merges on duplicate registration (spec §3, "the broker enforces [one
/// session per pair] by replacing any prior entry on new connect").
pub struct Broker {
    sessions: ShardMap<String, Arc<ClientSession>>,
    ping_cache: Cache<String, bool>,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            sessions: ShardMap::new(),
            ping_cache: Cache::builder().time_to_live(PING_CACHE_TTL).build(),
        }
    }

    /// Registers a newly connected session, closing and discarding any
    /// prior session for the same hostname.
    pub async fn register(&self, hostname: String, session: Arc<ClientSession>) {
        if let Some((_, old)) = self.sessions.remove(&hostname).await {
            old.close().await;
        }
        self.sessions.insert(hostname.clone(), session).await;
        self.ping_cache.invalidate(&hostname).await;
    }

    /// Removes the entry when a session's serve loop exits (spec §4.10,
    /// "On disconnect... the entry is removed").
    pub async fn unregister(&self, hostname: &str) {
        self.sessions.remove(hostname).await;
        self.ping_cache.invalidate(hostname).await;
    }

    pub async fn get(&self, hostname: &str) -> Option<Arc<ClientSession>> {
        self.sessions.get(hostname).await.map(|entry| entry.clone())
    }

    /// Checks liveness with a short-timeout `ping`, memoizing the result
    /// per hostname for [`PING_CACHE_TTL`] to absorb bursts of status
    /// checks (spec §4.10).
    pub async fn ping(&self, hostname: &str) -> Result<bool, FabricError> {
        if let Some(cached) = self.ping_cache.get(hostname).await {
            return Ok(cached);
        }
        let session = self
            .get(hostname)
            .await
            .ok_or_else(|| FabricError::not_found(format!("no session for {hostname}")))?;

        let alive = session.call(PING_METHOD, Vec::new(), PING_TIMEOUT).await.is_ok();
        self.ping_cache.insert(hostname.to_string(), alive).await;
        Ok(alive)
    }

    pub async fn len(&self) -> usize {
        self.sessions.len().await
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::ClientIdentity;

    fn dummy_session() -> Arc<ClientSession> {
        let identity = ClientIdentity { hostname: "x".into(), agent_version: "0".into() };
        Arc::new(ClientSession::new("127.0.0.1:1", "/arpc", identity))
    }

    #[tokio::test]
    async fn register_replaces_prior_session_for_same_hostname() {
        let broker = Broker::new();
        broker.register("agent-1".into(), dummy_session()).await;
        assert_eq!(broker.len().await, 1);
        broker.register("agent-1".into(), dummy_session()).await;
        assert_eq!(broker.len().await, 1);
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let broker = Broker::new();
        broker.register("agent-1".into(), dummy_session()).await;
        broker.unregister("agent-1").await;
        assert_eq!(broker.len().await, 0);
        assert!(broker.get("agent-1").await.is_none());
    }

    #[tokio::test]
    async fn ping_missing_hostname_is_not_found() {
        let broker = Broker::new();
        let err = broker.ping("nowhere").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }
}
