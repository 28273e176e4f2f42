//! aRPC session: client-side calls with reconnection, server-side accept
//! loop dispatching into the [`crate::router::Router`] (spec §4.3, §4.4, C3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::codec::{Request, Response};
use crate::error::FabricError;
use crate::handshake::{accept_upgrade, connect_upgrade, ClientIdentity};
use crate::router::{DispatchOutcome, Router};
use crate::transport::{MuxEndpoint, MuxStream, Side};

/// Exponential backoff parameters for client reconnection (spec §4.3,
/// "reconnect with backoff").
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Pure step function so the backoff schedule can be tested without a
    /// network: `next(x) = min(max, x * multiplier)`, starting at `initial`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let scaled = current.mul_f64(self.multiplier);
        scaled.min(self.max_backoff)
    }
}

/// A client-held aRPC connection to one agent or server. Holds at most one
/// live [`MuxEndpoint`] behind a slot guarded by a single `Mutex`, so a lost
/// connection is rebuilt by exactly one caller at a time (single-flight
/// reconnect) while every other caller awaits the same lock instead of
/// racing to redial (spec §4.3).
pub struct ClientSession {
    addr: String,
    path: String,
    host: String,
    identity: ClientIdentity,
    policy: ReconnectPolicy,
    endpoint: Mutex<Option<Arc<MuxEndpoint>>>,
    closed: AtomicBool,
    /// False for a session built from an already-accepted connection
    /// (`from_endpoint`): there is no address to redial, so a dead
    /// transport fails calls outright instead of looping `dial()`. The
    /// agent reconnecting produces a fresh accepted session that replaces
    /// this one in the broker (spec §4.10).
    dialable: bool,
}

impl ClientSession {
    pub fn new(addr: impl Into<String>, path: impl Into<String>, identity: ClientIdentity) -> Self {
        let addr = addr.into();
        let host = addr.clone();
        Self {
            addr,
            path: path.into(),
            host,
            identity,
            policy: ReconnectPolicy::default(),
            endpoint: Mutex::new(None),
            closed: AtomicBool::new(false),
            dialable: true,
        }
    }

    /// Wraps a connection this process already accepted (spec §4.9/§4.10:
    /// the server calls into the agent over the connection the agent
    /// dialed). Carries no reconnect capability of its own.
    pub fn from_endpoint(endpoint: MuxEndpoint, peer_addr: impl Into<String>, identity: ClientIdentity) -> Self {
        let addr = peer_addr.into();
        let host = addr.clone();
        Self {
            addr,
            path: String::new(),
            host,
            identity,
            policy: ReconnectPolicy::default(),
            endpoint: Mutex::new(Some(Arc::new(endpoint))),
            closed: AtomicBool::new(false),
            dialable: false,
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn dial(&self) -> Result<MuxEndpoint, FabricError> {
        let mut socket = TcpStream::connect(&self.addr).await.map_err(FabricError::from)?;
        connect_upgrade(&mut socket, &self.path, &self.host, &self.identity).await?;
        Ok(MuxEndpoint::new(socket, Side::Client))
    }

    /// Ensures a live endpoint is installed in the slot, reconnecting with
    /// exponential backoff if the previous one died or never existed.
    /// Single-flight: concurrent callers serialize on `self.endpoint`'s lock
    /// and the first one through does the actual redial.
    async fn ensure_connected(&self) -> Result<(), FabricError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FabricError::canceled("session closed"));
        }
        let mut slot = self.endpoint.lock().await;
        if let Some(endpoint) = slot.as_ref() {
            if !endpoint.is_closed() {
                return Ok(());
            }
        }
        if !self.dialable {
            return Err(FabricError::canceled("accepted session's transport is gone"));
        }
        let mut backoff = self.policy.initial_backoff;
        loop {
            match self.dial().await {
                Ok(endpoint) => {
                    *slot = Some(Arc::new(endpoint));
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(error = %err, "reconnect attempt failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = self.policy.next_backoff(backoff);
                }
            }
        }
    }

    /// Blocks until the underlying transport is gone (closed or never
    /// dialable again). Used by the accept loop to know when to remove a
    /// session from the broker (spec §4.10, "on disconnect... the entry is
    /// removed").
    pub async fn wait_closed(&self) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            {
                let slot = self.endpoint.lock().await;
                match slot.as_ref() {
                    Some(endpoint) if !endpoint.is_closed() => {}
                    _ => return,
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Issues one structured call with a per-call deadline (spec §4.3).
    /// Opens a dedicated stream for the call, as required by "a single call
    /// occupies exactly one stream".
    pub async fn call(
        &self,
        method: &str,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<Response, FabricError> {
        tokio::time::timeout(deadline, self.call_inner(method, payload))
            .await
            .map_err(|_| FabricError::timeout(format!("{method} exceeded deadline")))?
    }

    async fn call_inner(&self, method: &str, payload: Vec<u8>) -> Result<Response, FabricError> {
        self.ensure_connected().await?;
        // Clone the endpoint handle and drop the session lock before opening
        // the stream: holding it across the await would deadlock against an
        // accept loop that holds the same lock across its own `accept_stream`
        // (spec §4.9/§4.10, the server calling into the agent it also drains).
        let endpoint = {
            let slot = self.endpoint.lock().await;
            slot.as_ref().ok_or_else(|| FabricError::internal("no endpoint"))?.clone()
        };
        let mut stream = endpoint.open_stream().await.map_err(FabricError::from)?;

        let request = Request::new(method, payload);
        stream.write_all(&request.encode()).await.map_err(FabricError::from)?;
        stream.flush().await.map_err(FabricError::from)?;

        let framed = read_framed(&mut stream).await?;
        Response::decode(&framed)
    }

    /// Issues a call expecting the direct-buffer streaming reply (status
    /// 213, spec §4.3/§4.4): returns the decoded metadata header together
    /// with the raw bytes that followed it.
    pub async fn call_direct_buffer(
        &self,
        method: &str,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<(crate::codec::DirectBufferHeader, Vec<u8>), FabricError> {
        tokio::time::timeout(deadline, async {
            self.ensure_connected().await?;
            let endpoint = {
                let slot = self.endpoint.lock().await;
                slot.as_ref().ok_or_else(|| FabricError::internal("no endpoint"))?.clone()
            };
            let mut stream = endpoint.open_stream().await.map_err(FabricError::from)?;

            let request = Request::new(method, payload).direct_buffer();
            stream.write_all(&request.encode()).await.map_err(FabricError::from)?;
            stream.flush().await.map_err(FabricError::from)?;

            let framed = read_framed(&mut stream).await?;
            let response = Response::decode(&framed)?;
            if response.status != crate::codec::envelope::STATUS_DIRECT_BUFFER {
                return Err(response.into_error());
            }
            let header = crate::codec::DirectBufferHeader::decode_payload(&response.data)?;
            let mut bytes = vec![0u8; header.bytes_available as usize];
            stream.read_exact(&mut bytes).await.map_err(FabricError::from)?;
            Ok((header, bytes))
        })
        .await
        .map_err(|_| FabricError::timeout(format!("{method} exceeded deadline")))?
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let endpoint = self.endpoint.lock().await.take();
        if let Some(endpoint) = endpoint {
            endpoint.close().await;
        }
    }
}

async fn read_framed(stream: &mut MuxStream) -> Result<Vec<u8>, FabricError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(FabricError::from)?;
    let total_len = u32::from_le_bytes(len_buf) as usize;
    if total_len < 4 {
        return Err(FabricError::invalid("short frame header"));
    }
    let mut full = Vec::with_capacity(total_len);
    full.extend_from_slice(&len_buf);
    let mut rest = vec![0u8; total_len - 4];
    stream.read_exact(&mut rest).await.map_err(FabricError::from)?;
    full.extend_from_slice(&rest);
    Ok(full)
}

/// Agent-side driving loop (spec §4.3 "Reconnection", from the dialer's
/// perspective): dials the server, serves inbound streams through `router`
/// until the connection drops, then reconnects with exponential backoff and
/// repeats. Runs forever; intended as an agent process's main loop, since
/// the agent is the HTTP-upgrade initiator (it identifies itself via
/// `X-PBS-Agent`) while the server is the one that calls *into* it once
/// connected (spec §4.9 step 1, handled by [`serve_agents`] on the server
/// side).
pub async fn dial_and_serve(
    addr: impl Into<String>,
    path: impl Into<String>,
    identity: ClientIdentity,
    policy: ReconnectPolicy,
    router: Arc<Router>,
) -> ! {
    let addr = addr.into();
    let path = path.into();
    let mut backoff = policy.initial_backoff;
    loop {
        let mut socket = match TcpStream::connect(&addr).await {
            Ok(socket) => socket,
            Err(err) => {
                tracing::warn!(error = %err, "dial failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = policy.next_backoff(backoff);
                continue;
            }
        };
        if let Err(err) = connect_upgrade(&mut socket, &path, &addr, &identity).await {
            tracing::warn!(error = %err, "upgrade failed, retrying");
            tokio::time::sleep(backoff).await;
            backoff = policy.next_backoff(backoff);
            continue;
        }
        tracing::info!(%addr, "connected to server");
        backoff = policy.initial_backoff;

        let endpoint = MuxEndpoint::new(socket, Side::Client);
        loop {
            match endpoint.accept_stream().await {
                Some(Ok(stream)) => {
                    let router = router.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_stream(stream, router).await {
                            tracing::warn!(error = %err, "stream handling failed");
                        }
                    });
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "multiplexer error, reconnecting");
                    break;
                }
                None => break,
            }
        }
        tracing::warn!("connection to server lost, reconnecting");
        router.reset_connection_state().await;
    }
}

/// Server-side accept loop: one [`TcpListener`] spun up per listen address,
/// each inbound connection upgraded and multiplexed, each logical stream
/// dispatched through `router` independently (spec §4.3, §4.4).
pub async fn serve(listener: TcpListener, router: Arc<Router>) -> Result<(), FabricError> {
    loop {
        let (socket, peer) = listener.accept().await.map_err(FabricError::from)?;
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(socket, router).await {
                tracing::warn!(%peer, error = %err, "connection ended");
            }
        });
    }
}

async fn serve_connection(mut socket: TcpStream, router: Arc<Router>) -> Result<(), FabricError> {
    let accepted = accept_upgrade(&mut socket).await?;
    tracing::info!(hostname = ?accepted.hostname, version = ?accepted.agent_version, "peer connected");

    let endpoint = MuxEndpoint::new(socket, Side::Server);
    loop {
        match endpoint.accept_stream().await {
            Some(Ok(stream)) => {
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_stream(stream, router).await {
                        tracing::warn!(error = %err, "stream handling failed");
                    }
                });
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "multiplexer error");
                break;
            }
            None => break,
        }
    }
    // The transport just died: a caller that redials and reuses this same
    // job must not be able to reach handles opened over the dead
    // connection (spec §8 scenario 6).
    router.reset_connection_state().await;
    Ok(())
}

/// Server-side accept loop that, unlike [`serve`], registers each connected
/// peer into the [`crate::broker::Broker`] as an outbound-callable
/// [`ClientSession`] (spec §4.9 step 1/§4.10: the server locates an agent's
/// live session via the broker, then issues calls *into* it over the
/// connection the agent dialed). `router` still answers any inbound streams
/// the peer opens (`echo`/`ping` and whatever else was registered).
pub async fn serve_agents(
    listener: TcpListener,
    router: Arc<Router>,
    broker: Arc<crate::broker::Broker>,
) -> Result<(), FabricError> {
    loop {
        let (socket, peer) = listener.accept().await.map_err(FabricError::from)?;
        let router = router.clone();
        let broker = broker.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_agent_connection(socket, peer.to_string(), router, broker).await {
                tracing::warn!(%peer, error = %err, "agent connection ended");
            }
        });
    }
}

async fn serve_agent_connection(
    mut socket: TcpStream,
    peer_addr: String,
    router: Arc<Router>,
    broker: Arc<crate::broker::Broker>,
) -> Result<(), FabricError> {
    let accepted = accept_upgrade(&mut socket).await?;
    let hostname = accepted
        .hostname
        .clone()
        .ok_or_else(|| FabricError::invalid("agent did not present X-PBS-Agent"))?;
    tracing::info!(hostname = %hostname, version = ?accepted.agent_version, "agent connected");

    let endpoint = MuxEndpoint::new(socket, Side::Server);
    let identity = ClientIdentity {
        hostname: hostname.clone(),
        agent_version: accepted.agent_version.clone().unwrap_or_default(),
    };
    let session = Arc::new(ClientSession::from_endpoint(endpoint, peer_addr, identity));
    broker.register(hostname.clone(), session.clone()).await;

    let accept_loop = async {
        loop {
            // Clone the endpoint handle and release the session lock before
            // the (potentially long) `accept_stream` await: `call`/`call_direct_buffer`
            // on the same session need that lock too, just briefly, to open
            // their own outbound stream (spec §4.9 step 1/§4.10).
            let endpoint = {
                let slot = session.endpoint.lock().await;
                match slot.as_ref() {
                    Some(endpoint) => endpoint.clone(),
                    None => break,
                }
            };
            match endpoint.accept_stream().await {
                Some(Ok(stream)) => {
                    let router = router.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_stream(stream, router).await {
                            tracing::warn!(error = %err, "stream handling failed");
                        }
                    });
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "multiplexer error");
                    break;
                }
                None => break,
            }
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = session.wait_closed() => {}
    }
    broker.unregister(&hostname).await;
    router.reset_connection_state().await;
    Ok(())
}

async fn serve_stream(mut stream: MuxStream, router: Arc<Router>) -> Result<(), FabricError> {
    let framed = read_framed(&mut stream).await?;
    let request = match Request::decode(&framed) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(error = %err, "malformed request, responding 400");
            let response = Response {
                status: crate::codec::envelope::STATUS_BAD_REQUEST,
                message: "malformed request".to_string(),
                data: Vec::new(),
            };
            stream.write_all(&response.encode()).await.map_err(FabricError::from)?;
            stream.flush().await.map_err(FabricError::from)?;
            return Ok(());
        }
    };

    match router.dispatch(request).await {
        DispatchOutcome::Respond(response) => {
            stream.write_all(&response.encode()).await.map_err(FabricError::from)?;
        }
        DispatchOutcome::DirectBuffer { metadata, bytes } => {
            stream.write_all(&metadata.encode()).await.map_err(FabricError::from)?;
            stream.write_all(&bytes).await.map_err(FabricError::from)?;
        }
    }
    stream.flush().await.map_err(FabricError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = ReconnectPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        };
        let mut backoff = policy.initial_backoff;
        backoff = policy.next_backoff(backoff);
        assert_eq!(backoff, Duration::from_millis(200));
        backoff = policy.next_backoff(backoff);
        assert_eq!(backoff, Duration::from_millis(400));
        backoff = policy.next_backoff(backoff);
        assert_eq!(backoff, Duration::from_millis(500));
        backoff = policy.next_backoff(backoff);
        assert_eq!(backoff, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn end_to_end_call_round_trips() {
        let router = Arc::new(Router::new());
        router
            .register(
                "echo",
                Arc::new(|req| {
                    Box::pin(async move {
                        Ok(crate::router::HandlerReply::Struct(req.payload))
                    })
                }),
            )
            .await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, router));

        let identity = ClientIdentity { hostname: "agent-1".into(), agent_version: "0.1".into() };
        let session = ClientSession::new(addr.to_string(), "/arpc", identity);

        let response = session
            .call("echo", vec![1, 2, 3], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn direct_buffer_call_streams_raw_bytes() {
        let router = Arc::new(Router::new());
        router
            .register(
                "job/ReadAt",
                Arc::new(|_req| {
                    Box::pin(async move {
                        Ok(crate::router::HandlerReply::DirectBuffer { bytes: vec![7; 32], eof: true })
                    })
                }),
            )
            .await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, router));

        let identity = ClientIdentity { hostname: "agent-1".into(), agent_version: "0.1".into() };
        let session = ClientSession::new(addr.to_string(), "/arpc", identity);

        let (header, bytes) = session
            .call_direct_buffer("job/ReadAt", vec![], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(header.eof);
        assert_eq!(bytes.len(), 32);
    }

    #[tokio::test]
    async fn server_calls_into_agent_over_the_connection_the_agent_dialed() {
        let agent_router = Arc::new(Router::new());
        agent_router
            .register(
                "echo",
                Arc::new(|req| Box::pin(async move { Ok(crate::router::HandlerReply::Struct(req.payload)) })),
            )
            .await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let broker = Arc::new(crate::broker::Broker::new());
        tokio::spawn(serve_agents(listener, Arc::new(Router::new()), broker.clone()));

        let identity = ClientIdentity { hostname: "agent-xyz".into(), agent_version: "1".into() };
        tokio::spawn(dial_and_serve(
            addr.to_string(),
            "/arpc",
            identity,
            ReconnectPolicy::default(),
            agent_router,
        ));

        let mut found = None;
        for _ in 0..100 {
            if let Some(session) = broker.get("agent-xyz").await {
                found = Some(session);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let session = found.expect("agent registered itself in the broker");

        let response = session.call("echo", vec![9, 9], Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.data, vec![9, 9]);
    }
}
