//! WebSocket gateway: one session per client connection.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /ws/doc/{id}?token=…
//!            ├── Gateway ── SyncService ── DocumentStore
//! Client B ──┘      │            (persist / load)
//!                   │
//!                   ├── ConnectionRegistry ◄── Fanout (deliver)
//!                   └──────────────────────►  Fanout (publish)
//! ```
//!
//! Session lifecycle:
//! ```text
//! Connecting ──auth ok──► Authenticated ──join + initial state──► Streaming ──► Closed
//!      │                                                                        ▲
//!      └──── missing/invalid credential: close 4001 ────────────────────────────┘
//! ```
//!
//! Updates from one connection are persisted and then published strictly in
//! the order they were received.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::{AuthError, IdentityProvider};
use crate::document::{MergeableDocument, YrsDocument};
use crate::error::CollabError;
use crate::fanout::{Fanout, FanoutMessage};
use crate::protocol::{CLOSE_AUTH_FAILED, CLOSE_INTERNAL_ERROR, CLOSE_INVALID_DOCUMENT};
use crate::registry::ConnectionRegistry;
use crate::sync::SyncService;

/// Path prefix clients connect to, followed by the document id.
pub const DOCUMENT_PATH_PREFIX: &str = "/ws/doc/";

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// How long to wait for the client's close reply
    pub close_timeout: Duration,
    /// Remote updates queued per connection before new ones are dropped
    pub outbound_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            close_timeout: Duration::from_secs(1),
            outbound_capacity: 256,
        }
    }
}

impl GatewayConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            close_timeout: Duration::from_millis(200),
            outbound_capacity: 64,
        }
    }
}

/// Gateway counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub auth_failures: u64,
    pub updates_persisted: u64,
    pub updates_rejected: u64,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub active_documents: usize,
}

#[derive(Default)]
struct AtomicGatewayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    auth_failures: AtomicU64,
    updates_persisted: AtomicU64,
    updates_rejected: AtomicU64,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Authenticated,
    Streaming,
    Closed,
}

impl SessionPhase {
    /// Whether `next` is a legal successor of this phase.
    pub fn can_advance_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Authenticated, Streaming)
                | (Connecting, Closed)
                | (Authenticated, Closed)
                | (Streaming, Closed)
        )
    }
}

struct Session {
    connection_id: Uuid,
    addr: SocketAddr,
    phase: SessionPhase,
}

impl Session {
    fn advance(&mut self, next: SessionPhase) {
        if !self.phase.can_advance_to(next) {
            log::error!(
                "Connection {} ({}): illegal transition {:?} → {:?}",
                self.connection_id,
                self.addr,
                self.phase,
                next
            );
        }
        log::debug!("Connection {} {:?} → {:?}", self.connection_id, self.phase, next);
        self.phase = next;
    }
}

/// What the upgrade request told us, captured during the handshake.
#[derive(Debug, Default, Clone)]
struct UpgradeRequest {
    path: String,
    query: Option<String>,
    authorization: Option<String>,
}

impl UpgradeRequest {
    fn capture(req: &Request) -> Self {
        Self {
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            authorization: req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }
}

/// Document id from `/ws/doc/{id}`.
pub fn parse_document_path(path: &str) -> Option<Uuid> {
    let rest = path.strip_prefix(DOCUMENT_PATH_PREFIX)?;
    Uuid::parse_str(rest.trim_end_matches('/')).ok()
}

/// Bearer credential from `?token=` or an `Authorization: Bearer` header.
pub fn extract_token(query: Option<&str>, authorization: Option<&str>) -> Option<String> {
    let from_query = query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    });
    let from_header = authorization
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());

    from_query
        .into_iter()
        .chain(from_header)
        .find(|t| !t.is_empty())
}

/// Accepts client sessions and wires them to storage and fanout.
pub struct Gateway<D: MergeableDocument = YrsDocument> {
    config: GatewayConfig,
    sync: SyncService<D>,
    registry: Arc<ConnectionRegistry>,
    identity: Arc<dyn IdentityProvider>,
    stats: Arc<AtomicGatewayStats>,
}

impl<D: MergeableDocument> Gateway<D> {
    pub fn new(
        config: GatewayConfig,
        sync: SyncService<D>,
        fanout: Arc<dyn Fanout>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            config,
            sync,
            registry: Arc::new(ConnectionRegistry::new(fanout)),
            identity,
            stats: Arc::new(AtomicGatewayStats::default()),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Gateway listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let gateway = self.clone();
            tokio::spawn(async move {
                gateway.stats.total_connections.fetch_add(1, Ordering::Relaxed);
                gateway.stats.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = gateway.handle_connection(stream, addr).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
                gateway.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), WsError> {
        let mut upgrade = UpgradeRequest::default();
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            upgrade = UpgradeRequest::capture(req);
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

        let mut session = Session {
            connection_id: Uuid::new_v4(),
            addr,
            phase: SessionPhase::Connecting,
        };

        let Some(document_id) = parse_document_path(&upgrade.path) else {
            log::info!("Rejecting {addr}: bad document path {}", upgrade.path);
            session.advance(SessionPhase::Closed);
            return self
                .close(&mut ws, CLOSE_INVALID_DOCUMENT, "Invalid document path")
                .await;
        };

        let credential = extract_token(upgrade.query.as_deref(), upgrade.authorization.as_deref());
        let resolved = match credential {
            Some(token) => self.identity.resolve(&token).await,
            None => Err(AuthError::Missing),
        };
        let user_id = match resolved {
            Ok(user_id) => user_id,
            Err(e) => {
                self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
                log::info!("Authentication failed for {addr} on {document_id}: {e}");
                session.advance(SessionPhase::Closed);
                return self.close(&mut ws, CLOSE_AUTH_FAILED, &e.to_string()).await;
            }
        };
        session.advance(SessionPhase::Authenticated);
        log::info!(
            "User {user_id} connected to {document_id} as {} from {addr}",
            session.connection_id
        );

        let capacity = self.config.outbound_capacity.max(1);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(capacity);
        let membership = match self
            .registry
            .join(document_id, session.connection_id, out_tx)
            .await
        {
            Ok(membership) => membership,
            Err(e) => {
                log::error!("Subscription for {document_id} failed: {e}");
                session.advance(SessionPhase::Closed);
                return self.close(&mut ws, CLOSE_INTERNAL_ERROR, "Subscription failed").await;
            }
        };

        let initial = match self.sync.load_document_state(document_id).await {
            Ok(doc) => doc.encode_full(),
            Err(e) => {
                log::error!("Loading {document_id} failed: {e}");
                membership.leave().await;
                session.advance(SessionPhase::Closed);
                return self.close(&mut ws, CLOSE_INTERNAL_ERROR, "Storage failure").await;
            }
        };
        if let Err(e) = ws.send(Message::Binary(initial.into())).await {
            membership.leave().await;
            session.advance(SessionPhase::Closed);
            return Err(e);
        }
        session.advance(SessionPhase::Streaming);

        let (mut ws_sender, mut ws_receiver) = ws.split();
        let result: Result<(), WsError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            match self.sync.persist_update(document_id, user_id, &data).await {
                                Ok(update) => {
                                    self.stats.updates_persisted.fetch_add(1, Ordering::Relaxed);
                                    let message = FanoutMessage::new(
                                        document_id,
                                        session.connection_id,
                                        data.to_vec(),
                                    );
                                    if let Err(e) = self.registry.fanout().publish(document_id, message).await {
                                        log::warn!(
                                            "Publish of {document_id}#{} failed: {e}",
                                            update.sequence
                                        );
                                    }
                                }
                                Err(CollabError::CorruptUpdate(reason)) => {
                                    self.stats.updates_rejected.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Rejected corrupt update from {}: {reason}", session.connection_id);
                                    let notice = format!("corrupt update: {reason}");
                                    ws_sender.send(Message::Text(notice.into())).await?;
                                }
                                Err(e) => {
                                    log::error!("Persist for {document_id} failed: {e}");
                                    ws_sender
                                        .send(Message::Close(Some(close_frame(CLOSE_INTERNAL_ERROR, "Storage failure"))))
                                        .await?;
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {} closed by {addr}", session.connection_id);
                            break;
                        }
                        Some(Err(e)) => return Err(e),
                        Some(Ok(other)) => {
                            log::debug!("Ignoring non-binary frame from {addr}: {other:?}");
                        }
                    },
                    Some(payload) = out_rx.recv() => {
                        ws_sender.send(Message::Binary(payload.into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        membership.leave().await;
        session.advance(SessionPhase::Closed);
        result
    }

    async fn close(
        &self,
        ws: &mut WebSocketStream<TcpStream>,
        code: u16,
        reason: &str,
    ) -> Result<(), WsError> {
        ws.close(Some(close_frame(code, reason))).await?;
        // Let the client's close reply arrive so the handshake completes
        let _ = tokio::time::timeout(self.config.close_timeout, async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
        Ok(())
    }

    pub fn sync(&self) -> &SyncService<D> {
        &self.sync
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            auth_failures: self.stats.auth_failures.load(Ordering::Relaxed),
            updates_persisted: self.stats.updates_persisted.load(Ordering::Relaxed),
            updates_rejected: self.stats.updates_rejected.load(Ordering::Relaxed),
            frames_forwarded: self.registry.frames_forwarded(),
            frames_dropped: self.registry.frames_dropped(),
            active_documents: self.registry.room_count(),
        }
    }
}

fn close_frame(code: u16, reason: &str) -> CloseFrame {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_config_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbound_capacity, 256);
    }

    #[test]
    fn test_parse_document_path() {
        let id = Uuid::new_v4();
        assert_eq!(parse_document_path(&format!("/ws/doc/{id}")), Some(id));
        assert_eq!(parse_document_path(&format!("/ws/doc/{id}/")), Some(id));
        assert_eq!(parse_document_path("/ws/doc/not-a-uuid"), None);
        assert_eq!(parse_document_path(&format!("/other/{id}")), None);
        assert_eq!(parse_document_path("/ws/doc/"), None);
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(extract_token(Some("token=abc"), None), Some("abc".into()));
        assert_eq!(extract_token(Some("x=1&token=a%20b"), None), Some("a b".into()));
        assert_eq!(extract_token(None, Some("Bearer xyz")), Some("xyz".into()));
        assert_eq!(extract_token(Some("token="), Some("Bearer xyz")), Some("xyz".into()));
        assert_eq!(extract_token(Some("token=q"), Some("Bearer h")), Some("q".into()));
        assert_eq!(extract_token(Some("other=1"), Some("Basic zzz")), None);
        assert_eq!(extract_token(None, None), None);
    }

    #[test]
    fn test_session_phase_transitions() {
        use SessionPhase::*;
        assert!(Connecting.can_advance_to(Authenticated));
        assert!(Authenticated.can_advance_to(Streaming));
        assert!(Streaming.can_advance_to(Closed));
        assert!(Connecting.can_advance_to(Closed));
        assert!(!Connecting.can_advance_to(Streaming));
        assert!(!Closed.can_advance_to(Connecting));
        assert!(!Streaming.can_advance_to(Authenticated));
    }

    #[test]
    fn test_close_frame_codes() {
        let frame = close_frame(CLOSE_AUTH_FAILED, "Missing token");
        assert_eq!(u16::from(frame.code), 4001);
        assert_eq!(frame.reason.as_str(), "Missing token");
    }
}
