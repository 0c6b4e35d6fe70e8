//! Cross-process fan-out through a WebSocket relay.
//!
//! Architecture:
//! ```text
//! gateway 1 ── HubFanout ──┐  publisher socket      ┌──────────────┐
//!                          ├──────────────────────► │  FanoutHub   │
//!                          │  one socket per        │  LocalFanout │
//! gateway 2 ── HubFanout ──┤  subscribed document ◄─│  per channel │
//!                          │                        └──────────────┘
//! ```
//!
//! The hub is stateless: it keeps no history and never touches the store.
//! A subscription is live once the hub has answered `Subscribed`, so a
//! publish issued after `subscribe` returns is guaranteed to be routed to it.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::local::{FanoutConfig, LocalFanout};
use super::{channel_name, Fanout, FanoutError, FanoutMessage, MessageHandler, Subscription};
use crate::protocol::{HubFrame, ProtocolError};

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Messages buffered per subscribed socket before it starts dropping
    pub channel_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            channel_capacity: 1024,
        }
    }
}

impl HubConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            channel_capacity: 64,
        }
    }
}

/// Hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_relayed: u64,
    /// Deliveries lost because a subscriber socket fell behind
    pub frames_dropped: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_relayed: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Relay process joining gateways on shared channels.
pub struct FanoutHub {
    config: HubConfig,
    fanout: LocalFanout,
    stats: Arc<AtomicHubStats>,
}

impl FanoutHub {
    pub fn new(config: HubConfig) -> Self {
        let fanout = LocalFanout::new(FanoutConfig {
            channel_capacity: config.channel_capacity,
        });
        Self {
            config,
            fanout,
            stats: Arc::new(AtomicHubStats::default()),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Fanout hub listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New hub connection from {addr}");

            let fanout = self.fanout.clone();
            let stats = self.stats.clone();
            let capacity = self.config.channel_capacity.max(1);
            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);
                let result =
                    Self::handle_connection(stream, addr, &fanout, &stats, capacity).await;
                if let Err(e) = result {
                    log::warn!("Hub connection error from {addr}: {e}");
                }
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        fanout: &LocalFanout,
        stats: &Arc<AtomicHubStats>,
        capacity: usize,
    ) -> Result<(), FanoutError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (deliver_tx, mut deliver_rx) = mpsc::channel::<Vec<u8>>(capacity);
        let mut subscriptions: HashMap<String, Subscription> = HashMap::new();

        let result: Result<(), FanoutError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let frame = match HubFrame::decode(&data) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Dropping undecodable hub frame from {addr}: {e}");
                                    continue;
                                }
                            };
                            match frame {
                                HubFrame::Subscribe { channel } => {
                                    if !subscriptions.contains_key(&channel) {
                                        let handler = Self::deliver_handler(&channel, deliver_tx.clone(), stats.clone());
                                        let sub = fanout.subscribe_channel(&channel, handler);
                                        subscriptions.insert(channel.clone(), sub);
                                        log::debug!("{addr} subscribed to {channel}");
                                    }
                                    let ack = HubFrame::Subscribed { channel }.encode()?;
                                    ws_sender.send(Message::Binary(ack.into())).await?;
                                }
                                HubFrame::Unsubscribe { channel } => {
                                    if let Some(sub) = subscriptions.remove(&channel) {
                                        sub.cancel().await;
                                    }
                                }
                                HubFrame::Publish { channel, message } => {
                                    fanout.publish_channel(&channel, message);
                                    stats.frames_relayed.fetch_add(1, Ordering::Relaxed);
                                }
                                other => {
                                    log::debug!("Ignoring unexpected hub frame on {}", other.channel());
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    },
                    Some(bytes) = deliver_rx.recv() => {
                        ws_sender.send(Message::Binary(bytes.into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        for (_, sub) in subscriptions.drain() {
            sub.cancel().await;
        }
        log::debug!("Hub connection from {addr} closed");
        result
    }

    fn deliver_handler(
        channel: &str,
        out: mpsc::Sender<Vec<u8>>,
        stats: Arc<AtomicHubStats>,
    ) -> MessageHandler {
        let channel = channel.to_string();
        Arc::new(move |message: FanoutMessage| {
            let frame = HubFrame::Deliver {
                channel: channel.clone(),
                message,
            };
            let bytes = match frame.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("Failed to encode delivery on {channel}: {e}");
                    return;
                }
            };
            if let Err(TrySendError::Full(_)) = out.try_send(bytes) {
                stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Subscriber socket on {channel} is behind, dropping delivery");
            }
        })
    }

    /// In-process view of the relayed channels.
    pub fn local(&self) -> &LocalFanout {
        &self.fanout
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_relayed: self.stats.frames_relayed.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Gateway-side client of a [`FanoutHub`].
///
/// Each subscription owns its socket. When the hub goes away the subscriber
/// reconnects with exponential backoff and subscribes again; messages
/// published while it was disconnected are lost.
pub struct HubFanout {
    url: String,
    ack_timeout: Duration,
    reconnect_backoff: Duration,
    max_reconnect_backoff: Duration,
    /// Lazily opened; reopened once when a send fails
    publisher: Mutex<Option<ClientStream>>,
}

/// What a subscriber task needs to re-establish its subscription.
#[derive(Debug, Clone)]
struct SubscriberLink {
    url: String,
    channel: String,
    ack_timeout: Duration,
    reconnect_backoff: Duration,
    max_reconnect_backoff: Duration,
}

impl HubFanout {
    /// `url` is the hub's WebSocket address, e.g. `ws://127.0.0.1:9191`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ack_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_millis(100),
            max_reconnect_backoff: Duration::from_secs(5),
            publisher: Mutex::new(None),
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// First reconnect delay and its cap; the delay doubles per failed attempt.
    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_backoff = initial;
        self.max_reconnect_backoff = max.max(initial);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn open(url: &str) -> Result<ClientStream, FanoutError> {
        let (stream, _) = tokio_tungstenite::connect_async(url).await?;
        Ok(stream)
    }

    async fn send_publish(&self, frame: Vec<u8>) -> Result<(), FanoutError> {
        let mut publisher = self.publisher.lock().await;

        if let Some(stream) = publisher.as_mut() {
            match stream.send(Message::Binary(frame.clone().into())).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("Hub publisher connection lost ({e}), reconnecting");
                    *publisher = None;
                }
            }
        }

        let mut stream = Self::open(&self.url).await?;
        stream.send(Message::Binary(frame.into())).await?;
        *publisher = Some(stream);
        Ok(())
    }

    /// Open a socket, subscribe, and wait for the hub's acknowledgement.
    async fn open_subscription(link: &SubscriberLink) -> Result<ClientStream, FanoutError> {
        let mut stream = Self::open(&link.url).await?;
        let request = HubFrame::Subscribe {
            channel: link.channel.clone(),
        }
        .encode()?;
        stream.send(Message::Binary(request.into())).await?;

        let ack = Self::await_ack(&mut stream, &link.channel);
        match tokio::time::timeout(link.ack_timeout, ack).await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FanoutError::NotAcknowledged {
                channel: link.channel.clone(),
            }),
        }
    }

    async fn await_ack(stream: &mut ClientStream, channel: &str) -> Result<(), FanoutError> {
        while let Some(msg) = stream.next().await {
            match msg? {
                Message::Binary(data) => match HubFrame::decode(&data)? {
                    HubFrame::Subscribed { channel: acked } if acked == channel => return Ok(()),
                    other => {
                        return Err(ProtocolError::UnexpectedFrame(format!("{other:?}")).into());
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(ProtocolError::ConnectionClosed.into())
    }

    /// Subscriber task body: deliver, and resubscribe whenever the socket drops.
    async fn run_subscriber(
        mut stream: ClientStream,
        link: SubscriberLink,
        handler: MessageHandler,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            let cancelled =
                Self::deliver_until_lost(&mut stream, &link.channel, &handler, &mut shutdown_rx)
                    .await;
            if cancelled {
                if let Ok(bytes) = (HubFrame::Unsubscribe {
                    channel: link.channel.clone(),
                })
                .encode()
                {
                    let _ = stream.send(Message::Binary(bytes.into())).await;
                }
                let _ = stream.close(None).await;
                break;
            }

            match Self::resubscribe(&link, &mut shutdown_rx).await {
                Some(fresh) => stream = fresh,
                None => break,
            }
        }
        log::debug!("Subscription {} closed", link.channel);
    }

    /// Returns `true` when cancelled, `false` when the hub connection was lost.
    async fn deliver_until_lost(
        stream: &mut ClientStream,
        channel: &str,
        handler: &MessageHandler,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> bool {
        loop {
            tokio::select! {
                _ = &mut *shutdown_rx => return true,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(data))) => match HubFrame::decode(&data) {
                        Ok(HubFrame::Deliver { message, .. }) => handler(message),
                        Ok(other) => log::debug!("Ignoring hub frame {other:?}"),
                        Err(e) => log::warn!("Undecodable frame on {channel}: {e}"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = stream.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::warn!("Hub closed subscription {channel}");
                        return false;
                    }
                    Some(Err(e)) => {
                        log::warn!("Hub subscription {channel} failed: {e}");
                        return false;
                    }
                    _ => {}
                },
            }
        }
    }

    /// Reconnect with backoff until subscribed again. `None` if cancelled.
    async fn resubscribe(
        link: &SubscriberLink,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> Option<ClientStream> {
        let mut backoff = link.reconnect_backoff;
        let mut attempt: u32 = 0;
        loop {
            tokio::select! {
                _ = &mut *shutdown_rx => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
            tokio::select! {
                _ = &mut *shutdown_rx => return None,
                result = Self::open_subscription(link) => match result {
                    Ok(stream) => {
                        log::info!("Resubscribed to {} after {attempt} attempt(s)", link.channel);
                        return Some(stream);
                    }
                    Err(e) => {
                        log::debug!("Resubscribe to {} failed: {e}", link.channel);
                        backoff = backoff.saturating_mul(2).min(link.max_reconnect_backoff);
                    }
                },
            }
        }
    }
}

#[async_trait]
impl Fanout for HubFanout {
    async fn publish(&self, document_id: Uuid, message: FanoutMessage) -> Result<(), FanoutError> {
        let frame = HubFrame::Publish {
            channel: channel_name(document_id),
            message,
        }
        .encode()?;
        self.send_publish(frame).await
    }

    async fn subscribe(
        &self,
        document_id: Uuid,
        handler: MessageHandler,
    ) -> Result<Subscription, FanoutError> {
        let link = SubscriberLink {
            url: self.url.clone(),
            channel: channel_name(document_id),
            ack_timeout: self.ack_timeout,
            reconnect_backoff: self.reconnect_backoff,
            max_reconnect_backoff: self.max_reconnect_backoff,
        };
        let stream = Self::open_subscription(&link).await?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let channel = link.channel.clone();
        let task = tokio::spawn(Self::run_subscriber(stream, link, handler, shutdown_rx));

        Ok(Subscription::new(channel, shutdown_tx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_config_default() {
        let config = HubConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9191");
        assert_eq!(config.channel_capacity, 1024);
    }

    #[test]
    fn test_hub_stats_initial() {
        let hub = FanoutHub::new(HubConfig::for_testing());
        assert_eq!(hub.stats(), HubStats::default());
        assert_eq!(hub.local().topic_count(), 0);
    }

    #[test]
    fn test_slow_subscriber_drops_deliveries() {
        let hub = FanoutHub::new(HubConfig::for_testing());
        let (tx, mut rx) = mpsc::channel(1);
        let handler = FanoutHub::deliver_handler("doc:x", tx, hub.stats.clone());

        let doc = Uuid::new_v4();
        for i in 0..3u8 {
            handler(FanoutMessage::new(doc, Uuid::nil(), vec![i]));
        }

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.stats().frames_dropped, 2);
    }

    #[tokio::test]
    async fn test_publish_to_unreachable_hub_fails() {
        // Port 1 on loopback is never a WebSocket server
        let fanout = HubFanout::new("ws://127.0.0.1:1");
        let doc = Uuid::new_v4();
        let err = fanout
            .publish(doc, FanoutMessage::new(doc, Uuid::nil(), vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::Unavailable(_)));
    }
}
