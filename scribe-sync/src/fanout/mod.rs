//! Cross-process fan-out of document updates.
//!
//! ```text
//! gateway A ──publish──►┌──────────────────────┐──deliver──► gateway A
//!                       │ channel              │──deliver──► gateway B
//! gateway B ──publish──►│ "doc:<id>:updates"   │──deliver──► gateway C
//!                       └──────────────────────┘
//!                        LocalFanout (one process)
//!                        HubFanout → FanoutHub (many processes)
//! ```
//!
//! Delivery is at-most-once and best effort. A process that misses a message
//! still converges, because clients reload full state from the store on
//! reconnect.

pub mod hub;
pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::ProtocolError;

pub use hub::{FanoutHub, HubConfig, HubFanout, HubStats};
pub use local::{FanoutConfig, FanoutStats, LocalFanout};

/// Envelope carried on a document channel. Clients only ever see `payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutMessage {
    pub document_id: Uuid,
    /// Connection that produced the update; it must not receive it back
    pub origin: Uuid,
    pub payload: Vec<u8>,
}

impl FanoutMessage {
    pub fn new(document_id: Uuid, origin: Uuid, payload: Vec<u8>) -> Self {
        Self {
            document_id,
            origin,
            payload,
        }
    }
}

/// Channel name for a document's update stream.
pub fn channel_name(document_id: Uuid) -> String {
    format!("doc:{document_id}:updates")
}

/// Callback invoked once per delivered message.
pub type MessageHandler = Arc<dyn Fn(FanoutMessage) + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum FanoutError {
    #[error("fanout transport unavailable: {0}")]
    Unavailable(String),

    #[error("subscription to {channel} was not acknowledged")]
    NotAcknowledged { channel: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<tokio_tungstenite::tungstenite::Error> for FanoutError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        FanoutError::Unavailable(e.to_string())
    }
}

/// Publish/subscribe transport keyed by document.
#[async_trait]
pub trait Fanout: Send + Sync {
    /// Broadcast to every subscriber of the document's channel, in every process.
    async fn publish(&self, document_id: Uuid, message: FanoutMessage) -> Result<(), FanoutError>;

    /// Start delivering the document's channel to `handler`.
    async fn subscribe(
        &self,
        document_id: Uuid,
        handler: MessageHandler,
    ) -> Result<Subscription, FanoutError>;
}

/// Handle to a running subscriber task.
///
/// The task owns its cleanup and runs it once when its loop exits, whether
/// that exit came from [`Subscription::cancel`], from dropping the handle, or
/// from the transport going away.
pub struct Subscription {
    channel: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(channel: String, shutdown: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            channel,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether the subscriber task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Stop delivery and wait until the subscriber task has cleaned up.
    pub async fn cancel(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Subscriber task for {} ended abnormally: {e}", self.channel);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("finished", &self.is_finished())
            .finish()
    }
}
