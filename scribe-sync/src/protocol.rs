//! Wire constants and the binary hub protocol.
//!
//! Client ↔ gateway frames carry opaque document updates verbatim, so the
//! only protocol surface there is the set of close codes. Gateway ↔ hub
//! traffic is framed as bincode-encoded [`HubFrame`]s:
//! ```text
//! gateway                     hub
//!   │── Subscribe{channel} ────►│
//!   │◄──── Subscribed{channel} ─│
//!   │── Publish{channel,msg} ──►│──► Deliver to every socket subscribed to channel
//!   │◄── Deliver{channel,msg} ──│
//!   │── Unsubscribe{channel} ──►│
//! ```
//!
//! The hub does not filter by origin; the publishing gateway receives its own
//! message back and its registry skips the originating connection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fanout::FanoutMessage;

/// Bad or missing credential.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Upgrade path did not name a document.
pub const CLOSE_INVALID_DOCUMENT: u16 = 4004;
/// Storage or subscription failure on the server side.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Frame exchanged between a gateway process and the fanout hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubFrame {
    Subscribe { channel: String },
    /// Hub acknowledgement; deliveries for `channel` follow.
    Subscribed { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String, message: FanoutMessage },
    Deliver { channel: String, message: FanoutMessage },
}

impl HubFrame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    pub fn channel(&self) -> &str {
        match self {
            HubFrame::Subscribe { channel }
            | HubFrame::Subscribed { channel }
            | HubFrame::Unsubscribe { channel }
            | HubFrame::Publish { channel, .. }
            | HubFrame::Deliver { channel, .. } => channel,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),
    #[error("connection closed")]
    ConnectionClosed,
}
