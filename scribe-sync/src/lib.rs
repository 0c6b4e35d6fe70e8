//! # scribe-sync: Collaborative document sync engine
//!
//! Many clients edit the same document at once and converge without a
//! central lock. Any number of stateless gateway processes stay consistent
//! through a shared update log and a cross-process fan-out channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  WebSocket   ┌──────────────┐  persist   ┌──────────────────┐
//! │ Client   │ ◄──────────► │ Gateway      │ ─────────► │ SyncService      │
//! │ (yrs doc)│  raw updates │ + Registry   │  load      │ log + snapshots  │
//! └──────────┘              └──────┬───────┘ ◄───────── └────────┬─────────┘
//!                                  │ publish / deliver           │
//!                                  ▼                             ▼
//!                           ┌──────────────┐           ┌──────────────────┐
//!                           │ Fanout       │           │ DocumentStore    │
//!                           │ local or hub │           │ RocksDB or SQL   │
//!                           └──────────────┘           └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: Mergeable document capability and the yrs implementation
//! - [`storage`]: Update log and snapshot store (RocksDB, SQLite/PostgreSQL)
//! - [`sync`]: Load, persist and compaction
//! - [`fanout`]: Publish/subscribe per document, in-process or via hub
//! - [`registry`]: Per-process connection rooms
//! - [`gateway`]: WebSocket sessions
//! - [`auth`]: Credential → user resolution
//! - [`protocol`]: Close codes and hub frames

pub mod auth;
pub mod document;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use auth::{AuthError, IdentityProvider, JwtIdentity, TokenTable};
pub use document::{DocumentError, MergeableDocument, YrsDocument, CONTENT_ROOT};
pub use error::{CollabError, Result};
pub use fanout::{
    channel_name, Fanout, FanoutConfig, FanoutError, FanoutHub, FanoutMessage, FanoutStats,
    HubConfig, HubFanout, HubStats, LocalFanout, MessageHandler, Subscription,
};
pub use gateway::{Gateway, GatewayConfig, GatewayStats, SessionPhase};
pub use protocol::{HubFrame, ProtocolError};
pub use registry::{ConnectionRegistry, RoomMembership};
pub use storage::{
    DbKind, DocumentSnapshot, DocumentStore, DocumentUpdate, RocksStore, SnapshotStore, SqlStore,
    StoreConfig, StoreError, UpdateLog,
};
pub use sync::{SyncConfig, SyncService};
