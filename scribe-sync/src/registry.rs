//! Per-process set of live connections, grouped by document.
//!
//! ```text
//! ConnectionRegistry
//!   rooms: doc_id → Room { generation, peers: conn_id → outbound, subscription }
//!                                  ▲
//!   fanout delivery ───────────────┘ forwarded to every peer except origin
//! ```
//!
//! The first local member of a document opens the fanout subscription; the
//! last one to leave cancels it. Exactly one subscription exists per
//! document per process, so each remote update reaches each local
//! connection once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::fanout::{Fanout, FanoutError, FanoutMessage, MessageHandler, Subscription};

/// Outbound queue of a single connection; carries raw update payloads.
/// Bounded: a connection that cannot keep up loses frames, not memory.
pub type Outbound = mpsc::Sender<Vec<u8>>;

struct Room {
    /// Distinguishes a room's current subscription from earlier ones
    generation: u64,
    peers: HashMap<Uuid, Outbound>,
    subscription: Option<Subscription>,
}

impl Room {
    fn is_live(&self) -> bool {
        self.subscription.as_ref().is_some_and(|s| !s.is_finished())
    }
}

struct RegistryInner {
    rooms: Mutex<HashMap<Uuid, Room>>,
    next_generation: AtomicU64,
    frames_forwarded: AtomicU64,
    frames_dropped: AtomicU64,
}

impl RegistryInner {
    fn rooms(&self) -> MutexGuard<'_, HashMap<Uuid, Room>> {
        self.rooms.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn deliver(&self, document_id: Uuid, generation: u64, message: &FanoutMessage) {
        let rooms = self.rooms();
        let Some(room) = rooms.get(&document_id) else {
            return;
        };
        if room.generation != generation {
            return;
        }
        for (connection_id, outbound) in &room.peers {
            if *connection_id == message.origin {
                continue;
            }
            match outbound.try_send(message.payload.clone()) {
                Ok(()) => {
                    self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Outbound queue of {connection_id} full, dropping update for {document_id}");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Remove a peer. Returns the room's subscription if it was the last one.
    fn remove(&self, document_id: Uuid, connection_id: Uuid) -> Option<Subscription> {
        let mut rooms = self.rooms();
        let room = rooms.get_mut(&document_id)?;
        room.peers.remove(&connection_id);
        if !room.peers.is_empty() {
            return None;
        }
        let room = rooms.remove(&document_id)?;
        log::debug!("Room {document_id} removed (empty)");
        room.subscription
    }
}

type SubscribeLock = Arc<tokio::sync::Mutex<()>>;

/// Local connections per document, bound to one fanout transport.
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
    fanout: Arc<dyn Fanout>,
    /// Serializes subscription creation per document
    subscribe_locks: Mutex<HashMap<Uuid, SubscribeLock>>,
}

impl ConnectionRegistry {
    pub fn new(fanout: Arc<dyn Fanout>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                frames_forwarded: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
            fanout,
            subscribe_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn fanout(&self) -> &Arc<dyn Fanout> {
        &self.fanout
    }

    /// Register a connection. Opens the document subscription if this is the
    /// first local member, or if the room's subscription has died.
    pub async fn join(
        &self,
        document_id: Uuid,
        connection_id: Uuid,
        outbound: Outbound,
    ) -> Result<RoomMembership, FanoutError> {
        if self.try_join_live(document_id, connection_id, &outbound) {
            return Ok(self.membership(document_id, connection_id));
        }

        let lock = self.subscribe_lock(document_id);
        let result = self
            .join_subscribing(document_id, connection_id, outbound, &lock)
            .await;
        self.release_subscribe_lock(document_id, lock);
        result
    }

    async fn join_subscribing(
        &self,
        document_id: Uuid,
        connection_id: Uuid,
        outbound: Outbound,
        lock: &tokio::sync::Mutex<()>,
    ) -> Result<RoomMembership, FanoutError> {
        let _guard = lock.lock().await;
        if self.try_join_live(document_id, connection_id, &outbound) {
            return Ok(self.membership(document_id, connection_id));
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let handler: MessageHandler = Arc::new(move |message: FanoutMessage| {
            if let Some(inner) = weak.upgrade() {
                inner.deliver(document_id, generation, &message);
            }
        });
        let subscription = self.fanout.subscribe(document_id, handler).await?;

        let finished = {
            let mut rooms = self.inner.rooms();
            match rooms.get_mut(&document_id) {
                Some(room) => {
                    log::warn!(
                        "Subscription for {document_id} had ended, replaced (generation {} → {generation})",
                        room.generation
                    );
                    room.generation = generation;
                    room.peers.insert(connection_id, outbound);
                    room.subscription.replace(subscription)
                }
                None => {
                    let mut peers = HashMap::new();
                    peers.insert(connection_id, outbound);
                    rooms.insert(
                        document_id,
                        Room {
                            generation,
                            peers,
                            subscription: Some(subscription),
                        },
                    );
                    log::debug!("Room {document_id} opened (generation {generation})");
                    None
                }
            }
        };
        drop(finished);

        Ok(self.membership(document_id, connection_id))
    }

    fn try_join_live(&self, document_id: Uuid, connection_id: Uuid, outbound: &Outbound) -> bool {
        let mut rooms = self.inner.rooms();
        match rooms.get_mut(&document_id) {
            Some(room) if room.is_live() => {
                room.peers.insert(connection_id, outbound.clone());
                true
            }
            _ => false,
        }
    }

    fn subscribe_locks(&self) -> MutexGuard<'_, HashMap<Uuid, SubscribeLock>> {
        self.subscribe_locks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn subscribe_lock(&self, document_id: Uuid) -> SubscribeLock {
        self.subscribe_locks().entry(document_id).or_default().clone()
    }

    fn release_subscribe_lock(&self, document_id: Uuid, lock: SubscribeLock) {
        let mut locks = self.subscribe_locks();
        // Held by the map and by us only: nobody else is waiting on it
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&document_id);
        }
    }

    fn membership(&self, document_id: Uuid, connection_id: Uuid) -> RoomMembership {
        RoomMembership {
            inner: self.inner.clone(),
            document_id,
            connection_id,
            left: false,
        }
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms().len()
    }

    pub fn peer_count(&self, document_id: Uuid) -> usize {
        self.inner.rooms().get(&document_id).map_or(0, |r| r.peers.len())
    }

    /// Whether the document has a running fanout subscription.
    pub fn has_subscription(&self, document_id: Uuid) -> bool {
        self.inner.rooms().get(&document_id).is_some_and(Room::is_live)
    }

    pub fn active_documents(&self) -> Vec<Uuid> {
        self.inner.rooms().keys().copied().collect()
    }

    pub fn frames_forwarded(&self) -> u64 {
        self.inner.frames_forwarded.load(Ordering::Relaxed)
    }

    /// Deliveries lost to full outbound queues.
    pub fn frames_dropped(&self) -> u64 {
        self.inner.frames_dropped.load(Ordering::Relaxed)
    }
}

/// A connection's place in a room. Leaving is async so the last member can
/// wait for the subscription to shut down; dropping leaves synchronously.
pub struct RoomMembership {
    inner: Arc<RegistryInner>,
    document_id: Uuid,
    connection_id: Uuid,
    left: bool,
}

impl RoomMembership {
    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub async fn leave(mut self) {
        self.left = true;
        if let Some(subscription) = self.inner.remove(self.document_id, self.connection_id) {
            subscription.cancel().await;
        }
    }
}

impl Drop for RoomMembership {
    fn drop(&mut self) {
        if !self.left {
            // Dropping the subscription signals its task to stop
            drop(self.inner.remove(self.document_id, self.connection_id));
        }
    }
}
