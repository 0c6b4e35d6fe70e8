//! In-process fan-out over tokio broadcast channels.
//!
//! One broadcast channel per topic, created on first subscribe and dropped
//! with its last subscriber. Each subscriber gets an independent receiver
//! that buffers up to `channel_capacity` messages; a lagging subscriber
//! skips what it missed instead of stalling the publisher.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use super::{channel_name, Fanout, FanoutError, FanoutMessage, MessageHandler, Subscription};

/// Local fan-out configuration.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Messages buffered per subscriber before it starts dropping (default: 256)
    pub channel_capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

impl FanoutConfig {
    pub fn for_testing() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

/// Snapshot of fan-out counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub active_topics: usize,
}

struct Topic {
    sender: broadcast::Sender<FanoutMessage>,
    subscribers: usize,
}

struct LocalInner {
    topics: Mutex<HashMap<String, Topic>>,
    capacity: usize,
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
}

impl LocalInner {
    fn topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn release(&self, channel: &str) {
        let mut topics = self.topics();
        if let Some(topic) = topics.get_mut(channel) {
            topic.subscribers = topic.subscribers.saturating_sub(1);
            if topic.subscribers == 0 {
                topics.remove(channel);
                log::debug!("Topic {channel} removed (no subscribers)");
            }
        }
    }
}

/// Fan-out confined to the current process.
#[derive(Clone)]
pub struct LocalFanout {
    inner: Arc<LocalInner>,
}

impl LocalFanout {
    pub fn new(config: FanoutConfig) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                topics: Mutex::new(HashMap::new()),
                capacity: config.channel_capacity.max(1),
                messages_published: AtomicU64::new(0),
                messages_delivered: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Send to every current subscriber of `channel`.
    ///
    /// Returns the number of receivers the message was queued for.
    pub fn publish_channel(&self, channel: &str, message: FanoutMessage) -> usize {
        let sender = self.inner.topics().get(channel).map(|t| t.sender.clone());
        self.inner.messages_published.fetch_add(1, Ordering::Relaxed);
        match sender {
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribe to a raw channel name.
    pub fn subscribe_channel(&self, channel: &str, handler: MessageHandler) -> Subscription {
        let mut receiver = {
            let mut topics = self.inner.topics();
            let topic = topics.entry(channel.to_string()).or_insert_with(|| Topic {
                sender: broadcast::channel(self.inner.capacity).0,
                subscribers: 0,
            });
            topic.subscribers += 1;
            topic.sender.subscribe()
        };

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let inner = self.inner.clone();
        let task_channel = channel.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    received = receiver.recv() => match received {
                        Ok(message) => {
                            inner.messages_delivered.fetch_add(1, Ordering::Relaxed);
                            handler(message);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            inner.messages_dropped.fetch_add(n, Ordering::Relaxed);
                            log::warn!("Subscriber on {task_channel} lagged by {n} messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            drop(receiver);
            inner.release(&task_channel);
        });

        Subscription::new(channel.to_string(), shutdown_tx, task)
    }

    /// Number of live subscribers on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner.topics().get(channel).map_or(0, |t| t.subscribers)
    }

    pub fn topic_count(&self) -> usize {
        self.inner.topics().len()
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            messages_published: self.inner.messages_published.load(Ordering::Relaxed),
            messages_delivered: self.inner.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.inner.messages_dropped.load(Ordering::Relaxed),
            active_topics: self.topic_count(),
        }
    }
}

impl Default for LocalFanout {
    fn default() -> Self {
        Self::new(FanoutConfig::default())
    }
}

#[async_trait]
impl Fanout for LocalFanout {
    async fn publish(&self, document_id: Uuid, message: FanoutMessage) -> Result<(), FanoutError> {
        let receivers = self.publish_channel(&channel_name(document_id), message);
        log::trace!("Published update for {document_id} to {receivers} subscribers");
        Ok(())
    }

    async fn subscribe(
        &self,
        document_id: Uuid,
        handler: MessageHandler,
    ) -> Result<Subscription, FanoutError> {
        Ok(self.subscribe_channel(&channel_name(document_id), handler))
    }
}
