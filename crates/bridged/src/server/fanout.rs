//! Broadcast fan-out to subscriber connections.
//!
//! Each subscriber owns a bounded queue drained by its connection's writer
//! task. A broadcast stamps the message, serializes it once, and pushes the
//! same text into every queue without waiting: a full queue skips that
//! subscriber only, a closed queue is pruned.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Serialization failures are logged and deliver nothing

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bridge_protocol::{BridgeMessage, Notification};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, warn};

use super::ServerError;

/// Queue depth per subscriber.
pub const SUBSCRIBER_QUEUE: usize = 64;

/// Serialized frames queued for one subscriber.
pub type FrameSender = mpsc::Sender<Arc<str>>;

/// Active subscribers keyed by subscriber id.
type SubscribersMap = Arc<RwLock<HashMap<u64, FrameSender>>>;

/// A registered subscriber's end of its queue.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,

    /// Sender for direct replies, sharing the broadcast queue so replies
    /// and broadcasts keep their relative order
    pub sender: FrameSender,

    pub receiver: mpsc::Receiver<Arc<str>>,
}

/// Fans notifications out to every subscriber.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    subscribers: SubscribersMap,
    next_id: Arc<AtomicU64>,
    max_subscribers: usize,
}

impl Broadcaster {
    /// Creates a broadcaster accepting up to `max_subscribers` at once.
    pub fn new(max_subscribers: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            max_subscribers,
        }
    }

    /// Registers a new subscriber.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::TooManyClients` when the limit is reached.
    pub async fn add(&self) -> Result<Subscription, ServerError> {
        let mut subs = self.subscribers.write().await;

        if subs.len() >= self.max_subscribers {
            return Err(ServerError::TooManyClients {
                max: self.max_subscribers,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE);
        subs.insert(id, sender.clone());
        debug!(subscriber = id, total = subs.len(), "Added subscriber");

        Ok(Subscription {
            id,
            sender,
            receiver,
        })
    }

    /// Removes a subscriber.
    pub async fn remove(&self, id: u64) {
        let mut subs = self.subscribers.write().await;
        if subs.remove(&id).is_some() {
            debug!(subscriber = id, "Removed subscriber");
        }
    }

    /// Returns the number of active subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Sends `message` to every subscriber.
    ///
    /// Returns the number of subscribers whose queue accepted it.
    pub async fn broadcast(&self, message: BridgeMessage) -> usize {
        let json: Arc<str> = match Notification::now(message).to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                error!(error = %e, "Failed to serialize broadcast");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let subs = self.subscribers.read().await;
            for (&id, sender) in subs.iter() {
                match sender.try_send(Arc::clone(&json)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(subscriber = id, "Subscriber queue full, skipping");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subs = self.subscribers.write().await;
            for id in closed {
                subs.remove(&id);
                debug!(subscriber = id, "Pruned closed subscriber");
            }
        }

        delivered
    }
}
