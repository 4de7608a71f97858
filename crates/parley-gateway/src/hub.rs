use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parley_common::{Broadcaster, Envelope, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

pub type SubscriberId = u64;

type EvictFn = Box<dyn FnOnce() + Send>;

struct Subscriber {
    queue: mpsc::Sender<String>,
    on_evict: EvictFn,
}

/// Fan-out of encoded envelopes to every connected subscriber. Each
/// subscriber owns a bounded queue; one that falls behind is evicted instead
/// of stalling the broadcast.
pub struct Hub {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    queue_bound: usize,
}

impl Hub {
    pub fn new(queue_bound: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_bound: queue_bound.max(1),
        }
    }

    /// Register a subscriber. `on_evict` runs once if the hub drops it for
    /// being too slow.
    pub fn subscribe(
        &self,
        on_evict: impl FnOnce() + Send + 'static,
    ) -> (SubscriberId, mpsc::Receiver<String>) {
        let (queue, rx) = mpsc::channel(self.queue_bound);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            Subscriber {
                queue,
                on_evict: Box::new(on_evict),
            },
        );
        debug!(subscriber = id, "subscriber joined");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
        {
            debug!(subscriber = id, "subscriber left");
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue `frame` for every subscriber. Returns how many accepted it.
    pub fn broadcast_text(&self, frame: &str) -> usize {
        let mut evicted = Vec::new();
        let mut delivered = 0;
        {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            let mut dropped = Vec::new();
            for (id, subscriber) in subscribers.iter() {
                match subscriber.queue.try_send(frame.to_string()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => dropped.push((*id, true)),
                    Err(TrySendError::Closed(_)) => dropped.push((*id, false)),
                }
            }
            for (id, slow) in dropped {
                match subscribers.remove(&id) {
                    Some(subscriber) if slow => evicted.push((id, subscriber.on_evict)),
                    _ => {}
                }
            }
        }

        for (id, on_evict) in evicted {
            warn!(subscriber = id, "evicting slow subscriber");
            on_evict();
        }
        delivered
    }
}

#[async_trait]
impl Broadcaster for Hub {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let frame = envelope.encode()?;
        self.broadcast_text(&frame);
        Ok(())
    }
}
