// Message and subscriber types shared across the registry and the fanout
// pipeline.
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use crate::registry::RemoveRequest;
use crate::topic;

/// One publication in flight towards the registry.
///
/// `done` fires exactly once: `true` when the message was accepted for
/// fanout, `false` when it was dropped at ingress.
pub(crate) struct Message {
    pub(crate) topic: String,
    pub(crate) body: Bytes,
    pub(crate) done: Option<oneshot::Sender<bool>>,
}

/// What lands in a subscriber's inbox. The producing topic rides along so
/// recursive subscribers can tell which descendant topic spoke.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Arc<str>,
    pub body: Bytes,
}

// The registry's non-owning view of a subscriber. Send workers clone this
// for the duration of one delivery attempt.
#[derive(Debug, Clone)]
pub(crate) struct SubscriberHandle {
    pub(crate) id: u64,
    pub(crate) topic: Arc<str>,
    pub(crate) tx: mpsc::Sender<Delivery>,
    // Closed (flipped true, or sender dropped) when the subscriber is being
    // torn down; a worker racing this abandons the attempt silently.
    pub(crate) dead: watch::Receiver<bool>,
}

/// A registered subscription. Owned by the endpoint that created it.
///
/// The inbox holds at most one undelivered payload; a subscriber that falls
/// behind misses messages rather than buffering them. Dropping the
/// subscriber signals `dead` first and then enqueues its removal, so an
/// in-flight send can always bail out.
pub struct Subscriber {
    topic: Arc<str>,
    recursive: bool,
    id: u64,
    inbox: mpsc::Receiver<Delivery>,
    dead: watch::Sender<bool>,
    remove_tx: mpsc::UnboundedSender<RemoveRequest>,
}

impl Subscriber {
    pub(crate) fn new(
        topic: Arc<str>,
        id: u64,
        inbox: mpsc::Receiver<Delivery>,
        dead: watch::Sender<bool>,
        remove_tx: mpsc::UnboundedSender<RemoveRequest>,
    ) -> Self {
        let (_, recursive) = topic::recursive(&topic);
        Self {
            topic,
            recursive,
            id,
            inbox,
            dead,
            remove_tx,
        }
    }

    /// The topic as registered, `?recursive` suffix included.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether this subscription prefix-matches descendant topics.
    pub fn recursive(&self) -> bool {
        self.recursive
    }

    /// Next delivery, or `None` once the broker has shut down.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.inbox.recv().await
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        // Order matters: workers must see `dead` before the registry entry
        // disappears, so nothing blocks on the now-unread inbox.
        let _ = self.dead.send(true);
        let _ = self.remove_tx.send(RemoveRequest {
            topic: self.topic.clone(),
            id: self.id,
        });
    }
}
