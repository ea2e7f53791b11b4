// The registry: a single task owning the topic → subscribers map.
//
// Every mutation of the map happens on this task, so no locking is needed.
// Publishers, subscribers and shutdown all talk to it over channels.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::counters::{self, Counters};
use crate::fanout::{self, DELIVERY_QUEUE_DEPTH, SEND_WORKERS, STROBE_QUEUE_DEPTH, Strobe};
use crate::message::{Message, Subscriber, SubscriberHandle};
use crate::router::Router;
use crate::topic;
use crate::{BrokerError, Result};

// A publisher waits at most this long for the registry to pick its message
// up before failing the publish.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct AddRequest {
    handle: SubscriberHandle,
    // Fired once the handle is in the map, so tests (and callers generally)
    // can publish immediately after subscribing.
    ready: oneshot::Sender<()>,
}

pub(crate) struct RemoveRequest {
    pub(crate) topic: Arc<str>,
    pub(crate) id: u64,
}

/// Handle to a running broker. Cheap to share behind an `Arc`; all methods
/// take `&self`.
pub struct Broker {
    add_tx: mpsc::Sender<AddRequest>,
    remove_tx: mpsc::UnboundedSender<RemoveRequest>,
    publish_tx: mpsc::Sender<Message>,
    shutdown_tx: watch::Sender<bool>,
    counters: Arc<Counters>,
    next_id: AtomicU64,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Start the registry, the fanout pipeline and the stats reporter.
    pub fn new() -> Self {
        let (add_tx, add_rx) = mpsc::channel(1);
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        let (publish_tx, publish_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (strobe_tx, strobe_rx) = mpsc::channel(STROBE_QUEUE_DEPTH);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE_DEPTH);
        let counters = Arc::new(Counters::default());

        let mut tasks = Vec::with_capacity(SEND_WORKERS + 3);
        tasks.push(tokio::spawn(run(
            add_rx,
            remove_rx,
            publish_rx,
            strobe_tx,
            shutdown_rx.clone(),
            counters.clone(),
        )));
        tasks.push(tokio::spawn(fanout::dispatch(strobe_rx, delivery_tx)));
        let delivery_rx = Arc::new(Mutex::new(delivery_rx));
        for _ in 0..SEND_WORKERS {
            tasks.push(tokio::spawn(fanout::send_worker(
                delivery_rx.clone(),
                counters.clone(),
            )));
        }
        tasks.push(tokio::spawn(counters::report(counters.clone(), shutdown_rx)));

        Self {
            add_tx,
            remove_tx,
            publish_tx,
            shutdown_tx,
            counters,
            next_id: AtomicU64::new(0),
            tasks: StdMutex::new(tasks),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Register a subscription and wait for the registry to insert it.
    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<Subscriber> {
        let topic: Arc<str> = Arc::from(topic.into());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Capacity 1: at most one undelivered payload per subscriber.
        let (tx, inbox) = mpsc::channel(1);
        let (dead_tx, dead_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = SubscriberHandle {
            id,
            topic: topic.clone(),
            tx,
            dead: dead_rx,
        };
        self.add_tx
            .send(AddRequest {
                handle,
                ready: ready_tx,
            })
            .await
            .map_err(|_| BrokerError::ShuttingDown)?;
        ready_rx.await.map_err(|_| BrokerError::ShuttingDown)?;

        Ok(Subscriber::new(
            topic,
            id,
            inbox,
            dead_tx,
            self.remove_tx.clone(),
        ))
    }

    /// Publish a body to a topic, waiting until the registry has either
    /// submitted it to the fanout pipeline or dropped it.
    pub async fn publish(&self, topic: impl Into<String>, body: Bytes) -> Result<()> {
        publish_via(&self.publish_tx, topic.into(), body).await
    }

    /// A clonable publish capability, detached from the broker's lifetime
    /// management. This is what routers are handed.
    pub fn publisher(&self) -> Publisher {
        Publisher {
            publish_tx: self.publish_tx.clone(),
        }
    }

    /// Attach a router: one internal subscriber per routed topic, each
    /// feeding received messages through the router with a publish
    /// capability.
    pub async fn add_router(&self, router: Arc<dyn Router>) -> Result<()> {
        for routed_topic in router.topics() {
            tracing::info!(router = router.name(), topic = %routed_topic, "attach router");
            let mut subscriber = self.subscribe(routed_topic).await?;
            let publisher = self.publisher();
            let router = router.clone();
            let task = tokio::spawn(async move {
                while let Some(delivery) = subscriber.recv().await {
                    router.route(delivery, &publisher).await;
                }
            });
            self.tasks.lock().expect("tasks lock").push(task);
        }
        Ok(())
    }

    /// Stop the registry and wait for every broker task, including in-flight
    /// send attempts, to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().expect("tasks lock");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded publish capability handed to routers.
#[derive(Clone)]
pub struct Publisher {
    publish_tx: mpsc::Sender<Message>,
}

impl Publisher {
    pub async fn publish(&self, topic: impl Into<String>, body: Bytes) -> Result<()> {
        publish_via(&self.publish_tx, topic.into(), body).await
    }
}

async fn publish_via(publish_tx: &mpsc::Sender<Message>, topic: String, body: Bytes) -> Result<()> {
    let (done_tx, done_rx) = oneshot::channel();
    let message = Message {
        topic,
        body,
        done: Some(done_tx),
    };
    match tokio::time::timeout(PUBLISH_TIMEOUT, publish_tx.send(message)).await {
        Err(_elapsed) => return Err(BrokerError::PublishTimeout),
        Ok(Err(_closed)) => return Err(BrokerError::ShuttingDown),
        Ok(Ok(())) => {}
    }
    match done_rx.await {
        Ok(true) => Ok(()),
        Ok(false) => Err(BrokerError::Saturated),
        Err(_) => Err(BrokerError::ShuttingDown),
    }
}

// The serializer loop. Sole owner of the topic map.
async fn run(
    mut add_rx: mpsc::Receiver<AddRequest>,
    mut remove_rx: mpsc::UnboundedReceiver<RemoveRequest>,
    mut publish_rx: mpsc::Receiver<Message>,
    strobe_tx: mpsc::Sender<Strobe>,
    mut shutdown: watch::Receiver<bool>,
    counters: Arc<Counters>,
) {
    let mut topics: HashMap<String, HashMap<u64, SubscriberHandle>> = HashMap::new();

    loop {
        tokio::select! {
            Some(message) = publish_rx.recv() => {
                handle_publish(&topics, message, &strobe_tx, &counters);
            }
            Some(request) = add_rx.recv() => {
                counters.listener_added();
                topics
                    .entry(request.handle.topic.to_string())
                    .or_default()
                    .insert(request.handle.id, request.handle);
                let _ = request.ready.send(());
            }
            Some(request) = remove_rx.recv() => {
                counters.listener_removed();
                if let Some(bucket) = topics.get_mut(request.topic.as_ref()) {
                    bucket.remove(&request.id);
                    // A topic key exists iff its set is non-empty.
                    if bucket.is_empty() {
                        topics.remove(request.topic.as_ref());
                    }
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

fn handle_publish(
    topics: &HashMap<String, HashMap<u64, SubscriberHandle>>,
    message: Message,
    strobe_tx: &mpsc::Sender<Strobe>,
    counters: &Counters,
) {
    counters.published();
    let Message { topic, body, done } = message;

    let subscribers = interested(topics, &topic);
    let accepted = if subscribers.is_empty() {
        true
    } else {
        match strobe_tx.try_send(Strobe {
            subscribers,
            topic: Arc::from(topic.as_str()),
            body,
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                counters.publish_dropped();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    };
    if let Some(done) = done {
        let _ = done.send(accepted);
    }
}

// All subscribers with the exact topic, unioned with every recursive
// subscription whose prefix the topic starts with. Union is by subscriber
// id: a doubly-matched subscriber is delivered once.
fn interested(
    topics: &HashMap<String, HashMap<u64, SubscriberHandle>>,
    published: &str,
) -> Vec<SubscriberHandle> {
    let mut matched: HashMap<u64, SubscriberHandle> = HashMap::new();

    if let Some(bucket) = topics.get(published) {
        for (id, handle) in bucket {
            matched.insert(*id, handle.clone());
        }
    }

    for (candidate, bucket) in topics {
        let (base, is_recursive) = topic::recursive(candidate);
        if !is_recursive || !published.starts_with(base) {
            continue;
        }
        for (id, handle) in bucket {
            matched.insert(*id, handle.clone());
        }
    }

    matched.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn recv_soon(subscriber: &mut Subscriber) -> Option<crate::Delivery> {
        tokio::time::timeout(Duration::from_secs(5), subscriber.recv())
            .await
            .expect("delivery within deadline")
    }

    async fn assert_nothing_delivered(subscriber: &mut Subscriber) {
        let outcome = tokio::time::timeout(Duration::from_millis(200), subscriber.recv()).await;
        assert!(outcome.is_err(), "unexpected delivery: {outcome:?}");
    }

    #[tokio::test]
    async fn publish_reaches_exact_subscriber() {
        let broker = Broker::new();
        let mut subscriber = broker.subscribe("test/topic").await.expect("subscribe");

        broker
            .publish("test/topic", Bytes::from_static(b"MESSAGE"))
            .await
            .expect("publish");

        let delivery = recv_soon(&mut subscriber).await.expect("delivered");
        assert_eq!(delivery.body, Bytes::from_static(b"MESSAGE"));
        assert_eq!(delivery.topic.as_ref(), "test/topic");
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let broker = Broker::new();
        let mut first = broker.subscribe("/unsafe/1").await.expect("subscribe");
        let mut second = broker.subscribe("/unsafe/2").await.expect("subscribe");

        broker
            .publish("/unsafe/1", Bytes::from_static(b"MESSAGE 1"))
            .await
            .expect("publish 1");
        broker
            .publish("/unsafe/2", Bytes::from_static(b"MESSAGE 2"))
            .await
            .expect("publish 2");

        assert_eq!(
            recv_soon(&mut first).await.expect("first").body,
            Bytes::from_static(b"MESSAGE 1")
        );
        assert_eq!(
            recv_soon(&mut second).await.expect("second").body,
            Bytes::from_static(b"MESSAGE 2")
        );
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn recursive_subscription_matches_descendants() {
        let broker = Broker::new();
        let mut recursive = broker
            .subscribe("/unsafe/foo/?recursive")
            .await
            .expect("subscribe recursive");
        let mut exact = broker.subscribe("/unsafe/foo/bar").await.expect("subscribe exact");

        broker
            .publish("/unsafe/foo/bar", Bytes::from_static(b"MESSAGE"))
            .await
            .expect("publish");

        assert_eq!(
            recv_soon(&mut recursive).await.expect("recursive").body,
            Bytes::from_static(b"MESSAGE")
        );
        assert_eq!(
            recv_soon(&mut exact).await.expect("exact").body,
            Bytes::from_static(b"MESSAGE")
        );
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn plain_subscription_does_not_match_descendants() {
        let broker = Broker::new();
        let mut plain = broker.subscribe("/unsafe/foo/").await.expect("subscribe plain");
        let mut exact = broker.subscribe("/unsafe/foo/bar").await.expect("subscribe exact");

        broker
            .publish("/unsafe/foo/bar", Bytes::from_static(b"MESSAGE"))
            .await
            .expect("publish");

        assert_eq!(
            recv_soon(&mut exact).await.expect("exact").body,
            Bytes::from_static(b"MESSAGE")
        );
        assert_nothing_delivered(&mut plain).await;
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn doubly_matched_subscriber_is_delivered_once() {
        let broker = Broker::new();
        // Exact-matches the published topic and prefix-matches it too.
        let mut subscriber = broker
            .subscribe("foo/?recursive")
            .await
            .expect("subscribe");

        broker
            .publish("foo/?recursive", Bytes::from_static(b"once"))
            .await
            .expect("publish");

        assert_eq!(
            recv_soon(&mut subscriber).await.expect("delivered").body,
            Bytes::from_static(b"once")
        );
        assert_nothing_delivered(&mut subscriber).await;
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_accepted() {
        let broker = Broker::new();
        broker
            .publish("nobody/home", Bytes::from_static(b"payload"))
            .await
            .expect("publish");

        let snap = broker.counters().snapshot();
        assert_eq!(snap.publish, 1);
        assert_eq!(snap.sends, 0);
        assert_eq!(snap.drop_publish, 0);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_subscriber_stops_receiving() {
        let broker = Broker::new();
        let mut keeper = broker.subscribe("topic").await.expect("subscribe keeper");
        let leaver = broker.subscribe("topic").await.expect("subscribe leaver");
        drop(leaver);

        broker
            .publish("topic", Bytes::from_static(b"after"))
            .await
            .expect("publish");

        assert_eq!(
            recv_soon(&mut keeper).await.expect("keeper").body,
            Bytes::from_static(b"after")
        );
        broker.shutdown().await;
        // Only the surviving subscriber was sent to.
        assert_eq!(broker.counters().snapshot().sends, 1);
    }

    #[tokio::test]
    async fn shutdown_refuses_further_work() {
        let broker = Broker::new();
        broker.shutdown().await;

        let publish = broker.publish("topic", Bytes::from_static(b"late")).await;
        assert!(matches!(
            publish,
            Err(BrokerError::ShuttingDown | BrokerError::PublishTimeout)
        ));
        let subscribe = broker.subscribe("topic").await;
        assert!(subscribe.is_err());
    }

    #[tokio::test]
    async fn subscriber_sequence_preserves_publish_order() {
        let broker = Broker::new();
        let mut subscriber = broker.subscribe("ordered").await.expect("subscribe");

        broker
            .publish("ordered", Bytes::from_static(b"one"))
            .await
            .expect("publish one");
        assert_eq!(
            recv_soon(&mut subscriber).await.expect("one").body,
            Bytes::from_static(b"one")
        );

        broker
            .publish("ordered", Bytes::from_static(b"two"))
            .await
            .expect("publish two");
        assert_eq!(
            recv_soon(&mut subscriber).await.expect("two").body,
            Bytes::from_static(b"two")
        );
        broker.shutdown().await;
    }
}
