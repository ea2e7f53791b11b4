// Two-stage bounded fanout pipeline.
//
// Stage 1 carries one strobe per accepted publish: the interested subscriber
// set plus the payload. Stage 2 carries one job per (subscriber, payload)
// pair and is drained by a fixed pool of send workers. The registry never
// blocks on stage 1 (it drops instead) and the dispatcher's blocking send
// into stage 2 backpressures only the dispatcher, so publisher latency stays
// bounded no matter how slow any subscriber is.
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};

use crate::counters::Counters;
use crate::message::{Delivery, SubscriberHandle};

// One pass over all interested subscribers for a single incoming message.
pub(crate) const STROBE_QUEUE_DEPTH: usize = 100;
pub(crate) const DELIVERY_QUEUE_DEPTH: usize = 1000;
pub(crate) const SEND_WORKERS: usize = 10;

// A worker gives each subscriber this long to free its inbox slot before the
// message is counted as dropped for that subscriber.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct Strobe {
    pub(crate) subscribers: Vec<SubscriberHandle>,
    pub(crate) topic: Arc<str>,
    pub(crate) body: Bytes,
}

pub(crate) struct DeliveryJob {
    pub(crate) subscriber: SubscriberHandle,
    pub(crate) delivery: Delivery,
}

// Unroll each strobe into per-subscriber jobs. Exits when the registry hangs
// up stage 1.
pub(crate) async fn dispatch(
    mut strobe_rx: mpsc::Receiver<Strobe>,
    delivery_tx: mpsc::Sender<DeliveryJob>,
) {
    while let Some(strobe) = strobe_rx.recv().await {
        for subscriber in strobe.subscribers {
            let job = DeliveryJob {
                subscriber,
                delivery: Delivery {
                    topic: strobe.topic.clone(),
                    body: strobe.body.clone(),
                },
            };
            if delivery_tx.send(job).await.is_err() {
                return;
            }
        }
    }
}

// One of the pool. Workers share the stage-2 receiver and race each job's
// inbox send against the send timeout and the subscriber's death.
pub(crate) async fn send_worker(
    queue: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    counters: Arc<Counters>,
) {
    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else { return };
        deliver(job, &counters).await;
    }
}

async fn deliver(job: DeliveryJob, counters: &Counters) {
    let DeliveryJob {
        subscriber,
        delivery,
    } = job;
    let mut dead = subscriber.dead;
    tokio::select! {
        outcome = tokio::time::timeout(SEND_TIMEOUT, subscriber.tx.send(delivery)) => {
            match outcome {
                Ok(Ok(())) => counters.sent(),
                // Inbox went away with its endpoint; nothing to record.
                Ok(Err(_)) => {}
                Err(_elapsed) => counters.send_dropped(),
            }
        }
        _ = dead.changed() => {}
    }
}
