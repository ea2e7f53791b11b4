// Broker-wide counters and the periodic stats line.
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

const REPORT_PERIOD: Duration = Duration::from_secs(60);

/// Counts of everything the broker did since start. Updated atomically from
/// the registry and the send workers, mirrored into the `metrics` facade.
#[derive(Debug, Default)]
pub struct Counters {
    listeners: AtomicI64,
    publish: AtomicI64,
    drop_publish: AtomicI64,
    sends: AtomicI64,
    drop_sends: AtomicI64,
}

impl Counters {
    pub(crate) fn listener_added(&self) {
        self.listeners.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("hookbot_listeners").increment(1.0);
    }

    pub(crate) fn listener_removed(&self) {
        self.listeners.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("hookbot_listeners").decrement(1.0);
    }

    pub(crate) fn published(&self) {
        self.publish.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hookbot_publish_total").increment(1);
    }

    // Publisher-visible drop: the strobe queue was full.
    pub(crate) fn publish_dropped(&self) {
        self.drop_publish.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hookbot_publish_dropped_total").increment(1);
    }

    pub(crate) fn sent(&self) {
        self.sends.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hookbot_sends_total").increment(1);
    }

    // Publisher-invisible drop: one subscriber's inbox stayed full past the
    // send timeout. The subscriber keeps its registration.
    pub(crate) fn send_dropped(&self) {
        self.drop_sends.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hookbot_sends_dropped_total").increment(1);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            listeners: self.listeners.load(Ordering::Relaxed),
            publish: self.publish.load(Ordering::Relaxed),
            drop_publish: self.drop_publish.load(Ordering::Relaxed),
            sends: self.sends.load(Ordering::Relaxed),
            drop_sends: self.drop_sends.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub listeners: i64,
    pub publish: i64,
    pub drop_publish: i64,
    pub sends: i64,
    pub drop_sends: i64,
}

// Log absolute and delta values once a minute until shutdown.
pub(crate) async fn report(counters: Arc<Counters>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(REPORT_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; skip it so the first line covers
    // a full period.
    ticker.tick().await;

    let mut last = CountersSnapshot::default();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snap = counters.snapshot();
                tracing::info!(
                    listeners = snap.listeners,
                    listeners_delta = snap.listeners - last.listeners,
                    publish = snap.publish,
                    publish_delta = snap.publish - last.publish,
                    publish_dropped = snap.drop_publish,
                    publish_dropped_delta = snap.drop_publish - last.drop_publish,
                    sends = snap.sends,
                    sends_delta = snap.sends - last.sends,
                    sends_dropped = snap.drop_sends,
                    sends_dropped_delta = snap.drop_sends - last.drop_sends,
                    "broker stats",
                );
                last = snap;
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_updates() {
        let counters = Counters::default();
        counters.listener_added();
        counters.listener_added();
        counters.listener_removed();
        counters.published();
        counters.publish_dropped();
        counters.sent();
        counters.send_dropped();

        let snap = counters.snapshot();
        assert_eq!(snap.listeners, 1);
        assert_eq!(snap.publish, 1);
        assert_eq!(snap.drop_publish, 1);
        assert_eq!(snap.sends, 1);
        assert_eq!(snap.drop_sends, 1);
    }

    #[tokio::test]
    async fn reporter_exits_on_shutdown() {
        let counters = Arc::new(Counters::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(report(counters, shutdown_rx));
        shutdown_tx.send(true).expect("signal shutdown");
        task.await.expect("reporter joins");
    }
}
