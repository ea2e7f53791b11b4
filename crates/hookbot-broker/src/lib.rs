// In-memory publish/subscribe engine.
//
// One registry task owns the topic map; publishers and subscribers talk to it
// over bounded channels. Fanout runs through a two-stage pipeline (strobe
// queue, then per-subscriber delivery queue drained by a fixed worker pool)
// so a slow subscriber can never stall a publisher: the broker drops instead
// of blocking, and counts every drop.
pub mod counters;
pub mod fanout;
pub mod message;
pub mod registry;
pub mod router;
pub mod topic;

pub use counters::{Counters, CountersSnapshot};
pub use message::{Delivery, Subscriber};
pub use registry::{Broker, Publisher};
pub use router::Router;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("timed out submitting to the broker")]
    PublishTimeout,
    #[error("fanout pipeline saturated")]
    Saturated,
    #[error("broker is shutting down")]
    ShuttingDown,
}
