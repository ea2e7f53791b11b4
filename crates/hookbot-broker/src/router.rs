// Router plug-in interface.
//
// A router is an internal subscriber: it consumes messages from the topics
// it names and may republish derived messages through the capability it is
// handed. Routers are registered at startup and enabled by name.
use async_trait::async_trait;

use crate::message::Delivery;
use crate::registry::Publisher;

#[async_trait]
pub trait Router: Send + Sync + 'static {
    /// Name used by the startup allow-list.
    fn name(&self) -> &str;

    /// Topics this router subscribes to.
    fn topics(&self) -> Vec<String>;

    /// Consume one delivered message, optionally republishing derived ones.
    async fn route(&self, delivery: Delivery, publisher: &Publisher);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Broker;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    // Echoes everything from "in" to "out" with a prefix.
    struct EchoRouter;

    #[async_trait]
    impl Router for EchoRouter {
        fn name(&self) -> &str {
            "echo"
        }

        fn topics(&self) -> Vec<String> {
            vec!["in".to_string()]
        }

        async fn route(&self, delivery: Delivery, publisher: &Publisher) {
            let mut body = b"echo:".to_vec();
            body.extend_from_slice(&delivery.body);
            let _ = publisher.publish("out", Bytes::from(body)).await;
        }
    }

    #[tokio::test]
    async fn router_consumes_and_republishes() {
        let broker = Broker::new();
        broker
            .add_router(Arc::new(EchoRouter))
            .await
            .expect("attach router");
        let mut subscriber = broker.subscribe("out").await.expect("subscribe out");

        broker
            .publish("in", Bytes::from_static(b"payload"))
            .await
            .expect("publish in");

        let delivery = tokio::time::timeout(Duration::from_secs(5), subscriber.recv())
            .await
            .expect("derived message within deadline")
            .expect("delivered");
        assert_eq!(delivery.body, Bytes::from_static(b"echo:payload"));
        broker.shutdown().await;
    }
}
