#![allow(dead_code)]
// Shared scaffolding: a hookbot service bound to an ephemeral port.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hookbot::http::{AppState, build_router};
use hookbot_broker::Broker;

pub const TEST_KEY: &str = "key";

pub async fn spawn_server() -> (SocketAddr, Arc<Broker>) {
    let broker = Arc::new(Broker::new());
    let app = build_router(AppState {
        broker: broker.clone(),
        key: Arc::from(TEST_KEY),
        allowed_origins: Arc::new(Vec::new()),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, broker)
}

// Registration happens after the upgrade response, so tests block on the
// listener count before publishing.
pub async fn wait_for_listeners(broker: &Broker, want: i64) {
    for _ in 0..500 {
        if broker.counters().snapshot().listeners == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "listeners never reached {want} (now {})",
        broker.counters().snapshot().listeners
    );
}
