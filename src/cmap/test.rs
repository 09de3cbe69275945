use std::{sync::Arc, time::Duration};

use super::{
    conn::{ConnectionGeneration, LoadBalancedGeneration},
    establish::{ConnectionEstablisher, EstablisherOptions},
    options::ConnectionPoolOptions,
    ConnectionPool,
    PoolGeneration,
};
use crate::{
    bson::oid::ObjectId,
    error::ErrorKind,
    event::{
        cmap::{CmapEventEmitter, CmapEventHandler, ConnectionCheckoutFailedReason},
        start_dispatcher,
        MonitoringRegistry,
    },
    options::{ClientOptions, ServerAddress},
    sdam::TopologyUpdater,
};

/// A subscriber that buffers every pool event it sees.
#[derive(Clone, Debug, Default)]
struct EventBuffer {
    events: Arc<std::sync::Mutex<Vec<String>>>,
}

impl EventBuffer {
    fn names(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    async fn wait_for(&self, name: &str) -> bool {
        for _ in 0..100 {
            if self.names().iter().any(|n| n == name) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl CmapEventHandler for EventBuffer {
    fn handle_pool_created_event(&self, _: crate::event::cmap::PoolCreatedEvent) {
        self.events.lock().unwrap().push("PoolCreated".to_string());
    }

    fn handle_pool_ready_event(&self, _: crate::event::cmap::PoolReadyEvent) {
        self.events.lock().unwrap().push("PoolReady".to_string());
    }

    fn handle_pool_cleared_event(&self, _: crate::event::cmap::PoolClearedEvent) {
        self.events.lock().unwrap().push("PoolCleared".to_string());
    }

    fn handle_pool_closed_event(&self, _: crate::event::cmap::PoolClosedEvent) {
        self.events.lock().unwrap().push("PoolClosed".to_string());
    }

    fn handle_connection_checkout_started_event(
        &self,
        _: crate::event::cmap::ConnectionCheckoutStartedEvent,
    ) {
        self.events
            .lock()
            .unwrap()
            .push("ConnectionCheckOutStarted".to_string());
    }

    fn handle_connection_checkout_failed_event(
        &self,
        event: crate::event::cmap::ConnectionCheckoutFailedEvent,
    ) {
        let name = match event.reason {
            ConnectionCheckoutFailedReason::Timeout => "ConnectionCheckOutFailed(Timeout)",
            ConnectionCheckoutFailedReason::PoolClosed => "ConnectionCheckOutFailed(PoolClosed)",
            ConnectionCheckoutFailedReason::ConnectionError => {
                "ConnectionCheckOutFailed(ConnectionError)"
            }
        };
        self.events.lock().unwrap().push(name.to_string());
    }
}

fn test_pool(
    address: ServerAddress,
    options: ConnectionPoolOptions,
) -> (ConnectionPool, EventBuffer) {
    let registry = MonitoringRegistry::new();
    let buffer = EventBuffer::default();
    registry.register_cmap_handler(Arc::new(buffer.clone()));
    let emitter = start_dispatcher(registry);

    let client_options = ClientOptions::default();
    let establisher = ConnectionEstablisher::new(EstablisherOptions::from(&client_options)).unwrap();
    let (updater, receiver) = TopologyUpdater::channel();

    // Drain topology updates so establishment failures have somewhere to report to.
    crate::runtime::spawn(drain_updates(receiver));

    let pool = ConnectionPool::new(
        address,
        establisher,
        updater,
        CmapEventEmitter::new(emitter),
        Some(options),
    );
    (pool, buffer)
}

async fn drain_updates(mut receiver: crate::sdam::topology::UpdateRequestReceiver) {
    while let Some(update) = receiver.recv().await {
        update.into_parts().1.acknowledge(false);
    }
}

#[tokio::test]
async fn checkout_from_unready_pool_fails() {
    let (pool, buffer) = test_pool(
        ServerAddress::parse("localhost:27017").unwrap(),
        ConnectionPoolOptions::default(),
    );

    // The pool is born paused; nothing has marked its server as reachable yet.
    let error = pool.check_out().await.unwrap_err();
    assert!(error.is_pool_cleared());
    assert!(buffer.wait_for("ConnectionCheckOutStarted").await);
}

#[tokio::test]
async fn checkout_times_out_when_establishment_hangs() {
    // A bound listener that never responds makes establishment hang after the TCP connect,
    // so the wait queue timeout is what fails the checkout.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let options = ConnectionPoolOptions {
        wait_queue_timeout: Some(Duration::from_millis(100)),
        ready: Some(true),
        ..Default::default()
    };
    let (pool, buffer) = test_pool(
        ServerAddress::parse(format!("127.0.0.1:{}", address.port())).unwrap(),
        options,
    );

    let error = pool.check_out().await.unwrap_err();
    assert!(matches!(
        error.kind.as_ref(),
        ErrorKind::WaitQueueTimeout { .. }
    ));
    assert!(buffer.wait_for("ConnectionCheckOutFailed(Timeout)").await);
}

#[tokio::test]
async fn clear_wakes_parked_checkouts() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    // max_pool_size 1 with a hanging establishment: the second checkout has to park in the
    // wait queue.
    let options = ConnectionPoolOptions {
        max_pool_size: Some(1),
        ready: Some(true),
        ..Default::default()
    };
    let (pool, buffer) = test_pool(
        ServerAddress::parse(format!("127.0.0.1:{}", address.port())).unwrap(),
        options,
    );

    let first_pool = pool.clone();
    let first = tokio::spawn(async move { first_pool.check_out().await });

    // Give the first request time to claim the establishment slot.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second_pool = pool.clone();
    let second = tokio::spawn(async move { second_pool.check_out().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.clear(
        ErrorKind::from(std::io::ErrorKind::ConnectionReset).into(),
        None,
    )
    .await;

    let second_result = second.await.unwrap();
    let error = second_result.unwrap_err();
    assert!(error.is_pool_cleared());
    assert!(buffer.wait_for("PoolCleared").await);

    first.abort();
}

#[test]
fn generation_staleness() {
    // Normal mode: any generation other than the pool's current one is stale.
    assert!(!ConnectionGeneration::Normal(0).is_stale(&PoolGeneration::Normal(0)));
    assert!(ConnectionGeneration::Normal(0).is_stale(&PoolGeneration::Normal(1)));

    // Load-balanced mode: staleness is scoped to the connection's service.
    let s1 = ObjectId::new();
    let s2 = ObjectId::new();
    let mut gen_map = std::collections::HashMap::new();
    gen_map.insert(s1, 1u32);
    let pool_gen = PoolGeneration::LoadBalanced(gen_map);

    let conn_s1 = ConnectionGeneration::from(LoadBalancedGeneration {
        generation: 0,
        service_id: s1,
    });
    let conn_s2 = ConnectionGeneration::from(LoadBalancedGeneration {
        generation: 0,
        service_id: s2,
    });

    // A clear scoped to s1 leaves s2's connections fresh.
    assert!(conn_s1.is_stale(&pool_gen));
    assert!(!conn_s2.is_stale(&pool_gen));
}

#[test]
fn pool_generation_lookup_by_service() {
    let s1 = ObjectId::new();
    let mut gen_map = std::collections::HashMap::new();
    gen_map.insert(s1, 3u32);
    let pool_gen = PoolGeneration::LoadBalanced(gen_map);

    assert_eq!(pool_gen.as_u32(Some(s1)), Some(3));
    assert_eq!(pool_gen.as_u32(Some(ObjectId::new())), Some(0));
    assert_eq!(pool_gen.as_u32(None), None);

    assert_eq!(PoolGeneration::Normal(7).as_u32(None), Some(7));
}
