//! Publishing work through the transport router, end to end with the
//! dispatcher and the in-memory store.

use async_trait::async_trait;
use outbound::config::DispatchConfig;
use outbound::engine::Dispatcher;
use outbound::handler::HandlerRegistry;
use outbound::handler::builtin::{LogMailer, register_builtins};
use outbound::model::work::{NewWorkItem, Status};
use outbound::queue::{MemoryQueueStore, QueueStore};
use outbound::transport::{Route, Transport, TransportError, TransportRouter, TransportState};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records what it accepted; rejects everything while `down` is set.
struct FakeBroker {
    name: &'static str,
    down: AtomicBool,
    accepted: Mutex<Vec<String>>,
}

impl FakeBroker {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            down: AtomicBool::new(false),
            accepted: Mutex::new(Vec::new()),
        })
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn keys(&self) -> Vec<String> {
        self.accepted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeBroker {
    fn name(&self) -> &str {
        self.name
    }

    async fn publish(&self, key: &[u8], _value: &[u8]) -> Result<(), TransportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{} refused connection", self.name)));
        }
        self.accepted
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(key).into_owned());
        Ok(())
    }
}

struct Fixture {
    store: Arc<MemoryQueueStore>,
    router: TransportRouter,
    primary: Arc<FakeBroker>,
    secondary: Arc<FakeBroker>,
    dispatcher: Dispatcher<MemoryQueueStore>,
}

fn fixture() -> Fixture {
    let config = DispatchConfig {
        recovery_cooldown: Duration::from_secs(5),
        ..DispatchConfig::default()
    };
    let primary = FakeBroker::new("amqp");
    let secondary = FakeBroker::new("redis");
    let router = TransportRouter::new(primary.clone(), secondary.clone(), config.recovery_cooldown);

    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry, LogMailer, Some(router.clone())).unwrap();

    let store = Arc::new(MemoryQueueStore::new(config.max_retries));
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::new(registry), config);
    Fixture {
        store,
        router,
        primary,
        secondary,
        dispatcher,
    }
}

fn order(id: &str) -> NewWorkItem {
    NewWorkItem::json("order_created", &json!({"order_id": id, "price": "12.50"})).unwrap()
}

#[tokio::test(start_paused = true)]
async fn primary_outage_falls_back_then_recovers() {
    let f = fixture();
    f.primary.set_down(true);

    let first = f.store.enqueue(order("ord-1")).await.unwrap();
    assert_eq!(f.dispatcher.poll_once().await.unwrap().completed, 1);
    assert_eq!(f.secondary.keys(), vec!["ord-1"]);
    assert_eq!(f.router.state(Route::Primary), TransportState::Unavailable);
    assert_eq!(f.store.get(first).await.unwrap().status(3), Status::Completed);

    // Primary is healthy again but still cooling down.
    f.primary.set_down(false);
    f.store.enqueue(order("ord-2")).await.unwrap();
    f.dispatcher.poll_once().await.unwrap();
    assert_eq!(f.secondary.keys(), vec!["ord-1", "ord-2"]);
    assert!(f.primary.keys().is_empty());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(f.router.state(Route::Primary), TransportState::Available);

    f.store.enqueue(order("ord-3")).await.unwrap();
    f.dispatcher.poll_once().await.unwrap();
    assert_eq!(f.primary.keys(), vec!["ord-3"]);
}

#[tokio::test(start_paused = true)]
async fn total_outage_reschedules_the_work() {
    let f = fixture();
    f.primary.set_down(true);
    f.secondary.set_down(true);

    let id = f.store.enqueue(order("ord-9")).await.unwrap();
    let report = f.dispatcher.poll_once().await.unwrap();
    assert_eq!(report.rescheduled, 1);

    let item = f.store.get(id).await.unwrap();
    assert_eq!(item.status(3), Status::Pending);
    assert_eq!(item.attempt_count, 1);
    assert!(item.last_error.unwrap().contains("all transports unavailable"));
}

#[tokio::test(start_paused = true)]
async fn payment_requests_are_keyed_by_public_order_id() {
    let f = fixture();
    let new = NewWorkItem::json(
        "payment_requested",
        &json!({"public_order_id": "pub-42", "price": 99.0}),
    )
    .unwrap();
    f.store.enqueue(new).await.unwrap();

    f.dispatcher.poll_once().await.unwrap();
    assert_eq!(f.primary.keys(), vec!["pub-42"]);
}

#[tokio::test(start_paused = true)]
async fn event_without_key_is_dead_lettered() {
    let f = fixture();
    let id = f
        .store
        .enqueue(NewWorkItem::json("order_created", &json!({"price": "1"})).unwrap())
        .await
        .unwrap();

    assert_eq!(f.dispatcher.poll_once().await.unwrap().dead_lettered, 1);
    assert_eq!(f.store.get(id).await.unwrap().status(3), Status::DeadLettered);
    assert!(f.primary.keys().is_empty());
}
