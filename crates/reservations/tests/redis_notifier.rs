//! Expiry signals against a real Redis server.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p reservations --test redis_notifier -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use ledger::OrderId;
use redis::AsyncCommands;
use reservations::{ExpiryFeed, ExpiryStream, RedisNotifier, ReservationNotifier, reservation_key};
use serial_test::serial;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

const EVENT_WAIT: Duration = Duration::from_secs(5);

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Redis>,
    url: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Redis::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(6379).await.unwrap();

            Arc::new(ContainerInfo {
                container,
                url: format!("redis://{}:{}/0", host, port),
            })
        })
        .await
        .clone()
}

async fn get_test_notifier() -> RedisNotifier {
    let info = get_container_info().await;
    let notifier = RedisNotifier::connect(&info.url).unwrap();

    let mut connection = notifier
        .client()
        .get_multiplexed_async_connection()
        .await
        .unwrap();
    let _: () = redis::cmd("FLUSHDB")
        .query_async(&mut connection)
        .await
        .unwrap();

    notifier.enable_expiry_events().await.unwrap();
    notifier
}

async fn next_order(stream: &mut ExpiryStream) -> OrderId {
    tokio::time::timeout(EVENT_WAIT, stream.next())
        .await
        .expect("no expiry event received")
        .expect("expiry stream ended")
        .unwrap()
}

#[tokio::test]
#[serial]
async fn arm_writes_key_with_ttl() {
    let notifier = get_test_notifier().await;
    let order_id = OrderId::new(11);

    notifier
        .arm(order_id, Duration::from_secs(60))
        .await
        .unwrap();

    let mut connection = notifier
        .client()
        .get_multiplexed_async_connection()
        .await
        .unwrap();
    let value: i64 = connection.get(reservation_key(order_id)).await.unwrap();
    let ttl_ms: i64 = connection.pttl(reservation_key(order_id)).await.unwrap();
    assert_eq!(value, 11);
    assert!(ttl_ms > 0 && ttl_ms <= 60_000, "unexpected ttl {ttl_ms}");
}

#[tokio::test]
#[serial]
async fn armed_key_arrives_on_feed_when_it_expires() {
    let notifier = get_test_notifier().await;
    let mut stream = notifier.subscribe().await.unwrap();

    notifier
        .arm(OrderId::new(42), Duration::from_millis(150))
        .await
        .unwrap();

    assert_eq!(next_order(&mut stream).await, OrderId::new(42));
}

#[tokio::test]
#[serial]
async fn rearming_replaces_the_deadline() {
    let notifier = get_test_notifier().await;
    let mut stream = notifier.subscribe().await.unwrap();

    notifier
        .arm(OrderId::new(1), Duration::from_millis(100))
        .await
        .unwrap();
    notifier
        .arm(OrderId::new(1), Duration::from_secs(60))
        .await
        .unwrap();
    notifier
        .arm(OrderId::new(2), Duration::from_millis(300))
        .await
        .unwrap();

    assert_eq!(next_order(&mut stream).await, OrderId::new(2));
}

#[tokio::test]
#[serial]
async fn foreign_keys_are_filtered_from_feed() {
    let notifier = get_test_notifier().await;
    let mut stream = notifier.subscribe().await.unwrap();

    let mut connection = notifier
        .client()
        .get_multiplexed_async_connection()
        .await
        .unwrap();
    let _: () = connection.pset_ex("session:9", 9, 50).await.unwrap();
    let _: () = connection.pset_ex("reservation:abc", 1, 50).await.unwrap();

    notifier
        .arm(OrderId::new(9), Duration::from_millis(400))
        .await
        .unwrap();

    assert_eq!(next_order(&mut stream).await, OrderId::new(9));
}

#[tokio::test]
#[serial]
async fn cloned_notifier_arms_signals() {
    let notifier = get_test_notifier().await;
    let clone = notifier.clone();
    let mut stream = notifier.subscribe().await.unwrap();

    clone
        .arm(OrderId::new(5), Duration::from_millis(100))
        .await
        .unwrap();
    notifier
        .arm(OrderId::new(6), Duration::from_millis(400))
        .await
        .unwrap();

    assert_eq!(next_order(&mut stream).await, OrderId::new(5));
    assert_eq!(next_order(&mut stream).await, OrderId::new(6));
}
