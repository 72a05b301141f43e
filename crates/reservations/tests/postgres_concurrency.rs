//! Concurrency properties against a real PostgreSQL store.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p reservations --test postgres_concurrency -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ledger::{
    NewProduct, OrderLine, OrderStatus, PostgresStockStore, ProductId, StockStore, StockStoreExt,
    UserId, WarehouseId,
};
use reservations::{
    ExpiryWatcher, InMemoryNotifier, InventoryError, ReservationConfig, ReservationCoordinator,
    SettlementCoordinator, TransferCoordinator, TransferRequest, WatcherConfig,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_inventory_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresStockStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(12)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE reservations, order_items, orders, warehouse_stock, warehouses, products RESTART IDENTITY CASCADE",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresStockStore::new(pool)
}

async fn seed_two_warehouses(
    store: &PostgresStockStore,
    quantity: i64,
) -> (WarehouseId, WarehouseId, ProductId) {
    let w1 = store.insert_warehouse("W1", true).await.unwrap().id;
    let w2 = store.insert_warehouse("W2", true).await.unwrap().id;
    let product = store
        .insert_product(NewProduct::new("Widget", 500))
        .await
        .unwrap()
        .id;
    store.put_stock(w1, product, quantity).await.unwrap();
    store.put_stock(w2, product, quantity).await.unwrap();
    (w1, w2, product)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn concurrent_reservations_never_oversell() {
    let store = get_test_store().await;
    let warehouse = store.insert_warehouse("W1", true).await.unwrap().id;
    let product = store
        .insert_product(NewProduct::new("Widget", 500))
        .await
        .unwrap()
        .id;
    store.put_stock(warehouse, product, 5).await.unwrap();

    let lines = [OrderLine::new(product, 1)];
    let mut orders = Vec::new();
    for user in 0..10 {
        orders.push(store.create_order(UserId::new(user), &lines).await.unwrap().id);
    }

    let coordinator = Arc::new(ReservationCoordinator::new(
        store.clone(),
        InMemoryNotifier::new(),
        ReservationConfig::default(),
    ));
    let handles: Vec<_> = orders
        .into_iter()
        .map(|order_id| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .reserve(order_id, &[OrderLine::new(product, 1)])
                    .await
            })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(InventoryError::InsufficientStock { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 5);
    let row = store.get_stock(warehouse, product).await.unwrap().unwrap();
    assert_eq!((row.quantity, row.reserved), (5, 5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn opposite_transfers_do_not_deadlock() {
    let store = get_test_store().await;
    let (w1, w2, product) = seed_two_warehouses(&store, 100).await;
    let coordinator = Arc::new(TransferCoordinator::new(
        store.clone(),
        ReservationConfig {
            request_timeout: Some(Duration::from_secs(20)),
            ..ReservationConfig::default()
        },
    ));

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let coordinator = Arc::clone(&coordinator);
            let (from, to) = if i % 2 == 0 { (w1, w2) } else { (w2, w1) };
            tokio::spawn(async move {
                coordinator
                    .transfer(TransferRequest::new(product, from, to, 2))
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let totals = store.product_stock(product).await.unwrap();
    assert_eq!(totals.quantity, 200);
    assert_eq!(store.available_stock(w1, product).await.unwrap(), 100);
}

#[tokio::test]
#[serial]
async fn reserve_settle_and_release_round_trip() {
    let store = get_test_store().await;
    let (w1, _, product) = seed_two_warehouses(&store, 10).await;
    let reservations = ReservationCoordinator::new(
        store.clone(),
        InMemoryNotifier::new(),
        ReservationConfig::default(),
    );
    let settlements = SettlementCoordinator::new(store.clone(), ReservationConfig::default());
    let watcher = ExpiryWatcher::new(
        store.clone(),
        InMemoryNotifier::new(),
        WatcherConfig::default(),
    );

    let lines = [OrderLine::new(product, 4)];
    let paid = reservations.checkout(UserId::new(1), &lines).await.unwrap();
    let abandoned = reservations.checkout(UserId::new(2), &lines).await.unwrap();
    assert_eq!(store.get_stock(w1, product).await.unwrap().unwrap().reserved, 8);

    settlements
        .settle(paid.order.id, UserId::new(1))
        .await
        .unwrap();
    let order = store.get_order(paid.order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Paid);

    let later = Utc::now() + chrono::Duration::minutes(10);
    let report = watcher.sweep_at(later).await.unwrap();
    assert_eq!(report.released, 1);
    assert!(watcher.release(abandoned.order.id).await.unwrap().is_noop());

    let row = store.get_stock(w1, product).await.unwrap().unwrap();
    assert_eq!((row.quantity, row.reserved), (6, 0));
}

#[tokio::test]
#[serial]
async fn expired_deadline_rolls_back_the_unit() {
    let store = get_test_store().await;
    let (w1, _, product) = seed_two_warehouses(&store, 10).await;
    let order = store
        .create_order(UserId::new(1), &[OrderLine::new(product, 1)])
        .await
        .unwrap();

    // Hold the row lock so the reservation has to wait for it.
    let mut blocker = store.begin().await.unwrap();
    blocker.lock_stock(w1, product).await.unwrap().unwrap();

    let coordinator = ReservationCoordinator::new(
        store.clone(),
        InMemoryNotifier::new(),
        ReservationConfig {
            request_timeout: Some(Duration::from_millis(200)),
            ..ReservationConfig::default()
        },
    );
    let result = coordinator
        .reserve(order.id, &[OrderLine::new(product, 1)])
        .await;
    assert!(matches!(result, Err(InventoryError::DeadlineExceeded(_))));
    drop(blocker);

    let row = store.get_stock(w1, product).await.unwrap().unwrap();
    assert_eq!(row.reserved, 0);
    assert!(store.get_reservations(order.id).await.unwrap().is_empty());
}
