use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use ledger::OrderId;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::OnceCell;

use super::{
    ExpiryFeed, ExpiryStream, NotifyError, ReservationNotifier, parse_reservation_key,
    reservation_key,
};

/// Expiry signals backed by Redis expiring keys and keyspace notifications.
///
/// Arming writes `reservation:<order id>` with a TTL. The feed subscribes to
/// `__keyevent@<db>__:expired`, which requires `notify-keyspace-events` to
/// include `Ex` (see [`RedisNotifier::enable_expiry_events`]).
///
/// Commands share one [`ConnectionManager`], opened on first use and
/// reconnected by the manager after a failure. Clones share it too.
#[derive(Clone)]
pub struct RedisNotifier {
    client: Client,
    db: i64,
    commands: Arc<OnceCell<ConnectionManager>>,
}

impl RedisNotifier {
    pub fn connect(redis_url: &str) -> Result<Self, NotifyError> {
        let client = Client::open(redis_url)?;
        let db = client.get_connection_info().redis.db;
        Ok(Self {
            client,
            db,
            commands: Arc::new(OnceCell::new()),
        })
    }

    async fn commands(&self) -> Result<ConnectionManager, NotifyError> {
        let manager = self
            .commands
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Channel carrying expired-key events for the configured database.
    pub fn expired_channel(&self) -> String {
        format!("__keyevent@{}__:expired", self.db)
    }

    /// Turns on expired-key events on the server.
    pub async fn enable_expiry_events(&self) -> Result<(), NotifyError> {
        let mut connection = self.commands().await?;
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut connection)
            .await?;
        tracing::info!("enabled expired keyspace events");
        Ok(())
    }
}

#[async_trait]
impl ReservationNotifier for RedisNotifier {
    async fn arm(&self, order_id: OrderId, ttl: Duration) -> Result<(), NotifyError> {
        let mut connection = self.commands().await?;
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let _: () = connection
            .pset_ex(reservation_key(order_id), order_id.as_i64(), millis)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExpiryFeed for RedisNotifier {
    async fn subscribe(&self) -> Result<ExpiryStream, NotifyError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        let channel = self.expired_channel();
        pubsub.subscribe(&channel).await?;
        tracing::info!(%channel, "subscribed to reservation expiry events");

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { expired_order(&msg).map(Ok) });
        Ok(Box::pin(stream))
    }
}

/// Maps an expired-key event to its order. Events for other keys and
/// undecodable payloads are skipped; the subscription itself is healthy.
fn expired_order(msg: &redis::Msg) -> Option<OrderId> {
    match msg.get_payload::<String>() {
        Ok(key) => parse_reservation_key(&key),
        Err(err) => {
            tracing::warn!(channel = msg.get_channel_name(), error = %err, "skipping undecodable expiry event");
            None
        }
    }
}
