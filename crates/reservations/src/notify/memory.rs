use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use ledger::OrderId;
use tokio::sync::{Mutex, mpsc};

use super::{ExpiryFeed, ExpiryStream, NotifyError, ReservationNotifier};

type Delivery = Result<OrderId, NotifyError>;

#[derive(Default)]
struct NotifierState {
    /// Armed orders and the generation of their latest arm call.
    armed: HashMap<OrderId, u64>,
    generation: u64,
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
    fail_on_arm: bool,
    fail_on_subscribe: bool,
}

impl NotifierState {
    fn broadcast(&mut self, order_id: OrderId) {
        self.subscribers
            .retain(|subscriber| subscriber.send(Ok(order_id)).is_ok());
    }

    fn fire_if_current(&mut self, order_id: OrderId, generation: u64) {
        if self.armed.get(&order_id) == Some(&generation) {
            self.armed.remove(&order_id);
            self.broadcast(order_id);
        }
    }
}

/// In-memory expiry signals driven by tokio timers.
///
/// Mirrors the expiring-key semantics: re-arming replaces the deadline, and a
/// signal fired while nobody is subscribed is lost. Includes hooks to inject
/// failures and disconnects for testing.
#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    state: Arc<Mutex<NotifierState>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the notifier to fail on arm (for testing).
    pub async fn set_fail_on_arm(&self, fail: bool) {
        self.state.lock().await.fail_on_arm = fail;
    }

    /// Configure the notifier to refuse subscriptions (for testing).
    pub async fn set_fail_on_subscribe(&self, fail: bool) {
        self.state.lock().await.fail_on_subscribe = fail;
    }

    /// Fires an armed signal immediately. Returns false if it wasn't armed.
    pub async fn expire_now(&self, order_id: OrderId) -> bool {
        let mut state = self.state.lock().await;
        if state.armed.remove(&order_id).is_none() {
            return false;
        }
        state.broadcast(order_id);
        true
    }

    /// Delivers a signal whether or not one is armed, as a duplicate or
    /// stale event would be.
    pub async fn deliver(&self, order_id: OrderId) {
        self.state.lock().await.broadcast(order_id);
    }

    /// Breaks every open subscription.
    pub async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        for subscriber in state.subscribers.drain(..) {
            let _ = subscriber.send(Err(NotifyError::Disconnected));
        }
    }

    pub async fn is_armed(&self, order_id: OrderId) -> bool {
        self.state.lock().await.armed.contains_key(&order_id)
    }

    pub async fn armed_count(&self) -> usize {
        self.state.lock().await.armed.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }
}

#[async_trait]
impl ReservationNotifier for InMemoryNotifier {
    async fn arm(&self, order_id: OrderId, ttl: Duration) -> Result<(), NotifyError> {
        let generation = {
            let mut state = self.state.lock().await;
            if state.fail_on_arm {
                return Err(NotifyError::Unavailable(
                    "simulated arm failure".to_string(),
                ));
            }
            state.generation += 1;
            let generation = state.generation;
            state.armed.insert(order_id, generation);
            generation
        };

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            state.lock().await.fire_if_current(order_id, generation);
        });
        Ok(())
    }
}

#[async_trait]
impl ExpiryFeed for InMemoryNotifier {
    async fn subscribe(&self) -> Result<ExpiryStream, NotifyError> {
        let mut state = self.state.lock().await;
        if state.fail_on_subscribe {
            return Err(NotifyError::Unavailable(
                "simulated subscribe failure".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(tx);

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(Box::pin(stream))
    }
}
