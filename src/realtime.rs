//! Realtime subscription to newly inserted transactions for one merchant.
//!
//! Each subscription is a forwarding task between the store's change feed and
//! the session's event queue. Events carry the id of the handle that produced
//! them so the session can drop anything from a subscription it already closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{ChangeFeed, Transaction};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Inserted {
        handle: u64,
        transaction: Transaction,
    },
    /// The feed failed. The subscription is dead and will not be retried.
    ChannelError { handle: u64, reason: String },
}

impl SessionEvent {
    pub fn handle(&self) -> u64 {
        match self {
            Self::Inserted { handle, .. } | Self::ChannelError { handle, .. } => *handle,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("no async runtime to subscribe on")]
    NoRuntime,
    #[error("subscription rejected: {0}")]
    Rejected(String),
}

/// Anything that can open a merchant subscription.
pub trait Realtime: Send {
    fn open(
        &mut self,
        merchant_id: &str,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<SubscriptionHandle, RealtimeError>;
}

/// An open subscription. Closing is idempotent and dropping closes it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    merchant_id: String,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn new(
        id: u64,
        merchant_id: impl Into<String>,
        token: CancellationToken,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            id,
            merchant_id: merchant_id.into(),
            token,
            task,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn close(&mut self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        // The task notices the token on its next poll; no need to wait for it.
        self.task.take();
        info!("Subscription {} for merchant {} closed", self.id, self.merchant_id);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens subscriptions on a [`ChangeFeed`].
pub struct SubscriptionManager<F: ChangeFeed> {
    feed: Arc<F>,
    next_id: AtomicU64,
}

impl<F: ChangeFeed> SubscriptionManager<F> {
    pub fn new(feed: Arc<F>) -> Self {
        Self {
            feed,
            next_id: AtomicU64::new(1),
        }
    }
}

impl<F: ChangeFeed> Realtime for SubscriptionManager<F> {
    fn open(
        &mut self,
        merchant_id: &str,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<SubscriptionHandle, RealtimeError> {
        if merchant_id.is_empty() {
            return Err(RealtimeError::Rejected("empty merchant id".into()));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RealtimeError::NoRuntime)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        // Subscribe before returning so nothing inserted after open() is missed.
        let inserts = self.feed.subscribe_inserts();

        let task = runtime.spawn(forward(
            id,
            merchant_id.to_string(),
            inserts,
            events,
            token.clone(),
        ));
        info!("Subscription {id} opened for merchant {merchant_id}");
        Ok(SubscriptionHandle::new(id, merchant_id, token, Some(task)))
    }
}

async fn forward(
    id: u64,
    merchant_id: String,
    mut inserts: broadcast::Receiver<Transaction>,
    events: mpsc::Sender<SessionEvent>,
    token: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = inserts.recv() => received,
        };

        let event = match received {
            Ok(transaction) if transaction.merchant_id == merchant_id => {
                debug!("Subscription {id}: insert {}", transaction.id);
                SessionEvent::Inserted {
                    handle: id,
                    transaction,
                }
            }
            Ok(_) => continue,
            Err(e) => {
                let reason = match e {
                    broadcast::error::RecvError::Closed => "change feed closed".to_string(),
                    broadcast::error::RecvError::Lagged(n) => {
                        format!("change feed lagged, {n} events lost")
                    }
                };
                warn!("Subscription {id}: {reason}");
                let _ = events
                    .send(SessionEvent::ChannelError { handle: id, reason })
                    .await;
                break;
            }
        };

        if token.is_cancelled() || events.send(event).await.is_err() {
            break;
        }
    }
    debug!("Subscription {id} forwarder finished");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::amount::Amount;
    use crate::store::{MemoryStore, PaymentStore};

    async fn next(rx: &mut mpsc::Receiver<SessionEvent>) -> Option<SessionEvent> {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn forwards_only_matching_merchant() {
        let store = Arc::new(MemoryStore::new(16));
        let a = store.create_merchant("Aling Nena").unwrap();
        let b = store.create_merchant("Mang Tomas").unwrap();
        let mut manager = SubscriptionManager::new(Arc::clone(&store));
        let (tx, mut rx) = mpsc::channel(8);

        let handle = manager.open(&a.id, tx).unwrap();
        store.create_transaction(&b.id, Amount::from_whole(5), "Other").unwrap();
        let mine = store.create_transaction(&a.id, Amount::from_whole(7), "Juan").unwrap();

        let event = next(&mut rx).await.unwrap();
        assert_eq!(
            event,
            SessionEvent::Inserted {
                handle: handle.id(),
                transaction: mine
            }
        );
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn inserts_arrive_in_commit_order() {
        let store = Arc::new(MemoryStore::new(16));
        let a = store.create_merchant("Aling Nena").unwrap();
        let mut manager = SubscriptionManager::new(Arc::clone(&store));
        let (tx, mut rx) = mpsc::channel(8);

        let _handle = manager.open(&a.id, tx).unwrap();
        let committed: Vec<String> = ["Juan", "Maria", "Pedro"]
            .into_iter()
            .enumerate()
            .map(|(i, customer)| {
                store
                    .create_transaction(&a.id, Amount::from_whole(i as u64 + 1), customer)
                    .unwrap()
                    .id
            })
            .collect();

        let mut received = Vec::new();
        while let Some(SessionEvent::Inserted { transaction, .. }) = next(&mut rx).await {
            received.push(transaction.id);
        }
        assert_eq!(received, committed);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_delivery() {
        let store = Arc::new(MemoryStore::new(16));
        let a = store.create_merchant("Aling Nena").unwrap();
        let mut manager = SubscriptionManager::new(Arc::clone(&store));
        let (tx, mut rx) = mpsc::channel(8);

        let mut handle = manager.open(&a.id, tx).unwrap();
        handle.close();
        handle.close();
        assert!(handle.is_closed());

        tokio::task::yield_now().await;
        store.create_transaction(&a.id, Amount::from_whole(7), "Juan").unwrap();
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn handle_ids_are_unique() {
        let store = Arc::new(MemoryStore::new(16));
        let mut manager = SubscriptionManager::new(Arc::clone(&store));
        let (tx, _rx) = mpsc::channel(8);

        let first = manager.open("m", tx.clone()).unwrap();
        let second = manager.open("m", tx).unwrap();
        assert_ne!(first.id(), second.id());
    }

    struct ClosedFeed;

    impl ChangeFeed for ClosedFeed {
        fn subscribe_inserts(&self) -> broadcast::Receiver<Transaction> {
            let (tx, rx) = broadcast::channel(1);
            drop(tx);
            rx
        }
    }

    #[tokio::test]
    async fn feed_failure_reports_one_channel_error() {
        let mut manager = SubscriptionManager::new(Arc::new(ClosedFeed));
        let (tx, mut rx) = mpsc::channel(8);

        let handle = manager.open("m", tx).unwrap();
        match next(&mut rx).await {
            Some(SessionEvent::ChannelError { handle: id, reason }) => {
                assert_eq!(id, handle.id());
                assert!(reason.contains("closed"));
            }
            other => panic!("expected channel error, got {other:?}"),
        }
        assert!(next(&mut rx).await.is_none());
    }
}
