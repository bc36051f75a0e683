//! Merchant and transaction storage.
//!
//! The soundbox only needs simple create/read access to merchants and payments,
//! plus a change feed that reports every inserted transaction. `MemoryStore`
//! provides both in-process; the broadcast channel plays the role of the
//! database's change-data-capture stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::amount::Amount;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown merchant: {0}")]
    UnknownMerchant(String),
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Merchant {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum TransactionStatus {
    Completed,
    #[allow(dead_code)]
    Pending,
    #[allow(dead_code)]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub merchant_id: String,
    pub amount: Amount,
    pub customer_name: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

/// Create/read access to merchants and their payments.
pub trait PaymentStore: Send + Sync {
    fn create_merchant(&self, name: &str) -> Result<Merchant, StoreError>;

    /// All merchants, sorted by name.
    fn list_merchants(&self) -> Result<Vec<Merchant>, StoreError>;

    fn get_merchant(&self, id: &str) -> Result<Option<Merchant>, StoreError>;

    /// Record a completed payment. The insert is published on the change feed.
    fn create_transaction(
        &self,
        merchant_id: &str,
        amount: Amount,
        customer_name: &str,
    ) -> Result<Transaction, StoreError>;
}

/// Source of row-insert notifications for transactions.
pub trait ChangeFeed: Send + Sync + 'static {
    fn subscribe_inserts(&self) -> broadcast::Receiver<Transaction>;
}

pub struct MemoryStore {
    merchants: RwLock<Vec<Merchant>>,
    transactions: RwLock<Vec<Transaction>>,
    inserts: broadcast::Sender<Transaction>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new(feed_capacity: usize) -> Self {
        let (inserts, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            merchants: RwLock::new(Vec::new()),
            transactions: RwLock::new(Vec::new()),
            inserts,
            next_id: AtomicU64::new(1),
        }
    }

    /// Create the given merchants, skipping names that already exist.
    pub fn seed(&self, names: &[String]) -> Result<Vec<Merchant>, StoreError> {
        let mut created = Vec::new();
        for name in names {
            let exists = self
                .merchants
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .any(|m| &m.name == name);
            if !exists {
                let id = self.seed_id(name);
                created.push(self.insert_merchant(id, name)?);
            }
        }
        info!("Seeded {} merchants", created.len());
        Ok(created)
    }

    /// Transactions recorded for one merchant, newest first.
    #[cfg(test)]
    pub fn transactions_for(&self, merchant_id: &str) -> Vec<Transaction> {
        self.transactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .filter(|t| t.merchant_id == merchant_id)
            .cloned()
            .collect()
    }

    /// Seeded merchants get ids derived from their names, so links and
    /// remembered selections survive a restart.
    fn seed_id(&self, name: &str) -> String {
        let mut slug = String::new();
        for c in name.trim().chars().flat_map(char::to_lowercase) {
            if c.is_ascii_alphanumeric() {
                slug.push(c);
            } else if !slug.is_empty() && !slug.ends_with('-') {
                slug.push('-');
            }
        }
        let base = format!("m_{}", slug.trim_end_matches('-'));

        let merchants = self.merchants.read().unwrap_or_else(PoisonError::into_inner);
        let taken = |id: &str| merchants.iter().any(|m| m.id == id);
        let mut id = base.clone();
        let mut n = 2;
        while taken(&id) {
            id = format!("{base}-{n}");
            n += 1;
        }
        id
    }

    fn insert_merchant(&self, id: String, name: &str) -> Result<Merchant, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Empty("merchant name"));
        }
        let merchant = Merchant {
            id,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.merchants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(merchant.clone());
        debug!("Created merchant {} ({})", merchant.name, merchant.id);
        Ok(merchant)
    }

    fn new_id(&self, prefix: &str) -> String {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{:x}{seq:04x}", Utc::now().timestamp_millis())
    }
}

impl PaymentStore for MemoryStore {
    fn create_merchant(&self, name: &str) -> Result<Merchant, StoreError> {
        self.insert_merchant(self.new_id("m"), name)
    }

    fn list_merchants(&self) -> Result<Vec<Merchant>, StoreError> {
        let mut merchants = self
            .merchants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        merchants.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(merchants)
    }

    fn get_merchant(&self, id: &str) -> Result<Option<Merchant>, StoreError> {
        Ok(self
            .merchants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    fn create_transaction(
        &self,
        merchant_id: &str,
        amount: Amount,
        customer_name: &str,
    ) -> Result<Transaction, StoreError> {
        let customer_name = customer_name.trim();
        if customer_name.is_empty() {
            return Err(StoreError::Empty("customer name"));
        }
        if self.get_merchant(merchant_id)?.is_none() {
            return Err(StoreError::UnknownMerchant(merchant_id.to_string()));
        }

        let transaction = Transaction {
            id: self.new_id("txn"),
            merchant_id: merchant_id.to_string(),
            amount,
            customer_name: customer_name.to_string(),
            status: TransactionStatus::Completed,
            created_at: Utc::now(),
        };

        // Publish while holding the write lock so feed order matches commit order.
        let mut rows = self
            .transactions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        rows.push(transaction.clone());
        let receivers = self.inserts.send(transaction.clone()).unwrap_or(0);
        drop(rows);

        debug!(
            "Recorded {} for merchant {merchant_id} ({receivers} listeners)",
            transaction.id
        );
        Ok(transaction)
    }
}

impl ChangeFeed for MemoryStore {
    fn subscribe_inserts(&self) -> broadcast::Receiver<Transaction> {
        self.inserts.subscribe()
    }
}
