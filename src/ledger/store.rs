use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::models::order::Order;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable backing for the assignment ledger. Every order transition is saved
/// here before it becomes visible in memory.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn save(&self, order: &Order) -> Result<(), StoreError>;

    async fn load(&self) -> Result<Vec<Order>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryStore {
    orders: DashMap<Uuid, Order>,
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn save(&self, order: &Order) -> Result<(), StoreError> {
        self.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self
            .orders
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

/// Append-only JSON-lines journal. The last line written for an order wins.
pub struct JournalStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JournalStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LedgerStore for JournalStore {
    async fn save(&self, order: &Order) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(order)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<Order>, StoreError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let lines: Vec<&str> = raw.lines().filter(|line| !line.trim().is_empty()).collect();

        let mut latest: HashMap<Uuid, Order> = HashMap::new();
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Order>(line) {
                Ok(order) => {
                    latest.insert(order.id, order);
                }
                // A torn final line is what an interrupted append leaves behind.
                Err(err) if idx + 1 == lines.len() => {
                    warn!(path = %self.path.display(), error = %err, "skipping truncated journal tail");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut orders: Vec<Order> = latest.into_values().collect();
        orders.sort_by_key(|order| (order.created_at, order.id));
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{JournalStore, LedgerStore};
    use crate::models::courier::{CourierId, GeoPoint};
    use crate::models::order::{Order, OrderState};

    fn journal_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("shopper-dispatch-{}.jsonl", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn journal_replays_latest_state_per_order() {
        let path = journal_path();
        let store = JournalStore::open(&path).await.unwrap();

        let mut order = Order::new(GeoPoint::new(0.0, 0.0), None);
        store.save(&order).await.unwrap();
        order.state = OrderState::Accepted {
            courier_id: CourierId::from("s1"),
        };
        store.save(&order).await.unwrap();

        let reopened = JournalStore::open(&path).await.unwrap();
        let orders = reopened.load().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].state, order.state);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn journal_skips_torn_tail() {
        let path = journal_path();
        let store = JournalStore::open(&path).await.unwrap();
        let order = Order::new(GeoPoint::new(1.0, 1.0), None);
        store.save(&order).await.unwrap();

        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"id\":\"trunc");
        std::fs::write(&path, raw).unwrap();

        let orders = store.load().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, order.id);

        let _ = std::fs::remove_file(&path);
    }
}
