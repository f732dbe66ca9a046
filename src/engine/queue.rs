use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::observability::metrics::Metrics;

/// One matching pass for one order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkItem {
    pub order_id: Uuid,
    pub radius_km: f64,
    pub pass: u32,
}

/// Bounded work queue that holds each order at most once, counting both items
/// in the channel and items waiting out a backoff.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<WorkItem>,
    scheduled: Arc<DashMap<Uuid, ()>>,
    metrics: Metrics,
}

impl WorkQueue {
    pub fn new(capacity: usize, metrics: Metrics) -> (Self, mpsc::Receiver<WorkItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                scheduled: Arc::new(DashMap::new()),
                metrics,
            },
            rx,
        )
    }

    /// Waits for queue space. Returns false when the order is already scheduled.
    pub async fn enqueue(&self, item: WorkItem) -> Result<bool, DispatchError> {
        if self.scheduled.insert(item.order_id, ()).is_some() {
            return Ok(false);
        }

        if let Err(err) = self.tx.send(item).await {
            self.scheduled.remove(&item.order_id);
            warn!(order_id = %item.order_id, error = %err, "order queue send failed");
            return Err(DispatchError::QueueClosed);
        }

        self.metrics.orders_in_queue.inc();
        Ok(true)
    }

    /// Enqueues from a background task after `delay`, so callers inside the
    /// worker pool never block on a full queue.
    pub fn schedule(&self, item: WorkItem, delay: Duration) -> bool {
        if self.scheduled.insert(item.order_id, ()).is_some() {
            return false;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if let Err(err) = queue.tx.send(item).await {
                queue.scheduled.remove(&item.order_id);
                warn!(order_id = %item.order_id, error = %err, "order queue send failed");
                return;
            }
            queue.metrics.orders_in_queue.inc();
        });
        true
    }

    /// Called by a worker as it picks `order_id` up; the order may be scheduled again.
    pub fn mark_taken(&self, order_id: Uuid) {
        if self.scheduled.remove(&order_id).is_some() {
            self.metrics.orders_in_queue.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::{WorkItem, WorkQueue};
    use crate::observability::metrics::Metrics;

    fn item(order_id: Uuid) -> WorkItem {
        WorkItem {
            order_id,
            radius_km: 2.0,
            pass: 0,
        }
    }

    #[tokio::test]
    async fn order_is_queued_once_until_taken() {
        let (queue, mut rx) = WorkQueue::new(8, Metrics::new());
        let order_id = Uuid::new_v4();

        assert!(queue.enqueue(item(order_id)).await.unwrap());
        assert!(!queue.enqueue(item(order_id)).await.unwrap());
        assert!(!queue.schedule(item(order_id), Duration::ZERO));

        let received = rx.recv().await.unwrap();
        queue.mark_taken(received.order_id);
        assert!(queue.enqueue(item(order_id)).await.unwrap());
    }

    #[tokio::test]
    async fn scheduled_item_arrives_after_delay() {
        let (queue, mut rx) = WorkQueue::new(8, Metrics::new());
        let order_id = Uuid::new_v4();

        assert!(queue.schedule(item(order_id), Duration::from_millis(20)));
        assert!(!queue.schedule(item(order_id), Duration::ZERO));

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.order_id, order_id);
    }
}
