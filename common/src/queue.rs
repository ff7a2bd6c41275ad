// Persisted work queues
// FIFO lists stored as whole JSON arrays in the durable store. The
// dequeue is a read-remove-persist sequence with no locking, so exactly
// one runner may own a queue key at a time (single-writer invariant).

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::instrument;

use crate::errors::StoreError;
use crate::store::DurableStore;
use crate::telemetry;

/// Ordered queue of work descriptors bound to one store key.
pub struct WorkQueue<T> {
    store: Arc<dyn DurableStore>,
    key: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> WorkQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: Arc<dyn DurableStore>, key: &'static str) -> Self {
        Self {
            store,
            key,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    async fn load(&self) -> Vec<T> {
        self.store.get_json(self.key, Vec::new()).await
    }

    async fn persist(&self, items: &Vec<T>) -> Result<(), StoreError> {
        self.store.set_json(self.key, items).await?;
        telemetry::update_queue_depth(self.key, items.len());
        Ok(())
    }

    /// Remove and return the head item. An empty queue yields `None`,
    /// never an error.
    #[instrument(skip(self), fields(queue = self.key))]
    pub async fn dequeue_head(&self) -> Result<Option<T>, StoreError> {
        let mut items = self.load().await;
        if items.is_empty() {
            return Ok(None);
        }
        let head = items.remove(0);
        self.persist(&items).await?;
        Ok(Some(head))
    }

    /// Remove and return up to `limit` items from the head.
    #[instrument(skip(self), fields(queue = self.key))]
    pub async fn dequeue_up_to(&self, limit: usize) -> Result<Vec<T>, StoreError> {
        let mut items = self.load().await;
        if items.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let take = limit.min(items.len());
        let head: Vec<T> = items.drain(..take).collect();
        self.persist(&items).await?;
        Ok(head)
    }

    /// Append an item to the tail. Enqueueing is driven externally; the
    /// runner only ever dequeues.
    pub async fn push_back(&self, item: T) -> Result<(), StoreError> {
        let mut items = self.load().await;
        items.push(item);
        self.persist(&items).await
    }

    pub async fn len(&self) -> usize {
        self.load().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.load().await.is_empty()
    }
}
