use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::ItemState;
use super::SharedStore;
use super::WindowCount;
use super::WindowIncrement;
use crate::error::StoreError;

/// Puts a timeout on every call to the wrapped store.
///
/// An elapsed call becomes [`StoreError::Timeout`] and is then handled like any
/// other store failure.
#[derive(Debug, Clone)]
pub struct BoundedStore {
    inner: Arc<dyn SharedStore>,
    timeout: Duration,
}

impl BoundedStore {
    pub fn new(inner: Arc<dyn SharedStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl SharedStore for BoundedStore {
    async fn increment_window(
        &self,
        window: WindowIncrement<'_>,
    ) -> Result<WindowCount, StoreError> {
        self.bounded(self.inner.increment_window(window)).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.bounded(self.inner.get(key)).await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.bounded(self.inner.set_with_ttl(key, value, ttl)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.bounded(self.inner.delete(key)).await
    }

    async fn index_add(&self, index: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        self.bounded(self.inner.index_add(index, member, ttl)).await
    }

    async fn delete_indexed(&self, index: &str) -> Result<u64, StoreError> {
        self.bounded(self.inner.delete_indexed(index)).await
    }

    async fn queue_push(
        &self,
        queue: &str,
        id: &str,
        payload: &[u8],
    ) -> Result<u64, StoreError> {
        self.bounded(self.inner.queue_push(queue, id, payload)).await
    }

    async fn queue_pop(
        &self,
        queue: &str,
        lease: &str,
        visibility: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, StoreError> {
        self.bounded(self.inner.queue_pop(queue, lease, visibility))
            .await
    }

    async fn queue_ack(&self, queue: &str, id: &str, lease: &str) -> Result<bool, StoreError> {
        self.bounded(self.inner.queue_ack(queue, id, lease)).await
    }

    async fn queue_move(
        &self,
        from: &str,
        to: &str,
        id: &str,
        lease: &str,
        payload: &[u8],
    ) -> Result<bool, StoreError> {
        self.bounded(self.inner.queue_move(from, to, id, lease, payload))
            .await
    }

    async fn queue_len(&self, queue: &str) -> Result<u64, StoreError> {
        self.bounded(self.inner.queue_len(queue)).await
    }

    async fn queue_locate(&self, queue: &str, id: &str) -> Result<Option<ItemState>, StoreError> {
        self.bounded(self.inner.queue_locate(queue, id)).await
    }
}
