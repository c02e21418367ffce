use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;

use super::ItemState;
use super::SharedStore;
use super::WindowCount;
use super::WindowIncrement;
use crate::error::StoreError;

/// Wraps a store and can be switched into a simulated network outage.
#[derive(Debug)]
pub struct OutageStore {
    inner: Arc<dyn SharedStore>,
    down: AtomicBool,
}

impl OutageStore {
    pub fn new(inner: Arc<dyn SharedStore>) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
        }
    }

    /// Every call fails with [`StoreError::Unavailable`] until [`Self::recover`].
    pub fn fail(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    fn reachable(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedStore for OutageStore {
    async fn increment_window(
        &self,
        window: WindowIncrement<'_>,
    ) -> Result<WindowCount, StoreError> {
        self.reachable()?;
        self.inner.increment_window(window).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.reachable()?;
        self.inner.get(key).await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.reachable()?;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.reachable()?;
        self.inner.delete(key).await
    }

    async fn index_add(&self, index: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        self.reachable()?;
        self.inner.index_add(index, member, ttl).await
    }

    async fn delete_indexed(&self, index: &str) -> Result<u64, StoreError> {
        self.reachable()?;
        self.inner.delete_indexed(index).await
    }

    async fn queue_push(
        &self,
        queue: &str,
        id: &str,
        payload: &[u8],
    ) -> Result<u64, StoreError> {
        self.reachable()?;
        self.inner.queue_push(queue, id, payload).await
    }

    async fn queue_pop(
        &self,
        queue: &str,
        lease: &str,
        visibility: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, StoreError> {
        self.reachable()?;
        self.inner.queue_pop(queue, lease, visibility).await
    }

    async fn queue_ack(&self, queue: &str, id: &str, lease: &str) -> Result<bool, StoreError> {
        self.reachable()?;
        self.inner.queue_ack(queue, id, lease).await
    }

    async fn queue_move(
        &self,
        from: &str,
        to: &str,
        id: &str,
        lease: &str,
        payload: &[u8],
    ) -> Result<bool, StoreError> {
        self.reachable()?;
        self.inner.queue_move(from, to, id, lease, payload).await
    }

    async fn queue_len(&self, queue: &str) -> Result<u64, StoreError> {
        self.reachable()?;
        self.inner.queue_len(queue).await
    }

    async fn queue_locate(&self, queue: &str, id: &str) -> Result<Option<ItemState>, StoreError> {
        self.reachable()?;
        self.inner.queue_locate(queue, id).await
    }
}
