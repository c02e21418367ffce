//! The shared store every component coordinates through.
//!
//! Three implementations ship with the crate:
//!
//! - [`RedisStore`]: the production backend; each compound operation is a Lua
//!   script so it executes atomically on the server.
//! - [`MemoryStore`]: a single-process backend with the same semantics, for
//!   development and tests.
//! - [`BoundedStore`]: a decorator that bounds every call with a timeout.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

mod bounded;
mod memory;
#[cfg(any(test, feature = "test-helpers"))]
mod outage;
#[cfg(feature = "redis")]
mod redis_store;

pub use bounded::BoundedStore;
pub use memory::MemoryStore;
#[cfg(any(test, feature = "test-helpers"))]
pub use outage::OutageStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// One bounded increment of a window counter.
#[derive(Debug, Clone, Copy)]
pub struct WindowIncrement<'a> {
    /// Counter of the current window.
    pub key: &'a str,
    /// Admission stops once the (weighted) count reaches this value.
    pub limit: u64,
    /// Expiry set on the counter when this increment creates it.
    pub ttl: Duration,
    /// Counter of the previous window and the weight its count still carries.
    pub previous: Option<(&'a str, f64)>,
}

/// Outcome of a [`WindowIncrement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Count of the current window after the operation.
    pub current: u64,
    /// Raw count of the previous window, zero when none was requested.
    pub previous: u64,
    /// Whether the increment happened.
    pub admitted: bool,
}

/// Where a queue item currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Waiting to be dequeued, including leased items whose visibility
    /// deadline has passed.
    Ready,
    /// Leased to a consumer whose visibility deadline has not passed.
    InFlight,
}

/// Weighted estimate used by both backends to decide admission.
pub(crate) fn window_estimate(current: u64, previous: u64, weight: f64) -> u64 {
    (previous as f64 * weight).floor() as u64 + current
}

/// Name of the dead-letter queue paired with `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}:dead")
}

/// Operations the admission layer needs from a networked key-value store.
#[async_trait]
pub trait SharedStore: Debug + Send + Sync {
    /// Atomically checks the window against its limit and, if there is room,
    /// increments the current counter, setting its expiry when it is created.
    ///
    /// A request that would exceed the limit leaves the counter untouched.
    async fn increment_window(
        &self,
        window: WindowIncrement<'_>,
    ) -> Result<WindowCount, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration)
    -> Result<(), StoreError>;

    /// Removes `key`, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Adds `member` to the set stored at `index` and keeps the set alive for at
    /// least `ttl`.
    async fn index_add(&self, index: &str, member: &str, ttl: Duration)
    -> Result<(), StoreError>;

    /// Deletes every key listed in the set at `index`, then the set itself.
    /// Returns how many listed keys still existed.
    async fn delete_indexed(&self, index: &str) -> Result<u64, StoreError>;

    /// Appends an item to the queue, returning the number of ready plus
    /// in-flight items.
    async fn queue_push(&self, queue: &str, id: &str, payload: &[u8])
    -> Result<u64, StoreError>;

    /// Returns expired in-flight items to the queue, then leases the head item
    /// under `lease` until `visibility` has elapsed.
    async fn queue_pop(
        &self,
        queue: &str,
        lease: &str,
        visibility: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, StoreError>;

    /// Removes a leased item for good. Returns `false` if `lease` no longer owns it.
    async fn queue_ack(&self, queue: &str, id: &str, lease: &str) -> Result<bool, StoreError>;

    /// Settles a leased item and appends `payload` under the same id to `to`.
    /// Returns `false` if `lease` no longer owns it.
    async fn queue_move(
        &self,
        from: &str,
        to: &str,
        id: &str,
        lease: &str,
        payload: &[u8],
    ) -> Result<bool, StoreError>;

    /// Number of ready plus in-flight items.
    async fn queue_len(&self, queue: &str) -> Result<u64, StoreError>;

    /// Where item `id` sits in `queue`, or `None` if the queue does not hold it.
    async fn queue_locate(&self, queue: &str, id: &str) -> Result<Option<ItemState>, StoreError>;
}
