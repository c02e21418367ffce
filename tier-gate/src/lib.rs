//! # tier-gate
//!
//! `tier-gate` provides the admission core of a tiered HTTP API: rate limiting,
//! response caching and deferred work, all coordinated through one shared store.
//!
//! ## Core Philosophy
//!
//! Every request may be served by a different process, so no decision can rest on
//! in-process state. Counters, cache entries and queue items live in the
//! [`SharedStore`], and every read-modify-write happens inside a single atomic store
//! operation (a Lua script on Redis). The process itself only holds immutable
//! configuration such as the [`TierTable`].
//!
//! ## Key Concepts
//!
//! * **Tiers**: principals map to a named quota `{limit, period}`; unknown and
//!   anonymous principals fall back to the default tier.
//! * **Strategy Trait**: a unified interface for the window algorithms
//!   ([`FixedWindow`], [`SlidingWindow`]).
//! * **Fail Policy**: what a strategy answers when the store cannot be reached.
//! * **At-least-once Queue**: items are leased to one consumer at a time and become
//!   visible again if not committed in time.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tier_gate::{FixedWindow, MemoryStore, Principal, Strategy, SystemClock, TierTable};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let clock = Arc::new(SystemClock);
//! let store = Arc::new(MemoryStore::new(clock.clone()));
//! let tiers = TierTable::single("free", 10, Duration::from_secs(3600)).unwrap();
//! let limiter = FixedWindow::new(store, clock);
//!
//! let principal = Principal::anonymous("203.0.113.7");
//! let quota = tiers.resolve(&principal).quota("/api/v1/users");
//! if limiter.process(principal.id(), &quota).await.is_continue() {
//!     // Request allowed
//! }
//! # }
//! ```

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

mod cache;
mod clock;
mod error;
mod fixed_window;
mod gate;
mod metrics;
mod queue;
mod request;
mod settings;
mod sliding_window;
pub mod store;
mod tier;

pub use cache::CacheEntry;
pub use cache::Fingerprint;
pub use cache::Lookup;
pub use cache::ResponseCache;
pub use cache::VaryPolicy;
pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::SystemClock;
pub use error::ConfigError;
pub use error::QueueError;
pub use error::SetupError;
pub use error::StoreError;
pub use fixed_window::FixedWindow;
pub use gate::Gate;
pub use gate::GateReport;
pub use metrics::GateMetrics;
pub use metrics::MetricsSnapshot;
pub use queue::Delivery;
pub use queue::ItemStatus;
pub use queue::Job;
pub use queue::QueueItem;
pub use queue::TaskQueue;
pub use queue::WorkerPool;
pub use request::CACHE_CONTROL;
pub use request::GateRequest;
pub use request::GateResponse;
pub use request::Method;
pub use request::RETRY_AFTER;
pub use request::X_CACHE;
pub use settings::CacheConfig;
pub use settings::GateConfig;
pub use settings::LimiterConfig;
pub use settings::LimitSpec;
pub use settings::QueueConfig;
pub use settings::StoreConfig;
pub use settings::TierSpec;
pub use settings::TiersConfig;
pub use settings::WindowKind;
pub use sliding_window::SlidingWindow;
pub use store::ItemState;
pub use store::MemoryStore;
pub use store::SharedStore;
pub use tier::Principal;
pub use tier::PrincipalId;
pub use tier::Quota;
pub use tier::Tier;
pub use tier::TierTable;
pub use tier::normalize_path;

/// Boxed error type used at the handler and job boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Reasons why a request might be rejected by a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The principal used up its quota for the current window.
    QuotaExceeded { retry_after: Duration },
    /// The store could not be consulted and the policy is [`FailPolicy::Closed`].
    StoreUnavailable,
}

/// How a request that a strategy let through was accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// The request was counted; `remaining` admissions are left in the window.
    Counted { remaining: u64 },
    /// The store could not be consulted and the policy is [`FailPolicy::Open`].
    Degraded,
}

/// Behaviour of a component when the shared store is unreachable or times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// Serve the request without the store's answer.
    #[default]
    Open,
    /// Refuse the request.
    Closed,
}

impl FailPolicy {
    /// Turns a store failure into a rate limiting decision, logging the degradation.
    pub fn decide(self, component: &'static str, err: &StoreError) -> ControlFlow<Reason, Pass> {
        warn!(component, error = %err, policy = ?self, "shared store degraded");
        match self {
            FailPolicy::Open => ControlFlow::Continue(Pass::Degraded),
            FailPolicy::Closed => ControlFlow::Break(Reason::StoreUnavailable),
        }
    }
}

/// The core trait for all rate-limiting algorithms.
///
/// Strategies hold no per-principal state of their own; every count lives in the
/// shared store so that all instances of a service see the same quota.
#[async_trait]
pub trait Strategy: Debug + Send + Sync {
    /// Attempts to admit a single request from `principal` under `quota`.
    ///
    /// # Errors
    ///
    /// Returns `Reason` if the quota has been used up, or if the store is
    /// unreachable and the strategy fails closed.
    async fn process(&self, principal: &PrincipalId, quota: &Quota) -> ControlFlow<Reason, Pass>;
}
