use std::sync::Arc;

use tracing::info;
use tracing::warn;

use crate::FailPolicy;
use crate::Strategy;
use crate::cache::ResponseCache;
use crate::cache::VaryPolicy;
use crate::clock::Clock;
use crate::error::ConfigError;
#[cfg(feature = "redis")]
use crate::error::SetupError;
use crate::fixed_window::FixedWindow;
use crate::metrics::GateMetrics;
use crate::metrics::MetricsSnapshot;
use crate::queue::TaskQueue;
use crate::settings::GateConfig;
use crate::settings::WindowKind;
use crate::sliding_window::SlidingWindow;
use crate::store::BoundedStore;
use crate::store::SharedStore;
use crate::tier::TierTable;

/// Everything the admission path needs, built once from a [`GateConfig`] and
/// shared by every request.
#[derive(Debug)]
pub struct Gate {
    tiers: TierTable,
    limiter: Arc<dyn Strategy>,
    cache: ResponseCache,
    queue: Arc<TaskQueue<serde_json::Value>>,
    metrics: GateMetrics,
    vary: VaryPolicy,
    cache_enabled: bool,
    fail_policy: FailPolicy,
}

/// Counters plus the current queue depths.
///
/// A depth is `None` when the store could not be asked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateReport {
    pub metrics: MetricsSnapshot,
    pub queue_depth: Option<u64>,
    pub dead_letter_depth: Option<u64>,
}

impl Gate {
    /// Connects to the configured Redis server and assembles the components.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the store cannot be reached.
    #[cfg(feature = "redis")]
    pub async fn connect(config: &GateConfig) -> Result<Self, SetupError> {
        use crate::clock::SystemClock;
        use crate::store::RedisStore;

        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = RedisStore::connect(
            &config.store.url(),
            config.store.key_prefix.clone(),
            clock.clone(),
        )
        .await?;

        Ok(Self::from_store(config, Arc::new(store), clock)?)
    }

    /// Assembles the components on top of an existing store. Every call to
    /// `store` is bounded by `store.timeout_ms`.
    pub fn from_store(
        config: &GateConfig,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let tiers = config.tier_table()?;
        let store: Arc<dyn SharedStore> =
            Arc::new(BoundedStore::new(store, config.store.timeout()));
        let metrics = GateMetrics::new();
        let fail_policy = config.limiter.fail_policy;

        let limiter: Arc<dyn Strategy> = match config.limiter.window {
            WindowKind::Fixed => Arc::new(
                FixedWindow::new(store.clone(), clock.clone()).with_fail_policy(fail_policy),
            ),
            WindowKind::Sliding => Arc::new(
                SlidingWindow::new(store.clone(), clock.clone()).with_fail_policy(fail_policy),
            ),
        };

        let cache = ResponseCache::new(
            store.clone(),
            clock.clone(),
            config.cache.ttl(),
            config.cache.client_max_age(),
        );

        let queue = TaskQueue::new(store, clock, config.queue.name.clone())
            .with_visibility_timeout(config.queue.visibility_timeout())
            .with_max_attempts(config.queue.max_attempts)
            .with_max_depth(config.queue.max_depth)
            .with_poll_interval(config.queue.poll_interval())
            .with_metrics(metrics.clone());

        info!(
            tiers = config.tiers.tiers.len(),
            default_tier = %config.tiers.default,
            window = ?config.limiter.window,
            fail_policy = ?fail_policy,
            cache = config.cache.enabled,
            queue = %config.queue.name,
            "admission gate ready"
        );

        Ok(Self {
            tiers,
            limiter,
            cache,
            queue: Arc::new(queue),
            metrics,
            vary: config.cache.vary_policy(),
            cache_enabled: config.cache.enabled,
            fail_policy,
        })
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub fn limiter(&self) -> &Arc<dyn Strategy> {
        &self.limiter
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    pub fn queue(&self) -> &Arc<TaskQueue<serde_json::Value>> {
        &self.queue
    }

    pub fn metrics(&self) -> &GateMetrics {
        &self.metrics
    }

    pub fn vary(&self) -> &VaryPolicy {
        &self.vary
    }

    /// What to do when the cache cannot be read.
    pub fn fail_policy(&self) -> FailPolicy {
        self.fail_policy
    }

    /// Current tallies and queue depths. A depth the store cannot provide is
    /// logged and left out; one it can is also recorded on the depth gauges.
    pub async fn report(&self) -> GateReport {
        let queue = self.queue.name();
        let queue_depth = match self.queue.depth().await {
            Ok(depth) => {
                self.metrics.queue_depth(queue, depth);
                Some(depth)
            }
            Err(err) => {
                warn!(queue, error = %err, "queue depth unavailable");
                None
            }
        };
        let dead_letter_depth = match self.queue.dead_letter_depth().await {
            Ok(depth) => {
                self.metrics.dead_letter_depth(queue, depth);
                Some(depth)
            }
            Err(err) => {
                warn!(queue, error = %err, "dead-letter depth unavailable");
                None
            }
        };

        GateReport {
            metrics: self.metrics.snapshot(),
            queue_depth,
            dead_letter_depth,
        }
    }
}
