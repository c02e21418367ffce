use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::FailPolicy;
use super::Pass;
use super::Reason;
use super::Strategy;
use crate::clock::Clock;
use crate::store::SharedStore;
use crate::store::WindowIncrement;
use crate::store::window_estimate;
use crate::tier::PrincipalId;
use crate::tier::Quota;

/// A Sliding Window Counter implementation backed by the shared store.
///
/// It keeps a count for the current fixed window and the previous one.
/// The effective count is: (previous_count * %_of_window_left) + current_count.
/// Counters live for two periods so the previous window is still readable.
#[derive(Debug)]
pub struct SlidingWindow {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    fail_policy: FailPolicy,
}

impl SlidingWindow {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            fail_policy: FailPolicy::Open,
        }
    }

    pub fn with_fail_policy(mut self, fail_policy: FailPolicy) -> Self {
        self.fail_policy = fail_policy;
        self
    }
}

/// Earliest time from `elapsed` into the current window at which the estimate
/// drops below `limit` again.
fn retry_after(limit: u64, current: u64, previous: u64, period_ms: u64, elapsed_ms: u64) -> Duration {
    let period = period_ms as f64;
    let left_in_window = (period_ms - elapsed_ms) as f64;

    let wait_ms = if current < limit && previous > 0 {
        // The previous window's weight has to shrink enough to make room.
        let room = (limit - current) as f64;
        (left_in_window - period * room / previous as f64).max(0.0) + 1.0
    } else {
        // Only the next window can make room; the current count then becomes
        // the previous one and has to decay below the limit.
        let decay = period * (1.0 - limit as f64 / current.max(1) as f64);
        left_in_window + decay.max(0.0) + 1.0
    };

    Duration::from_millis(wait_ms.ceil() as u64)
}

#[async_trait]
impl Strategy for SlidingWindow {
    async fn process(&self, principal: &PrincipalId, quota: &Quota) -> ControlFlow<Reason, Pass> {
        let period_ms = (quota.period.as_millis() as u64).max(1);
        let now_ms = self.clock.now().as_millis() as u64;
        let bucket = now_ms / period_ms;
        let elapsed_ms = now_ms - bucket * period_ms;
        let weight = (period_ms - elapsed_ms) as f64 / period_ms as f64;

        let key = quota.counter_key(principal, bucket);
        let previous_key = quota.counter_key(principal, bucket.saturating_sub(1));
        let limit = quota.limit.get();
        let window = WindowIncrement {
            key: &key,
            limit,
            ttl: quota.period * 2,
            previous: Some((&previous_key, weight)),
        };

        match self.store.increment_window(window).await {
            Ok(count) if count.admitted => {
                let estimate = window_estimate(count.current, count.previous, weight);
                ControlFlow::Continue(Pass::Counted {
                    remaining: limit.saturating_sub(estimate),
                })
            }
            Ok(count) => {
                debug!(
                    tier = %quota.tier,
                    scope = %quota.scope,
                    %principal,
                    current = count.current,
                    previous = count.previous,
                    "quota exceeded"
                );
                ControlFlow::Break(Reason::QuotaExceeded {
                    retry_after: retry_after(
                        limit,
                        count.current,
                        count.previous,
                        period_ms,
                        elapsed_ms,
                    ),
                })
            }
            Err(err) => self.fail_policy.decide("rate_limit", &err),
        }
    }
}
