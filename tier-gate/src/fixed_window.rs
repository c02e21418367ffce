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
use crate::tier::PrincipalId;
use crate::tier::Quota;

/// A window-based limiter backed by the shared store.
///
/// Divides time into fixed intervals aligned to the epoch, so every instance
/// agrees on where a window starts. It costs one store round trip per request
/// but allows a "boundary burst" of up to twice the limit in a short period
/// spanning two windows.
#[derive(Debug)]
pub struct FixedWindow {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    fail_policy: FailPolicy,
}

impl FixedWindow {
    /// Creates a new `FixedWindow` strategy that fails open.
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

#[async_trait]
impl Strategy for FixedWindow {
    async fn process(&self, principal: &PrincipalId, quota: &Quota) -> ControlFlow<Reason, Pass> {
        let period_ms = (quota.period.as_millis() as u64).max(1);
        let now_ms = self.clock.now().as_millis() as u64;
        let bucket = now_ms / period_ms;
        let reset_in = Duration::from_millis((bucket + 1) * period_ms - now_ms);

        let key = quota.counter_key(principal, bucket);
        let window = WindowIncrement {
            key: &key,
            limit: quota.limit.get(),
            ttl: quota.period,
            previous: None,
        };

        match self.store.increment_window(window).await {
            Ok(count) if count.admitted => ControlFlow::Continue(Pass::Counted {
                remaining: quota.limit.get().saturating_sub(count.current),
            }),
            Ok(count) => {
                debug!(
                    tier = %quota.tier,
                    scope = %quota.scope,
                    %principal,
                    count = count.current,
                    "quota exceeded"
                );
                ControlFlow::Break(Reason::QuotaExceeded {
                    retry_after: reset_in,
                })
            }
            Err(err) => self.fail_policy.decide("rate_limit", &err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;

    use more_asserts::assert_le;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::store::OutageStore;

    fn quota(limit: u64, period: Duration) -> Quota {
        Quota {
            tier: "free".to_string(),
            scope: "*".to_string(),
            limit: NonZeroU64::new(limit).unwrap(),
            period,
        }
    }

    fn limiter(clock: &ManualClock) -> FixedWindow {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        FixedWindow::new(Arc::new(MemoryStore::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn it_enforces_the_free_tier() {
        let clock = ManualClock::new(Duration::from_secs(7_200));
        let rl = limiter(&clock);
        let quota = quota(10, Duration::from_secs(3600));
        let user = PrincipalId::User("42".to_string());

        for i in 0..10 {
            clock.advance(Duration::from_secs(1));
            assert_eq!(
                rl.process(&user, &quota).await,
                ControlFlow::Continue(Pass::Counted { remaining: 9 - i })
            );
        }

        match rl.process(&user, &quota).await {
            ControlFlow::Break(Reason::QuotaExceeded { retry_after }) => {
                assert_le!(retry_after, Duration::from_secs(3600));
                assert_eq!(retry_after, Duration::from_secs(3590));
            }
            other => panic!("expected a denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn it_resets_after_the_period() {
        let clock = ManualClock::new(Duration::from_secs(100));
        let rl = limiter(&clock);
        let quota = quota(1, Duration::from_secs(10));
        let user = PrincipalId::User("1".to_string());

        assert!(rl.process(&user, &quota).await.is_continue());
        assert!(rl.process(&user, &quota).await.is_break());

        clock.advance(Duration::from_secs(9));
        assert!(rl.process(&user, &quota).await.is_break());

        clock.advance(Duration::from_secs(1));
        assert!(rl.process(&user, &quota).await.is_continue());
    }

    #[tokio::test]
    async fn principals_and_scopes_are_counted_apart() {
        let clock = ManualClock::new(Duration::from_secs(100));
        let rl = limiter(&clock);
        let whole_tier = quota(1, Duration::from_secs(60));
        let mut search = whole_tier.clone();
        search.scope = "/search".to_string();

        let alice = PrincipalId::User("alice".to_string());
        let anon = PrincipalId::Anonymous("203.0.113.7".to_string());

        assert!(rl.process(&alice, &whole_tier).await.is_continue());
        assert!(rl.process(&alice, &whole_tier).await.is_break());
        assert!(rl.process(&anon, &whole_tier).await.is_continue());
        assert!(rl.process(&alice, &search).await.is_continue());
    }

    #[tokio::test]
    async fn test_actual_concurrency() {
        let clock = ManualClock::new(Duration::from_secs(100));
        let rl = Arc::new(limiter(&clock));
        let capacity = 100;
        let quota = Arc::new(quota(capacity, Duration::from_secs(60)));

        let mut handles = vec![];
        for _ in 0..capacity + 10 {
            let rl = Arc::clone(&rl);
            let quota = Arc::clone(&quota);
            handles.push(tokio::spawn(async move {
                rl.process(&PrincipalId::User("hot".to_string()), &quota)
                    .await
            }));
        }

        let results = futures::future::join_all(handles).await;
        let success_count = results
            .into_iter()
            .filter(|r| matches!(r, Ok(ControlFlow::Continue(_))))
            .count();

        // Exactly 'capacity' should pass, however the tasks interleave
        assert_eq!(success_count, capacity as usize);
    }

    #[tokio::test]
    async fn it_fails_open_by_default() {
        let clock = ManualClock::new(Duration::from_secs(100));
        let store = Arc::new(OutageStore::new(Arc::new(MemoryStore::new(Arc::new(
            clock.clone(),
        )))));
        let rl = FixedWindow::new(store.clone(), Arc::new(clock));
        let quota = quota(1, Duration::from_secs(60));
        let user = PrincipalId::User("1".to_string());

        store.fail();
        assert_eq!(
            rl.process(&user, &quota).await,
            ControlFlow::Continue(Pass::Degraded)
        );
        assert_eq!(
            rl.process(&user, &quota).await,
            ControlFlow::Continue(Pass::Degraded)
        );

        store.recover();
        assert!(rl.process(&user, &quota).await.is_continue());
        assert!(rl.process(&user, &quota).await.is_break());
    }

    #[tokio::test]
    async fn it_can_fail_closed() {
        let clock = ManualClock::new(Duration::from_secs(100));
        let store = Arc::new(OutageStore::new(Arc::new(MemoryStore::new(Arc::new(
            clock.clone(),
        )))));
        let rl = FixedWindow::new(store.clone(), Arc::new(clock))
            .with_fail_policy(FailPolicy::Closed);

        store.fail();
        assert_eq!(
            rl.process(&PrincipalId::User("1".to_string()), &quota(5, Duration::from_secs(1)))
                .await,
            ControlFlow::Break(Reason::StoreUnavailable)
        );
    }
}
