use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use tier_gate::CACHE_CONTROL;
use tier_gate::FailPolicy;
use tier_gate::Fingerprint;
use tier_gate::Gate;
use tier_gate::GateRequest;
use tier_gate::GateResponse;
use tier_gate::Lookup;
use tier_gate::Pass;
use tier_gate::Reason;
use tier_gate::X_CACHE;
use tokio::task::JoinError;
use tower::BoxError;
use tower::Service;
use tracing::debug;
use tracing::warn;

use crate::error::GateError;

const NO_STORE: &str = "no-store";

/// Runs every request through rate limiting and the response cache before it
/// reaches the application handler `S`, then stores the response and enqueues
/// its follow-up jobs.
///
/// The rate-limit increment, the cache write and the cache invalidation run as
/// spawned tasks, so they complete even if the caller drops the request.
#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    gate: Arc<Gate>,
}

impl<S> AdmissionService<S> {
    pub fn new(inner: S, gate: Arc<Gate>) -> Self {
        Self { inner, gate }
    }

    pub fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }
}

fn internal(err: JoinError) -> GateError {
    GateError::Internal(err.to_string())
}

impl<S> Service<GateRequest> for AdmissionService<S>
where
    S: Service<GateRequest, Response = GateResponse, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = GateResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: GateRequest) -> Self::Future {
        // The clone is not guaranteed to be ready, so keep it and call the one
        // that was polled.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let gate = Arc::clone(&self.gate);

        Box::pin(async move { admit(gate, inner, req).await.map_err(AdmitError::into_box) })
    }
}

async fn admit<S>(gate: Arc<Gate>, mut inner: S, req: GateRequest) -> Result<GateResponse, AdmitError>
where
    S: Service<GateRequest, Response = GateResponse, Error = BoxError>,
    S::Future: Send + 'static,
{
    let metrics = gate.metrics();
    let start = metrics.start();

    let quota = gate.tiers().resolve(&req.principal).quota(&req.path);
    let principal = req.principal.id().clone();

    let limiter = Arc::clone(gate.limiter());
    let checked = quota.clone();
    let decision = tokio::spawn(async move { limiter.process(&principal, &checked).await })
        .await
        .map_err(internal)?;
    metrics.record_latency(start);

    match decision {
        ControlFlow::Break(Reason::QuotaExceeded { retry_after }) => {
            metrics.denied(&quota.tier);
            debug!(
                tier = %quota.tier,
                principal = %req.principal.id(),
                path = %req.path,
                ?retry_after,
                "request denied"
            );
            return Err(GateError::RateLimited {
                tier: quota.tier,
                retry_after,
            }
            .into());
        }
        ControlFlow::Break(Reason::StoreUnavailable) => {
            metrics.degraded("rate_limit");
            return Err(GateError::StoreUnavailable.into());
        }
        ControlFlow::Continue(Pass::Degraded) => {
            metrics.degraded("rate_limit");
            metrics.allowed(&quota.tier);
        }
        ControlFlow::Continue(Pass::Counted { .. }) => metrics.allowed(&quota.tier),
    }

    let cache = gate.cache();
    let fingerprint =
        (gate.cache_enabled() && req.method.is_cacheable()).then(|| Fingerprint::of(&req, gate.vary()));
    if let Some(fingerprint) = &fingerprint {
        match cache.get(fingerprint).await {
            Ok(Lookup::Hit(entry)) => {
                metrics.cache_hit();
                let max_age = cache.max_age(&entry);
                let mut response = entry.into_response(max_age);
                response.set_header(X_CACHE, "HIT");
                return Ok(response);
            }
            Ok(Lookup::Miss) => metrics.cache_miss(),
            Err(err) => match gate.fail_policy() {
                FailPolicy::Open => {
                    warn!(%fingerprint, error = %err, "cache read failed, treating as miss");
                    metrics.degraded("cache");
                    metrics.cache_miss();
                }
                FailPolicy::Closed => {
                    warn!(%fingerprint, error = %err, "cache read failed");
                    metrics.degraded("cache");
                    return Err(GateError::StoreUnavailable.into());
                }
            },
        }
    }

    let written_to = (gate.cache_enabled() && req.method.is_mutation()).then(|| req.clone());

    // Handler errors pass through untouched and are never retried.
    let mut response = inner.call(req).await.map_err(AdmitError::Handler)?;
    let follow_up = std::mem::take(&mut response.follow_up);

    let mut directive = NO_STORE.to_string();
    if let Some(fingerprint) = fingerprint {
        if response.is_success() {
            let writer = cache.clone();
            let stored = response.clone();
            let written = tokio::spawn(async move { writer.put(&fingerprint, &stored).await })
                .await
                .map_err(internal)?;
            match written {
                Ok(entry) => directive = format!("max-age={}", cache.max_age(&entry)),
                Err(err) => {
                    warn!(error = %err, "cache write failed");
                    metrics.degraded("cache");
                }
            }
        }
        response.set_header(X_CACHE, "MISS");
    }
    response.set_header(CACHE_CONTROL, directive);

    if let Some(target) = written_to
        && response.is_success()
    {
        let invalidator = cache.clone();
        let invalidated =
            tokio::spawn(async move { invalidator.invalidate_resource(&target).await })
            .await
            .map_err(internal)?;
        if let Err(err) = invalidated {
            warn!(error = %err, "cache invalidation failed");
            metrics.degraded("cache");
        }
    }

    for job in follow_up {
        match gate.queue().enqueue(job).await {
            Ok(id) => debug!(queue = %gate.queue().name(), %id, "follow-up enqueued"),
            Err(err) => warn!(queue = %gate.queue().name(), error = %err, "follow-up enqueue failed"),
        }
    }

    Ok(response)
}

/// Keeps handler errors apart from the gate's own, so the former can be
/// returned exactly as the handler produced them.
enum AdmitError {
    Gate(GateError),
    Handler(BoxError),
}

impl From<GateError> for AdmitError {
    fn from(err: GateError) -> Self {
        AdmitError::Gate(err)
    }
}

impl AdmitError {
    fn into_box(self) -> BoxError {
        match self {
            AdmitError::Gate(err) => Box::new(err),
            AdmitError::Handler(err) => err,
        }
    }
}
