use std::sync::Arc;
use std::time::Duration;

use tier_gate::Gate;
use tier_gate::GateRequest;
use tier_gate::GateResponse;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::util::BoxCloneSyncService;

use crate::AdmissionService;
use crate::GateError;

/// The admission service with a hard deadline, load shedding and a unified
/// error type.
///
/// ### Error Responsibilities:
/// - **Admission (`GateError::RateLimited`, `GateError::StoreUnavailable`)**:
///   the tier's quota is used up, or the store is down and the gate fails closed.
/// - **LoadShedding (`GateError::Overloaded`)**: the handler is not ready to take
///   another request. This happens at the `poll_ready` stage and is near-instant.
/// - **Timeout (`GateError::Timeout`)**: admission plus handling took longer
///   than `max_wait`.
/// - **Handler (`GateError::Handler`)**: anything the handler itself returned.
///
/// Every error is a boxed [`GateError`], so callers can downcast to one type.
#[derive(Debug, Clone)]
pub struct ManagedAdmissionLayer {
    gate: Arc<Gate>,
    max_wait: Duration,
}

impl ManagedAdmissionLayer {
    pub fn new(gate: Arc<Gate>, max_wait: Duration) -> Self {
        Self { gate, max_wait }
    }
}

fn map_error(err: BoxError) -> BoxError {
    if err.is::<tower::timeout::error::Elapsed>() {
        BoxError::from(GateError::Timeout)
    } else if err.is::<tower::load_shed::error::Overloaded>() {
        BoxError::from(GateError::Overloaded)
    } else if err.is::<GateError>() {
        err
    } else {
        Box::from(GateError::Handler(err.to_string()))
    }
}

impl<S> Layer<S> for ManagedAdmissionLayer
where
    S: Service<GateRequest, Response = GateResponse, Error = BoxError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    type Service = BoxCloneSyncService<GateRequest, GateResponse, BoxError>;

    fn layer(&self, inner: S) -> Self::Service {
        let admission = AdmissionService::new(inner, self.gate.clone());

        // Timeout is outer to ensure a hard deadline on the entire process.
        let svc = tower::ServiceBuilder::new()
            .timeout(self.max_wait)
            .load_shed()
            .service(admission);

        BoxCloneSyncService::new(tower::util::MapErr::new(svc, map_error))
    }
}
