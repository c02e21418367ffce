use std::sync::Arc;

use tier_gate::Gate;
use tower::Layer;

use crate::service::AdmissionService;

/// Applies tier-aware admission to requests.
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    gate: Arc<Gate>,
}

impl AdmissionLayer {
    /// Create an AdmissionLayer
    pub fn new(gate: Arc<Gate>) -> Self {
        AdmissionLayer { gate }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService::new(service, self.gate.clone())
    }
}
