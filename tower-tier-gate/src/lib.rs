//! # Tower Tier Gate
//!
//! `tower-tier-gate` puts the [`tier_gate`] admission core in front of an
//! application handler as [Tower](https://github.com/tower-rs/tower) middleware.
//!
//! Every request passes through, in order:
//!
//! 1. **Tier resolution**: the principal's tier, or the default tier.
//! 2. **Rate limiting**: a denied request ends here with
//!    [`GateError::RateLimited`].
//! 3. **Response cache**: a fresh entry is returned with `x-cache: HIT` and a
//!    `cache-control: max-age` no larger than its remaining lifetime.
//! 4. **The handler**: its successful `GET`/`HEAD` responses are cached, and its
//!    successful writes invalidate every cached variant of the same resource.
//! 5. **Follow-up jobs**: anything in [`tier_gate::GateResponse::follow_up`] is
//!    enqueued on the gate's task queue.
//!
//! ## The Managed Stack
//!
//! [`ManagedAdmissionLayer`] wraps the admission service in a timeout and a load
//! shedder and maps every failure into a cloneable [`GateError`].
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`GateError`], allowing automatic conversion
//!   to HTTP status codes (429, 503, 408, 500).
//! - `cli`: Builds the `gate-load` binary, which drives an in-memory gate
//!   under concurrent load and prints latency percentiles.

mod error;
mod layer;
mod managed_layer;
mod service;


pub use error::GateError;
pub use layer::AdmissionLayer;
pub use managed_layer::ManagedAdmissionLayer;
pub use service::AdmissionService;
