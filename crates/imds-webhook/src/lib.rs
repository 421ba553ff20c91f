//! Mutating admission webhook for IMDS sidecar injection.
//!
//! Watches pod creation and, for opted-in VM launcher pods, injects the IMDS
//! sidecar container, the projected service-account token volume, and an
//! idempotency marker annotation - all as a single RFC 6902 JSON patch.
//!
//! - [`mutate`] - the injection predicate and patch construction
//! - [`server`] - the admission HTTP endpoint

pub mod mutate;
pub mod server;

pub use mutate::{Mutator, MutatorConfig, WebhookError};
pub use server::{webhook_router, WebhookState};
