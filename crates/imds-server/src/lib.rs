//! Per-VM instance metadata service.
//!
//! A small, stateless HTTP service bound to the link-local metadata address
//! inside a VM launcher pod. Guests fetch their projected workload-identity
//! token, identity metadata, and cloud-init NoCloud / OpenStack bootstrap
//! data with nothing more than an HTTP client.
//!
//! # Modules
//!
//! - [`config`] - identity record and server configuration
//! - [`server`] - router, middleware chain, and the hardened HTTP server
//! - [`handlers`] - endpoint handlers and response types
//! - [`jwt`] - best-effort expiry extraction from the projected token
//! - [`rate_limit`] - process-wide token bucket

pub mod config;
pub mod handlers;
pub mod jwt;
pub mod rate_limit;
pub mod server;

pub use config::{ImdsConfig, VmIdentity};
pub use server::{imds_router, ImdsServer, ImdsState};
