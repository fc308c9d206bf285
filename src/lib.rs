//! Core services layer for a multi-tenant LLM gateway.
//!
//! This crate implements the hardest runtime subsystems of the gateway:
//! model routing and fallback, a durable async task engine, a
//! long-running video generation orchestrator, a two-tier regioned
//! cache, a provider error tracker with credential circuit breaking, a
//! distributed lock service, a realtime audio session store, an
//! S3-compatible media store, and the webhook delivery pipeline.
//!
//! The HTTP API surface, the database ORM, authentication middleware,
//! and the concrete provider SDKs are deliberately out of scope here:
//! providers are modeled as opaque clients behind narrow capability
//! traits (see [`providers`]), and every durable store is reached
//! through a trait so a Postgres- or Redis-backed implementation can be
//! swapped for an in-memory one in tests.

pub mod config;
pub mod events;
pub mod models;
pub mod providers;

pub mod cache;
pub mod lock;
pub mod media;
pub mod monitoring;
pub mod provider_errors;
pub mod realtime;
pub mod router;
pub mod tasks;
pub mod tracing_svc;
pub mod video;
pub mod webhook;

use thiserror::Error;

/// Crate-wide error type.
///
/// Component modules define their own narrower `thiserror` enums
/// (`media::MediaStoreError`, `lock::LockError`, `tasks::TaskError`, ...)
/// so each call site can match on the failures relevant to it; those
/// convert into `GatewayError` at the boundary where a caller needs one
/// uniform type to propagate up a call stack that crosses components.
/// The variant set mirrors the error kinds in spec.md §7 rather than
/// wrapping implementation-specific types.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed request: empty prompt, invalid duration, unknown model.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing, disabled, or over-quota tenant credential.
    #[error("auth error: {0}")]
    Auth(String),

    /// Model does not support the requested operation.
    #[error("capability error: {0}")]
    Capability(String),

    /// Network, timeout, rate-limit, 5xx — retried with backoff.
    #[error("provider transient error: {0}")]
    ProviderTransient(String),

    /// Invalid credential, quota, suspension — not retried.
    #[error("provider fatal error: {0}")]
    ProviderFatal(String),

    /// Backend 4xx/5xx from a media, cache, or durable store.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Lock acquisition timeout or a fencing mismatch.
    #[error("concurrency error: {0}")]
    Concurrency(String),

    /// A cancellation token was observed; distinct from failure.
    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigLoadError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GatewayError>;

pub use config::GatewayConfig;
pub use events::{GatewayEvent, GatewayEvents};
