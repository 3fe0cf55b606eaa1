//! `fleetsync-runtime` – the sync and dispatch engine.
//!
//! Telemetry from the fleet bus flows through per-category throttling into
//! the shared context; goals flow the other way, resolved against that
//! context and correlated with their feedback and result.
//!
//! # Modules
//!
//! - [`throttle`] – [`ThrottlePolicy`]: per-category minimum processing
//!   interval.
//! - [`ingestion`] – [`IngestionManager`]: subscriptions, latest-wins
//!   coalescing of bursts, trailing-edge flush and per-category statistics.
//! - [`dedup`] – [`RequestCache`]: TTL cache that collapses concurrent
//!   fetches of the same key into one.
//! - [`dispatch`] – [`GoalDispatcher`]: robot resolution, goal submission
//!   and feedback/result correlation.
//! - [`lifecycle`] – [`Orchestrator`]: ordered initialization with rollback,
//!   isolated cleanup steps and soft cleanup for redeploys.
//! - [`config`] – [`EngineConfig`] with camelCase keys.
//! - [`telemetry`] – [`init_tracing`]: `tracing` subscriber with optional
//!   OTLP export (`OTEL_EXPORTER_OTLP_ENDPOINT`).

pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod ingestion;
pub mod lifecycle;
pub mod telemetry;
pub mod throttle;

pub use config::{EngineConfig, default_throttle_ms};
pub use dedup::RequestCache;
pub use dispatch::{CallerContext, GoalDispatcher};
pub use ingestion::{IngestionManager, MessageStats};
pub use lifecycle::{
    CleanupReport, CleanupStep, EngineServices, InitOutcome, InitStep, LifecycleState,
    MapCacheStats, Orchestrator,
};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use throttle::ThrottlePolicy;
