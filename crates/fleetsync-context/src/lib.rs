//! `fleetsync-context` – the canonical context.
//!
//! # Modules
//!
//! - [`store`] – [`ContextStore`][store::ContextStore]: the single shared,
//!   lock-guarded owner of every reconciled entity collection (robots,
//!   fleets, doors, lifts, zones, locations, navigation graphs).
//! - [`transform`] – [`StateTransformer`][transform::StateTransformer]: maps
//!   one decoded telemetry message to one atomic store mutation and notifies
//!   registered observers once per message.

pub mod store;
pub mod transform;

pub use store::{ContextState, ContextStore, MergeOutcome, RobotReport, SessionReport};
pub use transform::{ContextUpdate, ObserverId, StateTransformer, UpdateObserver};
