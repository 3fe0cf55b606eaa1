//! `fleetsync-middleware` – the seams between the engine and the outside.
//!
//! # Modules
//!
//! - [`bus`] – topic-partitioned notification bus built on Tokio broadcast
//!   channels (`ready`, `socket_connected`, `cleanedUp`, context updates, ...).
//! - [`adapter`] – async traits for every consumed external service:
//!   telemetry subscriptions, the on-demand map request, the action-goal
//!   transport and the outward socket.
//! - [`ws_socket`] – [`WsOutwardSocket`], a WebSocket client implementation
//!   of the outward socket.
//! - [`sim`] – [`SimTransport`], an in-process stand-in for the middleware
//!   used by tests and the demo binary.

pub mod adapter;
pub mod bus;
pub mod sim;
pub mod ws_socket;

pub use adapter::{
    GoalHandle, GoalTransport, MapDataSource, MessageHandler, OutwardSocket, QosHint,
    SocketTarget, SubscriptionId, TelemetryTransport,
};
pub use bus::{EventBus, Topic, TopicReceiver};
pub use sim::{GoalScript, SimTransport};
pub use ws_socket::WsOutwardSocket;
