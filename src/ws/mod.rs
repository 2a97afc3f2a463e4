//! Core WebSocket infrastructure.
//!
//! This module holds the pieces the telemetry connection state machine is built
//! on, kept behind traits so the state machine can run without a live socket.
//!
//! # Architecture
//!
//! - [`Transport`]: A streaming connection that reports [`TransportEvent`]s
//! - [`Scheduler`]: Single-shot cancellable [`Timer`]s, backed by [`TokioScheduler`]
//! - `WsTransport` (feature `ws`): [`Transport`] over `tokio-tungstenite`
//!
//! # Example
//!
//! ```ignore
//! let transport = WsTransport::new();
//! let scheduler = TokioScheduler::new(|timer, ticket| { /* feed the state machine */ });
//! ```

pub mod config;
#[cfg(feature = "ws")]
pub mod connection;
pub mod error;
pub mod timer;
pub mod traits;

#[cfg(feature = "ws")]
pub use connection::WsTransport;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use timer::TokioScheduler;
pub use traits::*;
