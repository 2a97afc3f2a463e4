#![expect(
    clippy::module_name_repetitions,
    reason = "Re-exported names intentionally match their modules for API clarity"
)]

//! Telemetry subscriptions over a single shared WebSocket.
//!
//! Every widget or task that wants live data creates a [`Subscriber`] and hands it
//! to the [`Client`]. The client assigns each one a command id, batches the
//! subscribe and unsubscribe commands into one frame per flush, and routes each
//! inbound update to the subscriber whose id it carries.
//!
//! # Lifecycle
//!
//! - The connection opens lazily on the first subscribe, refreshing the access token
//!   first if it has expired
//! - When the connection drops, every subscriber is re-subscribed under a new id
//!   once it is back, after a fixed [`reconnect_interval`](crate::ws::config::Config::reconnect_interval)
//! - When the last subscriber leaves, the connection is closed after
//!   [`idle_timeout`](crate::ws::config::Config::idle_timeout) unless someone
//!   subscribes in the meantime
//!
//! # Example
//!
//! ```rust, ignore
//! use std::sync::Arc;
//!
//! use telemetry_client_sdk::auth::StaticToken;
//! use telemetry_client_sdk::telemetry::{Client, Endpoint, Subscriber, SubscriptionCommand};
//! use telemetry_client_sdk::ws::config::Config;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let endpoint = Endpoint::new("localhost", Some(8080), false);
//!     let client = Client::connect(endpoint, Arc::new(StaticToken::new("jwt")), Config::default())?;
//!
//!     let command = SubscriptionCommand::new("temperature")
//!         .with_param("entityType", json!("DEVICE"))
//!         .with_param("entityId", json!("784f394c-42b6-435a-983c-b7beff2784f9"));
//!     let subscriber = Subscriber::time_series(command, |update| {
//!         println!("temperature: {:?}", update.data["temperature"]);
//!     });
//!
//!     client.subscribe(&subscriber)?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod client;
pub mod endpoint;
pub mod router;
pub mod state;
pub mod subscription;
pub mod types;

pub use client::Client;
pub use endpoint::Endpoint;
pub use state::{ConnectionState, Event};
pub use subscription::Subscriber;
pub use types::request::{CmdId, DataKeyType, HistoryCommand, Request, SubscriptionCommand};
pub use types::response::TelemetryMessage;
