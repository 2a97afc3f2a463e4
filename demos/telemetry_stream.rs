//! Live telemetry for one device.
//!
//! This example:
//! 1. Subscribes to the latest time-series values of a device
//! 2. Subscribes to its server-side `active` attribute
//! 3. Requests one hour of history for the same keys
//! 4. Prints connection state changes until interrupted
//!
//! Run with tracing enabled:
//! ```sh
//! TELEMETRY_ORIGIN=https://demo.example.com TELEMETRY_TOKEN=<jwt> DEVICE_ID=<uuid> \
//!     RUST_LOG=info,telemetry_client_sdk=debug \
//!     cargo run --example telemetry_stream --features ws,tracing
//! ```

use std::env;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt as _;
use serde_json::json;
use telemetry_client_sdk::auth::StaticToken;
use telemetry_client_sdk::telemetry::{
    Client, Endpoint, Event, HistoryCommand, Request, Subscriber, SubscriptionCommand,
};
use telemetry_client_sdk::ws::config::Config;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const KEYS: &str = "temperature,humidity";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let origin = env::var("TELEMETRY_ORIGIN").unwrap_or_else(|_| "http://localhost:8080".to_owned());
    let token = env::var("TELEMETRY_TOKEN")?;
    let device_id = env::var("DEVICE_ID")?;

    let client = Client::connect(
        Endpoint::from_origin(&origin)?,
        Arc::new(StaticToken::new(token)),
        Config::default(),
    )?;

    let latest = SubscriptionCommand::new(KEYS)
        .with_param("entityType", json!("DEVICE"))
        .with_param("entityId", json!(device_id));
    let (_latest, updates) = client.subscribe_stream(Request::time_series(latest))?;
    let mut updates = Box::pin(updates);

    let active = Subscriber::attributes(
        SubscriptionCommand::new("active")
            .with_param("entityType", json!("DEVICE"))
            .with_param("entityId", json!(device_id))
            .with_param("scope", json!("SERVER_SCOPE")),
        |update| info!(stream = "attributes", data = ?update.data),
    )
    .with_reconnected(|| info!(stream = "attributes", "Re-subscribing after reconnect"));
    client.subscribe(&active)?;

    let now = i64::try_from(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis())?;
    let hour = i64::try_from(Duration::from_secs(3_600).as_millis())?;
    let history = Subscriber::history(
        HistoryCommand::new(KEYS)
            .with_param("entityType", json!("DEVICE"))
            .with_param("entityId", json!(device_id))
            .with_param("startTs", json!(now - hour))
            .with_param("endTs", json!(now))
            .with_param("limit", json!(100)),
        |update| {
            for (key, values) in &update.data {
                let count = values.as_array().map_or(0, Vec::len);
                info!(stream = "history", key, count);
            }
        },
    );
    client.subscribe(&history)?;

    let mut state = client.state_receiver();
    let mut events = client.events();

    loop {
        tokio::select! {
            Some(update) = updates.next() => {
                info!(stream = "timeseries", data = ?update.data);
            }
            Ok(()) = state.changed() => {
                let current = *state.borrow_and_update();
                info!(state = %current, "Connection state changed");
            }
            Ok(event) = events.recv() => {
                if event == Event::Unauthenticated {
                    warn!("Token rejected, stopping");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.unsubscribe(&active)?;
    client.logout()?;
    Ok(())
}
