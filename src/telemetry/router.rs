//! Delivery of inbound frames to the subscriber they address.

use super::subscription::Registry;
use super::types::response::parse_message;

/// Route one inbound frame.
///
/// Frames that do not parse, carry no subscription id, or address an id with no
/// live subscriber are dropped. Returns whether a subscriber received the frame.
pub fn dispatch(registry: &Registry, payload: &str) -> bool {
    if payload.is_empty() {
        return false;
    }

    let mut message = match parse_message(payload.as_bytes()) {
        Ok(message) => message,
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(%payload, error = %e, "Failed to parse telemetry message");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            return false;
        }
    };

    let Some(cmd_id) = message.subscription_id.filter(|id| *id != 0) else {
        return false;
    };

    let Some(subscriber) = registry.resolve(cmd_id) else {
        #[cfg(feature = "tracing")]
        tracing::trace!(cmd_id, "Dropping message for unknown subscription");
        return false;
    };

    message.fill_missing_keys(subscriber.request().key_list());
    subscriber.deliver(message);
    true
}
