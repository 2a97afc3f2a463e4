//! Collaborator seams for the connection state machine.
//!
//! The state machine never touches a socket or a clock directly. It talks to a
//! [`Transport`] for bytes and to a [`Scheduler`] for its two single-shot timers,
//! so both can be swapped for in-memory fakes in tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

/// Lifecycle and data events reported by a [`Transport`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection handshake completed
    Opened,
    /// The connection failed; a [`TransportEvent::Closed`] is expected to follow
    Errored,
    /// The connection is gone, whether closed locally, remotely or after an error
    Closed,
    /// A text frame arrived
    Message(String),
}

/// Single consumer of [`TransportEvent`]s.
///
/// Cloning is cheap; every clone feeds the same consumer.
#[derive(Clone)]
pub struct EventSink {
    emit: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl EventSink {
    pub fn new<F>(emit: F) -> Self
    where
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.emit)(event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// Streaming connection owned exclusively by the connection state machine.
///
/// # Example
///
/// ```ignore
/// struct Loopback;
///
/// impl Transport for Loopback {
///     fn open(&mut self, _url: &Url, events: EventSink) {
///         events.emit(TransportEvent::Opened);
///     }
///
///     fn send(&mut self, _payload: String) -> crate::Result<()> {
///         Ok(())
///     }
///
///     fn close(&mut self) {}
/// }
/// ```
pub trait Transport: Send + 'static {
    /// Start connecting to `url`. The outcome, and everything after it, is reported
    /// through `events`. Opening again replaces the previous connection silently.
    fn open(&mut self, url: &Url, events: EventSink);

    /// Queue a text frame. Resolves once the frame is handed to the connection,
    /// not when the server acknowledges it.
    fn send(&mut self, payload: String) -> crate::Result<()>;

    /// Close the current connection. A [`TransportEvent::Closed`] follows.
    fn close(&mut self);
}

/// The two timers the state machine runs.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Timer {
    /// Next open attempt after a dropped connection
    Reconnect,
    /// Close of an open connection that has no subscribers left
    IdleClose,
}

/// Single-shot, cancellable timers.
///
/// Each timer has at most one pending firing: scheduling a pending timer replaces it.
/// A firing carries the `ticket` it was scheduled with so that the owner can ignore
/// firings that raced with a cancel.
pub trait Scheduler: Send + 'static {
    fn schedule_once(&mut self, timer: Timer, ticket: u64, delay: Duration);

    fn cancel(&mut self, timer: Timer);
}
