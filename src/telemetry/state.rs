//! Connection state machine.
//!
//! [`Connection`] owns everything about the single telemetry connection: the
//! transport, both timers, the subscriber registry and the pending command batch.
//! It is driven exclusively through [`Connection::handle`], one [`Input`] at a time,
//! which is what makes it safe to run as a single-owner task and easy to test
//! without a socket.
//!
//! ```text
//! Closed ──ensure_open──▶ Opening ──Opened──▶ Open ──idle timeout / logout──▶ Closed
//!                           ▲                  │
//!                           │               Closed (drop)
//!                     reconnect timer          ▼
//!                           └──────────── Reconnecting
//! ```

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::{Backoff as _, Constant};
use tokio::sync::{broadcast, mpsc, watch};

use super::batch::CommandBatch;
use super::endpoint::Endpoint;
use super::router;
use super::subscription::{Registry, Subscriber};
use super::types::request::Request;
use crate::Result;
use crate::auth::TokenProvider;
use crate::error::Error;
use crate::ws::config::Config;
use crate::ws::traits::{EventSink, Scheduler, Timer, Transport, TransportEvent};

/// Broadcast channel capacity for [`Event`]s.
const EVENT_CAPACITY: usize = 16;

/// Everything the state machine reacts to.
#[non_exhaustive]
#[derive(Debug)]
pub enum Input {
    Subscribe(Subscriber),
    Unsubscribe(Subscriber),
    /// Event from the transport, tagged with the connection attempt it belongs to
    Transport { epoch: u64, event: TransportEvent },
    TimerFired { timer: Timer, ticket: u64 },
    /// Completion of a token refresh started while opening
    CredentialRefreshed(Result<()>),
    /// Forget every subscriber and restart command ids; optionally close the connection
    Teardown { close_transport: bool },
}

/// Connection state as seen from outside.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ConnectionState {
    /// No connection and none scheduled
    Closed,
    /// Refreshing the token or waiting for the handshake
    Opening,
    Open,
    /// Connection dropped; waiting out the reconnect interval
    Reconnecting,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Notifications for the hosting application.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The token could not be refreshed while connecting. The connection stays
    /// closed until the host re-authenticates and subscribes again.
    Unauthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Socket {
    Closed,
    /// Waiting on the token provider; the transport has not been asked to open yet
    Refreshing,
    Connecting,
    Open,
}

pub struct Connection<T, S> {
    config: Config,
    endpoint: Endpoint,
    transport: T,
    scheduler: S,
    credentials: Arc<dyn TokenProvider>,
    /// Weak so that the task ends once every client handle is gone
    inputs: mpsc::WeakUnboundedSender<Input>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<Event>,

    socket: Socket,
    /// Current connection attempt; events from older attempts are ignored
    epoch: u64,
    /// Set by the first subscribe, cleared by close
    active: bool,
    /// Set between a drop and the next successful open
    reconnecting: bool,
    /// Subscribers displaced by a drop, replayed on the next open
    reconnect_subscribers: Vec<Subscriber>,
    registry: Registry,
    batch: CommandBatch,

    reconnect_backoff: Constant,
    reconnect_ticket: Option<u64>,
    idle_ticket: Option<u64>,
    last_ticket: u64,
}

impl<T, S> Connection<T, S>
where
    T: Transport,
    S: Scheduler,
{
    /// `inputs` is where transport events, timer firings and refresh completions are
    /// fed back; its receiving end must be drained into [`Connection::handle`].
    pub fn new(
        config: Config,
        endpoint: Endpoint,
        transport: T,
        scheduler: S,
        credentials: Arc<dyn TokenProvider>,
        inputs: mpsc::WeakUnboundedSender<Input>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let reconnect_backoff = Constant::from(&config);

        Self {
            config,
            endpoint,
            transport,
            scheduler,
            credentials,
            inputs,
            state_tx,
            events_tx,
            socket: Socket::Closed,
            epoch: 0,
            active: false,
            reconnecting: false,
            reconnect_subscribers: Vec::new(),
            registry: Registry::new(),
            batch: CommandBatch::default(),
            reconnect_backoff,
            reconnect_ticket: None,
            idle_ticket: None,
            last_ticket: 0,
        }
    }

    /// Process inputs until every sender is gone.
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = inputs.recv().await {
            self.handle(input);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Telemetry connection task finished");
        if matches!(self.socket, Socket::Connecting | Socket::Open) {
            self.transport.close();
        }
    }

    pub fn handle(&mut self, input: Input) {
        match input {
            Input::Subscribe(subscriber) => self.subscribe(subscriber),
            Input::Unsubscribe(subscriber) => self.unsubscribe(&subscriber),
            Input::Transport { epoch, event } if epoch == self.epoch => match event {
                TransportEvent::Opened => self.on_open(),
                TransportEvent::Errored => self.on_error(),
                TransportEvent::Closed => self.on_close(),
                TransportEvent::Message(payload) => self.on_message(&payload),
            },
            Input::Transport { epoch, event } => {
                #[cfg(feature = "tracing")]
                tracing::trace!(epoch, current = self.epoch, ?event, "Ignoring stale transport event");
                #[cfg(not(feature = "tracing"))]
                let _ = (epoch, event);
            }
            Input::TimerFired { timer, ticket } => self.on_timer(timer, ticket),
            Input::CredentialRefreshed(result) => self.on_refreshed(result),
            Input::Teardown { close_transport } => self.teardown(close_transport),
        }

        self.publish_state();
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match self.socket {
            Socket::Open => ConnectionState::Open,
            Socket::Refreshing | Socket::Connecting => ConnectionState::Opening,
            Socket::Closed if self.reconnect_ticket.is_some() => ConnectionState::Reconnecting,
            Socket::Closed => ConnectionState::Closed,
        }
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn event_sender(&self) -> broadcast::Sender<Event> {
        self.events_tx.clone()
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    #[cfg(test)]
    fn is_active(&self) -> bool {
        self.active
    }

    fn subscribe(&mut self, subscriber: Subscriber) {
        self.active = true;
        let cmd_id = self.registry.register(subscriber.clone());
        subscriber.assign(cmd_id);

        match subscriber.request() {
            Request::Subscription { kind, command } => {
                self.batch
                    .enqueue_subscription(*kind, command.subscribing(cmd_id));
            }
            Request::History(command) => self.batch.enqueue_history(command.stamped(cmd_id)),
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(cmd_id, keys = subscriber.request().keys(), "Subscribed");

        self.publish_commands();
    }

    fn unsubscribe(&mut self, subscriber: &Subscriber) {
        if !self.active {
            return;
        }

        // Unsubscribing while a reconnect is pending must not bring it back
        self.reconnect_subscribers
            .retain(|pending| !pending.same_as(subscriber));

        if let Some(cmd_id) = subscriber.cmd_id()
            && self
                .registry
                .resolve(cmd_id)
                .is_some_and(|registered| registered.same_as(subscriber))
        {
            self.registry.unregister(cmd_id);
            // History queries are one-shot; the server has nothing to stop
            if let Request::Subscription { kind, command } = subscriber.request() {
                self.batch
                    .enqueue_subscription(*kind, command.unsubscribing(cmd_id));
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(cmd_id, remaining = self.registry.len(), "Unsubscribed");
        }

        self.publish_commands();
    }

    fn publish_commands(&mut self) {
        self.flush();
        self.ensure_open();
        self.check_to_close();
    }

    /// Send the pending batch if the connection is open; otherwise keep it queued.
    fn flush(&mut self) {
        if self.socket != Socket::Open {
            return;
        }
        let Some(batch) = self.batch.take_if_non_empty() else {
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            ts = batch.ts_sub_cmds.len(),
            history = batch.history_cmds.len(),
            attr = batch.attr_sub_cmds.len(),
            "Sending command batch"
        );

        let sent = serde_json::to_string(&batch)
            .map_err(Error::from)
            .and_then(|json| self.transport.send(json));
        if let Err(e) = sent {
            #[cfg(feature = "tracing")]
            tracing::warn!(%e, "Failed to send command batch, keeping it queued");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            self.batch.requeue(batch);
        }
    }

    fn ensure_open(&mut self) {
        if !self.active {
            return;
        }

        if self.socket == Socket::Closed {
            if self.credentials.is_valid() {
                self.open_socket();
            } else {
                // Leftover events from the previous attempt must not interrupt the refresh
                self.epoch += 1;
                self.socket = Socket::Refreshing;
                self.refresh_credentials();
            }
        }

        // Any activity means the connection is wanted again
        self.cancel(Timer::IdleClose);
    }

    fn open_socket(&mut self) {
        let token = self.credentials.current_token();
        match self.endpoint.telemetry_url(&token) {
            Ok(url) => {
                self.epoch += 1;
                self.socket = Socket::Connecting;

                #[cfg(feature = "tracing")]
                tracing::debug!(host = %self.endpoint.host, epoch = self.epoch, "Opening telemetry connection");

                let events = self.event_sink();
                self.transport.open(&url, events);
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%e, "Unable to build telemetry URL");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                self.socket = Socket::Closed;
            }
        }
    }

    fn event_sink(&self) -> EventSink {
        let inputs = self.inputs.clone();
        let epoch = self.epoch;
        EventSink::new(move |event| {
            if let Some(tx) = inputs.upgrade() {
                _ = tx.send(Input::Transport { epoch, event });
            }
        })
    }

    fn refresh_credentials(&self) {
        let credentials = Arc::clone(&self.credentials);
        let inputs = self.inputs.clone();

        #[cfg(feature = "tracing")]
        tracing::debug!("Token is not valid, refreshing before connecting");

        tokio::spawn(async move {
            let result = credentials.refresh().await;
            if let Some(tx) = inputs.upgrade() {
                _ = tx.send(Input::CredentialRefreshed(result));
            }
        });
    }

    fn on_refreshed(&mut self, result: Result<()>) {
        if self.socket != Socket::Refreshing {
            return;
        }

        match result {
            Ok(()) if self.active => self.open_socket(),
            Ok(()) => self.socket = Socket::Closed,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%e, "Token refresh failed, giving up on the connection");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                self.socket = Socket::Closed;
                _ = self.events_tx.send(Event::Unauthenticated);
            }
        }
    }

    fn on_open(&mut self) {
        self.socket = Socket::Open;
        self.cancel(Timer::Reconnect);

        if !self.active {
            // Closed while the handshake was in flight
            self.transport.close();
            return;
        }

        if self.reconnecting {
            self.reconnecting = false;
            let subscribers = std::mem::take(&mut self.reconnect_subscribers);

            #[cfg(feature = "tracing")]
            tracing::debug!(count = subscribers.len(), "Reconnected, re-subscribing");

            for subscriber in subscribers {
                subscriber.notify_reconnected();
                self.subscribe(subscriber);
            }
        }

        // Commands queued while reconnecting go out even when nothing was replayed
        self.publish_commands();
        self.check_to_close();
    }

    fn on_error(&mut self) {
        if self.socket == Socket::Connecting {
            self.socket = Socket::Closed;
        }
    }

    fn on_close(&mut self) {
        self.socket = Socket::Closed;
        if !self.active {
            return;
        }

        if !self.reconnecting {
            // Ids handed out on the dead connection mean nothing to the next one
            self.reconnect_subscribers = self.registry.drain();
            self.batch.clear();
            self.cancel(Timer::IdleClose);
            self.reconnecting = true;
        }

        let delay = self
            .reconnect_backoff
            .next_backoff()
            .unwrap_or(self.config.reconnect_interval);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            ?delay,
            pending = self.reconnect_subscribers.len(),
            "Telemetry connection lost, scheduling reconnect"
        );

        self.schedule(Timer::Reconnect, delay);
    }

    fn on_message(&mut self, payload: &str) {
        router::dispatch(&self.registry, payload);
        self.check_to_close();
    }

    fn check_to_close(&mut self) {
        if self.registry.is_empty() && self.socket == Socket::Open && self.idle_ticket.is_none() {
            #[cfg(feature = "tracing")]
            tracing::debug!(timeout = ?self.config.idle_timeout, "No subscribers left, scheduling close");
            self.schedule(Timer::IdleClose, self.config.idle_timeout);
        }
    }

    fn on_timer(&mut self, timer: Timer, ticket: u64) {
        let slot = self.ticket_slot(timer);
        if *slot != Some(ticket) {
            return;
        }
        *slot = None;

        match timer {
            Timer::Reconnect => self.ensure_open(),
            Timer::IdleClose => self.close(),
        }
    }

    fn close(&mut self) {
        self.active = false;
        self.cancel(Timer::IdleClose);
        if matches!(self.socket, Socket::Connecting | Socket::Open) {
            #[cfg(feature = "tracing")]
            tracing::debug!("Closing telemetry connection");
            self.transport.close();
        }
    }

    fn teardown(&mut self, close_transport: bool) {
        self.cancel(Timer::IdleClose);
        self.cancel(Timer::Reconnect);

        let keep_open = !close_transport && self.socket == Socket::Open;
        if keep_open {
            // Ids restart from 1 on this same connection, so the server must stop
            // feeding the old ones first
            for (cmd_id, subscriber) in self.registry.iter() {
                if let Request::Subscription { kind, command } = subscriber.request() {
                    self.batch
                        .enqueue_subscription(*kind, command.unsubscribing(cmd_id));
                }
            }
        } else {
            self.batch.clear();
        }

        self.registry.reset();
        self.reconnect_subscribers.clear();
        self.reconnecting = false;

        if close_transport {
            self.close();
        } else if keep_open {
            self.flush();
            self.check_to_close();
        }
    }

    fn schedule(&mut self, timer: Timer, delay: Duration) {
        self.last_ticket += 1;
        let ticket = self.last_ticket;
        *self.ticket_slot(timer) = Some(ticket);
        self.scheduler.schedule_once(timer, ticket, delay);
    }

    fn cancel(&mut self, timer: Timer) {
        if self.ticket_slot(timer).take().is_some() {
            self.scheduler.cancel(timer);
        }
    }

    fn ticket_slot(&mut self, timer: Timer) -> &mut Option<u64> {
        match timer {
            Timer::Reconnect => &mut self.reconnect_ticket,
            Timer::IdleClose => &mut self.idle_ticket,
        }
    }

    fn publish_state(&self) {
        let next = self.state();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
