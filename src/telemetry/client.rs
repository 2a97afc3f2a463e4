use std::sync::Arc;

use futures::Stream;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};

use super::endpoint::Endpoint;
use super::state::{Connection, ConnectionState, Event, Input};
use super::subscription::Subscriber;
use super::types::request::Request;
use super::types::response::TelemetryMessage;
use crate::Result;
use crate::auth::TokenProvider;
use crate::error::{Error, Kind};
use crate::ws::config::Config;
use crate::ws::error::WsError;
#[cfg(feature = "ws")]
use crate::ws::connection::WsTransport;
use crate::ws::timer::TokioScheduler;
use crate::ws::traits::Transport;

/// Telemetry client multiplexing any number of subscriptions over one WebSocket.
///
/// The connection opens on the first subscribe, reconnects and re-subscribes
/// everyone after a drop, and closes once it has had no subscribers for
/// [`Config::idle_timeout`]. All of that happens on a background task; the methods
/// here only enqueue work for it and never block.
///
/// Cloning is cheap and every clone talks to the same connection. The background task
/// ends when the last clone is dropped.
///
/// # Example
///
/// ```rust, ignore
/// use std::sync::Arc;
///
/// use futures::StreamExt as _;
/// use telemetry_client_sdk::auth::StaticToken;
/// use telemetry_client_sdk::telemetry::{Client, Endpoint, Request, SubscriptionCommand};
/// use telemetry_client_sdk::ws::config::Config;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let endpoint = Endpoint::from_origin("https://demo.example.com")?;
///     let client = Client::connect(endpoint, Arc::new(StaticToken::new("jwt")), Config::default())?;
///
///     let command = SubscriptionCommand::new("temperature,humidity");
///     let (subscriber, stream) = client.subscribe_stream(Request::time_series(command))?;
///     let mut stream = Box::pin(stream);
///
///     while let Some(update) = stream.next().await {
///         println!("{:?}", update.data);
///     }
///
///     client.unsubscribe(&subscriber)?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Only strong handle to the connection task's inbox
    inputs: mpsc::UnboundedSender<Input>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<Event>,
    endpoint: Endpoint,
}

impl Client {
    /// Create a client over a custom [`Transport`].
    ///
    /// Nothing is opened until the first subscribe. Must be called from within a
    /// Tokio runtime, which hosts the connection task and its timers.
    pub fn new<T: Transport>(
        endpoint: Endpoint,
        transport: T,
        credentials: Arc<dyn TokenProvider>,
        config: Config,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::with_source(Kind::Internal, e))?;

        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let timer_inputs = inputs_tx.downgrade();
        let scheduler = TokioScheduler::new(move |timer, ticket| {
            if let Some(tx) = timer_inputs.upgrade() {
                _ = tx.send(Input::TimerFired { timer, ticket });
            }
        });

        let connection = Connection::new(
            config,
            endpoint.clone(),
            transport,
            scheduler,
            credentials,
            inputs_tx.downgrade(),
        );
        let state_rx = connection.state_receiver();
        let events_tx = connection.event_sender();

        runtime.spawn(connection.run(inputs_rx));

        Ok(Self {
            inner: Arc::new(ClientInner {
                inputs: inputs_tx,
                state_rx,
                events_tx,
                endpoint,
            }),
        })
    }

    /// Create a client that talks to `endpoint` over a real WebSocket.
    ///
    /// **Feature flag:** `ws`
    #[cfg(feature = "ws")]
    pub fn connect(
        endpoint: Endpoint,
        credentials: Arc<dyn TokenProvider>,
        config: Config,
    ) -> Result<Self> {
        Self::new(endpoint, WsTransport::new(), credentials, config)
    }

    /// Register `subscriber` under a fresh command id and request its data.
    ///
    /// The command is sent right away if the connection is open, otherwise it is
    /// queued and the connection is opened. Subscribing the same subscriber twice
    /// registers it twice.
    pub fn subscribe(&self, subscriber: &Subscriber) -> Result<()> {
        self.send(Input::Subscribe(subscriber.clone()))
    }

    /// Subscribe with a subscriber that delivers its updates as a stream.
    ///
    /// The returned [`Subscriber`] is the handle to pass to [`Client::unsubscribe`].
    pub fn subscribe_stream(
        &self,
        request: Request,
    ) -> Result<(Subscriber, impl Stream<Item = TelemetryMessage>)> {
        let (subscriber, stream) = Subscriber::channel(request);
        self.subscribe(&subscriber)?;
        Ok((subscriber, stream))
    }

    /// Stop delivering to `subscriber` and tell the server to stop the feed.
    ///
    /// Ignored when the connection is not in use, or when `subscriber` is not
    /// currently registered.
    pub fn unsubscribe(&self, subscriber: &Subscriber) -> Result<()> {
        self.send(Input::Unsubscribe(subscriber.clone()))
    }

    /// Drop every subscriber and close the connection, e.g. when the user logs out.
    /// Command ids start again from 1.
    pub fn logout(&self) -> Result<()> {
        self.send(Input::Teardown {
            close_transport: true,
        })
    }

    /// Drop every subscriber but leave the connection as it is, e.g. when navigating
    /// away from a page whose widgets all subscribed. Command ids start again from 1.
    pub fn reset(&self) -> Result<()> {
        self.send(Input::Teardown {
            close_transport: false,
        })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Receive [`Event`]s, such as a failed token refresh.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.events_tx.subscribe()
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    fn send(&self, input: Input) -> Result<()> {
        self.inner
            .inputs
            .send(input)
            .map_err(|_e| Error::with_source(Kind::WebSocket, WsError::ConnectionClosed))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
