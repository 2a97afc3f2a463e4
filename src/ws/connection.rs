#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::error::WsError;
use super::traits::{EventSink, Transport, TransportEvent};
use crate::Result;
use crate::error::{Error, Kind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Transport`] over `tokio-tungstenite`.
///
/// Each [`Transport::open`] spawns one task that connects, pumps frames in both
/// directions and reports what happens through the [`EventSink`]. The task ends
/// when either side closes the connection; reconnecting is the caller's decision.
#[derive(Default)]
pub struct WsTransport {
    live: Option<LiveConnection>,
}

struct LiveConnection {
    /// Outgoing text frames
    sender_tx: mpsc::UnboundedSender<String>,
    /// Requests a graceful close
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl WsTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn connection_task(
        endpoint: Url,
        mut sender_rx: mpsc::UnboundedReceiver<String>,
        shutdown: CancellationToken,
        events: EventSink,
    ) {
        let connected = tokio::select! {
            result = connect_async(endpoint.as_str()) => result,
            () = shutdown.cancelled() => {
                events.emit(TransportEvent::Closed);
                return;
            }
        };

        match connected {
            Ok((ws_stream, _)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(host = ?endpoint.host_str(), "Telemetry WebSocket connected");
                events.emit(TransportEvent::Opened);

                if let Err(e) =
                    Self::handle_connection(ws_stream, &mut sender_rx, &shutdown, &events).await
                {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Telemetry WebSocket dropped: {e:?}");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
            Err(e) => {
                let error = Error::with_source(Kind::WebSocket, WsError::Connection(e));
                #[cfg(feature = "tracing")]
                tracing::warn!("Unable to connect: {error:?}");
                #[cfg(not(feature = "tracing"))]
                let _ = &error;
                events.emit(TransportEvent::Errored);
            }
        }

        events.emit(TransportEvent::Closed);
    }

    /// Handle an active WebSocket connection until it closes.
    async fn handle_connection(
        ws_stream: WsStream,
        sender_rx: &mut mpsc::UnboundedReceiver<String>,
        shutdown: &CancellationToken,
        events: &EventSink,
    ) -> Result<()> {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(%text, "Received WebSocket text message");
                            events.emit(TransportEvent::Message(text.to_string()));
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(Error::with_source(
                                Kind::WebSocket,
                                WsError::ConnectionClosed,
                            ));
                        }
                        Some(Err(e)) => {
                            events.emit(TransportEvent::Errored);
                            return Err(Error::with_source(
                                Kind::WebSocket,
                                WsError::Connection(e),
                            ));
                        }
                        Some(Ok(_)) => {
                            // Binary frames are not part of the protocol; pings are answered by tungstenite.
                        }
                    }
                }

                Some(text) = sender_rx.recv() => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(%text, "Sending WebSocket text message");
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }

                () = shutdown.cancelled() => {
                    _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        Ok(())
    }
}

impl Transport for WsTransport {
    fn open(&mut self, url: &Url, events: EventSink) {
        if let Some(previous) = self.live.take() {
            previous.task.abort();
        }

        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Self::connection_task(
            url.clone(),
            sender_rx,
            shutdown.clone(),
            events,
        ));

        self.live = Some(LiveConnection {
            sender_tx,
            shutdown,
            task,
        });
    }

    fn send(&mut self, payload: String) -> Result<()> {
        let live = self.live.as_ref().ok_or(WsError::ConnectionClosed)?;
        live.sender_tx
            .send(payload)
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(live) = &self.live {
            live.shutdown.cancel();
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.task.abort();
        }
    }
}
