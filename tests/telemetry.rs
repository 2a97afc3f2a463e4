#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use serde_json::{Value, json};
use telemetry_client_sdk::Result;
use telemetry_client_sdk::auth::{SecretString, StaticToken, TokenProvider};
use telemetry_client_sdk::error::Error;
use telemetry_client_sdk::telemetry::{
    Client, ConnectionState, Endpoint, Event, HistoryCommand, Request, Subscriber,
    SubscriptionCommand, TelemetryMessage,
};
use telemetry_client_sdk::ws::config::Config;
use telemetry_client_sdk::ws::{EventSink, Transport, TransportEvent};
use tokio::time::advance;
use url::Url;

#[derive(Default)]
struct Log {
    opened: Vec<Url>,
    sent: Vec<Value>,
    closed: usize,
    sink: Option<EventSink>,
}

/// Transport that records what the client asks of it. Tests play the server side
/// by emitting events through the sink captured on open.
#[derive(Clone, Default)]
struct RecordingTransport {
    log: Arc<Mutex<Log>>,
}

impl RecordingTransport {
    fn emit(&self, event: TransportEvent) {
        let sink = self.log.lock().unwrap().sink.clone().unwrap();
        sink.emit(event);
    }

    fn message(&self, payload: &Value) {
        self.emit(TransportEvent::Message(payload.to_string()));
    }

    fn opened(&self) -> usize {
        self.log.lock().unwrap().opened.len()
    }

    fn last_url(&self) -> Url {
        self.log.lock().unwrap().opened.last().cloned().unwrap()
    }

    fn sent(&self) -> Vec<Value> {
        self.log.lock().unwrap().sent.clone()
    }

    fn closed(&self) -> usize {
        self.log.lock().unwrap().closed
    }
}

impl Transport for RecordingTransport {
    fn open(&mut self, url: &Url, events: EventSink) {
        let mut log = self.log.lock().unwrap();
        log.opened.push(url.clone());
        log.sink = Some(events);
    }

    fn send(&mut self, payload: String) -> Result<()> {
        let value = serde_json::from_str(&payload)?;
        self.log.lock().unwrap().sent.push(value);
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closed += 1;
    }
}

/// Let the connection task drain its inbox.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn client_with(credentials: Arc<dyn TokenProvider>) -> (Client, RecordingTransport) {
    let transport = RecordingTransport::default();
    let client = Client::new(
        Endpoint::new("demo.example.com", None, true),
        transport.clone(),
        credentials,
        Config::default(),
    )
    .unwrap();
    (client, transport)
}

fn client() -> (Client, RecordingTransport) {
    client_with(Arc::new(StaticToken::new("jwt")))
}

fn recording(request: Request) -> (Subscriber, Arc<Mutex<Vec<TelemetryMessage>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let subscriber = Subscriber::new(request, move |message| {
        sink.lock().unwrap().push(message);
    });
    (subscriber, received)
}

fn time_series(keys: &str) -> Subscriber {
    Subscriber::time_series(SubscriptionCommand::new(keys), |_| {})
}

#[tokio::test(start_paused = true)]
async fn subscribe_reconnect_unsubscribe_idle_close() {
    let (client, transport) = client();
    let reconnected = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reconnected);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let subscriber = Subscriber::time_series(SubscriptionCommand::new("a,b"), move |message| {
        sink.lock().unwrap().push(message);
    })
    .with_reconnected(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    client.subscribe(&subscriber).unwrap();
    settle().await;
    assert_eq!(transport.opened(), 1);
    assert_eq!(
        transport.last_url().as_str(),
        "wss://demo.example.com:443/api/ws/plugins/telemetry?token=jwt"
    );
    assert_eq!(client.state(), ConnectionState::Opening);

    transport.emit(TransportEvent::Opened);
    settle().await;
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(
        transport.sent(),
        vec![json!({
            "tsSubCmds": [{ "cmdId": 1, "keys": "a,b" }],
            "historyCmds": [],
            "attrSubCmds": []
        })]
    );

    transport.emit(TransportEvent::Closed);
    settle().await;
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    advance(Duration::from_millis(1_999)).await;
    settle().await;
    assert_eq!(transport.opened(), 1);

    advance(Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(transport.opened(), 2);

    transport.emit(TransportEvent::Opened);
    settle().await;
    assert_eq!(reconnected.load(Ordering::SeqCst), 1);
    assert_eq!(subscriber.cmd_id(), Some(2));
    assert_eq!(
        transport.sent()[1]["tsSubCmds"],
        json!([{ "cmdId": 2, "keys": "a,b" }])
    );

    transport.message(&json!({ "subscriptionId": 2, "data": { "a": [[1, "x"]] } }));
    settle().await;
    {
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].data["a"], json!([[1, "x"]]));
        assert_eq!(received[0].data["b"], json!([]));
    }

    client.unsubscribe(&subscriber).unwrap();
    settle().await;
    assert_eq!(
        transport.sent()[2]["tsSubCmds"],
        json!([{ "cmdId": 2, "keys": "a,b", "unsubscribe": true }])
    );

    advance(Duration::from_millis(89_999)).await;
    settle().await;
    assert_eq!(transport.closed(), 0);

    advance(Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(transport.closed(), 1);

    transport.emit(TransportEvent::Closed);
    settle().await;
    assert_eq!(client.state(), ConnectionState::Closed);

    advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(transport.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn commands_issued_while_connecting_share_one_frame() {
    let (client, transport) = client();

    client.subscribe(&time_series("a")).unwrap();
    client
        .subscribe(&Subscriber::attributes(
            SubscriptionCommand::new("active").with_param("scope", json!("SERVER_SCOPE")),
            |_| {},
        ))
        .unwrap();
    client
        .subscribe(&Subscriber::history(
            HistoryCommand::new("temperature")
                .with_param("startTs", json!(1_000))
                .with_param("endTs", json!(2_000)),
            |_| {},
        ))
        .unwrap();
    settle().await;
    assert_eq!(transport.opened(), 1);
    assert!(transport.sent().is_empty());

    transport.emit(TransportEvent::Opened);
    settle().await;

    assert_eq!(
        transport.sent(),
        vec![json!({
            "tsSubCmds": [{ "cmdId": 1, "keys": "a" }],
            "historyCmds": [{ "cmdId": 3, "keys": "temperature", "startTs": 1_000, "endTs": 2_000 }],
            "attrSubCmds": [{ "cmdId": 2, "keys": "active", "scope": "SERVER_SCOPE" }]
        })]
    );
}

#[tokio::test(start_paused = true)]
async fn messages_are_routed_by_subscription_id() {
    let (client, transport) = client();
    let (first, first_received) =
        recording(Request::time_series(SubscriptionCommand::new("temperature")));
    let (second, second_received) =
        recording(Request::attributes(SubscriptionCommand::new("active")));
    client.subscribe(&first).unwrap();
    client.subscribe(&second).unwrap();
    settle().await;
    transport.emit(TransportEvent::Opened);
    settle().await;

    transport.message(&json!({ "subscriptionId": 2, "data": { "active": [[5, "true"]] } }));
    transport.message(&json!({ "subscriptionId": 9, "data": { "active": [[6, "false"]] } }));
    transport.message(&json!({ "data": { "temperature": [[7, "20"]] } }));
    transport.emit(TransportEvent::Message("not json".to_owned()));
    settle().await;

    assert!(first_received.lock().unwrap().is_empty());
    let second_received = second_received.lock().unwrap();
    assert_eq!(second_received.len(), 1);
    assert_eq!(second_received[0].subscription_id, Some(2));
}

#[tokio::test(start_paused = true)]
async fn subscribe_stream_yields_updates() {
    let (client, transport) = client();
    let (_subscriber, stream) = client
        .subscribe_stream(Request::time_series(SubscriptionCommand::new("a,b")))
        .unwrap();
    let mut stream = Box::pin(stream);
    settle().await;
    transport.emit(TransportEvent::Opened);
    settle().await;

    transport.message(&json!({ "subscriptionId": 1, "data": { "b": [[1, "2"]] } }));

    let update = stream.next().await.unwrap();
    assert_eq!(
        serde_json::to_value(&update).unwrap(),
        json!({ "subscriptionId": 1, "data": { "a": [], "b": [[1, "2"]] } })
    );
}

#[tokio::test(start_paused = true)]
async fn subscribe_before_idle_timeout_keeps_connection() {
    let (client, transport) = client();
    let first = time_series("a");
    client.subscribe(&first).unwrap();
    settle().await;
    transport.emit(TransportEvent::Opened);
    settle().await;

    client.unsubscribe(&first).unwrap();
    settle().await;
    advance(Duration::from_secs(60)).await;
    settle().await;

    client.subscribe(&time_series("b")).unwrap();
    settle().await;
    advance(Duration::from_secs(60)).await;
    settle().await;

    assert_eq!(transport.closed(), 0);
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(transport.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn logout_during_reconnect_wait_stays_closed() {
    let (client, transport) = client();
    client.subscribe(&time_series("a")).unwrap();
    settle().await;
    transport.emit(TransportEvent::Opened);
    settle().await;
    transport.emit(TransportEvent::Errored);
    transport.emit(TransportEvent::Closed);
    settle().await;
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    client.logout().unwrap();
    settle().await;
    advance(Duration::from_secs(10)).await;
    settle().await;

    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(transport.opened(), 1);

    let fresh = time_series("b");
    client.subscribe(&fresh).unwrap();
    settle().await;
    assert_eq!(fresh.cmd_id(), Some(1));
    assert_eq!(transport.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn reset_keeps_connection_and_restarts_ids() {
    let (client, transport) = client();
    client.subscribe(&time_series("a")).unwrap();
    client.subscribe(&time_series("b")).unwrap();
    settle().await;
    transport.emit(TransportEvent::Opened);
    settle().await;

    client.reset().unwrap();
    settle().await;
    assert_eq!(transport.closed(), 0);
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(
        transport.sent().last().unwrap()["tsSubCmds"],
        json!([
            { "cmdId": 1, "keys": "a", "unsubscribe": true },
            { "cmdId": 2, "keys": "b", "unsubscribe": true }
        ])
    );

    let fresh = time_series("c");
    client.subscribe(&fresh).unwrap();
    settle().await;

    assert_eq!(fresh.cmd_id(), Some(1));
    assert_eq!(
        transport.sent().last().unwrap()["tsSubCmds"],
        json!([{ "cmdId": 1, "keys": "c" }])
    );
    assert_eq!(transport.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn reset_with_no_new_subscribers_closes_after_idle_timeout() {
    let (client, transport) = client();
    client.subscribe(&time_series("a")).unwrap();
    settle().await;
    transport.emit(TransportEvent::Opened);
    settle().await;

    client.reset().unwrap();
    settle().await;

    advance(Duration::from_millis(89_999)).await;
    settle().await;
    assert_eq!(transport.closed(), 0);

    advance(Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(transport.closed(), 1);

    transport.emit(TransportEvent::Closed);
    settle().await;
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_of_unknown_subscriber_sends_nothing() {
    let (client, transport) = client();
    client.subscribe(&time_series("a")).unwrap();
    settle().await;
    transport.emit(TransportEvent::Opened);
    settle().await;

    client.unsubscribe(&time_series("a")).unwrap();
    settle().await;

    assert_eq!(transport.sent().len(), 1);
}

struct ExpiringToken {
    valid: AtomicBool,
    refresh_succeeds: bool,
}

#[async_trait]
impl TokenProvider for ExpiringToken {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn current_token(&self) -> SecretString {
        SecretString::from("renewed".to_owned())
    }

    async fn refresh(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if self.refresh_succeeds {
            self.valid.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(Error::authentication("session expired"))
        }
    }
}

#[tokio::test(start_paused = true)]
async fn expired_token_is_refreshed_before_connecting() {
    let (client, transport) = client_with(Arc::new(ExpiringToken {
        valid: AtomicBool::new(false),
        refresh_succeeds: true,
    }));

    client.subscribe(&time_series("a")).unwrap();
    settle().await;
    assert_eq!(transport.opened(), 0);
    assert_eq!(client.state(), ConnectionState::Opening);

    advance(Duration::from_millis(50)).await;
    settle().await;

    assert_eq!(transport.opened(), 1);
    assert_eq!(transport.last_url().query(), Some("token=renewed"));
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_reports_unauthenticated() {
    let (client, transport) = client_with(Arc::new(ExpiringToken {
        valid: AtomicBool::new(false),
        refresh_succeeds: false,
    }));
    let mut events = client.events();

    client.subscribe(&time_series("a")).unwrap();
    settle().await;
    advance(Duration::from_millis(50)).await;
    settle().await;

    assert_eq!(events.try_recv().unwrap(), Event::Unauthenticated);
    assert_eq!(transport.opened(), 0);
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn dropping_last_client_closes_connection() {
    let (client, transport) = client();
    client.subscribe(&time_series("a")).unwrap();
    settle().await;
    transport.emit(TransportEvent::Opened);
    settle().await;

    let clone = client.clone();
    drop(client);
    settle().await;
    assert_eq!(transport.closed(), 0);

    drop(clone);
    settle().await;
    assert_eq!(transport.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn state_receiver_observes_transitions() {
    let (client, transport) = client();
    let mut state = client.state_receiver();

    client.subscribe(&time_series("a")).unwrap();
    state.changed().await.unwrap();
    assert_eq!(*state.borrow_and_update(), ConnectionState::Opening);

    transport.emit(TransportEvent::Opened);
    state.changed().await.unwrap();
    assert_eq!(*state.borrow_and_update(), ConnectionState::Open);
}
