#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::Stream;
use tokio::sync::mpsc;

use super::types::request::{CmdId, HistoryCommand, Request, SubscriptionCommand};
use super::types::response::TelemetryMessage;

type DataCallback = Arc<dyn Fn(TelemetryMessage) + Send + Sync>;
type ReconnectedCallback = Arc<dyn Fn() + Send + Sync>;

/// One desired data feed plus the callbacks that consume it.
///
/// A `Subscriber` is a cheap handle: clones refer to the same subscriber, which is
/// what [`Client::unsubscribe`](super::Client::unsubscribe) matches on. The command
/// id currently assigned to it is visible through [`Subscriber::cmd_id`] and changes
/// every time the subscriber is (re-)registered, including after a reconnect.
///
/// # Example
///
/// ```ignore
/// let subscriber = Subscriber::time_series(
///     SubscriptionCommand::new("temperature,humidity"),
///     |message| println!("{:?}", message.data),
/// )
/// .with_reconnected(|| println!("resubscribing"));
/// ```
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

struct SubscriberInner {
    request: Request,
    /// 0 until the first registration
    cmd_id: AtomicU32,
    on_data: DataCallback,
    on_reconnected: Option<ReconnectedCallback>,
}

impl Subscriber {
    pub fn new<F>(request: Request, on_data: F) -> Self
    where
        F: Fn(TelemetryMessage) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(SubscriberInner {
                request,
                cmd_id: AtomicU32::new(0),
                on_data: Arc::new(on_data),
                on_reconnected: None,
            }),
        }
    }

    pub fn time_series<F>(command: SubscriptionCommand, on_data: F) -> Self
    where
        F: Fn(TelemetryMessage) + Send + Sync + 'static,
    {
        Self::new(Request::time_series(command), on_data)
    }

    pub fn attributes<F>(command: SubscriptionCommand, on_data: F) -> Self
    where
        F: Fn(TelemetryMessage) + Send + Sync + 'static,
    {
        Self::new(Request::attributes(command), on_data)
    }

    pub fn history<F>(command: HistoryCommand, on_data: F) -> Self
    where
        F: Fn(TelemetryMessage) + Send + Sync + 'static,
    {
        Self::new(Request::history(command), on_data)
    }

    /// Returns a new subscriber that also gets told when it is about to be
    /// re-registered after a reconnect.
    #[must_use]
    pub fn with_reconnected<F>(self, on_reconnected: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(SubscriberInner {
                request: self.inner.request.clone(),
                cmd_id: AtomicU32::new(self.inner.cmd_id.load(Ordering::Acquire)),
                on_data: Arc::clone(&self.inner.on_data),
                on_reconnected: Some(Arc::new(on_reconnected)),
            }),
        }
    }

    /// A subscriber whose updates are delivered as a stream instead of a callback.
    ///
    /// The stream ends once every clone of the returned subscriber has been dropped,
    /// including the one held by the client while subscribed.
    pub fn channel(request: Request) -> (Self, impl Stream<Item = TelemetryMessage>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = Self::new(request, move |message| {
            _ = tx.send(message);
        });

        let stream = async_stream::stream! {
            while let Some(message) = rx.recv().await {
                yield message;
            }
        };

        (subscriber, stream)
    }

    #[must_use]
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Command id of the latest registration, if any.
    #[must_use]
    pub fn cmd_id(&self) -> Option<CmdId> {
        match self.inner.cmd_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Whether both handles refer to the same subscriber.
    #[must_use]
    pub fn same_as(&self, other: &Subscriber) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn assign(&self, cmd_id: CmdId) {
        self.inner.cmd_id.store(cmd_id, Ordering::Release);
    }

    pub(crate) fn deliver(&self, message: TelemetryMessage) {
        (self.inner.on_data)(message);
    }

    pub(crate) fn notify_reconnected(&self) {
        if let Some(on_reconnected) = &self.inner.on_reconnected {
            on_reconnected();
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("request", &self.inner.request)
            .field("cmd_id", &self.cmd_id())
            .finish_non_exhaustive()
    }
}

/// Live subscribers keyed by command id.
///
/// Ids come from a counter starting at 1. [`Registry::drain`] empties the map but
/// keeps the counter, so ids stay unique across a reconnect; only
/// [`Registry::reset`] starts over.
#[derive(Debug, Default)]
pub struct Registry {
    last_cmd_id: CmdId,
    subscribers: BTreeMap<CmdId, Subscriber>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `subscriber` under the next command id and return that id.
    pub fn register(&mut self, subscriber: Subscriber) -> CmdId {
        self.last_cmd_id += 1;
        let cmd_id = self.last_cmd_id;
        self.subscribers.insert(cmd_id, subscriber);
        cmd_id
    }

    /// Remove and return the entry for `cmd_id`. Unknown ids are ignored.
    pub fn unregister(&mut self, cmd_id: CmdId) -> Option<Subscriber> {
        self.subscribers.remove(&cmd_id)
    }

    #[must_use]
    pub fn resolve(&self, cmd_id: CmdId) -> Option<&Subscriber> {
        self.subscribers.get(&cmd_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Live subscribers with their ids, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (CmdId, &Subscriber)> {
        self.subscribers
            .iter()
            .map(|(cmd_id, subscriber)| (*cmd_id, subscriber))
    }

    /// Take every live subscriber, in registration order.
    pub fn drain(&mut self) -> Vec<Subscriber> {
        std::mem::take(&mut self.subscribers).into_values().collect()
    }

    /// Forget every subscriber and restart ids from 1.
    pub fn reset(&mut self) {
        self.subscribers.clear();
        self.last_cmd_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::StreamExt as _;

    use super::*;

    fn subscriber(keys: &str) -> Subscriber {
        Subscriber::time_series(SubscriptionCommand::new(keys), |_| {})
    }

    #[test]
    fn register_assigns_increasing_ids_from_one() {
        let mut registry = Registry::new();

        assert_eq!(registry.register(subscriber("a")), 1);
        assert_eq!(registry.register(subscriber("b")), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unregister_unknown_id_is_noop() {
        let mut registry = Registry::new();
        registry.register(subscriber("a"));

        assert!(registry.unregister(42).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removed_ids_are_not_reused() {
        let mut registry = Registry::new();
        let first = registry.register(subscriber("a"));
        registry.unregister(first);

        assert_eq!(registry.register(subscriber("b")), 2);
        assert!(registry.resolve(first).is_none());
    }

    #[test]
    fn drain_keeps_counter_and_reset_restarts_it() {
        let mut registry = Registry::new();
        let a = subscriber("a");
        let b = subscriber("b");
        registry.register(a.clone());
        registry.register(b.clone());

        let ids: Vec<_> = registry.iter().map(|(cmd_id, _)| cmd_id).collect();
        assert_eq!(ids, vec![1, 2]);

        let drained = registry.drain();
        assert!(registry.is_empty());
        assert!(drained[0].same_as(&a));
        assert!(drained[1].same_as(&b));
        assert_eq!(registry.register(subscriber("c")), 3);

        registry.reset();
        assert!(registry.is_empty());
        assert_eq!(registry.register(subscriber("d")), 1);
    }

    #[test]
    fn same_subscriber_registers_twice() {
        let mut registry = Registry::new();
        let a = subscriber("a");

        let first = registry.register(a.clone());
        let second = registry.register(a.clone());

        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn clones_share_cmd_id() {
        let a = subscriber("a");
        let clone = a.clone();

        assert_eq!(a.cmd_id(), None);
        a.assign(5);
        assert_eq!(clone.cmd_id(), Some(5));
        assert!(clone.same_as(&a));
        assert!(!subscriber("a").same_as(&a));
    }

    #[test]
    fn with_reconnected_keeps_data_callback() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let reconnected = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let reconnect_counter = Arc::clone(&reconnected);

        let subscriber = Subscriber::time_series(SubscriptionCommand::new("a"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .with_reconnected(move || {
            reconnect_counter.fetch_add(1, Ordering::SeqCst);
        });

        subscriber.deliver(TelemetryMessage::default());
        subscriber.notify_reconnected();

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(reconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_streams_delivered_messages() {
        let (subscriber, stream) =
            Subscriber::channel(Request::time_series(SubscriptionCommand::new("a")));
        let mut stream = Box::pin(stream);

        let message = TelemetryMessage {
            subscription_id: Some(1),
            ..TelemetryMessage::default()
        };
        subscriber.deliver(message.clone());
        drop(subscriber);

        assert_eq!(stream.next().await, Some(message));
        assert_eq!(stream.next().await, None);
    }
}
