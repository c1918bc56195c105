use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{DEFAULT_EVENT, DeferredDispatcher, Inbound, ListenerId, Transport};
use crate::codec;
use crate::error::ChannelError;
use crate::event_loop::EventLoop;
use crate::registry::ChannelRegistry;

/// Callback invoked with an event's payload.
pub type Listener = Arc<dyn Fn(&[Value]) + Send + Sync>;

struct ListenerEntry {
    id: ListenerId,
    event: String,
    once: bool,
    callback: Listener,
}

struct EventCore {
    name: String,
    listeners: Mutex<Vec<ListenerEntry>>,
    transport: Arc<dyn Transport>,
    registry: Arc<ChannelRegistry>,
}

impl EventCore {
    fn add(&self, event: &str, once: bool, callback: Listener) -> ListenerId {
        let id = ListenerId::next();
        let mut listeners = self.listeners.lock();
        listeners.push(ListenerEntry {
            id,
            event: event.to_string(),
            once,
            callback,
        });
        if listeners.len() == 1 {
            self.registry.set_delivery(&self.name, true);
        }
        id
    }

    /// Deliver `payload` to the listeners for `event`, in registration order.
    fn emit(&self, event: &str, payload: &[Value]) {
        let matching: Vec<Listener> = {
            let mut listeners = self.listeners.lock();
            let before = listeners.len();
            let matching = listeners
                .iter()
                .filter(|entry| entry.event == event)
                .map(|entry| Arc::clone(&entry.callback))
                .collect();
            listeners.retain(|entry| !(entry.once && entry.event == event));
            if before > 0 && listeners.is_empty() {
                self.registry.set_delivery(&self.name, false);
            }
            matching
        };

        if matching.is_empty() {
            debug!(channel = %self.name, event = %event, "No listeners for event");
        }
        for callback in matching {
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                error!(channel = %self.name, event = %event, "Event listener panicked");
            }
        }
    }
}

impl Inbound for EventCore {
    fn receive(&self, text: String) {
        match codec::deserialize(&text) {
            Ok(envelope) => self.emit(&envelope.event, &envelope.payload),
            Err(err) => {
                warn!(channel = %self.name, error = %err, "Dropping undecodable message");
            }
        }
    }
}

/// Pub/sub channel carrying `{event, payload}` envelopes.
///
/// Incoming messages reach listeners on a later event loop turn, never inside
/// the call that delivered them. Native delivery for the channel is only
/// switched on while at least one listener is registered.
#[derive(Clone)]
pub struct EventChannel {
    core: Arc<EventCore>,
}

impl EventChannel {
    pub(crate) fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        registry: Arc<ChannelRegistry>,
        event_loop: &Arc<EventLoop>,
    ) -> Self {
        let name = name.into();
        let core = Arc::new(EventCore {
            name: name.clone(),
            listeners: Mutex::new(Vec::new()),
            transport,
            registry: Arc::clone(&registry),
        });

        let dispatcher = DeferredDispatcher::new(Arc::downgrade(&core), Arc::downgrade(event_loop));
        registry.register_with_delivery(name, Arc::new(dispatcher), false);

        Self { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Register `listener` for every `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.core.add(event, false, Arc::new(listener))
    }

    /// Register `listener` for the next `event` only.
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.core.add(event, true, Arc::new(listener))
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.core.listeners.lock();
        let Some(index) = listeners.iter().position(|entry| entry.id == id) else {
            return false;
        };
        listeners.remove(index);
        if listeners.is_empty() {
            self.core.registry.set_delivery(&self.core.name, false);
        }
        true
    }

    /// Total listeners across all events.
    pub fn listener_count(&self) -> usize {
        self.core.listeners.lock().len()
    }

    pub fn event_listener_count(&self, event: &str) -> usize {
        self.core
            .listeners
            .lock()
            .iter()
            .filter(|entry| entry.event == event)
            .count()
    }

    /// Post `args` under the default `message` event.
    pub fn send<I, T>(&self, args: I) -> Result<(), ChannelError>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        self.post(DEFAULT_EVENT, args)
    }

    /// Encode `{event, payload: args}` and send it to the other side.
    pub fn post<I, T>(&self, event: &str, args: I) -> Result<(), ChannelError>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        let text = codec::serialize(event, args)?;
        self.core.transport.send(&self.core.name, &text)?;
        Ok(())
    }

    /// Emit locally, synchronously, without going through the bridge.
    pub fn emit(&self, event: &str, payload: &[Value]) {
        self.core.emit(event, payload);
    }

    pub(crate) fn clear_listeners(&self) {
        let mut listeners = self.core.listeners.lock();
        if !listeners.is_empty() {
            listeners.clear();
            self.core.registry.set_delivery(&self.core.name, false);
        }
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("name", &self.core.name)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::EVENTS_CHANNEL;
    use crate::channel::testing::RecordingTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        transport: Arc<RecordingTransport>,
        registry: Arc<ChannelRegistry>,
        event_loop: Arc<EventLoop>,
        channel: EventChannel,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(RecordingTransport::default());
        let registry = Arc::new(ChannelRegistry::new("embedded"));
        let event_loop = Arc::new(EventLoop::new("test"));
        let channel = EventChannel::new(
            EVENTS_CHANNEL,
            transport.clone(),
            registry.clone(),
            &event_loop,
        );
        Fixture {
            transport,
            registry,
            event_loop,
            channel,
        }
    }

    #[test]
    fn test_post_sends_exact_envelope() {
        let fx = fixture();
        fx.channel.post("foo", ["a", "b"]).unwrap();
        fx.channel.send([1, 2]).unwrap();

        assert_eq!(
            fx.transport.texts(EVENTS_CHANNEL),
            vec![
                r#"{"event":"foo","payload":["a","b"]}"#.to_string(),
                r#"{"event":"message","payload":[1,2]}"#.to_string(),
            ]
        );
    }

    #[test]
    fn test_post_rejects_empty_event() {
        let fx = fixture();
        let err = fx.channel.post("", ["a"]).unwrap_err();
        assert!(matches!(err, ChannelError::Codec(_)));
        assert!(fx.transport.sent.lock().is_empty());
    }

    #[test]
    fn test_delivery_follows_listener_count() {
        let fx = fixture();
        assert!(!fx.registry.is_active(EVENTS_CHANNEL));

        let ids: Vec<_> = (0..3).map(|_| fx.channel.on("message", |_| {})).collect();
        assert!(fx.registry.is_active(EVENTS_CHANNEL));
        for id in ids {
            assert!(fx.channel.off(id));
        }
        assert!(!fx.registry.is_active(EVENTS_CHANNEL));

        let stats = fx.registry.stats();
        assert_eq!(stats.activations, 1);
        assert_eq!(stats.deactivations, 1);
    }

    #[test]
    fn test_incoming_emission_is_deferred() {
        let fx = fixture();
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let sink = received.clone();
        fx.channel.on("message", move |payload| {
            sink.lock().push(payload.to_vec());
        });

        fx.registry
            .dispatch(EVENTS_CHANNEL, r#"{"event":"message","payload":["hi",1]}"#)
            .unwrap();
        assert!(received.lock().is_empty());

        assert_eq!(fx.event_loop.run_pending(), 1);
        assert_eq!(*received.lock(), vec![vec![json!("hi"), json!(1)]]);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let fx = fixture();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            fx.channel.on("tick", move |_| order.lock().push(i));
        }
        fx.channel.on("other", |_| panic!("wrong event"));

        fx.registry
            .dispatch(EVENTS_CHANNEL, r#"{"event":"tick","payload":[]}"#)
            .unwrap();
        fx.event_loop.run_pending();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let fx = fixture();
        let calls = Arc::new(AtomicUsize::new(0));

        fx.channel.on("tick", |_| panic!("listener failure"));
        let counter = calls.clone();
        fx.channel.on("tick", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        fx.channel.emit("tick", &[]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_undecodable_message_is_dropped() {
        let fx = fixture();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        fx.channel.on("message", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for text in ["not json", "null", r#"{"event":1,"payload":[]}"#] {
            fx.registry.dispatch(EVENTS_CHANNEL, text).unwrap();
        }
        fx.registry
            .dispatch(EVENTS_CHANNEL, r#"{"event":"message","payload":[]}"#)
            .unwrap();

        assert_eq!(fx.event_loop.run_pending(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_inactive_channel_ignores_incoming() {
        let fx = fixture();
        fx.registry
            .dispatch(EVENTS_CHANNEL, r#"{"event":"message","payload":[]}"#)
            .unwrap();
        assert_eq!(fx.event_loop.run_pending(), 0);
    }

    #[test]
    fn test_once_listener_fires_once() {
        let fx = fixture();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        fx.channel.once("ping", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(fx.registry.is_active(EVENTS_CHANNEL));

        fx.channel.emit("ping", &[]);
        fx.channel.emit("ping", &[]);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.channel.listener_count(), 0);
        assert!(!fx.registry.is_active(EVENTS_CHANNEL));
    }

    #[test]
    fn test_listener_may_remove_itself() {
        let fx = fixture();
        let channel = fx.channel.clone();
        let slot = Arc::new(parking_lot::Mutex::new(None));

        let own_id = slot.clone();
        let id = fx.channel.on("x", move |_| {
            if let Some(id) = own_id.lock().take() {
                channel.off(id);
            }
        });
        *slot.lock() = Some(id);

        fx.channel.emit("x", &[]);
        assert_eq!(fx.channel.event_listener_count("x"), 0);
    }
}
