//! Channels on the embedded side of the bridge.
//!
//! - [`EventChannel`]: pub/sub over the `{event, payload}` envelope
//! - [`SystemChannel`]: plain-text lifecycle messages with a pause barrier

mod barrier;
mod event;
mod system;

pub use barrier::{LifecycleBarrier, PauseLock};
pub use event::{EventChannel, Listener};
pub use system::{PauseListener, ResumeListener, SystemChannel, SystemMessage};

use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::BridgeError;
use crate::event_loop::EventLoop;
use crate::registry::ChannelDispatcher;

/// Lifecycle channel name.
pub const SYSTEM_CHANNEL: &str = "_SYSTEM_";

/// Default user channel name.
pub const EVENTS_CHANNEL: &str = "_EVENTS_";

/// Event name used by [`EventChannel::send`].
pub const DEFAULT_EVENT: &str = "message";

/// Identifies a registered listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Outbound path from a channel to the other side of the bridge.
pub trait Transport: Send + Sync {
    fn send(&self, channel: &str, text: &str) -> Result<(), BridgeError>;
}

/// Channel state that consumes raw inbound text on the event loop.
pub(crate) trait Inbound: Send + Sync + 'static {
    fn receive(&self, text: String);
}

/// Registry dispatcher that hands inbound text to a channel on a later turn.
pub(crate) struct DeferredDispatcher<T: Inbound> {
    target: Weak<T>,
    event_loop: Weak<EventLoop>,
}

impl<T: Inbound> DeferredDispatcher<T> {
    pub(crate) fn new(target: Weak<T>, event_loop: Weak<EventLoop>) -> Self {
        Self { target, event_loop }
    }
}

impl<T: Inbound> ChannelDispatcher for DeferredDispatcher<T> {
    fn dispatch(&self, channel: &str, text: &str) {
        let Some(event_loop) = self.event_loop.upgrade() else {
            debug!(channel = %channel, "Event loop gone, dropping message");
            return;
        };

        let target = self.target.clone();
        let text = text.to_string();
        let queued = event_loop.defer(move || {
            if let Some(target) = target.upgrade() {
                target.receive(text);
            }
        });
        if !queued {
            debug!(channel = %channel, "Event loop stopped, dropping message");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;

    /// Transport that records every outbound message.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingTransport {
        pub(crate) fn texts(&self, channel: &str) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter(|(name, _)| name == channel)
                .map(|(_, text)| text.clone())
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, channel: &str, text: &str) -> Result<(), BridgeError> {
            self.sent.lock().push((channel.to_string(), text.to_string()));
            Ok(())
        }
    }
}
