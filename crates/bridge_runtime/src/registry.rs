//! Channel registry.
//!
//! Maps channel names to dispatchers on one side of the bridge. The registry
//! never looks at message text; it hands the raw string to whatever is
//! registered under the name.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::error::BridgeError;

/// Receives raw text for a channel.
pub trait ChannelDispatcher: Send + Sync {
    fn dispatch(&self, channel: &str, text: &str);
}

impl<F> ChannelDispatcher for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn dispatch(&self, channel: &str, text: &str) {
        self(channel, text)
    }
}

struct Entry {
    dispatcher: Arc<dyn ChannelDispatcher>,
    active: bool,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Number of registered channels
    pub channels: usize,
    /// Inactive → active delivery transitions
    pub activations: u64,
    /// Active → inactive delivery transitions
    pub deactivations: u64,
}

/// Name → dispatcher map for one side of the bridge.
pub struct ChannelRegistry {
    side: &'static str,
    channels: DashMap<String, Entry>,
    activations: AtomicU64,
    deactivations: AtomicU64,
}

impl ChannelRegistry {
    /// Create an empty registry. `side` only labels log lines.
    pub fn new(side: &'static str) -> Self {
        Self {
            side,
            channels: DashMap::new(),
            activations: AtomicU64::new(0),
            deactivations: AtomicU64::new(0),
        }
    }

    /// Install `dispatcher` under `name` with delivery active.
    ///
    /// Re-registering replaces the previous dispatcher.
    pub fn register(&self, name: impl Into<String>, dispatcher: Arc<dyn ChannelDispatcher>) {
        self.register_with_delivery(name, dispatcher, true);
    }

    pub fn register_with_delivery(
        &self,
        name: impl Into<String>,
        dispatcher: Arc<dyn ChannelDispatcher>,
        active: bool,
    ) {
        let name = name.into();
        debug!(side = self.side, channel = %name, active, "Registering channel");
        let replaced = self
            .channels
            .insert(name, Entry { dispatcher, active })
            .is_some();
        if replaced {
            debug!(side = self.side, "Replaced existing channel dispatcher");
        }
    }

    /// Turn native delivery on or off for `name`.
    ///
    /// Returns `false` if no such channel exists.
    pub fn set_delivery(&self, name: &str, active: bool) -> bool {
        let Some(mut entry) = self.channels.get_mut(name) else {
            return false;
        };

        if entry.active != active {
            entry.active = active;
            if active {
                self.activations.fetch_add(1, Ordering::Relaxed);
            } else {
                self.deactivations.fetch_add(1, Ordering::Relaxed);
            }
            debug!(side = self.side, channel = %name, active, "Channel delivery changed");
        }
        true
    }

    /// Forward `text` to the dispatcher registered under `name`.
    ///
    /// Messages for a channel whose delivery is off are dropped silently.
    pub fn dispatch(&self, name: &str, text: &str) -> Result<(), BridgeError> {
        let dispatcher = {
            let entry = self
                .channels
                .get(name)
                .ok_or_else(|| BridgeError::UnknownChannel(name.to_string()))?;
            if !entry.active {
                debug!(side = self.side, channel = %name, "Channel inactive, dropping message");
                return Ok(());
            }
            Arc::clone(&entry.dispatcher)
        };

        // Called without holding the shard lock so dispatchers may re-enter.
        dispatcher.dispatch(name, text);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.channels.get(name).is_some_and(|entry| entry.active)
    }

    /// Remove every channel.
    pub fn clear(&self) {
        self.channels.clear();
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            channels: self.channels.len(),
            activations: self.activations.load(Ordering::Relaxed),
            deactivations: self.deactivations.load(Ordering::Relaxed),
        }
    }
}
