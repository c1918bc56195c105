//! Per-run bridge state.
//!
//! A [`BridgeContext`] is built when the host starts the embedded runtime and
//! torn down when the runtime's entry point returns. It owns the embedded
//! side's registry, event loop and channels.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::attach::{AttachmentCache, EnvHandle};
use crate::channel::{EVENTS_CHANNEL, EventChannel, SystemChannel, Transport};
use crate::error::BridgeError;
use crate::event_loop::EventLoop;
use crate::registry::ChannelRegistry;

/// The host's single fixed entry point for embedded → host messages.
pub(crate) trait HostEntry: Send + Sync {
    fn receive(&self, env: EnvHandle, channel: &str, text: &str);
}

pub(crate) struct BridgeContext {
    attachments: AttachmentCache,
    registry: Arc<ChannelRegistry>,
    event_loop: Arc<EventLoop>,
    host_entry: RwLock<Option<Weak<dyn HostEntry>>>,
    transport: Arc<dyn Transport>,
    channels: DashMap<String, EventChannel>,
    system: SystemChannel,
    data_dir: Arc<RwLock<Option<PathBuf>>>,
}

impl BridgeContext {
    pub(crate) fn new(
        attachments: AttachmentCache,
        data_dir: Arc<RwLock<Option<PathBuf>>>,
        host_entry: Weak<dyn HostEntry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|ctx: &Weak<Self>| {
            let transport: Arc<dyn Transport> = Arc::new(HostTransport { ctx: ctx.clone() });
            let registry = Arc::new(ChannelRegistry::new("embedded"));
            let event_loop = Arc::new(EventLoop::new("embedded"));

            let system = SystemChannel::new(Arc::clone(&transport), &registry, &event_loop);
            let channels = DashMap::new();
            channels.insert(
                EVENTS_CHANNEL.to_string(),
                EventChannel::new(
                    EVENTS_CHANNEL,
                    Arc::clone(&transport),
                    Arc::clone(&registry),
                    &event_loop,
                ),
            );

            Self {
                attachments,
                registry,
                event_loop,
                host_entry: RwLock::new(Some(host_entry)),
                transport,
                channels,
                system,
                data_dir,
            }
        })
    }

    pub(crate) fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub(crate) fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub(crate) fn system(&self) -> &SystemChannel {
        &self.system
    }

    pub(crate) fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir.read().clone()
    }

    /// Get the event channel called `name`, creating it on first use.
    pub(crate) fn channel(&self, name: &str) -> EventChannel {
        if let Some(channel) = self.channels.get(name) {
            return channel.clone();
        }
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| {
                EventChannel::new(
                    name,
                    Arc::clone(&self.transport),
                    Arc::clone(&self.registry),
                    &self.event_loop,
                )
            })
            .clone()
    }

    /// Host → embedded entry point.
    ///
    /// Unknown channels are logged and dropped.
    pub(crate) fn notify(&self, channel: &str, text: &str) {
        if let Err(err) = self.registry.dispatch(channel, text) {
            warn!(side = "embedded", channel = %channel, error = %err, "Dropping message");
        }
    }

    /// Embedded → host call path, usable from any native thread.
    pub(crate) fn send_to_host(&self, channel: &str, text: &str) -> Result<(), BridgeError> {
        let started = Instant::now();

        let entry = self
            .host_entry
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(BridgeError::Disconnected)?;
        let cache_hit = self.attachments.is_cached();
        let checked = started.elapsed();

        let env = self.attachments.acquire()?;
        let attached = started.elapsed();

        entry.receive(env, channel, text);
        let total = started.elapsed();

        trace!(
            channel = %channel,
            cache_hit,
            checks_us = checked.as_micros() as u64,
            attach_us = (attached - checked).as_micros() as u64,
            call_us = (total - attached).as_micros() as u64,
            total_us = total.as_micros() as u64,
            "Sent message to host"
        );
        Ok(())
    }

    /// Stop the loop, drop the host entry point and every channel.
    pub(crate) fn shutdown(&self) {
        self.event_loop.stop();
        *self.host_entry.write() = None;

        for channel in self.channels.iter() {
            channel.clear_listeners();
        }
        self.system.clear_listeners();
        self.channels.clear();
        self.registry.clear();

        debug!("Bridge context torn down");
    }
}

/// Outbound transport for embedded-side channels.
struct HostTransport {
    ctx: Weak<BridgeContext>,
}

impl Transport for HostTransport {
    fn send(&self, channel: &str, text: &str) -> Result<(), BridgeError> {
        self.ctx
            .upgrade()
            .ok_or(BridgeError::Disconnected)?
            .send_to_host(channel, text)
    }
}
