//! The embedded runtime's view of the bridge.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::argv::ArgVector;
use crate::channel::{EVENTS_CHANNEL, EventChannel, SystemChannel};
use crate::context::BridgeContext;
use crate::error::BridgeError;
use crate::event_loop::EventLoop;
use crate::output::RuntimeOutput;
use crate::registry::{ChannelDispatcher, RegistryStats};

/// Handle given to the embedded runtime for the duration of one run.
///
/// Cheap to clone and safe to move to other native threads; sends from any
/// thread go through the attachment cache.
#[derive(Clone)]
pub struct EmbeddedBridge {
    ctx: Arc<BridgeContext>,
}

impl EmbeddedBridge {
    pub(crate) fn new(ctx: Arc<BridgeContext>) -> Self {
        Self { ctx }
    }

    /// Event channel called `name`, created on first use.
    pub fn channel(&self, name: &str) -> EventChannel {
        self.ctx.channel(name)
    }

    /// The default `_EVENTS_` channel.
    pub fn events(&self) -> EventChannel {
        self.ctx.channel(EVENTS_CHANNEL)
    }

    pub fn system(&self) -> SystemChannel {
        self.ctx.system().clone()
    }

    /// Install a raw dispatcher, bypassing the envelope codec.
    pub fn register_channel(&self, name: impl Into<String>, dispatcher: Arc<dyn ChannelDispatcher>) {
        self.ctx.registry().register(name, dispatcher);
    }

    /// Send raw text to the host on `channel`.
    pub fn send_message(&self, channel: &str, text: &str) -> Result<(), BridgeError> {
        self.ctx.send_to_host(channel, text)
    }

    /// Tell the host the runtime is ready for app events. Sent at most once.
    pub fn signal_ready(&self) -> Result<bool, BridgeError> {
        self.ctx.system().signal_ready()
    }

    /// Directory the host registered for runtime data.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.ctx.data_dir()
    }

    pub fn event_loop(&self) -> Arc<EventLoop> {
        Arc::clone(self.ctx.event_loop())
    }

    /// Run the event loop on the calling thread until the host stops it.
    pub fn run_event_loop(&self) -> io::Result<()> {
        self.ctx.event_loop().run()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.ctx.registry().stats()
    }
}

impl std::fmt::Debug for EmbeddedBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedBridge")
            .field("registry", &self.registry_stats())
            .finish_non_exhaustive()
    }
}

/// Everything the embedded runtime's entry point receives.
#[derive(Debug)]
pub struct StartRequest {
    pub argv: ArgVector,
    /// Module search path for the runtime
    pub module_path: String,
    pub output: RuntimeOutput,
    pub bridge: EmbeddedBridge,
}

/// An embedded runtime's entry point.
///
/// `start` blocks for the lifetime of the runtime and returns its exit code.
pub trait EmbeddedRuntime: Send + Sync {
    fn start(&self, request: StartRequest) -> i32;
}

impl<F> EmbeddedRuntime for F
where
    F: Fn(StartRequest) -> i32 + Send + Sync,
{
    fn start(&self, request: StartRequest) -> i32 {
        self(request)
    }
}
