//! Message bridge between a host application and an in-process embedded
//! runtime.
//!
//! Both sides exchange text over named channels. The host starts the runtime
//! with [`HostBridge::start_runtime`] (or [`HostBridge::spawn_runtime`]) and
//! the runtime receives an [`EmbeddedBridge`] for its side of the conversation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   send_message    ┌──────────────────────────────┐
//! │  HostBridge  │ ────────────────► │ ChannelRegistry (embedded)   │
//! │              │                   │   └─ EventLoop (deferred)    │
//! │  registry    │ ◄──────────────── │       ├─ EventChannel        │
//! │  (host)      │  AttachmentCache  │       └─ SystemChannel       │
//! └──────────────┘                   └──────────────────────────────┘
//! ```
//!
//! User channels carry `{"event": ..., "payload": [...]}` envelopes (see
//! [`codec`]). The `_SYSTEM_` channel carries plain-text lifecycle messages.

pub mod argv;
pub mod attach;
pub mod channel;
pub mod codec;
pub mod config;
mod context;
pub mod embedded;
pub mod error;
pub mod event_loop;
pub mod host;
pub mod output;
pub mod platform;
pub mod registry;

pub use argv::ArgVector;
pub use attach::{
    AttachmentCache, AttachmentStats, EnvHandle, EnvLookup, HostVm, InProcessVm, VmError,
};
pub use channel::{
    DEFAULT_EVENT, EVENTS_CHANNEL, EventChannel, LifecycleBarrier, ListenerId, PauseLock,
    SYSTEM_CHANNEL, SystemChannel, SystemMessage, Transport,
};
pub use codec::Envelope;
pub use config::{AttachConfig, BridgeConfig, RuntimeConfig};
pub use embedded::{EmbeddedBridge, EmbeddedRuntime, StartRequest};
pub use error::{BridgeError, ChannelError, CodecError, ConfigError, LifecycleError};
pub use event_loop::EventLoop;
pub use host::{HostBridge, PauseTicket, RuntimeThread, StartOptions};
pub use output::RuntimeOutput;
pub use platform::abi_name;
pub use registry::{ChannelDispatcher, ChannelRegistry, RegistryStats};
