//! The host application's side of the bridge.
//!
//! [`HostBridge`] starts the embedded runtime, sends it messages, receives
//! its messages through a host-side [`ChannelRegistry`] and drives the
//! pause/resume handshake.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::argv::ArgVector;
use crate::attach::{AttachmentCache, AttachmentStats, EnvHandle, HostVm};
use crate::channel::{SYSTEM_CHANNEL, SystemMessage};
use crate::config::{BridgeConfig, RuntimeConfig};
use crate::context::{BridgeContext, HostEntry};
use crate::embedded::{EmbeddedBridge, EmbeddedRuntime, StartRequest};
use crate::error::{BridgeError, ConfigError, LifecycleError};
use crate::output::RuntimeOutput;
use crate::platform;
use crate::registry::{ChannelDispatcher, ChannelRegistry, RegistryStats};

/// Arguments for one start call.
#[derive(Debug, Clone, PartialEq)]
pub struct StartOptions {
    pub args: Vec<String>,
    pub module_path: String,
    pub redirect_output: bool,
}

impl StartOptions {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            args: config.args.clone(),
            module_path: config.module_path.clone(),
            redirect_output: config.redirect_output,
        }
    }
}

impl Default for StartOptions {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

struct HostInner {
    attachments: AttachmentCache,
    registry: ChannelRegistry,
    context: RwLock<Option<Arc<BridgeContext>>>,
    ready: watch::Sender<bool>,
    pending: DashMap<String, oneshot::Sender<()>>,
    data_dir: Arc<RwLock<Option<PathBuf>>>,
}

impl HostInner {
    fn context(&self) -> Option<Arc<BridgeContext>> {
        self.context.read().clone()
    }

    fn handle_system(&self, text: &str) {
        match SystemMessage::parse(text) {
            Some(SystemMessage::Ready) => {
                self.ready.send_replace(true);
                info!("Embedded runtime is ready for app events");
            }
            Some(SystemMessage::ReleasePause { event_id }) => self.complete_pause(event_id),
            Some(other) => {
                warn!(message = %other, "Unexpected system message direction, dropping");
            }
            None => warn!(text = %text, "Unknown system message, dropping"),
        }

        // Host code may observe lifecycle traffic too.
        match self.registry.dispatch(SYSTEM_CHANNEL, text) {
            Ok(()) | Err(BridgeError::UnknownChannel(_)) => {}
            Err(err) => warn!(side = "host", error = %err, "System message observer failed"),
        }
    }

    fn complete_pause(&self, event_id: Option<String>) {
        let Some(id) = event_id else {
            debug!("Pause released without an event id");
            return;
        };
        match self.pending.remove(&id) {
            Some((_, done)) => {
                let _ = done.send(());
                debug!(event_id = %id, "Pause released");
            }
            None => debug!(event_id = %id, "Release for unknown pause event"),
        }
    }

    /// Drop the current context and reset per-run state.
    fn teardown(&self) {
        let ctx = self.context.write().take();
        if let Some(ctx) = ctx {
            ctx.shutdown();
        }
        self.ready.send_replace(false);
        self.pending.clear();
    }
}

impl HostEntry for HostInner {
    fn receive(&self, _env: EnvHandle, channel: &str, text: &str) {
        if channel == SYSTEM_CHANNEL {
            self.handle_system(text);
            return;
        }

        if let Err(err) = self.registry.dispatch(channel, text) {
            warn!(side = "host", channel = %channel, error = %err, "Dropping message");
        }
    }
}

/// Tears the context down when the entry point returns or unwinds.
struct Teardown<'a>(&'a HostInner);

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.0.teardown();
    }
}

/// Host handle to the bridge. Cloning shares the same bridge.
#[derive(Clone)]
pub struct HostBridge {
    inner: Arc<HostInner>,
}

impl HostBridge {
    pub fn new(vm: Arc<dyn HostVm>, config: &BridgeConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let attachments =
            AttachmentCache::with_warn_ratio(vm, config.attach.limit, config.attach.warn_ratio);
        let (ready, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(HostInner {
                attachments,
                registry: ChannelRegistry::new("host"),
                context: RwLock::new(None),
                ready,
                pending: DashMap::new(),
                data_dir: Arc::new(RwLock::new(config.runtime.data_dir.clone())),
            }),
        })
    }

    /// Install a host handler for messages the embedded side sends on `name`.
    pub fn register_channel(&self, name: impl Into<String>, dispatcher: Arc<dyn ChannelDispatcher>) {
        self.inner.registry.register(name, dispatcher);
    }

    /// Send raw text to the embedded runtime on `channel`.
    ///
    /// Text on `_SYSTEM_` must be `pause[|id]` or `resume`, and is refused
    /// until the runtime is ready.
    pub fn send_message(&self, channel: &str, text: &str) -> Result<(), BridgeError> {
        if channel == SYSTEM_CHANNEL {
            self.check_system_message(text)?;
        }
        self.deliver(channel, text)
    }

    /// Run the embedded runtime on the calling thread until its entry point
    /// returns, then tear the bridge context down.
    pub fn start_runtime(
        &self,
        runtime: &dyn EmbeddedRuntime,
        options: StartOptions,
    ) -> Result<i32, BridgeError> {
        let ctx = {
            let mut slot = self.inner.context.write();
            if slot.is_some() {
                return Err(BridgeError::AlreadyRunning);
            }
            let host_entry = Arc::downgrade(&self.inner);
            let ctx = BridgeContext::new(
                self.inner.attachments.clone(),
                Arc::clone(&self.inner.data_dir),
                host_entry,
            );
            *slot = Some(Arc::clone(&ctx));
            ctx
        };
        let _teardown = Teardown(&self.inner);

        let argv = ArgVector::marshal(&options.args);
        info!(
            argc = argv.argc(),
            module_path = %options.module_path,
            redirect_output = options.redirect_output,
            "Starting embedded runtime"
        );

        let request = StartRequest {
            argv,
            module_path: options.module_path,
            output: RuntimeOutput::new(options.redirect_output),
            bridge: EmbeddedBridge::new(ctx),
        };
        let code = runtime.start(request);

        info!(exit_code = code, "Embedded runtime exited");
        Ok(code)
    }

    /// Run [`start_runtime`](Self::start_runtime) on a dedicated thread.
    pub fn spawn_runtime(
        &self,
        runtime: Arc<dyn EmbeddedRuntime>,
        options: StartOptions,
    ) -> Result<RuntimeThread, BridgeError> {
        let host = self.clone();
        let handle = thread::Builder::new()
            .name("embedded-runtime".to_string())
            .spawn(move || host.start_runtime(runtime.as_ref(), options))?;

        Ok(RuntimeThread {
            host: self.clone(),
            handle: Some(handle),
        })
    }

    /// Ask the running runtime's event loop to stop. Returns `false` if no
    /// runtime is running.
    pub fn stop_runtime(&self) -> bool {
        match self.inner.context() {
            Some(ctx) => {
                ctx.event_loop().stop();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.context.read().is_some()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Wait until the embedded runtime signals readiness.
    pub async fn ready(&self) {
        let mut rx = self.inner.ready.subscribe();
        // The sender lives as long as `self`, so this only ends on readiness.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Send `pause`, optionally tagged with `event_id`.
    pub fn pause(&self, event_id: Option<&str>) -> Result<(), LifecycleError> {
        self.dispatch_lifecycle(SystemMessage::Pause {
            event_id: event_id.map(str::to_string),
        })
    }

    /// Send `pause|<id>` with a fresh id and return a ticket that completes
    /// when the embedded side releases it.
    pub fn begin_pause(&self) -> Result<PauseTicket, LifecycleError> {
        self.ensure_ready("pause")?;

        let id = Uuid::new_v4().to_string();
        let (done_tx, done_rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), done_tx);

        if let Err(err) = self.pause(Some(&id)) {
            self.inner.pending.remove(&id);
            return Err(err);
        }

        Ok(PauseTicket { id, done: done_rx })
    }

    /// Pause and wait for every embedded pause listener to release.
    pub async fn pause_and_wait(&self) -> Result<(), LifecycleError> {
        self.begin_pause()?.wait().await
    }

    pub fn resume(&self) -> Result<(), LifecycleError> {
        self.dispatch_lifecycle(SystemMessage::Resume)
    }

    pub fn abi_name(&self) -> &'static str {
        platform::abi_name()
    }

    /// Directory handed to the embedded runtime for its data.
    pub fn register_data_dir(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        debug!(path = %path.display(), "Registering data directory");
        *self.inner.data_dir.write() = Some(path);
    }

    pub fn attachment_stats(&self) -> AttachmentStats {
        self.inner.attachments.stats()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }

    fn ensure_ready(&self, what: &'static str) -> Result<(), LifecycleError> {
        if self.is_ready() {
            return Ok(());
        }
        warn!(message = what, "Embedded runtime not ready, refusing lifecycle dispatch");
        Err(LifecycleError::PrematureDispatch(what))
    }

    fn dispatch_lifecycle(&self, message: SystemMessage) -> Result<(), LifecycleError> {
        self.ensure_ready(message.name())?;
        self.deliver(SYSTEM_CHANNEL, &message.to_string())?;
        Ok(())
    }

    fn check_system_message(&self, text: &str) -> Result<(), BridgeError> {
        match SystemMessage::parse(text) {
            Some(message @ (SystemMessage::Pause { .. } | SystemMessage::Resume)) => {
                if self.is_ready() {
                    return Ok(());
                }
                warn!(
                    message = message.name(),
                    "Embedded runtime not ready, refusing lifecycle dispatch"
                );
                Err(BridgeError::NotReady(message.name()))
            }
            _ => {
                warn!(text = %text, "Refusing system message not sent by the host");
                Err(BridgeError::InvalidSystemMessage(text.to_string()))
            }
        }
    }

    fn deliver(&self, channel: &str, text: &str) -> Result<(), BridgeError> {
        let ctx = self.inner.context().ok_or(BridgeError::RuntimeNotRunning)?;
        ctx.notify(channel, text);
        Ok(())
    }
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("running", &self.is_running())
            .field("ready", &self.is_ready())
            .field("attachments", &self.attachment_stats())
            .finish()
    }
}

/// Pending pause started by [`HostBridge::begin_pause`].
#[derive(Debug)]
pub struct PauseTicket {
    id: String,
    done: oneshot::Receiver<()>,
}

impl PauseTicket {
    pub fn event_id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Result<(), LifecycleError> {
        self.done
            .await
            .map_err(|_| LifecycleError::Abandoned(self.id))
    }

    /// Blocking variant of [`wait`](Self::wait). Must not be called from
    /// inside an async runtime.
    pub fn wait_blocking(self) -> Result<(), LifecycleError> {
        self.done
            .blocking_recv()
            .map_err(|_| LifecycleError::Abandoned(self.id))
    }
}

/// Handle to a runtime started with [`HostBridge::spawn_runtime`].
pub struct RuntimeThread {
    host: HostBridge,
    handle: Option<thread::JoinHandle<Result<i32, BridgeError>>>,
}

impl RuntimeThread {
    /// Wait for the runtime to exit and return its exit code.
    pub fn join(mut self) -> Result<i32, BridgeError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| BridgeError::ThreadPanic)?,
            None => Err(BridgeError::RuntimeNotRunning),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|handle| handle.is_finished())
    }
}

impl Drop for RuntimeThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.host.stop_runtime();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attach::InProcessVm;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn host() -> HostBridge {
        HostBridge::new(Arc::new(InProcessVm::new()), &BridgeConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = BridgeConfig::default();
        config.attach.limit = 0;
        assert!(matches!(
            HostBridge::new(Arc::new(InProcessVm::new()), &config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_send_without_runtime() {
        let host = host();
        assert!(matches!(
            host.send_message("_EVENTS_", "x"),
            Err(BridgeError::RuntimeNotRunning)
        ));
    }

    #[test]
    fn test_lifecycle_rejected_before_ready() {
        let host = host();
        assert!(matches!(
            host.pause(None),
            Err(LifecycleError::PrematureDispatch("pause"))
        ));
        assert!(matches!(
            host.resume(),
            Err(LifecycleError::PrematureDispatch("resume"))
        ));
        assert!(matches!(
            host.begin_pause(),
            Err(LifecycleError::PrematureDispatch("pause"))
        ));
        assert!(host.inner.pending.is_empty());
    }

    #[test]
    fn test_raw_system_send_gated_before_ready() {
        let host = host();
        let pauses = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(Mutex::new(Vec::new()));

        let observer = host.clone();
        let seen = pauses.clone();
        let sink = results.clone();
        let runtime = move |request: StartRequest| {
            let seen = seen.clone();
            request.bridge.system().on_pause(move |lock| {
                seen.fetch_add(1, Ordering::SeqCst);
                lock.release();
            });

            let mut results = sink.lock();
            results.push(observer.send_message(SYSTEM_CHANNEL, "pause|x"));
            results.push(observer.send_message(SYSTEM_CHANNEL, "resume"));
            results.push(observer.send_message(SYSTEM_CHANNEL, "ready-for-app-events"));
            request.bridge.event_loop().run_pending();
            0
        };

        host.start_runtime(&runtime, StartOptions::default()).unwrap();

        assert_eq!(pauses.load(Ordering::SeqCst), 0);
        let results = results.lock();
        assert!(matches!(results[0], Err(BridgeError::NotReady("pause"))));
        assert!(matches!(results[1], Err(BridgeError::NotReady("resume"))));
        assert!(matches!(
            &results[2],
            Err(BridgeError::InvalidSystemMessage(text)) if text == "ready-for-app-events"
        ));
    }

    #[test]
    fn test_raw_system_send_after_ready() {
        let host = host();
        let pauses = Arc::new(AtomicUsize::new(0));
        let refused = Arc::new(Mutex::new(None));

        let observer = host.clone();
        let seen = pauses.clone();
        let sink = refused.clone();
        let runtime = move |request: StartRequest| {
            let seen = seen.clone();
            request.bridge.system().on_pause(move |lock| {
                seen.fetch_add(1, Ordering::SeqCst);
                lock.release();
            });
            request.bridge.signal_ready().unwrap();

            observer.send_message(SYSTEM_CHANNEL, "pause|x").unwrap();
            *sink.lock() = Some(observer.send_message(SYSTEM_CHANNEL, "release-pause-event|x"));
            request.bridge.event_loop().run_pending();
            0
        };

        host.start_runtime(&runtime, StartOptions::default()).unwrap();

        assert_eq!(pauses.load(Ordering::SeqCst), 1);
        assert!(matches!(
            refused.lock().take(),
            Some(Err(BridgeError::InvalidSystemMessage(_)))
        ));
    }

    #[test]
    fn test_start_runtime_passes_request() {
        let host = host();
        host.register_data_dir("/data/app");
        let seen = Arc::new(Mutex::new(None));

        let sink = seen.clone();
        let runtime = move |request: StartRequest| {
            *sink.lock() = Some((
                request.argv.iter().map(str::to_string).collect::<Vec<_>>(),
                request.module_path.clone(),
                request.bridge.data_dir(),
            ));
            7
        };

        let options = StartOptions {
            args: vec!["node".into(), "main.js".into()],
            module_path: "/opt/modules".into(),
            redirect_output: false,
        };
        assert_eq!(host.start_runtime(&runtime, options).unwrap(), 7);

        let (args, module_path, data_dir) = seen.lock().take().unwrap();
        assert_eq!(args, vec!["node", "main.js"]);
        assert_eq!(module_path, "/opt/modules");
        assert_eq!(data_dir, Some(PathBuf::from("/data/app")));
        assert!(!host.is_running());
    }

    #[test]
    fn test_nested_start_is_rejected() {
        let host = host();
        let nested = Arc::new(Mutex::new(None));

        let inner_host = host.clone();
        let result = nested.clone();
        let runtime = move |_: StartRequest| {
            let noop = |_: StartRequest| 0;
            *result.lock() = Some(inner_host.start_runtime(&noop, StartOptions::default()));
            0
        };

        host.start_runtime(&runtime, StartOptions::default()).unwrap();
        assert!(matches!(
            nested.lock().take(),
            Some(Err(BridgeError::AlreadyRunning))
        ));
    }

    #[test]
    fn test_ready_signal_and_host_dispatch() {
        let host = host();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = received.clone();
        host.register_channel(
            "data",
            Arc::new(move |_: &str, text: &str| sink.lock().push(text.to_string())),
        );

        let observer = host.clone();
        let ready_seen = Arc::new(AtomicUsize::new(0));
        let ready_counter = ready_seen.clone();
        let runtime = move |request: StartRequest| {
            request.bridge.signal_ready().unwrap();
            if observer.is_ready() {
                ready_counter.fetch_add(1, Ordering::SeqCst);
            }
            request.bridge.channel("data").post("tick", [1]).unwrap();
            request.bridge.send_message("unknown", "dropped").unwrap();
            0
        };

        host.start_runtime(&runtime, StartOptions::default()).unwrap();

        assert_eq!(ready_seen.load(Ordering::SeqCst), 1);
        assert_eq!(
            *received.lock(),
            vec![r#"{"event":"tick","payload":[1]}"#.to_string()]
        );
        // Readiness is reset once the runtime exits.
        assert!(!host.is_ready());
    }

    #[test]
    fn test_release_for_unknown_event_is_ignored() {
        let host = host();
        let (tx, _rx) = oneshot::channel();
        host.inner.pending.insert("known".to_string(), tx);

        host.inner.handle_system("release-pause-event|other");
        host.inner.handle_system("release-pause-event");
        assert_eq!(host.inner.pending.len(), 1);

        host.inner.handle_system("release-pause-event|known");
        assert!(host.inner.pending.is_empty());
    }

    #[test]
    fn test_system_observer_sees_lifecycle_traffic() {
        let host = host();
        // No observer registered: handled without complaint.
        host.inner.handle_system("ready-for-app-events");
        assert!(host.is_ready());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        host.register_channel(
            SYSTEM_CHANNEL,
            Arc::new(move |_: &str, text: &str| sink.lock().push(text.to_string())),
        );
        host.inner.handle_system("release-pause-event|x");
        assert_eq!(*seen.lock(), vec!["release-pause-event|x".to_string()]);
    }

    #[tokio::test]
    async fn test_abandoned_ticket() {
        let (tx, rx) = oneshot::channel::<()>();
        drop(tx);
        let ticket = PauseTicket {
            id: "gone".to_string(),
            done: rx,
        };
        assert!(matches!(
            ticket.wait().await,
            Err(LifecycleError::Abandoned(id)) if id == "gone"
        ));
    }

    #[test]
    fn test_abi_name() {
        assert_eq!(host().abi_name(), platform::abi_name());
    }
}
