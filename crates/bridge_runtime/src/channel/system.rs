use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::barrier::{LifecycleBarrier, PauseLock};
use super::{DeferredDispatcher, Inbound, ListenerId, SYSTEM_CHANNEL, Transport};
use crate::error::BridgeError;
use crate::event_loop::EventLoop;
use crate::registry::ChannelRegistry;

const READY: &str = "ready-for-app-events";
const PAUSE: &str = "pause";
const RESUME: &str = "resume";
const RELEASE_PAUSE: &str = "release-pause-event";

/// A plain-text lifecycle message on the `_SYSTEM_` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMessage {
    /// Embedded → host, sent once after bridge setup.
    Ready,
    /// Host → embedded.
    Pause { event_id: Option<String> },
    /// Host → embedded, no acknowledgment.
    Resume,
    /// Embedded → host, once every pause listener released its lock.
    ReleasePause { event_id: Option<String> },
}

impl SystemMessage {
    /// Parse wire text. An empty `|` suffix counts as no id.
    pub fn parse(text: &str) -> Option<Self> {
        let (kind, event_id) = match text.split_once('|') {
            Some((kind, id)) if !id.is_empty() => (kind, Some(id.to_string())),
            Some((kind, _)) => (kind, None),
            None => (text, None),
        };

        match kind {
            READY if event_id.is_none() => Some(Self::Ready),
            PAUSE => Some(Self::Pause { event_id }),
            RESUME if event_id.is_none() => Some(Self::Resume),
            RELEASE_PAUSE => Some(Self::ReleasePause { event_id }),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready => READY,
            Self::Pause { .. } => PAUSE,
            Self::Resume => RESUME,
            Self::ReleasePause { .. } => RELEASE_PAUSE,
        }
    }
}

impl fmt::Display for SystemMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pause {
                event_id: Some(id),
            }
            | Self::ReleasePause {
                event_id: Some(id),
            } => write!(f, "{}|{}", self.name(), id),
            _ => f.write_str(self.name()),
        }
    }
}

/// Callback for a pause event. Must eventually call [`PauseLock::release`].
pub type PauseListener = Arc<dyn Fn(&PauseLock) + Send + Sync>;

pub type ResumeListener = Arc<dyn Fn() + Send + Sync>;

struct SystemCore {
    pause_listeners: Mutex<Vec<(ListenerId, PauseListener)>>,
    resume_listeners: Mutex<Vec<(ListenerId, ResumeListener)>>,
    transport: Arc<dyn Transport>,
    ready_sent: AtomicBool,
}

impl SystemCore {
    fn handle_pause(&self, event_id: Option<String>) {
        let listeners: Vec<PauseListener> = self
            .pause_listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        debug!(listeners = listeners.len(), event_id = ?event_id, "Pause received");

        let reply = SystemMessage::ReleasePause {
            event_id: event_id.clone(),
        }
        .to_string();
        let transport = Arc::clone(&self.transport);
        let barrier = LifecycleBarrier::new(listeners.len(), move || {
            if let Err(err) = transport.send(SYSTEM_CHANNEL, &reply) {
                error!(error = %err, "Failed to send pause release");
            }
        });

        let event_id: Option<Arc<str>> = event_id.map(Arc::from);
        for listener in listeners {
            let lock = PauseLock::new(Arc::clone(&barrier), event_id.clone());
            if catch_unwind(AssertUnwindSafe(|| listener(&lock))).is_err() {
                error!(event_id = ?lock.event_id(), "Pause listener panicked, releasing its lock");
                lock.release();
            }
        }
    }

    fn handle_resume(&self) {
        let listeners: Vec<ResumeListener> = self
            .resume_listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        debug!(listeners = listeners.len(), "Resume received");
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(listener.as_ref())).is_err() {
                error!("Resume listener panicked");
            }
        }
    }
}

impl Inbound for SystemCore {
    fn receive(&self, text: String) {
        match SystemMessage::parse(&text) {
            Some(SystemMessage::Pause { event_id }) => self.handle_pause(event_id),
            Some(SystemMessage::Resume) => self.handle_resume(),
            Some(other) => {
                warn!(message = %other, "Unexpected system message direction, dropping");
            }
            None => warn!(text = %text, "Unknown system message, dropping"),
        }
    }
}

/// Lifecycle channel of the embedded side.
#[derive(Clone)]
pub struct SystemChannel {
    core: Arc<SystemCore>,
}

impl SystemChannel {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        registry: &ChannelRegistry,
        event_loop: &Arc<EventLoop>,
    ) -> Self {
        let core = Arc::new(SystemCore {
            pause_listeners: Mutex::new(Vec::new()),
            resume_listeners: Mutex::new(Vec::new()),
            transport,
            ready_sent: AtomicBool::new(false),
        });

        let dispatcher = DeferredDispatcher::new(Arc::downgrade(&core), Arc::downgrade(event_loop));
        registry.register(SYSTEM_CHANNEL, Arc::new(dispatcher));

        Self { core }
    }

    /// Register a pause listener. Each pause hands it a lock it must release.
    pub fn on_pause<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PauseLock) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.core.pause_listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn on_resume<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.core.resume_listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a pause or resume listener.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut pause = self.core.pause_listeners.lock();
        if let Some(index) = pause.iter().position(|(entry, _)| *entry == id) {
            pause.remove(index);
            return true;
        }
        drop(pause);

        let mut resume = self.core.resume_listeners.lock();
        if let Some(index) = resume.iter().position(|(entry, _)| *entry == id) {
            resume.remove(index);
            return true;
        }
        false
    }

    pub fn pause_listener_count(&self) -> usize {
        self.core.pause_listeners.lock().len()
    }

    pub fn resume_listener_count(&self) -> usize {
        self.core.resume_listeners.lock().len()
    }

    /// Tell the host the embedded side is ready for app events.
    ///
    /// Only the first successful call sends anything; later calls return
    /// `Ok(false)`.
    pub fn signal_ready(&self) -> Result<bool, BridgeError> {
        if self.core.ready_sent.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        if let Err(err) = self.core.transport.send(SYSTEM_CHANNEL, READY) {
            self.core.ready_sent.store(false, Ordering::SeqCst);
            return Err(err);
        }
        info!("Embedded runtime ready for app events");
        Ok(true)
    }

    pub(crate) fn clear_listeners(&self) {
        self.core.pause_listeners.lock().clear();
        self.core.resume_listeners.lock().clear();
    }
}

impl fmt::Debug for SystemChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemChannel")
            .field("pause_listeners", &self.pause_listener_count())
            .field("resume_listeners", &self.resume_listener_count())
            .finish()
    }
}
