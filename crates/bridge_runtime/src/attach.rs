//! Thread attachment cache.
//!
//! Native threads that call back into the host runtime need an execution
//! environment handle first. Looking one up, and attaching the thread when it
//! has none, is expensive relative to the message itself, so every thread keeps
//! its handle in thread-local storage after the first crossing.
//!
//! The cache only accounts for threads it attached itself:
//! - A thread that was already attached by someone else is cached but never
//!   counted and never detached here.
//! - A thread attached by the cache counts against the pool limit and is
//!   detached automatically when it exits (the thread-local record's `Drop`
//!   is the exit hook).

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::BridgeError;

/// Default pool capacity.
pub const DEFAULT_ATTACH_LIMIT: usize = 32;

/// Default fraction of the limit at which pool pressure is logged.
pub const DEFAULT_WARN_RATIO: f64 = 0.8;

/// Opaque execution-environment handle for one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvHandle(usize);

impl EnvHandle {
    pub fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> usize {
        self.0
    }
}

/// Error reported by the host VM's attach primitive.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct VmError(String);

impl VmError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result of asking the host VM for the calling thread's environment.
#[derive(Debug)]
pub enum EnvLookup {
    /// The thread is already attached.
    Attached(EnvHandle),
    /// The thread is not attached.
    Detached,
    /// The lookup itself failed.
    Failed(VmError),
}

/// Host VM primitives needed to attach native threads.
///
/// Every method acts on the *calling* thread.
pub trait HostVm: Send + Sync + 'static {
    /// Look up the calling thread's environment without attaching it.
    fn current_env(&self) -> EnvLookup;

    /// Attach the calling thread and return its environment.
    fn attach_current_thread(&self) -> Result<EnvHandle, VmError>;

    /// Detach the calling thread, which was attached as `handle`.
    ///
    /// May run from a thread-local destructor during thread exit.
    fn detach_current_thread(&self, handle: EnvHandle);
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttachmentStats {
    /// Threads currently attached by the cache
    pub count: usize,
    /// Highest `count` ever observed
    pub peak: usize,
    /// Pool capacity
    pub limit: usize,
}

struct Pool {
    vm: Arc<dyn HostVm>,
    count: AtomicUsize,
    peak: AtomicUsize,
    limit: usize,
    warn_at: usize,
}

/// One thread's cached handle. Dropping it releases the attachment.
struct AttachmentRecord {
    cache_id: u64,
    thread_id: ThreadId,
    handle: EnvHandle,
    acquired_by_cache: bool,
    pool: Arc<Pool>,
}

impl Drop for AttachmentRecord {
    fn drop(&mut self) {
        if !self.acquired_by_cache {
            return;
        }

        self.pool.vm.detach_current_thread(self.handle);
        let remaining = self.pool.count.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(
            thread = ?self.thread_id,
            remaining,
            peak = self.pool.peak.load(Ordering::Acquire),
            "Thread detached"
        );
    }
}

thread_local! {
    static ATTACHMENTS: RefCell<Vec<AttachmentRecord>> = const { RefCell::new(Vec::new()) };
}

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Bounded, per-thread cache of host environment handles.
///
/// Cloning is cheap; clones share the same pool and thread-local entries.
#[derive(Clone)]
pub struct AttachmentCache {
    id: u64,
    pool: Arc<Pool>,
}

impl AttachmentCache {
    /// Create a cache with the default pressure warning ratio.
    pub fn new(vm: Arc<dyn HostVm>, limit: usize) -> Self {
        Self::with_warn_ratio(vm, limit, DEFAULT_WARN_RATIO)
    }

    pub fn with_warn_ratio(vm: Arc<dyn HostVm>, limit: usize, warn_ratio: f64) -> Self {
        let warn_at = ((limit as f64) * warn_ratio).ceil().max(1.0) as usize;
        Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            pool: Arc::new(Pool {
                vm,
                count: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                limit,
                warn_at,
            }),
        }
    }

    /// Return a valid environment handle for the calling thread.
    pub fn acquire(&self) -> Result<EnvHandle, BridgeError> {
        if let Some(handle) = self.cached() {
            return Ok(handle);
        }

        let thread_id = thread::current().id();

        match self.pool.vm.current_env() {
            EnvLookup::Attached(handle) => {
                // Attached by someone else: cache it, never release it.
                self.store(handle, false);
                return Ok(handle);
            }
            EnvLookup::Failed(err) => {
                error!(thread = ?thread_id, error = %err, "Failed to look up thread environment");
                return Err(BridgeError::AttachmentFailed(err));
            }
            EnvLookup::Detached => {}
        }

        let count = self.reserve(thread_id)?;

        let handle = match self.pool.vm.attach_current_thread() {
            Ok(handle) => handle,
            Err(err) => {
                self.pool.count.fetch_sub(1, Ordering::AcqRel);
                error!(thread = ?thread_id, error = %err, "Failed to attach thread");
                return Err(BridgeError::AttachmentFailed(err));
            }
        };

        self.raise_peak(count);
        self.store(handle, true);

        let limit = self.pool.limit;
        info!(
            thread = ?thread_id,
            count,
            peak = self.pool.peak.load(Ordering::Acquire),
            "Thread attached"
        );
        if count >= self.pool.warn_at {
            warn!(count, limit, "High thread attachment count");
        }

        Ok(handle)
    }

    /// Release the calling thread's record, detaching it if this cache
    /// attached it. Returns whether a record existed.
    ///
    /// Threads normally never call this; their record is released on exit.
    pub fn release(&self) -> bool {
        let record = ATTACHMENTS
            .try_with(|records| {
                let mut records = records.borrow_mut();
                records
                    .iter()
                    .position(|r| r.cache_id == self.id)
                    .map(|index| records.swap_remove(index))
            })
            .ok()
            .flatten();

        // Dropped outside the borrow.
        record.is_some()
    }

    /// Whether the calling thread already has a cached handle.
    pub fn is_cached(&self) -> bool {
        self.cached().is_some()
    }

    pub fn stats(&self) -> AttachmentStats {
        AttachmentStats {
            count: self.pool.count.load(Ordering::Acquire),
            peak: self.pool.peak.load(Ordering::Acquire),
            limit: self.pool.limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.pool.limit
    }

    fn cached(&self) -> Option<EnvHandle> {
        ATTACHMENTS
            .try_with(|records| {
                records
                    .borrow()
                    .iter()
                    .find(|r| r.cache_id == self.id)
                    .map(|r| r.handle)
            })
            .ok()
            .flatten()
    }

    fn store(&self, handle: EnvHandle, acquired_by_cache: bool) {
        let record = AttachmentRecord {
            cache_id: self.id,
            thread_id: thread::current().id(),
            handle,
            acquired_by_cache,
            pool: Arc::clone(&self.pool),
        };

        // During thread teardown the slot is gone; the record drops right away.
        if ATTACHMENTS
            .try_with(|records| records.borrow_mut().push(record))
            .is_err()
        {
            debug!("Thread-local storage unavailable, attachment not cached");
        }
    }

    /// Claim a pool slot, failing without side effects when the pool is full.
    fn reserve(&self, thread_id: ThreadId) -> Result<usize, BridgeError> {
        let limit = self.pool.limit;
        self.pool
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < limit).then_some(count + 1)
            })
            .map(|previous| previous + 1)
            .map_err(|_| {
                warn!(
                    thread = ?thread_id,
                    limit,
                    "Thread attachment limit reached, refusing to attach thread"
                );
                BridgeError::AttachmentRefused { limit }
            })
    }

    fn raise_peak(&self, count: usize) {
        let mut peak = self.pool.peak.load(Ordering::Acquire);
        while count > peak {
            match self.pool.peak.compare_exchange_weak(
                peak,
                count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => peak = actual,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process VM
// ─────────────────────────────────────────────────────────────────────────────

/// A [`HostVm`] for hosts that live entirely inside this process.
///
/// It keeps a table of attached threads and hands out sequential handles.
#[derive(Default)]
pub struct InProcessVm {
    attached: DashMap<ThreadId, EnvHandle>,
    next_handle: AtomicUsize,
    attach_calls: AtomicUsize,
    detach_calls: AtomicUsize,
}

impl InProcessVm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of threads currently attached.
    pub fn attached_threads(&self) -> usize {
        self.attached.len()
    }

    pub fn attach_calls(&self) -> usize {
        self.attach_calls.load(Ordering::SeqCst)
    }

    pub fn detach_calls(&self) -> usize {
        self.detach_calls.load(Ordering::SeqCst)
    }
}

impl HostVm for InProcessVm {
    fn current_env(&self) -> EnvLookup {
        match self.attached.get(&thread::current().id()) {
            Some(handle) => EnvLookup::Attached(*handle),
            None => EnvLookup::Detached,
        }
    }

    fn attach_current_thread(&self) -> Result<EnvHandle, VmError> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        let handle = *self
            .attached
            .entry(thread::current().id())
            .or_insert_with(|| EnvHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1));
        Ok(handle)
    }

    fn detach_current_thread(&self, handle: EnvHandle) {
        self.detach_calls.fetch_add(1, Ordering::SeqCst);
        self.attached.retain(|_, attached| *attached != handle);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
