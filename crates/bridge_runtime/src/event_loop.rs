//! Deferred-task queue for the embedded runtime thread.
//!
//! Incoming messages are never handled inside the call that delivered them.
//! Receivers queue a task here and the runtime thread runs it on a later
//! turn, in submission order.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum LoopMessage {
    Task(Task),
    Stop,
}

/// Single-consumer task queue driven by the embedded runtime thread.
pub struct EventLoop {
    name: String,
    tx: mpsc::UnboundedSender<LoopMessage>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<LoopMessage>>>,
    stopped: AtomicBool,
}

impl EventLoop {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            tx,
            rx: Mutex::new(Some(rx)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Queue `task` for a later turn. Returns `false` once the loop is stopped.
    pub fn defer(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.send(LoopMessage::Task(Box::new(task))).is_ok()
    }

    /// Run every task queued so far without blocking.
    ///
    /// Returns the number of tasks run. Does nothing while [`run`](Self::run)
    /// owns the queue.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let message = {
                let mut rx = self.rx.lock();
                let Some(rx) = rx.as_mut() else {
                    return ran;
                };
                match rx.try_recv() {
                    Ok(message) => message,
                    Err(_) => return ran,
                }
            };

            match message {
                LoopMessage::Task(task) => {
                    self.run_task(task);
                    ran += 1;
                }
                LoopMessage::Stop => return ran,
            }
        }
    }

    /// Block the calling thread, running tasks until [`stop`](Self::stop).
    ///
    /// Tasks run inside a `LocalSet`, so they may `spawn_local` follow-up
    /// work onto the same thread.
    pub fn run(&self) -> io::Result<()> {
        let Some(mut rx) = self.rx.lock().take() else {
            return Err(io::Error::other(format!(
                "event loop {} is already running",
                self.name
            )));
        };

        debug!(name = %self.name, "Event loop started");

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = LocalSet::new();

        local.block_on(&rt, async {
            while let Some(message) = rx.recv().await {
                match message {
                    LoopMessage::Task(task) => {
                        self.run_task(task);
                        tokio::task::yield_now().await;
                    }
                    LoopMessage::Stop => break,
                }
            }
        });

        *self.rx.lock() = Some(rx);
        debug!(name = %self.name, "Event loop stopped");
        Ok(())
    }

    /// Stop the loop. Tasks still queued are discarded.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(LoopMessage::Stop);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolve once every task deferred before this call has run.
    pub async fn idle(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if !self.defer(move || {
            let _ = done_tx.send(());
        }) {
            return;
        }
        // An error means the loop stopped first.
        let _ = done_rx.await;
    }

    fn run_task(&self, task: Task) {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(name = %self.name, "Deferred task panicked");
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_tasks_are_deferred_and_ordered() {
        let event_loop = EventLoop::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            assert!(event_loop.defer(move || order.lock().push(i)));
        }
        assert!(order.lock().is_empty());

        assert_eq!(event_loop.run_pending(), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(event_loop.run_pending(), 0);
    }

    #[test]
    fn test_panicking_task_does_not_stop_queue() {
        let event_loop = EventLoop::new("test");
        let calls = Arc::new(AtomicUsize::new(0));

        event_loop.defer(|| panic!("listener failure"));
        let counter = calls.clone();
        event_loop.defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(event_loop.run_pending(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_until_stop() {
        let event_loop = Arc::new(EventLoop::new("test"));
        let calls = Arc::new(AtomicUsize::new(0));

        let runner = {
            let event_loop = event_loop.clone();
            thread::spawn(move || event_loop.run())
        };

        for _ in 0..5 {
            let counter = calls.clone();
            event_loop.defer(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        let stopper = event_loop.clone();
        event_loop.defer(move || stopper.stop());

        runner.join().unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(event_loop.is_stopped());
        assert!(!event_loop.defer(|| {}));
    }

    #[test]
    fn test_tasks_can_spawn_local() {
        let event_loop = Arc::new(EventLoop::new("test"));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let stopper = event_loop.clone();
        event_loop.defer(move || {
            tokio::task::spawn_local(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                stopper.stop();
            });
        });

        event_loop.run().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_waits_for_earlier_tasks() {
        let event_loop = Arc::new(EventLoop::new("test"));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        event_loop.defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let runner = {
            let event_loop = event_loop.clone();
            thread::spawn(move || event_loop.run())
        };

        event_loop.idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        event_loop.stop();
        runner.join().unwrap().unwrap();

        // Returns immediately once stopped.
        event_loop.idle().await;
    }
}
