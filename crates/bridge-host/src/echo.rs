//! Demo embedded runtime.
//!
//! Echoes every `message` back to the host, releases pauses from a worker
//! thread and posts heartbeats from several native threads so the attachment
//! pool sees real traffic.

use std::io::Write;
use std::thread;
use std::time::Duration;

use bridge_runtime::{EmbeddedRuntime, StartRequest};
use serde_json::{Value, json};
use tracing::{error, info};

pub struct EchoRuntime {
    workers: usize,
}

impl EchoRuntime {
    pub fn new(workers: usize) -> Self {
        Self { workers }
    }
}

impl EmbeddedRuntime for EchoRuntime {
    fn start(&self, request: StartRequest) -> i32 {
        let StartRequest {
            argv,
            module_path,
            mut output,
            bridge,
        } = request;

        let _ = writeln!(
            output.stdout,
            "echo runtime starting: argv={:?} module_path={}",
            argv.iter().collect::<Vec<_>>(),
            module_path
        );
        if let Some(dir) = bridge.data_dir() {
            let _ = writeln!(output.stdout, "data dir: {}", dir.display());
        }

        let events = bridge.events();
        let echo = events.clone();
        events.on("message", move |payload: &[Value]| {
            if let Err(err) = echo.post("echo", payload) {
                error!(error = %err, "Failed to echo message");
            }
        });

        let system = bridge.system();
        system.on_pause(|lock| {
            let lock = lock.clone();
            // Simulate flushing state off the runtime thread.
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                lock.release();
            });
        });
        system.on_resume(|| info!("Echo runtime resumed"));

        let heartbeats: Vec<_> = (0..self.workers)
            .map(|worker| {
                let events = bridge.events();
                thread::spawn(move || {
                    if let Err(err) = events.post("heartbeat", [json!({ "worker": worker })]) {
                        error!(worker, error = %err, "Failed to post heartbeat");
                    }
                })
            })
            .collect();
        for heartbeat in heartbeats {
            let _ = heartbeat.join();
        }

        if let Err(err) = bridge.signal_ready() {
            let _ = writeln!(output.stderr, "failed to signal readiness: {err}");
            return 1;
        }

        match bridge.run_event_loop() {
            Ok(()) => 0,
            Err(err) => {
                let _ = writeln!(output.stderr, "event loop failed: {err}");
                1
            }
        }
    }
}
