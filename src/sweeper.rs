//! Background timeout sweeping.
//!
//! Several sweepers may run against the same service (or the same database
//! through separate services); each timeout is applied exactly once because
//! `check_timeout` only acts on the commit it wins.
use crate::service::SettlementService;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct TimeoutSweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl TimeoutSweeper {
    /// Sweep immediately, then every `interval` until stopped.
    pub fn spawn(service: Arc<SettlementService>, interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel();
        let handle = thread::spawn(move || {
            loop {
                match service.sweep_timeouts() {
                    Ok(expired) if !expired.is_empty() => {
                        tracing::info!(count = expired.len(), "timeout sweep expired transactions");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "timeout sweep failed"),
                }
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            tracing::debug!("timeout sweeper stopped");
        });
        Self { stop, handle }
    }

    /// Signal the thread and wait for the sweep in progress to finish.
    pub fn stop(self) -> thread::Result<()> {
        let _ = self.stop.send(());
        self.handle.join()
    }
}
