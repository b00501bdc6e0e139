//! Per-instance scheduled task runner
//!
//! A [`ScheduledTask`] runs an async callback after an initial delay and then
//! periodically, until stopped or dropped. Runs never overlap: the next
//! period starts counting once the previous run has completed. The callback
//! receives the task's cancellation token so it can stop its own schedule.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct ScheduledTask {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawn the task on the current tokio runtime
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn start<F, Fut>(name: impl Into<String>, delay: Duration, period: Duration, mut task: F) -> Self
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_name = name.clone();

        debug!(task = %name, delay_ms = delay.as_millis(), period_ms = period.as_millis(), "Starting scheduled task");

        let handle = tokio::spawn(async move {
            let mut wait = delay;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                if token.is_cancelled() {
                    break;
                }
                trace!(task = %task_name, "Running scheduled task");
                task(token.clone()).await;
                wait = period;
            }
            trace!(task = %task_name, "Scheduled task stopped");
        });

        Self {
            name,
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop scheduling further runs; a run in progress completes
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!(task = %self.name, "Stopping scheduled task");
            self.cancel.cancel();
        }
    }

    /// True until stopped and the loop has exited
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
