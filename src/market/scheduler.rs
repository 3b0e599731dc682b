use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstRun {
    Immediately,
    AfterPeriod,
}

/// Owns every background task of a session. Tasks run under a scope token; the
/// root token cancels them all, a child scope cancels just its own group.
#[derive(Debug, Default)]
pub struct TaskScheduler {
    root: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Runs `job` every `period` until `scope` is cancelled. A run that overlaps
    /// cancellation is abandoned mid-flight.
    pub fn every<F, Fut>(
        &self,
        label: &'static str,
        period: Duration,
        first_run: FirstRun,
        scope: CancellationToken,
        mut job: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let start = match first_run {
            FirstRun::Immediately => Instant::now(),
            FirstRun::AfterPeriod => Instant::now() + period,
        };
        self.spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = scope.cancelled() => break,
                            _ = job() => {}
                        }
                    }
                }
            }
            tracing::debug!(task = label, "periodic task stopped");
        });
    }

    pub fn once<Fut>(&self, label: &'static str, scope: CancellationToken, job: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {
                    tracing::debug!(task = label, "one-shot task cancelled");
                }
                _ = job => {}
            }
        });
    }

    /// Cancels every scope and waits for the tasks to wind down.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(error) = handle.await {
                if error.is_panic() {
                    tracing::error!(%error, "background task panicked");
                }
            }
        }
    }

    fn spawn<Fut>(&self, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.root.is_cancelled() {
            return;
        }
        let handle = tokio::spawn(task);
        let mut handles = self.handles.lock();
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
    }
}
