//! One-shot completion timer for an in-flight query.
//!
//! Runs its expiry callback once the budget elapses unless cancelled first.
//! Dropping the timer cancels it.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub struct CompletionTimer {
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl CompletionTimer {
    /// Arm a timer for `budget_ms` milliseconds. Negative budgets fire
    /// immediately. Returns `None` outside a tokio runtime, in which case
    /// `on_expiry` is never called.
    pub fn start<F>(budget_ms: i64, on_expiry: F) -> Option<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let runtime = Handle::try_current().ok()?;
        let budget = Duration::from_millis(budget_ms.max(0) as u64);
        let (cancel, cancelled) = oneshot::channel::<()>();
        let handle = runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(budget) => on_expiry(),
                _ = cancelled => {
                    tracing::trace!("Completion timer cancelled");
                }
            }
        });
        Some(Self {
            cancel: Some(cancel),
            handle,
        })
    }

    /// Stop the timer. A callback already running is not interrupted.
    pub fn cancel(mut self) {
        self.fire_cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn fire_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

impl Drop for CompletionTimer {
    fn drop(&mut self) {
        self.fire_cancel();
    }
}
