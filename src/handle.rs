use std::sync::Weak;

use crate::channel;
use crate::task::TaskState;

/// Non-owning cancellation token for one submitted request.
///
/// The handle never keeps the task alive: once the task has completed and
/// been reclaimed, every operation degrades safely (`cancel` returns false,
/// `is_finished`/`is_cancelled` return true, `tag` returns None).
#[derive(Clone)]
pub struct RequestHandle {
    state: Weak<TaskState>,
}

impl RequestHandle {
    pub(crate) fn new(state: Weak<TaskState>) -> Self {
        Self { state }
    }

    /// Attempts to cancel the request. With `interrupt` set, an in-flight
    /// transport attempt is aborted; otherwise the task merely stops at its
    /// next checkpoint.
    ///
    /// Returns false if the task was already finished or reclaimed. When
    /// invoked from a delivery-loop callback the cancellation runs off that
    /// thread and true is returned optimistically, since the outcome cannot
    /// be observed without blocking the loop.
    pub fn cancel(&self, interrupt: bool) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        if channel::on_delivery_thread() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        state.cancel(interrupt);
                    });
                }
                Err(_) => {
                    std::thread::spawn(move || {
                        state.cancel(interrupt);
                    });
                }
            }
            return true;
        }
        state.cancel(interrupt)
    }

    /// True once the task terminated for any reason, or was reclaimed.
    pub fn is_finished(&self) -> bool {
        match self.state.upgrade() {
            Some(state) => state.is_done(),
            None => true,
        }
    }

    /// True if the task was cancelled before completing normally, or was
    /// reclaimed.
    pub fn is_cancelled(&self) -> bool {
        match self.state.upgrade() {
            Some(state) => state.observe_cancelled(),
            None => true,
        }
    }

    pub fn tag(&self) -> Option<String> {
        self.state.upgrade().and_then(|state| state.tag())
    }

    pub fn set_tag(&self, tag: impl Into<String>) -> &Self {
        if let Some(state) = self.state.upgrade() {
            state.set_tag(Some(tag.into()));
        }
        self
    }

    /// A handle is swept from the owner registry once its task is cancelled,
    /// finished, or reclaimed.
    pub(crate) fn should_sweep(&self) -> bool {
        self.is_cancelled() || self.is_finished()
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestHandle")
            .field("live", &(self.state.strong_count() > 0))
            .finish()
    }
}
