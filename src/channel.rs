use std::cell::Cell;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::decoder::DecodedBody;
use crate::error::EngineError;

/// One element of the per-request notification sequence.
///
/// For a task that completes normally the consumer observes
/// `Start, Progress*, Retry*, (Success | Failure), Finish`; `Cancel` may
/// truncate the sequence at any point and is delivered at most once.
#[derive(Debug)]
pub enum Notification {
    Start,
    Progress {
        bytes_done: u64,
        bytes_total: u64,
    },
    Success {
        status: u16,
        headers: HeaderMap,
        body: DecodedBody,
    },
    Failure {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
        error: EngineError,
    },
    Retry {
        attempt: usize,
    },
    Cancel,
    Finish,
}

/// Caller-supplied notification consumer.
///
/// Only the terminal callbacks are mandatory; the rest default to no-ops.
/// A panic raised inside any callback is caught at the delivery boundary,
/// logged, and escalated through [`ResponseHandler::on_handler_panic`]; it
/// never unwinds into the worker or delivery thread.
pub trait ResponseHandler: Send + Sync + 'static {
    fn on_start(&self) {}
    fn on_progress(&self, _bytes_done: u64, _bytes_total: u64) {}
    fn on_success(&self, status: u16, headers: &HeaderMap, body: &DecodedBody);
    fn on_failure(&self, status: u16, headers: &HeaderMap, body: &[u8], error: &EngineError);
    fn on_retry(&self, _attempt: usize) {}
    fn on_cancel(&self) {}
    fn on_finish(&self) {}
    fn on_handler_panic(&self, _error: &EngineError) {}
}

type DeliveryJob = Box<dyn FnOnce() + Send>;

thread_local! {
    static IN_DELIVERY: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread is executing a delivery-loop job. Used to
/// keep cancellation sweeps off the delivery thread.
pub(crate) fn on_delivery_thread() -> bool {
    IN_DELIVERY.with(|flag| flag.get())
}

struct DeliveryFlagGuard;

impl DeliveryFlagGuard {
    fn enter() -> Self {
        IN_DELIVERY.with(|flag| flag.set(true));
        Self
    }
}

impl Drop for DeliveryFlagGuard {
    fn drop(&mut self) {
        IN_DELIVERY.with(|flag| flag.set(false));
    }
}

/// Sending half of a dedicated delivery context: a queue plus a single
/// consuming loop bound to one logical thread. Channels constructed with
/// [`CallbackChannel::with_context`] marshal every notification onto the
/// loop, preserving per-request FIFO order.
#[derive(Clone)]
pub struct DeliveryContext {
    sender: mpsc::UnboundedSender<DeliveryJob>,
}

impl DeliveryContext {
    /// Creates a context and the loop that consumes it. The loop must be
    /// driven (via [`DeliveryLoop::run`] or [`DeliveryLoop::run_blocking`])
    /// for notifications to be observed.
    pub fn new() -> (DeliveryContext, DeliveryLoop) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (DeliveryContext { sender }, DeliveryLoop { receiver })
    }

    /// True once the consuming loop has been dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn post(&self, job: DeliveryJob) -> Result<(), DeliveryJob> {
        self.sender.send(job).map_err(|rejected| rejected.0)
    }
}

/// Consuming half of a [`DeliveryContext`]. Runs until every context clone
/// and every channel bound to it has been dropped.
pub struct DeliveryLoop {
    receiver: mpsc::UnboundedReceiver<DeliveryJob>,
}

impl DeliveryLoop {
    pub async fn run(mut self) {
        while let Some(job) = self.receiver.recv().await {
            let _guard = DeliveryFlagGuard::enter();
            job();
        }
    }

    /// Blocking variant for a dedicated consumer thread outside the runtime.
    pub fn run_blocking(mut self) {
        while let Some(job) = self.receiver.blocking_recv() {
            let _guard = DeliveryFlagGuard::enter();
            job();
        }
    }
}

#[derive(Clone)]
enum DeliveryMode {
    Synchronous,
    PoolThread { queue: mpsc::UnboundedSender<Notification> },
    Context { context: DeliveryContext },
}

/// Ordered notification delivery for one submitted request.
///
/// Three modes, all preserving per-request notification order:
/// - [`CallbackChannel::synchronous`]: delivered inline on whatever thread
///   produced the notification (a pool worker, or a canceller).
/// - [`CallbackChannel::pool_thread`]: queued and drained by a task spawned
///   on the runtime; no dedicated delivery loop required.
/// - [`CallbackChannel::with_context`]: queued onto a caller-driven
///   [`DeliveryContext`] loop, for thread-affine consumers.
#[derive(Clone)]
pub struct CallbackChannel {
    handler: Arc<dyn ResponseHandler>,
    mode: DeliveryMode,
}

impl CallbackChannel {
    pub fn synchronous(handler: impl ResponseHandler) -> Self {
        Self {
            handler: Arc::new(handler),
            mode: DeliveryMode::Synchronous,
        }
    }

    /// Queued delivery drained on the worker pool itself.
    ///
    /// Must be constructed on a runtime thread; without one the channel is
    /// coerced to synchronous mode with a logged warning.
    pub fn pool_thread(handler: impl ResponseHandler) -> Self {
        let handler: Arc<dyn ResponseHandler> = Arc::new(handler);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let (queue, mut receiver) = mpsc::unbounded_channel();
                let drain_handler = Arc::clone(&handler);
                runtime.spawn(async move {
                    while let Some(notification) = receiver.recv().await {
                        dispatch(&drain_handler, notification);
                    }
                });
                Self {
                    handler,
                    mode: DeliveryMode::PoolThread { queue },
                }
            }
            Err(_) => {
                warn!("no runtime available for pool-thread delivery; forcing synchronous mode");
                Self {
                    handler,
                    mode: DeliveryMode::Synchronous,
                }
            }
        }
    }

    /// Queued delivery on a dedicated context. Submitting a channel whose
    /// context is already closed fails fast from `Dispatcher::send`; a
    /// context closed mid-flight falls back to inline delivery with a
    /// logged warning.
    pub fn with_context(handler: impl ResponseHandler, context: &DeliveryContext) -> Self {
        Self {
            handler: Arc::new(handler),
            mode: DeliveryMode::Context {
                context: context.clone(),
            },
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        match &self.mode {
            DeliveryMode::Context { context } => context.is_closed(),
            _ => false,
        }
    }

    pub(crate) fn send(&self, notification: Notification) {
        match &self.mode {
            DeliveryMode::Synchronous => dispatch(&self.handler, notification),
            DeliveryMode::PoolThread { queue } => {
                if let Err(rejected) = queue.send(notification) {
                    dispatch(&self.handler, rejected.0);
                }
            }
            DeliveryMode::Context { context } => {
                let handler = Arc::clone(&self.handler);
                let job = Box::new(move || dispatch(&handler, notification));
                if let Err(job) = context.post(job) {
                    warn!("delivery context closed; delivering notification inline");
                    job();
                }
            }
        }
    }
}

fn dispatch(handler: &Arc<dyn ResponseHandler>, notification: Notification) {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| match &notification {
        Notification::Start => handler.on_start(),
        Notification::Progress {
            bytes_done,
            bytes_total,
        } => handler.on_progress(*bytes_done, *bytes_total),
        Notification::Success {
            status,
            headers,
            body,
        } => handler.on_success(*status, headers, body),
        Notification::Failure {
            status,
            headers,
            body,
            error,
        } => handler.on_failure(*status, headers, body, error),
        Notification::Retry { attempt } => handler.on_retry(*attempt),
        Notification::Cancel => handler.on_cancel(),
        Notification::Finish => handler.on_finish(),
    }));
    if let Err(payload) = outcome {
        let message = panic_message(payload);
        error!(%message, "user notification handler panicked");
        let escalation = EngineError::HandlerPanic { message };
        let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
            handler.on_handler_panic(&escalation);
        }));
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
