use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::channel::{CallbackChannel, Notification};
use crate::decoder::DecodeOutcome;
use crate::error::{EngineError, TransportErrorKind};
use crate::request::Request;
use crate::retry::RetryPolicy;
use crate::transport::{PreparedRequest, Transport, TransportError};
use crate::util::{lock_unpoisoned, truncate_body};

#[derive(Default)]
struct NotifyState {
    cancel_notified: bool,
    terminal_sent: bool,
}

/// State shared between a running task, its handle, and cancellers.
///
/// Cancellation is cooperative: the flag is observed at checkpoints between
/// phases, and the token hard-aborts an in-flight transport call when the
/// canceller asks for interruption. At most one Cancel notification is ever
/// emitted, and none once a terminal notification has been sent.
pub(crate) struct TaskState {
    cancelled: AtomicBool,
    finished: AtomicBool,
    notify: Mutex<NotifyState>,
    abort: CancellationToken,
    tag: Mutex<Option<String>>,
    channel: CallbackChannel,
}

impl TaskState {
    pub(crate) fn new(channel: CallbackChannel, tag: Option<String>) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            notify: Mutex::new(NotifyState::default()),
            abort: CancellationToken::new(),
            tag: Mutex::new(tag),
            channel,
        }
    }

    /// Requests cancellation. Returns false if the task had already
    /// finished; true otherwise (best-effort: an attempt already past its
    /// last checkpoint may still complete).
    pub(crate) fn cancel(&self, interrupt: bool) -> bool {
        if self.finished.load(Ordering::Acquire) {
            return false;
        }
        self.cancelled.store(true, Ordering::Release);
        if interrupt {
            self.abort.cancel();
        }
        self.send_cancel_notification();
        true
    }

    /// Checkpoint read: reports the cancellation flag and, on the first
    /// cancelled observation, queues the single Cancel notification.
    pub(crate) fn observe_cancelled(&self) -> bool {
        let cancelled = self.cancelled.load(Ordering::Acquire);
        if cancelled {
            self.send_cancel_notification();
        }
        cancelled
    }

    fn send_cancel_notification(&self) {
        let should_send = {
            let mut notify = lock_unpoisoned(&self.notify);
            if !self.finished.load(Ordering::Acquire)
                && !notify.terminal_sent
                && self.cancelled.load(Ordering::Acquire)
                && !notify.cancel_notified
            {
                notify.cancel_notified = true;
                true
            } else {
                false
            }
        };
        if should_send {
            self.channel.send(Notification::Cancel);
        }
    }

    /// Claims the right to emit the terminal Success/Failure notification.
    /// Loses to a Cancel that was already notified, so a consumer never
    /// observes both.
    fn try_mark_terminal(&self) -> bool {
        let mut notify = lock_unpoisoned(&self.notify);
        if notify.cancel_notified {
            return false;
        }
        notify.terminal_sent = true;
        true
    }

    fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.observe_cancelled() || self.is_finished()
    }

    pub(crate) fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub(crate) fn tag(&self) -> Option<String> {
        lock_unpoisoned(&self.tag).clone()
    }

    pub(crate) fn set_tag(&self, tag: Option<String>) {
        *lock_unpoisoned(&self.tag) = tag;
    }
}

enum AttemptOutcome {
    /// A terminal Success or Failure notification was emitted.
    Delivered,
    /// Cancellation was observed; stop without further notifications.
    Cancelled,
}

struct AttemptFailure {
    kind: TransportErrorKind,
    request_sent: bool,
    fatal: bool,
    error: EngineError,
}

impl AttemptFailure {
    fn fatal(error: EngineError) -> Self {
        Self {
            kind: TransportErrorKind::OtherIo,
            request_sent: false,
            fatal: true,
            error,
        }
    }

    fn transport(error: TransportError, method: &Method, uri: &Uri) -> Self {
        Self {
            kind: error.kind,
            request_sent: error.request_sent,
            fatal: false,
            error: EngineError::Transport {
                kind: error.kind,
                method: method.clone(),
                uri: uri.to_string(),
                source: error.source,
            },
        }
    }

    fn decode(error: EngineError) -> Self {
        // A failed body read means the peer dropped mid-response, so it is
        // classified as no-response and retried under the default whitelist.
        // File write failures are local and final.
        let fatal = matches!(error, EngineError::FileWrite { .. });
        Self {
            kind: TransportErrorKind::NoResponse,
            request_sent: true,
            fatal,
            error,
        }
    }
}

/// The execution unit for one submitted request: one-shot pre-processing,
/// the transport attempt loop with retries, response post-processing, and
/// cancellation checkpoints between every phase.
pub(crate) struct RequestTask {
    state: Arc<TaskState>,
    request: Request,
    transport: Arc<dyn Transport>,
    retry_policy: RetryPolicy,
    channel: CallbackChannel,
    pre_processed: bool,
}

impl RequestTask {
    pub(crate) fn new(
        state: Arc<TaskState>,
        request: Request,
        transport: Arc<dyn Transport>,
        retry_policy: RetryPolicy,
        channel: CallbackChannel,
    ) -> Self {
        Self {
            state,
            request,
            transport,
            retry_policy,
            channel,
            pre_processed: false,
        }
    }

    pub(crate) async fn run(mut self) {
        if self.state.observe_cancelled() {
            return;
        }

        // Pre-processing runs exactly once per task.
        if !self.pre_processed {
            self.pre_processed = true;
            self.pre_process();
        }

        if self.state.observe_cancelled() {
            return;
        }
        self.channel.send(Notification::Start);
        if self.state.observe_cancelled() {
            return;
        }

        match self.execute_with_retries().await {
            Ok(AttemptOutcome::Cancelled) => return,
            Ok(AttemptOutcome::Delivered) => {}
            Err(error) => {
                if self.state.observe_cancelled() {
                    debug!(%error, "request failed after cancellation");
                    return;
                }
                if !self.state.try_mark_terminal() {
                    return;
                }
                self.channel.send(Notification::Failure {
                    status: 0,
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                    error,
                });
            }
        }

        // The terminal notification is out; a cancel arriving now is too
        // late to take effect and must not truncate the sequence.
        self.channel.send(Notification::Finish);
        self.post_process();
        self.state.mark_finished();
    }

    fn pre_process(&self) {
        debug!(method = %self.request.method, uri = %self.request.uri, "pre-processing request");
    }

    fn post_process(&self) {
        debug!(method = %self.request.method, uri = %self.request.uri, "request completed");
    }

    async fn execute_with_retries(&mut self) -> Result<AttemptOutcome, EngineError> {
        let body = self.request.body.materialize(&self.channel)?;
        let prepared = PreparedRequest {
            method: self.request.method.clone(),
            uri: self.request.uri.clone(),
            headers: self.request.headers.clone(),
            body,
        };

        let mut attempt: usize = 0;
        loop {
            if self.state.observe_cancelled() {
                return Ok(AttemptOutcome::Cancelled);
            }

            let span = info_span!(
                "reqflow.request",
                method = %prepared.method,
                uri = %prepared.uri,
                attempt = attempt + 1
            );
            let failure = match self.attempt_once(&prepared).instrument(span).await {
                Ok(outcome) => return Ok(outcome),
                Err(failure) => failure,
            };

            if self.state.observe_cancelled() {
                return Ok(AttemptOutcome::Cancelled);
            }
            if failure.fatal {
                return Err(failure.error);
            }

            attempt += 1;
            let verdict = self
                .retry_policy
                .decide(failure.kind, attempt, failure.request_sent);
            if !verdict.retry {
                return Err(failure.error);
            }

            warn!(
                kind = %failure.kind,
                attempt,
                delay_ms = verdict.delay.as_millis() as u64,
                "transport attempt failed; retrying"
            );
            self.channel.send(Notification::Retry { attempt });
            tokio::select! {
                _ = sleep(verdict.delay) => {}
                _ = self.state.abort_token().cancelled() => {}
            }
        }
    }

    async fn attempt_once(
        &self,
        prepared: &PreparedRequest,
    ) -> Result<AttemptOutcome, AttemptFailure> {
        // Fixes requests built from relative targets: fatal, never retried.
        if prepared.uri.scheme().is_none() {
            return Err(AttemptFailure::fatal(EngineError::MissingScheme {
                uri: prepared.uri.to_string(),
            }));
        }

        debug!("executing transport attempt");
        let response = tokio::select! {
            _ = self.state.abort_token().cancelled() => {
                debug!("transport attempt aborted by cancellation");
                self.state.observe_cancelled();
                return Ok(AttemptOutcome::Cancelled);
            }
            result = self.transport.execute(prepared) => match result {
                Ok(response) => response,
                Err(error) => {
                    return Err(AttemptFailure::transport(
                        error,
                        &prepared.method,
                        &prepared.uri,
                    ));
                }
            },
        };

        if self.state.observe_cancelled() {
            return Ok(AttemptOutcome::Cancelled);
        }

        let status = response.status;
        let headers = response.headers.clone();
        let decoded = match self
            .request
            .decoder
            .decode(
                response.body,
                response.content_length,
                &self.channel,
                &self.state,
            )
            .await
        {
            Ok(DecodeOutcome::Complete(decoded)) => decoded,
            Ok(DecodeOutcome::Cancelled) => return Ok(AttemptOutcome::Cancelled),
            Err(error) => return Err(AttemptFailure::decode(error)),
        };

        if self.state.observe_cancelled() {
            return Ok(AttemptOutcome::Cancelled);
        }
        if !self.state.try_mark_terminal() {
            return Ok(AttemptOutcome::Cancelled);
        }

        if status.as_u16() >= 300 {
            let body = decoded.buffered().cloned().unwrap_or_default();
            let error = EngineError::HttpStatus {
                status: status.as_u16(),
                method: prepared.method.clone(),
                uri: prepared.uri.to_string(),
                body: truncate_body(&body),
            };
            self.channel.send(Notification::Failure {
                status: status.as_u16(),
                headers,
                body,
                error,
            });
        } else {
            self.channel.send(Notification::Success {
                status: status.as_u16(),
                headers,
                body: decoded,
            });
        }
        Ok(AttemptOutcome::Delivered)
    }
}
