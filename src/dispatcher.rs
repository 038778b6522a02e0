use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::channel::{self, CallbackChannel};
use crate::error::EngineError;
use crate::handle::RequestHandle;
use crate::request::Request;
use crate::retry::RetryPolicy;
use crate::task::{RequestTask, TaskState};
use crate::transport::{HyperTransport, Transport};
use crate::util::lock_unpoisoned;
use crate::ReqflowResult;

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque grouping key for bulk cancellation. The engine compares scopes by
/// identity only; clones refer to the same scope.
#[derive(Clone, Debug)]
pub struct OwnerScope {
    id: Arc<u64>,
}

impl OwnerScope {
    pub fn new() -> Self {
        Self {
            id: Arc::new(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }
}

impl Default for OwnerScope {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for OwnerScope {
    fn eq(&self, other: &Self) -> bool {
        *self.id == *other.id
    }
}

impl Eq for OwnerScope {}

impl std::hash::Hash for OwnerScope {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

struct DispatcherInner {
    transport: Arc<dyn Transport>,
    retry_policy: RetryPolicy,
    limiter: Option<Arc<Semaphore>>,
    runtime: tokio::runtime::Handle,
    registry: Mutex<HashMap<OwnerScope, Vec<RequestHandle>>>,
}

/// Owns the worker pool and the owner-scoped registry of live requests.
///
/// `send` wraps a request into a task, spawns it on the runtime (optionally
/// gated by a concurrency limit), and returns a [`RequestHandle`]
/// immediately. Requests registered under an [`OwnerScope`] can be cancelled
/// in bulk; every registration opportunistically sweeps handles whose task
/// has already finished.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

pub struct DispatcherBuilder {
    transport: Option<Arc<dyn Transport>>,
    retry_policy: RetryPolicy,
    max_in_flight: Option<usize>,
}

impl DispatcherBuilder {
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Default retry policy for every request this dispatcher executes.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Caps the number of concurrently executing tasks. Unbounded when
    /// unset.
    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = Some(max_in_flight.max(1));
        self
    }

    /// Builds the dispatcher on the current runtime. Fails when called
    /// outside a tokio runtime, or when no transport was supplied and the
    /// default one cannot be initialized.
    pub fn try_build(self) -> ReqflowResult<Dispatcher> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| EngineError::RuntimeUnavailable)?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new()?),
        };
        Ok(Dispatcher {
            inner: Arc::new(DispatcherInner {
                transport,
                retry_policy: self.retry_policy,
                limiter: self
                    .max_in_flight
                    .map(|limit| Arc::new(Semaphore::new(limit))),
                runtime,
                registry: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder {
            transport: None,
            retry_policy: RetryPolicy::standard(),
            max_in_flight: None,
        }
    }

    /// Submits a request for execution and returns its handle immediately.
    ///
    /// A channel bound to an already-closed delivery context is rejected
    /// here rather than losing notifications later.
    pub fn send(
        &self,
        request: Request,
        owner: Option<&OwnerScope>,
        channel: CallbackChannel,
    ) -> ReqflowResult<RequestHandle> {
        if channel.is_closed() {
            return Err(EngineError::DeliveryContextClosed);
        }

        let state = Arc::new(TaskState::new(channel.clone(), request.tag.clone()));
        let handle = RequestHandle::new(Arc::downgrade(&state));
        let task = RequestTask::new(
            Arc::clone(&state),
            request,
            Arc::clone(&self.inner.transport),
            self.inner.retry_policy.clone(),
            channel,
        );

        let limiter = self.inner.limiter.clone();
        self.inner.runtime.spawn(async move {
            let _permit = match &limiter {
                Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
                None => None,
            };
            task.run().await;
        });

        if let Some(owner) = owner {
            let mut registry = lock_unpoisoned(&self.inner.registry);
            let entries = registry.entry(owner.clone()).or_default();
            entries.push(handle.clone());
            entries.retain(|entry| !entry.should_sweep());
        }

        Ok(handle)
    }

    /// Cancels every live request registered under `owner` and drops the
    /// owner's registry entry. A no-op for owners with no registered
    /// requests.
    pub fn cancel_owner(&self, owner: &OwnerScope, interrupt: bool) {
        let removed = lock_unpoisoned(&self.inner.registry).remove(owner);
        let Some(handles) = removed else {
            debug!("no requests registered for owner; nothing to cancel");
            return;
        };
        self.run_cancellation(handles, interrupt);
    }

    /// Cancels every registered request across all owners.
    pub fn cancel_all(&self, interrupt: bool) {
        let handles: Vec<RequestHandle> = {
            let mut registry = lock_unpoisoned(&self.inner.registry);
            registry.drain().flat_map(|(_, entries)| entries).collect()
        };
        if handles.is_empty() {
            debug!("no requests registered; nothing to cancel");
            return;
        }
        self.run_cancellation(handles, interrupt);
    }

    /// Cancels every registered request whose task carries `tag`. A logged
    /// no-op when nothing matches.
    pub fn cancel_by_tag(&self, tag: &str, interrupt: bool) {
        let matches: Vec<RequestHandle> = {
            let registry = lock_unpoisoned(&self.inner.registry);
            registry
                .values()
                .flatten()
                .filter(|handle| handle.tag().as_deref() == Some(tag))
                .cloned()
                .collect()
        };
        if matches.is_empty() {
            debug!(%tag, "no registered requests matched tag");
            return;
        }
        self.run_cancellation(matches, interrupt);
    }

    /// Number of live (unswept) handles currently registered.
    pub fn registered_requests(&self) -> usize {
        let registry = lock_unpoisoned(&self.inner.registry);
        registry
            .values()
            .flatten()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    // Cancelling from inside a delivery-loop callback must not block the
    // loop on its own notifications, so the sweep moves to a worker.
    fn run_cancellation(&self, handles: Vec<RequestHandle>, interrupt: bool) {
        if channel::on_delivery_thread() {
            self.inner.runtime.spawn(async move {
                cancel_handles(&handles, interrupt);
            });
        } else {
            cancel_handles(&handles, interrupt);
        }
    }
}

fn cancel_handles(handles: &[RequestHandle], interrupt: bool) {
    for handle in handles {
        if !handle.cancel(interrupt) {
            warn!("request could not be cancelled; it already completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use super::*;
    use crate::channel::{DeliveryContext, ResponseHandler};
    use crate::decoder::DecodedBody;
    use crate::transport::{PreparedRequest, TransportResponse};

    struct OkTransport;

    #[async_trait]
    impl Transport for OkTransport {
        async fn execute(
            &self,
            _request: &PreparedRequest,
        ) -> Result<TransportResponse, crate::transport::TransportError> {
            Ok(TransportResponse::buffered(
                StatusCode::OK,
                HeaderMap::new(),
                Bytes::from_static(b"ok"),
            ))
        }
    }

    struct SilentHandler;

    impl ResponseHandler for SilentHandler {
        fn on_success(&self, _status: u16, _headers: &HeaderMap, _body: &DecodedBody) {}
        fn on_failure(
            &self,
            _status: u16,
            _headers: &HeaderMap,
            _body: &[u8],
            _error: &EngineError,
        ) {
        }
    }

    #[test]
    fn building_outside_a_runtime_fails() {
        let result = Dispatcher::builder().transport(OkTransport).try_build();
        assert!(matches!(result, Err(EngineError::RuntimeUnavailable)));
    }

    #[tokio::test]
    async fn closed_delivery_context_is_rejected_at_submission() {
        let dispatcher = Dispatcher::builder()
            .transport(OkTransport)
            .try_build()
            .unwrap();
        let (context, delivery_loop) = DeliveryContext::new();
        drop(delivery_loop);
        let channel = CallbackChannel::with_context(SilentHandler, &context);
        let request = Request::get("http://localhost/ping").build().unwrap();
        let result = dispatcher.send(request, None, channel);
        assert!(matches!(result, Err(EngineError::DeliveryContextClosed)));
    }

    #[tokio::test]
    async fn finished_requests_are_swept_from_the_registry() {
        let dispatcher = Dispatcher::builder()
            .transport(OkTransport)
            .try_build()
            .unwrap();
        let owner = OwnerScope::new();
        let handle = dispatcher
            .send(
                Request::get("http://localhost/one").build().unwrap(),
                Some(&owner),
                CallbackChannel::synchronous(SilentHandler),
            )
            .unwrap();
        while !handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // The next registration under the same owner sweeps the dead entry.
        dispatcher
            .send(
                Request::get("http://localhost/two").build().unwrap(),
                Some(&owner),
                CallbackChannel::synchronous(SilentHandler),
            )
            .unwrap();
        assert!(dispatcher.registered_requests() <= 2);
    }

    #[tokio::test]
    async fn cancelling_an_unknown_owner_is_a_no_op() {
        let dispatcher = Dispatcher::builder()
            .transport(OkTransport)
            .try_build()
            .unwrap();
        dispatcher.cancel_owner(&OwnerScope::new(), true);
        dispatcher.cancel_by_tag("missing", false);
        dispatcher.cancel_all(true);
    }

    #[test]
    fn owner_scopes_compare_by_identity() {
        let a = OwnerScope::new();
        let b = OwnerScope::new();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
