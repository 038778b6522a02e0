//! `reqflow` executes HTTP requests asynchronously on a worker pool and
//! reports their lifecycle through callback handlers.
//!
//! Each submitted request runs as an independent task: a transport attempt
//! loop with a whitelist/blacklist retry policy, response decoding to memory
//! or to a file, and a fixed notification sequence delivered to a
//! [`ResponseHandler`] (`Start`, zero or more `Progress`/`Retry`, exactly one
//! of `Success`/`Failure`/`Cancel`, then `Finish` unless cancelled). Handlers
//! can run inline, on a dedicated pool thread, or on a caller-owned
//! [`DeliveryContext`] loop.
//!
//! # Quick Start
//!
//! ```no_run
//! use http::HeaderMap;
//! use reqflow::{
//!     CallbackChannel, DecodedBody, Dispatcher, EngineError, Request, ResponseHandler,
//! };
//!
//! struct PrintHandler;
//!
//! impl ResponseHandler for PrintHandler {
//!     fn on_success(&self, status: u16, _headers: &HeaderMap, body: &DecodedBody) {
//!         println!("{status}: {} bytes", body.bytes().len());
//!     }
//!
//!     fn on_failure(&self, status: u16, _headers: &HeaderMap, _body: &[u8], error: &EngineError) {
//!         eprintln!("{status}: {error}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EngineError> {
//!     let dispatcher = Dispatcher::builder().max_in_flight(8).try_build()?;
//!     let request = Request::get("https://example.com/status").build()?;
//!     let handle = dispatcher.send(request, None, CallbackChannel::synchronous(PrintHandler))?;
//!     while !handle.is_finished() {
//!         tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//!     }
//!     Ok(())
//! }
//! ```

mod body;
mod channel;
mod decoder;
mod dispatcher;
mod error;
mod handle;
mod request;
mod retry;
mod task;
mod transport;
mod util;

pub use crate::body::BodyProducer;
pub use crate::channel::{
    CallbackChannel, DeliveryContext, DeliveryLoop, Notification, ResponseHandler,
};
pub use crate::decoder::{DecodedBody, ResponseDecoder};
pub use crate::dispatcher::{Dispatcher, DispatcherBuilder, OwnerScope};
pub use crate::error::{BoxError, EngineError, TransportErrorKind};
pub use crate::handle::RequestHandle;
pub use crate::request::{Request, RequestBuilder};
pub use crate::retry::{RetryPolicy, RetryVerdict};
pub use crate::transport::{
    BodyStream, HyperTransport, PreparedRequest, Transport, TransportError, TransportResponse,
};

/// Convenience alias for results produced by this crate.
pub type ReqflowResult<T> = Result<T, EngineError>;
