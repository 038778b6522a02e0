use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};

use crate::body::{BodyProducer, RequestBody};
use crate::decoder::ResponseDecoder;
use crate::error::EngineError;
use crate::util::{parse_header_name, parse_header_value};
use crate::ReqflowResult;

/// One request description. Immutable once submitted.
#[derive(Clone, Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: RequestBody,
    pub(crate) decoder: ResponseDecoder,
    pub(crate) tag: Option<String>,
}

impl Request {
    pub fn builder(method: Method, target: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, target.into())
    }

    pub fn get(target: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::POST, target)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    target: String,
    headers: HeaderMap,
    body: RequestBody,
    decoder: ResponseDecoder,
    tag: Option<String>,
}

impl RequestBuilder {
    fn new(method: Method, target: String) -> Self {
        Self {
            method,
            target,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            decoder: ResponseDecoder::Buffer,
            tag: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> ReqflowResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Buffered(body.into());
        self
    }

    pub fn body_producer(mut self, producer: impl BodyProducer) -> Self {
        self.body = RequestBody::Producer(Arc::new(producer));
        self
    }

    /// Replaces the default in-memory decoder.
    pub fn decoder(mut self, decoder: ResponseDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Caller-assigned tag, matchable by `Dispatcher::cancel_by_tag`. Can
    /// also be set after submission through the returned handle.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Parses the target URI. A syntactically valid URI without a scheme
    /// still builds; the missing scheme is surfaced later as a fatal
    /// Failure notification, never retried.
    pub fn build(self) -> ReqflowResult<Request> {
        let uri: Uri = self.target.parse().map_err(|_| EngineError::InvalidUri {
            uri: self.target.clone(),
        })?;
        Ok(Request {
            method: self.method,
            uri,
            headers: self.headers,
            body: self.body,
            decoder: self.decoder,
            tag: self.tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_headers_and_tag() {
        let request = Request::get("http://example.com/items")
            .try_header("x-trace", "abc")
            .unwrap()
            .tag("screen-1")
            .build()
            .unwrap();
        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.headers().get("x-trace").unwrap(), "abc");
        assert_eq!(request.tag.as_deref(), Some("screen-1"));
    }

    #[test]
    fn unparseable_target_is_rejected_at_build() {
        let error = Request::get("http://exa mple/").build().unwrap_err();
        assert!(matches!(error, EngineError::InvalidUri { .. }));
    }

    #[test]
    fn schemeless_target_builds_and_defers_the_failure() {
        let request = Request::get("/relative/only").build().unwrap();
        assert!(request.uri().scheme().is_none());
    }
}
