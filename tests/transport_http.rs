use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use http::{HeaderMap, Method};
use reqflow::{
    CallbackChannel, DecodedBody, Dispatcher, EngineError, Request, RequestHandle,
    ResponseHandler, RetryPolicy,
};

#[derive(Clone)]
struct MockResponse {
    status: u16,
    body: String,
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

/// Raw-socket HTTP/1.1 mock: serves one scripted response per connection,
/// closing each connection so retries always reconnect.
struct MockServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        let served = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let served_in_thread = Arc::clone(&served);
        let captured_in_thread = Arc::clone(&captured);
        let join = thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = match listener.accept() {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let request = read_request(&mut stream);
                captured_in_thread.lock().unwrap().push(request);
                let payload = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    response.status,
                    response.body.len(),
                    response.body
                );
                let _ = stream.write_all(payload.as_bytes());
                let _ = stream.flush();
                served_in_thread.fetch_add(1, Ordering::SeqCst);
            }
        });
        Self {
            base_url: format!("http://{address}"),
            served,
            captured,
            join: Some(join),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    fn captured(&self) -> Vec<CapturedRequest> {
        self.captured.lock().unwrap().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            // Unblock a server still waiting in accept().
            let _ = TcpStream::connect(self.base_url.trim_start_matches("http://"));
            let _ = join.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> CapturedRequest {
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("set read timeout");
    let mut raw = Vec::new();
    let mut buffer = [0u8; 1024];
    let header_end = loop {
        match stream.read(&mut buffer) {
            Ok(0) => break raw.len(),
            Ok(read) => {
                raw.extend_from_slice(&buffer[..read]);
                if let Some(position) = raw.windows(4).position(|window| window == b"\r\n\r\n") {
                    break position + 4;
                }
            }
            Err(_) => break raw.len(),
        }
    };
    let head = String::from_utf8_lossy(&raw[..header_end.min(raw.len())]).into_owned();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_owned();
    let path = parts.next().unwrap_or_default().to_owned();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = raw[header_end.min(raw.len())..].to_vec();
    while body.len() < content_length {
        match stream.read(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(read) => body.extend_from_slice(&buffer[..read]),
        }
    }
    CapturedRequest { method, path, body }
}

#[derive(Default)]
struct Outcome {
    success: Mutex<Option<(u16, String)>>,
    failure: Mutex<Option<String>>,
    retries: AtomicUsize,
}

struct OutcomeHandler {
    outcome: Arc<Outcome>,
}

impl OutcomeHandler {
    fn new() -> (Self, Arc<Outcome>) {
        let outcome = Arc::new(Outcome::default());
        (
            Self {
                outcome: Arc::clone(&outcome),
            },
            outcome,
        )
    }
}

impl ResponseHandler for OutcomeHandler {
    fn on_success(&self, status: u16, _headers: &HeaderMap, body: &DecodedBody) {
        *self.outcome.success.lock().unwrap() = Some((status, body.text_lossy()));
    }

    fn on_failure(&self, _status: u16, _headers: &HeaderMap, _body: &[u8], error: &EngineError) {
        *self.outcome.failure.lock().unwrap() = Some(error.to_string());
    }

    fn on_retry(&self, _attempt: usize) {
        self.outcome.retries.fetch_add(1, Ordering::SeqCst);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn wait_until(handle: &RequestHandle) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !handle.is_finished() {
        assert!(Instant::now() < deadline, "request did not settle in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_round_trips_through_a_real_socket() {
    init_tracing();
    let server = MockServer::start(vec![MockResponse {
        status: 200,
        body: "{\"ok\":true}".to_owned(),
    }]);
    let dispatcher = Dispatcher::builder()
        .retry_policy(RetryPolicy::disabled())
        .try_build()
        .unwrap();
    let (handler, outcome) = OutcomeHandler::new();
    let handle = dispatcher
        .send(
            Request::get(server.url("/status")).build().unwrap(),
            None,
            CallbackChannel::synchronous(handler),
        )
        .unwrap();
    wait_until(&handle).await;
    let success = outcome.success.lock().unwrap().clone();
    assert_eq!(success, Some((200, "{\"ok\":true}".to_owned())));
    while server.served() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let captured = server.captured();
    assert_eq!(captured[0].method, "GET");
    assert_eq!(captured[0].path, "/status");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_body_reaches_the_server() {
    init_tracing();
    let server = MockServer::start(vec![MockResponse {
        status: 201,
        body: "created".to_owned(),
    }]);
    let dispatcher = Dispatcher::builder()
        .retry_policy(RetryPolicy::disabled())
        .try_build()
        .unwrap();
    let (handler, outcome) = OutcomeHandler::new();
    let request = Request::builder(Method::POST, server.url("/items"))
        .try_header("content-type", "application/json")
        .unwrap()
        .body("{\"name\":\"disk\"}")
        .build()
        .unwrap();
    let handle = dispatcher
        .send(request, None, CallbackChannel::synchronous(handler))
        .unwrap();
    wait_until(&handle).await;
    let success = outcome.success.lock().unwrap().clone();
    assert_eq!(success, Some((201, "created".to_owned())));
    let captured = server.captured();
    assert_eq!(captured[0].method, "POST");
    assert_eq!(captured[0].body, b"{\"name\":\"disk\"}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_status_reports_the_failure_body() {
    init_tracing();
    let server = MockServer::start(vec![MockResponse {
        status: 503,
        body: "unavailable".to_owned(),
    }]);
    let dispatcher = Dispatcher::builder()
        .retry_policy(RetryPolicy::disabled())
        .try_build()
        .unwrap();
    let (handler, outcome) = OutcomeHandler::new();
    let handle = dispatcher
        .send(
            Request::get(server.url("/down")).build().unwrap(),
            None,
            CallbackChannel::synchronous(handler),
        )
        .unwrap();
    wait_until(&handle).await;
    let failure = outcome.failure.lock().unwrap().clone();
    let failure = failure.expect("failure recorded");
    assert!(failure.contains("503"), "got {failure}");
    assert!(failure.contains("unavailable"), "got {failure}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_refused_is_retried_then_reported() {
    init_tracing();
    // Bind and drop to get a port that refuses connections.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let dispatcher = Dispatcher::builder()
        .retry_policy(
            RetryPolicy::standard()
                .max_attempts(2)
                .retry_delay(Duration::from_millis(10)),
        )
        .try_build()
        .unwrap();
    let (handler, outcome) = OutcomeHandler::new();
    let handle = dispatcher
        .send(
            Request::get(format!("http://127.0.0.1:{port}/missing"))
                .build()
                .unwrap(),
            None,
            CallbackChannel::synchronous(handler),
        )
        .unwrap();
    wait_until(&handle).await;
    assert!(outcome.failure.lock().unwrap().is_some());
    assert_eq!(outcome.retries.load(Ordering::SeqCst), 2);
}
