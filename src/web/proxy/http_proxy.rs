//! Streaming HTTP relay to a worker.
//!
//! A dedicated thread performs the outbound request with ureq and pushes the
//! response through a bounded [`pipe`](super::pipe): first one
//! [`ProxyMessage::Head`], then body chunks in order. Closing the reading
//! side makes the next write fail, which drops the outbound connection.
//! Errors before the head turn into a synthetic 500 response so the caller
//! always gets something to relay.

use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use super::pipe::{pipe, PipeReader, PipeWriter, PIPE_CAPACITY};

/// Cancellation predicate polled by the consuming side.
pub type StopSignal = Arc<dyn Fn() -> bool + Send + Sync>;

const CHUNK_SIZE: usize = 16 * 1024;

/// Request headers never forwarded to the worker.
const HOP_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
];

/// Response headers the router's HTTP layer sets itself.
const STRIPPED_RESPONSE_HEADERS: &[&str] =
    &["server", "transfer-encoding", "content-length", "keep-alive", "connection"];

#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    pub method: String,
    /// Path including the query string.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ProxyHead {
    fn synthetic_error() -> Self {
        Self {
            status: 500,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
pub enum ProxyMessage {
    Head(ProxyHead),
    Chunk(Vec<u8>),
    /// The upstream failed after the head was sent.
    Error(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for ProxyTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(200),
            read: Duration::from_secs(600),
            write: Duration::from_secs(600),
        }
    }
}

/// Consuming side of one relayed exchange.
pub struct ProxyResponse {
    reader: PipeReader<ProxyMessage>,
    should_stop: StopSignal,
    head: Option<ProxyHead>,
    /// Body of a synthetic error produced on this side of the pipe.
    diagnostic: Option<Vec<u8>>,
}

impl ProxyResponse {
    /// Start relaying `request` to `host:port`. Returns immediately; the
    /// exchange runs on its own thread.
    pub fn start(
        host: &str,
        port: u16,
        request: ProxyRequest,
        should_stop: StopSignal,
        timeouts: ProxyTimeouts,
    ) -> Self {
        let (writer, reader) = pipe(PIPE_CAPACITY);
        let url = format!("http://{host}:{port}{}", request.path);

        let spawned = thread::Builder::new()
            .name(format!("proxy-{port}"))
            .spawn({
                let url = url.clone();
                move || relay(&url, request, timeouts, writer)
            });
        let mut response = Self {
            reader,
            should_stop,
            head: None,
            diagnostic: None,
        };
        if let Err(e) = spawned {
            // The writer went down with the failed spawn, so the head reads
            // as a synthetic 500.
            warn!("Could not start proxy thread for {url}: {e}");
            response.diagnostic = Some(format!("proxy error: {e}").into_bytes());
        }
        response
    }

    /// Status and headers of the response. Blocks until they are known;
    /// a cancelled or broken exchange reads as a 500.
    pub fn head(&mut self) -> ProxyHead {
        if let Some(head) = &self.head {
            return head.clone();
        }
        let head = match self.reader.read(self.should_stop.as_ref()) {
            Some(ProxyMessage::Head(head)) => head,
            Some(ProxyMessage::Chunk(_) | ProxyMessage::Error(_)) | None => {
                ProxyHead::synthetic_error()
            }
        };
        self.head = Some(head.clone());
        head
    }

    /// Next body chunk, `Err` when the upstream failed mid-stream, `None` at
    /// the end of the body or after cancellation.
    pub fn next_chunk(&mut self) -> Option<Result<Vec<u8>, String>> {
        if self.head.is_none() {
            self.head();
        }
        if let Some(body) = self.diagnostic.take() {
            return Some(Ok(body));
        }
        loop {
            match self.reader.read(self.should_stop.as_ref())? {
                ProxyMessage::Chunk(chunk) => return Some(Ok(chunk)),
                ProxyMessage::Error(message) => return Some(Err(message)),
                ProxyMessage::Head(_) => continue,
            }
        }
    }

    /// Stop consuming. The relay thread aborts and closes the upstream
    /// connection on its next write, so a worker that has gone silent keeps
    /// it open until the read timeout.
    pub fn cancel(&self) {
        self.reader.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.reader.is_closed()
    }
}

impl Iterator for ProxyResponse {
    type Item = Result<Vec<u8>, String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk()
    }
}

fn relay(
    url: &str,
    request: ProxyRequest,
    timeouts: ProxyTimeouts,
    writer: PipeWriter<ProxyMessage>,
) {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(timeouts.connect)
        .timeout_read(timeouts.read)
        .timeout_write(timeouts.write)
        .redirects(0)
        .build();

    let mut outbound = agent.request(&request.method, url);
    for (name, value) in &request.headers {
        if is_forwarded_request_header(name) {
            outbound = outbound.set(name, value);
        }
    }

    let sent = if request.body.is_empty() && matches!(request.method.as_str(), "GET" | "HEAD") {
        outbound.call()
    } else {
        outbound.send_bytes(&request.body)
    };

    let response = match sent {
        Ok(response) | Err(ureq::Error::Status(_, response)) => response,
        Err(e) => {
            debug!("Proxy request to {url} failed: {e}");
            let _ = writer
                .write(ProxyMessage::Head(ProxyHead::synthetic_error()))
                .and_then(|()| {
                    writer.write(ProxyMessage::Chunk(format!("proxy error: {e}").into_bytes()))
                });
            return;
        }
    };

    let head = ProxyHead {
        status: response.status(),
        headers: response_headers(&response),
    };
    if writer.write(ProxyMessage::Head(head)).is_err() {
        debug!("Proxy consumer for {url} went away before the head");
        return;
    }

    let mut body = response.into_reader();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Proxy read from {url} failed: {e}");
                let _ = writer.write(ProxyMessage::Error(format!("proxy error: {e}")));
                return;
            }
        };
        if writer.write(ProxyMessage::Chunk(buf[..n].to_vec())).is_err() {
            debug!("Proxy consumer for {url} went away, aborting");
            return;
        }
    }
}

fn is_forwarded_request_header(name: &str) -> bool {
    !HOP_REQUEST_HEADERS
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

fn is_stripped_response_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("access-control-") || STRIPPED_RESPONSE_HEADERS.contains(&lower.as_str())
}

fn response_headers(response: &ureq::Response) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    for name in response.headers_names() {
        if is_stripped_response_header(&name) {
            continue;
        }
        for value in response.all(&name) {
            headers.push((name.clone(), value.to_string()));
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    fn never() -> StopSignal {
        Arc::new(|| false)
    }

    #[test]
    fn test_connection_refused_gives_synthetic_500() {
        // Bind then drop to get a port with nothing listening.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let request = ProxyRequest {
            method: "GET".into(),
            path: "/health".into(),
            ..ProxyRequest::default()
        };
        let mut response =
            ProxyResponse::start("127.0.0.1", port, request, never(), ProxyTimeouts::default());

        let head = response.head();
        assert_eq!(head.status, 500);
        assert_eq!(head.content_type(), Some("text/plain"));
        let body: Vec<u8> = response.by_ref().filter_map(Result::ok).flatten().collect();
        assert!(String::from_utf8_lossy(&body).starts_with("proxy error:"));
    }

    #[test]
    fn test_failed_start_carries_diagnostic_body() {
        let (writer, reader) = pipe(PIPE_CAPACITY);
        drop(writer);
        let mut response = ProxyResponse {
            reader,
            should_stop: never(),
            head: None,
            diagnostic: Some(b"proxy error: no threads".to_vec()),
        };
        assert_eq!(response.head().status, 500);
        assert_eq!(response.next_chunk(), Some(Ok(b"proxy error: no threads".to_vec())));
        assert_eq!(response.next_chunk(), None);
    }

    #[test]
    fn test_cancel_closes_upstream_after_next_chunk() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let upstream = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n")
                .unwrap();
            // Keep streaming until the router side hangs up.
            while socket.write_all(b"5\r\ntick\n\r\n").is_ok() {
                thread::sleep(Duration::from_millis(20));
            }
            let _ = done_tx.send(());
        });

        let request = ProxyRequest {
            method: "GET".into(),
            path: "/slow".into(),
            ..ProxyRequest::default()
        };
        let mut response =
            ProxyResponse::start("127.0.0.1", port, request, never(), ProxyTimeouts::default());
        assert_eq!(response.head().status, 200);
        assert!(matches!(response.next_chunk(), Some(Ok(_))));
        response.cancel();

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        upstream.join().unwrap();
    }

    #[test]
    fn test_header_filters() {
        for name in ["Server", "Transfer-Encoding", "content-length", "Keep-Alive"] {
            assert!(is_stripped_response_header(name), "{name}");
        }
        assert!(is_stripped_response_header("Access-Control-Allow-Origin"));
        assert!(!is_stripped_response_header("Content-Type"));
        assert!(!is_stripped_response_header("X-Request-Id"));

        assert!(!is_forwarded_request_header("Host"));
        assert!(!is_forwarded_request_header("content-length"));
        assert!(is_forwarded_request_header("Authorization"));
    }

    #[test]
    fn test_cancel_before_head() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let request = ProxyRequest {
            method: "GET".into(),
            path: "/".into(),
            ..ProxyRequest::default()
        };
        // Accepted by the backlog but never answered.
        let mut response = ProxyResponse::start(
            "127.0.0.1",
            port,
            request,
            Arc::new(|| true),
            ProxyTimeouts::default(),
        );
        assert_eq!(response.head().status, 500);
        assert!(response.is_cancelled());
        assert!(response.next_chunk().is_none());
        drop(listener);
    }
}
