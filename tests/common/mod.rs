#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crypto_replicator::{generate_key_pair, RetryPolicy, SenderConfig, DEFAULT_RSA_BITS};

/// One request as seen by [`MockCloud`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    /// Lower-cased header names
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Default)]
struct MockState {
    requests: Mutex<Vec<RecordedRequest>>,
    statuses: Mutex<VecDeque<u16>>,
}

/// Minimal HTTP/1.1 endpoint standing in for the cloud store.
///
/// Answers with the scripted statuses in order, then 201 for everything else.
pub struct MockCloud {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockCloud {
    pub async fn start(statuses: &[u16]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());
        state.statuses.lock().extend(statuses.iter().copied());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = handle(stream, state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }
}

async fn handle(mut stream: TcpStream, state: Arc<MockState>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body_end = (header_end + content_length).min(buf.len());
    let body = buf[header_end..body_end].to_vec();

    state.requests.lock().push(RecordedRequest {
        method,
        path,
        headers,
        body,
    });
    let status = state.statuses.lock().pop_front().unwrap_or(201);

    let payload = if status < 300 {
        r#"{"status":"accepted"}"#
    } else {
        r#"{"error":"scripted failure"}"#
    };
    let response = format!(
        "HTTP/1.1 {} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        payload.len(),
        payload
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// One RSA key pair shared by every test in a binary: (public PEM, private PEM).
pub fn shared_key_pem() -> &'static (String, String) {
    static PEM: OnceLock<(String, String)> = OnceLock::new();
    PEM.get_or_init(|| {
        let pair = generate_key_pair(DEFAULT_RSA_BITS).unwrap();
        (pair.public_pem, pair.private_pem.to_string())
    })
}

/// Sender config pointed at `endpoint` with millisecond backoff.
pub fn sender_config(endpoint: Option<String>, batch_size: usize, max_retries: u32) -> SenderConfig {
    SenderConfig {
        endpoint,
        token: Some("test-token".to_string()),
        batch_size,
        flush_interval: Duration::from_secs(3600),
        retry: RetryPolicy::new(max_retries, Duration::from_millis(5)),
        request_timeout: Duration::from_secs(5),
        dry_run: false,
    }
}
