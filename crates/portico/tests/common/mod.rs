//! Shared helpers for integration tests: a minimal HTTP backend that
//! records request heads and answers from a caller-supplied function.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Request heads (request line + headers) seen by a test backend.
pub type RequestLog = Arc<Mutex<Vec<String>>>;

/// Builds a minimal HTTP/1.1 response with `connection: close`.
pub fn http_response(status: u16, reason: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    )
}

/// Spawns a one-connection-at-a-time HTTP backend on an ephemeral port.
///
/// `respond(request_index, head)` produces the raw response for each
/// request. The listener runs until the test's runtime drops.
pub async fn spawn_backend<F>(respond: F) -> (SocketAddr, RequestLog)
where
    F: Fn(usize, &str) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("test backend bind");
    let addr = listener.local_addr().expect("test backend addr");
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));

    let task_log = Arc::clone(&log);
    let counter = Arc::new(AtomicUsize::new(0));
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };

            // Read until the end of the headers; the tests only send
            // bodyless requests.
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                match socket.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }

            let head = String::from_utf8_lossy(&buf).into_owned();
            let index = counter.fetch_add(1, Ordering::SeqCst);
            task_log.lock().expect("request log poisoned").push(head.clone());

            let response = respond(index, &head);
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (addr, log)
}

/// First request line (e.g. `GET /root/users?x=1 HTTP/1.1`) of a head.
pub fn request_line(head: &str) -> &str {
    head.lines().next().unwrap_or("")
}

/// Case-insensitive header lookup inside a recorded head.
pub fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}
