//! Tests for the HTTP executors against single-use mock servers.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::time::Duration;

use mcall::crd::task::{TaskKind, ValidationSpec};
use mcall::executors::{ExecutionRequest, execute};

// --- Helpers ---

/// Spawn a mock HTTP server that accepts one connection and returns a canned
/// response.
fn spawn_mock_server(status_line: &str, response_body: &str) -> (String, std::thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("http://{}", addr);
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        response_body.len(),
        response_body
    );
    let handle = std::thread::spawn(move || {
        for stream in listener.incoming().take(1) {
            if let Ok(mut stream) = stream {
                let mut buf = [0u8; 8192];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        }
    });
    (url, handle)
}

/// Spawn a mock server that captures the request and returns a canned
/// response.
fn spawn_capturing_mock_server(
    status_line: &str,
    response_body: &str,
) -> (
    String,
    std::thread::JoinHandle<()>,
    std::sync::mpsc::Receiver<String>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("http://{}", addr);
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        response_body.len(),
        response_body
    );
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = std::thread::spawn(move || {
        for stream in listener.incoming().take(1) {
            if let Ok(mut stream) = stream {
                let captured = read_request(&mut stream);
                let _ = tx.send(captured);
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        }
    });
    (url, handle, rx)
}

/// Read one full HTTP request (headers plus content-length body), tolerating
/// the headers and body arriving in separate segments.
fn read_request(stream: &mut std::net::TcpStream) -> String {
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
        let text = String::from_utf8_lossy(&data);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text
                .lines()
                .find_map(|line| {
                    line.to_lowercase()
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                })
                .unwrap_or(0);
            if data.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&data).to_string()
}

async fn run(kind: TaskKind, input: &str, validation: Option<&ValidationSpec>) -> mcall::executors::ExecutionOutcome {
    let env = Default::default();
    execute(ExecutionRequest {
        kind,
        input,
        env: &env,
        deadline: Duration::from_secs(5),
        validation,
        remote: None,
    })
    .await
}

// --- GET ---

#[tokio::test]
async fn get_2xx_succeeds_with_body_and_status() {
    let (url, handle) = spawn_mock_server("200 OK", r#"{"status":"ok","count":7}"#);
    let outcome = run(TaskKind::HttpGet, &url, None).await;
    handle.join().unwrap();

    assert_eq!(outcome.error_code, "0");
    assert_eq!(outcome.http_status_code, Some(200));
    assert_eq!(outcome.output, r#"{"status":"ok","count":7}"#);
}

#[tokio::test]
async fn get_non_2xx_fails_with_reason() {
    let (url, handle) = spawn_mock_server("503 Service Unavailable", "svc down");
    let outcome = run(TaskKind::HttpGet, &url, None).await;
    handle.join().unwrap();

    assert_eq!(outcome.error_code, "-1");
    assert_eq!(outcome.http_status_code, Some(503));
    assert_eq!(outcome.error_message, "HTTP 503: Service Unavailable");
    assert_eq!(outcome.output, "svc down");
}

#[tokio::test]
async fn get_sends_the_operator_user_agent() {
    let (url, handle, rx) = spawn_capturing_mock_server("200 OK", "{}");
    let outcome = run(TaskKind::HttpGet, &url, None).await;
    handle.join().unwrap();

    assert_eq!(outcome.error_code, "0");
    let request = rx.recv().unwrap();
    assert!(request.to_lowercase().contains("user-agent: mcall/1.0"), "got: {}", request);
}

#[tokio::test]
async fn get_connection_refused_is_a_failed_attempt() {
    // Bind then drop to get a port nothing listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let outcome = run(TaskKind::HttpGet, &format!("http://127.0.0.1:{}", port), None).await;
    assert_eq!(outcome.error_code, "-1");
    assert!(outcome.error_message.contains("request failed"), "got: {}", outcome.error_message);
}

#[tokio::test]
async fn validation_runs_after_a_successful_response() {
    let (url, handle) = spawn_mock_server("200 OK", r#"{"status":"down"}"#);
    let validation = ValidationSpec {
        expected_body: Some(r#""status":"ok""#.to_string()),
        case_sensitive: true,
        ..ValidationSpec::default()
    };
    let outcome = run(TaskKind::HttpGet, &url, Some(&validation)).await;
    handle.join().unwrap();

    assert_eq!(outcome.error_code, "-1");
    assert!(outcome.error_message.starts_with("validation failed"), "got: {}", outcome.error_message);
    assert_eq!(outcome.http_status_code, Some(200));
}

// --- POST ---

#[tokio::test]
async fn post_sends_remainder_of_input_as_json_body() {
    let (url, handle, rx) = spawn_capturing_mock_server("201 Created", "{}");
    let input = format!("{} {{\"name\":\"demo\"}}", url);
    let outcome = run(TaskKind::HttpPost, &input, None).await;
    handle.join().unwrap();

    assert_eq!(outcome.error_code, "0");
    assert_eq!(outcome.http_status_code, Some(201));
    let request = rx.recv().unwrap();
    assert!(request.starts_with("POST "), "got: {}", request);
    assert!(request.to_lowercase().contains("content-type: application/json"), "got: {}", request);
    assert!(request.contains(r#"{"name":"demo"}"#), "got: {}", request);
}

#[tokio::test]
async fn post_without_body_sends_empty_request() {
    let (url, handle, rx) = spawn_capturing_mock_server("200 OK", "{}");
    let outcome = run(TaskKind::HttpPost, &url, None).await;
    handle.join().unwrap();

    assert_eq!(outcome.error_code, "0");
    let request = rx.recv().unwrap();
    assert!(request.starts_with("POST "), "got: {}", request);
}
