//! HTTP plumbing shared by the networked embedding and chat providers.
//!
//! Maps transport failures and HTTP statuses onto the engine's error
//! taxonomy and runs the bounded exponential-backoff retry loop:
//!
//! - 429 with an `insufficient_quota` body, or 402 → quota (terminal)
//! - 429 → rate limited (retry)
//! - 408, 5xx → server/timeout (retry)
//! - connect/reset errors and per-call timeouts → network/timeout (retry)
//! - any other 4xx → permanent provider error

use std::future::Future;
use std::time::Duration;

use knowledge_engine_core::{EngineError, Result, TransientKind};
use reqwest::StatusCode;
use tracing::warn;

const BASE_BACKOFF_MS: u64 = 500;

/// Build a client whose every call is bounded by `timeout`.
pub fn client(provider: &str, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EngineError::Configuration(format!("{provider}: cannot build HTTP client: {e}")))
}

/// Build a client for streamed responses. Only connecting is bounded here;
/// a whole-request timeout would cut long generations short, so callers
/// bound the wait for headers and for each fragment themselves.
pub fn streaming_client(provider: &str, connect_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| EngineError::Configuration(format!("{provider}: cannot build HTTP client: {e}")))
}

/// Delay before retry number `attempt + 1`: 0.5s, 1s, 2s, … capped at 16s.
pub fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(BASE_BACKOFF_MS << attempt.min(5))
}

pub fn classify_status(provider: &str, status: StatusCode, body: &str) -> EngineError {
    let message = format!("HTTP {status}: {}", truncate(body, 300));
    let quota_signal = body.contains("insufficient_quota") || body.contains("billing");

    match status.as_u16() {
        402 => EngineError::ProviderQuota {
            provider: provider.to_string(),
            message,
        },
        429 if quota_signal => EngineError::ProviderQuota {
            provider: provider.to_string(),
            message,
        },
        429 => EngineError::transient(provider, TransientKind::RateLimited, message),
        408 => EngineError::transient(provider, TransientKind::Timeout, message),
        s if (500..600).contains(&s) => {
            EngineError::transient(provider, TransientKind::Server, message)
        }
        _ => EngineError::Provider {
            provider: provider.to_string(),
            message,
        },
    }
}

pub fn classify_reqwest(provider: &str, err: &reqwest::Error) -> EngineError {
    if err.is_timeout() {
        EngineError::transient(provider, TransientKind::Timeout, err.to_string())
    } else if err.is_decode() {
        EngineError::Provider {
            provider: provider.to_string(),
            message: format!("invalid response: {err}"),
        }
    } else {
        EngineError::transient(provider, TransientKind::Network, err.to_string())
    }
}

/// Send a request and turn any non-2xx status into a typed error.
pub async fn send(provider: &str, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = request
        .send()
        .await
        .map_err(|e| classify_reqwest(provider, &e))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(provider, status, &body))
}

/// Longest time [`with_retry`] can take when every attempt is bounded by
/// `per_attempt`: all attempts plus every backoff sleep between them.
pub fn retry_deadline(per_attempt: Duration, max_retries: u32) -> Duration {
    let sleeps: Duration = (0..max_retries).map(backoff).sum();
    per_attempt * (max_retries + 1) + sleeps
}

/// Run `f`, retrying transient failures up to `max_retries` times.
pub async fn with_retry<T, F, Fut>(provider: &str, max_retries: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = backoff(attempt);
                warn!(
                    provider,
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "provider call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Canned response that reads the request and never answers.
    pub const HANG: &str = "";

    /// Spawn a minimal HTTP server that answers each connection with the
    /// next canned response. Returns the base URL.
    pub async fn spawn_mock_server(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            for resp in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.split();
                    let mut buf_reader = BufReader::new(reader);
                    let mut content_length = 0usize;
                    let mut line = String::new();
                    loop {
                        line.clear();
                        buf_reader.read_line(&mut line).await.unwrap_or(0);
                        if line == "\r\n" || line == "\n" || line.is_empty() {
                            break;
                        }
                        let lower = line.to_ascii_lowercase();
                        if let Some(v) = lower.strip_prefix("content-length:") {
                            content_length = v.trim().parse().unwrap_or(0);
                        }
                    }
                    let mut body = vec![0u8; content_length];
                    buf_reader.read_exact(&mut body).await.ok();
                    if resp.is_empty() {
                        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                        return;
                    }
                    writer.write_all(resp.as_bytes()).await.ok();
                    writer.shutdown().await.ok();
                });
            }
        });

        format!("http://127.0.0.1:{port}")
    }

    pub fn response(status: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    pub fn json(status: &str, body: &str) -> String {
        response(status, "application/json", body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff(0), Duration::from_millis(500));
        assert_eq!(backoff(1), Duration::from_millis(1000));
        assert_eq!(backoff(2), Duration::from_millis(2000));
        assert_eq!(backoff(9), Duration::from_millis(16000));
    }

    #[test]
    fn test_classify_status() {
        let quota = classify_status(
            "openai",
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"code":"insufficient_quota"}}"#,
        );
        assert!(quota.is_quota());

        let limited = classify_status("openai", StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(limited.is_retryable());
        assert!(!limited.is_quota());

        assert!(classify_status("openai", StatusCode::PAYMENT_REQUIRED, "").is_quota());
        assert!(classify_status("openai", StatusCode::BAD_GATEWAY, "").is_retryable());

        let bad = classify_status("openai", StatusCode::BAD_REQUEST, "nope");
        assert!(matches!(bad, EngineError::Provider { .. }));
    }

    #[test]
    fn test_retry_deadline_covers_attempts_and_sleeps() {
        assert_eq!(retry_deadline(Duration::from_secs(1), 0), Duration::from_secs(1));
        assert_eq!(
            retry_deadline(Duration::from_secs(1), 2),
            Duration::from_millis(3000 + 500 + 1000)
        );
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(EngineError::transient("test", TransientKind::Network, "reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_quota() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(EngineError::ProviderQuota {
                    provider: "test".into(),
                    message: "out of credit".into(),
                })
            }
        })
        .await;
        assert!(result.unwrap_err().is_quota());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_maps_status() {
        let url = testing::spawn_mock_server(vec![
            testing::json("429 Too Many Requests", r#"{"error":"rate"}"#),
            testing::json("200 OK", r#"{"ok":true}"#),
        ])
        .await;
        let client = client("test", Duration::from_secs(5)).unwrap();

        let err = send("test", client.get(format!("{url}/a"))).await.unwrap_err();
        assert!(err.is_retryable());

        let ok = send("test", client.get(format!("{url}/b"))).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
