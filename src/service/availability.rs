//! Waiting for a service's HTTP endpoint to come up.
//!
//! A check sleeps for its initial delay, then sends up to `retries`
//! requests with `retry_delay_ms` between them. The first `200 OK` ends the
//! wait; if an expected body is set, that response must carry exactly that
//! body, and a mismatch fails at once without further attempts.

use crate::constants::{
    DEFAULT_HTTP_RETRIES, DEFAULT_HTTP_RETRY_DELAY_MS, HTTP_CHECK_REQUEST_TIMEOUT, MAX_HTTP_RETRIES,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info};

/// HTTP method of an availability check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// `GET` without a body.
    #[default]
    Get,
    /// `POST` with a JSON body.
    Post,
}

/// An HTTP endpoint a service must answer on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpEndpointCheck {
    /// Request method.
    #[serde(default)]
    pub method: HttpMethod,
    /// Port on the service's private IP.
    pub port: u16,
    /// Request path; a leading `/` is optional.
    #[serde(default)]
    pub path: String,
    /// Body sent with `POST` requests.
    #[serde(default)]
    pub request_body: String,
    /// Exact body the successful response must carry.
    #[serde(default)]
    pub expected_body: Option<String>,
    /// Pause before the first attempt.
    #[serde(default)]
    pub initial_delay_ms: u64,
    /// Number of attempts.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Pause between attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_retries() -> u32 {
    DEFAULT_HTTP_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_HTTP_RETRY_DELAY_MS
}

impl HttpEndpointCheck {
    /// A `GET` check of `path` on `port` with default retries.
    #[must_use]
    pub fn get(port: u16, path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            port,
            path: path.into(),
            request_body: String::new(),
            expected_body: None,
            initial_delay_ms: 0,
            retries: DEFAULT_HTTP_RETRIES,
            retry_delay_ms: DEFAULT_HTTP_RETRY_DELAY_MS,
        }
    }

    /// URL of the endpoint on `ip`.
    #[must_use]
    pub fn url(&self, ip: Ipv4Addr) -> String {
        format!("http://{ip}:{}/{}", self.port, self.path.trim_start_matches('/'))
    }

    fn validate(&self) -> Result<()> {
        if self.retries == 0 || self.retries > MAX_HTTP_RETRIES {
            return Err(Error::InvalidInput(format!(
                "retries must be within 1..={MAX_HTTP_RETRIES}, got {}",
                self.retries
            )));
        }
        Ok(())
    }
}

/// Waits until `url` answers `check`.
///
/// # Errors
///
/// - [`Error::InvalidInput`] for an out-of-range retry count
/// - [`Error::EndpointUnavailable`] when every attempt failed or the body
///   did not match
pub async fn wait_for_endpoint(url: &str, check: &HttpEndpointCheck) -> Result<()> {
    check.validate()?;
    let client = reqwest::Client::builder()
        .timeout(HTTP_CHECK_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Error::Internal(format!("http client: {e}")))?;

    tokio::time::sleep(Duration::from_millis(check.initial_delay_ms)).await;

    let mut last_failure = String::new();
    for attempt in 1..=check.retries {
        match request(&client, url, check).await {
            Ok(body) => {
                if let Some(expected) = &check.expected_body
                    && &body != expected
                {
                    return Err(Error::EndpointUnavailable {
                        url: url.to_string(),
                        attempts: attempt,
                        reason: format!("expected body '{expected}', got '{body}'"),
                    });
                }
                info!(url, attempt, "endpoint available");
                return Ok(());
            }
            Err(reason) => {
                debug!(url, attempt, %reason, "endpoint not available yet");
                last_failure = reason;
            }
        }
        if attempt < check.retries {
            tokio::time::sleep(Duration::from_millis(check.retry_delay_ms)).await;
        }
    }

    Err(Error::EndpointUnavailable {
        url: url.to_string(),
        attempts: check.retries,
        reason: last_failure,
    })
}

/// One attempt; the body of a `200 OK`, or why the attempt failed.
async fn request(client: &reqwest::Client, url: &str, check: &HttpEndpointCheck) -> std::result::Result<String, String> {
    let builder = match check.method {
        HttpMethod::Get => client.get(url),
        HttpMethod::Post => client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(check.request_body.clone()),
    };
    let response = builder.send().await.map_err(|e| e.to_string())?;
    if response.status() != reqwest::StatusCode::OK {
        return Err(format!("status {}", response.status()));
    }
    response.text().await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned response per connection, in order.
    async fn serve(responses: Vec<(u16, &'static str)>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {status} Status\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });
        port
    }

    fn quick(port: u16) -> HttpEndpointCheck {
        HttpEndpointCheck {
            retries: 3,
            retry_delay_ms: 10,
            ..HttpEndpointCheck::get(port, "/health")
        }
    }

    #[test]
    fn test_url_normalizes_path() {
        let ip = Ipv4Addr::new(10, 0, 0, 2);
        assert_eq!(HttpEndpointCheck::get(80, "/ready").url(ip), "http://10.0.0.2:80/ready");
        assert_eq!(HttpEndpointCheck::get(80, "ready").url(ip), "http://10.0.0.2:80/ready");
    }

    #[test]
    fn test_check_defaults_from_json() {
        let check: HttpEndpointCheck = serde_json::from_str(r#"{"port": 8080}"#).unwrap();
        assert_eq!(check.method, HttpMethod::Get);
        assert_eq!(check.retries, DEFAULT_HTTP_RETRIES);
        assert_eq!(check.retry_delay_ms, DEFAULT_HTTP_RETRY_DELAY_MS);
    }

    #[tokio::test]
    async fn test_retries_until_ok() {
        let port = serve(vec![(503, "starting"), (200, "ready")]).await;
        let check = HttpEndpointCheck {
            expected_body: Some("ready".to_string()),
            ..quick(port)
        };
        let url = format!("http://127.0.0.1:{port}/health");
        wait_for_endpoint(&url, &check).await.unwrap();
    }

    #[tokio::test]
    async fn test_body_mismatch_fails_immediately() {
        let port = serve(vec![(200, "degraded")]).await;
        let check = HttpEndpointCheck {
            expected_body: Some("ready".to_string()),
            ..quick(port)
        };
        let url = format!("http://127.0.0.1:{port}/health");
        let err = wait_for_endpoint(&url, &check).await.unwrap_err();
        assert!(matches!(err, Error::EndpointUnavailable { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = format!("http://127.0.0.1:{port}/health");
        let err = wait_for_endpoint(&url, &quick(port)).await.unwrap_err();
        assert!(matches!(err, Error::EndpointUnavailable { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_zero_retries_rejected() {
        let check = HttpEndpointCheck {
            retries: 0,
            ..HttpEndpointCheck::get(80, "/")
        };
        assert!(matches!(
            wait_for_endpoint("http://127.0.0.1:1/", &check).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
