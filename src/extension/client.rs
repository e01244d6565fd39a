//! Extension RPC client.
//!
//! Extensions listen on a TCP port inside the enclave network and speak
//! newline-delimited JSON, one request and one response per connection:
//!
//! ```text
//! → {"action":"ping"}
//! ← {"status":"ok","data":{"type":"pong"}}
//!
//! → {"action":"execute","params":"{\"n\":1}"}
//! ← {"status":"ok","data":{"type":"result","result":"{\"n\":2}"}}
//!
//! ← {"status":"error","code":3,"message":"bad params"}
//! ```

use crate::constants::MAX_EXTENSION_MESSAGE_SIZE;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

// =============================================================================
// Wire Protocol
// =============================================================================

/// Request sent to an extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Availability check.
    Ping,
    /// Run the extension with serialized parameters.
    Execute {
        /// Opaque parameters, passed through untouched.
        params: String,
    },
}

/// Response from an extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Success.
    Ok(OkPayload),
    /// Failure reported by the extension.
    Error(ErrorPayload),
}

/// Body of a success response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkPayload {
    /// Response data, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

/// Body of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Extension-defined error code.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
}

/// Response data variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// Answer to [`Request::Ping`].
    Pong,
    /// Answer to [`Request::Execute`].
    Result {
        /// Opaque serialized result.
        result: String,
    },
}

impl Request {
    /// Serializes to one JSON line (with newline).
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json_line(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserializes from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if JSON deserialization fails.
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s.trim())?)
    }
}

impl Response {
    /// A success response carrying `data`.
    #[must_use]
    pub fn ok_with_data(data: ResponseData) -> Self {
        Self::Ok(OkPayload { data: Some(data) })
    }

    /// An error response.
    #[must_use]
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }

    /// Serializes to one JSON line (with newline).
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json_line(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserializes from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if JSON deserialization fails.
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s.trim())?)
    }
}

// =============================================================================
// Client Traits
// =============================================================================

/// A connection to one extension's RPC surface.
#[async_trait]
pub trait ExtensionClient: Send + Sync {
    /// Checks that the extension is accepting requests.
    async fn ping(&self) -> Result<()>;

    /// Forwards serialized parameters and returns the serialized result.
    async fn execute(&self, params: &str) -> Result<String>;
}

/// Produces clients for extension addresses.
pub trait ExtensionConnector: Send + Sync {
    /// A client for the extension listening at `addr`.
    ///
    /// Connecting is lazy; failures surface on the first call.
    fn connect(&self, addr: SocketAddr) -> Arc<dyn ExtensionClient>;
}

// =============================================================================
// TCP Client
// =============================================================================

/// JSON-lines client over TCP, one connection per request.
#[derive(Debug, Clone)]
pub struct TcpExtensionClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpExtensionClient {
    /// Creates a client for `addr` with a per-request timeout.
    #[must_use]
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    fn failure(&self, reason: impl std::fmt::Display) -> Error {
        Error::Extension {
            id: self.addr.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn send_request(&self, request: &Request) -> Result<Option<ResponseData>> {
        let stream = timeout(self.timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("connecting to extension at {}", self.addr),
                duration: self.timeout,
            })?
            .map_err(|e| self.failure(format!("connection failed: {e}")))?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader.take(MAX_EXTENSION_MESSAGE_SIZE as u64));

        let request_line = request.to_json_line()?;
        writer.write_all(request_line.as_bytes()).await?;
        writer.flush().await?;

        let mut response_line = String::new();
        let read = timeout(self.timeout, reader.read_line(&mut response_line))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("waiting for extension at {}", self.addr),
                duration: self.timeout,
            })??;
        if read == 0 {
            return Err(self.failure("connection closed before a response was received"));
        }

        match Response::from_json(&response_line)? {
            Response::Ok(ok) => Ok(ok.data),
            Response::Error(err) => Err(self.failure(format!("error {}: {}", err.code, err.message))),
        }
    }
}

#[async_trait]
impl ExtensionClient for TcpExtensionClient {
    async fn ping(&self) -> Result<()> {
        match self.send_request(&Request::Ping).await? {
            Some(ResponseData::Pong) | None => Ok(()),
            Some(other) => Err(self.failure(format!("unexpected ping response: {other:?}"))),
        }
    }

    async fn execute(&self, params: &str) -> Result<String> {
        let request = Request::Execute {
            params: params.to_string(),
        };
        match self.send_request(&request).await? {
            Some(ResponseData::Result { result }) => Ok(result),
            other => Err(self.failure(format!("unexpected execute response: {other:?}"))),
        }
    }
}

/// Connector producing [`TcpExtensionClient`]s.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector whose clients use `timeout` per request.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ExtensionConnector for TcpConnector {
    fn connect(&self, addr: SocketAddr) -> Arc<dyn ExtensionClient> {
        Arc::new(TcpExtensionClient::new(addr, self.timeout))
    }
}

// =============================================================================
// In-Memory Connector
// =============================================================================

type Handler = Arc<dyn Fn(&str) -> std::result::Result<String, String> + Send + Sync>;

struct InMemoryState {
    available: bool,
    connected: Vec<SocketAddr>,
    calls: Vec<(SocketAddr, String)>,
}

/// Connector answering every extension in-process.
///
/// Every client shares one handler. Availability can be switched off to
/// simulate an extension that never comes up.
pub struct InMemoryConnector {
    handler: Handler,
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryConnector {
    /// A connector whose extensions run `handler` on execute.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str) -> std::result::Result<String, String> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            state: Arc::new(Mutex::new(InMemoryState {
                available: true,
                connected: Vec::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// A connector whose extensions echo their parameters back.
    #[must_use]
    pub fn echo() -> Self {
        Self::new(|params| Ok(params.to_string()))
    }

    /// Makes ping succeed or fail for every client.
    pub fn set_available(&self, available: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.available = available;
        }
    }

    /// Addresses that clients were created for, in order.
    #[must_use]
    pub fn connected(&self) -> Vec<SocketAddr> {
        self.state.lock().map(|s| s.connected.clone()).unwrap_or_default()
    }

    /// Execute calls received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(SocketAddr, String)> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }
}

impl ExtensionConnector for InMemoryConnector {
    fn connect(&self, addr: SocketAddr) -> Arc<dyn ExtensionClient> {
        if let Ok(mut state) = self.state.lock() {
            state.connected.push(addr);
        }
        Arc::new(InMemoryClient {
            addr,
            handler: self.handler.clone(),
            state: self.state.clone(),
        })
    }
}

struct InMemoryClient {
    addr: SocketAddr,
    handler: Handler,
    state: Arc<Mutex<InMemoryState>>,
}

#[async_trait]
impl ExtensionClient for InMemoryClient {
    async fn ping(&self) -> Result<()> {
        let available = self
            .state
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?
            .available;
        if available {
            Ok(())
        } else {
            Err(Error::Extension {
                id: self.addr.to_string(),
                reason: "connection refused".to_string(),
            })
        }
    }

    async fn execute(&self, params: &str) -> Result<String> {
        self.state
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?
            .calls
            .push((self.addr, params.to_string()));
        (self.handler)(params).map_err(|reason| Error::Extension {
            id: self.addr.to_string(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Serves `count` connections, answering each request with `respond`.
    async fn serve(count: usize, respond: fn(Request) -> Response) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for _ in 0..count {
                let (stream, _) = listener.accept().await.unwrap();
                let (reader, mut writer) = stream.into_split();
                let mut reader = BufReader::new(reader);
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let response = respond(Request::from_json(&line).unwrap());
                writer
                    .write_all(response.to_json_line().unwrap().as_bytes())
                    .await
                    .unwrap();
            }
        });
        addr
    }

    fn answer(request: Request) -> Response {
        match request {
            Request::Ping => Response::ok_with_data(ResponseData::Pong),
            Request::Execute { params } if params == "bad" => Response::error(3, "bad params"),
            Request::Execute { params } => Response::ok_with_data(ResponseData::Result {
                result: params.to_uppercase(),
            }),
        }
    }

    #[test]
    fn test_wire_format() {
        let line = Request::Execute {
            params: "{}".to_string(),
        }
        .to_json_line()
        .unwrap();
        assert_eq!(line, "{\"action\":\"execute\",\"params\":\"{}\"}\n");

        let response = Response::from_json(r#"{"status":"error","code":3,"message":"nope"}"#).unwrap();
        assert_eq!(response, Response::error(3, "nope"));
        let response = Response::from_json(r#"{"status":"ok","data":{"type":"pong"}}"#).unwrap();
        assert_eq!(response, Response::ok_with_data(ResponseData::Pong));
    }

    #[tokio::test]
    async fn test_tcp_client_ping_and_execute() {
        let addr = serve(2, answer).await;
        let client = TcpExtensionClient::new(addr, Duration::from_secs(5));
        client.ping().await.unwrap();
        assert_eq!(client.execute("abc").await.unwrap(), "ABC");
    }

    #[tokio::test]
    async fn test_tcp_client_maps_error_response() {
        let addr = serve(1, answer).await;
        let client = TcpExtensionClient::new(addr, Duration::from_secs(5));
        let err = client.execute("bad").await.unwrap_err();
        assert!(matches!(err, Error::Extension { ref reason, .. } if reason.contains("bad params")));
    }

    #[tokio::test]
    async fn test_tcp_client_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = TcpExtensionClient::new(addr, Duration::from_secs(5));
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_connector_records_calls() {
        let connector = InMemoryConnector::echo();
        let addr: SocketAddr = "10.0.0.2:1111".parse().unwrap();
        let client = connector.connect(addr);
        client.ping().await.unwrap();
        assert_eq!(client.execute("x").await.unwrap(), "x");
        assert_eq!(connector.calls(), vec![(addr, "x".to_string())]);

        connector.set_available(false);
        assert!(client.ping().await.is_err());
    }
}
