use std::{
    fmt,
    future::Future,
    io,
    time::Duration,
};

use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

use crate::{
    anki::api::RpcCall,
    core::BridgeError,
};

/// What went wrong below the JSON envelope, i.e. no usable response arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Nothing listening on the port: Anki closed or AnkiConnect missing.
    Refused,
    /// Connection dropped mid-request. Anki does this while busy or restarting its listener.
    Reset,
    Timeout,
    /// A response arrived but was not a `{result, error}` envelope.
    Malformed,
    Status(u16),
    /// The request itself could not be built.
    Request,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Refused => write!(f, "connection refused"),
            FailureKind::Reset => write!(f, "connection reset"),
            FailureKind::Timeout => write!(f, "timed out"),
            FailureKind::Malformed => write!(f, "malformed response"),
            FailureKind::Status(code) => write!(f, "HTTP {}", code),
            FailureKind::Request => write!(f, "invalid request"),
            FailureKind::Other => write!(f, "transport error"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct TransportFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl TransportFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    pub fn from_reqwest(error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            FailureKind::Timeout
        } else if let Some(io_kind) = io_error_kind(&error) {
            match io_kind {
                io::ErrorKind::ConnectionRefused => FailureKind::Refused,
                io::ErrorKind::TimedOut => FailureKind::Timeout,
                _ => FailureKind::Reset,
            }
        } else if error.is_connect() {
            FailureKind::Refused
        } else if error.is_decode() {
            FailureKind::Malformed
        } else if error.is_builder() {
            FailureKind::Request
        } else if let Some(status) = error.status() {
            FailureKind::Status(status.as_u16())
        } else if error.is_request() || error.is_body() {
            //hyper reports a dropped keep-alive as "connection closed before message completed"
            FailureKind::Reset
        } else {
            FailureKind::Other
        };

        Self::new(kind, error.to_string())
    }
}

fn io_error_kind(error: &(dyn std::error::Error + 'static)) -> Option<io::ErrorKind> {
    let mut source = Some(error);
    while let Some(err) = source {
        if let Some(io_error) = err.downcast_ref::<io::Error>() {
            return Some(io_error.kind());
        }
        source = err.source();
    }
    None
}

/// One request, one response. Implementations must honour `timeout`.
pub trait Transport: Send + Sync {
    fn post(
        &self,
        call: &RpcCall,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, TransportFailure>> + Send;
}

pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    /// Every request gets its own connection. AnkiConnect serves one client at
    /// a time and drops idle keep-alive connections.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, BridgeError> {
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| BridgeError::Config(format!("HTTP client build failed: {e}")))?;
        Ok(Self { client, endpoint: endpoint.into() })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Transport for HttpTransport {
    async fn post(&self, call: &RpcCall, timeout: Duration) -> Result<Value, TransportFailure> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(call)
            .timeout(timeout)
            .send()
            .await
            .map_err(TransportFailure::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportFailure::new(
                FailureKind::Status(status.as_u16()),
                format!("HTTP error {} from {}", status, self.endpoint),
            ));
        }

        response.json::<Value>().await.map_err(TransportFailure::from_reqwest)
    }
}
