//! Shared HTTP client and runtime.
//!
//! Uses async reqwest internally but presents a blocking `get_text` so
//! harvest pipelines can run on plain (rayon) threads.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use harvline_core::FailureClass;

/// Connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a request failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Non-success status
    Status { code: u16, message: String },
    /// Request or body read timed out
    Timeout(String),
    /// Could not reach the remote
    Connect(String),
    /// Connection dropped while reading the body
    Body(String),
    /// Request could not be built (bad URL, bad header)
    Request(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status { code, message } => write!(f, "HTTP {code}: {message}"),
            Self::Timeout(m) => write!(f, "timed out: {m}"),
            Self::Connect(m) => write!(f, "connect failed: {m}"),
            Self::Body(m) => write!(f, "body read failed: {m}"),
            Self::Request(m) => write!(f, "bad request: {m}"),
        }
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    /// Convert a reqwest error, dropping the URL so tokens in query strings
    /// never reach the logs.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        let status = e.status();
        let kind_timeout = e.is_timeout();
        let kind_connect = e.is_connect();
        let kind_body = e.is_body() || e.is_decode();
        let message = e.without_url().to_string();
        if let Some(status) = status {
            Self::Status {
                code: status.as_u16(),
                message,
            }
        } else if kind_timeout {
            Self::Timeout(message)
        } else if kind_connect {
            Self::Connect(message)
        } else if kind_body {
            Self::Body(message)
        } else {
            Self::Request(message)
        }
    }

    /// 408, 429, 5xx, timeouts and dropped connections are worth retrying;
    /// every other 4xx and malformed requests are not.
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::Status { code, .. } => match code {
                408 | 429 | 500..=599 => FailureClass::Transient,
                _ => FailureClass::Permanent,
            },
            Self::Timeout(_) | Self::Connect(_) | Self::Body(_) => FailureClass::Transient,
            Self::Request(_) => FailureClass::Permanent,
        }
    }
}

/// Shared async HTTP client with connection pooling.
static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(4)
        .user_agent(concat!("harvline/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to build HTTP client")
});

/// Shared tokio runtime for HTTP operations.
static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// Blocking GET returning the body as text.
pub fn get_text(
    url: &str,
    headers: &[(String, String)],
    timeout: Duration,
) -> Result<String, FetchError> {
    SHARED_RUNTIME.handle().block_on(async {
        let mut req = SHARED_CLIENT.get(url).timeout(timeout);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        let resp = req
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(FetchError::from_reqwest)?;
        resp.text().await.map_err(FetchError::from_reqwest)
    })
}
