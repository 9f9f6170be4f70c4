//! HTTP transport seam.
//!
//! The dispatcher talks to an `HttpTransport` so budget accounting and
//! error mapping can be exercised against `FakeTransport` in tests.

use std::collections::VecDeque;
use std::time::Duration;

use lighter_core::BoxFuture;
use parking_lot::Mutex;
use reqwest::Client;
use tracing::debug;

/// Default timeout for API requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Transport-agnostic request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Form-encoded body (POST only).
    pub form: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            query: Vec::new(),
            form: Vec::new(),
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            query: Vec::new(),
            form: Vec::new(),
        }
    }

    #[must_use]
    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn form(mut self, key: &str, value: impl ToString) -> Self {
        self.form.push((key.to_string(), value.to_string()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    /// Parsed `Retry-After` header, if present.
    pub retry_after: Option<Duration>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429 || (!self.is_success() && self.body.to_ascii_lowercase().contains("rate limit"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Failed before any byte reached the network (connect/build errors).
    NotSent(String),
    Timeout,
    /// Failed after the request was sent.
    Io(String),
}

pub trait HttpTransport: Send + Sync {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>>;
}

/// `reqwest`-backed transport.
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::NotSent(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() || e.is_builder() {
        TransportError::NotSent(e.to_string())
    } else {
        TransportError::Io(e.to_string())
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            let url = format!("{}{}", self.base_url, request.path);
            debug!(method = ?request.method, %url, "HTTP request");

            let builder = match request.method {
                HttpMethod::Get => self.client.get(&url).query(&request.query),
                HttpMethod::Post => self
                    .client
                    .post(&url)
                    .query(&request.query)
                    .form(&request.form),
            };

            let response = builder.send().await.map_err(map_reqwest_error)?;
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.map_err(map_reqwest_error)?;

            Ok(HttpResponse {
                status,
                body,
                retry_after,
            })
        })
    }
}

/// Scripted transport for testing.
///
/// Responses are served in FIFO order; when the script is empty every
/// request gets `200 {}`. All requests are recorded.
#[derive(Debug, Default)]
pub struct FakeTransport {
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    routes: Mutex<Vec<(String, HttpResponse)>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot result.
    pub fn push(&self, result: Result<HttpResponse, TransportError>) {
        self.script.lock().push_back(result);
    }

    pub fn push_ok(&self, body: impl Into<String>) {
        self.push(Ok(HttpResponse::ok(body)));
    }

    /// Serve `response` for every request to `path` once the script is empty.
    pub fn route(&self, path: &str, response: HttpResponse) {
        let mut routes = self.routes.lock();
        routes.retain(|(p, _)| p != path);
        routes.push((path.to_string(), response));
    }

    /// Sleep this long before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self, path: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.path == path).count()
    }
}

impl HttpTransport for FakeTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let scripted = self.script.lock().pop_front();
            let result = scripted.unwrap_or_else(|| {
                let routed = self
                    .routes
                    .lock()
                    .iter()
                    .find(|(p, _)| *p == request.path)
                    .map(|(_, r)| r.clone());
                Ok(routed.unwrap_or_else(|| HttpResponse::ok("{}")))
            });
            self.requests.lock().push(request);
            result
        })
    }
}
