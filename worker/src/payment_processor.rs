use crate::payment::PaymentRecord;
use crate::processor_type::ProcessorType;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Connect,
    Transport,
    Status(u16),
    Encode,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "deadline elapsed"),
            FailureKind::Connect => write!(f, "connection failed"),
            FailureKind::Transport => write!(f, "transport error"),
            FailureKind::Status(code) => write!(f, "unexpected status {}", code),
            FailureKind::Encode => write!(f, "payment could not be encoded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    Success,
    Failure(FailureKind),
}

impl ForwardOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ForwardOutcome::Success)
    }
}

/// Posts payment records to a downstream processor. Never fails past this
/// boundary: every problem comes back as `ForwardOutcome::Failure`.
#[async_trait]
pub trait ProcessorClient: Send + Sync {
    async fn forward(
        &self,
        target: ProcessorType,
        record: &PaymentRecord,
        deadline: Duration,
    ) -> ForwardOutcome;
}

#[derive(Debug)]
pub enum PaymentProcessorError {
    InvalidUrl(String),
}

impl fmt::Display for PaymentProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentProcessorError::InvalidUrl(url) => write!(f, "invalid processor url: {}", url),
        }
    }
}

impl std::error::Error for PaymentProcessorError {}

#[derive(Debug, Clone)]
pub struct ProcessorClientConfig {
    pub default_url: String,
    pub fallback_url: String,
    pub connect_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

pub struct PaymentProcessor {
    endpoints: [Uri; 2],
    client: Client<HttpConnector, Full<Bytes>>,
}

/// Parses `{base}{path}` and insists on an absolute http URL.
pub(crate) fn endpoint_uri(base: &str, path: &str) -> Result<Uri, PaymentProcessorError> {
    let url = format!("{}{}", base.trim_end_matches('/'), path);
    let uri = url
        .parse::<Uri>()
        .map_err(|_| PaymentProcessorError::InvalidUrl(url.clone()))?;

    if uri.scheme_str() != Some("http") || uri.authority().is_none() {
        return Err(PaymentProcessorError::InvalidUrl(url));
    }

    Ok(uri)
}

impl PaymentProcessor {
    pub fn new(config: &ProcessorClientConfig) -> Result<Self, PaymentProcessorError> {
        let default = endpoint_uri(&config.default_url, "/payments")?;
        let fallback = endpoint_uri(&config.fallback_url, "/payments")?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_timer(TokioTimer::new())
            .build(connector);

        Ok(Self {
            endpoints: [default, fallback],
            client,
        })
    }

    pub fn endpoint(&self, target: ProcessorType) -> &Uri {
        &self.endpoints[target.index()]
    }

    async fn send(&self, target: ProcessorType, body: Vec<u8>) -> ForwardOutcome {
        let req = match Request::builder()
            .method(Method::POST)
            .uri(self.endpoint(target).clone())
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .header(hyper::header::ACCEPT, "application/json")
            .body(Full::new(Bytes::from(body)))
        {
            Ok(req) => req,
            Err(_) => return ForwardOutcome::Failure(FailureKind::Encode),
        };

        let response = match self.client.request(req).await {
            Ok(response) => response,
            Err(e) if e.is_connect() => return ForwardOutcome::Failure(FailureKind::Connect),
            Err(_) => return ForwardOutcome::Failure(FailureKind::Transport),
        };
        let status = response.status();

        // Drain so the connection goes back to the pool.
        if response.into_body().collect().await.is_err() {
            return ForwardOutcome::Failure(FailureKind::Transport);
        }

        if status.is_success() {
            ForwardOutcome::Success
        } else {
            ForwardOutcome::Failure(FailureKind::Status(status.as_u16()))
        }
    }
}

#[async_trait]
impl ProcessorClient for PaymentProcessor {
    async fn forward(
        &self,
        target: ProcessorType,
        record: &PaymentRecord,
        deadline: Duration,
    ) -> ForwardOutcome {
        let body = match serde_json::to_vec(record) {
            Ok(body) => body,
            Err(_) => return ForwardOutcome::Failure(FailureKind::Encode),
        };

        match tokio::time::timeout(deadline, self.send(target, body)).await {
            Ok(outcome) => outcome,
            Err(_) => ForwardOutcome::Failure(FailureKind::Timeout),
        }
    }
}
