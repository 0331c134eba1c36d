use crate::payment_processor::{PaymentProcessorError, endpoint_uri};
use crate::processor_type::ProcessorType;
use crate::selector::ProcessorSelector;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
pub struct ProcessorHealth {
    pub failing: bool,
    #[serde(rename = "minResponseTime")]
    pub min_response_time: u64,
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Slower than this counts as failing.
    pub max_acceptable_response_time: Duration,
}

pub struct HealthMonitor {
    urls: [Uri; 2],
    config: HealthMonitorConfig,
    selector: Arc<dyn ProcessorSelector>,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HealthMonitor {
    pub fn new(
        default_processor_url: &str,
        fallback_processor_url: &str,
        config: HealthMonitorConfig,
        selector: Arc<dyn ProcessorSelector>,
    ) -> Result<Self, PaymentProcessorError> {
        let urls = [
            endpoint_uri(default_processor_url, "/payments/service-health")?,
            endpoint_uri(fallback_processor_url, "/payments/service-health")?,
        ];
        let client =
            Client::builder(hyper_util::rt::TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            urls,
            config,
            selector,
            client,
        })
    }

    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                for processor in ProcessorType::ALL {
                    self.try_update_health(processor).await;
                }
            }

            tracing::info!("Health monitor stopped");
        })
    }

    async fn try_update_health(&self, processor: ProcessorType) {
        let url = &self.urls[processor.index()];
        match tokio::time::timeout(self.config.probe_timeout, self.probe_health(url)).await {
            Ok(Ok(health)) => {
                let failing = self.is_failing(&health);
                tracing::debug!(
                    processor = %processor,
                    health = ?health,
                    failing,
                    "Updated health for processor"
                );
                self.selector.apply_probe(processor, failing);
            }
            Ok(Err(err)) => {
                tracing::warn!(processor = %processor, error = %err, "Failed to update health for processor");
            }
            Err(_) => {
                tracing::warn!(processor = %processor, "Health probe timed out");
            }
        }
    }

    fn is_failing(&self, health: &ProcessorHealth) -> bool {
        health.failing
            || health.min_response_time > self.config.max_acceptable_response_time.as_millis() as u64
    }

    async fn probe_health(
        &self,
        uri: &Uri,
    ) -> Result<ProcessorHealth, Box<dyn std::error::Error + Send + Sync>> {
        let req = Request::builder()
            .uri(uri.clone())
            .method(Method::GET)
            .body(Empty::<Bytes>::new())?;

        let res = self.client.request(req).await?;

        if res.status() != hyper::StatusCode::OK {
            return Err(format!("Invalid status code: {}", res.status()).into());
        }

        let body = res.into_body().collect().await?.to_bytes();
        let health: ProcessorHealth = serde_json::from_slice(&body)?;

        Ok(health)
    }
}
