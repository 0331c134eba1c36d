#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use payments_worker::backoff::BackoffPolicy;
use payments_worker::ingestion::{self, AdmissionPolicy};
use payments_worker::ledger_writer::LedgerWriter;
use payments_worker::memory_store::MemoryLedgerStore;
use payments_worker::metrics::{AtomicMetrics, DispatchMetrics};
use payments_worker::payment::PaymentRecord;
use payments_worker::payment_processor::{ForwardOutcome, ProcessorClient};
use payments_worker::processor_type::ProcessorType;
use payments_worker::selector::ProcessorSelector;
use payments_worker::service::PaymentService;
use payments_worker::worker_pool::{WorkerDependencies, WorkerPool, WorkerPoolConfig};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Behavior = dyn Fn(ProcessorType, usize) -> ForwardOutcome + Send + Sync;

/// Processor client whose answers are scripted per target and per attempt.
pub struct ScriptedClient {
    behavior: Box<Behavior>,
    delay: Duration,
    calls: Mutex<HashMap<uuid::Uuid, Vec<ProcessorType>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedClient {
    pub fn new<F>(behavior: F) -> Self
    where
        F: Fn(ProcessorType, usize) -> ForwardOutcome + Send + Sync + 'static,
    {
        Self {
            behavior: Box::new(behavior),
            delay: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls_for(&self, correlation_id: uuid::Uuid) -> Vec<ProcessorType> {
        self.calls
            .lock()
            .unwrap()
            .get(&correlation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().map(Vec::len).sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessorClient for ScriptedClient {
    async fn forward(
        &self,
        target: ProcessorType,
        record: &PaymentRecord,
        _deadline: Duration,
    ) -> ForwardOutcome {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let attempts = calls.entry(record.correlation_id).or_default();
            attempts.push(target);
            attempts.len() - 1
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        (self.behavior)(target, attempt)
    }
}

pub fn fast_backoff(max_attempts: u32) -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(5),
        cap: Duration::from_millis(40),
        jitter_fraction: 0.1,
        max_attempts,
    }
}

pub fn pool_config(backoff: BackoffPolicy) -> WorkerPoolConfig {
    WorkerPoolConfig {
        num_workers: 4,
        retry_workers: 2,
        max_concurrency: 8,
        request_timeout: Duration::from_millis(500),
        backoff,
    }
}

pub struct Harness {
    pub store: MemoryLedgerStore,
    pub metrics: Arc<AtomicMetrics>,
    pub client: Arc<ScriptedClient>,
    pub service: PaymentService,
    pool: WorkerPool,
    ledger_handle: JoinHandle<()>,
}

impl Harness {
    pub fn start(
        client: ScriptedClient,
        selector: Arc<dyn ProcessorSelector>,
        config: WorkerPoolConfig,
        queue_capacity: usize,
    ) -> Self {
        let store = MemoryLedgerStore::new();
        let metrics = Arc::new(AtomicMetrics::new());
        let dispatch_metrics: Arc<dyn DispatchMetrics> = metrics.clone();
        let client = Arc::new(client);

        let (ledger, ledger_handle) =
            LedgerWriter::spawn(Arc::new(store.clone()), Arc::clone(&dispatch_metrics), 1024, 64);
        let (queue, receiver) = ingestion::channel(queue_capacity, AdmissionPolicy::RejectWhenFull);

        let pool = WorkerPool::start(
            config,
            receiver,
            WorkerDependencies {
                selector,
                client: client.clone(),
                ledger,
                metrics: Arc::clone(&dispatch_metrics),
            },
            CancellationToken::new(),
        );
        let service = PaymentService::new(queue, Arc::new(store.clone()), dispatch_metrics);

        Self {
            store,
            metrics,
            client,
            service,
            pool,
            ledger_handle,
        }
    }

    /// Stops the workers and waits for the ledger writer to flush.
    pub async fn stop(self, grace: Duration) -> (MemoryLedgerStore, Arc<AtomicMetrics>) {
        let Harness {
            store,
            metrics,
            service,
            pool,
            ledger_handle,
            ..
        } = self;
        drop(service);
        pool.shutdown(grace).await;
        ledger_handle.await.unwrap();
        (store, metrics)
    }
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A throw-away HTTP processor answering every request with `status` after
/// `delay`. Returns its base URL and the JSON bodies it received.
pub async fn spawn_processor(
    status: StatusCode,
    delay: Duration,
    body: &'static str,
) -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_server = seen.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let seen = seen_by_server.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let seen = seen.clone();
                    async move {
                        let bytes = req.into_body().collect().await?.to_bytes();
                        if let Ok(value) = serde_json::from_slice(&bytes) {
                            seen.lock().unwrap().push(value);
                        }
                        tokio::time::sleep(delay).await;
                        let mut res = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
                        *res.status_mut() = status;
                        Ok::<_, hyper::Error>(res)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (format!("http://{}", addr), seen)
}
