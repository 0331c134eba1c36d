use crate::ingestion::SubmitError;
use crate::metrics::AtomicMetrics;
use crate::payment::Payment;
use crate::service::PaymentService;
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited, combinators::BoxBody};
use hyper::body::{Body, Bytes};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;

type ResponseBody = BoxBody<Bytes, Infallible>;
type BodyError = Box<dyn std::error::Error + Send + Sync>;

const MAX_PAYMENT_BODY: usize = 4 * 1024;

#[derive(Debug, Clone)]
pub enum Listen {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

#[derive(Debug)]
pub enum ServerError {
    Bind(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(e) => write!(f, "failed to bind listener: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

pub struct AppState {
    pub service: PaymentService,
    pub metrics: Arc<AtomicMetrics>,
}

fn empty() -> ResponseBody {
    Empty::<Bytes>::new().boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> ResponseBody {
    Full::new(chunk.into()).boxed()
}

fn status(code: StatusCode) -> Response<ResponseBody> {
    let mut res = Response::new(empty());
    *res.status_mut() = code;
    res
}

fn json<T: serde::Serialize>(value: &T) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut ok = Response::new(full(body));
            ok.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            ok
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode response");
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn parse_query_params<B>(req: &Request<B>) -> HashMap<String, String> {
    let query = req.uri().query().unwrap_or("");
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn parse_bound(params: &HashMap<String, String>, name: &str) -> Result<Option<OffsetDateTime>, ()> {
    match params.get(name) {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => OffsetDateTime::parse(raw, &Rfc3339).map(Some).map_err(|_| ()),
    }
}

async fn payments_handler<B>(req: Request<B>, state: &AppState) -> Response<ResponseBody>
where
    B: Body,
    B::Error: Into<BodyError>,
{
    let body = match Limited::new(req.into_body(), MAX_PAYMENT_BODY).collect().await {
        Ok(body) => body.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => return status(StatusCode::PAYLOAD_TOO_LARGE),
        Err(e) => {
            tracing::debug!(error = %e, "Failed to read request body");
            return status(StatusCode::BAD_REQUEST);
        }
    };

    let payment = match serde_json::from_slice::<Payment>(&body) {
        Ok(payment) => payment,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected malformed payment");
            return status(StatusCode::BAD_REQUEST);
        }
    };

    match state.service.submit_payment(payment).await {
        Ok(()) => status(StatusCode::ACCEPTED),
        Err(SubmitError::Backpressure) | Err(SubmitError::Closed) => {
            status(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn payments_summary_handler(
    params: HashMap<String, String>,
    state: &AppState,
) -> Response<ResponseBody> {
    let (Ok(from), Ok(to)) = (parse_bound(&params, "from"), parse_bound(&params, "to")) else {
        return status(StatusCode::BAD_REQUEST);
    };

    match state.service.get_summary(from, to).await {
        Ok(summary) => json(&summary),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read payments summary");
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn route<B>(req: Request<B>, state: Arc<AppState>) -> Result<Response<ResponseBody>, Infallible>
where
    B: Body,
    B::Error: Into<BodyError>,
{
    let res = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => Response::new(full("OK")),
        (&Method::POST, "/payments") => payments_handler(req, &state).await,
        (&Method::GET, "/payments-summary") => {
            payments_summary_handler(parse_query_params(&req), &state).await
        }
        (&Method::POST, "/purge-payments") => match state.service.purge().await {
            Ok(()) => status(StatusCode::OK),
            Err(e) => {
                tracing::error!(error = %e, "Failed to purge payments");
                status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        },
        (&Method::GET, "/metrics") => json(&state.metrics.snapshot()),
        _ => status(StatusCode::NOT_FOUND),
    };
    Ok(res)
}

fn serve_connection<IO>(io: IO, state: Arc<AppState>)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(io);
    tokio::task::spawn(async move {
        if let Err(err) = http1::Builder::new()
            .keep_alive(true)
            .half_close(false)
            .writev(true)
            .max_buf_size(16 * 1024)
            .serve_connection(io, service_fn(move |req| route(req, Arc::clone(&state))))
            .await
        {
            tracing::debug!(error = ?err, "Error serving connection");
        }
    });
}

/// Accepts connections until `shutdown` is cancelled.
pub async fn serve(
    listen: Listen,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    match listen {
        Listen::Unix(path) => {
            if std::fs::metadata(&path).is_ok() {
                let _ = std::fs::remove_file(&path);
            }
            let listener = UnixListener::bind(&path).map_err(ServerError::Bind)?;
            if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)) {
                tracing::warn!(error = %e, "Failed to set permissions on socket");
            }
            tracing::info!(path = %path.display(), "Listening");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => serve_connection(stream, Arc::clone(&state)),
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                }
            }
            let _ = std::fs::remove_file(&path);
        }
        Listen::Tcp(addr) => {
            let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
            tracing::info!(%addr, "Listening");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let _ = stream.set_nodelay(true);
                            serve_connection(stream, Arc::clone(&state));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                }
            }
        }
    }

    tracing::info!("Server stopped accepting connections");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::{self, AdmissionPolicy, IngestionReceiver};
    use crate::memory_store::MemoryLedgerStore;
    use crate::processor_type::ProcessorType;
    use crate::store::{LedgerEntry, LedgerStore};
    use rust_decimal_macros::dec;

    fn state(capacity: usize) -> (Arc<AppState>, MemoryLedgerStore, IngestionReceiver) {
        let (queue, receiver) = ingestion::channel(capacity, AdmissionPolicy::RejectWhenFull);
        let store = MemoryLedgerStore::new();
        let metrics = Arc::new(AtomicMetrics::new());
        let service = PaymentService::new(queue, Arc::new(store.clone()), metrics.clone());
        (Arc::new(AppState { service, metrics }), store, receiver)
    }

    fn request(method: Method, uri: &str, body: impl Into<Bytes>) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body.into()))
            .unwrap()
    }

    async fn body_json(res: Response<ResponseBody>) -> serde_json::Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn accepts_payment_then_reports_backpressure() {
        let (state, _store, receiver) = state(1);
        let body = r#"{"correlationId":"4a7901b8-7d26-4d9d-aa19-4dc1c7cf60b3","amount":19.90}"#;

        let res = route(request(Method::POST, "/payments", body), state.clone()).await.unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let res = route(request(Method::POST, "/payments", body), state.clone()).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        let queued = receiver.recv().await.unwrap();
        assert_eq!(queued.amount, dec!(19.90));
    }

    #[tokio::test]
    async fn malformed_payment_is_bad_request() {
        let (state, _store, _receiver) = state(4);
        let res = route(request(Method::POST, "/payments", r#"{"amount":"#), state)
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_payment_body_is_refused() {
        let (state, _store, receiver) = state(4);
        let padding = " ".repeat(MAX_PAYMENT_BODY);
        let body = format!(
            r#"{{"correlationId":"4a7901b8-7d26-4d9d-aa19-4dc1c7cf60b3","amount":19.90{}}}"#,
            padding
        );

        let res = route(request(Method::POST, "/payments", body), state.clone()).await.unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(receiver.try_recv().await.is_none());
        assert_eq!(state.metrics.snapshot().accepted, 0);
    }

    #[tokio::test]
    async fn summary_returns_both_processors() {
        let (state, store, _receiver) = state(4);
        store
            .append(&LedgerEntry {
                processor: ProcessorType::Fallback,
                correlation_id: uuid::Uuid::new_v4(),
                amount: dec!(12.25),
                timestamp_ms: 1_752_580_800_000,
            })
            .await
            .unwrap();

        let uri = "/payments-summary?from=2025-07-15T12:00:00.000Z&to=2025-07-15T12:00:00.000Z";
        let res = route(request(Method::GET, uri, ""), state.clone()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let json = body_json(res).await;
        assert_eq!(json["default"]["totalRequests"], 0);
        assert_eq!(json["fallback"]["totalRequests"], 1);
        assert_eq!(json["fallback"]["totalAmount"], 12.25);
    }

    #[tokio::test]
    async fn unparsable_window_is_bad_request() {
        let (state, _store, _receiver) = state(4);
        let res = route(request(Method::GET, "/payments-summary?from=yesterday", ""), state)
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn purge_health_metrics_and_unknown_routes() {
        let (state, _store, _receiver) = state(4);

        let res = route(request(Method::POST, "/purge-payments", ""), state.clone()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = route(request(Method::GET, "/health", ""), state.clone()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = route(request(Method::GET, "/metrics", ""), state.clone()).await.unwrap();
        assert_eq!(body_json(res).await["accepted"], 0);

        let res = route(request(Method::DELETE, "/payments", ""), state).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
