// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use serde_json::json;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::admission::IngressRequest;
use crate::batch::{ContentType, TelemetryKind};
use crate::config::Environment;
use crate::errors::{AdmissionError, IngestError, ProxyError};
use crate::http_utils::{
    create_json_response, log_and_create_http_response, mask_response,
    verify_request_content_length, HttpResponse, REQUEST_ID_HEADER,
};
use crate::metrics::{HttpRequestMetrics, MetricsExporter};
use crate::pipeline::Pipeline;

const TRACES_PATH: &str = "/v1/traces";
const METRICS_PATH: &str = "/v1/metrics";
const LOGS_PATH: &str = "/v1/logs";
const LEGACY_TRACES_PATH: &str = "/api/v1/traces";
const HEALTH_PATH: &str = "/";
const STATUS_PATH: &str = "/status";
const PROMETHEUS_PATH: &str = "/metrics";

const DATA_TYPE_HEADER: &str = "x-data-type";
const RECORD_COUNT_HEADER: &str = "x-record-count";

/// How long open connections get to finish once the listener stops accepting.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Ingest(TelemetryKind),
    Health,
    Status,
    Prometheus,
    MethodNotAllowed,
    NotFound,
}

impl Route {
    fn of(method: &Method, path: &str) -> Route {
        match (method, path) {
            (&Method::POST, TRACES_PATH | LEGACY_TRACES_PATH) => {
                Route::Ingest(TelemetryKind::Trace)
            }
            (&Method::POST, METRICS_PATH) => Route::Ingest(TelemetryKind::Metric),
            (&Method::POST, LOGS_PATH) => Route::Ingest(TelemetryKind::Log),
            (&Method::GET, HEALTH_PATH) => Route::Health,
            (&Method::GET, STATUS_PATH) => Route::Status,
            (&Method::GET, PROMETHEUS_PATH) => Route::Prometheus,
            (_, path) if metric_path(path) != "unmatched" => Route::MethodNotAllowed,
            _ => Route::NotFound,
        }
    }
}

/// Path label for HTTP metrics. Unknown paths share one label.
fn metric_path(path: &str) -> &'static str {
    match path {
        TRACES_PATH => TRACES_PATH,
        METRICS_PATH => METRICS_PATH,
        LOGS_PATH => LOGS_PATH,
        LEGACY_TRACES_PATH => LEGACY_TRACES_PATH,
        HEALTH_PATH => HEALTH_PATH,
        STATUS_PATH => STATUS_PATH,
        PROMETHEUS_PATH => PROMETHEUS_PATH,
        _ => "unmatched",
    }
}

fn ingest_error_status(error: &IngestError) -> StatusCode {
    match error {
        IngestError::Admission(AdmissionError::PayloadTooLarge { .. }) => {
            StatusCode::PAYLOAD_TOO_LARGE
        }
        IngestError::Admission(AdmissionError::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
        IngestError::Admission(AdmissionError::Malformed(_))
        | IngestError::Admission(AdmissionError::UnexpectedDataType(_)) => StatusCode::BAD_REQUEST,
        IngestError::Admission(AdmissionError::UnsupportedContentType(_)) => {
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        }
        IngestError::Admission(AdmissionError::ShuttingDown) | IngestError::QueueFull => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn ingest_error_response(error: &IngestError) -> http::Result<HttpResponse> {
    let status = ingest_error_status(error);
    let mut response = log_and_create_http_response(&error.to_string(), status)?;
    if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::TOO_MANY_REQUESTS {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
    }
    Ok(response)
}

/// Browser access for the ingest routes. Preflights are answered by the layer itself; an
/// origin outside `origins` gets no `Access-Control-Allow-Origin` header.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::mirror_request()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(allow_origin)
}

fn header_string(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// HTTP front door: OTLP ingest routes plus health, status and metrics.
pub struct OtelProxy {
    pipeline: Arc<Pipeline>,
    environment: Environment,
    exporter: Option<MetricsExporter>,
    cors: CorsLayer,
}

impl OtelProxy {
    pub fn new(pipeline: Arc<Pipeline>, environment: Environment) -> Self {
        OtelProxy {
            pipeline,
            environment,
            exporter: None,
            cors: cors_layer(&[]),
        }
    }

    pub fn with_cors_origins(mut self, origins: &[String]) -> Self {
        self.cors = cors_layer(origins);
        self
    }

    pub fn with_metrics(mut self, exporter: MetricsExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Accepts connections until `shutdown` is cancelled, then gives open connections a
    /// bounded amount of time to finish. The pipeline itself is not shut down here.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ProxyError> {
        let server = hyper::server::conn::http1::Builder::new();
        let graceful = GracefulShutdown::new();
        let mut joinset = tokio::task::JoinSet::new();
        if let Ok(addr) = listener.local_addr() {
            info!("OTLP proxy listening on {addr}");
        }

        loop {
            let (conn, remote) = tokio::select! {
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok(accepted) => accepted,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
                _ = shutdown.cancelled() => break,
            };

            let proxy = self.clone();
            let service = ServiceBuilder::new().layer(self.cors.clone()).service_fn(
                move |req: Request<Incoming>| {
                    let proxy = proxy.clone();
                    async move { proxy.handle(req, Some(remote)).await }
                },
            );
            let conn = graceful.watch(
                server.serve_connection(TokioIo::new(conn), TowerToHyperService::new(service)),
            );
            joinset.spawn(async move {
                if let Err(e) = conn.await {
                    debug!("Connection error: {e}");
                }
            });
        }

        drop(listener);
        debug!("Listener closed, waiting for open connections");
        tokio::select! {
            _ = graceful.shutdown() => debug!("All connections closed"),
            _ = tokio::time::sleep(CONNECTION_DRAIN_TIMEOUT) => {
                warn!("Timed out waiting for open connections to close");
            }
        }
        Ok(())
    }

    /// Handles one request. Every response carries a fresh `x-request-id`.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        remote: Option<SocketAddr>,
    ) -> http::Result<HttpResponse>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "http_request",
            request_id = %request_id,
            method = %req.method(),
            path = %req.uri().path()
        );

        async move {
            let route = Route::of(req.method(), req.uri().path());
            let timer =
                HttpRequestMetrics::start(req.method().as_str(), metric_path(req.uri().path()));

            let mut response = match route {
                Route::Ingest(kind) => self.ingest_handler(kind, req, remote).await?,
                Route::Health => create_json_response(StatusCode::OK, &json!({ "msg": "ok" }))?,
                Route::Status => self.status_handler()?,
                Route::Prometheus => self.prometheus_handler().await?,
                Route::MethodNotAllowed => {
                    let mut not_allowed = Response::default();
                    *not_allowed.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
                    not_allowed
                }
                Route::NotFound => {
                    let mut not_found = Response::default();
                    *not_found.status_mut() = StatusCode::NOT_FOUND;
                    not_found
                }
            };

            if matches!(route, Route::Ingest(_)) && self.environment.is_production() {
                response = mask_response(response);
            }
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            timer.finish(response.status().as_u16());
            Ok(response)
        }
        .instrument(span)
        .await
    }

    async fn ingest_handler<B>(
        &self,
        kind: TelemetryKind,
        req: Request<B>,
        remote: Option<SocketAddr>,
    ) -> http::Result<HttpResponse>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let caller = remote.map(|addr| addr.ip().to_string());
        let clearance = match self.pipeline.clear_caller(caller.as_deref()) {
            Ok(clearance) => clearance,
            Err(e) => return ingest_error_response(&e),
        };

        let max_bytes = self.pipeline.max_batch_bytes();
        if let Some(response) = verify_request_content_length(
            &parts.headers,
            max_bytes,
            &format!("Error processing {kind} request"),
        ) {
            return response;
        }

        let payload = match Limited::new(body, max_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return log_and_create_http_response(
                    &format!("Error processing {kind} request: Payload too large"),
                    StatusCode::PAYLOAD_TOO_LARGE,
                );
            }
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Error reading {kind} request body: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let content_type = header_string(&parts.headers, header::CONTENT_TYPE);
        let response_type = content_type.as_deref().and_then(ContentType::from_header);
        let request = IngressRequest {
            kind,
            payload,
            content_type,
            data_type: header_string(&parts.headers, DATA_TYPE_HEADER),
            record_count: header_string(&parts.headers, RECORD_COUNT_HEADER),
            caller,
        };

        match self.pipeline.ingest_cleared(clearance, request).await {
            Ok(batch_id) => {
                debug!("Accepted {kind} batch {batch_id}");
                match response_type {
                    Some(ContentType::Protobuf) => Response::builder()
                        .status(StatusCode::OK)
                        .header(header::CONTENT_TYPE, ContentType::Protobuf.as_header_value())
                        .body(Full::new(Bytes::new())),
                    _ => create_json_response(StatusCode::OK, &json!({})),
                }
            }
            Err(e) => ingest_error_response(&e),
        }
    }

    fn status_handler(&self) -> http::Result<HttpResponse> {
        let response_json = json!(
            {
                "endpoints": [
                    TRACES_PATH,
                    METRICS_PATH,
                    LOGS_PATH,
                    LEGACY_TRACES_PATH,
                    HEALTH_PATH,
                    STATUS_PATH,
                    PROMETHEUS_PATH
                ],
                "environment": self.environment.as_str(),
                "shutting_down": self.pipeline.is_shutting_down(),
                "ledger": self.pipeline.ledger().snapshot(),
                "queues": self.pipeline.queue_statuses(),
                "backends": self.pipeline.backend_statuses(),
            }
        );
        create_json_response(StatusCode::OK, &response_json)
    }

    async fn prometheus_handler(&self) -> http::Result<HttpResponse> {
        match &self.exporter {
            Some(exporter) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(exporter.render().await))),
            None => log_and_create_http_response(
                "Metrics exporter is not configured",
                StatusCode::NOT_FOUND,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RecordBatch;
    use crate::config::Config;
    use crate::egress::{Deliverer, DeliveryOutcome};
    use crate::health::BackendTarget;
    use async_trait::async_trait;
    use duplicate::duplicate_item;
    use hyper::body::Frame;
    use serde_json::Value;
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};

    struct AcceptAll;

    #[async_trait]
    impl Deliverer for AcceptAll {
        async fn deliver(&self, _backend: &BackendTarget, _batch: &RecordBatch) -> DeliveryOutcome {
            DeliveryOutcome::Success
        }
    }

    fn proxy(environment: Environment, configure: impl FnOnce(&mut Config)) -> OtelProxy {
        let mut config = Config::default();
        config.admission.max_batch_bytes = 64;
        configure(&mut config);
        let pipeline = Pipeline::start(&config, Arc::new(AcceptAll)).unwrap();
        OtelProxy::new(pipeline, environment)
    }

    fn post(path: &str, content_type: &str, body: &'static [u8]) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, body.len())
            .header(DATA_TYPE_HEADER, "opentelemetry-sdk")
            .body(Full::new(Bytes::from_static(body)))
            .unwrap()
    }

    /// Records whether anything ever polled it for data.
    struct WatchedBody {
        inner: Full<Bytes>,
        polled: Arc<AtomicBool>,
    }

    impl Body for WatchedBody {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            let this = self.get_mut();
            this.polled.store(true, Ordering::SeqCst);
            Pin::new(&mut this.inner).poll_frame(cx)
        }
    }

    fn watched_post(polled: Arc<AtomicBool>) -> Request<WatchedBody> {
        Request::builder()
            .method(Method::POST)
            .uri("/v1/traces")
            .header(header::CONTENT_TYPE, "application/json")
            .header(DATA_TYPE_HEADER, "opentelemetry-sdk")
            .body(WatchedBody {
                inner: Full::new(Bytes::from_static(b"{}")),
                polled,
            })
            .unwrap()
    }

    async fn body_string(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[duplicate_item(
        test_name                   method           path                   expected;
        [test_route_traces]         [Method::POST]   ["/v1/traces"]         [Route::Ingest(TelemetryKind::Trace)];
        [test_route_legacy_traces]  [Method::POST]   ["/api/v1/traces"]     [Route::Ingest(TelemetryKind::Trace)];
        [test_route_metrics]        [Method::POST]   ["/v1/metrics"]        [Route::Ingest(TelemetryKind::Metric)];
        [test_route_logs]           [Method::POST]   ["/v1/logs"]           [Route::Ingest(TelemetryKind::Log)];
        [test_route_health]         [Method::GET]    ["/"]                  [Route::Health];
        [test_route_status]         [Method::GET]    ["/status"]            [Route::Status];
        [test_route_prometheus]     [Method::GET]    ["/metrics"]           [Route::Prometheus];
        [test_route_wrong_method]   [Method::GET]    ["/v1/traces"]         [Route::MethodNotAllowed];
        [test_route_unknown]        [Method::POST]   ["/v1/profiles"]       [Route::NotFound];
    )]
    #[test]
    fn test_name() {
        assert_eq!(Route::of(&method, path), expected);
    }

    #[tokio::test]
    async fn test_json_ingest_returns_empty_export_response() {
        let proxy = proxy(Environment::Development, |_| {});
        let response = proxy
            .handle(post("/v1/traces", "application/json", b"{\"resourceSpans\":[]}"), None)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        assert_eq!(body_string(response).await, "{}");
    }

    #[tokio::test]
    async fn test_protobuf_ingest_returns_empty_body() {
        let proxy = proxy(Environment::Development, |_| {});
        let response = proxy
            .handle(post("/v1/logs", "application/x-protobuf", b"\x0a\x00"), None)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-protobuf"
        );
        assert_eq!(body_string(response).await, "");
    }

    #[tokio::test]
    async fn test_request_ids_are_unique() {
        let proxy = proxy(Environment::Development, |_| {});
        let get = || Request::get("/").body(Full::new(Bytes::new())).unwrap();
        let first = proxy.handle(get(), None).await.unwrap();
        let second = proxy.handle(get(), None).await.unwrap();
        assert_ne!(
            first.headers()[REQUEST_ID_HEADER],
            second.headers()[REQUEST_ID_HEADER]
        );
    }

    #[tokio::test]
    async fn test_oversized_content_length_is_rejected_early() {
        let proxy = proxy(Environment::Development, |_| {});
        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/traces")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, "100000")
            .body(Full::new(Bytes::from_static(b"{}")))
            .unwrap();

        let response = proxy.handle(request, None).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_oversized_body_without_length_is_rejected() {
        let proxy = proxy(Environment::Development, |_| {});
        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/traces")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::TRANSFER_ENCODING, "chunked")
            .body(Full::new(Bytes::from(vec![b'x'; 1000])))
            .unwrap();

        let response = proxy.handle(request, None).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[duplicate_item(
        test_name                        content_type          header_value      expected;
        [test_unsupported_content_type]  ["text/plain"]        [Some("faro")]    [StatusCode::UNSUPPORTED_MEDIA_TYPE];
        [test_unexpected_data_type]      ["application/json"]  [Some("zipkin")]  [StatusCode::BAD_REQUEST];
        [test_missing_data_type]         ["application/json"]  [None]            [StatusCode::BAD_REQUEST];
        [test_faro_data_type_accepted]   ["application/json"]  [Some("faro")]    [StatusCode::OK];
    )]
    #[tokio::test]
    async fn test_name() {
        let proxy = proxy(Environment::Development, |_| {});
        let mut request = post("/v1/logs", content_type, b"{\"resourceLogs\":[]}");
        match header_value {
            Some(value) => {
                request
                    .headers_mut()
                    .insert(DATA_TYPE_HEADER, HeaderValue::from_static(value));
            }
            None => {
                request.headers_mut().remove(DATA_TYPE_HEADER);
            }
        }
        let response = proxy.handle(request, None).await.unwrap();
        assert_eq!(response.status(), expected);
    }

    #[tokio::test]
    async fn test_rate_limited_caller_gets_429() {
        let proxy = proxy(Environment::Development, |config| {
            config.admission.rate_limit_requests = 1;
        });
        let caller: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        let other: SocketAddr = "10.0.0.2:5555".parse().unwrap();

        let first = proxy
            .handle(post("/v1/traces", "application/json", b"{}"), Some(caller))
            .await
            .unwrap();
        let second = proxy
            .handle(post("/v1/traces", "application/json", b"{}"), Some(caller))
            .await
            .unwrap();
        let third = proxy
            .handle(post("/v1/traces", "application/json", b"{}"), Some(other))
            .await
            .unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()[header::RETRY_AFTER], "1");
        assert_eq!(third.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rate_limited_body_is_never_read() {
        let proxy = proxy(Environment::Development, |config| {
            config.admission.rate_limit_requests = 1;
        });
        let caller: SocketAddr = "10.0.0.3:5555".parse().unwrap();

        let admitted = Arc::new(AtomicBool::new(false));
        let first = proxy
            .handle(watched_post(admitted.clone()), Some(caller))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert!(admitted.load(Ordering::SeqCst));

        let limited = Arc::new(AtomicBool::new(false));
        let second = proxy
            .handle(watched_post(limited.clone()), Some(caller))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(!limited.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutting_down_body_is_never_read() {
        let proxy = proxy(Environment::Development, |config| {
            config.shutdown_grace = Duration::from_millis(10);
        });
        proxy.pipeline.shutdown().await;

        let polled = Arc::new(AtomicBool::new(false));
        let response = proxy
            .handle(watched_post(polled.clone()), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
        assert!(!polled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_production_masks_ingest_responses() {
        let proxy = proxy(Environment::Production, |_| {});
        let accepted = proxy
            .handle(post("/v1/traces", "application/json", b"{}"), None)
            .await
            .unwrap();
        let rejected = proxy
            .handle(post("/v1/traces", "text/plain", b"nope"), None)
            .await
            .unwrap();

        for response in [accepted, rejected] {
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
            assert_eq!(response.headers()["x-m-r"], "1");
            assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        }
    }

    #[tokio::test]
    async fn test_production_does_not_mask_health() {
        let proxy = proxy(Environment::Production, |_| {});
        let response = proxy
            .handle(Request::get("/").body(Full::new(Bytes::new())).unwrap(), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "{\"msg\":\"ok\"}");
    }

    #[tokio::test]
    async fn test_shutting_down_returns_503() {
        let proxy = proxy(Environment::Development, |config| {
            config.shutdown_grace = Duration::from_millis(10);
        });
        proxy.pipeline.shutdown().await;

        let response = proxy
            .handle(post("/v1/metrics", "application/json", b"{}"), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_string(response).await,
            "{\"message\":\"Proxy is shutting down\"}"
        );
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let proxy = proxy(Environment::Staging, |_| {});
        proxy
            .handle(post("/v1/traces", "application/json", b"{}"), None)
            .await
            .unwrap();
        let response = proxy
            .handle(
                Request::get("/status").body(Full::new(Bytes::new())).unwrap(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let status: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(status["environment"], "STAGING");
        assert_eq!(status["ledger"]["admitted_batches"], 1);
        assert_eq!(status["backends"][0]["id"], "default");
        assert_eq!(status["backends"][0]["state"], "healthy");
        assert!(status["endpoints"]
            .as_array()
            .unwrap()
            .contains(&Value::from("/v1/logs")));
    }

    #[tokio::test]
    async fn test_metrics_without_exporter_is_404() {
        let proxy = proxy(Environment::Development, |_| {});
        let response = proxy
            .handle(
                Request::get("/metrics").body(Full::new(Bytes::new())).unwrap(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_exposition() {
        let recorder = crate::metrics::build_recorder().unwrap();
        let exporter = MetricsExporter::from_handle(recorder.handle(), None);
        metrics::with_local_recorder(&recorder, || {
            crate::metrics::report_rejected("rate_limited");
        });

        let proxy = proxy(Environment::Development, |_| {}).with_metrics(exporter);
        let response = proxy
            .handle(
                Request::get("/metrics").body(Full::new(Bytes::new())).unwrap(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response)
            .await
            .contains("otel_proxy_batches_rejected_total{reason=\"rate_limited\"} 1"));
    }

    #[tokio::test]
    async fn test_unknown_path_is_404_with_request_id() {
        let proxy = proxy(Environment::Production, |_| {});
        let response = proxy
            .handle(post("/v1/profiles", "application/json", b"{}"), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    }
}
