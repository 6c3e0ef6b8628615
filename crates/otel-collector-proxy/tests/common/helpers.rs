// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use otel_collector_proxy::config::{Config, Environment};
use otel_collector_proxy::egress::HttpDeliverer;
use otel_collector_proxy::errors::ProxyError;
use otel_collector_proxy::health::BackendConfig;
use otel_collector_proxy::pipeline::{Pipeline, ShutdownReport};
use otel_collector_proxy::proxy::OtelProxy;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// A proxy serving on an ephemeral local port
pub struct RunningProxy {
    pub port: u16,
    pub pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
    server: JoinHandle<Result<(), ProxyError>>,
}

impl RunningProxy {
    /// Stops the listener, then drains the pipeline
    pub async fn stop(self) -> ShutdownReport {
        self.shutdown.cancel();
        let served = self.server.await.expect("Server task panicked");
        assert!(served.is_ok(), "Server returned an error: {served:?}");
        self.pipeline.shutdown().await
    }
}

/// Development settings tuned for fast tests, delivering to the given backends
#[allow(dead_code)]
pub fn test_config(backends: Vec<BackendConfig>) -> Config {
    let mut config = Config {
        environment: Environment::Development,
        backends,
        ..Default::default()
    };
    config.admission.rate_limit_requests = 10_000;
    config.batcher.flush_interval = Duration::from_millis(50);
    config.delivery.attempt_timeout = Duration::from_secs(2);
    config.delivery.retry.base_delay = Duration::from_millis(10);
    config.delivery.retry.max_delay = Duration::from_millis(50);
    config.shutdown_grace = Duration::from_secs(2);
    config
}

#[allow(dead_code)]
pub fn backend(id: &str, url: &str) -> BackendConfig {
    BackendConfig {
        id: id.to_string(),
        endpoint: url.to_string(),
        weight: 1,
        source: Default::default(),
    }
}

#[allow(dead_code)]
pub async fn start_proxy(config: Config) -> RunningProxy {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind proxy");
    let port = listener.local_addr().expect("Failed to get local addr").port();

    let deliverer = HttpDeliverer::new(None, config.delivery.attempt_timeout)
        .expect("Failed to build deliverer");
    let pipeline = Pipeline::start(&config, Arc::new(deliverer)).expect("Failed to start pipeline");
    let proxy = Arc::new(
        OtelProxy::new(pipeline.clone(), config.environment)
            .with_cors_origins(&config.cors_origins),
    );

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(proxy.serve(listener, shutdown.clone()));

    RunningProxy {
        port,
        pipeline,
        shutdown,
        server,
    }
}

/// Send an HTTP request over TCP and return the response. POSTs are tagged as coming from
/// an OpenTelemetry SDK.
#[allow(dead_code)]
pub async fn send_tcp_request(
    port: u16,
    uri: &str,
    method: &str,
    content_type: Option<&str>,
    body: Option<Vec<u8>>,
) -> Result<Response<hyper::body::Incoming>, Box<dyn std::error::Error>> {
    let mut headers = Vec::new();
    if let Some(content_type) = content_type {
        headers.push(("Content-Type", content_type));
    }
    if method == "POST" {
        headers.push(("X-Data-Type", "opentelemetry-sdk"));
    }
    send_tcp_request_with_headers(port, uri, method, &headers, body).await
}

/// Send an HTTP request with exactly the given headers
#[allow(dead_code)]
pub async fn send_tcp_request_with_headers(
    port: u16,
    uri: &str,
    method: &str,
    headers: &[(&str, &str)],
    body: Option<Vec<u8>>,
) -> Result<Response<hyper::body::Incoming>, Box<dyn std::error::Error>> {
    let stream = timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port)),
    )
    .await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut request_builder = Request::builder().uri(uri).method(method);
    for (name, value) in headers {
        request_builder = request_builder.header(*name, *value);
    }

    let response = if let Some(body_data) = body {
        let body_len = body_data.len();
        request_builder = request_builder.header("Content-Length", body_len.to_string());
        let request = request_builder.body(Full::new(Bytes::from(body_data)))?;
        timeout(Duration::from_secs(2), sender.send_request(request)).await??
    } else {
        let request = request_builder.body(Full::new(Bytes::new()))?;
        timeout(Duration::from_secs(2), sender.send_request(request)).await??
    };

    Ok(response)
}

#[allow(dead_code)]
pub async fn response_body(response: Response<hyper::body::Incoming>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read response body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("Response body is not UTF-8")
}

/// Polls `condition` every 10ms until it holds or `limit` passes
#[allow(dead_code)]
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
