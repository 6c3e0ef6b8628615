// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use std::{env, process::ExitCode, sync::Arc};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use otel_collector_proxy::{
    config::{Config, Environment},
    egress::HttpDeliverer,
    errors::ProxyError,
    metrics::MetricsExporter,
    pipeline::Pipeline,
    proxy::OtelProxy,
};

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let environment = env::var("ENVIRONMENT")
        .ok()
        .and_then(|val| Environment::parse(&val))
        .unwrap_or_default();

    init_logging(&log_level, environment);
    debug!("Logging subsystem enabled");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("OTLP proxy stopped: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::expect_used)]
fn init_logging(log_level: &str, environment: Environment) {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    let builder = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    if environment.json_logs() {
        tracing::subscriber::set_global_default(builder.json().finish())
            .expect("setting default subscriber failed");
    } else {
        tracing::subscriber::set_global_default(builder.without_time().finish())
            .expect("setting default subscriber failed");
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        "Starting OTLP proxy in {} with {} backends",
        config.environment.as_str(),
        config.backends.len()
    );

    let exporter = match MetricsExporter::install(config.metrics_dir.clone()) {
        Ok(exporter) => Some(exporter),
        Err(e) => {
            error!("Metrics will not be exported: {e}");
            None
        }
    };

    let deliverer = HttpDeliverer::new(
        config.https_proxy.as_deref(),
        config.delivery.attempt_timeout,
    )?;
    let pipeline = Pipeline::start(&config, Arc::new(deliverer))?;

    let addr = config.listen_addr();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ProxyError::Bind { addr, source })?;

    let mut proxy = OtelProxy::new(pipeline.clone(), config.environment)
        .with_cors_origins(&config.cors_origins);
    if let Some(exporter) = exporter.clone() {
        proxy = proxy.with_metrics(exporter);
    }

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(Arc::new(proxy).serve(listener, shutdown.clone()));

    let stopped_early = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal, no longer accepting connections");
            None
        }
        result = &mut server => {
            error!("HTTP server stopped unexpectedly");
            Some(result)
        }
    };

    // Open connections and the pipeline drain side by side against one deadline.
    let deadline = Instant::now() + config.shutdown_grace;
    shutdown.cancel();
    let connections = async {
        if let Some(result) = stopped_early {
            return Some(result);
        }
        match tokio::time::timeout_at(deadline, &mut server).await {
            Ok(result) => Some(result),
            Err(_) => {
                warn!("Open connections outlived the grace period, closing them");
                server.abort();
                None
            }
        }
    };
    let (served, report) = tokio::join!(connections, pipeline.shutdown_by(deadline));

    info!(
        "Shutdown {} after {} ms: {} admitted, {} delivered, {} dead-lettered, {} shed",
        if report.clean { "clean" } else { "incomplete" },
        report.elapsed.as_millis(),
        report.snapshot.admitted_batches,
        report.snapshot.delivered_batches,
        report.snapshot.dead_lettered_batches,
        report.snapshot.shed_batches
    );
    if let Some(exporter) = exporter {
        exporter.write_snapshot().await;
    }

    if let Some(served) = served {
        served.context("HTTP server task failed")??;
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        }
        _ = terminate => {}
    }
}
