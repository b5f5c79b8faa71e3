//! # OpenSearch Operator
//!
//! Process entrypoint: logging, metrics/probe server, Kubernetes client
//! construction and the operator loop. `SIGINT`/`SIGTERM` exit hard;
//! reconciliation is idempotent and resumes on restart.

use anyhow::{Context as _, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use opensearch_operator::k8s::Applier;
use opensearch_operator::metrics;
use opensearch_operator::operator::Operator;
use opensearch_operator::reconciler::{credentials::SharedMetricsPassword, Context};
use opensearch_operator::server::{start_server, ServerState};
use opensearch_operator::templates::TemplateSet;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("Starting OpenSearch Operator");

    metrics::register_metrics()?;

    let server_state = Arc::new(ServerState {
        is_ready: AtomicBool::new(false),
    });
    let server_port = std::env::var("METRICS_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .unwrap_or(8080);
    let state = Arc::clone(&server_state);
    tokio::spawn(async move {
        if let Err(e) = start_server(server_port, state).await {
            error!("HTTP server error: {}", e);
        }
    });

    let templates_dir = std::env::var("TEMPLATES_DIR").unwrap_or_else(|_| "templates".into());
    let templates = TemplateSet::load(&templates_dir)
        .with_context(|| format!("failed to load templates from {templates_dir}"))?;

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let operator_namespace = client.default_namespace().to_string();

    // One pooled client for every OpenSearch REST conversation. The timeout
    // covers individual requests; the health watchers pace themselves.
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    let ctx = Arc::new(Context {
        applier: Applier::new(client),
        http,
        templates,
        metrics_password: SharedMetricsPassword::default(),
        operator_namespace,
    });

    server_state.is_ready.store(true, Ordering::Relaxed);

    let operator = Operator::new(ctx);
    tokio::select! {
        result = operator.run() => {
            result.context("operator loop failed")?;
        }
        () = shutdown_signal() => {
            info!("shutdown signal received, exiting");
        }
    }

    Ok(())
}

fn init_tracing() {
    // RUST_LOG wins when set; otherwise LOG_LEVEL picks the operator's own
    // level (default DEBUG).
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL")
            .unwrap_or_else(|_| "DEBUG".into())
            .to_lowercase();
        EnvFilter::new(format!("opensearch_operator={level}"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
