//! ---
//! morse_section: "04-observability"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Metrics collection and export utilities."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across stages.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let local_addr = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %local_addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Render the registry in the Prometheus text format.
pub fn render(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    match render(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct ProcessMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: IntGaugeVec,
}

impl ProcessMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "morsed_starts_total",
            "Total number of times a relay stage process has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.0005, 2.0, 12)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "morsed_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = IntGaugeVec::new(
            Opts::new("morsed_build_info", "Build metadata for the running binary"),
            &["version", "stage"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, stage: &str) {
        self.build_info.with_label_values(&[version, stage]).set(1);
    }
}

/// Per-stage delivery and playback metrics, labelled by stage name.
#[derive(Clone, Debug)]
pub struct StageMetrics {
    stage: String,
    received: IntCounterVec,
    published: IntCounterVec,
    publish_failures: IntCounterVec,
    duplicates: IntCounterVec,
    malformed: IntCounterVec,
    transform_failures: IntCounterVec,
    connects: IntCounterVec,
    upstream_online: IntGaugeVec,
    playback: IntCounterVec,
}

impl StageMetrics {
    pub fn new(registry: &Registry, stage: impl Into<String>) -> Result<Self> {
        let counter = |name: &str, help: &str| -> Result<IntCounterVec> {
            let vec = IntCounterVec::new(Opts::new(name, help), &["stage"])?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };
        let received = counter(
            "morse_envelopes_received_total",
            "Envelopes delivered on subscribed event topics",
        )?;
        let published = counter(
            "morse_envelopes_published_total",
            "Envelopes published on the stage output topic",
        )?;
        let publish_failures = counter(
            "morse_publish_failures_total",
            "Publishes rejected by the transport",
        )?;
        let duplicates = counter(
            "morse_envelopes_duplicates_total",
            "Immediate redeliveries suppressed by the dedup gate",
        )?;
        let malformed = counter(
            "morse_envelopes_malformed_total",
            "Frames that could not be decoded",
        )?;
        let transform_failures = counter(
            "morse_transform_failures_total",
            "Envelopes dropped because the stage transform failed",
        )?;
        let connects = counter(
            "morse_broker_connects_total",
            "Broker sessions established, including reconnects",
        )?;

        let upstream_online = IntGaugeVec::new(
            Opts::new(
                "morse_upstream_online",
                "Indicator (0/1) whether a watched upstream stage is online",
            ),
            &["stage", "upstream"],
        )?;
        registry.register(Box::new(upstream_online.clone()))?;

        let playback = IntCounterVec::new(
            Opts::new(
                "morse_playback_events_total",
                "Signal playbacks by outcome",
            ),
            &["stage", "outcome"],
        )?;
        registry.register(Box::new(playback.clone()))?;

        Ok(Self {
            stage: stage.into(),
            received,
            published,
            publish_failures,
            duplicates,
            malformed,
            transform_failures,
            connects,
            upstream_online,
            playback,
        })
    }

    pub fn inc_received(&self) {
        self.received.with_label_values(&[self.stage.as_str()]).inc();
    }

    pub fn inc_published(&self) {
        self.published.with_label_values(&[self.stage.as_str()]).inc();
    }

    pub fn inc_publish_failure(&self) {
        self.publish_failures.with_label_values(&[self.stage.as_str()]).inc();
    }

    pub fn inc_duplicate(&self) {
        self.duplicates.with_label_values(&[self.stage.as_str()]).inc();
    }

    pub fn inc_malformed(&self) {
        self.malformed.with_label_values(&[self.stage.as_str()]).inc();
    }

    pub fn inc_transform_failure(&self) {
        self.transform_failures.with_label_values(&[self.stage.as_str()]).inc();
    }

    pub fn inc_connect(&self) {
        self.connects.with_label_values(&[self.stage.as_str()]).inc();
    }

    pub fn set_upstream_online(&self, upstream: &str, online: bool) {
        self.upstream_online
            .with_label_values(&[self.stage.as_str(), upstream])
            .set(if online { 1 } else { 0 });
    }

    /// Add `count` playback events with the given outcome
    /// (`started`, `completed`, `preempted`, `aborted`, `held_back`).
    pub fn add_playback(&self, outcome: &str, count: u64) {
        if count > 0 {
            self.playback
                .with_label_values(&[self.stage.as_str(), outcome])
                .inc_by(count);
        }
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_metrics_render_with_stage_label() {
        let registry = new_registry();
        let metrics = StageMetrics::new(&registry, "display").expect("register");
        metrics.inc_received();
        metrics.inc_duplicate();
        metrics.set_upstream_online("textToMorse", false);
        metrics.add_playback("started", 2);

        let body = render(&registry).expect("render");
        assert!(body.contains("morse_envelopes_received_total{stage=\"display\"} 1"));
        assert!(body.contains("morse_envelopes_duplicates_total{stage=\"display\"} 1"));
        assert!(body.contains("morse_upstream_online{stage=\"display\",upstream=\"textToMorse\"} 0"));
        assert!(body.contains("morse_playback_events_total{outcome=\"started\",stage=\"display\"} 2"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        StageMetrics::new(&registry, "a").expect("first");
        assert!(StageMetrics::new(&registry, "b").is_err());
    }

    #[tokio::test]
    async fn http_exporter_binds_and_shuts_down() {
        let registry = new_registry();
        let process = ProcessMetrics::new(registry.clone()).expect("register");
        process.inc_start();
        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).expect("bind");
        assert_ne!(server.addr().port(), 0);
        server.shutdown().await.expect("shutdown");
    }
}
