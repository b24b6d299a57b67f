use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "pfstatsd";

/// Prometheus self-metrics for the daemon, served on `/metrics`.
///
/// All metrics use the "pfstatsd" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Delivery ===
    /// Metrics accepted into the session buffer.
    pub metrics_posted: Counter,
    /// Metrics written to the collector.
    pub metrics_flushed: Counter,
    /// Flushes that failed and requeued their snapshot.
    pub flush_errors: Counter,
    /// Successful re-dials after a lost connection.
    pub reconnects: Counter,
    /// Collector dials that failed, retried or not.
    pub dial_errors: Counter,
    /// Whether the collector connection is usable (1=yes, 0=no).
    pub collector_connected: Gauge,
    /// Metrics waiting in the buffer.
    pub buffered_metrics: Gauge,

    // === Sources ===
    /// Completed pf queue polls.
    pub pf_polls: Counter,
    /// Queue-status lines that could not be parsed.
    pub pf_parse_errors: Counter,
    /// Ping responses by target.
    pub ping_responses: CounterVec,
    /// Lost ping responses by target.
    pub ping_lost: CounterVec,
    /// Source failures by source (pf/ping/ifstats).
    pub source_failures: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let metrics_posted = Counter::with_opts(
            Opts::new("metrics_posted_total", "Metrics accepted into the buffer.")
                .namespace(NAMESPACE),
        )?;
        let metrics_flushed = Counter::with_opts(
            Opts::new("metrics_flushed_total", "Metrics written to the collector.")
                .namespace(NAMESPACE),
        )?;
        let flush_errors = Counter::with_opts(
            Opts::new("flush_errors_total", "Flushes that failed and were requeued.")
                .namespace(NAMESPACE),
        )?;
        let reconnects = Counter::with_opts(
            Opts::new("reconnects_total", "Re-dials after a lost collector connection.")
                .namespace(NAMESPACE),
        )?;
        let dial_errors = Counter::with_opts(
            Opts::new("dial_errors_total", "Failed collector dials.").namespace(NAMESPACE),
        )?;
        let collector_connected = Gauge::with_opts(
            Opts::new(
                "collector_connected",
                "Whether the collector connection is usable (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let buffered_metrics = Gauge::with_opts(
            Opts::new("buffered_metrics", "Metrics waiting to be flushed.").namespace(NAMESPACE),
        )?;

        let pf_polls = Counter::with_opts(
            Opts::new("pf_polls_total", "Completed pf queue polls.").namespace(NAMESPACE),
        )?;
        let pf_parse_errors = Counter::with_opts(
            Opts::new(
                "pf_parse_errors_total",
                "Queue-status lines that could not be parsed.",
            )
            .namespace(NAMESPACE),
        )?;
        let ping_responses = CounterVec::new(
            Opts::new("ping_responses_total", "Ping responses by target.").namespace(NAMESPACE),
            &["target"],
        )?;
        let ping_lost = CounterVec::new(
            Opts::new("ping_lost_total", "Lost ping responses by target.").namespace(NAMESPACE),
            &["target"],
        )?;
        let source_failures = CounterVec::new(
            Opts::new("source_failures_total", "Source failures by source.").namespace(NAMESPACE),
            &["source"],
        )?;

        registry.register(Box::new(metrics_posted.clone()))?;
        registry.register(Box::new(metrics_flushed.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(dial_errors.clone()))?;
        registry.register(Box::new(collector_connected.clone()))?;
        registry.register(Box::new(buffered_metrics.clone()))?;
        registry.register(Box::new(pf_polls.clone()))?;
        registry.register(Box::new(pf_parse_errors.clone()))?;
        registry.register(Box::new(ping_responses.clone()))?;
        registry.register(Box::new(ping_lost.clone()))?;
        registry.register(Box::new(source_failures.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            metrics_posted,
            metrics_flushed,
            flush_errors,
            reconnects,
            dial_errors,
            collector_connected,
            buffered_metrics,
            pf_polls,
            pf_parse_errors,
            ping_responses,
            ping_lost,
            source_failures,
        })
    }

    /// Starts the HTTP server in a background task and returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Stops the HTTP server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream
            .write_all(request.as_bytes())
            .await
            .expect("write request");

        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("read response");
        response
    }

    #[test]
    fn test_render_includes_namespaced_metrics() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.metrics_posted.inc_by(3.0);
        health.ping_lost.with_label_values(&["8_8_8_8"]).inc();

        let text = health.render().expect("render");
        assert!(text.contains("pfstatsd_metrics_posted_total 3"));
        assert!(text.contains("pfstatsd_ping_lost_total{target=\"8_8_8_8\"} 1"));
    }

    #[tokio::test]
    async fn test_serves_healthz_and_metrics() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.reconnects.inc();

        let addr = health.start().await.expect("start");

        let healthz = get(addr, "/healthz").await;
        assert!(healthz.starts_with("HTTP/1.1 200"));
        assert!(healthz.ends_with("ok"));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.contains("pfstatsd_reconnects_total 1"));

        health.stop();
    }
}
