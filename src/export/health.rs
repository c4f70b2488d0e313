use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "frametrace";

/// Prometheus metrics for pipeline health.
///
/// All metrics use the "frametrace" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Producer ===
    /// Events delivered to the engine by provider.
    pub events_by_provider: CounterVec,
    /// Events dropped because their payload was unusable.
    pub events_dropped: Counter,
    /// Events the OS trace layer reported as lost.
    pub trace_events_lost: Counter,
    /// Buffers the OS trace layer reported as lost.
    pub trace_buffers_lost: Counter,

    // === Correlation ===
    /// Completed presents by final outcome.
    pub presents_by_result: CounterVec,
    /// Presents evicted without a terminal event.
    pub presents_abandoned: Counter,
    /// Completion attempts on an already completed present.
    pub double_completions: Counter,
    /// Completed VR compositor frames by compositor.
    pub compositor_frames: CounterVec,
    /// Completed late stage reprojections by outcome.
    pub lsrs: CounterVec,

    // === Consumer ===
    /// Processes currently known to the aggregator.
    pub processes_tracked: Gauge,
    /// Swap chains currently held in rolling windows.
    pub swap_chains_tracked: Gauge,
    /// Records drained per consumer tick.
    pub consumer_batch_size: Histogram,
    /// Time to apply one drained batch and write it to the sinks.
    pub consumer_poll_duration: Histogram,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Producer ===
        let events_by_provider = CounterVec::new(
            opts("events_total", "Events delivered to the engine by provider."),
            &["provider"],
        )?;
        let events_dropped = Counter::with_opts(opts(
            "events_dropped_total",
            "Events dropped because their payload was unusable.",
        ))?;
        let trace_events_lost = Counter::with_opts(opts(
            "trace_events_lost_total",
            "Events the trace session reported as lost.",
        ))?;
        let trace_buffers_lost = Counter::with_opts(opts(
            "trace_buffers_lost_total",
            "Buffers the trace session reported as lost.",
        ))?;

        // === Correlation ===
        let presents_by_result = CounterVec::new(
            opts("presents_total", "Completed presents by final outcome."),
            &["result"],
        )?;
        let presents_abandoned = Counter::with_opts(opts(
            "presents_abandoned_total",
            "Presents evicted without a terminal event.",
        ))?;
        let double_completions = Counter::with_opts(opts(
            "double_completions_total",
            "Completion attempts on an already completed present.",
        ))?;
        let compositor_frames = CounterVec::new(
            opts(
                "compositor_frames_total",
                "Completed VR compositor frames by compositor.",
            ),
            &["compositor"],
        )?;
        let lsrs = CounterVec::new(
            opts(
                "lsrs_total",
                "Completed late stage reprojections by outcome.",
            ),
            &["result"],
        )?;

        // === Consumer ===
        let processes_tracked = Gauge::with_opts(opts(
            "processes_tracked",
            "Processes currently known to the aggregator.",
        ))?;
        let swap_chains_tracked = Gauge::with_opts(opts(
            "swap_chains_tracked",
            "Swap chains currently held in rolling windows.",
        ))?;
        let consumer_batch_size = Histogram::with_opts(
            HistogramOpts::new("consumer_batch_size", "Records drained per consumer tick.")
                .namespace(NAMESPACE)
                .buckets(vec![0.0, 1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
        )?;
        let consumer_poll_duration = Histogram::with_opts(
            HistogramOpts::new(
                "consumer_poll_duration_seconds",
                "Time to apply one drained batch and write it to the sinks.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )?;

        registry.register(Box::new(events_by_provider.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(trace_events_lost.clone()))?;
        registry.register(Box::new(trace_buffers_lost.clone()))?;

        registry.register(Box::new(presents_by_result.clone()))?;
        registry.register(Box::new(presents_abandoned.clone()))?;
        registry.register(Box::new(double_completions.clone()))?;
        registry.register(Box::new(compositor_frames.clone()))?;
        registry.register(Box::new(lsrs.clone()))?;

        registry.register(Box::new(processes_tracked.clone()))?;
        registry.register(Box::new(swap_chains_tracked.clone()))?;
        registry.register(Box::new(consumer_batch_size.clone()))?;
        registry.register(Box::new(consumer_poll_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_by_provider,
            events_dropped,
            trace_events_lost,
            trace_buffers_lost,
            presents_by_result,
            presents_abandoned,
            double_completions,
            compositor_frames,
            lsrs,
            processes_tracked,
            swap_chains_tracked,
            consumer_batch_size,
            consumer_poll_duration,
        })
    }

    /// Current metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "Health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "Health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "Encoding metrics");
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
