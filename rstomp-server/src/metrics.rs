//! Prometheus metrics for the rstomp broker.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use rstomp_broker::QueueStats;
use rstomp_buffer::PoolStats;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Frame handling duration buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5];

/// Prometheus metrics for the broker.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted, by transport.
    pub connections_total: CounterVec,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Inbound frames by command.
    pub frames_total: CounterVec,
    /// ERROR frames sent, by code.
    pub errors_total: CounterVec,
    /// Frame handling duration by command.
    pub frame_duration: HistogramVec,
    /// Messages accepted from SEND.
    pub messages_enqueued_total: Counter,
    /// MESSAGE frames written to subscribers.
    pub messages_delivered_total: Counter,
    /// Active subscriptions across all sessions.
    pub subscriptions_active: Gauge,
    /// Undelivered messages per queue.
    pub queue_depth: GaugeVec,
    /// Bytes checked out of the buffer pool.
    pub buffer_outstanding_bytes: Gauge,
    /// Buffers checked out of the pool.
    pub buffers_checked_out: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = CounterVec::new(
            Opts::new(
                "rstomp_connections_total",
                "Total number of connections accepted",
            ),
            &["transport"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "rstomp_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let frames_total = CounterVec::new(
            Opts::new("rstomp_frames_total", "Inbound frames by command"),
            &["command"],
        )?;
        registry.register(Box::new(frames_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("rstomp_errors_total", "ERROR frames sent by error code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let frame_duration = HistogramVec::new(
            HistogramOpts::new(
                "rstomp_frame_duration_seconds",
                "Frame handling duration in seconds by command",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["command"],
        )?;
        registry.register(Box::new(frame_duration.clone()))?;

        let messages_enqueued_total = Counter::with_opts(Opts::new(
            "rstomp_messages_enqueued_total",
            "Messages accepted from SEND frames",
        ))?;
        registry.register(Box::new(messages_enqueued_total.clone()))?;

        let messages_delivered_total = Counter::with_opts(Opts::new(
            "rstomp_messages_delivered_total",
            "MESSAGE frames written to subscribers",
        ))?;
        registry.register(Box::new(messages_delivered_total.clone()))?;

        let subscriptions_active = Gauge::with_opts(Opts::new(
            "rstomp_subscriptions_active",
            "Active subscriptions",
        ))?;
        registry.register(Box::new(subscriptions_active.clone()))?;

        let queue_depth = GaugeVec::new(
            Opts::new("rstomp_queue_depth", "Undelivered messages per queue"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let buffer_outstanding_bytes = Gauge::with_opts(Opts::new(
            "rstomp_buffer_outstanding_bytes",
            "Bytes checked out of the buffer pool",
        ))?;
        registry.register(Box::new(buffer_outstanding_bytes.clone()))?;

        let buffers_checked_out = Gauge::with_opts(Opts::new(
            "rstomp_buffers_checked_out",
            "Buffers checked out of the buffer pool",
        ))?;
        registry.register(Box::new(buffers_checked_out.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            frames_total,
            errors_total,
            frame_duration,
            messages_enqueued_total,
            messages_delivered_total,
            subscriptions_active,
            queue_depth,
            buffer_outstanding_bytes,
            buffers_checked_out,
        })
    }

    /// Refreshes gauges that mirror broker and pool state.
    pub fn update_gauges(&self, pool: &PoolStats, queues: &[QueueStats]) {
        self.buffer_outstanding_bytes
            .set(pool.outstanding_bytes as f64);
        self.buffers_checked_out.set(pool.checked_out as f64);
        // dropped queues lose their series
        self.queue_depth.reset();
        for queue in queues {
            self.queue_depth
                .with_label_values(&[queue.name.as_str()])
                .set(queue.depth as f64);
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
/// `refresh` runs before each scrape to bring gauges up to date.
pub async fn run_metrics_server<F>(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    refresh: F,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Fn() + Send + Sync + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);
    let refresh = Arc::new(refresh);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        let refresh = refresh.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let refresh = refresh.clone();
                                async move { handle_request(req, metrics, refresh.as_ref()).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    refresh: &(dyn Fn() + Send + Sync),
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    match req.uri().path() {
        "/metrics" => {
            refresh();
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(metrics.encode())))
        }
        "/health" | "/healthz" => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("OK"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found"))),
    }
}
