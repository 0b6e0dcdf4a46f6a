//! Prometheus metrics for the media gateway.
//!
//! One `MetricsContext` per process. Handles are cheap clones of the
//! underlying prometheus collectors, so connections and sessions can keep
//! their own copy and bump counters on the hot path.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::core::Collector;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Where the scrape endpoint listens.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9300`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Registry plus the gateway's metric handles.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Media plane
    pub rtp_packets_sent_total: IntCounter,
    pub rtp_packets_received_total: IntCounter,
    pub rtp_bytes_sent_total: IntCounter,
    pub rtp_bytes_received_total: IntCounter,
    pub jitter_buffer_dropped_total: IntCounter,
    pub jitter_buffer_occupancy_packets: IntGauge,
    pub interarrival_jitter_units: Histogram,

    // Control plane
    pub connections_created_total: IntCounter,
    pub connection_failures_total: IntCounter,
    pub negotiation_failures_total: IntCounter,
    pub connections_open: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    // ---
    let c = IntCounter::with_opts(Opts::new(name, help))?;
    register(registry, &c)?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    // ---
    let g = IntGauge::with_opts(Opts::new(name, help))?;
    register(registry, &g)?;
    Ok(g)
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: &C) -> Result<()> {
    // ---
    registry.register(Box::new(collector.clone()))?;
    Ok(())
}

impl MetricsContext {
    // ---
    /// Creates a registry labelled `process=<process_name>` and registers
    /// every gateway metric in it.
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("media_gateway".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let interarrival_jitter_units = Histogram::with_opts(
            HistogramOpts::new(
                "rtp_interarrival_jitter_units",
                "RFC 3550 interarrival jitter estimate in timestamp units",
            )
            .buckets(vec![0.0, 8.0, 16.0, 40.0, 80.0, 160.0, 400.0, 800.0, 1600.0]),
        )?;
        register(&registry, &interarrival_jitter_units)?;

        Ok(Self {
            rtp_packets_sent_total: counter(&registry, "rtp_packets_sent_total", "Total RTP packets sent")?,
            rtp_packets_received_total: counter(
                &registry,
                "rtp_packets_received_total",
                "Total RTP packets received",
            )?,
            rtp_bytes_sent_total: counter(&registry, "rtp_bytes_sent_total", "Total RTP payload bytes sent")?,
            rtp_bytes_received_total: counter(
                &registry,
                "rtp_bytes_received_total",
                "Total RTP payload bytes received",
            )?,
            jitter_buffer_dropped_total: counter(
                &registry,
                "jitter_buffer_dropped_total",
                "Packets dropped by the jitter buffer (late, stale or overflow)",
            )?,
            jitter_buffer_occupancy_packets: gauge(
                &registry,
                "jitter_buffer_occupancy_packets",
                "Current jitter buffer occupancy in packets",
            )?,
            interarrival_jitter_units,
            connections_created_total: counter(
                &registry,
                "connections_created_total",
                "Connections handed out by the factory",
            )?,
            connection_failures_total: counter(
                &registry,
                "connection_failures_total",
                "Connections that left the open path through failure",
            )?,
            negotiation_failures_total: counter(
                &registry,
                "negotiation_failures_total",
                "Offer/answer exchanges that found no common codec or bad SDP",
            )?,
            connections_open: gauge(&registry, "connections_open", "Connections currently OPEN")?,
            registry,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<Vec<u8>> {
        // ---
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let ctx = Arc::new(self.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let ctx = Arc::clone(&ctx);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let ctx = Arc::clone(&ctx);
                        async move { handle_metrics_request(req, ctx).await }
                    }))
                }
            });

            Server::bind(&cfg.bind)
                .serve(make_svc)
                .await
                .map_err(|e| anyhow::anyhow!(e))
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    ctx: Arc<MetricsContext>,
) -> Result<Response<Body>, hyper::Error> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        let mut resp = Response::new(Body::from("not found"));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return Ok(resp);
    }

    match ctx.render() {
        Ok(body) => {
            let mut resp = Response::new(Body::from(body));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        Err(e) => {
            let mut resp = Response::new(Body::from(format!("encode error: {e}")));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            Ok(resp)
        }
    }
}
