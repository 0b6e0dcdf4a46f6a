//! Media gateway - CLI binary.
//!
//! Runs a single RTP connection end to end. With `--offer` the remote offer
//! is answered and the answer printed on stdout. Without it a local offer is
//! printed and the remote answer is read from stdin.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use mgw_common::{init_tracing, ColorWhen, ConnectionMode, MetricsContext, MetricsServerConfig};
use mgw_connection::{AnyConnection, ConnectionFactory, GatewayConfig, Scheduler, StateTimeouts};
use mgw_rtp::{AvProfile, SystemClock};

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

impl From<ColorArg> for ColorWhen {
    fn from(v: ColorArg) -> Self {
        match v {
            ColorArg::Auto => ColorWhen::Auto,
            ColorArg::Always => ColorWhen::Always,
            ColorArg::Never => ColorWhen::Never,
        }
    }
}

/// Media Gateway - Negotiate and run one RTP connection
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Local address media sockets bind to
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Address advertised in SDP instead of the bind address
    #[arg(short, long)]
    external: Option<String>,

    /// First RTP port
    #[arg(long, default_value = "61000")]
    rtp_port_low: u16,

    /// Last RTP port
    #[arg(long, default_value = "62000")]
    rtp_port_high: u16,

    /// Seconds a connection may wait for its remote peer
    #[arg(long, default_value = "30")]
    half_open_timeout: u32,

    /// Seconds an open connection may go without receiving media
    #[arg(long, default_value = "300")]
    open_timeout: u32,

    /// Jitter buffer playout delay in milliseconds
    #[arg(short = 'j', long, default_value = "60")]
    jitter_ms: u32,

    /// Remote SDP offer to answer. Without it a local offer is generated.
    #[arg(short, long)]
    offer: Option<PathBuf>,

    /// Offer rtcp-mux, ICE-lite and DTLS when generating the offer
    #[arg(long)]
    webrtc: bool,

    /// Also offer or accept video
    #[arg(long)]
    video: bool,

    /// Connection mode (sendrecv, sendonly, recvonly, inactive)
    #[arg(short, long, default_value = "sendrecv")]
    mode: ConnectionMode,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9300")]
    metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorArg,
}

impl Args {
    // ---
    fn gateway_config(&self) -> GatewayConfig {
        // ---
        let mut config = GatewayConfig {
            bind_address: self.bind,
            external_address: self.external.clone(),
            rtp_port_low: self.rtp_port_low,
            rtp_port_high: self.rtp_port_high,
            timeouts: StateTimeouts {
                half_open_secs: self.half_open_timeout,
                open_secs: self.open_timeout,
            },
            video_formats: self.video.then(AvProfile::video),
            ..GatewayConfig::default()
        };
        config.jitter.tolerance_ms = self.jitter_ms;
        config
    }
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color.into())?;

    info!("Starting media gateway v{VERSION}");
    info!("Bind address: {}", args.bind);
    info!("RTP ports: {}-{}", args.rtp_port_low, args.rtp_port_high);
    info!(
        "Timeouts: half-open {}s, open {}s",
        args.half_open_timeout, args.open_timeout
    );
    info!("Jitter buffer delay: {}ms", args.jitter_ms);
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new("gateway")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let config = args.gateway_config();
    let scheduler = Arc::new(Scheduler::new(config.media_period, config.heartbeat_resolution));
    let scheduler_task = Arc::clone(&scheduler).spawn();
    let factory = ConnectionFactory::new(config, scheduler, Arc::new(SystemClock::new()))
        .with_metrics(metrics.clone());

    let conn = factory.create_rtp();
    let failed = Arc::new(Notify::new());
    let on_failure = Arc::clone(&failed);
    conn.set_failure_listener(Arc::new(move || on_failure.notify_one()));

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    conn.kind().set_frame_sink(frames_tx);
    let _playout_task = tokio::spawn(async move {
        let mut played = 0u64;
        while let Some((media, frame)) = frames_rx.recv().await {
            played += 1;
            debug!("{} frame seq={} ({} bytes)", media, frame.sequence, frame.payload.len());
            if played % 500 == 0 {
                info!("Played {} frames", played);
            }
        }
    });

    conn.bind().context("failed to bind connection")?;
    conn.set_mode(args.mode).context("failed to set mode")?;

    match &args.offer {
        Some(path) => {
            let offer = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read offer {}", path.display()))?;
            let answer = conn.process_offer(&offer).await.context("offer rejected")?;
            print!("{answer}");
        }
        None => {
            let offer = conn
                .generate_offer(args.webrtc)
                .await
                .context("failed to generate offer")?;
            print!("{offer}");

            info!("Waiting for the remote answer on stdin (end with Ctrl-D)");
            let mut answer = String::new();
            tokio::io::stdin()
                .read_to_string(&mut answer)
                .await
                .context("failed to read answer")?;
            if answer.trim().is_empty() {
                warn!("No answer received, connection stays half-open");
            } else {
                conn.process_answer(&answer).await.context("answer rejected")?;
            }
        }
    }

    info!("Connection {} is {}", conn.textual_id(), conn.state());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("Shutting down");
        }
        _ = failed.notified() => {
            warn!("Connection {} failed", conn.textual_id());
        }
    }

    let stats = conn.kind().audio().statistics();
    conn.close()?;
    factory.recycle(AnyConnection::Rtp(conn))?;
    scheduler_task.abort();

    stats.log();
    Ok(())
}
