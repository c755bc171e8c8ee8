use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use glimpse_cdp::RunEventCapture;
use glimpse_core::ids::SessionId;
use glimpse_core::time::now_ts;
use glimpse_server::{GateConfig, ServerConfig};
use glimpse_store::{RunEventStore, ScreenshotStore};
use glimpse_stream::pipeline::{DEFAULT_FOCUS_POLL_SECS, DEFAULT_FRAME_QUEUE_MAX};
use glimpse_stream::{
    ControlState, DebuggerSource, Quality, ScreencastStreamer, SessionSource, StreamingMode,
    StreamingStats,
};
use glimpse_telemetry::{AuditSink, TelemetryConfig};
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "glimpse", about = "Remote browser streaming and control gateway")]
struct Args {
    /// Bind host for the gateway
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port for the gateway
    #[arg(long, default_value_t = 5009)]
    port: u16,

    /// Streaming mode: cdp or screenshot
    #[arg(long, default_value = "cdp")]
    mode: String,

    /// Screencast quality preset: low, med, or high
    #[arg(long, default_value = "med")]
    quality: String,

    /// Browser remote-debugging HTTP endpoint
    #[arg(long, default_value = "http://127.0.0.1:9222")]
    cdp_endpoint: String,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json_logs: bool,

    /// Default log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Security audit log path
    #[arg(long, default_value = "security.log")]
    audit_log: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Unknown values fall back to defaults, matching the env parsers.
    let mode: StreamingMode = args.mode.parse().unwrap_or(StreamingMode::Cdp);
    let quality: Quality = args.quality.parse().unwrap_or(Quality::Medium);
    let log_level = args.log_level.parse().unwrap_or(tracing::Level::INFO);

    glimpse_telemetry::init_telemetry(&TelemetryConfig {
        log_level,
        json_output: args.json_logs,
        audit_log_path: args.audit_log.clone(),
    });

    let gate = GateConfig::from_env().context("invalid gate configuration")?;
    let audit = Arc::new(
        AuditSink::open(&args.audit_log)
            .with_context(|| format!("cannot open audit log {}", args.audit_log.display()))?,
    );

    let screenshots = Arc::new(ScreenshotStore::default());
    let run_events = Arc::new(RunEventStore::default());
    let stats = Arc::new(StreamingStats::new(mode, DEFAULT_FRAME_QUEUE_MAX));
    let control = Arc::new(ControlState::new());
    let (events, _) = broadcast::channel(1024);

    let run_session = SessionId::new();
    run_events.register_session(&run_session, now_ts());
    control.set_active_session(Some(run_session.clone()));

    let source: Arc<dyn SessionSource> = Arc::new(DebuggerSource::new(&args.cdp_endpoint));

    let streamer = Arc::new(ScreencastStreamer::new(
        quality,
        DEFAULT_FRAME_QUEUE_MAX,
        DEFAULT_FOCUS_POLL_SECS,
        Arc::clone(&stats),
        Arc::clone(&screenshots),
        events.clone(),
    ));

    if mode == StreamingMode::Cdp {
        let capture = Arc::new(RunEventCapture::new(
            Arc::clone(&run_events),
            run_session.clone(),
        ));
        tokio::spawn(attach_when_ready(
            Arc::clone(&streamer),
            Arc::clone(&source),
            run_session.clone(),
            capture,
        ));
    }

    let server = glimpse_server::start(
        ServerConfig {
            host: args.host,
            port: args.port,
            ..Default::default()
        },
        gate,
        Arc::clone(&control),
        Arc::clone(&stats),
        Arc::clone(&source),
        events,
        audit,
    )
    .await
    .context("failed to start gateway")?;

    tracing::info!(port = server.port, mode = %mode, "glimpse ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    streamer.stop(None).await;
    Ok(())
}

/// Keep trying to attach the screencast and event capture until the
/// browser's debugging endpoint is reachable.
async fn attach_when_ready(
    streamer: Arc<ScreencastStreamer>,
    source: Arc<dyn SessionSource>,
    run_session: SessionId,
    capture: Arc<RunEventCapture>,
) {
    loop {
        match streamer.start(Arc::clone(&source), run_session.clone()).await {
            Ok(()) => break,
            Err(error) => {
                tracing::warn!(error = %error, kind = error.error_kind(), "screencast attach failed, retrying");
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
        }
    }

    match source.acquire().await {
        Ok((session, cdp_session_id)) => {
            capture.attach(&*session);
            // Event domains are opt-in per session.
            let _ = session
                .send("Runtime.enable", None, Some(&cdp_session_id))
                .await;
            let _ = session
                .send("Network.enable", None, Some(&cdp_session_id))
                .await;
        }
        Err(error) => {
            tracing::warn!(error = %error, kind = error.error_kind(), "event capture attach failed");
        }
    }
}
