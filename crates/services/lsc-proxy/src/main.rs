//! LSC proxy binary
//!
//! # Usage
//!
//! ```bash
//! lsc-proxy ABCDEFGHIJKLMNOPQRST --config settings.yaml
//!
//! # JSON logs, debug level
//! RUST_LOG=debug lsc-proxy ABCDEFGHIJKLMNOPQRST --log-format json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use lsc_tutk::{DeviceSdk, NativeSdk};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lsc_proxy::config::Config;
use lsc_proxy::controller::{SessionController, StopReason, CONFIGURE_SEQUENCE};
use lsc_proxy::sink::ensure_fifo;

/// LSC Indoor Camera Proxy
///
/// Connects to the camera by UID and republishes its stream over RTSP.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Camera UID
    uid: String,

    /// Settings file
    #[arg(short, long, default_value = "settings.yaml", env = "LSC_CONFIG")]
    config: PathBuf,

    /// Log output format
    #[arg(long, default_value = "text", env = "LSC_LOG_FORMAT")]
    log_format: LogFormat,
}

const BANNER: &str = r#"
  _     ____   ____   ____
 | |   / ___| / ___| |  _ \ _ __ _____  ___   _
 | |   \___ \| |     | |_) | '__/ _ \ \/ / | | |
 | |___ ___) | |___  |  __/| | | (_) >  <| |_| |
 |_____|____/ \____| |_|   |_|  \___/_/\_\\__, |
                                          |___/
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_format);

    println!("{}", BANNER);
    tracing::info!("LSC Indoor Camera Proxy v{}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => {
            tracing::info!("LSC Indoor Camera Proxy shut down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let fifos_dir = &config.paths.fifos_dir;
    if !fifos_dir.exists() {
        std::fs::create_dir_all(fifos_dir)
            .with_context(|| format!("Failed to create {}", fifos_dir.display()))?;
        tracing::info!("Directory '{}' created", fifos_dir.display());
    }
    for fifo in [&config.paths.video_fifo, &config.paths.audio_fifo] {
        if ensure_fifo(fifo)? {
            tracing::info!("Created FIFO {}", fifo.display());
        }
    }

    let sdk: Arc<dyn DeviceSdk> = Arc::new(NativeSdk::load(&config.paths.sdk_library)?);

    let uid = args.uid;
    let controller = tokio::task::spawn_blocking(move || {
        let controller = SessionController::connect(sdk, config, &uid)?;
        controller.configure(&CONFIGURE_SEQUENCE)?;
        Ok::<_, lsc_proxy::ControllerError>(controller)
    })
    .await
    .context("Session setup task failed")??;

    let token = controller.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        token.cancel();
    });

    let summary = controller.run().await?;
    for report in [&summary.video, &summary.audio].into_iter().flatten() {
        tracing::info!(
            kind = %report.kind,
            frames = report.frames_written,
            bytes = report.bytes_written,
            dropped = report.frames_dropped,
            skipped = report.frames_skipped,
            recoveries = report.recoveries,
            "{} loop finished: {}",
            report.kind,
            report.exit
        );
    }
    if summary.reason == StopReason::StreamEnded {
        tracing::warn!("Camera closed the session");
    }
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
