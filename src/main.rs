use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slidegate::config::{SlidegateConfig, StoreKind};
use slidegate::{GlobalClock, Verdict};

/// Check keys read from stdin against a sliding-window rate limit.
///
/// Each non-empty input line is one hit for that key; one JSON verdict is
/// written to stdout per line.
#[derive(Parser, Debug)]
#[command(name = "slidegate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hits allowed per window (overrides the config file)
    #[arg(long)]
    max: Option<u64>,

    /// Window length in seconds (overrides the config file)
    #[arg(long)]
    window: Option<u64>,

    /// Shard count of the in-process store (overrides the config file)
    #[arg(long)]
    shards: Option<usize>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct Decision<'a> {
    key: &'a str,
    #[serde(flatten)]
    verdict: Verdict,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; stdout carries verdicts, so logs go to stderr
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);
    match cli.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    info!("Starting Slidegate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = SlidegateConfig::load(cli.config.as_deref())?;
    if let Some(max) = cli.max {
        config.limiter.max = max;
    }
    if let Some(window) = cli.window {
        config.limiter.window_secs = window;
    }
    if let Some(shards) = cli.shards {
        config.store.shards = shards;
    }
    if config.store.kind == StoreKind::External {
        anyhow::bail!("the command line harness only supports the in-process store");
    }

    let limiter = config.build_limiter(Arc::new(GlobalClock), None)?;
    info!(
        max = limiter.max(),
        window_secs = limiter.window().as_secs(),
        "Reading keys from stdin"
    );

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next() => match line {
                Some(line) => line?,
                None => break,
            },
            _ = &mut shutdown => break,
        };

        let key = line.trim();
        if key.is_empty() {
            continue;
        }

        let verdict = limiter.check(key).await;
        let mut out = serde_json::to_vec(&Decision { key, verdict })?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    info!("Slidegate stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM so the stdin loop can stop between keys.
///
/// A handler that cannot be installed is logged and never fires; end of
/// input still stops the loop.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, no longer reading keys");
        }
        _ = terminate => {
            info!("Received SIGTERM, no longer reading keys");
        }
    }
}
