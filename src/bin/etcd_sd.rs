use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use etcd_sd::etcd::{DEFAULT_ENDPOINTS, StoreConfig};
use etcd_sd::key::DEFAULT_PREFIX;
use etcd_sd::target::DEFAULT_TARGET_FILE;
use etcd_sd::{ErrorPolicy, EtcdStore, Reconciler, ReconcilerConfig, RetryPolicy, TargetFile};

#[derive(Parser, Debug)]
#[command(name = "etcd-sd")]
#[command(about = "Write etcd service registrations to a Prometheus file_sd target file")]
struct Cli {
    /// Comma-separated etcd endpoints
    #[arg(long, default_value = DEFAULT_ENDPOINTS)]
    endpoints: String,

    /// Dial timeout in seconds
    #[arg(long, default_value_t = 5)]
    dial_timeout: u64,

    /// Target file path
    #[arg(long, default_value = DEFAULT_TARGET_FILE)]
    file: PathBuf,

    /// Key prefix services register under
    #[arg(long, default_value = DEFAULT_PREFIX)]
    prefix: String,

    /// Reconnect attempts before giving up
    #[arg(long, default_value_t = 10)]
    max_retries: u32,

    /// First reconnect delay in milliseconds
    #[arg(long, default_value_t = 500)]
    retry_initial_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[arg(long, default_value_t = 30_000)]
    retry_max_ms: u64,

    /// Exit on a key that does not match <prefix>/<service>/<instance>
    #[arg(long)]
    strict_keys: bool,

    /// Exit when the target file cannot be written
    #[arg(long)]
    fatal_write_errors: bool,

    /// Write the current registrations once and exit
    #[arg(long)]
    once: bool,
}

impl Cli {
    fn reconciler_config(&self) -> ReconcilerConfig {
        let mut config = ReconcilerConfig::new(&self.prefix);
        config.retry = RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_initial_ms),
            Duration::from_millis(self.retry_max_ms),
        );
        if self.strict_keys {
            config.malformed_keys = ErrorPolicy::Fatal;
        }
        if self.fatal_write_errors {
            config.write_errors = ErrorPolicy::Fatal;
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let store_config = StoreConfig::new(&cli.endpoints, Duration::from_secs(cli.dial_timeout));
    let config = cli.reconciler_config();

    info!("Prefix: {}", config.prefix);
    info!("Target file: {}", cli.file.display());

    let store = EtcdStore::connect(&store_config)
        .await
        .context("Failed to connect to etcd")?;
    let mut reconciler = Reconciler::new(store, TargetFile::new(&cli.file), config);

    if cli.once {
        reconciler.run_once().await.context("Failed to write target file")?;
        return Ok(());
    }

    reconciler
        .run(shutdown_signal())
        .await
        .context("Reconciler stopped")?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                error!("cannot install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown requested");
}
