use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use codepush::config::{ObjectStoreConfig, ServerConfig};
use codepush::object_store::{FsObjectStore, ObjectStore, S3ObjectStore};
use codepush::storage::Storage;
use codepush::{rest, AppContext};

#[derive(Parser)]
#[command(name = "codepushd", about = "OTA code-push update server", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP port to listen on.
    #[arg(long, env = "CODEPUSH_PORT")]
    port: Option<u16>,

    /// Data directory for the SQLite database, config overlay, and local blobs.
    #[arg(long, env = "CODEPUSH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CODEPUSH_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "CODEPUSH_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server (default when no subcommand is given).
    Serve,
    /// Run pending SQLite migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _log_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        Some(Command::Migrate) => {
            let config = ServerConfig::new(args.port, args.data_dir, args.log);
            Storage::new(&config.data_dir).await?;
            info!(data_dir = %config.data_dir.display(), "migrations applied");
        }
        None | Some(Command::Serve) => {
            run_server(args.port, args.data_dir, args.log).await?;
        }
    }

    Ok(())
}

async fn run_server(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "codepush starting");

    let config = ServerConfig::new(port, data_dir, log);
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        "config loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;

    let storage = Storage::new(&config.data_dir).await?;

    let object_store: Arc<dyn ObjectStore> = match &config.object_store {
        ObjectStoreConfig::Fs { root } => {
            std::fs::create_dir_all(root)
                .with_context(|| format!("failed to create blob root {}", root.display()))?;
            Arc::new(FsObjectStore::new(root.clone(), config.jwt_secret.as_bytes().to_vec()))
        }
        ObjectStoreConfig::S3 {
            endpoint,
            bucket,
            access_key,
            secret_key,
        } => Arc::new(S3ObjectStore::new(
            endpoint.clone(),
            bucket.clone(),
            access_key.clone(),
            secret_key.clone(),
        )),
    };

    let ctx = Arc::new(AppContext::new(config, storage, object_store));
    rest::start_rest_server(ctx).await
}

/// Initialize the tracing subscriber. If `log_file` is set, logs go to both
/// stdout and a daily-rolling file. Returns a `WorkerGuard` that must stay
/// alive for the process lifetime. Falls back to stdout-only logging with a
/// warning if the log directory cannot be created — never panics.
fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("codepushd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).json())
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
