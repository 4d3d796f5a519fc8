use clap::Parser;
use dicomgate_config::ConfigStore;
use dicomgate_pipeline::PipelineService;
use dicomgate_types::GatewayError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit codes: 0 normal shutdown, 1 invalid configuration, 2 listener
/// bind failure, 3 data directory unwritable.
const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;
const EXIT_DATA_DIR: i32 = 3;

#[derive(Parser)]
#[command(name = "dicomgate")]
#[command(about = "DICOM routing gateway with de-identification and review gating")]
#[command(version)]
struct Args {
    /// Path to the gateway configuration file
    #[arg(short, long, default_value = "dicomgate.toml")]
    config: PathBuf,

    /// Override the configured data root
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let store = match ConfigStore::load(&args.config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(config = %args.config.display(), error = %e, "invalid configuration");
            return EXIT_CONFIG;
        }
    };

    if let Some(data_root) = args.data_root {
        let mut config = (*store.snapshot()).clone();
        config.data_root = data_root;
        if let Err(e) = store.apply(config) {
            error!(error = %e, "invalid configuration");
            return EXIT_CONFIG;
        }
    }

    let data_root = store.snapshot().data_root.clone();
    if let Err(e) = probe_data_root(&data_root) {
        error!(data_root = %data_root.display(), error = %e, "data directory unwritable");
        return EXIT_DATA_DIR;
    }

    let mut service = match PipelineService::build(store.clone()) {
        Ok(service) => service,
        Err(GatewayError::Config { message }) if message.contains("cannot bind") => {
            error!(error = %message, "listener bind failed");
            return EXIT_BIND;
        }
        Err(e @ GatewayError::Config { .. }) => {
            error!(error = %e, "invalid configuration");
            return EXIT_CONFIG;
        }
        Err(e) => {
            error!(error = %e, "pipeline construction failed");
            return EXIT_DATA_DIR;
        }
    };

    let handles = match service.start().await {
        Ok(handles) => handles,
        Err(e) => {
            error!(error = %e, "pipeline start failed");
            return EXIT_CONFIG;
        }
    };

    info!(
        config = %args.config.display(),
        data_root = %data_root.display(),
        routes = store.snapshot().routes.iter().filter(|r| r.enabled).count(),
        "dicomgate running"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "cannot listen for shutdown signal"),
    }

    let grace = Duration::from_secs(store.snapshot().resilience.graceful_stop_seconds);
    service.shutdown(handles, grace).await;
    0
}

/// Writability probe of the data root (exit code 3 class).
fn probe_data_root(data_root: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(data_root)?;
    let probe = data_root.join(".dicomgate-probe");
    std::fs::write(&probe, b"probe")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}
