use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kratix_controller::{ControllerConfig, PromiseReconciler};
use kratix_core::kinds;
use kratix_kubehub::KubeStore;
use kratix_runtime::{Manager, ManagerConfig, Registrar, Registration};
use kratix_store::{Created, ObjectStore};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kratix", version, about = "Kratix platform control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control plane: reconcile Promises and every kind they declare
    Manager {
        /// Parallel workers per registered kind
        #[arg(long, env = "KRATIX_WORKERS", default_value_t = 4)]
        workers: usize,
        /// Watch event buffer per kind
        #[arg(long = "queue-cap", env = "KRATIX_QUEUE_CAP", default_value_t = 1024)]
        queue_cap: usize,
        /// Upper bound for error backoff, in seconds
        #[arg(long = "backoff-max-secs", env = "KRATIX_BACKOFF_MAX_SECS", default_value_t = 300)]
        backoff_max_secs: u64,
    },
    /// Final pipeline step: build the request's Work from the staged output
    WorkCreator {
        /// Request identifier; names the Work
        #[arg(long)]
        identifier: String,
        /// Root holding input/, metadata/ and kratix-system/
        #[arg(long = "input-directory")]
        input_directory: PathBuf,
        /// Namespace the Work is created in
        #[arg(long, env = "KRATIX_PLATFORM_NAMESPACE", default_value = "default")]
        namespace: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KRATIX_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KRATIX_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KRATIX_METRICS_ADDR; expected host:port");
        }
    }
}

async fn run_manager(workers: usize, queue_cap: usize, backoff_max_secs: u64) -> Result<()> {
    let config = Arc::new(ControllerConfig::from_env()?);
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::try_default().await.context("connecting to the API server")?);
    let manager = Manager::new(
        Arc::clone(&store),
        ManagerConfig {
            workers,
            queue_cap,
            watch_restart: config.retry_after,
            backoff_max: Duration::from_secs(backoff_max_secs),
            ..ManagerConfig::default()
        },
    );
    info!(
        namespace = %config.platform_namespace,
        work_creator = %config.work_creator_image,
        workers,
        "starting manager"
    );
    if !config.work_creator_image_is_set() {
        warn!(image = %config.work_creator_image, "WC_IMG unset; pipeline writer stages will not find the kratix binary");
    }

    let promises = PromiseReconciler::new(Arc::clone(&store), Arc::new(manager.clone()), Arc::clone(&config));
    if manager.register(kinds::promise(), "promise", Arc::new(promises)) != Registration::Started {
        anyhow::bail!("promise controller already registered");
    }

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received; shutting down");
    manager.shutdown();
    Ok(())
}

async fn run_work_creator(identifier: &str, input_directory: &Path, namespace: &str) -> Result<()> {
    let store = KubeStore::try_default().await.context("connecting to the API server")?;
    match kratix_pipeline::work_creator::run(&store, identifier, namespace, input_directory).await {
        Ok(Created::New) => info!(work = %identifier, "work created"),
        Ok(Created::Existing) => info!(work = %identifier, "work already present"),
        Err(e) => {
            error!(work = %identifier, error = %e, "work creation failed");
            return Err(e.into());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Manager { workers, queue_cap, backoff_max_secs } => run_manager(workers, queue_cap, backoff_max_secs).await,
        Commands::WorkCreator { identifier, input_directory, namespace } => {
            run_work_creator(&identifier, &input_directory, &namespace).await
        }
    }
}
