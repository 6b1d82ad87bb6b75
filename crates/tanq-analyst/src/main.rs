//! tapir-analyse-new-qname
//!
//! Micro-analyst for the DNS TAPIR pipeline: consumes `new_qname` events
//! from the bus, maintains fleet-wide knowledge of seen domains in the
//! bus's KV stores, and records a `globally_new` observation the first time
//! the fleet as a whole encounters a domain.

mod api;
mod app;
mod config;
mod errors;
#[cfg(test)]
mod fake;
mod logging;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tanq_adapters::{CertManager, LibTapir, NatsEventBus, SchemaValidator};
use tanq_domain::SuffixFilter;
use tanq_ports::{Clock, EventBus, SystemClock, Validator};

use crate::api::AdminApi;
use crate::app::{App, AppConfig};
use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "tapir-analyse-new-qname", version, about = "DNS TAPIR new-qname micro-analyst")]
struct Cli {
    /// Configuration file to use
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable DEBUG logs
    #[arg(long)]
    debug: bool,
}

/// Payload validation as wired from config: schema-backed when a schema
/// directory is configured, otherwise accept everything.
enum PayloadValidator {
    Schema(SchemaValidator),
    Disabled,
}

impl Validator for PayloadValidator {
    fn validate(&self, data: &[u8]) -> bool {
        match self {
            PayloadValidator::Schema(validator) => validator.validate(data),
            PayloadValidator::Disabled => true,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}, exiting...");
            std::process::exit(-1);
        }
    };

    logging::init(&config, cli.debug);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "tapir-analyse-new-qname starting"
    );
    debug!("Debug logging enabled");

    match run(config).await {
        Ok(()) => info!("Done!"),
        Err(e) => {
            error!(error = %e, "Failed to start, exiting...");
            std::process::exit(-1);
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    // Components in dependency order; a constructor failure aborts startup
    // before anything long-running is spawned.
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = Arc::new(NatsEventBus::connect(config.nats_adapter_config(), clock).await?);
    let codec = Arc::new(LibTapir::new());
    let filter = SuffixFilter::new(&config.ignore_suffixes);

    let validator = Arc::new(match &config.schema_dir {
        Some(dir) => PayloadValidator::Schema(SchemaValidator::from_dir(dir)?),
        None => {
            info!("No schema directory configured, payload validation disabled");
            PayloadValidator::Disabled
        }
    });

    let certs = Arc::new(CertManager::new(config.cert_manager_config())?);
    let admin_api = if config.api.active {
        Some(Arc::new(AdminApi::new(&config.api, &certs)?))
    } else {
        None
    };

    let analyst = App::new(
        bus.clone(),
        codec,
        validator,
        filter,
        config.nats.observation_subject_prefix.clone(),
        AppConfig {
            workers: config.workers.count,
            queue: config.workers.queue,
        },
    )?;

    let cancel = CancellationToken::new();
    let (exit_tx, exit_rx) = mpsc::channel(8);
    let mut components = 0;

    supervisor::spawn_component("worker pool", exit_tx.clone(), analyst.run(cancel.clone()));
    components += 1;

    if certs.is_active() {
        let certs = certs.clone();
        let cancel = cancel.clone();
        supervisor::spawn_component("cert manager", exit_tx.clone(), async move {
            certs.run(cancel).await
        });
        components += 1;
    }

    if let Some(admin_api) = admin_api {
        let cancel = cancel.clone();
        supervisor::spawn_component("api", exit_tx.clone(), async move {
            admin_api.run(cancel).await
        });
        components += 1;
    }
    drop(exit_tx);

    supervisor::supervise(cancel, exit_rx, components).await;

    if let Err(e) = bus.shutdown().await {
        error!(error = %e, "Error shutting down bus connection");
    }

    // Per-event and shutdown errors never change the exit status; only a
    // failed startup does.
    Ok(())
}
