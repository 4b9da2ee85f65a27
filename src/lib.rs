// src/lib.rs
// Land integration and agreement notarization service

pub mod agreement;
pub mod anchor_queue;
pub mod anchor_service;
pub mod api;
pub mod config;
pub mod config_manager;
pub mod documents;
pub mod error;
pub mod integration;
pub mod land;
pub mod payload;
pub mod simple_metrics;
pub mod storage;

use crate::agreement::AgreementMachine;
use crate::anchor_queue::{AnchorCoordinator, AnchorQueue, AnchorReceiver, RetryPolicy};
use crate::anchor_service::{LedgerAnchoringService, LedgerBackend};
use crate::api::{ApiKeys, AppState};
use crate::config_manager::NodeConfig;
use crate::documents::LocalDocumentStore;
use crate::integration::{spawn_expiry_sweeper, IntegrationLedger};
use crate::land::ParcelRegistry;
use crate::storage::RocksDb;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// All components wired over one database and one config.
pub struct AgriNode {
    pub config: NodeConfig,
    pub db: RocksDb,
    pub parcels: ParcelRegistry,
    pub agreements: AgreementMachine,
    pub integration: IntegrationLedger,
    pub anchoring: LedgerAnchoringService,
    pub documents: Arc<LocalDocumentStore>,
    coordinator: Arc<AnchorCoordinator>,
    receiver: Option<AnchorReceiver>,
}

impl AgriNode {
    /// Open the database at `config.storage.db_path` and pick the ledger strategy from config.
    pub fn open(config: NodeConfig) -> Result<Self> {
        let db = storage::open_db(&config.storage.db_path).map_err(anyhow::Error::msg)?;
        let anchoring = LedgerAnchoringService::from_config(&config.ledger, db.clone())
            .context("initialise ledger anchoring")?;
        Ok(Self::assemble(config, db, anchoring))
    }

    /// Same wiring with an explicit ledger strategy.
    pub fn with_ledger(config: NodeConfig, db: RocksDb, backend: Arc<dyn LedgerBackend>) -> Self {
        let anchoring = LedgerAnchoringService::with_backend(backend, db.clone());
        Self::assemble(config, db, anchoring)
    }

    fn assemble(config: NodeConfig, db: RocksDb, anchoring: LedgerAnchoringService) -> Self {
        let (queue, receiver) = AnchorQueue::channel(config.anchoring.queue_capacity);
        let parcels = ParcelRegistry::new(db.clone());
        let agreements = AgreementMachine::new(db.clone(), queue.clone());
        let integration = IntegrationLedger::new(
            db.clone(),
            parcels.clone(),
            agreements.clone(),
            config.integration.max_distance_m,
        );
        let coordinator = Arc::new(AnchorCoordinator::new(
            agreements.clone(),
            anchoring.clone(),
            queue,
            RetryPolicy::from_config(&config.anchoring, &config.ledger),
        ));

        Self {
            documents: Arc::new(LocalDocumentStore::new(db.clone())),
            config,
            db,
            parcels,
            agreements,
            integration,
            anchoring,
            coordinator,
            receiver: Some(receiver),
        }
    }

    /// Spawn the anchor workers, re-queue agreements left in `anchoring`, start the expiry sweeper.
    pub async fn start(&mut self) -> Result<Vec<JoinHandle<()>>> {
        let receiver = self.receiver.take().context("node already started")?;
        // workers first, so a large recovery backlog cannot fill the queue with nobody draining it
        let mut handles = self
            .coordinator
            .spawn_workers(receiver, self.config.anchoring.workers);

        let recovered = self.coordinator.recover().await.context("recovery sweep")?;
        info!("Recovery sweep complete ({} job(s) rebuilt)", recovered);

        handles.push(spawn_expiry_sweeper(
            self.integration.clone(),
            chrono::Duration::hours(self.config.integration.request_ttl_hours),
            Duration::from_secs(self.config.integration.expiry_sweep_secs.max(1)),
        ));
        Ok(handles)
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            parcels: self.parcels.clone(),
            integration: self.integration.clone(),
            agreements: self.agreements.clone(),
            anchoring: self.anchoring.clone(),
            documents: self.documents.clone(),
            settle_budget: self.config.anchoring.settle_budget(self.config.ledger.timeout()),
        }
    }

    pub fn api_keys(&self) -> ApiKeys {
        ApiKeys(Arc::new(self.config.security.api_keys.clone()))
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Starts the anchoring service and HTTP API
    Start {
        /// Config file (defaults to $AGRI_CONFIG or ~/.agri_anchor/config.json)
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        api_addr: Option<String>,
        #[arg(long)]
        db_path: Option<String>,
    },
    /// Validates the configuration and exits
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Prints the stored ledger receipt of an agreement
    Receipt {
        #[arg(long)]
        agreement_id: String,
        #[arg(long)]
        db_path: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            api_addr,
            db_path,
        } => {
            let mut config = NodeConfig::load(config.as_deref())?;
            if let Some(addr) = api_addr {
                config.network.api_addr = addr;
            }
            if let Some(path) = db_path {
                config.storage.db_path = path;
            }

            let validation = crate::config::validate_config(&config);
            validation.print_summary();
            if !validation.valid {
                anyhow::bail!("invalid configuration ({} error(s))", validation.errors.len());
            }

            start(config).await
        }
        Commands::CheckConfig { config } => {
            let config = NodeConfig::load(config.as_deref())?;
            let validation = crate::config::validate_config(&config);
            validation.print_summary();
            println!(
                "{} error(s), {} warning(s)",
                validation.errors.len(),
                validation.warnings.len()
            );
            if !validation.valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Receipt {
            agreement_id,
            db_path,
            config,
        } => {
            let mut config = NodeConfig::load(config.as_deref())?;
            if let Some(path) = db_path {
                config.storage.db_path = path;
            }
            let db = storage::open_db(&config.storage.db_path).map_err(anyhow::Error::msg)?;
            let anchoring = LedgerAnchoringService::from_config(&config.ledger, db)?;
            match anchoring.receipt(&agreement_id)? {
                Some(receipt) => {
                    println!("{}", serde_json::to_string_pretty(&receipt)?);
                    Ok(())
                }
                None => anyhow::bail!("no receipt stored for agreement {}", agreement_id),
            }
        }
    }
}

async fn start(config: NodeConfig) -> Result<()> {
    let addr: SocketAddr = config
        .network
        .api_addr
        .parse()
        .with_context(|| format!("invalid api_addr '{}'", config.network.api_addr))?;

    let mut node = AgriNode::open(config)?;
    let background = node.start().await?;
    let router = api::router(node.app_state(), node.api_keys());

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, draining HTTP connections");
            shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
        }
    });

    info!(
        "Starting API server on http://{} (ledger mode: {})",
        addr,
        node.anchoring.get_mode()
    );
    let served = axum_server::bind(addr)
        .handle(handle)
        .serve(router.into_make_service())
        .await;

    for task in background {
        task.abort();
    }
    if let Err(e) = served {
        error!("API server on {} stopped with error: {}", addr, e);
        return Err(e).with_context(|| format!("serve on {}", addr));
    }
    info!("Shut down cleanly");
    Ok(())
}
