//! Command implementations for the `postindex` binary.
//!
//! Every command produces a JSON body on stdout. User errors (unknown
//! store, bad index name, invalid config) come back as an
//! [`ErrorEnvelope`] body with exit code 2; a sync where any store halted
//! exits with 1.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use postindex_indexing::{EngineConfig, LocalEventSource, ReconciliationEngine};
use postindex_scheduler::{AutoSyncService, SchedulerConfig, SyncCoordinator};
use postindex_storage::{Database, SqliteIndexStore, SqliteStoreCatalog, StorageError, StoreCatalog};
use postindex_types::{
    parse_date, ErrorEnvelope, ErrorKind, Handle, Hashtag, IndexCheckpoint, IndexName, Position,
    PostIndexEntry, PostPayload, Settings, Store, StoreConfig, StoreName,
};

use crate::cli::{Commands, StoreCommands};

/// Exit code for a sync in which at least one store halted.
pub const EXIT_HALTED: i32 = 1;
/// Exit code for a rejected request.
pub const EXIT_INVALID: i32 = 2;

/// JSON body and process exit code of a command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub body: Value,
    pub exit_code: i32,
}

impl CommandOutput {
    fn ok(body: Value) -> Self {
        Self { body, exit_code: 0 }
    }

    fn rejected(envelope: ErrorEnvelope) -> Self {
        let body = serde_json::to_value(&envelope).unwrap_or(Value::Null);
        Self {
            body,
            exit_code: EXIT_INVALID,
        }
    }
}

/// Load settings and apply CLI overrides (highest precedence).
pub fn load_settings(
    config_path: Option<&str>,
    log_level: Option<&str>,
    catalog_path: Option<&str>,
) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(level) = log_level {
        settings.log_level = level.to_string();
    }
    if let Some(path) = catalog_path {
        settings.catalog_path = path.to_string();
    }
    Ok(settings)
}

/// Install the global tracing subscriber.
///
/// Logs go to stderr so stdout stays machine-readable. `RUST_LOG` wins over
/// the configured level.
pub fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// Opened catalog, index state and event logs.
pub struct App {
    settings: Settings,
    catalog: Arc<SqliteStoreCatalog>,
    index: Arc<SqliteIndexStore>,
    source: Arc<LocalEventSource>,
}

impl App {
    pub fn open(settings: Settings) -> Result<Self> {
        let path = settings.expanded_catalog_path();
        info!("Opening catalog at {:?}", path);
        let db = Database::open(&path)
            .with_context(|| format!("Failed to open catalog database at {:?}", path))?;

        Ok(Self {
            settings,
            catalog: Arc::new(SqliteStoreCatalog::new(db.clone())),
            index: Arc::new(SqliteIndexStore::new(db)),
            source: Arc::new(LocalEventSource::new()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn catalog(&self) -> &SqliteStoreCatalog {
        &self.catalog
    }

    pub fn index(&self) -> &SqliteIndexStore {
        &self.index
    }

    pub fn engine(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(
            self.catalog.clone(),
            self.index.clone(),
            self.source.clone(),
            EngineConfig::from(&self.settings.engine),
        )
    }

    fn scheduler_config(&self) -> Result<SchedulerConfig> {
        SchedulerConfig::from_settings(&self.settings.scheduler)
            .context("Invalid scheduler configuration")
    }

    fn require_store(&self, raw: &str) -> Result<Store> {
        let name = parse_store_name(raw)?;
        match self.catalog.get(&name)? {
            Some(store) => Ok(store),
            None => Err(store_not_found(&name).into()),
        }
    }
}

/// Run one command against an opened [`App`].
pub async fn execute(app: &App, command: Commands) -> Result<CommandOutput> {
    let result = match command {
        Commands::Stores { command } => handle_stores(app, command),
        Commands::Ingest { store, file } => ingest(app, &store, &file).await,
        Commands::Sync { stores } => sync(app, &stores).await,
        Commands::Status { store } => status(app, store.as_deref()),
        Commands::Lookup { store, index, key } => lookup(app, &store, &index, &key),
        Commands::Watch => watch(app).await,
    };

    match result {
        Ok(output) => Ok(output),
        Err(e) => match e.downcast::<ErrorEnvelope>() {
            Ok(envelope) => Ok(CommandOutput::rejected(envelope)),
            Err(e) => Err(e),
        },
    }
}

fn handle_stores(app: &App, command: StoreCommands) -> Result<CommandOutput> {
    match command {
        StoreCommands::Add {
            name,
            root,
            description,
            config_json,
        } => {
            let name = parse_store_name(&name)?;
            let config = match config_json {
                Some(json) => StoreConfig::from_json(&json).map_err(|e| {
                    ErrorEnvelope::new(ErrorKind::InvalidConfig, format!("invalid store config: {}", e))
                        .with_received(json.clone())
                        .with_fix(r#"Pass camelCase store config JSON, e.g. {"autoSync":true}"#)
                })?,
                None => StoreConfig::default(),
            };
            let root = root.unwrap_or_else(|| app.settings.expanded_data_dir().join(name.as_str()));

            match app.catalog.register(name.clone(), root, description, config) {
                Ok(store) => {
                    info!(store = %store.name, root = ?store.root, "Store registered");
                    Ok(CommandOutput::ok(serde_json::to_value(&store)?))
                }
                Err(StorageError::AlreadyExists(_)) => Err(ErrorEnvelope::new(
                    ErrorKind::InvalidConfig,
                    format!("store '{}' already exists", name),
                )
                .with_received(name.to_string())
                .with_fix("Choose another name or remove the existing store first")
                .into()),
                Err(e) => Err(e).context("Failed to register store"),
            }
        }
        StoreCommands::List => {
            let stores = app.catalog.list().context("Failed to list stores")?;
            Ok(CommandOutput::ok(serde_json::to_value(&stores)?))
        }
        StoreCommands::Show { name } => {
            let store = app.require_store(&name)?;
            Ok(CommandOutput::ok(serde_json::to_value(&store)?))
        }
        StoreCommands::Remove { name } => {
            let name = parse_store_name(&name)?;
            if !app.catalog.remove(&name)? {
                return Err(store_not_found(&name).into());
            }
            app.source.evict(&name);
            info!(store = %name, "Store removed");
            Ok(CommandOutput::ok(serde_json::json!({ "removed": name })))
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestSummary {
    store: StoreName,
    appended: usize,
    first_position: Option<Position>,
    last_position: Option<Position>,
}

async fn ingest(app: &App, store: &str, file: &Path) -> Result<CommandOutput> {
    let store = app.require_store(store)?;
    let source = Arc::clone(&app.source);
    let file: PathBuf = file.to_path_buf();

    let summary = tokio::task::spawn_blocking(move || -> Result<IngestSummary> {
        let payloads = read_payloads(&file)?;
        let log = source
            .log_for(&store)
            .with_context(|| format!("Failed to open event log for '{}'", store.name))?;
        let positions = log.append_batch(&payloads)?;
        log.flush()?;
        Ok(IngestSummary {
            store: store.name,
            appended: positions.len(),
            first_position: positions.first().copied(),
            last_position: positions.last().copied(),
        })
    })
    .await
    .context("Ingest task failed")??;

    info!(store = %summary.store, appended = summary.appended, "Events ingested");
    Ok(CommandOutput::ok(serde_json::to_value(&summary)?))
}

/// Parse a JSON-lines file of post payloads. Blank lines are skipped.
pub fn read_payloads(file: &Path) -> Result<Vec<PostPayload>> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<PostPayload>(line)
                .with_context(|| format!("{}:{}: invalid post payload", file.display(), n + 1))
        })
        .collect()
}

async fn sync(app: &App, names: &[String]) -> Result<CommandOutput> {
    let stores = if names.is_empty() {
        app.catalog.list().context("Failed to list stores")?
    } else {
        names
            .iter()
            .map(|name| app.require_store(name))
            .collect::<Result<Vec<_>>>()?
    };

    let coordinator = SyncCoordinator::new(Arc::new(app.engine()), &app.scheduler_config()?);
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, stopping after the current batch");
                cancel.cancel();
            }
        })
    };

    let summary = coordinator.sync_stores(stores, &cancel).await;
    interrupt.abort();

    let exit_code = if summary.has_failures() { EXIT_HALTED } else { 0 };
    Ok(CommandOutput {
        body: serde_json::to_value(&summary)?,
        exit_code,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreStatus {
    store: StoreName,
    /// Last appended position of the local event log, when one exists
    log_position: Option<Position>,
    checkpoints: Vec<IndexCheckpoint>,
    entries: BTreeMap<IndexName, u64>,
}

fn status(app: &App, store: Option<&str>) -> Result<CommandOutput> {
    let stores = match store {
        Some(name) => vec![app.require_store(name)?],
        None => app.catalog.list().context("Failed to list stores")?,
    };

    let mut statuses = Vec::with_capacity(stores.len());
    for store in stores {
        let log_position = if store.events_path().exists() {
            Some(app.source.log_for(&store)?.last_position()?)
        } else {
            None
        };
        let mut entries = BTreeMap::new();
        for index in store.config.enabled_indexes() {
            entries.insert(index, app.index.entry_count(&store.name, index)?);
        }
        statuses.push(StoreStatus {
            checkpoints: app.index.list_checkpoints(&store.name)?,
            store: store.name,
            log_position,
            entries,
        });
    }

    let body = match store {
        Some(_) => serde_json::to_value(statuses.pop())?,
        None => serde_json::to_value(&statuses)?,
    };
    Ok(CommandOutput::ok(body))
}

#[derive(Debug, Serialize)]
struct LookupResult {
    store: StoreName,
    index: IndexName,
    key: String,
    entries: Vec<PostIndexEntry>,
}

fn lookup(app: &App, store: &str, index: &str, key: &str) -> Result<CommandOutput> {
    let store = app.require_store(store)?;
    let index = IndexName::parse(index).map_err(|e| {
        ErrorEnvelope::new(ErrorKind::InvalidConfig, e.to_string())
            .with_received(index)
            .with_valid_tags(IndexName::ALL.iter().map(|i| i.as_str().to_string()).collect())
    })?;
    let key = normalize_key(index, key)?;

    let entries = app.index.entries_for_key(&store.name, index, &key)?;
    Ok(CommandOutput::ok(serde_json::to_value(LookupResult {
        store: store.name,
        index,
        key,
        entries,
    })?))
}

/// Normalise a lookup key the same way keys are derived at projection.
pub fn normalize_key(index: IndexName, raw: &str) -> Result<String, ErrorEnvelope> {
    let key = match index {
        IndexName::Hashtag => Hashtag::parse(raw).map(|tag| tag.to_string()),
        IndexName::Author => Handle::parse(raw).map(|handle| handle.to_string()),
        IndexName::Date => parse_date(raw).map(|date| date.format("%Y-%m-%d").to_string()),
    };
    key.map_err(|e| {
        ErrorEnvelope::new(ErrorKind::InvalidConfig, e.to_string())
            .with_received(raw)
            .with_expected(match index {
                IndexName::Hashtag => "a hashtag such as rust or #Rust",
                IndexName::Author => "a handle such as alice.example.com",
                IndexName::Date => "a date as YYYY-MM-DD",
            })
    })
}

async fn watch(app: &App) -> Result<CommandOutput> {
    let config = app.scheduler_config()?;
    let coordinator = Arc::new(SyncCoordinator::new(Arc::new(app.engine()), &config));

    let mut service = AutoSyncService::new(config)
        .await
        .context("Failed to create scheduler")?;
    service
        .register_sync_job(Arc::clone(&coordinator))
        .await
        .context("Failed to register auto-sync job")?;
    service.start().await.context("Failed to start scheduler")?;

    shutdown_signal().await;

    service.shutdown().await.context("Scheduler shutdown failed")?;
    Ok(CommandOutput::ok(serde_json::to_value(
        coordinator.registry().all_status(),
    )?))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

fn parse_store_name(raw: &str) -> Result<StoreName, ErrorEnvelope> {
    StoreName::parse(raw).map_err(|e| {
        ErrorEnvelope::new(ErrorKind::InvalidConfig, e.to_string())
            .with_received(raw)
            .with_expected("1-64 characters of [a-z0-9_-], starting alphanumeric")
    })
}

fn store_not_found(name: &StoreName) -> ErrorEnvelope {
    ErrorEnvelope::new(ErrorKind::StoreNotFound, format!("no store named '{}'", name))
        .with_received(name.to_string())
        .with_fix("Run `postindex stores list` to see registered stores")
}
