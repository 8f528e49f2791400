//! Process wiring: storage, query engine, scrape and rule managers, the
//! alert dispatcher and the background tasks that drive them.

use fluxmon_core::notify::Dispatcher;
use fluxmon_core::query::QueryEngine;
use fluxmon_core::rules::{RuleContext, RuleManager};
use fluxmon_core::scrape::{HttpFetcher, ScrapeManager};
use fluxmon_core::settings::Settings;
use fluxmon_core::storage::{Engine, MaintenanceReport};
use fluxmon_core::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Everything the HTTP handlers operate on
pub struct App {
    pub storage: Arc<Engine>,
    pub query: QueryEngine,
    pub scrape: ScrapeManager,
    pub rules: RuleManager,
    pub dispatcher: Arc<Dispatcher>,
    settings: RwLock<Settings>,
    config_path: Option<PathBuf>,
    reload_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    /// Open storage and start every background component.
    ///
    /// `data_dir` overrides `[storage] data_dir` from the settings.
    pub async fn start(settings: Settings, config_path: Option<PathBuf>, data_dir: Option<&Path>) -> Result<Arc<Self>> {
        let storage_config = settings.storage_config(data_dir);
        info!("Data directory: {:?}", storage_config.data_dir);
        let storage = tokio::task::spawn_blocking(move || Engine::open(storage_config))
            .await
            .map_err(|e| Error::Internal(format!("storage open task failed: {}", e)))??;
        let storage = Arc::new(storage);

        let query = QueryEngine::new(storage.clone(), settings.query_options());
        let dispatcher = Arc::new(Dispatcher::new(settings.dispatcher_config()?, settings.notifiers()?));
        let rules = RuleManager::new(RuleContext {
            query: query.clone(),
            appender: storage.clone(),
            sink: Some(dispatcher.clone()),
        });
        let scrape = ScrapeManager::new(storage.clone(), Arc::new(HttpFetcher::new()?), settings.scrape_config());

        scrape.apply(settings.scrape_targets()?)?;
        rules.apply(settings.rule_groups()?)?;

        let cancel = CancellationToken::new();
        let mut tasks = vec![tokio::spawn(dispatcher.clone().run(cancel.child_token()))];
        tasks.push(tokio::spawn(run_maintenance(
            storage.clone(),
            Duration::from_secs(settings.server.maintenance_interval_secs),
            cancel.child_token(),
        )));
        if settings.storage.wal_sync_millis > 0 {
            tasks.push(tokio::spawn(run_wal_sync(
                storage.clone(),
                Duration::from_millis(settings.storage.wal_sync_millis),
                cancel.child_token(),
            )));
        }

        Ok(Arc::new(Self {
            storage,
            query,
            scrape,
            rules,
            dispatcher,
            settings: RwLock::new(settings),
            config_path,
            reload_lock: tokio::sync::Mutex::new(()),
            cancel,
            tasks: Mutex::new(tasks),
        }))
    }

    /// Currently applied settings
    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Re-read the configuration file and replace scrape targets, rule
    /// groups and alert routing. Storage and query settings need a restart.
    /// Nothing changes unless the whole file is valid.
    pub async fn reload(&self) -> Result<()> {
        let _guard = self.reload_lock.lock().await;
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| Error::Config("server was started without a configuration file".into()))?;

        let settings = Settings::load(path)?;
        let targets = settings.scrape_targets()?;
        let groups = settings.rule_groups()?;
        let dispatcher_config = settings.dispatcher_config()?;
        let notifiers = settings.notifiers()?;

        {
            let current = self.settings.read();
            if current.storage != settings.storage || current.query != settings.query {
                warn!("Storage and query settings changed; they take effect after a restart");
            }
        }

        self.dispatcher.reconfigure(dispatcher_config, notifiers);
        self.scrape.apply(targets)?;
        self.rules.apply(groups)?;
        *self.settings.write() = settings;
        info!("Configuration reloaded from {}", path.display());
        Ok(())
    }

    /// Stop scraping and rule evaluation, then sync storage
    pub async fn shutdown(&self) {
        self.scrape.shutdown().await;
        self.rules.shutdown().await;
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        join_tasks(tasks).await;
        if let Err(e) = self.storage.close() {
            error!("Failed to close storage: {}", e);
        }
    }
}

/// Wait for every task, logging the ones that panicked or were aborted.
/// Returns how many failed.
async fn join_tasks(tasks: Vec<JoinHandle<()>>) -> usize {
    let mut failed = 0;
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
            failed += 1;
        }
    }
    failed
}

/// Cutover, compaction and retention on a fixed interval
async fn run_maintenance(storage: Arc<Engine>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let engine = storage.clone();
        match tokio::task::spawn_blocking(move || engine.maintain()).await {
            Ok(Ok(report)) if report != MaintenanceReport::default() => info!(
                cutover = report.cutover,
                blocks_written = report.blocks_written,
                compactions = report.compactions,
                blocks_deleted = report.blocks_deleted,
                blocks_quarantined = report.blocks_quarantined,
                series_removed = report.series_removed,
                "Storage maintenance finished"
            ),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Storage maintenance failed: {}", e),
            Err(e) => error!("Storage maintenance task failed: {}", e),
        }
    }
}

/// Bounds how stale the WAL can be on crash when appends are sparse, and
/// retries a failed WAL so writes resume once the disk recovers
async fn run_wal_sync(storage: Arc<Engine>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let engine = storage.clone();
        let result = tokio::task::spawn_blocking(move || {
            if engine.health().is_err() {
                engine.try_recover_wal()
            } else {
                engine.sync_wal()
            }
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("WAL sync failed: {}", e),
            Err(e) => error!("WAL sync task failed: {}", e),
        }
    }
}
