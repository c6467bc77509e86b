//! The daemon: ownership of the shared components and the feed scheduler.
//!
//! A [`Daemon`] owns the database registry, the VT catalogue, the feed lock
//! and the scan table, and exposes the operations the protocol layer calls:
//! [`init`](Daemon::init), [`exec_scan`](Daemon::exec_scan),
//! [`stop_scan`](Daemon::stop_scan), [`check`](Daemon::check) and the
//! periodic [`scheduler`](Daemon::scheduler) tick.
//!
//! Feed coordination: the engine publishes its feed version in a plaintext
//! `plugin_feed_info.inc` next to the plugins. When the cached version falls
//! behind, the scheduler takes the cross-process feed lock (non-blocking —
//! a busy lock means somebody else is already refreshing), drops the ready
//! flag, reloads the cache and republishes version, collection hash and
//! readiness together. Launches are refused while the daemon is not ready.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::catalog::{KvCatalog, VtCatalog, VtRecord};
use crate::engine::EngineControl;
use crate::error::{Error, Result};
use crate::kv::KvStore;
use crate::lock::FeedLock;
use crate::params::ParamRegistry;
use crate::registry::Registry;
use crate::scan::{ScanRequest, ScanSink, ScanStatus, ScanTable};
use crate::supervisor::ScanSupervisor;

/// Name of the plaintext state file the engine keeps next to its plugins.
const FEED_INFO_FILE: &str = "plugin_feed_info.inc";

/// Static configuration of a daemon instance.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path of the cross-process feed lock file.
    pub lock_path: PathBuf,
    /// Niceness the engine processes are started with.
    pub niceness: Option<i32>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from("/var/run/osprey/feed-update.lock"),
            niceness: None,
        }
    }
}

#[derive(Default)]
struct Published {
    collection_hash: String,
    feed_version: Option<String>,
    engine_version: Option<String>,
}

/// Long-lived daemon state hosting the scan supervisors and the feed
/// scheduler.
pub struct Daemon {
    registry: Arc<Registry>,
    catalog: Arc<dyn VtCatalog>,
    engine: Arc<dyn EngineControl>,
    scans: Arc<ScanTable>,
    params: Mutex<ParamRegistry>,
    feed_lock: FeedLock,
    ready: AtomicBool,
    published: Mutex<Published>,
    sudo: AtomicBool,
    niceness: Option<i32>,
}

impl Daemon {
    pub async fn new(
        store: Arc<dyn KvStore>,
        engine: Arc<dyn EngineControl>,
        config: DaemonConfig,
    ) -> Result<Self> {
        let catalog = KvCatalog::open(store.as_ref(), engine.clone()).await?;
        Ok(Self {
            registry: Arc::new(Registry::new(store)),
            catalog: Arc::new(catalog),
            engine,
            scans: Arc::new(ScanTable::new()),
            params: Mutex::new(ParamRegistry::with_defaults()),
            feed_lock: FeedLock::new(config.lock_path),
            ready: AtomicBool::new(false),
            published: Mutex::new(Published::default()),
            sudo: AtomicBool::new(false),
            niceness: config.niceness,
        })
    }

    /// One-shot startup: probe the engine, fold its settings into the
    /// parameter registry, populate a cold VT cache under the feed lock and
    /// publish hash, version and readiness.
    pub async fn init(&self) -> Result<()> {
        let engine_version = self.engine.version().await?;
        tracing::info!(engine = %engine_version, "engine detected");
        self.published.lock().engine_version = Some(engine_version);

        let settings = self.engine.settings().await?;
        self.params.lock().merge_engine_settings(&settings);

        let is_root = unsafe { libc::geteuid() } == 0;
        let sudo = !is_root && self.engine.check_sudo().await;
        self.sudo.store(sudo, Ordering::SeqCst);

        if self.catalog.feed_version().await?.is_none() {
            tracing::info!("vt cache is cold, loading the feed");
            let _guard = self.feed_lock.acquire().await?;
            self.catalog.refresh().await?;
        }

        self.publish().await
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Digest of the published VT collection, the client-visible change tag.
    pub fn collection_hash(&self) -> String {
        self.published.lock().collection_hash.clone()
    }

    pub fn feed_version(&self) -> Option<String> {
        self.published.lock().feed_version.clone()
    }

    pub fn engine_version(&self) -> Option<String> {
        self.published.lock().engine_version.clone()
    }

    pub fn scans(&self) -> &Arc<ScanTable> {
        &self.scans
    }

    pub fn catalog(&self) -> &Arc<dyn VtCatalog> {
        &self.catalog
    }

    /// Whether the engine executable is discoverable.
    pub async fn check(&self) -> bool {
        let available = self.engine.check().await;
        if !available {
            tracing::error!("engine executable not available, please install it into the PATH");
        }
        available
    }

    /// Runs the scan to completion; the call returns when the scan ends.
    pub async fn exec_scan(&self, request: ScanRequest) -> ScanStatus {
        let scan_id = request.scan_id.clone();
        self.scans.register(&scan_id);

        if !self.is_ready() {
            self.scans
                .scan_error(&scan_id, "Daemon is not ready: feed update in progress.");
            self.scans.set_status(&scan_id, ScanStatus::Failed);
            return ScanStatus::Failed;
        }

        self.scans.set_status(&scan_id, ScanStatus::Running);
        let params = self.params.lock().clone();
        let status = self.supervisor().run(&request, &params).await;
        self.scans.set_status(&scan_id, status);
        status
    }

    /// Best-effort external stop of a running scan.
    pub async fn stop_scan(&self, scan_id: &str) -> Result<()> {
        self.supervisor().stop(scan_id).await?;
        self.scans.set_status(scan_id, ScanStatus::Stopped);
        Ok(())
    }

    fn supervisor(&self) -> ScanSupervisor {
        let sink: Arc<dyn ScanSink> = self.scans.clone();
        ScanSupervisor::new(
            self.registry.clone(),
            self.catalog.clone(),
            self.engine.clone(),
            sink,
        )
        .with_sudo(self.sudo.load(Ordering::SeqCst))
        .with_niceness(self.niceness)
    }

    /// Periodic tick entry.
    pub async fn scheduler(&self) {
        if let Err(e) = self.check_feed().await {
            tracing::warn!(error = %e, "feed check failed");
        }
    }

    /// Compares the cached feed against the engine's on-disk version and
    /// refreshes under the feed lock when the cache is missing or older.
    async fn check_feed(&self) -> Result<()> {
        let current = self.catalog.feed_version().await?;
        let outdated = self.feed_is_outdated(current.as_deref()).await?;

        if current.is_some() && outdated != Some(true) {
            return Ok(());
        }

        let Some(_guard) = self.feed_lock.try_acquire()? else {
            tracing::debug!("feed cache is outdated but another process holds the update lock");
            return Ok(());
        };

        let was_ready = self.ready.swap(false, Ordering::SeqCst);
        match self.refresh_under_lock().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A failed refresh must not flip an already-ready daemon.
                self.ready.store(was_ready, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn refresh_under_lock(&self) -> Result<()> {
        self.catalog.refresh().await?;
        self.publish().await
    }

    /// Publishes collection hash, feed version and the ready flag as one
    /// unit: readers holding the hash never observe it without readiness.
    async fn publish(&self) -> Result<()> {
        let collection_hash = self.catalog.collection_hash().await?;
        let feed_version = self.catalog.feed_version().await?;

        let mut published = self.published.lock();
        published.collection_hash = collection_hash;
        published.feed_version = feed_version;
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// `Some(true)` when the disk feed is newer than the cache, `None` when
    /// the engine publishes no feed info file at its current settings.
    async fn feed_is_outdated(&self, current: Option<&str>) -> Result<Option<bool>> {
        let plugins_folder = self
            .params
            .lock()
            .scan_only("plugins_folder")
            .map(str::to_string)
            .ok_or_else(|| {
                Error::FeedUnavailable("path to the plugins folder not found".to_string())
            })?;

        let feed_info = Path::new(&plugins_folder).join(FEED_INFO_FILE);
        if !feed_info.exists() {
            tracing::debug!(file = %feed_info.display(), "feed info file not found");
            let settings = self.engine.settings().await?;
            self.params.lock().merge_engine_settings(&settings);
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&feed_info)
            .await
            .map_err(|e| Error::FeedUnavailable(format!("{}: {e}", feed_info.display())))?;
        let disk = parse_plugin_set(&content);
        let current = current.and_then(|v| v.trim().parse::<i64>().ok());
        tracing::debug!(?current, ?disk, "feed version comparison");

        Ok(Some(match (current, disk) {
            (Some(cached), Some(disk)) => cached < disk,
            _ => true,
        }))
    }

    /// `(oid, record)` pairs for the protocol layer's VT listings.
    pub async fn get_vt_iterator(
        &self,
        selection: Option<&[String]>,
        details: bool,
    ) -> Result<Vec<(String, VtRecord)>> {
        self.catalog.get_iter(selection, details).await
    }
}

/// First `PLUGIN_SET = "<digits>";` value in the feed info file.
fn parse_plugin_set(content: &str) -> Option<i64> {
    for line in content.lines() {
        if !line.contains("PLUGIN_SET") {
            continue;
        }
        let (_, value) = line.split_once('=')?;
        return value.replace([';', '"'], "").trim().parse().ok();
    }
    None
}
