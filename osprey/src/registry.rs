//! Allocation of knowledge bases inside the shared store.
//!
//! One *main KB* is claimed per scan and stays allocated for the scan's
//! lifetime. The engine claims additional databases for the hosts it is
//! actively scanning and advertises their indices in the main KB; those are
//! wrapped as [`ScanKb`] handles, drained by the supervisor and released as
//! soon as the host finishes. Releasing always flushes the database before
//! clearing the in-use flag, so a released index can be re-claimed by anyone.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::kv::{KvHandle, KvStore};

/// List every database shares: `|||`-delimited result records.
pub(crate) const RESULTS_KEY: &str = "internal/results";

/// List in the main KB where the engine pushes the index of every per-host
/// database it claims.
const SCAN_DB_INDEX_KEY: &str = "internal/dbindex";

fn status_key(engine_scan_id: &str) -> String {
    format!("internal/{engine_scan_id}")
}

/// Registry over the claimable databases. `new_kb` is serialised with a
/// process-local mutex so two local supervisors cannot race the probe.
pub struct Registry {
    store: Arc<dyn KvStore>,
    alloc: Mutex<()>,
}

impl Registry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            alloc: Mutex::new(()),
        }
    }

    /// Claims the first free database as a fresh main KB.
    pub async fn new_kb(&self) -> Result<MainKb> {
        let _guard = self.alloc.lock().await;
        let (_, kb) = self.store.acquire_empty().await?;
        Ok(MainKb { kb })
    }

    /// Locates the live main KB holding `scan_id` and returns it together
    /// with the engine scan id bound to it.
    pub async fn find_by_scan_id(&self, scan_id: &str) -> Result<Option<(String, MainKb)>> {
        let key = format!("internal/{scan_id}/globalscanid");
        let max = self.store.max_db_count().await?;
        for db in 1..max {
            let kb = self.store.select(db).await?;
            if let Some(engine_scan_id) = kb.get(&key).await? {
                return Ok(Some((engine_scan_id, MainKb { kb })));
            }
        }
        Ok(None)
    }

    /// Binds handles for the per-host databases currently advertised under
    /// `main`. Stale indices resolve to databases whose bound scan id no
    /// longer matches and are filtered out by the caller.
    pub async fn enumerate_scan_dbs(&self, main: &MainKb) -> Result<Vec<ScanKb>> {
        let mut dbs = Vec::new();
        for raw in main.kb.lrange(SCAN_DB_INDEX_KEY).await? {
            let Ok(index) = raw.trim().parse::<u32>() else {
                continue;
            };
            if index == main.index() {
                continue;
            }
            dbs.push(ScanKb {
                kb: self.store.select(index).await?,
            });
        }
        Ok(dbs)
    }

    /// Flushes all keys under the main KB and clears its in-use flag.
    pub async fn release_main(&self, kb: MainKb) -> Result<()> {
        self.release_index(kb.kb).await
    }

    /// Flushes a per-host database and clears its in-use flag.
    pub async fn release_scan(&self, kb: ScanKb) -> Result<()> {
        self.release_index(kb.kb).await
    }

    async fn release_index(&self, kb: Box<dyn KvHandle>) -> Result<()> {
        let index = kb.index();
        kb.flush().await?;
        self.store.release_claim(index).await
    }
}

/// The per-scan database: scan status, preference rows, the engine PID and
/// the scan-global result list live here.
#[derive(Debug)]
pub struct MainKb {
    kb: Box<dyn KvHandle>,
}

impl MainKb {
    pub fn index(&self) -> u32 {
        self.kb.index()
    }

    pub(crate) fn kv(&self) -> &dyn KvHandle {
        self.kb.as_ref()
    }

    /// Records the scan-id bijection and puts the scan into the `new` state
    /// the engine handshake starts from.
    pub async fn bind_scan(&self, scan_id: &str, engine_scan_id: &str) -> Result<()> {
        self.kb.set(&status_key(engine_scan_id), "new").await?;
        self.kb.set("internal/scanid", engine_scan_id).await?;
        self.kb
            .set(&format!("internal/{scan_id}/globalscanid"), engine_scan_id)
            .await
    }

    pub async fn status(&self, engine_scan_id: &str) -> Result<Option<String>> {
        self.kb.get(&status_key(engine_scan_id)).await
    }

    /// Engine scan id currently bound to this database. `None` once the KB
    /// has been flushed, or a foreign id after somebody else re-claimed it.
    pub async fn bound_engine_scan_id(&self) -> Result<Option<String>> {
        self.kb.get("internal/scanid").await
    }

    /// Sets the stop marker the engine and the supervisor both poll.
    pub async fn stop_scan(&self, engine_scan_id: &str) -> Result<()> {
        self.kb.set(&status_key(engine_scan_id), "stopped").await
    }

    pub async fn scan_is_stopped(&self, engine_scan_id: &str) -> Result<bool> {
        Ok(self.status(engine_scan_id).await?.as_deref() == Some("stopped"))
    }

    /// True once the engine has marked the whole target done. A missing
    /// status key counts as finished: the KB was already cleaned up.
    pub async fn target_is_finished(&self, engine_scan_id: &str) -> Result<bool> {
        Ok(matches!(
            self.status(engine_scan_id).await?.as_deref(),
            Some("finished") | None
        ))
    }

    pub async fn set_engine_pid(&self, pid: u32) -> Result<()> {
        self.kb.set("internal/pid", &pid.to_string()).await
    }

    pub async fn engine_pid(&self) -> Result<Option<u32>> {
        Ok(self
            .kb
            .get("internal/pid")
            .await?
            .and_then(|v| v.trim().parse().ok()))
    }

    /// Appends preference rows to the list the engine consumes at startup.
    pub async fn push_prefs(&self, engine_scan_id: &str, rows: &[String]) -> Result<()> {
        self.kb
            .lpush(&format!("internal/{engine_scan_id}/scan_prefs"), rows)
            .await
    }
}

/// A per-host database the engine claimed beneath a main KB.
pub struct ScanKb {
    kb: Box<dyn KvHandle>,
}

impl ScanKb {
    pub fn index(&self) -> u32 {
        self.kb.index()
    }

    pub(crate) fn kv(&self) -> &dyn KvHandle {
        self.kb.as_ref()
    }

    /// Engine scan id this database belongs to, unset while the engine is
    /// still initialising it.
    pub async fn bound_scan_id(&self) -> Result<Option<String>> {
        self.kb.get("internal/scan_id").await
    }

    pub async fn host_ip(&self) -> Result<Option<String>> {
        self.kb.get("internal/ip").await
    }

    /// Next `launched/total` progress entry, oldest first.
    pub async fn pop_status(&self) -> Result<Option<String>> {
        self.kb.rpop("internal/status").await
    }

    /// One-shot read of the host start timestamp. Cleared on read so the
    /// HOST_START entry is emitted exactly once.
    pub async fn take_start_time(&self) -> Result<Option<String>> {
        self.take("internal/start_time").await
    }

    /// One-shot read of the host end timestamp.
    pub async fn take_end_time(&self) -> Result<Option<String>> {
        self.take("internal/end_time").await
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let value = self.kb.get(key).await?;
        if value.is_some() {
            self.kb.del(key).await?;
        }
        Ok(value)
    }

    pub async fn host_is_finished(&self, engine_scan_id: &str) -> Result<bool> {
        Ok(self.kb.get(&status_key(engine_scan_id)).await?.as_deref() == Some("finished"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::kv::MemoryKv;

    fn registry(db_count: u32) -> Registry {
        Registry::new(Arc::new(MemoryKv::new(db_count)))
    }

    #[tokio::test]
    async fn new_kb_claims_and_release_frees() {
        let registry = registry(3);
        let kb = registry.new_kb().await.unwrap();
        assert_eq!(kb.index(), 1);

        let second = registry.new_kb().await.unwrap();
        assert_eq!(second.index(), 2);

        match registry.new_kb().await {
            Err(Error::NoFreeDb) => {}
            other => panic!("expected NoFreeDb, got {other:?}"),
        }

        registry.release_main(kb).await.unwrap();
        let reused = registry.new_kb().await.unwrap();
        assert_eq!(reused.index(), 1);
    }

    #[tokio::test]
    async fn release_flushes_all_keys() {
        let store = Arc::new(MemoryKv::new(3));
        let registry = Registry::new(store.clone() as Arc<dyn KvStore>);

        let kb = registry.new_kb().await.unwrap();
        kb.bind_scan("scan-1", "engine-1").await.unwrap();
        let index = kb.index();
        registry.release_main(kb).await.unwrap();

        let raw = store.select(index).await.unwrap();
        assert_eq!(raw.scan_keys("*").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn find_by_scan_id_round_trips() {
        let registry = registry(4);
        let kb = registry.new_kb().await.unwrap();
        kb.bind_scan("scan-77", "engine-77").await.unwrap();

        let (engine_scan_id, found) = registry
            .find_by_scan_id("scan-77")
            .await
            .unwrap()
            .expect("scan should be found");
        assert_eq!(engine_scan_id, "engine-77");
        assert_eq!(found.index(), kb.index());

        assert!(registry.find_by_scan_id("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enumerate_scan_dbs_follows_advertised_indices() {
        let store = Arc::new(MemoryKv::new(5));
        let registry = Registry::new(store.clone() as Arc<dyn KvStore>);

        let main = registry.new_kb().await.unwrap();
        main.bind_scan("scan-1", "engine-1").await.unwrap();

        // The engine claims db 2, binds it and advertises it in the main KB.
        store.try_claim(2).await.unwrap();
        let host_db = store.select(2).await.unwrap();
        host_db.set("internal/scan_id", "engine-1").await.unwrap();
        host_db.set("internal/ip", "10.0.0.1").await.unwrap();
        main.kv()
            .lpush(SCAN_DB_INDEX_KEY, &["2".to_string()])
            .await
            .unwrap();

        let dbs = registry.enumerate_scan_dbs(&main).await.unwrap();
        assert_eq!(dbs.len(), 1);
        assert_eq!(dbs[0].bound_scan_id().await.unwrap().as_deref(), Some("engine-1"));
        assert_eq!(dbs[0].host_ip().await.unwrap().as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn host_timestamps_are_one_shot() {
        let store = Arc::new(MemoryKv::new(3));
        store.try_claim(1).await.unwrap();
        let kb = store.select(1).await.unwrap();
        kb.set("internal/start_time", "123").await.unwrap();

        let scan_kb = ScanKb { kb };
        assert_eq!(scan_kb.take_start_time().await.unwrap().as_deref(), Some("123"));
        assert_eq!(scan_kb.take_start_time().await.unwrap(), None);
    }
}
