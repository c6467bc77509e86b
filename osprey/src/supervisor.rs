//! Per-scan orchestration.
//!
//! One [`ScanSupervisor`] drives one scan from launch to cleanup:
//!
//! 1. claim a main KB and write the engine preferences into it
//! 2. spawn the engine process and wait for it to pick the scan up
//! 3. poll: drain results from the main KB and every per-host database the
//!    engine advertises, translate them into sink callbacks, watch for the
//!    client stop flag and for an engine that died under us
//! 4. release every claimed database, whatever the outcome
//!
//! The loop paces itself with plain sleeps; the store offers no push
//! notification over the per-scan structures, and since every scan runs on
//! its own task with its own connection the blocking is local to the scan.
//!
//! Per-host ordering is honoured here: the HOST_START stamp is forwarded
//! before the first drained log of a host, and HOST_END only after the final
//! drain of a finished host's database.

use std::sync::Arc;
use std::time::Duration;

use crate::catalog::VtCatalog;
use crate::engine::{EngineControl, ProcessState};
use crate::error::Result;
use crate::params::ParamRegistry;
use crate::prefs::PreferenceBuilder;
use crate::registry::{MainKb, Registry, ScanKb};
use crate::results::{self, Harvest, ResultEntry};
use crate::scan::{ScanRequest, ScanSink, ScanStatus};

/// Orchestrates the lifecycle of individual scans. One instance is shared by
/// the daemon; each `run` call owns exactly one scan.
pub struct ScanSupervisor {
    registry: Arc<Registry>,
    catalog: Arc<dyn VtCatalog>,
    engine: Arc<dyn EngineControl>,
    sink: Arc<dyn ScanSink>,
    sudo: bool,
    niceness: Option<i32>,
    launch_poll: Duration,
    tick: Duration,
    handshake_timeout: Duration,
}

impl ScanSupervisor {
    pub fn new(
        registry: Arc<Registry>,
        catalog: Arc<dyn VtCatalog>,
        engine: Arc<dyn EngineControl>,
        sink: Arc<dyn ScanSink>,
    ) -> Self {
        Self {
            registry,
            catalog,
            engine,
            sink,
            sudo: false,
            niceness: None,
            launch_poll: Duration::from_secs(1),
            tick: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(600),
        }
    }

    /// Whether the engine helpers should be wrapped in `sudo -n`.
    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn with_niceness(mut self, niceness: Option<i32>) -> Self {
        self.niceness = niceness;
        self
    }

    /// Drives one scan to its end. Never panics the daemon: every failure
    /// path surfaces a scan error and comes back as `Failed`.
    pub async fn run(&self, request: &ScanRequest, params: &ParamRegistry) -> ScanStatus {
        match self.execute(request, params).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(scan_id = %request.scan_id, error = %e, "scan failed");
                self.sink.scan_error(&request.scan_id, &e.to_string());
                ScanStatus::Failed
            }
        }
    }

    async fn execute(&self, request: &ScanRequest, params: &ParamRegistry) -> Result<ScanStatus> {
        let scan_id = request.scan_id.as_str();
        let kb = self.registry.new_kb().await?;

        let builder = PreferenceBuilder::new(request, &kb);
        let engine_scan_id = builder.engine_scan_id().to_string();

        let mut do_not_launch = false;
        builder.prepare_scan_id().await?;
        builder.prepare_target().await?;
        if !builder.prepare_ports().await? {
            self.sink.scan_error(scan_id, "No port list defined.");
            do_not_launch = true;
        }
        if !builder.prepare_credentials().await? {
            self.sink.scan_error(scan_id, "Malformed credential.");
            do_not_launch = true;
        }
        if !builder.prepare_plugins().await? {
            self.sink.scan_error(scan_id, "No VTS to run.");
            do_not_launch = true;
        }
        builder.prepare_main_kb_index().await?;
        builder.prepare_host_options().await?;
        builder.prepare_scan_params(params).await?;
        builder.prepare_reverse_lookup().await?;
        builder.prepare_alive_test().await?;
        drop(builder);

        if do_not_launch {
            self.registry.release_main(kb).await?;
            return Ok(ScanStatus::Failed);
        }

        let mut child = match self
            .engine
            .start_scan(&engine_scan_id, self.sudo, self.niceness)
            .await
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(scan_id, error = %e, "engine launch failed");
                self.sink.scan_error(scan_id, "Could not launch the engine process.");
                self.registry.release_main(kb).await?;
                return Ok(ScanStatus::Failed);
            }
        };

        let Some(pid) = child.pid() else {
            self.sink.scan_error(scan_id, "Could not launch the engine process.");
            self.registry.release_main(kb).await?;
            return Ok(ScanStatus::Failed);
        };
        kb.set_engine_pid(pid).await?;
        tracing::debug!(scan_id, pid, "engine process started");

        // Wait until the engine picked the scan up and loaded the
        // preferences. Bounded: an engine writing neither a status nor
        // exiting must not park the supervisor forever.
        let deadline = tokio::time::Instant::now() + self.handshake_timeout;
        while kb.status(&engine_scan_id).await?.as_deref() == Some("new") {
            if child.poll().is_some_and(|code| code < 0) {
                tracing::error!(
                    scan_id,
                    "engine ended unexpectedly with errors during launch"
                );
                self.sink
                    .scan_error(scan_id, "Engine ended unexpectedly with errors during launch.");
                self.stop(scan_id).await?;
                return Ok(ScanStatus::Failed);
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::error!(scan_id, "engine did not pick up the scan in time");
                self.sink.scan_error(scan_id, "Engine did not start the scan in time.");
                self.stop(scan_id).await?;
                return Ok(ScanStatus::Failed);
            }
            tokio::time::sleep(self.launch_poll).await;
        }

        loop {
            if !kb.target_is_finished(&engine_scan_id).await?
                && !self.engine_alive_for(&kb, pid, &engine_scan_id).await?
            {
                tracing::error!(scan_id, "scan was unexpectedly stopped or killed");
                self.sink
                    .scan_error(scan_id, "Task was unexpectedly stopped or killed.");
                kb.stop_scan(&engine_scan_id).await?;
                for scan_db in self.registry.enumerate_scan_dbs(&kb).await? {
                    self.registry.release_scan(scan_db).await?;
                }
                self.registry.release_main(kb).await?;
                return Ok(ScanStatus::Failed);
            }

            tokio::time::sleep(self.tick).await;

            if kb.scan_is_stopped(&engine_scan_id).await? {
                self.registry.release_main(kb).await?;
                return Ok(ScanStatus::Stopped);
            }

            // A concurrent stop may have flushed the KB between the checks
            // above; a vanished or foreign binding means the scan is gone.
            if kb.bound_engine_scan_id().await?.as_deref() != Some(engine_scan_id.as_str()) {
                return Ok(ScanStatus::Stopped);
            }

            // Scan-global records: dead-host batches land here.
            self.forward(
                scan_id,
                results::drain(kb.kv(), "", self.catalog.as_ref()).await?,
            );

            let mut no_active_host = true;
            for scan_db in self.registry.enumerate_scan_dbs(&kb).await? {
                if scan_db.bound_scan_id().await?.as_deref() != Some(engine_scan_id.as_str()) {
                    continue;
                }
                no_active_host = false;

                let host = scan_db.host_ip().await?.unwrap_or_default();
                self.process_host_db(scan_id, &engine_scan_id, &host, scan_db)
                    .await?;
            }

            if no_active_host && kb.target_is_finished(&engine_scan_id).await? {
                break;
            }
        }

        self.registry.release_main(kb).await?;
        Ok(ScanStatus::Finished)
    }

    async fn process_host_db(
        &self,
        scan_id: &str,
        engine_scan_id: &str,
        host: &str,
        scan_db: ScanKb,
    ) -> Result<()> {
        if let Some(started) = scan_db.take_start_time().await? {
            self.sink
                .push_results(scan_id, vec![ResultEntry::log(host, "HOST_START", &started)]);
        }

        self.forward(
            scan_id,
            results::drain(scan_db.kv(), host, self.catalog.as_ref()).await?,
        );
        self.report_progress(scan_id, host, &scan_db).await?;

        if scan_db.host_is_finished(engine_scan_id).await? {
            self.sink.hosts_finished(scan_id, &[host.to_string()]);

            // Final drain so nothing of this host trails its HOST_END.
            self.forward(
                scan_id,
                results::drain(scan_db.kv(), host, self.catalog.as_ref()).await?,
            );
            self.report_progress(scan_id, host, &scan_db).await?;
            if let Some(ended) = scan_db.take_end_time().await? {
                self.sink
                    .push_results(scan_id, vec![ResultEntry::log(host, "HOST_END", &ended)]);
            }

            self.registry.release_scan(scan_db).await?;
        }
        Ok(())
    }

    async fn report_progress(&self, scan_id: &str, host: &str, scan_db: &ScanKb) -> Result<()> {
        while let Some(msg) = scan_db.pop_status().await? {
            if let Some(progress) = results::host_progress(&msg) {
                self.sink.set_host_progress(scan_id, host, progress);
            }
        }
        Ok(())
    }

    fn forward(&self, scan_id: &str, harvest: Harvest) {
        if !harvest.entries.is_empty() {
            self.sink.push_results(scan_id, harvest.entries);
        }
        for (host, progress) in &harvest.host_progress {
            self.sink.set_host_progress(scan_id, host, *progress);
        }
        if !harvest.finished_hosts.is_empty() {
            self.sink.hosts_finished(scan_id, &harvest.finished_hosts);
        }
    }

    /// Liveness of the engine process for this scan. A missing or zombie
    /// process still counts as alive when the KB carries the stop marker:
    /// the stop path owns the cleanup then.
    async fn engine_alive_for(
        &self,
        kb: &MainKb,
        pid: u32,
        engine_scan_id: &str,
    ) -> Result<bool> {
        match self.engine.process_state(pid) {
            ProcessState::Running => Ok(true),
            ProcessState::Missing | ProcessState::Zombie => {
                kb.scan_is_stopped(engine_scan_id).await
            }
        }
    }

    /// Best-effort external stop: mark the KB stopped, ask the engine to
    /// wind the scan down, wait for the process to disappear, then release
    /// every database of the scan.
    pub async fn stop(&self, scan_id: &str) -> Result<()> {
        let Some((engine_scan_id, kb)) = self.registry.find_by_scan_id(scan_id).await? else {
            tracing::debug!(scan_id, "stop requested for unknown scan");
            return Ok(());
        };

        kb.stop_scan(&engine_scan_id).await?;

        if let Some(pid) = kb.engine_pid().await? {
            if self.engine.process_state(pid) != ProcessState::Missing {
                if !self.engine.stop_scan(&engine_scan_id, self.sudo).await? {
                    tracing::debug!(scan_id, pid, "engine stop helper refused the stop");
                    return Ok(());
                }
                tracing::debug!(scan_id, pid, "waiting for engine process to exit");
                while self.engine.process_state(pid) != ProcessState::Missing {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        for scan_db in self.registry.enumerate_scan_dbs(&kb).await? {
            self.registry.release_scan(scan_db).await?;
        }
        self.registry.release_main(kb).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{KvCatalog, Severities, VtRecord};
    use crate::engine::StubEngine;
    use crate::kv::{KvStore, MemoryKv};
    use crate::results::ResultKind;
    use crate::scan::{ScanTable, VtSelection};

    const OID_A: &str = "1.3.6.1.4.1.25623.1.0.100001";
    const OID_B: &str = "1.3.6.1.4.1.25623.1.0.100002";
    const OID_C: &str = "1.3.6.1.4.1.25623.1.0.100003";

    fn catalog_records() -> Vec<VtRecord> {
        let mut alarm_vt = VtRecord {
            oid: OID_C.to_string(),
            name: "Weak service".to_string(),
            ..VtRecord::default()
        };
        alarm_vt.severities = Severities {
            severity_type: Some("cvss_base_v2".to_string()),
            severity_base_vector: Some("AV:N/AC:L/Au:N/C:P/I:P/A:P".to_string()),
            severity_origin: None,
        };
        vec![
            VtRecord {
                oid: OID_A.to_string(),
                name: "Port check".to_string(),
                qod_type: Some("remote_banner".to_string()),
                ..VtRecord::default()
            },
            VtRecord {
                oid: OID_B.to_string(),
                name: "Banner check".to_string(),
                ..VtRecord::default()
            },
            alarm_vt,
        ]
    }

    fn request(scan_id: &str) -> ScanRequest {
        ScanRequest {
            scan_id: scan_id.to_string(),
            targets: "10.0.0.1".to_string(),
            ports: "T:22,80".to_string(),
            vts: [OID_A, OID_B, OID_C]
                .iter()
                .map(|oid| VtSelection {
                    oid: oid.to_string(),
                    params: Vec::new(),
                })
                .collect(),
            ..ScanRequest::default()
        }
    }

    struct Fixture {
        store: MemoryKv,
        engine: StubEngine,
        table: Arc<ScanTable>,
        supervisor: Arc<ScanSupervisor>,
    }

    async fn fixture() -> Fixture {
        let store = MemoryKv::new(8);
        KvCatalog::write_cache(&store, "1588099767", &catalog_records())
            .await
            .unwrap();
        let engine = StubEngine::default();
        let registry = Arc::new(Registry::new(Arc::new(store.clone())));
        let catalog = Arc::new(
            KvCatalog::open(&store, Arc::new(engine.clone()))
                .await
                .unwrap(),
        );
        let table = Arc::new(ScanTable::new());
        let supervisor = Arc::new(ScanSupervisor::new(
            registry,
            catalog,
            Arc::new(engine.clone()),
            table.clone(),
        ));
        Fixture {
            store,
            engine,
            table,
            supervisor,
        }
    }

    /// Polls db 1 until the preference step published the engine scan id.
    async fn wait_for_engine_scan_id(store: &MemoryKv) -> String {
        let db = store.select(1).await.unwrap();
        loop {
            if let Some(id) = db.get("internal/scanid").await.unwrap() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn all_claims_released(store: &MemoryKv) -> bool {
        for db in 1..store.max_db_count().await.unwrap() {
            if !store.try_claim(db).await.unwrap() {
                return false;
            }
            store.release_claim(db).await.unwrap();
        }
        true
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_emits_an_ordered_host_stream() {
        let Fixture {
            store,
            engine,
            table,
            supervisor,
        } = fixture().await;

        let emulated = {
            let store = store.clone();
            let engine = engine.clone();
            tokio::spawn(async move {
                let main = store.select(1).await.unwrap();
                let esid = wait_for_engine_scan_id(&store).await;
                main.set(&format!("internal/{esid}"), "ready").await.unwrap();

                // Claim a host database and advertise it.
                tokio::time::sleep(Duration::from_millis(1700)).await;
                store.try_claim(2).await.unwrap();
                let host_db = store.select(2).await.unwrap();
                host_db.set("internal/scan_id", &esid).await.unwrap();
                host_db.set("internal/ip", "10.0.0.1").await.unwrap();
                host_db
                    .set("internal/start_time", "1585279103")
                    .await
                    .unwrap();
                main.lpush("internal/dbindex", &["2".to_string()])
                    .await
                    .unwrap();

                // Results for the host arrive a little later.
                tokio::time::sleep(Duration::from_millis(3300)).await;
                host_db
                    .lpush(
                        "internal/results",
                        &[
                            format!("LOG|||example.host|||22/tcp|||{OID_A}|||ssh is up"),
                            format!("LOG|||example.host|||80/tcp|||{OID_B}|||http is up"),
                            format!("ALARM|||example.host|||80/tcp|||{OID_C}|||weak cipher"),
                        ],
                    )
                    .await
                    .unwrap();
                host_db
                    .lpush("internal/status", &["3/3".to_string()])
                    .await
                    .unwrap();

                // Host done, target done, engine exits cleanly.
                tokio::time::sleep(Duration::from_millis(3300)).await;
                host_db
                    .set("internal/end_time", "1585279300")
                    .await
                    .unwrap();
                host_db
                    .set(&format!("internal/{esid}"), "finished")
                    .await
                    .unwrap();
                main.set(&format!("internal/{esid}"), "finished")
                    .await
                    .unwrap();
                engine.set_exit(engine.last_pid().unwrap(), 0);
            })
        };

        let status = supervisor
            .run(&request("scan-happy"), &ParamRegistry::with_defaults())
            .await;
        emulated.await.unwrap();

        assert_eq!(status, ScanStatus::Finished);

        let state = table.snapshot("scan-happy").unwrap();
        assert_eq!(state.host_progress["10.0.0.1"], 100);
        assert_eq!(state.finished_hosts, ["10.0.0.1"]);

        let stream: Vec<(&str, ResultKind)> = state
            .results
            .iter()
            .map(|e| {
                let label = if e.name == "HOST_START" || e.name == "HOST_END" {
                    e.name.as_str()
                } else {
                    e.value.as_str()
                };
                (label, e.kind)
            })
            .collect();
        assert_eq!(
            stream,
            vec![
                ("HOST_START", ResultKind::Log),
                ("ssh is up", ResultKind::Log),
                ("http is up", ResultKind::Log),
                ("weak cipher", ResultKind::Alarm),
                ("HOST_END", ResultKind::Log),
            ]
        );

        let alarm = state
            .results
            .iter()
            .find(|e| e.kind == ResultKind::Alarm)
            .unwrap();
        assert_eq!(alarm.severity, Some(7.5));
        assert_eq!(alarm.name, "Weak service");

        assert!(all_claims_released(&store).await);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ports_fail_before_any_launch() {
        let Fixture {
            store,
            engine,
            table,
            supervisor,
        } = fixture().await;

        let mut request = request("scan-noports");
        request.ports = String::new();

        let status = supervisor.run(&request, &ParamRegistry::with_defaults()).await;

        assert_eq!(status, ScanStatus::Failed);
        assert!(engine.started_scans().is_empty());
        let state = table.snapshot("scan-noports").unwrap();
        assert_eq!(state.errors(), ["No port list defined."]);
        assert!(all_claims_released(&store).await);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_vt_selection_aborts_the_launch() {
        let Fixture {
            engine,
            table,
            supervisor,
            ..
        } = fixture().await;

        let mut request = request("scan-novts");
        request.vts.clear();

        let status = supervisor.run(&request, &ParamRegistry::with_defaults()).await;

        assert_eq!(status, ScanStatus::Failed);
        assert!(engine.started_scans().is_empty());
        assert_eq!(
            table.snapshot("scan-novts").unwrap().errors(),
            ["No VTS to run."]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn negative_exit_during_handshake_fails_the_scan() {
        let Fixture {
            store,
            engine,
            table,
            supervisor,
        } = fixture().await;

        let emulated = {
            let store = store.clone();
            let engine = engine.clone();
            tokio::spawn(async move {
                // Engine dies on a signal without ever acking the scan.
                wait_for_engine_scan_id(&store).await;
                engine.set_exit(engine.last_pid().unwrap(), -9);
            })
        };

        let status = supervisor
            .run(&request("scan-crash"), &ParamRegistry::with_defaults())
            .await;
        emulated.await.unwrap();

        assert_eq!(status, ScanStatus::Failed);
        let state = table.snapshot("scan-crash").unwrap();
        assert!(!state.errors().is_empty());
        assert!(all_claims_released(&store).await);
    }

    #[tokio::test(start_paused = true)]
    async fn client_stop_is_observed_within_a_tick() {
        let Fixture {
            store,
            engine,
            table,
            supervisor,
        } = fixture().await;

        let stopper = {
            let store = store.clone();
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                let main = store.select(1).await.unwrap();
                let esid = wait_for_engine_scan_id(&store).await;
                main.set(&format!("internal/{esid}"), "ready").await.unwrap();

                tokio::time::sleep(Duration::from_millis(4500)).await;
                supervisor.stop("scan-stop").await.unwrap();
            })
        };

        let status = supervisor
            .run(&request("scan-stop"), &ParamRegistry::with_defaults())
            .await;
        stopper.await.unwrap();

        assert_eq!(status, ScanStatus::Stopped);
        let stops = engine.stopped_scans();
        assert_eq!(stops.len(), 1);
        table.set_status("scan-stop", status);
        assert_eq!(table.status("scan-stop"), Some(ScanStatus::Stopped));
        assert!(all_claims_released(&store).await);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_killed_mid_scan_fails_with_the_stop_message() {
        let Fixture {
            store,
            engine,
            table,
            supervisor,
        } = fixture().await;

        let emulated = {
            let store = store.clone();
            let engine = engine.clone();
            tokio::spawn(async move {
                let main = store.select(1).await.unwrap();
                let esid = wait_for_engine_scan_id(&store).await;
                main.set(&format!("internal/{esid}"), "ready").await.unwrap();

                // Killed from outside: the process vanishes while the
                // target is unfinished and no stop flag is set.
                tokio::time::sleep(Duration::from_millis(4000)).await;
                engine.set_exit(engine.last_pid().unwrap(), -9);
            })
        };

        let status = supervisor
            .run(&request("scan-killed"), &ParamRegistry::with_defaults())
            .await;
        emulated.await.unwrap();

        assert_eq!(status, ScanStatus::Failed);
        let state = table.snapshot("scan-killed").unwrap();
        assert_eq!(state.errors(), ["Task was unexpectedly stopped or killed."]);
        assert!(all_claims_released(&store).await);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_databases_fail_the_scan_with_an_error() {
        let store = MemoryKv::new(1);
        let engine = StubEngine::default();
        let registry = Arc::new(Registry::new(Arc::new(store.clone())));
        let catalog = Arc::new(
            KvCatalog::open(&store, Arc::new(engine.clone()))
                .await
                .unwrap(),
        );
        let table = Arc::new(ScanTable::new());
        let supervisor =
            ScanSupervisor::new(registry, catalog, Arc::new(engine), table.clone());

        let status = supervisor
            .run(&request("scan-full"), &ParamRegistry::with_defaults())
            .await;

        assert_eq!(status, ScanStatus::Failed);
        assert!(!table.snapshot("scan-full").unwrap().errors().is_empty());
    }
}
