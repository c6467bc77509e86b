//! Control of the external scan engine executable.
//!
//! [`EngineControl`] is the seam between the daemon and the engine binary:
//! probing the executable, dumping its settings, reloading the feed,
//! launching one engine process per scan and asking a running scan to stop
//! cooperatively. [`ExternalEngine`] shells out to the real binary;
//! [`StubEngine`] is a scriptable double for the lifecycle tests.
//!
//! Stopping never signals the process directly. The engine owns its own
//! shutdown; the daemon invokes the binary's stop command and then watches
//! the PID recorded in the KB until the process disappears.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::{Pid, PidExt, ProcessExt, ProcessStatus, System, SystemExt};
use tokio::process::{Child, Command};

use crate::catalog::{KvCatalog, VtRecord};
use crate::error::{Error, Result};
use crate::kv::MemoryKv;

/// Observable state of an engine process, by PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Zombie,
    Missing,
}

/// A spawned engine process.
pub trait EngineChild: Send {
    fn pid(&self) -> Option<u32>;

    /// Exit status when the process has terminated: the exit code, or the
    /// negated signal number on an abnormal death. `None` while running.
    fn poll(&mut self) -> Option<i32>;
}

/// Operations the daemon needs from the engine executable.
#[async_trait]
pub trait EngineControl: Send + Sync {
    /// Whether the executable is discoverable and runnable.
    async fn check(&self) -> bool;

    async fn version(&self) -> Result<String>;

    /// The engine's `key = value` settings dump.
    async fn settings(&self) -> Result<BTreeMap<String, String>>;

    /// Loads the on-disk feed into the shared store. Caller holds the feed
    /// lock.
    async fn reload_feed(&self) -> Result<()>;

    /// Whether passwordless sudo can run the engine.
    async fn check_sudo(&self) -> bool;

    async fn start_scan(
        &self,
        engine_scan_id: &str,
        sudo: bool,
        niceness: Option<i32>,
    ) -> Result<Box<dyn EngineChild>>;

    /// Asks the engine to stop the scan. Returns whether the stop command
    /// could be issued.
    async fn stop_scan(&self, engine_scan_id: &str, sudo: bool) -> Result<bool>;

    fn process_state(&self, pid: u32) -> ProcessState;
}

/// The real engine binary.
pub struct ExternalEngine {
    binary: PathBuf,
}

impl ExternalEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, sudo: bool, niceness: Option<i32>, args: &[&str]) -> Command {
        let mut argv: Vec<String> = Vec::new();
        if sudo {
            argv.push("sudo".to_string());
            argv.push("-n".to_string());
        }
        if let Some(n) = niceness {
            argv.push("nice".to_string());
            argv.push("-n".to_string());
            argv.push(n.to_string());
        }
        argv.push(self.binary.display().to_string());
        argv.extend(args.iter().map(|a| a.to_string()));

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    }
}

#[async_trait]
impl EngineControl for ExternalEngine {
    async fn check(&self) -> bool {
        self.version().await.is_ok()
    }

    async fn version(&self) -> Result<String> {
        let output = self
            .command(false, None, &["--version"])
            .output()
            .await
            .map_err(|e| Error::EngineLaunch(format!("{}: {e}", self.binary.display())))?;
        if !output.status.success() {
            return Err(Error::EngineLaunch(format!(
                "{} --version exited with {}",
                self.binary.display(),
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    async fn settings(&self) -> Result<BTreeMap<String, String>> {
        let output = self
            .command(false, None, &["-s"])
            .output()
            .await
            .map_err(|e| Error::EngineLaunch(format!("{}: {e}", self.binary.display())))?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let mut settings = BTreeMap::new();
        for line in stdout.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = match value.trim() {
                "yes" => "1",
                "no" => "0",
                other => other,
            };
            settings.insert(key.trim().to_string(), value.to_string());
        }
        Ok(settings)
    }

    async fn reload_feed(&self) -> Result<()> {
        let status = self
            .command(false, None, &["--update-vt-info"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::FeedUnavailable(format!("feed loader failed to start: {e}")))?;
        if !status.success() {
            return Err(Error::FeedUnavailable(format!(
                "feed loader exited with {status}"
            )));
        }
        Ok(())
    }

    async fn check_sudo(&self) -> bool {
        let binary = self.binary.display().to_string();
        Command::new("sudo")
            .args(["-n", &binary, "-s"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn start_scan(
        &self,
        engine_scan_id: &str,
        sudo: bool,
        niceness: Option<i32>,
    ) -> Result<Box<dyn EngineChild>> {
        let child = self
            .command(sudo, niceness, &["--scan-start", engine_scan_id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::EngineLaunch(e.to_string()))?;
        Ok(Box::new(ExternalChild { child }))
    }

    async fn stop_scan(&self, engine_scan_id: &str, sudo: bool) -> Result<bool> {
        let status = self
            .command(sudo, None, &["--scan-stop", engine_scan_id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::EngineLaunch(e.to_string()))?;
        Ok(status.success())
    }

    fn process_state(&self, pid: u32) -> ProcessState {
        let mut system = System::new();
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return ProcessState::Missing;
        }
        match system.process(pid) {
            None => ProcessState::Missing,
            Some(process) if process.status() == ProcessStatus::Zombie => ProcessState::Zombie,
            Some(_) => ProcessState::Running,
        }
    }
}

struct ExternalChild {
    child: Child,
}

impl EngineChild for ExternalChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn poll(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(exit_code(status)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "cannot poll engine child");
                None
            }
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        -status.signal().unwrap_or(0)
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Scriptable engine double used by the lifecycle tests.
///
/// Launches allocate fake PIDs, `stop_scan` marks the matching process gone,
/// and `reload_feed` can be armed with a feed payload it publishes into a
/// [`MemoryKv`] store exactly like the real loader would.
#[derive(Clone)]
pub struct StubEngine {
    inner: Arc<Mutex<StubInner>>,
}

struct StubInner {
    available: bool,
    settings: BTreeMap<String, String>,
    sudo: bool,
    feed: Option<(MemoryKv, String, Vec<VtRecord>)>,
    reloads: usize,
    next_pid: u32,
    states: HashMap<u32, ProcessState>,
    exits: HashMap<u32, i32>,
    started: Vec<(String, u32)>,
    stopped: Vec<(String, bool)>,
}

impl Default for StubEngine {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StubInner {
                available: true,
                settings: BTreeMap::new(),
                sudo: false,
                feed: None,
                reloads: 0,
                next_pid: 1000,
                states: HashMap::new(),
                exits: HashMap::new(),
                started: Vec::new(),
                stopped: Vec::new(),
            })),
        }
    }
}

impl StubEngine {
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    pub fn set_setting(&self, name: &str, value: &str) {
        self.inner
            .lock()
            .settings
            .insert(name.to_string(), value.to_string());
    }

    pub fn set_sudo(&self, sudo: bool) {
        self.inner.lock().sudo = sudo;
    }

    /// Arms `reload_feed` with the cache generation it should publish.
    pub fn set_feed(&self, store: MemoryKv, feed_version: &str, records: Vec<VtRecord>) {
        self.inner.lock().feed = Some((store, feed_version.to_string(), records));
    }

    pub fn reload_count(&self) -> usize {
        self.inner.lock().reloads
    }

    pub fn started_scans(&self) -> Vec<String> {
        self.inner.lock().started.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn stopped_scans(&self) -> Vec<(String, bool)> {
        self.inner.lock().stopped.clone()
    }

    pub fn last_pid(&self) -> Option<u32> {
        self.inner.lock().started.last().map(|(_, pid)| *pid)
    }

    /// Overrides what `process_state` reports for `pid`.
    pub fn set_process_state(&self, pid: u32, state: ProcessState) {
        self.inner.lock().states.insert(pid, state);
    }

    /// Makes the child handle report an exit with `code`.
    pub fn set_exit(&self, pid: u32, code: i32) {
        let mut inner = self.inner.lock();
        inner.exits.insert(pid, code);
        inner.states.insert(pid, ProcessState::Missing);
    }
}

#[async_trait]
impl EngineControl for StubEngine {
    async fn check(&self) -> bool {
        self.inner.lock().available
    }

    async fn version(&self) -> Result<String> {
        Ok("stub-engine 1.0".to_string())
    }

    async fn settings(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.inner.lock().settings.clone())
    }

    async fn reload_feed(&self) -> Result<()> {
        let payload = {
            let mut inner = self.inner.lock();
            inner.reloads += 1;
            inner.feed.clone()
        };
        if let Some((store, feed_version, records)) = payload {
            KvCatalog::write_cache(&store, &feed_version, &records).await?;
        }
        Ok(())
    }

    async fn check_sudo(&self) -> bool {
        self.inner.lock().sudo
    }

    async fn start_scan(
        &self,
        engine_scan_id: &str,
        _sudo: bool,
        _niceness: Option<i32>,
    ) -> Result<Box<dyn EngineChild>> {
        let mut inner = self.inner.lock();
        if !inner.available {
            return Err(Error::EngineLaunch("engine not available".to_string()));
        }
        inner.next_pid += 1;
        let pid = inner.next_pid;
        inner.states.insert(pid, ProcessState::Running);
        inner.started.push((engine_scan_id.to_string(), pid));
        Ok(Box::new(StubChild {
            pid,
            inner: self.inner.clone(),
        }))
    }

    async fn stop_scan(&self, engine_scan_id: &str, sudo: bool) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.stopped.push((engine_scan_id.to_string(), sudo));
        if let Some(&(_, pid)) = inner
            .started
            .iter()
            .find(|(id, _)| id.as_str() == engine_scan_id)
        {
            inner.states.insert(pid, ProcessState::Missing);
            inner.exits.insert(pid, 0);
        }
        Ok(true)
    }

    fn process_state(&self, pid: u32) -> ProcessState {
        self.inner
            .lock()
            .states
            .get(&pid)
            .copied()
            .unwrap_or(ProcessState::Missing)
    }
}

struct StubChild {
    pid: u32,
    inner: Arc<Mutex<StubInner>>,
}

impl EngineChild for StubChild {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn poll(&mut self) -> Option<i32> {
        self.inner.lock().exits.get(&self.pid).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_tracks_launch_and_stop() {
        let engine = StubEngine::default();
        let mut child = engine.start_scan("esid-1", false, None).await.unwrap();
        let pid = child.pid().unwrap();

        assert_eq!(engine.process_state(pid), ProcessState::Running);
        assert_eq!(child.poll(), None);

        engine.stop_scan("esid-1", true).await.unwrap();
        assert_eq!(engine.process_state(pid), ProcessState::Missing);
        assert_eq!(child.poll(), Some(0));
        assert_eq!(engine.stopped_scans(), [("esid-1".to_string(), true)]);
    }

    #[tokio::test]
    async fn external_engine_reports_missing_binary() {
        let engine = ExternalEngine::new("/nonexistent/engine-binary");
        assert!(!engine.check().await);
        assert!(engine.version().await.is_err());
    }
}
