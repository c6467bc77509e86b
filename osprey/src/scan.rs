//! Scan requests and the daemon-side table of live scans.
//!
//! [`ScanRequest`] is the validated form of a client's start-scan command.
//! [`ScanTable`] keeps the state the protocol layer reads back: status,
//! per-host progress and the emitted result stream. The table implements
//! [`ScanSink`], the seam the supervisor reports through; a protocol
//! dispatcher can substitute its own sink without touching the supervisor.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::results::{ResultEntry, ResultKind};

/// Lifecycle states of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Queued,
    Running,
    Finished,
    Stopped,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Stopped | Self::Failed)
    }
}

/// Host-alive probes the engine may use, encoded as a bitmask preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AliveTest {
    pub icmp: bool,
    pub tcp_ack: bool,
    pub tcp_syn: bool,
    pub arp: bool,
    pub consider_alive: bool,
}

impl AliveTest {
    pub fn bitmask(&self) -> u8 {
        let mut mask = 0;
        if self.tcp_ack {
            mask |= 1;
        }
        if self.icmp {
            mask |= 2;
        }
        if self.arp {
            mask |= 4;
        }
        if self.consider_alive {
            mask |= 8;
        }
        if self.tcp_syn {
            mask |= 16;
        }
        mask
    }
}

/// One credential row of a scan request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credential {
    /// Service the credential applies to: `ssh`, `smb`, `esxi` or `snmp`.
    pub service: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub private_key: String,
    /// SNMP community string.
    pub community: String,
}

/// A parameter override for one selected VT.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VtParamOverride {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub value: String,
}

/// One selected VT with its overrides. Selection order is preserved all the
/// way into the plugin-set preference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VtSelection {
    pub oid: String,
    pub params: Vec<VtParamOverride>,
}

/// A validated scan request as handed over by the protocol layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanRequest {
    pub scan_id: String,
    /// Comma-joined host list.
    pub targets: String,
    /// Comma-joined hosts to leave out.
    pub exclude_hosts: String,
    /// Port ranges, e.g. `T:22,80,U:161`.
    pub ports: String,
    pub credentials: Vec<Credential>,
    pub vts: Vec<VtSelection>,
    /// Scanner-wide parameters; names outside the whitelist are dropped.
    pub scanner_params: BTreeMap<String, String>,
    pub reverse_lookup_only: bool,
    pub reverse_lookup_unify: bool,
    pub expand_vhosts: Option<bool>,
    pub test_empty_vhost: Option<bool>,
    pub alive_test: AliveTest,
}

impl ScanRequest {
    /// Target hosts minus the exclude list, original order kept.
    pub fn effective_targets(&self) -> Vec<String> {
        let excluded: Vec<&str> = self
            .exclude_hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .collect();
        self.targets
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty() && !excluded.contains(h))
            .map(str::to_string)
            .collect()
    }
}

/// Callbacks the supervisor reports through while a scan runs.
pub trait ScanSink: Send + Sync {
    fn push_results(&self, scan_id: &str, entries: Vec<ResultEntry>);
    fn set_host_progress(&self, scan_id: &str, host: &str, progress: i32);
    fn hosts_finished(&self, scan_id: &str, hosts: &[String]);

    /// A scan-level error message, visible to the client.
    fn scan_error(&self, scan_id: &str, message: &str) {
        self.push_results(scan_id, vec![ResultEntry::error("", message)]);
    }
}

/// State kept per live scan.
#[derive(Debug, Default, Clone)]
pub struct ScanState {
    pub status: Option<ScanStatus>,
    /// Host progress in `0..=100`, or `-1` for a host reported dead.
    pub host_progress: BTreeMap<String, i32>,
    pub finished_hosts: Vec<String>,
    pub results: Vec<ResultEntry>,
}

impl ScanState {
    /// Error messages emitted so far, for the protocol layer's status
    /// responses.
    pub fn errors(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|e| e.kind == ResultKind::Error)
            .map(|e| e.value.as_str())
            .collect()
    }
}

/// In-memory registry of all scans the daemon has seen.
#[derive(Default)]
pub struct ScanTable {
    scans: Mutex<HashMap<String, ScanState>>,
}

impl ScanTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scan_id: &str) {
        let mut scans = self.scans.lock();
        let state = scans.entry(scan_id.to_string()).or_default();
        state.status = Some(ScanStatus::Queued);
    }

    /// Moves a scan to `status`. Terminal states stick: a late transition
    /// from a racing supervisor cannot overwrite a client stop.
    pub fn set_status(&self, scan_id: &str, status: ScanStatus) {
        let mut scans = self.scans.lock();
        let state = scans.entry(scan_id.to_string()).or_default();
        if state.status.is_some_and(ScanStatus::is_terminal) {
            return;
        }
        state.status = Some(status);
    }

    pub fn status(&self, scan_id: &str) -> Option<ScanStatus> {
        self.scans.lock().get(scan_id).and_then(|s| s.status)
    }

    pub fn snapshot(&self, scan_id: &str) -> Option<ScanState> {
        self.scans.lock().get(scan_id).cloned()
    }

    pub fn remove(&self, scan_id: &str) -> Option<ScanState> {
        self.scans.lock().remove(scan_id)
    }
}

impl ScanSink for ScanTable {
    fn push_results(&self, scan_id: &str, entries: Vec<ResultEntry>) {
        let mut scans = self.scans.lock();
        let state = scans.entry(scan_id.to_string()).or_default();
        state.results.extend(entries);
    }

    fn set_host_progress(&self, scan_id: &str, host: &str, progress: i32) {
        let mut scans = self.scans.lock();
        let state = scans.entry(scan_id.to_string()).or_default();
        state
            .host_progress
            .insert(host.to_string(), progress.clamp(-1, 100));
    }

    fn hosts_finished(&self, scan_id: &str, hosts: &[String]) {
        let mut scans = self.scans.lock();
        let state = scans.entry(scan_id.to_string()).or_default();
        for host in hosts {
            if !state.finished_hosts.contains(host) {
                state.finished_hosts.push(host.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alive_test_bitmask_encoding() {
        assert_eq!(AliveTest::default().bitmask(), 0);
        let all = AliveTest {
            icmp: true,
            tcp_ack: true,
            tcp_syn: true,
            arp: true,
            consider_alive: true,
        };
        assert_eq!(all.bitmask(), 31);
        let icmp_syn = AliveTest {
            icmp: true,
            tcp_syn: true,
            ..AliveTest::default()
        };
        assert_eq!(icmp_syn.bitmask(), 18);
    }

    #[test]
    fn effective_targets_applies_the_exclude_list() {
        let request = ScanRequest {
            targets: "10.0.0.1, 10.0.0.2,10.0.0.3".to_string(),
            exclude_hosts: "10.0.0.2".to_string(),
            ..ScanRequest::default()
        };
        assert_eq!(request.effective_targets(), ["10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn terminal_status_is_not_overwritten() {
        let table = ScanTable::new();
        table.register("s1");
        table.set_status("s1", ScanStatus::Running);
        table.set_status("s1", ScanStatus::Stopped);
        table.set_status("s1", ScanStatus::Failed);
        assert_eq!(table.status("s1"), Some(ScanStatus::Stopped));
    }

    #[test]
    fn sink_collects_results_and_progress() {
        let table = ScanTable::new();
        table.register("s1");
        table.scan_error("s1", "No port list defined.");
        table.set_host_progress("s1", "10.0.0.1", 250);
        table.hosts_finished("s1", &["10.0.0.1".to_string(), "10.0.0.1".to_string()]);

        let state = table.snapshot("s1").unwrap();
        assert_eq!(state.errors(), ["No port list defined."]);
        assert_eq!(state.host_progress["10.0.0.1"], 100);
        assert_eq!(state.finished_hosts, ["10.0.0.1"]);
    }
}
