//! Translation of raw engine records into protocol-level results.
//!
//! The engine pushes `|||`-delimited records onto the result list of a
//! database: `kind|||hostname|||port|||oid|||value`. [`drain`] pops them
//! non-blocking, resolves the referenced VT for names, QoD and severity, and
//! batches everything into a [`Harvest`] the supervisor forwards upward.
//! Malformed records are logged and dropped; they never terminate a scan.

use chrono::Local;
use serde::Serialize;

use crate::catalog::{VtCatalog, VtRecord};
use crate::cvss;
use crate::error::Result;
use crate::kv::KvHandle;
use crate::registry::RESULTS_KEY;

/// Kind of an emitted result entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Error,
    Log,
    HostDetail,
    Alarm,
}

/// One protocol-level result entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEntry {
    pub kind: ResultKind,
    pub host: String,
    pub hostname: String,
    pub name: String,
    pub value: String,
    pub port: String,
    pub test_id: String,
    pub qod: String,
    /// CVSS base score, only on alarms whose VT carries a v2 vector.
    pub severity: Option<f64>,
}

impl ResultEntry {
    pub fn error(host: &str, value: &str) -> Self {
        Self {
            kind: ResultKind::Error,
            host: host.to_string(),
            hostname: String::new(),
            name: String::new(),
            value: value.to_string(),
            port: String::new(),
            test_id: String::new(),
            qod: String::new(),
            severity: None,
        }
    }

    pub fn log(host: &str, name: &str, value: &str) -> Self {
        Self {
            kind: ResultKind::Log,
            host: host.to_string(),
            hostname: String::new(),
            name: name.to_string(),
            value: value.to_string(),
            port: String::new(),
            test_id: String::new(),
            qod: String::new(),
            severity: None,
        }
    }
}

/// Everything one drain pass extracted from a database.
#[derive(Debug, Default)]
pub struct Harvest {
    pub entries: Vec<ResultEntry>,
    pub host_progress: Vec<(String, i32)>,
    pub finished_hosts: Vec<String>,
}

impl Harvest {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.host_progress.is_empty() && self.finished_hosts.is_empty()
    }
}

/// Progress of a host from a `launched/total` status entry.
///
/// `total == 0` carries no information and yields `None`; `total == -1`
/// marks completion. The result is clamped into `0..=100`.
pub fn host_progress(msg: &str) -> Option<i32> {
    let (launched, total) = msg.split_once('/')?;
    let launched: f64 = launched.trim().parse().ok()?;
    let total: f64 = total.trim().parse().ok()?;
    if total == 0.0 {
        None
    } else if total == -1.0 {
        Some(100)
    } else {
        Some((((launched / total) * 100.0).floor() as i32).clamp(0, 100))
    }
}

struct WireResult<'a> {
    kind: &'a str,
    hostname: &'a str,
    port: &'a str,
    oid: &'a str,
    value: &'a str,
}

fn parse_wire(raw: &str) -> Option<WireResult<'_>> {
    let mut fields = raw.splitn(5, "|||");
    let record = WireResult {
        kind: fields.next()?,
        hostname: fields.next()?.trim(),
        port: fields.next()?.trim(),
        oid: fields.next()?.trim(),
        value: fields.next()?,
    };
    Some(record)
}

/// Pops every pending result record from `db` and translates it.
///
/// `current_host` is the host the database belongs to; records drained from
/// the main KB pass an empty string and carry their host in the record
/// itself (dead-host batches).
pub async fn drain(
    db: &dyn KvHandle,
    current_host: &str,
    catalog: &dyn VtCatalog,
) -> Result<Harvest> {
    let mut harvest = Harvest::default();

    while let Some(raw) = db.rpop(RESULTS_KEY).await? {
        let Some(msg) = parse_wire(&raw) else {
            tracing::warn!(record = %raw, "dropping malformed result record");
            continue;
        };

        let host_is_dead = msg.value.contains("Host dead");
        let vt = if !msg.oid.is_empty() && !host_is_dead {
            catalog.get_vt(msg.oid, false).await?
        } else {
            None
        };

        if vt.is_none() && !msg.oid.is_empty() && !host_is_dead && msg.kind != "DEADHOST" {
            tracing::warn!(oid = %msg.oid, "dropping result with unknown vt oid");
            continue;
        }

        let qod = vt.as_ref().and_then(VtRecord::result_qod).unwrap_or_default();
        let name = vt.as_ref().map(|vt| vt.name.clone()).unwrap_or_default();

        match msg.kind {
            "ERRMSG" => harvest.entries.push(ResultEntry {
                kind: ResultKind::Error,
                host: current_host.to_string(),
                hostname: msg.hostname.to_string(),
                name,
                value: msg.value.to_string(),
                port: msg.port.to_string(),
                test_id: msg.oid.to_string(),
                qod: String::new(),
                severity: None,
            }),
            "LOG" => harvest.entries.push(ResultEntry {
                kind: ResultKind::Log,
                host: current_host.to_string(),
                hostname: msg.hostname.to_string(),
                name,
                value: msg.value.to_string(),
                port: msg.port.to_string(),
                test_id: msg.oid.to_string(),
                qod,
                severity: None,
            }),
            "HOST_DETAIL" => harvest.entries.push(ResultEntry {
                kind: ResultKind::HostDetail,
                host: current_host.to_string(),
                hostname: msg.hostname.to_string(),
                name,
                value: msg.value.to_string(),
                port: String::new(),
                test_id: String::new(),
                qod: String::new(),
                severity: None,
            }),
            "ALARM" => {
                let severity = vt.as_ref().and_then(severity_score);
                harvest.entries.push(ResultEntry {
                    kind: ResultKind::Alarm,
                    host: current_host.to_string(),
                    hostname: msg.hostname.to_string(),
                    name,
                    value: msg.value.to_string(),
                    port: msg.port.to_string(),
                    test_id: msg.oid.to_string(),
                    qod,
                    severity,
                });
            }
            // Hosts the engine skipped as unreachable: close them out with
            // full progress and synthetic start/end stamps.
            "DEADHOST" => {
                let timestamp = Local::now().format("%a %b %e %H:%M:%S %Y").to_string();
                for host in msg.oid.split(',') {
                    let host = host.trim();
                    if host.is_empty() {
                        continue;
                    }
                    harvest.host_progress.push((host.to_string(), 100));
                    harvest.finished_hosts.push(host.to_string());
                    harvest.entries.push(ResultEntry {
                        kind: ResultKind::Log,
                        host: host.to_string(),
                        hostname: msg.hostname.to_string(),
                        name: name.clone(),
                        value: msg.value.to_string(),
                        port: msg.port.to_string(),
                        test_id: String::new(),
                        qod: qod.clone(),
                        severity: None,
                    });
                    harvest
                        .entries
                        .push(ResultEntry::log(host, "HOST_START", &timestamp));
                    harvest
                        .entries
                        .push(ResultEntry::log(host, "HOST_END", &timestamp));
                }
            }
            other => {
                tracing::warn!(kind = %other, "dropping result record of unknown kind");
            }
        }
    }

    Ok(harvest)
}

/// CVSS base value of a VT, only defined for v2 severity vectors.
pub fn severity_score(vt: &VtRecord) -> Option<f64> {
    if vt.severities.severity_type.as_deref() != Some("cvss_base_v2") {
        return None;
    }
    cvss::base_v2(vt.severities.severity_base_vector.as_deref()?)
}
