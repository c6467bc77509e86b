//! The vulnerability-test catalogue.
//!
//! VT metadata lives in database 0 of the shared store, written by the
//! engine's feed loader and read back here. The cache contract is small:
//!
//! - `feedversion` — the feed version published with the current cache
//! - `vt:index` — JSON array of `[family, oid]` pairs in insertion order
//! - `vt:<oid>` — one JSON [`VtRecord`] per test
//!
//! [`VtCatalog`] is the seam the rest of the daemon consumes; [`KvCatalog`]
//! is the production implementation. Filtering ([`VtFilter`]) operates on
//! `(field, op, value)` triples, with modification times normalised to the
//! 14-character UTC form on both sides before comparison.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::engine::EngineControl;
use crate::error::{Error, Result};
use crate::kv::{KvHandle, KvStore};

const FEED_VERSION_KEY: &str = "feedversion";
const VT_INDEX_KEY: &str = "vt:index";

fn vt_key(oid: &str) -> String {
    format!("vt:{oid}")
}

/// Quality-of-detection value for a type keyword, from the fixed table.
pub fn qod_for_type(qod_type: &str) -> Option<&'static str> {
    Some(match qod_type {
        "exploit" => "100",
        "remote_vul" => "99",
        "remote_app" => "98",
        "package" => "97",
        "registry" => "97",
        "remote_active" => "95",
        "remote_banner" => "80",
        "executable_version" => "80",
        "remote_analysis" => "70",
        "remote_probe" => "50",
        "remote_banner_unreliable" => "30",
        "executable_version_unreliable" => "30",
        "general_note" => "1",
        "default" => "70",
        _ => return None,
    })
}

/// Severity block of a VT record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Severities {
    #[serde(default)]
    pub severity_type: Option<String>,
    #[serde(default)]
    pub severity_base_vector: Option<String>,
    #[serde(default)]
    pub severity_origin: Option<String>,
}

/// One configurable parameter of a VT.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VtParam {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub default: String,
}

/// A vulnerability-test record as cached in the store.
///
/// The core only interprets name, qod, severities and the timestamps; the
/// remaining fields pass through to the metadata formatters untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VtRecord {
    pub oid: String,
    pub name: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub qod: Option<String>,
    #[serde(default)]
    pub qod_type: Option<String>,
    #[serde(default)]
    pub severities: Severities,
    #[serde(default)]
    pub creation_time: Option<String>,
    /// Epoch seconds, as published by the feed.
    #[serde(default)]
    pub modification_time: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub impact: Option<String>,
    #[serde(default)]
    pub affected: Option<String>,
    #[serde(default)]
    pub insight: Option<String>,
    #[serde(default)]
    pub solution: Option<String>,
    #[serde(default)]
    pub solution_type: Option<String>,
    #[serde(default)]
    pub solution_method: Option<String>,
    #[serde(default)]
    pub detection: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, VtParam>,
    #[serde(default)]
    pub refs: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

impl VtRecord {
    /// QoD attached to results referencing this VT: the type keyword wins
    /// over an explicit numeric value.
    pub fn result_qod(&self) -> Option<String> {
        if let Some(qod_type) = self.qod_type.as_deref() {
            if let Some(qod) = qod_for_type(qod_type) {
                return Some(qod.to_string());
            }
        }
        self.qod.clone()
    }

    fn without_details(mut self) -> Self {
        self.params.clear();
        self.refs.clear();
        self.dependencies.clear();
        self.custom.clear();
        self.summary = None;
        self.impact = None;
        self.affected = None;
        self.insight = None;
        self.solution = None;
        self.solution_type = None;
        self.solution_method = None;
        self.detection = None;
        self
    }
}

/// The catalogue interface the daemon, supervisor and filter consume.
#[async_trait]
pub trait VtCatalog: Send + Sync {
    /// Feed version the cache was last populated with.
    async fn feed_version(&self) -> Result<Option<String>>;

    /// `(family, oid)` pairs in cache insertion order.
    async fn get_oids(&self) -> Result<Vec<(String, String)>>;

    /// A single record; `details = false` strips everything the protocol
    /// layer does not need for listings.
    async fn get_vt(&self, oid: &str, details: bool) -> Result<Option<VtRecord>>;

    /// Stable digest over the current VT set, exposed to clients as a
    /// change tag.
    async fn collection_hash(&self) -> Result<String>;

    /// Repopulates the cache from disk. Caller must hold the feed lock.
    async fn refresh(&self) -> Result<()>;

    /// Finite `(oid, record)` sequence over `selection` (or the whole
    /// cache), in insertion order. Unknown oids are skipped.
    async fn get_iter(
        &self,
        selection: Option<&[String]>,
        details: bool,
    ) -> Result<Vec<(String, VtRecord)>> {
        let oids: Vec<String> = match selection {
            Some(oids) => oids.to_vec(),
            None => self.get_oids().await?.into_iter().map(|(_, oid)| oid).collect(),
        };
        let mut out = Vec::with_capacity(oids.len());
        for oid in oids {
            if let Some(vt) = self.get_vt(&oid, details).await? {
                out.push((oid, vt));
            }
        }
        Ok(out)
    }
}

/// Catalogue over the shared store's database 0.
pub struct KvCatalog {
    cache: Box<dyn KvHandle>,
    loader: Arc<dyn EngineControl>,
}

impl KvCatalog {
    pub async fn open(store: &dyn KvStore, loader: Arc<dyn EngineControl>) -> Result<Self> {
        Ok(Self {
            cache: store.select(0).await?,
            loader,
        })
    }

    /// Writes a complete cache generation: index, records, feed version.
    /// Used by feed loaders and by tests seeding a store.
    pub async fn write_cache(
        store: &dyn KvStore,
        feed_version: &str,
        records: &[VtRecord],
    ) -> Result<()> {
        let cache = store.select(0).await?;
        let index: Vec<(String, String)> = records
            .iter()
            .map(|vt| (vt.family.clone(), vt.oid.clone()))
            .collect();
        let index_json = serde_json::to_string(&index)
            .map_err(|e| Error::Internal(format!("cannot encode vt index: {e}")))?;
        cache.set(VT_INDEX_KEY, &index_json).await?;
        for vt in records {
            let record_json = serde_json::to_string(vt)
                .map_err(|e| Error::Internal(format!("cannot encode vt {}: {e}", vt.oid)))?;
            cache.set(&vt_key(&vt.oid), &record_json).await?;
        }
        cache.set(FEED_VERSION_KEY, feed_version).await
    }
}

#[async_trait]
impl VtCatalog for KvCatalog {
    async fn feed_version(&self) -> Result<Option<String>> {
        self.cache.get(FEED_VERSION_KEY).await
    }

    async fn get_oids(&self) -> Result<Vec<(String, String)>> {
        let Some(raw) = self.cache.get(VT_INDEX_KEY).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&raw)
            .map_err(|e| Error::Internal(format!("corrupt vt index: {e}")))
    }

    async fn get_vt(&self, oid: &str, details: bool) -> Result<Option<VtRecord>> {
        let Some(raw) = self.cache.get(&vt_key(oid)).await? else {
            return Ok(None);
        };
        let vt: VtRecord = serde_json::from_str(&raw)
            .map_err(|e| Error::Internal(format!("corrupt vt record {oid}: {e}")))?;
        Ok(Some(if details { vt } else { vt.without_details() }))
    }

    async fn collection_hash(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for (_, oid) in self.get_oids().await? {
            let modification_time = self
                .get_vt(&oid, false)
                .await?
                .and_then(|vt| vt.modification_time)
                .unwrap_or_default();
            hasher.update(oid.as_bytes());
            hasher.update(modification_time.as_bytes());
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Ok(hex)
    }

    async fn refresh(&self) -> Result<()> {
        self.loader.reload_feed().await
    }
}

/// Normalises a modification time to `YYYYMMDDhhmmss` UTC. Values already
/// in that form pass through unchanged, which makes the formatting
/// idempotent; unparsable input is returned as-is.
pub fn format_modification_time(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() == 14 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return trimmed.to_string();
    }
    let Ok(epoch) = trimmed.parse::<i64>() else {
        return trimmed.to_string();
    };
    match Utc.timestamp_opt(epoch, 0).single() {
        Some(ts) => ts.format("%Y%m%d%H%M%S").to_string(),
        None => trimmed.to_string(),
    }
}

/// Comparison operator of a filter triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equal,
    NotEqual,
    Less,
    Greater,
}

/// Parsed filter expression: `field op value` terms joined with `;`.
#[derive(Debug, Clone, PartialEq)]
pub struct VtFilter {
    triples: Vec<(String, FilterOp, String)>,
}

impl VtFilter {
    /// Parses e.g. `modification_time>20210101000000;name=telnet`.
    pub fn parse(expr: &str) -> Option<Self> {
        let mut triples = Vec::new();
        for term in expr.split(';') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let at = term.find(['=', '<', '>', '!'])?;
            let op = match term.as_bytes()[at] {
                b'=' => FilterOp::Equal,
                b'!' => FilterOp::NotEqual,
                b'<' => FilterOp::Less,
                b'>' => FilterOp::Greater,
                _ => unreachable!(),
            };
            let field = term[..at].trim();
            let value = term[at + 1..].trim_start_matches('=').trim();
            if field.is_empty() || value.is_empty() {
                return None;
            }
            triples.push((field.to_string(), op, value.to_string()));
        }
        if triples.is_empty() {
            None
        } else {
            Some(Self { triples })
        }
    }

    /// Applies the triples in order to the full oid set, rebuilding the
    /// surviving set per triple. Records missing a filtered field drop out.
    pub async fn apply(&self, catalog: &dyn VtCatalog) -> Result<Vec<String>> {
        let mut oids: Vec<String> = catalog
            .get_oids()
            .await?
            .into_iter()
            .map(|(_, oid)| oid)
            .collect();

        for (field, op, filter_value) in &self.triples {
            let mut surviving = Vec::with_capacity(oids.len());
            for oid in oids {
                let Some(vt) = catalog.get_vt(&oid, false).await? else {
                    continue;
                };
                let Some(mut value) = field_value(&vt, field) else {
                    continue;
                };
                let mut wanted = filter_value.clone();
                if field == "modification_time" || field == "creation_time" {
                    value = format_modification_time(&value);
                    wanted = format_modification_time(&wanted);
                }
                let keep = match op {
                    FilterOp::Equal => value == wanted,
                    FilterOp::NotEqual => value != wanted,
                    FilterOp::Less => value < wanted,
                    FilterOp::Greater => value > wanted,
                };
                if keep {
                    surviving.push(oid);
                }
            }
            oids = surviving;
        }
        Ok(oids)
    }
}

fn field_value(vt: &VtRecord, field: &str) -> Option<String> {
    match field {
        "oid" => Some(vt.oid.clone()),
        "name" => Some(vt.name.clone()),
        "family" => Some(vt.family.clone()),
        "modification_time" => vt.modification_time.clone(),
        "creation_time" => vt.creation_time.clone(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StubEngine;
    use crate::kv::MemoryKv;

    fn vt(oid: &str, name: &str, modification_time: &str) -> VtRecord {
        VtRecord {
            oid: oid.to_string(),
            name: name.to_string(),
            family: "Service detection".to_string(),
            modification_time: Some(modification_time.to_string()),
            ..VtRecord::default()
        }
    }

    async fn catalog_with(records: &[VtRecord]) -> KvCatalog {
        let store = MemoryKv::new(4);
        KvCatalog::write_cache(&store, "1588099767", records)
            .await
            .unwrap();
        KvCatalog::open(&store, Arc::new(StubEngine::default()))
            .await
            .unwrap()
    }

    #[test]
    fn modification_time_formatting_is_idempotent() {
        let formatted = format_modification_time("1552997132");
        assert_eq!(formatted, "20190319120532");
        assert_eq!(format_modification_time(&formatted), formatted);
        assert_eq!(format_modification_time("not a time"), "not a time");
    }

    #[test]
    fn qod_table_lookup() {
        assert_eq!(qod_for_type("exploit"), Some("100"));
        assert_eq!(qod_for_type("general_note"), Some("1"));
        assert_eq!(qod_for_type("unheard_of"), None);
    }

    #[test]
    fn result_qod_prefers_the_type_keyword() {
        let mut vt = vt("1.2.3", "x", "0");
        vt.qod = Some("42".to_string());
        assert_eq!(vt.result_qod().as_deref(), Some("42"));
        vt.qod_type = Some("remote_banner".to_string());
        assert_eq!(vt.result_qod().as_deref(), Some("80"));
    }

    #[tokio::test]
    async fn oids_keep_insertion_order_and_hash_is_stable() {
        let records = [vt("1.1", "a", "100"), vt("1.2", "b", "200")];
        let catalog = catalog_with(&records).await;

        let oids: Vec<String> = catalog
            .get_oids()
            .await
            .unwrap()
            .into_iter()
            .map(|(_, oid)| oid)
            .collect();
        assert_eq!(oids, ["1.1", "1.2"]);

        let first = catalog.collection_hash().await.unwrap();
        let again = catalog.collection_hash().await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first.len(), 64);
    }

    #[tokio::test]
    async fn filter_applies_triples_in_order() {
        let records = [
            vt("1.1", "ssh detect", "1552997132"),
            vt("1.2", "telnet detect", "1600000000"),
            vt("1.3", "telnet banner", "1400000000"),
        ];
        let catalog = catalog_with(&records).await;

        let filter = VtFilter::parse("modification_time>20190101000000").unwrap();
        assert_eq!(filter.apply(&catalog).await.unwrap(), ["1.1", "1.2"]);

        let filter = VtFilter::parse("modification_time>20190101000000;name=telnet detect").unwrap();
        assert_eq!(filter.apply(&catalog).await.unwrap(), ["1.2"]);

        assert!(VtFilter::parse("").is_none());
        assert!(VtFilter::parse("no operator here").is_none());
    }

    #[tokio::test]
    async fn details_flag_strips_heavy_fields() {
        let mut record = vt("1.1", "a", "100");
        record.summary = Some("something".to_string());
        record.dependencies.push("1.0".to_string());
        let catalog = catalog_with(&[record]).await;

        let slim = catalog.get_vt("1.1", false).await.unwrap().unwrap();
        assert_eq!(slim.summary, None);
        assert!(slim.dependencies.is_empty());

        let full = catalog.get_vt("1.1", true).await.unwrap().unwrap();
        assert_eq!(full.summary.as_deref(), Some("something"));
    }
}
