//! Translation of a validated scan request into engine preferences.
//!
//! Every step appends `name|||value` rows to the scan's preference list in
//! the main KB. The step order is fixed: later steps rely on keys written by
//! earlier ones (the engine reads the scan id binding before anything else,
//! and resolves sub-database placement through the main-KB index).
//!
//! Failable steps return `Ok(false)` instead of an error; the caller turns
//! each failure into the matching user-visible scan error and aborts the
//! launch after all steps ran.

use uuid::Uuid;

use crate::error::Result;
use crate::params::{ParamKind, ParamRegistry};
use crate::registry::MainKb;
use crate::scan::{Credential, ScanRequest};

const SSH_AUTH_OID: &str = "1.3.6.1.4.1.25623.1.0.103591";
const SMB_AUTH_OID: &str = "1.3.6.1.4.1.25623.1.0.90023";
const ESXI_AUTH_OID: &str = "1.3.6.1.4.1.25623.1.0.105058";
const SNMP_AUTH_OID: &str = "1.3.6.1.4.1.25623.1.0.105076";

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// Writes the preferences one scan's engine process consumes.
pub struct PreferenceBuilder<'a> {
    request: &'a ScanRequest,
    kb: &'a MainKb,
    engine_scan_id: String,
}

impl<'a> PreferenceBuilder<'a> {
    /// Binds the builder to a freshly generated engine scan id.
    pub fn new(request: &'a ScanRequest, kb: &'a MainKb) -> Self {
        Self {
            request,
            kb,
            engine_scan_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn engine_scan_id(&self) -> &str {
        &self.engine_scan_id
    }

    async fn push(&self, rows: Vec<String>) -> Result<()> {
        self.kb.push_prefs(&self.engine_scan_id, &rows).await
    }

    /// Step 1: record the `scan_id ↔ engine_scan_id` bijection and the
    /// initial `new` status the launch handshake polls.
    pub async fn prepare_scan_id(&self) -> Result<()> {
        self.kb
            .bind_scan(&self.request.scan_id, &self.engine_scan_id)
            .await
    }

    /// Step 2: the target host list, exclude list already applied.
    pub async fn prepare_target(&self) -> Result<()> {
        let hosts = self.request.effective_targets().join(",");
        self.push(vec![format!("TARGET|||{hosts}")]).await
    }

    /// Step 3: port ranges. An empty port list fails the step.
    pub async fn prepare_ports(&self) -> Result<bool> {
        let ports = self.request.ports.trim();
        if ports.is_empty() {
            return Ok(false);
        }
        self.push(vec![format!("port_range|||{ports}")]).await?;
        Ok(true)
    }

    /// Step 4: per-service credential rows. A credential for an unknown
    /// service or without the fields that service requires fails the step.
    pub async fn prepare_credentials(&self) -> Result<bool> {
        let mut rows = Vec::new();
        for credential in &self.request.credentials {
            if !credential_rows(credential, &mut rows) {
                return Ok(false);
            }
        }
        self.push(rows).await?;
        Ok(true)
    }

    /// Step 5: the plugin set plus per-VT parameter overrides. An empty
    /// selection fails the step.
    pub async fn prepare_plugins(&self) -> Result<bool> {
        if self.request.vts.is_empty() {
            return Ok(false);
        }
        let oids: Vec<&str> = self.request.vts.iter().map(|vt| vt.oid.as_str()).collect();
        let mut rows = vec![format!("plugin_set|||{}", oids.join(";"))];
        for vt in &self.request.vts {
            for param in &vt.params {
                rows.push(format!(
                    "{}:{}:{}:{}|||{}",
                    vt.oid, param.id, param.kind, param.name, param.value
                ));
            }
        }
        self.push(rows).await?;
        Ok(true)
    }

    /// Step 6: where the engine should advertise its per-host databases.
    pub async fn prepare_main_kb_index(&self) -> Result<()> {
        self.push(vec![format!("kb_location|||{}", self.kb.index())])
            .await
    }

    /// Step 7: vhost handling options, only when the request sets them.
    pub async fn prepare_host_options(&self) -> Result<()> {
        let mut rows = Vec::new();
        if let Some(expand) = self.request.expand_vhosts {
            rows.push(format!("expand_vhosts|||{}", yes_no(expand)));
        }
        if let Some(empty) = self.request.test_empty_vhost {
            rows.push(format!("test_empty_vhost|||{}", yes_no(empty)));
        }
        self.push(rows).await
    }

    /// Step 8: whitelisted scanner-wide parameters. Unknown names are
    /// dropped silently.
    pub async fn prepare_scan_params(&self, registry: &ParamRegistry) -> Result<()> {
        let mut rows = Vec::new();
        for (name, value) in &self.request.scanner_params {
            let Some(def) = registry.get(name) else {
                continue;
            };
            let value = match def.kind {
                ParamKind::Boolean => {
                    yes_no(matches!(value.trim(), "1" | "yes" | "true")).to_string()
                }
                _ => value.clone(),
            };
            rows.push(format!("{name}|||{value}"));
        }
        self.push(rows).await
    }

    /// Step 9: reverse-lookup policy.
    pub async fn prepare_reverse_lookup(&self) -> Result<()> {
        self.push(vec![
            format!(
                "reverse_lookup_only|||{}",
                yes_no(self.request.reverse_lookup_only)
            ),
            format!(
                "reverse_lookup_unify|||{}",
                yes_no(self.request.reverse_lookup_unify)
            ),
        ])
        .await
    }

    /// Step 10: alive-test bitmask, omitted when the request leaves the
    /// policy to the engine default.
    pub async fn prepare_alive_test(&self) -> Result<()> {
        let mask = self.request.alive_test.bitmask();
        if mask == 0 {
            return Ok(());
        }
        self.push(vec![format!("ALIVE_TEST|||{mask}")]).await
    }
}

fn credential_rows(credential: &Credential, rows: &mut Vec<String>) -> bool {
    match credential.service.as_str() {
        "ssh" => {
            if credential.username.is_empty() {
                return false;
            }
            let port = credential.port.unwrap_or(22);
            rows.push(format!("auth_port_ssh|||{port}"));
            rows.push(format!(
                "{SSH_AUTH_OID}:1:entry:SSH login name:|||{}",
                credential.username
            ));
            if credential.private_key.is_empty() {
                rows.push(format!(
                    "{SSH_AUTH_OID}:3:password:SSH password:|||{}",
                    credential.password
                ));
            } else {
                rows.push(format!(
                    "{SSH_AUTH_OID}:2:password:SSH key passphrase:|||{}",
                    credential.password
                ));
                rows.push(format!(
                    "{SSH_AUTH_OID}:4:file:SSH private key:|||{}",
                    credential.private_key
                ));
            }
            true
        }
        "smb" => {
            if credential.username.is_empty() {
                return false;
            }
            rows.push(format!(
                "{SMB_AUTH_OID}:1:entry:SMB login:|||{}",
                credential.username
            ));
            rows.push(format!(
                "{SMB_AUTH_OID}:2:password:SMB password:|||{}",
                credential.password
            ));
            true
        }
        "esxi" => {
            if credential.username.is_empty() {
                return false;
            }
            rows.push(format!(
                "{ESXI_AUTH_OID}:1:entry:ESXi login name:|||{}",
                credential.username
            ));
            rows.push(format!(
                "{ESXI_AUTH_OID}:2:password:ESXi login password:|||{}",
                credential.password
            ));
            true
        }
        "snmp" => {
            if credential.community.is_empty() && credential.username.is_empty() {
                return false;
            }
            if !credential.community.is_empty() {
                rows.push(format!(
                    "{SNMP_AUTH_OID}:1:password:SNMP Community:|||{}",
                    credential.community
                ));
            }
            if !credential.username.is_empty() {
                rows.push(format!(
                    "{SNMP_AUTH_OID}:2:entry:SNMPv3 Username:|||{}",
                    credential.username
                ));
                rows.push(format!(
                    "{SNMP_AUTH_OID}:3:password:SNMPv3 Password:|||{}",
                    credential.password
                ));
            }
            true
        }
        _ => false,
    }
}
