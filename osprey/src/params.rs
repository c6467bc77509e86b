//! Whitelist of scanner-wide parameters the engine accepts.
//!
//! The table is owned by the daemon and handed to the preference builder
//! explicitly; requests may only tune parameters listed here, everything
//! else is dropped without comment. Defaults are overwritten once at init
//! from the engine's own settings dump, and settings the whitelist does not
//! know (paths, feed locations) are kept aside for the feed scheduler.

use std::collections::BTreeMap;

use serde::Serialize;

/// Value type of a scanner parameter, used by the protocol layer to render
/// parameter descriptions and by the preference builder to serialise values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Boolean,
    Integer,
    String,
}

/// One whitelisted engine parameter.
#[derive(Debug, Clone, Serialize)]
pub struct ParamDef {
    pub kind: ParamKind,
    pub default: String,
    pub mandatory: bool,
    pub description: &'static str,
}

/// Daemon-scoped registry of tunable parameters plus the scan-only settings
/// the engine reports but clients may not touch.
#[derive(Debug, Default, Clone)]
pub struct ParamRegistry {
    params: BTreeMap<String, ParamDef>,
    scan_only: BTreeMap<String, String>,
}

impl ParamRegistry {
    /// The published whitelist with its compiled-in defaults.
    pub fn with_defaults() -> Self {
        let mut params = BTreeMap::new();
        let mut add = |name: &str, kind, default: &str, mandatory, description| {
            params.insert(
                name.to_string(),
                ParamDef {
                    kind,
                    default: default.to_string(),
                    mandatory,
                    description,
                },
            );
        };

        use ParamKind::*;
        add(
            "auto_enable_dependencies",
            Boolean,
            "1",
            true,
            "Automatically enable the plugins that are depended on",
        );
        add(
            "cgi_path",
            String,
            "/cgi-bin:/scripts",
            true,
            "Look for default CGIs in /cgi-bin and /scripts",
        );
        add(
            "checks_read_timeout",
            Integer,
            "5",
            true,
            "Seconds the security checks wait in a recv()",
        );
        add("drop_privileges", Boolean, "0", true, "");
        add("network_scan", Boolean, "0", true, "");
        add(
            "non_simult_ports",
            String,
            "139, 445, 3389, Services/irc",
            true,
            "Ports that never get two simultaneous connections",
        );
        add(
            "open_sock_max_attempts",
            Integer,
            "5",
            false,
            "Unsuccessful socket opens before a port counts as closed",
        );
        add(
            "timeout_retry",
            Integer,
            "5",
            false,
            "Retries when a socket connection attempt times out",
        );
        add(
            "optimize_test",
            Integer,
            "5",
            false,
            "Launch a plugin only when its prerequisites look satisfied",
        );
        add(
            "plugins_timeout",
            Integer,
            "5",
            false,
            "Maximum lifetime of a single plugin, in seconds",
        );
        add("report_host_details", Boolean, "1", true, "");
        add(
            "safe_checks",
            Boolean,
            "1",
            true,
            "Disable plugins that may crash the remote service",
        );
        add(
            "scanner_plugins_timeout",
            Integer,
            "36000",
            true,
            "Like plugins_timeout, for whole-scanner plugins",
        );
        add(
            "time_between_request",
            Integer,
            "0",
            false,
            "Wait time between two actions (open, send, close)",
        );
        add("unscanned_closed", Boolean, "1", true, "");
        add("unscanned_closed_udp", Boolean, "1", true, "");
        add(
            "expand_vhosts",
            Boolean,
            "1",
            false,
            "Expand the target list with vhosts gathered from reverse lookups and certificates",
        );
        add(
            "test_empty_vhost",
            Boolean,
            "0",
            false,
            "Additionally test the target with an empty vhost value",
        );

        Self {
            params,
            scan_only: BTreeMap::new(),
        }
    }

    /// Folds the engine's settings dump in: whitelisted names update the
    /// default, everything else becomes a scan-only setting.
    pub fn merge_engine_settings(&mut self, settings: &BTreeMap<String, String>) {
        for (name, value) in settings {
            match self.params.get_mut(name) {
                Some(def) => def.default = value.clone(),
                None => {
                    self.scan_only.insert(name.clone(), value.clone());
                }
            }
        }
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ParamDef> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamDef)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Engine setting outside the whitelist, e.g. `plugins_folder`.
    pub fn scan_only(&self, name: &str) -> Option<&str> {
        self.scan_only.get(name).map(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_updates_defaults_and_collects_scan_only() {
        let mut registry = ParamRegistry::with_defaults();
        let mut settings = BTreeMap::new();
        settings.insert("safe_checks".to_string(), "0".to_string());
        settings.insert("plugins_folder".to_string(), "/var/lib/plugins".to_string());

        registry.merge_engine_settings(&settings);

        assert_eq!(registry.get("safe_checks").unwrap().default, "0");
        assert!(!registry.is_allowed("plugins_folder"));
        assert_eq!(registry.scan_only("plugins_folder"), Some("/var/lib/plugins"));
    }

    #[test]
    fn whitelist_covers_the_published_parameters() {
        let registry = ParamRegistry::with_defaults();
        assert!(registry.is_allowed("expand_vhosts"));
        assert!(registry.is_allowed("scanner_plugins_timeout"));
        assert!(!registry.is_allowed("made_up_knob"));
        assert_eq!(registry.iter().count(), 18);
    }
}
