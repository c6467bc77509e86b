//! Metadata formatters for VT records.
//!
//! Pure functions producing the preformatted XML fragments the protocol
//! layer embeds into its VT listings. Each function is total: bad input is
//! logged with the owning VT's oid and degrades to a minimally well-formed
//! element instead of failing the listing.

use std::collections::BTreeMap;

use crate::catalog::{Severities, VtParam};

/// Drops characters XML cannot carry and escapes the rest as text content.
fn text(vt_id: &str, tag: &str, value: &str) -> String {
    let mut clean = String::with_capacity(value.len());
    let mut dropped = false;
    for c in value.chars() {
        if c.is_control() && !matches!(c, '\t' | '\n' | '\r') {
            dropped = true;
            continue;
        }
        match c {
            '&' => clean.push_str("&amp;"),
            '<' => clean.push_str("&lt;"),
            '>' => clean.push_str("&gt;"),
            other => clean.push(other),
        }
    }
    if dropped {
        tracing::warn!(vt_id, tag, "dropped unrepresentable characters");
    }
    clean
}

fn attr(vt_id: &str, tag: &str, value: &str) -> String {
    text(vt_id, tag, value).replace('"', "&quot;")
}

/// Whether `name` can be used as an XML element name.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn simple_element(vt_id: &str, tag: &str, value: &str) -> String {
    format!("<{tag}>{}</{tag}>", text(vt_id, tag, value))
}

/// `<custom>` fragment from the free-form metadata map.
pub fn custom(vt_id: &str, custom: &BTreeMap<String, String>) -> String {
    let mut out = String::from("<custom>");
    for (key, value) in custom {
        if !is_valid_name(key) {
            tracing::warn!(vt_id, key, "cannot format custom tag");
            continue;
        }
        out.push_str(&simple_element(vt_id, key, value));
    }
    out.push_str("</custom>");
    out
}

/// `<severities>` fragment.
pub fn severities(vt_id: &str, severities: &Severities) -> String {
    let mut out = String::from("<severities><severity");
    if let Some(origin) = severities.severity_origin.as_deref() {
        out.push_str(&format!(" origin=\"{}\"", attr(vt_id, "severity", origin)));
    }
    if let Some(kind) = severities.severity_type.as_deref() {
        out.push_str(&format!(" type=\"{}\"", attr(vt_id, "severity", kind)));
    }
    out.push('>');
    if let Some(vector) = severities.severity_base_vector.as_deref() {
        out.push_str(&text(vt_id, "severity", vector));
    }
    out.push_str("</severity></severities>");
    out
}

/// `<params>` fragment listing the VT's configurable parameters.
pub fn params(vt_id: &str, params: &BTreeMap<String, VtParam>) -> String {
    let mut out = String::from("<params>");
    for (id, param) in params {
        out.push_str(&format!(
            "<param type=\"{}\" id=\"{}\">",
            attr(vt_id, "param", &param.kind),
            attr(vt_id, "param", id)
        ));
        out.push_str(&simple_element(vt_id, "name", &param.name));
        if !param.default.is_empty() {
            out.push_str(&simple_element(vt_id, "default", &param.default));
        }
        out.push_str("</param>");
    }
    out.push_str("</params>");
    out
}

/// `<refs>` fragment. `xref` values are comma-separated `type:id` tokens;
/// a malformed token is logged and skipped without failing the fragment.
pub fn refs(vt_id: &str, refs: &BTreeMap<String, Vec<String>>) -> String {
    let mut out = String::from("<refs>");
    for (ref_type, values) in refs {
        for value in values {
            if value.is_empty() {
                continue;
            }
            if ref_type == "xref" {
                for token in value.split(',') {
                    let token = token.trim();
                    let Some((kind, id)) = token.split_once(':') else {
                        tracing::error!(vt_id, token, "cannot parse xref");
                        continue;
                    };
                    out.push_str(&format!(
                        "<ref type=\"{}\" id=\"{}\"/>",
                        attr(vt_id, "ref", &kind.to_lowercase()),
                        attr(vt_id, "ref", id)
                    ));
                }
            } else {
                out.push_str(&format!(
                    "<ref type=\"{}\" id=\"{}\"/>",
                    attr(vt_id, "ref", &ref_type.to_lowercase()),
                    attr(vt_id, "ref", value)
                ));
            }
        }
    }
    out.push_str("</refs>");
    out
}

/// `<dependencies>` fragment.
pub fn dependencies(vt_id: &str, dependencies: &[String]) -> String {
    let mut out = String::from("<dependencies>");
    for dep in dependencies {
        if dep.is_empty() {
            tracing::error!(vt_id, "cannot add empty dependency");
            continue;
        }
        out.push_str(&format!("<dependency vt_id=\"{}\"/>", attr(vt_id, "dependency", dep)));
    }
    out.push_str("</dependencies>");
    out
}

pub fn creation_time(vt_id: &str, value: &str) -> String {
    simple_element(vt_id, "creation_time", value)
}

pub fn modification_time(vt_id: &str, value: &str) -> String {
    simple_element(vt_id, "modification_time", value)
}

pub fn summary(vt_id: &str, value: &str) -> String {
    simple_element(vt_id, "summary", value)
}

pub fn impact(vt_id: &str, value: &str) -> String {
    simple_element(vt_id, "impact", value)
}

pub fn affected(vt_id: &str, value: &str) -> String {
    simple_element(vt_id, "affected", value)
}

pub fn insight(vt_id: &str, value: &str) -> String {
    simple_element(vt_id, "insight", value)
}

/// `<solution>` fragment with optional type and method attributes.
pub fn solution(
    vt_id: &str,
    solution: &str,
    solution_type: Option<&str>,
    solution_method: Option<&str>,
) -> String {
    let mut out = String::from("<solution");
    if let Some(kind) = solution_type {
        out.push_str(&format!(" type=\"{}\"", attr(vt_id, "solution", kind)));
    }
    if let Some(method) = solution_method {
        out.push_str(&format!(" method=\"{}\"", attr(vt_id, "solution", method)));
    }
    out.push('>');
    out.push_str(&text(vt_id, "solution", solution));
    out.push_str("</solution>");
    out
}

/// `<detection>` fragment; the qod type keyword wins over a bare value.
pub fn detection(
    vt_id: &str,
    detection: Option<&str>,
    qod_type: Option<&str>,
    qod: Option<&str>,
) -> String {
    let mut out = String::from("<detection");
    if let Some(kind) = qod_type {
        out.push_str(&format!(" qod_type=\"{}\"", attr(vt_id, "detection", kind)));
    } else if let Some(qod) = qod {
        out.push_str(&format!(" qod=\"{}\"", attr(vt_id, "detection", qod)));
    }
    out.push('>');
    if let Some(detection) = detection {
        out.push_str(&text(vt_id, "detection", detection));
    }
    out.push_str("</detection>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const VT: &str = "1.3.6.1.4.1.25623.1.0.100001";

    #[test]
    fn custom_skips_unusable_keys_and_escapes_values() {
        let mut map = BTreeMap::new();
        map.insert("family".to_string(), "Web <&> apps".to_string());
        map.insert("bad key!".to_string(), "x".to_string());

        assert_eq!(
            custom(VT, &map),
            "<custom><family>Web &lt;&amp;&gt; apps</family></custom>"
        );
    }

    #[test]
    fn severities_carries_vector_and_attributes() {
        let severities_block = Severities {
            severity_type: Some("cvss_base_v2".to_string()),
            severity_base_vector: Some("AV:N/AC:L/Au:N/C:P/I:P/A:P".to_string()),
            severity_origin: None,
        };
        assert_eq!(
            severities(VT, &severities_block),
            "<severities><severity type=\"cvss_base_v2\">AV:N/AC:L/Au:N/C:P/I:P/A:P\
             </severity></severities>"
        );
    }

    #[test]
    fn params_renders_name_and_optional_default() {
        let mut map = BTreeMap::new();
        map.insert(
            "1".to_string(),
            VtParam {
                kind: "checkbox".to_string(),
                name: "Report timeout".to_string(),
                default: "no".to_string(),
            },
        );
        assert_eq!(
            params(VT, &map),
            "<params><param type=\"checkbox\" id=\"1\"><name>Report timeout</name>\
             <default>no</default></param></params>"
        );
    }

    #[test]
    fn refs_expands_xref_tokens_and_skips_malformed_ones() {
        let mut map = BTreeMap::new();
        map.insert("cve".to_string(), vec!["CVE-2020-0001".to_string()]);
        map.insert(
            "xref".to_string(),
            vec!["URL:https://example.org/advice, broken-token".to_string()],
        );

        assert_eq!(
            refs(VT, &map),
            "<refs><ref type=\"cve\" id=\"CVE-2020-0001\"/>\
             <ref type=\"url\" id=\"https://example.org/advice\"/></refs>"
        );
    }

    #[test]
    fn solution_and_detection_attributes() {
        assert_eq!(
            solution(VT, "Update the package.", Some("VendorFix"), None),
            "<solution type=\"VendorFix\">Update the package.</solution>"
        );
        assert_eq!(
            detection(VT, Some("remote probe"), Some("remote_banner"), Some("80")),
            "<detection qod_type=\"remote_banner\">remote probe</detection>"
        );
        assert_eq!(
            detection(VT, None, None, Some("80")),
            "<detection qod=\"80\"></detection>"
        );
    }

    #[test]
    fn control_characters_are_dropped() {
        assert_eq!(summary(VT, "line\u{0}one"), "<summary>lineone</summary>");
        assert_eq!(
            modification_time(VT, "20190319122532"),
            "<modification_time>20190319122532</modification_time>"
        );
    }

    #[test]
    fn dependencies_fragment() {
        let deps = vec!["1.3.6.1.4.1.25623.1.0.100002".to_string(), String::new()];
        assert_eq!(
            dependencies(VT, &deps),
            "<dependencies><dependency vt_id=\"1.3.6.1.4.1.25623.1.0.100002\"/></dependencies>"
        );
    }
}
