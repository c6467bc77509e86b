//! CVSS base score computation from vector strings.
//!
//! Implements the published base-score equations for CVSS v2 and v3. Only v2
//! feeds alarm severities; v3 is kept for metadata completeness.

/// Computes the CVSS v2 base score from a vector such as
/// `AV:N/AC:L/Au:N/C:P/I:P/A:P`. Returns `None` when the vector is
/// malformed or a required metric is missing.
pub fn base_v2(vector: &str) -> Option<f64> {
    let metrics = parse(vector)?;

    let av = match *metrics.get("AV")? {
        "L" => 0.395,
        "A" => 0.646,
        "N" => 1.0,
        _ => return None,
    };
    let ac = match *metrics.get("AC")? {
        "H" => 0.35,
        "M" => 0.61,
        "L" => 0.71,
        _ => return None,
    };
    let au = match *metrics.get("Au")? {
        "M" => 0.45,
        "S" => 0.56,
        "N" => 0.704,
        _ => return None,
    };
    let c = cia_v2(metrics.get("C")?)?;
    let i = cia_v2(metrics.get("I")?)?;
    let a = cia_v2(metrics.get("A")?)?;

    let impact = 10.41 * (1.0 - (1.0 - c) * (1.0 - i) * (1.0 - a));
    let exploitability = 20.0 * av * ac * au;
    let f_impact = if impact == 0.0 { 0.0 } else { 1.176 };
    let base = (0.6 * impact + 0.4 * exploitability - 1.5) * f_impact;

    Some((base * 10.0).round() / 10.0)
}

/// Computes the CVSS v3 base score from a vector such as
/// `CVSS:3.0/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H` (the version prefix is
/// optional).
pub fn base_v3(vector: &str) -> Option<f64> {
    let vector = vector
        .strip_prefix("CVSS:3.1/")
        .or_else(|| vector.strip_prefix("CVSS:3.0/"))
        .unwrap_or(vector);
    let metrics = parse(vector)?;

    let scope_changed = match *metrics.get("S")? {
        "U" => false,
        "C" => true,
        _ => return None,
    };
    let av = match *metrics.get("AV")? {
        "N" => 0.85,
        "A" => 0.62,
        "L" => 0.55,
        "P" => 0.2,
        _ => return None,
    };
    let ac = match *metrics.get("AC")? {
        "L" => 0.77,
        "H" => 0.44,
        _ => return None,
    };
    let pr = match (*metrics.get("PR")?, scope_changed) {
        ("N", _) => 0.85,
        ("L", false) => 0.62,
        ("L", true) => 0.68,
        ("H", false) => 0.27,
        ("H", true) => 0.5,
        _ => return None,
    };
    let ui = match *metrics.get("UI")? {
        "N" => 0.85,
        "R" => 0.62,
        _ => return None,
    };
    let c = cia_v3(metrics.get("C")?)?;
    let i = cia_v3(metrics.get("I")?)?;
    let a = cia_v3(metrics.get("A")?)?;

    let iss = 1.0 - (1.0 - c) * (1.0 - i) * (1.0 - a);
    let impact = if scope_changed {
        7.52 * (iss - 0.029) - 3.25 * (iss - 0.02).powi(15)
    } else {
        6.42 * iss
    };
    let exploitability = 8.22 * av * ac * pr * ui;

    if impact <= 0.0 {
        return Some(0.0);
    }
    let raw = if scope_changed {
        (1.08 * (impact + exploitability)).min(10.0)
    } else {
        (impact + exploitability).min(10.0)
    };
    Some(round_up(raw))
}

fn cia_v2(value: &str) -> Option<f64> {
    match value {
        "N" => Some(0.0),
        "P" => Some(0.275),
        "C" => Some(0.660),
        _ => None,
    }
}

fn cia_v3(value: &str) -> Option<f64> {
    match value {
        "N" => Some(0.0),
        "L" => Some(0.22),
        "H" => Some(0.56),
        _ => None,
    }
}

/// Ceiling to one decimal place, as required by the v3 specification.
fn round_up(value: f64) -> f64 {
    (value * 10.0).ceil() / 10.0
}

fn parse(vector: &str) -> Option<std::collections::HashMap<&str, &str>> {
    let mut metrics = std::collections::HashMap::new();
    for token in vector.split('/') {
        let (name, value) = token.split_once(':')?;
        if name.is_empty() || value.is_empty() {
            return None;
        }
        metrics.insert(name, value);
    }
    Some(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_reference_vectors() {
        assert_eq!(base_v2("AV:N/AC:L/Au:N/C:P/I:P/A:P"), Some(7.5));
        assert_eq!(base_v2("AV:N/AC:L/Au:N/C:C/I:C/A:C"), Some(10.0));
        assert_eq!(base_v2("AV:N/AC:L/Au:N/C:N/I:N/A:N"), Some(0.0));
        assert_eq!(base_v2("AV:L/AC:H/Au:S/C:N/I:N/A:P"), Some(1.0));
    }

    #[test]
    fn v2_rejects_malformed_vectors() {
        assert_eq!(base_v2(""), None);
        assert_eq!(base_v2("AV:N/AC:L"), None);
        assert_eq!(base_v2("AV:X/AC:L/Au:N/C:P/I:P/A:P"), None);
        assert_eq!(base_v2("AV=N"), None);
    }

    #[test]
    fn v3_reference_vectors() {
        assert_eq!(base_v3("CVSS:3.0/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H"), Some(9.8));
        assert_eq!(base_v3("CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:C/C:H/I:H/A:H"), Some(10.0));
        assert_eq!(base_v3("AV:L/AC:H/PR:H/UI:R/S:U/C:N/I:N/A:N"), Some(0.0));
    }
}
