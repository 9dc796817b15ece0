//! Metadata heuristics
//!
//! Cheap checks on the declared name and version string: malformed or
//! oversized versions suggest a compromised release pipeline, and a few
//! name shapes are recurring bait in registry attacks.

use crate::SOURCE;
use chainscan_core::{DetectionMethod, Finding, PackageRef, Severity};

const SUSPICIOUS_NAME_PARTS: &[&str] = &[
    "-backdoor",
    "-exploit",
    "-hack",
    "-pwn",
    "free-money",
    "discord-nitro",
];

pub fn check(package: &PackageRef) -> Vec<Finding> {
    let mut findings = Vec::new();

    if is_suspicious_version(&package.version) {
        findings.push(Finding {
            package: package.clone(),
            finding_type: "suspicious_version".to_string(),
            severity: Severity::Low,
            confidence: 0.5,
            evidence: vec![format!(
                "version specifier '{}' has an unusual shape",
                package.version
            )],
            source: SOURCE.to_string(),
            recommendation: Some("Verify the release on the registry".to_string()),
            references: vec![],
            detection_method: DetectionMethod::RuleBased,
        });
    }

    let lowered = package.name.to_ascii_lowercase();
    if SUSPICIOUS_NAME_PARTS.iter().any(|p| lowered.contains(p)) {
        findings.push(Finding {
            package: package.clone(),
            finding_type: "suspicious_name".to_string(),
            severity: Severity::Low,
            confidence: 0.4,
            evidence: vec![format!("name '{}' matches known bait patterns", package.name)],
            source: SOURCE.to_string(),
            recommendation: Some("Review the package source and maintainer history".to_string()),
            references: vec![],
            detection_method: DetectionMethod::RuleBased,
        });
    }

    findings
}

fn is_suspicious_version(version: &str) -> bool {
    if version.is_empty() {
        return false;
    }
    if version.len() > 40 {
        return true;
    }
    // specifier syntax is expected here; anything outside it is not
    !version.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || matches!(c, '.' | '-' | '+' | '^' | '~' | '=' | '>' | '<' | '*' | ',' | '!' | ' ')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainscan_core::Ecosystem;

    fn npm(name: &str, version: &str) -> PackageRef {
        PackageRef::new(name, version, Ecosystem::Npm)
    }

    #[test]
    fn test_normal_specifiers_clean() {
        assert!(check(&npm("left-pad", "^1.3.0")).is_empty());
        assert!(check(&npm("lodash", ">=4.0.0,<5.0.0")).is_empty());
        assert!(check(&npm("express", "")).is_empty());
    }

    #[test]
    fn test_weird_version_flagged() {
        let findings = check(&npm("x", "1.0.0@evil"));
        assert!(findings.iter().any(|f| f.finding_type == "suspicious_version"));
    }

    #[test]
    fn test_bait_name_flagged() {
        let findings = check(&npm("discord-nitro-gen", "1.0.0"));
        assert!(findings.iter().any(|f| f.finding_type == "suspicious_name"));
    }
}
