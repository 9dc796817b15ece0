//! OSV wire format

use chainscan_core::PackageRef;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct OsvQueryRequest {
    pub package: OsvPackage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OsvPackage {
    pub name: String,
    pub ecosystem: String,
}

pub fn query_body(package: &PackageRef) -> OsvQueryRequest {
    let normalized = package.normalized();
    OsvQueryRequest {
        package: OsvPackage {
            // npm names keep their case; OSV matches PyPI case-insensitively
            name: match package.ecosystem {
                chainscan_core::Ecosystem::Npm => package.name.clone(),
                chainscan_core::Ecosystem::PyPi => normalized.name,
            },
            ecosystem: package.ecosystem.osv_name().to_string(),
        },
        version: if package.version.is_empty() || package.version == "unknown" {
            None
        } else {
            Some(package.version.clone())
        },
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct OsvQueryResponse {
    #[serde(default)]
    pub vulns: Vec<OsvVulnerability>,
}

#[derive(Debug, Deserialize)]
pub struct OsvVulnerability {
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub summary: Option<String>,
    pub details: Option<String>,
    #[serde(default)]
    pub severity: Vec<OsvSeverity>,
    #[serde(default)]
    pub affected: Vec<OsvAffected>,
    #[serde(default)]
    pub references: Vec<OsvReference>,
    #[serde(default)]
    pub database_specific: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct OsvSeverity {
    #[serde(rename = "type")]
    pub severity_type: String,
    pub score: String,
}

#[derive(Debug, Deserialize)]
pub struct OsvAffected {
    #[serde(default)]
    pub ranges: Vec<OsvRange>,
    #[serde(default)]
    pub versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct OsvRange {
    #[serde(rename = "type")]
    pub range_type: String,
    #[serde(default)]
    pub events: Vec<OsvEvent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OsvEvent {
    pub introduced: Option<String>,
    pub fixed: Option<String>,
    pub last_affected: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OsvReference {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    pub ref_type: Option<String>,
    pub url: String,
}
