//! Upstream JSON schemas and their normalisation
//!
//! npm and PyPI version documents differ substantially; this module maps
//! both onto `PackageMetadata`. Missing fields are missing, not guessed.

use crate::PackageMetadata;
use chainscan_core::{Ecosystem, PackageRef, ScanError};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

pub fn normalize(
    ecosystem: Ecosystem,
    requested_name: &str,
    body: &serde_json::Value,
) -> Result<PackageMetadata, ScanError> {
    match ecosystem {
        Ecosystem::Npm => normalize_npm(requested_name, body),
        Ecosystem::PyPi => normalize_pypi(body),
    }
}

// -- npm ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NpmVersionDoc {
    name: Option<String>,
    version: String,
    description: Option<String>,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    /// npm serialises deprecation as a message string, or occasionally a bool
    deprecated: Option<serde_json::Value>,
    #[serde(default)]
    maintainers: Vec<NpmMaintainer>,
    repository: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct NpmMaintainer {
    name: Option<String>,
}

fn normalize_npm(
    requested_name: &str,
    body: &serde_json::Value,
) -> Result<PackageMetadata, ScanError> {
    let doc: NpmVersionDoc = serde_json::from_value(body.clone())
        .map_err(|e| ScanError::UpstreamSchema(format!("npm version document: {e}")))?;

    let deprecated = match &doc.deprecated {
        Some(serde_json::Value::String(s)) => !s.is_empty(),
        Some(serde_json::Value::Bool(b)) => *b,
        _ => false,
    };
    let repository = doc.repository.as_ref().and_then(|r| match r {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(o) => o.get("url").and_then(|u| u.as_str()).map(String::from),
        _ => None,
    });

    Ok(PackageMetadata {
        package: PackageRef::new(
            doc.name.unwrap_or_else(|| requested_name.to_string()),
            doc.version,
            Ecosystem::Npm,
        ),
        description: doc.description,
        published_at: None,
        maintainers: doc.maintainers.into_iter().filter_map(|m| m.name).collect(),
        weekly_downloads: None,
        dependencies: doc.dependencies.into_iter().collect(),
        deprecated,
        repository,
        latest_version: None,
    })
}

// -- PyPI --------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PyPiDoc {
    info: PyPiInfo,
    #[serde(default)]
    urls: Vec<PyPiFile>,
}

#[derive(Debug, Deserialize)]
struct PyPiInfo {
    name: String,
    version: String,
    summary: Option<String>,
    author: Option<String>,
    maintainer: Option<String>,
    #[serde(default)]
    requires_dist: Option<Vec<String>>,
    home_page: Option<String>,
    project_urls: Option<BTreeMap<String, Option<String>>>,
    #[serde(default)]
    yanked: bool,
}

#[derive(Debug, Deserialize)]
struct PyPiFile {
    upload_time_iso_8601: Option<DateTime<Utc>>,
}

fn normalize_pypi(body: &serde_json::Value) -> Result<PackageMetadata, ScanError> {
    let doc: PyPiDoc = serde_json::from_value(body.clone())
        .map_err(|e| ScanError::UpstreamSchema(format!("pypi json document: {e}")))?;

    let published_at = doc.urls.iter().filter_map(|f| f.upload_time_iso_8601).min();
    let maintainers: Vec<String> = [&doc.info.maintainer, &doc.info.author]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .cloned()
        .collect();
    let repository = doc
        .info
        .project_urls
        .as_ref()
        .and_then(|urls| {
            ["Repository", "Source", "Source Code", "Homepage"]
                .iter()
                .find_map(|k| urls.get(*k).cloned().flatten())
        })
        .or(doc.info.home_page.clone())
        .filter(|s| !s.is_empty());

    let dependencies = doc
        .info
        .requires_dist
        .unwrap_or_default()
        .iter()
        .filter_map(|req| parse_requires_dist(req))
        .collect();

    Ok(PackageMetadata {
        package: PackageRef::new(doc.info.name, doc.info.version, Ecosystem::PyPi),
        description: doc.info.summary,
        published_at,
        maintainers,
        weekly_downloads: None,
        dependencies,
        deprecated: doc.info.yanked,
        repository,
        latest_version: None,
    })
}

/// Parse a PEP 508 `requires_dist` entry to `(name, specifier)`.
/// Extra-gated requirements are optional installs, not part of the
/// resolvable tree.
fn parse_requires_dist(req: &str) -> Option<(String, String)> {
    if req.contains("extra ==") {
        return None;
    }
    let req = req.split(';').next()?.trim();
    let name_end = req
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .unwrap_or(req.len());
    let name = &req[..name_end];
    if name.is_empty() {
        return None;
    }
    // strip an extras bracket like "[socks]" and the optional parentheses
    // PEP 508 allows around the specifier
    let mut spec = req[name_end..].trim();
    if spec.starts_with('[') {
        spec = spec.split(']').nth(1).unwrap_or("").trim();
    }
    let spec = spec
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim()
        .to_string();
    Some((name.to_string(), spec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_npm_version_doc() {
        let body = serde_json::json!({
            "name": "left-pad",
            "version": "1.3.0",
            "description": "String left pad",
            "dependencies": {"wide-align": "^1.1.0"},
            "deprecated": "use String.prototype.padStart()",
            "maintainers": [{"name": "stevemao", "email": "x@example.com"}],
            "repository": {"type": "git", "url": "git://github.com/stevemao/left-pad.git"}
        });
        let meta = normalize(Ecosystem::Npm, "left-pad", &body).unwrap();
        assert_eq!(meta.package.name, "left-pad");
        assert_eq!(meta.package.version, "1.3.0");
        assert!(meta.deprecated);
        assert_eq!(meta.maintainers, vec!["stevemao".to_string()]);
        assert_eq!(meta.dependencies.len(), 1);
        assert!(meta.repository.unwrap().contains("left-pad"));
    }

    #[test]
    fn test_normalize_pypi_doc() {
        let body = serde_json::json!({
            "info": {
                "name": "requests",
                "version": "2.31.0",
                "summary": "Python HTTP for Humans.",
                "author": "Kenneth Reitz",
                "maintainer": null,
                "requires_dist": [
                    "charset-normalizer (<4,>=2)",
                    "idna (<4,>=2.5)",
                    "PySocks (!=1.5.7,>=1.5.6) ; extra == 'socks'"
                ],
                "home_page": "https://requests.readthedocs.io",
                "project_urls": {"Source": "https://github.com/psf/requests"},
                "yanked": false
            },
            "urls": [{"upload_time_iso_8601": "2023-05-22T15:12:44.175626Z"}]
        });
        let meta = normalize(Ecosystem::PyPi, "requests", &body).unwrap();
        assert_eq!(meta.package.version, "2.31.0");
        assert_eq!(meta.dependencies.len(), 2, "extra-gated dep excluded");
        assert_eq!(meta.dependencies[0].0, "charset-normalizer");
        assert!(meta.published_at.is_some());
        assert_eq!(meta.repository.as_deref(), Some("https://github.com/psf/requests"));
    }

    #[test]
    fn test_parse_requires_dist_forms() {
        assert_eq!(
            parse_requires_dist("idna (<4,>=2.5)"),
            Some(("idna".to_string(), "<4,>=2.5".to_string()))
        );
        assert_eq!(
            parse_requires_dist("click>=8.0"),
            Some(("click".to_string(), ">=8.0".to_string()))
        );
        assert_eq!(parse_requires_dist("PySocks ; extra == 'socks'"), None);
        assert_eq!(
            parse_requires_dist("urllib3"),
            Some(("urllib3".to_string(), "".to_string()))
        );
    }

    #[test]
    fn test_schema_mismatch_is_upstream_schema_error() {
        let body = serde_json::json!({"totally": "unrelated"});
        let err = normalize(Ecosystem::PyPi, "x", &body).unwrap_err();
        assert!(matches!(err, ScanError::UpstreamSchema(_)));
    }
}
