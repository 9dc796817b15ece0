//! Publication timelines
//!
//! The reputation stage needs package age; the supply-chain stage needs the
//! release cadence, the maintainer set over time, and the dependency diff
//! between the two most recent versions. Both ecosystems expose all of that
//! from a single document: the npm packument, or the PyPI project JSON.

use chainscan_core::{Ecosystem, ScanError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRelease {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageTimeline {
    pub name: String,
    /// Releases ordered oldest first
    pub releases: Vec<VersionRelease>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    /// Maintainers of the latest release
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub current_maintainers: Vec<String>,
    /// Maintainers of the release before it, when the registry exposes them
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub previous_maintainers: Vec<String>,
    /// Runtime dependencies of the latest release
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub latest_dependencies: Vec<String>,
    /// Runtime dependencies of the release before it
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub previous_dependencies: Vec<String>,
}

pub fn timeline_url(ecosystem: Ecosystem, name: &str, base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match ecosystem {
        Ecosystem::Npm => format!("{base}/{}", urlencoding::encode(name)),
        Ecosystem::PyPi => format!("{base}/pypi/{name}/json"),
    }
}

pub fn normalize(
    ecosystem: Ecosystem,
    body: &serde_json::Value,
) -> Result<PackageTimeline, ScanError> {
    match ecosystem {
        Ecosystem::Npm => normalize_npm(body),
        Ecosystem::PyPi => normalize_pypi(body),
    }
}

// -- npm packument ------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NpmPackument {
    name: String,
    #[serde(default, rename = "dist-tags")]
    dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    versions: BTreeMap<String, NpmPackumentVersion>,
    #[serde(default)]
    time: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct NpmPackumentVersion {
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    maintainers: Vec<NpmMaintainer>,
}

#[derive(Debug, Deserialize)]
struct NpmMaintainer {
    name: Option<String>,
}

fn normalize_npm(body: &serde_json::Value) -> Result<PackageTimeline, ScanError> {
    let doc: NpmPackument = serde_json::from_value(body.clone())
        .map_err(|e| ScanError::UpstreamSchema(format!("npm packument: {e}")))?;

    let parse_time = |s: &str| DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc));
    let created_at = doc.time.get("created").and_then(|s| parse_time(s));

    let mut releases: Vec<VersionRelease> = doc
        .versions
        .keys()
        .map(|v| VersionRelease {
            version: v.clone(),
            released_at: doc.time.get(v).and_then(|s| parse_time(s)),
        })
        .collect();
    releases.sort_by_key(|r| r.released_at);

    let latest_version = doc.dist_tags.get("latest").cloned();
    let maintainer_names = |v: Option<&String>| -> Vec<String> {
        v.and_then(|v| doc.versions.get(v))
            .map(|ver| ver.maintainers.iter().filter_map(|m| m.name.clone()).collect())
            .unwrap_or_default()
    };
    let previous_version = releases
        .iter()
        .rev()
        .map(|r| &r.version)
        .find(|v| Some(*v) != latest_version.as_ref())
        .cloned();

    let deps_of = |v: Option<&String>| -> Vec<String> {
        v.and_then(|v| doc.versions.get(v))
            .map(|ver| ver.dependencies.keys().cloned().collect())
            .unwrap_or_default()
    };

    Ok(PackageTimeline {
        name: doc.name,
        created_at,
        current_maintainers: maintainer_names(latest_version.as_ref()),
        previous_maintainers: maintainer_names(previous_version.as_ref()),
        latest_dependencies: deps_of(latest_version.as_ref()),
        previous_dependencies: deps_of(previous_version.as_ref()),
        latest_version,
        releases,
    })
}

// -- PyPI project JSON ---------------------------------------------------

#[derive(Debug, Deserialize)]
struct PyPiProject {
    info: PyPiProjectInfo,
    #[serde(default)]
    releases: BTreeMap<String, Vec<PyPiReleaseFile>>,
}

#[derive(Debug, Deserialize)]
struct PyPiProjectInfo {
    name: String,
    version: Option<String>,
    author: Option<String>,
    maintainer: Option<String>,
    #[serde(default)]
    requires_dist: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct PyPiReleaseFile {
    upload_time_iso_8601: Option<DateTime<Utc>>,
}

fn normalize_pypi(body: &serde_json::Value) -> Result<PackageTimeline, ScanError> {
    let doc: PyPiProject = serde_json::from_value(body.clone())
        .map_err(|e| ScanError::UpstreamSchema(format!("pypi project json: {e}")))?;

    let mut releases: Vec<VersionRelease> = doc
        .releases
        .iter()
        .map(|(version, files)| VersionRelease {
            version: version.clone(),
            released_at: files.iter().filter_map(|f| f.upload_time_iso_8601).min(),
        })
        .collect();
    releases.sort_by_key(|r| r.released_at);
    let created_at = releases.iter().filter_map(|r| r.released_at).min();

    let current_maintainers: Vec<String> = [&doc.info.maintainer, &doc.info.author]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .cloned()
        .collect();

    // The project JSON only carries requires_dist for the latest release;
    // the dependency diff degrades to "unknown previous" for PyPI.
    let latest_dependencies = doc
        .info
        .requires_dist
        .unwrap_or_default()
        .iter()
        .filter(|r| !r.contains("extra =="))
        .filter_map(|r| {
            r.split(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
                .next()
                .filter(|s| !s.is_empty())
                .map(String::from)
        })
        .collect();

    Ok(PackageTimeline {
        name: doc.info.name,
        created_at,
        latest_version: doc.info.version,
        current_maintainers: current_maintainers.clone(),
        previous_maintainers: current_maintainers,
        latest_dependencies,
        previous_dependencies: Vec::new(),
        releases,
    })
}
