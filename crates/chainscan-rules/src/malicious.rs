//! Known-malicious package lookup
//!
//! The database is a name set per ecosystem: a built-in seed of well-known
//! incident packages, optionally refreshed from the cache's `malicious-db`
//! namespace where an external feed can be installed. A hit is always
//! critical with confidence 0.95.

use crate::SOURCE;
use chainscan_cache::AnalysisCache;
use chainscan_core::{DetectionMethod, Ecosystem, Finding, PackageRef, Severity};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const NAMESPACE: &str = "malicious-db";
const CACHE_KEY_PARTS: &[&str] = &["malicious-package-set", "v1"];

/// Packages removed from their registries after confirmed malware reports
const SEED_NPM: &[&str] = &[
    "flatmap-stream",
    "getcookies",
    "crossenv",
    "cross-env.js",
    "mongose",
    "babelcli",
    "d3.js",
    "fabric-js",
    "ffmpeg.js",
    "gruntcli",
    "http-proxy.js",
    "jquery.js",
    "mariadb",
    "mssql.js",
    "mysqljs",
    "node-fabric",
    "node-opencv",
    "node-opensl",
    "node-openssl",
    "node-sqlite",
    "nodecaffe",
    "nodefabric",
    "nodeffmpeg",
    "nodemailer-js",
    "nodemssql",
    "noderequest",
    "nodesass",
    "nodesqlite",
    "opencv.js",
    "openssl.js",
    "proxy.js",
    "shadowsock",
    "smb",
    "sqlite.js",
    "sqliter",
    "sqlserver",
    "tkinter",
    "electorn",
    "loadyaml",
    "loadash",
];

const SEED_PYPI: &[&str] = &[
    "ctx",
    "colourama",
    "python3-dateutil",
    "jeIlyfish",
    "ssh-decorate",
    "acqusition",
    "apidev-coop",
    "bzip",
    "crypt",
    "django-server",
    "pwd",
    "setup-tools",
    "telnet",
    "urlib3",
    "urllib",
    "pytz3-dev",
    "libpeshnx",
    "libpesh",
    "libari",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaliciousDb {
    npm: HashSet<String>,
    pypi: HashSet<String>,
}

impl MaliciousDb {
    /// Seed set only
    pub fn builtin() -> Self {
        Self {
            npm: SEED_NPM.iter().map(|s| s.to_string()).collect(),
            pypi: SEED_PYPI.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Seed set merged with a cached external feed, when one is installed
    pub fn load(cache: &AnalysisCache) -> Self {
        let mut db = Self::builtin();
        let key = AnalysisCache::hash_key(CACHE_KEY_PARTS);
        if let Some((feed, _age)) = cache.get::<MaliciousDb>(NAMESPACE, &key) {
            db.npm.extend(feed.npm);
            db.pypi.extend(feed.pypi);
        }
        db
    }

    /// Install an external feed into the cache for future runs
    pub fn store(&self, cache: &AnalysisCache, ttl_secs: u64) {
        let key = AnalysisCache::hash_key(CACHE_KEY_PARTS);
        cache.put(NAMESPACE, &key, self, ttl_secs);
    }

    pub fn insert(&mut self, ecosystem: Ecosystem, name: impl Into<String>) {
        match ecosystem {
            Ecosystem::Npm => self.npm.insert(name.into()),
            Ecosystem::PyPi => self.pypi.insert(name.into()),
        };
    }

    pub fn contains(&self, package: &PackageRef) -> bool {
        let name = package.normalized().name;
        match package.ecosystem {
            Ecosystem::Npm => self.npm.contains(&name) || self.npm.contains(&package.name),
            Ecosystem::PyPi => self.pypi.contains(&name),
        }
    }

    pub fn len(&self) -> usize {
        self.npm.len() + self.pypi.len()
    }

    pub fn is_empty(&self) -> bool {
        self.npm.is_empty() && self.pypi.is_empty()
    }

    pub fn check(&self, package: &PackageRef) -> Option<Finding> {
        if !self.contains(package) {
            return None;
        }
        Some(Finding {
            package: package.clone(),
            finding_type: "malicious_package".to_string(),
            severity: Severity::Critical,
            confidence: 0.95,
            evidence: vec![
                format!("'{}' is listed in the malicious package database", package.name),
                "Confirmed malware incident for this package name".to_string(),
            ],
            source: SOURCE.to_string(),
            recommendation: Some(
                "Remove this package immediately and audit the environment for compromise"
                    .to_string(),
            ),
            references: vec![],
            detection_method: DetectionMethod::RuleBased,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainscan_cache::MemoryStore;

    #[test]
    fn test_seed_contains_flatmap_stream() {
        let db = MaliciousDb::builtin();
        let finding = db
            .check(&PackageRef::new("flatmap-stream", "0.1.1", Ecosystem::Npm))
            .unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert!(finding.confidence >= 0.95);
    }

    #[test]
    fn test_clean_package_passes() {
        let db = MaliciousDb::builtin();
        assert!(db
            .check(&PackageRef::new("lodash", "4.17.21", Ecosystem::Npm))
            .is_none());
    }

    #[test]
    fn test_ecosystems_do_not_bleed() {
        let db = MaliciousDb::builtin();
        // ctx is a PyPI incident, not an npm one
        assert!(db.contains(&PackageRef::new("ctx", "0.1.2", Ecosystem::PyPi)));
        assert!(!db.contains(&PackageRef::new("ctx", "0.1.2", Ecosystem::Npm)));
    }

    #[test]
    fn test_cached_feed_merges_with_seed() {
        let cache = AnalysisCache::new(Box::new(MemoryStore::new(1 << 20)));
        let mut feed = MaliciousDb::default();
        feed.insert(Ecosystem::Npm, "fresh-incident");
        feed.store(&cache, 3600);

        let db = MaliciousDb::load(&cache);
        assert!(db.contains(&PackageRef::new("fresh-incident", "1.0.0", Ecosystem::Npm)));
        assert!(db.contains(&PackageRef::new("flatmap-stream", "0.1.1", Ecosystem::Npm)));
    }
}
