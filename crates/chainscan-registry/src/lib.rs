//! Registry metadata client
//!
//! One logical operation: fetch normalised metadata for a `(name, version,
//! ecosystem)` triple. The cache (`registry-metadata` namespace) is
//! consulted before the network; a miss issues a single GET with a hard
//! per-request timeout and one bounded retry on transient failure. A 404 is
//! a legitimate `NotFound` outcome and is cached briefly so repeated
//! resolution of a ghost package does not hammer the registry.

pub mod timeline;
mod wire;

use chainscan_cache::AnalysisCache;
use chainscan_core::config::RegistryConfig;
use chainscan_core::{Ecosystem, PackageRef, ScanError, WorkerPool};
use chainscan_ecosystems::HandlerRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use timeline::{PackageTimeline, VersionRelease};

const NAMESPACE: &str = "registry-metadata";

/// Normalised registry record for one package version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMetadata {
    /// Resolved identity; `version` is always concrete here
    pub package: PackageRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub maintainers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekly_downloads: Option<u64>,
    /// Declared runtime dependencies: (name, raw specifier)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub dependencies: Vec<(String, String)>,
    pub deprecated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FetchOutcome {
    Found(PackageMetadata),
    NotFound,
}

pub struct RegistryClient {
    http: reqwest::Client,
    handlers: HandlerRegistry,
    cache: Arc<AnalysisCache>,
    config: RegistryConfig,
    pool: WorkerPool,
    metadata_ttl: u64,
    not_found_ttl: u64,
}

impl RegistryClient {
    pub fn new(
        config: RegistryConfig,
        cache: Arc<AnalysisCache>,
        pool: WorkerPool,
        metadata_ttl: u64,
        not_found_ttl: u64,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http,
            handlers: HandlerRegistry::new(),
            cache,
            config,
            pool,
            metadata_ttl,
            not_found_ttl,
        }
    }

    fn base_url(&self, ecosystem: Ecosystem) -> &str {
        match ecosystem {
            Ecosystem::Npm => &self.config.npm_url,
            Ecosystem::PyPi => &self.config.pypi_url,
        }
    }

    /// Fetch metadata for `name` at `spec`. A concrete pin is honoured;
    /// anything else (range, empty) resolves to the registry's latest.
    pub async fn fetch_metadata(
        &self,
        name: &str,
        spec: &str,
        ecosystem: Ecosystem,
    ) -> Result<FetchOutcome, ScanError> {
        let handler = self.handlers.get(ecosystem);
        let pin = handler.exact_pin(spec);
        let cache_key = AnalysisCache::hash_key(&[
            ecosystem.as_str(),
            name,
            pin.as_deref().unwrap_or("latest"),
        ]);
        if let Some((cached, _age)) = self.cache.get::<FetchOutcome>(NAMESPACE, &cache_key) {
            return Ok(cached);
        }

        let endpoints =
            handler.registry_endpoints(name, pin.as_deref(), self.base_url(ecosystem));
        let outcome = match self.get_with_retry(&endpoints.metadata_url).await? {
            Some(body) => {
                let metadata = wire::normalize(ecosystem, name, &body)?;
                FetchOutcome::Found(metadata)
            }
            None => FetchOutcome::NotFound,
        };

        let ttl = match &outcome {
            FetchOutcome::Found(_) => self.metadata_ttl,
            FetchOutcome::NotFound => self.not_found_ttl,
        };
        self.cache.put(NAMESPACE, &cache_key, &outcome, ttl);
        Ok(outcome)
    }

    /// Publication history and maintainer timeline for a package, used by
    /// the reputation and supply-chain stages.
    pub async fn fetch_timeline(
        &self,
        name: &str,
        ecosystem: Ecosystem,
    ) -> Result<Option<PackageTimeline>, ScanError> {
        let cache_key = AnalysisCache::hash_key(&[ecosystem.as_str(), name, "timeline"]);
        if let Some((cached, _age)) =
            self.cache.get::<Option<PackageTimeline>>(NAMESPACE, &cache_key)
        {
            return Ok(cached);
        }

        let url = timeline::timeline_url(ecosystem, name, self.base_url(ecosystem));
        let timeline = match self.get_with_retry(&url).await? {
            Some(body) => Some(timeline::normalize(ecosystem, &body)?),
            None => None,
        };

        let ttl = if timeline.is_some() {
            self.metadata_ttl
        } else {
            self.not_found_ttl
        };
        self.cache.put(NAMESPACE, &cache_key, &timeline, ttl);
        Ok(timeline)
    }

    /// GET with one retry on transient failure. `Ok(None)` is a 404.
    async fn get_with_retry(&self, url: &str) -> Result<Option<serde_json::Value>, ScanError> {
        let mut last_transient = None;
        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            match self.get_once(url).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_transient() => {
                    tracing::debug!(url, attempt, "transient registry failure: {e}");
                    last_transient = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_transient
            .unwrap_or_else(|| ScanError::Internal("retry loop exhausted without error".into())))
    }

    async fn get_once(&self, url: &str) -> Result<Option<serde_json::Value>, ScanError> {
        // one pool permit per request; registry and OSV traffic share the bound
        let response = self
            .pool
            .throttle(self.http.get(url).send())
            .await
            .map_err(classify_reqwest)?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ScanError::from_status(status.as_u16(), url));
        }
        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ScanError::UpstreamSchema(format!("{url}: {e}")))?;
        Ok(Some(body))
    }
}

fn classify_reqwest(e: reqwest::Error) -> ScanError {
    if e.is_timeout() || e.is_connect() {
        ScanError::NetworkTransient(e.to_string())
    } else {
        ScanError::NetworkPermanent(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainscan_cache::MemoryStore;

    fn client() -> RegistryClient {
        let cache = Arc::new(AnalysisCache::new(Box::new(MemoryStore::new(1 << 20))));
        RegistryClient::new(RegistryConfig::default(), cache, WorkerPool::new(4), 3600, 600)
    }

    #[tokio::test]
    async fn test_cached_not_found_skips_network() {
        let cache = Arc::new(AnalysisCache::new(Box::new(MemoryStore::new(1 << 20))));
        let client = RegistryClient::new(
            RegistryConfig {
                // unroutable host: any network attempt would error
                npm_url: "http://registry.invalid".to_string(),
                ..RegistryConfig::default()
            },
            cache.clone(),
            WorkerPool::new(4),
            3600,
            600,
        );
        let key = AnalysisCache::hash_key(&["npm", "ghost-package", "1.0.0"]);
        cache.put(super::NAMESPACE, &key, &FetchOutcome::NotFound, 600);

        let outcome = client
            .fetch_metadata("ghost-package", "1.0.0", Ecosystem::Npm)
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_transient() {
        let client = RegistryClient::new(
            RegistryConfig {
                npm_url: "http://registry.invalid".to_string(),
                ..RegistryConfig::default()
            },
            Arc::new(AnalysisCache::new(Box::new(MemoryStore::new(1 << 20)))),
            WorkerPool::new(4),
            3600,
            600,
        );
        let err = client
            .fetch_metadata("lodash", "4.17.21", Ecosystem::Npm)
            .await
            .unwrap_err();
        assert!(err.is_transient(), "expected transient, got {err}");
    }

    #[test]
    fn test_base_url_per_ecosystem() {
        let client = client();
        assert!(client.base_url(Ecosystem::Npm).contains("npmjs"));
        assert!(client.base_url(Ecosystem::PyPi).contains("pypi"));
    }
}
