//! Parallel OSV client
//!
//! Queries the OSV database one package per request, with every request in
//! flight up to the concurrency bound. Before the first query the API host
//! is resolved once with a sub-second budget; if resolution fails the whole
//! batch degrades to `Offline` and analysis continues with empty results.
//! A failed request never fails the batch; it is recorded against its ref.

pub mod convert;
pub mod wire;

pub use convert::{PackageVulns, ScoreQuality};

use chainscan_cache::AnalysisCache;
use chainscan_core::config::OsvConfig;
use chainscan_core::{CancellationToken, PackageRef, ScanError, StageError, WorkerPool};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const NAMESPACE: &str = "osv";
const DNS_PROBE_BUDGET: Duration = Duration::from_millis(900);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Online,
    Offline,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub status: BatchStatus,
    /// Per-ref result; a failed query carries its structured error
    pub results: HashMap<PackageRef, Result<PackageVulns, StageError>>,
}

impl BatchOutcome {
    fn offline() -> Self {
        Self {
            status: BatchStatus::Offline,
            results: HashMap::new(),
        }
    }
}

pub struct OsvClient {
    http: reqwest::Client,
    config: OsvConfig,
    cache: Arc<AnalysisCache>,
    pool: WorkerPool,
    cache_ttl: u64,
}

impl OsvClient {
    pub fn new(
        config: OsvConfig,
        cache: Arc<AnalysisCache>,
        pool: WorkerPool,
        cache_ttl: u64,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http,
            config,
            cache,
            pool,
            cache_ttl,
        }
    }

    /// Query every ref, bounded by `max_concurrent`. Result ordering is
    /// unspecified; consume the map.
    pub async fn query_batch(
        &self,
        refs: &[PackageRef],
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, ScanError> {
        if refs.is_empty() {
            return Ok(BatchOutcome {
                status: BatchStatus::Online,
                results: HashMap::new(),
            });
        }
        cancel.check()?;

        if !self.probe_dns().await {
            info!("OSV host did not resolve; continuing offline");
            return Ok(BatchOutcome::offline());
        }

        let results: HashMap<PackageRef, Result<PackageVulns, StageError>> =
            stream::iter(refs.iter().cloned())
                .map(|package| {
                    let cancel = cancel.clone();
                    async move {
                        let outcome = if cancel.is_cancelled() {
                            Err(StageError {
                                kind: chainscan_core::ErrorKind::Cancelled,
                                message: "run cancelled".to_string(),
                            })
                        } else {
                            self.query_one(&package).await.map_err(|e| StageError {
                                kind: e.kind(),
                                message: e.to_string(),
                            })
                        };
                        (package, outcome)
                    }
                })
                .buffer_unordered(self.config.max_concurrent.max(1))
                .collect()
                .await;

        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        let failures = results.values().filter(|r| r.is_err()).count();
        debug!(
            queried = results.len(),
            failures, "OSV batch complete"
        );
        Ok(BatchOutcome {
            status: BatchStatus::Online,
            results,
        })
    }

    /// Must answer in well under a second; a slow resolver counts as offline
    async fn probe_dns(&self) -> bool {
        let Some(host) = host_of(&self.config.url) else {
            return false;
        };
        match tokio::time::timeout(
            DNS_PROBE_BUDGET,
            tokio::net::lookup_host((host.clone(), 443u16)),
        )
        .await
        {
            Ok(Ok(mut addrs)) => addrs.next().is_some(),
            Ok(Err(e)) => {
                warn!(host, "DNS resolution failed: {e}");
                false
            }
            Err(_) => {
                warn!(host, "DNS resolution timed out");
                false
            }
        }
    }

    async fn query_one(&self, package: &PackageRef) -> Result<PackageVulns, ScanError> {
        let key = AnalysisCache::hash_key(&[
            package.ecosystem.as_str(),
            &package.normalized().name,
            &package.version,
        ]);
        if let Some((cached, _age)) = self.cache.get::<PackageVulns>(NAMESPACE, &key) {
            return Ok(cached);
        }

        let url = format!("{}/v1/query", self.config.url.trim_end_matches('/'));
        let request = wire::query_body(package);
        // registry and OSV traffic share one pool; the batch bound above
        // only caps how much is queued against it
        let response = self
            .pool
            .throttle(self.http.post(&url).json(&request).send())
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ScanError::NetworkTransient(e.to_string())
                } else {
                    ScanError::NetworkPermanent(e.to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScanError::from_status(status.as_u16(), &url));
        }
        let body: wire::OsvQueryResponse = response
            .json()
            .await
            .map_err(|e| ScanError::UpstreamSchema(format!("OSV response: {e}")))?;

        let vulns = convert::to_package_vulns(body.vulns, &package.version);
        self.cache.put(NAMESPACE, &key, &vulns, self.cache_ttl);
        Ok(vulns)
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let host = rest.split(['/', ':']).next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainscan_cache::MemoryStore;
    use chainscan_core::Ecosystem;

    fn client_with(url: &str) -> OsvClient {
        OsvClient::new(
            OsvConfig {
                url: url.to_string(),
                max_concurrent: 4,
                timeout_secs: 2,
            },
            Arc::new(AnalysisCache::new(Box::new(MemoryStore::new(1 << 20)))),
            WorkerPool::new(4),
            3600,
        )
    }

    #[test]
    fn test_host_extraction() {
        assert_eq!(host_of("https://api.osv.dev"), Some("api.osv.dev".to_string()));
        assert_eq!(
            host_of("https://api.osv.dev/v1/query"),
            Some("api.osv.dev".to_string())
        );
        assert_eq!(host_of("http://localhost:8080"), Some("localhost".to_string()));
    }

    #[tokio::test]
    async fn test_offline_batch_returns_empty_results() {
        // reserved TLD: resolution is guaranteed to fail
        let client = client_with("https://osv.host.invalid");
        let refs = vec![PackageRef::new("lodash", "4.17.21", Ecosystem::Npm)];
        let outcome = client
            .query_batch(&refs, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, BatchStatus::Offline);
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn test_offline_probe_is_fast() {
        let client = client_with("https://osv.host.invalid");
        let refs = vec![PackageRef::new("lodash", "4.17.21", Ecosystem::Npm)];
        let start = std::time::Instant::now();
        let _ = client.query_batch(&refs, &CancellationToken::new()).await;
        assert!(start.elapsed() < Duration::from_secs(1), "probe must fast-fail");
    }

    #[tokio::test]
    async fn test_empty_batch_short_circuits() {
        let client = client_with("https://osv.host.invalid");
        let outcome = client
            .query_batch(&[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, BatchStatus::Online);
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_batch_errors() {
        let client = client_with("https://osv.host.invalid");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let refs = vec![PackageRef::new("lodash", "4.17.21", Ecosystem::Npm)];
        let err = client.query_batch(&refs, &cancel).await.unwrap_err();
        assert!(matches!(err, ScanError::Cancelled));
    }
}
