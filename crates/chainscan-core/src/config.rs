//! Runtime configuration
//!
//! Loaded from `chainscan.toml` when present, then overlaid with
//! environment variables for credentials and host overrides. Every field
//! has a default so an empty file (or none at all) yields a working setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainscanConfig {
    pub registry: RegistryConfig,
    pub osv: OsvConfig,
    pub llm: LlmConfig,
    pub cache: CacheConfig,
    pub resolver: ResolverConfig,
    pub stages: StageDeadlines,
    /// Shared I/O worker-pool bound for registry and OSV calls combined
    pub worker_pool_size: usize,
    pub output_dir: PathBuf,
}

impl Default for ChainscanConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            osv: OsvConfig::default(),
            llm: LlmConfig::default(),
            cache: CacheConfig::default(),
            resolver: ResolverConfig::default(),
            stages: StageDeadlines::default(),
            worker_pool_size: 10,
            output_dir: PathBuf::from("chainscan-out"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub npm_url: String,
    pub pypi_url: String,
    pub timeout_secs: u64,
    /// Bounded retry on transient error inside a single fetch
    pub retries: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            npm_url: "https://registry.npmjs.org".to_string(),
            pypi_url: "https://pypi.org".to_string(),
            timeout_secs: 3,
            retries: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OsvConfig {
    pub url: String,
    pub max_concurrent: usize,
    pub timeout_secs: u64,
}

impl Default for OsvConfig {
    fn default() -> Self {
        Self {
            url: "https://api.osv.dev".to_string(),
            max_concurrent: 10,
            timeout_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Chat-completion endpoint; unset disables the LLM paths entirely
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "default".to_string(),
            timeout_secs: 30,
        }
    }
}

impl LlmConfig {
    pub fn enabled(&self) -> bool {
        self.endpoint.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub dir: PathBuf,
    pub max_size_bytes: u64,
    pub ttl: NamespaceTtls,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::File,
            dir: PathBuf::from(".chainscan-cache"),
            max_size_bytes: 256 * 1024 * 1024,
            ttl: NamespaceTtls::default(),
        }
    }
}

/// Per-namespace TTLs, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceTtls {
    pub llm: u64,
    pub reputation: u64,
    pub registry_metadata: u64,
    pub osv: u64,
    pub malicious_db: u64,
    /// Short TTL applied to cached 404 results
    pub not_found: u64,
}

impl Default for NamespaceTtls {
    fn default() -> Self {
        Self {
            llm: 7 * 24 * 3600,
            reputation: 12 * 3600,
            registry_metadata: 6 * 3600,
            osv: 6 * 3600,
            malicious_db: 14 * 24 * 3600,
            not_found: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub max_depth: usize,
    /// Total node cap per run
    pub max_nodes: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_depth: 6,
            max_nodes: 800,
        }
    }
}

/// Per-stage deadlines, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageDeadlines {
    pub vulnerability: u64,
    pub reputation: u64,
    pub code: u64,
    pub supply_chain: u64,
    pub synthesis: u64,
}

impl Default for StageDeadlines {
    fn default() -> Self {
        Self {
            vulnerability: 30,
            reputation: 20,
            code: 40,
            supply_chain: 30,
            synthesis: 20,
        }
    }
}

impl ChainscanConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let mut config: ChainscanConfig =
            toml::from_str(&content).context("failed to parse chainscan.toml")?;
        config.apply_env();
        Ok(config)
    }

    /// Load `chainscan.toml` from the given directory if present, else defaults
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join("chainscan.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            let mut config = Self::default();
            config.apply_env();
            Ok(config)
        }
    }

    /// Credentials and host overrides come from the environment so they
    /// never have to live in a checked-in file.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CHAINSCAN_OSV_URL") {
            self.osv.url = v;
        }
        if let Ok(v) = std::env::var("CHAINSCAN_NPM_URL") {
            self.registry.npm_url = v;
        }
        if let Ok(v) = std::env::var("CHAINSCAN_PYPI_URL") {
            self.registry.pypi_url = v;
        }
        if let Ok(v) = std::env::var("CHAINSCAN_LLM_ENDPOINT") {
            self.llm.endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("CHAINSCAN_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
    }

    pub fn ttl_for_namespace(&self, namespace: &str) -> u64 {
        match namespace {
            "llm" => self.cache.ttl.llm,
            "reputation" => self.cache.ttl.reputation,
            "registry-metadata" => self.cache.ttl.registry_metadata,
            "osv" => self.cache.ttl.osv,
            "malicious-db" => self.cache.ttl.malicious_db,
            _ => self.cache.ttl.registry_metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChainscanConfig::default();
        assert_eq!(config.worker_pool_size, 10);
        assert_eq!(config.registry.timeout_secs, 3);
        assert_eq!(config.osv.max_concurrent, 10);
        assert_eq!(config.resolver.max_depth, 6);
        assert_eq!(config.stages.code, 40);
        assert!(!config.llm.enabled());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: ChainscanConfig = toml::from_str(
            r#"
            worker_pool_size = 4

            [resolver]
            max_depth = 3
            "#,
        )
        .unwrap();
        assert_eq!(parsed.worker_pool_size, 4);
        assert_eq!(parsed.resolver.max_depth, 3);
        assert_eq!(parsed.resolver.max_nodes, 800);
        assert_eq!(parsed.stages.vulnerability, 30);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainscan.toml");
        std::fs::write(&path, "[osv]\nmax_concurrent = 3\n").unwrap();
        let config = ChainscanConfig::load(&path).unwrap();
        assert_eq!(config.osv.max_concurrent, 3);
    }

    #[test]
    fn test_namespace_ttls() {
        let config = ChainscanConfig::default();
        assert!(config.ttl_for_namespace("llm") > config.ttl_for_namespace("osv"));
        assert!(
            config.ttl_for_namespace("malicious-db") > config.ttl_for_namespace("reputation")
        );
    }
}
