//! Run controller
//!
//! One global run at a time: `idle → running → (completed | failed |
//! cancelled) → idle`. The external UI layer polls `status()` for the
//! append-only log and the report path; `cancel()` signals the run token
//! and kills a live clone subprocess. Log records never contain secrets.

use crate::context::{Services, SharedContext};
use crate::orchestrator::Orchestrator;
use crate::stages;
use crate::validator::{self, IssueLevel};
use chainscan_cache::{AnalysisCache, FileStore, MemoryStore};
use chainscan_core::config::CacheBackendKind;
use chainscan_core::{
    CancellationToken, ChainscanConfig, Ecosystem, PackageRef, Report, ScanError, StageData,
    StageResult, StageStatus,
};
use chainscan_ecosystems::HandlerRegistry;
use chainscan_registry::RegistryClient;
use chainscan_resolver::Resolver;
use chainscan_rules::{MaliciousDb, RuleScanner};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetInput {
    Path(PathBuf),
    Url(String),
}

impl TargetInput {
    /// Anything that looks like a URL is delegated to the cloning
    /// subprocess; the core never inspects it further.
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") || raw.starts_with("git@") {
            TargetInput::Url(raw.to_string())
        } else {
            TargetInput::Path(PathBuf::from(raw))
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub ecosystem: Option<Ecosystem>,
    pub cache_enabled: bool,
    /// Skip external vulnerability queries entirely
    pub skip_vuln_queries: bool,
    /// Findings below this confidence are dropped from the report
    pub confidence_threshold: f64,
    /// Token handed to the clone subprocess for private repositories
    pub auth_token: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            ecosystem: None,
            cache_enabled: true,
            skip_vuln_queries: false,
            confidence_threshold: 0.0,
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Append-only log shared between the controller and the running pipeline
#[derive(Clone, Default)]
pub struct RunLog {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl RunLog {
    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        self.records.lock().unwrap().push(LogRecord {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
    }

    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

#[derive(Debug, Clone)]
pub struct RunStatus {
    pub state: RunState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub log: Vec<LogRecord>,
    pub result_path: Option<PathBuf>,
}

struct ControllerInner {
    state: RunState,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    result_path: Option<PathBuf>,
    cancel: Option<CancellationToken>,
}

pub struct RunController {
    config: ChainscanConfig,
    inner: Arc<Mutex<ControllerInner>>,
    log: RunLog,
}

impl RunController {
    pub fn new(config: ChainscanConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(ControllerInner {
                state: RunState::Idle,
                started_at: None,
                ended_at: None,
                result_path: None,
                cancel: None,
            })),
            log: RunLog::default(),
        }
    }

    /// Start a run; rejected while one is active
    pub fn start(&self, target: TargetInput, options: RunOptions) -> Result<(), ScanError> {
        let cancel = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == RunState::Running {
                return Err(ScanError::InputValidation(
                    "an analysis run is already active".to_string(),
                ));
            }
            let cancel = CancellationToken::new();
            inner.state = RunState::Running;
            inner.started_at = Some(Utc::now());
            inner.ended_at = None;
            inner.result_path = None;
            inner.cancel = Some(cancel.clone());
            cancel
        };
        self.log.clear();

        let config = self.config.clone();
        let inner = self.inner.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            let outcome = scan_once(&config, target, options, cancel.clone(), &log).await;
            let mut inner = inner.lock().unwrap();
            inner.ended_at = Some(Utc::now());
            match outcome {
                Ok((_, path)) => {
                    log.push(LogLevel::Info, format!("report written to {}", path.display()));
                    inner.result_path = Some(path);
                    inner.state = RunState::Completed;
                }
                Err(ScanError::Cancelled) => {
                    log.push(LogLevel::Warning, "run cancelled");
                    inner.state = RunState::Cancelled;
                }
                Err(e) => {
                    log.push(LogLevel::Error, format!("run failed: {e}"));
                    inner.state = RunState::Failed;
                }
            }
        });
        Ok(())
    }

    pub fn status(&self) -> RunStatus {
        let inner = self.inner.lock().unwrap();
        RunStatus {
            state: inner.state,
            started_at: inner.started_at,
            ended_at: inner.ended_at,
            log: self.log.snapshot(),
            result_path: inner.result_path.clone(),
        }
    }

    /// Signal the active run's token; the pipeline unwinds at its next
    /// suspension point and any clone subprocess is killed.
    pub fn cancel(&self) {
        let inner = self.inner.lock().unwrap();
        if let Some(cancel) = &inner.cancel {
            cancel.cancel();
        }
    }
}

/// One full analysis: validate, rule-scan, resolve, orchestrate, persist.
/// Used directly by the CLI and indirectly by the controller.
pub async fn scan_once(
    config: &ChainscanConfig,
    target: TargetInput,
    options: RunOptions,
    cancel: CancellationToken,
    log: &RunLog,
) -> Result<(Report, PathBuf), ScanError> {
    let started_at = Utc::now();
    cancel.check()?;

    let target_dir = match target {
        TargetInput::Path(path) => path,
        TargetInput::Url(url) => {
            log.push(LogLevel::Info, format!("cloning {url}"));
            clone_target(&url, options.auth_token.as_deref(), &config.output_dir, &cancel).await?
        }
    };

    log.push(LogLevel::Info, "running pre-flight checks");
    let issues = validator::validate(&target_dir, options.ecosystem, config).await;
    for issue in &issues {
        let level = match issue.level {
            IssueLevel::Error => LogLevel::Error,
            IssueLevel::Warning => LogLevel::Warning,
            IssueLevel::Info => LogLevel::Info,
        };
        log.push(level, format!("[{}] {}", issue.code, issue.message));
    }
    if validator::has_errors(&issues) {
        return Err(ScanError::InputValidation(
            "pre-flight validation failed; see the run log".to_string(),
        ));
    }
    cancel.check()?;

    let cache = build_cache(config, options.cache_enabled)?;
    let handlers = HandlerRegistry::new();
    let ecosystem = handlers.select(&target_dir, options.ecosystem)?;
    let handler = handlers.get(ecosystem);
    let manifest_path = handler.detect(&target_dir).ok_or_else(|| {
        ScanError::InputValidation(format!("no {ecosystem} manifest in {}", target_dir.display()))
    })?;
    let manifest = handler.parse_manifest(&manifest_path)?;
    let root_package = manifest
        .root_package
        .clone()
        .map(|(name, version)| PackageRef::new(name, version, ecosystem))
        .unwrap_or_else(|| {
            let name = target_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string());
            PackageRef::new(name, "0.0.0", ecosystem)
        });

    // rule layer first: deterministic, no network, fast
    log.push(LogLevel::Info, "rule-based scan");
    let scanner = RuleScanner::new(MaliciousDb::load(&cache));
    let rule_findings = scanner.scan(ecosystem, &manifest, &[]);
    log.push(
        LogLevel::Info,
        format!("rule scan produced {} findings", rule_findings.len()),
    );

    log.push(LogLevel::Info, "resolving dependency graph");
    let registry = RegistryClient::new(
        config.registry.clone(),
        cache.clone(),
        chainscan_core::WorkerPool::new(config.worker_pool_size),
        config.cache.ttl.registry_metadata,
        config.cache.ttl.not_found,
    );
    let declared: Vec<(String, String)> = manifest
        .dependencies
        .iter()
        .map(|d| (d.name.clone(), d.spec.clone()))
        .collect();
    let resolver = Resolver::new(&registry, config.resolver.clone(), config.worker_pool_size);
    let arena = resolver
        .build_graph(root_package.clone(), &declared, &cancel)
        .await?;
    log.push(
        LogLevel::Info,
        format!("graph has {} packages", arena.len().saturating_sub(1)),
    );

    // second rule pass over the resolved set picks up transitive hits
    let transitive = arena.packages();
    let rule_findings = {
        let mut all = rule_findings;
        let extra = scanner.scan(ecosystem, &manifest, &transitive);
        let known: std::collections::HashSet<String> =
            all.iter().map(|f| f.dedup_key()).collect();
        all.extend(extra.into_iter().filter(|f| !known.contains(&f.dedup_key())));
        all
    };

    let mut ctx = SharedContext::new(
        target_dir.clone(),
        ecosystem,
        root_package,
        manifest,
        arena,
        rule_findings,
        cancel.clone(),
    );
    if options.skip_vuln_queries {
        log.push(LogLevel::Info, "external vulnerability queries disabled");
        ctx.stage_results.insert(
            stages::VULNERABILITY.to_string(),
            StageResult {
                stage_name: stages::VULNERABILITY.to_string(),
                success: false,
                started_at: Utc::now(),
                duration_seconds: 0.0,
                confidence: 0.0,
                data: StageData::Vulnerability { packages: vec![] },
                error: None,
                status: StageStatus::NotAvailable,
            },
        );
    }

    log.push(LogLevel::Info, "running analysis stages");
    let services = Services::new(config.clone(), cache.clone());
    let orchestrator = Orchestrator::new();
    let mut final_report = orchestrator.run(&mut ctx, &services, started_at).await;

    if options.confidence_threshold > 0.0 {
        apply_confidence_threshold(&mut final_report, options.confidence_threshold);
    }

    if cancel.is_cancelled() {
        // persist whatever the completed stages produced, then unwind
        let _ = persist_report(&final_report, &config.output_dir);
        return Err(ScanError::Cancelled);
    }

    let path = persist_report(&final_report, &config.output_dir)?;
    append_history(&final_report, &path, &config.output_dir);

    if let Err(e) = cache.sweep_expired() {
        info!("cache sweep failed: {e}");
    }
    Ok((final_report, path))
}

/// Cache backend per configuration; `cache_enabled = false` yields a fresh
/// in-memory store for the run
pub fn build_cache(
    config: &ChainscanConfig,
    cache_enabled: bool,
) -> Result<Arc<AnalysisCache>, ScanError> {
    let store: Box<dyn chainscan_cache::CacheStore> = if !cache_enabled {
        Box::new(MemoryStore::new(config.cache.max_size_bytes))
    } else {
        match config.cache.backend {
            CacheBackendKind::Memory => Box::new(MemoryStore::new(config.cache.max_size_bytes)),
            CacheBackendKind::File => Box::new(
                FileStore::open(config.cache.dir.clone(), config.cache.max_size_bytes)
                    .map_err(|e| ScanError::Configuration(e.to_string()))?,
            ),
        }
    };
    Ok(Arc::new(AnalysisCache::new(store)))
}

/// Drop findings under the requested confidence and refresh the counters
fn apply_confidence_threshold(report: &mut Report, threshold: f64) {
    for package in &mut report.packages {
        package.risk_factors.retain(|f| f.confidence >= threshold);
        package.code_issues.retain(|f| f.confidence >= threshold);
        package
            .supply_chain_risks
            .retain(|f| f.confidence >= threshold);
        package.finding_count = package.risk_factors.len()
            + package.code_issues.len()
            + package.supply_chain_risks.len();
    }
    report.summary.total_findings = report.packages.iter().map(|p| p.finding_count).sum();
}

/// Deterministic artefact path, overwritten each run
fn persist_report(final_report: &Report, output_dir: &Path) -> Result<PathBuf, ScanError> {
    std::fs::create_dir_all(output_dir)
        .map_err(|e| ScanError::Configuration(format!("cannot create output dir: {e}")))?;
    let path = output_dir.join("report.json");
    let json = serde_json::to_string_pretty(final_report)
        .map_err(|e| ScanError::Internal(format!("report serialisation: {e}")))?;
    std::fs::write(&path, json)
        .map_err(|e| ScanError::Configuration(format!("cannot write report: {e}")))?;
    Ok(path)
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryEntry {
    analysis_id: String,
    target: String,
    ended_at: DateTime<Utc>,
    report_path: String,
}

/// Best-effort history index; failure never fails the run
fn append_history(final_report: &Report, path: &Path, output_dir: &Path) {
    let history_path = output_dir.join("history.json");
    let mut entries: Vec<HistoryEntry> = std::fs::read_to_string(&history_path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default();
    entries.push(HistoryEntry {
        analysis_id: final_report.metadata.analysis_id.clone(),
        target: final_report.metadata.target.clone(),
        ended_at: final_report.metadata.completed_at,
        report_path: path.display().to_string(),
    });
    if let Ok(json) = serde_json::to_string_pretty(&entries) {
        let _ = std::fs::write(&history_path, json);
    }
}

/// Delegate cloning to a `git` subprocess. The child is killed as soon as
/// the run's token fires.
async fn clone_target(
    url: &str,
    auth_token: Option<&str>,
    output_dir: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, ScanError> {
    let dest = output_dir.join("checkout");
    if dest.exists() {
        std::fs::remove_dir_all(&dest)
            .map_err(|e| ScanError::Configuration(format!("cannot clear checkout dir: {e}")))?;
    }
    std::fs::create_dir_all(output_dir)
        .map_err(|e| ScanError::Configuration(format!("cannot create output dir: {e}")))?;

    let mut command = tokio::process::Command::new("git");
    command
        .arg("clone")
        .arg("--depth")
        .arg("1")
        .arg(url)
        .arg(&dest)
        .kill_on_drop(true);
    if let Some(token) = auth_token {
        // handed to git's credential machinery, never logged
        command.env("CHAINSCAN_SCM_TOKEN", token);
    }

    let mut child = command
        .spawn()
        .map_err(|e| ScanError::Configuration(format!("cannot spawn git: {e}")))?;

    tokio::select! {
        status = child.wait() => {
            let status = status
                .map_err(|e| ScanError::Internal(format!("clone subprocess: {e}")))?;
            if !status.success() {
                return Err(ScanError::NetworkTransient(format!(
                    "git clone exited with {status}"
                )));
            }
            Ok(dest)
        }
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            error!("clone subprocess killed by cancellation");
            Err(ScanError::Cancelled)
        }
    }
}
