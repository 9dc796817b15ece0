//! Command implementations

use crate::cli::{CacheArgs, CacheCommand, GraphArgs, ScanArgs};
use anyhow::{bail, Context, Result};
use chainscan_cache::{AnalysisCache, FileStore};
use chainscan_core::report::AnalysisStatus;
use chainscan_core::{CancellationToken, ChainscanConfig, Ecosystem, PackageRef};
use chainscan_ecosystems::HandlerRegistry;
use chainscan_engine::run::{scan_once, LogLevel, RunLog, RunOptions, TargetInput};
use chainscan_registry::RegistryClient;
use chainscan_resolver::Resolver;
use std::path::Path;

pub fn load_config(explicit: Option<&Path>) -> Result<ChainscanConfig> {
    match explicit {
        Some(path) => ChainscanConfig::load(path),
        None => ChainscanConfig::load_or_default(Path::new(".")),
    }
}

fn parse_ecosystem(raw: Option<&str>) -> Result<Option<Ecosystem>> {
    match raw {
        None => Ok(None),
        Some(s) => match Ecosystem::parse(s) {
            Some(eco) => Ok(Some(eco)),
            None => bail!("unknown ecosystem '{s}' (expected npm or pypi)"),
        },
    }
}

pub async fn scan(mut config: ChainscanConfig, args: ScanArgs) -> Result<()> {
    if let Some(out) = args.out {
        config.output_dir = out;
    }
    if let Some(depth) = args.max_depth {
        config.resolver.max_depth = depth;
    }

    let options = RunOptions {
        ecosystem: parse_ecosystem(args.ecosystem.as_deref())?,
        cache_enabled: !args.no_cache,
        skip_vuln_queries: args.offline,
        confidence_threshold: args.confidence_threshold,
        auth_token: args.auth_token,
    };

    let log = RunLog::default();
    let cancel = CancellationToken::new();
    {
        // ctrl-c maps onto the run's cancellation token
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let (report, path) = scan_once(
        &config,
        TargetInput::parse(&args.target),
        options,
        cancel,
        &log,
    )
    .await
    .map_err(|e| {
        for record in log.snapshot() {
            if record.level == LogLevel::Error {
                eprintln!("error: {}", record.message);
            }
        }
        anyhow::anyhow!(e)
    })?;

    let status = match report.metadata.analysis_status {
        AnalysisStatus::Full => "full",
        AnalysisStatus::Partial => "partial",
        AnalysisStatus::Basic => "basic",
        AnalysisStatus::Minimal => "minimal",
    };
    println!("analysis {} ({status})", report.metadata.analysis_id);
    println!(
        "  packages: {}   vulnerabilities: {} ({} critical, {} high)",
        report.summary.total_packages,
        report.summary.total_vulnerabilities,
        report.summary.critical_vulnerabilities,
        report.summary.high_vulnerabilities,
    );
    println!(
        "  findings: {}   malicious: {}   high-risk: {}",
        report.summary.total_findings,
        report.summary.malicious_packages,
        report.summary.high_risk_packages,
    );
    for recommendation in &report.recommendations {
        println!("  [{:?}] {}", recommendation.priority, recommendation.action);
    }
    if report.metadata.retry_recommended {
        println!("  network degradation detected; re-run recommended");
    }
    println!("report: {}", path.display());
    Ok(())
}

pub fn cache(config: ChainscanConfig, args: CacheArgs) -> Result<()> {
    let store = FileStore::open(config.cache.dir.clone(), config.cache.max_size_bytes)
        .context("failed to open cache")?;
    let cache = AnalysisCache::new(Box::new(store));

    match args.command {
        CacheCommand::Stats => {
            let stats = cache.stats();
            println!("entries:    {}", stats.entries);
            println!("size:       {} bytes", stats.size_bytes);
            println!("hits:       {}", stats.hits);
            println!("misses:     {}", stats.misses);
        }
        CacheCommand::Prune => {
            let removed = cache.sweep_expired().context("sweep failed")?;
            println!("removed {removed} expired entries");
        }
        CacheCommand::Purge { namespace } => {
            cache
                .purge_namespace(&namespace)
                .with_context(|| format!("failed to purge namespace {namespace}"))?;
            println!("purged namespace {namespace}");
        }
    }
    Ok(())
}

pub async fn graph(config: ChainscanConfig, args: GraphArgs) -> Result<()> {
    let handlers = HandlerRegistry::new();
    let ecosystem = handlers
        .select(&args.target, parse_ecosystem(args.ecosystem.as_deref())?)
        .map_err(|e| anyhow::anyhow!(e))?;
    let handler = handlers.get(ecosystem);
    let manifest_path = handler
        .detect(&args.target)
        .context("no manifest found")?;
    let manifest = handler.parse_manifest(&manifest_path)?;

    let cache = chainscan_engine::run::build_cache(&config, true)
        .map_err(|e| anyhow::anyhow!(e))?;
    let registry = RegistryClient::new(
        config.registry.clone(),
        cache,
        chainscan_core::WorkerPool::new(config.worker_pool_size),
        config.cache.ttl.registry_metadata,
        config.cache.ttl.not_found,
    );
    let root = manifest
        .root_package
        .clone()
        .map(|(name, version)| PackageRef::new(name, version, ecosystem))
        .unwrap_or_else(|| PackageRef::new("project", "0.0.0", ecosystem));
    let declared: Vec<(String, String)> = manifest
        .dependencies
        .iter()
        .map(|d| (d.name.clone(), d.spec.clone()))
        .collect();

    let resolver = Resolver::new(&registry, config.resolver.clone(), config.worker_pool_size);
    let arena = resolver
        .build_graph(root, &declared, &CancellationToken::new())
        .await?;

    let analysis = chainscan_graph::analyze(&arena);
    eprintln!(
        "packages: {}  cycles: {}  version conflicts: {}",
        analysis.package_count,
        analysis.cycles.len(),
        analysis.version_conflicts.len()
    );
    println!("{}", chainscan_graph::to_dot(&arena, args.depth));
    Ok(())
}
