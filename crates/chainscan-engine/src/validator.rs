//! Pre-flight validation
//!
//! Runs before the orchestrator touches anything. Every issue carries a fix
//! suggestion so a failed pre-flight is actionable rather than cryptic.
//! Errors halt the run before side effects; warnings ride along in the
//! run's diagnostics.

use chainscan_core::{ChainscanConfig, Ecosystem, ScanError};
use chainscan_ecosystems::HandlerRegistry;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueLevel {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub level: IssueLevel,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_suggestion: Option<String>,
}

impl ValidationIssue {
    fn error(code: &str, message: String, fix: &str) -> Self {
        Self {
            level: IssueLevel::Error,
            code: code.to_string(),
            message,
            fix_suggestion: Some(fix.to_string()),
        }
    }

    fn warning(code: &str, message: String, fix: Option<&str>) -> Self {
        Self {
            level: IssueLevel::Warning,
            code: code.to_string(),
            message,
            fix_suggestion: fix.map(String::from),
        }
    }
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues.iter().any(|i| i.level == IssueLevel::Error)
}

/// Full pre-flight pass. Network checks are warnings only; the engine
/// degrades rather than refusing to start.
pub async fn validate(
    target: &Path,
    ecosystem: Option<Ecosystem>,
    config: &ChainscanConfig,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if !target.is_dir() {
        issues.push(ValidationIssue::error(
            "target_missing",
            format!("target directory does not exist: {}", target.display()),
            "Check the path, or pass a repository URL to clone",
        ));
        return issues;
    }

    let handlers = HandlerRegistry::new();
    let selected = match handlers.select(target, ecosystem) {
        Ok(eco) => Some(eco),
        Err(ScanError::InputValidation(message)) => {
            issues.push(ValidationIssue::error(
                "ecosystem_selection",
                message,
                "Pass --ecosystem npm or --ecosystem pypi to disambiguate",
            ));
            None
        }
        Err(e) => {
            issues.push(ValidationIssue::error(
                "ecosystem_selection",
                e.to_string(),
                "Pass --ecosystem to pick the manifest to analyse",
            ));
            None
        }
    };

    if let Some(eco) = selected {
        let handler = handlers.get(eco);
        match handler.detect(target) {
            Some(manifest_path) => match handler.parse_manifest(&manifest_path) {
                Ok(manifest) if manifest.dependencies.is_empty() => {
                    issues.push(ValidationIssue::error(
                        "no_dependencies",
                        format!(
                            "{} declares no dependencies; nothing to analyse",
                            manifest_path.display()
                        ),
                        "Add dependencies to the manifest, or point at the right project",
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    issues.push(ValidationIssue::error(
                        "manifest_unparseable",
                        e.to_string(),
                        "Fix the manifest syntax; validate it with the ecosystem's own tooling",
                    ));
                }
            },
            None => {
                issues.push(ValidationIssue::error(
                    "manifest_missing",
                    format!("no {} manifest under {}", eco, target.display()),
                    "Run against a directory containing package.json or requirements.txt",
                ));
            }
        }
    }

    for (label, dir) in [
        ("output", config.output_dir.as_path()),
        ("cache", config.cache.dir.as_path()),
    ] {
        if let Err(e) = probe_writable(dir) {
            issues.push(ValidationIssue::error(
                "directory_unwritable",
                format!("{label} directory {} is not writable: {e}", dir.display()),
                "Create the directory or point the configuration somewhere writable",
            ));
        }
    }

    if config.llm.endpoint.is_some() && config.llm.api_key.is_none() {
        issues.push(ValidationIssue::warning(
            "llm_credential_missing",
            "an LLM endpoint is configured without an API key; model passes will be skipped if the endpoint rejects anonymous calls".to_string(),
            Some("Set CHAINSCAN_LLM_API_KEY"),
        ));
    }

    for (code, url) in [
        ("osv_unreachable", config.osv.url.as_str()),
        (
            "registry_unreachable",
            match selected {
                Some(Ecosystem::PyPi) => config.registry.pypi_url.as_str(),
                _ => config.registry.npm_url.as_str(),
            },
        ),
    ] {
        if let Some(host) = host_of(url) {
            if !resolves(&host).await {
                issues.push(ValidationIssue::warning(
                    code,
                    format!("{host} did not resolve; the run will degrade to offline data"),
                    Some("Check network connectivity and proxy settings"),
                ));
            }
        }
    }

    issues
}

/// Writability and (coarsely) free space: create the directory and write a
/// probe file into it
fn probe_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".chainscan-probe");
    std::fs::write(&probe, b"probe")?;
    std::fs::remove_file(&probe)
}

async fn resolves(host: &str) -> bool {
    match tokio::time::timeout(
        Duration::from_millis(900),
        tokio::net::lookup_host((host.to_string(), 443u16)),
    )
    .await
    {
        Ok(Ok(mut addrs)) => addrs.next().is_some(),
        _ => false,
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let host = rest.split(['/', ':']).next()?;
    (!host.is_empty()).then(|| host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> ChainscanConfig {
        let mut config = ChainscanConfig::default();
        config.output_dir = dir.join("out");
        config.cache.dir = dir.join("cache");
        config
    }

    #[tokio::test]
    async fn test_missing_target_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let issues = validate(
            &dir.path().join("nope"),
            None,
            &config_in(dir.path()),
        )
        .await;
        assert!(has_errors(&issues));
        assert_eq!(issues[0].code, "target_missing");
        assert!(issues[0].fix_suggestion.is_some());
    }

    #[tokio::test]
    async fn test_empty_manifest_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"name": "x"}"#).unwrap();
        let issues = validate(dir.path(), None, &config_in(dir.path())).await;
        assert!(issues.iter().any(|i| i.code == "no_dependencies"));
    }

    #[tokio::test]
    async fn test_valid_project_passes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name": "x", "dependencies": {"lodash": "^4.0.0"}}"#,
        )
        .unwrap();
        let issues = validate(dir.path(), None, &config_in(dir.path())).await;
        assert!(!has_errors(&issues), "unexpected errors: {issues:?}");
    }

    #[tokio::test]
    async fn test_broken_manifest_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{not json").unwrap();
        let issues = validate(dir.path(), None, &config_in(dir.path())).await;
        assert!(issues.iter().any(|i| i.code == "manifest_unparseable"));
    }

    #[tokio::test]
    async fn test_llm_without_key_is_warning_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"lodash": "1.0.0"}}"#,
        )
        .unwrap();
        let mut config = config_in(dir.path());
        config.llm.endpoint = Some("https://llm.example/v1/chat".to_string());
        let issues = validate(dir.path(), None, &config).await;
        let llm_issue = issues
            .iter()
            .find(|i| i.code == "llm_credential_missing")
            .unwrap();
        assert_eq!(llm_issue.level, IssueLevel::Warning);
        assert!(!has_errors(&issues));
    }
}
