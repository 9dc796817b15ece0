//! npm ecosystem handler
//!
//! Parses `package.json` (dependencies, devDependencies, peerDependencies,
//! and every named script hook) and carries the npm install-script pattern
//! table.

use crate::{
    DeclaredDependency, DependencyKind, EcosystemHandler, ManifestScript, ParsedManifest,
    RegistryEndpoints, ScriptPattern,
};
use chainscan_core::{Ecosystem, ScanError, Severity};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub struct NpmHandler;

lazy_static! {
    static ref EXACT_SEMVER: Regex =
        Regex::new(r"^\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?$").unwrap();
}

/// Hooks npm runs automatically during install/uninstall
const LIFECYCLE_HOOKS: &[&str] = &[
    "preinstall",
    "install",
    "postinstall",
    "preuninstall",
    "postuninstall",
    "prepare",
    "prepublish",
];

#[derive(Debug, Deserialize)]
struct PackageJson {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "peerDependencies")]
    peer_dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "optionalDependencies")]
    optional_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

impl EcosystemHandler for NpmHandler {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Npm
    }

    fn manifest_names(&self) -> &'static [&'static str] {
        &["package.json"]
    }

    fn parse_manifest(&self, path: &Path) -> Result<ParsedManifest, ScanError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ScanError::InputValidation(format!("cannot read {}: {e}", path.display())))?;
        if content.trim().is_empty() {
            return Err(ScanError::InputValidation(format!(
                "{} is empty",
                path.display()
            )));
        }
        let manifest: PackageJson = serde_json::from_str(&content)
            .map_err(|e| ScanError::InputValidation(format!("invalid package.json: {e}")))?;

        let mut dependencies = Vec::new();
        for (deps, kind) in [
            (&manifest.dependencies, DependencyKind::Runtime),
            (&manifest.dev_dependencies, DependencyKind::Dev),
            (&manifest.peer_dependencies, DependencyKind::Peer),
            (&manifest.optional_dependencies, DependencyKind::Optional),
        ] {
            for (name, spec) in deps {
                dependencies.push(DeclaredDependency {
                    name: name.clone(),
                    spec: spec.clone(),
                    kind,
                });
            }
        }

        let scripts = manifest
            .scripts
            .iter()
            .map(|(hook, command)| ManifestScript {
                hook: hook.clone(),
                command: command.clone(),
                lifecycle: LIFECYCLE_HOOKS.contains(&hook.as_str()),
            })
            .collect();

        let root_package = match (manifest.name, manifest.version) {
            (Some(name), Some(version)) => Some((name, version)),
            (Some(name), None) => Some((name, "0.0.0".to_string())),
            _ => None,
        };

        Ok(ParsedManifest {
            root_package,
            dependencies,
            scripts,
        })
    }

    fn script_patterns(&self) -> &'static [ScriptPattern] {
        NPM_SCRIPT_PATTERNS
    }

    fn lifecycle_hooks(&self) -> &'static [&'static str] {
        LIFECYCLE_HOOKS
    }

    fn popular_packages(&self) -> &'static [&'static str] {
        POPULAR_NPM_PACKAGES
    }

    fn registry_endpoints(
        &self,
        name: &str,
        version: Option<&str>,
        base_url: &str,
    ) -> RegistryEndpoints {
        // Scoped names contain a slash that must be escaped in the path
        let escaped = urlencoding::encode(name).into_owned();
        let base = base_url.trim_end_matches('/');
        RegistryEndpoints {
            metadata_url: match version {
                Some(v) => format!("{base}/{escaped}/{v}"),
                None => format!("{base}/{escaped}/latest"),
            },
            latest_url: format!("{base}/{escaped}/latest"),
        }
    }

    fn exact_pin(&self, spec: &str) -> Option<String> {
        let spec = spec.trim().trim_start_matches('=');
        if EXACT_SEMVER.is_match(spec) {
            Some(spec.to_string())
        } else {
            None
        }
    }
}

/// Install-script pattern table. Severity shown is the base level; matches
/// inside lifecycle hooks are promoted one level when the row is marked
/// lifecycle-sensitive.
static NPM_SCRIPT_PATTERNS: &[ScriptPattern] = &[
    ScriptPattern {
        id: "npm-curl-pipe-shell",
        pattern: r"(curl|wget)\s+[^|;&]*\|\s*(sh|bash|zsh)",
        severity: Severity::High,
        attack_family: "remote_code_execution",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "npm-remote-eval",
        pattern: r#"node\s+-e\s+.*(http|require\(['"]child_process)"#,
        severity: Severity::High,
        attack_family: "remote_code_execution",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "npm-webhook-exfil",
        pattern: r"https?://[^\s]*(webhook|discord\.com/api|hooks\.slack)[^\s]*",
        severity: Severity::High,
        attack_family: "data_exfiltration",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "npm-pastebin",
        pattern: r"https?://(pastebin\.com|paste\.ee|hastebin)",
        severity: Severity::High,
        attack_family: "data_exfiltration",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "npm-raw-ip-url",
        pattern: r"https?://[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}",
        severity: Severity::Medium,
        attack_family: "data_exfiltration",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "npm-ssh-key-access",
        pattern: r"(~|\$HOME)?/?\.ssh/|id_rsa|id_ed25519",
        severity: Severity::Critical,
        attack_family: "credential_theft",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "npm-cloud-credentials",
        pattern: r"\.aws/credentials|\.npmrc|\.docker/config\.json|\.kube/config",
        severity: Severity::Critical,
        attack_family: "credential_theft",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "npm-etc-passwd",
        pattern: r"/etc/(passwd|shadow)",
        severity: Severity::Critical,
        attack_family: "credential_theft",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "npm-miner",
        pattern: r"stratum\+tcp://|xmrig|cpuminer|coinhive",
        severity: Severity::Critical,
        attack_family: "crypto_mining",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "npm-base64-exec",
        pattern: r#"Buffer\.from\([^)]+,\s*['"]base64['"]\)|atob\s*\("#,
        severity: Severity::Medium,
        attack_family: "obfuscation",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "npm-eval",
        pattern: r"\beval\s*\(|new\s+Function\s*\(|String\.fromCharCode",
        severity: Severity::Medium,
        attack_family: "obfuscation",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "npm-hex-blob",
        pattern: r"(\\x[0-9a-fA-F]{2}){8,}",
        severity: Severity::Medium,
        attack_family: "obfuscation",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "npm-env-harvest",
        pattern: r"JSON\.stringify\(\s*process\.env\s*\)|printenv\s*\||env\s*\|\s*curl",
        severity: Severity::High,
        attack_family: "env_harvesting",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "npm-reverse-shell",
        pattern: r"nc\s+(-[a-z]*e|-c)\s|/dev/tcp/|bash\s+-i\s+>&",
        severity: Severity::Critical,
        attack_family: "reverse_shell",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "npm-persistence",
        pattern: r"crontab|systemctl\s+enable|/etc/rc\.local|LaunchAgents",
        severity: Severity::High,
        attack_family: "persistence",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "npm-destructive",
        pattern: r"rm\s+-rf\s+[/~]|mkfs\.|:\(\)\{\s*:\|:",
        severity: Severity::Critical,
        attack_family: "destructive",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "npm-dns-tunnel",
        pattern: r"dns\.(resolve|lookup)\(.*\+|nslookup\s+\$",
        severity: Severity::High,
        attack_family: "dns_tunneling",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "npm-delayed-activation",
        pattern: r"set(Timeout|Interval)\s*\([^)]*(Date|86400|3600000)",
        severity: Severity::Medium,
        attack_family: "delayed_activation",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "npm-pm-abuse",
        pattern: r"npm\s+(publish|adduser)|npm\s+install\s+https?://",
        severity: Severity::Medium,
        attack_family: "package_manager_abuse",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "npm-browser-theft",
        pattern: r"(Chrome|Chromium|BraveSoftware)[/\\]+.*(Local State|Login Data|Cookies)",
        severity: Severity::Critical,
        attack_family: "browser_data_theft",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "npm-clipboard",
        pattern: r"pbpaste|xclip\s+-o|clipboardy",
        severity: Severity::Medium,
        attack_family: "clipboard_hijack",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "npm-priv-esc",
        pattern: r"sudo\s+|chmod\s+[0-7]*4[0-7]{3}\s|setuid",
        severity: Severity::High,
        attack_family: "privilege_escalation",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "npm-tunnel-service",
        pattern: r"ngrok|localtunnel|serveo\.net",
        severity: Severity::Medium,
        attack_family: "data_exfiltration",
        lifecycle_sensitive: false,
    },
];

static POPULAR_NPM_PACKAGES: &[&str] = &[
    "lodash",
    "react",
    "react-dom",
    "express",
    "axios",
    "chalk",
    "commander",
    "debug",
    "request",
    "moment",
    "underscore",
    "vue",
    "webpack",
    "typescript",
    "jest",
    "mocha",
    "eslint",
    "prettier",
    "rxjs",
    "jquery",
    "bluebird",
    "async",
    "uuid",
    "classnames",
    "prop-types",
    "redux",
    "next",
    "socket.io",
    "ws",
    "minimist",
    "yargs",
    "glob",
    "rimraf",
    "mkdirp",
    "fs-extra",
    "dotenv",
    "node-fetch",
    "cross-env",
    "inquirer",
    "semver",
    "colors",
    "ora",
    "body-parser",
    "cheerio",
    "nodemon",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(json: &str) -> ParsedManifest {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.json");
        std::fs::write(&path, json).unwrap();
        NpmHandler.parse_manifest(&path).unwrap()
    }

    #[test]
    fn test_parse_dependencies_and_scripts() {
        let manifest = parse_str(
            r#"{
                "name": "demo",
                "version": "1.2.3",
                "dependencies": {"lodash": "^4.17.21"},
                "devDependencies": {"jest": "29.0.0"},
                "scripts": {
                    "postinstall": "node setup.js",
                    "test": "jest"
                }
            }"#,
        );
        assert_eq!(
            manifest.root_package,
            Some(("demo".to_string(), "1.2.3".to_string()))
        );
        assert_eq!(manifest.dependencies.len(), 2);
        let postinstall = manifest
            .scripts
            .iter()
            .find(|s| s.hook == "postinstall")
            .unwrap();
        assert!(postinstall.lifecycle);
        let test = manifest.scripts.iter().find(|s| s.hook == "test").unwrap();
        assert!(!test.lifecycle);
    }

    #[test]
    fn test_empty_manifest_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.json");
        std::fs::write(&path, "   ").unwrap();
        assert!(NpmHandler.parse_manifest(&path).is_err());
    }

    #[test]
    fn test_registry_endpoints_scoped() {
        let endpoints = NpmHandler.registry_endpoints(
            "@types/node",
            Some("18.0.0"),
            "https://registry.npmjs.org",
        );
        assert_eq!(
            endpoints.metadata_url,
            "https://registry.npmjs.org/%40types%2Fnode/18.0.0"
        );
        assert!(endpoints.latest_url.ends_with("/latest"));
    }

    #[test]
    fn test_exact_pin() {
        assert_eq!(NpmHandler.exact_pin("1.2.3"), Some("1.2.3".to_string()));
        assert_eq!(NpmHandler.exact_pin("=1.2.3"), Some("1.2.3".to_string()));
        assert_eq!(
            NpmHandler.exact_pin("1.0.0-beta.1"),
            Some("1.0.0-beta.1".to_string())
        );
        assert_eq!(NpmHandler.exact_pin("^4.17.21"), None);
        assert_eq!(NpmHandler.exact_pin("~1.2.0"), None);
        assert_eq!(NpmHandler.exact_pin("*"), None);
        assert_eq!(NpmHandler.exact_pin(">=2.0.0"), None);
    }
}
