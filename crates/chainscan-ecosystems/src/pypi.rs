//! PyPI ecosystem handler
//!
//! Parses `requirements.txt`, PEP 621 `pyproject.toml`, and `setup.py`
//! (statically, never executed). A `setup.py` body is surfaced as an
//! install script because `pip install` runs it; a custom `cmdclass` makes
//! it lifecycle-sensitive the way npm's preinstall hook is.

use crate::{
    DeclaredDependency, DependencyKind, EcosystemHandler, ManifestScript, ParsedManifest,
    RegistryEndpoints, ScriptPattern,
};
use chainscan_core::{Ecosystem, ScanError, Severity};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;

pub struct PyPiHandler;

lazy_static! {
    static ref EXACT_PIN: Regex =
        Regex::new(r"^===?\s*([0-9][0-9A-Za-z.!+-]*)$").unwrap();
    static ref BARE_VERSION: Regex = Regex::new(r"^[0-9]+(\.[0-9]+)*([a-z0-9.+-]*)$").unwrap();
    static ref REQUIREMENT_NAME: Regex =
        Regex::new(r"^\s*([A-Za-z0-9][A-Za-z0-9._-]*)\s*(\[[^\]]*\])?\s*(.*)$").unwrap();
    static ref INSTALL_REQUIRES: Regex =
        Regex::new(r"(?s)install_requires\s*=\s*\[(.*?)\]").unwrap();
    static ref QUOTED: Regex = Regex::new(r#"['"]([^'"]+)['"]"#).unwrap();
}

impl EcosystemHandler for PyPiHandler {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::PyPi
    }

    fn manifest_names(&self) -> &'static [&'static str] {
        &["requirements.txt", "pyproject.toml", "setup.py"]
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
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let mut manifest = match file_name {
            "requirements.txt" => parse_requirements(&content),
            "pyproject.toml" => parse_pyproject(&content)?,
            "setup.py" => parse_setup_py(&content),
            other => {
                return Err(ScanError::InputValidation(format!(
                    "unrecognised PyPI manifest: {other}"
                )))
            }
        };

        // A sibling setup.py is install-time code even when the declared
        // dependencies came from another manifest.
        if file_name != "setup.py" {
            if let Some(parent) = path.parent() {
                let setup = parent.join("setup.py");
                if setup.exists() {
                    if let Ok(setup_content) = std::fs::read_to_string(&setup) {
                        manifest.scripts.push(setup_script(&setup_content));
                    }
                }
            }
        }

        Ok(manifest)
    }

    fn script_patterns(&self) -> &'static [ScriptPattern] {
        PYPI_SCRIPT_PATTERNS
    }

    fn lifecycle_hooks(&self) -> &'static [&'static str] {
        &["setup.py"]
    }

    fn popular_packages(&self) -> &'static [&'static str] {
        POPULAR_PYPI_PACKAGES
    }

    fn registry_endpoints(
        &self,
        name: &str,
        version: Option<&str>,
        base_url: &str,
    ) -> RegistryEndpoints {
        let base = base_url.trim_end_matches('/');
        RegistryEndpoints {
            // Specifier ranges are never appended to the path; the caller
            // strips them and falls back to the latest endpoint.
            metadata_url: match version {
                Some(v) => format!("{base}/pypi/{name}/{v}/json"),
                None => format!("{base}/pypi/{name}/json"),
            },
            latest_url: format!("{base}/pypi/{name}/json"),
        }
    }

    fn exact_pin(&self, spec: &str) -> Option<String> {
        let spec = spec.trim();
        if let Some(caps) = EXACT_PIN.captures(spec) {
            let pin = caps[1].to_string();
            if pin.contains('*') {
                return None;
            }
            return Some(pin);
        }
        if BARE_VERSION.is_match(spec) {
            return Some(spec.to_string());
        }
        None
    }
}

fn setup_script(content: &str) -> ManifestScript {
    ManifestScript {
        hook: "setup.py".to_string(),
        command: content.to_string(),
        lifecycle: content.contains("cmdclass"),
    }
}

/// One requirement per line; `#` comments and environment markers ignored
fn parse_requirements(content: &str) -> ParsedManifest {
    let mut dependencies = Vec::new();
    for raw_line in content.lines() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with('-') {
            // -r/-e/--index-url option lines are pip plumbing, not packages
            continue;
        }
        let line = line.split(';').next().unwrap_or("").trim();
        if let Some(caps) = REQUIREMENT_NAME.captures(line) {
            dependencies.push(DeclaredDependency {
                name: caps[1].to_string(),
                spec: caps.get(3).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
                kind: DependencyKind::Runtime,
            });
        }
    }
    ParsedManifest {
        root_package: None,
        dependencies,
        scripts: Vec::new(),
    }
}

/// PEP 621: `project.dependencies` plus `project.optional-dependencies`
fn parse_pyproject(content: &str) -> Result<ParsedManifest, ScanError> {
    let value: toml::Value = toml::from_str(content)
        .map_err(|e| ScanError::InputValidation(format!("invalid pyproject.toml: {e}")))?;

    let project = value.get("project");
    let root_package = project.and_then(|p| {
        let name = p.get("name")?.as_str()?.to_string();
        let version = p
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("0.0.0")
            .to_string();
        Some((name, version))
    });

    let mut dependencies = Vec::new();
    if let Some(list) = project
        .and_then(|p| p.get("dependencies"))
        .and_then(|d| d.as_array())
    {
        for entry in list {
            if let Some(req) = entry.as_str() {
                if let Some(dep) = parse_requirement_line(req, DependencyKind::Runtime) {
                    dependencies.push(dep);
                }
            }
        }
    }
    if let Some(groups) = project
        .and_then(|p| p.get("optional-dependencies"))
        .and_then(|d| d.as_table())
    {
        for list in groups.values() {
            if let Some(entries) = list.as_array() {
                for entry in entries {
                    if let Some(req) = entry.as_str() {
                        if let Some(dep) = parse_requirement_line(req, DependencyKind::Optional) {
                            dependencies.push(dep);
                        }
                    }
                }
            }
        }
    }

    Ok(ParsedManifest {
        root_package,
        dependencies,
        scripts: Vec::new(),
    })
}

fn parse_requirement_line(line: &str, kind: DependencyKind) -> Option<DeclaredDependency> {
    let line = line.split(';').next().unwrap_or("").trim();
    let caps = REQUIREMENT_NAME.captures(line)?;
    Some(DeclaredDependency {
        name: caps[1].to_string(),
        spec: caps.get(3).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
        kind,
    })
}

/// Static source scan only; the file is never executed
fn parse_setup_py(content: &str) -> ParsedManifest {
    let mut dependencies = Vec::new();
    if let Some(caps) = INSTALL_REQUIRES.captures(content) {
        for quoted in QUOTED.captures_iter(&caps[1]) {
            if let Some(dep) = parse_requirement_line(&quoted[1], DependencyKind::Runtime) {
                dependencies.push(dep);
            }
        }
    }
    ParsedManifest {
        root_package: None,
        dependencies,
        scripts: vec![setup_script(content)],
    }
}

static PYPI_SCRIPT_PATTERNS: &[ScriptPattern] = &[
    ScriptPattern {
        id: "pypi-os-system",
        pattern: r"os\.(system|popen)\s*\(",
        severity: Severity::High,
        attack_family: "remote_code_execution",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "pypi-subprocess-shell",
        pattern: r"subprocess\.(call|run|Popen)\s*\([^)]*shell\s*=\s*True",
        severity: Severity::High,
        attack_family: "remote_code_execution",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "pypi-curl-pipe-shell",
        pattern: r"(curl|wget)\s+[^|;&]*\|\s*(sh|bash)",
        severity: Severity::High,
        attack_family: "remote_code_execution",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "pypi-exec-eval",
        pattern: r"\b(exec|eval)\s*\(",
        severity: Severity::Medium,
        attack_family: "obfuscation",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "pypi-base64-exec",
        pattern: r"base64\.b64decode|codecs\.decode\([^)]*rot",
        severity: Severity::Medium,
        attack_family: "obfuscation",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "pypi-dynamic-import",
        pattern: r"__import__\s*\(|importlib\.import_module\s*\([^)]*\+",
        severity: Severity::Medium,
        attack_family: "obfuscation",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "pypi-compile-exec",
        pattern: r"compile\s*\([^)]*\).*exec|marshal\.loads",
        severity: Severity::High,
        attack_family: "obfuscation",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "pypi-cmdclass-override",
        pattern: r"cmdclass\s*=\s*\{[^}]*(install|develop|egg_info)",
        severity: Severity::High,
        attack_family: "package_manager_abuse",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "pypi-webhook-exfil",
        pattern: r"https?://[^\s'\x22]*(webhook|discord\.com/api|hooks\.slack)",
        severity: Severity::High,
        attack_family: "data_exfiltration",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "pypi-raw-socket",
        pattern: r"socket\.socket\s*\(|socket\.create_connection",
        severity: Severity::Medium,
        attack_family: "data_exfiltration",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "pypi-env-harvest",
        pattern: r"dict\(os\.environ\)|os\.environ\.items\(\)|json\.dumps\([^)]*environ",
        severity: Severity::High,
        attack_family: "env_harvesting",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "pypi-credential-paths",
        pattern: r"\.ssh/|id_rsa|\.aws/credentials|\.pypirc|\.netrc",
        severity: Severity::Critical,
        attack_family: "credential_theft",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "pypi-etc-passwd",
        pattern: r"/etc/(passwd|shadow)",
        severity: Severity::Critical,
        attack_family: "credential_theft",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "pypi-reverse-shell",
        pattern: r"pty\.spawn|/dev/tcp/|socket\.[^\n]*connect[^\n]*subprocess",
        severity: Severity::Critical,
        attack_family: "reverse_shell",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "pypi-miner",
        pattern: r"stratum\+tcp://|xmrig|cryptonight",
        severity: Severity::Critical,
        attack_family: "crypto_mining",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "pypi-persistence",
        pattern: r"crontab|/etc/rc\.local|systemd|\.bashrc",
        severity: Severity::High,
        attack_family: "persistence",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "pypi-destructive",
        pattern: r"shutil\.rmtree\s*\(\s*['\x22]/|rm\s+-rf\s+[/~]",
        severity: Severity::Critical,
        attack_family: "destructive",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "pypi-delayed-activation",
        pattern: r"time\.sleep\s*\(\s*[0-9]{4,}|datetime\.(now|today)\(\)\s*[<>]",
        severity: Severity::Medium,
        attack_family: "delayed_activation",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "pypi-pickle-remote",
        pattern: r"pickle\.loads?\s*\([^)]*(urlopen|requests\.get)",
        severity: Severity::Critical,
        attack_family: "remote_code_execution",
        lifecycle_sensitive: true,
    },
    ScriptPattern {
        id: "pypi-ctypes",
        pattern: r"ctypes\.(CDLL|windll)|mmap\.mmap",
        severity: Severity::Medium,
        attack_family: "privilege_escalation",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "pypi-clipboard",
        pattern: r"pyperclip|xclip\s+-o|pbpaste",
        severity: Severity::Medium,
        attack_family: "clipboard_hijack",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "pypi-browser-theft",
        pattern: r"(Chrome|Chromium)[/\\]+.*(Local State|Login Data|Cookies)",
        severity: Severity::Critical,
        attack_family: "browser_data_theft",
        lifecycle_sensitive: false,
    },
    ScriptPattern {
        id: "pypi-dns-tunnel",
        pattern: r"dns\.resolver|socket\.gethostbyname\s*\([^)]*\+",
        severity: Severity::High,
        attack_family: "dns_tunneling",
        lifecycle_sensitive: false,
    },
];

static POPULAR_PYPI_PACKAGES: &[&str] = &[
    "requests",
    "numpy",
    "pandas",
    "urllib3",
    "setuptools",
    "boto3",
    "botocore",
    "six",
    "python-dateutil",
    "pyyaml",
    "certifi",
    "idna",
    "charset-normalizer",
    "flask",
    "django",
    "scipy",
    "matplotlib",
    "pillow",
    "click",
    "jinja2",
    "cryptography",
    "pytest",
    "attrs",
    "packaging",
    "wheel",
    "rich",
    "typing-extensions",
    "sqlalchemy",
    "pydantic",
    "fastapi",
    "aiohttp",
    "tqdm",
    "colorama",
    "beautifulsoup4",
    "lxml",
    "pytz",
    "httpx",
    "tornado",
    "redis",
    "greenlet",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requirements() {
        let manifest = parse_requirements(
            "# pinned\nrequests==2.31.0\nflask>=2.0  # web\nnumpy\n-r other.txt\nurllib3; python_version < '3.10'\n",
        );
        let names: Vec<&str> = manifest.dependencies.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["requests", "flask", "numpy", "urllib3"]);
        assert_eq!(manifest.dependencies[0].spec, "==2.31.0");
        assert_eq!(manifest.dependencies[2].spec, "");
    }

    #[test]
    fn test_parse_requirements_extras() {
        let manifest = parse_requirements("uvicorn[standard]>=0.23\n");
        assert_eq!(manifest.dependencies[0].name, "uvicorn");
        assert_eq!(manifest.dependencies[0].spec, ">=0.23");
    }

    #[test]
    fn test_parse_pyproject() {
        let manifest = parse_pyproject(
            r#"
            [project]
            name = "demo"
            version = "0.1.0"
            dependencies = ["requests>=2.0", "click"]

            [project.optional-dependencies]
            dev = ["pytest==7.4.0"]
            "#,
        )
        .unwrap();
        assert_eq!(
            manifest.root_package,
            Some(("demo".to_string(), "0.1.0".to_string()))
        );
        assert_eq!(manifest.dependencies.len(), 3);
        assert!(manifest
            .dependencies
            .iter()
            .any(|d| d.name == "pytest" && d.kind == DependencyKind::Optional));
    }

    #[test]
    fn test_parse_setup_py() {
        let manifest = parse_setup_py(
            r#"
from setuptools import setup
setup(
    name='demo',
    install_requires=['requests>=2.0', "six==1.16.0"],
)
            "#,
        );
        assert_eq!(manifest.dependencies.len(), 2);
        assert_eq!(manifest.scripts.len(), 1);
        assert!(!manifest.scripts[0].lifecycle);
    }

    #[test]
    fn test_setup_py_cmdclass_is_lifecycle() {
        let manifest = parse_setup_py("setup(cmdclass={'install': Evil})");
        assert!(manifest.scripts[0].lifecycle);
    }

    #[test]
    fn test_exact_pin() {
        assert_eq!(PyPiHandler.exact_pin("==2.31.0"), Some("2.31.0".to_string()));
        assert_eq!(PyPiHandler.exact_pin("===1.0"), Some("1.0".to_string()));
        assert_eq!(PyPiHandler.exact_pin("1.0.0"), Some("1.0.0".to_string()));
        assert_eq!(PyPiHandler.exact_pin(">=2.0"), None);
        assert_eq!(PyPiHandler.exact_pin("==2.*"), None);
        assert_eq!(PyPiHandler.exact_pin("~=1.4"), None);
    }

    #[test]
    fn test_registry_endpoints() {
        let endpoints =
            PyPiHandler.registry_endpoints("requests", Some("2.31.0"), "https://pypi.org");
        assert_eq!(
            endpoints.metadata_url,
            "https://pypi.org/pypi/requests/2.31.0/json"
        );
        assert_eq!(endpoints.latest_url, "https://pypi.org/pypi/requests/json");
    }
}
