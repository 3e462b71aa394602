//! Static validation of a skill package's declarative tool definition.
//!
//! In a statically-compiled target, a hot-loaded "skill" is data (a
//! `tool.yaml` definition), not a source file to parse for dangerous
//! imports. The five checks from the source material are reinterpreted
//! against that data form: syntax, forbidden patterns in command/url
//! templates, backend allow-list, type-hint presence, and at-least-one-tool
//! presence.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub check: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityReport {
    pub findings: Vec<Finding>,
    pub passed: bool,
}

impl SecurityReport {
    fn from_findings(findings: Vec<Finding>) -> Self {
        let passed = !findings.iter().any(|f| f.severity == Severity::Fatal);
        Self { findings, passed }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub param_type: Option<ParamType>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBackend {
    pub method: String,
    pub url_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellBackend {
    pub command_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WasmBackend {
    pub module_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Http(HttpBackend),
    Shell(ShellBackend),
    Wasm(WasmBackend),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub params: Vec<ParamDef>,
    pub returns: Option<ParamType>,
    pub backend: Backend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinitionFile {
    #[serde(default)]
    pub tools: Vec<ToolDef>,
}

/// Parses a `tool.yaml` definition's raw text. A syntax failure is the
/// check-1 fatal case and short-circuits the remaining checks.
pub fn parse_tool_definition(raw: &str) -> Result<ToolDefinitionFile, Finding> {
    serde_yaml::from_str(raw).map_err(|err| Finding {
        check: "syntactic".to_string(),
        severity: Severity::Fatal,
        message: format!("tool.yaml failed to parse: {err}"),
    })
}

const FORBIDDEN_HOSTS: &[&str] = &["localhost", "127.", "169.254.", "10.", "192.168.", "0.0.0.0"];
const FORBIDDEN_SHELL_PATTERNS: &[&str] = &["; ", "&&", "`", "$(", "../", "/etc/"];

pub struct SecurityChecker {
    shell_allowed: bool,
    strict: bool,
}

impl SecurityChecker {
    pub fn new(shell_allowed: bool) -> Self {
        Self { shell_allowed, strict: false }
    }

    /// In strict mode, a missing type hint (check 4) is a fatal finding
    /// rather than a warning.
    pub fn strict(shell_allowed: bool) -> Self {
        Self { shell_allowed, strict: true }
    }

    /// Runs all five checks against a raw `tool.yaml` string and returns the
    /// combined report. `passed` is true iff no check produced a fatal
    /// finding.
    pub fn check(&self, raw: &str) -> SecurityReport {
        let mut findings = Vec::new();

        let definition = match parse_tool_definition(raw) {
            Ok(def) => def,
            Err(finding) => {
                findings.push(finding);
                return SecurityReport::from_findings(findings);
            }
        };
        findings.push(Finding {
            check: "syntactic".to_string(),
            severity: Severity::Warning,
            message: "parsed successfully".to_string(),
        });

        // Check 5 first: at least one tool entry.
        if definition.tools.is_empty() {
            findings.push(Finding {
                check: "decorator_presence".to_string(),
                severity: Severity::Fatal,
                message: "package declares no tools".to_string(),
            });
            return SecurityReport::from_findings(findings);
        }

        for tool in &definition.tools {
            self.check_forbidden_patterns(tool, &mut findings);
            self.check_backend_allow_list(tool, &mut findings);
            self.check_type_hints(tool, &mut findings);
        }

        findings.push(Finding {
            check: "decorator_presence".to_string(),
            severity: Severity::Warning,
            message: format!("{} tool(s) declared", definition.tools.len()),
        });

        SecurityReport::from_findings(findings)
    }

    fn check_forbidden_patterns(&self, tool: &ToolDef, findings: &mut Vec<Finding>) {
        match &tool.backend {
            Backend::Http(http) => {
                let url_re = Regex::new(r"\{[^}]+\}").unwrap();
                let stripped = url_re.replace_all(&http.url_template, "");
                let lower = stripped.to_lowercase();
                for host in FORBIDDEN_HOSTS {
                    if lower.contains(host) {
                        findings.push(Finding {
                            check: "forbidden_patterns".to_string(),
                            severity: Severity::Fatal,
                            message: format!("'{}' url targets an internal-network host ({host})", tool.name),
                        });
                    }
                }
            }
            Backend::Shell(shell) => {
                for pattern in FORBIDDEN_SHELL_PATTERNS {
                    if shell.command_template.contains(pattern) {
                        findings.push(Finding {
                            check: "forbidden_patterns".to_string(),
                            severity: Severity::Fatal,
                            message: format!("'{}' command contains forbidden pattern '{pattern}'", tool.name),
                        });
                    }
                }
            }
            Backend::Wasm(wasm) => {
                if wasm.module_path.contains("..") {
                    findings.push(Finding {
                        check: "forbidden_patterns".to_string(),
                        severity: Severity::Fatal,
                        message: format!("'{}' wasm module path escapes its package directory", tool.name),
                    });
                }
            }
        }
    }

    fn check_backend_allow_list(&self, tool: &ToolDef, findings: &mut Vec<Finding>) {
        if let Backend::Shell(_) = &tool.backend {
            if !self.shell_allowed {
                findings.push(Finding {
                    check: "import_allow_list".to_string(),
                    severity: Severity::Fatal,
                    message: format!("'{}' uses the shell backend, which this policy disallows", tool.name),
                });
            }
        }
    }

    fn check_type_hints(&self, tool: &ToolDef, findings: &mut Vec<Finding>) {
        let severity = if self.strict { Severity::Fatal } else { Severity::Warning };
        if tool.returns.is_none() {
            findings.push(Finding {
                check: "type_hint_presence".to_string(),
                severity,
                message: format!("'{}' has no declared return type", tool.name),
            });
        }
        for param in &tool.params {
            if param.param_type.is_none() {
                findings.push(Finding {
                    check: "type_hint_presence".to_string(),
                    severity,
                    message: format!("'{}' parameter '{}' has no declared type", tool.name, param.name),
                });
            }
        }
    }
}

/// Convenience: unique backend kinds present across a definition, used by
/// the package validator to decide whether a capability gate applies.
pub fn backend_kinds(def: &ToolDefinitionFile) -> HashSet<&'static str> {
    def.tools
        .iter()
        .map(|t| match t.backend {
            Backend::Http(_) => "http",
            Backend::Shell(_) => "shell",
            Backend::Wasm(_) => "wasm",
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_yaml() -> &'static str {
        r#"
tools:
  - name: get_weather
    description: fetch current weather
    params:
      - name: city
        description: city name
        type: string
        required: true
    returns: string
    backend:
      http:
        method: GET
        url_template: "https://api.weather.example/v1/{city}"
"#
    }

    #[test]
    fn valid_package_passes() {
        let checker = SecurityChecker::new(false);
        let report = checker.check(valid_yaml());
        assert!(report.passed, "{:?}", report.findings);
    }

    #[test]
    fn malformed_yaml_is_fatal() {
        let checker = SecurityChecker::new(false);
        let report = checker.check("not: valid: yaml: : :");
        assert!(!report.passed);
    }

    #[test]
    fn empty_tool_list_is_fatal() {
        let checker = SecurityChecker::new(false);
        let report = checker.check("tools: []");
        assert!(!report.passed);
    }

    #[test]
    fn shell_command_chaining_is_fatal() {
        let checker = SecurityChecker::new(true);
        let yaml = r#"
tools:
  - name: bad
    description: does something bad
    returns: string
    backend:
      shell:
        command_template: "echo hi && rm -rf /"
"#;
        let report = checker.check(yaml);
        assert!(!report.passed);
    }

    #[test]
    fn shell_backend_rejected_when_policy_disallows_shell() {
        let checker = SecurityChecker::new(false);
        let yaml = r#"
tools:
  - name: ok_shell
    description: harmless
    returns: string
    backend:
      shell:
        command_template: "echo hi"
"#;
        let report = checker.check(yaml);
        assert!(!report.passed);
    }

    #[test]
    fn internal_network_url_is_fatal() {
        let checker = SecurityChecker::new(false);
        let yaml = r#"
tools:
  - name: bad_url
    description: hits localhost
    returns: string
    backend:
      http:
        method: GET
        url_template: "http://localhost:8080/admin"
"#;
        let report = checker.check(yaml);
        assert!(!report.passed);
    }

    #[test]
    fn missing_type_hints_are_warnings_not_fatal() {
        let checker = SecurityChecker::new(false);
        let yaml = r#"
tools:
  - name: loose
    description: no types declared
    params:
      - name: q
        description: query
        required: true
    backend:
      http:
        method: GET
        url_template: "https://api.example.com/search?q={q}"
"#;
        let report = checker.check(yaml);
        assert!(report.passed);
        assert!(report.findings.iter().any(|f| f.check == "type_hint_presence"));
    }

    #[test]
    fn missing_type_hints_are_fatal_in_strict_mode() {
        let checker = SecurityChecker::strict(false);
        let yaml = r#"
tools:
  - name: loose
    description: no types declared
    params:
      - name: q
        description: query
        required: true
    backend:
      http:
        method: GET
        url_template: "https://api.example.com/search?q={q}"
"#;
        let report = checker.check(yaml);
        assert!(!report.passed);
        assert!(report
            .findings
            .iter()
            .any(|f| f.check == "type_hint_presence" && f.severity == Severity::Fatal));
    }
}
