//! Builds a new skill package from a natural-language goal: ask the model
//! for a structured tool design, render it to a `tool.yaml` + package
//! manifest, validate, install, and load — or feed the failure back to the
//! model and try again, up to a small bound.

use std::path::{Path, PathBuf};

use jedisos_llm::{CallOverrides, ChatMessage, LlmError, LlmRouter};
use jedisos_loader::{Loader, LoaderError};
use jedisos_packages::{PackageError, PackageManager, PackageMetadata, PackageType};
use jedisos_security::{
    Backend, HttpBackend, ParamDef, ParamType, SecurityChecker, SecurityReport, ShellBackend, ToolDef,
    ToolDefinitionFile,
};
use jedisos_tools::ToolHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Bounded retry budget: at most this many model round-trips per forge
/// request before giving up and surfacing the last failure.
const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("llm call failed: {0}")]
    Llm(#[from] LlmError),
    #[error("model did not return a usable tool design")]
    InvalidDesign,
    #[error("generated package failed security validation: {0:?}")]
    SecurityRejected(SecurityReport),
    #[error("package install failed: {0}")]
    Package(#[from] PackageError),
    #[error("loader rejected generated package: {0}")]
    Loader(#[from] LoaderError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("gave up after {attempts} attempt(s): {last_error}")]
    MaxAttemptsExceeded { attempts: usize, last_error: String },
}

#[derive(Debug, Clone)]
pub struct ForgeRequest {
    pub user_id: String,
    /// Natural-language description of the capability to build, taken
    /// from the triggering `create_tool` tool call's arguments.
    pub goal: String,
}

#[derive(Debug, Clone)]
pub struct ForgeOutcome {
    pub package_name: String,
    pub tool_name: String,
    pub attempts: usize,
    pub handles: Vec<ToolHandle>,
}

/// What the model is asked to emit as a fenced `json` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForgeDesign {
    tool_name: String,
    description: String,
    #[serde(default)]
    parameters: Vec<ForgeParam>,
    #[serde(default)]
    returns: Option<String>,
    backend_kind: String,
    #[serde(default)]
    http_method: Option<String>,
    #[serde(default)]
    url_template: Option<String>,
    #[serde(default)]
    command_template: Option<String>,
    #[serde(default)]
    env_required: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForgeParam {
    name: String,
    description: String,
    #[serde(rename = "type", default)]
    param_type: Option<String>,
    #[serde(default)]
    required: bool,
}

fn param_type_from_str(s: Option<&str>) -> Option<ParamType> {
    match s {
        Some("string") => Some(ParamType::String),
        Some("integer") => Some(ParamType::Integer),
        Some("number") => Some(ParamType::Number),
        Some("boolean") => Some(ParamType::Boolean),
        _ => None,
    }
}

fn design_to_tool_def(design: &ForgeDesign) -> Result<ToolDef, ForgeError> {
    let backend = match design.backend_kind.as_str() {
        "http" => {
            let method = design.http_method.clone().unwrap_or_else(|| "GET".to_string());
            let url_template = design.url_template.clone().ok_or(ForgeError::InvalidDesign)?;
            Backend::Http(HttpBackend { method, url_template })
        }
        "shell" => {
            let command_template = design.command_template.clone().ok_or(ForgeError::InvalidDesign)?;
            Backend::Shell(ShellBackend { command_template })
        }
        _ => return Err(ForgeError::InvalidDesign),
    };

    Ok(ToolDef {
        name: design.tool_name.clone(),
        description: design.description.clone(),
        params: design
            .parameters
            .iter()
            .map(|p| ParamDef {
                name: p.name.clone(),
                description: p.description.clone(),
                param_type: param_type_from_str(p.param_type.as_deref()),
                required: p.required,
            })
            .collect(),
        returns: param_type_from_str(design.returns.as_deref()),
        backend,
    })
}

const SYSTEM_PROMPT: &str = "You design small, single-purpose tools for an assistant's tool registry. \
Given a goal, respond with a short rationale followed by exactly one fenced ```json block containing an \
object with fields: tool_name (snake_case), description, parameters (array of {name, description, type, required}), \
returns (string|integer|number|boolean), backend_kind (\"http\" or \"shell\"), http_method and url_template \
(when backend_kind is \"http\"; url_template may reference parameters as {param_name}), command_template \
(when backend_kind is \"shell\"; same {param_name} substitution), and env_required (array of environment \
variable names the tool depends on, empty if none). Prefer the http backend; only use shell when no HTTP \
API can accomplish the goal.";

pub struct Forge {
    llm: LlmRouter,
    packages: PackageManager,
    loader: Loader,
    scratch_root: PathBuf,
}

impl Forge {
    pub fn new(llm: LlmRouter, packages: PackageManager, loader: Loader, scratch_root: impl Into<PathBuf>) -> Self {
        Self { llm, packages, loader, scratch_root: scratch_root.into() }
    }

    /// Runs the design → render → validate → install → load cycle, feeding
    /// each failure back to the model as conversation context for the next
    /// attempt. Returns the loaded (but not yet registered) tool handles —
    /// the caller registers them and notifies the user.
    pub async fn run(&self, request: &ForgeRequest) -> Result<ForgeOutcome, ForgeError> {
        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(request.goal.clone())];
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=MAX_ATTEMPTS {
            info!(attempt, user_id = %request.user_id, "forge attempt starting");
            match self.try_once(&mut messages, attempt).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    warn!(attempt, error = %err, "forge attempt failed");
                    last_error = err.to_string();
                    messages.push(ChatMessage::user(format!(
                        "That design failed validation: {last_error}. Revise the design and reply again with a corrected fenced json block."
                    )));
                }
            }
        }

        Err(ForgeError::MaxAttemptsExceeded { attempts: MAX_ATTEMPTS, last_error })
    }

    async fn try_once(&self, messages: &mut Vec<ChatMessage>, attempt: usize) -> Result<ForgeOutcome, ForgeError> {
        let response = self.llm.chat(messages, None, None, CallOverrides::default()).await?;
        messages.push(ChatMessage::assistant(response.content.clone()));

        let design: ForgeDesign = jedisos_llm::extract_json_output(&response.content).ok_or(ForgeError::InvalidDesign)?;
        let tool_def = design_to_tool_def(&design)?;
        let definition_file = ToolDefinitionFile { tools: vec![tool_def] };
        let tool_yaml = serde_yaml::to_string(&definition_file).map_err(|_| ForgeError::InvalidDesign)?;

        let checker = SecurityChecker::new(false);
        let report = checker.check(&tool_yaml);
        if !report.passed {
            return Err(ForgeError::SecurityRejected(report));
        }

        let metadata = PackageMetadata {
            name: design.tool_name.clone(),
            version: "0.1.0".to_string(),
            description: design.description.clone(),
            package_type: PackageType::Skills,
            license: "MIT".to_string(),
            author: "forge".to_string(),
            tags: vec!["generated".to_string()],
            dependencies: design.env_required.clone(),
        };
        let metadata_yaml = serde_yaml::to_string(&metadata).map_err(|_| ForgeError::InvalidDesign)?;

        let scratch_dir = self.scratch_root.join(format!("{}-{attempt}", design.tool_name));
        write_package(&scratch_dir, &metadata_yaml, &tool_yaml).await?;

        let info = self.packages.install_generated(&scratch_dir, false)?;
        let handles = self.loader.load_package(&info.path, &info.metadata.name)?;

        Ok(ForgeOutcome {
            package_name: info.metadata.name.clone(),
            tool_name: design.tool_name,
            attempts: attempt,
            handles,
        })
    }
}

async fn write_package(dir: &Path, metadata_yaml: &str, tool_yaml: &str) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(dir.join(jedisos_packages::METADATA_FILE), metadata_yaml).await?;
    tokio::fs::write(dir.join(jedisos_loader::TOOL_DEFINITION_FILE), tool_yaml).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jedisos_llm::{ChatProvider, ChatResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn http_design_converts_to_tool_def() {
        let design = ForgeDesign {
            tool_name: "get_weather".to_string(),
            description: "fetch current weather".to_string(),
            parameters: vec![ForgeParam {
                name: "city".to_string(),
                description: "city name".to_string(),
                param_type: Some("string".to_string()),
                required: true,
            }],
            returns: Some("string".to_string()),
            backend_kind: "http".to_string(),
            http_method: Some("GET".to_string()),
            url_template: Some("https://api.weather.example/v1/{city}".to_string()),
            command_template: None,
            env_required: vec![],
        };
        let tool_def = design_to_tool_def(&design).unwrap();
        assert_eq!(tool_def.name, "get_weather");
        assert!(matches!(tool_def.backend, Backend::Http(_)));
    }

    #[test]
    fn shell_design_without_command_template_is_invalid() {
        let design = ForgeDesign {
            tool_name: "broken".to_string(),
            description: "oops".to_string(),
            parameters: vec![],
            returns: None,
            backend_kind: "shell".to_string(),
            http_method: None,
            url_template: None,
            command_template: None,
            env_required: vec![],
        };
        let err = design_to_tool_def(&design).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidDesign));
    }

    #[test]
    fn unknown_backend_kind_is_invalid() {
        let design = ForgeDesign {
            tool_name: "mystery".to_string(),
            description: "?".to_string(),
            parameters: vec![],
            returns: None,
            backend_kind: "ftp".to_string(),
            http_method: None,
            url_template: None,
            command_template: None,
            env_required: vec![],
        };
        assert!(design_to_tool_def(&design).is_err());
    }

    /// First reply omits `url_template`, which `design_to_tool_def` rejects;
    /// second reply is a complete http design.
    struct RejectThenSucceed {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatProvider for RejectThenSucceed {
        async fn chat(
            &self,
            _entry: &jedisos_llm::LlmProviderEntry,
            _messages: &[ChatMessage],
            _tools: Option<&serde_json::Value>,
            _overrides: &CallOverrides,
        ) -> Result<ChatResponse, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let content = if call == 0 {
                r#"Here is a design.
```json
{"tool_name": "broken_tool", "description": "missing a url", "parameters": [], "backend_kind": "http"}
```"#
                    .to_string()
            } else {
                r#"Corrected design.
```json
{"tool_name": "get_stock_price", "description": "fetch a stock quote", "parameters": [{"name": "symbol", "description": "ticker symbol", "type": "string", "required": true}], "returns": "string", "backend_kind": "http", "http_method": "GET", "url_template": "https://api.example.com/quote/{symbol}", "env_required": []}
```"#
                    .to_string()
            };
            Ok(ChatResponse {
                model_id: "stub".to_string(),
                content,
                tool_calls: vec![],
                finish_reason: "stop".to_string(),
                usage: None,
            })
        }

        async fn chat_stream(
            &self,
            entry: &jedisos_llm::LlmProviderEntry,
            messages: &[ChatMessage],
            tools: Option<&serde_json::Value>,
            overrides: &CallOverrides,
            _tx: mpsc::Sender<String>,
        ) -> Result<ChatResponse, LlmError> {
            self.chat(entry, messages, tools, overrides).await
        }
    }

    #[tokio::test]
    async fn rejected_design_is_retried_and_second_attempt_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let packages_root = tmp.path().join("tools");
        let scratch_root = tmp.path().join("scratch");

        let provider = Arc::new(RejectThenSucceed { calls: AtomicUsize::new(0) });
        let llm = LlmRouter::new(provider, vec![jedisos_llm::LlmProviderEntry::new("stub-model", "http://unused")]);
        let packages = PackageManager::new(&packages_root);
        let loader = Loader::new(false);
        let forge = Forge::new(llm, packages, loader, &scratch_root);

        let request = ForgeRequest { user_id: "u1".to_string(), goal: "track a stock price".to_string() };
        let outcome = forge.run(&request).await.unwrap();

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.tool_name, "get_stock_price");
        assert_eq!(outcome.handles.len(), 1);
    }
}
