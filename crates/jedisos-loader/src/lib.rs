//! Turns a validated `tool.yaml` package on disk into callable [`Tool`]
//! handles the caller registers with a [`jedisos_tools::ToolRegistry`].
//!
//! The loader never registers anything itself — package install/forge/agent
//! callers decide whether a handle shadows a builtin or a prior package
//! version. Three backends are supported, one dispatcher each:
//! `http` (reqwest), `shell` (gated `tokio::process::Command`), and `wasm`
//! (a Wasmtime/WASIP1 guest, stdio-JSON, one fresh instance per call).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use wasmtime::{Config, Engine, Linker, Module, Store};
use wasmtime_wasi::preview1::{add_to_linker_sync, WasiP1Ctx};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::WasiCtxBuilder;

use jedisos_security::{Backend, ParamDef, ParamType as SecParamType, SecurityChecker, ToolDef};
use jedisos_tools::{PackageSource, ParamType, Tool, ToolHandle, ToolOutput, ToolParam, ToolSpec};

pub const TOOL_DEFINITION_FILE: &str = "tool.yaml";

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("security check rejected package: {0:?}")]
    SecurityRejected(jedisos_security::SecurityReport),
    #[error("wasm module '{0}' failed to load")]
    WasmLoad(String),
    #[error("unsupported http method '{0}'")]
    UnsupportedMethod(String),
}

fn io_err(path: &Path, source: std::io::Error) -> LoaderError {
    LoaderError::Io { path: path.display().to_string(), source }
}

fn to_security_severity_allows_shell(shell_allowed: bool) -> SecurityChecker {
    SecurityChecker::new(shell_allowed)
}

fn param_type_from(security_type: Option<SecParamType>) -> ParamType {
    match security_type {
        Some(SecParamType::String) | None => ParamType::String,
        Some(SecParamType::Integer) => ParamType::Integer,
        Some(SecParamType::Number) => ParamType::Number,
        Some(SecParamType::Boolean) => ParamType::Boolean,
    }
}

fn spec_from(def: &ToolDef) -> ToolSpec {
    ToolSpec {
        name: def.name.clone(),
        description: def.description.clone(),
        params: def
            .params
            .iter()
            .map(|p: &ParamDef| ToolParam {
                name: p.name.clone(),
                description: p.description.clone(),
                r#type: param_type_from(p.param_type),
                required: p.required,
            })
            .collect(),
    }
}

fn render_template(template: &str, args: &HashMap<String, serde_json::Value>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in args {
        let placeholder = format!("{{{key}}}");
        let value_str = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &value_str);
    }
    rendered
}

// ── http backend ────────────────────────────────────────────────────────────

struct HttpDynamicTool {
    spec: ToolSpec,
    method: reqwest::Method,
    url_template: String,
    client: reqwest::Client,
}

#[async_trait]
impl Tool for HttpDynamicTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn run(&self, args: &HashMap<String, serde_json::Value>) -> Result<ToolOutput> {
        let url = render_template(&self.url_template, args);
        let response = self
            .client
            .request(self.method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("request to '{url}' failed"))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Ok(ToolOutput { success: status.is_success(), output: body })
    }
}

// ── shell backend ────────────────────────────────────────────────────────────

/// Only constructible when the caller's policy allows the shell backend;
/// the security checker already refuses to load a package that declares a
/// shell tool under a policy that disallows it, so this is a second,
/// cheap gate rather than the only one.
struct ShellDynamicTool {
    spec: ToolSpec,
    command_template: String,
}

#[async_trait]
impl Tool for ShellDynamicTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn run(&self, args: &HashMap<String, serde_json::Value>) -> Result<ToolOutput> {
        let command = render_template(&self.command_template, args);
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .await
            .with_context(|| format!("failed to spawn shell command '{command}'"))?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        Ok(ToolOutput { success: output.status.success(), output: combined })
    }
}

// ── wasm backend ─────────────────────────────────────────────────────────────

struct State {
    wasi: WasiP1Ctx,
}

/// One compiled guest module per tool, re-instantiated for every call —
/// mirrors the host's stateless one-shot execution model so a WASM tool
/// cannot retain state across invocations.
struct WasmDynamicTool {
    spec: ToolSpec,
    engine: Engine,
    module: Module,
}

impl WasmDynamicTool {
    fn load(spec: ToolSpec, module_path: &Path) -> Result<Self, LoaderError> {
        let wasm_bytes = std::fs::read(module_path).map_err(|e| io_err(module_path, e))?;

        let mut config = Config::new();
        config.async_support(false);
        let engine = Engine::new(&config)
            .map_err(|e| LoaderError::WasmLoad(format!("engine init failed: {e}")))?;
        let module = Module::new(&engine, &wasm_bytes)
            .map_err(|e| LoaderError::WasmLoad(format!("module compile failed: {e}")))?;

        Ok(Self { spec, engine, module })
    }

    fn run_sync(&self, args: &HashMap<String, serde_json::Value>) -> Result<ToolOutput> {
        let stdin_bytes = bytes::Bytes::from(serde_json::to_vec(args)?);

        let stdout_pipe = MemoryOutputPipe::new(64 * 1024);
        let stderr_pipe = MemoryOutputPipe::new(4 * 1024);

        let wasi = WasiCtxBuilder::new()
            .stdin(MemoryInputPipe::new(stdin_bytes))
            .stdout(stdout_pipe.clone())
            .stderr(stderr_pipe.clone())
            .build_p1();

        let mut store = Store::new(&self.engine, State { wasi });
        let mut linker: Linker<State> = Linker::new(&self.engine);
        add_to_linker_sync(&mut linker, |s: &mut State| &mut s.wasi)?;

        let instance = linker.instantiate(&mut store, &self.module)?;
        let start = instance.get_typed_func::<(), ()>(&mut store, "_start")?;
        let _ = start.call(&mut store, ());

        drop(store);

        let stdout_contents = stdout_pipe.contents();

        #[derive(Deserialize)]
        struct GuestOutput {
            success: bool,
            output: String,
        }

        match serde_json::from_slice::<GuestOutput>(&stdout_contents) {
            Ok(out) => Ok(ToolOutput { success: out.success, output: out.output }),
            Err(parse_err) => {
                let raw = String::from_utf8_lossy(&stdout_contents);
                let stderr_raw = String::from_utf8_lossy(&stderr_pipe.contents());
                warn!(tool = %self.spec.name, ?parse_err, %raw, %stderr_raw, "wasm guest produced non-JSON stdout");
                Ok(ToolOutput {
                    success: false,
                    output: format!(
                        "wasm tool '{}' returned unexpected output: {}",
                        self.spec.name,
                        if raw.is_empty() { "(empty)" } else { &raw }
                    ),
                })
            }
        }
    }
}

#[async_trait]
impl Tool for WasmDynamicTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn run(&self, args: &HashMap<String, serde_json::Value>) -> Result<ToolOutput> {
        let engine = self.engine.clone();
        let module = self.module.clone();
        let spec = self.spec.clone();
        let args_owned = args.clone();

        tokio::task::spawn_blocking(move || {
            let tool = WasmDynamicTool { spec, engine, module };
            tool.run_sync(&args_owned)
        })
        .await
        .map_err(|e| anyhow!("wasm blocking task panicked: {e}"))?
    }
}

// ── loader ───────────────────────────────────────────────────────────────────

pub struct Loader {
    shell_allowed: bool,
    http_client: reqwest::Client,
}

impl Loader {
    pub fn new(shell_allowed: bool) -> Self {
        Self { shell_allowed, http_client: reqwest::Client::new() }
    }

    /// Reads `<package_dir>/tool.yaml`, runs it through the security
    /// checker, and — only if it passes — builds one [`ToolHandle`] per
    /// declared tool. The caller is responsible for registering the
    /// returned handles.
    pub fn load_package(&self, package_dir: &Path, package_name: &str) -> Result<Vec<ToolHandle>, LoaderError> {
        let definition_path = package_dir.join(TOOL_DEFINITION_FILE);
        let raw = std::fs::read_to_string(&definition_path).map_err(|e| io_err(&definition_path, e))?;

        let checker = to_security_severity_allows_shell(self.shell_allowed);
        let report = checker.check(&raw);
        if !report.passed {
            return Err(LoaderError::SecurityRejected(report));
        }

        let definition = jedisos_security::parse_tool_definition(&raw)
            .map_err(|finding| LoaderError::SecurityRejected(jedisos_security::SecurityReport { findings: vec![finding], passed: false }))?;

        let mut handles = Vec::with_capacity(definition.tools.len());
        for tool_def in &definition.tools {
            let spec = spec_from(tool_def);
            let implementation: Arc<dyn Tool> = match &tool_def.backend {
                Backend::Http(http) => {
                    let method = reqwest::Method::from_bytes(http.method.as_bytes())
                        .map_err(|_| LoaderError::UnsupportedMethod(http.method.clone()))?;
                    Arc::new(HttpDynamicTool {
                        spec,
                        method,
                        url_template: http.url_template.clone(),
                        client: self.http_client.clone(),
                    })
                }
                Backend::Shell(shell) => {
                    Arc::new(ShellDynamicTool { spec, command_template: shell.command_template.clone() })
                }
                Backend::Wasm(wasm) => {
                    let module_path = package_dir.join(&wasm.module_path);
                    Arc::new(WasmDynamicTool::load(spec, &module_path)?)
                }
            };
            handles.push(ToolHandle::new(implementation, PackageSource::Package(package_name.to_string())));
        }

        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_package(dir: &Path, yaml: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let mut file = std::fs::File::create(dir.join(TOOL_DEFINITION_FILE)).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn http_backend_builds_a_runnable_handle() {
        let tmp = tempfile::tempdir().unwrap();
        write_package(
            tmp.path(),
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
"#,
        );
        let loader = Loader::new(false);
        let handles = loader.load_package(tmp.path(), "weather").unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].spec.name, "get_weather");
    }

    #[tokio::test]
    async fn shell_backend_rejected_when_policy_disallows() {
        let tmp = tempfile::tempdir().unwrap();
        write_package(
            tmp.path(),
            r#"
tools:
  - name: run_it
    description: runs a thing
    returns: string
    backend:
      shell:
        command_template: "echo hi"
"#,
        );
        let loader = Loader::new(false);
        let err = loader.load_package(tmp.path(), "shelly").unwrap_err();
        assert!(matches!(err, LoaderError::SecurityRejected(_)));
    }

    #[tokio::test]
    async fn shell_backend_builds_a_runnable_handle_when_allowed() {
        let tmp = tempfile::tempdir().unwrap();
        write_package(
            tmp.path(),
            r#"
tools:
  - name: run_it
    description: runs a thing
    returns: string
    backend:
      shell:
        command_template: "echo {message}"
"#,
        );
        let loader = Loader::new(true);
        let handles = loader.load_package(tmp.path(), "shelly").unwrap();
        let mut args = HashMap::new();
        args.insert("message".to_string(), serde_json::json!("hello"));
        let output = handles[0].invoke(&args).await.unwrap();
        assert!(output.success);
        assert!(output.output.contains("hello"));
    }

    #[tokio::test]
    async fn malformed_package_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_package(tmp.path(), "tools: []");
        let loader = Loader::new(false);
        let err = loader.load_package(tmp.path(), "empty").unwrap_err();
        assert!(matches!(err, LoaderError::SecurityRejected(_)));
    }
}
