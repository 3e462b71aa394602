//! Wires every crate into one process-wide [`jedisos_engine::Engine`] from
//! environment variables, mirroring the source material's env-driven
//! provider/credentials setup without pulling in a config-file parser
//! (parsing config files is a caller concern, not the core's).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use jedisos_agent::Agent;
use jedisos_engine::Engine;
use jedisos_engine::SessionManager;
use jedisos_forge::Forge;
use jedisos_identity::Identity;
use jedisos_llm::{HttpChatProvider, LlmProviderEntry, LlmRouter};
use jedisos_loader::Loader;
use jedisos_memory::MemoryClient;
use jedisos_packages::PackageManager;
use jedisos_policy::{AuditSink, JsonlAuditSink, Policy, PolicyDecisionPoint};
use jedisos_tools::ToolRegistry;

/// Root directory the daemon/CLI keeps its own state under, mirroring the
/// teacher's `.aigent/` convention.
pub fn state_dir() -> PathBuf {
    PathBuf::from(std::env::var("JEDISOS_STATE_DIR").unwrap_or_else(|_| ".jedisos".to_string()))
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Builds the ordered LLM fallback chain from `JEDISOS_LLM_PROVIDERS`, a
/// comma-separated `model_id@base_url` list, falling back to a single
/// localhost Ollama-shaped entry for a zero-config first run.
fn provider_chain() -> Vec<LlmProviderEntry> {
    let raw = std::env::var("JEDISOS_LLM_PROVIDERS").ok();
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return vec![LlmProviderEntry::new("llama3.1:8b", "http://localhost:11434/v1")];
    };

    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|part| {
            let mut entry = match part.split_once('@') {
                Some((model_id, base_url)) => LlmProviderEntry::new(model_id.trim(), base_url.trim()),
                None => LlmProviderEntry::new(part.trim(), "http://localhost:11434/v1"),
            };
            entry.credentials_env = Some(format!("{}_API_KEY", sanitize_env_key(&entry.model_id)));
            entry
        })
        .collect()
}

fn sanitize_env_key(model_id: &str) -> String {
    model_id.chars().map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' }).collect()
}

fn policy_from_env() -> Policy {
    let mut policy = Policy::allow_all(env_or("JEDISOS_MAX_REQUESTS_PER_MINUTE", "60").parse().unwrap_or(60));
    if let Ok(blocked) = std::env::var("JEDISOS_BLOCKED_TOOLS") {
        policy.blocked_tools = blocked.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect();
    }
    if let Ok(allowed) = std::env::var("JEDISOS_ALLOWED_TOOLS") {
        policy.allowed_tools = allowed.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect();
    }
    policy
}

/// Constructs the full `Engine`, scanning `tools/` for packages and loading
/// each skill's handles into the registry before any request is served.
pub async fn build_engine() -> Result<Engine> {
    let root = state_dir();
    let packages_root = PathBuf::from(env_or("JEDISOS_PACKAGES_ROOT", "tools"));

    let identity = match std::env::var("JEDISOS_IDENTITY_FILE") {
        Ok(path) => Identity::from_file(&path).with_context(|| format!("reading identity file {path}"))?,
        Err(_) => Identity::default(),
    };

    let memory_base_url = env_or("JEDISOS_MEMORY_URL", "http://localhost:8765");
    let memory = MemoryClient::new(memory_base_url);

    let providers = provider_chain();
    let provider = Arc::new(HttpChatProvider::new());
    let agent_llm = LlmRouter::new(provider.clone(), providers.clone());
    let forge_llm = LlmRouter::new(provider, providers);

    let tools = Arc::new(ToolRegistry::new());
    let packages = PackageManager::new(&packages_root);
    let shell_allowed = std::env::var("JEDISOS_ALLOW_SHELL_TOOLS").map(|v| v == "1").unwrap_or(false);
    let loader = Loader::new(shell_allowed);

    load_installed_packages(&packages, &loader, &tools).await;

    let pdp = PolicyDecisionPoint::new(policy_from_env());
    let audit: Arc<dyn AuditSink> = Arc::new(JsonlAuditSink::new(root.join("audit.jsonl")));

    let agent = Agent::new(agent_llm, tools.clone(), memory, pdp, audit);
    let forge_loader = Loader::new(shell_allowed);
    let forge = Forge::new(forge_llm, packages, forge_loader, root.join("forge-scratch"));
    let sessions = SessionManager::new();

    Ok(Engine::new(agent, forge, tools, identity, sessions))
}

/// Scans every typed package directory and loads each skill's `tool.yaml`,
/// registering every handle it produces. A package that fails to scan or
/// load is logged and skipped — one bad package never blocks startup.
async fn load_installed_packages(packages: &PackageManager, loader: &Loader, tools: &Arc<ToolRegistry>) {
    for info in packages.scan() {
        if info.metadata.package_type != jedisos_packages::PackageType::Skills {
            continue;
        }
        match loader.load_package(&info.path, &info.metadata.name) {
            Ok(handles) => {
                for handle in handles {
                    let name = handle.spec.name.clone();
                    if let Err(err) = tools.register(handle, false).await {
                        tracing::warn!(package = %info.metadata.name, tool = name, error = %err, "skipping duplicate tool from package scan");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(package = %info.metadata.name, error = %err, "skill package failed to load");
            }
        }
    }
}
