//! In-process map of callable tool handles keyed by name, with hot add/remove.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub r#type: ParamType,
    pub required: bool,
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
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

impl ToolSpec {
    /// Renders this spec as an OpenAI-compatible `tools` schema entry.
    pub fn to_llm_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            let type_name = match param.r#type {
                ParamType::String => "string",
                ParamType::Integer => "integer",
                ParamType::Number => "number",
                ParamType::Boolean => "boolean",
            };
            properties.insert(
                param.name.clone(),
                serde_json::json!({ "type": type_name, "description": param.description }),
            );
            if param.required {
                required.push(param.name.clone());
            }
        }
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                },
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

/// Where a registered handle's implementation came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageSource {
    Builtin,
    Package(String),
}

/// A tool the agent can invoke with structured, schema-validated arguments.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, args: &HashMap<String, serde_json::Value>) -> Result<ToolOutput>;
}

/// An entry in the registry: a spec plus where it came from and whether
/// it is currently callable.
pub struct ToolHandle {
    pub spec: ToolSpec,
    pub source: PackageSource,
    pub enabled: bool,
    implementation: Arc<dyn Tool>,
}

impl ToolHandle {
    pub fn new(implementation: Arc<dyn Tool>, source: PackageSource) -> Self {
        let spec = implementation.spec();
        Self { spec, source, enabled: true, implementation }
    }

    pub async fn invoke(&self, args: &HashMap<String, serde_json::Value>) -> Result<ToolOutput> {
        self.implementation.run(args).await
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a tool named '{0}' is already registered")]
    DuplicateName(String),
    #[error("no tool named '{0}' is registered")]
    NotFound(String),
    #[error("cannot remove builtin tool '{0}'")]
    BuiltinImmutable(String),
}

/// In-memory map from unique tool name to handle. Registration of a
/// duplicate name fails unless the caller passes `replace = true`.
#[derive(Default)]
pub struct ToolRegistry {
    handles: RwLock<HashMap<String, Arc<ToolHandle>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: ToolHandle, replace: bool) -> Result<(), RegistryError> {
        let mut handles = self.handles.write().await;
        let name = handle.spec.name.clone();
        if handles.contains_key(&name) && !replace {
            return Err(RegistryError::DuplicateName(name));
        }
        handles.insert(name, Arc::new(handle));
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let mut handles = self.handles.write().await;
        match handles.get(name).map(|h| h.source.clone()) {
            None => Err(RegistryError::NotFound(name.to_string())),
            Some(PackageSource::Builtin) => Err(RegistryError::BuiltinImmutable(name.to_string())),
            Some(PackageSource::Package(_)) => {
                handles.remove(name);
                Ok(())
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ToolHandle>> {
        self.handles.read().await.get(name).cloned()
    }

    /// A snapshot of every registered handle, for one agent iteration to
    /// hold without being surprised by a mid-iteration mutation.
    pub async fn list(&self) -> Vec<Arc<ToolHandle>> {
        self.handles.read().await.values().cloned().collect()
    }

    pub async fn list_schemas_for_llm(&self) -> serde_json::Value {
        let handles = self.handles.read().await;
        let schemas: Vec<serde_json::Value> = handles
            .values()
            .filter(|h| h.enabled)
            .map(|h| h.spec.to_llm_schema())
            .collect();
        serde_json::Value::Array(schemas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "echoes its input".to_string(),
                params: vec![ToolParam {
                    name: "text".to_string(),
                    description: "text to echo".to_string(),
                    r#type: ParamType::String,
                    required: true,
                }],
            }
        }

        async fn run(&self, args: &HashMap<String, serde_json::Value>) -> Result<ToolOutput> {
            let text = args.get("text").and_then(|v| v.as_str()).unwrap_or_default();
            Ok(ToolOutput { success: true, output: text.to_string() })
        }
    }

    fn echo_handle() -> ToolHandle {
        ToolHandle::new(Arc::new(Echo), PackageSource::Builtin)
    }

    #[tokio::test]
    async fn register_then_get() {
        let registry = ToolRegistry::new();
        registry.register(echo_handle(), false).await.unwrap();
        assert!(registry.get("echo").await.is_some());
    }

    #[tokio::test]
    async fn duplicate_registration_rejected_without_replace() {
        let registry = ToolRegistry::new();
        registry.register(echo_handle(), false).await.unwrap();
        let err = registry.register(echo_handle(), false).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(_)));
        // the registry still contains exactly one handle
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_allowed_with_replace() {
        let registry = ToolRegistry::new();
        registry.register(echo_handle(), false).await.unwrap();
        registry.register(echo_handle(), true).await.unwrap();
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn builtin_cannot_be_unregistered() {
        let registry = ToolRegistry::new();
        registry.register(echo_handle(), false).await.unwrap();
        let err = registry.unregister("echo").await.unwrap_err();
        assert!(matches!(err, RegistryError::BuiltinImmutable(_)));
    }

    #[tokio::test]
    async fn package_sourced_handle_can_be_unregistered() {
        let registry = ToolRegistry::new();
        let handle = ToolHandle::new(Arc::new(Echo), PackageSource::Package("weather".to_string()));
        registry.register(handle, false).await.unwrap();
        registry.unregister("echo").await.unwrap();
        assert!(registry.get("echo").await.is_none());
    }

    #[tokio::test]
    async fn unregister_unknown_fails() {
        let registry = ToolRegistry::new();
        let err = registry.unregister("nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn schemas_exclude_disabled_tools() {
        let registry = ToolRegistry::new();
        registry.register(echo_handle(), false).await.unwrap();
        let schemas = registry.list_schemas_for_llm().await;
        assert_eq!(schemas.as_array().unwrap().len(), 1);
    }
}
