// Plugin registry.
//
// Maps plugin ids to capability descriptors. Built-in plugins dispatch to a
// fixed set of handlers backed by the analysis engine; externally
// registered plugins are recorded only: remote execution needs an RPC
// contract this build does not carry.

use std::collections::HashMap;
use std::sync::Arc;

use atelier_common::types::{Capability, PluginDescriptor, TriggerMode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::engine::{AnalysisEngine, EngineError};

/// Plugin id of the built-in engine-backed analyzer.
pub const BUILTIN_ANALYZER: &str = "core-analyzer";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("no plugin registered under this id")]
    NotFound,
    #[error("plugin id `{0}` is reserved for a built-in plugin")]
    ReservedId(String),
    #[error("plugin `{0}` is registration-only; server-side execution is not supported")]
    ExecutionUnsupported(String),
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone)]
struct PluginRecord {
    descriptor: PluginDescriptor,
    /// Connection that registered the plugin; `None` for built-ins.
    registered_by: Option<Uuid>,
    builtin: bool,
}

pub struct PluginRegistry {
    engine: Arc<dyn AnalysisEngine>,
    plugins: RwLock<HashMap<String, PluginRecord>>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeParams {
    content: String,
    #[serde(default)]
    capabilities: Vec<Capability>,
}

impl PluginRegistry {
    /// Create the registry with the built-in analyzer pre-registered.
    pub fn with_builtins(engine: Arc<dyn AnalysisEngine>) -> Arc<Self> {
        let mut plugins = HashMap::new();
        plugins.insert(
            BUILTIN_ANALYZER.to_string(),
            PluginRecord {
                descriptor: PluginDescriptor {
                    name: "Core Analyzer".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    capabilities: Capability::ALL.to_vec(),
                },
                registered_by: None,
                builtin: true,
            },
        );
        Arc::new(Self { engine, plugins: RwLock::new(plugins) })
    }

    /// Register (or re-register) an external plugin. The latest registration
    /// for a plugin id wins; built-in ids cannot be shadowed.
    pub async fn register(
        &self,
        connection_id: Uuid,
        plugin_id: &str,
        descriptor: PluginDescriptor,
    ) -> Result<(), PluginError> {
        let mut guard = self.plugins.write().await;
        if guard.get(plugin_id).is_some_and(|record| record.builtin) {
            return Err(PluginError::ReservedId(plugin_id.to_string()));
        }
        guard.insert(
            plugin_id.to_string(),
            PluginRecord { descriptor, registered_by: Some(connection_id), builtin: false },
        );
        Ok(())
    }

    pub async fn descriptor(&self, plugin_id: &str) -> Option<PluginDescriptor> {
        self.plugins.read().await.get(plugin_id).map(|record| record.descriptor.clone())
    }

    /// Execute a plugin action. Built-ins run in-process against the engine;
    /// external plugins fail with `ExecutionUnsupported`.
    pub async fn execute(
        &self,
        _connection_id: Uuid,
        plugin_id: &str,
        action: &str,
        parameters: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError> {
        let record = {
            let guard = self.plugins.read().await;
            guard.get(plugin_id).cloned().ok_or(PluginError::NotFound)?
        };

        if !record.builtin {
            return Err(PluginError::ExecutionUnsupported(plugin_id.to_string()));
        }

        match action {
            "analyze" | "summarize" => {
                let params: AnalyzeParams = serde_json::from_value(parameters)
                    .map_err(|error| PluginError::InvalidParameters(error.to_string()))?;
                let report = self
                    .engine
                    .analyze(&params.content, &params.capabilities, TriggerMode::Immediate)
                    .await?;
                let value = if action == "summarize" {
                    serde_json::to_value(report.summary())
                } else {
                    serde_json::to_value(report)
                };
                value.map_err(|error| PluginError::InvalidParameters(error.to_string()))
            }
            "capabilities" => Ok(serde_json::json!({
                "capabilities": record.descriptor.capabilities,
            })),
            other => Err(PluginError::UnknownAction(other.to_string())),
        }
    }
}
