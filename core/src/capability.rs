//! Capability registry
//!
//! Declares the externally-executable actions (connectors and tools) agents
//! may invoke, and owns their connection status. Real execution goes through
//! an optional backend; mock execution returns a deterministic synthetic
//! payload for demo and offline operation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    None,
    ApiKey,
    OAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

/// A single named action a capability exposes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A connector or tool with its declared actions and live status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub name: String,
    pub category: String,
    pub auth: AuthKind,
    pub actions: Vec<ActionSpec>,
    pub status: ConnectionStatus,
}

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("unknown action {action} on capability {capability}")]
    UnknownAction { capability: String, action: String },

    #[error("capability {capability} is not connected ({status:?})")]
    NotConnected {
        capability: String,
        status: ConnectionStatus,
    },

    #[error("backend failure on {capability}.{action}: {message}")]
    BackendFailure {
        capability: String,
        action: String,
        message: String,
    },
}

impl CapabilityError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendFailure { .. })
    }
}

/// Executes real capability actions against an external system
#[async_trait::async_trait]
pub trait CapabilityBackend: Send + Sync {
    async fn execute(
        &self,
        capability: &Capability,
        action: &str,
        params: &Value,
    ) -> Result<Value, CapabilityError>;
}

/// Registry of all capabilities assigned across the runtime
pub struct CapabilityRegistry {
    capabilities: Mutex<HashMap<String, Capability>>,
    backend: Option<Arc<dyn CapabilityBackend>>,
    /// When true, a connected capability whose backend call fails falls back
    /// to mock output instead of propagating. Demo-only.
    mock_fallback: bool,
}

impl CapabilityRegistry {
    pub fn new(mock_fallback: bool) -> Self {
        Self {
            capabilities: Mutex::new(HashMap::new()),
            backend: None,
            mock_fallback,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn CapabilityBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn register(&self, capability: Capability) {
        self.capabilities
            .lock()
            .insert(capability.id.clone(), capability);
    }

    pub fn get(&self, id: &str) -> Option<Capability> {
        self.capabilities.lock().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Capability> {
        let mut all: Vec<Capability> = self.capabilities.lock().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn set_status(&self, id: &str, status: ConnectionStatus) {
        if let Some(capability) = self.capabilities.lock().get_mut(id) {
            capability.status = status;
        }
    }

    /// Execute an action. Fails fast on unknown capability/action or a
    /// non-connected capability. Without a backend the registry runs in
    /// offline mode and serves mock output.
    pub async fn execute(
        &self,
        capability_id: &str,
        action_id: &str,
        params: &Value,
    ) -> Result<Value, CapabilityError> {
        let capability = self
            .get(capability_id)
            .ok_or_else(|| CapabilityError::UnknownCapability(capability_id.to_string()))?;

        if !capability.actions.iter().any(|a| a.id == action_id) {
            return Err(CapabilityError::UnknownAction {
                capability: capability_id.to_string(),
                action: action_id.to_string(),
            });
        }

        if capability.status != ConnectionStatus::Connected {
            return Err(CapabilityError::NotConnected {
                capability: capability_id.to_string(),
                status: capability.status,
            });
        }

        let Some(backend) = &self.backend else {
            tracing::debug!(capability_id, action_id, "no backend, serving mock result");
            return Ok(Self::mock_payload(capability_id, action_id, params));
        };

        match backend.execute(&capability, action_id, params).await {
            Ok(result) => Ok(result),
            Err(e) if self.mock_fallback => {
                tracing::warn!(
                    capability_id,
                    action_id,
                    error = %e,
                    "backend failed, falling back to mock result"
                );
                Ok(Self::mock_payload(capability_id, action_id, params))
            }
            Err(e) => Err(e),
        }
    }

    /// Deterministic synthetic result for demo/offline operation
    pub fn mock_execute(
        &self,
        capability_id: &str,
        action_id: &str,
        params: &Value,
    ) -> Result<Value, CapabilityError> {
        let capability = self
            .get(capability_id)
            .ok_or_else(|| CapabilityError::UnknownCapability(capability_id.to_string()))?;

        if !capability.actions.iter().any(|a| a.id == action_id) {
            return Err(CapabilityError::UnknownAction {
                capability: capability_id.to_string(),
                action: action_id.to_string(),
            });
        }

        Ok(Self::mock_payload(capability_id, action_id, params))
    }

    fn mock_payload(capability_id: &str, action_id: &str, params: &Value) -> Value {
        json!({
            "success": true,
            "mock": true,
            "capability": capability_id,
            "action": action_id,
            "params": params,
        })
    }
}

/// A small built-in capability set for demos and tests
pub fn demo_capabilities() -> Vec<Capability> {
    vec![
        Capability {
            id: "mail".to_string(),
            name: "Mail".to_string(),
            category: "communication".to_string(),
            auth: AuthKind::OAuth,
            actions: vec![ActionSpec {
                id: "send".to_string(),
                name: "Send mail".to_string(),
                description: "Send an email message".to_string(),
            }],
            status: ConnectionStatus::Connected,
        },
        Capability {
            id: "http".to_string(),
            name: "HTTP".to_string(),
            category: "network".to_string(),
            auth: AuthKind::None,
            actions: vec![ActionSpec {
                id: "get".to_string(),
                name: "HTTP GET".to_string(),
                description: "Fetch a URL".to_string(),
            }],
            status: ConnectionStatus::Connected,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CapabilityRegistry {
        let registry = CapabilityRegistry::new(false);
        for capability in demo_capabilities() {
            registry.register(capability);
        }
        registry
    }

    #[tokio::test]
    async fn test_unknown_capability_fails_fast() {
        let registry = registry();
        let err = registry.execute("nope", "send", &json!({})).await;
        assert!(matches!(err, Err(CapabilityError::UnknownCapability(_))));
    }

    #[tokio::test]
    async fn test_unknown_action_fails_fast() {
        let registry = registry();
        let err = registry.execute("mail", "teleport", &json!({})).await;
        assert!(matches!(err, Err(CapabilityError::UnknownAction { .. })));
    }

    #[tokio::test]
    async fn test_disconnected_capability_denied() {
        let registry = registry();
        registry.set_status("mail", ConnectionStatus::Disconnected);

        let err = registry.execute("mail", "send", &json!({})).await;
        assert!(matches!(err, Err(CapabilityError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_offline_mode_serves_mock() {
        let registry = registry();
        let result = registry
            .execute("mail", "send", &json!({"to": "ops"}))
            .await
            .unwrap();
        assert_eq!(result["mock"], json!(true));
        assert_eq!(result["params"]["to"], json!("ops"));
    }

    struct FailingBackend;

    #[async_trait::async_trait]
    impl CapabilityBackend for FailingBackend {
        async fn execute(
            &self,
            capability: &Capability,
            action: &str,
            _params: &Value,
        ) -> Result<Value, CapabilityError> {
            Err(CapabilityError::BackendFailure {
                capability: capability.id.clone(),
                action: action.to_string(),
                message: "boom".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_backend_failure_propagates_without_fallback() {
        let registry = CapabilityRegistry::new(false).with_backend(Arc::new(FailingBackend));
        for capability in demo_capabilities() {
            registry.register(capability);
        }

        let err = registry.execute("mail", "send", &json!({})).await;
        assert!(matches!(err, Err(CapabilityError::BackendFailure { .. })));
    }

    #[tokio::test]
    async fn test_backend_failure_masked_when_fallback_enabled() {
        let registry = CapabilityRegistry::new(true).with_backend(Arc::new(FailingBackend));
        for capability in demo_capabilities() {
            registry.register(capability);
        }

        let result = registry.execute("mail", "send", &json!({})).await.unwrap();
        assert_eq!(result["mock"], json!(true));
    }
}
