//! Self-healing engine
//!
//! Classifies a failure into a small taxonomy, builds an analysis (optionally
//! refined by the model), and attempts an automated repair strategy per
//! class. Every attempt is recorded; repair itself never throws.

use std::sync::Arc;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use uuid::Uuid;

use crate::capability::{AuthKind, CapabilityRegistry, ConnectionStatus};
use crate::config::RetryPolicy;
use crate::llm::{ChatMessage, ChatModel, ChatRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Network,
    Auth,
    Validation,
    RateLimit,
    SchemaMismatch,
    NotFound,
    Permission,
    ServerError,
    Unknown,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Network => "network",
            ErrorClass::Auth => "auth",
            ErrorClass::Validation => "validation",
            ErrorClass::RateLimit => "rate-limit",
            ErrorClass::SchemaMismatch => "schema-mismatch",
            ErrorClass::NotFound => "not-found",
            ErrorClass::Permission => "permission",
            ErrorClass::ServerError => "server-error",
            ErrorClass::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    Detected,
    Analyzing,
    Repairing,
    Resolved,
    Failed,
}

impl RepairStatus {
    fn is_terminal(self) -> bool {
        matches!(self, RepairStatus::Resolved | RepairStatus::Failed)
    }
}

/// Audit trail of one healing attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRecord {
    pub id: String,
    pub agent_id: String,
    pub error_class: ErrorClass,
    pub error_message: String,
    pub analysis: String,
    pub repair_action: String,
    pub status: RepairStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Ordered classification rules; first match wins, default is unknown
fn rules() -> &'static [(ErrorClass, Regex)] {
    static RULES: OnceLock<Vec<(ErrorClass, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        let table: [(ErrorClass, &str); 8] = [
            (
                ErrorClass::Network,
                r"(?i)network|connection|unreachable|dns|socket|refused",
            ),
            (
                ErrorClass::Auth,
                r"(?i)unauthorized|auth|token expired|invalid credentials|401",
            ),
            (
                ErrorClass::Validation,
                r"(?i)validation|invalid input|malformed|bad request|400",
            ),
            (
                ErrorClass::RateLimit,
                r"(?i)rate limit|too many requests|429|quota",
            ),
            (
                ErrorClass::SchemaMismatch,
                r"(?i)schema|missing field|unexpected type|deserializ",
            ),
            (ErrorClass::NotFound, r"(?i)not found|no such|missing|404"),
            (
                ErrorClass::Permission,
                r"(?i)permission|forbidden|denied|403",
            ),
            (
                ErrorClass::ServerError,
                r"(?i)server error|internal error|500|502|503|504",
            ),
        ];
        table
            .into_iter()
            .map(|(class, pattern)| (class, Regex::new(pattern).expect("valid rule pattern")))
            .collect()
    })
}

/// Best-effort classification of an error message
pub fn classify(error_text: &str) -> ErrorClass {
    for (class, pattern) in rules() {
        if pattern.is_match(error_text) {
            return *class;
        }
    }
    ErrorClass::Unknown
}

fn default_strategy(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Network => "Transient network failure. Retry with exponential backoff.",
        ErrorClass::Auth => "Credentials rejected. Reconnection by the operator is required.",
        ErrorClass::Validation => "Request payload failed validation. Reshape the data and retry.",
        ErrorClass::RateLimit => "Provider rate limit hit. Wait out the cooldown before retrying.",
        ErrorClass::SchemaMismatch => {
            "Response did not match the expected schema. Reshape the data mapping."
        }
        ErrorClass::NotFound => "Referenced resource does not exist. Check identifiers.",
        ErrorClass::Permission => "Caller lacks permission for this action.",
        ErrorClass::ServerError => "Upstream server fault. Retry with exponential backoff.",
        ErrorClass::Unknown => "Unrecognized failure. Manual investigation required.",
    }
}

/// Append-only log of repair attempts
#[derive(Default)]
pub struct RepairLog {
    records: Mutex<Vec<RepairRecord>>,
}

impl RepairLog {
    fn push(&self, record: RepairRecord) {
        self.records.lock().push(record);
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut RepairRecord)) {
        let mut records = self.records.lock();
        if let Some(record) = records.iter_mut().find(|r| r.id == id) {
            // Terminal states never regress
            if !record.status.is_terminal() {
                f(record);
            }
        }
    }

    pub fn records(&self) -> Vec<RepairRecord> {
        self.records.lock().clone()
    }

    pub fn recent(&self, n: usize) -> Vec<RepairRecord> {
        let records = self.records.lock();
        records.iter().rev().take(n).rev().cloned().collect()
    }

    /// resolved / total; exactly 0 with no repairs
    pub fn success_rate(&self) -> f64 {
        let records = self.records.lock();
        if records.is_empty() {
            return 0.0;
        }
        let resolved = records
            .iter()
            .filter(|r| r.status == RepairStatus::Resolved)
            .count();
        resolved as f64 / records.len() as f64
    }
}

pub struct HealingEngine {
    log: Arc<RepairLog>,
    model: Option<Arc<dyn ChatModel>>,
    registry: Arc<CapabilityRegistry>,
    backoff: RetryPolicy,
    model_name: String,
}

impl HealingEngine {
    pub fn new(registry: Arc<CapabilityRegistry>, backoff: RetryPolicy) -> Self {
        Self {
            log: Arc::new(RepairLog::default()),
            model: None,
            registry,
            backoff,
            model_name: "default".to_string(),
        }
    }

    pub fn with_model(mut self, model: Arc<dyn ChatModel>, model_name: impl Into<String>) -> Self {
        self.model = Some(model);
        self.model_name = model_name.into();
        self
    }

    pub fn log(&self) -> Arc<RepairLog> {
        self.log.clone()
    }

    /// Build the analysis text: the fixed per-class strategy, optionally
    /// refined by the model. Model unavailability silently keeps the default.
    pub async fn analyze(&self, class: ErrorClass, error_message: &str) -> String {
        let default = format!("[{}] {}", class, default_strategy(class));

        let Some(model) = &self.model else {
            return default;
        };

        let request = ChatRequest::new(
            self.model_name.clone(),
            vec![ChatMessage::user(format!(
                "An autonomous agent hit this error (classified {class}): {error_message}\n\
                 In two sentences, state the likely cause and the safest automated fix."
            ))],
        );

        match model.chat(&request).await {
            Ok(response) if !response.content().trim().is_empty() => response.content(),
            _ => default,
        }
    }

    /// Run the full healing pass: classify, analyze, attempt repair. Always
    /// returns a terminal record; failures inside repair are caught and
    /// recorded rather than re-thrown.
    pub async fn heal(
        &self,
        agent_id: &str,
        error_message: &str,
        capability_hint: Option<&str>,
    ) -> RepairRecord {
        let class = classify(error_message);
        let mut record = RepairRecord {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            error_class: class,
            error_message: error_message.to_string(),
            analysis: String::new(),
            repair_action: String::new(),
            status: RepairStatus::Detected,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let id = record.id.clone();
        self.log.push(record.clone());

        self.log.update(&id, |r| r.status = RepairStatus::Analyzing);
        let analysis = self.analyze(class, error_message).await;
        self.log.update(&id, |r| r.analysis = analysis.clone());

        self.log.update(&id, |r| r.status = RepairStatus::Repairing);
        let (status, action) = match self.attempt_repair(class, capability_hint).await {
            Ok(outcome) => outcome,
            Err(e) => (
                RepairStatus::Failed,
                format!("repair attempt itself failed: {e}"),
            ),
        };

        let resolved_at = Utc::now();
        self.log.update(&id, |r| {
            r.status = status;
            r.repair_action = action.clone();
            r.resolved_at = Some(resolved_at);
        });

        tracing::info!(agent_id, %class, ?status, "healing attempt finished");
        record.analysis = analysis;
        record.repair_action = action;
        record.status = status;
        record.resolved_at = Some(resolved_at);
        record
    }

    /// Per-class repair strategy
    async fn attempt_repair(
        &self,
        class: ErrorClass,
        capability_hint: Option<&str>,
    ) -> Result<(RepairStatus, String), anyhow::Error> {
        match class {
            ErrorClass::Network | ErrorClass::ServerError => {
                for attempt in 1..=self.backoff.max_retries.max(1) {
                    sleep(self.backoff.delay_for_attempt(attempt)).await;
                }
                Ok((
                    RepairStatus::Resolved,
                    format!(
                        "retried with exponential backoff ({} attempts)",
                        self.backoff.max_retries.max(1)
                    ),
                ))
            }
            ErrorClass::RateLimit => {
                let cooldown = self
                    .backoff
                    .delay_for_attempt(self.backoff.max_retries.max(1));
                sleep(cooldown).await;
                Ok((
                    RepairStatus::Resolved,
                    format!("waited out rate-limit cooldown ({cooldown:?})"),
                ))
            }
            ErrorClass::Validation | ErrorClass::SchemaMismatch => Ok((
                RepairStatus::Resolved,
                "marked for data reshaping before the next attempt".to_string(),
            )),
            ErrorClass::Auth => {
                let mut action = "credentials invalid; operator reconnection required".to_string();
                if let Some(capability_id) = capability_hint {
                    if let Some(capability) = self.registry.get(capability_id) {
                        if capability.auth == AuthKind::OAuth {
                            self.registry
                                .set_status(capability_id, ConnectionStatus::Error);
                            action = format!(
                                "connector {capability_id} flagged for OAuth reconnection"
                            );
                        }
                    }
                }
                Ok((RepairStatus::Failed, action))
            }
            ErrorClass::NotFound | ErrorClass::Permission | ErrorClass::Unknown => Ok((
                RepairStatus::Failed,
                format!("no automated repair for {class} errors"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::demo_capabilities;

    fn engine() -> HealingEngine {
        let registry = Arc::new(CapabilityRegistry::new(false));
        for capability in demo_capabilities() {
            registry.register(capability);
        }
        HealingEngine::new(
            registry,
            RetryPolicy {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 4,
                exponential_base: 2.0,
            },
        )
    }

    #[test]
    fn test_classification_order() {
        assert_eq!(classify("connection refused by host"), ErrorClass::Network);
        assert_eq!(classify("401 Unauthorized"), ErrorClass::Auth);
        assert_eq!(classify("429 Too Many Requests"), ErrorClass::RateLimit);
        assert_eq!(classify("missing field `name` in schema"), ErrorClass::SchemaMismatch);
        assert_eq!(classify("400 bad request"), ErrorClass::Validation);
        assert_eq!(classify("thing not found"), ErrorClass::NotFound);
        assert_eq!(classify("403 Forbidden"), ErrorClass::Permission);
        assert_eq!(classify("502 server error upstream"), ErrorClass::ServerError);
        assert_eq!(classify("entirely mysterious"), ErrorClass::Unknown);
    }

    #[tokio::test]
    async fn test_network_error_resolves() {
        let engine = engine();
        let record = engine.heal("a", "connection reset by peer", None).await;

        assert_eq!(record.error_class, ErrorClass::Network);
        assert_eq!(record.status, RepairStatus::Resolved);
        assert!(record.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_auth_error_fails_and_flags_oauth_connector() {
        let engine = engine();
        let record = engine
            .heal("a", "401 unauthorized: token expired", Some("mail"))
            .await;

        assert_eq!(record.status, RepairStatus::Failed);
        assert!(record.resolved_at.is_some());
        assert_eq!(
            engine.registry.get("mail").unwrap().status,
            ConnectionStatus::Error
        );
    }

    #[tokio::test]
    async fn test_unknown_error_fails() {
        let engine = engine();
        let record = engine.heal("a", "gremlins", None).await;
        assert_eq!(record.error_class, ErrorClass::Unknown);
        assert_eq!(record.status, RepairStatus::Failed);
    }

    #[tokio::test]
    async fn test_success_rate() {
        let engine = engine();
        assert_eq!(engine.log().success_rate(), 0.0);

        engine.heal("a", "connection refused", None).await;
        engine.heal("a", "gremlins", None).await;

        assert!((engine.log().success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_analysis_refined_by_model() {
        let registry = Arc::new(CapabilityRegistry::new(false));
        let model = Arc::new(crate::llm::StubModel::scripted([
            "The upstream DNS entry is stale; re-resolve and retry.",
        ]));
        let engine = HealingEngine::new(registry, RetryPolicy::no_retry())
            .with_model(model, "stub");

        let analysis = engine.analyze(ErrorClass::Network, "dns failure").await;
        assert!(analysis.contains("DNS entry is stale"));
    }

    #[tokio::test]
    async fn test_analysis_defaults_without_model() {
        let engine = engine();
        let analysis = engine.analyze(ErrorClass::RateLimit, "429").await;
        assert!(analysis.contains("rate limit"));
    }
}
