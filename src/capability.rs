//! Stage and quality-check capabilities.
//!
//! The content-generating stages and the quality heuristics are external
//! collaborators: the engine only knows how to hand them inputs and
//! interpret success, structured failure, or a pass/fail score. Both kinds
//! are injected through a registry rather than resolved from process-wide
//! state, so tests substitute fakes freely.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::QualityScore;

/// Structured failure returned by a capability invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFailure {
    pub message: String,
    /// Transient failures are retried with backoff; permanent ones are not.
    pub retryable: bool,
}

impl StageFailure {
    pub fn transient(message: &str) -> Self {
        Self {
            message: message.to_string(),
            retryable: true,
        }
    }

    pub fn permanent(message: &str) -> Self {
        Self {
            message: message.to_string(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// An external stage collaborator. Input is a mapping of upstream stage
/// outputs keyed by stage id (the run's client inputs for root stages);
/// output is an opaque success payload.
#[async_trait]
pub trait StageCapability: Send + Sync {
    async fn invoke(
        &self,
        stage_id: &str,
        inputs: &HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, StageFailure>;
}

/// An external quality heuristic. The engine only interprets the returned
/// pass/fail score; prose quality itself is out of scope.
#[async_trait]
pub trait QualityCheck: Send + Sync {
    async fn evaluate(
        &self,
        stage_id: &str,
        output: &serde_json::Value,
    ) -> Result<QualityScore, StageFailure>;
}

/// Registry of injected capabilities, keyed by the names a pipeline
/// definition references.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    stages: HashMap<String, Arc<dyn StageCapability>>,
    checks: HashMap<String, Arc<dyn QualityCheck>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_stage(&mut self, name: &str, capability: Arc<dyn StageCapability>) {
        self.stages.insert(name.to_string(), capability);
    }

    pub fn register_check(&mut self, name: &str, check: Arc<dyn QualityCheck>) {
        self.checks.insert(name.to_string(), check);
    }

    pub fn stage(&self, name: &str) -> Option<Arc<dyn StageCapability>> {
        self.stages.get(name).cloned()
    }

    pub fn check(&self, name: &str) -> Option<Arc<dyn QualityCheck>> {
        self.checks.get(name).cloned()
    }
}

/// Production adapter: invokes a capability over HTTP.
///
/// POSTs `{ "stage_id": ..., "inputs": ... }` to the configured endpoint and
/// expects either a JSON payload (2xx) or a failure body. Connection-level
/// errors and 5xx responses are treated as retryable; 4xx are permanent.
pub struct HttpCapability {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCapability {
    pub fn new(client: reqwest::Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }

    async fn post(
        &self,
        stage_id: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, StageFailure> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "stage_id": stage_id, "inputs": body }))
            .send()
            .await
            .map_err(|e| StageFailure::transient(&format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(StageFailure::transient(&format!(
                "capability returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(StageFailure::permanent(&format!(
                "capability returned {}",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| StageFailure::permanent(&format!("invalid capability payload: {}", e)))
    }
}

#[async_trait]
impl StageCapability for HttpCapability {
    async fn invoke(
        &self,
        stage_id: &str,
        inputs: &HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, StageFailure> {
        self.post(stage_id, serde_json::json!(inputs)).await
    }
}

#[async_trait]
impl QualityCheck for HttpCapability {
    async fn evaluate(
        &self,
        stage_id: &str,
        output: &serde_json::Value,
    ) -> Result<QualityScore, StageFailure> {
        let payload = self
            .post(stage_id, serde_json::json!({ "output": output }))
            .await?;
        serde_json::from_value(payload)
            .map_err(|e| StageFailure::permanent(&format!("invalid quality score: {}", e)))
    }
}

pub mod testing {
    //! Fake capabilities for deterministic tests.

    use super::*;
    use std::sync::Mutex;

    /// Stage capability that echoes a fixed payload, optionally failing the
    /// first `fail_first` invocations with a transient error.
    pub struct FakeStage {
        pub payload: serde_json::Value,
        pub fail_first: u32,
        pub retryable: bool,
        calls: Mutex<u32>,
    }

    impl FakeStage {
        pub fn ok(payload: serde_json::Value) -> Self {
            Self {
                payload,
                fail_first: 0,
                retryable: true,
                calls: Mutex::new(0),
            }
        }

        pub fn flaky(payload: serde_json::Value, fail_first: u32) -> Self {
            Self {
                payload,
                fail_first,
                retryable: true,
                calls: Mutex::new(0),
            }
        }

        pub fn broken(retryable: bool) -> Self {
            Self {
                payload: serde_json::Value::Null,
                fail_first: u32::MAX,
                retryable,
                calls: Mutex::new(0),
            }
        }

        pub fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl StageCapability for FakeStage {
        async fn invoke(
            &self,
            _stage_id: &str,
            _inputs: &HashMap<String, serde_json::Value>,
        ) -> Result<serde_json::Value, StageFailure> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.fail_first {
                if self.retryable {
                    return Err(StageFailure::transient("simulated transient failure"));
                }
                return Err(StageFailure::permanent("simulated permanent failure"));
            }
            Ok(self.payload.clone())
        }
    }

    /// Quality check that fails the first `fail_first` evaluations, then
    /// passes.
    pub struct FakeCheck {
        pub fail_first: u32,
        calls: Mutex<u32>,
    }

    impl FakeCheck {
        pub fn passing() -> Self {
            Self {
                fail_first: 0,
                calls: Mutex::new(0),
            }
        }

        pub fn failing_first(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: Mutex::new(0),
            }
        }

        pub fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl QualityCheck for FakeCheck {
        async fn evaluate(
            &self,
            stage_id: &str,
            _output: &serde_json::Value,
        ) -> Result<QualityScore, StageFailure> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.fail_first {
                Ok(QualityScore::failing(
                    stage_id,
                    vec![crate::model::Finding {
                        severity: crate::model::Severity::Error,
                        message: "tone drifts from style guide".to_string(),
                    }],
                ))
            } else {
                Ok(QualityScore::passing(stage_id))
            }
        }
    }
}
