//! Request/response contract with the remote analysis worker.
//!
//! The orchestrator only depends on the [`WorkerClient`] trait; the HTTP
//! implementation lives in [`http`].

pub mod http;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{PipelineError, PipelineResult};
use crate::stage::{Stage, StageInput, StageOutput};

pub use http::HttpWorkerClient;

/// One stage submission: the caller's input plus the correlation id of the
/// progress channel and the session ids of every dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRequest {
    pub stage: Stage,
    pub correlation_id: String,
    pub dependencies: Vec<(Stage, String)>,
    pub input: StageInput,
}

impl StageRequest {
    /// Path of the worker endpoint serving this stage.
    pub fn endpoint(&self) -> &'static str {
        endpoint_for(self.stage)
    }

    pub fn session_for(&self, stage: Stage) -> Option<&str> {
        self.dependencies
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, id)| id.as_str())
    }
}

pub fn endpoint_for(stage: Stage) -> &'static str {
    match stage {
        Stage::Syllabus => "/analyze/syllabus",
        Stage::Pyqs => "/analyze/pyqs",
        Stage::Paper => "/generate/paper",
    }
}

/// Form field carrying a dependency's session id.
pub fn session_field(stage: Stage) -> String {
    format!("{}_session_id", stage)
}

/// Successful worker reply. Accepts both snake_case and camelCase keys.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WorkerResponse {
    #[serde(default, alias = "sessionId")]
    pub session_id: String,
    #[serde(default, alias = "parsedResult", alias = "result")]
    pub parsed_result: Value,
    #[serde(default, alias = "totalCount")]
    pub total_count: Option<u64>,
    #[serde(default, alias = "generatedArtifact")]
    pub generated_artifact: Option<Value>,
    #[serde(default, alias = "verificationVerdict")]
    pub verification_verdict: Option<Value>,
}

impl WorkerResponse {
    /// Validate the reply and turn it into the caller-facing output.
    pub fn into_output(self, stage: Stage, correlation_id: &str) -> PipelineResult<StageOutput> {
        let session_id = self.session_id.trim().to_string();
        if session_id.is_empty() {
            return Err(PipelineError::transport(
                stage,
                "worker response did not include a session_id",
            ));
        }

        let mut result = self.parsed_result;
        let artifact = match self.generated_artifact {
            Some(Value::String(path)) => Some(path),
            Some(other) => {
                // Structured artifacts carry their reference under `path` or `url`
                let reference = ["path", "url", "file_path"]
                    .iter()
                    .find_map(|key| other.get(*key).and_then(|v| v.as_str()))
                    .map(str::to_string);
                if result.is_null() {
                    result = other;
                }
                reference
            }
            None => None,
        };

        Ok(StageOutput {
            stage,
            session_id,
            correlation_id: correlation_id.to_string(),
            result,
            total_count: self.total_count,
            artifact,
            verdict: self.verification_verdict,
        })
    }
}

#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn submit(&self, request: StageRequest) -> PipelineResult<WorkerResponse>;
}
