use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::time::Duration;
use tracing::{debug, info};

use super::{StageRequest, WorkerClient, WorkerResponse, session_field};
use crate::errors::{PipelineError, PipelineResult};
use crate::stage::{SourceMaterial, StageInput};

const ERROR_BODY_LIMIT: usize = 300;

/// [`WorkerClient`] that talks to the worker's HTTP API.
///
/// Inputs with a file are sent as `multipart/form-data` with the file in the
/// `file` part; everything else is sent as a urlencoded form.
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWorkerClient {
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .user_agent(concat!("paperflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, request: &StageRequest) -> String {
        format!("{}{}", self.base_url, request.endpoint())
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn submit(&self, request: StageRequest) -> PipelineResult<WorkerResponse> {
        let stage = request.stage;
        let url = self.url_for(&request);
        let fields = form_fields(&request);

        let builder = self.client.post(&url);
        let builder = match file_material(&request.input) {
            Some((file_name, bytes, mime)) => {
                let part = Part::bytes(bytes.to_vec())
                    .file_name(file_name.to_string())
                    .mime_str(mime)
                    .map_err(|e| PipelineError::InvalidInput {
                        stage,
                        message: format!("invalid MIME type '{}': {}", mime, e),
                    })?;
                let form = fields
                    .into_iter()
                    .fold(Form::new(), |form, (name, value)| form.text(name, value))
                    .part("file", part);
                builder.multipart(form)
            }
            None => builder.form(&fields),
        };

        info!(%stage, correlation_id = %request.correlation_id, %url, "Submitting stage");
        let resp = builder.send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("request to {} timed out", url)
            } else {
                format!("failed to reach worker at {}: {}", url, e)
            };
            PipelineError::transport(stage, message)
        })?;

        let status = resp.status();
        debug!(%stage, status = status.as_u16(), "Worker responded");
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Transport {
                stage,
                status: Some(status.as_u16()),
                message: error_detail(&body)
                    .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string()),
            });
        }

        resp.json::<WorkerResponse>().await.map_err(|e| {
            PipelineError::transport(stage, format!("invalid response body: {}", e))
        })
    }
}

/// Text fields for a request, in a stable order.
fn form_fields(request: &StageRequest) -> Vec<(String, String)> {
    let mut fields = vec![("correlation_id".to_string(), request.correlation_id.clone())];
    for (dependency, session_id) in &request.dependencies {
        fields.push((session_field(*dependency), session_id.clone()));
    }

    match &request.input {
        StageInput::Syllabus(SourceMaterial::Text(text))
        | StageInput::Pyqs(SourceMaterial::Text(text)) => {
            fields.push(("text".to_string(), text.clone()));
        }
        StageInput::Syllabus(SourceMaterial::File { .. })
        | StageInput::Pyqs(SourceMaterial::File { .. }) => {}
        StageInput::Paper(params) => {
            fields.push(("total_marks".to_string(), params.total_marks.to_string()));
            fields.push((
                "total_questions".to_string(),
                params.total_questions.to_string(),
            ));
            if let Some(pattern) = &params.pattern {
                fields.push(("pattern".to_string(), pattern.to_string()));
            }
            if let Some(instructions) = &params.instructions {
                fields.push(("instructions".to_string(), instructions.clone()));
            }
        }
    }
    fields
}

fn file_material(input: &StageInput) -> Option<(&str, &[u8], &str)> {
    match input {
        StageInput::Syllabus(SourceMaterial::File {
            file_name,
            bytes,
            mime,
        })
        | StageInput::Pyqs(SourceMaterial::File {
            file_name,
            bytes,
            mime,
        }) => Some((file_name.as_str(), bytes.as_slice(), mime.as_str())),
        _ => None,
    }
}

/// Pull the message out of a `{"detail": ...}` envelope, falling back to the
/// truncated body. `None` for an empty body.
fn error_detail(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
        && let Some(detail) = value.get("detail")
    {
        return Some(match detail {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    Some(truncate(body, ERROR_BODY_LIMIT))
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
