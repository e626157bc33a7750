//! Typed error hierarchy for the paperflow orchestrator.
//!
//! `PipelineError` covers every failure the orchestrator can surface:
//! - stage-level failures (`MissingDependency`, `Transport`, `InvalidInput`)
//! - advisory channel failures (`Channel`, `MalformedEvent`), which are logged
//!   and recorded but never fail a stage on their own
//! - state machine violations (`StageBusy`, `InvalidTransition`, `SessionAlreadySet`)

use thiserror::Error;

use crate::orchestrator::StageStatus;
use crate::stage::Stage;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Stage {stage} requires a {dependency} session; run {dependency} first")]
    MissingDependency { stage: Stage, dependency: Stage },

    #[error("Stage {stage} request failed{}: {message}", status_suffix(.status))]
    Transport {
        stage: Stage,
        status: Option<u16>,
        message: String,
    },

    #[error("Streaming channel error: {0}")]
    Channel(String),

    #[error("Malformed streamed event: {0}")]
    MalformedEvent(String),

    #[error("Invalid input for stage {stage}: {message}")]
    InvalidInput { stage: Stage, message: String },

    #[error("Cannot start {requested} while {running} is running")]
    StageBusy { requested: Stage, running: Stage },

    #[error("Invalid transition for {stage}: {from} -> {to}")]
    InvalidTransition {
        stage: Stage,
        from: StageStatus,
        to: StageStatus,
    },

    #[error("Session for stage {stage} is already set")]
    SessionAlreadySet { stage: Stage },
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {})", code),
        None => String::new(),
    }
}

impl PipelineError {
    pub fn transport(stage: Stage, message: impl Into<String>) -> Self {
        Self::Transport {
            stage,
            status: None,
            message: message.into(),
        }
    }

    /// Whether re-invoking the same stage can succeed without a reset.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Channel(_))
    }
}
