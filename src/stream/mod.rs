//! Streamed events pushed by the remote worker over the progress channel.
//!
//! Inbound messages are JSON objects discriminated by `type`:
//!
//! | `type`       | Fields                                               |
//! |--------------|------------------------------------------------------|
//! | `progress`   | `timestamp`, `step`, `status`, `progress`, `details` |
//! | `log`        | `timestamp`, `level`, `message`                      |
//! | `completion` | `timestamp`, `success`, `data`                       |
//!
//! [`parse_event`] turns raw text into a [`StreamedEvent`]. Anything that does
//! not match is reported as [`PipelineError::MalformedEvent`]; callers log and
//! drop it.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{PipelineError, PipelineResult};
use crate::stage::Stage;

/// Severity of a streamed log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    /// Stage whose channel delivered the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub step: String,
    pub status: String,
    /// Percentage in 0..=100.
    pub progress: u8,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub success: bool,
    #[serde(default)]
    pub data: Value,
}

/// A progress, log or completion message from the remote worker.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamedEvent {
    Progress(ProgressEvent),
    Log(LogEvent),
    Completion(CompletionEvent),
}

impl StreamedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Log(_) => "log",
            Self::Completion(_) => "completion",
        }
    }

    /// Attribute the event to the stage whose channel delivered it.
    pub fn with_stage(mut self, stage: Stage) -> Self {
        match &mut self {
            Self::Progress(e) => e.stage = Some(stage),
            Self::Log(e) => e.stage = Some(stage),
            Self::Completion(e) => e.stage = Some(stage),
        }
        self
    }
}

/// Wire shape of an inbound message, before timestamp normalisation.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireEvent {
    Progress {
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(default)]
        step: String,
        #[serde(default)]
        status: String,
        progress: f64,
        #[serde(default)]
        details: String,
    },
    Log {
        #[serde(default)]
        timestamp: Option<String>,
        level: LogLevel,
        message: String,
    },
    Completion {
        #[serde(default)]
        timestamp: Option<String>,
        success: bool,
        #[serde(default)]
        data: Value,
    },
}

/// Parse one inbound message. `now` stamps events that carry no usable timestamp.
pub fn parse_event(text: &str, now: DateTime<Utc>) -> PipelineResult<StreamedEvent> {
    let wire: WireEvent = serde_json::from_str(text)
        .map_err(|e| PipelineError::MalformedEvent(format!("{} in {}", e, truncate(text, 120))))?;

    let event = match wire {
        WireEvent::Progress {
            timestamp,
            step,
            status,
            progress,
            details,
        } => {
            if !progress.is_finite() {
                return Err(PipelineError::MalformedEvent(format!(
                    "non-numeric progress in {}",
                    truncate(text, 120)
                )));
            }
            StreamedEvent::Progress(ProgressEvent {
                timestamp: resolve_timestamp(timestamp.as_deref(), now),
                stage: None,
                step,
                status,
                progress: clamp_percent(progress),
                details,
            })
        }
        WireEvent::Log {
            timestamp,
            level,
            message,
        } => StreamedEvent::Log(LogEvent {
            timestamp: resolve_timestamp(timestamp.as_deref(), now),
            stage: None,
            level,
            message,
        }),
        WireEvent::Completion {
            timestamp,
            success,
            data,
        } => StreamedEvent::Completion(CompletionEvent {
            timestamp: resolve_timestamp(timestamp.as_deref(), now),
            stage: None,
            success,
            data,
        }),
    };

    Ok(event)
}

fn clamp_percent(value: f64) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}

/// Accept RFC 3339 or a naive ISO 8601 timestamp (treated as UTC).
fn resolve_timestamp(raw: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return now;
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.with_timezone(&Utc);
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
