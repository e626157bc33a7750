//! Per-stage status tracking and bounded event history.
//!
//! [`StageTracker`] owns the finite-state record for each stage
//! (`idle → running → completed | failed`) together with ring buffers of the
//! most recent log and progress events. Streamed events only ever append to
//! history; they never move a stage between states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::errors::{PipelineError, PipelineResult};
use crate::stage::{Stage, StageOutput};
use crate::stream::{CompletionEvent, LogEvent, LogLevel, ProgressEvent};

pub const DEFAULT_LOG_CAPACITY: usize = 100;
pub const DEFAULT_PROGRESS_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Forward transitions only. `failed → running` is the retry path;
    /// anything back to `idle` goes through a full reset instead.
    fn can_transition_to(&self, next: StageStatus) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Running)
                | (Self::Failed, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about one stage in the current pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StageOutput>,
}

#[derive(Debug, Clone)]
pub struct StageTracker {
    records: BTreeMap<Stage, StageRecord>,
    logs: VecDeque<LogEvent>,
    progress: VecDeque<ProgressEvent>,
    last_completion: Option<CompletionEvent>,
    log_capacity: usize,
    progress_capacity: usize,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY, DEFAULT_PROGRESS_CAPACITY)
    }
}

impl StageTracker {
    pub fn new(log_capacity: usize, progress_capacity: usize) -> Self {
        Self {
            records: Stage::ALL
                .iter()
                .map(|stage| (*stage, StageRecord::default()))
                .collect(),
            logs: VecDeque::with_capacity(log_capacity),
            progress: VecDeque::with_capacity(progress_capacity),
            last_completion: None,
            log_capacity,
            progress_capacity,
        }
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.record(stage).status
    }

    pub fn record(&self, stage: Stage) -> &StageRecord {
        // Every stage is inserted at construction and never removed.
        &self.records[&stage]
    }

    fn record_mut(&mut self, stage: Stage) -> &mut StageRecord {
        self.records.entry(stage).or_default()
    }

    /// Stage whose current run was minted `correlation_id`.
    pub fn stage_for_correlation(&self, correlation_id: &str) -> Option<Stage> {
        self.records
            .iter()
            .find(|(_, r)| r.correlation_id.as_deref() == Some(correlation_id))
            .map(|(stage, _)| *stage)
    }

    pub fn running_stage(&self) -> Option<Stage> {
        self.records
            .iter()
            .find(|(_, r)| r.status == StageStatus::Running)
            .map(|(stage, _)| *stage)
    }

    /// Apply a status transition, enforcing forward-only moves and single-flight.
    pub fn set_status(&mut self, stage: Stage, status: StageStatus) -> PipelineResult<()> {
        if status == StageStatus::Running
            && let Some(running) = self.running_stage()
            && running != stage
        {
            return Err(PipelineError::StageBusy {
                requested: stage,
                running,
            });
        }

        let current = self.status(stage);
        if !current.can_transition_to(status) {
            return Err(PipelineError::InvalidTransition {
                stage,
                from: current,
                to: status,
            });
        }

        self.record_mut(stage).status = status;
        Ok(())
    }

    /// Mark `stage` running under a freshly minted correlation id.
    pub fn begin(
        &mut self,
        stage: Stage,
        correlation_id: &str,
        at: DateTime<Utc>,
    ) -> PipelineResult<()> {
        self.set_status(stage, StageStatus::Running)?;
        let record = self.record_mut(stage);
        record.correlation_id = Some(correlation_id.to_string());
        record.started_at = Some(at);
        record.finished_at = None;
        record.error = None;
        Ok(())
    }

    pub fn complete(
        &mut self,
        stage: Stage,
        output: StageOutput,
        at: DateTime<Utc>,
    ) -> PipelineResult<()> {
        self.set_status(stage, StageStatus::Completed)?;
        let record = self.record_mut(stage);
        record.finished_at = Some(at);
        record.output = Some(output);
        Ok(())
    }

    pub fn fail(&mut self, stage: Stage, message: &str, at: DateTime<Utc>) -> PipelineResult<()> {
        self.set_status(stage, StageStatus::Failed)?;
        let record = self.record_mut(stage);
        record.finished_at = Some(at);
        record.error = Some(message.to_string());
        Ok(())
    }

    pub fn record_progress(&mut self, event: ProgressEvent) {
        push_bounded(&mut self.progress, event, self.progress_capacity);
    }

    pub fn record_log(&mut self, event: LogEvent) {
        push_bounded(&mut self.logs, event, self.log_capacity);
    }

    /// Keep the completion and surface a failed completion in the log history.
    pub fn record_completion(&mut self, event: CompletionEvent) {
        if !event.success {
            let message = ["error", "detail", "message"]
                .iter()
                .find_map(|key| event.data.get(*key).and_then(|v| v.as_str()))
                .unwrap_or("worker reported failure")
                .to_string();
            self.record_log(LogEvent {
                timestamp: event.timestamp,
                stage: event.stage,
                level: LogLevel::Error,
                message,
            });
        }
        self.last_completion = Some(event);
    }

    /// Latest reported percentage, or 0 when nothing has been reported.
    pub fn current_progress(&self) -> u8 {
        self.progress.back().map(|e| e.progress).unwrap_or(0)
    }

    pub fn logs(&self) -> Vec<LogEvent> {
        self.logs.iter().cloned().collect()
    }

    pub fn progress_history(&self) -> Vec<ProgressEvent> {
        self.progress.iter().cloned().collect()
    }

    pub fn last_completion(&self) -> Option<&CompletionEvent> {
        self.last_completion.as_ref()
    }

    pub fn records(&self) -> Vec<(Stage, StageRecord)> {
        self.records
            .iter()
            .map(|(stage, r)| (*stage, r.clone()))
            .collect()
    }

    /// Return every stage to `idle` and drop all history.
    pub fn reset(&mut self) {
        for record in self.records.values_mut() {
            *record = StageRecord::default();
        }
        self.logs.clear();
        self.progress.clear();
        self.last_completion = None;
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while buffer.len() >= capacity {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, secs).unwrap()
    }

    fn log(message: &str) -> LogEvent {
        LogEvent {
            timestamp: at(0),
            stage: None,
            level: LogLevel::Info,
            message: message.to_string(),
        }
    }

    fn progress(pct: u8) -> ProgressEvent {
        ProgressEvent {
            timestamp: at(0),
            stage: None,
            step: "step".to_string(),
            status: "running".to_string(),
            progress: pct,
            details: String::new(),
        }
    }

    fn output(stage: Stage, session: &str) -> StageOutput {
        StageOutput {
            stage,
            session_id: session.to_string(),
            correlation_id: format!("{}-1", stage),
            result: serde_json::Value::Null,
            total_count: None,
            artifact: None,
            verdict: None,
        }
    }

    #[test]
    fn test_all_stages_start_idle() {
        let tracker = StageTracker::default();
        for stage in Stage::ALL {
            assert_eq!(tracker.status(stage), StageStatus::Idle);
        }
        assert_eq!(tracker.current_progress(), 0);
        assert!(tracker.running_stage().is_none());
    }

    #[test]
    fn test_forward_transitions() {
        let mut tracker = StageTracker::default();
        tracker.begin(Stage::Syllabus, "syllabus-1", at(1)).unwrap();
        assert_eq!(tracker.status(Stage::Syllabus), StageStatus::Running);
        assert_eq!(tracker.running_stage(), Some(Stage::Syllabus));
        tracker
            .complete(Stage::Syllabus, output(Stage::Syllabus, "s1"), at(2))
            .unwrap();
        let record = tracker.record(Stage::Syllabus);
        assert_eq!(record.status, StageStatus::Completed);
        assert_eq!(record.correlation_id.as_deref(), Some("syllabus-1"));
        assert_eq!(record.started_at, Some(at(1)));
        assert_eq!(record.finished_at, Some(at(2)));
        assert_eq!(record.output.as_ref().unwrap().session_id, "s1");
        assert_eq!(
            tracker.stage_for_correlation("syllabus-1"),
            Some(Stage::Syllabus)
        );
        assert!(tracker.stage_for_correlation("pyqs-1").is_none());
    }

    #[test]
    fn test_completed_cannot_restart() {
        let mut tracker = StageTracker::default();
        tracker.set_status(Stage::Syllabus, StageStatus::Running).unwrap();
        tracker.set_status(Stage::Syllabus, StageStatus::Completed).unwrap();
        let err = tracker
            .set_status(Stage::Syllabus, StageStatus::Running)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_failed_can_retry() {
        let mut tracker = StageTracker::default();
        tracker.begin(Stage::Syllabus, "syllabus-1", at(1)).unwrap();
        tracker.fail(Stage::Syllabus, "HTTP 500", at(2)).unwrap();
        assert_eq!(
            tracker.record(Stage::Syllabus).error.as_deref(),
            Some("HTTP 500")
        );
        tracker.begin(Stage::Syllabus, "syllabus-2", at(3)).unwrap();
        let record = tracker.record(Stage::Syllabus);
        assert_eq!(record.status, StageStatus::Running);
        assert!(record.error.is_none());
        assert!(record.finished_at.is_none());
    }

    #[test]
    fn test_idle_cannot_complete_directly() {
        let mut tracker = StageTracker::default();
        let err = tracker
            .set_status(Stage::Pyqs, StageStatus::Completed)
            .unwrap_err();
        assert!(err.to_string().contains("idle -> completed"));
    }

    #[test]
    fn test_second_running_stage_is_rejected() {
        let mut tracker = StageTracker::default();
        tracker.set_status(Stage::Syllabus, StageStatus::Running).unwrap();
        let err = tracker
            .set_status(Stage::Pyqs, StageStatus::Running)
            .unwrap_err();
        match err {
            PipelineError::StageBusy { requested, running } => {
                assert_eq!(requested, Stage::Pyqs);
                assert_eq!(running, Stage::Syllabus);
            }
            other => panic!("Expected StageBusy, got {:?}", other),
        }
        assert_eq!(tracker.status(Stage::Pyqs), StageStatus::Idle);
    }

    #[test]
    fn test_log_history_keeps_most_recent() {
        let mut tracker = StageTracker::default();
        for i in 0..150 {
            tracker.record_log(log(&format!("line {}", i)));
        }
        let logs = tracker.logs();
        assert_eq!(logs.len(), DEFAULT_LOG_CAPACITY);
        assert_eq!(logs.first().unwrap().message, "line 50");
        assert_eq!(logs.last().unwrap().message, "line 149");
    }

    #[test]
    fn test_progress_history_is_bounded() {
        let mut tracker = StageTracker::new(10, 3);
        for pct in [10, 20, 30, 40, 35] {
            tracker.record_progress(progress(pct));
        }
        let history: Vec<u8> = tracker.progress_history().iter().map(|e| e.progress).collect();
        assert_eq!(history, vec![30, 40, 35]);
        // Not required to be increasing: the latest report wins
        assert_eq!(tracker.current_progress(), 35);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut tracker = StageTracker::new(0, 0);
        tracker.record_log(log("dropped"));
        tracker.record_progress(progress(50));
        assert!(tracker.logs().is_empty());
        assert_eq!(tracker.current_progress(), 0);
    }

    #[test]
    fn test_late_events_do_not_change_status() {
        let mut tracker = StageTracker::default();
        tracker.begin(Stage::Syllabus, "syllabus-1", at(1)).unwrap();
        tracker
            .complete(Stage::Syllabus, output(Stage::Syllabus, "s1"), at(2))
            .unwrap();
        tracker.record_log(log("late"));
        tracker.record_progress(progress(10));
        assert_eq!(tracker.status(Stage::Syllabus), StageStatus::Completed);
        assert_eq!(tracker.logs().last().unwrap().message, "late");
    }

    #[test]
    fn test_failed_completion_adds_error_log() {
        let mut tracker = StageTracker::default();
        tracker.record_completion(CompletionEvent {
            timestamp: at(5),
            stage: Some(Stage::Pyqs),
            success: false,
            data: serde_json::json!({"detail": "OCR failed"}),
        });
        let logs = tracker.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
        assert_eq!(logs[0].message, "OCR failed");
        assert!(!tracker.last_completion().unwrap().success);
        assert_eq!(tracker.status(Stage::Pyqs), StageStatus::Idle);
    }

    #[test]
    fn test_successful_completion_is_kept_without_log() {
        let mut tracker = StageTracker::default();
        tracker.record_completion(CompletionEvent {
            timestamp: at(5),
            stage: Some(Stage::Syllabus),
            success: true,
            data: serde_json::Value::Null,
        });
        assert!(tracker.logs().is_empty());
        assert!(tracker.last_completion().unwrap().success);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut tracker = StageTracker::default();
        tracker.begin(Stage::Syllabus, "syllabus-1", at(1)).unwrap();
        tracker.record_log(log("a"));
        tracker.record_progress(progress(60));
        tracker.reset();
        assert_eq!(tracker.status(Stage::Syllabus), StageStatus::Idle);
        assert_eq!(tracker.record(Stage::Syllabus), &StageRecord::default());
        assert!(tracker.logs().is_empty());
        assert!(tracker.progress_history().is_empty());
        assert_eq!(tracker.current_progress(), 0);
        assert!(tracker.last_completion().is_none());
    }
}
