//! Pipeline execution: `paperflow run` and `paperflow stage <STAGE>`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use paperflow::channel::WsTransport;
use paperflow::errors::PipelineResult;
use paperflow::orchestrator::{
    Orchestrator, OrchestratorDeps, PipelineSnapshot, RunOutcome, StageStatus,
};
use paperflow::paperflow_config::PaperflowConfig;
use paperflow::stage::{GenerationParams, SourceMaterial, Stage, StageInput, StageOutput};
use paperflow::ui::PipelineUI;
use paperflow::worker::HttpWorkerClient;

use super::super::InputArgs;

/// Wire the production worker client and channel transport into an orchestrator.
pub fn build_orchestrator(config: &PaperflowConfig) -> Result<Orchestrator> {
    let worker = HttpWorkerClient::new(
        &config.base_url(),
        config.request_timeout(),
        config.connect_timeout(),
    )?;
    let settings = config.pipeline_settings()?;
    tracing::debug!(
        base_url = %worker.base_url(),
        ws_base = %settings.ws_base,
        "Orchestrator configured"
    );
    let deps = OrchestratorDeps::new(Arc::new(worker), Arc::new(WsTransport));
    Ok(Orchestrator::new(deps, settings))
}

/// Build the input for `stage` from the CLI flags, or `None` when none were given.
pub fn stage_input(stage: Stage, args: &InputArgs) -> Result<Option<StageInput>> {
    match stage {
        Stage::Syllabus => Ok(source_material(&args.syllabus, &args.syllabus_text)?
            .map(StageInput::Syllabus)),
        Stage::Pyqs => Ok(source_material(&args.pyqs, &args.pyqs_text)?.map(StageInput::Pyqs)),
        Stage::Paper => generation_params(args).map(|p| p.map(StageInput::Paper)),
    }
}

fn source_material(
    file: &Option<std::path::PathBuf>,
    text: &Option<String>,
) -> Result<Option<SourceMaterial>> {
    match (file, text) {
        (Some(path), _) => SourceMaterial::from_path(path).map(Some),
        (None, Some(text)) => Ok(Some(SourceMaterial::text(text.clone()))),
        (None, None) => Ok(None),
    }
}

fn generation_params(args: &InputArgs) -> Result<Option<GenerationParams>> {
    let (total_marks, total_questions) = match (args.total_marks, args.total_questions) {
        (Some(marks), Some(questions)) => (marks, questions),
        (None, None) => {
            if args.pattern.is_some() || args.instructions.is_some() {
                anyhow::bail!(
                    "--pattern and --instructions need --total-marks and --total-questions"
                );
            }
            return Ok(None);
        }
        _ => anyhow::bail!("--total-marks and --total-questions must be given together"),
    };

    let mut params = GenerationParams::new(total_marks, total_questions);
    if let Some(path) = &args.pattern {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pattern file: {}", path.display()))?;
        let pattern = serde_json::from_str(&content)
            .with_context(|| format!("Pattern file is not valid JSON: {}", path.display()))?;
        params.pattern = Some(pattern);
    }
    params.instructions = args.instructions.clone();
    Ok(Some(params))
}

/// Parse a `--session STAGE=ID` flag.
pub fn parse_session(spec: &str) -> Result<(Stage, String)> {
    let (stage, id) = spec
        .split_once('=')
        .with_context(|| format!("Invalid --session '{}': expected STAGE=ID", spec))?;
    let stage: Stage = stage.trim().parse()?;
    let id = id.trim();
    if id.is_empty() {
        anyhow::bail!("Invalid --session '{}': session id is empty", spec);
    }
    Ok((stage, id.to_string()))
}

/// Per-stage line of the final report.
#[derive(Debug, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<StageOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn from_snapshot(snapshot: &PipelineSnapshot, stages: &[Stage]) -> Self {
        let stages = stages
            .iter()
            .map(|stage| {
                let record = snapshot.record(*stage).cloned().unwrap_or_default();
                StageReport {
                    stage: *stage,
                    status: record.status,
                    output: record.output,
                    error: record.error,
                }
            })
            .collect();
        Self {
            stages,
            error: snapshot.error.clone(),
        }
    }

    /// First stage that did not complete, with the reason.
    pub fn failure(&self) -> Option<(Stage, String)> {
        self.stages
            .iter()
            .find(|s| s.status != StageStatus::Completed)
            .map(|s| {
                let reason = s
                    .error
                    .clone()
                    .or_else(|| self.error.clone())
                    .unwrap_or_else(|| format!("stage ended {}", s.status));
                (s.stage, reason)
            })
    }
}

/// True once nothing is running and the chain over `stages` cannot advance.
fn run_settled(snapshot: &PipelineSnapshot, stages: &[Stage]) -> bool {
    if snapshot.running_stage().is_some() {
        return false;
    }
    stages.iter().all(|s| snapshot.status(*s).is_terminal())
        || stages
            .iter()
            .any(|s| snapshot.status(*s) == StageStatus::Failed)
        || snapshot.error.is_some()
}

/// Run `stage`, redrawing the UI on every snapshot until the call returns.
async fn run_with_ui(
    orchestrator: &Orchestrator,
    rx: &mut watch::Receiver<PipelineSnapshot>,
    ui: &mut PipelineUI,
    stage: Stage,
    input: StageInput,
) -> PipelineResult<RunOutcome> {
    let run = orchestrator.run(stage, input);
    tokio::pin!(run);
    loop {
        tokio::select! {
            outcome = &mut run => return outcome,
            changed = rx.changed() => {
                if changed.is_err() {
                    return run.await;
                }
                let snapshot = rx.borrow_and_update().clone();
                ui.render(&snapshot);
            }
        }
    }
}

/// Keep rendering until the auto-chain over `stages` has settled.
async fn wait_for_chain(
    rx: &mut watch::Receiver<PipelineSnapshot>,
    ui: &mut PipelineUI,
    stages: &[Stage],
) -> PipelineSnapshot {
    loop {
        let snapshot = rx.borrow_and_update().clone();
        ui.render(&snapshot);
        if run_settled(&snapshot, stages) || rx.changed().await.is_err() {
            return snapshot;
        }
    }
}

fn finish(ui: &PipelineUI, report: &RunReport, json: bool) -> Result<()> {
    ui.finish();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("Failed to serialize run report")?
        );
    } else {
        for stage in &report.stages {
            if let Some(output) = &stage.output {
                ui.print_output(output);
            }
        }
    }

    if let Some((stage, reason)) = report.failure() {
        if !json {
            ui.print_failure(stage, &reason);
        }
        anyhow::bail!("{} did not complete: {}", stage.label(), reason);
    }
    Ok(())
}

pub async fn cmd_run(config: &PaperflowConfig, inputs: &InputArgs, json: bool) -> Result<()> {
    let syllabus = stage_input(Stage::Syllabus, inputs)?.context(
        "No syllabus input. Pass --syllabus <FILE> or --syllabus-text <TEXT>.",
    )?;
    let pyqs = stage_input(Stage::Pyqs, inputs)?;
    let paper = stage_input(Stage::Paper, inputs)?;
    if paper.is_some() && pyqs.is_none() {
        anyhow::bail!("Paper generation needs PYQ input. Pass --pyqs <FILE> or --pyqs-text <TEXT>.");
    }

    let orchestrator = build_orchestrator(config)?;
    let mut stages = vec![Stage::Syllabus];
    for input in [pyqs, paper].into_iter().flatten() {
        stages.push(input.stage());
        orchestrator.queue(input)?;
    }

    let mut rx = orchestrator.subscribe();
    let mut ui = PipelineUI::new(&stages, config.verbose, !json);

    let first = run_with_ui(&orchestrator, &mut rx, &mut ui, Stage::Syllabus, syllabus).await;
    if let Err(e) = &first {
        tracing::warn!(error = %e, "Syllabus stage failed");
    }
    let snapshot = wait_for_chain(&mut rx, &mut ui, &stages).await;
    orchestrator.close();

    let report = RunReport::from_snapshot(&snapshot, &stages);
    finish(&ui, &report, json)
}

pub async fn cmd_stage(
    config: &PaperflowConfig,
    stage: &str,
    sessions: &[String],
    inputs: &InputArgs,
    json: bool,
) -> Result<()> {
    let stage: Stage = stage.parse()?;
    let input = stage_input(stage, inputs)?
        .with_context(|| format!("No input given for the {} stage", stage))?;

    let orchestrator = build_orchestrator(config)?;
    for spec in sessions {
        let (dependency, id) = parse_session(spec)?;
        orchestrator.register_session(dependency, id)?;
    }

    let mut rx = orchestrator.subscribe();
    let mut ui = PipelineUI::new(&[stage], config.verbose, !json);
    let outcome = run_with_ui(&orchestrator, &mut rx, &mut ui, stage, input).await;
    let snapshot = orchestrator.snapshot();
    ui.render(&snapshot);
    orchestrator.close();

    // Refusals (missing dependency, bad input) never reach the tracker
    if let Err(e) = outcome
        && snapshot.status(stage) == StageStatus::Idle
    {
        ui.finish();
        return Err(e.into());
    }

    let report = RunReport::from_snapshot(&snapshot, &[stage]);
    finish(&ui, &report, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperflow::orchestrator::StageRecord;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn record(status: StageStatus) -> StageRecord {
        StageRecord {
            status,
            ..StageRecord::default()
        }
    }

    #[test]
    fn test_parse_session() {
        let (stage, id) = parse_session("syllabus=abc123").unwrap();
        assert_eq!(stage, Stage::Syllabus);
        assert_eq!(id, "abc123");

        let (stage, _) = parse_session("B = s-9").unwrap();
        assert_eq!(stage, Stage::Pyqs);

        assert!(parse_session("syllabus").is_err());
        assert!(parse_session("syllabus=").is_err());
        assert!(parse_session("nope=1").is_err());
    }

    #[test]
    fn test_stage_input_text_and_file() {
        let args = InputArgs {
            syllabus_text: Some("Unit 1: Algebra".to_string()),
            ..InputArgs::default()
        };
        let input = stage_input(Stage::Syllabus, &args).unwrap().unwrap();
        assert_eq!(
            input,
            StageInput::Syllabus(SourceMaterial::text("Unit 1: Algebra"))
        );
        assert!(stage_input(Stage::Pyqs, &args).unwrap().is_none());

        let mut file = NamedTempFile::with_suffix(".txt").unwrap();
        file.write_all(b"Q1. Define a group.").unwrap();
        let args = InputArgs {
            pyqs: Some(file.path().to_path_buf()),
            ..InputArgs::default()
        };
        match stage_input(Stage::Pyqs, &args).unwrap() {
            Some(StageInput::Pyqs(SourceMaterial::File { mime, bytes, .. })) => {
                assert_eq!(mime, "text/plain");
                assert_eq!(bytes, b"Q1. Define a group.");
            }
            other => panic!("unexpected input: {:?}", other),
        }
    }

    #[test]
    fn test_generation_params_from_flags() {
        let mut pattern = NamedTempFile::with_suffix(".json").unwrap();
        pattern
            .write_all(br#"{"sections": [{"name": "A", "marks": 2}]}"#)
            .unwrap();
        let args = InputArgs {
            total_marks: Some(80),
            total_questions: Some(20),
            pattern: Some(pattern.path().to_path_buf()),
            instructions: Some("Focus on unit 3".to_string()),
            ..InputArgs::default()
        };
        match stage_input(Stage::Paper, &args).unwrap() {
            Some(StageInput::Paper(params)) => {
                assert_eq!(params.total_marks, 80);
                assert_eq!(params.total_questions, 20);
                assert_eq!(params.pattern.unwrap()["sections"][0]["marks"], 2);
                assert_eq!(params.instructions.as_deref(), Some("Focus on unit 3"));
            }
            other => panic!("unexpected input: {:?}", other),
        }
    }

    #[test]
    fn test_generation_params_need_both_numbers() {
        let args = InputArgs {
            total_marks: Some(80),
            ..InputArgs::default()
        };
        assert!(stage_input(Stage::Paper, &args).is_err());

        let args = InputArgs {
            instructions: Some("x".to_string()),
            ..InputArgs::default()
        };
        assert!(stage_input(Stage::Paper, &args).is_err());

        assert!(
            stage_input(Stage::Paper, &InputArgs::default())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_run_settled() {
        let stages = [Stage::Syllabus, Stage::Pyqs];
        let mut snapshot = PipelineSnapshot {
            stages: vec![
                (Stage::Syllabus, record(StageStatus::Completed)),
                (Stage::Pyqs, record(StageStatus::Running)),
            ],
            ..PipelineSnapshot::default()
        };
        assert!(!run_settled(&snapshot, &stages));

        snapshot.stages[1].1 = record(StageStatus::Completed);
        assert!(run_settled(&snapshot, &stages));

        snapshot.stages[0].1 = record(StageStatus::Failed);
        snapshot.stages[1].1 = record(StageStatus::Idle);
        assert!(run_settled(&snapshot, &stages));
    }

    #[test]
    fn test_report_failure_names_first_incomplete_stage() {
        let snapshot = PipelineSnapshot {
            stages: vec![
                (Stage::Syllabus, record(StageStatus::Completed)),
                (
                    Stage::Pyqs,
                    StageRecord {
                        status: StageStatus::Failed,
                        error: Some("worker returned 500".to_string()),
                        ..StageRecord::default()
                    },
                ),
            ],
            ..PipelineSnapshot::default()
        };
        let report = RunReport::from_snapshot(&snapshot, &[Stage::Syllabus, Stage::Pyqs, Stage::Paper]);
        let (stage, reason) = report.failure().unwrap();
        assert_eq!(stage, Stage::Pyqs);
        assert_eq!(reason, "worker returned 500");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stages"][2]["status"], "idle");
    }
}
