use crate::orchestrator::{PipelineSnapshot, StageStatus};
use crate::stage::{Stage, StageOutput};
use crate::stream::{LogEvent, LogLevel};
use crate::ui::icons::{CHECK, CROSS, INFO, LINK, PAPER, RUNNING, SPARKLE, UNLINKED, WAITING, WARN};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Terminal UI for a pipeline run, rendered via `indicatif` progress bars.
///
/// One bar per stage taking part in the run, plus a channel line underneath
/// showing whether the progress channel is connected and the latest step.
///
/// The view is stateless with respect to the pipeline: every call to
/// [`Self::render`] redraws from a [`PipelineSnapshot`].
pub struct PipelineUI {
    multi: MultiProgress,
    bars: Vec<(Stage, ProgressBar)>,
    channel_bar: ProgressBar,
    verbose: bool,
    last_log: Option<LogEvent>,
}

impl PipelineUI {
    /// Create the UI with a bar for each of `stages`, in order.
    ///
    /// # Arguments
    /// * `stages`: the stages this run will touch
    /// * `verbose`: when `true`, info-level worker logs are printed as well as
    ///   warnings and errors
    /// * `visible`: when `false` nothing is drawn (used for `--json` output)
    pub fn new(stages: &[Stage], verbose: bool, visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        let stage_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let width = stages.iter().map(|s| s.label().len()).max().unwrap_or(0);
        let bars = stages
            .iter()
            .map(|stage| {
                let bar = multi.add(ProgressBar::new(100));
                bar.set_style(stage_style.clone());
                bar.set_prefix(format!("{:>width$}", stage.label(), width = width));
                bar.set_message(format!("{}waiting", WAITING));
                (*stage, bar)
            })
            .collect();

        let channel_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let channel_bar = multi.add(ProgressBar::new_spinner());
        channel_bar.set_style(channel_style);
        channel_bar.set_prefix(format!("{:>width$}", "Channel", width = width));
        channel_bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            multi,
            bars,
            channel_bar,
            verbose,
            last_log: None,
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` if the rich UI fails.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Redraw every bar from `snapshot` and print worker logs not yet shown.
    pub fn render(&mut self, snapshot: &PipelineSnapshot) {
        for (stage, bar) in &self.bars {
            match snapshot.status(*stage) {
                StageStatus::Running => bar.set_position(u64::from(snapshot.current_progress)),
                StageStatus::Completed => bar.set_position(100),
                StageStatus::Idle | StageStatus::Failed => {}
            }
            bar.set_message(stage_message(snapshot, *stage));
        }

        self.channel_bar.set_message(channel_message(snapshot));

        let fresh: Vec<LogEvent> = unseen_logs(&snapshot.logs, self.last_log.as_ref()).to_vec();
        for event in &fresh {
            if event.level == LogLevel::Info && !self.verbose {
                continue;
            }
            self.print_line(format_log(event));
        }
        if let Some(last) = fresh.last() {
            self.last_log = Some(last.clone());
        }
    }

    /// Stop animating and leave the final state on screen.
    pub fn finish(&self) {
        for (_, bar) in &self.bars {
            bar.abandon();
        }
        self.channel_bar.finish_and_clear();
    }

    /// Print a completed stage's result summary to stdout.
    ///
    /// Call after [`Self::finish`]; this bypasses the progress renderer so the
    /// summary is printed even when stderr is not a terminal.
    pub fn print_output(&self, output: &StageOutput) {
        println!(
            "{}{} {}",
            SPARKLE,
            style(output.stage.label()).green().bold(),
            style(format!("session {}", output.session_id)).dim()
        );
        if let Some(count) = output.total_count {
            println!("    {} questions extracted", style(count).cyan());
        }
        if let Some(artifact) = &output.artifact {
            println!("    {}{}", PAPER, style(artifact).underlined());
        }
        if let Some(verdict) = &output.verdict {
            println!("    {} {}", style("Verdict:").dim(), verdict);
        }
        if self.verbose && !output.result.is_null() {
            let pretty = serde_json::to_string_pretty(&output.result)
                .unwrap_or_else(|_| output.result.to_string());
            for line in pretty.lines() {
                println!("    {}", style(line).dim());
            }
        }
    }

    /// Print a failure banner to stderr.
    pub fn print_failure(&self, stage: Stage, reason: &str) {
        eprintln!(
            "\n{}{} failed: {}\n",
            CROSS,
            style(stage.label()).red().bold(),
            reason
        );
    }
}

/// Status text for one stage bar.
fn stage_message(snapshot: &PipelineSnapshot, stage: Stage) -> String {
    match snapshot.status(stage) {
        StageStatus::Idle if snapshot.pending.contains(&stage) => format!("{}queued", WAITING),
        StageStatus::Idle => format!("{}waiting", WAITING),
        StageStatus::Running => {
            let step = snapshot
                .latest_progress
                .as_ref()
                .filter(|p| p.stage.is_none_or(|s| s == stage))
                .map(|p| format!("{} {}", p.step, style(&p.details).dim()))
                .unwrap_or_else(|| "starting".to_string());
            format!("{}{}", RUNNING, step)
        }
        StageStatus::Completed => format!("{}done", CHECK),
        StageStatus::Failed => {
            let reason = snapshot
                .record(stage)
                .and_then(|r| r.error.clone())
                .unwrap_or_else(|| "failed".to_string());
            format!("{}{}", CROSS, style(reason).red())
        }
    }
}

fn channel_message(snapshot: &PipelineSnapshot) -> String {
    if snapshot.is_connected {
        format!("{}{}", LINK, style("connected").green())
    } else if snapshot.running_stage().is_some() {
        format!("{}{}", UNLINKED, style("not connected").yellow())
    } else {
        format!("{}{}", UNLINKED, style("idle").dim())
    }
}

fn format_log(event: &LogEvent) -> String {
    let stage = event.stage.map(|s| s.as_str()).unwrap_or("-");
    match event.level {
        LogLevel::Info => format!("    {}{} {}", INFO, style(stage).dim(), event.message),
        LogLevel::Warning => format!(
            "    {}{} {}",
            WARN,
            style(stage).dim(),
            style(&event.message).yellow()
        ),
        LogLevel::Error => format!(
            "    {}{} {}",
            CROSS,
            style(stage).dim(),
            style(&event.message).red().bold()
        ),
    }
}

/// The suffix of `logs` after `last`. The history is a ring buffer, so when
/// `last` has been evicted everything still held is new.
fn unseen_logs<'a>(logs: &'a [LogEvent], last: Option<&LogEvent>) -> &'a [LogEvent] {
    match last {
        None => logs,
        Some(last) => match logs.iter().rposition(|e| e == last) {
            Some(pos) => &logs[pos + 1..],
            None => logs,
        },
    }
}
