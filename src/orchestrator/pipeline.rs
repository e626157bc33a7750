//! Orchestrator facade.
//!
//! [`Orchestrator`] is the single entry point for callers. It owns the
//! pipeline state (tracker, session registry, pending queue), the channel
//! manager and the stage runner, and publishes a [`PipelineSnapshot`] on a
//! watch channel after every change.
//!
//! Streamed events reach the state through one dispatcher task fed by the
//! channel pumps over an mpsc queue. The state lock is only taken for short,
//! synchronous sections and is never held across an await.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::queue::PendingQueue;
use super::runner::{Claim, Settled, StageRun, StageRunner};
use super::session::SessionRegistry;
use super::state::{
    DEFAULT_LOG_CAPACITY, DEFAULT_PROGRESS_CAPACITY, StageRecord, StageStatus, StageTracker,
};
use crate::channel::{ChannelManager, ChannelSignal, ChannelTransport};
use crate::errors::{PipelineError, PipelineResult};
use crate::ids::{Clock, CorrelationIds, SystemClock, TimestampIds};
use crate::stage::{Stage, StageInput, StageOutput};
use crate::stream::{CompletionEvent, LogEvent, ProgressEvent, StreamedEvent};
use crate::worker::WorkerClient;

/// Tunables handed to the orchestrator, usually derived from `paperflow.toml`.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Base address for progress channels, e.g. `ws://127.0.0.1:8000`.
    pub ws_base: String,
    pub settle_delay: Duration,
    pub connect_timeout: Duration,
    pub log_capacity: usize,
    pub progress_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            ws_base: "ws://127.0.0.1:8000".to_string(),
            settle_delay: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            log_capacity: DEFAULT_LOG_CAPACITY,
            progress_capacity: DEFAULT_PROGRESS_CAPACITY,
        }
    }
}

/// External collaborators of the orchestrator.
pub struct OrchestratorDeps {
    pub worker: Arc<dyn WorkerClient>,
    pub transport: Arc<dyn ChannelTransport>,
    pub clock: Arc<dyn Clock>,
    /// `None` mints `{stage}-{millis}` ids from `clock`.
    pub ids: Option<Arc<dyn CorrelationIds>>,
}

impl OrchestratorDeps {
    /// Wall clock and `{stage}-{millis}` correlation ids.
    pub fn new(worker: Arc<dyn WorkerClient>, transport: Arc<dyn ChannelTransport>) -> Self {
        Self {
            worker,
            transport,
            clock: Arc::new(SystemClock),
            ids: None,
        }
    }

    /// Replace the clock. Default correlation ids follow it.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn CorrelationIds>) -> Self {
        self.ids = Some(ids);
        self
    }
}

/// What a call to [`Orchestrator::run`] amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(StageOutput),
    /// The stage was already running or completed; no request was made.
    Skipped(StageStatus),
    /// The pipeline was reset while the request was in flight and the
    /// worker's answer was dropped.
    Discarded,
}

impl RunOutcome {
    pub fn output(&self) -> Option<&StageOutput> {
        match self {
            Self::Completed(output) => Some(output),
            _ => None,
        }
    }
}

/// Read-only view of the whole pipeline, published after every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    /// Bumped on every publish.
    pub version: u64,
    pub stages: Vec<(Stage, StageRecord)>,
    pub is_connected: bool,
    pub current_progress: u8,
    pub latest_progress: Option<ProgressEvent>,
    pub logs: Vec<LogEvent>,
    pub error: Option<String>,
    pub pending: Vec<Stage>,
    pub sessions: Vec<(Stage, String)>,
}

impl PipelineSnapshot {
    pub fn record(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, record)| record)
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.record(stage).map(|r| r.status).unwrap_or_default()
    }

    pub fn running_stage(&self) -> Option<Stage> {
        self.stages
            .iter()
            .find(|(_, r)| r.status == StageStatus::Running)
            .map(|(stage, _)| *stage)
    }
}

/// Mutable pipeline state guarded by the orchestrator's lock.
pub(crate) struct PipelineState {
    pub(crate) tracker: StageTracker,
    pub(crate) sessions: SessionRegistry,
    pub(crate) queue: PendingQueue,
    pub(crate) error: Option<String>,
    pub(crate) is_connected: bool,
    /// Correlation id of the channel most recently opened.
    pub(crate) active_channel: Option<String>,
    /// Incremented on reset so in-flight runs can tell they are stale.
    pub(crate) epoch: u64,
    version: u64,
}

impl PipelineState {
    fn new(settings: &PipelineSettings) -> Self {
        Self {
            tracker: StageTracker::new(settings.log_capacity, settings.progress_capacity),
            sessions: SessionRegistry::new(),
            queue: PendingQueue::new(),
            error: None,
            is_connected: false,
            active_channel: None,
            epoch: 0,
            version: 0,
        }
    }

    fn reset(&mut self) {
        self.epoch += 1;
        self.tracker.reset();
        self.sessions.clear();
        self.queue.clear();
        self.error = None;
        self.is_connected = false;
        self.active_channel = None;
    }

    /// Apply a channel signal. Returns whether anything changed.
    ///
    /// Connection state follows only the active channel. Events are accepted
    /// from the active channel or from any channel minted for a stage in the
    /// current run, so trailing events still reach the history; events from
    /// channels discarded by a reset are dropped.
    fn apply_signal(&mut self, signal: ChannelSignal) -> bool {
        let is_active = self.active_channel.as_deref() == Some(signal.correlation_id());
        match signal {
            ChannelSignal::Connected { correlation_id } => {
                if !is_active {
                    debug!(%correlation_id, "Ignoring connect from inactive channel");
                    return false;
                }
                self.is_connected = true;
                true
            }
            ChannelSignal::Disconnected {
                correlation_id,
                error,
            } => {
                if !is_active {
                    debug!(%correlation_id, "Ignoring disconnect from inactive channel");
                    return false;
                }
                self.is_connected = false;
                if let Some(error) = error {
                    self.error = Some(error);
                }
                true
            }
            ChannelSignal::Event {
                correlation_id,
                event,
            } => {
                if !is_active && self.tracker.stage_for_correlation(&correlation_id).is_none() {
                    debug!(%correlation_id, kind = event.kind(), "Dropping event from stale channel");
                    return false;
                }
                match event {
                    StreamedEvent::Progress(e) => self.tracker.record_progress(e),
                    StreamedEvent::Log(e) => self.tracker.record_log(e),
                    StreamedEvent::Completion(e) => {
                        info!(%correlation_id, success = e.success, "Worker reported completion");
                        self.tracker.record_completion(e)
                    }
                }
                true
            }
        }
    }

    fn snapshot(&self) -> PipelineSnapshot {
        let progress = self.tracker.progress_history();
        PipelineSnapshot {
            version: self.version,
            stages: self.tracker.records(),
            is_connected: self.is_connected,
            current_progress: self.tracker.current_progress(),
            latest_progress: progress.last().cloned(),
            logs: self.tracker.logs(),
            error: self.error.clone(),
            pending: self.queue.stages(),
            sessions: self.sessions.entries(),
        }
    }
}

struct Inner {
    state: Mutex<PipelineState>,
    runner: StageRunner,
    channels: ChannelManager,
    snapshots: watch::Sender<PipelineSnapshot>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &mut PipelineState) {
        state.version += 1;
        self.snapshots.send_replace(state.snapshot());
    }
}

/// Coordinates the three-stage pipeline. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build an orchestrator and start its dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(deps: OrchestratorDeps, settings: PipelineSettings) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let state = PipelineState::new(&settings);
        let (snapshots, _) = watch::channel(state.snapshot());
        let ids: Arc<dyn CorrelationIds> = match deps.ids {
            Some(ids) => ids,
            None => Arc::new(TimestampIds::new(Arc::clone(&deps.clock))),
        };

        let inner = Arc::new(Inner {
            state: Mutex::new(state),
            runner: StageRunner::new(
                deps.worker,
                ids,
                Arc::clone(&deps.clock),
                settings.settle_delay,
            ),
            channels: ChannelManager::new(
                deps.transport,
                deps.clock,
                signal_tx,
                settings.ws_base.clone(),
                settings.connect_timeout,
            ),
            snapshots,
        });
        tokio::spawn(dispatch(Arc::downgrade(&inner), signal_rx));

        Self { inner }
    }

    /// Run `stage` with `input` and wait for the worker's answer.
    ///
    /// A no-op returning [`RunOutcome::Skipped`] when the stage is already
    /// running or completed. On success, a queued successor is started in the
    /// background before this returns.
    pub async fn run(&self, stage: Stage, input: StageInput) -> PipelineResult<RunOutcome> {
        let claim = {
            let mut state = self.inner.lock_state();
            let claim = self.inner.runner.claim(&mut state, stage, input);
            match &claim {
                Ok(Claim::Ready(_)) => self.inner.publish(&mut state),
                Err(e @ (PipelineError::MissingDependency { .. } | PipelineError::InvalidInput { .. })) => {
                    warn!(%stage, error = %e, "Stage refused");
                    state.error = Some(e.to_string());
                    self.inner.publish(&mut state);
                }
                _ => {}
            }
            claim?
        };

        let run = match claim {
            Claim::Ready(run) => run,
            Claim::Skipped(status) => return Ok(RunOutcome::Skipped(status)),
        };

        let (result, chained) = self.drive(&run).await;
        if let Some(next) = chained {
            self.spawn_chain(next);
        }
        result
    }

    /// Queue a stage to run automatically once its predecessor completes.
    pub fn queue(&self, input: StageInput) -> PipelineResult<()> {
        let stage = input.stage();
        input
            .validate()
            .map_err(|message| PipelineError::InvalidInput { stage, message })?;

        let mut state = self.inner.lock_state();
        state.queue.enqueue(input);
        info!(%stage, pending = state.queue.len(), "Stage queued");
        self.inner.publish(&mut state);
        Ok(())
    }

    /// Seed the session registry with an id obtained out of band.
    pub fn register_session(&self, stage: Stage, session_id: impl Into<String>) -> PipelineResult<()> {
        let session_id = session_id.into();
        let mut state = self.inner.lock_state();
        if state.tracker.status(stage) == StageStatus::Running {
            return Err(PipelineError::StageBusy {
                requested: stage,
                running: stage,
            });
        }
        state.sessions.set(stage, session_id.clone())?;
        info!(%stage, %session_id, "Session registered");
        self.inner.publish(&mut state);
        Ok(())
    }

    /// Close the channel and return every stage to idle with empty history,
    /// registry and queue. Work already submitted keeps running on the
    /// worker; its answer is discarded.
    pub fn reset(&self) {
        let mut state = self.inner.lock_state();
        state.reset();
        self.inner.channels.close();
        info!("Pipeline reset");
        self.inner.publish(&mut state);
    }

    /// Close the progress channel. Idempotent; also happens on drop.
    pub fn close(&self) {
        let mut state = self.inner.lock_state();
        if self.inner.channels.close() || state.is_connected {
            state.is_connected = false;
            self.inner.publish(&mut state);
        }
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.inner.lock_state().tracker.status(stage)
    }

    pub fn record(&self, stage: Stage) -> StageRecord {
        self.inner.lock_state().tracker.record(stage).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock_state().is_connected
    }

    pub fn is_channel_open(&self) -> bool {
        self.inner.channels.is_open()
    }

    pub fn current_progress(&self) -> u8 {
        self.inner.lock_state().tracker.current_progress()
    }

    pub fn logs(&self) -> Vec<LogEvent> {
        self.inner.lock_state().tracker.logs()
    }

    pub fn progress_history(&self) -> Vec<ProgressEvent> {
        self.inner.lock_state().tracker.progress_history()
    }

    pub fn last_completion(&self) -> Option<CompletionEvent> {
        self.inner.lock_state().tracker.last_completion().cloned()
    }

    /// Most recent pipeline-level error message.
    pub fn error(&self) -> Option<String> {
        self.inner.lock_state().error.clone()
    }

    pub fn session(&self, stage: Stage) -> Option<String> {
        self.inner
            .lock_state()
            .sessions
            .get(stage)
            .map(str::to_string)
    }

    pub fn output(&self, stage: Stage) -> Option<StageOutput> {
        self.inner.lock_state().tracker.record(stage).output.clone()
    }

    pub fn pending(&self) -> Vec<Stage> {
        self.inner.lock_state().queue.stages()
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.inner.snapshots.subscribe()
    }

    /// Execute a claimed run and settle its outcome.
    async fn drive(&self, run: &StageRun) -> (PipelineResult<RunOutcome>, Option<StageRun>) {
        let Some(result) = self
            .inner
            .runner
            .execute(&self.inner.state, &self.inner.channels, run)
            .await
        else {
            return (Ok(self.discard(run)), None);
        };

        let settled = {
            let mut state = self.inner.lock_state();
            let settled = self.inner.runner.settle(&mut state, run, &result);
            self.inner.publish(&mut state);
            settled
        };

        match settled {
            Settled::Completed { chained } => (result.map(RunOutcome::Completed), chained),
            Settled::Failed => (result.map(RunOutcome::Completed), None),
            Settled::Discarded => (Ok(self.discard(run)), None),
        }
    }

    /// Drop a run made stale by a reset, closing its channel if it is still
    /// the open one.
    fn discard(&self, run: &StageRun) -> RunOutcome {
        if self.inner.channels.active_correlation_id().as_deref()
            == Some(run.correlation_id.as_str())
        {
            self.inner.channels.close();
        }
        RunOutcome::Discarded
    }

    /// Run auto-chained stages one after another on a background task.
    fn spawn_chain(&self, first: StageRun) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut next = Some(first);
            while let Some(run) = next.take() {
                let (result, chained) = this.drive(&run).await;
                if let Err(e) = result {
                    warn!(stage = %run.stage, error = %e, "Queued stage failed");
                }
                next = chained;
            }
        });
    }
}

/// Apply channel signals to the state until every sender is gone or the
/// orchestrator is dropped.
async fn dispatch(inner: Weak<Inner>, mut signals: mpsc::UnboundedReceiver<ChannelSignal>) {
    while let Some(signal) = signals.recv().await {
        let Some(strong) = inner.upgrade() else {
            break;
        };
        let mut state = strong.lock_state();
        if state.apply_signal(signal) {
            strong.publish(&mut state);
        }
    }
    debug!("Signal dispatcher stopped");
}
