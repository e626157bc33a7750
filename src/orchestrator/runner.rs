//! Stage runner.
//!
//! Running a stage is split into three steps so that the state lock is never
//! held across an await:
//!
//! 1. [`StageRunner::claim`] checks dependencies and single-flight, mints the
//!    correlation id and marks the stage running (under the state lock).
//! 2. [`StageRunner::execute`] opens the progress channel, waits the settle
//!    delay and submits the request to the worker. The lock is only taken to
//!    check the run is still current; a reset before the submit stops it.
//! 3. [`StageRunner::settle`] writes the session id and the terminal status,
//!    and claims the next queued stage when it is due (under the state lock).

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use super::pipeline::PipelineState;
use super::state::StageStatus;
use crate::channel::ChannelManager;
use crate::errors::{PipelineError, PipelineResult};
use crate::ids::{Clock, CorrelationIds};
use crate::stage::{Stage, StageInput, StageOutput};
use crate::worker::{StageRequest, WorkerClient};

/// A stage that has been claimed and is ready to hit the network.
#[derive(Debug, Clone)]
pub(crate) struct StageRun {
    pub stage: Stage,
    pub correlation_id: String,
    /// Pipeline epoch at claim time; a reset in between makes the run stale.
    pub epoch: u64,
    pub dependencies: Vec<(Stage, String)>,
    pub input: StageInput,
}

pub(crate) enum Claim {
    Ready(StageRun),
    /// The stage was already running or completed; nothing was done.
    Skipped(StageStatus),
}

pub(crate) enum Settled {
    Completed { chained: Option<StageRun> },
    Failed,
    /// The pipeline was reset while the request was in flight.
    Discarded,
}

pub(crate) struct StageRunner {
    worker: Arc<dyn WorkerClient>,
    ids: Arc<dyn CorrelationIds>,
    clock: Arc<dyn Clock>,
    settle_delay: Duration,
}

impl StageRunner {
    pub fn new(
        worker: Arc<dyn WorkerClient>,
        ids: Arc<dyn CorrelationIds>,
        clock: Arc<dyn Clock>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            worker,
            ids,
            clock,
            settle_delay,
        }
    }

    /// Reserve `stage` for execution. Nothing is touched on error.
    pub fn claim(
        &self,
        state: &mut PipelineState,
        stage: Stage,
        input: StageInput,
    ) -> PipelineResult<Claim> {
        if input.stage() != stage {
            return Err(PipelineError::InvalidInput {
                stage,
                message: format!("input is for stage {}", input.stage()),
            });
        }
        input
            .validate()
            .map_err(|message| PipelineError::InvalidInput { stage, message })?;

        let status = state.tracker.status(stage);
        if matches!(status, StageStatus::Running | StageStatus::Completed) {
            info!(%stage, %status, "Stage already {}, ignoring run request", status);
            return Ok(Claim::Skipped(status));
        }
        if state.sessions.get(stage).is_some() {
            return Err(PipelineError::SessionAlreadySet { stage });
        }
        let dependencies = state.sessions.dependencies_for(stage)?;

        let correlation_id = self.ids.mint(stage);
        state.tracker.begin(stage, &correlation_id, self.clock.now())?;
        state.active_channel = Some(correlation_id.clone());
        state.is_connected = false;
        state.error = None;
        info!(%stage, %correlation_id, "Stage running");

        Ok(Claim::Ready(StageRun {
            stage,
            correlation_id,
            epoch: state.epoch,
            dependencies,
            input,
        }))
    }

    /// Open the channel and perform the request/response call.
    ///
    /// Returns `None` without touching the network when the pipeline was
    /// reset after the claim, either before the channel opens or during the
    /// settle delay.
    pub async fn execute(
        &self,
        state: &Mutex<PipelineState>,
        channels: &ChannelManager,
        run: &StageRun,
    ) -> Option<PipelineResult<StageOutput>> {
        {
            // Opened under the lock so a concurrent reset closes it
            let state = state.lock().unwrap_or_else(|e| e.into_inner());
            if state.epoch != run.epoch {
                warn!(
                    stage = %run.stage,
                    correlation_id = %run.correlation_id,
                    "Pipeline was reset before stage started"
                );
                return None;
            }
            channels.open(run.stage, &run.correlation_id);
        }

        // Best effort: give the channel a head start on the worker's first events
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        let current = {
            let state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.epoch == run.epoch
        };
        if !current {
            warn!(
                stage = %run.stage,
                correlation_id = %run.correlation_id,
                "Pipeline was reset during settle delay, not submitting"
            );
            return None;
        }

        let result = self
            .worker
            .submit(StageRequest {
                stage: run.stage,
                correlation_id: run.correlation_id.clone(),
                dependencies: run.dependencies.clone(),
                input: run.input.clone(),
            })
            .await
            .and_then(|response| response.into_output(run.stage, &run.correlation_id));
        Some(result)
    }

    /// Apply the outcome of [`execute`](Self::execute) to the pipeline state.
    pub fn settle(
        &self,
        state: &mut PipelineState,
        run: &StageRun,
        result: &PipelineResult<StageOutput>,
    ) -> Settled {
        let stage = run.stage;
        if state.epoch != run.epoch {
            warn!(
                %stage,
                correlation_id = %run.correlation_id,
                "Pipeline was reset while stage was in flight, discarding result"
            );
            return Settled::Discarded;
        }

        let now = self.clock.now();
        match result {
            Ok(output) => {
                if let Err(e) = state.sessions.set(stage, output.session_id.clone()) {
                    warn!(%stage, error = %e, "Keeping existing session");
                }
                if let Err(e) = state.tracker.complete(stage, output.clone(), now) {
                    warn!(%stage, error = %e, "Could not mark stage completed");
                }
                info!(%stage, session_id = %output.session_id, "Stage completed");
                Settled::Completed {
                    chained: self.chain_next(state, stage),
                }
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(err) = state.tracker.fail(stage, &message, now) {
                    warn!(%stage, error = %err, "Could not mark stage failed");
                }
                warn!(%stage, error = %message, "Stage failed");
                state.error = Some(message);
                Settled::Failed
            }
        }
    }

    /// Claim the queued successor of `finished`, if it is at the head of the
    /// queue and still idle.
    fn chain_next(&self, state: &mut PipelineState, finished: Stage) -> Option<StageRun> {
        let next = finished.next()?;
        if state.queue.peek() != Some(next) || state.tracker.status(next) != StageStatus::Idle {
            return None;
        }
        let entry = state.queue.dequeue_next()?;

        match self.claim(state, next, entry.input) {
            Ok(Claim::Ready(run)) => {
                info!(stage = %next, after = %finished, "Auto-chaining queued stage");
                Some(run)
            }
            Ok(Claim::Skipped(_)) => None,
            Err(e) => {
                warn!(stage = %next, error = %e, "Queued stage could not start");
                state.error = Some(e.to_string());
                None
            }
        }
    }
}
