use std::collections::BTreeMap;

use crate::errors::{PipelineError, PipelineResult};
use crate::stage::Stage;

/// Session identifiers minted by the remote worker, one per completed stage.
///
/// Write-once for the lifetime of a pipeline run; only [`SessionRegistry::clear`]
/// (driven by the orchestrator's reset) removes them.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<Stage, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, stage: Stage, session_id: impl Into<String>) -> PipelineResult<()> {
        if self.sessions.contains_key(&stage) {
            return Err(PipelineError::SessionAlreadySet { stage });
        }
        self.sessions.insert(stage, session_id.into());
        Ok(())
    }

    pub fn get(&self, stage: Stage) -> Option<&str> {
        self.sessions.get(&stage).map(String::as_str)
    }

    /// Session ids for every dependency of `stage`, in dependency order.
    ///
    /// Fails with `MissingDependency` naming the first absent dependency.
    pub fn dependencies_for(&self, stage: Stage) -> PipelineResult<Vec<(Stage, String)>> {
        stage
            .dependencies()
            .iter()
            .map(|dep| {
                self.get(*dep)
                    .map(|id| (*dep, id.to_string()))
                    .ok_or(PipelineError::MissingDependency {
                        stage,
                        dependency: *dep,
                    })
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn entries(&self) -> Vec<(Stage, String)> {
        self.sessions
            .iter()
            .map(|(stage, id)| (*stage, id.clone()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
