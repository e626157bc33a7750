//! Clock and correlation-id sources injected into the orchestrator.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::stage::Stage;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mints the client-side id that addresses a stage's streaming channel.
pub trait CorrelationIds: Send + Sync {
    fn mint(&self, stage: Stage) -> String;
}

/// `{stage}-{millis}` ids. The millisecond component is strictly increasing
/// per generator, so two ids minted within the same millisecond still differ.
pub struct TimestampIds {
    clock: Arc<dyn Clock>,
    last_millis: AtomicI64,
}

impl TimestampIds {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last_millis: AtomicI64::new(i64::MIN),
        }
    }
}

impl Default for TimestampIds {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl CorrelationIds for TimestampIds {
    fn mint(&self, stage: Stage) -> String {
        let now = self.clock.now().timestamp_millis();
        let mut prev = self.last_millis.load(Ordering::SeqCst);
        let millis = loop {
            let candidate = if now > prev { now } else { prev + 1 };
            match self.last_millis.compare_exchange(
                prev,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break candidate,
                Err(actual) => prev = actual,
            }
        };
        format!("{}-{}", stage, millis)
    }
}
