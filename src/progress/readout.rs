//! Readout aggregation
//!
//! Reader tasks for every stage publish records concurrently; the terminal
//! UI pulls a consistent snapshot at whatever cadence it likes. No smoothing
//! or averaging happens here. The aggregator's only job is atomic
//! collection, so a reader never observes a record mid-update.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::command::StageRole;
use crate::progress::ProgressRecord;

/// Global pipeline lifecycle state, republished on every supervisor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Launching,
    Active,
    Completed,
    Aborted,
}

/// Observable stage lifecycle events, in the order they happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEventKind {
    Launched,
    Exited { code: i32 },
    /// Graceful termination signal sent during teardown
    Terminated,
    /// Forced kill after the grace period expired
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageEvent {
    pub role: StageRole,
    pub kind: StageEventKind,
}

/// Consistent view of the whole pipeline at one instant.
#[derive(Debug, Clone)]
pub struct ReadoutSnapshot {
    pub state: PipelineState,
    /// Latest record per stage role
    pub records: BTreeMap<StageRole, ProgressRecord>,
}

#[derive(Debug)]
struct ReadoutInner {
    state: PipelineState,
    records: BTreeMap<StageRole, ProgressRecord>,
    events: Vec<StageEvent>,
}

/// Shared, lock-protected progress aggregator.
#[derive(Debug, Clone)]
pub struct Readout {
    inner: Arc<Mutex<ReadoutInner>>,
}

impl Readout {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReadoutInner {
                state: PipelineState::Idle,
                records: BTreeMap::new(),
                events: Vec::new(),
            })),
        }
    }

    /// Replace the stage's record wholesale. Older records are discarded,
    /// never merged.
    pub fn publish(&self, record: ProgressRecord) {
        let mut inner = self.inner.lock().expect("readout lock poisoned");
        inner.records.insert(record.role, record);
    }

    pub fn set_state(&self, state: PipelineState) {
        let mut inner = self.inner.lock().expect("readout lock poisoned");
        inner.state = state;
    }

    pub fn record_event(&self, role: StageRole, kind: StageEventKind) {
        let mut inner = self.inner.lock().expect("readout lock poisoned");
        inner.events.push(StageEvent { role, kind });
    }

    /// Atomic snapshot for the UI: all records cloned under one lock.
    pub fn snapshot(&self) -> ReadoutSnapshot {
        let inner = self.inner.lock().expect("readout lock poisoned");
        ReadoutSnapshot {
            state: inner.state,
            records: inner.records.clone(),
        }
    }

    /// Stage lifecycle events in the order they happened.
    pub fn events(&self) -> Vec<StageEvent> {
        self.inner
            .lock()
            .expect("readout lock poisoned")
            .events
            .clone()
    }
}

impl Default for Readout {
    fn default() -> Self {
        Self::new()
    }
}
