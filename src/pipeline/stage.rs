//! Runtime state of one launched stage

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::process::Child;

use crate::command::ProcessSpec;

/// Lines of diagnostic output kept per stage for failure reports.
pub const TAIL_LINES: usize = 20;

/// Lifecycle of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Starting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// One pipeline stage and everything the controller tracks about it.
/// Born `Pending` with no process; the controller moves it through
/// `Starting` and `Running` as the launch sequence reaches it. Owned
/// exclusively by the pipeline controller; reader tasks only hold the
/// shared liveness clock and tail buffer.
pub struct StageRuntime {
    pub spec: ProcessSpec,
    /// Present once the stage has been spawned
    pub child: Option<Child>,
    pub state: StageState,
    /// Updated by reader tasks whenever the stage emits output; the
    /// watchdog treats a stage with neither output nor exit as hung
    pub liveness: Arc<Mutex<Instant>>,
    /// Last diagnostic lines, for the failure summary
    pub tail: Arc<Mutex<VecDeque<String>>>,
    pub exit_code: Option<i32>,
}

impl StageRuntime {
    pub fn new(spec: &ProcessSpec) -> Self {
        Self {
            spec: spec.clone(),
            child: None,
            state: StageState::Pending,
            liveness: Arc::new(Mutex::new(Instant::now())),
            tail: Arc::new(Mutex::new(VecDeque::new())),
            exit_code: None,
        }
    }

    pub fn tail_lines(&self) -> Vec<String> {
        match self.tail.lock() {
            Ok(tail) => tail.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Append a line to a stage's tail buffer, keeping only the newest lines.
pub fn push_tail(tail: &Arc<Mutex<VecDeque<String>>>, line: &str) {
    if line.is_empty() {
        return;
    }
    if let Ok(mut tail) = tail.lock() {
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }
}
