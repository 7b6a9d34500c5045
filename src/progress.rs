use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl Progress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Units finished so far, successfully or not.
    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Running,
    Completed,
    Failed,
}

/// What a caller sees of a run at any instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub phase: RunPhase,
    pub is_running: bool,
    pub progress: Option<Progress>,
    pub error: Option<String>,
    pub summary: Option<String>,
}

impl RunSnapshot {
    pub fn idle() -> Self {
        Self {
            phase: RunPhase::Idle,
            is_running: false,
            progress: None,
            error: None,
            summary: None,
        }
    }
}

impl Default for RunSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

/// Read-only view of a run's progress, backed by a watch channel.
///
/// Only the orchestrator writes to it; any number of observers may
/// [`subscribe`](Self::subscribe) or take a [`snapshot`](Self::snapshot).
#[derive(Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<RunSnapshot>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunSnapshot::idle());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.tx.borrow().clone()
    }

    pub(crate) fn start(&self) {
        self.tx.send_replace(RunSnapshot {
            phase: RunPhase::Running,
            is_running: true,
            progress: Some(Progress::default()),
            error: None,
            summary: None,
        });
    }

    pub(crate) fn update(&self, progress: Progress) {
        self.tx.send_modify(|snapshot| snapshot.progress = Some(progress));
    }

    pub(crate) fn complete(&self, progress: Progress, summary: String) {
        self.tx.send_replace(RunSnapshot {
            phase: RunPhase::Completed,
            is_running: false,
            progress: Some(progress),
            error: None,
            summary: Some(summary),
        });
    }

    /// Marks the run failed. The last progress seen is kept so observers
    /// can tell how far the run got.
    pub(crate) fn fail(&self, error: String) {
        self.tx.send_modify(|snapshot| {
            snapshot.phase = RunPhase::Failed;
            snapshot.is_running = false;
            snapshot.error = Some(error);
            snapshot.summary = None;
        });
    }
}
