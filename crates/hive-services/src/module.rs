//! Local compute module: counters, the engine seam and job types.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use hive_core::{ModuleState, NodeId, TaskId};

/// Something that turns a task payload into a result.
pub trait ComputeEngine: Send + Sync + 'static {
    fn process(&self, payload: Bytes) -> impl Future<Output = Result<Bytes, ComputeError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("i/o error talking to the engine: {0}")]
    Io(#[from] std::io::Error),
    #[error("exit code {code}: {stderr}")]
    Failed { code: i32, stderr: String },
    #[error("payload rejected: {0}")]
    Rejected(String),
}

/// A task for the local engine.
#[derive(Debug, Clone)]
pub struct ComputeJob {
    pub task_id: TaskId,
    pub name: String,
    pub payload: Bytes,
    /// Coordinator that dispatched it. None = this node scheduled it itself.
    pub origin: Option<NodeId>,
}

#[derive(Debug)]
pub struct ComputeOutcome {
    pub task_id: TaskId,
    pub origin: Option<NodeId>,
    pub result: Result<Bytes, ComputeError>,
    pub elapsed: Duration,
}

/// Benchmark score from one timed run: runs per second.
pub fn benchmark_score(elapsed: Duration) -> f64 {
    1.0 / elapsed.max(Duration::from_millis(1)).as_secs_f64()
}

/// This node's module counters.
#[derive(Debug, Default)]
pub struct ModuleTracker {
    state: ModuleState,
}

impl ModuleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// A task was handed to the engine.
    pub fn accept(&mut self) -> ModuleState {
        self.state.queued += 1;
        self.state
    }

    /// The engine finished a task, successfully or not.
    pub fn finish(&mut self) -> ModuleState {
        self.state.complete += 1;
        self.state
    }

    pub fn set_benchmark(&mut self, score: f64) -> ModuleState {
        self.state.benchmark = if score.is_finite() && score > 0.0 {
            score
        } else {
            0.0
        };
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_grow() {
        let mut m = ModuleTracker::new();
        m.accept();
        m.accept();
        let s = m.finish();
        assert_eq!((s.queued, s.complete), (2, 1));
        assert_eq!(s.delta(), 1);
    }

    #[test]
    fn benchmark_is_runs_per_second() {
        assert!((benchmark_score(Duration::from_millis(250)) - 4.0).abs() < 1e-9);
        assert!((benchmark_score(Duration::ZERO) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_benchmark_means_not_capable() {
        let mut m = ModuleTracker::new();
        assert_eq!(m.set_benchmark(f64::NAN).benchmark, 0.0);
        assert_eq!(m.set_benchmark(-1.0).benchmark, 0.0);
        assert_eq!(m.set_benchmark(2.5).benchmark, 2.5);
    }
}
