//! Compute executor: runs jobs on the local engine with bounded concurrency.
//!
//! Jobs arrive from the mesh loop; every outcome goes back to it. The
//! executor never talks to peers itself.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hive_core::config::ComputeSettings;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};

use crate::module::{benchmark_score, ComputeEngine, ComputeError, ComputeJob, ComputeOutcome};

/// Size of the generated benchmark sample when no file is configured.
const GENERATED_SAMPLE_SIZE: usize = 256 * 1024;

/// Runs an external program per task: payload on stdin, result from stdout.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    command: String,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl CommandEngine {
    pub fn new(settings: &ComputeSettings) -> Self {
        Self {
            command: settings.command.clone(),
            args: settings.args.clone(),
            work_dir: settings.work_dir.clone(),
        }
    }
}

impl ComputeEngine for CommandEngine {
    async fn process(&self, payload: Bytes) -> Result<Bytes, ComputeError> {
        // Ensure work_dir exists.
        let _ = tokio::fs::create_dir_all(&self.work_dir).await;

        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ComputeError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        // Feed stdin while stdout drains, or large payloads fill both pipes.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        if !output.status.success() {
            return Err(ComputeError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        fed?;
        Ok(Bytes::from(output.stdout))
    }
}

pub fn max_concurrency(settings: &ComputeSettings) -> usize {
    if settings.max_concurrent_tasks == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        settings.max_concurrent_tasks as usize
    }
}

/// Runs until the job channel closes.
pub async fn run<E: ComputeEngine>(
    engine: Arc<E>,
    max_tasks: usize,
    mut jobs: mpsc::UnboundedReceiver<ComputeJob>,
    outcomes: mpsc::UnboundedSender<ComputeOutcome>,
) {
    let semaphore = Arc::new(Semaphore::new(max_tasks.max(1)));
    tracing::info!(max_concurrent = max_tasks, "compute executor started");

    while let Some(job) = jobs.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break, // semaphore closed
        };

        let engine = engine.clone();
        let outcomes = outcomes.clone();
        tokio::spawn(async move {
            let ComputeJob {
                task_id,
                name,
                payload,
                origin,
            } = job;
            let start = Instant::now();
            let result = engine.process(payload).await;
            let elapsed = start.elapsed();

            match &result {
                Ok(output) => tracing::info!(
                    task = %task_id.short(),
                    name = %name,
                    bytes = output.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "compute task finished"
                ),
                Err(e) => tracing::warn!(task = %task_id.short(), name = %name, error = %e, "compute task failed"),
            }

            let _ = outcomes.send(ComputeOutcome {
                task_id,
                origin,
                result,
                elapsed,
            });
            drop(permit);
        });
    }
    tracing::debug!("compute executor stopped");
}

/// Load the benchmark sample, or generate one.
pub async fn benchmark_sample(path: Option<&Path>) -> Result<Bytes, ComputeError> {
    match path {
        Some(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        None => Ok(Bytes::from(
            (0..GENERATED_SAMPLE_SIZE)
                .map(|i| (i % 251) as u8)
                .collect::<Vec<_>>(),
        )),
    }
}

/// Time one run of the engine on `sample`. A failed run scores zero.
pub async fn run_benchmark<E: ComputeEngine>(engine: &E, sample: Bytes) -> (f64, Duration) {
    let start = Instant::now();
    let result = engine.process(sample).await;
    let elapsed = start.elapsed();
    match result {
        Ok(_) => (benchmark_score(elapsed), elapsed),
        Err(e) => {
            tracing::warn!(error = %e, "benchmark failed, node will not take work");
            (0.0, elapsed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::TaskId;

    struct Upper;

    impl ComputeEngine for Upper {
        async fn process(&self, payload: Bytes) -> Result<Bytes, ComputeError> {
            if payload.is_empty() {
                return Err(ComputeError::Rejected("empty".into()));
            }
            Ok(Bytes::from(payload.to_ascii_uppercase()))
        }
    }

    #[tokio::test]
    async fn executor_reports_every_outcome() {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(Arc::new(Upper), 2, job_rx, out_tx));

        for (id, body) in [("t1", &b"abc"[..]), ("t2", &b""[..])] {
            job_tx
                .send(ComputeJob {
                    task_id: TaskId::new(id),
                    name: id.into(),
                    payload: Bytes::copy_from_slice(body),
                    origin: None,
                })
                .unwrap();
        }

        let mut ok = 0;
        let mut failed = 0;
        for _ in 0..2 {
            let outcome = out_rx.recv().await.unwrap();
            match outcome.result {
                Ok(bytes) => {
                    assert_eq!(&bytes[..], b"ABC");
                    ok += 1;
                }
                Err(ComputeError::Rejected(_)) => failed += 1,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!((ok, failed), (1, 1));
    }

    #[tokio::test]
    async fn benchmark_of_failing_engine_scores_zero() {
        let (score, _) = run_benchmark(&Upper, Bytes::new()).await;
        assert_eq!(score, 0.0);
        let (score, _) = run_benchmark(&Upper, Bytes::from_static(b"x")).await;
        assert!(score > 0.0);
    }

    #[tokio::test]
    async fn command_engine_pipes_stdin_to_stdout() {
        let settings = ComputeSettings {
            command: "cat".into(),
            work_dir: std::env::temp_dir(),
            ..ComputeSettings::default()
        };
        let engine = CommandEngine::new(&settings);
        let out = engine.process(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(&out[..], b"hello");
    }

    #[tokio::test]
    async fn missing_command_is_a_spawn_error() {
        let settings = ComputeSettings {
            command: "/nonexistent/hive-engine".into(),
            work_dir: std::env::temp_dir(),
            ..ComputeSettings::default()
        };
        let engine = CommandEngine::new(&settings);
        assert!(matches!(
            engine.process(Bytes::from_static(b"x")).await,
            Err(ComputeError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn generated_sample_is_used_without_file() {
        let sample = benchmark_sample(None).await.unwrap();
        assert_eq!(sample.len(), GENERATED_SAMPLE_SIZE);
    }
}
