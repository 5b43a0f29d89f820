//! Workers: units of concurrency that pull from an input channel, apply a
//! transform, and push to an output channel until the channel closes.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::channel::ClosableChannel;
use crate::config::FailurePolicy;
use crate::error::{PipelineError, Result};

/// Failure of a single transform application.
#[derive(Debug)]
pub struct TransformError {
    message: String,
}

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransformError {}

impl From<String> for TransformError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for TransformError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// A stage's processing capability: anything that can turn an input item
/// into an output item, or fail with a [`TransformError`].
#[async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, item: I) -> std::result::Result<O, TransformError>;
}

#[async_trait]
impl<I, O, F> Transform<I, O> for F
where
    F: Fn(I) -> std::result::Result<O, TransformError> + Send + Sync,
    I: Send + 'static,
    O: Send,
{
    async fn apply(&self, item: I) -> std::result::Result<O, TransformError> {
        (self)(item)
    }
}

/// Wrap an infallible function as a [`Transform`].
pub fn transform_fn<I, O, F>(f: F) -> impl Transform<I, O>
where
    F: Fn(I) -> O + Send + Sync,
    I: Send + 'static,
    O: Send,
{
    move |item: I| Ok(f(item))
}

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Task launched, no side effects yet.
    Starting = 0,
    /// Pulling, transforming, and pushing items.
    Running = 1,
    /// Sentinel observed; exiting without further output.
    Draining = 2,
    /// Terminal; the task has exited.
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Starting,
            1 => WorkerState::Running,
            2 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }
}

/// Per-worker counters, aggregated into the stage report.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Items successfully transformed and pushed downstream.
    pub processed: u64,
    /// Items dropped under the skip-and-log policy.
    pub skipped: u64,
    /// Time spent applying the transform.
    pub busy: Duration,
}

/// Handle to a spawned worker task.
pub struct WorkerHandle {
    id: usize,
    state: Arc<AtomicU8>,
    handle: JoinHandle<Result<WorkerStats>>,
}

impl WorkerHandle {
    /// Worker index within its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Current lifecycle state. Best-effort snapshot for observability.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Wait for the worker task to exit and return its stats.
    pub async fn join(self, stage: &str) -> Result<WorkerStats> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::worker(
                stage,
                format!("worker {} panicked: {}", self.id, e),
            )),
        }
    }
}

/// Spawn a pool of `pool_size` workers sharing one input and one output
/// channel. Workers retire when their input channel closes and drains; under
/// fail-fast the first transform failure cancels `token`, which unblocks
/// every suspended channel operation in the run.
pub fn spawn_pool<I, O>(
    stage: Arc<str>,
    input: Arc<ClosableChannel<I>>,
    output: Arc<ClosableChannel<O>>,
    transform: Arc<dyn Transform<I, O>>,
    pool_size: usize,
    policy: FailurePolicy,
    token: CancellationToken,
) -> Vec<WorkerHandle>
where
    I: Send + 'static,
    O: Send + 'static,
{
    (0..pool_size)
        .map(|id| {
            let state = Arc::new(AtomicU8::new(WorkerState::Starting as u8));
            let loop_state = state.clone();
            let stage = stage.clone();
            let input = input.clone();
            let output = output.clone();
            let transform = transform.clone();
            let token = token.clone();

            let handle = tokio::spawn(async move {
                let result = worker_loop(
                    id,
                    &stage,
                    input,
                    output,
                    transform,
                    policy,
                    &token,
                    &loop_state,
                )
                .await;
                loop_state.store(WorkerState::Stopped as u8, Ordering::Release);
                if let Err(e) = &result {
                    if !matches!(e, PipelineError::Cancelled) {
                        error!("stage '{}' worker {}: {}", stage, id, e);
                        token.cancel();
                    }
                }
                result
            });

            WorkerHandle { id, state, handle }
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop<I, O>(
    id: usize,
    stage: &str,
    input: Arc<ClosableChannel<I>>,
    output: Arc<ClosableChannel<O>>,
    transform: Arc<dyn Transform<I, O>>,
    policy: FailurePolicy,
    token: &CancellationToken,
    state: &AtomicU8,
) -> Result<WorkerStats>
where
    I: Send + 'static,
    O: Send + 'static,
{
    let mut stats = WorkerStats::default();
    state.store(WorkerState::Running as u8, Ordering::Release);

    loop {
        let item = tokio::select! {
            _ = token.cancelled() => return Err(PipelineError::Cancelled),
            item = input.recv() => item,
        };

        let Some(item) = item else {
            // Sentinel consumed: drain and exit without further output.
            state.store(WorkerState::Draining as u8, Ordering::Release);
            break;
        };

        let apply_start = Instant::now();
        // Treat a panicking transform as a failed one so the chosen failure
        // policy applies and no channel is left waiting on a lost ack.
        let applied = AssertUnwindSafe(transform.apply(item)).catch_unwind().await;
        stats.busy += apply_start.elapsed();

        let failure = match applied {
            Ok(Ok(result)) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(PipelineError::Cancelled),
                    res = output.put(result) => res?,
                }
                input.task_done();
                stats.processed += 1;
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic),
        };

        match policy {
            FailurePolicy::FailFast => {
                input.task_done();
                return Err(PipelineError::transform(stage, failure));
            }
            FailurePolicy::SkipAndLog => {
                warn!("stage '{}' worker {}: skipping item: {}", stage, id, failure);
                input.task_done();
                stats.skipped += 1;
            }
        }
    }

    debug!(
        "stage '{}' worker {}: exiting ({} processed, {} skipped)",
        stage, id, stats.processed, stats.skipped
    );
    Ok(stats)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("transform panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("transform panicked: {}", message)
    } else {
        "transform panicked".to_string()
    }
}
