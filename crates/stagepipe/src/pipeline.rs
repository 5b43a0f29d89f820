//! Pipeline driver: composes stages of worker pools and channels, drives
//! startup, feed, drain, and orderly shutdown in stage order.
//!
//! Shutdown is strictly sequential by stage: a downstream channel is only
//! closed once the upstream channel has been fully drained. This prevents
//! downstream workers from exiting while upstream work is still being
//! produced, and prevents the feeder from suspending forever on a consumer
//! that has already exited.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::channel::ClosableChannel;
use crate::config::{validate, FailurePolicy, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::worker::{spawn_pool, Transform, WorkerHandle};

/// A stage waiting to be launched. The closure owns the stage's typed
/// channels and transform; everything after launch is type-erased.
struct StagePlan {
    launch: Box<dyn FnOnce(FailurePolicy, CancellationToken) -> LaunchedStage + Send>,
}

/// A running stage: its worker handles plus type-erased close/drain hooks
/// for its input channel.
struct LaunchedStage {
    name: String,
    pool_size: usize,
    workers: Vec<WorkerHandle>,
    close_input: Box<dyn Fn() -> BoxFuture<'static, ()> + Send>,
    input_drained: Box<dyn Fn() -> BoxFuture<'static, ()> + Send>,
}

/// Builder for a typed pipeline. Each `add_stage` call wires the previous
/// stage's output channel as the new stage's input channel.
pub struct PipelineBuilder<I, O> {
    config: PipelineConfig,
    head: Arc<ClosableChannel<I>>,
    tail: Arc<ClosableChannel<O>>,
    stages: Vec<StagePlan>,
}

impl<I: Send + 'static> PipelineBuilder<I, I> {
    /// Start a builder for a pipeline fed with items of type `I`.
    pub fn new(config: PipelineConfig) -> Self {
        let head = Arc::new(ClosableChannel::with_capacity(
            config.get_channel_capacity(),
        ));
        Self {
            config,
            head: head.clone(),
            tail: head,
            stages: Vec::new(),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> PipelineBuilder<I, O> {
    /// Append a stage with `pool_size` workers running `transform`.
    /// A pool size of 0 uses the configured default.
    pub fn add_stage<T, U>(
        mut self,
        name: impl Into<String>,
        pool_size: usize,
        transform: T,
    ) -> PipelineBuilder<I, U>
    where
        T: Transform<O, U> + 'static,
        U: Send + 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        let pool_size = if pool_size == 0 {
            self.config.get_default_pool_size()
        } else {
            pool_size
        };
        debug!("added stage '{}' (pool size {})", name, pool_size);

        let input = self.tail.clone();
        let output = Arc::new(ClosableChannel::with_capacity(
            self.config.get_channel_capacity(),
        ));
        let transform: Arc<dyn Transform<O, U>> = Arc::new(transform);

        let launch_output = output.clone();
        let launch = Box::new(move |policy: FailurePolicy, token: CancellationToken| {
            let workers = spawn_pool(
                name.clone(),
                input.clone(),
                launch_output,
                transform,
                pool_size,
                policy,
                token,
            );
            let close_channel = input.clone();
            let drain_channel = input;
            LaunchedStage {
                name: name.to_string(),
                pool_size,
                workers,
                close_input: Box::new(move || {
                    let channel = close_channel.clone();
                    async move { channel.close_workers(pool_size).await }.boxed()
                }),
                input_drained: Box::new(move || {
                    let channel = drain_channel.clone();
                    async move { channel.join().await }.boxed()
                }),
            }
        });

        self.stages.push(StagePlan { launch });
        PipelineBuilder {
            config: self.config,
            head: self.head,
            tail: output,
            stages: self.stages,
        }
    }

    /// Finish the builder.
    pub fn build(self) -> Pipeline<I, O> {
        Pipeline {
            config: self.config,
            head: self.head,
            sink: self.tail,
            stages: self.stages,
        }
    }
}

/// A wired pipeline, ready to run once with a sequence of input items.
pub struct Pipeline<I, O> {
    config: PipelineConfig,
    head: Arc<ClosableChannel<I>>,
    sink: Arc<ClosableChannel<O>>,
    stages: Vec<StagePlan>,
}

impl<I: Send + 'static> Pipeline<I, I> {
    /// Start building a pipeline fed with items of type `I`.
    pub fn builder(config: PipelineConfig) -> PipelineBuilder<I, I> {
        PipelineBuilder::new(config)
    }
}

impl<I: Send + 'static, O: Send + 'static> Pipeline<I, O> {
    /// Run the pipeline: start all worker pools, feed `items` into the first
    /// stage, drain and close each channel in stage order, and collect the
    /// final results.
    ///
    /// Under the fail-fast policy the first transform failure aborts the
    /// whole run: every suspended channel operation is unblocked via the
    /// run's cancellation token and the root-cause error is returned.
    pub async fn run(self, items: impl IntoIterator<Item = I>) -> Result<RunOutput<O>> {
        validate(&self.config)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();
        let token = CancellationToken::new();
        let policy = self.config.failure_policy;

        info!(
            "pipeline {}: starting {} stages (policy: {:?})",
            run_id,
            self.stages.len(),
            policy
        );

        let launched: Vec<LaunchedStage> = self
            .stages
            .into_iter()
            .map(|plan| (plan.launch)(policy, token.clone()))
            .collect();

        // The collector drains the sink concurrently with the run, so a
        // bounded sink never backs up the last stage.
        let collector = {
            let sink = self.sink.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut collected = Vec::new();
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        item = sink.recv() => match item {
                            Some(value) => {
                                collected.push(value);
                                sink.task_done();
                            }
                            None => break,
                        },
                    }
                }
                collected
            })
        };

        // Feed, then shut down strictly in stage order. Every wait races the
        // cancellation token so a failed worker cannot leave this suspended.
        let head = &self.head;
        let drive_token = &token;
        let drive_result: Result<u64> = async {
            let mut fed = 0u64;
            for item in items {
                tokio::select! {
                    _ = drive_token.cancelled() => return Err(PipelineError::Cancelled),
                    res = head.put(item) => res?,
                }
                fed += 1;
            }
            debug!("feed complete: {} items", fed);

            for stage in &launched {
                debug!(
                    "stage '{}': closing input for {} workers",
                    stage.name, stage.pool_size
                );
                tokio::select! {
                    _ = drive_token.cancelled() => return Err(PipelineError::Cancelled),
                    _ = (stage.close_input)() => {}
                }
                tokio::select! {
                    _ = drive_token.cancelled() => return Err(PipelineError::Cancelled),
                    _ = (stage.input_drained)() => {}
                }
            }
            Ok(fed)
        }
        .await;

        let mut failure: Option<PipelineError> = None;
        let items_fed = match drive_result {
            Ok(fed) => fed,
            Err(e) => {
                token.cancel();
                if !matches!(e, PipelineError::Cancelled) {
                    failure = Some(e);
                }
                0
            }
        };

        // Join every worker. On the happy path they have already exited; on
        // failure the cancelled token guarantees they finish. Cancellation
        // casualties are not reported over the root cause.
        let mut stage_reports = Vec::with_capacity(launched.len());
        let mut items_skipped = 0u64;
        for stage in launched {
            let mut report = StageReport {
                name: stage.name.clone(),
                pool_size: stage.pool_size,
                items_processed: 0,
                items_skipped: 0,
                busy_seconds: 0.0,
            };
            for worker in stage.workers {
                match worker.join(&stage.name).await {
                    Ok(stats) => {
                        report.items_processed += stats.processed;
                        report.items_skipped += stats.skipped;
                        report.busy_seconds += stats.busy.as_secs_f64();
                    }
                    Err(PipelineError::Cancelled) => {}
                    Err(e) => {
                        if failure.is_none() {
                            failure = Some(e);
                        }
                    }
                }
            }
            items_skipped += report.items_skipped;
            stage_reports.push(report);
        }

        if let Some(error) = failure {
            token.cancel();
            let _ = collector.await;
            error!("pipeline {}: failed - {}", run_id, error);
            return Err(error);
        }

        // All stages have drained; one sentinel ends the collector's loop.
        self.sink.close().await;
        let collected = collector
            .await
            .map_err(|e| PipelineError::worker("sink", format!("collector panicked: {}", e)))?;

        let completed_at = Utc::now();
        let duration = start.elapsed();
        let items_emitted = collected.len() as u64;
        let items_per_second = if duration.as_secs_f64() > 0.0 {
            (items_emitted as f64 / duration.as_secs_f64()) as i64
        } else {
            0
        };

        let report = RunReport {
            run_id,
            status: "completed".to_string(),
            started_at,
            completed_at,
            duration_seconds: duration.as_secs_f64(),
            items_fed,
            items_emitted,
            items_skipped,
            items_per_second,
            stages: stage_reports,
        };

        info!(
            "pipeline {}: {} in, {} out in {:.1}s ({} items/s)",
            report.run_id,
            report.items_fed,
            report.items_emitted,
            report.duration_seconds,
            report.items_per_second
        );

        Ok(RunOutput {
            items: collected,
            report,
        })
    }
}

/// Collected results plus the run report.
#[derive(Debug)]
pub struct RunOutput<O> {
    /// All processed items drained from the final sink channel.
    pub items: Vec<O>,
    /// Counters and timing for the run.
    pub report: RunReport,
}

/// Result of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: String,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Items fed into the first stage.
    pub items_fed: u64,

    /// Items collected from the sink.
    pub items_emitted: u64,

    /// Items dropped under the skip-and-log policy.
    pub items_skipped: u64,

    /// Average throughput (items/second).
    pub items_per_second: i64,

    /// Per-stage counters.
    pub stages: Vec<StageReport>,
}

impl RunReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Per-stage counters aggregated over the stage's worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    /// Stage name.
    pub name: String,

    /// Number of workers in the pool.
    pub pool_size: usize,

    /// Items successfully transformed.
    pub items_processed: u64,

    /// Items dropped under the skip-and-log policy.
    pub items_skipped: u64,

    /// Total transform time across the pool, in seconds.
    pub busy_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::transform_fn;

    fn config_with_capacity(capacity: usize) -> PipelineConfig {
        PipelineConfig {
            channel_capacity: Some(capacity),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_stage_pool_one_preserves_order() {
        let pipeline = Pipeline::builder(config_with_capacity(4))
            .add_stage("double", 1, transform_fn(|n: i64| n * 2))
            .build();

        let output = pipeline.run(0..50).await.unwrap();
        let expected: Vec<i64> = (0..50).map(|n| n * 2).collect();
        assert_eq!(output.items, expected);
        assert_eq!(output.report.items_fed, 50);
        assert_eq!(output.report.items_emitted, 50);
    }

    #[tokio::test]
    async fn test_zero_stages_passes_items_through() {
        let pipeline = Pipeline::<u32, u32>::builder(config_with_capacity(4)).build();
        let output = pipeline.run(vec![1, 2, 3]).await.unwrap();
        assert_eq!(output.items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_input_completes_immediately() {
        let pipeline = Pipeline::builder(config_with_capacity(4))
            .add_stage("double", 2, transform_fn(|n: i64| n * 2))
            .build();

        let output = pipeline.run(Vec::new()).await.unwrap();
        assert!(output.items.is_empty());
        assert_eq!(output.report.items_fed, 0);
        assert_eq!(output.report.items_emitted, 0);
    }

    #[tokio::test]
    async fn test_stage_reports_aggregate_pool_counters() {
        let pipeline = Pipeline::builder(config_with_capacity(8))
            .add_stage("double", 3, transform_fn(|n: i64| n * 2))
            .add_stage("stringify", 2, transform_fn(|n: i64| n.to_string()))
            .build();

        let output = pipeline.run(0..20).await.unwrap();
        assert_eq!(output.report.stages.len(), 2);
        assert_eq!(output.report.stages[0].name, "double");
        assert_eq!(output.report.stages[0].pool_size, 3);
        assert_eq!(output.report.stages[0].items_processed, 20);
        assert_eq!(output.report.stages[1].items_processed, 20);
    }

    #[tokio::test]
    async fn test_report_serializes_to_json() {
        let pipeline = Pipeline::builder(config_with_capacity(4))
            .add_stage("identity", 1, transform_fn(|n: i64| n))
            .build();

        let output = pipeline.run(vec![1]).await.unwrap();
        let json = output.report.to_json().unwrap();
        assert!(json.contains("run_id"));
        assert!(json.contains("\"items_fed\": 1"));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = PipelineConfig {
            default_pool_size: Some(0),
            ..Default::default()
        };
        let pipeline = Pipeline::builder(config)
            .add_stage("double", 1, transform_fn(|n: i64| n * 2))
            .build();

        let err = pipeline.run(vec![1]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
