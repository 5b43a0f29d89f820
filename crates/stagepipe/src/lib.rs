//! # stagepipe
//!
//! Bounded multi-stage work pipeline library.
//!
//! A pipeline is a sequence of stages (e.g. download -> resize -> upload)
//! connected by bounded channels, each stage run by a pool of worker tasks,
//! with a well-defined shutdown protocol that drains in-flight work before
//! signaling the next stage to stop. This crate provides:
//!
//! - **Bounded queues** with suspending put/get for backpressure
//! - **Closable channels** with a sentinel-based close protocol and
//!   completion tracking
//! - **Worker pools** generic over an async transform capability
//! - **A pipeline driver** with stage-ordered shutdown and fail-fast or
//!   skip-and-log failure policies
//!
//! Ordering is FIFO within a single channel. End-to-end ordering is only
//! guaranteed with one worker per stage; larger pools preserve the item
//! multiset but items may overtake each other.
//!
//! ## Example
//!
//! ```rust,no_run
//! use stagepipe::{transform_fn, Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> stagepipe::Result<()> {
//!     let pipeline = Pipeline::builder(PipelineConfig::default().with_auto_tuning())
//!         .add_stage("double", 2, transform_fn(|n: i64| n * 2))
//!         .add_stage("stringify", 2, transform_fn(|n: i64| n.to_string()))
//!         .build();
//!
//!     let output = pipeline.run(0..1000).await?;
//!     println!("{} items processed", output.report.items_emitted);
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod worker;

// Re-exports for convenient access
pub use channel::ClosableChannel;
pub use config::{FailurePolicy, PipelineConfig, SystemResources};
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineBuilder, RunOutput, RunReport, StageReport};
pub use queue::{BoundedQueue, TimedOut};
pub use worker::{
    spawn_pool, transform_fn, Transform, TransformError, WorkerHandle, WorkerState, WorkerStats,
};
