pub mod pipeline;
pub mod pool;
pub mod reconciler;
pub mod worker;

pub use pipeline::{Pipeline, PipelineOutcome, Step};
pub use pool::WorkerPool;
pub use worker::Worker;
