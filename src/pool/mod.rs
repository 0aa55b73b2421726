mod worker;

pub use worker::{CancelOutcome, JobExecutor, JobContext, PoolResult, SubmitError, WorkerPool};
