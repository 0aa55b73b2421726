pub mod history;
pub mod model;

pub use history::{JobHistoryStore, PostgresJobHistoryStore};
pub use model::{phases, JobOutcome, JobRecord, JobStatus, Phase, QueueEntry};
