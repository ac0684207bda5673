pub mod retry;
pub mod executor;
pub mod dispatcher;

pub use retry::{RetryDecision, RetryPolicy};
pub use executor::{ExecutionOutcome, FailureHook, FailureHookSlot, JobExecutor};
pub use dispatcher::{Dispatcher, QueueWakers};
