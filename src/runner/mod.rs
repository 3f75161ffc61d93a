//! External task runner: executor invocation, rate-limit backoff, and
//! response interpretation.

pub mod executor;
pub mod payload;
pub mod rate_limit;

pub use executor::ExecutorClient;
pub use payload::{ResultStatus, StageRequest, StageResult};
