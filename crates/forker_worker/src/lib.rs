//! The Copy Worker (C5, §4.5): the staged Copy Protocol plus a bounded
//! worker pool that dispatches attempts and reports completions.

mod pool;
mod protocol;

pub use pool::{CopyCompletion, WorkerPool};
pub use protocol::{execute_copy_attempt, recover_in_flight, CopyRequest};
