//! The purpose of this module is to alleviate the need to import many of the `[queuectl]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use queuectl::prelude::*;
//! ```
pub use crate::backoff::{Exponential, Strategy};
pub use crate::executor::{ExecutionError, ExecutionResult, Executor, ShellExecutor};
pub use crate::hook::{OutcomeEvent, OutcomeHook};
pub use crate::job::{Job, JobId, JobState, WorkerId};
pub use crate::policy::Resolution;
pub use crate::store::{JobStore, StoreError};
pub use crate::{Config, QueueError, Supervisor};
