//! The purpose of this module is to alleviate the need to import many of the `[snapwatch]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use snapwatch::prelude::*;
//! ```
pub use crate::job::{FetchError, Fetched, Job, JobDefaults};
pub use crate::report::{ReportSink, RunReport};
pub use crate::scheduler::{ReleaseCheck, RunConfig, Scheduler};
pub use crate::state::{JobState, Verb};
pub use crate::store::{Snapshot, Store, StoreError};
pub use crate::RunError;
