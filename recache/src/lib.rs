#![doc = include_str!("../README.md")]

mod config;
mod context;
mod copy;
mod error;
mod estimate;
mod objstore;
mod source;
mod stats;

pub use config::Config;
pub use copy::{
    CopyResult, CopyStatus, JobInput, RewriteJob, RewriteJobBuilder, DEFAULT_CACHE_CONTROL,
};
pub use error::{RecacheError, Result};
pub use estimate::{CloudWatchObjectCounter, ObjectCounter};
pub use objstore::{HeadOutcome, ObjectHead, ObjectStore, S3ObjectStore};
pub use stats::{format_eta, ProgressCallback, ProgressReport, RunSummary};
