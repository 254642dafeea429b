//! Helpers for testing the metadata rewrite pipeline: an in-memory object store that stands in
//! for S3, and a per-test logging harness.
//!
//! This crate is for internal use by the `recache` test suites and is never published.
pub mod fake;
pub mod logging;

pub type Result<T> = color_eyre::Result<T>;
