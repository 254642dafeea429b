//! The single consumer of the worker pool's results: counts outcomes, writes the run logs, and
//! periodically tells the progress callback how the run is going.
use crate::context::CopyContext;
use crate::copy::{CopyResult, CopyStatus};
use crate::error::{RecacheError, Result};
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::error;

/// How often the progress report fires while results are flowing
const REPORT_INTERVAL: Duration = Duration::from_secs(12);

/// Progress updates from a running job.
///
/// All methods have empty default implementations, so callers implement only what they care
/// about.  Invoked from the statistics task, so implementations should not block for long.
pub trait ProgressCallback: Sync + Send {
    /// The estimated total object count of the source bucket, reported once before any object is
    /// processed.  0 means the estimate is unknown.
    fn expected_objects(&self, expected: u64) {
        let _ = expected;
    }

    /// One object was processed, with whatever outcome
    fn object_processed(&self, status: CopyStatus, key: &str) {
        let _ = (status, key);
    }

    /// One object failed.  Also reported through [`Self::object_processed`] with
    /// [`CopyStatus::Failed`].
    fn object_failed(&self, key: &str, error: &RecacheError) {
        let _ = (key, error);
    }

    /// Fired every [`REPORT_INTERVAL`] while the run is in progress
    fn progress_report(&self, report: &ProgressReport) {
        let _ = report;
    }

    /// Fired once, after the last object has been processed
    fn final_report(&self, report: &ProgressReport) {
        let _ = report;
    }
}

/// A snapshot of the run so far
#[derive(Clone, Debug)]
pub struct ProgressReport {
    /// The most recently processed key
    pub last_key: String,

    /// Objects processed so far (all outcomes, including skips and failures)
    pub processed: u64,

    /// Estimated total object count, or 0 when unknown
    pub expected: u64,

    /// Average processing rate since the start of the run
    pub objects_per_second: f64,

    /// Human-readable time to completion, or `-` when it can't be computed
    pub eta: String,

    /// Number of objects per status code
    pub status_counts: BTreeMap<char, u64>,

    /// Number of objects per (normalized) content type
    pub content_type_counts: BTreeMap<String, u64>,
}

/// The final accounting of a completed run
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// Objects processed, all outcomes included
    pub processed: u64,

    /// Estimated total object count, or 0 when unknown
    pub expected: u64,

    /// Copies performed (or counted, under dry-run).  Because the copy budget is re-checked
    /// independently by each in-flight worker, this can exceed a configured `first-n` by up to
    /// the worker count minus one.
    pub copied: u64,

    /// Objects that failed to process
    pub failed: u64,

    pub status_counts: BTreeMap<char, u64>,
    pub content_type_counts: BTreeMap<String, u64>,

    pub elapsed: Duration,

    /// Path of the audit log, one line per processed object
    pub audit_log: PathBuf,

    /// Path of the error log, one line per failed key
    pub error_log: PathBuf,
}

/// Format the estimated time to completion.
///
/// Returns `-` when no estimate is possible: the rate is zero, or more objects were processed
/// than the (approximate) expected count predicted.
pub fn format_eta(expected: u64, processed: u64, objects_per_second: f64) -> String {
    if expected < processed || objects_per_second <= 0.0 {
        return "-".to_string();
    }

    let remaining_seconds = (expected - processed) as f64 / objects_per_second;

    if remaining_seconds >= 86_400.0 {
        let days = (remaining_seconds / 86_400.0).floor();
        let hours = (remaining_seconds % 86_400.0) / 3_600.0;
        format!("{days}d {hours:.1}h")
    } else {
        let hours = (remaining_seconds / 3_600.0).floor();
        let minutes = (remaining_seconds % 3_600.0) / 60.0;
        format!("{hours}h {minutes:.1}m")
    }
}

/// Strip content type parameters (`; charset=...` and friends) so the per-type counters don't
/// fragment
fn normalize_content_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

struct RunLogFile {
    path: PathBuf,
    file: tokio::fs::File,
}

impl RunLogFile {
    async fn create(path: PathBuf) -> Result<Self> {
        // Append so that a name collision (two runs starting within the same second) loses no
        // lines from either run
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context(crate::error::RunLogSnafu { path: path.clone() })?;

        Ok(Self { path, file })
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.file
            .write_all(line.as_bytes())
            .await
            .context(crate::error::RunLogSnafu {
                path: self.path.clone(),
            })
    }

    async fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .context(crate::error::RunLogSnafu {
                path: self.path.clone(),
            })
    }
}

/// Consume worker results until the channel closes, then return the run summary.
///
/// This is the only place the audit and error logs are written and the only place the counters
/// live, so none of it needs synchronization.
pub(crate) async fn aggregate(
    ctx: Arc<CopyContext>,
    mut results: tokio::sync::mpsc::Receiver<CopyResult>,
    progress: Arc<dyn ProgressCallback>,
    log_dir: PathBuf,
) -> Result<RunSummary> {
    let timestamp = chrono::Local::now().format("%Y-%m-%d-%H%M%S");
    let mut audit_log = RunLogFile::create(log_dir.join(format!("{timestamp}-objects.log"))).await?;
    let mut error_log = RunLogFile::create(log_dir.join(format!("{timestamp}-errors.log"))).await?;

    let started = Instant::now();
    let mut processed = 0u64;
    let mut failed = 0u64;
    let mut last_key = String::new();
    let mut status_counts = BTreeMap::new();
    let mut content_type_counts: BTreeMap<String, u64> = BTreeMap::new();

    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it so the first report comes after a full
    // interval
    ticker.tick().await;

    let make_report = |last_key: &str,
                       processed: u64,
                       status_counts: &BTreeMap<char, u64>,
                       content_type_counts: &BTreeMap<String, u64>,
                       elapsed: Duration| {
        let objects_per_second = if elapsed.as_secs_f64() > 0.0 {
            processed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let expected = ctx.expected();

        ProgressReport {
            last_key: last_key.to_string(),
            processed,
            expected,
            objects_per_second,
            eta: format_eta(expected, processed, objects_per_second),
            status_counts: status_counts.clone(),
            content_type_counts: content_type_counts.clone(),
        }
    };

    loop {
        tokio::select! {
            result = results.recv() => {
                let Some(result) = result else { break };

                audit_log
                    .write_line(&format!(
                        "{}\t{}\t{}\n",
                        result.status.code(),
                        result.content_type,
                        result.key
                    ))
                    .await?;

                if let Some(e) = &result.error {
                    failed += 1;
                    error_log.write_line(&format!("{}\n", result.key)).await?;
                    error!(key = %result.key, error = %e, "Failed to process object");
                    progress.object_failed(&result.key, e);
                }

                *status_counts.entry(result.status.code()).or_insert(0) += 1;

                let content_type = normalize_content_type(&result.content_type);
                if !content_type.is_empty() {
                    *content_type_counts.entry(content_type.to_string()).or_insert(0) += 1;
                }

                processed += 1;
                last_key = result.key.clone();
                progress.object_processed(result.status, &result.key);
            },

            _ = ticker.tick() => {
                progress.progress_report(&make_report(
                    &last_key,
                    processed,
                    &status_counts,
                    &content_type_counts,
                    started.elapsed(),
                ));
            },
        }
    }

    audit_log.flush().await?;
    error_log.flush().await?;

    let elapsed = started.elapsed();

    progress.final_report(&make_report(
        &last_key,
        processed,
        &status_counts,
        &content_type_counts,
        elapsed,
    ));

    Ok(RunSummary {
        processed,
        expected: ctx.expected(),
        copied: ctx.copied(),
        failed,
        status_counts,
        content_type_counts,
        elapsed,
        audit_log: audit_log.path,
        error_log: error_log.path,
    })
}
