//! The heart of the pipeline: the per-object decision engine, the worker pool that runs it, and
//! the job type that wires the whole run together.
use crate::config::Config;
use crate::context::CopyContext;
use crate::error::{RecacheError, Result};
use crate::estimate::{CloudWatchObjectCounter, ObjectCounter};
use crate::objstore::{HeadOutcome, ObjectStore, S3ObjectStore};
use crate::stats::{ProgressCallback, RunSummary};
use crate::{estimate, source, stats};
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tracing::{debug, warn};

/// The default Cache-Control value applied to rewritten objects: one year, cacheable by shared
/// caches
pub const DEFAULT_CACHE_CONTROL: &str = "max-age=31536000,public";

/// What happened to one object, reported by the workers to the statistics stage.
///
/// Each variant has a single-character code; the run prints one such character per processed
/// object, so thousands of objects compress into a readable stream of progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CopyStatus {
    /// Skipped: a picture whose key matched the exclusion pattern
    Excluded,

    /// Skipped: the target already carries the desired metadata
    AlreadySet,

    /// Skipped: the copy budget was already spent when this key came up
    OverBudget,

    /// Copied; the source had no content type, so it was defaulted to `image/png`
    ContentTypeDefaulted,

    /// Copied a `image/png` object
    Png,

    /// Copied a `image/jpeg` object
    Jpeg,

    /// Copied an `application/pdf` object
    Pdf,

    /// Copied an object of some other content type
    Other,

    /// Processing this object failed; details are in [`CopyResult::error`]
    Failed,
}

impl CopyStatus {
    /// The single-character progress code for this status
    pub fn code(&self) -> char {
        match self {
            CopyStatus::Excluded => 'E',
            CopyStatus::AlreadySet => '.',
            CopyStatus::OverBudget => ',',
            CopyStatus::ContentTypeDefaulted => 'X',
            CopyStatus::Png => 'g',
            CopyStatus::Jpeg => 'j',
            CopyStatus::Pdf => 'P',
            CopyStatus::Other => 'Y',
            CopyStatus::Failed => 'F',
        }
    }

    /// Whether this status means a copy was performed (or would have been, under dry-run)
    pub fn is_copy(&self) -> bool {
        matches!(
            self,
            CopyStatus::ContentTypeDefaulted
                | CopyStatus::Png
                | CopyStatus::Jpeg
                | CopyStatus::Pdf
                | CopyStatus::Other
        )
    }
}

impl std::fmt::Display for CopyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The outcome of processing one key
#[derive(Debug)]
pub struct CopyResult {
    pub status: CopyStatus,
    pub key: String,

    /// The content type the object ended up with (after defaulting), or the source content type
    /// for skipped and failed objects.  Empty when it was never determined.
    pub content_type: String,

    /// For [`CopyStatus::Failed`], what went wrong
    pub error: Option<RecacheError>,
}

impl CopyResult {
    fn skipped(status: CopyStatus, key: String, content_type: String) -> Self {
        Self {
            status,
            key,
            content_type,
            error: None,
        }
    }

    fn failed(key: String, content_type: String, error: RecacheError) -> Self {
        Self {
            status: CopyStatus::Failed,
            key,
            content_type,
            error: Some(error),
        }
    }
}

/// Map the source content type to a copy status, defaulting the type itself when the source
/// doesn't have one.
///
/// Objects with no content type are overwhelmingly PNG screenshots uploaded by clients that never
/// set the header, hence the `image/png` default.
fn classify_content_type(content_type: String) -> (CopyStatus, String) {
    match content_type.as_str() {
        "" => (CopyStatus::ContentTypeDefaulted, "image/png".to_string()),
        "image/png" => (CopyStatus::Png, content_type),
        "image/jpeg" => (CopyStatus::Jpeg, content_type),
        "application/pdf" => (CopyStatus::Pdf, content_type),
        _ => (CopyStatus::Other, content_type),
    }
}

/// Decide what to do with one key and do it.
///
/// The checks run in a fixed priority order: source availability, exclusion, already-set,
/// budget, and only then the copy itself.  Every outcome is a [`CopyResult`]; nothing here fails
/// the run.
pub(crate) async fn process_key(
    ctx: &CopyContext,
    store: &dyn ObjectStore,
    key: String,
) -> CopyResult {
    // The source head is mandatory: without it there is no content type to carry over
    let source_head = match store.head_object(&ctx.from_bucket, &key).await {
        Ok(HeadOutcome::Found(head)) => head,
        Ok(HeadOutcome::NotFound) => {
            let error = crate::error::SourceObjectUnavailableSnafu {
                bucket: ctx.from_bucket.clone(),
                key: key.clone(),
                message: "no such object".to_string(),
            }
            .build();
            return CopyResult::failed(key, String::new(), error);
        }
        Ok(HeadOutcome::ServiceError { code, message }) => {
            let message = match code {
                Some(code) => format!("{code}: {message}"),
                None => message,
            };
            let error = crate::error::SourceObjectUnavailableSnafu {
                bucket: ctx.from_bucket.clone(),
                key: key.clone(),
                message,
            }
            .build();
            return CopyResult::failed(key, String::new(), error);
        }
        Err(e) => return CopyResult::failed(key, String::new(), e),
    };

    let content_type = source_head.content_type.clone().unwrap_or_default();

    // Only pictures are excludable; a matching key with any other content type is still processed
    if ctx.is_excluded(&key) && matches!(content_type.as_str(), "image/jpeg" | "image/png") {
        return CopyResult::skipped(CopyStatus::Excluded, key, content_type);
    }

    // For an in-place rewrite the target metadata is the source metadata we already have
    let target_head = if ctx.from_bucket == ctx.target_bucket {
        Some(source_head)
    } else {
        match store.head_object(&ctx.target_bucket, &key).await {
            Ok(HeadOutcome::Found(head)) => Some(head),
            Ok(HeadOutcome::NotFound) => None,
            Ok(HeadOutcome::ServiceError { code, message }) => {
                // Can't prove the target already has the right metadata, so copy as if it were
                // missing.  The copy is idempotent, so the worst case is a redundant rewrite.
                warn!(
                    key,
                    bucket = %ctx.target_bucket,
                    ?code,
                    message,
                    "Target object metadata check failed; treating the target as missing"
                );
                None
            }
            Err(e) => return CopyResult::failed(key, content_type, e),
        }
    };

    if let Some(target) = &target_head {
        let cache_control_set = target.cache_control.as_deref() == Some(ctx.cache_control.as_str());
        let content_type_set = target
            .content_type
            .as_deref()
            .map(|ct| !ct.is_empty())
            .unwrap_or(false);

        if cache_control_set && content_type_set {
            return CopyResult::skipped(CopyStatus::AlreadySet, key, content_type);
        }
    }

    if ctx.budget_reached() {
        return CopyResult::skipped(CopyStatus::OverBudget, key, content_type);
    }

    let (status, content_type) = classify_content_type(content_type);

    if !ctx.dry_run {
        if let Err(e) = store
            .copy_with_metadata_replace(
                &ctx.from_bucket,
                &ctx.target_bucket,
                &key,
                &ctx.cache_control,
                &content_type,
            )
            .await
        {
            return CopyResult::failed(key, content_type, e);
        }
    }

    ctx.record_copy();

    CopyResult {
        status,
        key,
        content_type,
        error: None,
    }
}

/// One copy worker: pull keys until the queue closes, process each, push the result to the
/// statistics stage
pub(crate) async fn worker_loop(
    ctx: Arc<CopyContext>,
    store: Box<dyn ObjectStore>,
    keys: async_channel::Receiver<String>,
    results: tokio::sync::mpsc::Sender<CopyResult>,
) {
    while let Ok(key) = keys.recv().await {
        let result = process_key(&ctx, &*store, key).await;

        if results.send(result).await.is_err() {
            // The statistics stage is gone; nothing left to report to
            return;
        }
    }
}

/// Where the keys for a run come from
pub enum JobInput {
    /// List the source bucket, optionally resuming strictly after a previously processed key
    Bucket { resume_after: Option<String> },

    /// Read keys (and `prefix*` wildcard lines) from a line-oriented reader, typically stdin
    KeyList(Box<dyn AsyncBufRead + Send + Unpin>),
}

impl JobInput {
    pub fn bucket() -> Self {
        Self::Bucket { resume_after: None }
    }

    pub fn bucket_resume_after(key: impl Into<String>) -> Self {
        Self::Bucket {
            resume_after: Some(key.into()),
        }
    }

    pub fn key_list(reader: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        Self::KeyList(Box::new(reader))
    }
}

impl std::fmt::Debug for JobInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bucket { resume_after } => f
                .debug_struct("Bucket")
                .field("resume_after", resume_after)
                .finish(),
            Self::KeyList(_) => f.debug_struct("KeyList").finish_non_exhaustive(),
        }
    }
}

/// Builder for a metadata rewrite job.
///
/// The separate build step exists because construction already talks to the network: it verifies
/// bucket access up front so a typo'd bucket name fails immediately instead of after the workers
/// have spun up.
#[derive(Debug)]
pub struct RewriteJobBuilder {
    config: Config,
    target_bucket: String,
    from_bucket: Option<String>,
    cache_control: String,
    exclude_pictures: Option<String>,
    max_objects: u64,
    dry_run: bool,
    metrics_role: Option<String>,
    log_dir: PathBuf,
    store: Option<Box<dyn ObjectStore>>,
    counter: Option<Box<dyn ObjectCounter>>,
}

impl RewriteJobBuilder {
    pub fn new(config: Config, target_bucket: impl Into<String>) -> Self {
        Self {
            config,
            target_bucket: target_bucket.into(),
            from_bucket: None,
            cache_control: DEFAULT_CACHE_CONTROL.to_string(),
            exclude_pictures: None,
            max_objects: u64::MAX,
            dry_run: false,
            metrics_role: None,
            log_dir: PathBuf::from("."),
            store: None,
            counter: None,
        }
    }

    /// Read objects from a different bucket than the one being written.  Without this the job
    /// rewrites metadata in place.
    pub fn from_bucket(mut self, from_bucket: impl Into<String>) -> Self {
        self.from_bucket = Some(from_bucket.into());
        self
    }

    /// The Cache-Control value to apply.  Defaults to [`DEFAULT_CACHE_CONTROL`].
    pub fn cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = cache_control.into();
        self
    }

    /// Skip JPEG and PNG objects whose keys match this regular expression
    pub fn exclude_pictures(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_pictures = Some(pattern.into());
        self
    }

    /// Stop copying (softly) after this many objects.  See
    /// [`crate::RunSummary::copied`] for how "softly" is to be understood.
    pub fn first_n(mut self, max_objects: u64) -> Self {
        self.max_objects = max_objects;
        self
    }

    /// Make no changes; classify and count only
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Assume this role when querying the object count metric, for source buckets owned by
    /// another account
    pub fn metrics_role(mut self, role_arn: impl Into<String>) -> Self {
        self.metrics_role = Some(role_arn.into());
        self
    }

    /// Directory the audit and error log files are written to.  Defaults to the current
    /// directory.
    pub fn log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    /// Use this object store instead of constructing an S3 client from the config
    pub fn with_store(mut self, store: impl ObjectStore) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Use this object counter instead of querying CloudWatch
    pub fn with_counter(mut self, counter: impl ObjectCounter) -> Self {
        self.counter = Some(Box::new(counter));
        self
    }

    /// Validate the parameters, verify bucket access, and produce a runnable job
    pub async fn build(self) -> Result<RewriteJob> {
        let exclude = self
            .exclude_pictures
            .as_deref()
            .map(|pattern| {
                regex::Regex::new(pattern).context(crate::error::InvalidExcludePatternSnafu {
                    pattern: pattern.to_string(),
                })
            })
            .transpose()?;

        let store = match self.store {
            Some(store) => store,
            None => Box::new(S3ObjectStore::new(&self.config).await),
        };

        let counter = match self.counter {
            Some(counter) => counter,
            None => Box::new(CloudWatchObjectCounter::new().await),
        };

        let from_bucket = self
            .from_bucket
            .unwrap_or_else(|| self.target_bucket.clone());

        store.verify_bucket_access(&self.target_bucket).await?;
        if from_bucket != self.target_bucket {
            store.verify_bucket_access(&from_bucket).await?;
        }

        let ctx = Arc::new(CopyContext::new(
            self.target_bucket,
            from_bucket,
            self.cache_control,
            exclude,
            self.max_objects,
            self.dry_run,
            self.metrics_role,
        ));

        Ok(RewriteJob {
            config: self.config,
            ctx,
            store,
            counter,
            log_dir: self.log_dir,
        })
    }
}

/// A fully validated rewrite job, ready to run
#[derive(Debug)]
pub struct RewriteJob {
    config: Config,
    ctx: Arc<CopyContext>,
    store: Box<dyn ObjectStore>,
    counter: Box<dyn ObjectCounter>,
    log_dir: PathBuf,
}

impl RewriteJob {
    /// The bucket whose objects are modified by this job
    pub fn target_bucket(&self) -> &str {
        &self.ctx.target_bucket
    }

    /// The bucket the objects are read from.  The same as [`Self::target_bucket`] unless a
    /// separate source bucket was configured.
    pub fn from_bucket(&self) -> &str {
        &self.ctx.from_bucket
    }

    /// Run the job without any progress reporting
    pub async fn run_without_progress(self, input: JobInput) -> Result<RunSummary> {
        struct NoProgress;
        impl ProgressCallback for NoProgress {}

        self.run(input, NoProgress).await
    }

    /// Run the job.
    ///
    /// The producer reads keys from `input` into a bounded queue, a pool of workers drains that
    /// queue concurrently, and a statistics task aggregates their results, writes the run logs,
    /// and periodically invokes `progress`.
    pub async fn run(
        self,
        input: JobInput,
        progress: impl ProgressCallback + 'static,
    ) -> Result<RunSummary> {
        let progress: Arc<dyn ProgressCallback> = Arc::new(progress);

        let expected = estimate::estimate_object_count(
            &*self.counter,
            &self.ctx.from_bucket,
            self.ctx.metrics_role.as_deref(),
        )
        .await;
        self.ctx.set_expected(expected);
        progress.expected_objects(expected);

        // A few pages' worth of headroom keeps the listing ahead of the workers without
        // buffering a large slice of the bucket in memory
        let (key_tx, key_rx) = async_channel::bounded((self.ctx.batch_size as usize) * 3);
        let (result_tx, result_rx) =
            tokio::sync::mpsc::channel::<CopyResult>(self.config.result_queue_size);

        let stats_task = tokio::spawn(stats::aggregate(
            self.ctx.clone(),
            result_rx,
            progress,
            self.log_dir.clone(),
        ));

        debug!(
            parallelism = self.config.parallelism,
            batch_size = self.ctx.batch_size,
            "Starting copy workers"
        );

        let workers = (0..self.config.parallelism)
            .map(|_| {
                tokio::spawn(worker_loop(
                    self.ctx.clone(),
                    self.store.clone(),
                    key_rx.clone(),
                    result_tx.clone(),
                ))
            })
            .collect::<Vec<_>>();

        // The workers hold the only remaining result senders; once they finish, the statistics
        // task sees the channel close and wraps up
        drop(result_tx);
        drop(key_rx);

        match input {
            JobInput::Bucket { resume_after } => {
                source::stream_bucket_keys(&self.ctx, &*self.store, &key_tx, None, resume_after)
                    .await;
            }
            JobInput::KeyList(reader) => {
                source::stream_key_list(&self.ctx, &*self.store, &key_tx, reader).await?;
            }
        }

        key_tx.close();

        for worker in workers {
            worker.await.context(crate::error::WorkerTaskPanicSnafu)?;
        }

        stats_task.await.context(crate::error::StatsTaskPanicSnafu)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_unique() {
        let statuses = [
            CopyStatus::Excluded,
            CopyStatus::AlreadySet,
            CopyStatus::OverBudget,
            CopyStatus::ContentTypeDefaulted,
            CopyStatus::Png,
            CopyStatus::Jpeg,
            CopyStatus::Pdf,
            CopyStatus::Other,
            CopyStatus::Failed,
        ];

        let codes = statuses
            .iter()
            .map(|status| status.code())
            .collect::<std::collections::BTreeSet<_>>();

        assert_eq!(codes.len(), statuses.len());
    }

    #[test]
    fn only_performed_copies_count_as_copies() {
        assert!(CopyStatus::Png.is_copy());
        assert!(CopyStatus::Jpeg.is_copy());
        assert!(CopyStatus::Pdf.is_copy());
        assert!(CopyStatus::Other.is_copy());
        assert!(CopyStatus::ContentTypeDefaulted.is_copy());

        assert!(!CopyStatus::Excluded.is_copy());
        assert!(!CopyStatus::AlreadySet.is_copy());
        assert!(!CopyStatus::OverBudget.is_copy());
        assert!(!CopyStatus::Failed.is_copy());
    }

    #[test]
    fn missing_content_type_defaults_to_png() {
        assert_eq!(
            classify_content_type(String::new()),
            (CopyStatus::ContentTypeDefaulted, "image/png".to_string())
        );

        assert_eq!(
            classify_content_type("image/png".to_string()),
            (CopyStatus::Png, "image/png".to_string())
        );

        assert_eq!(
            classify_content_type("application/pdf".to_string()),
            (CopyStatus::Pdf, "application/pdf".to_string())
        );

        assert_eq!(
            classify_content_type("text/html".to_string()),
            (CopyStatus::Other, "text/html".to_string())
        );
    }
}
