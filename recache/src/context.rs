use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared state for one copy run: the immutable parameters every stage reads, plus the small set
/// of counters the stages contend on.
///
/// One instance is created per [`crate::RewriteJob`] and shared (behind an `Arc`) between the
/// object source, every copy worker, and the statistics stage.
#[derive(Debug)]
pub(crate) struct CopyContext {
    /// Bucket where changes happen: objects added or metadata changed
    pub target_bucket: String,

    /// Bucket the objects are read from.  Equal to `target_bucket` for an in-place rewrite.
    pub from_bucket: String,

    /// The Cache-Control value every rewritten object receives
    pub cache_control: String,

    /// Picture objects whose keys match this pattern are not processed.
    ///
    /// `None` matches nothing, so nothing is excluded.
    pub exclude: Option<Regex>,

    /// Soft cap on the number of objects to copy.
    ///
    /// Soft because every in-flight worker re-checks it independently; see [`Self::budget_reached`].
    pub max_objects: u64,

    /// Make no changes, just gather statistics
    pub dry_run: bool,

    /// Role to assume when the object count metric for the source bucket lives in another account
    pub metrics_role: Option<String>,

    /// Page size for bucket listings, derived from the `first-n` budget and clamped to what the
    /// listing API accepts
    pub batch_size: i32,

    /// Number of copies performed (or, under dry-run, that would have been performed) so far.
    ///
    /// Monotonic; only ever incremented, one increment per copied object.
    copied_objects: AtomicU64,

    /// Estimated total object count of the source bucket, or 0 when unknown.
    ///
    /// Written once by the size estimator before the workers start, read-only afterward; only the
    /// ETA math consumes it.
    expected_objects: AtomicU64,
}

impl CopyContext {
    pub fn new(
        target_bucket: String,
        from_bucket: String,
        cache_control: String,
        exclude: Option<Regex>,
        max_objects: u64,
        dry_run: bool,
        metrics_role: Option<String>,
    ) -> Self {
        Self {
            target_bucket,
            from_bucket,
            cache_control,
            exclude,
            max_objects,
            dry_run,
            metrics_role,
            batch_size: derive_batch_size(max_objects),
            copied_objects: AtomicU64::new(0),
            expected_objects: AtomicU64::new(0),
        }
    }

    /// Record one performed (or dry-run) copy
    pub fn record_copy(&self) {
        self.copied_objects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn copied(&self) -> u64 {
        self.copied_objects.load(Ordering::Relaxed)
    }

    /// Whether the copy budget has been used up.
    ///
    /// This is a read-then-act check that is deliberately not atomic with [`Self::record_copy`]:
    /// with `N` workers in flight the counter can overshoot the budget by up to `N - 1`.  Making
    /// it a hard transactional limit would change how many objects get copied at the boundary, so
    /// callers must treat the budget as soft.
    pub fn budget_reached(&self) -> bool {
        self.copied() >= self.max_objects
    }

    pub fn set_expected(&self, expected: u64) {
        self.expected_objects.store(expected, Ordering::Relaxed);
    }

    pub fn expected(&self) -> u64 {
        self.expected_objects.load(Ordering::Relaxed)
    }

    /// Whether `key` matches the exclusion pattern (picture check is done separately by the
    /// decision engine)
    pub fn is_excluded(&self, key: &str) -> bool {
        self.exclude
            .as_ref()
            .map(|pattern| pattern.is_match(key))
            .unwrap_or(false)
    }
}

/// Derive the bucket listing page size from the `first-n` copy budget.
///
/// Half the budget gives the listing a chance to stop early once the budget is reached, but the
/// result is clamped to [10, 1000] because S3 rejects page sizes above 1000 and tiny pages waste
/// round trips.
pub(crate) fn derive_batch_size(max_objects: u64) -> i32 {
    (max_objects / 2).clamp(10, 1000) as i32
}
