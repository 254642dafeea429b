use crate::Result;
use dyn_clone::DynClone;
use futures::stream::BoxStream;

mod s3;

pub use s3::S3ObjectStore;

/// The metadata the pipeline cares about for a single object, as returned by a head request.
///
/// Fetched fresh on every inspection, never cached across keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectHead {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
}

/// The three-way outcome of a head request.
///
/// A head request that fails can still be perfectly informative: "not found" means there is no
/// object (and thus no prior metadata), and other service-level rejections (403 and friends) are
/// at least classifiable.  Only errors the transport cannot classify at all surface as `Err` from
/// [`ObjectStore::head_object`].
#[derive(Clone, Debug)]
pub enum HeadOutcome {
    Found(ObjectHead),
    NotFound,

    /// The service rejected the request with something other than "not found"
    ServiceError {
        code: Option<String>,
        message: String,
    },
}

/// An object storage system like S3.
///
/// This is the complete set of storage capabilities the copy pipeline consumes, abstracted behind
/// a trait so tests can run the whole pipeline against an in-memory implementation without live
/// network access.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait ObjectStore: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Verify that the configured credentials can access `bucket`, failing with a meaningful
    /// error if they can't
    async fn verify_bucket_access(&self, bucket: &str) -> Result<()>;

    /// Metadata-only lookup of one object.  See [`HeadOutcome`] for how failures are classified.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<HeadOutcome>;

    /// Lazily list the keys in `bucket`, one page at a time.
    ///
    /// The next page is only requested from the backend when the stream is polled again, so a
    /// consumer that stops polling (or drops the stream) stops the listing — that's how the copy
    /// budget cuts a listing short without buffering the whole bucket.
    ///
    /// `start_after` resumes the listing strictly after the given key: the key itself and
    /// everything at or before it in listing order is excluded.
    fn list_pages(
        &self,
        bucket: &str,
        prefix: Option<String>,
        start_after: Option<String>,
        page_size: i32,
    ) -> BoxStream<'static, Result<Vec<String>>>;

    /// Copy `key` from `from_bucket` to `to_bucket`, fully replacing the destination metadata
    /// with the given cache-control and content-type (the rest of the object is duplicated
    /// as-is).  Source and destination may be the same bucket, which rewrites the metadata in
    /// place.
    async fn copy_with_metadata_replace(
        &self,
        from_bucket: &str,
        to_bucket: &str,
        key: &str,
        cache_control: &str,
        content_type: &str,
    ) -> Result<()>;
}

dyn_clone::clone_trait_object!(ObjectStore);
