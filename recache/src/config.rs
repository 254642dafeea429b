use url::Url;

/// The configuration settings that control how the copy pipeline talks to object storage.
///
/// These are deployment-level knobs, as opposed to the per-run parameters (buckets, cache-control
/// value, budget, etc) which are set on [`crate::RewriteJobBuilder`].
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.  If this is set, the AWS region
    /// is ignored.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The number of concurrent copy workers.
    ///
    /// Each worker holds one connection to the storage backend, so keep this well below the
    /// typical ulimit of 1024 open files, and below the request rate at which S3 starts answering
    /// "503 SlowDown".
    #[cfg_attr(feature = "clap", clap(short = 'p', long, default_value = "200", global = true))]
    pub parallelism: usize,

    /// The capacity of the queue between the copy workers and the statistics stage.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10000", global = true))]
    pub result_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: Unfortunately this is duplicated here and in the `clap` attributes, unfortunately I
        // can't find a better way unless we unconditionally take a clap dependency in the lib
        // crate which I'm not willing to do
        Self {
            s3_endpoint: None,
            parallelism: 200,
            result_queue_size: 10_000,
        }
    }
}
