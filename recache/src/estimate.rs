//! Best-effort estimation of how many objects the source bucket holds.
//!
//! The estimate exists only so the statistics stage can render a meaningful ETA; no part of the
//! copy pipeline depends on it, and every failure path here degrades to "unknown" rather than
//! failing the run.
use crate::Result;
use dyn_clone::DynClone;
use snafu::prelude::*;
use snafu::IntoError;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// How far back to look for the object count metric.  S3 publishes `NumberOfObjects` roughly
/// daily, so a 72 hour window reliably contains at least one datapoint for any active bucket.
const METRIC_WINDOW: Duration = Duration::from_secs(72 * 3600);

/// Granularity of the metric query, in seconds
const METRIC_PERIOD_SECONDS: i32 = 3600;

const ROLE_SESSION_NAME: &str = "RecacheCrossAccountMetrics";
const ROLE_SESSION_DURATION_SECONDS: i32 = 3600;
const ROLE_EXTERNAL_ID: &str = "123ABC";

/// A source for the approximate total object count of a bucket.
///
/// Abstracted behind a trait for the same reason [`crate::ObjectStore`] is: so the pipeline can be
/// driven by an in-memory implementation in tests.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait ObjectCounter: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Query the object count using the ambient credentials
    async fn object_count(&self, bucket: &str) -> Result<u64>;

    /// Query the object count with temporary credentials obtained by assuming `role_arn`, for
    /// buckets whose metrics live in another account
    async fn object_count_with_role(&self, bucket: &str, role_arn: &str) -> Result<u64>;
}

dyn_clone::clone_trait_object!(ObjectCounter);

/// Run the estimation fallback chain: direct metric query, then (if a role is configured) the
/// same query under delegated credentials, then give up and report 0 ("unknown").
///
/// Never fails; the worst outcome is an unknown estimate and a couple of warnings.
pub(crate) async fn estimate_object_count(
    counter: &dyn ObjectCounter,
    bucket: &str,
    metrics_role: Option<&str>,
) -> u64 {
    let direct_error = match counter.object_count(bucket).await {
        Ok(count) => {
            debug!(bucket, count, "Estimated source bucket object count");
            return count;
        }
        Err(e) => e,
    };

    if let Some(role_arn) = metrics_role {
        warn!(bucket, error = %direct_error, role_arn,
            "Direct object count query failed; retrying with cross-account credentials");

        match counter.object_count_with_role(bucket, role_arn).await {
            Ok(count) => {
                debug!(bucket, count, "Estimated source bucket object count via assumed role");
                return count;
            }
            Err(e) => {
                warn!(bucket, error = %e,
                    "Cross-account object count query failed; ETA will be unknown");
                return 0;
            }
        }
    }

    warn!(bucket, error = %direct_error,
        "Failed to estimate source bucket object count; ETA will be unknown");

    0
}

/// [`ObjectCounter`] backed by the CloudWatch `NumberOfObjects` metric that S3 publishes for
/// every bucket
#[derive(Clone)]
pub struct CloudWatchObjectCounter {
    inner: Arc<CloudWatchInner>,
}

struct CloudWatchInner {
    sdk_config: aws_config::SdkConfig,
}

impl CloudWatchObjectCounter {
    pub async fn new() -> Self {
        let region_provider =
            aws_config::meta::region::RegionProviderChain::default_provider().or_else("us-east-1");
        let sdk_config = aws_config::from_env().region(region_provider).load().await;

        Self {
            inner: Arc::new(CloudWatchInner { sdk_config }),
        }
    }

    /// Query the max of the `NumberOfObjects` metric over the trailing window.
    ///
    /// The metric is a gauge sampled at coarse granularity, so the max observed datapoint is the
    /// best single-number answer to "roughly how many objects are there".
    async fn query_object_count(
        &self,
        client: &aws_sdk_cloudwatch::Client,
        bucket: &str,
    ) -> Result<u64> {
        let end = SystemTime::now();
        let start = end - METRIC_WINDOW;

        let response = client
            .get_metric_statistics()
            .namespace("AWS/S3")
            .metric_name("NumberOfObjects")
            .start_time(aws_smithy_types::DateTime::from(start))
            .end_time(aws_smithy_types::DateTime::from(end))
            .period(METRIC_PERIOD_SECONDS)
            .statistics(aws_sdk_cloudwatch::types::Statistic::Maximum)
            .dimensions(
                aws_sdk_cloudwatch::types::Dimension::builder()
                    .name("BucketName")
                    .value(bucket)
                    .build(),
            )
            .dimensions(
                aws_sdk_cloudwatch::types::Dimension::builder()
                    .name("StorageType")
                    .value("AllStorageTypes")
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                crate::error::GetMetricStatisticsSnafu {
                    bucket: bucket.to_string(),
                }
                .into_error(e)
            })?;

        let max = response
            .datapoints()
            .iter()
            .filter_map(|datapoint| datapoint.maximum())
            .fold(None, |max: Option<f64>, value| {
                Some(max.map_or(value, |max| max.max(value)))
            });

        match max {
            Some(max) => Ok(max as u64),
            None => crate::error::NoObjectCountMetricSnafu {
                bucket: bucket.to_string(),
            }
            .fail(),
        }
    }
}

#[async_trait::async_trait]
impl ObjectCounter for CloudWatchObjectCounter {
    async fn object_count(&self, bucket: &str) -> Result<u64> {
        let client = aws_sdk_cloudwatch::Client::new(&self.inner.sdk_config);

        self.query_object_count(&client, bucket).await
    }

    async fn object_count_with_role(&self, bucket: &str, role_arn: &str) -> Result<u64> {
        let sts = aws_sdk_sts::Client::new(&self.inner.sdk_config);

        let assumed = sts
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(ROLE_SESSION_NAME)
            .duration_seconds(ROLE_SESSION_DURATION_SECONDS)
            .external_id(ROLE_EXTERNAL_ID)
            .send()
            .await
            .map_err(|e| {
                crate::error::AssumeRoleSnafu {
                    role_arn: role_arn.to_string(),
                }
                .into_error(e)
            })?;

        let credentials =
            assumed
                .credentials
                .context(crate::error::AssumeRoleMissingCredentialsSnafu {
                    role_arn: role_arn.to_string(),
                })?;

        let credentials = aws_credential_types::Credentials::from_keys(
            credentials.access_key_id,
            credentials.secret_access_key,
            Some(credentials.session_token),
        );

        let client = aws_sdk_cloudwatch::Client::from_conf(
            aws_sdk_cloudwatch::config::Builder::from(&self.inner.sdk_config)
                .credentials_provider(credentials)
                .build(),
        );

        self.query_object_count(&client, bucket).await
    }
}

impl std::fmt::Debug for CloudWatchObjectCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CloudWatchObjectCounter")
    }
}
