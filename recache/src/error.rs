use snafu::prelude::*;
use std::path::PathBuf;

pub type Result<T, E = RecacheError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RecacheError {
    #[snafu(display(
        "The S3 bucket '{bucket}' either doesn't exist, or your IAM identity is not granted access"
    ))]
    BucketInvalidOrNotAccessible {
        bucket: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_bucket::HeadBucketError>,
    },

    #[snafu(display("Error getting metadata for object '{key}' in S3 bucket '{bucket}'"))]
    HeadObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>,
    },

    #[snafu(display("Source object '{key}' in bucket '{bucket}' could not be read: {message}"))]
    SourceObjectUnavailable {
        bucket: String,
        key: String,
        message: String,
    },

    #[snafu(display("Error listing objects in S3 bucket '{bucket}' with prefix '{prefix}'"))]
    ListObjects {
        bucket: String,
        prefix: String,
        source:
            aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error>,
    },

    #[snafu(display("Error copying object '{key}' to S3 bucket '{bucket}'"))]
    CopyObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::copy_object::CopyObjectError>,
    },

    #[snafu(display("The exclude pattern '{pattern}' is not a valid regular expression"))]
    InvalidExcludePattern {
        pattern: String,
        source: regex::Error,
    },

    #[snafu(display("Error querying the object count metric for bucket '{bucket}'"))]
    GetMetricStatistics {
        bucket: String,
        source: aws_sdk_cloudwatch::error::SdkError<
            aws_sdk_cloudwatch::operation::get_metric_statistics::GetMetricStatisticsError,
        >,
    },

    #[snafu(display(
        "The object count metric for bucket '{bucket}' has no datapoints.  Remember to grant \
         `cloudwatch:GetMetricData` on the source bucket, or pass a cross-account metrics role"
    ))]
    NoObjectCountMetric { bucket: String },

    #[snafu(display("Assuming role '{role_arn}' for cross-account access failed"))]
    AssumeRole {
        role_arn: String,
        source: aws_sdk_sts::error::SdkError<aws_sdk_sts::operation::assume_role::AssumeRoleError>,
    },

    #[snafu(display("Assuming role '{role_arn}' succeeded but returned no credentials"))]
    AssumeRoleMissingCredentials { role_arn: String },

    #[snafu(display("Error writing run log file '{}'", path.display()))]
    RunLog {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error reading the key list input"))]
    ReadKeyList { source: std::io::Error },

    #[snafu(display("The statistics task failed"))]
    StatsTaskPanic { source: tokio::task::JoinError },

    #[snafu(display("A copy worker task failed"))]
    WorkerTaskPanic { source: tokio::task::JoinError },

    /// Catch-all for object storage implementations that aren't backed by the AWS SDK (such as
    /// the in-memory store used in tests)
    #[snafu(display("{message}"))]
    Storage { message: String },
}
