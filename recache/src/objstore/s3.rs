use super::{HeadOutcome, ObjectHead, ObjectStore};
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use snafu::IntoError;
use std::sync::Arc;
use tracing::{debug, instrument};

/// The escape set for the object key inside an `x-amz-copy-source` header value.
///
/// Everything except RFC 3986 unreserved characters is percent-encoded, `/` included: the header
/// treats the whole `{bucket}/{key}` string as a single path, and only the separator between the
/// bucket and the key may remain a literal slash.
const COPY_SOURCE_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Implementation of [`ObjectStore`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub struct S3ObjectStore {
    inner: Arc<S3Inner>,
}

struct S3Inner {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub async fn new(config: &Config) -> Self {
        Self {
            inner: Arc::new(S3Inner {
                client: make_s3_client(config).await,
            }),
        }
    }

    /// Render the `x-amz-copy-source` value for copying `key` out of `from_bucket`
    fn copy_source(from_bucket: &str, key: &str) -> String {
        format!(
            "{}/{}",
            from_bucket,
            utf8_percent_encode(key, COPY_SOURCE_ESCAPE)
        )
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    async fn verify_bucket_access(&self, bucket: &str) -> Result<()> {
        debug!(bucket, "Validating access to bucket");

        self.inner
            .client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| {
                crate::error::BucketInvalidOrNotAccessibleSnafu {
                    bucket: bucket.to_string(),
                }
                .into_error(e)
            })?;

        debug!(bucket, "Access to bucket is confirmed");

        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<HeadOutcome> {
        match self
            .inner
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(HeadOutcome::Found(ObjectHead {
                content_type: output.content_type,
                cache_control: output.cache_control,
            })),
            Err(e) => {
                if let SdkError::ServiceError(service_err) = &e {
                    // The service answered, so the error is classifiable.  404 means "no object
                    // here", which for this pipeline is information, not a failure; everything
                    // else is reported with its code and left to the caller to judge.
                    let err = service_err.err();

                    if err.is_not_found() {
                        return Ok(HeadOutcome::NotFound);
                    }

                    return Ok(HeadOutcome::ServiceError {
                        code: err.code().map(|code| code.to_string()),
                        message: err
                            .message()
                            .unwrap_or("service rejected the head request")
                            .to_string(),
                    });
                }

                // The transport couldn't classify this at all (DNS failure, timeout, garbled
                // response); hard failure for this key
                Err(crate::error::HeadObjectSnafu {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
                .into_error(e))
            }
        }
    }

    fn list_pages(
        &self,
        bucket: &str,
        prefix: Option<String>,
        start_after: Option<String>,
        page_size: i32,
    ) -> futures::stream::BoxStream<'static, Result<Vec<String>>> {
        let bucket = bucket.to_string();

        debug!(
            bucket,
            ?prefix,
            ?start_after,
            page_size,
            "Starting paginated bucket listing"
        );

        // The paginator handles continuation tokens; it only issues the request for the next page
        // when polled again, which is exactly the laziness the budget cutoff relies on
        let pages = self
            .inner
            .client
            .list_objects_v2()
            .bucket(&bucket)
            .set_prefix(prefix.clone())
            .set_start_after(start_after)
            .into_paginator()
            .page_size(page_size)
            .send();

        futures::stream::unfold(
            (pages, bucket, prefix),
            |(mut pages, bucket, prefix)| async move {
                let page = pages.next().await?;

                let item = page
                    .map(|output| {
                        output
                            .contents
                            .unwrap_or_default()
                            .into_iter()
                            .filter_map(|object| object.key)
                            .collect::<Vec<_>>()
                    })
                    .map_err(|e| {
                        crate::error::ListObjectsSnafu {
                            bucket: bucket.clone(),
                            prefix: prefix.clone().unwrap_or_default(),
                        }
                        .into_error(e)
                    });

                Some((item, (pages, bucket, prefix)))
            },
        )
        .boxed()
    }

    #[instrument(skip(self))]
    async fn copy_with_metadata_replace(
        &self,
        from_bucket: &str,
        to_bucket: &str,
        key: &str,
        cache_control: &str,
        content_type: &str,
    ) -> Result<()> {
        debug!("Copying object with replaced metadata");

        self.inner
            .client
            .copy_object()
            .bucket(to_bucket)
            .copy_source(Self::copy_source(from_bucket, key))
            .key(key)
            .cache_control(cache_control)
            .content_type(content_type)
            .metadata_directive(aws_sdk_s3::types::MetadataDirective::Replace)
            .send()
            .await
            .map_err(|e| {
                crate::error::CopyObjectSnafu {
                    bucket: to_bucket.to_string(),
                    key: key.to_string(),
                }
                .into_error(e)
            })?;

        Ok(())
    }
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S3ObjectStore")
    }
}

/// Create a new AWS SDK S3 client using the default configuration deduced from the environment,
/// with the endpoint overridden if the config asks for one
async fn make_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let region_provider = RegionProviderChain::default_provider().or_else("us-east-1");
    let aws_config = aws_config::from_env().region(region_provider).load().await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // Non-AWS endpoints (minio et al) generally don't do virtual-host-style bucket addressing
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.to_string())
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}
