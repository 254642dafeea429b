//! The producer side of the pipeline: feeds object keys into the shared key queue, either by
//! listing a bucket or by reading an explicit key list.
use crate::context::CopyContext;
use crate::objstore::ObjectStore;
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, instrument};

/// List `ctx.from_bucket` page by page and push every key into the queue.
///
/// Stops early in three cases, none of which is an error for the run as a whole:
///
/// * the key queue is closed (all workers are gone),
/// * a listing page fails (logged, then the remainder of the listing is abandoned),
/// * the copy budget is reached at a page boundary.
#[instrument(skip(ctx, store, keys))]
pub(crate) async fn stream_bucket_keys(
    ctx: &Arc<CopyContext>,
    store: &dyn ObjectStore,
    keys: &async_channel::Sender<String>,
    prefix: Option<String>,
    start_after: Option<String>,
) {
    let mut pages = store.list_pages(&ctx.from_bucket, prefix, start_after, ctx.batch_size);

    while let Some(page) = pages.next().await {
        let page = match page {
            Ok(page) => page,
            Err(e) => {
                error!(error = %e, "Bucket listing failed; abandoning the rest of the listing");
                return;
            }
        };

        debug!(keys = page.len(), "Queueing listed keys");

        for key in page {
            if keys.send(key).await.is_err() {
                // All receivers dropped; the workers have shut down
                return;
            }
        }

        // Checked per page, not per key: once the budget is spent there is no point paying for
        // more listing round trips, but a partially consumed page is still delivered in full and
        // the workers themselves decide what to do with each key
        if ctx.budget_reached() {
            debug!(copied = ctx.copied(), "Copy budget reached; stopping the bucket listing");
            return;
        }
    }
}

/// Read keys from a line-oriented list and push them into the queue.
///
/// Blank lines and lines starting with `#` are skipped.  A line ending in `*` is treated as a
/// prefix pattern and expanded with a bucket listing; everything else is taken as a verbatim key.
pub(crate) async fn stream_key_list(
    ctx: &Arc<CopyContext>,
    store: &dyn ObjectStore,
    keys: &async_channel::Sender<String>,
    reader: impl AsyncBufRead + Unpin,
) -> crate::Result<()> {
    let mut lines = reader.lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| snafu::IntoError::into_error(crate::error::ReadKeyListSnafu, e))?
    {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(prefix) = wildcard_prefix(line) {
            stream_bucket_keys(ctx, store, keys, Some(prefix.to_string()), None).await;
        } else if keys.send(line.to_string()).await.is_err() {
            return Ok(());
        }
    }

    Ok(())
}

/// If `line` is a wildcard pattern, the listing prefix it expands to.
///
/// Only a trailing `*` makes a wildcard; a leading `/` is stripped because S3 keys don't start
/// with one even though pasted paths often do.
fn wildcard_prefix(line: &str) -> Option<&str> {
    let prefix = line.strip_suffix('*')?;

    Some(prefix.strip_prefix('/').unwrap_or(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_requires_trailing_star() {
        assert_eq!(wildcard_prefix("images/2020/*"), Some("images/2020/"));
        assert_eq!(wildcard_prefix("/images/2020/*"), Some("images/2020/"));
        assert_eq!(wildcard_prefix("*"), Some(""));
        assert_eq!(wildcard_prefix("images/2020/photo.jpg"), None);
        assert_eq!(wildcard_prefix("images/*/photo.jpg"), None);
    }
}
