//! An in-memory [`ObjectStore`] and [`ObjectCounter`] so the whole pipeline can run in tests
//! without any network access.
use futures::stream::BoxStream;
use futures::StreamExt;
use recache::{HeadOutcome, ObjectCounter, ObjectHead, ObjectStore, RecacheError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// The metadata of one stored object.  There is no body; nothing in the pipeline reads one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FakeObject {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
}

/// A record of one metadata-replace copy the store performed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyRecord {
    pub from_bucket: String,
    pub to_bucket: String,
    pub key: String,
    pub cache_control: String,
    pub content_type: String,
}

#[derive(Default)]
struct FakeState {
    /// Objects keyed by (bucket, key).  A `BTreeMap` so listings come out in the same
    /// lexicographic order S3 uses.
    objects: BTreeMap<(String, String), FakeObject>,

    copies: Vec<CopyRecord>,

    /// (bucket, key) pairs whose head requests fail like a broken transport would
    fail_heads: BTreeSet<(String, String)>,

    /// (bucket, key) pairs whose head requests are rejected by the "service"
    head_service_errors: BTreeSet<(String, String)>,

    /// (bucket, key) pairs whose copies fail
    fail_copies: BTreeSet<(String, String)>,

    /// When set, every listing page request fails
    fail_listing: bool,

    object_count: Option<u64>,
    role_object_count: Option<u64>,
}

/// In-memory object store with injectable faults.
///
/// Clones share state, so a test can keep one handle for assertions while the pipeline holds
/// another.
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<FakeState>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        cache_control: Option<&str>,
    ) {
        self.state.lock().unwrap().objects.insert(
            (bucket.to_string(), key.to_string()),
            FakeObject {
                content_type: content_type.map(String::from),
                cache_control: cache_control.map(String::from),
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<FakeObject> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// All copies performed so far, in the order they happened
    pub fn copies(&self) -> Vec<CopyRecord> {
        self.state.lock().unwrap().copies.clone()
    }

    /// Make head requests for this object fail as if the transport broke down
    pub fn fail_head(&self, bucket: &str, key: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_heads
            .insert((bucket.to_string(), key.to_string()));
    }

    /// Make head requests for this object come back as a service-level rejection
    pub fn head_service_error(&self, bucket: &str, key: &str) {
        self.state
            .lock()
            .unwrap()
            .head_service_errors
            .insert((bucket.to_string(), key.to_string()));
    }

    /// Make copies of this object fail
    pub fn fail_copy(&self, bucket: &str, key: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_copies
            .insert((bucket.to_string(), key.to_string()));
    }

    /// Make every listing page request fail
    pub fn fail_listing(&self) {
        self.state.lock().unwrap().fail_listing = true;
    }

    /// Set the object count reported under ambient credentials
    pub fn set_object_count(&self, count: u64) {
        self.state.lock().unwrap().object_count = Some(count);
    }

    /// Set the object count reported only when a role is assumed
    pub fn set_role_object_count(&self, count: u64) {
        self.state.lock().unwrap().role_object_count = Some(count);
    }

    fn storage_error(message: impl Into<String>) -> RecacheError {
        RecacheError::Storage {
            message: message.into(),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for FakeStore {
    async fn verify_bucket_access(&self, _bucket: &str) -> Result<()> {
        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<HeadOutcome> {
        let state = self.state.lock().unwrap();
        let lookup = (bucket.to_string(), key.to_string());

        if state.fail_heads.contains(&lookup) {
            return Err(Self::storage_error(format!(
                "simulated transport failure heading '{key}' in '{bucket}'"
            )));
        }

        if state.head_service_errors.contains(&lookup) {
            return Ok(HeadOutcome::ServiceError {
                code: Some("AccessDenied".to_string()),
                message: format!("simulated rejection heading '{key}' in '{bucket}'"),
            });
        }

        match state.objects.get(&lookup) {
            Some(object) => Ok(HeadOutcome::Found(ObjectHead {
                content_type: object.content_type.clone(),
                cache_control: object.cache_control.clone(),
            })),
            None => Ok(HeadOutcome::NotFound),
        }
    }

    fn list_pages(
        &self,
        bucket: &str,
        prefix: Option<String>,
        start_after: Option<String>,
        page_size: i32,
    ) -> BoxStream<'static, Result<Vec<String>>> {
        let state = self.state.lock().unwrap();

        if state.fail_listing {
            let bucket = bucket.to_string();
            return futures::stream::once(async move {
                Err(FakeStore::storage_error(format!(
                    "simulated listing failure in '{bucket}'"
                )))
            })
            .boxed();
        }

        // Snapshot the matching keys up front; the BTreeMap keeps them in listing order
        let keys = state
            .objects
            .keys()
            .filter(|(object_bucket, key)| {
                object_bucket == bucket
                    && prefix
                        .as_deref()
                        .map(|prefix| key.starts_with(prefix))
                        .unwrap_or(true)
                    && start_after
                        .as_deref()
                        .map(|start_after| key.as_str() > start_after)
                        .unwrap_or(true)
            })
            .map(|(_, key)| key.clone())
            .collect::<Vec<_>>();

        let pages = keys
            .chunks(page_size.max(1) as usize)
            .map(|page| Ok(page.to_vec()))
            .collect::<Vec<_>>();

        futures::stream::iter(pages).boxed()
    }

    async fn copy_with_metadata_replace(
        &self,
        from_bucket: &str,
        to_bucket: &str,
        key: &str,
        cache_control: &str,
        content_type: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state
            .fail_copies
            .contains(&(to_bucket.to_string(), key.to_string()))
        {
            return Err(Self::storage_error(format!(
                "simulated copy failure for '{key}' in '{to_bucket}'"
            )));
        }

        if !state
            .objects
            .contains_key(&(from_bucket.to_string(), key.to_string()))
        {
            return Err(Self::storage_error(format!(
                "copy source '{key}' does not exist in '{from_bucket}'"
            )));
        }

        state.objects.insert(
            (to_bucket.to_string(), key.to_string()),
            FakeObject {
                content_type: Some(content_type.to_string()),
                cache_control: Some(cache_control.to_string()),
            },
        );

        state.copies.push(CopyRecord {
            from_bucket: from_bucket.to_string(),
            to_bucket: to_bucket.to_string(),
            key: key.to_string(),
            cache_control: cache_control.to_string(),
            content_type: content_type.to_string(),
        });

        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectCounter for FakeStore {
    async fn object_count(&self, bucket: &str) -> Result<u64> {
        self.state
            .lock()
            .unwrap()
            .object_count
            .ok_or_else(|| Self::storage_error(format!("no object count metric for '{bucket}'")))
    }

    async fn object_count_with_role(&self, bucket: &str, _role_arn: &str) -> Result<u64> {
        self.state
            .lock()
            .unwrap()
            .role_object_count
            .ok_or_else(|| {
                Self::storage_error(format!("no cross-account object count metric for '{bucket}'"))
            })
    }
}

impl std::fmt::Debug for FakeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FakeStore")
    }
}
