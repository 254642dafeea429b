//! End-to-end runs of the whole copy pipeline (producer, worker pool, statistics stage) against
//! the in-memory object store, exercising the per-object decision rules, the soft copy budget,
//! resume, key-list input, and failure isolation.
use crate::Result;
use recache::{Config, JobInput, RewriteJobBuilder, RunSummary, DEFAULT_CACHE_CONTROL};
use recache_testing::fake::FakeStore;
use recache_testing::logging;

/// A builder pre-wired to the fake store, with a small worker pool so budget-related assertions
/// have tight bounds
fn job_builder(
    store: &FakeStore,
    target_bucket: &str,
    log_dir: &tempfile::TempDir,
) -> RewriteJobBuilder {
    let config = Config {
        parallelism: 4,
        ..Config::default()
    };

    RewriteJobBuilder::new(config, target_bucket)
        .with_store(store.clone())
        .with_counter(store.clone())
        .log_dir(log_dir.path())
}

/// The set of keys that were actually copied, per the store's own records
fn copied_keys(store: &FakeStore) -> std::collections::BTreeSet<String> {
    store
        .copies()
        .into_iter()
        .map(|copy| copy.key)
        .collect()
}

fn status_count(summary: &RunSummary, code: char) -> u64 {
    summary.status_counts.get(&code).copied().unwrap_or(0)
}

#[test]
fn in_place_rewrite_sets_metadata() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        store.put_object("assets", "a.png", Some("image/png"), None);
        store.put_object("assets", "b.txt", Some("text/plain"), Some("no-cache"));

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir).build().await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.copied, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(status_count(&summary, 'g'), 1);
        assert_eq!(status_count(&summary, 'Y'), 1);

        // Every processed object got exactly one outcome
        assert_eq!(summary.status_counts.values().sum::<u64>(), summary.processed);

        // The metadata was rewritten in place, and the content type survived the copy
        let a = store.object("assets", "a.png").unwrap();
        assert_eq!(a.cache_control.as_deref(), Some(DEFAULT_CACHE_CONTROL));
        assert_eq!(a.content_type.as_deref(), Some("image/png"));

        let b = store.object("assets", "b.txt").unwrap();
        assert_eq!(b.cache_control.as_deref(), Some(DEFAULT_CACHE_CONTROL));
        assert_eq!(b.content_type.as_deref(), Some("text/plain"));

        for copy in store.copies() {
            assert_eq!(copy.from_bucket, "assets");
            assert_eq!(copy.to_bucket, "assets");
        }

        Ok(())
    })
}

#[test]
fn already_set_objects_are_not_copied() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        store.put_object(
            "assets",
            "done.png",
            Some("image/png"),
            Some(DEFAULT_CACHE_CONTROL),
        );

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir).build().await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.copied, 0);
        assert_eq!(status_count(&summary, '.'), 1);
        assert!(store.copies().is_empty());

        Ok(())
    })
}

#[test]
fn excluded_pictures_are_not_copied() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        store.put_object("assets", "photos/a.jpg", Some("image/jpeg"), None);
        store.put_object("assets", "photos/b.png", Some("image/png"), None);

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir)
            .exclude_pictures("^photos/")
            .build()
            .await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.copied, 0);
        assert_eq!(status_count(&summary, 'E'), 2);
        assert!(store.copies().is_empty());

        // Untouched: the exclusion means no metadata change at all
        let a = store.object("assets", "photos/a.jpg").unwrap();
        assert_eq!(a.cache_control, None);

        Ok(())
    })
}

#[test]
fn exclusion_only_applies_to_pictures() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        // The key matches the exclusion pattern, but the content type is not JPEG or PNG, so the
        // object is processed normally
        store.put_object("assets", "photos/report.pdf", Some("application/pdf"), None);

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir)
            .exclude_pictures("^photos/")
            .build()
            .await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        assert_eq!(summary.copied, 1);
        assert_eq!(status_count(&summary, 'P'), 1);
        assert_eq!(copied_keys(&store), ["photos/report.pdf".to_string()].into());

        Ok(())
    })
}

#[test]
fn invalid_exclude_pattern_fails_the_build() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();

        let log_dir = tempfile::tempdir()?;
        let result = job_builder(&store, "assets", &log_dir)
            .exclude_pictures("photos/(")
            .build()
            .await;

        assert_matches::assert_matches!(
            result,
            Err(recache::RecacheError::InvalidExcludePattern { pattern, .. }) if pattern == "photos/("
        );

        Ok(())
    })
}

#[test]
fn missing_content_type_defaults_to_png_and_second_run_skips() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        store.put_object("assets", "screenshot", None, None);

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir).build().await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        assert_eq!(summary.copied, 1);
        assert_eq!(status_count(&summary, 'X'), 1);

        let object = store.object("assets", "screenshot").unwrap();
        assert_eq!(object.content_type.as_deref(), Some("image/png"));
        assert_eq!(object.cache_control.as_deref(), Some(DEFAULT_CACHE_CONTROL));

        // The rewrite is idempotent: a second run over the same bucket finds nothing to do
        let job = job_builder(&store, "assets", &log_dir).build().await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        assert_eq!(summary.copied, 0);
        assert_eq!(status_count(&summary, '.'), 1);
        assert_eq!(store.copies().len(), 1);

        Ok(())
    })
}

#[test]
fn copy_budget_overshoot_is_bounded_by_the_worker_count() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        for i in 0..50 {
            store.put_object("assets", &format!("obj-{i:03}"), Some("image/png"), None);
        }

        let budget = 5u64;
        let parallelism = 4u64;

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir)
            .first_n(budget)
            .build()
            .await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        // The budget is soft: workers already past the check when it fills still complete their
        // copies, so the overshoot is bounded by the number of workers minus one
        assert!(summary.copied >= budget);
        assert!(summary.copied < budget + parallelism);

        // Every counted copy really happened, exactly once, and agrees with the per-status tally
        assert_eq!(store.copies().len() as u64, summary.copied);
        let copy_statuses: u64 = summary
            .status_counts
            .iter()
            .filter(|(code, _)| ['X', 'g', 'j', 'P', 'Y'].contains(code))
            .map(|(_, count)| count)
            .sum();
        assert_eq!(copy_statuses, summary.copied);

        Ok(())
    })
}

#[test]
fn resume_continues_strictly_after_the_checkpoint_key() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        for key in ["alpha", "bravo", "charlie", "delta"] {
            store.put_object("assets", key, Some("image/png"), None);
        }

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir).build().await?;
        let summary = job
            .run_without_progress(JobInput::bucket_resume_after("bravo"))
            .await?;

        assert_eq!(summary.processed, 2);
        assert_eq!(
            copied_keys(&store),
            ["charlie".to_string(), "delta".to_string()].into()
        );

        // The checkpoint key itself is not reprocessed
        assert_eq!(store.object("assets", "bravo").unwrap().cache_control, None);

        Ok(())
    })
}

#[test]
fn key_list_input_expands_wildcards_and_skips_comments() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        store.put_object("assets", "direct.txt", Some("text/plain"), None);
        store.put_object("assets", "images/a.png", Some("image/png"), None);
        store.put_object("assets", "images/b.png", Some("image/png"), None);
        store.put_object("assets", "other.txt", Some("text/plain"), None);

        let input = b"# keys recovered from the error log\n\
                      \n\
                      direct.txt\n\
                      /images/*\n"
            .to_vec();

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir).build().await?;
        let summary = job
            .run_without_progress(JobInput::key_list(tokio::io::BufReader::new(
                std::io::Cursor::new(input),
            )))
            .await?;

        assert_eq!(summary.processed, 3);
        assert_eq!(
            copied_keys(&store),
            [
                "direct.txt".to_string(),
                "images/a.png".to_string(),
                "images/b.png".to_string(),
            ]
            .into()
        );

        // Not named by any line, so never touched
        assert_eq!(store.object("assets", "other.txt").unwrap().cache_control, None);

        Ok(())
    })
}

#[test]
fn key_list_failures_are_reported_per_key() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        store.put_object("assets", "exists.png", Some("image/png"), None);

        let input = b"exists.png\ndoes-not-exist.png\n".to_vec();

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir).build().await?;
        let summary = job
            .run_without_progress(JobInput::key_list(tokio::io::BufReader::new(
                std::io::Cursor::new(input),
            )))
            .await?;

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.copied, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(status_count(&summary, 'F'), 1);

        Ok(())
    })
}

#[test]
fn source_head_failure_is_isolated_and_logged() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        store.put_object("assets", "good-1.png", Some("image/png"), None);
        store.put_object("assets", "broken.png", Some("image/png"), None);
        store.put_object("assets", "good-2.png", Some("image/png"), None);
        store.fail_head("assets", "broken.png");

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir).build().await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        // One key failed; the others were unaffected
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.copied, 2);
        assert_eq!(
            copied_keys(&store),
            ["good-1.png".to_string(), "good-2.png".to_string()].into()
        );

        // The failing key is recorded in the error log for a later retry via --stdin
        let error_log = tokio::fs::read_to_string(&summary.error_log).await?;
        assert_eq!(error_log, "broken.png\n");

        Ok(())
    })
}

#[test]
fn audit_log_records_status_content_type_and_key() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        store.put_object("assets", "a.png", Some("image/png"), None);
        store.put_object(
            "assets",
            "done.pdf",
            Some("application/pdf"),
            Some(DEFAULT_CACHE_CONTROL),
        );

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir).build().await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        let audit_log = tokio::fs::read_to_string(&summary.audit_log).await?;
        let mut lines = audit_log.lines().collect::<Vec<_>>();
        lines.sort_unstable();

        // Workers finish in arbitrary order, hence the sort
        assert_eq!(
            lines,
            vec![".\tapplication/pdf\tdone.pdf", "g\timage/png\ta.png"]
        );

        Ok(())
    })
}

#[test]
fn target_head_rejection_is_treated_as_a_missing_target() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        store.put_object("source", "x.pdf", Some("application/pdf"), None);
        // The target even has the desired metadata already, but the head request is rejected, so
        // there is no way to know that; the idempotent copy goes ahead
        store.put_object(
            "target",
            "x.pdf",
            Some("application/pdf"),
            Some(DEFAULT_CACHE_CONTROL),
        );
        store.head_service_error("target", "x.pdf");

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "target", &log_dir)
            .from_bucket("source")
            .build()
            .await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        assert_eq!(summary.copied, 1);
        assert_eq!(status_count(&summary, 'P'), 1);

        let copies = store.copies();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].from_bucket, "source");
        assert_eq!(copies[0].to_bucket, "target");

        Ok(())
    })
}

#[test]
fn dry_run_classifies_without_modifying_anything() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        store.put_object("assets", "a.png", Some("image/png"), None);
        store.put_object("assets", "untyped", None, None);

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir)
            .dry_run(true)
            .build()
            .await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        // Counted as copies in the summary, but nothing actually changed
        assert_eq!(summary.copied, 2);
        assert_eq!(status_count(&summary, 'g'), 1);
        assert_eq!(status_count(&summary, 'X'), 1);
        assert!(store.copies().is_empty());
        assert_eq!(store.object("assets", "a.png").unwrap().cache_control, None);
        assert_eq!(store.object("assets", "untyped").unwrap().content_type, None);

        Ok(())
    })
}

#[test]
fn listing_failure_ends_the_run_cleanly() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        store.put_object("assets", "a.png", Some("image/png"), None);
        store.fail_listing();

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir).build().await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        // The listing failed before producing any keys, but the run itself still winds down in
        // an orderly way and produces a (mostly empty) summary
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.copied, 0);

        Ok(())
    })
}

#[test]
fn object_count_estimate_falls_back_to_the_cross_account_role() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        store.put_object("assets", "a.png", Some("image/png"), None);
        // No direct object count, so only the assumed-role query can answer
        store.set_role_object_count(12345);

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir)
            .metrics_role("arn:aws:iam::123456789012:role/metrics-reader")
            .build()
            .await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        assert_eq!(summary.expected, 12345);

        Ok(())
    })
}

#[test]
fn unknown_object_count_does_not_fail_the_run() -> Result<()> {
    logging::test_with_logging(async {
        let store = FakeStore::new();
        store.put_object("assets", "a.png", Some("image/png"), None);

        let log_dir = tempfile::tempdir()?;
        let job = job_builder(&store, "assets", &log_dir).build().await?;
        let summary = job.run_without_progress(JobInput::bucket()).await?;

        // No metric available from either path; the estimate is simply unknown
        assert_eq!(summary.expected, 0);
        assert_eq!(summary.copied, 1);

        Ok(())
    })
}
