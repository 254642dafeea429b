//! Console rendering of job progress
use indicatif::ProgressBar;
use recache::{CopyStatus, ProgressCallback, ProgressReport, RecacheError};
use std::borrow::Cow;
use std::future::Future;
use std::io::Write;
use std::time::Duration;

/// Run a future with an animated spinner on the terminal, clearing it when the future resolves.
///
/// Used for the one-off setup steps (bucket validation, size estimation) that would otherwise
/// look like a hang on slow connections.
pub(crate) async fn with_spinner<F, T>(message: impl Into<Cow<'static, str>>, fut: F) -> T
where
    F: Future<Output = T>,
{
    let spinner = ProgressBar::new_spinner().with_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = fut.await;

    spinner.finish_and_clear();

    result
}

/// [`ProgressCallback`] implementation that renders the run the way operators watch it: one
/// status character per object, with a multi-line totals block every few seconds
pub(crate) struct ConsoleReport {
    quiet: bool,
}

impl ConsoleReport {
    pub(crate) fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    fn print_report(&self, report: &ProgressReport) {
        let expected = if report.expected > 0 {
            report.expected.to_string()
        } else {
            "?".to_string()
        };

        println!(
            "\n{:<30} Totals: {}/{} objects. Avg: {:.2} obj/s. ETA: {}",
            report.last_key, report.processed, expected, report.objects_per_second, report.eta
        );

        if !report.content_type_counts.is_empty() {
            println!("Content-Type stats:");
            for (content_type, count) in &report.content_type_counts {
                println!("  {content_type}: {count}");
            }
        }

        if !report.status_counts.is_empty() {
            println!("Copy status stats:");
            for (status, count) in &report.status_counts {
                println!("  {status}: {count}");
            }
        }
    }
}

impl ProgressCallback for ConsoleReport {
    fn expected_objects(&self, expected: u64) {
        if expected > 0 {
            println!("Source bucket holds approximately {expected} objects");
        } else {
            println!("Source bucket object count is unknown; no ETA will be shown");
        }
    }

    fn object_processed(&self, status: CopyStatus, _key: &str) {
        if !self.quiet {
            print!("{}", status.code());
            // One char per object; without the flush nothing shows until the buffer fills
            let _ = std::io::stdout().flush();
        }
    }

    fn object_failed(&self, _key: &str, _error: &RecacheError) {
        // Failures already produce an 'F' in the status stream and a line in the error log
    }

    fn progress_report(&self, report: &ProgressReport) {
        self.print_report(report);
    }

    fn final_report(&self, report: &ProgressReport) {
        self.print_report(report);
    }
}
