//! Command line frontend for the bulk S3 metadata rewrite pipeline
use clap::Parser;
use recache::{Config, JobInput, RewriteJobBuilder};
use std::path::PathBuf;
use tracing_subscriber::filter::EnvFilter;

mod report;

#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Args {
    /// The bucket whose objects get the new metadata
    #[clap(short = 't', long, value_name = "BUCKET")]
    target_bucket: String,

    /// Read objects from this bucket instead of rewriting the target in place
    #[clap(short = 'f', long, value_name = "BUCKET")]
    from_bucket: Option<String>,

    /// The Cache-Control value to apply to every rewritten object
    #[clap(short = 'c', long, default_value = recache::DEFAULT_CACHE_CONTROL)]
    cache_control: String,

    /// Make no changes; classify and count objects only
    #[clap(long)]
    dry_run: bool,

    /// Skip JPEG and PNG objects whose keys match this regular expression
    #[clap(short = 'e', long, value_name = "REGEX")]
    exclude_pictures: Option<String>,

    /// Stop copying after approximately this many objects.
    ///
    /// The limit is approximate: workers already in flight when it is reached still finish, so
    /// the actual count can exceed it by up to the parallelism minus one.
    #[clap(short = 'n', long, value_name = "COUNT")]
    first_n: Option<u64>,

    /// Resume the bucket listing strictly after this key (useful to continue an interrupted run;
    /// the last processed key is in the previous run's object log)
    #[clap(short = 'u', long, value_name = "KEY")]
    continue_after: Option<String>,

    /// Read keys from stdin, one per line, instead of listing the bucket.
    ///
    /// Blank lines and lines starting with '#' are skipped; a line ending in '*' is expanded as
    /// a prefix listing.
    #[clap(long)]
    stdin: bool,

    /// Assume this IAM role when querying the source bucket's object count metric, for buckets
    /// owned by another account
    #[clap(short = 'r', long, value_name = "ROLE_ARN")]
    cross_account_metrics_role: Option<String>,

    /// Directory the audit and error log files are written to
    #[clap(long, default_value = ".", value_name = "DIR")]
    log_dir: PathBuf,

    /// Suppress the per-object status characters (reports still print)
    #[clap(short = 'q', long, global = true)]
    quiet: bool,

    /// Enable verbose log output (repeat for even more verbosity)
    #[clap(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(flatten)]
    config: Config,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args)?;

    let mut builder = RewriteJobBuilder::new(args.config, &args.target_bucket)
        .cache_control(&args.cache_control)
        .dry_run(args.dry_run)
        .log_dir(&args.log_dir);

    if let Some(from_bucket) = &args.from_bucket {
        builder = builder.from_bucket(from_bucket);
    }
    if let Some(pattern) = &args.exclude_pictures {
        builder = builder.exclude_pictures(pattern);
    }
    if let Some(first_n) = args.first_n {
        builder = builder.first_n(first_n);
    }
    if let Some(role_arn) = &args.cross_account_metrics_role {
        builder = builder.metrics_role(role_arn);
    }

    let job = report::with_spinner("Validating bucket access...", builder.build()).await?;

    if job.from_bucket() == job.target_bucket() {
        println!(
            "Rewriting object metadata in place in s3://{}",
            job.target_bucket()
        );
    } else {
        println!(
            "Copying objects from s3://{} into s3://{} with new metadata",
            job.from_bucket(),
            job.target_bucket()
        );
    }
    println!("Cache-Control: {}", args.cache_control);
    if args.dry_run {
        println!("Dry run: no objects will be modified");
    }

    let input = if args.stdin {
        JobInput::key_list(tokio::io::BufReader::new(tokio::io::stdin()))
    } else if let Some(key) = args.continue_after {
        JobInput::bucket_resume_after(key)
    } else {
        JobInput::bucket()
    };

    let summary = job.run(input, report::ConsoleReport::new(args.quiet)).await?;

    println!(
        "Done in {:.0?}: {} objects processed, {} copied, {} failed",
        summary.elapsed, summary.processed, summary.copied, summary.failed
    );
    println!("Object log: {}", summary.audit_log.display());
    if summary.failed > 0 {
        println!("Error log: {}", summary.error_log.display());
    }

    Ok(())
}

/// Log to stderr so the status character stream on stdout stays uncorrupted
fn init_logging(args: &Args) -> color_eyre::Result<()> {
    let level = if args.quiet {
        "warn"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("recache={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
