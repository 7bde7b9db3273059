use clap::{Parser, Subcommand};
use color_eyre::eyre::eyre;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use url::Url;

mod progress;

/// Version string for `--version` with the compile-time metadata appended
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_CARGO_TARGET_TRIPLE"),
    ", opt level ",
    env!("VERGEN_CARGO_OPT_LEVEL"),
    ")"
);

/// Download tar archives from S3-compatible storage and extract them on the fly
#[derive(Parser, Debug)]
#[clap(author, version, long_version = LONG_VERSION, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[clap(flatten)]
    config: pulltar::Config,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a tar archive from S3 and extract it to a local directory
    Pull {
        /// URL of the archive object to download.
        ///
        /// The URL must name both the bucket and the full object key, ie
        /// `s3://my-bucket/backups/snapshot.tar.gz`.  Plain tar and gzip-compressed tar archives
        /// are both supported; the format is detected from the object's contents, not its name.
        #[clap(value_parser, value_name = "URL")]
        archive: Url,

        /// Local directory into which the archive's contents are extracted.
        ///
        /// The directory is created if it doesn't already exist.
        #[clap(value_parser, value_name = "DIR")]
        destination: PathBuf,
    },

    /// Extract a tar archive that's already on the local filesystem
    Extract {
        /// Path of the archive file to extract.
        ///
        /// Plain tar and gzip-compressed tar archives are both supported; the format is detected
        /// from the file's contents, not its name.
        #[clap(value_parser, value_name = "FILE")]
        archive: PathBuf,

        /// Local directory into which the archive's contents are extracted.
        ///
        /// The directory is created if it doesn't already exist.
        #[clap(value_parser, value_name = "DIR")]
        destination: PathBuf,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals)?;

    match args.command {
        Command::Pull {
            archive,
            destination,
        } => {
            let (source_path, filename) = split_archive_url(&archive)?;

            let config = args.globals.config.clone();

            let downloader = progress::with_spinner(
                &args.globals,
                "Connecting to object storage...",
                pulltar::downloader_for_url(&config, &archive),
            )
            .await?;

            let request = pulltar::DownloadRequest {
                source_path,
                filename: filename.clone(),
                destination,
                chunk_size: None,
                correlation_id: filename.clone(),
                message: format!("Downloading {filename}"),
            };

            let job = progress::with_spinner(
                &args.globals,
                "Computing download layout...",
                pulltar::PullJobBuilder::new(config, downloader, request).build(),
            )
            .await?;

            progress::run_pull_job(&args.globals, job).await?;
        }
        Command::Extract {
            archive,
            destination,
        } => {
            progress::run_extract_job(&args.globals, archive, destination).await?;
        }
    }

    Ok(())
}

/// Split an `s3://bucket/path/to/archive.tar` URL into the path under the bucket and the archive
/// file name.
fn split_archive_url(url: &Url) -> color_eyre::Result<(String, String)> {
    let key = url.path().trim_start_matches('/');

    if key.is_empty() || key.ends_with('/') {
        return Err(eyre!(
            "The URL '{url}' doesn't name an archive object; it should look like s3://bucket/path/to/archive.tar"
        ));
    }

    let (source_path, filename) = match key.rsplit_once('/') {
        Some((path, name)) => (path.to_string(), name.to_string()),
        None => (String::new(), key.to_string()),
    };

    Ok((source_path, filename))
}

/// Send log events to stderr, filtered according to the verbosity arguments (or `RUST_LOG` when
/// it's set).
fn init_logging(globals: &Globals) -> color_eyre::Result<()> {
    let default_filter = if globals.verbose {
        "pulltar=debug,pulltar_cli=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "pulltar=info,warn"
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
