//! Progress notification sinks that render the job's notifications as progress bars
use pulltar::{NotificationSink, ProgressNotification, Result};
use std::{
    borrow::Cow,
    future::Future,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Show a spinner for a task whose duration can't be measured, clearing it when the task ends.
pub(crate) async fn with_spinner<S, F, T>(globals: &super::Globals, message: S, task: F) -> T
where
    S: Into<Cow<'static, str>>,
    F: Future<Output = T>,
{
    let spinner = if hide_progress(globals) {
        indicatif::ProgressBar::hidden()
    } else {
        indicatif::ProgressBar::new_spinner()
    };

    spinner.set_style(
        indicatif::ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Run a pull job with progress bars wired up to its notifications.
pub(crate) async fn run_pull_job(globals: &super::Globals, job: pulltar::PullJob) -> Result<()> {
    let progress = PullProgressReport::new(hide_progress(globals), &job);

    // Ctrl-C turns into an abort, so the job can sweep up its partially downloaded chunks before
    // the process exits
    let abort = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received; aborting download");
            }
            Err(e) => {
                tracing::warn!(err = ?e, "Couldn't listen for Ctrl-C; an interrupt will kill the process immediately");

                std::future::pending::<()>().await;
            }
        }
    };

    job.run(abort, progress).await
}

/// Extract an archive file already on the local filesystem, rendering per-file progress.
pub(crate) async fn run_extract_job(
    globals: &super::Globals,
    archive: PathBuf,
    destination: PathBuf,
) -> Result<()> {
    let progress = ExtractProgressReport::new(hide_progress(globals));

    pulltar::extract_archive_file(archive, destination, progress).await
}

/// Progress bars stay hidden in verbose mode, where interleaved log lines would shred the bar
/// rendering, and in quiet mode, where nothing extra should be drawn at all.
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

fn bar_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::with_template(
        "{spinner:.green} {prefix}: {msg:<50!} [{bar:25.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
    )
    .unwrap()
    .progress_chars("#>-")
}

/// Right-align the prefix by hand.  The template's alignment syntax pads the rendered bar
/// segment, not the prefix string, so bars with different prefixes end up ragged without this.
fn aligned_prefix(prefix: &'static str) -> String {
    const PREFIX_WIDTH: usize = 20;

    assert!(
        prefix.len() <= PREFIX_WIDTH,
        "prefix '{prefix}' doesn't fit the progress bar gutter"
    );

    format!("{prefix:>PREFIX_WIDTH$}")
}

fn multi_progress(hide_progress: bool) -> indicatif::MultiProgress {
    if hide_progress {
        indicatif::MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden())
    } else {
        indicatif::MultiProgress::new()
    }
}

/// Renders a pull job's notifications: one bar for the archive download, one for whichever file
/// is currently being extracted.
#[derive(Clone)]
struct PullProgressReport {
    /// Groups the bars so they draw on separate lines without fighting over the terminal
    #[allow(dead_code)] // Held so the shared draw target outlives the bars
    multi: indicatif::MultiProgress,

    /// Bytes of the remote archive downloaded so far.
    ///
    /// Chunks download in parallel, so this counts bytes in whatever order they arrive, not in
    /// archive order.
    archive_downloaded: indicatif::ProgressBar,

    /// The file currently being extracted from the reassembled archive stream.
    ///
    /// Extraction trails the download bar, since a file can only be extracted once every chunk
    /// overlapping it has arrived.
    extract_file: indicatif::ProgressBar,

    /// Correlation id of the whole-archive notifications, to tell them apart from the per-file
    /// extraction notifications
    archive_id: String,

    /// Correlation id of the file currently owning the `extract_file` bar
    current_file: Arc<Mutex<Option<String>>>,
}

impl PullProgressReport {
    fn new(hide_progress: bool, job: &pulltar::PullJob) -> Self {
        let multi = multi_progress(hide_progress);

        let archive_downloaded = multi.add(indicatif::ProgressBar::new(job.total_bytes()));
        archive_downloaded.set_prefix(aligned_prefix("Download archive"));
        archive_downloaded.set_style(bar_style());

        let extract_file = multi.add(indicatif::ProgressBar::new(0));
        extract_file.set_style(bar_style());
        extract_file.set_prefix(aligned_prefix("Extract file"));

        Self {
            multi,
            archive_downloaded,
            extract_file,
            archive_id: job.correlation_id().to_string(),
            current_file: Arc::new(Mutex::new(None)),
        }
    }
}

impl NotificationSink for PullProgressReport {
    fn notify(&self, notification: ProgressNotification) {
        if notification.correlation_id == self.archive_id {
            self.archive_downloaded.set_length(notification.total_bytes);
            self.archive_downloaded
                .set_position(notification.current_bytes);

            if notification.is_closed() {
                let total_bytes = indicatif::BinaryBytes(notification.total_bytes);

                self.archive_downloaded
                    .finish_with_message(format!("Done ({total_bytes})"));
            } else {
                self.archive_downloaded.set_message(notification.message);
            }
        } else {
            let mut current = self.current_file.lock().unwrap();

            if current.as_deref() != Some(notification.correlation_id.as_str()) {
                // A new file has started extracting
                *current = Some(notification.correlation_id.clone());

                self.extract_file.set_length(notification.total_bytes);
                self.extract_file.set_message(notification.message.clone());
            }

            self.extract_file.set_position(notification.current_bytes);
        }
    }
}

/// Renders extraction of a local archive file.
///
/// Local extraction emits only per-file notifications, so there's just the one bar.
#[derive(Clone)]
struct ExtractProgressReport {
    /// Groups the bars so they draw on separate lines without fighting over the terminal
    #[allow(dead_code)] // Held so the shared draw target outlives the bars
    multi: indicatif::MultiProgress,

    /// The file currently being extracted from the archive
    extract_file: indicatif::ProgressBar,

    /// Correlation id of the file currently owning the `extract_file` bar
    current_file: Arc<Mutex<Option<String>>>,
}

impl ExtractProgressReport {
    fn new(hide_progress: bool) -> Self {
        let multi = multi_progress(hide_progress);

        let extract_file = multi.add(indicatif::ProgressBar::new(0));
        extract_file.set_style(bar_style());
        extract_file.set_prefix(aligned_prefix("Extract file"));

        Self {
            multi,
            extract_file,
            current_file: Arc::new(Mutex::new(None)),
        }
    }
}

impl NotificationSink for ExtractProgressReport {
    fn notify(&self, notification: ProgressNotification) {
        let mut current = self.current_file.lock().unwrap();

        if current.as_deref() != Some(notification.correlation_id.as_str()) {
            // A new file has started extracting
            *current = Some(notification.correlation_id.clone());

            self.extract_file.set_length(notification.total_bytes);
            self.extract_file.set_message(notification.message.clone());
        }

        self.extract_file.set_position(notification.current_bytes);
    }
}
