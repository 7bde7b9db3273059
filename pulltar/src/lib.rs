#![doc = include_str!("../README.md")]

mod config;
mod downloader;
mod error;
mod extract;
mod format;
mod progress;
mod pull;

pub use config::Config;
pub use downloader::{downloader_for_url, ChunkDownloader};
pub use error::{PullTarError, Result};
pub use extract::*;
pub use format::ArchiveFormat;
pub use progress::{NotificationSink, ProgressNotification};
pub use pull::*;
