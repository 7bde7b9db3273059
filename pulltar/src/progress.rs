use chrono::{DateTime, Utc};

/// A single progress update emitted by a pull or extract operation.
///
/// Notifications are correlated by [`correlation_id`](Self::correlation_id): all updates about the
/// same unit of work (the archive download as a whole, or one file being unpacked) carry the same
/// id, and the update with a `percent_complete` of 100 is the last one emitted for that id.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressNotification {
    /// Identifier correlating all updates about the same unit of work.
    pub correlation_id: String,

    /// Human-readable description of the work being reported on.
    pub message: String,

    /// How far along the work is, from 0 to 100.
    pub percent_complete: f64,

    /// Bytes processed so far, or 0 if not applicable.
    pub current_bytes: u64,

    /// Total bytes the work covers, or 0 if not known.
    pub total_bytes: u64,

    /// When the work being reported on started.
    pub started_at: DateTime<Utc>,
}

impl ProgressNotification {
    /// Make a new notification with the given correlation id, message, and completion percentage.
    ///
    /// The percentage is clamped to the range 0 to 100.  Byte counts start out zeroed and the
    /// start time defaults to now; use [`with_bytes`](Self::with_bytes) and
    /// [`with_started_at`](Self::with_started_at) to fill them in.
    pub fn new(
        correlation_id: impl Into<String>,
        message: impl Into<String>,
        percent_complete: f64,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            message: message.into(),
            percent_complete: percent_complete.clamp(0.0, 100.0),
            current_bytes: 0,
            total_bytes: 0,
            started_at: Utc::now(),
        }
    }

    pub fn with_bytes(mut self, current_bytes: u64, total_bytes: u64) -> Self {
        self.current_bytes = current_bytes;
        self.total_bytes = total_bytes;
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    /// Whether this notification marks the end of the unit of work it describes.
    ///
    /// No further notifications will be emitted for this correlation id after a closed one.
    pub fn is_closed(&self) -> bool {
        self.percent_complete >= 100.0
    }

    /// Estimate the time remaining, extrapolating from the elapsed time and the completion
    /// percentage.
    ///
    /// Returns `None` if no progress has been made yet, since no meaningful estimate is possible.
    pub fn eta(&self) -> Option<chrono::Duration> {
        if self.percent_complete <= 0.0 {
            return None;
        }

        let elapsed = Utc::now() - self.started_at;
        let remaining_ratio = (100.0 - self.percent_complete).max(0.0) / self.percent_complete;
        let remaining_millis = (elapsed.num_milliseconds() as f64 * remaining_ratio) as i64;

        Some(chrono::Duration::milliseconds(remaining_millis))
    }
}

/// A trait which callers can implement to receive progress notifications as a pull or extract
/// operation is progressing.
///
/// Operations emit notifications from multiple tasks concurrently, so implementations need to be
/// thread safe.
#[allow(unused_variables)]
pub trait NotificationSink: Sync + Send {
    /// A new progress notification has been produced.
    fn notify(&self, notification: ProgressNotification) {}
}

impl<T: NotificationSink + ?Sized> NotificationSink for std::sync::Arc<T> {
    fn notify(&self, notification: ProgressNotification) {
        (**self).notify(notification)
    }
}
