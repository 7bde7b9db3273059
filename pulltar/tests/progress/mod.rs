//! Implementation of [`pulltar::NotificationSink`] which records every notification an operation
//! emits, so tests can assert afterwards on what progress was reported.
use more_asserts::*;
use pulltar::{NotificationSink, ProgressNotification};
use std::sync::{Arc, Mutex};

/// Sink which accumulates every notification in memory, in the order they were delivered.
#[derive(Clone)]
pub struct TestNotificationSink {
    notifications: Arc<Mutex<Vec<ProgressNotification>>>,
}

impl TestNotificationSink {
    pub fn new() -> Self {
        Self {
            notifications: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// All notifications recorded so far.
    pub fn notifications(&self) -> Vec<ProgressNotification> {
        self.notifications.lock().unwrap().clone()
    }

    /// The notifications recorded for one correlation id, in delivery order.
    pub fn notifications_for(&self, correlation_id: &str) -> Vec<ProgressNotification> {
        self.notifications()
            .into_iter()
            .filter(|notification| notification.correlation_id == correlation_id)
            .collect()
    }

    /// Review all notifications after an operation has run, validating the invariants that must
    /// hold however the operation ended.
    ///
    /// Updates produced by concurrent download workers can be delivered in any order, so byte
    /// counts are not required to arrive monotonically.  What must hold for every correlation id
    /// regardless of ordering:
    ///
    /// - all updates agree on the total byte count
    /// - no update claims more bytes than that total
    /// - there is at most one closing update, nothing follows it, and it reports the highest
    ///   byte count of the whole series
    #[track_caller]
    pub fn sanity_check_notifications(&self) {
        let notifications = self.notifications();

        let mut ids = notifications
            .iter()
            .map(|notification| notification.correlation_id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids.dedup();

        for id in ids {
            let series = self.notifications_for(&id);

            let total = series[0].total_bytes;
            for notification in &series {
                assert_eq!(
                    notification.total_bytes, total,
                    "updates for '{id}' don't agree on the total byte count"
                );
                assert_le!(
                    notification.current_bytes, total,
                    "an update for '{id}' claims more than the total of {total} bytes"
                );
            }

            let closing = series
                .iter()
                .enumerate()
                .filter(|(_, notification)| notification.is_closed())
                .collect::<Vec<_>>();
            assert_le!(closing.len(), 1, "more than one closing update for '{id}'");

            if let Some((position, closing)) = closing.first() {
                assert_eq!(
                    *position,
                    series.len() - 1,
                    "updates for '{id}' continued after the closing one"
                );

                let highest = series
                    .iter()
                    .map(|notification| notification.current_bytes)
                    .max()
                    .unwrap();
                assert_eq!(
                    closing.current_bytes, highest,
                    "the closing update for '{id}' doesn't report the highest byte count"
                );
            }
        }
    }

    /// Verify that the work unit with the given correlation id reported a closing update which
    /// covers all of its bytes.
    #[track_caller]
    pub fn assert_closed(&self, correlation_id: &str) {
        let series = self.notifications_for(correlation_id);

        let last = series
            .last()
            .unwrap_or_else(|| panic!("no notifications at all for '{correlation_id}'"));

        assert!(
            last.is_closed(),
            "the last notification for '{correlation_id}' isn't a closing one: {last:?}"
        );
        assert_eq!(
            last.current_bytes, last.total_bytes,
            "the closing notification for '{correlation_id}' doesn't cover all of its bytes"
        );
    }
}

impl NotificationSink for TestNotificationSink {
    fn notify(&self, notification: ProgressNotification) {
        self.notifications.lock().unwrap().push(notification);
    }
}
