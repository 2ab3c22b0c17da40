//! Desktop notification seam.

use tracing::info;

use murmur_shared::constants::NOTIFICATION_PREVIEW_CHARS;

use crate::events::NotificationPayload;

/// Best-effort notification sink.
///
/// The engine asks for permission once, the first time it has something to
/// show, and only calls [`Notifier::show`] if it was granted.
pub trait Notifier: Send + 'static {
    fn request_permission(&mut self) -> bool;
    fn show(&mut self, notification: &NotificationPayload);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn request_permission(&mut self) -> bool {
        true
    }

    fn show(&mut self, notification: &NotificationPayload) {
        info!(
            peer = %notification.peer_id,
            title = %notification.title,
            body = %notification.body,
            "New message"
        );
    }
}

/// Discards everything; permission is always denied.
#[derive(Debug, Default, Clone)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn request_permission(&mut self) -> bool {
        false
    }

    fn show(&mut self, _notification: &NotificationPayload) {}
}

/// First characters of a message body, with `...` when cut.
pub fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(NOTIFICATION_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
