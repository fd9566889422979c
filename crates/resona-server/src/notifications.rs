//! Persistent, de-duplicated error notifications. Scan and read failures are
//! standing conditions rather than one-shot events: they stay visible until
//! the corresponding operation succeeds again, at which point they are
//! removed by id.

use parking_lot::Mutex;

/// Stable id: a 4-character category tag in the high 32 bits, a hash of the
/// offending path or name in the low 32.
pub fn notification_id(category: &str, text: &str) -> u64 {
    let mut tag = [b' '; 4];
    for (slot, byte) in tag.iter_mut().zip(category.bytes()) {
        *slot = byte;
    }
    ((u32::from_be_bytes(tag) as u64) << 32) | hash32(text) as u64
}

// FNV-1a
fn hash32(text: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in text.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub error: Option<String>,
    pub id: u64,
}

/// Threadsafe notification sink shared between the server and its clients.
#[derive(Default)]
pub struct ErrorNotifications {
    items: Mutex<Vec<Notification>>,
}

impl ErrorNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, or overwrite the existing notification with the same id.
    pub fn add_or_update(&self, notification: Notification) {
        let mut items = self.items.lock();
        if let Some(existing) = items.iter_mut().find(|n| n.id == notification.id) {
            *existing = notification;
        } else {
            items.push(notification);
        }
    }

    /// Clear a standing notification once its operation succeeds again.
    pub fn remove(&self, id: u64) {
        self.items.lock().retain(|n| n.id != id);
    }

    pub fn items(&self) -> Vec<Notification> {
        self.items.lock().clone()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.items.lock().iter().any(|n| n.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn notification(id: u64, title: &str) -> Notification {
        Notification {
            title: title.to_owned(),
            message: String::new(),
            error: None,
            id,
        }
    }

    #[test]
    fn add_or_update_dedups_by_id() {
        let sink = ErrorNotifications::new();
        sink.add_or_update(notification(1, "first"));
        sink.add_or_update(notification(1, "updated"));
        sink.add_or_update(notification(2, "other"));
        let items = sink.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "updated");
    }

    #[test]
    fn remove_clears_standing_errors() {
        let sink = ErrorNotifications::new();
        sink.add_or_update(notification(7, "gone soon"));
        assert!(sink.contains(7));
        sink.remove(7);
        assert!(sink.is_empty());
    }

    #[test]
    fn ids_separate_category_and_subject() {
        assert_ne!(
            notification_id("lib ", "Strings"),
            notification_id("inst", "Strings")
        );
        assert_ne!(
            notification_id("inst", "Strings"),
            notification_id("inst", "Brass")
        );
        assert_eq!(
            notification_id("inst", "Strings"),
            notification_id("inst", "Strings")
        );
    }
}
