//! Dedup for the orchestrator's one-shot chat replies.
//!
//! `PhotoRecord` carries no "already told the chat about this" bit — every
//! stage-completion notification is delivered at least once and can be
//! redelivered by a worker's idempotency fast path (see
//! `pixelflow_worker::handle_notification`'s republish-and-return branch), so
//! without this the NSFW and published replies could fire repeatedly for one
//! photo. Tracked process-locally, the same shape as [`crate::quota`].

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyKind {
    Nsfw,
    Published,
    QuotaDenied,
}

pub struct NotifyTracker {
    sent: Mutex<HashSet<(String, NotifyKind)>>,
}

impl NotifyTracker {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(HashSet::new()),
        }
    }

    /// True the first time this (photo, kind) pair is seen; false on every
    /// subsequent call, so the caller sends its reply exactly once.
    pub fn should_send(&self, photo_id: &str, kind: NotifyKind) -> bool {
        let mut sent = self.sent.lock().expect("notify mutex poisoned");
        sent.insert((photo_id.to_string(), kind))
    }
}

impl Default for NotifyTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_photo_and_kind() {
        let tracker = NotifyTracker::new();
        assert!(tracker.should_send("p1", NotifyKind::Nsfw));
        assert!(!tracker.should_send("p1", NotifyKind::Nsfw));
        assert!(tracker.should_send("p1", NotifyKind::Published));
        assert!(tracker.should_send("p2", NotifyKind::Nsfw));
    }
}
