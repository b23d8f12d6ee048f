//! Per-chat publish quota (spec.md §4.9, "a chat may publish at most N
//! photos"), enforced in-process rather than through the record store.
//!
//! A `std::sync::Mutex` guarding a plain `HashMap` is held only across the
//! single `contains`/`insert`-style check below, never across an `.await` —
//! the one exception noted in SPEC_FULL.md §5, grounded in the teacher's
//! `WriteTransactionCtx` hook list, which is guarded the same way for the
//! same reason: the critical section is synchronous and tiny.

use std::collections::HashMap;
use std::sync::Mutex;

pub struct QuotaTracker {
    limit: u32,
    published: Mutex<HashMap<i64, u32>>,
}

impl QuotaTracker {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            published: Mutex::new(HashMap::new()),
        }
    }

    /// True if `chat_id` still has publish quota remaining.
    pub fn has_quota(&self, chat_id: i64) -> bool {
        let published = self.published.lock().expect("quota mutex poisoned");
        published.get(&chat_id).copied().unwrap_or(0) < self.limit
    }

    /// Record that `chat_id` just published one photo.
    pub fn record_publish(&self, chat_id: i64) {
        let mut published = self.published.lock().expect("quota mutex poisoned");
        *published.entry(chat_id).or_insert(0) += 1;
    }
}
