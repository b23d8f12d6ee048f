//! C9: the chat-bot orchestrator (spec.md §4.9).
//!
//! Two duties share the one process: ingest (turn an inbound chat photo into
//! a seeded [`pixelflow_core::PhotoRecord`]) and the readiness gate (watch
//! the bus, decide when a photo's enrichment is complete, and flip
//! `publish`). Neither duty depends on the chat platform being Telegram
//! specifically — that's abstracted behind [`chat::ChatPlatform`].

pub mod chat;
pub mod notify;
pub mod quota;
pub mod settings;

/// Derive a stable `photo_id` from a chat platform's file identifier.
///
/// Grounded in the teacher's `AtomScraper::create_article_id`: a truncated
/// blake3 hash, hex-encoded, rather than trusting the platform's file id
/// directly as a record key (Telegram file ids are long and platform
/// specific; this keeps the record store's key shape uniform).
pub fn derive_photo_id(chat_id: i64, file_unique_id: &str) -> String {
    let combined = format!("{chat_id}:{file_unique_id}");
    let hash = blake3::hash(combined.as_bytes());
    data_encoding::HEXLOWER.encode(&hash.as_bytes()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_yields_same_id() {
        assert_eq!(derive_photo_id(1, "abc"), derive_photo_id(1, "abc"));
    }

    #[test]
    fn different_chats_yield_different_ids() {
        assert_ne!(derive_photo_id(1, "abc"), derive_photo_id(2, "abc"));
    }
}
