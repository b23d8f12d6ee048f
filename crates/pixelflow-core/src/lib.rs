//! The shared [`PhotoRecord`] entity and the monotonicity rules that make
//! concurrent, redundant stage execution safe.
//!
//! Every crate in the workspace depends on this one for the record shape and
//! for the single authoritative implementation of invariant I1 (monotone
//! fields never revert). Keeping that logic in one place is what lets C1
//! (the store) and C3 (the generic worker runtime) apply the same rule to
//! both the backing store and an in-memory snapshot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const LOG_TARGET: &str = "pixelflow::core";

/// Score above which the classifier's verdict is treated as NSFW.
pub const NSFW_THRESHOLD: f32 = 0.5;

/// Number of labels requested from the label-detection endpoint.
pub const HASHTAG_TOP_K: usize = 10;

/// Style-transfer filters the style worker picks from at random.
pub const STYLE_FILTERS: &[&str] = &[
    "la_muse",
    "rain_princess",
    "scream",
    "udnie",
    "wave",
    "wreck",
    "dora_marr",
];

/// Separator the orchestrator uses to compose `final_caption` (I4, P6).
pub const CAPTION_SEPARATOR: &str = "\n.\n.\n.\n";

/// Default per-chat publish quota (reference configuration, spec.md §4.9).
pub const DEFAULT_QUOTA_LIMIT: u32 = 3;

/// Canonical field names, in the bus payload's canonical JSON order
/// (spec.md §6). Used by [`Stage::owns`](https://docs.rs/pixelflow-worker)
/// implementations and by the store layer.
pub mod field {
    pub const PHOTO_ID: &str = "photo_id";
    pub const CHAT_ID: &str = "chat_id";
    pub const PHOTO_URL: &str = "photo_url";
    pub const CAPTION: &str = "caption";
    pub const FINAL_CAPTION: &str = "final_caption";
    pub const CAPTION_RU: &str = "caption_ru";
    pub const HASHTAG: &str = "hashtag";
    pub const HASHTAG_RU: &str = "hashtag_ru";
    pub const STYLED_URL: &str = "styled_url";
    pub const PUBLISH: &str = "publish";
    pub const PUBLISHED: &str = "published";
    pub const PUBLISHED_URL: &str = "published_url";
    pub const NSFW: &str = "nsfw";
    pub const NSFW_CHECKED: &str = "nsfw_checked";

    /// All fields, in canonical order (spec.md §6's JSON example).
    pub const ALL: &[&str] = &[
        PHOTO_ID,
        CHAT_ID,
        PHOTO_URL,
        CAPTION,
        FINAL_CAPTION,
        CAPTION_RU,
        HASHTAG,
        HASHTAG_RU,
        STYLED_URL,
        PUBLISH,
        PUBLISHED,
        PUBLISHED_URL,
        NSFW,
        NSFW_CHECKED,
    ];
}

/// The single cross-component entity (spec.md §3).
///
/// Field order matches spec.md §6's bus payload exactly; `serde` emits
/// struct fields in declaration order, so this also fixes the canonical
/// JSON wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub photo_id: String,
    pub chat_id: i64,
    pub photo_url: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub final_caption: String,
    /// Carried for wire compatibility with spec.md §6; no stage in this
    /// system writes it (see SPEC_FULL.md §11).
    #[serde(default)]
    pub caption_ru: String,
    #[serde(default)]
    pub hashtag: String,
    /// Carried for wire compatibility with spec.md §6; no stage in this
    /// system writes it (see SPEC_FULL.md §11).
    #[serde(default)]
    pub hashtag_ru: String,
    #[serde(default)]
    pub styled_url: String,
    #[serde(default)]
    pub publish: bool,
    #[serde(default)]
    pub published: bool,
    #[serde(default)]
    pub published_url: String,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub nsfw_checked: bool,
}

/// A single field's value, in the representation the store persists it as
/// (spec.md §6: booleans as `true`/`false` literals, strings verbatim).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Flag(bool),
}

impl FieldValue {
    pub fn as_store_string(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Flag(b) => b.to_string(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.is_empty(),
            FieldValue::Flag(b) => !b,
        }
    }
}

/// A stage's computed result: the fields it wants to write, in the order it
/// wants them written (relevant for C4 and C8's checked-last ordering,
/// spec.md §4.4 and §4.8).
#[derive(Debug, Clone, Default)]
pub struct FieldUpdate {
    pub fields: Vec<(&'static str, FieldValue)>,
}

impl FieldUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: FieldValue) -> Self {
        self.fields.push((name, value));
        self
    }

    pub fn text(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.fields.push((name, FieldValue::Text(value.into())));
        self
    }

    pub fn flag(mut self, name: &'static str, value: bool) -> Self {
        self.fields.push((name, FieldValue::Flag(value)));
        self
    }
}

impl PhotoRecord {
    /// Seed a new record as the orchestrator does on chat ingest
    /// (spec.md §4.9a).
    pub fn new(photo_id: impl Into<String>, chat_id: i64, photo_url: impl Into<String>) -> Self {
        Self {
            photo_id: photo_id.into(),
            chat_id,
            photo_url: photo_url.into(),
            caption: String::new(),
            final_caption: String::new(),
            caption_ru: String::new(),
            hashtag: String::new(),
            hashtag_ru: String::new(),
            styled_url: String::new(),
            publish: false,
            published: false,
            published_url: String::new(),
            nsfw: false,
            nsfw_checked: false,
        }
    }

    /// Build a record from the store's raw field map (spec.md §6's "Record
    /// layout in store"). Missing fields take their zero value.
    pub fn from_field_map(photo_id: &str, map: &HashMap<String, String>) -> Self {
        let get = |k: &str| map.get(k).cloned().unwrap_or_default();
        let get_bool = |k: &str| map.get(k).map(|v| v == "true").unwrap_or(false);
        let get_i64 = |k: &str| map.get(k).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);

        Self {
            photo_id: photo_id.to_string(),
            chat_id: get_i64(field::CHAT_ID),
            photo_url: get(field::PHOTO_URL),
            caption: get(field::CAPTION),
            final_caption: get(field::FINAL_CAPTION),
            caption_ru: get(field::CAPTION_RU),
            hashtag: get(field::HASHTAG),
            hashtag_ru: get(field::HASHTAG_RU),
            styled_url: get(field::STYLED_URL),
            publish: get_bool(field::PUBLISH),
            published: get_bool(field::PUBLISHED),
            published_url: get(field::PUBLISHED_URL),
            nsfw: get_bool(field::NSFW),
            nsfw_checked: get_bool(field::NSFW_CHECKED),
        }
    }

    /// Flatten into the store's raw field map representation.
    pub fn to_field_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(field::PHOTO_ID.to_string(), self.photo_id.clone());
        map.insert(field::CHAT_ID.to_string(), self.chat_id.to_string());
        map.insert(field::PHOTO_URL.to_string(), self.photo_url.clone());
        map.insert(field::CAPTION.to_string(), self.caption.clone());
        map.insert(field::FINAL_CAPTION.to_string(), self.final_caption.clone());
        map.insert(field::CAPTION_RU.to_string(), self.caption_ru.clone());
        map.insert(field::HASHTAG.to_string(), self.hashtag.clone());
        map.insert(field::HASHTAG_RU.to_string(), self.hashtag_ru.clone());
        map.insert(field::STYLED_URL.to_string(), self.styled_url.clone());
        map.insert(field::PUBLISH.to_string(), self.publish.to_string());
        map.insert(field::PUBLISHED.to_string(), self.published.to_string());
        map.insert(
            field::PUBLISHED_URL.to_string(),
            self.published_url.clone(),
        );
        map.insert(field::NSFW.to_string(), self.nsfw.to_string());
        map.insert(
            field::NSFW_CHECKED.to_string(),
            self.nsfw_checked.to_string(),
        );
        map
    }

    /// Read a single field's current value in its store representation.
    fn get_raw(&self, name: &str) -> FieldValue {
        match name {
            field::CAPTION => FieldValue::Text(self.caption.clone()),
            field::FINAL_CAPTION => FieldValue::Text(self.final_caption.clone()),
            field::CAPTION_RU => FieldValue::Text(self.caption_ru.clone()),
            field::HASHTAG => FieldValue::Text(self.hashtag.clone()),
            field::HASHTAG_RU => FieldValue::Text(self.hashtag_ru.clone()),
            field::STYLED_URL => FieldValue::Text(self.styled_url.clone()),
            field::PUBLISHED_URL => FieldValue::Text(self.published_url.clone()),
            field::PUBLISH => FieldValue::Flag(self.publish),
            field::PUBLISHED => FieldValue::Flag(self.published),
            field::NSFW => FieldValue::Flag(self.nsfw),
            field::NSFW_CHECKED => FieldValue::Flag(self.nsfw_checked),
            other => panic!("unknown or immutable field: {other}"),
        }
    }

    /// Apply one field write, enforcing I1: a non-empty/true value is never
    /// replaced, whatever the incoming value is. Returns whether the record
    /// actually changed.
    ///
    /// This is the single implementation of monotonicity shared by the real
    /// store (applied to persisted state) and the worker runtime (applied to
    /// the in-memory snapshot it re-publishes).
    pub fn apply_field(&mut self, name: &str, value: FieldValue) -> bool {
        if !self.get_raw(name).is_empty() {
            return false;
        }
        if value.is_empty() {
            return false;
        }

        match (name, value) {
            (field::CAPTION, FieldValue::Text(v)) => self.caption = v,
            (field::FINAL_CAPTION, FieldValue::Text(v)) => self.final_caption = v,
            (field::CAPTION_RU, FieldValue::Text(v)) => self.caption_ru = v,
            (field::HASHTAG, FieldValue::Text(v)) => self.hashtag = v,
            (field::HASHTAG_RU, FieldValue::Text(v)) => self.hashtag_ru = v,
            (field::STYLED_URL, FieldValue::Text(v)) => self.styled_url = v,
            (field::PUBLISHED_URL, FieldValue::Text(v)) => self.published_url = v,
            (field::PUBLISH, FieldValue::Flag(v)) => self.publish = v,
            (field::PUBLISHED, FieldValue::Flag(v)) => self.published = v,
            (field::NSFW, FieldValue::Flag(v)) => self.nsfw = v,
            (field::NSFW_CHECKED, FieldValue::Flag(v)) => self.nsfw_checked = v,
            (other, _) => panic!("unknown or immutable field: {other}"),
        }
        true
    }

    /// Apply every field in a [`FieldUpdate`], in order, monotonically.
    /// Returns whether any field actually changed.
    pub fn apply_update(&mut self, update: &FieldUpdate) -> bool {
        let mut changed = false;
        for (name, value) in &update.fields {
            if self.apply_field(name, value.clone()) {
                changed = true;
            }
        }
        changed
    }

    /// The orchestrator's readiness predicate (spec.md §4.9b), minus the
    /// quota check which depends on external state the record doesn't hold.
    pub fn enrichment_complete(&self) -> bool {
        !self.hashtag.is_empty()
            && !self.caption.is_empty()
            && self.nsfw_checked
            && !self.nsfw
            && !self.styled_url.is_empty()
            && !self.publish
            && !self.published
    }

    /// Compose `final_caption` per the compose law (P6).
    pub fn compose_final_caption(&self) -> String {
        format!("{}{}{}", self.caption, CAPTION_SEPARATOR, self.hashtag)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// P1: whatever order a field's candidate values arrive in, the
        /// first non-empty one wins and nothing after it can change the
        /// record.
        #[test]
        fn monotone_field_converges_regardless_of_arrival_order(
            values in prop::collection::vec("[a-z]{0,6}", 1..8)
        ) {
            let mut r = PhotoRecord::new("p1", 1, "http://x/a.jpg");
            let expected = values.iter().find(|v| !v.is_empty()).cloned();

            for v in &values {
                r.apply_field(field::CAPTION, FieldValue::Text(v.clone()));
            }

            prop_assert_eq!(r.caption, expected.unwrap_or_default());
        }
    }

    #[test]
    fn monotone_text_field_never_reverts() {
        let mut r = PhotoRecord::new("p1", 1, "http://x/a.jpg");
        assert!(r.apply_field(field::CAPTION, FieldValue::Text("a cat".into())));
        assert!(!r.apply_field(field::CAPTION, FieldValue::Text("a dog".into())));
        assert_eq!(r.caption, "a cat");
    }

    #[test]
    fn monotone_bool_field_never_reverts() {
        let mut r = PhotoRecord::new("p1", 1, "http://x/a.jpg");
        assert!(r.apply_field(field::NSFW_CHECKED, FieldValue::Flag(true)));
        assert!(!r.apply_field(field::NSFW_CHECKED, FieldValue::Flag(false)));
        assert!(r.nsfw_checked);
    }

    #[test]
    fn empty_value_is_a_no_op() {
        let mut r = PhotoRecord::new("p1", 1, "http://x/a.jpg");
        assert!(!r.apply_field(field::CAPTION, FieldValue::Text(String::new())));
        assert_eq!(r.caption, "");
    }

    #[test]
    fn field_map_round_trip() {
        let mut r = PhotoRecord::new("p1", 42, "http://x/a.jpg");
        r.apply_field(field::CAPTION, FieldValue::Text("a cat".into()));
        r.apply_field(field::NSFW_CHECKED, FieldValue::Flag(true));

        let map = r.to_field_map();
        let r2 = PhotoRecord::from_field_map("p1", &map);
        assert_eq!(r, r2);
    }

    #[test]
    fn compose_law_matches_invariant_i4() {
        let mut r = PhotoRecord::new("p1", 1, "http://x/a.jpg");
        r.apply_field(field::CAPTION, FieldValue::Text("a cat".into()));
        r.apply_field(
            field::HASHTAG,
            FieldValue::Text("#cat #animal ".into()),
        );
        assert_eq!(r.compose_final_caption(), "a cat\n.\n.\n.\n#cat #animal ");
    }

    #[test]
    fn canonical_json_field_order() {
        let r = PhotoRecord::new("p1", 1, "http://x/a.jpg");
        let json = serde_json::to_string(&r).expect("serializes");
        let mut last_idx = 0;
        for name in field::ALL {
            let idx = json.find(&format!("\"{name}\"")).unwrap_or_else(|| {
                panic!("field {name} missing from canonical JSON: {json}")
            });
            assert!(idx >= last_idx, "field {name} out of canonical order");
            last_idx = idx;
        }
    }
}
