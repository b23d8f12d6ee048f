//! Message-id → templated string lookup for the orchestrator's chat replies
//! (spec.md §6 "Translations", §9 "Translation layer").
//!
//! Two bundles are loaded at startup, `en-us.all.json` and `ru-ru.all.json`,
//! each a flat `{message_id: template}` map with `{arg_name}` placeholders.
//! Resolution is a pure function `(locale, id, args) -> string`, as spec.md
//! §9 prescribes; an unknown id is logged and the id itself is returned
//! (spec.md §6).

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use snafu::{Location, ResultExt, Snafu};
use tracing::warn;

pub const LOG_TARGET: &str = "pixelflow::translations";

const EMBEDDED_EN: &str = include_str!("../../../translations/en-us.all.json");
const EMBEDDED_RU: &str = include_str!("../../../translations/ru-ru.all.json");

#[derive(Debug, Snafu)]
pub enum TranslationError {
    #[snafu(display("Failed to read translation bundle {path}: {source}"))]
    Read {
        path: String,
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Failed to parse translation bundle {path}: {source}"))]
    Parse {
        path: String,
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type TranslationResult<T> = std::result::Result<T, TranslationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locale {
    En,
    Ru,
}

impl Locale {
    pub fn as_str(self) -> &'static str {
        match self {
            Locale::En => "en",
            Locale::Ru => "ru",
        }
    }

    fn bundle_key(self) -> &'static str {
        match self {
            Locale::En => "en-us",
            Locale::Ru => "ru-ru",
        }
    }

    pub fn parse(s: &str) -> Option<Locale> {
        match s {
            "en" => Some(Locale::En),
            "ru" => Some(Locale::Ru),
            _ => None,
        }
    }
}

impl Default for Locale {
    fn default() -> Self {
        Locale::En
    }
}

#[derive(Deserialize)]
struct Bundle(HashMap<String, String>);

pub struct Catalog {
    bundles: HashMap<&'static str, HashMap<String, String>>,
}

fn parse_bundle(path: &str, raw: &str) -> TranslationResult<HashMap<String, String>> {
    let Bundle(map) = serde_json::from_str(raw).context(ParseSnafu {
        path: path.to_string(),
    })?;
    Ok(map)
}

impl Catalog {
    /// Load both bundles from a directory (spec.md §6: `en-us.all.json`,
    /// `ru-ru.all.json`).
    pub fn load_from_dir(dir: &Path) -> TranslationResult<Self> {
        let mut bundles = HashMap::new();
        for (key, filename) in [("en-us", "en-us.all.json"), ("ru-ru", "ru-ru.all.json")] {
            let path = dir.join(filename);
            let raw = std::fs::read_to_string(&path).context(ReadSnafu {
                path: path.display().to_string(),
            })?;
            bundles.insert(key, parse_bundle(&path.display().to_string(), &raw)?);
        }
        Ok(Self { bundles })
    }

    /// The bundles shipped with this repository, compiled in. Used when no
    /// override directory is configured and in tests.
    pub fn embedded() -> Self {
        let mut bundles = HashMap::new();
        bundles.insert(
            "en-us",
            parse_bundle("<embedded en-us.all.json>", EMBEDDED_EN)
                .expect("embedded bundle is valid JSON"),
        );
        bundles.insert(
            "ru-ru",
            parse_bundle("<embedded ru-ru.all.json>", EMBEDDED_RU)
                .expect("embedded bundle is valid JSON"),
        );
        Self { bundles }
    }

    /// Resolve a message id to a templated string, substituting `{name}`
    /// placeholders from `args`. Unknown ids log at WARN and return the id
    /// itself as a fallback (spec.md §6).
    pub fn t(&self, locale: Locale, id: &str, args: &[(&str, &str)]) -> String {
        let Some(template) = self
            .bundles
            .get(locale.bundle_key())
            .and_then(|b| b.get(id))
        else {
            warn!(target: LOG_TARGET, locale = locale.as_str(), id, "unknown message id, falling back to id");
            return id.to_string();
        };

        let mut rendered = template.clone();
        for (name, value) in args {
            rendered = rendered.replace(&format!("{{{name}}}"), value);
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_id_with_args() {
        let catalog = Catalog::embedded();
        let out = catalog.t(Locale::En, "greeting", &[("person", "Ada")]);
        assert!(out.contains("Ada"));
    }

    #[test]
    fn unknown_id_falls_back_to_itself() {
        let catalog = Catalog::embedded();
        let out = catalog.t(Locale::En, "no_such_message", &[]);
        assert_eq!(out, "no_such_message");
    }

    #[test]
    fn both_locales_cover_the_same_ids() {
        let catalog = Catalog::embedded();
        let en = &catalog.bundles["en-us"];
        let ru = &catalog.bundles["ru-ru"];
        let mut en_ids: Vec<_> = en.keys().collect();
        let mut ru_ids: Vec<_> = ru.keys().collect();
        en_ids.sort();
        ru_ids.sort();
        assert_eq!(en_ids, ru_ids);
    }

    #[test]
    fn load_from_dir_matches_embedded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("en-us.all.json"), EMBEDDED_EN).unwrap();
        std::fs::write(dir.path().join("ru-ru.all.json"), EMBEDDED_RU).unwrap();

        let catalog = Catalog::load_from_dir(dir.path()).unwrap();
        let out = catalog.t(Locale::Ru, "nsfw_detected", &[]);
        assert!(!out.is_empty());
    }
}
