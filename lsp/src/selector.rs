//! Document selectors and match scoring.
//!
//! A filter scores 10 for an exact language match, plus 5 for a matching
//! scheme and 5 for a matching glob pattern. A filter that names a field the
//! document does not satisfy scores 0. A selector scores the best of its
//! filters. Wildcard languages and schemes match with the lowest weight.

use globset::{GlobBuilder, GlobMatcher};
use serde::Deserialize;

use crate::protocol;
use crate::types::TextDocument;

const LANGUAGE_SCORE: u32 = 10;
const SCHEME_SCORE: u32 = 5;
const PATTERN_SCORE: u32 = 5;
const WILDCARD_LANGUAGE_SCORE: u32 = 2;
const WILDCARD_SCHEME_SCORE: u32 = 1;

/// Score given to documents matched by an absent or empty selector.
pub const MATCH_ALL_SCORE: u32 = 1;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFilter {
    Language(String),
    Filter {
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        scheme: Option<String>,
        #[serde(default)]
        pattern: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct Pattern {
    source: String,
    matcher: Option<GlobMatcher>,
}

impl Pattern {
    fn new(source: String) -> Self {
        let matcher = match GlobBuilder::new(&source).literal_separator(true).build() {
            Ok(glob) => Some(glob.compile_matcher()),
            Err(e) => {
                tracing::warn!(pattern = %source, "invalid document selector pattern: {e}");
                None
            }
        };
        Self { source, matcher }
    }

    fn is_match(&self, path: &str) -> bool {
        self.matcher.as_ref().is_some_and(|m| m.is_match(path))
    }
}

/// One entry of a [`DocumentSelector`].
///
/// Deserializes from `{ language, scheme, pattern }` or from a bare language
/// string.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "RawFilter")]
pub struct DocumentFilter {
    language: Option<String>,
    scheme: Option<String>,
    pattern: Option<Pattern>,
}

impl From<RawFilter> for DocumentFilter {
    fn from(raw: RawFilter) -> Self {
        match raw {
            RawFilter::Language(language) => Self::default().with_language(language),
            RawFilter::Filter {
                language,
                scheme,
                pattern,
            } => Self {
                language,
                scheme,
                pattern: pattern.map(Pattern::new),
            },
        }
    }
}

impl DocumentFilter {
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(Pattern::new(pattern.into()));
        self
    }

    #[must_use]
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    #[must_use]
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_ref().map(|p| p.source.as_str())
    }

    #[must_use]
    pub fn score(&self, document: &TextDocument) -> u32 {
        let location = DocumentLocation::of(document);
        self.score_location(document.language_id(), &location)
    }

    fn score_location(&self, language_id: &str, location: &DocumentLocation) -> u32 {
        let mut score = 0;

        if let Some(language) = &self.language {
            if language == "*" {
                score += WILDCARD_LANGUAGE_SCORE;
            } else if language == language_id {
                score += LANGUAGE_SCORE;
            } else {
                return 0;
            }
        }

        if let Some(scheme) = &self.scheme {
            if scheme == "*" {
                score += WILDCARD_SCHEME_SCORE;
            } else if *scheme == location.scheme {
                score += SCHEME_SCORE;
            } else {
                return 0;
            }
        }

        if let Some(pattern) = &self.pattern {
            if pattern.is_match(&location.path) {
                score += PATTERN_SCORE;
            } else {
                return 0;
            }
        }

        score
    }
}

/// Scheme and filesystem-style path of a document URI.
struct DocumentLocation {
    scheme: String,
    path: String,
}

impl DocumentLocation {
    fn of(document: &TextDocument) -> Self {
        let uri = document.uri();
        if let Some(path) = protocol::file_uri_to_path(uri) {
            return Self {
                scheme: "file".to_string(),
                path: path.to_string_lossy().replace('\\', "/"),
            };
        }
        match url::Url::parse(uri) {
            Ok(url) => Self {
                scheme: url.scheme().to_string(),
                path: url.path().to_string(),
            },
            Err(_) => Self {
                scheme: String::new(),
                path: uri.to_string(),
            },
        }
    }
}

/// An ordered set of [`DocumentFilter`]s.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct DocumentSelector(Vec<DocumentFilter>);

impl DocumentSelector {
    #[must_use]
    pub fn new(filters: Vec<DocumentFilter>) -> Self {
        Self(filters)
    }

    #[must_use]
    pub fn filters(&self) -> &[DocumentFilter] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Best score across filters; 0 means no match.
    #[must_use]
    pub fn score(&self, document: &TextDocument) -> u32 {
        let location = DocumentLocation::of(document);
        self.0
            .iter()
            .map(|f| f.score_location(document.language_id(), &location))
            .max()
            .unwrap_or(0)
    }

    /// Parse the `documentSelector` member of registration options.
    ///
    /// `Ok(None)` when absent or null.
    pub(crate) fn from_options(options: &serde_json::Value) -> serde_json::Result<Option<Self>> {
        match options.get("documentSelector") {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some),
        }
    }
}

/// Score a document against an optional selector.
///
/// An absent or empty selector matches every document with
/// [`MATCH_ALL_SCORE`].
#[must_use]
pub fn score(selector: Option<&DocumentSelector>, document: &TextDocument) -> u32 {
    match selector {
        None => MATCH_ALL_SCORE,
        Some(selector) if selector.is_empty() => MATCH_ALL_SCORE,
        Some(selector) => selector.score(document),
    }
}

#[must_use]
pub fn matches(selector: Option<&DocumentSelector>, document: &TextDocument) -> bool {
    score(selector, document) > 0
}
