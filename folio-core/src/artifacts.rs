//! Detection of extraction leftovers in chunk text.
//!
//! Cleaned chunks should not contain the PDF's running headers
//! (`12 Julius Caesar ACT 3. SC. 1`) or act/scene markers. Those belong in the
//! chunk metadata. `folio check` uses this to flag dirty data.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Kind of leftover found in a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Page number followed by the running title, e.g. `12 Julius Caesar ACT`.
    PageHeader,
    /// Act/scene marker, e.g. `ACT 3. SC. 1`.
    ActSceneMarker,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::PageHeader => write!(f, "page header"),
            ArtifactKind::ActSceneMarker => write!(f, "act/scene marker"),
        }
    }
}

/// A leftover found in a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactMatch {
    pub kind: ArtifactKind,
    /// The matched text.
    pub matched: String,
    /// Byte offset into the chunk.
    pub offset: usize,
}

static PATTERNS: LazyLock<Vec<(Regex, ArtifactKind)>> = LazyLock::new(|| {
    [
        (r"\d+\s+Julius\s+Caesar\s+ACT", ArtifactKind::PageHeader),
        (r"ACT\s+\d+\.\s+SC\.\s+\d+", ArtifactKind::ActSceneMarker),
    ]
    .into_iter()
    .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, kind)))
    .collect()
});

/// First leftover in `text`, if any. Page headers are checked first.
pub fn find_marker(text: &str) -> Option<ArtifactMatch> {
    PATTERNS.iter().find_map(|(re, kind)| {
        re.find(text).map(|m| ArtifactMatch {
            kind: *kind,
            matched: m.as_str().to_string(),
            offset: m.start(),
        })
    })
}

/// Whether `text` is free of leftovers.
pub fn is_clean(text: &str) -> bool {
    find_marker(text).is_none()
}
