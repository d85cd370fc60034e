//! Normalized node paths
//!
//! A `ParsedPath` is the dedup key for upstream requests: two raw paths that
//! name the same node (`/downstream//a/`, `/downstream/a`) parse to equal,
//! equally-hashed keys.

use std::fmt;
use std::hash::{Hash, Hasher};

/// A node path split into the link it belongs to and the path inside it
#[derive(Debug, Clone)]
pub struct ParsedPath {
    /// Normalized full path (`/downstream/link/a/b`)
    full: String,
    /// Path forwarded upstream (`/a/b`), or the full path for local nodes
    base: String,
    /// Downstream link owning the path, `None` for the broker's own tree
    link: Option<String>,
    /// Non-empty segments of the full path
    segments: Vec<String>,
}

impl ParsedPath {
    /// Parse `raw` relative to the broker's downstream node `downstream`
    pub fn parse(downstream: &str, raw: &str) -> Self {
        let segments: Vec<String> = raw
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let full = join(&segments);

        let (link, base) = match segments.as_slice() {
            [first, link, rest @ ..] if first == downstream => (Some(link.clone()), join(rest)),
            _ => (None, full.clone()),
        };

        Self {
            full,
            base,
            link,
            segments,
        }
    }

    pub fn full(&self) -> &str {
        &self.full
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    /// True when the path targets a downstream link rather than the broker
    pub fn is_remote(&self) -> bool {
        self.link.is_some()
    }

    /// True for the root node of a downstream link
    pub fn is_link_root(&self) -> bool {
        self.is_remote() && self.base == "/"
    }

    /// Segments of the full path, for tree descent
    pub fn split(&self) -> &[String] {
        &self.segments
    }
}

fn join(segments: &[String]) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

impl PartialEq for ParsedPath {
    fn eq(&self, other: &Self) -> bool {
        self.full == other.full
    }
}

impl Eq for ParsedPath {}

impl Hash for ParsedPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full.hash(state);
    }
}

impl fmt::Display for ParsedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}
