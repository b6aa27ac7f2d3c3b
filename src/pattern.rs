//! Servlet-style URL patterns and specificity-ordered mapping tables.
//!
//! Four pattern forms are supported, listed from most to least specific:
//!
//! | Form | Example | Matches |
//! |---|---|---|
//! | exact | `/hello` | only `/hello` |
//! | extension | `*.do` | any path ending in `.do` |
//! | path prefix | `/api/*` | `/api` and everything below it |
//! | default | `/` | everything |
//!
//! Within one tier the longer pattern string wins. A [`MappingTable`] keeps
//! its entries sorted by that order, so resolution is "first match wins" and
//! never depends on the order entries were inserted in.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// Specificity tier of a pattern. Declaration order is precedence order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Tier {
    Exact,
    Extension,
    Prefix,
    Default,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Matcher {
    Exact,
    /// Extension including the leading dot, e.g. `.do`.
    Extension(String),
    /// Base path without the trailing `/*`; empty for `/*`.
    Prefix(String),
    Default,
}

/// A compiled URL pattern.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UrlPattern {
    raw: String,
    tier: Tier,
    matcher: Matcher,
}

impl UrlPattern {
    /// Compiles `pattern`.
    ///
    /// Fails with [`Error::InvalidPattern`] for anything that is not one of
    /// the four supported forms (empty strings, relative paths, stray `*`).
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidPattern { pattern: pattern.to_owned(), reason };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let (tier, matcher) = if pattern == "/" {
            (Tier::Default, Matcher::Default)
        } else if let Some(ext) = pattern.strip_prefix("*.") {
            if ext.is_empty() || ext.contains(['/', '*']) {
                return Err(invalid("extension patterns look like `*.ext`"));
            }
            (Tier::Extension, Matcher::Extension(format!(".{ext}")))
        } else if !pattern.starts_with('/') {
            return Err(invalid("patterns start with `/` or `*.`"));
        } else if let Some(base) = pattern.strip_suffix("/*") {
            if base.contains('*') {
                return Err(invalid("`*` is only allowed as the final path segment"));
            }
            (Tier::Prefix, Matcher::Prefix(base.to_owned()))
        } else if pattern.contains('*') {
            return Err(invalid("`*` is only allowed as `/*` suffix or `*.` prefix"));
        } else {
            (Tier::Exact, Matcher::Exact)
        };

        Ok(Self { raw: pattern.to_owned(), tier, matcher })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Whether `path` (already stripped of the mount path) matches.
    pub fn matches(&self, path: &str) -> bool {
        match &self.matcher {
            Matcher::Exact => path == self.raw,
            Matcher::Extension(ext) => path.len() > ext.len() && path.ends_with(ext.as_str()),
            Matcher::Prefix(base) => {
                path == base
                    || path
                        .strip_prefix(base.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            Matcher::Default => path.starts_with('/'),
        }
    }

    /// Precedence order: lower sorts first and wins.
    pub fn specificity_cmp(&self, other: &Self) -> Ordering {
        self.tier
            .cmp(&other.tier)
            .then_with(|| other.raw.len().cmp(&self.raw.len()))
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One row of a [`MappingTable`].
#[derive(Clone, Debug)]
pub struct Mapping<T> {
    pub pattern: UrlPattern,
    /// Name of the owning registration; the final tie-break.
    pub owner: String,
    pub target: T,
}

/// URL mappings kept in precedence order.
#[derive(Clone, Debug)]
pub struct MappingTable<T> {
    entries: Vec<Mapping<T>>,
}

impl<T> MappingTable<T> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn insert(&mut self, pattern: UrlPattern, owner: impl Into<String>, target: T) {
        let mapping = Mapping { pattern, owner: owner.into(), target };
        let at = self
            .entries
            .partition_point(|m| compare(m, &mapping) != Ordering::Greater);
        self.entries.insert(at, mapping);
    }

    /// The most specific mapping matching `path`.
    pub fn resolve(&self, path: &str) -> Option<&Mapping<T>> {
        self.entries.iter().find(|m| m.pattern.matches(path))
    }

    /// Every mapping matching `path`, most specific first.
    pub fn matching<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a Mapping<T>> + 'a {
        self.entries.iter().filter(move |m| m.pattern.matches(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping<T>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for MappingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn compare<T>(a: &Mapping<T>, b: &Mapping<T>) -> Ordering {
    a.pattern
        .specificity_cmp(&b.pattern)
        .then_with(|| a.owner.cmp(&b.owner))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> UrlPattern {
        UrlPattern::parse(s).unwrap()
    }

    #[test]
    fn classifies_tiers() {
        assert_eq!(p("/hello").tier(), Tier::Exact);
        assert_eq!(p("*.do").tier(), Tier::Extension);
        assert_eq!(p("/api/*").tier(), Tier::Prefix);
        assert_eq!(p("/*").tier(), Tier::Prefix);
        assert_eq!(p("/").tier(), Tier::Default);
    }

    #[test]
    fn rejects_malformed_patterns() {
        for bad in ["", "hello", "*.", "*.a/b", "/a/*/b", "/a*", "**"] {
            assert!(
                matches!(UrlPattern::parse(bad), Err(Error::InvalidPattern { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn prefix_matches_base_and_descendants_only() {
        let pat = p("/api/*");
        assert!(pat.matches("/api"));
        assert!(pat.matches("/api/"));
        assert!(pat.matches("/api/users/1"));
        assert!(!pat.matches("/apis"));
        assert!(!pat.matches("/other"));
    }

    #[test]
    fn root_prefix_matches_everything() {
        let pat = p("/*");
        assert!(pat.matches("/"));
        assert!(pat.matches("/anything/at/all"));
    }

    #[test]
    fn extension_requires_a_stem() {
        let pat = p("*.do");
        assert!(pat.matches("/test/a.do"));
        assert!(pat.matches("/test/.do"));
        assert!(!pat.matches(".do"));
        assert!(!pat.matches("/test/a.dot"));
    }

    #[test]
    fn exact_is_literal() {
        let pat = p("/a.b");
        assert!(pat.matches("/a.b"));
        assert!(!pat.matches("/aXb"));
    }

    #[test]
    fn longer_prefix_wins_within_tier() {
        let mut table = MappingTable::new();
        table.insert(p("/a/*"), "short", 1);
        table.insert(p("/a/b/*"), "long", 2);
        assert_eq!(table.resolve("/a/b/c").map(|m| m.target), Some(2));
        assert_eq!(table.resolve("/a/x").map(|m| m.target), Some(1));
    }

    #[test]
    fn identical_patterns_break_ties_by_owner() {
        let mut forward = MappingTable::new();
        forward.insert(p("/x"), "beta", "beta");
        forward.insert(p("/x"), "alpha", "alpha");
        let mut backward = MappingTable::new();
        backward.insert(p("/x"), "alpha", "alpha");
        backward.insert(p("/x"), "beta", "beta");
        assert_eq!(forward.resolve("/x").map(|m| m.target), Some("alpha"));
        assert_eq!(backward.resolve("/x").map(|m| m.target), Some("alpha"));
        assert_eq!(forward.len(), 2);
    }
}
