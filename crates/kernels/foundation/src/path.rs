//! Hierarchical paths into the state tree.
//!
//! A path is a sequence of segments read from some reference node. A segment
//! is either a child key or a parent marker (`..`), which lets units address
//! siblings and ancestors without knowing where they are grafted.
//!
//! The text form separates segments with `/`:
//!
//! ```
//! use terrarium_foundation::Path;
//!
//! let radius = Path::parse("../../structure/radius");
//! assert_eq!(radius.len(), 4);
//! assert_eq!(radius.to_string(), "../../structure/radius");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Text form of [`Segment::Parent`].
pub const PARENT_MARKER: &str = "..";

/// One step of a [`Path`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// Descend into the named child.
    Key(String),
    /// Ascend to the parent.
    Parent,
}

impl Segment {
    /// The child key, if this is not a parent marker.
    pub fn as_key(&self) -> Option<&str> {
        match self {
            Segment::Key(key) => Some(key),
            Segment::Parent => None,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => f.write_str(key),
            Segment::Parent => f.write_str(PARENT_MARKER),
        }
    }
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        if s == PARENT_MARKER {
            Segment::Parent
        } else {
            Segment::Key(s.to_string())
        }
    }
}

/// A hierarchical path made of keys and parent markers.
///
/// The empty path addresses the reference node itself (the root, for
/// absolute lookups).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<Segment>,
}

impl Path {
    /// The empty path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Creates a path from segments.
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Parses the `/`-separated text form. Empty and `.` segments are skipped.
    pub fn parse(s: &str) -> Self {
        Self {
            segments: s
                .split('/')
                .filter(|part| !part.is_empty() && *part != ".")
                .map(Segment::from)
                .collect(),
        }
    }

    /// Get the path segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Get the number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Check if the path is empty.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Get the first segment.
    pub fn first(&self) -> Option<&Segment> {
        self.segments.first()
    }

    /// Get the last segment.
    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// The final key, if the path ends in one.
    pub fn last_key(&self) -> Option<&str> {
        self.segments.last().and_then(Segment::as_key)
    }

    /// Whether any segment is a parent marker.
    pub fn has_parent_marker(&self) -> bool {
        self.segments.contains(&Segment::Parent)
    }

    /// Keys of a path without parent markers, or `None` if it has any.
    pub fn keys(&self) -> Option<Vec<&str>> {
        self.segments.iter().map(Segment::as_key).collect()
    }

    /// Append a key to create a new path.
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment::Key(key.into()));
        Self { segments }
    }

    /// Concatenate `other` after this path.
    pub fn join(&self, other: &Path) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// The path without its last segment, or `None` for the empty path.
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.segments.split_last()?;
        Some(Self::new(rest.to_vec()))
    }

    /// Check if this path starts with another path.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Cancel every parent marker against the key preceding it.
    ///
    /// Markers with nothing left to cancel stay at the front, so
    /// `a/../../b` normalizes to `../b`.
    pub fn normalize(&self) -> Self {
        let mut out: Vec<Segment> = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Parent if matches!(out.last(), Some(Segment::Key(_))) => {
                    out.pop();
                }
                other => out.push(other.clone()),
            }
        }
        Self { segments: out }
    }

    /// Express this path relative to `base`, both read from the same origin.
    ///
    /// ```
    /// use terrarium_foundation::Path;
    ///
    /// let target = Path::parse("cell/structure/radius");
    /// let base = Path::parse("cell/processes");
    /// assert_eq!(target.relative_to(&base), Path::parse("../structure/radius"));
    /// ```
    pub fn relative_to(&self, base: &Path) -> Self {
        let target = self.normalize();
        let base = base.normalize();
        let common = target
            .segments
            .iter()
            .zip(base.segments.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let mut segments = vec![Segment::Parent; base.segments.len() - common];
        segments.extend(target.segments[common..].iter().cloned());
        Self { segments }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for Path {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<&Path> for Path {
    fn from(p: &Path) -> Self {
        p.clone()
    }
}

/// Each element is one segment; elements are not split on `/`.
impl<const N: usize> From<[&str; N]> for Path {
    fn from(parts: [&str; N]) -> Self {
        Self::new(parts.into_iter().map(Segment::from).collect())
    }
}

impl From<Vec<Segment>> for Path {
    fn from(segments: Vec<Segment>) -> Self {
        Self::new(segments)
    }
}

impl PartialEq<&str> for Path {
    fn eq(&self, other: &&str) -> bool {
        *self == Path::parse(other)
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Path::parse(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_recognizes_parent_markers() {
        let path = Path::parse("../../structure/radius");
        assert_eq!(
            path.segments(),
            &[
                Segment::Parent,
                Segment::Parent,
                Segment::Key("structure".into()),
                Segment::Key("radius".into()),
            ]
        );
        assert!(path.has_parent_marker());
        assert_eq!(path.keys(), None);
    }

    #[test]
    fn parse_skips_empty_segments() {
        assert_eq!(Path::parse("/a//b/./c/"), Path::from(["a", "b", "c"]));
        assert!(Path::parse("").is_empty());
        assert_eq!(Path::root().to_string(), "/");
    }

    #[test]
    fn normalize_cancels_markers() {
        assert_eq!(Path::parse("a/b/../c").normalize(), Path::parse("a/c"));
        assert_eq!(Path::parse("a/../../b").normalize(), Path::parse("../b"));
        assert_eq!(Path::parse("../x").normalize(), Path::parse("../x"));
    }

    #[test]
    fn relative_to_climbs_out_of_base() {
        let target = Path::parse("agents/1/boundary");
        assert_eq!(
            target.relative_to(&Path::parse("agents/2")),
            Path::parse("../1/boundary")
        );
        assert_eq!(target.relative_to(&Path::root()), target);
        assert_eq!(target.relative_to(&target), Path::root());
    }

    #[test]
    fn join_then_normalize_resolves_relative_wire() {
        let unit_parent = Path::parse("cell/processes");
        let wire = Path::parse("../internal/glucose");
        assert_eq!(
            unit_parent.join(&wire).normalize(),
            Path::parse("cell/internal/glucose")
        );
    }

    #[test]
    fn parent_and_child() {
        let path = Path::parse("a/b");
        assert_eq!(path.parent(), Some(Path::parse("a")));
        assert_eq!(path.child("c"), Path::parse("a/b/c"));
        assert_eq!(Path::root().parent(), None);
        assert_eq!(path.last_key(), Some("b"));
    }

    #[test]
    fn serializes_as_text() {
        let path = Path::parse("../a/b");
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"../a/b\"");
        let back: Path = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }
}
