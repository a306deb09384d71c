//! Hierarchical key paths
//!
//! A key path addresses a node in the data tree, e.g. `/interfaces/eth0/mtu`.
//! Queries and registrations may use `*` segments to cover every child at
//! that level. Matching, intersection and truncation are the only operations
//! the member engine needs; richer key-spec handling lives outside this crate.

use crate::KeyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One level of a key path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    /// A concrete child name
    Name(String),
    /// Matches any child at this level
    Wildcard,
}

impl Segment {
    /// Build a concrete segment
    pub fn name(name: impl Into<String>) -> Self {
        Segment::Name(name.into())
    }

    /// Concrete name, if any
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Segment::Name(name) => Some(name),
            Segment::Wildcard => None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Segment::Wildcard)
    }

    /// Two segments are compatible when either is a wildcard or the names agree
    pub fn matches(&self, other: &Segment) -> bool {
        match (self, other) {
            (Segment::Wildcard, _) | (_, Segment::Wildcard) => true,
            (Segment::Name(a), Segment::Name(b)) => a == b,
        }
    }

    /// The more specific of two compatible segments
    fn narrowest(&self, other: &Segment) -> Option<Segment> {
        match (self, other) {
            (Segment::Wildcard, s) | (s, Segment::Wildcard) => Some(s.clone()),
            (Segment::Name(a), Segment::Name(b)) if a == b => Some(self.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Name(name) => f.write_str(name),
            Segment::Wildcard => f.write_str("*"),
        }
    }
}

/// Absolute path in the key space
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyPath {
    segments: Vec<Segment>,
}

impl KeyPath {
    /// The root of the key space (`/`)
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Parse a path such as `/a/b/*`
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| KeyError::NotAbsolute(s.to_string()))?;
        if rest.is_empty() {
            return Ok(Self::root());
        }

        let mut segments = Vec::new();
        for part in rest.split('/') {
            match part {
                "" => return Err(KeyError::EmptySegment(s.to_string())),
                "*" => segments.push(Segment::Wildcard),
                name => segments.push(Segment::Name(name.to_string())),
            }
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of segments below the root
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// True when no segment is a wildcard
    pub fn is_concrete(&self) -> bool {
        self.segments.iter().all(|s| !s.is_wildcard())
    }

    /// New path with `segment` appended
    pub fn child(&self, segment: Segment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }

    /// Append a segment in place
    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    /// The last segment, if any
    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// Parent path (root has none)
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            None
        } else {
            Some(self.truncated(self.depth() - 1))
        }
    }

    /// Keep at most the first `depth` segments
    pub fn truncated(&self, depth: usize) -> Self {
        Self {
            segments: self.segments.iter().take(depth).cloned().collect(),
        }
    }

    /// Segments from `depth` onwards
    pub fn suffix(&self, depth: usize) -> &[Segment] {
        self.segments.get(depth..).unwrap_or(&[])
    }

    /// True when every segment of the shared prefix is compatible
    pub fn overlaps(&self, other: &KeyPath) -> bool {
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| a.matches(b))
    }

    /// True when `pattern` covers this path's first `pattern.depth()` segments
    pub fn has_prefix(&self, pattern: &KeyPath) -> bool {
        pattern.depth() <= self.depth() && self.overlaps(pattern)
    }

    /// Exact (wildcard-sensitive) prefix test
    pub fn starts_with(&self, prefix: &KeyPath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Strictly longer and starting with `base`
    pub fn is_strict_extension_of(&self, base: &KeyPath) -> bool {
        self.depth() > base.depth() && self.starts_with(base)
    }

    /// Narrowest path covered by both, extended by whichever is longer
    ///
    /// Returns `None` when the paths do not overlap.
    pub fn intersect(&self, other: &KeyPath) -> Option<KeyPath> {
        let (longer, shorter) = if self.depth() >= other.depth() {
            (self, other)
        } else {
            (other, self)
        };

        let mut segments = Vec::with_capacity(longer.depth());
        for (a, b) in longer.segments.iter().zip(shorter.segments.iter()) {
            segments.push(a.narrowest(b)?);
        }
        segments.extend(longer.suffix(shorter.depth()).iter().cloned());
        Some(Self { segments })
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for KeyPath {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for KeyPath {
    type Error = KeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<KeyPath> for String {
    fn from(key: KeyPath) -> Self {
        key.to_string()
    }
}
