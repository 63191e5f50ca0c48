//! Slash-delimited paths and the segment order.
//!
//! A [`Path`] addresses a node in the mirrored tree. Leading, trailing and
//! repeated separators are insignificant, so `"/a//b/"` and `"a/b"` parse to
//! the same two-segment path.
//!
//! # Segment order
//!
//! All path comparisons and all child orderings use the same total order
//! over segments:
//!
//! 1. A segment that parses entirely as a base-10 integer within the `i64`
//!    range sorts before any segment that does not. Digit strings too large
//!    for `i64` are ordered as plain text.
//! 2. Two integer segments compare by numeric value, then by text length
//!    (`"1"` < `"01"`), then by text.
//! 3. Two non-integer segments compare lexicographically.
//!
//! Because descendants of a path sort immediately after it and before its
//! next sibling, "find everything under `p`" is a single ordered range scan
//! starting at `p`.

use crate::error::{CoreError, CoreResult};
use crate::ordered::Comparator;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Maximum number of segments in a path.
pub const MAX_PATH_DEPTH: usize = 32;

/// Characters that may not appear in a segment.
const FORBIDDEN_CHARS: &[char] = &['.', '#', '$', '[', ']'];

/// An immutable, normalized path.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// The root path (no segments).
    #[must_use]
    pub const fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Parses slash-delimited text.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PathTooDeep`] for more than [`MAX_PATH_DEPTH`]
    /// segments and [`CoreError::InvalidPath`] for segments containing
    /// forbidden characters.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let segments: Vec<String> = text
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if segments.len() > MAX_PATH_DEPTH {
            return Err(CoreError::PathTooDeep {
                depth: segments.len(),
                max: MAX_PATH_DEPTH,
            });
        }
        for segment in &segments {
            validate_segment(text, segment)?;
        }
        Ok(Self { segments })
    }

    /// Builds a path from individual segments.
    ///
    /// # Errors
    ///
    /// Fails like [`Path::parse`], and also for empty segments or segments
    /// containing `/`.
    pub fn from_segments<I, S>(segments: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path = Self::root();
        for segment in segments {
            path = path.child(segment)?;
        }
        Ok(path)
    }

    /// Returns a new path with one more segment.
    ///
    /// # Errors
    ///
    /// Fails for an empty segment, a segment containing `/` or a forbidden
    /// character, or if the result would exceed [`MAX_PATH_DEPTH`].
    pub fn child(&self, segment: impl Into<String>) -> CoreResult<Self> {
        let segment = segment.into();
        if segment.is_empty() || segment.contains('/') {
            return Err(CoreError::invalid_path(
                segment,
                "segment must be non-empty and contain no '/'",
            ));
        }
        validate_segment(&segment, &segment)?;
        if self.segments.len() >= MAX_PATH_DEPTH {
            return Err(CoreError::PathTooDeep {
                depth: self.segments.len() + 1,
                max: MAX_PATH_DEPTH,
            });
        }
        let mut segments = self.segments.clone();
        segments.push(segment);
        Ok(Self { segments })
    }

    /// Number of segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns true for the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns segment `i`, if present.
    #[must_use]
    pub fn segment(&self, i: usize) -> Option<&str> {
        self.segments.get(i).map(String::as_str)
    }

    /// All segments in order.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The final segment, or `None` for the root.
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            Some(self.prefix(self.segments.len() - 1))
        }
    }

    /// The first `len` segments (clamped to the path length).
    #[must_use]
    pub fn prefix(&self, len: usize) -> Self {
        let len = len.min(self.segments.len());
        Self {
            segments: self.segments[..len].to_vec(),
        }
    }

    /// Strict ancestors, root first.
    pub fn ancestors(&self) -> impl Iterator<Item = Path> + '_ {
        (0..self.segments.len()).map(move |len| self.prefix(len))
    }

    /// Returns true if `self` is `other` or an ancestor of it.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| a == b)
    }

    /// Returns true if `self` is a proper ancestor of `other`.
    #[must_use]
    pub fn is_strict_prefix_of(&self, other: &Path) -> bool {
        self.segments.len() < other.segments.len() && self.is_prefix_of(other)
    }
}

fn validate_segment(input: &str, segment: &str) -> CoreResult<()> {
    if segment.contains(FORBIDDEN_CHARS) || segment.chars().any(char::is_control) {
        return Err(CoreError::invalid_path(
            input,
            format!("segment {segment:?} contains a forbidden character"),
        ));
    }
    Ok(())
}

/// Parses a segment as a base-10 integer.
///
/// An optional leading `-` is accepted, a leading `+` is not. Values outside
/// the `i64` range are not integers, so such segments sort with the text keys.
fn parse_integer(segment: &str) -> Option<i64> {
    if segment.starts_with('+') {
        return None;
    }
    segment.parse().ok()
}

/// Compares two segments in segment order.
#[must_use]
pub fn compare_segments(a: &str, b: &str) -> Ordering {
    match (parse_integer(a), parse_integer(b)) {
        (Some(x), Some(y)) => x
            .cmp(&y)
            .then_with(|| a.len().cmp(&b.len()))
            .then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Comparator that orders string keys by segment order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentOrder;

impl<T: AsRef<str> + ?Sized> Comparator<T> for SegmentOrder {
    fn compare(&self, a: &T, b: &T) -> Ordering {
        compare_segments(a.as_ref(), b.as_ref())
    }
}

impl Ord for Path {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.segments.iter().zip(&other.segments) {
            match compare_segments(a, b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        self.segments.len().cmp(&other.segments.len())
    }
}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Path {
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

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

impl FromStr for Path {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
