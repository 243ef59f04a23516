//! # Domain Types for the Mutation Queue
//!
//! Newtypes around primitives, in the same spirit as the rest of the crate:
//! a [`BatchId`] can't be passed where a timestamp is expected, and document
//! keys are validated once at construction.
//!
//! ## Invariants
//!
//! - [`BatchId`]: strictly increasing per queue, never reused, starts at 1.
//!   [`BatchId::NONE`] (raw 0) is the "no batch" sentinel.
//! - [`DocumentKey`]: a [`ResourcePath`] with an even, non-zero number of
//!   segments (`collection/doc[/collection/doc...]`).
//! - [`StreamToken`]: opaque bytes, never interpreted.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Batch Identification
// =============================================================================

/// Identifier of a mutation batch.
///
/// Ids are assigned by the queue at creation time; their total order is the
/// replay and acknowledgment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(u64);

impl BatchId {
    /// Sentinel meaning "no batch": nothing acknowledged yet, or "start from
    /// the first batch" when used as a lower bound.
    pub const NONE: BatchId = BatchId(0);

    /// The first id a queue hands out.
    pub const FIRST: BatchId = BatchId(1);

    /// Creates a BatchId from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the following id.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns true for the [`BatchId::NONE`] sentinel.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// SQLite integers are signed; raw ids past `i64::MAX` saturate.
    pub(crate) fn to_sql(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    pub(crate) fn from_sql(value: i64) -> Self {
        Self(u64::try_from(value).unwrap_or(0))
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// =============================================================================
// Users and Stream Tokens
// =============================================================================

/// The user a mutation queue belongs to.
///
/// Every user has an independent queue. The unauthenticated user is
/// represented by the empty uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    /// Creates a user id from a uid string.
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    /// The user that is not signed in.
    pub fn unauthenticated() -> Self {
        Self(String::new())
    }

    /// Returns the uid.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_authenticated(&self) -> bool {
        !self.0.is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<unauthenticated>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Opaque replay cursor issued by the backend.
///
/// Stored and returned byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StreamToken(Vec<u8>);

impl StreamToken {
    /// The token a fresh queue starts with.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for StreamToken {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for StreamToken {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for StreamToken {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// Wall-clock time at millisecond precision.
///
/// Used for local-write provenance only; never for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current time. Clocks before the Unix epoch read as 0.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// =============================================================================
// Paths and Document Keys
// =============================================================================

/// A slash-separated path of non-empty segments, e.g. `rooms/eros/messages`.
///
/// Ordering is segment-wise lexicographic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourcePath(Vec<String>);

impl ResourcePath {
    /// The empty (root) path.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parses a `/`-separated path. Leading and trailing slashes are ignored;
    /// empty segments in the middle (`a//b`) are rejected.
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(Error::InvalidPath {
                    path: path.to_string(),
                    reason: "paths must not contain empty segments",
                });
            }
            segments.push(segment.to_string());
        }
        Ok(Self(segments))
    }

    /// Builds a path from already-split segments.
    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if let Some(bad) = segments.iter().find(|s| s.is_empty() || s.contains('/')) {
            return Err(Error::InvalidPath {
                path: bad.clone(),
                reason: "segments must be non-empty and must not contain '/'",
            });
        }
        Ok(Self(segments))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Last segment, if any.
    pub fn last_segment(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Appends a segment, returning a new path.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// The path without its last segment. The root's parent is the root.
    pub fn parent(&self) -> Self {
        let mut segments = self.0.clone();
        segments.pop();
        Self(segments)
    }

    /// True if `self` is a (non-strict) prefix of `other`.
    pub fn is_prefix_of(&self, other: &ResourcePath) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }

    /// The canonical `/`-joined form used in storage.
    pub fn canonical_string(&self) -> String {
        self.0.join("/")
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

/// Identifies a single document: a [`ResourcePath`] with an even number of
/// segments.
///
/// Serialized as its canonical path string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentKey(ResourcePath);

impl DocumentKey {
    /// Wraps a path, checking that it names a document.
    pub fn from_path(path: ResourcePath) -> Result<Self> {
        if !Self::is_document_key(&path) {
            return Err(Error::InvalidPath {
                path: path.canonical_string(),
                reason: "document keys need an even, non-zero number of segments",
            });
        }
        Ok(Self(path))
    }

    /// Parses `collection/doc[/collection/doc...]`.
    pub fn parse(path: &str) -> Result<Self> {
        Self::from_path(ResourcePath::parse(path)?)
    }

    /// Sorts before every valid key. Only used as a range bound.
    pub(crate) fn range_floor() -> Self {
        Self(ResourcePath::root())
    }

    /// True if `path` has the shape of a document key.
    pub fn is_document_key(path: &ResourcePath) -> bool {
        !path.is_empty() && path.len() % 2 == 0
    }

    pub fn path(&self) -> &ResourcePath {
        &self.0
    }

    /// Id of the collection that directly contains this document.
    pub fn collection_id(&self) -> &str {
        let segments = self.0.segments();
        &segments[segments.len() - 2]
    }

    /// Path of the collection that directly contains this document.
    pub fn collection_path(&self) -> ResourcePath {
        self.0.parent()
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DocumentKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DocumentKey> for String {
    fn from(key: DocumentKey) -> Self {
        key.0.canonical_string()
    }
}

/// Ordered set of document keys.
pub type DocumentKeySet = BTreeSet<DocumentKey>;

// =============================================================================
// Targets
// =============================================================================

/// Identifier of a local view that pins documents in a
/// [`ReferenceSet`](crate::ReferenceSet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId(u32);

impl TargetId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
