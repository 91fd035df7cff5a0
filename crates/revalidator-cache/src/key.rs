use std::fmt::{self, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A single component of a [`QueryKey`].
///
/// Segments compare and hash by value. Deserialization picks the first variant that fits, so
/// numbers become [`Int`](Self::Int), strings [`Str`](Self::Str) and byte arrays
/// [`Bytes`](Self::Bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segment {
    Int(i64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Int(int) => write!(f, "{int}"),
            Segment::Str(string) => write!(f, "{string:?}"),
            Segment::Bytes(bytes) => {
                f.write_str("0x")?;
                for b in bytes.iter() {
                    f.write_fmt(format_args!("{b:02x}"))?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for Segment {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}

impl From<String> for Segment {
    fn from(value: String) -> Self {
        Self::Str(value.into())
    }
}

impl From<Arc<str>> for Segment {
    fn from(value: Arc<str>) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for Segment {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Segment {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for Segment {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<&[u8]> for Segment {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.into())
    }
}

impl From<Vec<u8>> for Segment {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value.into())
    }
}

/// A hierarchical identifier for a cached value, like `["tracks", "detail", "abc-123"]`.
///
/// Keys are compared segment by segment and are cheap to clone. A key is a *prefix* of
/// every key that starts with the same segments, which is what [`invalidate`] and per-prefix
/// configuration use to address whole subtrees of the cache.
///
/// [`invalidate`]: crate::CacheStore::invalidate
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "Vec<Segment>")]
pub struct QueryKey {
    segments: Arc<[Segment]>,
}

impl QueryKey {
    /// Creates a key from its segments.
    ///
    /// # Panics
    ///
    /// Panics if `segments` is empty. An empty key would match every entry as a prefix and
    /// is always a programming error.
    #[track_caller]
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Segment>,
    {
        let segments: Arc<[Segment]> = segments.into_iter().map(Into::into).collect();
        assert!(!segments.is_empty(), "query keys need at least one segment");
        Self { segments }
    }

    /// The segments of this key, outermost first.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Always `false`, keys cannot be empty.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether this key is equal to or a descendant of `prefix`.
    pub fn matches(&self, prefix: &QueryKey) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Returns a new key with `segment` appended.
    pub fn child(&self, segment: impl Into<Segment>) -> QueryKey {
        let segments = self
            .segments
            .iter()
            .cloned()
            .chain(std::iter::once(segment.into()))
            .collect();
        Self { segments }
    }

    /// Returns the key with the last segment removed, or `None` for single-segment keys.
    pub fn parent(&self) -> Option<QueryKey> {
        match self.segments.len() {
            0 | 1 => None,
            len => Some(Self {
                segments: self.segments[..len - 1].into(),
            }),
        }
    }
}

impl TryFrom<Vec<Segment>> for QueryKey {
    type Error = &'static str;

    fn try_from(segments: Vec<Segment>) -> Result<Self, Self::Error> {
        if segments.is_empty() {
            return Err("query keys need at least one segment");
        }
        Ok(Self {
            segments: segments.into(),
        })
    }
}

impl Serialize for QueryKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.segments.serialize(serializer)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char('[')?;
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_char(',')?;
            }
            write!(f, "{segment}")?;
        }
        f.write_char(']')
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({self})")
    }
}

/// Builds a [`QueryKey`] from a list of segments.
///
/// ```
/// use revalidator_cache::query_key;
///
/// let key = query_key!["tracks", "detail", 42];
/// assert_eq!(key.to_string(), r#"["tracks","detail",42]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:expr),+ $(,)?) => {
        $crate::QueryKey::new([$($crate::Segment::from($segment)),+])
    };
}
