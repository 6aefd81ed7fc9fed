//! Cache key definitions.
//!
//! A `CacheKey` is an ordered tuple of primitive segments, compared
//! structurally. Keys double as invalidation targets through prefix matching.

use std::fmt;

/// One primitive component of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySegment {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for KeySegment {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeySegment {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for KeySegment {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<bool> for KeySegment {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<KeySegment>> From<Option<T>> for KeySegment {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Identifies one cached result set, e.g. `["cloud-account", "acc-1"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CacheKey(Vec<KeySegment>);

impl CacheKey {
    /// Start a key from its leading segment.
    pub fn new(head: impl Into<KeySegment>) -> Self {
        Self(vec![head.into()])
    }

    /// Append a segment, builder style.
    pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
        self.0.push(segment.into());
        self
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if `self` equals the leading segments of `other`.
    ///
    /// The empty key is a prefix of every key.
    pub fn is_prefix_of(&self, other: &CacheKey) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, segment) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{segment}")?;
        }
        f.write_str("]")
    }
}

impl<S: Into<KeySegment>> FromIterator<S> for CacheKey {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Build a [`CacheKey`] from a list of segments.
///
/// ```
/// use optimist::cache_key;
/// let key = cache_key!["cloud-account", "acc-1"];
/// assert_eq!(key.len(), 2);
/// ```
#[macro_export]
macro_rules! cache_key {
    () => {
        $crate::cache::CacheKey::default()
    };
    ($($segment:expr),+ $(,)?) => {
        $crate::cache::CacheKey::from_iter([
            $($crate::cache::KeySegment::from($segment)),+
        ])
    };
}

/// Selects the entries an invalidation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InvalidationTarget {
    /// Exactly this key.
    Exact(CacheKey),
    /// Every key that starts with these segments.
    Prefix(CacheKey),
}

impl InvalidationTarget {
    pub fn exact(key: CacheKey) -> Self {
        Self::Exact(key)
    }

    pub fn prefix(key: CacheKey) -> Self {
        Self::Prefix(key)
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::Exact(target) => target == key,
            Self::Prefix(prefix) => prefix.is_prefix_of(key),
        }
    }
}

impl From<CacheKey> for InvalidationTarget {
    fn from(key: CacheKey) -> Self {
        Self::Exact(key)
    }
}
