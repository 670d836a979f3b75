//! Zero-copy byte strings with the `WireStr` type.

use std::fmt;
use std::ops::{Deref, RangeBounds};
use std::str::{self, FromStr};

use bytes::Bytes;

#[derive(Clone, PartialOrd, Ord, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
/// An immutable view over a range of a shared byte buffer.
///
/// Cloning a `WireStr` only bumps the reference count of the backing buffer,
/// so views cut out of a received packet can travel with the parsed message
/// without copying. Equality and hashing are derived from the content.
pub struct WireStr(Bytes);

impl WireStr {
    /// Creates an empty `WireStr`.
    pub const fn new() -> Self {
        Self(Bytes::new())
    }

    /// Creates a `WireStr` that points to a static string.
    pub const fn from_static(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }

    /// Creates a view of `len` bytes starting at `offset` in `buf`.
    ///
    /// The backing buffer is shared, not copied.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of the bounds of `buf`.
    pub fn view(buf: &Bytes, offset: usize, len: usize) -> Self {
        Self(buf.slice(offset..offset + len))
    }

    /// Creates a `WireStr` that owns a copy of `bytes`.
    pub fn copy_from(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }

    /// Returns a new view over a sub-range of this one.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Self {
        Self(self.0.slice(range))
    }

    /// Returns a copy that no longer keeps the original buffer alive.
    pub fn detach(&self) -> Self {
        Self::copy_from(&self.0)
    }

    /// Returns the content as a `&str` if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        str::from_utf8(&self.0).ok()
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the underlying shared buffer.
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// Case insensitive comparison against `other`.
    pub fn eq_ignore_case(&self, other: impl AsRef<[u8]>) -> bool {
        self.0.eq_ignore_ascii_case(other.as_ref())
    }

    /// Parses the content into `T`.
    pub fn parse<T: FromStr>(&self) -> Option<T> {
        self.as_str()?.parse().ok()
    }

    /// Returns a view without leading and trailing ASCII whitespace.
    pub fn trim(&self) -> Self {
        let start = self.0.iter().position(|b| !b.is_ascii_whitespace());
        let Some(start) = start else {
            return Self::new();
        };
        let end = self
            .0
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(start, |end| end + 1);

        self.slice(start..end)
    }
}

impl Deref for WireStr {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for WireStr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq<str> for WireStr {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl PartialEq<&str> for WireStr {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl PartialEq<[u8]> for WireStr {
    fn eq(&self, other: &[u8]) -> bool {
        self.0 == other
    }
}

impl fmt::Display for WireStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&String::from_utf8_lossy(&self.0), f)
    }
}

impl fmt::Debug for WireStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&String::from_utf8_lossy(&self.0), f)
    }
}

impl From<&'static str> for WireStr {
    fn from(s: &'static str) -> Self {
        Self::from_static(s)
    }
}

impl From<String> for WireStr {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<Bytes> for WireStr {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}
