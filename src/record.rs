//! Record Module
//!
//! The atomic unit of storage: a key paired with a value or a tombstone.
//!
//! Keys and values are `Bytes`: immutable, reference-counted blobs. Cloning a
//! record never copies payload bytes, and no caller can mutate a record's
//! contents through a shared view.

use bytes::{BufMut, Bytes, BytesMut};

/// An immutable key/value pair; a missing value marks a deleted key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Record {
    key: Bytes,
    value: Option<Bytes>,
}

impl Record {
    /// A live key/value pair
    pub fn of(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// A deletion marker for `key`
    pub fn tombstone(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub(crate) fn from_parts(key: Bytes, value: Option<Bytes>) -> Self {
        Self { key, value }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// The value, or `None` for a tombstone
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Key length plus value length, used for flush accounting
    pub fn size(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Bytes::len)
    }

    pub fn into_parts(self) -> (Bytes, Option<Bytes>) {
        (self.key, self.value)
    }
}

/// The immediate successor of `key` under byte-wise ordering.
///
/// Appending `0x00` yields the smallest key greater than `key`, so
/// `range(k, next_key(k))` covers exactly `k`. Keys ending in `0xFF` need no
/// carry handling.
pub fn next_key(key: &[u8]) -> Bytes {
    let mut next = BytesMut::with_capacity(key.len() + 1);
    next.put_slice(key);
    next.put_u8(0);
    next.freeze()
}
