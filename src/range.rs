//! Key ranges and scan direction shared by every read path.

use std::ops::Bound;

use bytes::Bytes;

use crate::error::{DaoError, Result};

/// Order in which a scan yields keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Half-open key range `[from, to)`; a missing bound is unbounded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    from: Option<Bytes>,
    to: Option<Bytes>,
}

impl KeyRange {
    /// Build a range, rejecting `from > to`
    pub fn new(from: Option<Bytes>, to: Option<Bytes>) -> Result<Self> {
        if let (Some(from), Some(to)) = (&from, &to) {
            if from > to {
                return Err(DaoError::InvalidRange);
            }
        }
        Ok(Self { from, to })
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn from(&self) -> Option<&[u8]> {
        self.from.as_deref()
    }

    pub fn to(&self) -> Option<&[u8]> {
        self.to.as_deref()
    }

    /// True when `key` is at or above the lower bound
    pub fn above_start(&self, key: &[u8]) -> bool {
        self.from().map_or(true, |from| key >= from)
    }

    /// True when `key` is below the exclusive upper bound
    pub fn below_end(&self, key: &[u8]) -> bool {
        self.to().map_or(true, |to| key < to)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.above_start(key) && self.below_end(key)
    }

    /// Bounds in the form `BTreeMap::range` accepts
    pub(crate) fn as_bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        let lower = self.from().map_or(Bound::Unbounded, Bound::Included);
        let upper = self.to().map_or(Bound::Unbounded, Bound::Excluded);
        (lower, upper)
    }
}
