//! Part Names
//!
//! A part name `<date>_left_right_level` encodes a half-open range of
//! block numbers within a month partition. The date prefix is the minimum
//! date of the rows the part contains; the month partition is its first
//! six digits. Parts are totally ordered within a partition by
//! `(left, right)`; a part covers another iff the months match and its
//! block range contains the other's.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Parsed form of a data part name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartName {
    /// Date prefix, `YYYYMMDD` (or a bare `YYYYMM` month)
    pub prefix: String,
    /// First block number covered by the part
    pub left: u64,
    /// Last block number covered by the part
    pub right: u64,
    /// Merge depth: 0 for freshly inserted parts
    pub level: u32,
}

impl PartName {
    pub fn new(prefix: impl Into<String>, left: u64, right: u64, level: u32) -> Self {
        Self {
            prefix: prefix.into(),
            left,
            right,
            level,
        }
    }

    /// Month partition of the part: the first six digits of the prefix.
    pub fn month(&self) -> &str {
        &self.prefix[..6]
    }

    /// Whether this part covers `other`: same month partition and a
    /// containing block-number range. A part covers itself.
    pub fn covers(&self, other: &PartName) -> bool {
        self.month() == other.month() && self.left <= other.left && self.right >= other.right
    }
}

impl Ord for PartName {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.month(), self.left, self.right, self.level, &self.prefix).cmp(&(
            other.month(),
            other.left,
            other.right,
            other.level,
            &other.prefix,
        ))
    }
}

impl PartialOrd for PartName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for PartName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::MalformedPartName(s.to_string());

        let mut fields = s.split('_');
        let prefix = fields.next().ok_or_else(malformed)?;
        let left = fields.next().ok_or_else(malformed)?;
        let right = fields.next().ok_or_else(malformed)?;
        let level = fields.next().ok_or_else(malformed)?;
        if fields.next().is_some() {
            return Err(malformed());
        }

        if !(prefix.len() == 6 || prefix.len() == 8) || !prefix.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(malformed());
        }

        let left: u64 = left.parse().map_err(|_| malformed())?;
        let right: u64 = right.parse().map_err(|_| malformed())?;
        let level: u32 = level.parse().map_err(|_| malformed())?;
        if left > right {
            return Err(malformed());
        }

        Ok(PartName {
            prefix: prefix.to_string(),
            left,
            right,
            level,
        })
    }
}

impl fmt::Display for PartName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.prefix, self.left, self.right, self.level
        )
    }
}
