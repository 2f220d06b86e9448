//! Identifiers for slabs, memos and records.
//!
//! A slab hands out memo and record ids from one monotonically increasing
//! counter, so both are globally unique once the slab id is. Text forms:
//!
//! ```text
//! slab    A
//! memo    A-1f      (slab, counter in base 36)
//! record  R.A-3
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest accepted slab id.
pub const MAX_SLAB_ID_LEN: usize = 8;

const RECORD_PREFIX: &str = "R.";

/// Name of a storage node. 1 to 8 ASCII alphanumeric characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlabId(String);

impl SlabId {
    /// Validate and wrap a slab name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_SLAB_ID_LEN
            && name.bytes().all(|b| b.is_ascii_alphanumeric());
        if valid {
            Ok(Self(name))
        } else {
            Err(Error::InvalidSlabId(name))
        }
    }

    /// Slab id for the n-th slab allocated by a mesh.
    pub(crate) fn from_counter(n: u64) -> Self {
        Self(format!("s{}", to_base36(n)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SlabId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for SlabId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<SlabId> for String {
    fn from(id: SlabId) -> Self {
        id.0
    }
}

/// Globally unique memo identifier.
///
/// Ordered lexicographically over (slab, counter). Field resolution uses
/// this order to break ties between concurrent heads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemoId {
    slab: SlabId,
    seq: u64,
}

impl MemoId {
    pub fn new(slab: SlabId, seq: u64) -> Self {
        Self { slab, seq }
    }

    /// The slab that minted this memo.
    pub fn slab(&self) -> &SlabId {
        &self.slab
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for MemoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.slab, to_base36(self.seq))
    }
}

impl FromStr for MemoId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (slab, seq) = split_slab_seq(s)?;
        Ok(Self { slab, seq })
    }
}

impl TryFrom<String> for MemoId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MemoId> for String {
    fn from(id: MemoId) -> Self {
        id.to_string()
    }
}

/// Record identifier, minted from the same slab counter as memos.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId {
    slab: SlabId,
    seq: u64,
}

impl RecordId {
    pub fn new(slab: SlabId, seq: u64) -> Self {
        Self { slab, seq }
    }

    pub fn slab(&self) -> &SlabId {
        &self.slab
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}-{}", RECORD_PREFIX, self.slab, to_base36(self.seq))
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(RECORD_PREFIX)
            .ok_or_else(|| Error::InvalidEntityId(s.to_string()))?;
        let (slab, seq) = split_slab_seq(rest).map_err(|_| Error::InvalidEntityId(s.to_string()))?;
        Ok(Self { slab, seq })
    }
}

impl TryFrom<String> for RecordId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.to_string()
    }
}

/// Anything a payload value may point at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntityId {
    Memo(MemoId),
    Record(RecordId),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Memo(id) => id.fmt(f),
            EntityId::Record(id) => id.fmt(f),
        }
    }
}

impl FromStr for EntityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with(RECORD_PREFIX) {
            s.parse().map(EntityId::Record)
        } else {
            s.parse().map(EntityId::Memo)
        }
    }
}

impl TryFrom<String> for EntityId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.to_string()
    }
}

impl From<MemoId> for EntityId {
    fn from(id: MemoId) -> Self {
        EntityId::Memo(id)
    }
}

impl From<RecordId> for EntityId {
    fn from(id: RecordId) -> Self {
        EntityId::Record(id)
    }
}

fn split_slab_seq(s: &str) -> Result<(SlabId, u64)> {
    let invalid = || Error::InvalidEntityId(s.to_string());
    let (slab, seq) = s.split_once('-').ok_or_else(invalid)?;
    let slab = SlabId::new(slab).map_err(|_| invalid())?;
    let seq = from_base36(seq).ok_or_else(invalid)?;
    Ok((slab, seq))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    buf.into_iter().map(char::from).collect()
}

fn from_base36(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()) {
        return None;
    }
    u64::from_str_radix(s, 36).ok()
}
