//! MIR Values and Identifiers
//!
//! Defines the value and block identifiers used in SSA form MIR, plus the
//! source spans carried through to diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Value identifier in SSA form
///
/// Each value in MIR has a unique ID within its function. Values are assigned
/// once and never modified (SSA property).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn new(id: u32) -> Self {
        ValueId(id)
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u32> for ValueId {
    fn from(id: u32) -> Self {
        ValueId(id)
    }
}

/// Basic block identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Entry block ID (always 0)
    pub const ENTRY: BlockId = BlockId(0);

    pub fn new(id: u32) -> Self {
        BlockId(id)
    }

    pub fn id(&self) -> u32 {
        self.0
    }

    pub fn is_entry(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

impl From<u32> for BlockId {
    fn from(id: u32) -> Self {
        BlockId(id)
    }
}

/// Generator for unique value IDs
#[derive(Clone, Debug, Default)]
pub struct ValueIdGen {
    next_id: u32,
}

impl ValueIdGen {
    pub fn new() -> Self {
        Self { next_id: 0 }
    }

    /// Start numbering after an existing function's highest value
    pub fn starting_at(next_id: u32) -> Self {
        Self { next_id }
    }

    /// Generate a new unique value ID
    pub fn next(&mut self) -> ValueId {
        let id = ValueId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Number of IDs handed out so far
    pub fn count(&self) -> u32 {
        self.next_id
    }
}

/// Generator for unique block IDs
#[derive(Clone, Debug, Default)]
pub struct BlockIdGen {
    next_id: u32,
}

impl BlockIdGen {
    pub fn new() -> Self {
        Self { next_id: 0 }
    }

    pub fn next(&mut self) -> BlockId {
        let id = BlockId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn count(&self) -> u32 {
        self.next_id
    }
}

/// Source location span
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: u32,
    pub end: u32,
    pub file_id: u32,
}

impl Span {
    pub fn new(start: u32, end: u32, file_id: u32) -> Self {
        Self {
            start,
            end,
            file_id,
        }
    }

    /// Merge two spans into one covering both
    pub fn merge(self, other: Span) -> Span {
        if self.file_id != other.file_id {
            return self;
        }
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            file_id: self.file_id,
        }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}..{}", self.file_id, self.start, self.end)
    }
}
