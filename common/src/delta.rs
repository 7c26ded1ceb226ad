use serde::{Deserialize, Serialize};

/// A paint event fanned out to the subscribers of one chunk.
///
/// Serializes to the exact wire frame `{seq, o, color, ts}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Per-chunk monotonic sequence assigned by the store.
    pub seq: u64,
    /// Cell offset within the chunk.
    pub o: u16,
    /// Color the cell now holds.
    pub color: u8,
    /// UNIX seconds captured inside the paint critical section.
    pub ts: i64,
}

/// What the store reports back for an accepted paint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaintOutcome {
    pub seq: u64,
    pub ts: i64,
    /// Color the cell held before this paint.
    pub prev: u8,
}
