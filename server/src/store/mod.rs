mod memory;
mod valkey;

pub use memory::MemoryStore;
pub use valkey::ValkeyStore;

use crate::error::ApiError;
use common::PaintOutcome;

/// Chunk state backend. `memory://` keeps every chunk in-process behind
/// per-chunk guards; a `redis://` URL delegates the same contract to
/// Valkey using the key layout in `common::keys`.
pub enum StateStore {
    Memory(MemoryStore),
    Valkey(ValkeyStore),
}

impl StateStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        if url.is_empty() || url.starts_with("memory") {
            Ok(Self::Memory(MemoryStore::new()))
        } else {
            Ok(Self::Valkey(ValkeyStore::connect(url).await?))
        }
    }

    /// Atomically write one cell: nibble RMW, sequence increment, and
    /// timestamp capture happen as a single step per chunk.
    pub async fn paint(
        &self,
        cx: i64,
        cy: i64,
        o: u16,
        color: u8,
    ) -> Result<PaintOutcome, ApiError> {
        match self {
            Self::Memory(store) => Ok(store.paint(cx, cy, o, color).await),
            Self::Valkey(store) => store
                .paint(cx, cy, o, color)
                .await
                .map_err(|e| ApiError::StoreUnavailable(e.to_string())),
        }
    }

    /// Consistent `(bytes, seq)` snapshot of a chunk. Absent chunks
    /// read as 32 KiB of zeroes with seq 0.
    pub async fn read(&self, cx: i64, cy: i64) -> Result<(Vec<u8>, u64), ApiError> {
        match self {
            Self::Memory(store) => Ok(store.read(cx, cy).await),
            Self::Valkey(store) => store
                .read(cx, cy)
                .await
                .map_err(|e| ApiError::StoreUnavailable(e.to_string())),
        }
    }

    pub async fn seq_of(&self, cx: i64, cy: i64) -> Result<u64, ApiError> {
        match self {
            Self::Memory(store) => Ok(store.seq_of(cx, cy).await),
            Self::Valkey(store) => store
                .seq_of(cx, cy)
                .await
                .map_err(|e| ApiError::StoreUnavailable(e.to_string())),
        }
    }

    /// Whether the backend can serve requests right now.
    pub async fn healthy(&self) -> bool {
        match self {
            Self::Memory(_) => true,
            Self::Valkey(store) => store.ping().await.is_ok(),
        }
    }
}
