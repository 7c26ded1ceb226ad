use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use common::{cell, PaintOutcome};

/// One chunk's canvas state: 32 KiB of bit-packed cells plus the
/// monotonic sequence counter. Mutated only under this chunk's write
/// guard.
struct Chunk {
    bits: Box<[u8]>,
    seq: u64,
}

impl Chunk {
    fn new() -> Self {
        Self {
            bits: vec![0u8; cell::CHUNK_BYTES].into_boxed_slice(),
            seq: 0,
        }
    }
}

/// In-process chunk store. Chunks materialize on first paint and live
/// for the life of the process; the guard is per chunk so unrelated hot
/// spots never contend.
pub struct MemoryStore {
    chunks: RwLock<HashMap<(i64, i64), Arc<RwLock<Chunk>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
        }
    }

    async fn chunk_entry(&self, cx: i64, cy: i64) -> Arc<RwLock<Chunk>> {
        {
            let chunks = self.chunks.read().await;
            if let Some(chunk) = chunks.get(&(cx, cy)) {
                return chunk.clone();
            }
        }
        let mut chunks = self.chunks.write().await;
        chunks
            .entry((cx, cy))
            .or_insert_with(|| Arc::new(RwLock::new(Chunk::new())))
            .clone()
    }

    /// Paint one cell. The nibble read-modify-write, sequence bump, and
    /// timestamp capture all happen under the chunk's write guard, so
    /// every accepted paint gets a distinct, strictly increasing seq.
    pub async fn paint(&self, cx: i64, cy: i64, o: u16, color: u8) -> PaintOutcome {
        let chunk = self.chunk_entry(cx, cy).await;
        let mut guard = chunk.write().await;
        let prev = cell::set(&mut guard.bits, o as usize, color);
        guard.seq += 1;
        let ts = unix_now();
        PaintOutcome {
            seq: guard.seq,
            ts,
            prev,
        }
    }

    /// Point-in-time `(bytes, seq)` snapshot. An absent chunk reads as
    /// all zeroes with seq 0 and is not materialized.
    pub async fn read(&self, cx: i64, cy: i64) -> (Vec<u8>, u64) {
        let chunk = {
            let chunks = self.chunks.read().await;
            chunks.get(&(cx, cy)).cloned()
        };
        match chunk {
            Some(chunk) => {
                let guard = chunk.read().await;
                (guard.bits.to_vec(), guard.seq)
            }
            None => (vec![0u8; cell::CHUNK_BYTES], 0),
        }
    }

    pub async fn seq_of(&self, cx: i64, cy: i64) -> u64 {
        let chunk = {
            let chunks = self.chunks.read().await;
            chunks.get(&(cx, cy)).cloned()
        };
        match chunk {
            Some(chunk) => chunk.read().await.seq,
            None => 0,
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
