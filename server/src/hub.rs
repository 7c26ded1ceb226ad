use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};

use common::Delta;

pub type ChunkKey = (i64, i64);

/// The live subscribers of one chunk, keyed by subscriber id.
#[derive(Default)]
struct Room {
    subs: Mutex<HashMap<u64, mpsc::Sender<Delta>>>,
}

/// A registered subscriber. Dropping it without `unsubscribe` leaves a
/// closed outbox behind, which the next publish reaps.
pub struct Subscriber {
    pub key: ChunkKey,
    pub id: u64,
    pub outbox: mpsc::Receiver<Delta>,
}

/// Per-chunk fan-out of paint deltas. Each subscriber owns a bounded
/// outbox; publish try-appends and tears down any subscriber whose
/// outbox is full or closed, so one slow reader never stalls painters
/// or its roommates. Rooms are created on first subscribe and removed
/// when the last subscriber leaves.
///
/// Lock order is always rooms, then a room's subs.
pub struct Hub {
    rooms: RwLock<HashMap<ChunkKey, Arc<Room>>>,
    next_id: AtomicU64,
    outbox_cap: usize,
}

impl Hub {
    pub fn new(outbox_cap: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            outbox_cap: outbox_cap.max(1),
        }
    }

    pub async fn subscribe(&self, cx: i64, cy: i64) -> Subscriber {
        let key = (cx, cy);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.outbox_cap);

        // Fast path: the room already exists. The rooms read lock is
        // held across the insert so the room cannot be reaped between
        // lookup and registration.
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&key) {
                room.subs.lock().await.insert(id, tx);
                return Subscriber { key, id, outbox: rx };
            }
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(key).or_default().clone();
        room.subs.lock().await.insert(id, tx);
        Subscriber { key, id, outbox: rx }
    }

    pub async fn unsubscribe(&self, key: ChunkKey, id: u64) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&key).cloned() {
            let mut subs = room.subs.lock().await;
            subs.remove(&id);
            let empty = subs.is_empty();
            drop(subs);
            if empty {
                rooms.remove(&key);
            }
        }
    }

    /// Deliver a delta to every subscriber of the chunk's room. Never
    /// blocks: a full or closed outbox removes that subscriber on the
    /// spot, and it must resync by refetching the chunk snapshot.
    /// Publishing to a nonexistent room is a no-op.
    pub async fn publish(&self, cx: i64, cy: i64, delta: Delta) {
        let key = (cx, cy);
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(&key).cloned()
        };
        let Some(room) = room else {
            return;
        };

        let emptied = {
            let mut subs = room.subs.lock().await;
            let mut dead = Vec::new();
            for (&id, tx) in subs.iter() {
                match tx.try_send(delta) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!(id, ?key, "outbox full, dropping subscriber");
                        dead.push(id);
                    }
                    Err(TrySendError::Closed(_)) => dead.push(id),
                }
            }
            for id in &dead {
                subs.remove(id);
            }
            !dead.is_empty() && subs.is_empty()
        };

        if emptied {
            self.reap_if_empty(&key).await;
        }
    }

    async fn reap_if_empty(&self, key: &ChunkKey) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(key).cloned() {
            let subs = room.subs.lock().await;
            let empty = subs.is_empty();
            drop(subs);
            if empty {
                rooms.remove(key);
            }
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn subscriber_count(&self, cx: i64, cy: i64) -> usize {
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(&(cx, cy)).cloned()
        };
        match room {
            Some(room) => room.subs.lock().await.len(),
            None => 0,
        }
    }
}
