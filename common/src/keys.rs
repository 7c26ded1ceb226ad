//! Key layout for the external state store.

/// Key holding a chunk's 32 KiB bit-packed cell blob.
pub fn chunk_bits_key(cx: i64, cy: i64) -> String {
    format!("chunk:{cx}:{cy}:bits")
}

/// Key holding a chunk's monotonic sequence counter.
pub fn chunk_seq_key(cx: i64, cy: i64) -> String {
    format!("chunk:{cx}:{cy}:seq")
}

/// Existence-with-TTL cooldown marker for a client identity.
pub fn cooldown_key(client_id: &str) -> String {
    format!("cool:{client_id}")
}
