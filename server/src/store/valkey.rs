use std::time::{SystemTime, UNIX_EPOCH};

use redis::AsyncCommands;

use common::{cell, keys, PaintOutcome};

/// Nibble RMW + seq INCR in one script so the write and its sequence
/// are a single linearizable step, exactly like the in-memory guard.
const PAINT_SCRIPT: &str = r#"
-- KEYS[1]=bits, KEYS[2]=seq
-- ARGV[1]=offset, ARGV[2]=color, ARGV[3]=unix seconds

local o = tonumber(ARGV[1])
local color = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local byte_idx = math.floor(o / 2)
local high = (o % 2) == 0

local cur = redis.call('GETRANGE', KEYS[1], byte_idx, byte_idx)
if cur == false or #cur == 0 then
  -- materialize the 32 KiB blob on first touch
  redis.call('SETRANGE', KEYS[1], 32767, string.char(0))
  cur = string.char(0)
end

local b = string.byte(cur)
local prev
if high then
  prev = bit.rshift(bit.band(b, 0xF0), 4)
  b = bit.bor(bit.band(b, 0x0F), bit.lshift(color, 4))
else
  prev = bit.band(b, 0x0F)
  b = bit.bor(bit.band(b, 0xF0), color)
end

redis.call('SETRANGE', KEYS[1], byte_idx, string.char(b))
local seq = redis.call('INCR', KEYS[2])

return { seq, now, prev }
"#;

/// Bits and seq fetched in one script call so the pair is a consistent
/// snapshot.
const SNAPSHOT_SCRIPT: &str = r#"
-- KEYS[1]=bits, KEYS[2]=seq
local bits = redis.call('GETRANGE', KEYS[1], 0, 32767)
local seq = redis.call('GET', KEYS[2])
if seq == false then
  seq = 0
else
  seq = tonumber(seq)
end
return { bits, seq }
"#;

/// Chunk store backed by Valkey. Key layout per `common::keys`:
/// `chunk:{cx}:{cy}:bits` holds the blob, `chunk:{cx}:{cy}:seq` the
/// counter.
pub struct ValkeyStore {
    con: redis::aio::MultiplexedConnection,
    paint_script: redis::Script,
    snapshot_script: redis::Script,
}

impl ValkeyStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let con = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            con,
            paint_script: redis::Script::new(PAINT_SCRIPT),
            snapshot_script: redis::Script::new(SNAPSHOT_SCRIPT),
        })
    }

    pub async fn paint(
        &self,
        cx: i64,
        cy: i64,
        o: u16,
        color: u8,
    ) -> Result<PaintOutcome, redis::RedisError> {
        let mut con = self.con.clone();
        let (seq, ts, prev): (u64, i64, u8) = self
            .paint_script
            .key(keys::chunk_bits_key(cx, cy))
            .key(keys::chunk_seq_key(cx, cy))
            .arg(o)
            .arg(color)
            .arg(unix_now())
            .invoke_async(&mut con)
            .await?;
        Ok(PaintOutcome { seq, ts, prev })
    }

    pub async fn read(&self, cx: i64, cy: i64) -> Result<(Vec<u8>, u64), redis::RedisError> {
        let mut con = self.con.clone();
        let (mut bits, seq): (Vec<u8>, u64) = self
            .snapshot_script
            .key(keys::chunk_bits_key(cx, cy))
            .key(keys::chunk_seq_key(cx, cy))
            .invoke_async(&mut con)
            .await?;
        // Short or absent values read as trailing zeroes.
        bits.resize(cell::CHUNK_BYTES, 0);
        Ok((bits, seq))
    }

    pub async fn seq_of(&self, cx: i64, cy: i64) -> Result<u64, redis::RedisError> {
        let mut con = self.con.clone();
        let seq: Option<u64> = con.get(keys::chunk_seq_key(cx, cy)).await?;
        Ok(seq.unwrap_or(0))
    }

    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut con = self.con.clone();
        redis::cmd("PING").query_async::<()>(&mut con).await
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
