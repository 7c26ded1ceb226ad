use common::mask::Bounds;

/// Server configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    /// `memory://` for the in-process store, or a `redis://` URL.
    pub state_store_url: String,
    pub mask_path: Option<String>,
    pub mask_bounds: Option<Bounds>,
    /// 0 disables the cooldown rule.
    pub paint_cooldown_ms: u64,
    pub geofence_radius_m: f64,
    pub speed_max_kmh: f64,
    pub enable_token_check: bool,
    pub token_secret: String,
    pub ws_write_buffer_bytes: usize,
    pub ws_ping_interval_s: u64,
    pub ws_idle_timeout_s: u64,
    /// Per-subscriber outbox capacity, in deltas.
    pub sub_outbox_cap: usize,
    /// Prefer CF-Connecting-IP / X-Forwarded-For over the peer address.
    pub trust_proxy_headers: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            state_store_url: env_or("STATE_STORE_URL", "memory://"),
            mask_path: std::env::var("MASK_PATH").ok().filter(|p| !p.is_empty()),
            mask_bounds: std::env::var("MASK_BOUNDS")
                .ok()
                .as_deref()
                .and_then(parse_bounds),
            paint_cooldown_ms: env_parse("PAINT_COOLDOWN_MS", 5000),
            geofence_radius_m: env_parse("GEOFENCE_RADIUS_M", 300.0),
            speed_max_kmh: env_parse("SPEED_MAX_KMH", 150.0),
            enable_token_check: env_parse("ENABLE_TOKEN_CHECK", false),
            token_secret: env_or("TOKEN_SECRET", ""),
            ws_write_buffer_bytes: env_parse("WS_WRITE_BUFFER_BYTES", 1_048_576),
            ws_ping_interval_s: env_parse("WS_PING_INTERVAL_S", 20),
            ws_idle_timeout_s: env_parse("WS_IDLE_TIMEOUT_S", 60),
            sub_outbox_cap: env_parse("SUB_OUTBOX_CAP", 256),
            trust_proxy_headers: env_parse("TRUST_PROXY_HEADERS", true),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse a `minx,miny,maxx,maxy` tile window.
fn parse_bounds(raw: &str) -> Option<Bounds> {
    let parts: Vec<i64> = raw
        .split(',')
        .map(|s| s.trim().parse().ok())
        .collect::<Option<_>>()?;
    match parts[..] {
        [min_x, min_y, max_x, max_y] if min_x <= max_x && min_y <= max_y => Some(Bounds {
            min_x,
            min_y,
            max_x,
            max_y,
        }),
        _ => None,
    }
}
