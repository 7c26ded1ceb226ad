use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use tokio::sync::Mutex;

use common::{coords, mask::Mask};

use crate::config::Config;
use crate::error::{ApiError, RejectReason};
use crate::turnstile::TurnstileClient;

/// Fallback lat/lon window used when no mask is loaded. Covers the
/// greater Boston area; the mask is the primary check.
const PREFILTER_LAT: (f64, f64) = (42.0, 43.0);
const PREFILTER_LON: (f64, f64) = (-72.0, -70.0);

/// Last accepted position for one client; anchor of the speed clamp.
#[derive(Debug, Clone, Copy)]
struct Position {
    lat: f64,
    lon: f64,
    at: Instant,
}

/// Ordered rule chain every paint must pass: bot token, geofence,
/// radius, speed clamp, cooldown. Failures short-circuit; nothing is
/// recorded until `commit` after the store write succeeds, so rejected
/// paints neither start a cooldown nor move the speed anchor.
pub struct AdmissionGuard {
    cooldown_window: Duration,
    max_speed_m_per_s: f64,
    radius_m: f64,
    mask: Option<Mask>,
    verifier: Option<TurnstileClient>,
    cooldowns: Mutex<HashMap<String, Instant>>,
    positions: Mutex<HashMap<String, Position>>,
}

impl AdmissionGuard {
    pub fn new(config: &Config, mask: Option<Mask>, verifier: Option<TurnstileClient>) -> Self {
        Self {
            cooldown_window: Duration::from_millis(config.paint_cooldown_ms),
            max_speed_m_per_s: config.speed_max_kmh * 1000.0 / 3600.0,
            radius_m: config.geofence_radius_m,
            mask,
            verifier,
            cooldowns: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
        }
    }

    /// Run the full rule chain for a submitted paint. `identity` is the
    /// client's network identity, `(cx, cy, o)` the cell it wants to
    /// color, `(lat, lon)` where it claims to stand.
    pub async fn admit(
        &self,
        identity: &str,
        token: &str,
        lat: f64,
        lon: f64,
        cx: i64,
        cy: i64,
        o: u16,
    ) -> Result<(), ApiError> {
        self.check_token(token, identity).await?;
        self.check_geofence(lat, lon)?;
        self.check_radius(lat, lon, cx, cy, o)?;
        self.check_speed(identity, lat, lon).await?;
        self.check_cooldown(identity).await?;
        Ok(())
    }

    /// Record an accepted paint: start the cooldown and move the speed
    /// anchor. Call only after the store write succeeded.
    pub async fn commit(&self, identity: &str, lat: f64, lon: f64) {
        let now = Instant::now();
        if !self.cooldown_window.is_zero() {
            self.cooldowns.lock().await.insert(identity.to_string(), now);
        }
        self.positions
            .lock()
            .await
            .insert(identity.to_string(), Position { lat, lon, at: now });
    }

    /// External verifier runs first, before any local state is touched.
    /// A missing token, a verifier error, and a "no" verdict are all
    /// indistinguishable to the client.
    async fn check_token(&self, token: &str, remote_ip: &str) -> Result<(), ApiError> {
        let Some(verifier) = &self.verifier else {
            return Ok(());
        };
        if token.is_empty() {
            return Err(ApiError::Unauthorized);
        }
        match verifier.verify(token, remote_ip).await {
            Ok(outcome) if outcome.success => Ok(()),
            Ok(outcome) => {
                tracing::debug!(error_codes = ?outcome.error_codes, "token verification refused");
                Err(ApiError::Unauthorized)
            }
            Err(e) => {
                tracing::warn!("token verification failed: {e}");
                Err(ApiError::Unauthorized)
            }
        }
    }

    fn check_geofence(&self, lat: f64, lon: f64) -> Result<(), ApiError> {
        match &self.mask {
            Some(mask) => {
                let (x, y) = coords::lat_lon_to_tile(lat, lon);
                if !mask.is_allowed(x, y) {
                    return Err(ApiError::Forbidden(RejectReason::Geofence));
                }
            }
            None => {
                if lat < PREFILTER_LAT.0
                    || lat > PREFILTER_LAT.1
                    || lon < PREFILTER_LON.0
                    || lon > PREFILTER_LON.1
                {
                    return Err(ApiError::Forbidden(RejectReason::Geofence));
                }
            }
        }
        Ok(())
    }

    /// The claimed position must be within the configured radius of the
    /// cell being painted.
    fn check_radius(&self, lat: f64, lon: f64, cx: i64, cy: i64, o: u16) -> Result<(), ApiError> {
        let (x, y) = coords::tile_of(cx, cy, o);
        let (center_lat, center_lon) = coords::tile_center_lat_lon(x, y);
        if coords::haversine(lat, lon, center_lat, center_lon) > self.radius_m {
            return Err(ApiError::Forbidden(RejectReason::Radius));
        }
        Ok(())
    }

    async fn check_speed(&self, identity: &str, lat: f64, lon: f64) -> Result<(), ApiError> {
        let positions = self.positions.lock().await;
        let Some(prev) = positions.get(identity) else {
            return Ok(());
        };
        let elapsed = prev.at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            // Clock did not advance; treat the implied speed as zero.
            return Ok(());
        }
        let distance = coords::haversine(prev.lat, prev.lon, lat, lon);
        if distance / elapsed > self.max_speed_m_per_s {
            return Err(ApiError::Forbidden(RejectReason::Speed));
        }
        Ok(())
    }

    async fn check_cooldown(&self, identity: &str) -> Result<(), ApiError> {
        if self.cooldown_window.is_zero() {
            return Ok(());
        }
        let mut cooldowns = self.cooldowns.lock().await;
        let Some(last) = cooldowns.get(identity) else {
            return Ok(());
        };
        let elapsed = last.elapsed();
        if elapsed < self.cooldown_window {
            let remaining = self.cooldown_window - elapsed;
            return Err(ApiError::TooMany {
                retry_after_s: remaining.as_secs().max(1),
            });
        }
        // Expired entries are dropped on the way past.
        cooldowns.remove(identity);
        Ok(())
    }
}

/// Network identity of the requester. Prefers CF-Connecting-IP, then
/// the first X-Forwarded-For hop, then the peer address, matching the
/// reverse-proxy deployments this server sits behind.
pub fn client_identity(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(ip) = header_str(headers, "cf-connecting-ip") {
            return ip.to_string();
        }
        if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    peer.ip().to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
