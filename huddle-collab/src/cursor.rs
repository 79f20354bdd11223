//! Live cursors: throttled outbound pointer updates, remote cursor table.
//!
//! ```text
//! pointer move ──► Throttle (leading + trailing, ≥ interval apart)
//!                      │
//!                      ▼
//!              BroadcastMessage::Cursor(CursorState) ──► room
//!
//! room ──► on_remote ──► remote[peer]   (only while peer is present)
//! leave ──► on_leave ──► remove remote[peer]
//! ```
//!
//! Cursor traffic rides the ephemeral broadcast path only; nothing here is
//! ever persisted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use huddle_core::PeerId;

use crate::presence::PresenceManager;
use crate::protocol::PresenceMeta;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// 2D position in document (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Vec2) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// RGBA cursor color.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a UUID (HSL, fixed s/l).
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn for_peer(peer: PeerId) -> Self {
        Self::from_uuid(peer.as_uuid())
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb`, alpha dropped.
    pub fn to_hex(&self) -> String {
        let c = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", c(self.r), c(self.g), c(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// One peer's cursor, as broadcast and as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    pub peer_id: PeerId,
    pub display_name: String,
    pub color: CursorColor,
    pub position: Vec2,
    /// Per-sender sequence; later updates carry larger values.
    pub timestamp: u64,
}

// ───────────────────────────────────────────────────────────────────
// Throttle
// ───────────────────────────────────────────────────────────────────

/// Leading + trailing rate limiter.
///
/// The first sample after a quiet period goes out immediately. Samples
/// inside the interval are coalesced to the latest one, which is released
/// by [`flush_due`](Throttle::flush_due) once the interval has passed.
#[derive(Debug, Clone)]
pub struct Throttle<T> {
    interval: Duration,
    last_emit: Option<Instant>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            pending: None,
        }
    }

    pub fn sample(&mut self, now: Instant, value: T) -> Option<T> {
        if self.ready(now) {
            self.last_emit = Some(now);
            self.pending = None;
            Some(value)
        } else {
            self.pending = Some(value);
            None
        }
    }

    /// Release the coalesced sample if its slot has opened.
    pub fn flush_due(&mut self, now: Instant) -> Option<T> {
        if self.pending.is_some() && self.ready(now) {
            self.last_emit = Some(now);
            self.pending.take()
        } else {
            None
        }
    }

    /// When the pending sample may go out.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (&self.pending, self.last_emit) {
            (Some(_), Some(last)) => Some(last + self.interval),
            _ => None,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn reset(&mut self) {
        self.last_emit = None;
        self.pending = None;
    }

    fn ready(&self, now: Instant) -> bool {
        match self.last_emit {
            None => true,
            Some(last) => now >= last + self.interval,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Cursor service
// ───────────────────────────────────────────────────────────────────

pub struct CursorService {
    peer_id: PeerId,
    display_name: String,
    color: CursorColor,
    throttle: Throttle<Vec2>,
    last_position: Option<Vec2>,
    sequence: u64,
    remote: HashMap<PeerId, CursorState>,
}

impl CursorService {
    pub fn new(local: &PresenceMeta, interval: Duration) -> Self {
        Self {
            peer_id: local.peer_id,
            display_name: local.display_name.clone(),
            color: CursorColor::for_peer(local.peer_id),
            throttle: Throttle::new(interval),
            last_position: None,
            sequence: 0,
            remote: HashMap::new(),
        }
    }

    /// Local pointer sample. Returns an update to broadcast, if one is due.
    pub fn pointer_moved(&mut self, now: Instant, position: Vec2) -> Option<CursorState> {
        self.last_position = Some(position);
        self.throttle
            .sample(now, position)
            .map(|p| self.stamp(p))
    }

    /// Trailing update for the last throttled sample.
    pub fn flush_due(&mut self, now: Instant) -> Option<CursorState> {
        self.throttle.flush_due(now).map(|p| self.stamp(p))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.throttle.next_deadline()
    }

    /// Current position for a newcomer, bypassing the throttle.
    pub fn announce(&mut self) -> Option<CursorState> {
        self.last_position.map(|p| self.stamp(p))
    }

    /// Store a remote cursor. Dropped if the sender is not present, is us,
    /// or the update is older than what we hold.
    pub fn on_remote(&mut self, state: CursorState, presence: &PresenceManager) -> bool {
        if state.peer_id == self.peer_id || !presence.contains(&state.peer_id) {
            return false;
        }
        if let Some(existing) = self.remote.get(&state.peer_id) {
            if existing.timestamp >= state.timestamp {
                return false;
            }
        }
        self.remote.insert(state.peer_id, state);
        true
    }

    pub fn on_leave(&mut self, peer: &PeerId) -> bool {
        self.remote.remove(peer).is_some()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&CursorState> {
        self.remote.get(peer)
    }

    pub fn remote_cursors(&self) -> impl Iterator<Item = &CursorState> {
        self.remote.values()
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    pub fn color(&self) -> CursorColor {
        self.color
    }

    pub fn clear(&mut self) {
        self.remote.clear();
        self.throttle.reset();
    }

    fn stamp(&mut self, position: Vec2) -> CursorState {
        self.sequence += 1;
        CursorState {
            peer_id: self.peer_id,
            display_name: self.display_name.clone(),
            color: self.color,
            position,
            timestamp: self.sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_vec2_distance() {
        assert!((Vec2::new(0.0, 0.0).distance(&Vec2::new(3.0, 4.0)) - 5.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_cursor_color_stable() {
        let id = Uuid::new_v4();
        assert_eq!(CursorColor::from_uuid(id), CursorColor::from_uuid(id));
        let c = CursorColor::from_uuid(id);
        assert!(c.r >= 0.0 && c.r <= 1.0);
        assert_eq!(c.a, 1.0);
        assert_eq!(c.to_hex().len(), 7);
    }

    #[test]
    fn test_throttle_leading_edge() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(50 * MS);
        assert_eq!(throttle.sample(t0, 1), Some(1));
        assert_eq!(throttle.sample(t0 + 10 * MS, 2), None);
        assert_eq!(throttle.sample(t0 + 20 * MS, 3), None);
        assert_eq!(throttle.next_deadline(), Some(t0 + 50 * MS));
    }

    #[test]
    fn test_throttle_trailing_edge_releases_latest() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(50 * MS);
        throttle.sample(t0, 1);
        throttle.sample(t0 + 10 * MS, 2);
        throttle.sample(t0 + 20 * MS, 3);

        assert_eq!(throttle.flush_due(t0 + 49 * MS), None);
        assert_eq!(throttle.flush_due(t0 + 50 * MS), Some(3));
        assert_eq!(throttle.flush_due(t0 + 200 * MS), None);
        assert!(!throttle.has_pending());
    }

    #[test]
    fn test_throttle_spacing_under_burst() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(50 * MS);
        let mut emitted = Vec::new();

        // One sample per millisecond for 300ms, flushing whenever due.
        for i in 0..300u64 {
            let now = t0 + Duration::from_millis(i);
            if let Some(v) = throttle.flush_due(now) {
                emitted.push((now, v));
            }
            if let Some(v) = throttle.sample(now, i) {
                emitted.push((now, v));
            }
        }
        let end = t0 + Duration::from_millis(400);
        if let Some(v) = throttle.flush_due(end) {
            emitted.push((end, v));
        }

        for pair in emitted.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= 50 * MS);
        }
        assert_eq!(emitted.last().map(|e| e.1), Some(299));
    }

    fn present(local: &PresenceMeta, others: &[&PresenceMeta]) -> PresenceManager {
        let mut presence = PresenceManager::new(local.peer_id);
        presence.on_join(local.clone());
        for m in others {
            presence.on_join((*m).clone());
        }
        presence
    }

    fn remote_state(peer: PeerId, timestamp: u64) -> CursorState {
        CursorState {
            peer_id: peer,
            display_name: "Bob".into(),
            color: CursorColor::default(),
            position: Vec2::new(1.0, 1.0),
            timestamp,
        }
    }

    #[test]
    fn test_service_stamps_increase() {
        let local = PresenceMeta::new(PeerId::random(), "Me");
        let mut cursors = CursorService::new(&local, 50 * MS);
        let t0 = Instant::now();

        let first = cursors.pointer_moved(t0, Vec2::new(1.0, 2.0)).unwrap();
        let again = cursors.announce().unwrap();
        assert_eq!(first.peer_id, local.peer_id);
        assert_eq!(again.position, Vec2::new(1.0, 2.0));
        assert!(again.timestamp > first.timestamp);
    }

    #[test]
    fn test_announce_without_pointer_is_none() {
        let local = PresenceMeta::new(PeerId::random(), "Me");
        let mut cursors = CursorService::new(&local, 50 * MS);
        assert!(cursors.announce().is_none());
    }

    #[test]
    fn test_remote_requires_presence() {
        let local = PresenceMeta::new(PeerId::random(), "Me");
        let bob = PresenceMeta::new(PeerId::random(), "Bob");
        let stranger = PeerId::random();
        let presence = present(&local, &[&bob]);
        let mut cursors = CursorService::new(&local, 50 * MS);

        assert!(cursors.on_remote(remote_state(bob.peer_id, 1), &presence));
        assert!(!cursors.on_remote(remote_state(stranger, 1), &presence));
        assert!(!cursors.on_remote(remote_state(local.peer_id, 1), &presence));
        assert_eq!(cursors.remote_count(), 1);
    }

    #[test]
    fn test_stale_remote_update_dropped() {
        let local = PresenceMeta::new(PeerId::random(), "Me");
        let bob = PresenceMeta::new(PeerId::random(), "Bob");
        let presence = present(&local, &[&bob]);
        let mut cursors = CursorService::new(&local, 50 * MS);

        cursors.on_remote(remote_state(bob.peer_id, 5), &presence);
        assert!(!cursors.on_remote(remote_state(bob.peer_id, 4), &presence));
        assert_eq!(cursors.get(&bob.peer_id).map(|c| c.timestamp), Some(5));
    }

    #[test]
    fn test_leave_removes_cursor() {
        let local = PresenceMeta::new(PeerId::random(), "Me");
        let bob = PresenceMeta::new(PeerId::random(), "Bob");
        let presence = present(&local, &[&bob]);
        let mut cursors = CursorService::new(&local, 50 * MS);

        cursors.on_remote(remote_state(bob.peer_id, 1), &presence);
        assert!(cursors.on_leave(&bob.peer_id));
        assert!(!cursors.on_leave(&bob.peer_id));
        assert_eq!(cursors.remote_count(), 0);
    }
}
