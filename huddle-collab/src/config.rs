//! Session tuning knobs.

use std::time::Duration;

use huddle_core::EphemeralTags;

/// Configuration for one [`RoomSession`](crate::session::RoomSession).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Minimum spacing between outbound cursor broadcasts.
    pub cursor_interval: Duration,
    /// Retry delay grows linearly: `retry_base_delay × attempt`.
    pub retry_base_delay: Duration,
    /// Consecutive failures before the channel is given up.
    pub max_retries: u32,
    /// Upper bound on a single subscribe attempt.
    pub subscribe_timeout: Duration,
    /// How long a tombstone outlives its delete.
    pub tombstone_ttl: Duration,
    /// How often expired tombstones are swept.
    pub prune_interval: Duration,
    /// Type tags that never reach the durable store.
    pub ephemeral_tags: EphemeralTags,
    /// Buffered notices before the oldest consumer falls behind.
    pub notice_capacity: usize,
    /// Durable writes held while the channel is down.
    pub offline_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cursor_interval: Duration::from_millis(50),
            retry_base_delay: Duration::from_secs(1),
            max_retries: 5,
            subscribe_timeout: Duration::from_secs(10),
            tombstone_ttl: Duration::from_secs(300),
            prune_interval: Duration::from_secs(60),
            ephemeral_tags: EphemeralTags::default(),
            notice_capacity: 256,
            offline_queue_capacity: 10_000,
        }
    }
}

impl SessionConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            cursor_interval: Duration::from_millis(20),
            retry_base_delay: Duration::from_millis(10),
            max_retries: 3,
            subscribe_timeout: Duration::from_millis(500),
            tombstone_ttl: Duration::from_millis(200),
            prune_interval: Duration::from_millis(100),
            ephemeral_tags: EphemeralTags::default(),
            notice_capacity: 1024,
            offline_queue_capacity: 64,
        }
    }
}
