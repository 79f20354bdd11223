//! Channel lifecycle and bounded retry.
//!
//! ```text
//!            subscribe ok            Error / Timeout (n < max)
//!  Connecting ───────────► Connected ─────────────────────────► Retrying
//!      ▲                       ▲                                   │
//!      │                       └──────── Connected ◄───────────────┤ after base × n
//!      │                                                           │
//!      └── manual reconnect (n := 0)      Error / Timeout (n = max)▼
//!                                                           Disconnected
//! ```
//!
//! The state machine is pure: callers feed it statuses and the current
//! instant, and act on the returned [`RetryDecision`]. An attempt that has
//! not reached `Connected` by its deadline is reported by
//! [`ChannelSession::connect_overdue`]; the caller feeds it back as `Timeout`.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use huddle_core::{Mutation, RoomId};

use crate::channel::ChannelStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries,
        }
    }

    /// Linear backoff: `base × attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Nothing to schedule.
    Idle,
    RetryAfter(Duration),
    /// Retries exhausted; the channel stays down until a manual reconnect.
    GiveUp,
}

/// Reconnection bookkeeping for one room channel.
#[derive(Debug, Clone)]
pub struct ChannelSession {
    room: RoomId,
    status: ChannelStatus,
    retry_count: u32,
    retry_at: Option<Instant>,
    connect_deadline: Option<Instant>,
    policy: ReconnectPolicy,
}

impl ChannelSession {
    pub fn new(room: RoomId, policy: ReconnectPolicy) -> Self {
        Self {
            room,
            status: ChannelStatus::Connecting,
            retry_count: 0,
            retry_at: None,
            connect_deadline: None,
            policy,
        }
    }

    /// Fold a channel status into the lifecycle.
    pub fn on_status(&mut self, status: ChannelStatus, now: Instant) -> RetryDecision {
        if status != ChannelStatus::Connecting {
            self.connect_deadline = None;
        }
        match status {
            ChannelStatus::Connected => {
                self.retry_count = 0;
                self.retry_at = None;
                self.status = ChannelStatus::Connected;
                RetryDecision::Idle
            }
            ChannelStatus::Error | ChannelStatus::Timeout => {
                if self.status == ChannelStatus::Disconnected {
                    return RetryDecision::Idle;
                }
                self.retry_count += 1;
                if self.retry_count >= self.policy.max_retries {
                    self.status = ChannelStatus::Disconnected;
                    self.retry_at = None;
                    RetryDecision::GiveUp
                } else {
                    let delay = self.policy.delay_for(self.retry_count);
                    self.status = ChannelStatus::Retrying;
                    self.retry_at = Some(now + delay);
                    RetryDecision::RetryAfter(delay)
                }
            }
            other => {
                self.status = other;
                RetryDecision::Idle
            }
        }
    }

    /// A scheduled retry whose delay has elapsed.
    pub fn retry_due(&self, now: Instant) -> bool {
        matches!(self.retry_at, Some(at) if at <= now)
    }

    /// Start an attempt that must reach `Connected` by `deadline`.
    pub fn begin_attempt(&mut self, deadline: Instant) {
        self.retry_at = None;
        self.connect_deadline = Some(deadline);
        self.status = ChannelStatus::Connecting;
    }

    /// The current attempt ran out of time without `Connected`.
    pub fn connect_overdue(&self, now: Instant) -> bool {
        self.status == ChannelStatus::Connecting
            && matches!(self.connect_deadline, Some(at) if at <= now)
    }

    /// User-initiated reconnect: the failure budget starts over.
    pub fn manual_reset(&mut self) {
        self.retry_count = 0;
        self.retry_at = None;
        self.connect_deadline = None;
        self.status = ChannelStatus::Connecting;
    }

    /// Room left; nothing is retried after this.
    pub fn close(&mut self) {
        self.retry_at = None;
        self.connect_deadline = None;
        self.status = ChannelStatus::Disconnected;
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn connect_deadline(&self) -> Option<Instant> {
        self.connect_deadline
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }
}

/// Durable writes made while the channel is down.
///
/// Queued writes are replayed once the channel reports `Connected`. A newer
/// write to the same record replaces the queued one in place.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<Mutation>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns `false` if the queue is full.
    pub fn enqueue(&mut self, mutation: Mutation) -> bool {
        if let Some(slot) = self.queue.iter_mut().find(|m| m.id() == mutation.id()) {
            if mutation.stamp() > slot.stamp() {
                *slot = mutation;
            }
            return true;
        }
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(mutation);
        true
    }

    pub fn drain(&mut self) -> Vec<Mutation> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
