//! Runtime configuration for channels and the task queue.
//!
//! All fields are public; `Default` gives the values the fabric was designed around.
//! Prefer the accessor helpers over converting the millisecond fields by hand.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::InvokeError;

/// Settings shared by every auto-reconnecting channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Pause between reconnect attempts, in milliseconds.
    ///
    /// Keeps a dead peer from turning the channel into a busy loop.
    pub retry_delay_ms: u64,

    /// Longest record accepted from the peer, in bytes, not counting the newline.
    ///
    /// A longer record is reported as out of sync and the stream is replaced.
    pub max_frame_bytes: usize,
}

impl ChannelConfig {
    #[inline]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1_000,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// What the queue does with a task the chosen machine refused for lack of executors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectionPolicy {
    /// Log and forget the task.
    #[default]
    Drop,
    /// Put the task back at its position and retry on a later walk.
    Requeue,
}

/// Settings for [`crate::TaskQueue`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Sleep while the queue is empty, in milliseconds. An enqueue wakes the loop early.
    pub idle_interval_ms: u64,
    /// Sleep after a walk that dispatched nothing while tasks remain, in milliseconds.
    pub busy_pause_ms: u64,
    pub on_rejected: RejectionPolicy,
}

impl QueueConfig {
    #[inline]
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    #[inline]
    pub fn busy_pause(&self) -> Duration {
        Duration::from_millis(self.busy_pause_ms)
    }

    /// Rejects zero intervals, which would make the loop spin.
    pub fn validate(&self) -> Result<(), InvokeError> {
        if self.idle_interval_ms == 0 {
            return Err(InvokeError::InvalidSpec(
                "queue idle_interval_ms must be > 0".into(),
            ));
        }
        if self.busy_pause_ms == 0 {
            return Err(InvokeError::InvalidSpec(
                "queue busy_pause_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: 5_000,
            busy_pause_ms: 250,
            on_rejected: RejectionPolicy::Drop,
        }
    }
}
