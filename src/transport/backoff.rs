//! Reconnect backoff ladder

use std::time::Duration;

use crate::constants::MAX_RECONNECT_ATTEMPTS;

/// Fixed delays before each reconnect attempt; the last rung repeats
const LADDER_MS: [u64; 5] = [500, 1_000, 2_000, 5_000, 10_000];

/// How many times and how patiently the transport reconnects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    ladder: Vec<Duration>,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ladder: LADDER_MS.iter().map(|&ms| Duration::from_millis(ms)).collect(),
        }
    }

    /// Replace the ladder. An empty ladder means reconnecting immediately.
    pub fn with_ladder(mut self, ladder: Vec<Duration>) -> Self {
        self.ladder = ladder;
        self
    }

    /// Delay before attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.ladder.len().saturating_sub(1));
        self.ladder.get(index).copied().unwrap_or(Duration::ZERO)
    }

    /// Whether attempt `attempt` (0-based) may still be made
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(MAX_RECONNECT_ATTEMPTS)
    }
}
