//! Tunables for the controller and its reconnect policy.

use std::time::Duration;

/// Per-controller configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period before coalesced edits are written
    pub debounce: Duration,
    /// Presence heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Trailing window for "currently active" participants
    pub presence_window: Duration,
    /// Resubscribe policy after a dropped subscription
    pub reconnect: BackoffConfig,
    /// Capacity of the controller's event channel
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(30),
            presence_window: Duration::from_secs(5 * 60),
            reconnect: BackoffConfig::default(),
            event_buffer: 256,
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

/// Stateful delay sequence derived from a [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, next: config.initial, attempts: 0 }
    }

    /// Delay before the next attempt; grows until capped at `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.config.max);
        self.next = self
            .next
            .saturating_mul(self.config.multiplier.max(1))
            .min(self.config.max);
        self.attempts += 1;
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.next = self.config.initial;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce, Duration::from_millis(1000));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.presence_window, Duration::from_secs(300));
        assert_eq!(config.event_buffer, 256);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(3),
            multiplier: 2,
        });
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }
}
