//! Reconnection state machine with jittered exponential backoff.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Connection lifecycle as seen by the reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Symmetric jitter fraction: a delay d is drawn uniformly from
    /// [d*(1-jitter/2), d*(1+jitter/2)].
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Tracks attempts and computes the next wait. The driving loop owns the
/// actual sleeping and connecting.
pub struct ReconnectController {
    policy: ReconnectPolicy,
    state: ConnectionState,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current_delay = policy.initial_delay;
        Self {
            policy,
            state: ConnectionState::Disconnected,
            current_delay,
            attempt_count: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Undecorated delay of the current attempt, before jitter.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn on_connecting(&mut self) {
        if self.state != ConnectionState::Stopped {
            self.state = ConnectionState::Connecting;
        }
    }

    /// A session reached OPEN; backoff starts over on the next failure.
    pub fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.current_delay = self.policy.initial_delay;
        self.attempt_count = 0;
    }

    /// Record a failed attempt (or a lost session) and return how long to
    /// wait before the next one. `None` means reconnection is disabled and
    /// the machine has stopped.
    pub fn on_failure(&mut self) -> Option<Duration> {
        if !self.policy.enabled {
            self.state = ConnectionState::Stopped;
            return None;
        }

        self.attempt_count += 1;
        if self.attempt_count > 1 {
            let grown = self.current_delay.as_secs_f64() * self.policy.multiplier;
            self.current_delay = self
                .policy
                .max_delay
                .min(Duration::from_secs_f64(grown));
        }
        self.state = ConnectionState::Backoff;

        let delay = self.jittered(self.current_delay);
        debug!(
            attempt = self.attempt_count,
            delay_ms = delay.as_millis() as u64,
            "backing off"
        );
        Some(delay)
    }

    pub fn stop(&mut self) {
        self.state = ConnectionState::Stopped;
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.policy.jitter <= 0.0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        let factor = 1.0 + self.policy.jitter * (rng.gen::<f64>() - 0.5);
        Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
    }
}
