use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Blocking requests until the recovery timeout elapses.
    Open,
    /// One probe request allowed through to test recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed before the circuit opens.
    pub failure_threshold: u32,
    /// How long Open blocks before permitting a probe.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_millis(30_000),
        }
    }
}

/// A state transition, reported so callers can emit `stateChange` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Three-state circuit breaker. State is a pure function of the ordered
/// (success | failure | probe) sequence and the configured thresholds; the
/// clock enters only through the `now` arguments.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether a request may proceed. In Open, the recovery timeout elapsing
    /// moves the breaker to HalfOpen and admits exactly one probe.
    pub fn try_acquire(&mut self, now: Instant) -> Result<Option<StateChange>, ()> {
        match self.state {
            CircuitState::Closed => Ok(None),
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Err(())
                } else {
                    self.probe_in_flight = true;
                    Ok(None)
                }
            }
            CircuitState::Open => {
                let opened_at = match self.opened_at {
                    Some(at) => at,
                    None => {
                        // Defensive bookkeeping never blocks recovery.
                        self.opened_at = Some(now);
                        now
                    }
                };
                if now.saturating_duration_since(opened_at) >= self.config.recovery_timeout {
                    let change = self.transition(CircuitState::HalfOpen);
                    self.probe_in_flight = true;
                    Ok(change)
                } else {
                    Err(())
                }
            }
        }
    }

    pub fn record_success(&mut self, _now: Instant) -> Option<StateChange> {
        match self.state {
            CircuitState::HalfOpen => {
                // Probe succeeded: close and reset counts.
                self.failure_count = 0;
                self.opened_at = None;
                self.probe_in_flight = false;
                self.transition(CircuitState::Closed)
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::Open => None,
        }
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<StateChange> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.opened_at = Some(now);
                    self.transition(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed: reopen and restart the recovery clock.
                self.opened_at = Some(now);
                self.probe_in_flight = false;
                self.transition(CircuitState::Open)
            }
            CircuitState::Open => None,
        }
    }

    /// Return to Closed with zeroed counts.
    pub fn reset(&mut self) -> Option<StateChange> {
        self.failure_count = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
        self.transition(CircuitState::Closed)
    }

    fn transition(&mut self, to: CircuitState) -> Option<StateChange> {
        if self.state == to {
            return None;
        }
        let change = StateChange {
            from: self.state,
            to,
        };
        tracing::debug!(
            from = change.from.as_str(),
            to = change.to.as_str(),
            failures = self.failure_count,
            "circuit breaker transition"
        );
        self.state = to;
        Some(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
        })
    }

    #[test]
    fn opens_at_failure_threshold() {
        let now = Instant::now();
        let mut cb = breaker(3, 30_000);
        assert!(cb.record_failure(now).is_none());
        assert!(cb.record_failure(now).is_none());
        let change = cb.record_failure(now).unwrap();
        assert_eq!(change.to, CircuitState::Open);
        assert!(cb.try_acquire(now).is_err());
    }

    #[test]
    fn success_resets_closed_failure_count() {
        let now = Instant::now();
        let mut cb = breaker(3, 30_000);
        cb.record_failure(now);
        cb.record_failure(now);
        cb.record_success(now);
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn recovery_timeout_permits_single_probe() {
        let now = Instant::now();
        let mut cb = breaker(1, 1_000);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);

        let later = now + Duration::from_millis(1_001);
        let change = cb.try_acquire(later).unwrap().unwrap();
        assert_eq!(change.to, CircuitState::HalfOpen);
        // Only one probe until it resolves.
        assert!(cb.try_acquire(later).is_err());
    }

    #[test]
    fn probe_success_closes() {
        let now = Instant::now();
        let mut cb = breaker(1, 1_000);
        cb.record_failure(now);
        let later = now + Duration::from_millis(1_500);
        cb.try_acquire(later).unwrap();
        let change = cb.record_success(later).unwrap();
        assert_eq!(change.to, CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn probe_failure_reopens_and_restarts_clock() {
        let now = Instant::now();
        let mut cb = breaker(1, 1_000);
        cb.record_failure(now);
        let probe_at = now + Duration::from_millis(1_200);
        cb.try_acquire(probe_at).unwrap();
        let change = cb.record_failure(probe_at).unwrap();
        assert_eq!(change.to, CircuitState::Open);
        // Clock restarted at the probe failure, not the original open.
        assert!(cb.try_acquire(probe_at + Duration::from_millis(900)).is_err());
        assert!(cb
            .try_acquire(probe_at + Duration::from_millis(1_100))
            .is_ok());
    }

    #[test]
    fn reset_returns_to_closed() {
        let now = Instant::now();
        let mut cb = breaker(1, 60_000);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);
        let change = cb.reset().unwrap();
        assert_eq!(change.to, CircuitState::Closed);
        assert!(cb.try_acquire(now).is_ok());
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn state_is_function_of_event_sequence() {
        // Same ordered event sequence twice yields the same states.
        let run = |events: &[bool]| -> Vec<CircuitState> {
            let t0 = Instant::now();
            let mut cb = breaker(2, 1_000);
            events
                .iter()
                .enumerate()
                .map(|(i, ok)| {
                    let now = t0 + Duration::from_millis(i as u64 * 10);
                    if *ok {
                        cb.record_success(now);
                    } else {
                        cb.record_failure(now);
                    }
                    cb.state()
                })
                .collect()
        };
        let seq = [false, true, false, false, false];
        assert_eq!(run(&seq), run(&seq));
    }
}
