//! Additive-increase/additive-decrease rate controller

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::queue::QueueConfig;

/// A change of the rate ceiling
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjustment {
    Decreased { rps: f64, failure_rate: f64 },
    Increased { rps: f64, success_rate: f64 },
}

/// Tracks recent outcomes in a fixed-size window and moves the
/// requests-per-second ceiling by a fixed step.
///
/// The ceiling only changes when the window is full and the cooldown since
/// the last change has elapsed. Failure wins over success when both
/// thresholds are met.
#[derive(Debug, Clone)]
pub struct RateController {
    min_rps: f64,
    max_rps: f64,
    current_rps: f64,
    window: VecDeque<bool>,
    window_size: usize,
    success_threshold: f64,
    failure_threshold: f64,
    step: f64,
    cooldown: Duration,
    last_adjustment: Instant,
}

impl RateController {
    /// Create a controller. The cooldown starts counting at `now`.
    pub fn new(config: &QueueConfig, now: Instant) -> Self {
        Self {
            min_rps: config.min_rps,
            max_rps: config.max_rps,
            current_rps: config.initial_rps.clamp(config.min_rps, config.max_rps),
            window: VecDeque::with_capacity(config.window_size),
            window_size: config.window_size,
            success_threshold: config.success_threshold,
            failure_threshold: config.failure_threshold,
            step: config.adjustment_size,
            cooldown: config.adjustment_cooldown(),
            last_adjustment: now,
        }
    }

    pub fn current_rps(&self) -> f64 {
        self.current_rps
    }

    /// Record one outcome and adjust the ceiling if warranted
    pub fn record(&mut self, success: bool, now: Instant) -> Option<Adjustment> {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(success);
        self.maybe_adjust(now)
    }

    fn maybe_adjust(&mut self, now: Instant) -> Option<Adjustment> {
        if self.window.len() < self.window_size {
            return None;
        }
        if now.saturating_duration_since(self.last_adjustment) < self.cooldown {
            return None;
        }

        let successes = self.window.iter().filter(|ok| **ok).count();
        let success_rate = successes as f64 / self.window.len() as f64;
        let failure_rate = 1.0 - success_rate;

        if failure_rate >= self.failure_threshold {
            let rps = (self.current_rps - self.step).max(self.min_rps);
            self.apply(rps, now)
                .then_some(Adjustment::Decreased { rps, failure_rate })
        } else if success_rate >= self.success_threshold {
            let rps = (self.current_rps + self.step).min(self.max_rps);
            self.apply(rps, now)
                .then_some(Adjustment::Increased { rps, success_rate })
        } else {
            None
        }
    }

    /// Returns false when the ceiling is already at the bound; the cooldown
    /// is left untouched in that case.
    fn apply(&mut self, rps: f64, now: Instant) -> bool {
        if rps == self.current_rps {
            return false;
        }
        self.current_rps = rps;
        self.last_adjustment = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QueueConfig {
        QueueConfig {
            min_rps: 1.0,
            max_rps: 3.0,
            initial_rps: 2.0,
            window_size: 4,
            success_threshold: 0.75,
            failure_threshold: 0.25,
            adjustment_size: 0.5,
            adjustment_cooldown_secs: 5.0,
            ..QueueConfig::default()
        }
    }

    fn after_cooldown(start: Instant) -> Instant {
        start + Duration::from_secs(5)
    }

    #[test]
    fn test_initial_rps_is_clamped() {
        let now = Instant::now();
        let mut cfg = config();
        cfg.initial_rps = 10.0;
        assert_eq!(RateController::new(&cfg, now).current_rps(), 3.0);
        cfg.initial_rps = 0.1;
        assert_eq!(RateController::new(&cfg, now).current_rps(), 1.0);
    }

    #[test]
    fn test_no_adjustment_until_window_full() {
        let start = Instant::now();
        let mut rc = RateController::new(&config(), start);
        let later = after_cooldown(start);
        for _ in 0..3 {
            assert_eq!(rc.record(false, later), None);
        }
        assert_eq!(rc.current_rps(), 2.0);
        assert!(rc.record(false, later).is_some());
    }

    #[test]
    fn test_failures_decrease_by_one_step() {
        let start = Instant::now();
        let mut rc = RateController::new(&config(), start);
        let later = after_cooldown(start);
        let mut last = None;
        for _ in 0..4 {
            last = rc.record(false, later);
        }
        assert_eq!(
            last,
            Some(Adjustment::Decreased {
                rps: 1.5,
                failure_rate: 1.0
            })
        );
        assert_eq!(rc.current_rps(), 1.5);
    }

    #[test]
    fn test_successes_increase_by_one_step() {
        let start = Instant::now();
        let mut rc = RateController::new(&config(), start);
        let later = after_cooldown(start);
        for _ in 0..4 {
            rc.record(true, later);
        }
        assert_eq!(rc.current_rps(), 2.5);
    }

    #[test]
    fn test_cooldown_blocks_adjustment() {
        let start = Instant::now();
        let mut rc = RateController::new(&config(), start);
        for _ in 0..4 {
            assert_eq!(rc.record(false, start + Duration::from_secs(1)), None);
        }
        assert_eq!(rc.current_rps(), 2.0);

        // Once the cooldown elapsed, the next outcome triggers the change
        let later = after_cooldown(start);
        assert!(rc.record(false, later).is_some());
        // and resets the cooldown
        assert_eq!(rc.record(false, later), None);
        assert_eq!(rc.current_rps(), 1.5);
    }

    #[test]
    fn test_failure_takes_precedence() {
        // One failure in four: success rate 0.75 meets the success threshold,
        // failure rate 0.25 meets the failure threshold
        let start = Instant::now();
        let mut rc = RateController::new(&config(), start);
        let later = after_cooldown(start);
        rc.record(true, later);
        rc.record(true, later);
        rc.record(true, later);
        assert!(matches!(
            rc.record(false, later),
            Some(Adjustment::Decreased { .. })
        ));
    }

    #[test]
    fn test_bounds_do_not_reset_cooldown() {
        let start = Instant::now();
        let mut cfg = config();
        cfg.initial_rps = 1.0;
        let mut rc = RateController::new(&cfg, start);
        let later = after_cooldown(start);
        for _ in 0..4 {
            assert_eq!(rc.record(false, later), None);
        }
        assert_eq!(rc.current_rps(), 1.0);
        // Cooldown untouched, so a full window of successes acts immediately
        for _ in 0..3 {
            rc.record(true, later);
        }
        assert!(matches!(
            rc.record(true, later),
            Some(Adjustment::Increased { .. })
        ));
        assert_eq!(rc.current_rps(), 1.5);
    }

    #[test]
    fn test_ceiling_stays_within_bounds() {
        let mut cfg = config();
        cfg.adjustment_cooldown_secs = 0.0;
        cfg.adjustment_size = 0.7;
        let start = Instant::now();
        let mut rc = RateController::new(&cfg, start);

        // Deterministic pseudo-random outcome sequence with bursty phases
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for i in 0..5_000u64 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let bias = if (i / 250) % 2 == 0 { 8 } else { 2 };
            let success = seed % 10 < bias;
            rc.record(success, start + Duration::from_millis(i));
            let rps = rc.current_rps();
            assert!((cfg.min_rps..=cfg.max_rps).contains(&rps), "rps {rps} out of bounds");
        }
    }
}
