//! Adaptive loss scaling for reduced-precision gradients.
//!
//! The loss is multiplied by `factor` before backward and the gradient is
//! divided by it again before the optimizer step. The factor grows after a
//! run of clean updates and shrinks when too many updates overflow.

use crate::utils::config::CostScalingConfig;
use crate::utils::metrics;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CostScaler {
    enabled: bool,
    factor: f32,
    frequency: usize,
    multiplier: f32,
    nan_tolerance: f32,
    nan_range: usize,
    factor_minimum: f32,
    nan_seen: usize,
    no_nan_seen: usize,
}

impl CostScaler {
    pub fn new(config: &CostScalingConfig) -> Self {
        let scaler = Self {
            enabled: config.enabled,
            factor: config.initial_factor(),
            frequency: config.frequency.max(1),
            multiplier: config.multiplier,
            nan_tolerance: config.nan_tolerance,
            nan_range: config.nan_range,
            factor_minimum: config.factor_minimum,
            nan_seen: 0,
            no_nan_seen: 0,
        };
        if scaler.enabled {
            info!(
                factor = scaler.factor,
                frequency = scaler.frequency,
                multiplier = scaler.multiplier,
                nan_tolerance = scaler.nan_tolerance,
                nan_range = scaler.nan_range,
                minimum = scaler.factor_minimum,
                "Cost scaling enabled"
            );
            metrics::record_cost_scale_factor(scaler.factor);
        }
        scaler
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current multiplier, 1 when scaling is off.
    pub fn factor(&self) -> f32 {
        if self.enabled {
            self.factor
        } else {
            1.0
        }
    }

    /// `(nan_seen, no_nan_seen)` since the last factor change.
    pub fn counters(&self) -> (usize, usize) {
        (self.nan_seen, self.no_nan_seen)
    }

    /// Share of overflowing updates since the last factor change.
    pub fn nan_percent(&self) -> f32 {
        let total = self.nan_seen + self.no_nan_seen;
        if total == 0 {
            0.0
        } else {
            self.nan_seen as f32 / total as f32
        }
    }

    /// Call after an update with finite gradients.
    pub fn increase_factor(&mut self) {
        if !self.enabled {
            return;
        }

        self.no_nan_seen += 1;
        if self.no_nan_seen % self.frequency == 0 {
            let nan_percent = self.nan_percent();
            self.factor *= self.multiplier;
            info!(
                factor = self.factor,
                nan_percent = nan_percent,
                clean_updates = self.no_nan_seen,
                "Increasing cost-scaling factor"
            );
            self.reset_counters();
            metrics::record_cost_scale_factor(self.factor);
        }
    }

    /// Call after an update whose gradients contained NaN or Inf.
    pub fn decrease_factor(&mut self) {
        if !self.enabled {
            return;
        }

        self.nan_seen += 1;
        let total = self.nan_seen + self.no_nan_seen;
        let nan_percent = self.nan_percent();

        if total >= self.nan_range && nan_percent > self.nan_tolerance {
            if self.factor > self.factor_minimum {
                self.factor = (self.factor / self.multiplier).max(self.factor_minimum);
                info!(
                    factor = self.factor,
                    nan_percent = nan_percent,
                    "Decreasing cost-scaling factor"
                );
                metrics::record_cost_scale_factor(self.factor);
            } else {
                warn!(
                    factor = self.factor,
                    minimum = self.factor_minimum,
                    nan_percent = nan_percent,
                    "Cost-scaling factor is already at its minimum, continuing with overflowing gradients"
                );
            }
            self.reset_counters();
        }
    }

    fn reset_counters(&mut self) {
        self.nan_seen = 0;
        self.no_nan_seen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaler(frequency: usize, tolerance: f32, range: usize, minimum: f32) -> CostScaler {
        CostScaler::new(&CostScalingConfig {
            enabled: true,
            exponent: 3.0,
            frequency,
            multiplier: 2.0,
            nan_tolerance: tolerance,
            nan_range: range,
            factor_minimum: minimum,
        })
    }

    #[test]
    fn test_disabled_is_noop() {
        let mut s = CostScaler::new(&CostScalingConfig::default());
        s.increase_factor();
        s.decrease_factor();
        assert_eq!(s.factor(), 1.0);
        assert_eq!(s.counters(), (0, 0));
    }

    #[test]
    fn test_increase_every_frequency() {
        let mut s = scaler(4, 0.0, 1, 1.0);
        for _ in 0..4 {
            s.increase_factor();
        }
        assert_eq!(s.factor(), 16.0);
        assert_eq!(s.counters(), (0, 0));

        s.increase_factor();
        assert_eq!(s.factor(), 16.0);
        assert_eq!(s.counters(), (0, 1));
    }

    #[test]
    fn test_decrease_respects_minimum() {
        let mut s = scaler(100, 0.0, 1, 4.0);
        s.decrease_factor();
        assert_eq!(s.factor(), 4.0);
        s.decrease_factor();
        assert_eq!(s.factor(), 4.0);
        assert_eq!(s.counters(), (0, 0));
    }

    #[test]
    fn test_tolerance_boundary_is_exclusive() {
        let mut s = scaler(1000, 0.3, 10, 1.0);
        for _ in 0..7 {
            s.increase_factor();
        }
        for _ in 0..3 {
            s.decrease_factor();
        }
        assert_eq!(s.nan_percent(), 0.3);
        assert_eq!(s.factor(), 8.0);
        assert_eq!(s.counters(), (3, 7));

        s.decrease_factor();
        assert_eq!(s.factor(), 4.0);
        assert_eq!(s.counters(), (0, 0));
    }

    #[test]
    fn test_nan_percent_bounds() {
        let mut s = scaler(1000, 0.9, 1000, 1.0);
        assert_eq!(s.nan_percent(), 0.0);
        s.decrease_factor();
        assert_eq!(s.nan_percent(), 1.0);
        s.increase_factor();
        assert_eq!(s.nan_percent(), 0.5);
    }
}
