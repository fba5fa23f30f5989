//! Gradient health probes and outlier rescaling of gradient norms.

use crate::utils::config::DynamicGradientScalingConfig;
use crate::utils::error::Result;
use candle_core::{DType, Tensor};
use tracing::debug;

/// Running statistics of gradient norms as kept by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct NormStats {
    pub window: usize,
    pub mean: f32,
    pub variance: f32,
}

/// Count NaN and Inf entries of `tensor`.
pub fn probe_non_finite(tensor: &Tensor) -> Result<(usize, usize)> {
    let values = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let nan = values.iter().filter(|v| v.is_nan()).count();
    let inf = values.iter().filter(|v| v.is_infinite()).count();
    Ok((nan, inf))
}

/// L2 norm of `tensor`, accumulated in f32.
pub fn l2_norm(tensor: &Tensor) -> Result<f32> {
    let sum = tensor
        .to_dtype(DType::F32)?
        .sqr()?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(sum.sqrt())
}

/// Decides whether an update's gradient norm is an outlier.
#[derive(Debug, Clone)]
pub struct GradientNormRescaler {
    enabled: bool,
    factor: f32,
    use_logs: bool,
}

impl GradientNormRescaler {
    pub fn new(config: &DynamicGradientScalingConfig) -> Self {
        Self {
            enabled: config.enabled,
            factor: config.factor,
            use_logs: config.use_logs,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn use_logs(&self) -> bool {
        self.use_logs
    }

    /// Extra normalization for an outlier update, `None` when the update is
    /// within `factor` standard deviations of the running mean.
    ///
    /// `g_norm` is the raw norm of the summed gradient; it is divided by the
    /// cost-scale factor and the update's target words before comparison.
    /// `stats` must be of log norms when `use_logs` is set.
    pub fn rescale(
        &self,
        g_norm: f32,
        cost_scale: f32,
        target_words: f32,
        stats: NormStats,
        batches_seen: usize,
    ) -> Option<f32> {
        if !self.enabled || !g_norm.is_finite() {
            return None;
        }

        let mut g_norm = g_norm;
        if cost_scale > 0.0 {
            g_norm /= cost_scale;
        }
        if target_words > 0.0 {
            g_norm /= target_words;
        }

        let transformed = if self.use_logs { g_norm.ln() } else { g_norm };
        let delta = transformed - stats.mean;
        let std = stats.variance.max(0.0).sqrt();

        if batches_seen < stats.window || !(delta > self.factor * std) {
            return None;
        }

        let mean = if self.use_logs {
            stats.mean.exp()
        } else {
            stats.mean
        };
        if mean <= 0.0 || !mean.is_finite() {
            return None;
        }

        let correction = g_norm / mean;
        debug!(
            g_norm = g_norm,
            mean = mean,
            delta = delta,
            std = std,
            correction = correction,
            "Gradient norm outlier, rescaling update"
        );
        Some(correction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn rescaler(use_logs: bool) -> GradientNormRescaler {
        GradientNormRescaler::new(&DynamicGradientScalingConfig {
            enabled: true,
            factor: 2.0,
            use_logs,
            window: 10,
        })
    }

    #[test]
    fn test_probe_and_norm() -> Result<()> {
        let t = Tensor::new(&[3.0f32, 4.0], &Device::Cpu)?;
        assert_eq!(probe_non_finite(&t)?, (0, 0));
        assert_eq!(l2_norm(&t)?, 5.0);

        let bad = Tensor::new(&[f32::NAN, f32::INFINITY, 1.0], &Device::Cpu)?;
        assert_eq!(probe_non_finite(&bad)?, (1, 1));
        Ok(())
    }

    #[test]
    fn test_no_rescale_before_window() {
        let stats = NormStats { window: 10, mean: 1.0, variance: 0.01 };
        assert_eq!(rescaler(false).rescale(100.0, 1.0, 1.0, stats, 5), None);
    }

    #[test]
    fn test_outlier_is_rescaled() {
        let stats = NormStats { window: 10, mean: 1.0, variance: 0.01 };
        let correction = rescaler(false).rescale(50.0, 1.0, 10.0, stats, 10);
        assert_eq!(correction, Some(5.0));
    }

    #[test]
    fn test_non_finite_norm_skips() {
        let stats = NormStats { window: 1, mean: 1.0, variance: 0.0 };
        assert_eq!(rescaler(false).rescale(f32::NAN, 1.0, 1.0, stats, 10), None);
        assert_eq!(rescaler(true).rescale(f32::INFINITY, 1.0, 1.0, stats, 10), None);
    }

    #[test]
    fn test_invariant_to_cost_scale() {
        let stats = NormStats { window: 1, mean: 0.0, variance: 0.25 };
        let r = rescaler(true);
        let base = r.rescale(8.0, 1.0, 2.0, stats, 1);
        let scaled = r.rescale(8.0 * 1024.0, 1024.0, 2.0, stats, 1);
        assert!(base.is_some());
        assert_eq!(base, scaled);
    }
}
