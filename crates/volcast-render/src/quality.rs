use glam::{DMat4, DVec3, UVec2};
use volcast_core::config::MapperConfig;
use volcast_core::constants::{
    REDUCTION_FLOOR, REDUCTION_GROW_RATIO, REDUCTION_SHRINK_RATIO, REDUCTION_SNAP_THRESHOLD,
};
use volcast_core::math::min_world_spacing;
use volcast_core::types::Viewport;

/// Trades image resolution for frame time.
///
/// The reduction factor is the fraction of full resolution rendered. It is
/// learned from the previous frame's draw time and the budget for this one,
/// with a hysteresis band so the image does not pulse between sizes.
#[derive(Debug, Clone)]
pub struct QualityController {
    factor: f64,
    adjusted: bool,
}

impl QualityController {
    pub fn new() -> Self {
        Self {
            factor: 1.0,
            adjusted: false,
        }
    }

    pub fn reduction_factor(&self) -> f64 {
        self.factor
    }

    /// Compute the factor for the coming frame.
    ///
    /// `measured_secs` is how long the last frame took to draw and
    /// `allocated_secs` the budget for this one. Canonical views always render
    /// at full resolution.
    ///
    /// Only the first adjustment bypasses the hysteresis band; after that the
    /// band applies at full resolution too, so a frame a few percent over
    /// budget keeps the factor at 1. A blended midpoint above 1 renders at full
    /// resolution (1.0, not just below it), which keeps the full sample rate
    /// of `actual_sample_distance`.
    pub fn update(
        &mut self,
        measured_secs: f64,
        allocated_secs: f64,
        config: &MapperConfig,
        canonical: bool,
    ) -> f64 {
        if canonical {
            self.factor = 1.0;
            return self.factor;
        }
        if !config.auto_adjust_sample_distances {
            self.factor = 1.0 / config.image_sample_distance;
            return self.factor;
        }
        if !(measured_secs.is_finite() && measured_secs > 0.0) {
            self.factor = 1.0;
            return self.factor;
        }
        if !(allocated_secs.is_finite() && allocated_secs > 0.0) {
            return self.factor;
        }

        let old = self.factor;
        let full_resolution_secs = measured_secs / old;
        let candidate = allocated_secs / full_resolution_secs;
        let ratio = candidate / old;
        if self.adjusted && ratio <= REDUCTION_GROW_RATIO && ratio >= REDUCTION_SHRINK_RATIO {
            return self.factor;
        }
        self.adjusted = true;

        let mut factor = (candidate + old) * 0.5;
        if factor > REDUCTION_SNAP_THRESHOLD {
            factor = 1.0;
        }
        factor = factor.clamp(REDUCTION_FLOOR, 1.0);

        let lowest = 1.0 / config.maximum_image_sample_distance;
        let highest = (1.0 / config.minimum_image_sample_distance).min(1.0);
        self.factor = factor.clamp(lowest, highest);
        if self.factor != old {
            log::debug!(
                "QualityController: reduction factor {old:.3} -> {:.3} (drew in {measured_secs:.4}s, budget {allocated_secs:.4}s)",
                self.factor
            );
        }
        self.factor
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for QualityController {
    fn default() -> Self {
        Self::new()
    }
}

/// World-space ray step for a frame.
///
/// Automatic mode steps once per smallest world voxel edge, doubling and then
/// stretching further as the image is reduced.
pub fn actual_sample_distance(
    config: &MapperConfig,
    reduction_factor: f64,
    spacing: DVec3,
    model: &DMat4,
) -> f64 {
    if !config.auto_adjust_sample_distances {
        return config.sample_distance;
    }
    let base = min_world_spacing(spacing, model);
    if reduction_factor < 1.0 {
        base / (reduction_factor * 0.5)
    } else {
        base
    }
}

/// Accumulation target size for a viewport at `reduction_factor`.
pub fn reduced_size(viewport: &Viewport, reduction_factor: f64) -> UVec2 {
    let scale = |n: u32| ((n as f64 * reduction_factor).round() as u32).max(1);
    UVec2::new(scale(viewport.width), scale(viewport.height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auto() -> MapperConfig {
        MapperConfig {
            minimum_image_sample_distance: 1.0,
            maximum_image_sample_distance: 4.0,
            ..MapperConfig::default()
        }
    }

    #[test]
    fn test_fixed_image_sample_distance() {
        let mut q = QualityController::new();
        let config = MapperConfig {
            auto_adjust_sample_distances: false,
            image_sample_distance: 2.0,
            ..MapperConfig::default()
        };
        assert_eq!(q.update(10.0, 0.01, &config, false), 0.5);
        assert_eq!(q.update(0.0, 0.01, &config, false), 0.5);
    }

    #[test]
    fn test_canonical_view_renders_full_resolution() {
        let mut q = QualityController::new();
        q.update(1.0, 0.1, &auto(), false);
        assert!(q.reduction_factor() < 1.0);
        assert_eq!(q.update(1.0, 0.1, &auto(), true), 1.0);
    }

    #[test]
    fn test_slow_frame_reduces_resolution() {
        let mut q = QualityController::new();
        // Candidate 0.25, midpoint 0.625.
        let f = q.update(0.4, 0.1, &auto(), false);
        assert!((f - 0.625).abs() < 1e-12);
    }

    #[test]
    fn test_small_change_is_ignored_after_first_update() {
        let mut q = QualityController::new();
        let first = q.update(0.4, 0.1, &auto(), false);
        // Candidate / old == 1.1, inside the hysteresis band.
        let measured = 0.1 * first / (first * 1.1);
        assert_eq!(q.update(measured, 0.1, &auto(), false), first);
    }

    #[test]
    fn test_full_resolution_is_sticky_inside_band() {
        let mut q = QualityController::new();
        // Candidate 1.5, midpoint 1.25: clamps to exactly 1.
        assert_eq!(q.update(0.1, 0.15, &auto(), false), 1.0);
        // Candidate 0.97 is within the shrink band of 1.0.
        assert_eq!(q.update(0.1, 0.097, &auto(), false), 1.0);
        // Candidate 0.9 leaves the band: midpoint 0.95.
        let f = q.update(0.1, 0.09, &auto(), false);
        assert!((f - 0.95).abs() < 1e-12, "{f}");
    }

    #[test]
    fn test_huge_budget_snaps_to_full_resolution() {
        let mut q = QualityController::new();
        q.update(0.4, 0.1, &auto(), false);
        assert_eq!(q.update(0.001, 10.0, &auto(), false), 1.0);
    }

    #[test]
    fn test_missing_measurement_resets_factor() {
        let mut q = QualityController::new();
        q.update(0.4, 0.1, &auto(), false);
        assert_eq!(q.update(0.0, 0.1, &auto(), false), 1.0);
        q.update(0.4, 0.1, &auto(), false);
        let before = q.reduction_factor();
        assert_eq!(q.update(0.4, 0.0, &auto(), false), before);
    }

    #[test]
    fn test_factor_stays_within_sample_distance_range() {
        let config = auto();
        let mut q = QualityController::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            (seed % 10_000) as f64 / 1000.0
        };
        for _ in 0..10_000 {
            let measured = next();
            let allocated = next();
            let f = q.update(measured, allocated, &config, false);
            assert!(f > 0.0 && f <= 1.0, "factor {f}");
            let distance = 1.0 / f;
            assert!(
                distance >= config.minimum_image_sample_distance - 1e-12
                    && distance <= config.maximum_image_sample_distance + 1e-12,
                "distance {distance}"
            );
        }
    }

    #[test]
    fn test_actual_sample_distance() {
        let config = MapperConfig::default();
        let model = DMat4::from_scale(DVec3::new(2.0, 3.0, 4.0));
        assert_eq!(actual_sample_distance(&config, 1.0, DVec3::splat(0.5), &model), 1.0);
        assert_eq!(actual_sample_distance(&config, 0.5, DVec3::splat(0.5), &model), 4.0);
        let fixed = MapperConfig {
            auto_adjust_sample_distances: false,
            sample_distance: 0.3,
            ..config
        };
        assert_eq!(actual_sample_distance(&fixed, 0.5, DVec3::ONE, &model), 0.3);
    }

    #[test]
    fn test_reduced_size_never_collapses() {
        let vp = Viewport {
            x: 0,
            y: 0,
            width: 101,
            height: 1,
        };
        assert_eq!(reduced_size(&vp, 0.5), UVec2::new(51, 1));
        assert_eq!(reduced_size(&vp, 0.1), UVec2::new(10, 1));
    }
}
