use glam::UVec2;
use volcast_core::constants::MINIP_SCALAR_CLEAR;
use volcast_core::error::RenderError;
use volcast_core::types::BlendMode;

use crate::backend::GpuBackend;

/// Bookkeeping for the ping/pong accumulation targets the backend owns.
///
/// The targets follow the reduced viewport size. The scalar-tracking pair
/// exists only while an accumulative blend mode is active.
#[derive(Debug, Default)]
pub struct AccumulationTargets {
    size: Option<UVec2>,
    scalar_tracking: bool,
    reconfigurations: u64,
}

impl AccumulationTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> Option<UVec2> {
        self.size
    }

    pub fn has_scalar_tracking(&self) -> bool {
        self.scalar_tracking
    }

    pub fn reconfigurations(&self) -> u64 {
        self.reconfigurations
    }

    /// Make the targets match `size` and `blend`, recreating them only on change.
    /// Returns whether the backend targets were recreated.
    pub fn prepare<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        size: UVec2,
        blend: BlendMode,
    ) -> Result<bool, RenderError> {
        let scalar_tracking = blend.is_accumulative();
        if self.size == Some(size) && self.scalar_tracking == scalar_tracking {
            return Ok(false);
        }
        // A failed resize leaves no usable targets behind.
        self.size = None;
        backend.configure_accumulation(size, scalar_tracking)?;
        log::info!(
            "Accumulation targets {}x{}{}",
            size.x,
            size.y,
            if scalar_tracking { " with scalar tracking" } else { "" }
        );
        self.size = Some(size);
        self.scalar_tracking = scalar_tracking;
        self.reconfigurations += 1;
        Ok(true)
    }

    /// Reset both targets to the neutral value of `blend`.
    pub fn clear<B: GpuBackend + ?Sized>(&self, backend: &mut B, blend: BlendMode) {
        let (color, scalar) = clear_values(blend);
        backend.clear_accumulation(color, scalar);
    }

    /// Forget the targets; the next `prepare` recreates them.
    pub fn release(&mut self) {
        self.size = None;
        self.scalar_tracking = false;
    }
}

/// Color and scalar clear values. MinIP starts from the top of the
/// normalised range so that any sample lowers it.
pub fn clear_values(blend: BlendMode) -> ([f32; 4], f32) {
    let scalar = match blend {
        BlendMode::MinimumIntensity => MINIP_SCALAR_CLEAR,
        _ => 0.0,
    };
    ([0.0; 4], scalar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareBackend;

    #[test]
    fn test_resize_only_on_change() {
        let mut backend = SoftwareBackend::new();
        let mut targets = AccumulationTargets::new();
        assert!(targets
            .prepare(&mut backend, UVec2::new(8, 8), BlendMode::Composite)
            .expect("configured"));
        assert!(!targets
            .prepare(&mut backend, UVec2::new(8, 8), BlendMode::Composite)
            .expect("unchanged"));
        assert!(targets
            .prepare(&mut backend, UVec2::new(4, 8), BlendMode::Composite)
            .expect("resized"));
        assert_eq!(targets.reconfigurations(), 2);
    }

    #[test]
    fn test_scalar_pair_follows_blend_mode() {
        let mut backend = SoftwareBackend::new();
        let mut targets = AccumulationTargets::new();
        let size = UVec2::new(8, 8);
        targets
            .prepare(&mut backend, size, BlendMode::MaximumIntensity)
            .expect("configured");
        assert!(targets.has_scalar_tracking());
        assert!(backend.has_scalar_accumulation());
        targets
            .prepare(&mut backend, size, BlendMode::Composite)
            .expect("reconfigured");
        assert!(!targets.has_scalar_tracking());
        assert!(!backend.has_scalar_accumulation());
    }

    #[test]
    fn test_minip_clears_scalar_to_one() {
        assert_eq!(clear_values(BlendMode::MinimumIntensity).1, 1.0);
        assert_eq!(clear_values(BlendMode::MaximumIntensity).1, 0.0);
        assert_eq!(clear_values(BlendMode::Composite).0, [0.0; 4]);
    }
}
