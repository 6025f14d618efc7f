use std::collections::HashMap;

use glam::UVec3;
use volcast_core::config::MapperConfig;

use crate::backend::{GpuBackend, VolumeFormat};

/// Decides whether a volume texture set of a given size would fit, without
/// keeping anything allocated.
///
/// Accepted sizes are remembered per format so that any component-wise
/// smaller request is accepted without another driver round-trip. The memory
/// picture changes whenever textures are created or released, so owners call
/// `forget_accepted` at those points.
pub struct MemoryProbe {
    budget_bytes: u64,
    accepted: HashMap<VolumeFormat, Vec<UVec3>>,
    round_trips: u64,
}

impl MemoryProbe {
    pub fn new(config: &MapperConfig) -> Self {
        Self {
            budget_bytes: config.memory_budget_bytes(),
            accepted: HashMap::new(),
            round_trips: 0,
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub fn set_budget(&mut self, config: &MapperConfig) {
        let budget = config.memory_budget_bytes();
        if budget != self.budget_bytes {
            self.budget_bytes = budget;
            self.accepted.clear();
        }
    }

    /// Tentative allocations made so far.
    pub fn round_trips(&self) -> u64 {
        self.round_trips
    }

    pub fn forget_accepted(&mut self) {
        self.accepted.clear();
    }

    pub fn can_allocate<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        size: UVec3,
        format: &VolumeFormat,
    ) -> bool {
        if size.cmpeq(UVec3::ZERO).any() {
            return false;
        }
        if self.covered(size, format) {
            return true;
        }

        if !backend.proxy_texture_3d(size, format.scalar) {
            return false;
        }
        if let Some(mask) = format.mask {
            if !backend.proxy_texture_3d(size, mask) {
                return false;
            }
        }

        let bytes = format.byte_size(size);
        if bytes > self.budget_bytes {
            log::debug!(
                "MemoryProbe: {size} needs {bytes} bytes, budget is {}",
                self.budget_bytes
            );
            return false;
        }

        self.round_trips += 1;
        let scalar = match backend.create_texture_3d(size, format.scalar) {
            Ok(id) => id,
            Err(e) => {
                log::debug!("MemoryProbe: tentative scalar texture {size} failed: {e}");
                return false;
            }
        };
        if let Some(mask_format) = format.mask {
            match backend.create_texture_3d(size, mask_format) {
                Ok(mask) => backend.release_texture(mask),
                Err(e) => {
                    log::debug!("MemoryProbe: tentative mask texture {size} failed: {e}");
                    backend.release_texture(scalar);
                    return false;
                }
            }
        }
        backend.release_texture(scalar);

        self.accepted.entry(*format).or_default().push(size);
        true
    }

    fn covered(&self, size: UVec3, format: &VolumeFormat) -> bool {
        self.accepted
            .get(format)
            .is_some_and(|sizes| sizes.iter().any(|s| size.cmple(*s).all()))
    }
}
