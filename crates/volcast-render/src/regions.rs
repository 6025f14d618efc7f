use glam::{DVec3, IVec3};
use volcast_core::constants::{CROPPING_FLAGS_ALL, MAX_CROPPING_REGIONS};
use volcast_core::types::{Bounds, CroppingConfig, Extent, Volume};

/// One cropping region, with its squared distance to the camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    /// `x + 3y + 9z` in the 3x3x3 region grid.
    pub index: usize,
    pub bounds: Bounds,
    pub distance2: f64,
}

/// Grid location of region `index`.
pub fn region_location(index: usize) -> IVec3 {
    IVec3::new(
        (index % 3) as i32,
        ((index / 3) % 3) as i32,
        ((index / 9) % 3) as i32,
    )
}

/// Number of included regions. Cropping is active only when this exceeds one
/// or the single region is smaller than the volume.
pub fn cropping_region_count(cropping: &CroppingConfig) -> u32 {
    if !cropping.enabled {
        return 1;
    }
    (cropping.flags & CROPPING_FLAGS_ALL).count_ones()
}

/// Included, non-empty regions of `volume_bounds`, nearest to `camera_local` first.
pub fn ordered_regions(
    volume_bounds: &Bounds,
    cropping: &CroppingConfig,
    camera_local: DVec3,
) -> Vec<Region> {
    let mut limits = [[0.0f64; 4]; 3];
    for axis in 0..3 {
        let lo = volume_bounds.min[axis];
        let hi = volume_bounds.max[axis];
        let a = cropping.planes[axis * 2].clamp(lo, hi);
        let b = cropping.planes[axis * 2 + 1].clamp(lo, hi);
        limits[axis] = [lo, a.min(b), a.max(b), hi];
    }

    let mut regions = Vec::new();
    for index in 0..MAX_CROPPING_REGIONS {
        if cropping.flags & (1 << index) == 0 {
            continue;
        }
        let loc = region_location(index);
        let mut min = DVec3::ZERO;
        let mut max = DVec3::ZERO;
        for axis in 0..3 {
            let slab = loc[axis] as usize;
            min[axis] = limits[axis][slab];
            max[axis] = limits[axis][slab + 1];
        }
        let bounds = Bounds::new(min, max);
        if bounds.is_degenerate() {
            continue;
        }
        regions.push(Region {
            index,
            distance2: bounds.center().distance_squared(camera_local),
            bounds,
        });
    }
    regions.sort_by(|a, b| a.distance2.total_cmp(&b.distance2));
    regions
}

/// Smallest data extent whose samples can reconstruct every point of `bounds`.
///
/// Cell samples sit at cell centres, so the box is shifted by half a cell
/// before rounding outward.
pub fn region_extent(volume: &Volume, bounds: &Bounds) -> Extent {
    let shift = if volume.is_cell_data() { 0.5 } else { 0.0 };
    let lo = (bounds.min - volume.origin()) / volume.spacing() - shift;
    let hi = (bounds.max - volume.origin()) / volume.spacing() - shift;
    let extent = Extent::new(lo.floor().as_ivec3(), hi.ceil().as_ivec3());
    extent.clamped_to(&volume.data_extent())
}
