use glam::{DVec3, IVec3, UVec3};
use volcast_core::constants::{MIN_BLOCK_SIZE_CELLS, MIN_BLOCK_SIZE_POINTS};
use volcast_core::error::RenderError;
use volcast_core::types::{Bounds, Extent, Volume};

use crate::backend::{GpuBackend, VolumeFormat};
use crate::memory_probe::MemoryProbe;

/// A sub-extent small enough to be resident on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub extent: Extent,
    /// Volume-local bounds of the block.
    pub bounds: Bounds,
    /// Squared distance from the local camera position to the block centre.
    pub distance2: f64,
}

/// Blocks covering a requested extent, nearest first.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockPlan {
    pub block_size: UVec3,
    pub blocks: Vec<Block>,
    /// Probe calls spent finding `block_size`.
    pub probe_calls: u32,
}

/// Decompose `requested` into blocks that pass the memory probe, ordered front to back.
pub fn plan<B: GpuBackend + ?Sized>(
    backend: &mut B,
    probe: &mut MemoryProbe,
    volume: &Volume,
    requested: &Extent,
    format: &VolumeFormat,
    camera_local: DVec3,
) -> Result<BlockPlan, RenderError> {
    let ceiling = backend.capabilities().max_texture_dimension_3d;
    let (block_size, probe_calls) = find_block_size(
        backend,
        probe,
        requested.dims(),
        format,
        volume.is_cell_data(),
        ceiling,
    )?;

    let mut blocks = tile(volume, requested, block_size);
    order_by_distance(&mut blocks, camera_local);
    log::info!(
        "BlockPlanner: {} blocks of {} for extent {} ({} probes)",
        blocks.len(),
        block_size,
        requested.dims(),
        probe_calls
    );
    Ok(BlockPlan {
        block_size,
        blocks,
        probe_calls,
    })
}

/// Largest block edge lengths that pass the probe.
///
/// Axes clamped by the device ceiling keep their size while the others are
/// bisected. Otherwise Z halves first down to the minimum, then the larger of
/// X and Y. Every step shrinks one axis, so the search ends after at most
/// `sum(log2(dims))` probes.
pub fn find_block_size<B: GpuBackend + ?Sized>(
    backend: &mut B,
    probe: &mut MemoryProbe,
    dims: UVec3,
    format: &VolumeFormat,
    cell_data: bool,
    ceiling: u32,
) -> Result<(UVec3, u32), RenderError> {
    let min_edge = if cell_data {
        MIN_BLOCK_SIZE_CELLS
    } else {
        MIN_BLOCK_SIZE_POINTS
    };
    let clamped = dims.cmpgt(UVec3::splat(ceiling));
    let mut size = dims.min(UVec3::splat(ceiling));
    // A request thinner than the minimum cannot be shrunk on that axis.
    let floor = size.min(UVec3::splat(min_edge));

    let mut calls = 1u32;
    if probe.can_allocate(backend, size, format) {
        return Ok((size, calls));
    }

    let halve = |size: &mut UVec3, axis: usize| {
        size[axis] = (size[axis] / 2).max(floor[axis]);
    };

    if clamped.any() {
        let clamped = [clamped.x, clamped.y, clamped.z];
        loop {
            let free = largest_axis(size, floor, |axis| !clamped[axis]);
            let Some(axis) = free.or_else(|| largest_axis(size, floor, |_| true)) else {
                break;
            };
            halve(&mut size, axis);
            calls += 1;
            if probe.can_allocate(backend, size, format) {
                return Ok((size, calls));
            }
        }
    } else {
        while size.z > floor.z {
            halve(&mut size, 2);
            calls += 1;
            if probe.can_allocate(backend, size, format) {
                return Ok((size, calls));
            }
        }
        while let Some(axis) = largest_axis(size, floor, |axis| axis < 2) {
            halve(&mut size, axis);
            calls += 1;
            if probe.can_allocate(backend, size, format) {
                return Ok((size, calls));
            }
        }
    }

    log::error!("BlockPlanner: no memory left on the GPU even for a minimal block ({calls} probes)");
    Err(RenderError::OutOfMemory(
        "No memory left on the GPU even for a minimal block".into(),
    ))
}

/// Largest axis still above its floor among those `eligible` allows. Ties pick the lower axis.
fn largest_axis(size: UVec3, floor: UVec3, eligible: impl Fn(usize) -> bool) -> Option<usize> {
    (0..3)
        .filter(|&axis| eligible(axis) && size[axis] > floor[axis])
        .fold(None, |best: Option<usize>, axis| match best {
            Some(b) if size[b] >= size[axis] => Some(b),
            _ => Some(axis),
        })
}

/// Inclusive `(start, end)` ranges covering `[min, max]` with blocks of `size`.
/// Point blocks overlap their neighbour by one sample.
pub fn axis_tiles(min: i32, max: i32, size: u32, cell_data: bool) -> Vec<(i32, i32)> {
    let mut tiles = Vec::new();
    let size = size.max(1) as i32;
    let mut start = min;
    loop {
        let end = (start + size - 1).min(max);
        tiles.push((start, end));
        if end >= max {
            break;
        }
        start = if cell_data || size < 2 { end + 1 } else { end };
    }
    tiles
}

/// Grid of blocks over `requested`, generated z-major.
pub fn tile(volume: &Volume, requested: &Extent, block_size: UVec3) -> Vec<Block> {
    let cell = volume.is_cell_data();
    let xs = axis_tiles(requested.min.x, requested.max.x, block_size.x, cell);
    let ys = axis_tiles(requested.min.y, requested.max.y, block_size.y, cell);
    let zs = axis_tiles(requested.min.z, requested.max.z, block_size.z, cell);

    let mut blocks = Vec::with_capacity(xs.len() * ys.len() * zs.len());
    for &(z0, z1) in &zs {
        for &(y0, y1) in &ys {
            for &(x0, x1) in &xs {
                let extent = Extent::new(IVec3::new(x0, y0, z0), IVec3::new(x1, y1, z1));
                blocks.push(Block {
                    extent,
                    bounds: volume.extent_bounds(&extent),
                    distance2: 0.0,
                });
            }
        }
    }
    blocks
}

/// Stable sort by squared distance from `camera_local` to each block centre.
pub fn order_by_distance(blocks: &mut [Block], camera_local: DVec3) {
    for block in blocks.iter_mut() {
        block.distance2 = block.bounds.center().distance_squared(camera_local);
    }
    blocks.sort_by(|a, b| a.distance2.total_cmp(&b.distance2));
}

#[cfg(test)]
mod tests {
    use super::*;
    use volcast_core::config::MapperConfig;
    use volcast_core::types::ScalarArray;

    use crate::backend::VoxelFormat;
    use crate::software::SoftwareBackend;

    const SCALAR: VolumeFormat = VolumeFormat {
        scalar: VoxelFormat::R32Float,
        mask: None,
    };

    fn probe(bytes: u64) -> MemoryProbe {
        MemoryProbe::new(&MapperConfig {
            max_memory_bytes: bytes,
            max_memory_fraction: 1.0,
            ..MapperConfig::default()
        })
    }

    fn volume(dims: UVec3) -> Volume {
        let n = (dims.x * dims.y * dims.z) as usize;
        Volume::new(dims, DVec3::ZERO, DVec3::ONE, ScalarArray::U8(vec![0; n])).expect("valid")
    }

    #[test]
    fn test_point_tiles_share_one_sample() {
        assert_eq!(axis_tiles(0, 9, 4, false), vec![(0, 3), (3, 6), (6, 9)]);
        assert_eq!(axis_tiles(0, 10, 4, false), vec![(0, 3), (3, 6), (6, 9), (9, 10)]);
        assert_eq!(axis_tiles(2, 3, 8, false), vec![(2, 3)]);
    }

    #[test]
    fn test_cell_tiles_are_disjoint() {
        assert_eq!(axis_tiles(0, 9, 4, true), vec![(0, 3), (4, 7), (8, 9)]);
        assert_eq!(axis_tiles(0, 0, 1, true), vec![(0, 0)]);
    }

    #[test]
    fn test_z_is_halved_first() {
        let mut backend = SoftwareBackend::new();
        // 8x8x2 floats = 512 bytes.
        let mut probe = probe(512);
        let (size, calls) =
            find_block_size(&mut backend, &mut probe, UVec3::splat(8), &SCALAR, false, 2048)
                .expect("fits after halving");
        assert_eq!(size, UVec3::new(8, 8, 2));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_xy_bisected_after_z_reaches_minimum() {
        let mut backend = SoftwareBackend::new();
        let mut probe = probe(4 * 4 * 8 * 2);
        let (size, _) =
            find_block_size(&mut backend, &mut probe, UVec3::new(8, 16, 8), &SCALAR, false, 2048)
                .expect("fits");
        assert_eq!(size.z, 2);
        assert!(size.x * size.y * size.z * 4 <= 4 * 4 * 8 * 2);
        assert_eq!(size, UVec3::new(4, 8, 2));
    }

    #[test]
    fn test_clamped_axis_is_not_bisected() {
        let mut backend = SoftwareBackend::with_memory(u64::MAX / 2, 16);
        // 16 x 4 x 4 floats.
        let mut probe = probe(16 * 4 * 4 * 4);
        let (size, _) =
            find_block_size(&mut backend, &mut probe, UVec3::new(64, 16, 16), &SCALAR, false, 16)
                .expect("fits");
        assert_eq!(size.x, 16);
        assert!(size.y < 16 && size.z < 16);
    }

    #[test]
    fn test_minimal_block_failure_is_fatal() {
        let mut backend = SoftwareBackend::new();
        let mut probe = probe(8 * 4 - 1);
        let err = find_block_size(&mut backend, &mut probe, UVec3::splat(64), &SCALAR, false, 2048)
            .expect_err("even 2x2x2 does not fit");
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn test_bisection_terminates_in_logarithmic_probes() {
        let dims_list = [
            UVec3::new(64, 48, 100),
            UVec3::new(3, 500, 7),
            UVec3::new(1, 1, 1),
            UVec3::new(257, 257, 2),
        ];
        for dims in dims_list {
            for budget in [0u64, 7, 32, 100, 4096, 1 << 16, 1 << 30] {
                for cell in [false, true] {
                    let mut backend = SoftwareBackend::new();
                    let mut probe = probe(budget.max(1));
                    let bound = 3 + dims.to_array().iter().map(|d| 32 - d.leading_zeros()).sum::<u32>();
                    match find_block_size(&mut backend, &mut probe, dims, &SCALAR, cell, 2048) {
                        Ok((size, calls)) => {
                            assert!(calls <= bound, "{dims} {budget}: {calls} > {bound}");
                            assert!(SCALAR.byte_size(size) <= budget.max(1));
                            assert!(size.cmple(dims).all());
                        }
                        Err(e) => assert!(e.is_out_of_memory()),
                    }
                }
            }
        }
    }

    #[test]
    fn test_plan_orders_nearest_first() {
        let v = volume(UVec3::new(16, 4, 4));
        let mut backend = SoftwareBackend::new();
        let mut probe = probe(4 * 4 * 4 * 4);
        let camera = DVec3::new(100.0, 2.0, 2.0);
        let plan = plan(&mut backend, &mut probe, &v, &v.data_extent(), &SCALAR, camera)
            .expect("plannable");
        assert!(plan.blocks.len() > 1);
        let xs: Vec<i32> = plan.blocks.iter().map(|b| b.extent.max.x).collect();
        let mut sorted = xs.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(xs, sorted);
        for pair in plan.blocks.windows(2) {
            assert!(pair[0].distance2 <= pair[1].distance2);
        }
    }

    #[test]
    fn test_tiles_cover_requested_extent() {
        let v = volume(UVec3::new(10, 7, 5));
        let blocks = tile(&v, &v.data_extent(), UVec3::new(4, 4, 4));
        let covered: u64 = blocks.iter().map(|b| b.extent.voxel_count()).sum();
        assert!(covered >= v.data_extent().voxel_count());
        for b in &blocks {
            assert!(v.data_extent().contains(&b.extent));
        }
        assert_eq!(blocks.len(), 3 * 2 * 2);
    }
}
