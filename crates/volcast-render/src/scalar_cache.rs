use std::collections::HashMap;

use glam::{DVec3, IVec3, UVec3};
use volcast_core::error::RenderError;
use volcast_core::types::{Bounds, Extent, ScalarArray, Timestamp, Volume, VolumeId};

use crate::backend::{GpuBackend, TexelData, TextureId, VolumeFormat, VoxelFormat};
use crate::block_planner::{self, BlockPlan};
use crate::memory_probe::MemoryProbe;

/// The resident texture a draw samples from, and the block of it being drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureWindow {
    pub texture: TextureId,
    pub mask: Option<TextureId>,
    /// Data extent held by the texture.
    pub loaded_extent: Extent,
    /// Data extent this draw covers, inside `loaded_extent`.
    pub block_extent: Extent,
    pub cell_data: bool,
    pub origin: DVec3,
    pub spacing: DVec3,
    /// Scalar range the texels were normalised against.
    pub table_range: [f64; 2],
    pub format: VoxelFormat,
}

impl TextureWindow {
    fn extent_bounds(&self, extent: &Extent) -> Bounds {
        let hi = if self.cell_data {
            extent.max + IVec3::ONE
        } else {
            extent.max
        };
        Bounds::new(
            self.origin + extent.min.as_dvec3() * self.spacing,
            self.origin + hi.as_dvec3() * self.spacing,
        )
    }

    /// Local-space box covered by the texture.
    pub fn loaded_bounds(&self) -> Bounds {
        self.extent_bounds(&self.loaded_extent)
    }

    /// Local-space box of the block being drawn.
    pub fn block_bounds(&self) -> Bounds {
        self.extent_bounds(&self.block_extent)
    }

    /// Texture coordinate of a local position along one axis.
    ///
    /// Point samples sit on texel centres, so the loaded bounds map to
    /// `[0.5/n, 1 - 0.5/n]`; cell samples fill the whole texel range.
    pub fn texture_coordinate_axis(&self, axis: usize, value: f64) -> f64 {
        let bounds = self.loaded_bounds();
        let span = bounds.max[axis] - bounds.min[axis];
        let t = if span > 0.0 {
            (value - bounds.min[axis]) / span
        } else {
            0.5
        };
        if self.cell_data {
            t
        } else {
            let n = self.loaded_extent.dims()[axis].max(1) as f64;
            (t * (n - 1.0) + 0.5) / n
        }
    }

    pub fn texture_coordinate(&self, p: DVec3) -> DVec3 {
        DVec3::new(
            self.texture_coordinate_axis(0, p.x),
            self.texture_coordinate_axis(1, p.y),
            self.texture_coordinate_axis(2, p.z),
        )
    }

    /// Block box in texture coordinates: the shader's low/high ray bounds.
    pub fn texture_bounds(&self) -> (DVec3, DVec3) {
        let b = self.block_bounds();
        (self.texture_coordinate(b.min), self.texture_coordinate(b.max))
    }

    /// Continuous texel index of a local position, relative to the loaded extent.
    pub fn sample_coordinate(&self, p: DVec3) -> DVec3 {
        let index = (p - self.origin) / self.spacing;
        let index = if self.cell_data { index - 0.5 } else { index };
        index - self.loaded_extent.min.as_dvec3()
    }
}

/// Outcome of `ScalarFieldCache::acquire`.
#[derive(Debug, Clone, PartialEq)]
pub enum Acquired {
    /// The requested extent is resident in one texture.
    Resident(TextureWindow),
    /// Nothing fits; render these blocks one by one through `load_block`.
    Streamed(BlockPlan),
}

#[derive(Debug, Clone, PartialEq)]
struct ResidentMask {
    texture: TextureId,
    volume: VolumeId,
    modified: Timestamp,
}

/// GPU copy of part of a volume.
#[derive(Debug, Clone, PartialEq)]
struct LoadedTexture {
    texture: TextureId,
    size: UVec3,
    format: VoxelFormat,
    extent: Extent,
    table_range: [f64; 2],
    built: Timestamp,
    mask: Option<ResidentMask>,
}

/// At most one resident texture per (volume, cell flag).
pub struct ScalarFieldCache {
    entries: HashMap<(VolumeId, bool), LoadedTexture>,
    uploads: u64,
}

impl ScalarFieldCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            uploads: 0,
        }
    }

    /// Texture writes issued so far, scalar and mask.
    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    pub fn resident_count(&self) -> usize {
        self.entries.len()
    }

    /// Loaded extent of a volume's resident texture, if any.
    pub fn loaded_extent(&self, volume: &Volume) -> Option<Extent> {
        self.entries
            .get(&(volume.id(), volume.is_cell_data()))
            .map(|e| e.extent)
    }

    /// Make `requested` (a data extent) available for sampling.
    ///
    /// Reuses the resident texture when it still covers the request, then tries
    /// the whole volume, then exactly the request, then plans streamed blocks.
    pub fn acquire<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        probe: &mut MemoryProbe,
        volume: &Volume,
        mask: Option<&Volume>,
        requested: &Extent,
        camera_local: DVec3,
    ) -> Result<Acquired, RenderError> {
        let requested = requested.clamped_to(&volume.data_extent());
        if requested.is_empty() {
            return Err(RenderError::InvalidVolume("requested extent is empty".into()));
        }

        if let Some(window) = self.resident_window(volume, mask, &requested) {
            return Ok(Acquired::Resident(window));
        }

        let whole = volume.data_extent();
        if self.load(backend, probe, volume, mask, &whole)? {
            log::debug!("ScalarFieldCache: whole volume {} resident", whole.dims());
        } else if requested != whole && self.load(backend, probe, volume, mask, &requested)? {
            log::debug!("ScalarFieldCache: sub-extent {} resident", requested.dims());
        } else {
            log::warn!(
                "ScalarFieldCache: extent {} does not fit in GPU memory, streaming",
                requested.dims()
            );
            let format = volume_format(volume, mask);
            let plan = block_planner::plan(backend, probe, volume, &requested, &format, camera_local)?;
            return Ok(Acquired::Streamed(plan));
        }

        self.resident_window(volume, mask, &requested)
            .map(Acquired::Resident)
            .ok_or_else(|| RenderError::Backend("loaded texture does not cover request".into()))
    }

    /// Load exactly one streamed block.
    pub fn load_block<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        probe: &mut MemoryProbe,
        volume: &Volume,
        mask: Option<&Volume>,
        extent: &Extent,
    ) -> Result<TextureWindow, RenderError> {
        if let Some(window) = self.resident_window(volume, mask, extent) {
            return Ok(window);
        }
        if !self.load(backend, probe, volume, mask, extent)? {
            return Err(RenderError::OutOfMemory(format!(
                "loading streamed block {} failed",
                extent.dims()
            )));
        }
        self.resident_window(volume, mask, extent)
            .ok_or_else(|| RenderError::Backend("streamed block not resident after load".into()))
    }

    fn resident_window(
        &self,
        volume: &Volume,
        mask: Option<&Volume>,
        requested: &Extent,
    ) -> Option<TextureWindow> {
        let entry = self.entries.get(&(volume.id(), volume.is_cell_data()))?;
        if entry.built != volume.modified()
            || entry.table_range != volume.scalar_range()
            || !entry.extent.contains(requested)
        {
            return None;
        }
        let mask_texture = match mask {
            Some(m) => {
                let resident = entry.mask.as_ref()?;
                if resident.volume != m.id() || resident.modified != m.modified() {
                    return None;
                }
                Some(resident.texture)
            }
            None => None,
        };
        Some(TextureWindow {
            texture: entry.texture,
            mask: mask_texture,
            loaded_extent: entry.extent,
            block_extent: *requested,
            cell_data: volume.is_cell_data(),
            origin: volume.origin(),
            spacing: volume.spacing(),
            table_range: entry.table_range,
            format: entry.format,
        })
    }

    /// Upload `extent`. `Ok(false)` means it does not fit.
    fn load<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        probe: &mut MemoryProbe,
        volume: &Volume,
        mask: Option<&Volume>,
        extent: &Extent,
    ) -> Result<bool, RenderError> {
        let format = volume_format(volume, mask);
        let size = extent.dims();
        let key = (volume.id(), volume.is_cell_data());

        // The resident copy is about to be replaced; its memory counts as free.
        let reusable = self
            .entries
            .get(&key)
            .is_some_and(|e| e.size == size && e.format == format.scalar);
        if !reusable {
            self.evict_key(backend, probe, key);
        }
        if !reusable && !probe.can_allocate(backend, size, &format) {
            return Ok(false);
        }

        let scalars = extract_scalars(volume, extent);
        let texture = match self.entries.get(&key) {
            Some(entry) if reusable => entry.texture,
            _ => match backend.create_texture_3d(size, format.scalar) {
                Ok(id) => {
                    probe.forget_accepted();
                    id
                }
                Err(e) if e.is_out_of_memory() => return Ok(false),
                Err(e) => return Err(e),
            },
        };
        backend.write_texture_3d(texture, &scalars)?;
        self.uploads += 1;

        let old_mask = self.entries.get_mut(&key).and_then(|e| e.mask.take());
        let mask_entry = match mask {
            Some(m) => {
                let mask_texture = match old_mask {
                    Some(old) if reusable => old.texture,
                    other => {
                        if let Some(old) = other {
                            backend.release_texture(old.texture);
                        }
                        match backend.create_texture_3d(size, VoxelFormat::R8Uint) {
                            Ok(id) => id,
                            Err(e) => {
                                backend.release_texture(texture);
                                self.entries.remove(&key);
                                probe.forget_accepted();
                                return if e.is_out_of_memory() { Ok(false) } else { Err(e) };
                            }
                        }
                    }
                };
                backend.write_texture_3d(mask_texture, &extract_mask(m, extent))?;
                self.uploads += 1;
                Some(ResidentMask {
                    texture: mask_texture,
                    volume: m.id(),
                    modified: m.modified(),
                })
            }
            None => {
                if let Some(old) = old_mask {
                    backend.release_texture(old.texture);
                }
                None
            }
        };

        self.entries.insert(
            key,
            LoadedTexture {
                texture,
                size,
                format: format.scalar,
                extent: *extent,
                table_range: volume.scalar_range(),
                built: volume.modified(),
                mask: mask_entry,
            },
        );
        Ok(true)
    }

    fn evict_key<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        probe: &mut MemoryProbe,
        key: (VolumeId, bool),
    ) {
        if let Some(entry) = self.entries.remove(&key) {
            backend.release_texture(entry.texture);
            if let Some(mask) = entry.mask {
                backend.release_texture(mask.texture);
            }
            probe.forget_accepted();
        }
    }

    /// Release every resident texture.
    pub fn release<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        for (_, entry) in self.entries.drain() {
            backend.release_texture(entry.texture);
            if let Some(mask) = entry.mask {
                backend.release_texture(mask.texture);
            }
        }
    }
}

impl Default for ScalarFieldCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Texture formats needed to render `volume` with an optional mask.
pub fn volume_format(volume: &Volume, mask: Option<&Volume>) -> VolumeFormat {
    VolumeFormat {
        scalar: if volume.components() == 4 {
            VoxelFormat::Rgba8Unorm
        } else {
            VoxelFormat::R32Float
        },
        mask: mask.map(|_| VoxelFormat::R8Uint),
    }
}

fn for_each_index(volume: &Volume, extent: &Extent, mut f: impl FnMut(usize)) {
    for z in extent.min.z..=extent.max.z {
        for y in extent.min.y..=extent.max.y {
            for x in extent.min.x..=extent.max.x {
                f(volume.sample_index(IVec3::new(x, y, z)));
            }
        }
    }
}

/// Texels of `extent`, single scalars normalised to the volume's range.
pub fn extract_scalars(volume: &Volume, extent: &Extent) -> TexelData {
    let count = extent.voxel_count() as usize;
    match volume.scalars() {
        ScalarArray::Rgba8(values) => {
            let mut out = Vec::with_capacity(count);
            for_each_index(volume, extent, |i| out.push(values[i]));
            TexelData::Rgba8Unorm(out)
        }
        scalars => {
            let [lo, hi] = volume.scalar_range();
            let scale = if hi > lo { 1.0 / (hi - lo) } else { 0.0 };
            let mut out = Vec::with_capacity(count);
            for_each_index(volume, extent, |i| {
                out.push(((scalars.value(i) - lo) * scale) as f32);
            });
            TexelData::R32Float(out)
        }
    }
}

/// Mask labels of `extent`.
pub fn extract_mask(mask: &Volume, extent: &Extent) -> TexelData {
    let mut out = Vec::with_capacity(extent.voxel_count() as usize);
    let scalars = mask.scalars();
    for_each_index(mask, extent, |i| {
        out.push(scalars.value(i).clamp(0.0, 255.0) as u8);
    });
    TexelData::R8Uint(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use volcast_core::config::MapperConfig;

    use crate::software::SoftwareBackend;

    fn ramp(n: u32) -> Volume {
        let count = (n * n * n) as usize;
        Volume::new(
            UVec3::splat(n),
            DVec3::ZERO,
            DVec3::ONE,
            ScalarArray::F32((0..count).map(|i| i as f32).collect()),
        )
        .expect("valid volume")
    }

    fn probe(bytes: u64) -> MemoryProbe {
        MemoryProbe::new(&MapperConfig {
            max_memory_bytes: bytes,
            max_memory_fraction: 1.0,
            ..MapperConfig::default()
        })
    }

    fn resident(acquired: Acquired) -> TextureWindow {
        match acquired {
            Acquired::Resident(w) => w,
            Acquired::Streamed(_) => panic!("expected a resident texture"),
        }
    }

    #[test]
    fn test_same_extent_twice_does_not_reupload() {
        let volume = ramp(8);
        let mut backend = SoftwareBackend::new();
        let mut probe = probe(1 << 20);
        let mut cache = ScalarFieldCache::new();
        let extent = volume.data_extent();

        cache
            .acquire(&mut backend, &mut probe, &volume, None, &extent, DVec3::ZERO)
            .expect("fits");
        let uploads = backend.upload_count();
        cache
            .acquire(&mut backend, &mut probe, &volume, None, &extent, DVec3::ZERO)
            .expect("fits");
        assert_eq!(backend.upload_count(), uploads);
        assert_eq!(cache.uploads(), 1);
    }

    #[test]
    fn test_contained_extent_reuses_whole_volume() {
        let volume = ramp(8);
        let mut backend = SoftwareBackend::new();
        let mut probe = probe(1 << 20);
        let mut cache = ScalarFieldCache::new();
        let sub = Extent::new(IVec3::splat(2), IVec3::splat(5));

        let w = resident(
            cache
                .acquire(&mut backend, &mut probe, &volume, None, &sub, DVec3::ZERO)
                .expect("fits"),
        );
        assert_eq!(w.loaded_extent, volume.data_extent());
        assert_eq!(w.block_extent, sub);
        let again = resident(
            cache
                .acquire(&mut backend, &mut probe, &volume, None, &volume.data_extent(), DVec3::ZERO)
                .expect("fits"),
        );
        assert_eq!(again.texture, w.texture);
        assert_eq!(cache.uploads(), 1);
    }

    #[test]
    fn test_modified_volume_is_reloaded_in_place() {
        let mut volume = ramp(4);
        let mut backend = SoftwareBackend::new();
        let mut probe = probe(1 << 20);
        let mut cache = ScalarFieldCache::new();
        let extent = volume.data_extent();

        let first = resident(
            cache
                .acquire(&mut backend, &mut probe, &volume, None, &extent, DVec3::ZERO)
                .expect("fits"),
        );
        volume
            .modify(|s| {
                if let ScalarArray::F32(v) = s {
                    v[0] = -1.0;
                }
            })
            .expect("same length");
        let second = resident(
            cache
                .acquire(&mut backend, &mut probe, &volume, None, &extent, DVec3::ZERO)
                .expect("fits"),
        );
        assert_eq!(first.texture, second.texture);
        assert_eq!(second.table_range, [-1.0, 63.0]);
        assert_eq!(cache.uploads(), 2);
        assert_eq!(backend.live_textures(), 1);
    }

    #[test]
    fn test_falls_back_to_requested_extent() {
        let volume = ramp(8);
        let mut backend = SoftwareBackend::new();
        // Whole volume needs 2048 bytes; a 4^3 request needs 256.
        let mut probe = probe(1024);
        let mut cache = ScalarFieldCache::new();
        let sub = Extent::new(IVec3::ZERO, IVec3::splat(3));

        let w = resident(
            cache
                .acquire(&mut backend, &mut probe, &volume, None, &sub, DVec3::ZERO)
                .expect("fits"),
        );
        assert_eq!(w.loaded_extent, sub);
    }

    #[test]
    fn test_streams_when_nothing_fits() {
        let volume = ramp(8);
        let mut backend = SoftwareBackend::new();
        let mut probe = probe(4 * 4 * 4 * 4);
        let mut cache = ScalarFieldCache::new();

        match cache
            .acquire(&mut backend, &mut probe, &volume, None, &volume.data_extent(), DVec3::ZERO)
            .expect("streamable")
        {
            Acquired::Streamed(plan) => assert!(plan.blocks.len() > 1),
            Acquired::Resident(_) => panic!("volume should not fit"),
        }
    }

    #[test]
    fn test_mask_uploaded_to_separate_texture() {
        let volume = ramp(4);
        let mask = Volume::new(
            UVec3::splat(4),
            DVec3::ZERO,
            DVec3::ONE,
            ScalarArray::U8(vec![1; 64]),
        )
        .expect("valid mask");
        let mut backend = SoftwareBackend::new();
        let mut probe = probe(1 << 20);
        let mut cache = ScalarFieldCache::new();

        let w = resident(
            cache
                .acquire(&mut backend, &mut probe, &volume, Some(&mask), &volume.data_extent(), DVec3::ZERO)
                .expect("fits"),
        );
        let mask_texture = w.mask.expect("mask resident");
        assert_ne!(mask_texture, w.texture);
        assert_eq!(backend.live_textures(), 2);

        cache.release(&mut backend);
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn test_point_texture_coordinates_hit_texel_centres() {
        let window = TextureWindow {
            texture: TextureId(1),
            mask: None,
            loaded_extent: Extent::new(IVec3::ZERO, IVec3::splat(3)),
            block_extent: Extent::new(IVec3::ZERO, IVec3::splat(3)),
            cell_data: false,
            origin: DVec3::ZERO,
            spacing: DVec3::ONE,
            table_range: [0.0, 1.0],
            format: VoxelFormat::R32Float,
        };
        let (low, high) = window.texture_bounds();
        assert!((low.x - 0.125).abs() < 1e-12);
        assert!((high.x - 0.875).abs() < 1e-12);
        assert_eq!(window.sample_coordinate(DVec3::splat(1.5)), DVec3::splat(1.5));
    }

    #[test]
    fn test_normalised_scalars() {
        let volume = ramp(2);
        match extract_scalars(&volume, &volume.data_extent()) {
            TexelData::R32Float(v) => {
                assert_eq!(v.len(), 8);
                assert_eq!(v[0], 0.0);
                assert_eq!(v[7], 1.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
