use std::sync::atomic::{AtomicU64, Ordering};

use glam::{DVec3, IVec3, UVec3};

use crate::error::RenderError;

static CLOCK: AtomicU64 = AtomicU64::new(1);
static NEXT_VOLUME_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic modification stamp. Every mutation of a tracked object takes a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Take the next stamp from the process-wide clock.
    pub fn now() -> Self {
        Timestamp(CLOCK.fetch_add(1, Ordering::Relaxed))
    }
}

/// Process-unique identity of a volume, used as the scalar cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VolumeId(pub u64);

impl VolumeId {
    fn next() -> Self {
        VolumeId(NEXT_VOLUME_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Inclusive integer index range on each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub min: IVec3,
    pub max: IVec3,
}

impl Extent {
    pub fn new(min: IVec3, max: IVec3) -> Self {
        Self { min, max }
    }

    /// Extent covering `dims` samples starting at the origin index.
    pub fn from_dims(dims: UVec3) -> Self {
        Self {
            min: IVec3::ZERO,
            max: dims.as_ivec3() - IVec3::ONE,
        }
    }

    /// Number of samples per axis. Empty axes report zero.
    pub fn dims(&self) -> UVec3 {
        (self.max - self.min + IVec3::ONE).max(IVec3::ZERO).as_uvec3()
    }

    pub fn is_empty(&self) -> bool {
        self.max.cmplt(self.min).any()
    }

    pub fn voxel_count(&self) -> u64 {
        let d = self.dims();
        d.x as u64 * d.y as u64 * d.z as u64
    }

    /// True when `other` lies entirely inside this extent.
    pub fn contains(&self, other: &Extent) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }

    /// Component-wise clamp of this extent into `outer`.
    pub fn clamped_to(&self, outer: &Extent) -> Extent {
        Extent {
            min: self.min.clamp(outer.min, outer.max),
            max: self.max.clamp(outer.min, outer.max),
        }
    }
}

/// Axis-aligned box in volume-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: DVec3,
    pub max: DVec3,
}

impl Bounds {
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    /// A box with zero or negative thickness on any axis encloses nothing.
    pub fn is_degenerate(&self) -> bool {
        self.size().cmple(DVec3::ZERO).any()
    }

    pub fn contains_point(&self, p: DVec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }
}

/// Per-voxel sample storage. Single-component arrays may be any of the scalar
/// kinds; four-component arrays are RGBA bytes with opacity in the last channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarArray {
    U8(Vec<u8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    F32(Vec<f32>),
    Rgba8(Vec<[u8; 4]>),
}

impl ScalarArray {
    pub fn len(&self) -> usize {
        match self {
            ScalarArray::U8(v) => v.len(),
            ScalarArray::U16(v) => v.len(),
            ScalarArray::I16(v) => v.len(),
            ScalarArray::F32(v) => v.len(),
            ScalarArray::Rgba8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn components(&self) -> u32 {
        match self {
            ScalarArray::Rgba8(_) => 4,
            _ => 1,
        }
    }

    /// Scalar used for table lookups: the value itself, or opacity for RGBA data.
    pub fn value(&self, index: usize) -> f64 {
        match self {
            ScalarArray::U8(v) => v[index] as f64,
            ScalarArray::U16(v) => v[index] as f64,
            ScalarArray::I16(v) => v[index] as f64,
            ScalarArray::F32(v) => v[index] as f64,
            ScalarArray::Rgba8(v) => v[index][3] as f64,
        }
    }

    /// Min and max of the lookup scalar, `[0, 0]` for an empty array.
    pub fn range(&self) -> [f64; 2] {
        if self.is_empty() {
            return [0.0, 0.0];
        }
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for i in 0..self.len() {
            let v = self.value(i);
            if v.is_finite() {
                lo = lo.min(v);
                hi = hi.max(v);
            }
        }
        if lo > hi {
            [0.0, 0.0]
        } else {
            [lo, hi]
        }
    }
}

/// Regular 3-D grid of samples owned by the caller.
///
/// `dimensions` counts grid points. With `cell_data` set the samples live on
/// the `dimensions - 1` cells between the points instead.
#[derive(Debug, Clone)]
pub struct Volume {
    id: VolumeId,
    dimensions: UVec3,
    origin: DVec3,
    spacing: DVec3,
    cell_data: bool,
    scalars: ScalarArray,
    range: [f64; 2],
    modified: Timestamp,
}

impl Volume {
    /// Point-associated volume.
    pub fn new(
        dimensions: UVec3,
        origin: DVec3,
        spacing: DVec3,
        scalars: ScalarArray,
    ) -> Result<Self, RenderError> {
        Self::build(dimensions, origin, spacing, scalars, false)
    }

    /// Cell-associated volume; `scalars` holds one sample per cell.
    pub fn with_cell_data(
        dimensions: UVec3,
        origin: DVec3,
        spacing: DVec3,
        scalars: ScalarArray,
    ) -> Result<Self, RenderError> {
        Self::build(dimensions, origin, spacing, scalars, true)
    }

    fn build(
        dimensions: UVec3,
        origin: DVec3,
        spacing: DVec3,
        scalars: ScalarArray,
        cell_data: bool,
    ) -> Result<Self, RenderError> {
        let min_dim = if cell_data { 2 } else { 1 };
        if dimensions.cmplt(UVec3::splat(min_dim)).any() {
            return Err(RenderError::InvalidVolume(format!(
                "dimensions {dimensions} too small"
            )));
        }
        if spacing.cmple(DVec3::ZERO).any() {
            return Err(RenderError::InvalidVolume(format!(
                "spacing {spacing} must be positive"
            )));
        }
        let samples = if cell_data {
            dimensions - UVec3::ONE
        } else {
            dimensions
        };
        let expected = samples.x as usize * samples.y as usize * samples.z as usize;
        if scalars.len() != expected {
            return Err(RenderError::InvalidVolume(format!(
                "expected {expected} samples, got {}",
                scalars.len()
            )));
        }
        let range = scalars.range();
        Ok(Self {
            id: VolumeId::next(),
            dimensions,
            origin,
            spacing,
            cell_data,
            scalars,
            range,
            modified: Timestamp::now(),
        })
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn dimensions(&self) -> UVec3 {
        self.dimensions
    }

    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    pub fn spacing(&self) -> DVec3 {
        self.spacing
    }

    pub fn is_cell_data(&self) -> bool {
        self.cell_data
    }

    pub fn scalars(&self) -> &ScalarArray {
        &self.scalars
    }

    pub fn components(&self) -> u32 {
        self.scalars.components()
    }

    /// Lookup-scalar range cached at the last modification.
    pub fn scalar_range(&self) -> [f64; 2] {
        self.range
    }

    pub fn modified(&self) -> Timestamp {
        self.modified
    }

    /// Mutate the samples in place. The array length must not change.
    pub fn modify(&mut self, f: impl FnOnce(&mut ScalarArray)) -> Result<(), RenderError> {
        let before = self.scalars.len();
        f(&mut self.scalars);
        if self.scalars.len() != before {
            return Err(RenderError::InvalidVolume(format!(
                "sample count changed from {before} to {}",
                self.scalars.len()
            )));
        }
        self.range = self.scalars.range();
        self.modified = Timestamp::now();
        Ok(())
    }

    /// Extent of grid points.
    pub fn point_extent(&self) -> Extent {
        Extent::from_dims(self.dimensions)
    }

    /// Extent of the stored samples: points, or cells for cell data.
    pub fn data_extent(&self) -> Extent {
        if self.cell_data {
            Extent::from_dims(self.dimensions - UVec3::ONE)
        } else {
            self.point_extent()
        }
    }

    /// Local-space box spanned by the grid points.
    pub fn bounds(&self) -> Bounds {
        let max = self.origin + (self.dimensions - UVec3::ONE).as_dvec3() * self.spacing;
        Bounds::new(self.origin, max)
    }

    /// Local-space box covered by a data extent.
    pub fn extent_bounds(&self, extent: &Extent) -> Bounds {
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

    /// Linear index of a data sample.
    pub fn sample_index(&self, ijk: IVec3) -> usize {
        let d = self.data_extent().dims();
        ijk.x as usize + d.x as usize * (ijk.y as usize + d.y as usize * ijk.z as usize)
    }
}

/// How a mask volume modulates the scalar volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskKind {
    /// Non-zero voxels are rendered, zero voxels are skipped.
    Binary,
    /// Labels 1 and 2 select the two mask color tables.
    LabelMap,
}

/// Ray integration policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum BlendMode {
    Composite,
    MaximumIntensity,
    MinimumIntensity,
    Additive,
}

impl BlendMode {
    /// Modes that track a running scalar in a second accumulation target.
    pub fn is_accumulative(self) -> bool {
        !matches!(self, BlendMode::Composite)
    }
}

/// Sample reconstruction filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interpolation {
    Nearest,
    Linear,
}

/// Half-space `n · (p - origin) >= 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub origin: DVec3,
    pub normal: DVec3,
}

impl Plane {
    pub fn new(origin: DVec3, normal: DVec3) -> Self {
        Self {
            origin,
            normal: normal.normalize_or_zero(),
        }
    }

    /// Signed distance of `p` from the plane. Positive on the kept side.
    pub fn evaluate(&self, p: DVec3) -> f64 {
        self.normal.dot(p - self.origin)
    }
}

/// Camera description in world space. Distances are along the view direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: DVec3,
    pub focal_point: DVec3,
    pub view_up: DVec3,
    pub parallel_projection: bool,
    /// Half height of the view in world units when parallel.
    pub parallel_scale: f64,
    /// Full vertical field of view in degrees when perspective.
    pub view_angle: f64,
    pub clipping_range: [f64; 2],
}

impl Camera {
    /// Unit vector from the position toward the focal point.
    pub fn direction(&self) -> DVec3 {
        (self.focal_point - self.position).normalize_or_zero()
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: DVec3::new(0.0, 0.0, 1.0),
            focal_point: DVec3::ZERO,
            view_up: DVec3::Y,
            parallel_projection: false,
            parallel_scale: 1.0,
            view_angle: 30.0,
            clipping_range: [0.01, 1000.01],
        }
    }
}

/// Cropping slabs and the region inclusion bitset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CroppingConfig {
    pub enabled: bool,
    /// `[x0, x1, y0, y1, z0, z1]` in volume-local coordinates.
    pub planes: [f64; 6],
    /// Bit `r` includes region `r`, with `r = x + 3y + 9z`.
    pub flags: u32,
}

impl Default for CroppingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            planes: [0.0; 6],
            flags: crate::constants::CROPPING_FLAGS_CENTER,
        }
    }
}

/// Appearance settings that are not part of the transfer function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeProperty {
    pub shade: bool,
    pub interpolation: Interpolation,
    /// World distance at which the opacity table values are exact.
    pub scalar_opacity_unit_distance: f64,
    pub ambient: f32,
    pub diffuse: f32,
    pub specular: f32,
    pub specular_power: f32,
    /// Weight of the label color over the main color for label-map masks.
    pub mask_blend_factor: f32,
}

impl Default for VolumeProperty {
    fn default() -> Self {
        Self {
            shade: false,
            interpolation: Interpolation::Linear,
            scalar_opacity_unit_distance: 1.0,
            ambient: 0.1,
            diffuse: 0.7,
            specular: 0.2,
            specular_power: 10.0,
            mask_blend_factor: 1.0,
        }
    }
}

/// Pixel rectangle of the host surface, lower-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}
