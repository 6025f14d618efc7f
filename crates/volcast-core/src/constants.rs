//! Single source of truth for shared constants.
//! Values used by both the orchestration layer and the ray-march shaders are
//! injected into shader preambles by the backends.

/// Number of entries in every 1-D transfer-function lookup table.
pub const TABLE_SIZE: usize = 1024;

/// Opacity values at or below this threshold skip the sample-distance correction.
pub const OPACITY_CORRECTION_EPSILON: f32 = 0.0001;

/// Maximum number of cropping regions (3 slabs per axis).
pub const MAX_CROPPING_REGIONS: usize = 27;

/// Bit mask covering every cropping region flag.
pub const CROPPING_FLAGS_ALL: u32 = (1 << MAX_CROPPING_REGIONS) - 1;

/// Default inclusion flags: only the central region (bit 13).
pub const CROPPING_FLAGS_CENTER: u32 = 1 << 13;

/// Minimum block edge for point-associated data (two samples to interpolate between).
pub const MIN_BLOCK_SIZE_POINTS: u32 = 2;

/// Minimum block edge for cell-associated data.
pub const MIN_BLOCK_SIZE_CELLS: u32 = 1;

/// Default inward offset of the near clipping plane, in world units.
pub const NEAR_PLANE_OFFSET: f64 = 0.001;

/// When the near/far span is at most `NEAR_PLANE_OFFSET`, the offset becomes span / this.
pub const NEAR_PLANE_OFFSET_DIVISOR: f64 = 1000.0;

/// Default number of centroid-fan subdivision passes applied to clipped hulls.
pub const DEFAULT_DENSIFY_LEVELS: u32 = 2;

/// Reduction factor only grows when the candidate exceeds the current one by this ratio.
pub const REDUCTION_GROW_RATIO: f64 = 1.3;

/// Reduction factor only shrinks when the candidate falls below the current one by this ratio.
pub const REDUCTION_SHRINK_RATIO: f64 = 0.95;

/// Blended reduction factors above this value snap back to full resolution.
pub const REDUCTION_SNAP_THRESHOLD: f64 = 5.0;

/// Lowest blended reduction factor before the sample-distance clamp.
pub const REDUCTION_FLOOR: f64 = 0.1;

/// Default GPU memory budget in bytes (128 MiB).
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 128 * 1024 * 1024;

/// Default fraction of the budget a single volume texture may occupy.
pub const DEFAULT_MAX_MEMORY_FRACTION: f64 = 0.75;

/// Minimum interval between two progress events, in seconds.
pub const PROGRESS_INTERVAL_SECS: f64 = 1.0;

/// Edge length of the square ray-jitter noise texture.
pub const NOISE_TEXTURE_SIZE: u32 = 128;

/// Clear value of the scalar accumulation target in MinIP mode.
pub const MINIP_SCALAR_CLEAR: f32 = 1.0;

/// Geometric tolerance used by the convex clipper.
pub const CLIP_EPSILON: f64 = 1e-9;

/// Orientation test tolerance when winding hull polygons.
pub const WINDING_EPSILON: f64 = 1e-6;
