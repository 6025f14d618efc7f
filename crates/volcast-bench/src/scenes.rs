use glam::{DVec3, UVec3};
use volcast_core::error::RenderError;
use volcast_core::transfer::{ColorChannel, PiecewiseTransferFunction};
use volcast_core::types::{BlendMode, CroppingConfig, ScalarArray, Volume};

/// Configuration for a single benchmark scene.
pub struct SceneConfig {
    pub name: &'static str,
    /// Edge length of the cubic volume, in points.
    pub edge: u32,
    pub blend: BlendMode,
    pub shade: bool,
    pub cropping: bool,
    /// GPU memory the mapper may assume; small budgets force streaming.
    pub memory_bytes: u64,
}

/// Standard suite: resident, streamed, cropped and the non-composite blends.
pub fn standard_scenes() -> Vec<SceneConfig> {
    vec![
        SceneConfig {
            name: "64-composite",
            edge: 64,
            blend: BlendMode::Composite,
            shade: false,
            cropping: false,
            memory_bytes: 128 * 1024 * 1024,
        },
        SceneConfig {
            name: "64-shaded",
            edge: 64,
            blend: BlendMode::Composite,
            shade: true,
            cropping: false,
            memory_bytes: 128 * 1024 * 1024,
        },
        SceneConfig {
            name: "64-streamed",
            edge: 64,
            blend: BlendMode::Composite,
            shade: false,
            cropping: false,
            // A quarter of the volume fits at once.
            memory_bytes: 64 * 64 * 64,
        },
        SceneConfig {
            name: "64-cropped",
            edge: 64,
            blend: BlendMode::Composite,
            shade: false,
            cropping: true,
            memory_bytes: 128 * 1024 * 1024,
        },
        SceneConfig {
            name: "64-mip",
            edge: 64,
            blend: BlendMode::MaximumIntensity,
            shade: false,
            cropping: false,
            memory_bytes: 128 * 1024 * 1024,
        },
        SceneConfig {
            name: "96-composite",
            edge: 96,
            blend: BlendMode::Composite,
            shade: false,
            cropping: false,
            memory_bytes: 128 * 1024 * 1024,
        },
    ]
}

/// Deterministic test field: a soft sphere with a hashed speckle.
pub fn generate_volume(edge: u32) -> Result<Volume, RenderError> {
    let n = edge.max(2);
    let center = (n - 1) as f32 * 0.5;
    let mut data = Vec::with_capacity((n * n * n) as usize);
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let d = ((x as f32 - center).powi(2)
                    + (y as f32 - center).powi(2)
                    + (z as f32 - center).powi(2))
                .sqrt()
                    / center;
                let hash = (x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663) ^ z.wrapping_mul(83_492_791)) % 100;
                let speckle = hash as f32 * 0.001;
                data.push(((1.0 - d).max(0.0) + speckle).min(1.0));
            }
        }
    }
    Volume::new(UVec3::splat(n), DVec3::ZERO, DVec3::ONE, ScalarArray::F32(data))
}

/// Ramp transfer function: transparent outside, warm and dense in the core.
pub fn transfer_function() -> PiecewiseTransferFunction {
    let mut tf = PiecewiseTransferFunction::new();
    tf.add_opacity_point(0.0, 0.0);
    tf.add_opacity_point(0.2, 0.0);
    tf.add_opacity_point(1.0, 0.6);
    tf.add_color_point(ColorChannel::Main, 0.0, [0.1, 0.2, 0.8]);
    tf.add_color_point(ColorChannel::Main, 1.0, [1.0, 0.6, 0.1]);
    tf
}

/// Cropping that keeps the centre slab and its eight corner regions.
pub fn cropping_for(volume: &Volume) -> CroppingConfig {
    let b = volume.bounds();
    let third = b.size() / 3.0;
    let lo = b.min + third;
    let hi = b.max - third;
    CroppingConfig {
        enabled: true,
        planes: [lo.x, hi.x, lo.y, hi.y, lo.z, hi.z],
        flags: (1 << 13) | 1 | (1 << 2) | (1 << 6) | (1 << 8) | (1 << 18) | (1 << 20) | (1 << 24) | (1 << 26),
    }
}
