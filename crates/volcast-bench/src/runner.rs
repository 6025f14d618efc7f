use std::time::Instant;

use glam::{DMat4, DVec3};
use volcast_core::config::MapperConfig;
use volcast_core::error::RenderError;
use volcast_core::types::{Camera, CroppingConfig, VolumeProperty};
use volcast_render::backend::GpuBackend;
use volcast_render::mapper::{FrameRequest, VolumeMapper};
use volcast_render::shader_variant::ShaderLibrary;
use volcast_render::software::{SoftwareBackend, SoftwareSurface};
use volcast_render::wgpu_backend::{HostTarget, WgpuBackend};

use crate::scenes::{self, SceneConfig};

/// Frame times of one scene.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TimingSeries {
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// One scene's run, as stored in a baseline.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BenchmarkResult {
    pub scene_name: String,
    pub voxels: u64,
    /// Blocks drawn in the last frame; above one means the volume was streamed.
    pub blocks: usize,
    pub frame_count: u32,
    pub failed_frames: u32,
    pub timings: TimingSeries,
}

/// Which `GpuBackend` the scenes run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Software,
    Gpu,
}

/// Renders each scene for a fixed number of frames around an orbiting camera.
pub struct BenchmarkRunner {
    frame_count: u32,
    width: u32,
    height: u32,
    base_config: MapperConfig,
}

impl BenchmarkRunner {
    pub fn new(frame_count: u32, width: u32, height: u32) -> Self {
        Self {
            frame_count,
            width,
            height,
            base_config: MapperConfig {
                auto_adjust_sample_distances: false,
                report_progress: false,
                ..MapperConfig::default()
            },
        }
    }

    /// Use `config` for every scene; each scene still sets its own memory budget.
    pub fn with_config(mut self, config: MapperConfig) -> Self {
        self.base_config = config;
        self
    }

    pub fn run_scene(&self, kind: BackendKind, config: &SceneConfig) -> Result<BenchmarkResult, RenderError> {
        match kind {
            BackendKind::Software => {
                let mut backend = SoftwareBackend::new();
                backend.resize_framebuffer(self.width, self.height);
                self.run_scene_on(&mut backend, config)
            }
            BackendKind::Gpu => {
                let (adapter, device, queue) = WgpuBackend::request_device()?;
                let format = wgpu::TextureFormat::Rgba8Unorm;
                let host = host_color_view(&device, format, self.width, self.height);
                let mut backend = WgpuBackend::new(&adapter, device, queue, format);
                backend.set_host_target(HostTarget {
                    color: host,
                    depth: None,
                    size: glam::UVec2::new(self.width, self.height),
                });
                self.run_scene_on(&mut backend, config)
            }
        }
    }

    /// Run one scene on an existing backend.
    pub fn run_scene_on<B: GpuBackend>(
        &self,
        backend: &mut B,
        config: &SceneConfig,
    ) -> Result<BenchmarkResult, RenderError> {
        log::info!("Running scene '{}' ({}^3 points)...", config.name, config.edge);

        let volume = scenes::generate_volume(config.edge)?;
        let transfer = scenes::transfer_function();
        let library = ShaderLibrary::builtin();
        let cropping = if config.cropping {
            scenes::cropping_for(&volume)
        } else {
            CroppingConfig::default()
        };
        let mut mapper = VolumeMapper::new(MapperConfig {
            max_memory_bytes: config.memory_bytes,
            max_memory_fraction: 1.0,
            ..self.base_config.clone()
        });
        let mut surface = SoftwareSurface::new(self.width, self.height);

        let bounds = volume.bounds();
        let center = bounds.center();
        let radius = bounds.size().length() * 1.5;
        let property = VolumeProperty {
            shade: config.shade,
            ..VolumeProperty::default()
        };

        let mut frame_times = Vec::with_capacity(self.frame_count as usize);
        let mut failed_frames = 0;
        for frame in 0..self.frame_count {
            let angle = frame as f64 / self.frame_count.max(1) as f64 * std::f64::consts::TAU;
            let camera = Camera {
                position: center + DVec3::new(angle.cos(), 0.3, angle.sin()) * radius,
                focal_point: center,
                view_up: DVec3::Y,
                parallel_projection: false,
                parallel_scale: 1.0,
                view_angle: 30.0,
                clipping_range: [radius * 0.1, radius * 3.0],
            };
            let request = FrameRequest {
                volume: &volume,
                mask: None,
                transform: DMat4::IDENTITY,
                camera,
                clip_planes: &[],
                cropping,
                blend: config.blend,
                property,
                transfer: &transfer,
                registry: &library,
                allocated_secs: 0.1,
                canonical: false,
            };

            let frame_start = Instant::now();
            let outcome = mapper.render(backend, &mut surface, &request);
            frame_times.push(frame_start.elapsed().as_secs_f64() * 1000.0);

            if let Some(diagnostic) = outcome.diagnostic {
                log::warn!("  Frame {frame}: {diagnostic}");
                failed_frames += 1;
            }
        }

        let timings = compute_timings(&frame_times);
        let blocks = mapper.last_frame().blocks;
        log::info!(
            "  Done: mean={:.2}ms, p95={:.2}ms, {} block(s)",
            timings.mean_ms,
            timings.p95_ms,
            blocks
        );
        mapper.release_graphics_resources(backend);

        Ok(BenchmarkResult {
            scene_name: config.name.to_string(),
            voxels: volume.data_extent().voxel_count(),
            blocks,
            frame_count: self.frame_count,
            failed_frames,
            timings,
        })
    }
}

/// Offscreen color target the GPU backend blits into.
fn host_color_view(device: &wgpu::Device, format: wgpu::TextureFormat, width: u32, height: u32) -> wgpu::TextureView {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("bench-host-surface"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

/// Nearest-rank percentile of an ascending series.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Frame time statistics in milliseconds. An empty series is all zeros.
pub fn compute_timings(times: &[f64]) -> TimingSeries {
    let mut sorted = times.to_vec();
    sorted.sort_by(f64::total_cmp);
    let (Some(&min_ms), Some(&max_ms)) = (sorted.first(), sorted.last()) else {
        return TimingSeries::default();
    };
    let n = sorted.len();
    let median_ms = match n % 2 {
        0 => (sorted[n / 2 - 1] + sorted[n / 2]) * 0.5,
        _ => sorted[n / 2],
    };
    TimingSeries {
        mean_ms: sorted.iter().sum::<f64>() / n as f64,
        median_ms,
        p95_ms: percentile(&sorted, 0.95),
        p99_ms: percentile(&sorted, 0.99),
        min_ms,
        max_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volcast_core::types::BlendMode;

    fn small_scene(memory_bytes: u64) -> SceneConfig {
        SceneConfig {
            name: "test",
            edge: 8,
            blend: BlendMode::Composite,
            shade: false,
            cropping: false,
            memory_bytes,
        }
    }

    #[test]
    fn test_timings_of_known_series() {
        let t = compute_timings(&[4.0, 1.0, 3.0, 2.0]);
        assert_eq!(t.min_ms, 1.0);
        assert_eq!(t.max_ms, 4.0);
        assert_eq!(t.median_ms, 2.5);
        assert_eq!(t.mean_ms, 2.5);
        assert_eq!(t.p95_ms, 4.0);
    }

    #[test]
    fn test_empty_series_is_zero() {
        assert_eq!(compute_timings(&[]).mean_ms, 0.0);
    }

    #[test]
    fn test_percentiles_use_nearest_rank() {
        let times: Vec<f64> = (1..=100).map(f64::from).collect();
        let t = compute_timings(&times);
        assert_eq!(t.p95_ms, 95.0);
        assert_eq!(t.p99_ms, 99.0);
        assert_eq!(compute_timings(&[7.0]).p99_ms, 7.0);
    }

    #[test]
    fn test_software_scene_renders_every_frame() {
        let runner = BenchmarkRunner::new(3, 16, 16);
        let result = runner
            .run_scene(BackendKind::Software, &small_scene(1 << 30))
            .expect("scene");
        assert_eq!(result.frame_count, 3);
        assert_eq!(result.failed_frames, 0);
        assert_eq!(result.blocks, 1);
        assert_eq!(result.voxels, 512);
    }

    #[test]
    fn test_tight_budget_streams_blocks() {
        let runner = BenchmarkRunner::new(1, 16, 16);
        let result = runner
            .run_scene(BackendKind::Software, &small_scene(8 * 8 * 8))
            .expect("scene");
        assert_eq!(result.failed_frames, 0);
        assert!(result.blocks > 1, "{result:?}");
    }
}
