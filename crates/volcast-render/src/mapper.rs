use std::time::Instant;

use glam::{DMat4, UVec2};
use volcast_core::config::MapperConfig;
use volcast_core::constants::NOISE_TEXTURE_SIZE;
use volcast_core::error::RenderError;
use volcast_core::transfer::TransferFunction;
use volcast_core::types::{
    BlendMode, Camera, CroppingConfig, MaskKind, Plane, Volume, VolumeProperty,
};

use crate::accumulation::AccumulationTargets;
use crate::backend::{FrameContext, GpuBackend, HostSurface};
use crate::bindings::SlotTable;
use crate::compositor::{bind_frame_slots, ActiveProgram, CompositeJob, Compositor, RenderItem};
use crate::memory_probe::MemoryProbe;
use crate::quality::{actual_sample_distance, reduced_size, QualityController};
use crate::regions::cropping_region_count;
use crate::render_state::{HostStateScope, RenderState, StateScope};
use crate::scalar_cache::ScalarFieldCache;
use crate::shader_variant::{ShaderSourceRegistry, ShaderVariant, ShaderVariantMachine, VariantRequest};
use crate::tables::TransferTables;

/// Label volume rendered together with the scalar volume.
#[derive(Clone, Copy)]
pub struct MaskInput<'a> {
    pub volume: &'a Volume,
    pub kind: MaskKind,
}

/// Everything the host supplies for one frame.
pub struct FrameRequest<'a> {
    pub volume: &'a Volume,
    pub mask: Option<MaskInput<'a>>,
    /// Volume-local to world.
    pub transform: DMat4,
    pub camera: Camera,
    /// World-space clip planes.
    pub clip_planes: &'a [Plane],
    pub cropping: CroppingConfig,
    pub blend: BlendMode,
    pub property: VolumeProperty,
    pub transfer: &'a dyn TransferFunction,
    pub registry: &'a dyn ShaderSourceRegistry,
    /// Time budget for this frame.
    pub allocated_secs: f64,
    /// Offscreen snapshot: full resolution, no progress events.
    pub canonical: bool,
}

/// Result of `VolumeMapper::render`. Errors never cross this boundary; they
/// arrive as `rendered == false` plus a diagnostic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameOutcome {
    pub rendered: bool,
    /// The host asked to stop between blocks. Composited blocks stay on screen.
    pub aborted: bool,
    pub diagnostic: Option<String>,
}

impl FrameOutcome {
    fn skipped() -> Self {
        Self::default()
    }

    fn failed(diagnostic: String) -> Self {
        Self {
            rendered: false,
            aborted: false,
            diagnostic: Some(diagnostic),
        }
    }
}

/// What the last dispatched frame did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    pub reduction_factor: f64,
    pub sample_distance: f64,
    pub target_size: UVec2,
    pub items: usize,
    pub blocks: usize,
    pub triangles: u64,
    pub variant: Option<ShaderVariant>,
    pub draw_secs: f64,
}

/// Out-of-core ray-cast volume mapper.
///
/// Owns every cached GPU resource (resident textures, lookup tables, linked
/// program, accumulation targets). Call `release_graphics_resources` when the
/// host context goes away.
pub struct VolumeMapper {
    config: MapperConfig,
    probe: MemoryProbe,
    cache: ScalarFieldCache,
    machine: ShaderVariantMachine,
    quality: QualityController,
    tables: TransferTables,
    accumulation: AccumulationTargets,
    compositor: Compositor,
    noise_uploaded: bool,
    unsupported_reported: bool,
    last_draw_secs: f64,
    stats: FrameStats,
}

impl VolumeMapper {
    pub fn new(config: MapperConfig) -> Self {
        log::info!(
            "VolumeMapper: memory budget {} bytes, densify {} levels",
            config.memory_budget_bytes(),
            config.densify_levels
        );
        Self {
            probe: MemoryProbe::new(&config),
            cache: ScalarFieldCache::new(),
            machine: ShaderVariantMachine::new(),
            quality: QualityController::new(),
            tables: TransferTables::new(),
            accumulation: AccumulationTargets::new(),
            compositor: Compositor::new(config.progress_interval_secs),
            noise_uploaded: false,
            unsupported_reported: false,
            last_draw_secs: 0.0,
            stats: FrameStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: MapperConfig) {
        self.probe.set_budget(&config);
        self.compositor.set_progress_interval(config.progress_interval_secs);
        self.config = config;
    }

    pub fn reduction_factor(&self) -> f64 {
        self.quality.reduction_factor()
    }

    pub fn last_frame(&self) -> &FrameStats {
        &self.stats
    }

    pub fn cache(&self) -> &ScalarFieldCache {
        &self.cache
    }

    pub fn shader_machine(&self) -> &ShaderVariantMachine {
        &self.machine
    }

    pub fn tables(&self) -> &TransferTables {
        &self.tables
    }

    /// Render `request` into the host's color buffer.
    pub fn render<B: GpuBackend + ?Sized, H: HostSurface + ?Sized>(
        &mut self,
        backend: &mut B,
        host: &mut H,
        request: &FrameRequest<'_>,
    ) -> FrameOutcome {
        let start = Instant::now();
        let outcome = match self.render_frame(backend, host, request) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("VolumeMapper: frame skipped: {e}");
                FrameOutcome::failed(e.to_string())
            }
        };
        if outcome.rendered {
            self.last_draw_secs = start.elapsed().as_secs_f64();
            self.stats.draw_secs = self.last_draw_secs;
        }
        outcome
    }

    fn render_frame<B: GpuBackend + ?Sized, H: HostSurface + ?Sized>(
        &mut self,
        backend: &mut B,
        host: &mut H,
        request: &FrameRequest<'_>,
    ) -> Result<FrameOutcome, RenderError> {
        let missing = backend.capabilities().missing();
        if !missing.is_empty() {
            if self.unsupported_reported {
                return Ok(FrameOutcome::skipped());
            }
            self.unsupported_reported = true;
            return Err(RenderError::Unsupported { missing });
        }

        let volume = request.volume;
        if let Some(mask) = request.mask {
            if mask.volume.dimensions() != volume.dimensions()
                || mask.volume.is_cell_data() != volume.is_cell_data()
            {
                return Err(RenderError::InvalidVolume(format!(
                    "mask dimensions {} do not match volume {}",
                    mask.volume.dimensions(),
                    volume.dimensions()
                )));
            }
        }
        let model = request.transform;
        if model.determinant().abs() < f64::EPSILON {
            return Err(RenderError::InvalidVolume("singular volume transform".into()));
        }
        let inverse_model = model.inverse();

        let viewport = host.viewport();
        if viewport.width == 0 || viewport.height == 0 {
            return Ok(FrameOutcome::skipped());
        }

        // PreRender
        let reduction_factor = self.quality.update(
            self.last_draw_secs,
            request.allocated_secs,
            &self.config,
            request.canonical,
        );
        let target_size = reduced_size(&viewport, reduction_factor);
        let sample_distance =
            actual_sample_distance(&self.config, reduction_factor, volume.spacing(), &model);

        let mask_kind = request.mask.map(|m| m.kind);
        let items = RenderItem::for_frame(
            volume,
            &request.cropping,
            inverse_model.transform_point3(request.camera.position),
        );
        let variant = ShaderVariant::select(&VariantRequest {
            blend: request.blend,
            components: volume.components(),
            mask: mask_kind,
            shade: request.property.shade,
            parallel: request.camera.parallel_projection,
            cropping: cropping_region_count(&request.cropping) > 1,
        })?;

        self.accumulation.prepare(backend, target_size, request.blend)?;
        self.accumulation.clear(backend, request.blend);
        self.tables.update(
            backend,
            request.transfer,
            volume.scalar_range(),
            request.blend,
            sample_distance,
            request.property.scalar_opacity_unit_distance,
            mask_kind == Some(MaskKind::LabelMap),
        );
        if !self.noise_uploaded {
            let noise = jitter_noise(NOISE_TEXTURE_SIZE);
            backend.upload_noise(NOISE_TEXTURE_SIZE, &noise);
            log::info!("VolumeMapper: noise texture {0}x{0}", NOISE_TEXTURE_SIZE);
            self.noise_uploaded = true;
        }

        let mut host = HostStateScope::enter(host);
        backend.grab_depth(viewport);

        match self.machine.transition(variant, request.registry, backend) {
            Ok(_) if self.machine.is_valid() => {}
            // Reported when the link failed; stays suppressed until a relink succeeds.
            Ok(_) => return Ok(FrameOutcome::skipped()),
            Err(e) => {
                log::error!("VolumeMapper: dispatch suppressed: {e}");
                return Ok(FrameOutcome::failed(e.to_string()));
            }
        }

        let frame = FrameContext {
            camera: request.camera,
            model,
            inverse_model,
            viewport,
            target_size,
            reduction_factor,
            blend: request.blend,
            variant,
            property: request.property,
            mask: mask_kind,
            cropping: request.cropping,
        };
        backend.begin_frame(&frame);
        let slots = SlotTable::for_variant(&variant);
        bind_frame_slots(backend, &slots);

        // Render
        let mut program = ActiveProgram {
            machine: &mut self.machine,
            registry: request.registry,
            variant,
            slots,
        };
        let report_progress = self.config.report_progress && !request.canonical;
        let mut job = CompositeJob {
            volume,
            mask: request.mask.map(|m| m.volume),
            clip_planes: request.clip_planes,
            frame,
            sample_distance,
            densify_levels: self.config.densify_levels,
            report_progress,
        };
        let composited = self.compositor.render_ordered(
            backend,
            &mut *host,
            &mut self.cache,
            &mut self.probe,
            &mut program,
            &mut job,
            &items,
        );

        // PostRender
        for slot in program.slots.release_order() {
            backend.unbind(slot);
        }
        let final_variant = program.variant;
        let composite = composited?;
        {
            let mut scope = StateScope::enter(&mut *backend, RenderState::BLIT);
            scope.blit_to_host(viewport);
        }
        if !composite.aborted {
            if report_progress && composite.progress < 1.0 {
                host.report_progress(1.0);
            }
            host.render_complete();
        }

        self.stats = FrameStats {
            reduction_factor,
            sample_distance,
            target_size,
            items: items.len(),
            blocks: composite.blocks,
            triangles: composite.triangles,
            variant: Some(final_variant),
            draw_secs: self.stats.draw_secs,
        };
        log::debug!(
            "VolumeMapper: {} blocks, {} triangles, factor {reduction_factor:.3}, step {sample_distance:.4}",
            composite.blocks,
            composite.triangles
        );
        Ok(FrameOutcome {
            rendered: true,
            aborted: composite.aborted,
            diagnostic: None,
        })
    }

    /// Drop every cached GPU resource. The next frame rebuilds what it needs.
    pub fn release_graphics_resources<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        self.cache.release(backend);
        self.tables.release();
        self.accumulation.release();
        self.machine.reset();
        self.probe.forget_accepted();
        self.quality.reset();
        self.noise_uploaded = false;
        backend.release_resources();
        log::info!("VolumeMapper: graphics resources released");
    }
}

/// Ray-start jitter in [0, 1), deterministic per size.
fn jitter_noise(size: u32) -> Vec<f32> {
    let mut state: u32 = 0x9e37_79b9;
    (0..size * size)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 8) as f32 / (1u32 << 24) as f32
        })
        .collect()
}
