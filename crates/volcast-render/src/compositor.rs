use std::time::{Duration, Instant};

use glam::DVec3;
use volcast_core::error::RenderError;
use volcast_core::types::{Bounds, CroppingConfig, Extent, Plane, Volume};

use crate::backend::{Binding, DrawPass, FrameContext, GpuBackend, HostSurface, HullDraw};
use crate::bindings::{SlotTable, TextureSlot};
use crate::clipper::{clip_and_densify, ClippedHull, ConvexHullBuilder, HullBuilder};
use crate::memory_probe::MemoryProbe;
use crate::regions::{ordered_regions, region_extent};
use crate::render_state::{RenderState, StateScope};
use crate::scalar_cache::{Acquired, ScalarFieldCache, TextureWindow};
use crate::shader_variant::{ShaderSourceRegistry, ShaderVariant, ShaderVariantMachine};

/// One front-to-back compositing step: a cropping region or the whole volume.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderItem {
    /// Local-space box to draw.
    pub bounds: Bounds,
    /// Data extent whose samples cover `bounds`.
    pub extent: Extent,
}

impl RenderItem {
    pub fn whole(volume: &Volume) -> Self {
        Self {
            bounds: volume.bounds(),
            extent: volume.data_extent(),
        }
    }

    /// Items for a frame: the included cropping regions nearest first, or the whole volume.
    pub fn for_frame(volume: &Volume, cropping: &CroppingConfig, camera_local: DVec3) -> Vec<Self> {
        if !cropping.enabled {
            return vec![Self::whole(volume)];
        }
        ordered_regions(&volume.bounds(), cropping, camera_local)
            .into_iter()
            .map(|region| Self {
                extent: region_extent(volume, &region.bounds),
                bounds: region.bounds,
            })
            .collect()
    }
}

/// Everything one block draw needs.
#[derive(Debug, Clone)]
pub struct BlockContext {
    pub window: TextureWindow,
    pub hull: ClippedHull,
    pub index: usize,
    pub count: usize,
    pub sample_distance: f64,
}

/// Frame-wide inputs of `Compositor::render_ordered`.
pub struct CompositeJob<'a> {
    pub volume: &'a Volume,
    pub mask: Option<&'a Volume>,
    /// World-space clip planes.
    pub clip_planes: &'a [Plane],
    pub frame: FrameContext,
    pub sample_distance: f64,
    pub densify_levels: u32,
    pub report_progress: bool,
}

/// The linked program and the slots it reads.
pub struct ActiveProgram<'a> {
    pub machine: &'a mut ShaderVariantMachine,
    pub registry: &'a dyn ShaderSourceRegistry,
    pub variant: ShaderVariant,
    pub slots: SlotTable,
}

impl ActiveProgram<'_> {
    /// Switch to the multi-pass program that reads the previous partial result.
    /// Only the cropping stage changes. Returns whether a switch happened.
    pub fn ensure_multi_pass<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        frame: &mut FrameContext,
    ) -> Result<bool, RenderError> {
        if self.variant.cropping {
            return Ok(false);
        }
        let variant = self.variant.with_cropping(true);
        self.machine.transition(variant, self.registry, backend)?;
        let slots = SlotTable::for_variant(&variant);
        for &slot in slots.slots() {
            if !self.slots.contains(slot) && !is_per_block(slot) {
                backend.bind(slot, Binding::Owned);
            }
        }
        log::info!("Compositor: streaming in blocks, switching to multi-pass compositing");
        self.variant = variant;
        self.slots = slots;
        frame.variant = variant;
        backend.begin_frame(frame);
        Ok(true)
    }
}

/// Slots rebound for every block rather than once per frame.
pub fn is_per_block(slot: TextureSlot) -> bool {
    matches!(slot, TextureSlot::Scalar | TextureSlot::Mask)
}

/// Bind the frame-constant slots of `slots` to their backend resources.
pub fn bind_frame_slots<B: GpuBackend + ?Sized>(backend: &mut B, slots: &SlotTable) {
    for &slot in slots.slots() {
        if !is_per_block(slot) {
            backend.bind(slot, Binding::Owned);
        }
    }
}

/// Admits at most one progress event per interval.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval_secs: f64) -> Self {
        Self {
            interval: Duration::from_secs_f64(interval_secs.max(0.0)),
            last: None,
        }
    }

    pub fn set_interval(&mut self, interval_secs: f64) {
        self.interval = Duration::from_secs_f64(interval_secs.max(0.0));
    }

    pub fn admit(&mut self, now: Instant) -> bool {
        let due = self
            .last
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.last = Some(now);
        }
        due
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompositeOutcome {
    pub aborted: bool,
    /// Blocks drawn, streamed blocks counted individually.
    pub blocks: usize,
    pub triangles: u64,
    /// Last progress value handed to the host, 0 when none was.
    pub progress: f64,
}

/// Renders items strictly nearest first, ping-ponging the accumulation target
/// between blocks.
pub struct Compositor {
    builder: Box<dyn HullBuilder>,
    throttle: ProgressThrottle,
}

impl Compositor {
    pub fn new(progress_interval_secs: f64) -> Self {
        Self::with_builder(Box::new(ConvexHullBuilder), progress_interval_secs)
    }

    pub fn with_builder(builder: Box<dyn HullBuilder>, progress_interval_secs: f64) -> Self {
        Self {
            builder,
            throttle: ProgressThrottle::new(progress_interval_secs),
        }
    }

    pub fn set_progress_interval(&mut self, interval_secs: f64) {
        self.throttle.set_interval(interval_secs);
    }

    /// Draw `items` in order. Each block is checked for a host abort before it
    /// is drawn; blocks already composited stay in the target.
    #[allow(clippy::too_many_arguments)]
    pub fn render_ordered<B: GpuBackend + ?Sized, H: HostSurface + ?Sized>(
        &mut self,
        backend: &mut B,
        host: &mut H,
        cache: &mut ScalarFieldCache,
        probe: &mut MemoryProbe,
        program: &mut ActiveProgram<'_>,
        job: &mut CompositeJob<'_>,
        items: &[RenderItem],
    ) -> Result<CompositeOutcome, RenderError> {
        let mut outcome = CompositeOutcome::default();
        let count = items.len();
        self.throttle.reset();

        for (index, item) in items.iter().enumerate() {
            if host.check_abort() {
                log::info!("Compositor: aborted before item {}/{count}", index + 1);
                outcome.aborted = true;
                return Ok(outcome);
            }
            let camera_local = job.frame.camera_local();
            match cache.acquire(backend, probe, job.volume, job.mask, &item.extent, camera_local)? {
                Acquired::Resident(window) => {
                    let ctx = self.block_context(job, window, &item.bounds, index, count);
                    outcome.triangles += draw_block(backend, job, program, &ctx) as u64;
                    outcome.blocks += 1;
                    self.progress(host, job, (index + 1) as f64 / count as f64, &mut outcome);
                }
                Acquired::Streamed(plan) => {
                    if plan.blocks.len() > 1 {
                        program.ensure_multi_pass(backend, &mut job.frame)?;
                    }
                    let n = plan.blocks.len();
                    for (b, block) in plan.blocks.iter().enumerate() {
                        if b > 0 && host.check_abort() {
                            log::info!("Compositor: aborted before streamed block {}/{n}", b + 1);
                            outcome.aborted = true;
                            return Ok(outcome);
                        }
                        let window = cache.load_block(backend, probe, job.volume, job.mask, &block.extent)?;
                        let bounds = intersect(&item.bounds, &block.bounds);
                        let ctx = self.block_context(job, window, &bounds, index, count);
                        outcome.triangles += draw_block(backend, job, program, &ctx) as u64;
                        outcome.blocks += 1;
                        let done = index as f64 + (b + 1) as f64 / n as f64;
                        self.progress(host, job, done / count as f64, &mut outcome);
                    }
                }
            }
        }
        Ok(outcome)
    }

    fn block_context(
        &self,
        job: &CompositeJob<'_>,
        window: TextureWindow,
        bounds: &Bounds,
        index: usize,
        count: usize,
    ) -> BlockContext {
        let hull = clip_and_densify(
            self.builder.as_ref(),
            bounds,
            job.clip_planes,
            &job.frame.camera,
            &job.frame.model,
            &job.frame.inverse_model,
            job.densify_levels,
        );
        BlockContext {
            window,
            hull,
            index,
            count,
            sample_distance: job.sample_distance,
        }
    }

    fn progress<H: HostSurface + ?Sized>(
        &mut self,
        host: &mut H,
        job: &CompositeJob<'_>,
        progress: f64,
        outcome: &mut CompositeOutcome,
    ) {
        if job.report_progress && self.throttle.admit(Instant::now()) {
            host.report_progress(progress);
            outcome.progress = progress;
        }
    }
}

/// Depth-prime (with clip planes) and ray-march one block, then hand its
/// result to the next block. Returns the triangles submitted.
fn draw_block<B: GpuBackend + ?Sized>(
    backend: &mut B,
    job: &CompositeJob<'_>,
    program: &ActiveProgram<'_>,
    ctx: &BlockContext,
) -> u32 {
    backend.bind(TextureSlot::Scalar, Binding::Volume(ctx.window.texture));
    if program.slots.contains(TextureSlot::Mask) {
        if let Some(mask) = ctx.window.mask {
            backend.bind(TextureSlot::Mask, Binding::Volume(mask));
        }
    }
    if ctx.hull.is_empty() {
        log::debug!("Compositor: block {}/{} clipped away", ctx.index + 1, ctx.count);
    }

    let mut triangles = 0;
    if !job.clip_planes.is_empty() {
        let mut scope = StateScope::enter(&mut *backend, RenderState::DEPTH_PRIME);
        triangles += scope.draw_hull(&HullDraw {
            pass: DrawPass::DepthPrime,
            hull: &ctx.hull,
            window: &ctx.window,
            sample_distance: ctx.sample_distance,
        });
    }
    {
        let mut scope = StateScope::enter(&mut *backend, RenderState::RAY_MARCH);
        triangles += scope.draw_hull(&HullDraw {
            pass: DrawPass::RayMarch,
            hull: &ctx.hull,
            window: &ctx.window,
            sample_distance: ctx.sample_distance,
        });
    }
    backend.copy_accumulation_to_input();
    triangles
}

fn intersect(a: &Bounds, b: &Bounds) -> Bounds {
    Bounds::new(a.min.max(b.min), a.max.min(b.max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{DMat4, IVec3, UVec2, UVec3};
    use volcast_core::config::MapperConfig;
    use volcast_core::transfer::{ColorChannel, PiecewiseTransferFunction};
    use volcast_core::types::{BlendMode, Camera, ScalarArray, Viewport, VolumeProperty};

    use crate::accumulation::AccumulationTargets;
    use crate::shader_variant::{ShaderLibrary, ShaderStage, VariantRequest};
    use crate::software::{SoftwareBackend, SoftwareSurface};
    use crate::tables::TransferTables;

    /// 4x4x8 points: scalar 0 in the front half (z < 4), 1 in the back half.
    fn two_tone() -> Volume {
        let mut values = Vec::with_capacity(128);
        for z in 0..8 {
            for _ in 0..16 {
                values.push(if z < 4 { 0.0 } else { 1.0 });
            }
        }
        Volume::new(UVec3::new(4, 4, 8), DVec3::ZERO, DVec3::ONE, ScalarArray::F32(values))
            .expect("valid volume")
    }

    fn red_front_blue_back() -> PiecewiseTransferFunction {
        let mut tf = PiecewiseTransferFunction::new();
        tf.add_opacity_point(0.0, 0.5);
        tf.add_color_point(ColorChannel::Main, 0.0, [1.0, 0.0, 0.0]);
        tf.add_color_point(ColorChannel::Main, 1.0, [0.0, 0.0, 1.0]);
        tf
    }

    struct Fixture {
        backend: SoftwareBackend,
        surface: SoftwareSurface,
        cache: ScalarFieldCache,
        probe: MemoryProbe,
        machine: ShaderVariantMachine,
        library: ShaderLibrary,
        frame: FrameContext,
    }

    impl Fixture {
        fn new(memory_budget: u64, cropping: bool) -> Self {
            let mut backend = SoftwareBackend::new();
            let library = ShaderLibrary::with_placeholders();
            let mut machine = ShaderVariantMachine::new();
            let variant = ShaderVariant::select(&VariantRequest {
                blend: BlendMode::Composite,
                components: 1,
                mask: None,
                shade: false,
                parallel: true,
                cropping,
            })
            .expect("supported");
            machine
                .transition(variant, &library, &mut backend)
                .expect("links");

            let viewport = Viewport {
                x: 0,
                y: 0,
                width: 4,
                height: 4,
            };
            let camera = Camera {
                position: DVec3::new(1.5, 1.5, -10.0),
                focal_point: DVec3::new(1.5, 1.5, 0.0),
                parallel_projection: true,
                parallel_scale: 2.0,
                clipping_range: [0.1, 100.0],
                ..Camera::default()
            };
            let frame = FrameContext {
                camera,
                model: DMat4::IDENTITY,
                inverse_model: DMat4::IDENTITY,
                viewport,
                target_size: UVec2::new(4, 4),
                reduction_factor: 1.0,
                blend: BlendMode::Composite,
                variant,
                property: VolumeProperty::default(),
                mask: None,
                cropping: CroppingConfig::default(),
            };

            let mut targets = AccumulationTargets::new();
            targets
                .prepare(&mut backend, frame.target_size, BlendMode::Composite)
                .expect("targets");
            targets.clear(&mut backend, BlendMode::Composite);
            backend.begin_frame(&frame);

            Self {
                backend,
                surface: SoftwareSurface::new(4, 4),
                cache: ScalarFieldCache::new(),
                probe: MemoryProbe::new(&MapperConfig {
                    max_memory_bytes: memory_budget,
                    max_memory_fraction: 1.0,
                    ..MapperConfig::default()
                }),
                machine,
                library,
                frame,
            }
        }

        fn render(
            &mut self,
            volume: &Volume,
            clip_planes: &[Plane],
            items: &[RenderItem],
        ) -> Result<(CompositeOutcome, ShaderVariant), RenderError> {
            let range = volume.scalar_range();
            let mut tables = TransferTables::new();
            tables.update(
                &mut self.backend,
                &red_front_blue_back(),
                range,
                BlendMode::Composite,
                1.0,
                1.0,
                false,
            );
            let variant = self.frame.variant;
            let slots = SlotTable::for_variant(&variant);
            bind_frame_slots(&mut self.backend, &slots);
            let mut program = ActiveProgram {
                machine: &mut self.machine,
                registry: &self.library,
                variant,
                slots,
            };
            let mut job = CompositeJob {
                volume,
                mask: None,
                clip_planes,
                frame: self.frame.clone(),
                sample_distance: 1.0,
                densify_levels: 2,
                report_progress: true,
            };
            let mut compositor = Compositor::new(0.0);
            let outcome = compositor.render_ordered(
                &mut self.backend,
                &mut self.surface,
                &mut self.cache,
                &mut self.probe,
                &mut program,
                &mut job,
                items,
            )?;
            Ok((outcome, program.variant))
        }
    }

    fn halves() -> (RenderItem, RenderItem) {
        let front = RenderItem {
            bounds: Bounds::new(DVec3::ZERO, DVec3::new(3.0, 3.0, 3.5)),
            extent: Extent::new(IVec3::ZERO, IVec3::new(3, 3, 4)),
        };
        let back = RenderItem {
            bounds: Bounds::new(DVec3::new(0.0, 0.0, 3.5), DVec3::new(3.0, 3.0, 7.0)),
            extent: Extent::new(IVec3::new(0, 0, 3), IVec3::new(3, 3, 7)),
        };
        (front, back)
    }

    #[test]
    fn test_reverse_order_changes_composite_result() {
        let volume = two_tone();
        let (front, back) = halves();

        let mut forward = Fixture::new(1 << 20, true);
        forward
            .render(&volume, &[], &[front.clone(), back.clone()])
            .expect("renders");
        let mut reversed = Fixture::new(1 << 20, true);
        reversed.render(&volume, &[], &[back, front]).expect("renders");

        let a = forward.backend.accumulation_pixel(1, 1).expect("pixel");
        let b = reversed.backend.accumulation_pixel(1, 1).expect("pixel");
        assert!((a[3] - b[3]).abs() < 1e-6, "coverage is order independent");
        assert!(a[0] > a[2], "front is red: {a:?}");
        assert!(b[2] > b[0], "reversed lets blue win: {b:?}");
    }

    #[test]
    fn test_abort_keeps_partial_result() {
        let volume = two_tone();
        let (front, back) = halves();
        let mut f = Fixture::new(1 << 20, true);
        f.surface.abort_after(1);
        let (outcome, _) = f.render(&volume, &[], &[front, back]).expect("renders");
        assert!(outcome.aborted);
        assert_eq!(outcome.blocks, 1);
        let p = f.backend.accumulation_pixel(1, 1).expect("pixel");
        assert!(p[3] > 0.0);
    }

    #[test]
    fn test_streaming_switches_to_multi_pass() {
        let volume = two_tone();
        // Too small for the 512-byte volume, large enough for 4x4x2 blocks.
        let mut f = Fixture::new(160, false);
        let before = f.machine.stage_changes(ShaderStage::Cropping);
        let (outcome, variant) = f
            .render(&volume, &[], &[RenderItem::whole(&volume)])
            .expect("streams");
        assert!(outcome.blocks > 1);
        assert!(variant.cropping);
        assert_eq!(f.machine.stage_changes(ShaderStage::Cropping), before + 1);
        assert_eq!(f.machine.stage_changes(ShaderStage::Trace), 1);
        assert_eq!(f.backend.bound(TextureSlot::AccumulationInput), Some(Binding::Owned));
    }

    #[test]
    fn test_streamed_result_matches_resident() {
        let volume = two_tone();
        let mut resident = Fixture::new(1 << 20, false);
        resident
            .render(&volume, &[], &[RenderItem::whole(&volume)])
            .expect("renders");
        let mut streamed = Fixture::new(160, false);
        streamed
            .render(&volume, &[], &[RenderItem::whole(&volume)])
            .expect("streams");
        for y in 0..4 {
            for x in 0..4 {
                let a = resident.backend.accumulation_pixel(x, y).expect("pixel");
                let b = streamed.backend.accumulation_pixel(x, y).expect("pixel");
                for k in 0..4 {
                    assert!((a[k] - b[k]).abs() < 1e-5, "({x},{y}) {a:?} vs {b:?}");
                }
            }
        }
    }

    #[test]
    fn test_fully_clipped_block_submits_nothing() {
        let volume = two_tone();
        let mut f = Fixture::new(1 << 20, false);
        let away = Plane::new(DVec3::new(0.0, 0.0, 100.0), DVec3::Z);
        let (outcome, _) = f
            .render(&volume, &[away], &[RenderItem::whole(&volume)])
            .expect("empty draw is fine");
        assert_eq!(outcome.triangles, 0);
        assert_eq!(f.backend.ray_march_draws(), 0);
        assert_eq!(f.backend.accumulation_pixel(1, 1), Some([0.0; 4]));
    }

    #[test]
    fn test_clip_planes_add_depth_prime_pass() {
        let volume = two_tone();
        let mut f = Fixture::new(1 << 20, false);
        let keep_front = Plane::new(DVec3::new(0.0, 0.0, 2.0), DVec3::NEG_Z);
        f.render(&volume, &[keep_front], &[RenderItem::whole(&volume)])
            .expect("renders");
        assert_eq!(f.backend.depth_prime_draws(), 1);
        assert_eq!(f.backend.ray_march_draws(), 1);
        assert_eq!(f.backend.render_state(), RenderState::HOST_DEFAULT);
        // Only the red half survives.
        let p = f.backend.accumulation_pixel(1, 1).expect("pixel");
        assert!(p[0] > 0.0 && p[2] == 0.0, "{p:?}");
    }

    #[test]
    fn test_progress_reported_per_item() {
        let volume = two_tone();
        let (front, back) = halves();
        let mut f = Fixture::new(1 << 20, true);
        f.render(&volume, &[], &[front, back]).expect("renders");
        assert_eq!(f.surface.progress_events(), &[0.5, 1.0]);
    }

    #[test]
    fn test_throttle_admits_once_per_interval() {
        let mut throttle = ProgressThrottle::new(1.0);
        let t0 = Instant::now();
        assert!(throttle.admit(t0));
        assert!(!throttle.admit(t0 + Duration::from_millis(500)));
        assert!(throttle.admit(t0 + Duration::from_millis(1000)));
        assert!(!throttle.admit(t0 + Duration::from_millis(1999)));
        throttle.reset();
        assert!(throttle.admit(t0 + Duration::from_millis(1999)));
    }

    #[test]
    fn test_items_for_cropping_regions() {
        let volume = two_tone();
        let cropping = CroppingConfig {
            enabled: true,
            planes: [1.0, 2.0, 1.0, 2.0, 2.0, 4.0],
            flags: volcast_core::constants::CROPPING_FLAGS_CENTER | 1 << 22,
        };
        let items = RenderItem::for_frame(&volume, &cropping, DVec3::new(1.5, 1.5, -10.0));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].bounds.min.z, 2.0);
        assert_eq!(items[1].bounds.min.z, 4.0);
        assert_eq!(items[1].extent.max.z, 7);
        assert_eq!(RenderItem::for_frame(&volume, &CroppingConfig::default(), DVec3::ZERO).len(), 1);
    }
}
