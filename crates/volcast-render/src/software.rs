//! CPU reference implementation of the GPU seam.
//!
//! `SoftwareBackend` ray-marches the proxy hulls on the CPU with the same
//! sampling rules the ray-cast program follows, so orchestration can be tested
//! and benchmarked without a device. It also owns the host framebuffer, the way
//! a GL context owns its default framebuffer.

use std::collections::HashMap;

use glam::{DVec3, UVec2, UVec3};
use volcast_core::error::RenderError;
use volcast_core::math::view_basis;
use volcast_core::types::{Interpolation, MaskKind, Viewport};

use crate::backend::{
    Binding, Capabilities, DrawPass, FrameContext, GpuBackend, HostSurface, HullDraw, TexelData,
    TextureId, VoxelFormat,
};
use crate::bindings::TextureSlot;
use crate::render_state::RenderState;
use crate::shader_variant::{MethodFamily, ProgramSource, RayMethod, Shading};

/// Slack when assigning ray samples to blocks, in units of the sample distance.
const SAMPLE_SNAP: f64 = 1e-6;

struct SoftTexture {
    size: UVec3,
    format: VoxelFormat,
    data: Option<TexelData>,
}

struct Accumulation {
    size: UVec2,
    output: Vec<[f32; 4]>,
    input: Vec<[f32; 4]>,
    scalar_output: Option<Vec<f32>>,
    scalar_input: Option<Vec<f32>>,
    clear_color: [f32; 4],
    clear_scalar: f32,
}

/// Host color and depth. Depth is the distance along the view direction.
struct Framebuffer {
    width: u32,
    height: u32,
    color: Vec<[f32; 4]>,
    depth: Vec<f64>,
}

impl Framebuffer {
    fn resize_to_cover(&mut self, viewport: &Viewport) {
        let width = self.width.max(viewport.x + viewport.width);
        let height = self.height.max(viewport.y + viewport.height);
        if width == self.width && height == self.height {
            return;
        }
        let mut color = vec![[0.0; 4]; (width * height) as usize];
        let mut depth = vec![f64::INFINITY; (width * height) as usize];
        for y in 0..self.height {
            for x in 0..self.width {
                let from = (y * self.width + x) as usize;
                let to = (y * width + x) as usize;
                color[to] = self.color[from];
                depth[to] = self.depth[from];
            }
        }
        *self = Framebuffer {
            width,
            height,
            color,
            depth,
        };
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height).then(|| (y * self.width + x) as usize)
    }
}

/// Deterministic CPU backend with simulated device memory.
pub struct SoftwareBackend {
    capabilities: Capabilities,
    memory_bytes: u64,
    allocated: u64,
    next_texture: u64,
    textures: HashMap<TextureId, SoftTexture>,
    uploads: u64,
    opacity: Vec<f32>,
    colors: HashMap<TextureSlot, Vec<[f32; 3]>>,
    noise: Vec<f32>,
    accumulation: Option<Accumulation>,
    depth_grab: Vec<f64>,
    depth_grab_viewport: Viewport,
    bindings: HashMap<TextureSlot, Binding>,
    state: RenderState,
    link_failures: Vec<String>,
    linked: Option<ProgramSource>,
    frame: Option<FrameContext>,
    framebuffer: Framebuffer,
    ray_march_draws: u64,
    depth_prime_draws: u64,
    triangles: u64,
}

impl SoftwareBackend {
    /// Backend with effectively unlimited memory.
    pub fn new() -> Self {
        Self::with_memory(u64::MAX / 2, 2048)
    }

    /// Backend with `memory_bytes` of texture memory and a 3-D texture edge limit.
    pub fn with_memory(memory_bytes: u64, max_texture_dimension_3d: u32) -> Self {
        Self {
            capabilities: Capabilities {
                texture_3d: true,
                float_render_targets: true,
                depth_texture_copy: true,
                max_texture_dimension_3d,
                max_sampled_textures: 16,
            },
            memory_bytes,
            allocated: 0,
            next_texture: 1,
            textures: HashMap::new(),
            uploads: 0,
            opacity: Vec::new(),
            colors: HashMap::new(),
            noise: Vec::new(),
            accumulation: None,
            depth_grab: Vec::new(),
            depth_grab_viewport: Viewport::default(),
            bindings: HashMap::new(),
            state: RenderState::HOST_DEFAULT,
            link_failures: Vec::new(),
            linked: None,
            frame: None,
            framebuffer: Framebuffer {
                width: 0,
                height: 0,
                color: Vec::new(),
                depth: Vec::new(),
            },
            ray_march_draws: 0,
            depth_prime_draws: 0,
            triangles: 0,
        }
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    /// Make every link whose sources mention `pattern` fail.
    pub fn fail_links_containing(&mut self, pattern: &str) {
        self.link_failures.push(pattern.to_string());
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    /// Successful `write_texture_3d` calls.
    pub fn upload_count(&self) -> u64 {
        self.uploads
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn linked_program(&self) -> Option<&ProgramSource> {
        self.linked.as_ref()
    }

    pub fn bound(&self, slot: TextureSlot) -> Option<Binding> {
        self.bindings.get(&slot).copied()
    }

    pub fn opacity_table(&self) -> &[f32] {
        &self.opacity
    }

    pub fn noise_len(&self) -> usize {
        self.noise.len()
    }

    pub fn has_scalar_accumulation(&self) -> bool {
        self.accumulation
            .as_ref()
            .is_some_and(|a| a.scalar_output.is_some())
    }

    pub fn ray_march_draws(&self) -> u64 {
        self.ray_march_draws
    }

    pub fn depth_prime_draws(&self) -> u64 {
        self.depth_prime_draws
    }

    pub fn triangles_submitted(&self) -> u64 {
        self.triangles
    }

    /// Grow the host framebuffer to `width` x `height`, keeping its contents.
    pub fn resize_framebuffer(&mut self, width: u32, height: u32) {
        self.framebuffer.resize_to_cover(&Viewport {
            x: 0,
            y: 0,
            width,
            height,
        });
    }

    /// Stamp opaque geometry at `depth` along the view direction into the host depth buffer.
    pub fn set_host_depth(&mut self, x: u32, y: u32, depth: f64) {
        if let Some(i) = self.framebuffer.index(x, y) {
            self.framebuffer.depth[i] = depth;
        }
    }

    /// Premultiplied host color at a pixel.
    pub fn host_pixel(&self, x: u32, y: u32) -> Option<[f32; 4]> {
        self.framebuffer.index(x, y).map(|i| self.framebuffer.color[i])
    }

    /// Premultiplied accumulation output at a target pixel.
    pub fn accumulation_pixel(&self, x: u32, y: u32) -> Option<[f32; 4]> {
        let acc = self.accumulation.as_ref()?;
        (x < acc.size.x && y < acc.size.y).then(|| acc.output[(y * acc.size.x + x) as usize])
    }

    fn ray_march(&mut self, draw: &HullDraw<'_>) {
        let Some(frame) = self.frame.as_ref() else {
            log::warn!("SoftwareBackend: ray march outside a frame");
            return;
        };
        let Some(acc) = self.accumulation.as_mut() else {
            log::warn!("SoftwareBackend: ray march without accumulation targets");
            return;
        };
        let Some(Binding::Volume(scalar_id)) = self.bindings.get(&TextureSlot::Scalar).copied()
        else {
            log::warn!("SoftwareBackend: ray march without a bound scalar texture");
            return;
        };
        let Some(scalar) = self.textures.get(&scalar_id).and_then(Sampler::from_texture) else {
            return;
        };
        let mask = match self.bindings.get(&TextureSlot::Mask) {
            Some(Binding::Volume(id)) => self.textures.get(id).and_then(Sampler::from_texture),
            _ => None,
        };

        let tables = Tables {
            opacity: &self.opacity,
            main: self.colors.get(&TextureSlot::ColorTable).map(Vec::as_slice),
            mask1: self.colors.get(&TextureSlot::Mask1ColorTable).map(Vec::as_slice),
            mask2: self.colors.get(&TextureSlot::Mask2ColorTable).map(Vec::as_slice),
        };
        let reads_color_input = self.bindings.contains_key(&TextureSlot::AccumulationInput);
        let reads_scalar_input = self.bindings.contains_key(&TextureSlot::ScalarAccumulationInput);

        let march = March {
            frame,
            draw,
            scalar,
            mask,
            tables,
            linear: frame.property.interpolation == Interpolation::Linear,
        };

        let size = acc.size;
        for j in 0..size.y {
            for i in 0..size.x {
                let index = (j * size.x + i) as usize;
                let depth = depth_at(&self.depth_grab, &self.depth_grab_viewport, size, i, j);
                let color_in = if reads_color_input {
                    acc.input[index]
                } else {
                    acc.clear_color
                };
                let scalar_in = match (&acc.scalar_input, reads_scalar_input) {
                    (Some(input), true) => input[index],
                    _ => acc.clear_scalar,
                };
                if let Some((color, scalar)) = march.pixel(i, j, size, depth, color_in, scalar_in) {
                    acc.output[index] = color;
                    if let Some(out) = acc.scalar_output.as_mut() {
                        out[index] = scalar;
                    }
                }
            }
        }
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn depth_at(grab: &[f64], viewport: &Viewport, target: UVec2, i: u32, j: u32) -> f64 {
    if viewport.width == 0 || viewport.height == 0 {
        return f64::INFINITY;
    }
    let x = (((i as f64 + 0.5) / target.x as f64) * viewport.width as f64) as u32;
    let y = (((j as f64 + 0.5) / target.y as f64) * viewport.height as f64) as u32;
    let x = x.min(viewport.width - 1);
    let y = y.min(viewport.height - 1);
    grab.get((y * viewport.width + x) as usize)
        .copied()
        .unwrap_or(f64::INFINITY)
}

struct Sampler<'a> {
    data: &'a TexelData,
    size: UVec3,
}

impl<'a> Sampler<'a> {
    fn from_texture(texture: &'a SoftTexture) -> Option<Self> {
        texture.data.as_ref().map(|data| Sampler {
            data,
            size: texture.size,
        })
    }

    fn texel(&self, x: u32, y: u32, z: u32) -> [f64; 4] {
        let i = (x + self.size.x * (y + self.size.y * z)) as usize;
        match self.data {
            TexelData::R32Float(v) => [v[i] as f64, 0.0, 0.0, 0.0],
            TexelData::Rgba8Unorm(v) => {
                let t = v[i];
                [t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64]
            }
            TexelData::R8Uint(v) => [v[i] as f64, 0.0, 0.0, 0.0],
        }
    }

    fn clamp_axis(&self, c: f64, axis: usize) -> u32 {
        c.round().clamp(0.0, (self.size[axis] - 1) as f64) as u32
    }

    fn nearest(&self, c: DVec3) -> [f64; 4] {
        self.texel(self.clamp_axis(c.x, 0), self.clamp_axis(c.y, 1), self.clamp_axis(c.z, 2))
    }

    /// Trilinear fetch at a continuous texel index, clamped to the edge.
    fn linear(&self, c: DVec3) -> [f64; 4] {
        let max = (self.size - UVec3::ONE).as_dvec3();
        let c = c.clamp(DVec3::ZERO, max);
        let base = c.floor();
        let f = c - base;
        let b = base.as_uvec3();
        let hi = (b + UVec3::ONE).min(self.size - UVec3::ONE);
        let mut out = [0.0; 4];
        for corner in 0..8u32 {
            let pick = |bit: u32, lo: u32, hi: u32| if corner & bit != 0 { hi } else { lo };
            let wx = if corner & 1 != 0 { f.x } else { 1.0 - f.x };
            let wy = if corner & 2 != 0 { f.y } else { 1.0 - f.y };
            let wz = if corner & 4 != 0 { f.z } else { 1.0 - f.z };
            let w = wx * wy * wz;
            if w == 0.0 {
                continue;
            }
            let t = self.texel(pick(1, b.x, hi.x), pick(2, b.y, hi.y), pick(4, b.z, hi.z));
            for k in 0..4 {
                out[k] += w * t[k];
            }
        }
        out
    }
}

struct Tables<'a> {
    opacity: &'a [f32],
    main: Option<&'a [[f32; 3]]>,
    mask1: Option<&'a [[f32; 3]]>,
    mask2: Option<&'a [[f32; 3]]>,
}

fn table_index(t: f64, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    ((t.clamp(0.0, 1.0) * (len - 1) as f64).round() as usize).min(len - 1)
}

impl Tables<'_> {
    fn opacity(&self, t: f64) -> f64 {
        self.opacity
            .get(table_index(t, self.opacity.len()))
            .copied()
            .unwrap_or(0.0) as f64
    }

    fn color(table: Option<&[[f32; 3]]>, t: f64) -> [f64; 3] {
        table
            .and_then(|tab| tab.get(table_index(t, tab.len())))
            .map_or([1.0; 3], |c| [c[0] as f64, c[1] as f64, c[2] as f64])
    }
}

/// One draw's worth of ray-march inputs.
struct March<'a> {
    frame: &'a FrameContext,
    draw: &'a HullDraw<'a>,
    scalar: Sampler<'a>,
    mask: Option<Sampler<'a>>,
    tables: Tables<'a>,
    linear: bool,
}

/// One voxel sample, classified.
struct Sample {
    /// Normalised lookup scalar.
    value: f64,
    /// Straight color and opacity.
    color: [f64; 3],
    alpha: f64,
}

impl March<'_> {
    /// World-space ray through the centre of target pixel `(i, j)`.
    fn world_ray(&self, i: u32, j: u32, size: UVec2) -> (DVec3, DVec3) {
        let cam = &self.frame.camera;
        let vp = &self.frame.viewport;
        let aspect = vp.width.max(1) as f64 / vp.height.max(1) as f64;
        let x = (i as f64 + 0.5) / size.x as f64 * 2.0 - 1.0;
        let y = (j as f64 + 0.5) / size.y as f64 * 2.0 - 1.0;
        let (right, up, forward) = view_basis(cam);
        if cam.parallel_projection {
            let h = cam.parallel_scale;
            (cam.position + right * (x * h * aspect) + up * (y * h), forward)
        } else {
            let tan = (cam.view_angle.to_radians() * 0.5).tan();
            let dir = (forward + right * (x * tan * aspect) + up * (y * tan)).normalize();
            (cam.position, dir)
        }
    }

    fn pixel(
        &self,
        i: u32,
        j: u32,
        size: UVec2,
        depth: f64,
        color_in: [f32; 4],
        scalar_in: f32,
    ) -> Option<([f32; 4], f32)> {
        let (origin, dir) = self.world_ray(i, j, size);
        let inverse = &self.frame.inverse_model;
        let local_origin = inverse.transform_point3(origin);
        let local_dir = inverse.transform_vector3(dir);
        let (t0, mut t1) = self.draw.hull.ray_interval(local_origin, local_dir)?;

        let forward = self.frame.camera.direction();
        let facing = dir.dot(forward);
        if depth.is_finite() && facing > 0.0 {
            let t_depth = (depth - (origin - self.frame.camera.position).dot(forward)) / facing;
            t1 = t1.min(t_depth);
        }
        if t1 <= t0 {
            return None;
        }

        let d = self.draw.sample_distance;
        let first = (t0 / d - SAMPLE_SNAP).ceil() as i64;
        let end = (t1 / d - SAMPLE_SNAP).ceil() as i64;
        let samples = (first..end).filter_map(|k| {
            let p = local_origin + local_dir * (k as f64 * d);
            self.classify(p, -local_dir)
        });

        let method = self.frame.variant.method;
        Some(match method.family() {
            MethodFamily::Composite => {
                let mut c = [color_in[0] as f64, color_in[1] as f64, color_in[2] as f64];
                let mut a = color_in[3] as f64;
                for s in samples {
                    let w = (1.0 - a) * s.alpha;
                    for k in 0..3 {
                        c[k] += w * s.color[k];
                    }
                    a += w;
                }
                ([c[0] as f32, c[1] as f32, c[2] as f32, a as f32], scalar_in)
            }
            MethodFamily::Mip | MethodFamily::MinIp => {
                let max = method.family() == MethodFamily::Mip;
                let mut best: Option<Sample> = None;
                let mut value = scalar_in as f64;
                for s in samples {
                    if (max && s.value > value) || (!max && s.value < value) {
                        value = s.value;
                        best = Some(s);
                    }
                }
                match best {
                    Some(s) => (premultiply(s.color, s.alpha), value as f32),
                    None => (color_in, scalar_in),
                }
            }
            MethodFamily::Additive => {
                let sum = scalar_in as f64 + samples.map(|s| s.alpha * s.value).sum::<f64>();
                let g = sum.clamp(0.0, 1.0) as f32;
                ([g, g, g, g], sum as f32)
            }
        })
    }

    /// Look up one sample at local position `p`; `None` when masked out.
    fn classify(&self, p: DVec3, to_eye: DVec3) -> Option<Sample> {
        let window = self.draw.window;
        let c = window.sample_coordinate(p);
        let method = self.frame.variant.method;

        let label = match &self.mask {
            Some(mask) => mask.nearest(c)[0] as u8,
            None => 0,
        };
        if method.uses_mask() && self.frame.mask == Some(MaskKind::Binary) && label == 0 {
            return None;
        }

        let texel = if self.linear {
            self.scalar.linear(c)
        } else {
            self.scalar.nearest(c)
        };
        let (value, mut color) = match window.format {
            VoxelFormat::Rgba8Unorm => {
                let [r0, r1] = window.table_range;
                let value = if r1 > r0 { (texel[3] - r0) / (r1 - r0) } else { 0.0 };
                (value, [texel[0] / 255.0, texel[1] / 255.0, texel[2] / 255.0])
            }
            _ => (texel[0], Tables::color(self.tables.main, texel[0])),
        };
        let alpha = self.tables.opacity(value);

        if method == RayMethod::CompositeLabelMask && (label == 1 || label == 2) {
            let table = if label == 1 { self.tables.mask1 } else { self.tables.mask2 };
            let label_color = Tables::color(table, value);
            let f = self.frame.property.mask_blend_factor as f64;
            for k in 0..3 {
                color[k] = color[k] * (1.0 - f) + label_color[k] * f;
            }
        }

        if self.frame.variant.shading == Shading::On {
            color = self.shade(c, color, to_eye);
        }
        Some(Sample {
            value,
            color,
            alpha,
        })
    }

    /// Headlight Blinn-Phong with a central-difference gradient.
    fn shade(&self, c: DVec3, color: [f64; 3], to_eye: DVec3) -> [f64; 3] {
        let fetch = |p: DVec3| self.scalar.linear(p)[0];
        let gradient = DVec3::new(
            fetch(c + DVec3::X) - fetch(c - DVec3::X),
            fetch(c + DVec3::Y) - fetch(c - DVec3::Y),
            fetch(c + DVec3::Z) - fetch(c - DVec3::Z),
        );
        let p = &self.frame.property;
        let ambient = p.ambient as f64;
        let Some(normal) = gradient.try_normalize() else {
            return color.map(|v| (v * ambient).min(1.0));
        };
        let light = to_eye.normalize_or_zero();
        let cos = normal.dot(light).abs();
        let diffuse = p.diffuse as f64 * cos;
        let specular = p.specular as f64 * cos.powf(p.specular_power as f64);
        color.map(|v| (v * (ambient + diffuse) + specular).min(1.0))
    }
}

fn premultiply(color: [f64; 3], alpha: f64) -> [f32; 4] {
    [
        (color[0] * alpha) as f32,
        (color[1] * alpha) as f32,
        (color[2] * alpha) as f32,
        alpha as f32,
    ]
}

impl GpuBackend for SoftwareBackend {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn proxy_texture_3d(&self, size: UVec3, _format: VoxelFormat) -> bool {
        let max = self.capabilities.max_texture_dimension_3d;
        self.capabilities.texture_3d
            && size.cmpgt(UVec3::ZERO).all()
            && size.cmple(UVec3::splat(max)).all()
    }

    fn create_texture_3d(&mut self, size: UVec3, format: VoxelFormat) -> Result<TextureId, RenderError> {
        if !self.proxy_texture_3d(size, format) {
            return Err(RenderError::Backend(format!(
                "3D texture {size} exceeds device limit {}",
                self.capabilities.max_texture_dimension_3d
            )));
        }
        let bytes = size.x as u64 * size.y as u64 * size.z as u64 * format.bytes_per_voxel();
        if self.allocated.saturating_add(bytes) > self.memory_bytes {
            return Err(RenderError::OutOfMemory(format!(
                "{bytes} bytes requested, {} of {} in use",
                self.allocated, self.memory_bytes
            )));
        }
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        self.allocated += bytes;
        self.textures.insert(
            id,
            SoftTexture {
                size,
                format,
                data: None,
            },
        );
        Ok(id)
    }

    fn write_texture_3d(&mut self, texture: TextureId, data: &TexelData) -> Result<(), RenderError> {
        let entry = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| RenderError::Backend(format!("unknown texture {texture:?}")))?;
        let expected = entry.size.x as usize * entry.size.y as usize * entry.size.z as usize;
        if data.format() != entry.format || data.len() != expected {
            return Err(RenderError::Backend(format!(
                "texture {texture:?} expects {expected} {:?} texels, got {} {:?}",
                entry.format,
                data.len(),
                data.format()
            )));
        }
        entry.data = Some(data.clone());
        self.uploads += 1;
        Ok(())
    }

    fn release_texture(&mut self, texture: TextureId) {
        if let Some(t) = self.textures.remove(&texture) {
            let bytes = t.size.x as u64 * t.size.y as u64 * t.size.z as u64 * t.format.bytes_per_voxel();
            self.allocated = self.allocated.saturating_sub(bytes);
        }
    }

    fn upload_opacity_table(&mut self, table: &[f32]) {
        self.opacity = table.to_vec();
    }

    fn upload_color_table(&mut self, slot: TextureSlot, table: &[[f32; 3]]) {
        self.colors.insert(slot, table.to_vec());
    }

    fn upload_noise(&mut self, _size: u32, noise: &[f32]) {
        self.noise = noise.to_vec();
    }

    fn configure_accumulation(&mut self, size: UVec2, scalar_tracking: bool) -> Result<(), RenderError> {
        if size.x == 0 || size.y == 0 {
            return Err(RenderError::Backend(format!("empty accumulation target {size}")));
        }
        let n = (size.x * size.y) as usize;
        self.accumulation = Some(Accumulation {
            size,
            output: vec![[0.0; 4]; n],
            input: vec![[0.0; 4]; n],
            scalar_output: scalar_tracking.then(|| vec![0.0; n]),
            scalar_input: scalar_tracking.then(|| vec![0.0; n]),
            clear_color: [0.0; 4],
            clear_scalar: 0.0,
        });
        Ok(())
    }

    fn clear_accumulation(&mut self, color: [f32; 4], scalar: f32) {
        if let Some(acc) = self.accumulation.as_mut() {
            acc.output.fill(color);
            acc.input.fill(color);
            if let Some(s) = acc.scalar_output.as_mut() {
                s.fill(scalar);
            }
            if let Some(s) = acc.scalar_input.as_mut() {
                s.fill(scalar);
            }
            acc.clear_color = color;
            acc.clear_scalar = scalar;
        }
    }

    fn copy_accumulation_to_input(&mut self) {
        if let Some(acc) = self.accumulation.as_mut() {
            acc.input.copy_from_slice(&acc.output);
            if let (Some(input), Some(output)) = (acc.scalar_input.as_mut(), acc.scalar_output.as_ref()) {
                input.copy_from_slice(output);
            }
        }
    }

    fn grab_depth(&mut self, viewport: Viewport) {
        self.framebuffer.resize_to_cover(&viewport);
        let fb = &self.framebuffer;
        let mut grab = Vec::with_capacity((viewport.width * viewport.height) as usize);
        for y in viewport.y..viewport.y + viewport.height {
            for x in viewport.x..viewport.x + viewport.width {
                grab.push(fb.index(x, y).map_or(f64::INFINITY, |i| fb.depth[i]));
            }
        }
        self.depth_grab = grab;
        self.depth_grab_viewport = viewport;
    }

    fn bind(&mut self, slot: TextureSlot, binding: Binding) {
        self.bindings.insert(slot, binding);
    }

    fn unbind(&mut self, slot: TextureSlot) {
        self.bindings.remove(&slot);
    }

    fn render_state(&self) -> RenderState {
        self.state
    }

    fn set_render_state(&mut self, state: RenderState) {
        self.state = state;
    }

    fn link_program(&mut self, program: &ProgramSource) -> Result<(), String> {
        let failing = self.link_failures.iter().find(|pattern| {
            program
                .stages
                .iter()
                .any(|s| s.key.0.contains(pattern.as_str()) || s.source.contains(pattern.as_str()))
        });
        if let Some(pattern) = failing {
            self.linked = None;
            return Err(format!("validation failed in stage matching '{pattern}'"));
        }
        self.linked = Some(program.clone());
        Ok(())
    }

    fn begin_frame(&mut self, frame: &FrameContext) {
        self.frame = Some(frame.clone());
    }

    fn draw_hull(&mut self, draw: &HullDraw<'_>) -> u32 {
        let count = draw.hull.triangle_count();
        self.triangles += count as u64;
        if draw.hull.is_empty() {
            return 0;
        }
        match draw.pass {
            // Ray exits are taken from the hull and the grabbed depth directly.
            DrawPass::DepthPrime => self.depth_prime_draws += 1,
            DrawPass::RayMarch => {
                self.ray_march_draws += 1;
                self.ray_march(draw);
            }
        }
        count
    }

    fn blit_to_host(&mut self, viewport: Viewport) {
        let Some(acc) = self.accumulation.as_ref() else {
            return;
        };
        self.framebuffer.resize_to_cover(&viewport);
        let fb = &mut self.framebuffer;
        for y in 0..viewport.height {
            for x in 0..viewport.width {
                let i = ((x as f64 + 0.5) / viewport.width as f64 * acc.size.x as f64) as u32;
                let j = ((y as f64 + 0.5) / viewport.height as f64 * acc.size.y as f64) as u32;
                let src = acc.output[(j.min(acc.size.y - 1) * acc.size.x + i.min(acc.size.x - 1)) as usize];
                if let Some(k) = fb.index(viewport.x + x, viewport.y + y) {
                    let dst = fb.color[k];
                    let keep = 1.0 - src[3];
                    fb.color[k] = [
                        src[0] + dst[0] * keep,
                        src[1] + dst[1] * keep,
                        src[2] + dst[2] * keep,
                        src[3] + dst[3] * keep,
                    ];
                }
            }
        }
    }

    fn release_resources(&mut self) {
        self.opacity.clear();
        self.colors.clear();
        self.noise.clear();
        self.accumulation = None;
        self.depth_grab.clear();
        self.bindings.clear();
        self.linked = None;
        self.frame = None;
    }
}

/// Offscreen host for tests and the bench.
pub struct SoftwareSurface {
    viewport: Viewport,
    state_depth: usize,
    abort_after: Option<usize>,
    abort_checks: usize,
    progress: Vec<f64>,
    completions: u32,
}

impl SoftwareSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            viewport: Viewport {
                x: 0,
                y: 0,
                width,
                height,
            },
            state_depth: 0,
            abort_after: None,
            abort_checks: 0,
            progress: Vec::new(),
            completions: 0,
        }
    }

    /// Request an abort once `checks` abort polls have answered no.
    pub fn abort_after(&mut self, checks: usize) {
        self.abort_after = Some(checks);
    }

    pub fn state_depth(&self) -> usize {
        self.state_depth
    }

    pub fn abort_checks(&self) -> usize {
        self.abort_checks
    }

    pub fn progress_events(&self) -> &[f64] {
        &self.progress
    }

    pub fn completions(&self) -> u32 {
        self.completions
    }
}

impl HostSurface for SoftwareSurface {
    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn push_state(&mut self) {
        self.state_depth += 1;
    }

    fn pop_state(&mut self) {
        self.state_depth = self.state_depth.saturating_sub(1);
    }

    fn check_abort(&mut self) -> bool {
        let abort = self.abort_after.is_some_and(|n| self.abort_checks >= n);
        self.abort_checks += 1;
        abort
    }

    fn report_progress(&mut self, progress: f64) {
        self.progress.push(progress);
    }

    fn render_complete(&mut self) {
        self.completions += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_on_create() {
        let mut backend = SoftwareBackend::with_memory(100, 64);
        assert!(backend.create_texture_3d(UVec3::new(5, 5, 1), VoxelFormat::R32Float).is_ok());
        let err = backend
            .create_texture_3d(UVec3::new(1, 1, 1), VoxelFormat::R32Float)
            .expect_err("budget exhausted");
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn test_release_returns_memory() {
        let mut backend = SoftwareBackend::with_memory(1000, 64);
        let id = backend
            .create_texture_3d(UVec3::splat(4), VoxelFormat::R32Float)
            .expect("fits");
        assert_eq!(backend.allocated_bytes(), 256);
        backend.release_texture(id);
        assert_eq!(backend.allocated_bytes(), 0);
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn test_write_rejects_wrong_length() {
        let mut backend = SoftwareBackend::new();
        let id = backend
            .create_texture_3d(UVec3::splat(2), VoxelFormat::R32Float)
            .expect("fits");
        assert!(backend.write_texture_3d(id, &TexelData::R32Float(vec![0.0; 7])).is_err());
        assert!(backend.write_texture_3d(id, &TexelData::R32Float(vec![0.0; 8])).is_ok());
        assert_eq!(backend.upload_count(), 1);
    }

    #[test]
    fn test_blit_composites_premultiplied_over_host() {
        let mut backend = SoftwareBackend::new();
        backend
            .configure_accumulation(UVec2::new(2, 2), false)
            .expect("targets");
        backend.clear_accumulation([0.25, 0.0, 0.0, 0.5], 0.0);
        backend.resize_framebuffer(2, 2);
        let vp = Viewport {
            x: 0,
            y: 0,
            width: 2,
            height: 2,
        };
        backend.blit_to_host(vp);
        backend.blit_to_host(vp);
        let p = backend.host_pixel(1, 1).expect("inside");
        assert!((p[3] - 0.75).abs() < 1e-6);
        assert!((p[0] - 0.375).abs() < 1e-6);
    }

    #[test]
    fn test_trilinear_sampling() {
        let data = TexelData::R32Float(vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        let sampler = Sampler {
            data: &data,
            size: UVec3::splat(2),
        };
        assert!((sampler.linear(DVec3::new(0.25, 0.5, 0.5))[0] - 0.25).abs() < 1e-12);
        assert_eq!(sampler.linear(DVec3::new(5.0, 0.0, 0.0))[0], 1.0);
        assert_eq!(sampler.nearest(DVec3::new(0.6, 0.0, 0.0))[0], 1.0);
    }

    #[test]
    fn test_surface_abort_after() {
        let mut surface = SoftwareSurface::new(1, 1);
        surface.abort_after(2);
        assert!(!surface.check_abort());
        assert!(!surface.check_abort());
        assert!(surface.check_abort());
        assert_eq!(surface.abort_checks(), 3);
    }

    #[test]
    fn test_link_failure_pattern() {
        use crate::shader_variant::{ShaderKey, ShaderStage, StageSource};
        let mut backend = SoftwareBackend::new();
        backend.fail_links_containing("trace/mip");
        let program = ProgramSource {
            stages: vec![StageSource {
                stage: ShaderStage::Trace,
                key: ShaderKey("trace/mip"),
                source: String::new(),
            }],
        };
        assert!(backend.link_program(&program).is_err());
        assert!(backend.linked_program().is_none());
    }
}
