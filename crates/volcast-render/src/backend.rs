use glam::{DMat4, DVec3, UVec2, UVec3};
use volcast_core::error::RenderError;
use volcast_core::types::{
    BlendMode, Camera, CroppingConfig, MaskKind, Viewport, VolumeProperty,
};

use crate::bindings::TextureSlot;
use crate::clipper::ClippedHull;
use crate::render_state::RenderState;
use crate::scalar_cache::TextureWindow;
use crate::shader_variant::{ProgramSource, ShaderVariant};

/// Handle of a backend-owned 3-D texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

/// Texel layout of a 3-D volume texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoxelFormat {
    /// Single scalar normalised to the table range.
    R32Float,
    /// Four-component color plus opacity.
    Rgba8Unorm,
    /// Mask labels.
    R8Uint,
}

impl VoxelFormat {
    pub fn bytes_per_voxel(self) -> u64 {
        match self {
            VoxelFormat::R32Float => 4,
            VoxelFormat::Rgba8Unorm => 4,
            VoxelFormat::R8Uint => 1,
        }
    }
}

/// Textures that must be resident together for one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VolumeFormat {
    pub scalar: VoxelFormat,
    pub mask: Option<VoxelFormat>,
}

impl VolumeFormat {
    pub fn bytes_per_voxel(&self) -> u64 {
        self.scalar.bytes_per_voxel() + self.mask.map_or(0, VoxelFormat::bytes_per_voxel)
    }

    pub fn byte_size(&self, size: UVec3) -> u64 {
        size.x as u64 * size.y as u64 * size.z as u64 * self.bytes_per_voxel()
    }
}

/// Texel payload for a 3-D texture upload, x fastest.
#[derive(Debug, Clone, PartialEq)]
pub enum TexelData {
    R32Float(Vec<f32>),
    Rgba8Unorm(Vec<[u8; 4]>),
    R8Uint(Vec<u8>),
}

impl TexelData {
    pub fn format(&self) -> VoxelFormat {
        match self {
            TexelData::R32Float(_) => VoxelFormat::R32Float,
            TexelData::Rgba8Unorm(_) => VoxelFormat::Rgba8Unorm,
            TexelData::R8Uint(_) => VoxelFormat::R8Uint,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TexelData::R32Float(v) => v.len(),
            TexelData::Rgba8Unorm(v) => v.len(),
            TexelData::R8Uint(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TexelData::R32Float(v) => bytemuck::cast_slice(v),
            TexelData::Rgba8Unorm(v) => bytemuck::cast_slice(v),
            TexelData::R8Uint(v) => v.as_slice(),
        }
    }
}

/// Device features the ray caster depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub texture_3d: bool,
    pub float_render_targets: bool,
    pub depth_texture_copy: bool,
    pub max_texture_dimension_3d: u32,
    pub max_sampled_textures: u32,
}

impl Capabilities {
    /// Human-readable names of every unmet requirement.
    pub fn missing(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if !self.texture_3d {
            missing.push("3D textures".to_string());
        }
        if !self.float_render_targets {
            missing.push("floating-point render targets".to_string());
        }
        if !self.depth_texture_copy {
            missing.push("depth texture copies".to_string());
        }
        if self.max_texture_dimension_3d < 2 {
            missing.push(format!(
                "3D texture dimension >= 2 (have {})",
                self.max_texture_dimension_3d
            ));
        }
        if (self.max_sampled_textures as usize) < TextureSlot::ALL.len() {
            missing.push(format!(
                "{} texture units (have {})",
                TextureSlot::ALL.len(),
                self.max_sampled_textures
            ));
        }
        missing
    }
}

/// What a slot is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// A volume or mask texture created through `create_texture_3d`.
    Volume(TextureId),
    /// The backend's own resource for that slot (tables, depth grab, noise, accumulation).
    Owned,
}

/// Which hull faces a draw rasterises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawPass {
    /// Back faces into the depth buffer only.
    DepthPrime,
    /// Front faces running the ray-march program.
    RayMarch,
}

/// Per-frame state shared by every draw.
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub camera: Camera,
    /// Volume-local to world.
    pub model: DMat4,
    pub inverse_model: DMat4,
    pub viewport: Viewport,
    /// Accumulation target size after the reduction factor.
    pub target_size: UVec2,
    pub reduction_factor: f64,
    pub blend: BlendMode,
    pub variant: ShaderVariant,
    pub property: VolumeProperty,
    pub mask: Option<MaskKind>,
    pub cropping: CroppingConfig,
}

impl FrameContext {
    /// World-to-clip transform with a [0, 1] depth range.
    pub fn view_projection(&self) -> DMat4 {
        let cam = &self.camera;
        let view = DMat4::look_at_rh(cam.position, cam.focal_point, cam.view_up);
        let aspect = self.viewport.width.max(1) as f64 / self.viewport.height.max(1) as f64;
        let [near, far] = cam.clipping_range;
        let projection = if cam.parallel_projection {
            let h = cam.parallel_scale;
            let w = h * aspect;
            DMat4::orthographic_rh(-w, w, -h, h, near, far)
        } else {
            DMat4::perspective_rh(cam.view_angle.to_radians(), aspect, near, far)
        };
        projection * view
    }

    /// Camera position in volume-local space.
    pub fn camera_local(&self) -> DVec3 {
        self.inverse_model.transform_point3(self.camera.position)
    }
}

/// One hull draw.
#[derive(Debug, Clone, Copy)]
pub struct HullDraw<'a> {
    pub pass: DrawPass,
    pub hull: &'a ClippedHull,
    pub window: &'a TextureWindow,
    pub sample_distance: f64,
}

/// Hull vertex as uploaded to the GPU. Must match VertexInput in the ray-cast base stage.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct HullVertex {
    pub position: [f32; 3],
    pub tcoord: [f32; 3],
}

/// Per-draw uniforms. Must match RayUniforms in the ray-cast base stage.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RayUniforms {
    pub model_view_proj: [[f32; 4]; 4],
    pub model: [[f32; 4]; 4],
    pub inverse_model: [[f32; 4]; 4],
    /// World-space camera position and view direction; samples sit at
    /// whole multiples of the sample distance from the camera.
    pub world_camera: [f32; 4],
    pub world_forward: [f32; 4],
    /// xyz: local camera position, w: 1 for parallel projection.
    pub camera_position: [f32; 4],
    pub camera_direction: [f32; 4],
    /// Block box in texture coordinates of the bound texture.
    pub low_bounds: [f32; 4],
    pub high_bounds: [f32; 4],
    /// Local position to texture coordinate: `t = p * scale + offset`.
    pub texture_scale: [f32; 4],
    pub texture_offset: [f32; 4],
    /// x0, x1, y0, y1 cropping planes in texture coordinates.
    pub cropping_xy: [f32; 4],
    /// z0, z1 cropping planes, table range low, table range span.
    pub cropping_z: [f32; 4],
    /// ambient, diffuse, specular, specular power.
    pub lighting: [f32; 4],
    /// Target origin and inverse size in pixels.
    pub window: [f32; 4],
    pub sample_distance: f32,
    pub reduction_factor: f32,
    pub mask_blend_factor: f32,
    pub cropping_flags: u32,
}

impl RayUniforms {
    pub fn new(frame: &FrameContext, draw: &HullDraw<'_>) -> Self {
        let mvp = frame.view_projection() * frame.model;
        let (camera_position, direction) =
            volcast_core::math::camera_to_local(&frame.camera, &frame.inverse_model);
        let (low, high) = draw.window.texture_bounds();
        let forward = frame.camera.direction();
        let tex = |axis: usize, value: f64| draw.window.texture_coordinate_axis(axis, value) as f32;
        let p = frame.cropping.planes;
        let range = draw.window.table_range;
        let property = &frame.property;
        Self {
            model_view_proj: mvp.as_mat4().to_cols_array_2d(),
            model: frame.model.as_mat4().to_cols_array_2d(),
            inverse_model: frame.inverse_model.as_mat4().to_cols_array_2d(),
            world_camera: [
                frame.camera.position.x as f32,
                frame.camera.position.y as f32,
                frame.camera.position.z as f32,
                1.0,
            ],
            world_forward: [forward.x as f32, forward.y as f32, forward.z as f32, 0.0],
            camera_position: [
                camera_position.x as f32,
                camera_position.y as f32,
                camera_position.z as f32,
                if frame.camera.parallel_projection { 1.0 } else { 0.0 },
            ],
            camera_direction: [direction.x as f32, direction.y as f32, direction.z as f32, 0.0],
            low_bounds: [low.x as f32, low.y as f32, low.z as f32, 0.0],
            high_bounds: [high.x as f32, high.y as f32, high.z as f32, 0.0],
            texture_scale: [
                tex(0, 1.0) - tex(0, 0.0),
                tex(1, 1.0) - tex(1, 0.0),
                tex(2, 1.0) - tex(2, 0.0),
                0.0,
            ],
            texture_offset: [tex(0, 0.0), tex(1, 0.0), tex(2, 0.0), 0.0],
            cropping_xy: [tex(0, p[0]), tex(0, p[1]), tex(1, p[2]), tex(1, p[3])],
            cropping_z: [
                tex(2, p[4]),
                tex(2, p[5]),
                range[0] as f32,
                (range[1] - range[0]) as f32,
            ],
            lighting: [
                property.ambient,
                property.diffuse,
                property.specular,
                property.specular_power,
            ],
            window: [
                frame.viewport.x as f32,
                frame.viewport.y as f32,
                1.0 / frame.target_size.x.max(1) as f32,
                1.0 / frame.target_size.y.max(1) as f32,
            ],
            sample_distance: draw.sample_distance as f32,
            reduction_factor: frame.reduction_factor as f32,
            mask_blend_factor: property.mask_blend_factor,
            cropping_flags: if frame.cropping.enabled {
                frame.cropping.flags
            } else {
                volcast_core::constants::CROPPING_FLAGS_ALL
            },
        }
    }
}

/// GPU primitives the orchestration layer drives. All calls come from one
/// thread; a draw is complete once `copy_accumulation_to_input` returns.
pub trait GpuBackend {
    fn capabilities(&self) -> Capabilities;

    /// Capability-only query: would the device accept a texture of this shape at all.
    fn proxy_texture_3d(&self, size: UVec3, format: VoxelFormat) -> bool;

    /// Allocate storage. Out-of-memory surfaces as `RenderError::OutOfMemory`.
    fn create_texture_3d(&mut self, size: UVec3, format: VoxelFormat) -> Result<TextureId, RenderError>;

    fn write_texture_3d(&mut self, texture: TextureId, data: &TexelData) -> Result<(), RenderError>;

    fn release_texture(&mut self, texture: TextureId);

    fn upload_opacity_table(&mut self, table: &[f32]);

    /// `slot` is one of the three color-table slots.
    fn upload_color_table(&mut self, slot: TextureSlot, table: &[[f32; 3]]);

    fn upload_noise(&mut self, size: u32, noise: &[f32]);

    /// (Re)create the ping/pong pair; `scalar_tracking` adds the scalar pair.
    fn configure_accumulation(&mut self, size: UVec2, scalar_tracking: bool) -> Result<(), RenderError>;

    fn clear_accumulation(&mut self, color: [f32; 4], scalar: f32);

    /// Make the just-written accumulation target the input of the next draw.
    fn copy_accumulation_to_input(&mut self);

    /// Copy the host depth buffer under `viewport` into the depth-grab texture.
    fn grab_depth(&mut self, viewport: Viewport);

    fn bind(&mut self, slot: TextureSlot, binding: Binding);

    fn unbind(&mut self, slot: TextureSlot);

    fn render_state(&self) -> RenderState;

    fn set_render_state(&mut self, state: RenderState);

    /// Build and validate a program. `Err` carries the driver's message.
    fn link_program(&mut self, program: &ProgramSource) -> Result<(), String>;

    fn begin_frame(&mut self, frame: &FrameContext);

    /// Rasterise a hull; returns the number of triangles submitted.
    fn draw_hull(&mut self, draw: &HullDraw<'_>) -> u32;

    /// Composite the accumulation target over the host color buffer.
    fn blit_to_host(&mut self, viewport: Viewport);

    /// Drop every backend-owned resource.
    fn release_resources(&mut self);
}

/// The window or offscreen surface the mapper draws into.
pub trait HostSurface {
    fn viewport(&self) -> Viewport;

    fn push_state(&mut self);

    fn pop_state(&mut self);

    /// Polled once per block. May pump window-system events.
    fn check_abort(&mut self) -> bool;

    fn report_progress(&mut self, progress: f64);

    fn render_complete(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ray_uniforms_are_16_byte_aligned() {
        assert_eq!(std::mem::size_of::<RayUniforms>() % 16, 0);
        assert_eq!(std::mem::size_of::<RayUniforms>(), 400);
        assert_eq!(std::mem::size_of::<HullVertex>(), 24);
    }

    #[test]
    fn test_missing_capabilities_are_enumerated() {
        let caps = Capabilities {
            texture_3d: false,
            float_render_targets: true,
            depth_texture_copy: false,
            max_texture_dimension_3d: 256,
            max_sampled_textures: 4,
        };
        let missing = caps.missing();
        assert_eq!(missing.len(), 3);
        assert_eq!(missing[0], "3D textures");
    }

    #[test]
    fn test_volume_format_bytes() {
        let format = VolumeFormat {
            scalar: VoxelFormat::R32Float,
            mask: Some(VoxelFormat::R8Uint),
        };
        assert_eq!(format.byte_size(UVec3::new(2, 3, 4)), 24 * 5);
    }
}
