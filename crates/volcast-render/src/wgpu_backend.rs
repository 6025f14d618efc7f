use std::collections::HashMap;

use glam::{UVec2, UVec3};
use volcast_core::constants::{NOISE_TEXTURE_SIZE, TABLE_SIZE};
use volcast_core::error::RenderError;
use volcast_core::math::preserves_orientation;
use volcast_core::types::Viewport;

use crate::backend::{
    Binding, Capabilities, DrawPass, FrameContext, GpuBackend, HullDraw, HullVertex, RayUniforms,
    TexelData, TextureId, VoxelFormat,
};
use crate::bindings::TextureSlot;
use crate::render_state::{BlendState, CullMode, RenderState};
use crate::shader_variant::ProgramSource;

const ACCUMULATION_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;
const SCALAR_ACCUMULATION_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Initial hull vertex capacity; the buffer grows on demand.
const INITIAL_VERTEX_CAPACITY: u64 = 4096;

/// Ray-cast binding of the primed exit depth, after the texture slots.
const EXIT_DEPTH_BINDING: u32 = 10;

/// Blit uniforms. Must match BlitUniforms in blit.wgsl.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct BlitUniforms {
    /// Host viewport origin and size in framebuffer pixels, top-left origin.
    viewport: [f32; 4],
    target_size: [f32; 2],
    _pad: [f32; 2],
}

fn wgpu_format(format: VoxelFormat) -> wgpu::TextureFormat {
    match format {
        VoxelFormat::R32Float => wgpu::TextureFormat::R32Float,
        VoxelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        VoxelFormat::R8Uint => wgpu::TextureFormat::R8Uint,
    }
}

fn extent(size: UVec3) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.x,
        height: size.y,
        depth_or_array_layers: size.z,
    }
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: UVec3,
    format: VoxelFormat,
}

/// Ping/pong color and scalar targets plus the depth-prime buffer.
///
/// The scalar pair is allocated even for compositing so that every hull
/// pipeline writes the same two targets.
struct AccumulationTextures {
    size: UVec2,
    output: wgpu::Texture,
    output_view: wgpu::TextureView,
    input: wgpu::Texture,
    input_view: wgpu::TextureView,
    scalar_output: wgpu::Texture,
    scalar_output_view: wgpu::TextureView,
    scalar_input: wgpu::Texture,
    scalar_input_view: wgpu::TextureView,
    depth: wgpu::Texture,
    depth_view: wgpu::TextureView,
    /// Copy of the primed depth the ray march reads as its exit.
    exit: wgpu::Texture,
    exit_view: wgpu::TextureView,
}

/// Where the blit lands: the host's color view and, optionally, its depth texture.
pub struct HostTarget {
    pub color: wgpu::TextureView,
    pub depth: Option<wgpu::Texture>,
    pub size: UVec2,
}

/// Placeholder views for unbound slots.
struct FallbackViews {
    volume: wgpu::TextureView,
    mask: wgpu::TextureView,
    table: wgpu::TextureView,
    image: wgpu::TextureView,
    depth: wgpu::TextureView,
}

struct LinkedProgram {
    module: wgpu::ShaderModule,
    pipelines: HashMap<RenderState, wgpu::RenderPipeline>,
}

/// `GpuBackend` on a wgpu device.
///
/// Every draw is submitted and waited on before the next one, because the
/// following block reads its output.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    capabilities: Capabilities,
    next_texture: u64,
    textures: HashMap<TextureId, GpuTexture>,
    opacity_table: (wgpu::Texture, wgpu::TextureView),
    color_tables: HashMap<TextureSlot, (wgpu::Texture, wgpu::TextureView)>,
    noise: Option<(wgpu::Texture, wgpu::TextureView)>,
    accumulation: Option<AccumulationTextures>,
    depth_grab: Option<(wgpu::Texture, wgpu::TextureView)>,
    fallback: FallbackViews,
    bindings: HashMap<TextureSlot, Binding>,
    state: RenderState,
    program: Option<LinkedProgram>,
    frame: Option<FrameContext>,
    // Hull draws
    uniform_buffer: wgpu::Buffer,
    vertex_buffer: wgpu::Buffer,
    vertex_capacity: u64,
    uniform_bgl: wgpu::BindGroupLayout,
    slot_bgl: wgpu::BindGroupLayout,
    hull_pipeline_layout: wgpu::PipelineLayout,
    // Blit
    blit_pipeline: wgpu::RenderPipeline,
    blit_bgl: wgpu::BindGroupLayout,
    blit_uniform_buffer: wgpu::Buffer,
    host: Option<HostTarget>,
}

impl WgpuBackend {
    /// Headless adapter and device with the limits the ray caster needs.
    pub fn request_device() -> Result<(wgpu::Adapter, wgpu::Device, wgpu::Queue), RenderError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .ok_or_else(|| RenderError::Backend("no suitable GPU adapter".into()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("volcast-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default().using_resolution(adapter.limits()),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| RenderError::Backend(format!("device request failed: {e}")))?;
        log::info!("WgpuBackend: adapter {:?}", adapter.get_info().name);
        Ok((adapter, device, queue))
    }

    /// Build every fixed GPU resource. `host_format` is the format of the
    /// color target the accumulation is blitted onto.
    pub fn new(
        adapter: &wgpu::Adapter,
        device: wgpu::Device,
        queue: wgpu::Queue,
        host_format: wgpu::TextureFormat,
    ) -> Self {
        let limits = device.limits();
        let renderable = |format: wgpu::TextureFormat| {
            adapter
                .get_texture_format_features(format)
                .allowed_usages
                .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
        };
        let capabilities = Capabilities {
            texture_3d: limits.max_texture_dimension_3d > 0,
            float_render_targets: renderable(ACCUMULATION_FORMAT)
                && renderable(SCALAR_ACCUMULATION_FORMAT),
            // Whole-texture depth copies are part of core wgpu.
            depth_texture_copy: true,
            max_texture_dimension_3d: limits.max_texture_dimension_3d,
            max_sampled_textures: limits.max_sampled_textures_per_shader_stage,
        };

        // -- Layouts --
        let uniform_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("ray-uniform-bgl"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let texture_entry = |binding: u32, (sample_type, view_dimension)| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type,
                view_dimension,
                multisampled: false,
            },
            count: None,
        };
        let mut slot_entries: Vec<wgpu::BindGroupLayoutEntry> = TextureSlot::ALL
            .iter()
            .map(|&slot| texture_entry(slot.binding(), slot_texture_type(slot)))
            .collect();
        slot_entries.push(texture_entry(
            EXIT_DEPTH_BINDING,
            (wgpu::TextureSampleType::Depth, wgpu::TextureViewDimension::D2),
        ));
        let slot_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("ray-slot-bgl"),
            entries: &slot_entries,
        });
        let hull_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("ray-cast-pipeline-layout"),
            bind_group_layouts: &[&uniform_bgl, &slot_bgl],
            push_constant_ranges: &[],
        });

        // -- Buffers --
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ray-uniforms"),
            size: std::mem::size_of::<RayUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let vertex_buffer = create_vertex_buffer(&device, INITIAL_VERTEX_CAPACITY);

        // -- Lookup tables and placeholders --
        let opacity_table = create_table(&device, "opacity-table", TABLE_SIZE as u32, wgpu::TextureFormat::R32Float);
        let fallback = FallbackViews {
            volume: placeholder(&device, "placeholder-volume", wgpu::TextureDimension::D3, wgpu::TextureFormat::R32Float),
            mask: placeholder(&device, "placeholder-mask", wgpu::TextureDimension::D3, wgpu::TextureFormat::R8Uint),
            table: placeholder(&device, "placeholder-table", wgpu::TextureDimension::D1, wgpu::TextureFormat::R32Float),
            image: placeholder(&device, "placeholder-image", wgpu::TextureDimension::D2, wgpu::TextureFormat::R32Float),
            depth: far_depth_placeholder(&device, &queue),
        };

        // -- Blit pipeline --
        let blit_wgsl = include_str!("../../../shaders/render/blit.wgsl");
        let blit_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("blit-shader"),
            source: wgpu::ShaderSource::Wgsl(blit_wgsl.into()),
        });
        let blit_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("blit-bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });
        let blit_uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("blit-uniforms"),
            size: std::mem::size_of::<BlitUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let blit_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("blit-pipeline-layout"),
            bind_group_layouts: &[&blit_bgl],
            push_constant_ranges: &[],
        });
        let blit_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("blit-pipeline"),
            layout: Some(&blit_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &blit_module,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &blit_module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: host_format,
                    blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            multiview: None,
            cache: None,
        });

        log::info!(
            "WgpuBackend: 3D texture limit {}, {} sampled textures per stage",
            capabilities.max_texture_dimension_3d,
            capabilities.max_sampled_textures
        );

        Self {
            device,
            queue,
            capabilities,
            next_texture: 1,
            textures: HashMap::new(),
            opacity_table,
            color_tables: HashMap::new(),
            noise: None,
            accumulation: None,
            depth_grab: None,
            fallback,
            bindings: HashMap::new(),
            state: RenderState::HOST_DEFAULT,
            program: None,
            frame: None,
            uniform_buffer,
            vertex_buffer,
            vertex_capacity: INITIAL_VERTEX_CAPACITY,
            uniform_bgl,
            slot_bgl,
            hull_pipeline_layout,
            blit_pipeline,
            blit_bgl,
            blit_uniform_buffer,
            host: None,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Set the color view (and depth texture) that `blit_to_host` and
    /// `grab_depth` use.
    pub fn set_host_target(&mut self, host: HostTarget) {
        self.host = Some(host);
    }

    /// Run `f` inside an out-of-memory error scope and wait for the verdict.
    fn with_oom_scope<T>(&self, what: &str, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T, RenderError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let value = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => Err(RenderError::OutOfMemory(format!("{what}: {e}"))),
            None => Ok(value),
        }
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit(std::iter::once(encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    fn slot_view(&self, slot: TextureSlot) -> &wgpu::TextureView {
        let fallback = match slot {
            TextureSlot::Scalar => &self.fallback.volume,
            TextureSlot::Mask => &self.fallback.mask,
            TextureSlot::ColorTable
            | TextureSlot::OpacityTable
            | TextureSlot::Mask1ColorTable
            | TextureSlot::Mask2ColorTable => &self.fallback.table,
            TextureSlot::DepthGrab => &self.fallback.depth,
            TextureSlot::AccumulationInput
            | TextureSlot::ScalarAccumulationInput
            | TextureSlot::Noise => &self.fallback.image,
        };
        match self.bindings.get(&slot) {
            Some(Binding::Volume(id)) => self.textures.get(id).map_or(fallback, |t| &t.view),
            Some(Binding::Owned) => {
                let owned = match slot {
                    TextureSlot::OpacityTable => Some(&self.opacity_table.1),
                    TextureSlot::ColorTable
                    | TextureSlot::Mask1ColorTable
                    | TextureSlot::Mask2ColorTable => self.color_tables.get(&slot).map(|t| &t.1),
                    TextureSlot::DepthGrab => self.depth_grab.as_ref().map(|t| &t.1),
                    TextureSlot::Noise => self.noise.as_ref().map(|t| &t.1),
                    TextureSlot::AccumulationInput => {
                        self.accumulation.as_ref().map(|a| &a.input_view)
                    }
                    TextureSlot::ScalarAccumulationInput => {
                        self.accumulation.as_ref().map(|a| &a.scalar_input_view)
                    }
                    TextureSlot::Scalar | TextureSlot::Mask => None,
                };
                owned.unwrap_or(fallback)
            }
            None => fallback,
        }
    }

    /// Pipelines are created per render state on first use.
    fn ensure_pipeline(&mut self, state: RenderState) -> bool {
        let Some(program) = self.program.as_mut() else {
            return false;
        };
        if !program.pipelines.contains_key(&state) {
            let pipeline = create_hull_pipeline(&self.device, &self.hull_pipeline_layout, &program.module, state);
            program.pipelines.insert(state, pipeline);
        }
        true
    }

    fn upload_vertices(&mut self, vertices: &[HullVertex]) {
        let needed = vertices.len() as u64;
        if needed > self.vertex_capacity {
            let capacity = needed.next_power_of_two();
            log::debug!("WgpuBackend: growing hull vertex buffer to {capacity}");
            self.vertex_buffer = create_vertex_buffer(&self.device, capacity);
            self.vertex_capacity = capacity;
        }
        self.queue
            .write_buffer(&self.vertex_buffer, 0, bytemuck::cast_slice(vertices));
    }
}

/// Sample type and view dimension of each slot. Must match the ray-cast base stage.
fn slot_texture_type(slot: TextureSlot) -> (wgpu::TextureSampleType, wgpu::TextureViewDimension) {
    let float = wgpu::TextureSampleType::Float { filterable: false };
    match slot {
        TextureSlot::Scalar => (float, wgpu::TextureViewDimension::D3),
        TextureSlot::Mask => (wgpu::TextureSampleType::Uint, wgpu::TextureViewDimension::D3),
        TextureSlot::ColorTable
        | TextureSlot::OpacityTable
        | TextureSlot::Mask1ColorTable
        | TextureSlot::Mask2ColorTable => (float, wgpu::TextureViewDimension::D1),
        TextureSlot::DepthGrab => (wgpu::TextureSampleType::Depth, wgpu::TextureViewDimension::D2),
        TextureSlot::AccumulationInput
        | TextureSlot::ScalarAccumulationInput
        | TextureSlot::Noise => (float, wgpu::TextureViewDimension::D2),
    }
}

fn create_vertex_buffer(device: &wgpu::Device, capacity: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("hull-vertices"),
        size: capacity * std::mem::size_of::<HullVertex>() as u64,
        usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn create_table(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    format: wgpu::TextureFormat,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: 1,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D1,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

fn placeholder(
    device: &wgpu::Device,
    label: &str,
    dimension: wgpu::TextureDimension,
    format: wgpu::TextureFormat,
) -> wgpu::TextureView {
    device
        .create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        })
        .create_view(&wgpu::TextureViewDescriptor::default())
}

/// 1x1 depth texture cleared to the far plane, so an unbound depth never stops a ray.
fn far_depth_placeholder(device: &wgpu::Device, queue: &wgpu::Queue) -> wgpu::TextureView {
    let (_texture, view) = render_target(device, "placeholder-depth", UVec2::ONE, DEPTH_FORMAT);
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("placeholder-depth-clear"),
    });
    clear_depth(&mut encoder, &view);
    queue.submit(std::iter::once(encoder.finish()));
    view
}

fn clear_depth(encoder: &mut wgpu::CommandEncoder, view: &wgpu::TextureView) {
    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("depth-clear-pass"),
        color_attachments: &[],
        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
            view,
            depth_ops: Some(wgpu::Operations {
                load: wgpu::LoadOp::Clear(1.0),
                store: wgpu::StoreOp::Store,
            }),
            stencil_ops: None,
        }),
        timestamp_writes: None,
        occlusion_query_set: None,
    });
}

fn render_target(
    device: &wgpu::Device,
    label: &str,
    size: UVec2,
    format: wgpu::TextureFormat,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: size.x,
            height: size.y,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

fn create_hull_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    state: RenderState,
) -> wgpu::RenderPipeline {
    let write_mask = if state.color_writes {
        wgpu::ColorWrites::ALL
    } else {
        wgpu::ColorWrites::empty()
    };
    let blend = match state.blend {
        BlendState::Replace => None,
        BlendState::PremultipliedOver => Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
    };
    let targets = [
        Some(wgpu::ColorTargetState {
            format: ACCUMULATION_FORMAT,
            blend,
            write_mask,
        }),
        Some(wgpu::ColorTargetState {
            format: SCALAR_ACCUMULATION_FORMAT,
            blend: None,
            write_mask,
        }),
    ];
    let cull_mode = match state.cull {
        CullMode::None => None,
        CullMode::Front => Some(wgpu::Face::Front),
        CullMode::Back => Some(wgpu::Face::Back),
    };
    let attributes = wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3];

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("ray-cast-pipeline"),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: Some("vs_main"),
            buffers: &[wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<HullVertex>() as u64,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &attributes,
            }],
            compilation_options: Default::default(),
        },
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode,
            ..Default::default()
        },
        depth_stencil: Some(wgpu::DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: state.depth_writes,
            depth_compare: if state.depth_test {
                wgpu::CompareFunction::Less
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }),
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: Some("fs_main"),
            targets: &targets,
            compilation_options: Default::default(),
        }),
        multiview: None,
        cache: None,
    })
}

/// Constants injected ahead of the registry sources.
fn program_preamble() -> String {
    let mut preamble = format!(
        "const TABLE_SIZE: u32 = {TABLE_SIZE}u;\nconst NOISE_SIZE: u32 = {NOISE_TEXTURE_SIZE}u;\n"
    );
    for slot in TextureSlot::ALL {
        preamble.push_str(&format!(
            "const SLOT_{}: u32 = {}u;\n",
            slot.label().replace('-', "_").to_uppercase(),
            slot.binding()
        ));
    }
    preamble
}

impl GpuBackend for WgpuBackend {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn proxy_texture_3d(&self, size: UVec3, _format: VoxelFormat) -> bool {
        self.capabilities.texture_3d
            && size.cmpgt(UVec3::ZERO).all()
            && size.max_element() <= self.capabilities.max_texture_dimension_3d
    }

    fn create_texture_3d(&mut self, size: UVec3, format: VoxelFormat) -> Result<TextureId, RenderError> {
        if !self.proxy_texture_3d(size, format) {
            return Err(RenderError::OutOfMemory(format!(
                "3D texture {size} exceeds device limits"
            )));
        }
        let texture = self.with_oom_scope("3D texture", |device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some("volume-texture"),
                size: extent(size),
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D3,
                format: wgpu_format(format),
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                view,
                size,
                format,
            },
        );
        Ok(id)
    }

    fn write_texture_3d(&mut self, texture: TextureId, data: &TexelData) -> Result<(), RenderError> {
        let target = self
            .textures
            .get(&texture)
            .ok_or_else(|| RenderError::Backend(format!("unknown texture {texture:?}")))?;
        let size = target.size;
        let expected = size.x as usize * size.y as usize * size.z as usize;
        if data.len() != expected || data.format() != target.format {
            return Err(RenderError::Backend(format!(
                "texture {texture:?} expects {expected} {:?} texels, got {} {:?}",
                target.format,
                data.len(),
                data.format()
            )));
        }
        let bytes_per_texel = target.format.bytes_per_voxel() as u32;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data.as_bytes(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size.x * bytes_per_texel),
                rows_per_image: Some(size.y),
            },
            extent(size),
        );
        Ok(())
    }

    fn release_texture(&mut self, texture: TextureId) {
        if let Some(t) = self.textures.remove(&texture) {
            t.texture.destroy();
        }
        self.bindings
            .retain(|_, binding| *binding != Binding::Volume(texture));
    }

    fn upload_opacity_table(&mut self, table: &[f32]) {
        if self.opacity_table.0.width() != table.len() as u32 {
            self.opacity_table = create_table(&self.device, "opacity-table", table.len() as u32, wgpu::TextureFormat::R32Float);
        }
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.opacity_table.0,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(table),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(table.len() as u32 * 4),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width: table.len() as u32,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
    }

    fn upload_color_table(&mut self, slot: TextureSlot, table: &[[f32; 3]]) {
        let width = table.len() as u32;
        let stale = self
            .color_tables
            .get(&slot)
            .map_or(true, |(texture, _)| texture.width() != width);
        if stale {
            let created = create_table(&self.device, slot.label(), width, wgpu::TextureFormat::Rgba32Float);
            self.color_tables.insert(slot, created);
        }
        let Some((texture, _)) = self.color_tables.get(&slot) else {
            return;
        };
        let rgba: Vec<[f32; 4]> = table.iter().map(|c| [c[0], c[1], c[2], 1.0]).collect();
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&rgba),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 16),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
    }

    fn upload_noise(&mut self, size: u32, noise: &[f32]) {
        let dims = UVec2::splat(size);
        let (texture, view) = render_target(&self.device, "noise", dims, wgpu::TextureFormat::R32Float);
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(noise),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size * 4),
                rows_per_image: Some(size),
            },
            wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 1,
            },
        );
        self.noise = Some((texture, view));
    }

    fn configure_accumulation(&mut self, size: UVec2, scalar_tracking: bool) -> Result<(), RenderError> {
        if size.x == 0 || size.y == 0 {
            return Err(RenderError::Backend(format!("empty accumulation target {size}")));
        }
        self.accumulation = None;
        let targets = self.with_oom_scope("accumulation targets", |device| {
            let (output, output_view) = render_target(device, "accumulation-ping", size, ACCUMULATION_FORMAT);
            let (input, input_view) = render_target(device, "accumulation-pong", size, ACCUMULATION_FORMAT);
            let (scalar_output, scalar_output_view) =
                render_target(device, "scalar-accumulation-ping", size, SCALAR_ACCUMULATION_FORMAT);
            let (scalar_input, scalar_input_view) =
                render_target(device, "scalar-accumulation-pong", size, SCALAR_ACCUMULATION_FORMAT);
            let (depth, depth_view) = render_target(device, "depth-prime", size, DEPTH_FORMAT);
            let (exit, exit_view) = render_target(device, "exit-depth", size, DEPTH_FORMAT);
            AccumulationTextures {
                size,
                output,
                output_view,
                input,
                input_view,
                scalar_output,
                scalar_output_view,
                scalar_input,
                scalar_input_view,
                depth,
                depth_view,
                exit,
                exit_view,
            }
        })?;
        log::debug!("WgpuBackend: accumulation {size}, scalar tracking {scalar_tracking}");
        self.accumulation = Some(targets);
        Ok(())
    }

    fn clear_accumulation(&mut self, color: [f32; 4], scalar: f32) {
        let Some(acc) = self.accumulation.as_ref() else {
            return;
        };
        let mut encoder = self.encoder("accumulation-clear");
        let clear_color = wgpu::Color {
            r: color[0] as f64,
            g: color[1] as f64,
            b: color[2] as f64,
            a: color[3] as f64,
        };
        let clear_scalar = wgpu::Color {
            r: scalar as f64,
            g: 0.0,
            b: 0.0,
            a: 0.0,
        };
        let views = [
            (&acc.output_view, clear_color),
            (&acc.input_view, clear_color),
            (&acc.scalar_output_view, clear_scalar),
            (&acc.scalar_input_view, clear_scalar),
        ];
        for (view, value) in views {
            encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("accumulation-clear-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(value),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        clear_depth(&mut encoder, &acc.depth_view);
        clear_depth(&mut encoder, &acc.exit_view);
        self.submit(encoder);
    }

    fn copy_accumulation_to_input(&mut self) {
        let Some(acc) = self.accumulation.as_ref() else {
            return;
        };
        let size = wgpu::Extent3d {
            width: acc.size.x,
            height: acc.size.y,
            depth_or_array_layers: 1,
        };
        let mut encoder = self.encoder("accumulation-copy");
        encoder.copy_texture_to_texture(
            acc.output.as_image_copy(),
            acc.input.as_image_copy(),
            size,
        );
        encoder.copy_texture_to_texture(
            acc.scalar_output.as_image_copy(),
            acc.scalar_input.as_image_copy(),
            size,
        );
        self.submit(encoder);
    }

    fn grab_depth(&mut self, viewport: Viewport) {
        let Some(host) = self.host.as_ref() else {
            return;
        };
        let Some(depth) = host.depth.as_ref() else {
            return;
        };
        // Depth formats only copy whole subresources.
        if viewport.x != 0
            || viewport.y != 0
            || viewport.width != depth.width()
            || viewport.height != depth.height()
        {
            log::warn!("WgpuBackend: depth grab needs the viewport to cover the whole host depth buffer");
            return;
        }
        let size = UVec2::new(depth.width(), depth.height());
        let stale = self
            .depth_grab
            .as_ref()
            .map_or(true, |(t, _)| t.width() != size.x || t.height() != size.y);
        if stale {
            self.depth_grab = Some(render_target(&self.device, "depth-grab", size, DEPTH_FORMAT));
        }
        let Some((grab, _)) = self.depth_grab.as_ref() else {
            return;
        };
        let mut encoder = self.encoder("depth-grab");
        encoder.copy_texture_to_texture(
            depth.as_image_copy(),
            grab.as_image_copy(),
            wgpu::Extent3d {
                width: size.x,
                height: size.y,
                depth_or_array_layers: 1,
            },
        );
        self.submit(encoder);
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
        let source = program.compose(&program_preamble());
        self.program = None;
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("ray-cast-shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let mut pipelines = HashMap::new();
        for state in [RenderState::DEPTH_PRIME, RenderState::RAY_MARCH] {
            pipelines.insert(
                state,
                create_hull_pipeline(&self.device, &self.hull_pipeline_layout, &module, state),
            );
        }
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(e.to_string());
        }
        log::info!("WgpuBackend: linked ray-cast program of {} stages", program.stages.len());
        self.program = Some(LinkedProgram { module, pipelines });
        Ok(())
    }

    fn begin_frame(&mut self, frame: &FrameContext) {
        self.frame = Some(frame.clone());
    }

    fn draw_hull(&mut self, draw: &HullDraw<'_>) -> u32 {
        if draw.hull.is_empty() {
            return 0;
        }
        let Some(frame) = self.frame.clone() else {
            log::warn!("WgpuBackend: hull draw outside a frame");
            return 0;
        };
        if self.accumulation.is_none() {
            log::warn!("WgpuBackend: hull draw without accumulation targets");
            return 0;
        }

        let triangles = draw.hull.oriented_triangles(preserves_orientation(&frame.model));
        let vertices: Vec<HullVertex> = triangles
            .iter()
            .flatten()
            .map(|&p| {
                let t = draw.window.texture_coordinate(p);
                HullVertex {
                    position: [p.x as f32, p.y as f32, p.z as f32],
                    tcoord: [t.x as f32, t.y as f32, t.z as f32],
                }
            })
            .collect();
        self.upload_vertices(&vertices);
        let uniforms = RayUniforms::new(&frame, draw);
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let uniform_bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ray-uniform-bg"),
            layout: &self.uniform_bgl,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: self.uniform_buffer.as_entire_binding(),
            }],
        });
        let Some(exit_view) = self.accumulation.as_ref().map(|a| &a.exit_view) else {
            return 0;
        };
        let mut slot_entries: Vec<wgpu::BindGroupEntry> = TextureSlot::ALL
            .iter()
            .map(|&slot| wgpu::BindGroupEntry {
                binding: slot.binding(),
                resource: wgpu::BindingResource::TextureView(self.slot_view(slot)),
            })
            .collect();
        slot_entries.push(wgpu::BindGroupEntry {
            binding: EXIT_DEPTH_BINDING,
            resource: wgpu::BindingResource::TextureView(exit_view),
        });
        let slot_bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ray-slot-bg"),
            layout: &self.slot_bgl,
            entries: &slot_entries,
        });

        let state = self.state;
        if !self.ensure_pipeline(state) {
            log::warn!("WgpuBackend: hull draw without a linked program");
            return 0;
        }
        let (Some(program), Some(acc)) = (self.program.as_ref(), self.accumulation.as_ref()) else {
            return 0;
        };
        let Some(pipeline) = program.pipelines.get(&state) else {
            return 0;
        };

        let mut encoder = self.encoder(match draw.pass {
            DrawPass::DepthPrime => "depth-prime",
            DrawPass::RayMarch => "ray-march",
        });
        {
            let load = wgpu::Operations {
                load: wgpu::LoadOp::Load,
                store: wgpu::StoreOp::Store,
            };
            let attachments = [
                Some(wgpu::RenderPassColorAttachment {
                    view: &acc.output_view,
                    resolve_target: None,
                    ops: load,
                }),
                Some(wgpu::RenderPassColorAttachment {
                    view: &acc.scalar_output_view,
                    resolve_target: None,
                    ops: load,
                }),
            ];
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("hull-pass"),
                color_attachments: &attachments,
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &acc.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        // Each prime starts from the far plane.
                        load: match draw.pass {
                            DrawPass::DepthPrime => wgpu::LoadOp::Clear(1.0),
                            DrawPass::RayMarch => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &uniform_bg, &[]);
            pass.set_bind_group(1, &slot_bg, &[]);
            pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            pass.draw(0..vertices.len() as u32, 0..1);
        }
        if draw.pass == DrawPass::DepthPrime {
            encoder.copy_texture_to_texture(
                acc.depth.as_image_copy(),
                acc.exit.as_image_copy(),
                wgpu::Extent3d {
                    width: acc.size.x,
                    height: acc.size.y,
                    depth_or_array_layers: 1,
                },
            );
        }
        self.submit(encoder);
        triangles.len() as u32
    }

    fn blit_to_host(&mut self, viewport: Viewport) {
        let (Some(host), Some(acc)) = (self.host.as_ref(), self.accumulation.as_ref()) else {
            return;
        };
        if viewport.width == 0 || viewport.height == 0 {
            return;
        }
        // Viewports are lower-left based; framebuffer rows start at the top.
        let top = host.size.y.saturating_sub(viewport.y + viewport.height);
        let uniforms = BlitUniforms {
            viewport: [
                viewport.x as f32,
                top as f32,
                viewport.width as f32,
                viewport.height as f32,
            ],
            target_size: [acc.size.x as f32, acc.size.y as f32],
            _pad: [0.0; 2],
        };
        self.queue
            .write_buffer(&self.blit_uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("blit-bg"),
            layout: &self.blit_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.blit_uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&acc.output_view),
                },
            ],
        });
        let mut encoder = self.encoder("blit");
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("blit-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &host.color,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_viewport(
                viewport.x as f32,
                top as f32,
                viewport.width as f32,
                viewport.height as f32,
                0.0,
                1.0,
            );
            pass.set_pipeline(&self.blit_pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.submit(encoder);
    }

    fn release_resources(&mut self) {
        for (_, t) in self.textures.drain() {
            t.texture.destroy();
        }
        self.color_tables.clear();
        self.noise = None;
        self.accumulation = None;
        self.depth_grab = None;
        self.bindings.clear();
        self.program = None;
        self.frame = None;
        log::info!("WgpuBackend: released device resources");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blit_uniforms_layout() {
        assert_eq!(std::mem::size_of::<BlitUniforms>(), 32);
    }

    #[test]
    fn test_preamble_names_every_slot() {
        let preamble = program_preamble();
        assert!(preamble.contains("const TABLE_SIZE: u32 = 1024u;"));
        assert!(preamble.contains("const SLOT_SCALAR_ACCUMULATION_INPUT: u32 = 5u;"));
        assert_eq!(preamble.matches("const SLOT_").count(), TextureSlot::ALL.len());
    }

    #[test]
    fn test_slot_types_follow_slot_roles() {
        assert_eq!(
            slot_texture_type(TextureSlot::Mask),
            (wgpu::TextureSampleType::Uint, wgpu::TextureViewDimension::D3)
        );
        assert_eq!(slot_texture_type(TextureSlot::OpacityTable).1, wgpu::TextureViewDimension::D1);
        assert_eq!(slot_texture_type(TextureSlot::DepthGrab).0, wgpu::TextureSampleType::Depth);
    }
}
