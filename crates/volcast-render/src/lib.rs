pub mod accumulation;
pub mod backend;
pub mod bindings;
pub mod block_planner;
pub mod clipper;
pub mod compositor;
pub mod mapper;
pub mod memory_probe;
pub mod quality;
pub mod regions;
pub mod render_state;
pub mod scalar_cache;
pub mod shader_variant;
pub mod software;
pub mod tables;
pub mod wgpu_backend;

pub use backend::{Capabilities, FrameContext, GpuBackend, HostSurface, RayUniforms};
pub use compositor::{CompositeOutcome, Compositor, RenderItem};
pub use mapper::{FrameOutcome, FrameRequest, FrameStats, MaskInput, VolumeMapper};
pub use memory_probe::MemoryProbe;
pub use scalar_cache::ScalarFieldCache;
pub use shader_variant::{ShaderLibrary, ShaderSourceRegistry, ShaderVariant};
pub use software::{SoftwareBackend, SoftwareSurface};
pub use wgpu_backend::{HostTarget, WgpuBackend};
