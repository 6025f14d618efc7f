use std::ops::{Deref, DerefMut};

use crate::backend::{GpuBackend, HostSurface};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendState {
    /// Output overwrites the target.
    Replace,
    /// Premultiplied-alpha "over" onto the target.
    PremultipliedOver,
}

/// Fixed-function state of one rendering phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderState {
    pub blend: BlendState,
    pub cull: CullMode,
    pub color_writes: bool,
    pub depth_test: bool,
    pub depth_writes: bool,
}

impl RenderState {
    /// State the host expects to find when the mapper returns.
    pub const HOST_DEFAULT: RenderState = RenderState {
        blend: BlendState::PremultipliedOver,
        cull: CullMode::None,
        color_writes: true,
        depth_test: true,
        depth_writes: true,
    };

    /// Back faces only, depth only: seeds ray exits against opaque geometry.
    pub const DEPTH_PRIME: RenderState = RenderState {
        blend: BlendState::Replace,
        cull: CullMode::Front,
        color_writes: false,
        depth_test: true,
        depth_writes: true,
    };

    /// Front faces; the fragment program blends with the accumulation input itself.
    pub const RAY_MARCH: RenderState = RenderState {
        blend: BlendState::Replace,
        cull: CullMode::Back,
        color_writes: true,
        depth_test: false,
        depth_writes: false,
    };

    /// Accumulation target composited over the host color buffer.
    pub const BLIT: RenderState = RenderState {
        blend: BlendState::PremultipliedOver,
        cull: CullMode::None,
        color_writes: true,
        depth_test: false,
        depth_writes: false,
    };
}

impl Default for RenderState {
    fn default() -> Self {
        Self::HOST_DEFAULT
    }
}

/// Applies a render state for the lifetime of the scope and restores the
/// previous one on drop, whichever way the scope is left.
pub struct StateScope<'a, B: GpuBackend + ?Sized> {
    backend: &'a mut B,
    saved: RenderState,
}

impl<'a, B: GpuBackend + ?Sized> StateScope<'a, B> {
    pub fn enter(backend: &'a mut B, state: RenderState) -> Self {
        let saved = backend.render_state();
        backend.set_render_state(state);
        Self { backend, saved }
    }
}

impl<B: GpuBackend + ?Sized> Deref for StateScope<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.backend
    }
}

impl<B: GpuBackend + ?Sized> DerefMut for StateScope<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        self.backend
    }
}

impl<B: GpuBackend + ?Sized> Drop for StateScope<'_, B> {
    fn drop(&mut self) {
        self.backend.set_render_state(self.saved);
    }
}

/// Pushes the host's transform/raster state on entry and pops it on drop.
pub struct HostStateScope<'a, H: HostSurface + ?Sized> {
    host: &'a mut H,
}

impl<'a, H: HostSurface + ?Sized> HostStateScope<'a, H> {
    pub fn enter(host: &'a mut H) -> Self {
        host.push_state();
        Self { host }
    }
}

impl<H: HostSurface + ?Sized> Deref for HostStateScope<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        self.host
    }
}

impl<H: HostSurface + ?Sized> DerefMut for HostStateScope<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        self.host
    }
}

impl<H: HostSurface + ?Sized> Drop for HostStateScope<'_, H> {
    fn drop(&mut self) {
        self.host.pop_state();
    }
}
