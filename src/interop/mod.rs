// Cross-context GPU interop module
// Bridges a secondary decode device into the primary rendering context
//
// Backends:
// - D3D11 keyed-mutex sharing into a wgpu DX12 device (Windows, default)
// - Headless (no GPU; engine bring-up and tests, opt-in via
//   InteropContext::with_bridge)
//
// On platforms with no default backend the context comes up invalid and
// every dependent session reports interop unavailable.

pub mod context;
pub mod headless;
pub mod texture;

#[cfg(target_os = "windows")]
pub mod d3d11;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InteropError {
    #[error("Failed to initialize interop device: {0}")]
    InitError(String),
    #[error("Failed to create shared surface: {0}")]
    SurfaceError(String),
    #[error("GPU interop not available on this platform")]
    NotAvailable,
}

/// Pixel dimensions of a shared surface. Immutable once the surface exists;
/// a size change means destroying and recreating the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureSize {
    pub width: u32,
    pub height: u32,
}

impl TextureSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Opaque handle to the secondary device's device manager. The decode engine
/// binds its decoder to this so frames land in shareable memory. The value is
/// backend-defined (a raw COM pointer on Windows, an identifier elsewhere).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceManagerHandle(pub u64);

/// Opaque handle to the decode-side face of a shared surface, the target the
/// engine blits frames into. Backend-defined, like [`DeviceManagerHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeTarget(pub u64);

/// Display-side face of a shared surface: what the consumer ultimately draws.
///
/// The variant depends on which bridge backend produced the surface.
#[derive(Debug, Clone)]
pub enum DisplayTexture {
    /// Texture imported into the primary wgpu device (zero-copy path).
    Wgpu(wgpu::Texture),
    /// Surface with no render-context registration, produced by the headless
    /// backend.
    Headless { id: u64 },
}

/// One registered surface pair: a decode-side surface plus its registration
/// in the rendering context's texture namespace.
///
/// Lock/unlock fence the surface for exclusive access by the rendering
/// context; the fence is advisory between the two APIs, so callers must keep
/// the lock held for the whole time the display texture is being sampled.
pub trait BridgeSurface: Send + Sync {
    /// Fence the surface for the rendering context. False leaves the fence
    /// unheld.
    fn lock(&self) -> bool;

    /// Release the fence. False means the surface may still be fenced.
    fn unlock(&self) -> bool;

    /// Remove the registration from the rendering context's namespace.
    /// Called at most once, before the surface is released, and only while
    /// the rendering context is still current.
    fn unregister(&self);

    fn decode_target(&self) -> DecodeTarget;

    fn display_texture(&self) -> DisplayTexture;

    /// Whether the rendering context this surface is registered with still
    /// exists. When false, teardown must skip every bridge call and accept
    /// the leaked registration.
    fn context_current(&self) -> bool;
}

/// A cross-API interop bridge: owns the secondary decode device and the
/// channel into the primary rendering context's texture namespace.
pub trait InteropBridge: Send + Sync {
    /// Handle the decode engine binds its decoder device to.
    fn device_manager(&self) -> DeviceManagerHandle;

    /// Allocate a decode surface and register it with the rendering context.
    fn create_surface(&self, size: TextureSize) -> Result<Box<dyn BridgeSurface>, InteropError>;

    /// Whether the primary rendering context is still current.
    fn context_current(&self) -> bool;

    /// Short backend description for logs.
    fn describe(&self) -> &str;
}

/// The primary rendering context textures get registered into.
#[derive(Clone)]
pub struct RenderContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

/// Open the best available bridge for this platform.
pub fn create_bridge(render: &RenderContext) -> Result<Box<dyn InteropBridge>, InteropError> {
    #[cfg(target_os = "windows")]
    {
        match d3d11::D3d11Bridge::open(render) {
            Ok(bridge) => {
                log::info!("Using D3D11 keyed-mutex interop bridge");
                return Ok(Box::new(bridge));
            }
            Err(e) => log::warn!("D3D11 interop bridge not available: {}", e),
        }
    }

    let _ = render;
    Err(InteropError::NotAvailable)
}
