//! Process-wide interop context
//!
//! Owns the bridge between the secondary decode device and the primary
//! rendering context. One context serves every playback session in the
//! process; sessions hold their own `Arc` clones, so the bridge outlives
//! every surface registered through it.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::texture::SharedTexture;
use super::{DeviceManagerHandle, InteropBridge, InteropError, RenderContext, TextureSize, create_bridge};

/// Global context slot. Deliberately holds one reference for the life of the
/// process so the embedding application's teardown can never get ahead of
/// sessions still using the bridge.
static INTEROP_CONTEXT: OnceCell<Arc<InteropContext>> = OnceCell::new();

/// Create the process-wide context on first call. Later calls are no-ops,
/// even if the first initialization failed: a context that came up invalid
/// stays invalid for the remainder of the process.
pub fn initialize(render: &RenderContext) {
    INTEROP_CONTEXT.get_or_init(|| InteropContext::new(render));
}

/// The process-wide context. Calling this before [`initialize`] is a
/// programming error.
pub fn global() -> Arc<InteropContext> {
    INTEROP_CONTEXT
        .get()
        .expect("interop::initialize must be called before interop::global")
        .clone()
}

pub struct InteropContext {
    bridge: Option<Box<dyn InteropBridge>>,
}

impl InteropContext {
    /// Open the platform bridge against the given rendering context. Any
    /// failure in the initialization sequence leaves the context permanently
    /// invalid; callers must treat the whole video interop subsystem as
    /// unavailable.
    pub fn new(render: &RenderContext) -> Arc<Self> {
        Self::from_backend(create_bridge(render))
    }

    /// Wrap an already-open bridge (alternate backends, headless operation).
    pub fn with_bridge(bridge: Box<dyn InteropBridge>) -> Arc<Self> {
        Self::from_backend(Ok(bridge))
    }

    pub(crate) fn from_backend(
        backend: Result<Box<dyn InteropBridge>, InteropError>,
    ) -> Arc<Self> {
        let bridge = match backend {
            Ok(bridge) => {
                log::info!("Interop context ready: {}", bridge.describe());
                Some(bridge)
            }
            Err(e) => {
                log::warn!("Interop context unavailable: {}", e);
                None
            }
        };
        Arc::new(Self { bridge })
    }

    /// False means every dependent operation will refuse to run for the
    /// remainder of the process.
    pub fn is_valid(&self) -> bool {
        self.bridge.is_some()
    }

    /// Handle the decode engine binds its decoder device to. `None` on an
    /// invalid context.
    pub fn device_manager(&self) -> Option<DeviceManagerHandle> {
        self.bridge.as_ref().map(|b| b.device_manager())
    }

    /// Allocate a decode surface of `size` and register it with the
    /// rendering context. `None` when the context is invalid or the bridge
    /// registration fails; the caller must treat that as interop
    /// unavailable and fail the session.
    pub fn create_shared_texture(&self, size: TextureSize) -> Option<SharedTexture> {
        let bridge = self.bridge.as_ref()?;
        match bridge.create_surface(size) {
            Ok(surface) => Some(SharedTexture::new(surface, size)),
            Err(e) => {
                log::warn!(
                    "Failed to create {}x{} shared texture: {}",
                    size.width,
                    size.height,
                    e
                );
                None
            }
        }
    }
}
