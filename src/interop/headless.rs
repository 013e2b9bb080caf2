//! Headless interop backend
//!
//! Bookkeeping-only surfaces with an atomic fence. Lets engine bring-up and
//! the unit suites exercise the full lock/lease/transfer discipline on
//! machines without a usable GPU. This is not a render fallback: nothing in
//! here reads frames back for display.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{
    BridgeSurface, DecodeTarget, DeviceManagerHandle, DisplayTexture, InteropBridge, InteropError,
    TextureSize,
};

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

/// Interop bridge with no GPU behind it.
pub struct HeadlessBridge {
    id: u64,
    next_surface_id: AtomicU64,
    context_current: Arc<AtomicBool>,
}

impl HeadlessBridge {
    pub fn new() -> Self {
        Self {
            id: NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed),
            next_surface_id: AtomicU64::new(1),
            context_current: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate loss of the rendering context. Surfaces dropped afterwards
    /// take the shutdown path: no unlock, no unregister.
    pub fn set_context_lost(&self) {
        self.context_current.store(false, Ordering::Release);
    }
}

impl Default for HeadlessBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl InteropBridge for HeadlessBridge {
    fn device_manager(&self) -> DeviceManagerHandle {
        DeviceManagerHandle(self.id)
    }

    fn create_surface(&self, size: TextureSize) -> Result<Box<dyn BridgeSurface>, InteropError> {
        if size.width == 0 || size.height == 0 {
            return Err(InteropError::SurfaceError(format!(
                "degenerate surface size {}x{}",
                size.width, size.height
            )));
        }

        let id = self.next_surface_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("Headless surface {} allocated at {}x{}", id, size.width, size.height);

        Ok(Box::new(HeadlessSurface {
            id,
            fenced: AtomicBool::new(false),
            context_current: self.context_current.clone(),
        }))
    }

    fn context_current(&self) -> bool {
        self.context_current.load(Ordering::Acquire)
    }

    fn describe(&self) -> &str {
        "Headless (no GPU)"
    }
}

struct HeadlessSurface {
    id: u64,
    fenced: AtomicBool,
    context_current: Arc<AtomicBool>,
}

impl BridgeSurface for HeadlessSurface {
    fn lock(&self) -> bool {
        // Succeeds only when the fence was not already held
        !self.fenced.swap(true, Ordering::AcqRel)
    }

    fn unlock(&self) -> bool {
        self.fenced.swap(false, Ordering::AcqRel)
    }

    fn unregister(&self) {
        log::debug!("Headless surface {} unregistered", self.id);
    }

    fn decode_target(&self) -> DecodeTarget {
        DecodeTarget(self.id)
    }

    fn display_texture(&self) -> DisplayTexture {
        DisplayTexture::Headless { id: self.id }
    }

    fn context_current(&self) -> bool {
        self.context_current.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_ids_are_unique() {
        let bridge = HeadlessBridge::new();
        let a = bridge.create_surface(TextureSize::new(16, 16)).unwrap();
        let b = bridge.create_surface(TextureSize::new(16, 16)).unwrap();
        assert_ne!(a.decode_target(), b.decode_target());
    }

    #[test]
    fn test_fence_is_exclusive() {
        let bridge = HeadlessBridge::new();
        let surface = bridge.create_surface(TextureSize::new(16, 16)).unwrap();

        assert!(surface.lock());
        assert!(!surface.lock());
        assert!(surface.unlock());
        assert!(surface.lock());
    }

    #[test]
    fn test_degenerate_size_is_refused() {
        let bridge = HeadlessBridge::new();
        assert!(bridge.create_surface(TextureSize::new(0, 720)).is_err());
    }

    #[test]
    fn test_context_loss_propagates_to_surfaces() {
        let bridge = HeadlessBridge::new();
        let surface = bridge.create_surface(TextureSize::new(16, 16)).unwrap();
        assert!(surface.context_current());

        bridge.set_context_lost();
        assert!(!surface.context_current());
    }
}
