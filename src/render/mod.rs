// Render path module
// Per-session plumbing from the decode engine into a shared texture, plus
// the scoped lease the consumer holds while drawing a frame

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::interop::context::InteropContext;
use crate::interop::texture::{NO_TIMESTAMP, SharedTexture};
use crate::interop::{DecodeTarget, DeviceManagerHandle, DisplayTexture, TextureSize};

/// Normalized source rectangle, both axes 0.0..=1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl NormalizedRect {
    /// The whole source frame.
    pub const FULL: Self = Self {
        left: 0.0,
        top: 0.0,
        right: 1.0,
        bottom: 1.0,
    };
}

/// Destination rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl PixelRect {
    pub fn of_size(size: TextureSize) -> Self {
        Self {
            left: 0,
            top: 0,
            right: size.width as i32,
            bottom: size.height as i32,
        }
    }
}

/// Border color for letterboxed output, BGRA byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorderColor {
    pub b: u8,
    pub g: u8,
    pub r: u8,
    pub a: u8,
}

impl BorderColor {
    pub const BLACK: Self = Self {
        b: 0,
        g: 0,
        r: 0,
        a: 0,
    };
}

/// Attribute set handed to the decode engine before it starts.
#[derive(Debug, Default, Clone)]
pub struct EngineAttributes {
    /// Device manager the engine binds its decoder device to, so decoded
    /// frames land in shareable memory.
    pub device_manager: Option<DeviceManagerHandle>,
}

/// The decode engine, seen through the one call the render path needs from
/// it each frame.
pub trait DecodeEngine {
    /// Blit the engine's current video frame into `target`, scaling
    /// `src` onto `dst` and filling uncovered area with `border`. Returns
    /// false when the engine has no frame ready this tick.
    fn transfer_frame(
        &mut self,
        target: DecodeTarget,
        src: NormalizedRect,
        dst: PixelRect,
        border: BorderColor,
    ) -> bool;
}

/// Per-session render path: owns the shared texture sized to the video and
/// drives the engine's per-frame transfer into it.
pub struct RenderPath {
    context: Arc<InteropContext>,
    texture: Option<SharedTexture>,
    size: TextureSize,
    new_frame: Arc<AtomicBool>,
}

impl RenderPath {
    /// `new_frame` belongs to the session; it is raised after every
    /// successful transfer so the consumer knows to re-present.
    pub fn new(context: Arc<InteropContext>, new_frame: Arc<AtomicBool>) -> Self {
        Self {
            context,
            texture: None,
            size: TextureSize::new(0, 0),
            new_frame,
        }
    }

    /// Wire the interop device manager into the engine's attribute set.
    /// False when the interop context is invalid; the session cannot use
    /// the GPU path at all.
    pub fn initialize(&self, attributes: &mut EngineAttributes) -> bool {
        match self.context.device_manager() {
            Some(manager) => {
                attributes.device_manager = Some(manager);
                true
            }
            None => false,
        }
    }

    /// Lazily (re)create the shared texture for `size`, returning whether a
    /// render target is now available. A repeated call with the current
    /// size keeps the existing texture.
    pub fn initialize_render_target(&mut self, size: TextureSize) -> bool {
        if self.texture.is_none() || self.size != size {
            self.size = size;
            self.texture = self.context.create_shared_texture(size);
        }
        self.texture.is_some()
    }

    /// Transfer the engine's current frame into the shared texture and
    /// record its presentation timestamp. The timestamp is recorded even
    /// when the transfer fails; the return value tells the session whether
    /// the pixels are fresh.
    pub fn process_frame(
        &mut self,
        engine: &mut dyn DecodeEngine,
        presentation_timestamp: i64,
    ) -> bool {
        let Some(texture) = &self.texture else {
            return false;
        };

        let ok = engine.transfer_frame(
            texture.decode_target(),
            NormalizedRect::FULL,
            PixelRect::of_size(self.size),
            BorderColor::BLACK,
        );
        if ok {
            self.new_frame.store(true, Ordering::Release);
        }
        texture.set_presentation_timestamp(presentation_timestamp);

        ok
    }

    /// Lease the current texture for one present. With no texture the lease
    /// is never valid but is still safe to hold and drop.
    pub fn frame_lease(&self) -> FrameLease<'_> {
        FrameLease::new(self.texture.as_ref())
    }
}

/// Scoped lock on a shared texture for the duration of one present.
///
/// Construction fences the texture for the rendering context; dropping the
/// lease releases the fence exactly once, on every exit path. The lease
/// never owns the texture.
pub struct FrameLease<'a> {
    texture: Option<&'a SharedTexture>,
    locked: bool,
}

impl<'a> FrameLease<'a> {
    fn new(texture: Option<&'a SharedTexture>) -> Self {
        let locked = match texture {
            Some(texture) => texture.lock(),
            None => false,
        };
        Self { texture, locked }
    }

    /// True when a texture is bound and the fence was acquired. Drawing
    /// without a valid lease samples pixels the decode device may still be
    /// writing.
    pub fn is_valid(&self) -> bool {
        self.locked && self.texture.is_some()
    }

    /// The displayable surface, present only while the lease is valid.
    pub fn to_texture(&self) -> Option<&DisplayTexture> {
        if !self.is_valid() {
            return None;
        }
        self.texture.map(|t| t.display_texture())
    }

    /// Presentation timestamp of the leased frame, or -1 with no texture.
    pub fn presentation_timestamp(&self) -> i64 {
        self.texture
            .map_or(NO_TIMESTAMP, |t| t.presentation_timestamp())
    }
}

impl Drop for FrameLease<'_> {
    fn drop(&mut self) {
        if self.locked {
            if let Some(texture) = self.texture {
                texture.unlock();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interop::InteropError;
    use crate::interop::headless::HeadlessBridge;

    /// Engine that answers every transfer with a fixed result and remembers
    /// what it was asked to do.
    struct ScriptedEngine {
        ready: bool,
        transfers: Vec<(DecodeTarget, PixelRect)>,
    }

    impl ScriptedEngine {
        fn ready() -> Self {
            Self {
                ready: true,
                transfers: Vec::new(),
            }
        }

        fn stalled() -> Self {
            Self {
                ready: false,
                transfers: Vec::new(),
            }
        }
    }

    impl DecodeEngine for ScriptedEngine {
        fn transfer_frame(
            &mut self,
            target: DecodeTarget,
            src: NormalizedRect,
            dst: PixelRect,
            border: BorderColor,
        ) -> bool {
            assert_eq!(src, NormalizedRect::FULL);
            assert_eq!(border, BorderColor::BLACK);
            self.transfers.push((target, dst));
            self.ready
        }
    }

    fn session() -> (RenderPath, Arc<AtomicBool>) {
        let context = InteropContext::with_bridge(Box::new(HeadlessBridge::new()));
        let flag = Arc::new(AtomicBool::new(false));
        (RenderPath::new(context, flag.clone()), flag)
    }

    #[test]
    fn test_initialize_attaches_device_manager() {
        let (path, _) = session();
        let mut attributes = EngineAttributes::default();

        assert!(path.initialize(&mut attributes));
        assert!(attributes.device_manager.is_some());
    }

    #[test]
    fn test_invalid_context_refuses_both_sessions() {
        let context = InteropContext::from_backend(Err(InteropError::NotAvailable));

        for _ in 0..2 {
            let mut path = RenderPath::new(context.clone(), Arc::new(AtomicBool::new(false)));
            let mut attributes = EngineAttributes::default();

            assert!(!path.initialize(&mut attributes));
            assert!(attributes.device_manager.is_none());
            assert!(!path.initialize_render_target(TextureSize::new(1280, 720)));
            assert!(!path.frame_lease().is_valid());
        }
    }

    #[test]
    fn test_same_size_keeps_texture_identity() {
        let (mut path, _) = session();
        let size = TextureSize::new(640, 360);

        assert!(path.initialize_render_target(size));
        let first = path.texture.as_ref().unwrap().decode_target();

        assert!(path.initialize_render_target(size));
        let second = path.texture.as_ref().unwrap().decode_target();

        // Headless surface ids are allocation-unique, so identity means no
        // reallocation happened
        assert_eq!(first, second);
    }

    #[test]
    fn test_size_change_recreates_texture() {
        let (mut path, _) = session();

        assert!(path.initialize_render_target(TextureSize::new(640, 360)));
        let first = path.texture.as_ref().unwrap().decode_target();

        assert!(path.initialize_render_target(TextureSize::new(1280, 720)));
        let texture = path.texture.as_ref().unwrap();

        assert_ne!(first, texture.decode_target());
        assert_eq!(texture.size(), TextureSize::new(1280, 720));
    }

    #[test]
    fn test_process_frame_success_raises_session_flag() {
        let (mut path, flag) = session();
        let mut engine = ScriptedEngine::ready();
        assert!(path.initialize_render_target(TextureSize::new(320, 240)));

        assert!(path.process_frame(&mut engine, 400_000));
        assert!(flag.load(Ordering::Acquire));
        assert_eq!(engine.transfers.len(), 1);
        assert_eq!(engine.transfers[0].1, PixelRect::of_size(TextureSize::new(320, 240)));
        assert_eq!(path.texture.as_ref().unwrap().presentation_timestamp(), 400_000);
    }

    #[test]
    fn test_failed_transfer_still_records_timestamp() {
        let (mut path, flag) = session();
        let mut engine = ScriptedEngine::stalled();
        assert!(path.initialize_render_target(TextureSize::new(320, 240)));

        assert!(!path.process_frame(&mut engine, 500_000));
        assert!(!flag.load(Ordering::Acquire));
        // Timestamp is recorded even when the pixels are stale
        assert_eq!(path.texture.as_ref().unwrap().presentation_timestamp(), 500_000);
    }

    #[test]
    fn test_process_frame_without_texture_fails() {
        let (mut path, flag) = session();
        let mut engine = ScriptedEngine::ready();

        assert!(!path.process_frame(&mut engine, 0));
        assert!(engine.transfers.is_empty());
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_lease_without_texture_is_inert() {
        let (path, _) = session();

        let lease = path.frame_lease();
        assert!(!lease.is_valid());
        assert!(lease.to_texture().is_none());
        assert_eq!(lease.presentation_timestamp(), NO_TIMESTAMP);
        drop(lease);
    }

    #[test]
    fn test_lease_locks_for_its_scope_only() {
        let (mut path, _) = session();
        assert!(path.initialize_render_target(TextureSize::new(64, 64)));

        {
            let lease = path.frame_lease();
            assert!(lease.is_valid());
            assert!(lease.to_texture().is_some());
            assert!(path.texture.as_ref().unwrap().is_locked());
        }

        // Net lock count across the lease's lifetime is zero
        assert!(!path.texture.as_ref().unwrap().is_locked());
    }

    #[test]
    fn test_back_to_back_leases_alternate_cleanly() {
        let (mut path, _) = session();
        assert!(path.initialize_render_target(TextureSize::new(64, 64)));

        for _ in 0..3 {
            let lease = path.frame_lease();
            assert!(lease.is_valid());
        }
        assert!(!path.texture.as_ref().unwrap().is_locked());
    }

    #[test]
    fn test_lease_is_invalid_when_the_fence_cannot_be_acquired() {
        use crate::interop::{BridgeSurface, InteropBridge};

        struct UnlockableBridge;
        struct UnlockableSurface;

        impl BridgeSurface for UnlockableSurface {
            fn lock(&self) -> bool {
                false
            }
            fn unlock(&self) -> bool {
                true
            }
            fn unregister(&self) {}
            fn decode_target(&self) -> DecodeTarget {
                DecodeTarget(9)
            }
            fn display_texture(&self) -> DisplayTexture {
                DisplayTexture::Headless { id: 9 }
            }
            fn context_current(&self) -> bool {
                true
            }
        }

        impl InteropBridge for UnlockableBridge {
            fn device_manager(&self) -> DeviceManagerHandle {
                DeviceManagerHandle(9)
            }
            fn create_surface(
                &self,
                _size: TextureSize,
            ) -> Result<Box<dyn BridgeSurface>, InteropError> {
                Ok(Box::new(UnlockableSurface))
            }
            fn context_current(&self) -> bool {
                true
            }
            fn describe(&self) -> &str {
                "unlockable"
            }
        }

        let context = InteropContext::with_bridge(Box::new(UnlockableBridge));
        let mut path = RenderPath::new(context, Arc::new(AtomicBool::new(false)));
        assert!(path.initialize_render_target(TextureSize::new(64, 64)));

        let lease = path.frame_lease();
        // The texture exists, but a lease that could not fence it must not
        // hand the surface to the consumer
        assert!(!lease.is_valid());
        assert!(lease.to_texture().is_none());
        // The sentinel still reflects texture absence only, not lock failure
        assert_eq!(lease.presentation_timestamp(), NO_TIMESTAMP);
        drop(lease);
        assert!(!path.texture.as_ref().unwrap().is_locked());
    }

    #[test]
    fn test_lease_reports_frame_timestamp() {
        let (mut path, _) = session();
        let mut engine = ScriptedEngine::ready();
        assert!(path.initialize_render_target(TextureSize::new(64, 64)));
        assert!(path.process_frame(&mut engine, 666_000));

        let lease = path.frame_lease();
        assert_eq!(lease.presentation_timestamp(), 666_000);
    }
}
