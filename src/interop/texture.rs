//! Shared surface with explicit cross-API lock/unlock fencing
//!
//! A `SharedTexture` is exclusively owned by one render path. The decode
//! engine writes into its decode-side face; the consumer samples its
//! display-side face while holding the lock.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use super::{BridgeSurface, DecodeTarget, DisplayTexture, TextureSize};

/// Sentinel: no frame has been presented into this texture yet.
pub const NO_TIMESTAMP: i64 = -1;

pub struct SharedTexture {
    // Declared before `surface`: a wgpu display texture must be released
    // before the bridge surface that owns its shared handle.
    display: DisplayTexture,
    surface: Box<dyn BridgeSurface>,
    size: TextureSize,
    locked: AtomicBool,
    presentation_timestamp: AtomicI64,
}

impl SharedTexture {
    pub(crate) fn new(surface: Box<dyn BridgeSurface>, size: TextureSize) -> Self {
        let display = surface.display_texture();
        Self {
            display,
            surface,
            size,
            locked: AtomicBool::new(false),
            presentation_timestamp: AtomicI64::new(NO_TIMESTAMP),
        }
    }

    pub fn size(&self) -> TextureSize {
        self.size
    }

    /// The decode-side face the engine blits frames into.
    pub fn decode_target(&self) -> DecodeTarget {
        self.surface.decode_target()
    }

    /// The display-side face the consumer samples. Only safe to draw while
    /// locked.
    pub fn display_texture(&self) -> &DisplayTexture {
        &self.display
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Fence the surface for exclusive access by the rendering context.
    /// Calling while already locked is a contract violation.
    pub fn lock(&self) -> bool {
        debug_assert!(!self.is_locked(), "shared texture locked twice without an unlock");
        if self.surface.lock() {
            self.locked.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Release the fence. Calling while unlocked is a contract violation.
    /// On failure the locked flag stays set: the surface may still be fenced
    /// and callers must not assume the release happened.
    pub fn unlock(&self) -> bool {
        debug_assert!(self.is_locked(), "shared texture unlocked while not locked");
        if self.surface.unlock() {
            self.locked.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Media time of the most recent frame transferred into this surface,
    /// monotonically non-decreasing within a session. [`NO_TIMESTAMP`] until
    /// the first transfer is attempted.
    pub fn presentation_timestamp(&self) -> i64 {
        self.presentation_timestamp.load(Ordering::Acquire)
    }

    pub fn set_presentation_timestamp(&self, pts: i64) {
        self.presentation_timestamp.store(pts, Ordering::Release);
    }
}

impl Drop for SharedTexture {
    fn drop(&mut self) {
        // With the rendering context already gone (mid-shutdown), bridge
        // calls would touch a torn-down context. Leak the registration
        // instead of crashing.
        if !self.surface.context_current() {
            return;
        }
        if self.is_locked() {
            self.surface.unlock();
        }
        self.surface.unregister();
    }
}
