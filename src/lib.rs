//! videobridge - GPU-resident video decode/encode interop
//!
//! Hands decoded video frames from a hardware decode device to a GPU-texture
//! consumer without a CPU round-trip, and encodes rendered frames into a
//! compressed, timestamped container in real time.
//!
//! The decode engine, the window/render loop, and file handling all live in
//! the embedding application; this crate owns the cross-context resource
//! bridging in between:
//!
//! - [`interop`]: the interop context, shared textures, and the bridge
//!   backends that register them into the rendering context.
//! - [`render`]: the per-session render path and the scoped frame lease the
//!   consumer holds while drawing.
//! - [`writer`]: the media writer that turns captured frames into a video
//!   file.

pub mod interop;
pub mod render;
pub mod writer;

pub use interop::context::InteropContext;
pub use interop::texture::SharedTexture;
pub use interop::{DisplayTexture, InteropError, RenderContext, TextureSize};
pub use render::{DecodeEngine, EngineAttributes, FrameLease, RenderPath};
pub use writer::{MediaWriter, WriterConfig, WriterError, WriterState};
