//! # glint-render
//!
//! The render pipeline planner: turns high-level image-processing intent
//! (scaling, color-space conversion, tone mapping, debanding, frame
//! interpolation, user shader hooks) into concrete GPU pass sequences
//! executed through [`glint_dispatch`].
//!
//! # Architecture
//!
//! ```text
//! Renderer::render_image / render_image_mix
//!     │
//!     ├── frame validation & metadata inference
//!     ├── plane read ──► merge ──► grain ──► input hooks
//!     ├── plane combine ──► decode ──► LUTs ──► peak detect
//!     ├── main scale (linear/sigmoid light, overlays, hooks)
//!     ├── output conversion (ICC, tone map, encode, dither)
//!     └── per-plane target write (subsampling, swizzle, flips)
//!
//! shared state: TexturePool (intermediates), Dispatch (pass cache),
//!               frame cache (mixing), degradation latches
//! ```
//!
//! # Example
//!
//! ```ignore
//! use glint_render::{Frame, Renderer, RenderParams};
//!
//! let mut rr = Renderer::new(gpu);
//! let image = Frame::from_texture(decoded);
//! let target = Frame::from_texture(swapchain);
//! rr.render_image(&image, &target, &RenderParams::default())?;
//! ```

pub mod filter;
pub mod frame;
pub mod hook;
pub mod img;
pub mod mix;
pub mod params;
pub mod pool;
pub mod shaders;

mod infer;
mod passes;
mod renderer;

pub use filter::{filter_sample, FilterConfig, FilterFunction};
pub use frame::{
    detect_plane_type, guess_lut_kind, Channel, ChromaLocation, Frame, FrameLut, GrainData,
    IccProfile, LutKind, Overlay, OverlayMode, Plane, PlaneType,
};
pub use hook::{Hook, HookParams, HookResult, HookSig, HookStage};
pub use mix::FrameMix;
pub use params::{
    params_hash, ColorMapParams, ConeParams, DebandParams, DitherMethod, DitherParams, IccParams,
    PeakDetectParams, RenderParams, SigmoidParams, ToneMapping,
};
pub use pool::TexturePool;
pub use renderer::{DisabledFeatures, Renderer};

use thiserror::Error;

/// Errors surfaced by the renderer.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Malformed input frames or parameters; no side effects on caches.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A capability needed for this call is unavailable and no fallback
    /// exists.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An optional feature failed; the corresponding latch has been set
    /// and the call could not be completed at full quality.
    #[error("degraded: {0}")]
    Degraded(String),

    /// A user hook failed.
    #[error("hook failed: {0}")]
    Hook(String),

    /// Dispatch engine failure.
    #[error(transparent)]
    Dispatch(#[from] glint_dispatch::DispatchError),

    /// Backend failure.
    #[error(transparent)]
    Gpu(#[from] glint_gpu::GpuError),
}

/// Result type alias using [`RenderError`].
pub type RenderResult<T> = std::result::Result<T, RenderError>;
