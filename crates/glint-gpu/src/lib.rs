//! # glint-gpu
//!
//! Backend-agnostic GPU abstraction for the glint rendering library.
//!
//! Everything above this crate (the shader dispatch engine, the render
//! planner) talks to the GPU exclusively through the [`Gpu`] trait and the
//! opaque handle traits ([`Texture`], [`Buffer`], [`Pass`], [`Timer`]).
//! Real backends (Vulkan, OpenGL, ...) live out of tree; this crate ships
//! only the trait surface, the shared value types (formats, variable
//! layouts, descriptors, pass parameters) and [`SoftGpu`], a pure-software
//! stand-in used by the test suites.
//!
//! # Architecture
//!
//! ```text
//! glint-render / glint-dispatch
//!         └── Gpu (trait)
//!                 ├── SoftGpu (this crate, tests only)
//!                 └── vulkan / opengl backends (out of tree)
//! ```

pub mod buf;
pub mod desc;
pub mod format;
pub mod gpu;
pub mod pass;
pub mod soft;
pub mod tex;
pub mod var;

pub use buf::{BufParams, Buffer};
pub use desc::{BindingObject, Desc, DescAccess, DescBinding, DescType, MemoryFlags};
pub use format::{find_format, Format, FormatCaps, FormatType};
pub use gpu::{GlslVersion, Gpu, GpuCaps, GpuLimits, Timer};
pub use pass::{
    BlendFactor, BlendParams, Pass, PassParams, PassRunParams, PassType, PrimitiveType, VarUpdate,
    VertexAttrib,
};
pub use soft::SoftGpu;
pub use tex::{AddressMode, SampleMode, SamplerType, TexParams, Texture};
pub use var::{host_layout, memcpy_layout, std140_layout, std430_layout, Var, VarLayout, VarType};

use thiserror::Error;

/// Errors surfaced by GPU backends.
#[derive(Debug, Error)]
pub enum GpuError {
    /// Texture creation failed (out of memory, unsupported params, ...).
    #[error("failed creating texture: {0}")]
    TexCreate(String),

    /// Buffer creation failed.
    #[error("failed creating buffer: {0}")]
    BufCreate(String),

    /// Render/compute pass creation failed.
    #[error("failed creating pass: {0}")]
    PassCreate(String),

    /// Shader source failed to compile or link.
    #[error("shader compilation failed: {0}")]
    ShaderCompile(String),

    /// A host <-> GPU transfer failed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The operation is not supported by this backend.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The device was lost; the GPU object is no longer usable.
    #[error("device lost")]
    DeviceLost,
}

/// Result type alias using [`GpuError`].
pub type GpuResult<T> = std::result::Result<T, GpuError>;
