//! # glint-dispatch
//!
//! The shader dispatch engine: turns partially constructed shaders
//! ([`ShaderBuilder`]) into compiled backend passes, decides how each input
//! variable is bound (push constants vs. uniform buffer vs. global
//! uniform), generates the complete GLSL source, and caches compiled
//! passes under a stable content signature.
//!
//! # Architecture
//!
//! ```text
//! Dispatch
//!   ├── begin() ───────────► ShaderBuilder (pooled, reusable)
//!   │                             │ GLSL body, vars, descriptors, attribs
//!   ├── finish()/compute()/vertex()
//!   │       │
//!   │       ├── signature lookup ──► compiled-pass cache (age-evicted)
//!   │       ├── variable placement (pushc → UBO → global)
//!   │       ├── source generation (preamble, bindings, main stubs)
//!   │       └── Gpu::pass_create / Gpu::pass_run
//!   │
//!   └── save()/load() ─────► program binary cache blob ("PLDP")
//! ```

pub mod engine;
pub mod generate;
pub mod shader;

pub use engine::{
    ComputeDispatchParams, Dispatch, DispatchParams, UserVertexAttrib, VertexCoords,
    VertexDispatchParams,
};
pub use shader::{ShaderBuilder, ShaderDesc, ShaderSig, ShaderVa, ShaderVar};

use thiserror::Error;

/// Errors surfaced by the dispatch engine.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The shader was marked as failed during construction.
    #[error("trying to dispatch a failed shader")]
    FailedShader,

    /// The shader's input/output signature doesn't fit the dispatch mode.
    #[error("incompatible shader signature: {0}")]
    Incompatible(String),

    /// The dispatch target is unusable (not renderable, not storable, ...).
    #[error("invalid dispatch target: {0}")]
    BadTarget(String),

    /// No binding method could accommodate an input variable.
    #[error("unable to place input variable '{0}': exhausted UBO size limits?")]
    VarPlacement(String),

    /// Invalid vertex dispatch parameters.
    #[error("invalid vertex parameters: {0}")]
    BadVertices(String),

    /// The pass for this signature previously failed to compile; the
    /// dispatch was skipped. Deliberately not logged after the first
    /// failure.
    #[error("pass compilation previously failed for this shader")]
    PassFailed,

    /// Backend failure.
    #[error(transparent)]
    Gpu(#[from] glint_gpu::GpuError),
}

/// Result type alias using [`DispatchError`].
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Appends formatted GLSL to a shader's function body.
///
/// ```ignore
/// glsl!(sh, "color *= vec4({scale});\n");
/// ```
#[macro_export]
macro_rules! glsl {
    ($sh:expr, $($fmt:tt)*) => {
        $sh.append_body(::std::format_args!($($fmt)*))
    };
}

/// Appends formatted GLSL to a shader's header (global scope: helper
/// functions, defines).
#[macro_export]
macro_rules! glsl_h {
    ($sh:expr, $($fmt:tt)*) => {
        $sh.append_header(::std::format_args!($($fmt)*))
    };
}
