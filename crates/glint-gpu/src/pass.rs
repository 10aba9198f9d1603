//! Render/compute pass objects and their parameters.

use std::sync::Arc;

use glint_core::Rect;

use crate::desc::{Desc, DescBinding};
use crate::format::Format;
use crate::gpu::Timer;
use crate::tex::Texture;
use crate::var::Var;

/// Kind of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassType {
    /// Rasterized draw into a renderable target.
    Raster,
    /// Compute dispatch.
    Compute,
}

/// Vertex assembly primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimitiveType {
    TriangleList,
    #[default]
    TriangleStrip,
    TriangleFan,
}

/// Fixed-function blend factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
}

impl BlendFactor {
    /// GLSL expression of this factor, given a `color` source and `orig`
    /// destination (used when synthesizing blending in compute shaders).
    pub fn glsl_expr(self) -> &'static str {
        match self {
            Self::Zero => "0.0",
            Self::One => "1.0",
            Self::SrcAlpha => "color.a",
            Self::OneMinusSrcAlpha => "(1.0 - color.a)",
        }
    }
}

/// Fixed-function blend equation (always additive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendParams {
    pub src_rgb: BlendFactor,
    pub dst_rgb: BlendFactor,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
}

impl BlendParams {
    /// Standard src-over blending for independent alpha.
    pub const ALPHA_OVERLAY: Self = Self {
        src_rgb: BlendFactor::SrcAlpha,
        dst_rgb: BlendFactor::OneMinusSrcAlpha,
        src_alpha: BlendFactor::One,
        dst_alpha: BlendFactor::OneMinusSrcAlpha,
    };
}

/// A vertex attribute as laid out in the vertex stream.
///
/// All attributes are vectors of 32-bit floats; `components` determines the
/// GLSL type (`float` .. `vec4`) and the size within the stream.
#[derive(Debug, Clone)]
pub struct VertexAttrib {
    pub name: String,
    /// Component count, 1..4.
    pub components: usize,
    /// Byte offset within one vertex.
    pub offset: usize,
    /// Shader location.
    pub location: usize,
}

impl VertexAttrib {
    /// Size of this attribute within one vertex, in bytes.
    pub fn texel_size(&self) -> usize {
        self.components * 4
    }

    /// GLSL type of the attribute.
    pub fn glsl_type(&self) -> &'static str {
        match self.components {
            1 => "float",
            2 => "vec2",
            3 => "vec3",
            _ => "vec4",
        }
    }
}

/// Pass creation parameters, produced by the dispatch engine.
#[derive(Clone)]
pub struct PassParams {
    pub ty: PassType,

    /// Fragment or compute shader source.
    pub glsl_shader: String,
    /// Vertex shader source (raster passes only).
    pub vertex_shader: Option<String>,

    /// Input variables bound as loose/global uniforms.
    pub variables: Vec<Var>,
    /// Descriptor declarations, with bindings assigned.
    pub descriptors: Vec<Desc>,

    /// Vertex stream layout (raster passes only).
    pub vertex_attribs: Vec<VertexAttrib>,
    pub vertex_stride: usize,
    pub vertex_type: PrimitiveType,

    /// Total push constant region size (aligned to 4).
    pub push_constants_size: usize,

    /// Blend parameters; `None` disables blending.
    pub blend: Option<BlendParams>,
    /// Whether the target's previous contents must be preserved.
    pub load_target: bool,
    /// Format of the target this pass renders to (raster passes only).
    pub target_format: Option<Arc<Format>>,

    /// Compute workgroup size (compute passes only).
    pub compute_group_size: [u32; 2],
    /// Compute shared memory requirement in bytes.
    pub compute_shmem: usize,

    /// Previously compiled program binary to try re-attaching, if any.
    pub cached_program: Option<Vec<u8>>,
}

impl std::fmt::Debug for PassParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassParams")
            .field("ty", &self.ty)
            .field("variables", &self.variables.len())
            .field("descriptors", &self.descriptors.len())
            .field("vertex_attribs", &self.vertex_attribs.len())
            .field("push_constants_size", &self.push_constants_size)
            .field("blend", &self.blend)
            .field("load_target", &self.load_target)
            .finish_non_exhaustive()
    }
}

/// An update to a single global input variable.
#[derive(Debug, Clone)]
pub struct VarUpdate {
    /// Index into [`PassParams::variables`].
    pub index: usize,
    pub data: Vec<u8>,
}

/// Per-run pass parameters.
#[derive(Clone)]
pub struct PassRunParams {
    pub pass: Arc<dyn Pass>,

    /// One binding per descriptor, in declaration order.
    pub desc_bindings: Vec<DescBinding>,
    /// Global variable updates for this run.
    pub var_updates: Vec<VarUpdate>,
    /// Push constant bytes (`push_constants_size` long).
    pub push_constants: Vec<u8>,

    /// Raster: raw vertex data.
    pub vertex_data: Vec<u8>,
    pub vertex_count: usize,
    /// Raster: scissor rect, normalized and clipped.
    pub scissors: Rect,
    /// Raster: the target texture.
    pub target: Option<Arc<dyn Texture>>,

    /// Compute: dispatch size in workgroups.
    pub compute_groups: [u32; 3],

    pub timer: Option<Arc<dyn Timer>>,
}

/// Opaque backend pass handle.
pub trait Pass {
    fn params(&self) -> &PassParams;

    /// The backend-compiled program binary, if the backend exposes one.
    fn cached_program(&self) -> Option<&[u8]> {
        None
    }
}
