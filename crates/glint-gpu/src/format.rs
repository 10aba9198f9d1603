//! Texture formats and capability flags.

use std::sync::Arc;

use bitflags::bitflags;

use crate::gpu::Gpu;

/// Underlying representation of a format's components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatType {
    /// Unsigned normalized integer, sampled as [0, 1].
    Unorm,
    /// Signed normalized integer, sampled as [-1, 1].
    Snorm,
    /// Unsigned integer, sampled as-is.
    Uint,
    /// Signed integer, sampled as-is.
    Sint,
    /// Floating point.
    Float,
}

bitflags! {
    /// Per-format capability bits, as reported by the backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FormatCaps: u32 {
        /// Can be sampled from in shaders.
        const SAMPLEABLE    = 1 << 0;
        /// Can be rendered to as a framebuffer attachment.
        const RENDERABLE    = 1 << 1;
        /// Can be bound as a storage image.
        const STORABLE      = 1 << 2;
        /// Can be the source or destination of a blit.
        const BLITTABLE     = 1 << 3;
        /// Supports linear (bilinear) filtering when sampled.
        const LINEAR        = 1 << 4;
        /// Supports fixed-function blending when rendered to.
        const BLENDABLE     = 1 << 5;
        /// Contents can be read back to the host.
        const HOST_READABLE = 1 << 6;
    }
}

/// A texture format, as enumerated by a backend.
///
/// Formats are interned by the backend and handed out as `Arc<Format>`;
/// identity comparisons throughout the library use [`Format::is`] rather
/// than structural equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Human-readable name, e.g. `"rgba16f"`.
    pub name: &'static str,
    pub ty: FormatType,
    /// Number of components, 1..4.
    pub num_components: usize,
    /// Bit depth of each component (0 for missing components).
    pub component_depth: [u8; 4],
    /// Size of one texel in bytes.
    pub texel_size: usize,
    pub caps: FormatCaps,
    /// GLSL vector type this format samples as, e.g. `"vec4"`.
    pub glsl_type: &'static str,
    /// GLSL image format qualifier, if the format has one (required for
    /// storage images on backends without format-less image access).
    pub glsl_format: Option<&'static str>,
}

impl Format {
    /// Pointer identity, the format equality used by caches and pools.
    #[inline]
    pub fn is(self: &Arc<Self>, other: &Arc<Format>) -> bool {
        Arc::ptr_eq(self, other)
    }

    /// Depth of the first component; used as the canonical sample depth.
    #[inline]
    pub fn depth(&self) -> u8 {
        self.component_depth[0]
    }
}

/// Finds the preferred format with the given type, component count and
/// minimum per-component depth, supporting at least the requested caps.
///
/// The backend's format list is expected to be sorted best-first (the
/// backend decides what "best" means); the first match wins.
pub fn find_format(
    gpu: &dyn Gpu,
    ty: FormatType,
    num_components: usize,
    min_depth: u8,
    caps: FormatCaps,
) -> Option<Arc<Format>> {
    gpu.formats()
        .iter()
        .find(|fmt| {
            fmt.ty == ty
                && fmt.num_components == num_components
                && fmt.depth() >= min_depth
                && fmt.caps.contains(caps)
        })
        .cloned()
}
