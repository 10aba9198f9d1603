//! Texture handles and creation parameters.

use std::sync::Arc;

use crate::format::Format;

/// How a texture is addressed by samplers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplerType {
    /// Normalized [0, 1] coordinates.
    #[default]
    Normal,
    /// Unnormalized pixel coordinates (`sampler2DRect`).
    Rect,
    /// External/imported image (`samplerExternalOES`).
    External,
}

/// Interpolation applied when sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleMode {
    #[default]
    Nearest,
    Linear,
}

/// Behavior when sampling outside [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    Clamp,
    Repeat,
    Mirror,
}

/// Texture creation parameters.
#[derive(Debug, Clone)]
pub struct TexParams {
    pub w: u32,
    pub h: u32,
    /// Depth; 0 for 1D/2D textures.
    pub d: u32,
    pub format: Arc<Format>,
    pub sampleable: bool,
    pub renderable: bool,
    pub storable: bool,
    pub blit_src: bool,
    pub blit_dst: bool,
    pub host_writable: bool,
    pub host_readable: bool,
    pub sample_mode: SampleMode,
    pub address_mode: AddressMode,
}

impl TexParams {
    /// A plain sampleable 2D texture of the given size and format.
    pub fn new_2d(w: u32, h: u32, format: Arc<Format>) -> Self {
        Self {
            w,
            h,
            d: 0,
            format,
            sampleable: true,
            renderable: false,
            storable: false,
            blit_src: false,
            blit_dst: false,
            host_writable: false,
            host_readable: false,
            sample_mode: SampleMode::Nearest,
            address_mode: AddressMode::Clamp,
        }
    }

    /// Dimensionality of the texture (1, 2 or 3).
    pub fn dimension(&self) -> usize {
        if self.d > 0 {
            3
        } else if self.h > 0 {
            2
        } else {
            1
        }
    }
}

/// Opaque backend texture handle.
///
/// Resources are released when the last `Arc` drops; backends flush
/// outstanding GPU work in their own `Drop` implementations.
pub trait Texture {
    fn params(&self) -> &TexParams;

    fn sampler_type(&self) -> SamplerType {
        SamplerType::Normal
    }

    /// Downcasting support for backends that need to recover their concrete
    /// handle type from a trait object.
    fn as_any(&self) -> &dyn std::any::Any;
}
