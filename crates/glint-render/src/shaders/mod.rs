//! Per-stage shader generators.
//!
//! Each submodule exposes functions that mutate a [`ShaderBuilder`] to
//! append one pipeline stage (sampling, color decoding, dithering, ...).
//! Stages with persistent GPU state (filter LUTs, dither matrices, peak
//! detection buffers) keep it in small state objects owned by the
//! renderer and recreated on demand when their configuration changes.
//!
//! [`ShaderBuilder`]: glint_dispatch::ShaderBuilder

pub mod color;
pub mod dither;
pub mod grain;
pub mod icc;
pub mod lut;
pub mod sampling;

use std::sync::Arc;

use glint_gpu::{Buffer, Texture};

/// A sampled filter kernel, uploaded as a 1D LUT texture.
pub struct ScalerLut {
    pub tex: Arc<dyn Texture>,
    /// Identity of the filter configuration + entry count this LUT holds.
    pub key: u64,
}

/// Per-scaler persistent state (up- and downscaler LUTs).
#[derive(Default)]
pub struct SamplerState {
    pub upscaler: Option<ScalerLut>,
    pub downscaler: Option<ScalerLut>,
}

/// Persistent dither pattern texture.
pub struct DitherState {
    pub tex: Arc<dyn Texture>,
    pub size: u32,
    pub method: crate::params::DitherMethod,
    /// Frame counter for temporal dithering.
    pub index: u32,
}

/// Persistent 3D LUT texture for custom LUT application.
pub struct LutState {
    pub tex: Arc<dyn Texture>,
    pub signature: u64,
}

/// Persistent film grain LUT.
pub struct GrainState {
    pub tex: Arc<dyn Texture>,
    pub seed: u16,
}

/// Persistent peak detection buffer: the running peak/average estimate
/// shared between the detection and tone-mapping shaders.
pub struct PeakDetectState {
    pub buf: Arc<dyn Buffer>,
}

/// Persistent ICC conversion LUT, keyed by the profile pair.
pub struct IccState {
    pub lut: Arc<dyn Texture>,
    pub size: u32,
    pub src_signature: u64,
    pub dst_signature: u64,
}
