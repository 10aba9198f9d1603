//! Dithering against the target bit depth.

use std::sync::Arc;

use tracing::warn;

use glint_dispatch::{glsl, ShaderBuilder};
use glint_gpu::{
    find_format, FormatCaps, FormatType, Gpu, GpuResult, SampleMode, TexParams, Texture,
};

use super::DitherState;
use crate::params::{DitherMethod, DitherParams};

/// Generates a bayer (ordered) dither matrix of edge length `1 << bits`,
/// normalized to [0, 1).
fn bayer_matrix(bits: u32) -> Vec<f32> {
    let size = 1usize << bits;
    let mut out = vec![0.0f32; size * size];
    for (i, v) in out.iter_mut().enumerate() {
        let (x, y) = (i % size, i / size);
        let mut acc = 0usize;
        let (mut xc, mut yc) = (x, y ^ x);
        for _ in 0..bits {
            acc = (acc << 2) | ((yc & 1) << 1 | (xc & 1));
            xc >>= 1;
            yc >>= 1;
        }
        *v = acc as f32 / (size * size) as f32;
    }
    out
}

/// White-noise matrix from a simple deterministic PRNG.
fn white_matrix(bits: u32) -> Vec<f32> {
    let size = 1usize << bits;
    let mut state = 0x2545f491_4f6cdd1du64;
    let mut out = Vec::with_capacity(size * size);
    for _ in 0..size * size {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.push((state >> 40) as f32 / (1u64 << 24) as f32);
    }
    out
}

/// Blue-noise approximation: a bayer matrix decorrelated by white noise.
/// Good enough spectrally for the LUT sizes in play.
fn blue_matrix(bits: u32) -> Vec<f32> {
    let bayer = bayer_matrix(bits);
    let white = white_matrix(bits);
    let n = bayer.len() as f32;
    bayer
        .iter()
        .zip(&white)
        .map(|(b, w)| (b + w / n).min(0.999_999))
        .collect()
}

fn ensure_dither_lut(
    gpu: &dyn Gpu,
    state: &mut Option<DitherState>,
    params: &DitherParams,
) -> GpuResult<Arc<dyn Texture>> {
    if let Some(st) = state.as_mut() {
        if st.size == params.lut_size && st.method == params.method {
            return Ok(st.tex.clone());
        }
    }

    let matrix = match params.method {
        DitherMethod::BlueNoise => blue_matrix(params.lut_size),
        DitherMethod::Ordered => bayer_matrix(params.lut_size),
        DitherMethod::White => white_matrix(params.lut_size),
    };

    let format = find_format(gpu, FormatType::Float, 1, 32, FormatCaps::SAMPLEABLE)
        .ok_or_else(|| glint_gpu::GpuError::Unsupported("no r32f dither format".into()))?;
    let size = 1u32 << params.lut_size;
    let tex_params = TexParams {
        host_writable: true,
        sample_mode: SampleMode::Nearest,
        address_mode: glint_gpu::AddressMode::Repeat,
        ..TexParams::new_2d(size, size, format)
    };
    let tex = gpu.tex_create(&tex_params)?;
    gpu.tex_upload(&tex, bytemuck::cast_slice(&matrix))?;

    *state = Some(DitherState {
        tex: tex.clone(),
        size: params.lut_size,
        method: params.method,
        index: 0,
    });
    Ok(tex)
}

/// Dithers the current color down to `depth` bits.
pub fn dither(
    sh: &mut ShaderBuilder,
    depth: u8,
    state: &mut Option<DitherState>,
    params: &DitherParams,
    gpu: &dyn Gpu,
) {
    if !sh.require(glint_dispatch::ShaderSig::Color, 0, 0) {
        return;
    }
    let lut_tex = match ensure_dither_lut(gpu, state, params) {
        Ok(tex) => tex,
        Err(err) => {
            warn!("failed creating dither LUT: {err}");
            return;
        }
    };
    let size = 1u32 << params.lut_size;

    let mut shift = [0.0f32; 2];
    if params.temporal {
        let st = state.as_mut().unwrap();
        st.index = st.index.wrapping_add(1);
        shift = [
            (st.index % size) as f32,
            (st.index / size % size) as f32,
        ];
    }

    let lut = sh.bind_tex("dither_lut", lut_tex);
    let shift = sh.var_vec2("dither_shift", shift, params.temporal);
    let scale = ((1u64 << depth) - 1) as f32;

    glsl!(
        sh,
        "{{\n\
         vec2 pos = (gl_FragCoord.xy + {shift}) * vec2({inv:.8});\n\
         float bias = texture({lut}, pos).r;\n\
         color = vec4({scale:.1}) * color + vec4(bias);\n\
         color = floor(color) * vec4({descale:.10});\n\
         }}\n",
        inv = 1.0 / size as f32,
        descale = 1.0 / scale,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bayer_is_a_permutation() {
        let m = bayer_matrix(2);
        let mut sorted: Vec<u32> = m.iter().map(|v| (v * 16.0) as u32).collect();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_matrices_in_range() {
        for m in [bayer_matrix(4), white_matrix(4), blue_matrix(4)] {
            assert!(m.iter().all(|v| (0.0..1.0).contains(v)));
        }
    }
}
