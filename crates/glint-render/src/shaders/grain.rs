//! AV1 film grain synthesis.
//!
//! Grain is reconstructed from the metadata carried by decoded frames: a
//! seeded noise pattern scaled by the piecewise-linear intensity curves.
//! The noise LUT is generated once per seed and owned by the renderer.

use std::sync::Arc;

use tracing::warn;

use glint_dispatch::{glsl, glsl_h, ShaderBuilder};
use glint_gpu::{
    find_format, FormatCaps, FormatType, Gpu, GpuResult, SampleMode, TexParams, Texture,
};

use super::GrainState;
use crate::frame::{Channel, GrainData};

/// Parameters for one grain application.
pub struct GrainParams<'a> {
    pub data: &'a GrainData,
    /// The plane's channels, in texture component order.
    pub channels: [Channel; 4],
    pub components: usize,
}

/// Whether this plane needs grain at all: some scaling curve must be
/// non-empty for a channel the plane actually carries.
pub fn needs_grain(params: &GrainParams<'_>) -> bool {
    let data = params.data;
    for c in 0..params.components {
        let wants = match params.channels[c] {
            Channel::Y => !data.y_points.is_empty(),
            Channel::Cb => !data.uv_points[0].is_empty() || data.chroma_scaling_from_luma,
            Channel::Cr => !data.uv_points[1].is_empty() || data.chroma_scaling_from_luma,
            _ => false,
        };
        if wants {
            return true;
        }
    }
    false
}

const GRAIN_SIZE: u32 = 64;

/// Gaussian-ish noise from the AV1 LFSR, quantized to 8-bit like the
/// reference grain synthesis.
fn generate_noise(seed: u16) -> Vec<f32> {
    let mut state = seed as u32 | 0x1_0000;
    let mut rand = || {
        // 16-bit LFSR from the AV1 spec
        let bit = (state ^ (state >> 1) ^ (state >> 3) ^ (state >> 12)) & 1;
        state = (state >> 1) | (bit << 15);
        (state & 0x7ff) as i32 - 1024
    };

    let n = (GRAIN_SIZE * GRAIN_SIZE) as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        // Sum of three draws approximates the gaussian the spec tabulates
        let v = rand() + rand() + rand();
        out.push(v as f32 / (3.0 * 1024.0));
    }
    out
}

fn ensure_grain_lut(
    gpu: &dyn Gpu,
    state: &mut Option<GrainState>,
    seed: u16,
) -> GpuResult<Arc<dyn Texture>> {
    if let Some(st) = state.as_ref() {
        if st.seed == seed {
            return Ok(st.tex.clone());
        }
    }

    let noise = generate_noise(seed);
    let format = find_format(gpu, FormatType::Float, 1, 32, FormatCaps::SAMPLEABLE)
        .ok_or_else(|| glint_gpu::GpuError::Unsupported("no r32f grain format".into()))?;
    let params = TexParams {
        host_writable: true,
        sample_mode: SampleMode::Nearest,
        address_mode: glint_gpu::AddressMode::Repeat,
        ..TexParams::new_2d(GRAIN_SIZE, GRAIN_SIZE, format)
    };
    let tex = gpu.tex_create(&params)?;
    gpu.tex_upload(&tex, bytemuck::cast_slice(&noise))?;

    *state = Some(GrainState {
        tex: tex.clone(),
        seed,
    });
    Ok(tex)
}

/// Emits the piecewise-linear scaling curve lookup as a helper function,
/// returning its name.
fn emit_scaling_fn(sh: &mut ShaderBuilder, points: &[[u8; 2]], shift: u8) -> String {
    let name = sh.fresh("grain_scale");
    let norm = 1.0 / ((1 << shift) as f32 * 255.0);

    let mut body = String::new();
    use std::fmt::Write;
    if points.is_empty() {
        body.push_str("return 0.0;\n");
    } else {
        let first = points[0];
        let _ = write!(
            body,
            "if (x <= {:.6}) return {:.6};\n",
            first[0] as f32 / 255.0,
            first[1] as f32 * norm
        );
        for pair in points.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let x0 = a[0] as f32 / 255.0;
            let x1 = b[0] as f32 / 255.0;
            let y0 = a[1] as f32 * norm;
            let y1 = b[1] as f32 * norm;
            let slope = if x1 > x0 { (y1 - y0) / (x1 - x0) } else { 0.0 };
            let _ = write!(
                body,
                "if (x <= {x1:.6}) return {y0:.6} + (x - {x0:.6}) * {slope:.6};\n"
            );
        }
        let last = points[points.len() - 1];
        let _ = write!(body, "return {:.6};\n", last[1] as f32 * norm);
    }

    glsl_h!(sh, "float {name}(float x) {{\n{body}}}\n");
    name
}

/// Applies film grain to the sampled color. Returns false when the
/// shader could not be generated.
pub fn apply_grain(
    sh: &mut ShaderBuilder,
    state: &mut Option<GrainState>,
    params: &GrainParams<'_>,
    gpu: &dyn Gpu,
) -> bool {
    if !sh.require(glint_dispatch::ShaderSig::Color, 0, 0) {
        return false;
    }

    let lut_tex = match ensure_grain_lut(gpu, state, params.data.seed) {
        Ok(tex) => tex,
        Err(err) => {
            warn!("failed creating grain LUT: {err}");
            return false;
        }
    };
    let lut = sh.bind_tex("grain_lut", lut_tex);
    let scale = if params.data.grain_scale > 0.0 {
        params.data.grain_scale
    } else {
        1.0
    };

    glsl!(
        sh,
        "{{\n\
         vec2 grain_pos = gl_FragCoord.xy * vec2({inv:.8});\n\
         float grain = texture({lut}, grain_pos).r * {scale:.6};\n",
        inv = 1.0 / GRAIN_SIZE as f32,
    );

    let shift = params.data.scaling_shift;
    for c in 0..params.components {
        let points: &[[u8; 2]] = match params.channels[c] {
            Channel::Y => &params.data.y_points,
            Channel::Cb => {
                if params.data.chroma_scaling_from_luma {
                    &params.data.y_points
                } else {
                    &params.data.uv_points[0]
                }
            }
            Channel::Cr => {
                if params.data.chroma_scaling_from_luma {
                    &params.data.y_points
                } else {
                    &params.data.uv_points[1]
                }
            }
            _ => continue,
        };
        if points.is_empty() {
            continue;
        }
        let scaling = emit_scaling_fn(sh, points, shift);
        glsl!(
            sh,
            "color[{c}] = clamp(color[{c}] + grain * {scaling}(color[{c}]), 0.0, 1.0);\n"
        );
    }

    glsl!(sh, "}}\n");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_is_deterministic() {
        assert_eq!(generate_noise(42), generate_noise(42));
        assert_ne!(generate_noise(42), generate_noise(43));
    }

    #[test]
    fn test_needs_grain() {
        let data = GrainData {
            y_points: vec![[0, 32], [255, 32]],
            ..Default::default()
        };
        let params = GrainParams {
            data: &data,
            channels: [Channel::Y, Channel::None, Channel::None, Channel::None],
            components: 1,
        };
        assert!(needs_grain(&params));

        let chroma = GrainParams {
            channels: [Channel::Cb, Channel::Cr, Channel::None, Channel::None],
            components: 2,
            ..params
        };
        assert!(!needs_grain(&chroma), "no chroma points declared");
    }
}
