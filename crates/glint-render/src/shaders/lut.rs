//! Custom 3D LUT application.

use std::sync::Arc;

use tracing::warn;

use glint_dispatch::{glsl, ShaderBuilder};
use glint_gpu::{
    find_format, FormatCaps, FormatType, Gpu, GpuResult, SampleMode, TexParams, Texture,
};

use super::LutState;
use crate::frame::FrameLut;

fn ensure_lut_tex(
    gpu: &dyn Gpu,
    state: &mut Option<LutState>,
    lut: &FrameLut,
) -> GpuResult<Arc<dyn Texture>> {
    if let Some(st) = state.as_ref() {
        if st.signature == lut.signature {
            return Ok(st.tex.clone());
        }
    }

    // Pad the RGB triples out to RGBA texels
    let texels = lut.size[0] * lut.size[1] * lut.size[2];
    let mut data = Vec::with_capacity(texels * 4);
    for i in 0..texels {
        data.extend_from_slice(&lut.samples[i * 3..i * 3 + 3]);
        data.push(1.0f32);
    }

    let format = find_format(
        gpu,
        FormatType::Float,
        4,
        32,
        FormatCaps::SAMPLEABLE | FormatCaps::LINEAR,
    )
    .ok_or_else(|| glint_gpu::GpuError::Unsupported("no rgba32f LUT format".into()))?;

    let params = TexParams {
        d: lut.size[2] as u32,
        host_writable: true,
        sample_mode: SampleMode::Linear,
        ..TexParams::new_2d(lut.size[0] as u32, lut.size[1] as u32, format)
    };
    let tex = gpu.tex_create(&params)?;
    gpu.tex_upload(&tex, bytemuck::cast_slice(&data))?;

    *state = Some(LutState {
        tex: tex.clone(),
        signature: lut.signature,
    });
    Ok(tex)
}

/// Applies a custom 3D LUT to the current color, trilinearly
/// interpolated, with the lookup rescaled to hit texel centers.
pub fn custom_lut(
    sh: &mut ShaderBuilder,
    lut: &FrameLut,
    state: &mut Option<LutState>,
    gpu: &dyn Gpu,
) {
    if !sh.require(glint_dispatch::ShaderSig::Color, 0, 0) {
        return;
    }
    let tex = match ensure_lut_tex(gpu, state, lut) {
        Ok(tex) => tex,
        Err(err) => {
            warn!("failed creating LUT texture: {err}");
            return;
        }
    };
    let ident = sh.bind_tex("custom_lut", tex);

    let scale = [
        (lut.size[0] - 1) as f32 / lut.size[0] as f32,
        (lut.size[1] - 1) as f32 / lut.size[1] as f32,
        (lut.size[2] - 1) as f32 / lut.size[2] as f32,
    ];
    let offset = [
        0.5 / lut.size[0] as f32,
        0.5 / lut.size[1] as f32,
        0.5 / lut.size[2] as f32,
    ];
    let scale = sh.var_vec3("lut_scale", scale, false);
    let offset = sh.var_vec3("lut_offset", offset, false);

    glsl!(
        sh,
        "color.rgb = texture({ident}, clamp(color.rgb, 0.0, 1.0) * {scale} + {offset}).rgb;\n"
    );
}
