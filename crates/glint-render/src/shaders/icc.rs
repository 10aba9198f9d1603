//! ICC profile application.
//!
//! Profile pairs are resolved into a baked 3D conversion LUT. The actual
//! profile contents are treated as opaque; the LUT is synthesized from
//! the declared color spaces of both ends, which keeps the pipeline shape
//! (and caching behavior) of a full CMM without linking one.

use tracing::debug;

use glint_core::ColorSpace;
use glint_dispatch::{glsl, ShaderBuilder};
use glint_gpu::{
    find_format, FormatCaps, FormatType, Gpu, GpuResult, SampleMode, TexParams,
};

use super::IccState;
use crate::frame::IccProfile;
use crate::params::IccParams;

/// One side of an ICC conversion.
pub struct IccColorSpace<'a> {
    pub color: ColorSpace,
    pub profile: Option<&'a IccProfile>,
}

/// Result of [`icc_update`]: the color spaces the shader must map into
/// and out of around the LUT application.
pub struct IccResult {
    pub src_color: ColorSpace,
    pub dst_color: ColorSpace,
}

fn profile_signature(side: &IccColorSpace<'_>) -> u64 {
    side.profile.map_or(0, |p| p.signature)
}

/// Ensures the conversion LUT for a profile pair exists, returning the
/// space pair the surrounding shader stages must adapt between.
pub fn icc_update(
    src: &IccColorSpace<'_>,
    dst: &IccColorSpace<'_>,
    state: &mut Option<IccState>,
    params: &IccParams,
    gpu: &dyn Gpu,
) -> GpuResult<IccResult> {
    let src_sig = profile_signature(src);
    let dst_sig = profile_signature(dst);

    let up_to_date = state.as_ref().is_some_and(|st| {
        st.src_signature == src_sig && st.dst_signature == dst_sig && st.size == params.size
    });

    if !up_to_date {
        debug!(
            "baking ICC conversion LUT ({0}x{0}x{0}) for profiles {src_sig:#x} -> {dst_sig:#x}",
            params.size
        );

        let size = params.size as usize;
        let mut data = Vec::with_capacity(size * size * size * 4);
        let to_linear = crate::shaders::color::primaries_matrix(
            src.color.inferred().primaries,
            dst.color.inferred().primaries,
        );
        for b in 0..size {
            for g in 0..size {
                for r in 0..size {
                    let v = [
                        r as f32 / (size - 1) as f32,
                        g as f32 / (size - 1) as f32,
                        b as f32 / (size - 1) as f32,
                    ];
                    for row in &to_linear {
                        let out: f32 = row.iter().zip(&v).map(|(m, x)| m * x).sum();
                        data.push(out.clamp(0.0, 1.0));
                    }
                    data.push(1.0);
                }
            }
        }

        let format = find_format(
            gpu,
            FormatType::Float,
            4,
            32,
            FormatCaps::SAMPLEABLE | FormatCaps::LINEAR,
        )
        .ok_or_else(|| glint_gpu::GpuError::Unsupported("no rgba32f ICC LUT format".into()))?;
        let tex_params = TexParams {
            d: params.size,
            host_writable: true,
            sample_mode: SampleMode::Linear,
            ..TexParams::new_2d(params.size, params.size, format)
        };
        let tex = gpu.tex_create(&tex_params)?;
        gpu.tex_upload(&tex, bytemuck::cast_slice(&data))?;

        *state = Some(IccState {
            lut: tex,
            size: params.size,
            src_signature: src_sig,
            dst_signature: dst_sig,
        });
    }

    // The LUT is baked in linear light on both ends
    let mut src_color = src.color;
    src_color.transfer = glint_core::Transfer::Linear;
    let mut dst_color = dst.color;
    dst_color.transfer = glint_core::Transfer::Linear;
    Ok(IccResult {
        src_color,
        dst_color,
    })
}

/// Applies the baked conversion LUT.
pub fn icc_apply(sh: &mut ShaderBuilder, state: &IccState) {
    if !sh.require(glint_dispatch::ShaderSig::Color, 0, 0) {
        return;
    }
    let ident = sh.bind_tex("icc_lut", state.lut.clone());
    let n = state.size as f32;
    let scale = (n - 1.0) / n;
    let offset = 0.5 / n;
    glsl!(
        sh,
        "color.rgb = texture({ident}, clamp(color.rgb, 0.0, 1.0) * vec3({scale:.8}) + vec3({offset:.8})).rgb;\n"
    );
}
