//! Texture sampling shaders: direct, bicubic, polar and separable
//! kernels, plus debanding.

use std::sync::Arc;

use tracing::warn;

use glint_core::hash::{hash_merge, ContentHasher};
use glint_core::RectF;
use glint_dispatch::{glsl, glsl_h, ShaderBuilder, ShaderSig};
use glint_gpu::{
    find_format, AddressMode, FormatCaps, FormatType, Gpu, GpuResult, SampleMode, TexParams,
    Texture,
};

use super::ScalerLut;
use crate::filter::{filter_sample, FilterConfig};
use crate::params::DebandParams;

/// Description of a texture sampling operation.
#[derive(Clone)]
pub struct SampleSrc {
    pub tex: Option<Arc<dyn Texture>>,
    /// Components to sample, 1..4.
    pub components: usize,
    /// Multiplier applied to the sampled value (bit-depth normalization).
    pub scale: f32,
    /// Output dimensions the result will effectively cover.
    pub new_w: u32,
    pub new_h: u32,
    /// Region to sample, in the texture's pixel space. May be fractional
    /// and/or flipped.
    pub rect: RectF,
    pub address_mode: AddressMode,
}

impl Default for SampleSrc {
    fn default() -> Self {
        Self {
            tex: None,
            components: 4,
            scale: 1.0,
            new_w: 0,
            new_h: 0,
            rect: RectF::default(),
            address_mode: AddressMode::Clamp,
        }
    }
}

impl SampleSrc {
    pub fn from_tex(tex: Arc<dyn Texture>) -> Self {
        let (w, h) = (tex.params().w, tex.params().h);
        Self {
            tex: Some(tex),
            new_w: w,
            new_h: h,
            rect: RectF::new(0.0, 0.0, w as f32, h as f32),
            ..Default::default()
        }
    }

    /// Effective sample rect, defaulting to the full texture.
    fn rect_or_full(&self) -> RectF {
        if self.rect.is_zero() {
            let params = self.tex.as_ref().expect("sample source").params();
            RectF::new(0.0, 0.0, params.w as f32, params.h as f32)
        } else {
            self.rect
        }
    }
}

fn bind_src(sh: &mut ShaderBuilder, src: &SampleSrc) -> (String, String) {
    let tex = src.tex.clone().expect("sample source has a texture");
    let rect = src.rect_or_full();
    sh.bind_tex_pos("src_tex", tex, rect)
}

fn apply_scale(sh: &mut ShaderBuilder, scale: f32) {
    if (scale - 1.0).abs() > 1e-6 {
        glsl!(sh, "color *= vec4({scale:.8});\n");
    }
}

/// Convenience for sampling a full texture 1:1.
pub fn sample_direct_tex(sh: &mut ShaderBuilder, tex: &Arc<dyn Texture>, scale: f32) {
    let mut src = SampleSrc::from_tex(tex.clone());
    src.scale = scale;
    sample_direct(sh, &src);
}

/// Samples the texture once, letting the texture's own sample mode decide
/// the interpolation.
pub fn sample_direct(sh: &mut ShaderBuilder, src: &SampleSrc) {
    if !sh.require(ShaderSig::None, src.new_w, src.new_h) {
        return;
    }
    let (tex, pos) = bind_src(sh, src);
    glsl!(sh, "vec4 color = texture({tex}, {pos});\n");
    apply_scale(sh, src.scale);
}

/// Nearest-neighbour sampling, snapping coordinates to texel centers.
pub fn sample_nearest(sh: &mut ShaderBuilder, src: &SampleSrc) {
    if !sh.require(ShaderSig::None, src.new_w, src.new_h) {
        return;
    }
    let (tex, pos) = bind_src(sh, src);
    glsl!(
        sh,
        "vec2 size = vec2(textureSize({tex}, 0));\n\
         vec4 color = texture({tex}, (floor({pos} * size) + vec2(0.5)) / size);\n"
    );
    apply_scale(sh, src.scale);
}

/// Fast bicubic sampling via 4 bilinear taps. Requires linear filtering
/// on the source texture.
pub fn sample_bicubic(sh: &mut ShaderBuilder, src: &SampleSrc) {
    if !sh.require(ShaderSig::None, src.new_w, src.new_h) {
        return;
    }
    if let Some(tex) = &src.tex {
        debug_assert!(
            tex.params().format.caps.contains(FormatCaps::LINEAR),
            "bicubic sampling requires linear filtering"
        );
    }
    let (tex, pos) = bind_src(sh, src);
    glsl!(
        sh,
        "vec2 size = vec2(textureSize({tex}, 0));\n\
         vec2 pt = vec2(1.0) / size;\n\
         vec2 fcoord = fract({pos} * size + vec2(0.5));\n\
         vec4 parmx = vec4(1.0 - fcoord.x, fcoord.x, 0.0, 0.0);\n\
         vec4 parmy = vec4(1.0 - fcoord.y, fcoord.y, 0.0, 0.0);\n\
         parmx.xy = parmx.xy * parmx.xy * parmx.xy;\n\
         parmy.xy = parmy.xy * parmy.xy * parmy.xy;\n\
         parmx.z = 1.5 - abs(fcoord.x - 0.5);\n\
         parmy.z = 1.5 - abs(fcoord.y - 0.5);\n\
         vec2 c01 = {pos} + pt * vec2(parmx.z - fcoord.x, parmy.z - fcoord.y - 1.0);\n\
         vec2 c23 = {pos} + pt * vec2(parmx.z - fcoord.x, parmy.z - fcoord.y + 1.0);\n\
         vec4 ab = mix(texture({tex}, c23), texture({tex}, c01), parmy.x + parmy.y);\n\
         vec2 d01 = {pos} + pt * vec2(parmx.z - fcoord.x - 1.0, parmy.z - fcoord.y);\n\
         vec2 d23 = {pos} + pt * vec2(parmx.z - fcoord.x + 1.0, parmy.z - fcoord.y);\n\
         vec4 cd = mix(texture({tex}, d23), texture({tex}, d01), parmy.x + parmy.y);\n\
         vec4 color = mix(cd, ab, parmx.x + parmx.y);\n"
    );
    apply_scale(sh, src.scale);
}

/// Parameters shared by the complex (LUT-driven) samplers.
pub struct FilterParams<'a> {
    pub config: &'static FilterConfig,
    pub lut_entries: usize,
    /// Contributions below this weight are culled (polar only).
    pub cutoff: f32,
    pub antiring: f32,
    pub no_compute: bool,
    pub no_widening: bool,
    pub lut: &'a mut Option<ScalerLut>,
}

fn lut_key(config: &'static FilterConfig, entries: usize) -> u64 {
    let mut h = ContentHasher::new();
    h.write_str(config.name);
    h.write_u64(entries as u64);
    let mut key = h.finish();
    hash_merge(&mut key, config as *const _ as usize as u64);
    key
}

/// Uploads (or reuses) the sampled-kernel LUT for a filter config.
fn ensure_filter_lut(
    gpu: &dyn Gpu,
    state: &mut Option<ScalerLut>,
    config: &'static FilterConfig,
    entries: usize,
) -> GpuResult<Arc<dyn Texture>> {
    let key = lut_key(config, entries);
    if let Some(lut) = state {
        if lut.key == key {
            return Ok(lut.tex.clone());
        }
    }

    let radius = config.radius();
    let mut weights = Vec::with_capacity(entries);
    for i in 0..entries {
        let x = radius * i as f32 / (entries - 1) as f32;
        weights.push(filter_sample(config, x));
    }

    let format = find_format(
        gpu,
        FormatType::Float,
        1,
        32,
        FormatCaps::SAMPLEABLE | FormatCaps::LINEAR,
    )
    .ok_or_else(|| glint_gpu::GpuError::Unsupported("no r32f filter LUT format".into()))?;

    let params = TexParams {
        host_writable: true,
        sample_mode: SampleMode::Linear,
        ..TexParams::new_2d(entries as u32, 1, format)
    };
    let tex = gpu.tex_create(&params)?;
    gpu.tex_upload(&tex, bytemuck::cast_slice(&weights))?;

    *state = Some(ScalerLut {
        tex: tex.clone(),
        key,
    });
    Ok(tex)
}

/// Ratio-aware filter radius: when downscaling, the kernel is stretched
/// by the inverse scaling ratio (unless widening is disabled).
fn effective_radius(config: &'static FilterConfig, ratio: f32, no_widening: bool) -> f32 {
    let base = config.radius();
    if ratio < 1.0 && !no_widening {
        base / ratio
    } else {
        base
    }
}

/// Single-pass polar (EWA) sampler. Returns false when the shader could
/// not be generated (the caller falls back to simpler sampling).
pub fn sample_polar(
    sh: &mut ShaderBuilder,
    src: &SampleSrc,
    params: &mut FilterParams<'_>,
    gpu: &dyn Gpu,
) -> bool {
    if !sh.require(ShaderSig::None, src.new_w, src.new_h) {
        return false;
    }

    let rect = src.rect_or_full();
    let ratio_x = src.new_w as f32 / rect.w().abs();
    let ratio_y = src.new_h as f32 / rect.h().abs();
    let ratio = ratio_x.min(ratio_y).min(1.0);
    let radius = effective_radius(params.config, ratio, params.no_widening);
    let radius_i = radius.ceil() as i32;

    let lut_tex = match ensure_filter_lut(gpu, params.lut, params.config, params.lut_entries) {
        Ok(tex) => tex,
        Err(err) => {
            warn!("failed creating polar sampler LUT: {err}");
            return false;
        }
    };

    if !params.no_compute {
        // Polar kernels profit from compute, but work fine without
        let _ = sh.try_compute(8, 8, true, 0, gpu.caps(), gpu.limits());
    }

    let (tex, pos) = bind_src(sh, src);
    let lut = sh.bind_tex("polar_lut", lut_tex);
    let cutoff = params.cutoff;

    glsl!(
        sh,
        "vec4 color = vec4(0.0);\n\
         {{\n\
         vec2 size = vec2(textureSize({tex}, 0));\n\
         vec2 pt = vec2(1.0) / size;\n\
         vec2 fcoord = fract({pos} * size - vec2(0.5));\n\
         vec2 base = {pos} - pt * fcoord;\n\
         float w, d, wsum = 0.0;\n\
         vec4 c;\n"
    );
    glsl!(
        sh,
        "for (int y = {}; y <= {radius_i}; y++) {{\n\
         for (int x = {}; x <= {radius_i}; x++) {{\n",
        1 - radius_i,
        1 - radius_i,
    );
    glsl!(
        sh,
        "d = length(vec2(float(x), float(y)) - fcoord) * {:.8};\n\
         if (d >= 1.0) continue;\n\
         w = texture({lut}, vec2(d, 0.5)).r;\n\
         if (abs(w) < {cutoff:.8}) continue;\n\
         c = texture({tex}, base + pt * vec2(float(x), float(y)));\n\
         color += w * c;\n\
         wsum += w;\n\
         }}\n\
         }}\n\
         color /= vec4(wsum);\n\
         }}\n",
        1.0 / radius,
    );
    apply_scale(sh, src.scale);
    true
}

/// Direction of one separable sampling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SepDir {
    Horizontal,
    Vertical,
}

/// One direction of a two-pass orthogonal (separable) sampler.
pub fn sample_ortho(
    sh: &mut ShaderBuilder,
    dir: SepDir,
    src: &SampleSrc,
    params: &mut FilterParams<'_>,
    gpu: &dyn Gpu,
) -> bool {
    // The pass scales only along `dir`; the other axis stays 1:1
    let rect = src.rect_or_full();
    let (new_w, new_h, ratio) = match dir {
        SepDir::Horizontal => (src.new_w, src.new_h, src.new_w as f32 / rect.w().abs()),
        SepDir::Vertical => {
            let w = src.tex.as_ref().map_or(src.new_w, |t| t.params().w);
            (w, src.new_h, src.new_h as f32 / rect.h().abs())
        }
    };
    if !sh.require(ShaderSig::None, new_w, new_h) {
        return false;
    }

    let radius = effective_radius(params.config, ratio.min(1.0), params.no_widening);
    let radius_i = radius.ceil() as i32;

    let lut_tex = match ensure_filter_lut(gpu, params.lut, params.config, params.lut_entries) {
        Ok(tex) => tex,
        Err(err) => {
            warn!("failed creating ortho sampler LUT: {err}");
            return false;
        }
    };

    let (tex, pos) = bind_src(sh, src);
    let lut = sh.bind_tex("ortho_lut", lut_tex);
    let axis = match dir {
        SepDir::Horizontal => "vec2(1.0, 0.0)",
        SepDir::Vertical => "vec2(0.0, 1.0)",
    };

    glsl!(
        sh,
        "vec4 color = vec4(0.0);\n\
         {{\n\
         vec2 axis = {axis};\n\
         vec2 size = vec2(textureSize({tex}, 0));\n\
         vec2 pt = axis / size;\n\
         float fcoord = fract(dot({pos} * size, axis) - 0.5);\n\
         vec2 base = {pos} - fcoord * pt;\n\
         float w, wsum = 0.0;\n\
         vec4 c, lo = vec4(1e9), hi = vec4(-1e9);\n"
    );
    glsl!(
        sh,
        "for (int i = {}; i <= {radius_i}; i++) {{\n\
         w = texture({lut}, vec2(abs(float(i) - fcoord) * {:.8}, 0.5)).r;\n\
         c = texture({tex}, base + float(i) * pt);\n\
         color += w * c;\n\
         wsum += w;\n\
         if (w > 0.0) {{ lo = min(lo, c); hi = max(hi, c); }}\n\
         }}\n\
         color /= vec4(wsum);\n",
        1 - radius_i,
        1.0 / radius,
    );
    if params.antiring > 0.0 {
        // Clamp overshoot back towards the contributing range
        glsl!(
            sh,
            "color = mix(color, clamp(color, lo, hi), {:.6});\n",
            params.antiring
        );
    }
    glsl!(sh, "}}\n");
    apply_scale(sh, src.scale);
    true
}

/// Debanding: averages rotated taps at growing radii and keeps the
/// average when it stays within the threshold, then adds masking grain.
/// Replaces direct sampling of the source.
pub fn deband(sh: &mut ShaderBuilder, src: &SampleSrc, params: &DebandParams, grain_scale: f32) {
    if !sh.require(ShaderSig::None, src.new_w, src.new_h) {
        return;
    }
    let (tex, pos) = bind_src(sh, src);
    let random = sh.var_f32("random", 0.56489, true);

    let hash = sh.fresh("deband_hash");
    glsl_h!(
        sh,
        "float {hash}(vec2 x) {{\n\
         vec3 x3 = fract(vec3(x.xyx) * 0.1031);\n\
         x3 += dot(x3, x3.yzx + 33.33);\n\
         return fract((x3.x + x3.y) * x3.z);\n\
         }}\n"
    );

    glsl!(
        sh,
        "vec4 color = texture({tex}, {pos});\n\
         {{\n\
         vec2 pt = vec2(1.0) / vec2(textureSize({tex}, 0));\n\
         vec4 avg, diff;\n\
         float h;\n"
    );
    for i in 1..=params.iterations {
        let radius = params.radius * i as f32;
        let threshold = params.threshold / (4096.0 * i as f32);
        glsl!(
            sh,
            "h = {hash}({pos} * vec2({i}.0) + vec2({random}));\n\
             {{\n\
             float dir = h * 6.2831853;\n\
             vec2 o = vec2(cos(dir), sin(dir)) * vec2({radius:.3});\n\
             avg  = texture({tex}, {pos} + pt * o);\n\
             avg += texture({tex}, {pos} - pt * o);\n\
             avg += texture({tex}, {pos} + pt * vec2(-o.y, o.x));\n\
             avg += texture({tex}, {pos} - pt * vec2(-o.y, o.x));\n\
             avg *= vec4(0.25);\n\
             diff = abs(color - avg);\n\
             color = mix(avg, color, greaterThan(diff, vec4({threshold:.8})));\n\
             }}\n"
        );
    }
    if params.grain > 0.0 {
        // Grain intensity is kept independent of the source's nominal
        // peak, even this early in the pipeline
        let grain = params.grain / 4096.0 / grain_scale.max(1e-6);
        glsl!(
            sh,
            "h = {hash}({pos} * vec2(7.0) + vec2({random}));\n\
             color.rgb += vec3({grain:.8}) * vec3(h - 0.5);\n"
        );
    }
    glsl!(sh, "}}\n");
    apply_scale(sh, src.scale);
}
