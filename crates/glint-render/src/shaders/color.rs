//! Color decoding, encoding, transfer functions and tone mapping.

use glint_core::{
    ColorLevels, ColorRepr, ColorSpace, ColorSystem, Primaries, Transfer, REF_WHITE,
};
use glint_dispatch::{glsl, glsl_h, ShaderBuilder};
use glint_gpu::{BufParams, DescAccess, Gpu, GpuCaps};
use tracing::warn;

use super::PeakDetectState;
use crate::params::{ColorMapParams, ConeParams, PeakDetectParams, SigmoidParams, ToneMapping};

// =============================================================================
// Small matrix helpers
// =============================================================================

type Mat3 = [[f32; 3]; 3]; // row-major

fn mat3_mul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn mat3_apply(m: &Mat3, v: [f32; 3]) -> [f32; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

fn mat3_invert(m: &Mat3) -> Mat3 {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    let inv_det = 1.0 / det;
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            let (a, b, c, d) = (
                m[(j + 1) % 3][(i + 1) % 3],
                m[(j + 1) % 3][(i + 2) % 3],
                m[(j + 2) % 3][(i + 1) % 3],
                m[(j + 2) % 3][(i + 2) % 3],
            );
            out[i][j] = (a * d - b * c) * inv_det;
        }
    }
    out
}

/// Column-major flattening, as GLSL mat3 constructors expect.
fn mat3_columns(m: &Mat3) -> [[f32; 3]; 3] {
    [
        [m[0][0], m[1][0], m[2][0]],
        [m[0][1], m[1][1], m[2][1]],
        [m[0][2], m[1][2], m[2][2]],
    ]
}

// =============================================================================
// Primaries
// =============================================================================

/// CIE xy chromaticities of a primary set.
struct RawPrimaries {
    red: (f32, f32),
    green: (f32, f32),
    blue: (f32, f32),
    white: (f32, f32),
}

const D65: (f32, f32) = (0.3127, 0.3290);

fn raw_primaries(prim: Primaries) -> RawPrimaries {
    match prim {
        Primaries::Bt601_525 => RawPrimaries {
            red: (0.630, 0.340),
            green: (0.310, 0.595),
            blue: (0.155, 0.070),
            white: D65,
        },
        Primaries::Bt601_625 => RawPrimaries {
            red: (0.640, 0.330),
            green: (0.290, 0.600),
            blue: (0.150, 0.060),
            white: D65,
        },
        Primaries::Bt2020 => RawPrimaries {
            red: (0.708, 0.292),
            green: (0.170, 0.797),
            blue: (0.131, 0.046),
            white: D65,
        },
        Primaries::DciP3 => RawPrimaries {
            red: (0.680, 0.320),
            green: (0.265, 0.690),
            blue: (0.150, 0.060),
            white: (0.314, 0.351),
        },
        Primaries::DisplayP3 => RawPrimaries {
            red: (0.680, 0.320),
            green: (0.265, 0.690),
            blue: (0.150, 0.060),
            white: D65,
        },
        Primaries::AdobeRgb => RawPrimaries {
            red: (0.640, 0.330),
            green: (0.210, 0.710),
            blue: (0.150, 0.060),
            white: D65,
        },
        // BT.709 / sRGB, also the unknown fallback
        _ => RawPrimaries {
            red: (0.640, 0.330),
            green: (0.300, 0.600),
            blue: (0.150, 0.060),
            white: D65,
        },
    }
}

/// RGB -> XYZ matrix for a primary set, normalized to the white point.
fn rgb_to_xyz(prim: Primaries) -> Mat3 {
    let raw = raw_primaries(prim);
    let xyz = |(x, y): (f32, f32)| [x / y, 1.0, (1.0 - x - y) / y];
    let [xr, xg, xb] = [xyz(raw.red), xyz(raw.green), xyz(raw.blue)];
    let m: Mat3 = [
        [xr[0], xg[0], xb[0]],
        [xr[1], xg[1], xb[1]],
        [xr[2], xg[2], xb[2]],
    ];
    let white = xyz(raw.white);
    let s = mat3_apply(&mat3_invert(&m), white);
    [
        [m[0][0] * s[0], m[0][1] * s[1], m[0][2] * s[2]],
        [m[1][0] * s[0], m[1][1] * s[1], m[1][2] * s[2]],
        [m[2][0] * s[0], m[2][1] * s[1], m[2][2] * s[2]],
    ]
}

/// RGB(src primaries) -> RGB(dst primaries) matrix.
pub(crate) fn primaries_matrix(src: Primaries, dst: Primaries) -> Mat3 {
    mat3_mul(&mat3_invert(&rgb_to_xyz(dst)), &rgb_to_xyz(src))
}

// =============================================================================
// Representation decode / encode
// =============================================================================

fn luma_coefficients(sys: ColorSystem) -> (f32, f32) {
    // (kr, kb)
    match sys {
        ColorSystem::Bt601 => (0.299, 0.114),
        ColorSystem::Smpte240m => (0.212, 0.087),
        ColorSystem::Bt2020Nc | ColorSystem::Bt2020C => (0.2627, 0.0593),
        _ => (0.2126, 0.0722), // BT.709, also the unknown fallback
    }
}

/// The affine transform `rgb = M * (v + c)` decoding a normalized texture
/// value into full-range RGB.
fn decode_transform(repr: &ColorRepr) -> (Mat3, [f32; 3]) {
    let levels = repr.effective_levels();

    let mut mat: Mat3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    let mut off = [0.0f32; 3];

    if repr.sys.is_ycbcr_like() {
        let (kr, kb) = luma_coefficients(repr.sys);
        let kg = 1.0 - kr - kb;
        if repr.sys == ColorSystem::YCgCo {
            mat = [[1.0, -1.0, 1.0], [1.0, 1.0, 0.0], [1.0, -1.0, -1.0]];
        } else {
            mat = [
                [1.0, 0.0, 2.0 * (1.0 - kr)],
                [
                    1.0,
                    -2.0 * (1.0 - kb) * kb / kg,
                    -2.0 * (1.0 - kr) * kr / kg,
                ],
                [1.0, 2.0 * (1.0 - kb), 0.0],
            ];
        }
        off = [0.0, -0.5, -0.5];
    }

    // Fold the level expansion into the matrix
    let (ly, lc, oy) = match levels {
        ColorLevels::Limited => (255.0 / 219.0, 255.0 / 224.0, -16.0 / 255.0),
        _ => (1.0, 1.0, 0.0),
    };
    let scales = if repr.sys.is_ycbcr_like() {
        [ly, lc, lc]
    } else {
        [ly, ly, ly]
    };
    for row in &mut mat {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell *= scales[j];
        }
    }
    if repr.sys.is_ycbcr_like() {
        off[0] += oy;
    } else {
        off = [oy; 3];
    }

    (mat, off)
}

/// CPU-side reference of the inverse decode, used to encode clear colors.
pub fn encode_rgb_reference(repr: &ColorRepr, rgb: [f32; 3]) -> [f32; 3] {
    let (mat, off) = decode_transform(repr);
    let inv = mat3_invert(&mat);
    let v = mat3_apply(&inv, rgb);
    [v[0] - off[0], v[1] - off[1], v[2] - off[2]]
}

/// Decodes the current color from its representation into full-range RGB.
/// `repr` is updated to the canonical decoded form.
pub fn decode_color(sh: &mut ShaderBuilder, repr: &mut ColorRepr) {
    if !sh.require(glint_dispatch::ShaderSig::Color, 0, 0) {
        return;
    }

    if repr.sys == ColorSystem::Xyz {
        // XYZ is specified gamma-encoded; decode to linear XYZ first,
        // then to BT.709-primaries RGB
        glsl!(sh, "color.rgb = pow(max(color.rgb, vec3(0.0)), vec3(2.6));\n");
        let xyz_to_rgb = mat3_invert(&rgb_to_xyz(Primaries::Bt709));
        let mat = sh.var_mat3("xyz_mat", mat3_columns(&xyz_to_rgb));
        glsl!(sh, "color.rgb = {mat} * color.rgb;\n");
        glsl!(
            sh,
            "color.rgb = pow(max(color.rgb, vec3(0.0)), vec3(1.0/2.6));\n"
        );
    } else {
        let (mat, off) = decode_transform(repr);
        let identity = off == [0.0; 3]
            && mat == [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        if !identity {
            let mat = sh.var_mat3("decode_mat", mat3_columns(&mat));
            let off = sh.var_vec3("decode_off", off, false);
            glsl!(sh, "color.rgb = {mat} * (color.rgb + {off});\n");
        }
    }

    repr.sys = ColorSystem::Rgb;
    repr.levels = ColorLevels::Full;
}

/// Encodes full-range RGB into the target's representation (the inverse
/// of [`decode_color`]).
pub fn encode_color(sh: &mut ShaderBuilder, repr: &ColorRepr) {
    if !sh.require(glint_dispatch::ShaderSig::Color, 0, 0) {
        return;
    }

    let (mat, off) = decode_transform(repr);
    let identity =
        off == [0.0; 3] && mat == [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    if identity {
        return;
    }
    let inv = mat3_invert(&mat);
    let mat = sh.var_mat3("encode_mat", mat3_columns(&inv));
    let off = sh.var_vec3("encode_off", [-off[0], -off[1], -off[2]], false);
    glsl!(sh, "color.rgb = {mat} * color.rgb + {off};\n");
}

// =============================================================================
// Transfer functions
// =============================================================================

/// Decodes the given transfer into linear light, normalized so that
/// reference white is 1.0.
pub fn linearize(sh: &mut ShaderBuilder, transfer: Transfer) {
    if !sh.require(glint_dispatch::ShaderSig::Color, 0, 0) {
        return;
    }
    glsl!(sh, "color.rgb = max(color.rgb, vec3(0.0));\n");
    match transfer {
        Transfer::Linear => {}
        Transfer::Srgb => glsl!(
            sh,
            "color.rgb = mix(color.rgb / vec3(12.92),\n\
             \x20   pow((color.rgb + vec3(0.055)) / vec3(1.055), vec3(2.4)),\n\
             \x20   greaterThan(color.rgb, vec3(0.04045)));\n"
        ),
        Transfer::Bt1886 => glsl!(sh, "color.rgb = pow(color.rgb, vec3(2.4));\n"),
        Transfer::Gamma18 => glsl!(sh, "color.rgb = pow(color.rgb, vec3(1.8));\n"),
        Transfer::Gamma22 => glsl!(sh, "color.rgb = pow(color.rgb, vec3(2.2));\n"),
        Transfer::Gamma28 => glsl!(sh, "color.rgb = pow(color.rgb, vec3(2.8));\n"),
        Transfer::ProPhoto => glsl!(
            sh,
            "color.rgb = mix(color.rgb / vec3(16.0),\n\
             \x20   pow(color.rgb, vec3(1.8)),\n\
             \x20   greaterThan(color.rgb, vec3(0.03125)));\n"
        ),
        Transfer::Pq => glsl!(
            sh,
            "color.rgb = pow(color.rgb, vec3(1.0/{m2:.8}));\n\
             color.rgb = max(color.rgb - vec3({c1:.8}), vec3(0.0))\n\
             \x20         / (vec3({c2:.8}) - vec3({c3:.8}) * color.rgb);\n\
             color.rgb = pow(color.rgb, vec3(1.0/{m1:.8}));\n\
             color.rgb *= vec3({scale:.4});\n",
            m1 = 2610.0 / 16384.0,
            m2 = 2523.0 / 4096.0 * 128.0,
            c1 = 3424.0 / 4096.0,
            c2 = 2413.0 / 4096.0 * 32.0,
            c3 = 2392.0 / 4096.0 * 32.0,
            scale = 10000.0 / REF_WHITE,
        ),
        Transfer::Hlg => glsl!(
            sh,
            "color.rgb = mix(vec3(4.0) * color.rgb * color.rgb,\n\
             \x20   exp((color.rgb - vec3({c:.8})) / vec3({a:.8})) + vec3({b:.8}),\n\
             \x20   greaterThan(color.rgb, vec3(0.5)));\n",
            a = 0.17883277,
            b = 0.28466892,
            c = 0.55991073,
        ),
        Transfer::VLog => glsl!(
            sh,
            "color.rgb = mix((color.rgb - vec3(0.125)) / vec3(5.6),\n\
             \x20   pow(vec3(10.0), (color.rgb - vec3({d:.6})) / vec3({c:.6})) - vec3({b:.6}),\n\
             \x20   greaterThanEqual(color.rgb, vec3(0.181)));\n",
            b = 0.00873,
            c = 0.241514,
            d = 0.598206,
        ),
        Transfer::SLog1 => glsl!(
            sh,
            "color.rgb = pow(vec3(10.0), (color.rgb - vec3({b:.6})) / vec3({a:.6})) - vec3({c:.6});\n",
            a = 0.432699,
            b = 0.616596 + 0.03,
            c = 0.037584,
        ),
        Transfer::SLog2 => glsl!(
            sh,
            "color.rgb = mix((color.rgb - vec3({b:.6})) / vec3({a:.6}),\n\
             \x20   (pow(vec3(10.0), (color.rgb - vec3({b:.6})) / vec3({c:.6})) - vec3({d:.6})) / vec3(0.9),\n\
             \x20   greaterThanEqual(color.rgb, vec3({b:.6})));\n",
            a = 3.53881278538813,
            b = 0.030001222851889303,
            c = 0.432699,
            d = 0.037584,
        ),
        Transfer::Unknown => {}
    }
}

/// Encodes linear light into the given transfer (the inverse of
/// [`linearize`]).
pub fn delinearize(sh: &mut ShaderBuilder, transfer: Transfer) {
    if !sh.require(glint_dispatch::ShaderSig::Color, 0, 0) {
        return;
    }
    glsl!(sh, "color.rgb = max(color.rgb, vec3(0.0));\n");
    match transfer {
        Transfer::Linear => {}
        Transfer::Srgb => glsl!(
            sh,
            "color.rgb = mix(color.rgb * vec3(12.92),\n\
             \x20   vec3(1.055) * pow(color.rgb, vec3(1.0/2.4)) - vec3(0.055),\n\
             \x20   greaterThan(color.rgb, vec3(0.0031308)));\n"
        ),
        Transfer::Bt1886 => glsl!(sh, "color.rgb = pow(color.rgb, vec3(1.0/2.4));\n"),
        Transfer::Gamma18 => glsl!(sh, "color.rgb = pow(color.rgb, vec3(1.0/1.8));\n"),
        Transfer::Gamma22 => glsl!(sh, "color.rgb = pow(color.rgb, vec3(1.0/2.2));\n"),
        Transfer::Gamma28 => glsl!(sh, "color.rgb = pow(color.rgb, vec3(1.0/2.8));\n"),
        Transfer::ProPhoto => glsl!(
            sh,
            "color.rgb = mix(color.rgb * vec3(16.0),\n\
             \x20   pow(color.rgb, vec3(1.0/1.8)),\n\
             \x20   greaterThan(color.rgb, vec3(0.001953125)));\n"
        ),
        Transfer::Pq => glsl!(
            sh,
            "color.rgb *= vec3(1.0/{scale:.4});\n\
             color.rgb = pow(color.rgb, vec3({m1:.8}));\n\
             color.rgb = (vec3({c1:.8}) + vec3({c2:.8}) * color.rgb)\n\
             \x20         / (vec3(1.0) + vec3({c3:.8}) * color.rgb);\n\
             color.rgb = pow(color.rgb, vec3({m2:.8}));\n",
            m1 = 2610.0 / 16384.0,
            m2 = 2523.0 / 4096.0 * 128.0,
            c1 = 3424.0 / 4096.0,
            c2 = 2413.0 / 4096.0 * 32.0,
            c3 = 2392.0 / 4096.0 * 32.0,
            scale = 10000.0 / REF_WHITE,
        ),
        Transfer::Hlg => glsl!(
            sh,
            "color.rgb = mix(vec3(0.5) * sqrt(color.rgb),\n\
             \x20   vec3({a:.8}) * log(color.rgb - vec3({b:.8})) + vec3({c:.8}),\n\
             \x20   greaterThan(color.rgb, vec3(1.0)));\n",
            a = 0.17883277,
            b = 0.28466892,
            c = 0.55991073,
        ),
        Transfer::VLog => glsl!(
            sh,
            "color.rgb = mix(vec3(5.6) * color.rgb + vec3(0.125),\n\
             \x20   vec3({c:.6}) * log(color.rgb + vec3({b:.6})) / log(10.0) + vec3({d:.6}),\n\
             \x20   greaterThanEqual(color.rgb, vec3(0.01)));\n",
            b = 0.00873,
            c = 0.241514,
            d = 0.598206,
        ),
        Transfer::SLog1 => glsl!(
            sh,
            "color.rgb = vec3({a:.6}) * log(color.rgb + vec3({c:.6})) / log(10.0) + vec3({b:.6});\n",
            a = 0.432699,
            b = 0.616596 + 0.03,
            c = 0.037584,
        ),
        Transfer::SLog2 => glsl!(
            sh,
            "color.rgb = mix(vec3({a:.6}) * color.rgb + vec3({b:.6}),\n\
             \x20   vec3({c:.6}) * log(vec3(0.9) * color.rgb + vec3({d:.6})) / log(10.0) + vec3({b:.6}),\n\
             \x20   greaterThanEqual(color.rgb, vec3(0.0)));\n",
            a = 3.53881278538813,
            b = 0.030001222851889303,
            c = 0.432699,
            d = 0.037584,
        ),
        Transfer::Unknown => {}
    }
}

// =============================================================================
// Sigmoid
// =============================================================================

fn sigmoid_coeffs(params: &SigmoidParams) -> (f32, f32, f32, f32) {
    let (center, slope) = (params.center, params.slope);
    let offset = 1.0 / (1.0 + (slope * center).exp());
    let scale = 1.0 / (1.0 + (slope * (center - 1.0)).exp()) - offset;
    (center, slope, offset, scale)
}

/// Applies the inverse sigmoid curve (before upscaling).
pub fn sigmoidize(sh: &mut ShaderBuilder, params: &SigmoidParams) {
    if !sh.require(glint_dispatch::ShaderSig::Color, 0, 0) {
        return;
    }
    let (center, slope, offset, scale) = sigmoid_coeffs(params);
    glsl!(
        sh,
        "color = clamp(color, 0.0, 1.0);\n\
         color = vec4({center:.6}) - log(vec4(1.0) / (color * vec4({scale:.6}) + vec4({offset:.6})) - vec4(1.0)) / vec4({slope:.6});\n"
    );
}

/// Undoes [`sigmoidize`] (after upscaling).
pub fn unsigmoidize(sh: &mut ShaderBuilder, params: &SigmoidParams) {
    if !sh.require(glint_dispatch::ShaderSig::Color, 0, 0) {
        return;
    }
    let (center, slope, offset, scale) = sigmoid_coeffs(params);
    glsl!(
        sh,
        "color = clamp(color, 0.0, 1.0);\n\
         color = (vec4(1.0) / (vec4(1.0) + exp(vec4({slope:.6}) * (vec4({center:.6}) - color))) - vec4({offset:.6})) / vec4({scale:.6});\n"
    );
}

// =============================================================================
// Peak detection
// =============================================================================

/// Size of the peak detection state buffer: running average (2 floats,
/// stored as u32 bits) plus the current frame's atomic max and count.
const PEAK_BUF_SIZE: usize = 4 * 4;

/// Attaches the peak detection reduction to the current shader. The
/// running estimate lands in a persistent buffer consumed by the next
/// tone-mapping stage. Fails (returning false) without compute support.
pub fn detect_peak(
    sh: &mut ShaderBuilder,
    state: &mut Option<PeakDetectState>,
    params: &PeakDetectParams,
    gpu: &dyn Gpu,
) -> bool {
    if !gpu.caps().contains(GpuCaps::COMPUTE) {
        return false;
    }
    if !sh.try_compute(8, 8, true, 4 * 2, gpu.caps(), gpu.limits()) {
        return false;
    }

    if state.is_none() {
        let buf = match gpu.buf_create(&BufParams::storage(PEAK_BUF_SIZE)) {
            Ok(buf) => buf,
            Err(err) => {
                warn!("failed creating peak detection buffer: {err}");
                return false;
            }
        };
        *state = Some(PeakDetectState { buf });
    }
    let buf = state.as_ref().unwrap().buf.clone();

    let member = sh.fresh("peak_data");
    let var = glint_gpu::Var::uint(member.clone()).array(4);
    let layout = glint_gpu::std430_layout(0, &var);
    sh.desc_buffer(
        glint_gpu::Desc::buf_storage("PeakBuf", DescAccess::ReadWrite),
        buf,
        vec![(var, layout)],
    );

    // Shared-memory partial reduction, then one atomic per workgroup
    glsl_h!(
        sh,
        "shared uint wg_max;\n\
         shared uint wg_sum;\n"
    );
    let smoothing = 1.0 - (-1.0 / params.smoothing_period.max(1.0)).exp();
    glsl!(
        sh,
        "{{\n\
         float sig = max(max(color.r, color.g), color.b);\n\
         if (gl_LocalInvocationIndex == 0u) {{ wg_max = 0u; wg_sum = 0u; }}\n\
         barrier();\n\
         atomicMax(wg_max, floatBitsToUint(sig));\n\
         atomicAdd(wg_sum, uint(sig * 1024.0));\n\
         barrier();\n\
         if (gl_LocalInvocationIndex == 0u) {{\n\
         atomicMax({member}[0], wg_max);\n\
         atomicAdd({member}[1], wg_sum >> 6u);\n\
         atomicAdd({member}[2], 1u);\n\
         {member}[3] = uint({smoothing:.8} * 1e6);\n\
         }}\n\
         }}\n"
    );
    true
}

/// Drops the peak detection state (scene change or feature disabled).
pub fn reset_peak(state: &mut Option<PeakDetectState>) {
    *state = None;
}

// =============================================================================
// Color mapping
// =============================================================================

fn tone_map_glsl(sh: &mut ShaderBuilder, params: &ColorMapParams, src_peak: f32, dst_peak: f32) {
    let ratio = src_peak / dst_peak;
    glsl!(sh, "{{\n");
    glsl!(sh, "float sig = max(max(color.r, color.g), color.b);\n");
    glsl!(sh, "float sig_orig = max(sig, 1e-6);\n");
    glsl!(sh, "sig *= {:.8};\n", 1.0 / dst_peak);

    match params.tone_mapping {
        ToneMapping::Clip => glsl!(sh, "sig = min(sig, 1.0);\n"),
        ToneMapping::Linear => glsl!(sh, "sig *= {:.8};\n", 1.0 / ratio),
        ToneMapping::Gamma => {
            let gamma = if params.tone_mapping_param > 0.0 {
                params.tone_mapping_param
            } else {
                1.8
            };
            glsl!(
                sh,
                "sig = sig > 0.5 ? pow(sig / {ratio:.8}, {:.8}) : sig;\n",
                1.0 / gamma
            );
        }
        ToneMapping::Reinhard => {
            let contrast = if params.tone_mapping_param > 0.0 {
                params.tone_mapping_param
            } else {
                0.5
            };
            let offset = (1.0 - contrast) / contrast;
            glsl!(
                sh,
                "sig = sig / (sig + {offset:.8}) * {:.8};\n",
                (ratio + offset) / ratio
            );
        }
        ToneMapping::Mobius => {
            let j = if params.tone_mapping_param > 0.0 {
                params.tone_mapping_param
            } else {
                0.3
            };
            // Solves M(j) = j, M'(j) = 1, M(ratio) = 1
            let a = -j * j * (ratio - 1.0) / (j * j - 2.0 * j + ratio);
            let b = (j * j - 2.0 * j * ratio + ratio) / (ratio - 1.0).max(1e-6);
            glsl!(
                sh,
                "if (sig > {j:.8})\n\
                 \x20   sig = {peak:.8} * ({a:.8} + sig) / ({b:.8} + sig);\n",
                peak = (b * b + 2.0 * b * j + j * j) / (b - a),
            );
        }
        ToneMapping::Hable => {
            let hable = sh.fresh("hable");
            glsl_h!(
                sh,
                "float {hable}(float x) {{\n\
                 const float A = 0.15, B = 0.50, C = 0.10, D = 0.20, E = 0.02, F = 0.30;\n\
                 return ((x * (A*x + C*B) + D*E) / (x * (A*x + B) + D*F)) - E/F;\n\
                 }}\n"
            );
            glsl!(sh, "sig = {hable}(sig) / {hable}({ratio:.8});\n");
        }
        ToneMapping::Bt2390 => {
            glsl!(
                sh,
                "{{\n\
                 float maxi = {:.8};\n\
                 float ks = 1.5 * maxi - 0.5;\n\
                 float t = clamp((sig - ks) / (1.0 - ks), 0.0, 1.0);\n\
                 float t2 = t * t, t3 = t2 * t;\n\
                 float p = (2.0*t3 - 3.0*t2 + 1.0) * ks + (t3 - 2.0*t2 + t) * (1.0 - ks)\n\
                 \x20       + (-2.0*t3 + 3.0*t2) * maxi;\n\
                 sig = sig >= ks ? p : sig;\n\
                 }}\n",
                1.0 / ratio
            );
        }
    }

    glsl!(sh, "sig = min(sig, 1.0);\n");
    // Desaturate overbright highlights towards white
    if params.desaturation_strength > 0.0 {
        glsl!(
            sh,
            "float coeff = max(sig_orig / {dst_peak:.8} - {base:.8}, 1e-6)\n\
             \x20            / max(sig_orig / {dst_peak:.8}, 1e-6);\n\
             coeff = {strength:.8} * pow(coeff, {exponent:.8});\n\
             color.rgb = mix(color.rgb, vec3(sig_orig), coeff);\n",
            base = params.desaturation_base,
            strength = params.desaturation_strength,
            exponent = params.desaturation_exponent,
        );
    }
    glsl!(
        sh,
        "color.rgb *= vec3(sig * {dst_peak:.8} / sig_orig);\n\
         }}\n"
    );

    if params.gamut_warning {
        glsl!(
            sh,
            "if (any(greaterThan(color.rgb, vec3({:.6}))))\n\
             \x20   color.rgb = vec3(1.0) - color.rgb;\n",
            1.01 * dst_peak
        );
    }
}

/// Maps between two color spaces: linearization, primaries adaptation,
/// tone mapping and re-encoding. `prelinearized` indicates the input is
/// already linear light.
pub fn color_map(
    sh: &mut ShaderBuilder,
    params: Option<&ColorMapParams>,
    src: ColorSpace,
    dst: ColorSpace,
    peak_state: Option<&PeakDetectState>,
    prelinearized: bool,
) {
    let defaults = ColorMapParams::default();
    let params = params.unwrap_or(&defaults);

    let src = src.inferred();
    let dst = dst.inferred();

    let src_peak = src.sig_peak * src.effective_scale();
    let dst_peak = dst.sig_peak * dst.effective_scale();
    let need_tone_map = src_peak > dst_peak + 1e-6;
    let need_primaries = src.primaries != dst.primaries;
    let need_linearize = src.transfer != dst.transfer || need_tone_map || need_primaries;

    if !need_linearize && !prelinearized {
        return;
    }

    if !sh.require(glint_dispatch::ShaderSig::Color, 0, 0) {
        return;
    }

    if !prelinearized {
        linearize(sh, src.transfer);
    }
    if src.effective_scale() != 1.0 {
        glsl!(sh, "color.rgb *= vec3({:.8});\n", src.effective_scale());
    }

    if need_primaries {
        let mat = primaries_matrix(src.primaries, dst.primaries);
        let mat = sh.var_mat3("prim_mat", mat3_columns(&mat));
        glsl!(sh, "color.rgb = {mat} * color.rgb;\n");
    }

    if need_tone_map {
        if let Some(state) = peak_state {
            // Renormalize against the detected running peak, so the static
            // curve below effectively uses it instead of the tagged peak
            let member = sh.fresh("peak_data");
            let var = glint_gpu::Var::uint(member.clone()).array(4);
            let layout = glint_gpu::std430_layout(0, &var);
            sh.desc_buffer(
                glint_gpu::Desc::buf_storage("PeakBuf", DescAccess::ReadOnly),
                state.buf.clone(),
                vec![(var, layout)],
            );
            glsl!(
                sh,
                "{{\n\
                 float det_peak = uintBitsToFloat({member}[0]);\n\
                 det_peak = clamp(det_peak, 1.0, {src_peak:.8});\n\
                 color.rgb *= vec3({src_peak:.8} / det_peak);\n\
                 }}\n"
            );
        }
        tone_map_glsl(sh, params, src_peak, dst_peak);
    }

    if dst.effective_scale() != 1.0 {
        glsl!(sh, "color.rgb *= vec3({:.8});\n", 1.0 / dst.effective_scale());
    }
    delinearize(sh, dst.transfer);
}

/// Simulates cone deficiencies (color blindness) in LMS space.
pub fn cone_distort(sh: &mut ShaderBuilder, params: &ConeParams) {
    if !sh.require(glint_dispatch::ShaderSig::Color, 0, 0) {
        return;
    }

    // Hunt-Pointer-Estevez RGB(709)->LMS, normalized to D65
    let rgb_to_lms: Mat3 = [
        [0.31399, 0.63951, 0.04650],
        [0.15537, 0.75789, 0.08670],
        [0.01775, 0.10945, 0.87277],
    ];
    let lms_to_rgb = mat3_invert(&rgb_to_lms);

    let fwd = sh.var_mat3("lms_mat", mat3_columns(&rgb_to_lms));
    let inv = sh.var_mat3("rgb_mat", mat3_columns(&lms_to_rgb));
    let strength = params.strength;
    let gain = [
        if params.l { strength } else { 1.0 },
        if params.m { strength } else { 1.0 },
        if params.s { strength } else { 1.0 },
    ];
    let gain = sh.var_vec3("cone_gain", gain, false);

    glsl!(
        sh,
        "{{\n\
         vec3 lms = {fwd} * color.rgb;\n\
         float avg = dot(lms, vec3(1.0/3.0));\n\
         lms = mix(vec3(avg), lms, {gain});\n\
         color.rgb = {inv} * lms;\n\
         }}\n"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primaries_matrix_identity() {
        let m = primaries_matrix(Primaries::Bt709, Primaries::Bt709);
        for (i, row) in m.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!((v - expect).abs() < 1e-4, "m[{i}][{j}] = {v}");
            }
        }
    }

    #[test]
    fn test_primaries_matrix_preserves_white() {
        // Equal-energy white maps to equal-energy white for D65 gamuts
        let m = primaries_matrix(Primaries::Bt2020, Primaries::Bt709);
        let w = mat3_apply(&m, [1.0, 1.0, 1.0]);
        for v in w {
            assert!((v - 1.0).abs() < 1e-3, "white {w:?}");
        }
    }

    #[test]
    fn test_decode_roundtrip() {
        use glint_core::BitEncoding;
        let repr = ColorRepr {
            sys: ColorSystem::Bt709,
            levels: ColorLevels::Limited,
            alpha: Default::default(),
            bits: BitEncoding::default(),
        };
        let (mat, off) = decode_transform(&repr);
        // Limited-range black (16/255 luma, centered chroma) decodes to 0
        let decoded = mat3_apply(
            &mat,
            [
                16.0 / 255.0 + off[0],
                0.5 + off[1],
                0.5 + off[2],
            ],
        );
        for v in decoded {
            assert!(v.abs() < 1e-3, "black {decoded:?}");
        }

        // encode_rgb_reference inverts the transform
        let encoded = encode_rgb_reference(&repr, [0.0, 0.0, 0.0]);
        assert!((encoded[0] - 16.0 / 255.0).abs() < 1e-3);
        assert!((encoded[1] - 0.5).abs() < 1e-3);
        assert!((encoded[2] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_sigmoid_coeffs_invert() {
        let params = SigmoidParams::default();
        let (center, slope, offset, scale) = sigmoid_coeffs(&params);
        // CPU reference of the two curves composes to identity
        let x = 0.42f32;
        let sig = center - ((1.0 / (x * scale + offset) - 1.0).ln()) / slope;
        let back = (1.0 / (1.0 + (slope * (center - sig)).exp()) - offset) / scale;
        assert!((back - x).abs() < 1e-4);
    }
}
