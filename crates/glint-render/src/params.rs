//! The render parameter bundle and its content hash.

use std::sync::Arc;

use glint_core::hash::{hash_merge, ContentHasher};
use glint_gpu::BlendParams;

use crate::filter::{filter_sample, FilterConfig, MITCHELL, OVERSAMPLE, SPLINE36};
use crate::frame::{FrameLut, LutKind};
use crate::hook::Hook;

/// Sigmoidal contrast curve applied in linear light before upscaling, to
/// dampen ringing artifacts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SigmoidParams {
    /// Curve center, in [0, 1].
    pub center: f32,
    /// Curve steepness.
    pub slope: f32,
}

impl Default for SigmoidParams {
    fn default() -> Self {
        Self {
            center: 0.75,
            slope: 6.5,
        }
    }
}

/// HDR peak detection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakDetectParams {
    /// Smoothing coefficient for the running peak estimate, in frames.
    pub smoothing_period: f32,
    /// Lower bound for a relative luminance jump to count as a scene cut.
    pub scene_threshold_low: f32,
    /// Upper bound; above this the estimate resets outright.
    pub scene_threshold_high: f32,
    /// Extra headroom over the detected peak.
    pub overshoot_margin: f32,
}

impl Default for PeakDetectParams {
    fn default() -> Self {
        Self {
            smoothing_period: 100.0,
            scene_threshold_low: 5.5,
            scene_threshold_high: 10.0,
            overshoot_margin: 0.05,
        }
    }
}

/// Tone mapping curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToneMapping {
    Clip,
    Mobius,
    Reinhard,
    #[default]
    Hable,
    Gamma,
    Linear,
    Bt2390,
}

/// Gamut mapping / tone mapping configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMapParams {
    pub tone_mapping: ToneMapping,
    /// Curve-specific parameter (knee point, exponent, ...). 0 = default.
    pub tone_mapping_param: f32,
    /// How strongly to desaturate overbright colors towards white.
    pub desaturation_strength: f32,
    pub desaturation_exponent: f32,
    pub desaturation_base: f32,
    /// Maximum boost for scenes darker than the target.
    pub max_boost: f32,
    /// Highlight out-of-gamut pixels instead of mapping them.
    pub gamut_warning: bool,
}

impl Default for ColorMapParams {
    fn default() -> Self {
        Self {
            tone_mapping: ToneMapping::Hable,
            tone_mapping_param: 0.0,
            desaturation_strength: 0.75,
            desaturation_exponent: 1.5,
            desaturation_base: 0.18,
            max_boost: 1.0,
            gamut_warning: false,
        }
    }
}

/// Dither method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DitherMethod {
    #[default]
    BlueNoise,
    Ordered,
    White,
}

/// Dithering configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DitherParams {
    pub method: DitherMethod,
    /// LUT edge length, as a power of two.
    pub lut_size: u32,
    /// Cycle the pattern temporally.
    pub temporal: bool,
}

impl Default for DitherParams {
    fn default() -> Self {
        Self {
            method: DitherMethod::BlueNoise,
            lut_size: 6,
            temporal: false,
        }
    }
}

/// Debanding configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebandParams {
    pub iterations: u32,
    /// Cut-off threshold, in 1/4096 units.
    pub threshold: f32,
    pub radius: f32,
    /// Post-deband grain strength, in 1/4096 units.
    pub grain: f32,
}

impl Default for DebandParams {
    fn default() -> Self {
        Self {
            iterations: 1,
            threshold: 4.0,
            radius: 16.0,
            grain: 6.0,
        }
    }
}

/// Which cone cells to simulate deficiency of.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConeParams {
    pub l: bool,
    pub m: bool,
    pub s: bool,
    /// 0 = complete deficiency, 1 = no change, >1 over-stimulation.
    pub strength: f32,
}

/// ICC profile application parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IccParams {
    /// 3D LUT grid size per axis.
    pub size: u32,
}

impl Default for IccParams {
    fn default() -> Self {
        Self { size: 33 }
    }
}

/// The full render parameter bundle.
///
/// The `Default` value matches a balanced quality/speed tradeoff;
/// [`RenderParams::high_quality`] enables the expensive extras.
#[derive(Clone)]
pub struct RenderParams {
    pub upscaler: Option<&'static FilterConfig>,
    pub downscaler: Option<&'static FilterConfig>,
    pub frame_mixer: Option<&'static FilterConfig>,

    /// Number of entries in sampled filter LUTs.
    pub lut_entries: usize,
    /// Cutoff for polar sampling contributions.
    pub polar_cutoff: f32,
    /// Antiringing strength for complex scalers.
    pub antiringing_strength: f32,

    pub deband: Option<DebandParams>,
    pub sigmoid: Option<SigmoidParams>,
    pub peak_detect: Option<PeakDetectParams>,
    pub color_map: Option<ColorMapParams>,
    pub dither: Option<DitherParams>,
    pub cone: Option<ConeParams>,
    pub icc: Option<IccParams>,
    pub blend: Option<BlendParams>,

    pub hooks: Vec<Arc<dyn Hook>>,

    /// A LUT applied between input decoding and output encoding.
    pub lut: Option<Arc<FrameLut>>,
    pub lut_kind: Option<LutKind>,

    /// Skip anti-aliasing when downscaling.
    pub skip_anti_aliasing: bool,
    /// Never replace complex filters by GPU built-in sampling.
    pub disable_builtin_scalers: bool,
    /// Sample overlays with plain bilinear instead of the scaler filters.
    pub disable_overlay_sampling: bool,
    /// Never process in linear light.
    pub disable_linear_scaling: bool,
    /// Forbid intermediate textures entirely (single-pass rendering).
    pub disable_fbos: bool,
    /// Force an ICC 3D LUT even when profiles match.
    pub force_icc_lut: bool,
    /// Dither even for targets deeper than 16 bits.
    pub force_dither: bool,
    /// Allow the peak detection result to lag one frame behind when
    /// intermediate textures are unavailable.
    pub allow_delayed_peak_detect: bool,
    /// Reuse mixing-cache entries even when the parameters changed.
    /// Admits visibly stale mixed output; the tradeoff is the caller's.
    pub preserve_mixing_cache: bool,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            upscaler: Some(&SPLINE36),
            downscaler: Some(&MITCHELL),
            frame_mixer: Some(&OVERSAMPLE),
            lut_entries: 64,
            polar_cutoff: 0.001,
            antiringing_strength: 0.0,
            deband: None,
            sigmoid: Some(SigmoidParams::default()),
            peak_detect: Some(PeakDetectParams::default()),
            color_map: Some(ColorMapParams::default()),
            dither: Some(DitherParams::default()),
            cone: None,
            icc: None,
            blend: None,
            hooks: Vec::new(),
            lut: None,
            lut_kind: None,
            skip_anti_aliasing: false,
            disable_builtin_scalers: false,
            disable_overlay_sampling: false,
            disable_linear_scaling: false,
            disable_fbos: false,
            force_icc_lut: false,
            force_dither: false,
            allow_delayed_peak_detect: false,
            preserve_mixing_cache: false,
        }
    }
}

impl RenderParams {
    /// Default parameters with the expensive extras (debanding, EWA
    /// upscaling) enabled.
    pub fn high_quality() -> Self {
        Self {
            upscaler: Some(&crate::filter::EWA_LANCZOS),
            deband: Some(DebandParams::default()),
            ..Default::default()
        }
    }
}

fn hash_filter(h: &mut u64, config: Option<&'static FilterConfig>) {
    let Some(config) = config else {
        hash_merge(h, 0);
        return;
    };
    // Kernel and window hash by value: radius plus sampled weights
    let mut ch = ContentHasher::new();
    ch.write_bool(config.polar);
    ch.write_bool(config.kernel.is_some());
    ch.write_f32(config.radius());
    for i in 0..8 {
        let x = i as f32 / 8.0 * config.radius();
        ch.write_f32(filter_sample(config, x));
    }
    hash_merge(h, ch.finish());
}

/// Writes a parameter sub-struct into a hasher, field by field.
trait HashFields {
    fn hash_fields(&self, ch: &mut ContentHasher);
}

impl HashFields for SigmoidParams {
    fn hash_fields(&self, ch: &mut ContentHasher) {
        ch.write_f32(self.center);
        ch.write_f32(self.slope);
    }
}

impl HashFields for PeakDetectParams {
    fn hash_fields(&self, ch: &mut ContentHasher) {
        ch.write_f32(self.smoothing_period);
        ch.write_f32(self.scene_threshold_low);
        ch.write_f32(self.scene_threshold_high);
        ch.write_f32(self.overshoot_margin);
    }
}

impl HashFields for ColorMapParams {
    fn hash_fields(&self, ch: &mut ContentHasher) {
        ch.write_u8(self.tone_mapping as u8);
        ch.write_f32(self.tone_mapping_param);
        ch.write_f32(self.desaturation_strength);
        ch.write_f32(self.desaturation_exponent);
        ch.write_f32(self.desaturation_base);
        ch.write_f32(self.max_boost);
        ch.write_bool(self.gamut_warning);
    }
}

impl HashFields for DitherParams {
    fn hash_fields(&self, ch: &mut ContentHasher) {
        ch.write_u8(self.method as u8);
        ch.write_u32(self.lut_size);
        ch.write_bool(self.temporal);
    }
}

impl HashFields for DebandParams {
    fn hash_fields(&self, ch: &mut ContentHasher) {
        ch.write_u32(self.iterations);
        ch.write_f32(self.threshold);
        ch.write_f32(self.radius);
        ch.write_f32(self.grain);
    }
}

impl HashFields for ConeParams {
    fn hash_fields(&self, ch: &mut ContentHasher) {
        ch.write_bool(self.l);
        ch.write_bool(self.m);
        ch.write_bool(self.s);
        ch.write_f32(self.strength);
    }
}

impl HashFields for IccParams {
    fn hash_fields(&self, ch: &mut ContentHasher) {
        ch.write_u32(self.size);
    }
}

impl HashFields for BlendParams {
    fn hash_fields(&self, ch: &mut ContentHasher) {
        ch.write_u8(self.src_rgb as u8);
        ch.write_u8(self.dst_rgb as u8);
        ch.write_u8(self.src_alpha as u8);
        ch.write_u8(self.dst_alpha as u8);
    }
}

fn hash_opt<T: HashFields>(h: &mut u64, opt: &Option<T>) {
    match opt {
        Some(v) => {
            let mut ch = ContentHasher::new();
            v.hash_fields(&mut ch);
            hash_merge(h, ch.finish());
        }
        None => hash_merge(h, 0),
    }
}

/// Hashes the parameters that determine rendered output, for frame-cache
/// compatibility checks. Pointer-typed members are dereferenced and hashed
/// by value; hooks hash by identity; LUTs hash by declared signature only.
pub fn params_hash(params: &RenderParams) -> u64 {
    let mut h = 0u64;

    hash_filter(&mut h, params.upscaler);
    hash_filter(&mut h, params.downscaler);
    hash_filter(&mut h, params.frame_mixer);

    let mut ch = ContentHasher::new();
    ch.write_u64(params.lut_entries as u64);
    ch.write_f32(params.polar_cutoff);
    ch.write_f32(params.antiringing_strength);
    ch.write_bool(params.skip_anti_aliasing);
    ch.write_bool(params.disable_builtin_scalers);
    ch.write_bool(params.disable_overlay_sampling);
    ch.write_bool(params.disable_linear_scaling);
    ch.write_bool(params.disable_fbos);
    ch.write_bool(params.force_icc_lut);
    ch.write_bool(params.force_dither);
    ch.write_bool(params.allow_delayed_peak_detect);
    hash_merge(&mut h, ch.finish());

    hash_opt(&mut h, &params.deband);
    hash_opt(&mut h, &params.sigmoid);
    hash_opt(&mut h, &params.peak_detect);
    hash_opt(&mut h, &params.color_map);
    hash_opt(&mut h, &params.dither);
    hash_opt(&mut h, &params.cone);
    hash_opt(&mut h, &params.icc);
    hash_opt(&mut h, &params.blend);

    for hook in &params.hooks {
        hash_merge(&mut h, Arc::as_ptr(hook) as *const () as usize as u64);
    }

    match &params.lut {
        Some(lut) => hash_merge(&mut h, lut.signature),
        None => hash_merge(&mut h, 0),
    }

    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_stable_for_same_params() {
        let a = RenderParams::default();
        let b = RenderParams::default();
        assert_eq!(params_hash(&a), params_hash(&b));
    }

    #[test]
    fn test_hash_differs_on_param_change() {
        let a = RenderParams::default();
        let mut b = RenderParams::default();
        b.dither = None;
        assert_ne!(params_hash(&a), params_hash(&b));

        let mut c = RenderParams::default();
        c.downscaler = Some(&crate::filter::BICUBIC);
        assert_ne!(params_hash(&a), params_hash(&c));
    }

    #[test]
    fn test_hash_sees_sub_struct_values() {
        let a = RenderParams::default();
        let mut b = RenderParams::default();
        b.color_map = Some(ColorMapParams {
            tone_mapping: ToneMapping::Reinhard,
            ..Default::default()
        });
        assert_ne!(params_hash(&a), params_hash(&b));
    }
}
