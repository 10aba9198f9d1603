//! The render pipeline planner.
//!
//! [`Renderer::render_image`] plans and executes the pass sequence that
//! turns a multi-plane source frame into a multi-plane target frame:
//!
//! 1. validate & infer frame metadata
//! 2. normalize source/destination rects
//! 3. read planes (merge compatible ones, film grain, input hooks)
//! 4. combine planes into the working color vector
//! 5. input color conversion (LUTs, decode to RGB)
//! 6. HDR peak detection
//! 7. main scaling (optionally sigmoidized linear light, overlays)
//! 8. output color conversion (ICC, encode, dither)
//! 9. write to the target planes (subsampled, swizzled, flipped)
//!
//! Every optional capability degrades rather than fails: on first error
//! the corresponding latch is set, a warning is logged, and subsequent
//! calls skip the feature.

use std::sync::Arc;

use tracing::{error, info, trace, warn};

use glint_core::{Rect, RectF};
use glint_dispatch::{Dispatch, DispatchParams, ShaderBuilder};
use glint_gpu::{find_format, Format, FormatCaps, FormatType, Gpu, Texture};

use crate::filter::{FilterConfig, BICUBIC, BILINEAR, NEAREST};
use crate::frame::{Frame, LutKind, PlaneType};
use crate::hook::{Hook, HookParams, HookResult, HookSig, HookStage};
use crate::img::Img;
use crate::params::RenderParams;
use crate::pool::TexturePool;
use crate::shaders::sampling::{self, FilterParams, SampleSrc, SepDir};
use crate::shaders::color;
use crate::shaders::{
    DitherState, GrainState, IccState, LutState, PeakDetectState, SamplerState,
};

pub(crate) const MAX_PLANES: usize = 4;

/// Which persistent sampler state a scaling operation uses.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SamplerSlot {
    Main,
    Src(usize),
    Dst(usize),
    Osd(usize),
    /// No persistent state (sampler disabled).
    None,
}

/// The renderer. One instance per output surface; not thread-safe.
pub struct Renderer {
    pub(crate) gpu: Arc<dyn Gpu>,
    pub(crate) dp: Dispatch,

    /// Intermediate texture format per component count (index 0 unused).
    pub(crate) fbofmt: [Option<Arc<Format>>; 5],

    // Degradation latches; see the module docs
    pub(crate) disable_compute: bool,
    pub(crate) disable_sampling: bool,
    pub(crate) disable_debanding: bool,
    pub(crate) disable_linear_hdr: bool,
    pub(crate) disable_linear_sdr: bool,
    pub(crate) disable_blending: bool,
    pub(crate) disable_overlay: bool,
    pub(crate) disable_icc: bool,
    pub(crate) disable_peak_detect: bool,
    pub(crate) disable_grain: bool,
    pub(crate) disable_hooks: bool,
    pub(crate) disable_mixing: bool,

    // Persistent shader state
    pub(crate) peak_detect_state: Option<PeakDetectState>,
    pub(crate) dither_state: Option<DitherState>,
    pub(crate) icc_state: Option<IccState>,
    pub(crate) grain_state: [Option<GrainState>; MAX_PLANES],
    pub(crate) lut_state: [Option<LutState>; 3],

    pub(crate) fbos: TexturePool,
    pub(crate) sampler_main: SamplerState,
    pub(crate) samplers_src: [SamplerState; MAX_PLANES],
    pub(crate) samplers_dst: [SamplerState; MAX_PLANES],
    pub(crate) samplers_osd: Vec<SamplerState>,

    // Frame cache for mixing; see `mix.rs`
    pub(crate) frames: Vec<crate::mix::CachedFrame>,
    pub(crate) frame_fbos: Vec<Arc<dyn Texture>>,
}

/// Per-call scratch state.
pub(crate) struct PassState {
    /// The image being rendered; mutated in place by every phase.
    pub img: Img,
    /// The reference rect: `image.crop`, kept valid and updated as the
    /// reference plane evolves.
    pub ref_rect: RectF,
    /// Integer version of `target.crop`.
    pub dst_rect: Rect,

    /// Corrected copies of the frames, with all rects/metadata inferred.
    pub image: Frame,
    pub target: Frame,

    pub src_type: [PlaneType; MAX_PLANES],
    pub dst_type: [PlaneType; MAX_PLANES],
    pub src_ref: usize,
    pub dst_ref: usize,

    /// Pool usage bits for this call.
    pub fbos_used: Vec<bool>,
}

impl Renderer {
    pub fn new(gpu: Arc<dyn Gpu>) -> Self {
        let dp = Dispatch::new(gpu.clone());
        let mut rr = Self {
            gpu,
            dp,
            fbofmt: Default::default(),
            disable_compute: false,
            disable_sampling: false,
            disable_debanding: false,
            disable_linear_hdr: false,
            disable_linear_sdr: false,
            disable_blending: false,
            disable_overlay: false,
            disable_icc: false,
            disable_peak_detect: false,
            disable_grain: false,
            disable_hooks: false,
            disable_mixing: false,
            peak_detect_state: None,
            dither_state: None,
            icc_state: None,
            grain_state: Default::default(),
            lut_state: Default::default(),
            fbos: TexturePool::new(),
            sampler_main: SamplerState::default(),
            samplers_src: Default::default(),
            samplers_dst: Default::default(),
            samplers_osd: Vec::new(),
            frames: Vec::new(),
            frame_fbos: Vec::new(),
        };
        rr.find_fbo_format();
        rr
    }

    /// Serializes the compiled program binaries (see the dispatch cache).
    pub fn save(&self) -> Vec<u8> {
        self.dp.save()
    }

    /// Restores program binaries from a previous [`Renderer::save`].
    pub fn load(&mut self, cache: &[u8]) {
        self.dp.load(cache)
    }

    /// Drops the frame-mixing cache and peak detection state.
    pub fn flush_cache(&mut self) {
        self.frames.clear();
        self.frame_fbos.clear();
        self.peak_detect_state = None;
    }

    /// Snapshot of the degradation latches, for diagnostics. A `true`
    /// field means the feature has been permanently disabled for this
    /// renderer's lifetime.
    pub fn disabled_features(&self) -> DisabledFeatures {
        DisabledFeatures {
            compute: self.disable_compute,
            sampling: self.disable_sampling,
            debanding: self.disable_debanding,
            linear_hdr: self.disable_linear_hdr,
            linear_sdr: self.disable_linear_sdr,
            blending: self.disable_blending,
            overlay: self.disable_overlay,
            icc: self.disable_icc,
            peak_detect: self.disable_peak_detect,
            grain: self.disable_grain,
            hooks: self.disable_hooks,
            mixing: self.disable_mixing,
        }
    }

    /// Signatures currently held by the frame-mixing cache, for
    /// diagnostics.
    pub fn cached_frame_signatures(&self) -> Vec<u64> {
        self.frames.iter().map(|f| f.signature).collect()
    }

    /// Probes the preferred intermediate texture format, starting at
    /// 16-bit float and degrading down to 8-bit unorm.
    fn find_fbo_format(&mut self) {
        let configs: &[(FormatType, u8, FormatCaps)] = &[
            (FormatType::Float, 16, FormatCaps::LINEAR),
            (FormatType::Float, 16, FormatCaps::SAMPLEABLE),
            (FormatType::Unorm, 16, FormatCaps::LINEAR),
            (FormatType::Snorm, 16, FormatCaps::LINEAR),
            (FormatType::Unorm, 16, FormatCaps::SAMPLEABLE),
            (FormatType::Snorm, 16, FormatCaps::SAMPLEABLE),
            (FormatType::Unorm, 8, FormatCaps::LINEAR),
            (FormatType::Unorm, 8, FormatCaps::SAMPLEABLE),
        ];

        let mut found = None;
        for &(ty, depth, caps) in configs {
            if let Some(fmt) =
                find_format(self.gpu.as_ref(), ty, 4, depth, caps | FormatCaps::RENDERABLE)
            {
                // Probe per-channel-count variants, falling back to the
                // next wider format
                self.fbofmt[4] = Some(fmt.clone());
                for c in (1..4).rev() {
                    self.fbofmt[c] =
                        find_format(self.gpu.as_ref(), ty, c, depth, fmt.caps)
                            .or_else(|| self.fbofmt[c + 1].clone());
                }
                found = Some(fmt);
                break;
            }
        }

        let Some(fmt) = found else {
            warn!("found no renderable intermediate format, most features disabled");
            return;
        };

        if !fmt.caps.contains(FormatCaps::STORABLE) {
            info!("found no storable intermediate format, compute shaders disabled");
            self.disable_compute = true;
        }
        if fmt.ty != FormatType::Float {
            info!("found no floating point intermediate format, linear light processing disabled for HDR material");
            self.disable_linear_hdr = true;
        }
        if fmt.depth() < 16 {
            warn!("intermediate format precision low (<16 bit), linear light processing disabled");
            self.disable_linear_sdr = true;
        }
    }

    /// Intermediate format for a component count, honoring the caller's
    /// FBO opt-out.
    pub(crate) fn fbofmt(&self, params: &RenderParams, comps: usize) -> Option<Arc<Format>> {
        if params.disable_fbos {
            None
        } else {
            self.fbofmt[comps.clamp(1, 4)].clone()
        }
    }

    // =========================================================================
    // Img transitions
    // =========================================================================

    /// Forcibly materializes an img into a texture, dispatching where
    /// necessary. Returns `None` (and degrades) on failure.
    pub(crate) fn img_tex(
        &mut self,
        fbos_used: &mut Vec<bool>,
        img: &mut Img,
    ) -> Option<Arc<dyn Texture>> {
        if let Some(tex) = &img.tex {
            debug_assert!(img.sh.is_none());
            return Some(tex.clone());
        }

        let fmt = img
            .fmt
            .take()
            .or_else(|| self.fbofmt[img.comps.clamp(1, 4)].clone());
        let Some(fmt) = fmt else {
            if let Some(sh) = img.sh.take() {
                self.dp.abort(sh);
            }
            return None;
        };

        let tex = match self
            .fbos
            .get(self.gpu.as_ref(), fbos_used, img.w, img.h, &fmt)
        {
            Ok(tex) => tex,
            Err(err) => {
                error!("failed creating intermediate texture, disabling advanced rendering: {err}");
                self.fbofmt = Default::default();
                if let Some(sh) = img.sh.take() {
                    self.dp.abort(sh);
                }
                return None;
            }
        };

        let sh = img.sh.take().expect("img holds a shader");
        match self.dp.finish(DispatchParams {
            shader: sh,
            target: tex.clone(),
            rect: Rect::default(),
            blend: None,
            timer: None,
        }) {
            Ok(()) => {
                img.tex = Some(tex.clone());
                Some(tex)
            }
            Err(err) => {
                error!("failed dispatching intermediate pass: {err}");
                img.sh = Some(self.dp.begin(false));
                None
            }
        }
    }

    /// Forcibly converts an img into a shader, beginning a sampling
    /// shader when it currently holds a texture.
    pub(crate) fn img_sh<'a>(&mut self, img: &'a mut Img) -> &'a mut ShaderBuilder {
        if img.sh.is_none() {
            let tex = img.tex.take().expect("img holds a texture");
            let mut sh = self.dp.begin(false);
            sampling::sample_direct(&mut sh, &SampleSrc::from_tex(tex));
            img.sh = Some(sh);
        }
        img.sh.as_mut().expect("img now holds a shader")
    }

    // =========================================================================
    // Sampler decisions
    // =========================================================================

    pub(crate) fn sample_src_info(
        &self,
        src: &SampleSrc,
        params: &RenderParams,
    ) -> SamplerInfo {
        let mut info = SamplerInfo::default();

        let rx = src.new_w as f32 / src.rect.w().abs();
        if rx < 1.0 - 1e-6 {
            info.dir_sep[0] = SamplerDir::Down;
        } else if rx > 1.0 + 1e-6 {
            info.dir_sep[0] = SamplerDir::Up;
        }
        let ry = src.new_h as f32 / src.rect.h().abs();
        if ry < 1.0 - 1e-6 {
            info.dir_sep[1] = SamplerDir::Down;
        } else if ry > 1.0 + 1e-6 {
            info.dir_sep[1] = SamplerDir::Up;
        }

        // Downscaling overrides upscaling when choosing the scaler
        info.dir = info.dir_sep[0].max(info.dir_sep[1]);
        info.config = match info.dir {
            SamplerDir::Down => params.downscaler,
            SamplerDir::Up => params.upscaler,
            SamplerDir::Noop => {
                info.ty = SamplerType::Nearest;
                return info;
            }
        };

        if self.fbofmt(params, src.components).is_none()
            || self.disable_sampling
            || info.config.is_none()
        {
            info.ty = SamplerType::Direct;
            return info;
        }

        info.ty = SamplerType::Complex;

        // Try replacing the filter with faster GPU built-in sampling
        let texfmt = src
            .tex
            .as_ref()
            .map(|t| t.params().format.clone())
            .or_else(|| self.fbofmt[src.components.clamp(1, 4)].clone());
        let can_linear =
            texfmt.is_some_and(|fmt| fmt.caps.contains(FormatCaps::LINEAR));
        let can_fast = info.dir == SamplerDir::Up || params.skip_anti_aliasing;
        if can_fast && !params.disable_builtin_scalers {
            let config = info.config.expect("complex sampler has a config");
            if can_linear && config.is(&BICUBIC) {
                info.ty = SamplerType::Bicubic;
            }
            if can_linear && config.is(&BILINEAR) {
                info.ty = SamplerType::Direct;
            }
            if config.is(&NEAREST) {
                info.ty = if can_linear {
                    SamplerType::Nearest
                } else {
                    SamplerType::Direct
                };
            }
        }

        info
    }

    fn sampler_lut(
        &mut self,
        slot: SamplerSlot,
        dir: SamplerDir,
    ) -> Option<&mut Option<crate::shaders::ScalerLut>> {
        let state = match slot {
            SamplerSlot::Main => &mut self.sampler_main,
            SamplerSlot::Src(i) => &mut self.samplers_src[i],
            SamplerSlot::Dst(i) => &mut self.samplers_dst[i],
            SamplerSlot::Osd(i) => {
                while self.samplers_osd.len() <= i {
                    self.samplers_osd.push(SamplerState::default());
                }
                &mut self.samplers_osd[i]
            }
            SamplerSlot::None => return None,
        };
        Some(match dir {
            SamplerDir::Down => &mut state.downscaler,
            _ => &mut state.upscaler,
        })
    }

    /// Emits the sampling of `src` into `sh` using the appropriate
    /// sampler, falling back to direct sampling on any failure.
    pub(crate) fn dispatch_sampler(
        &mut self,
        fbos_used: &mut Vec<bool>,
        sh: &mut ShaderBuilder,
        slot: SamplerSlot,
        no_compute: bool,
        params: &RenderParams,
        src: &SampleSrc,
    ) {
        let info = self.sample_src_info(src, params);
        if matches!(slot, SamplerSlot::None) || info.dir == SamplerDir::Noop {
            return sampling::sample_direct(sh, src);
        }

        match info.ty {
            SamplerType::Direct => return sampling::sample_direct(sh, src),
            SamplerType::Nearest => return sampling::sample_nearest(sh, src),
            SamplerType::Bicubic => return sampling::sample_bicubic(sh, src),
            SamplerType::Complex => {}
        }

        let config = info.config.expect("complex sampler has a config");
        let gpu = self.gpu.clone();
        let no_compute = self.disable_compute || no_compute;

        let mut run_pass = |rr: &mut Renderer,
                            sh: &mut ShaderBuilder,
                            dir: Option<SepDir>,
                            src: &SampleSrc|
         -> bool {
            let Some(lut) = rr.sampler_lut(slot, info.dir) else {
                return false;
            };
            let mut fp = FilterParams {
                config,
                lut_entries: params.lut_entries,
                cutoff: params.polar_cutoff,
                antiring: params.antiringing_strength,
                no_compute,
                no_widening: params.skip_anti_aliasing,
                lut,
            };
            match dir {
                None => sampling::sample_polar(sh, src, &mut fp, gpu.as_ref()),
                Some(d) => sampling::sample_ortho(sh, d, src, &mut fp, gpu.as_ref()),
            }
        };

        let ok = if config.polar {
            // Polar samplers are always a single function call
            run_pass(self, sh, None, src)
        } else if info.dir_sep[0] != SamplerDir::Noop && info.dir_sep[1] != SamplerDir::Noop {
            // Scaling in both directions: vertical pass into an
            // intermediate texture, then horizontal
            let mut tsh = self.dp.begin(true);
            if !run_pass(self, &mut tsh, Some(SepDir::Vertical), src) {
                self.dp.abort(tsh);
                false
            } else {
                let mut inter = Img {
                    w: src.tex.as_ref().map_or(src.new_w, |t| t.params().w),
                    h: src.new_h,
                    comps: src.components,
                    sh: Some(tsh),
                    ..Default::default()
                };
                match self.img_tex(fbos_used, &mut inter) {
                    Some(tex) => {
                        let src2 = SampleSrc {
                            tex: Some(tex.clone()),
                            scale: 1.0,
                            rect: RectF::new(0.0, 0.0, tex.params().w as f32, tex.params().h as f32),
                            ..src.clone()
                        };
                        run_pass(self, sh, Some(SepDir::Horizontal), &src2)
                    }
                    None => false,
                }
            }
        } else if info.dir_sep[0] != SamplerDir::Noop {
            run_pass(self, sh, Some(SepDir::Horizontal), src)
        } else {
            run_pass(self, sh, Some(SepDir::Vertical), src)
        };

        if !ok {
            error!("failed dispatching scaler, disabling advanced scaling");
            self.disable_sampling = true;
            sampling::sample_direct(sh, src);
        }
    }

    // =========================================================================
    // Debanding
    // =========================================================================

    /// Debands the source, replacing direct sampling where possible.
    pub(crate) fn deband_src(
        &mut self,
        fbos_used: &mut Vec<bool>,
        psh: &mut ShaderBuilder,
        params: &RenderParams,
        src: &mut SampleSrc,
        grain_scale: f32,
    ) -> DebandResult {
        let Some(deband_params) = &params.deband else {
            return DebandResult::Noop;
        };
        if self.disable_debanding {
            return DebandResult::Noop;
        }

        let linear_ok = src
            .tex
            .as_ref()
            .is_some_and(|t| t.params().format.caps.contains(FormatCaps::LINEAR));
        if !linear_ok {
            warn!(
                "debanding requires uploaded textures to be linearly sampleable, disabling debanding"
            );
            self.disable_debanding = true;
            return DebandResult::Noop;
        }

        // The debanding shader can itself replace direct sampling
        let mut deband_scales =
            self.sample_src_info(src, params).ty == SamplerType::Direct;

        let mut fixed;
        let eff_src = if deband_scales {
            &*src
        } else {
            // Snap the cut-out to integers so no fractional scaling happens
            fixed = src.clone();
            fixed.rect = RectF::new(
                fixed.rect.x0.floor(),
                fixed.rect.y0.floor(),
                fixed.rect.x1.ceil(),
                fixed.rect.y1.ceil(),
            );
            fixed.new_w = fixed.rect.w().abs() as u32;
            fixed.new_h = fixed.rect.h().abs() as u32;
            if fixed.new_w == src.new_w && fixed.new_h == src.new_h && fixed.rect == src.rect {
                // Exact integer crop without scaling, skip the scalers too
                deband_scales = true;
                &*src
            } else {
                &fixed
            }
        };

        if deband_scales {
            sampling::deband(psh, eff_src, deband_params, grain_scale);
            return DebandResult::Scaled;
        }

        let eff = eff_src.clone();
        let mut sh = self.dp.begin(true);
        sampling::deband(&mut sh, &eff, deband_params, grain_scale);

        let mut img = Img {
            w: eff.new_w,
            h: eff.new_h,
            comps: eff.components,
            sh: Some(sh),
            ..Default::default()
        };
        let Some(tex) = self.img_tex(fbos_used, &mut img) else {
            error!("failed dispatching debanding shader, disabling debanding");
            self.disable_debanding = true;
            return DebandResult::Noop;
        };

        // Point the original source at the debanded texture
        src.rect.x0 -= eff.rect.x0;
        src.rect.x1 -= eff.rect.x0;
        src.rect.y0 -= eff.rect.y0;
        src.rect.y1 -= eff.rect.y0;
        src.tex = Some(tex);
        src.scale = 1.0;
        DebandResult::Normal
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Runs all hooks registered at `stage` over the image. Returns true
    /// if any hook ran (even unsuccessfully).
    pub(crate) fn pass_hook(
        &mut self,
        st_fbos_used: &mut Vec<bool>,
        img: &mut Img,
        ref_rect: RectF,
        dst_rect: Rect,
        stage: HookStage,
        params: &RenderParams,
    ) -> bool {
        if self.fbofmt[4].is_none() || self.disable_hooks {
            return false;
        }

        let mut ret = false;
        let hooks: Vec<Arc<dyn Hook>> = params
            .hooks
            .iter()
            .filter(|h| h.stages().contains(stage))
            .cloned()
            .collect();

        for hook in hooks {
            trace!("dispatching hook at stage {stage:?}");

            // Materialize the input in the form the hook wants
            let sig = hook.signature();
            let mut tex_input = None;
            match sig {
                HookSig::None => {}
                HookSig::Tex => match self.img_tex(st_fbos_used, img) {
                    Some(tex) => tex_input = Some(tex),
                    None => {
                        error!("failed dispatching shader prior to hook");
                        return self.hook_error(img, ret);
                    }
                },
                HookSig::Color => {
                    self.img_sh(img);
                }
            }

            let result = {
                let Renderer {
                    ref mut dp,
                    ref mut fbos,
                    ref gpu,
                    ref fbofmt,
                    ..
                } = *self;
                let mut get_tex = |w: u32, h: u32| -> Option<Arc<dyn Texture>> {
                    let fmt = fbofmt[4].clone()?;
                    fbos.get(gpu.as_ref(), st_fbos_used, w, h, &fmt).ok()
                };
                let hp = HookParams {
                    dispatch: dp,
                    get_tex: &mut get_tex,
                    stage,
                    tex: tex_input,
                    sh: img.sh.as_mut(),
                    w: img.w,
                    h: img.h,
                    rect: img.rect,
                    repr: img.repr,
                    color: img.color,
                    components: img.comps,
                    src_rect: ref_rect,
                    dst_rect,
                };
                hook.hook(hp)
            };

            let res = match result {
                Ok(res) => res,
                Err(err) => {
                    error!("failed executing hook, disabling: {err}");
                    return self.hook_error(img, ret);
                }
            };

            let resizable = stage.resizable();
            match res {
                HookResult::None => {}
                HookResult::Tex {
                    tex,
                    rect,
                    repr,
                    color,
                    components,
                } => {
                    let (w, h) = (tex.params().w, tex.params().h);
                    if !resizable && (w != img.w || h != img.h || rect != img.rect) {
                        error!("user hook tried resizing a non-resizable stage");
                        return self.hook_error(img, ret);
                    }
                    if let Some(sh) = img.sh.take() {
                        self.dp.abort(sh);
                    }
                    *img = Img {
                        w,
                        h,
                        tex: Some(tex),
                        rect,
                        repr,
                        color,
                        comps: components,
                        ..Default::default()
                    };
                }
                HookResult::Color {
                    sh,
                    w,
                    h,
                    rect,
                    repr,
                    color,
                    components,
                } => {
                    if !resizable && (w != img.w || h != img.h || rect != img.rect) {
                        error!("user hook tried resizing a non-resizable stage");
                        self.dp.abort(sh);
                        return self.hook_error(img, ret);
                    }
                    if let Some(old) = img.sh.take() {
                        self.dp.abort(old);
                    }
                    *img = Img {
                        w,
                        h,
                        sh: Some(sh),
                        rect,
                        repr,
                        color,
                        comps: components,
                        ..Default::default()
                    };
                }
            }

            ret = true;
        }

        ret
    }

    /// Disables hooks and keeps the img state valid after a hook failure.
    fn hook_error(&mut self, img: &mut Img, ret: bool) -> bool {
        self.disable_hooks = true;
        if img.tex.is_none() && img.sh.is_none() {
            img.sh = Some(self.dp.begin(false));
        }
        ret
    }

    // =========================================================================
    // HDR peak detection
    // =========================================================================

    pub(crate) fn hdr_update_peak(&mut self, st: &mut PassState, params: &RenderParams) {
        let cleanup = |rr: &mut Renderer| color::reset_peak(&mut rr.peak_detect_state);

        let Some(pd_params) = &params.peak_detect else {
            return cleanup(self);
        };
        if !st.img.color.is_hdr() || self.disable_compute || self.disable_peak_detect {
            return cleanup(self);
        }

        let src_peak = st.img.color.sig_peak * st.img.color.effective_scale();
        let dst_peak = st.target.color.sig_peak * st.target.color.effective_scale();
        if src_peak <= dst_peak + 1e-6 {
            return cleanup(self); // no adaptation needed
        }

        if params.lut.is_some() && params.lut_kind == Some(LutKind::Conversion) {
            return cleanup(self); // the LUT handles tone mapping
        }

        if self.fbofmt(params, 4).is_none() && !params.allow_delayed_peak_detect {
            warn!(
                "disabling peak detection because delayed detection is not allowed \
                 and lack of intermediate textures forces the result to be delayed"
            );
            self.disable_peak_detect = true;
            return cleanup(self);
        }

        let pd_params = *pd_params;
        let gpu = self.gpu.clone();
        let sh = self.img_sh(&mut st.img);
        let ok = color::detect_peak(sh, &mut self.peak_detect_state, &pd_params, gpu.as_ref());
        if !ok {
            warn!("failed creating HDR peak detection shader, disabling");
            self.disable_peak_detect = true;
            return cleanup(self);
        }
    }
}

/// Snapshot of the renderer's degradation latches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisabledFeatures {
    pub compute: bool,
    pub sampling: bool,
    pub debanding: bool,
    pub linear_hdr: bool,
    pub linear_sdr: bool,
    pub blending: bool,
    pub overlay: bool,
    pub icc: bool,
    pub peak_detect: bool,
    pub grain: bool,
    pub hooks: bool,
    pub mixing: bool,
}

/// What [`Renderer::deband_src`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DebandResult {
    /// No debanding was performed.
    Noop,
    /// Debanding was performed; the plane still needs scaling.
    Normal,
    /// Debanding took care of sampling/scaling as well.
    Scaled,
}

/// How a source region gets sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SamplerType {
    /// Let the texture's sample mode decide.
    #[default]
    Direct,
    /// Forced nearest-neighbour.
    Nearest,
    /// Fast bicubic via built-in bilinear taps.
    Bicubic,
    /// LUT-driven custom filter.
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub(crate) enum SamplerDir {
    #[default]
    Noop,
    Up,
    Down,
}

#[derive(Default)]
pub(crate) struct SamplerInfo {
    pub config: Option<&'static FilterConfig>,
    pub ty: SamplerType,
    pub dir: SamplerDir,
    pub dir_sep: [SamplerDir; 2],
}
