//! The individual phases of a render pass.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{error, trace};

use glint_core::{ColorLevels, ColorSystem, Rect, RectF, Transfer};
use glint_dispatch::{glsl, DispatchParams, ShaderSig};
use glint_gpu::{find_format, BlendParams, Format, FormatCaps, Texture};

use crate::frame::{
    guess_lut_kind, Channel, Frame, LutKind, Overlay, OverlayMode, Plane, PlaneType,
};
use crate::hook::HookStage;
use crate::img::Img;
use crate::params::RenderParams;
use crate::renderer::{
    DebandResult, PassState, Renderer, SamplerDir, SamplerSlot, SamplerType, MAX_PLANES,
};
use crate::shaders::grain::{self, GrainParams};
use crate::shaders::icc::{self, IccColorSpace};
use crate::shaders::sampling::{self, SampleSrc};
use crate::shaders::{color, dither, lut};
use crate::{RenderError, RenderResult};

const LUT_IMAGE: usize = 0;
const LUT_TARGET: usize = 1;
const LUT_PARAMS: usize = 2;

/// Per-plane state during `pass_read_image`.
struct PlaneState {
    ty: PlaneType,
    plane: Plane,
    img: Img,
}

fn plane_hook_stage(ty: PlaneType) -> HookStage {
    match ty {
        PlaneType::Alpha => HookStage::ALPHA_INPUT,
        PlaneType::Chroma => HookStage::CHROMA_INPUT,
        PlaneType::Luma => HookStage::LUMA_INPUT,
        PlaneType::Rgb => HookStage::RGB_INPUT,
        PlaneType::Xyz => HookStage::XYZ_INPUT,
        PlaneType::Invalid => HookStage::empty(),
    }
}

impl Renderer {
    /// Format usable for merging two plane images, or `None` when no
    /// format supports both channel counts at the required depth/caps.
    fn merge_fmt(&self, a: &Img, b: &Img) -> Option<Arc<Format>> {
        let fmta = a
            .tex
            .as_ref()
            .map(|t| t.params().format.clone())
            .or_else(|| a.fmt.clone())?;
        let fmtb = b.tex.as_ref().map(|t| t.params().format.clone())?;
        if fmta.ty != fmtb.ty {
            return None;
        }

        let num_comps = (a.comps + b.comps).min(4);
        let min_depth = a.repr.bits.sample_depth.max(b.repr.bits.sample_depth);

        // Only accept formats supporting the relevant caps of both
        let mask = FormatCaps::SAMPLEABLE | FormatCaps::LINEAR;
        let req_caps = (fmta.caps & mask) | (fmtb.caps & mask);
        find_format(self.gpu.as_ref(), fmta.ty, num_comps, min_depth, req_caps)
    }

    /// Rough heuristics for whether plane merging is expected to pay off:
    /// checks for the operations known to benefit from merged planes.
    fn want_merge(
        &self,
        st: &PlaneState,
        reference: &PlaneState,
        image: &Frame,
        params: &RenderParams,
    ) -> bool {
        if self.fbofmt[4].is_none() {
            return false;
        }

        // Debanding
        if !self.disable_debanding && params.deband.is_some() {
            return true;
        }

        // Other plane hooks, which are generally nontrivial
        let stage = plane_hook_stage(st.ty);
        if params.hooks.iter().any(|h| h.stages().contains(stage)) {
            return true;
        }

        // Non-trivial scaling
        let src = SampleSrc {
            new_w: reference.img.w,
            new_h: reference.img.h,
            rect: RectF::new(0.0, 0.0, st.img.w as f32, st.img.h as f32),
            components: st.img.comps,
            ..Default::default()
        };
        if self.sample_src_info(&src, params).ty == SamplerType::Complex {
            return true;
        }

        // Film grain synthesis, saving redundant grain LUT sampling
        if !self.disable_grain {
            if let Some(data) = &image.grain {
                let gp = GrainParams {
                    data,
                    channels: st.plane.component_mapping,
                    components: st.plane.components,
                };
                if grain::needs_grain(&gp) {
                    return true;
                }
            }
        }

        false
    }

    /// Applies film grain to one plane, round-tripping through an
    /// intermediate texture. Returns true if grain was applied.
    fn plane_film_grain(
        &mut self,
        fbos_used: &mut Vec<bool>,
        plane_idx: usize,
        st: &mut PlaneState,
        image: &Frame,
    ) -> bool {
        if self.disable_grain {
            return false;
        }
        let Some(data) = &image.grain else {
            return false;
        };

        let gp = GrainParams {
            data,
            channels: st.plane.component_mapping,
            components: st.plane.components,
        };
        if !grain::needs_grain(&gp) {
            return false;
        }

        if self.fbofmt[st.plane.components.clamp(1, 4)].is_none() {
            error!("film grain required but no renderable format available, disabling");
            self.disable_grain = true;
            return false;
        }

        let Some(tex) = self.img_tex(fbos_used, &mut st.img) else {
            return false;
        };

        let mut sh = self.dp.begin(true);
        sampling::sample_direct_tex(&mut sh, &tex, 1.0);
        let gpu = self.gpu.clone();
        if !grain::apply_grain(&mut sh, &mut self.grain_state[plane_idx], &gp, gpu.as_ref()) {
            self.dp.abort(sh);
            self.disable_grain = true;
            return false;
        }

        st.img.tex = None;
        st.img.sh = Some(sh);
        if self.img_tex(fbos_used, &mut st.img).is_none() {
            error!("failed applying film grain, disabling");
            if let Some(sh) = st.img.sh.take() {
                self.dp.abort(sh);
            }
            st.img.tex = Some(tex);
            self.disable_grain = true;
            return false;
        }
        true
    }

    /// Phase 3+4+5+6: reads, merges and combines the source planes into
    /// `st.img`, applies input color conversion and peak detection.
    pub(crate) fn pass_read_image(
        &mut self,
        st: &mut PassState,
        params: &RenderParams,
    ) -> RenderResult<()> {
        let image = st.image.clone();

        let mut planes: SmallVec<[PlaneState; MAX_PLANES]> = image
            .planes
            .iter()
            .enumerate()
            .map(|(i, plane)| {
                let tparams = plane.texture.params();
                PlaneState {
                    ty: st.src_type[i],
                    plane: plane.clone(),
                    img: Img {
                        w: tparams.w,
                        h: tparams.h,
                        tex: Some(plane.texture.clone()),
                        repr: image.repr,
                        color: image.color,
                        comps: plane.components,
                        ..Default::default()
                    },
                }
            })
            .collect();

        // The original reference texture, even after preprocessing
        let ref_tex = planes[st.src_ref].plane.texture.clone();
        let (ref_w, ref_h) = {
            let params = ref_tex.params();
            (params.w, params.h)
        };

        // Merge compatible planes into combined shaders
        for i in 0..planes.len() {
            if planes[i].ty == PlaneType::Invalid {
                continue;
            }
            let wants = {
                let sti = &planes[i];
                let reference = match planes.get(st.src_ref) {
                    Some(r) if r.ty != PlaneType::Invalid => r,
                    _ => sti,
                };
                self.want_merge(sti, reference, &image, params)
            };
            if !wants {
                continue;
            }

            for j in (i + 1)..planes.len() {
                let compatible = {
                    let (a, b) = planes.split_at(j);
                    let (sti, stj) = (&a[i], &b[0]);
                    stj.ty == sti.ty
                        && sti.img.w == stj.img.w
                        && sti.img.h == stj.img.h
                        && sti.plane.shift_x == stj.plane.shift_x
                        && sti.plane.shift_y == stj.plane.shift_y
                };
                if !compatible {
                    continue;
                }
                let fmt = {
                    let (a, b) = planes.split_at(j);
                    self.merge_fmt(&a[i].img, &b[0].img)
                };
                let Some(fmt) = fmt else { continue };

                trace!("merging plane {j} into plane {i}");
                let (a, b) = planes.split_at_mut(j);
                let (sti, stj) = (&mut a[i], &mut b[0]);

                if sti.img.sh.is_none() {
                    let tex = sti.img.tex.take().expect("unmerged plane holds a texture");
                    let mut sh = self.dp.begin(true);
                    glsl!(sh, "vec4 tmp;\n");
                    sampling::sample_direct_tex(&mut sh, &tex, 1.0);
                    sti.img.sh = Some(sh);
                }

                let mut psh = self.dp.begin(true);
                let stj_tex = stj.img.tex.clone().expect("merge source holds a texture");
                sampling::sample_direct_tex(&mut psh, &stj_tex, 1.0);

                let sub = sti.img.sh.as_mut().unwrap().subpass(&psh);
                self.dp.abort(psh);
                let Some(sub) = sub else {
                    break; // can't merge, skip
                };

                let sh = sti.img.sh.as_mut().unwrap();
                glsl!(sh, "tmp = {sub}();\n");
                for jc in 0..stj.img.comps {
                    let map = stj.plane.component_mapping[jc];
                    if map == Channel::None {
                        continue;
                    }
                    let ic = sti.img.comps;
                    if ic >= 4 {
                        break;
                    }
                    glsl!(sh, "color[{ic}] = tmp[{jc}];\n");
                    sti.img.comps += 1;
                    sti.plane.components = sti.img.comps;
                    sti.plane.component_mapping[ic] = map;
                }

                sti.img.fmt = Some(fmt);
                stj.ty = PlaneType::Invalid;
                stj.img = Img::default();
            }

            if planes[i].img.sh.is_some()
                && self.img_tex(&mut st.fbos_used, &mut planes[i].img).is_none()
            {
                error!("failed dispatching plane merging shader, disabling intermediates");
                self.fbofmt = Default::default();
                return Err(RenderError::Degraded("plane merging failed".into()));
            }
        }

        // Compute the sampling rect of each plane, then preprocess
        for i in 0..planes.len() {
            if planes[i].ty == PlaneType::Invalid {
                continue;
            }

            {
                let stp = &mut planes[i];
                let tparams = stp.plane.texture.params();
                let rx = ref_w as f32 / tparams.w as f32;
                let ry = ref_h as f32 / tparams.h as f32;

                // Only accept integer subsampling ratios; fractionally
                // subsampled planes get rounded up to the nearest integer
                // size, which must be discarded
                let rrx = if rx >= 1.0 {
                    rx.round()
                } else {
                    1.0 / (1.0 / rx).round()
                };
                let rry = if ry >= 1.0 {
                    ry.round()
                } else {
                    1.0 / (1.0 / ry).round()
                };
                let (sx, sy) = (stp.plane.shift_x, stp.plane.shift_y);

                stp.img.rect = RectF {
                    x0: (image.crop.x0 - sx) / rrx,
                    y0: (image.crop.y0 - sy) / rry,
                    x1: (image.crop.x1 - sx) / rrx,
                    y1: (image.crop.y1 - sy) / rry,
                };

                trace!(
                    "plane {i}: type {:?} rect {:?} bits {:?}",
                    stp.ty,
                    stp.img.rect,
                    stp.img.repr.bits
                );
            }

            if self.plane_film_grain(&mut st.fbos_used, i, &mut planes[i], &image) {
                trace!("plane {i}: film grain applied");
            }

            let stage = plane_hook_stage(planes[i].ty);
            if !stage.is_empty() {
                let (rect, dst) = (st.ref_rect, st.dst_rect);
                if self.pass_hook(&mut st.fbos_used, &mut planes[i].img, rect, dst, stage, params)
                {
                    trace!("plane {i}: hooks applied");
                }
            }

            // Update the conceptual size after the plane shaders ran
            let stp = &mut planes[i];
            stp.img.w = stp.img.rect.w().abs().round() as u32;
            stp.img.h = stp.img.rect.h().abs().round() as u32;
        }

        // Phase 4: combine the planes into one shader
        let mut sh = self.dp.begin(true);
        sh.require(ShaderSig::None, 0, 0);

        let neutral = if image.repr.sys.is_ycbcr_like() {
            "0.0, 0.5, 0.5"
        } else {
            "0.0, 0.0, 0.0"
        };
        glsl!(
            sh,
            "vec4 color = vec4({neutral}, 1.0);\n\
             // combine planes\n\
             {{\n\
             vec4 tmp;\n"
        );

        // Drop sub-pixel offsets from the ref rect and re-add them to the
        // final img rect, so downstream sampling stays on integer grids.
        // Also drop anamorphic sub-pixel mismatches. The reference plane is
        // re-found here since merging may have combined it away.
        let ref_idx = planes.iter().position(|p| p.ty.is_ref()).unwrap_or(0);
        let ref_rect = planes[ref_idx].img.rect;
        let (ref_img_w, ref_img_h) = (planes[ref_idx].img.w, planes[ref_idx].img.h);
        let off_x = ref_rect.x0 - ref_rect.x0.trunc();
        let off_y = ref_rect.y0 - ref_rect.y0.trunc();
        let stretch_x = ref_rect.w().round() / ref_rect.w();
        let stretch_y = ref_rect.h().round() / ref_rect.h();

        let mut has_alpha = false;
        for i in 0..planes.len() {
            if planes[i].ty == PlaneType::Invalid {
                continue;
            }

            // Plane shaders (grain, hooks) must be materialized before the
            // combine shader can sample them
            if planes[i].img.sh.is_some()
                && self.img_tex(&mut st.fbos_used, &mut planes[i].img).is_none()
            {
                error!("failed materializing plane {i}, dropping it from the output");
                continue;
            }

            let (src, components, mapping) = {
                let stp = &mut planes[i];
                let scale_x = stp.img.rect.w() / ref_rect.w();
                let scale_y = stp.img.rect.h() / ref_rect.h();
                let base_x = stp.img.rect.x0 - scale_x * off_x;
                let base_y = stp.img.rect.y0 - scale_y * off_y;

                let tex = stp.img.tex.clone();
                let src = SampleSrc {
                    tex,
                    components: stp.plane.components,
                    address_mode: Default::default(),
                    scale: stp.img.repr.normalize(),
                    new_w: ref_img_w,
                    new_h: ref_img_h,
                    rect: RectF {
                        x0: base_x,
                        y0: base_y,
                        x1: base_x + stretch_x * stp.img.rect.w(),
                        y1: base_y + stretch_y * stp.img.rect.h(),
                    },
                };
                (src, stp.plane.components, stp.plane.component_mapping)
            };

            trace!("aligning plane {i}: {:?} -> {:?}", planes[i].img.rect, src.rect);

            let mut src = src;
            let mut psh = self.dp.begin(true);
            let grain_scale = image.color.transfer.nominal_peak() * image.color.effective_scale();
            if self.deband_src(&mut st.fbos_used, &mut psh, params, &mut src, grain_scale)
                != DebandResult::Scaled
            {
                self.dispatch_sampler(
                    &mut st.fbos_used,
                    &mut psh,
                    SamplerSlot::Src(i),
                    false,
                    params,
                    &src,
                );
            }

            let mut sub = sh.subpass(&psh);
            if sub.is_none() {
                // Can't merge shaders; force indirection through a texture
                let mut inter_img = Img {
                    w: ref_img_w,
                    h: ref_img_h,
                    comps: src.components,
                    sh: Some(psh),
                    ..Default::default()
                };
                let Some(inter_tex) = self.img_tex(&mut st.fbos_used, &mut inter_img) else {
                    error!("failed dispatching subpass for plane, disabling plane shaders");
                    self.disable_sampling = true;
                    self.disable_debanding = true;
                    self.disable_grain = true;
                    self.dp.abort(sh);
                    return Err(RenderError::Degraded("plane subpass failed".into()));
                };

                let mut psh2 = self.dp.begin(true);
                sampling::sample_direct_tex(&mut psh2, &inter_tex, 1.0);
                sub = sh.subpass(&psh2);
                debug_assert!(sub.is_some(), "sampling shaders always merge");
                self.dp.abort(psh2);
            } else {
                self.dp.abort(psh);
            }

            let Some(sub) = sub else {
                continue;
            };
            glsl!(sh, "tmp = {sub}();\n");
            for c in 0..components {
                if let Some(idx) = mapping[c].index() {
                    glsl!(sh, "color[{idx}] = tmp[{c}];\n");
                    has_alpha |= mapping[c] == Channel::A;
                }
            }
        }

        glsl!(sh, "}}\n");

        st.img = Img {
            sh: Some(sh),
            w: ref_img_w,
            h: ref_img_h,
            repr: planes[ref_idx].img.repr,
            color: image.color,
            comps: if has_alpha { 4 } else { 3 },
            rect: RectF {
                x0: off_x,
                y0: off_y,
                x1: off_x + ref_rect.w() / stretch_x,
                y1: off_y + ref_rect.h() / stretch_y,
            },
            fmt: None,
            tex: None,
        };

        // Update the reference rect to the adjusted image coordinates
        st.ref_rect = st.img.rect;

        let (rect, dst) = (st.ref_rect, st.dst_rect);
        self.pass_hook(&mut st.fbos_used, &mut st.img, rect, dst, HookStage::NATIVE, params);

        // Phase 5: input LUT and colorspace conversion
        let lut_kind = guess_lut_kind(&image, false);
        let mut needs_conversion = true;
        if matches!(lut_kind, Some(LutKind::Native) | Some(LutKind::Conversion)) {
            let image_lut = image.lut.clone().expect("lut kind implies a lut");
            let gpu = self.gpu.clone();
            // Fix the bit depth normalization before applying the LUT
            let scale = st.img.repr.normalize();
            let sh = self.img_sh(&mut st.img);
            glsl!(sh, "color *= vec4({scale:.8});\n");
            lut::custom_lut(sh, &image_lut, &mut self.lut_state[LUT_IMAGE], gpu.as_ref());

            if lut_kind == Some(LutKind::Conversion) {
                st.img.repr.sys = ColorSystem::Rgb;
                st.img.repr.levels = ColorLevels::Full;
                needs_conversion = false;
            }
        }

        if needs_conversion {
            let mut repr = st.img.repr;
            let scale = repr.normalize();
            let sh = self.img_sh(&mut st.img);
            glsl!(sh, "color *= vec4({scale:.8});\n");
            color::decode_color(sh, &mut repr);
            st.img.repr = repr;
        }

        if lut_kind == Some(LutKind::Normalized) {
            let image_lut = image.lut.clone().expect("lut kind implies a lut");
            let gpu = self.gpu.clone();
            let sh = self.img_sh(&mut st.img);
            lut::custom_lut(sh, &image_lut, &mut self.lut_state[LUT_IMAGE], gpu.as_ref());
        }

        let (rect, dst) = (st.ref_rect, st.dst_rect);
        self.pass_hook(&mut st.fbos_used, &mut st.img, rect, dst, HookStage::RGB, params);

        // Phase 6: HDR peak detection, as early as possible
        self.hdr_update_peak(st, params);
        Ok(())
    }

    /// Phase 7: the main scaler.
    pub(crate) fn pass_scale_main(
        &mut self,
        st: &mut PassState,
        params: &RenderParams,
    ) -> RenderResult<()> {
        if self.fbofmt(params, st.img.comps).is_none() {
            trace!("skipping main scaler (no intermediates)");
            return Ok(());
        }

        let mut src = SampleSrc {
            components: st.img.comps,
            new_w: st.dst_rect.w().unsigned_abs(),
            new_h: st.dst_rect.h().unsigned_abs(),
            rect: st.img.rect,
            ..Default::default()
        };

        let mut need_fbo = !st.image.overlays.is_empty();
        need_fbo |= self.peak_detect_state.is_some() && !params.allow_delayed_peak_detect;

        // Force indirection for non-resizable producers
        if let Some(sh) = &st.img.sh {
            if let Some((out_w, out_h)) = sh.output_size() {
                need_fbo |= out_w != src.new_w || out_h != src.new_h;
            }
        }

        let info = self.sample_src_info(&src, params);
        let mut use_sigmoid = info.dir == SamplerDir::Up && params.sigmoid.is_some();
        let mut use_linear = use_sigmoid || info.dir == SamplerDir::Down;

        // The full pipeline must be enabled if any hook depends on it
        let scaling_hooks =
            HookStage::PRE_OVERLAY | HookStage::PRE_KERNEL | HookStage::POST_KERNEL;
        let linear_hooks = HookStage::LINEAR | HookStage::SIGMOID;
        for hook in &params.hooks {
            let stages = hook.stages();
            if stages.intersects(scaling_hooks | linear_hooks) {
                need_fbo = true;
                if stages.intersects(linear_hooks) {
                    use_linear = true;
                }
                if stages.contains(HookStage::SIGMOID) {
                    use_sigmoid = true;
                }
            }
        }

        if info.dir == SamplerDir::Noop && !need_fbo {
            debug_assert!(src.new_w == st.img.w && src.new_h == st.img.h);
            trace!("skipping main scaler (would be a no-op)");
            return Ok(());
        }
        if info.ty == SamplerType::Direct && !need_fbo {
            st.img.w = src.new_w;
            st.img.h = src.new_h;
            trace!("skipping main scaler (free sampling)");
            return Ok(());
        }

        if params.disable_linear_scaling || self.disable_linear_sdr {
            use_sigmoid = false;
            use_linear = false;
        }

        // Never sigmoidize HDR signals: the curve clips to [0, 1]
        if st.img.color.transfer.is_hdr() {
            use_sigmoid = false;
            if self.disable_linear_hdr {
                use_linear = false;
            }
        }

        if use_linear {
            let transfer = st.img.color.transfer;
            let sh = self.img_sh(&mut st.img);
            color::linearize(sh, transfer);
            st.img.color.transfer = Transfer::Linear;
            let (rect, dst) = (st.ref_rect, st.dst_rect);
            self.pass_hook(&mut st.fbos_used, &mut st.img, rect, dst, HookStage::LINEAR, params);
        }

        if use_sigmoid {
            let sigmoid_params = params.sigmoid.unwrap_or_default();
            let sh = self.img_sh(&mut st.img);
            color::sigmoidize(sh, &sigmoid_params);
            let (rect, dst) = (st.ref_rect, st.dst_rect);
            self.pass_hook(&mut st.fbos_used, &mut st.img, rect, dst, HookStage::SIGMOID, params);
        }

        let (rect, dst) = (st.ref_rect, st.dst_rect);
        self.pass_hook(&mut st.fbos_used, &mut st.img, rect, dst, HookStage::PRE_OVERLAY, params);

        if self.img_tex(&mut st.fbos_used, &mut st.img).is_none() {
            return Err(RenderError::Degraded("main scaler intermediate failed".into()));
        }

        // Draw the image overlays onto the intermediate, adjusted for the
        // mismatch between image crop and current rect
        if !st.image.overlays.is_empty() {
            let crop = st.image.crop;
            let (sx, sy) = (
                st.img.rect.w() / crop.w(),
                st.img.rect.h() / crop.h(),
            );
            let tf = Transform2x2 {
                mat: [sx, sy],
                c: [
                    st.img.rect.x0 - crop.x0 * sx,
                    st.img.rect.y0 - crop.y0 * sy,
                ],
            };
            let fbo = st.img.tex.clone().expect("img was materialized");
            let overlays = st.image.overlays.clone();
            let (img_color, img_repr, img_comps) = (st.img.color, st.img.repr, st.img.comps);
            self.draw_overlays(
                &mut st.fbos_used,
                &fbo,
                img_comps,
                None,
                &overlays,
                img_color,
                img_repr,
                use_sigmoid,
                Some(tf),
                params,
            );
        }

        let (rect, dst) = (st.ref_rect, st.dst_rect);
        self.pass_hook(&mut st.fbos_used, &mut st.img, rect, dst, HookStage::PRE_KERNEL, params);

        src.tex = self.img_tex(&mut st.fbos_used, &mut st.img);
        if src.tex.is_none() {
            return Err(RenderError::Degraded("main scaler intermediate failed".into()));
        }
        let mut sh = self.dp.begin(true);
        self.dispatch_sampler(
            &mut st.fbos_used,
            &mut sh,
            SamplerSlot::Main,
            false,
            params,
            &src,
        );
        st.img = Img {
            sh: Some(sh),
            w: src.new_w,
            h: src.new_h,
            repr: st.img.repr,
            rect: RectF::new(0.0, 0.0, src.new_w as f32, src.new_h as f32),
            color: st.img.color,
            comps: st.img.comps,
            fmt: None,
            tex: None,
        };

        let (rect, dst) = (st.ref_rect, st.dst_rect);
        self.pass_hook(&mut st.fbos_used, &mut st.img, rect, dst, HookStage::POST_KERNEL, params);

        if use_sigmoid {
            let sigmoid_params = params.sigmoid.unwrap_or_default();
            let sh = self.img_sh(&mut st.img);
            color::unsigmoidize(sh, &sigmoid_params);
        }

        let (rect, dst) = (st.ref_rect, st.dst_rect);
        self.pass_hook(&mut st.fbos_used, &mut st.img, rect, dst, HookStage::SCALED, params);
        Ok(())
    }

    /// Phase 8+9: output color conversion and the write to the target
    /// planes.
    pub(crate) fn pass_output_target(
        &mut self,
        st: &mut PassState,
        params: &RenderParams,
    ) -> RenderResult<()> {
        let image = st.image.clone();
        let target = st.target.clone();

        // Color management
        let mut prelinearized = st.img.color.transfer == Transfer::Linear;
        let mut need_conversion = true;

        let mut need_icc = (image.icc.is_some() || target.icc.is_some())
            && image.icc != target.icc;
        if params.force_icc_lut {
            need_icc |= image.color != target.color;
        }
        need_icc &= !self.disable_icc;

        if let Some(params_lut) = &params.lut {
            let mut lut_in = params_lut.color_in;
            let mut lut_out = params_lut.color_out;
            let kind = params.lut_kind.unwrap_or(LutKind::Native);
            match kind {
                LutKind::Native => {
                    lut_in.merge(&image.color);
                    lut_out.merge(&image.color);
                }
                LutKind::Conversion => {
                    lut_in.merge(&image.color);
                    lut_out.merge(&target.color);
                    // Conversion LUTs take the highest priority
                    need_icc = false;
                    need_conversion = false;
                }
                LutKind::Normalized => {
                    if !prelinearized {
                        let transfer = st.img.color.transfer;
                        let sh = self.img_sh(&mut st.img);
                        color::linearize(sh, transfer);
                        st.img.color.transfer = Transfer::Linear;
                        prelinearized = true;
                    }
                    lut_in.merge(&st.img.color);
                    lut_out.merge(&st.img.color);
                }
            }

            {
                let img_color = st.img.color;
                let sh = self.img_sh(&mut st.img);
                color::color_map(sh, params.color_map.as_ref(), image.color, lut_in, None, prelinearized);
                if kind == LutKind::Normalized {
                    let peak = lut_in.inferred().transfer.nominal_peak();
                    glsl!(sh, "color.rgb *= vec3({:.8});\n", 1.0 / peak);
                }

                let params_lut = params_lut.clone();
                let gpu = self.gpu.clone();
                lut::custom_lut(sh, &params_lut, &mut self.lut_state[LUT_PARAMS], gpu.as_ref());

                if kind == LutKind::Normalized {
                    let peak = lut_out.inferred().transfer.nominal_peak();
                    glsl!(sh, "color.rgb *= vec3({peak:.8});\n");
                }
                if kind != LutKind::Conversion {
                    color::color_map(sh, params.color_map.as_ref(), lut_out, img_color, None, false);
                }
            }
        }

        if need_icc {
            let icc_params = params.icc.unwrap_or_default();
            let src_space = IccColorSpace {
                color: image.color,
                profile: image.icc.as_ref(),
            };
            let dst_space = IccColorSpace {
                color: target.color,
                profile: target.icc.as_ref(),
            };
            let gpu = self.gpu.clone();
            match icc::icc_update(
                &src_space,
                &dst_space,
                &mut self.icc_state,
                &icc_params,
                gpu.as_ref(),
            ) {
                Ok(res) => {
                    let peak_state = self.peak_detect_state.take();
                    let sh = self.img_sh(&mut st.img);
                    // current -> ICC in
                    color::color_map(
                        sh,
                        params.color_map.as_ref(),
                        image.color,
                        res.src_color,
                        peak_state.as_ref(),
                        prelinearized,
                    );
                    // ICC in -> ICC out
                    let state = self.icc_state.as_ref().expect("icc_update set the state");
                    icc::icc_apply(sh, state);
                    // ICC out -> target
                    color::color_map(
                        sh,
                        params.color_map.as_ref(),
                        res.dst_color,
                        target.color,
                        None,
                        false,
                    );
                    self.peak_detect_state = peak_state;
                    need_conversion = false;
                }
                Err(err) => {
                    error!("failed updating ICC state, disabling: {err}");
                    self.disable_icc = true;
                }
            }
        }

        if need_conversion {
            let peak_state = self.peak_detect_state.take();
            let sh = self.img_sh(&mut st.img);
            color::color_map(
                sh,
                params.color_map.as_ref(),
                image.color,
                target.color,
                peak_state.as_ref(),
                prelinearized,
            );
            self.peak_detect_state = peak_state;
        }

        if let Some(cone) = &params.cone {
            let sh = self.img_sh(&mut st.img);
            color::cone_distort(sh, cone);
        }

        let target_lut_kind = guess_lut_kind(&target, true);
        if matches!(
            target_lut_kind,
            Some(LutKind::Normalized) | Some(LutKind::Conversion)
        ) {
            let target_lut = target.lut.clone().expect("lut kind implies a lut");
            let gpu = self.gpu.clone();
            let sh = self.img_sh(&mut st.img);
            lut::custom_lut(sh, &target_lut, &mut self.lut_state[LUT_TARGET], gpu.as_ref());
        }

        // Apply the color scale separately after encoding, so that the
        // intermediate (if any) keeps the full precision
        let mut repr = target.repr;
        let scale = repr.normalize();
        if target_lut_kind != Some(LutKind::Conversion) {
            let sh = self.img_sh(&mut st.img);
            color::encode_color(sh, &repr);
        }
        if target_lut_kind == Some(LutKind::Native) {
            let target_lut = target.lut.clone().expect("lut kind implies a lut");
            let gpu = self.gpu.clone();
            let sh = self.img_sh(&mut st.img);
            lut::custom_lut(sh, &target_lut, &mut self.lut_state[LUT_TARGET], gpu.as_ref());
        }
        let (rect, dst) = (st.ref_rect, st.dst_rect);
        self.pass_hook(&mut st.fbos_used, &mut st.img, rect, dst, HookStage::OUTPUT, params);

        let ref_plane = target.planes[st.dst_ref].clone();
        let ref_params = ref_plane.texture.params().clone();
        let flipped_x = st.dst_rect.x1 < st.dst_rect.x0;
        let flipped_y = st.dst_rect.y1 < st.dst_rect.y0;

        for p in 0..target.planes.len() {
            let plane = target.planes[p].clone();
            let tparams = plane.texture.params().clone();
            let rx = tparams.w as f32 / ref_params.w as f32;
            let ry = tparams.h as f32 / ref_params.h as f32;

            // Integer subsampling ratios only; fractionally subsampled
            // planes are over-rendered
            let rrx = if rx >= 1.0 {
                rx.round()
            } else {
                1.0 / (1.0 / rx).round()
            };
            let rry = if ry >= 1.0 {
                ry.round()
            } else {
                1.0 / (1.0 / ry).round()
            };
            let (sx, sy) = (plane.shift_x, plane.shift_y);

            let mut dst_rectf = RectF {
                x0: (st.dst_rect.x0 as f32 - sx) * rrx,
                y0: (st.dst_rect.y0 as f32 - sy) * rry,
                x1: (st.dst_rect.x1 as f32 - sx) * rrx,
                y1: (st.dst_rect.y1 as f32 - sy) * rry,
            };
            dst_rectf.normalize();

            let rx0 = dst_rectf.x0.floor() as i32;
            let ry0 = dst_rectf.y0.floor() as i32;
            let rx1 = dst_rectf.x1.ceil() as i32;
            let ry1 = dst_rectf.y1.ceil() as i32;

            trace!(
                "subsampled target {p}: {dst_rectf:?} -> ({rx0}, {ry0}, {rx1}, {ry1})"
            );

            let mut sh;
            if target.planes.len() > 1 {
                // Planar output requires sampling from an intermediate
                let Some(tex) = self.img_tex(&mut st.fbos_used, &mut st.img) else {
                    error!(
                        "output requires multiple planes, but intermediates are unavailable; \
                         this combination is unsupported"
                    );
                    return Err(RenderError::Unsupported(
                        "multi-plane output without intermediate textures".into(),
                    ));
                };

                let src = SampleSrc {
                    tex: Some(tex),
                    components: plane.components,
                    new_w: (rx1 - rx0) as u32,
                    new_h: (ry1 - ry0) as u32,
                    rect: RectF {
                        x0: (rx0 as f32 - dst_rectf.x0) / rrx,
                        x1: (rx1 as f32 - dst_rectf.x0) / rrx,
                        y0: (ry0 as f32 - dst_rectf.y0) / rry,
                        y1: (ry1 as f32 - dst_rectf.y0) / rry,
                    },
                    ..Default::default()
                };

                sh = self.dp.begin(false);
                let no_compute = !tparams.storable;
                self.dispatch_sampler(
                    &mut st.fbos_used,
                    &mut sh,
                    SamplerSlot::Dst(p),
                    no_compute,
                    params,
                    &src,
                );
                glsl!(sh, "vec4 orig_color = color;\n");
            } else {
                // Single plane: reuse the img shader directly, unless it's
                // incompatible with the target capabilities
                let is_compute = st.img.sh.as_ref().map_or(false, |s| s.is_compute());
                if st.img.sh.is_none() || (is_compute && !tparams.storable) {
                    if st.img.sh.is_some() {
                        if self.img_tex(&mut st.fbos_used, &mut st.img).is_none() {
                            error!(
                                "rendering requires compute shaders, but the target is not \
                                 storable and intermediates are unavailable"
                            );
                            return Err(RenderError::Unsupported(
                                "compute output without storable target".into(),
                            ));
                        }
                    }
                    self.img_sh(&mut st.img);
                }
                sh = st.img.sh.take().expect("img holds a shader");
            }

            glsl!(sh, "color *= vec4(1.0 / {scale:.8});\n");
            swizzle_color(&mut sh, plane.components, &plane.component_mapping);

            if let Some(dither_params) = &params.dither {
                // Dithering makes no sense for >16-bit outputs unless forced
                let depth = repr.bits.sample_depth;
                if depth > 0 && (depth <= 16 || params.force_dither) {
                    let gpu = self.gpu.clone();
                    dither::dither(
                        &mut sh,
                        depth,
                        &mut self.dither_state,
                        dither_params,
                        gpu.as_ref(),
                    );
                }
            }

            let rect = Rect {
                x0: if flipped_x { rx1 } else { rx0 },
                y0: if flipped_y { ry1 } else { ry0 },
                x1: if flipped_x { rx0 } else { rx1 },
                y1: if flipped_y { ry0 } else { ry1 },
            };
            self.dp
                .finish(DispatchParams {
                    shader: sh,
                    target: plane.texture.clone(),
                    rect,
                    blend: params.blend,
                    timer: None,
                })
                .map_err(|err| {
                    error!("failed dispatching target pass: {err}");
                    RenderError::from(err)
                })?;

            // Overlays that couldn't be drawn onto the intermediate
            // (missing intermediates) go directly onto the target planes
            if !image.overlays.is_empty() && self.fbofmt(params, st.img.comps).is_none() {
                let scale_x = dst_rectf.w() / image.crop.w();
                let scale_y = dst_rectf.h() / image.crop.h();
                let iscale = Transform2x2 {
                    mat: [scale_x, scale_y],
                    c: [
                        dst_rectf.x0 - image.crop.x0 * scale_x,
                        dst_rectf.y0 - image.crop.y0 * scale_y,
                    ],
                };
                let overlays = image.overlays.clone();
                self.draw_overlays(
                    &mut st.fbos_used,
                    &plane.texture,
                    plane.components,
                    Some(&plane.component_mapping),
                    &overlays,
                    target.color,
                    target.repr,
                    false,
                    Some(iscale),
                    params,
                );
            }

            let tscale = Transform2x2 {
                mat: [rrx, rry],
                c: [-sx, -sy],
            };
            let overlays = target.overlays.clone();
            self.draw_overlays(
                &mut st.fbos_used,
                &plane.texture,
                plane.components,
                Some(&plane.component_mapping),
                &overlays,
                target.color,
                target.repr,
                false,
                Some(tscale),
                params,
            );
        }

        st.img = Img::default();
        Ok(())
    }

    /// Draws overlays onto a target, blending where supported.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn draw_overlays(
        &mut self,
        fbos_used: &mut Vec<bool>,
        fbo: &Arc<dyn Texture>,
        comps: usize,
        comp_map: Option<&[Channel; 4]>,
        overlays: &[Overlay],
        color_space: glint_core::ColorSpace,
        repr: glint_core::ColorRepr,
        use_sigmoid: bool,
        scale: Option<Transform2x2>,
        params: &RenderParams,
    ) {
        if overlays.is_empty() || self.disable_overlay {
            return;
        }

        let caps = fbo.params().format.caps;
        if !self.disable_blending && !caps.contains(FormatCaps::BLENDABLE) {
            warn_blending();
            self.disable_blending = true;
        }

        for (n, ol) in overlays.iter().enumerate() {
            let plane = &ol.plane;
            let tex = plane.texture.clone();

            let mut rect = ol.rect;
            if let Some(tf) = &scale {
                let (x0, y0) = tf.apply(rect.x0 as f32, rect.y0 as f32);
                let (x1, y1) = tf.apply(rect.x1 as f32, rect.y1 as f32);
                rect = Rect::new(
                    x0.round() as i32,
                    y0.round() as i32,
                    x1.round() as i32,
                    y1.round() as i32,
                );
            }

            let src = SampleSrc {
                tex: Some(tex.clone()),
                components: if ol.mode == OverlayMode::Monochrome {
                    1
                } else {
                    plane.components
                },
                new_w: rect.w().unsigned_abs(),
                new_h: rect.h().unsigned_abs(),
                rect: RectF {
                    x0: -plane.shift_x,
                    y0: -plane.shift_y,
                    x1: tex.params().w as f32 - plane.shift_x,
                    y1: tex.params().h as f32 - plane.shift_y,
                },
                ..Default::default()
            };

            let mut sh = self.dp.begin(false);
            let no_compute = !fbo.params().storable;
            let slot = if params.disable_overlay_sampling {
                SamplerSlot::None
            } else {
                SamplerSlot::Osd(n)
            };
            self.dispatch_sampler(fbos_used, &mut sh, slot, no_compute, params, &src);

            glsl!(sh, "vec4 osd_color;\n");
            for c in 0..src.components {
                if let Some(idx) = plane.component_mapping[c].index() {
                    glsl!(sh, "osd_color[{idx}] = color[{c}];\n");
                }
            }
            match ol.mode {
                OverlayMode::Normal => glsl!(sh, "color = osd_color;\n"),
                OverlayMode::Monochrome => {
                    glsl!(sh, "color.a = osd_color[0];\n");
                    let base = sh.var_vec3("base_color", ol.base_color, true);
                    glsl!(sh, "color.rgb = {base};\n");
                }
            }

            let mut ol_repr = ol.repr;
            let scale_norm = ol_repr.normalize();
            glsl!(sh, "color *= vec4({scale_norm:.8});\n");
            color::decode_color(&mut sh, &mut ol_repr);
            color::color_map(&mut sh, params.color_map.as_ref(), ol.color, color_space, None, false);

            if use_sigmoid {
                let sigmoid_params = params.sigmoid.unwrap_or_default();
                color::sigmoidize(&mut sh, &sigmoid_params);
            }

            color::encode_color(&mut sh, &repr);
            if let Some(map) = comp_map {
                swizzle_color(&mut sh, comps, map);
            }

            let blend = if self.disable_blending {
                None
            } else {
                Some(BlendParams::ALPHA_OVERLAY)
            };
            if let Err(err) = self.dp.finish(DispatchParams {
                shader: sh,
                target: fbo.clone(),
                rect,
                blend,
                timer: None,
            }) {
                error!("failed rendering overlay texture, disabling overlays: {err}");
                self.disable_overlay = true;
                return;
            }
        }
    }
}

/// A 2D scale + offset transform.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Transform2x2 {
    /// Diagonal scale.
    pub mat: [f32; 2],
    /// Offset.
    pub c: [f32; 2],
}

impl Transform2x2 {
    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (self.mat[0] * x + self.c[0], self.mat[1] * y + self.c[1])
    }
}

/// Reorders the color channels to match a plane's component mapping.
fn swizzle_color(
    sh: &mut glint_dispatch::ShaderBuilder,
    comps: usize,
    comp_map: &[Channel; 4],
) {
    let orig = sh.fresh("orig_color");
    glsl!(sh, "vec4 {orig} = color;\ncolor = vec4(0.0);\n");
    for c in 0..comps {
        if let Some(idx) = comp_map[c].index() {
            glsl!(sh, "color[{c}] = {orig}[{idx}];\n");
        }
    }
}

fn warn_blending() {
    tracing::warn!(
        "trying to draw an overlay to a non-blendable target; alpha blending \
         is disabled, results may be incorrect"
    );
}
