//! Frame mixing: temporal interpolation over a cache of pre-rendered
//! frames.
//!
//! Each input frame is rendered once into a cached intermediate texture
//! (keyed by its signature and the parameter hash) and the output is a
//! weighted mix of the cached textures. The cache is garbage collected by
//! mark-and-sweep: entries not referenced by the current mix call return
//! their textures to a small reuse pool.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{error, trace};

use glint_core::{AlphaMode, ColorLevels, ColorRepr, ColorSpace, ColorSystem, RectF};
use glint_dispatch::{glsl, ShaderSig};
use glint_gpu::{FormatCaps, SampleMode, TexParams, Texture};

use crate::frame::{Channel, Frame, IccProfile, Plane};
use crate::img::Img;
use crate::params::{params_hash, RenderParams};
use crate::renderer::Renderer;
use crate::shaders::color;
use crate::{RenderError, RenderResult};

/// Weights below this threshold are dropped from the mix.
const WEIGHT_CUTOFF: f32 = 1e-3;

const MAX_MIX_FRAMES: usize = 16;

/// A cached pre-rendered frame.
pub(crate) struct CachedFrame {
    pub signature: u64,
    pub params_hash: u64,
    pub color: ColorSpace,
    pub icc: Option<IccProfile>,
    pub tex: Option<Arc<dyn Texture>>,
    /// Mark for the mark-and-sweep GC.
    pub evict: bool,
}

/// A bundle of input frames for temporal mixing.
///
/// Timestamps are in vsync units relative to the current output moment:
/// negative = past, positive = future. They must be monotonically
/// non-decreasing.
pub struct FrameMix<'a> {
    pub frames: &'a [Frame],
    /// Opaque per-frame identity, stable for a frame's lifetime.
    pub signatures: &'a [u64],
    pub timestamps: &'a [f32],
    /// Estimated duration of one vsync, in the same units.
    pub vsync_duration: f32,
}

impl Renderer {
    /// Renders a mix of temporally neighbouring frames to the target.
    /// Falls back to single-frame rendering when mixing is disabled or
    /// fails.
    pub fn render_image_mix(
        &mut self,
        mix: &FrameMix<'_>,
        target: &Frame,
        params: &RenderParams,
    ) -> RenderResult<()> {
        let hash = params_hash(params);

        if mix.frames.is_empty()
            || mix.frames.len() != mix.signatures.len()
            || mix.frames.len() != mix.timestamps.len()
        {
            return Err(RenderError::Validation(
                "frame mix needs equally many frames, signatures and timestamps".into(),
            ));
        }
        for pair in mix.timestamps.windows(2) {
            if pair[0] > pair[1] {
                return Err(RenderError::Validation(
                    "frame mix timestamps must be monotonically non-decreasing".into(),
                ));
            }
        }

        // The canonical reference is the frame nearest to what an
        // idealized zero-order-hold display would currently show
        let mut current = 0;
        for (i, &pts) in mix.timestamps.iter().enumerate() {
            if pts <= 0.0 {
                current = i;
            }
        }
        let current_frame = mix.frames[current].clone();

        if params.frame_mixer.is_none() || self.disable_mixing || self.fbofmt(params, 4).is_none()
        {
            return self.render_image(&current_frame, target, params);
        }

        match self.render_mix_inner(mix, &current_frame, target, params, hash) {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("frame mixing failed, disabling: {err}");
                self.disable_mixing = true;
                self.render_image(&current_frame, target, params)
            }
        }
    }

    fn render_mix_inner(
        &mut self,
        mix: &FrameMix<'_>,
        current_frame: &Frame,
        target: &Frame,
        params: &RenderParams,
        hash: u64,
    ) -> RenderResult<()> {
        let mixer = params.frame_mixer.expect("mixing requires a mixer");

        let mut st = self.new_pass_state(current_frame.clone(), target.clone());
        self.pass_infer_state(&mut st, false)?;

        let out_w = st.dst_rect.w().unsigned_abs();
        let out_h = st.dst_rect.h().unsigned_abs();

        // The space to mix in: the current frame's color space, as RGB
        let mix_color = st.image.color;
        let mix_repr = ColorRepr {
            sys: ColorSystem::Rgb,
            levels: ColorLevels::Full,
            alpha: AlphaMode::Premultiplied,
            bits: Default::default(),
        };

        // Mark everything for eviction; the scan below unmarks survivors
        for f in &mut self.frames {
            f.evict = true;
        }

        let mut entries: SmallVec<[(usize, f32); MAX_MIX_FRAMES]> = SmallVec::new();
        let mut wsum = 0.0f32;

        for (i, frame) in mix.frames.iter().enumerate() {
            let sig = mix.signatures[i];
            let mut pts = mix.timestamps[i];
            trace!("considering frame with signature {sig:#x}, pts {pts}");

            let weight = if let Some(kernel) = mixer.kernel {
                if pts.abs() >= kernel.radius {
                    trace!("  -> skipping: outside filter radius ({})", kernel.radius);
                    continue;
                }
                crate::filter::filter_sample(mixer, pts)
            } else {
                // Oversample: weight by the visible fraction of the vsync
                let end = mix
                    .timestamps
                    .get(i + 1)
                    .copied()
                    .unwrap_or(f32::INFINITY);
                if pts > mix.vsync_duration || end < 0.0 {
                    trace!("  -> skipping: no intersection with vsync");
                    continue;
                }
                pts = pts.max(0.0);
                let end = end.min(mix.vsync_duration);
                debug_assert!(end >= pts);
                (end - pts) / mix.vsync_duration
            };

            let mut cache_idx = self.frames.iter().position(|f| f.signature == sig);
            if let Some(idx) = cache_idx {
                self.frames[idx].evict = false;
            }

            // Drop negligible contributions, but only after unmarking, so
            // these frames don't get evicted just yet
            if weight.abs() <= WEIGHT_CUTOFF {
                trace!("  -> skipping: weight ({weight}) below threshold");
                continue;
            }

            if cache_idx.is_none() {
                self.frames.push(CachedFrame {
                    signature: sig,
                    params_hash: 0,
                    color: frame.color,
                    icc: frame.icc.clone(),
                    tex: None,
                    evict: false,
                });
                cache_idx = Some(self.frames.len() - 1);
            }
            let idx = cache_idx.unwrap();

            // Reuse blindly if the caller asked for it, or if the entry is
            // compatible with the current output
            let can_reuse = {
                let f = &self.frames[idx];
                f.tex.as_ref().is_some_and(|tex| {
                    params.preserve_mixing_cache
                        || (tex.params().w == out_w
                            && tex.params().h == out_h
                            && f.params_hash == hash)
                })
            };

            if !can_reuse {
                trace!("  -> cached texture missing or invalid, (re)creating");
                self.repopulate_cache_entry(idx, frame, out_w, out_h, params)?;
                self.frames[idx].params_hash = hash;
            }

            entries.push((idx, weight));
            wsum += weight;
        }

        // Sweep: evict whatever stayed marked
        let mut i = 0;
        while i < self.frames.len() {
            if self.frames[i].evict {
                trace!(
                    "evicting frame with signature {:#x} from cache",
                    self.frames[i].signature
                );
                let evicted = self.frames.remove(i);
                if let Some(tex) = evicted.tex {
                    self.frame_fbos.push(tex);
                }
                // Eviction shifts later indices down
                for entry in &mut entries {
                    if entry.0 > i {
                        entry.0 -= 1;
                    }
                }
            } else {
                i += 1;
            }
        }

        if entries.is_empty() || wsum <= 0.0 {
            // Nothing in the filter footprint; render the current frame
            // directly without latching mixing off
            trace!("no frames with non-negligible weight, falling back");
            return self.render_image(current_frame, target, params);
        }

        // Sample and mix the output color
        let mut sh = self.dp.begin(false);
        sh.require(ShaderSig::None, out_w, out_h);
        glsl!(
            sh,
            "vec4 color;\n\
             // mix frames\n\
             vec4 mix_color = vec4(0.0);\n"
        );

        for &(idx, weight) in &entries {
            let (tex, frame_color) = {
                let f = &self.frames[idx];
                (f.tex.clone().expect("cache entry was populated"), f.color)
            };
            let full = RectF::new(0.0, 0.0, tex.params().w as f32, tex.params().h as f32);
            let (tex_ident, pos) = sh.bind_tex_pos("frame", tex, full);
            glsl!(sh, "color = texture({tex_ident}, {pos});\n");

            // Map from the cached frame's native space into the common mix
            // space. Differences in ICC profiles are deliberately ignored.
            color::color_map(&mut sh, None, frame_color, mix_color, None, false);

            let w = sh.var_f32("weight", weight / wsum, true);
            glsl!(sh, "mix_color += {w} * color;\n");
        }
        glsl!(sh, "color = mix_color;\n");

        st.img = Img {
            sh: Some(sh),
            w: out_w,
            h: out_h,
            comps: 4,
            color: mix_color,
            repr: mix_repr,
            rect: RectF::new(0.0, 0.0, out_w as f32, out_h as f32),
            fmt: None,
            tex: None,
        };

        self.pass_output_target(&mut st, params)
    }

    /// (Re)creates a cache entry's texture and renders the frame into it.
    fn repopulate_cache_entry(
        &mut self,
        idx: usize,
        frame: &Frame,
        out_w: u32,
        out_h: u32,
        params: &RenderParams,
    ) -> RenderResult<()> {
        let fmt = self
            .fbofmt(params, 4)
            .ok_or_else(|| RenderError::Unsupported("no intermediate format for mixing".into()))?;

        let matching = |tex: &Arc<dyn Texture>| {
            let p = tex.params();
            p.w == out_w && p.h == out_h && p.format.is(&fmt)
        };

        let need_create = !self.frames[idx].tex.as_ref().is_some_and(matching);
        if need_create {
            // Prefer recycling an evicted mixing texture
            let recycled = self.frame_fbos.iter().position(|t| matching(t));
            let tex = match recycled {
                Some(pos) => {
                    let tex = self.frame_fbos.swap_remove(pos);
                    self.gpu.tex_invalidate(&tex);
                    tex
                }
                None => {
                    let tex_params = TexParams {
                        renderable: true,
                        storable: fmt.caps.contains(FormatCaps::STORABLE),
                        sample_mode: if fmt.caps.contains(FormatCaps::LINEAR) {
                            SampleMode::Linear
                        } else {
                            SampleMode::Nearest
                        },
                        ..TexParams::new_2d(out_w, out_h, fmt.clone())
                    };
                    self.gpu.tex_create(&tex_params).map_err(|err| {
                        error!("could not create intermediate texture for frame mixing: {err}");
                        RenderError::from(err)
                    })?
                }
            };
            self.frames[idx].tex = Some(tex);
        }

        let tex = self.frames[idx].tex.clone().expect("texture was just set");

        // Cached frames are stored as RGB in their native color space,
        // avoiding precision loss from unnecessary space round-trips. The
        // ICC profile is explicitly stripped; mixing ignores it.
        let mut image = frame.clone();
        image.icc = None;

        let inter_target = Frame {
            planes: smallvec::smallvec![Plane {
                texture: tex,
                components: fmt.num_components,
                component_mapping: [Channel::R, Channel::G, Channel::B, Channel::A],
                shift_x: 0.0,
                shift_y: 0.0,
            }],
            repr: ColorRepr {
                sys: ColorSystem::Rgb,
                levels: ColorLevels::Full,
                alpha: AlphaMode::Premultiplied,
                bits: Default::default(),
            },
            color: self.frames[idx].color,
            ..Default::default()
        };

        self.render_image(&image, &inter_target, params).map_err(|err| {
            error!("could not render image for frame mixing: {err}");
            err
        })
    }
}
