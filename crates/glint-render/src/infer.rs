//! Frame validation, metadata inference and the top-level render entry.

use tracing::error;

use glint_core::{Primaries, Rect, RectF};
use glint_gpu::FormatType;

use crate::frame::{detect_plane_type, Frame, Plane, PlaneType};
use crate::img::Img;
use crate::params::RenderParams;
use crate::renderer::{PassState, Renderer, MAX_PLANES};
use crate::{RenderError, RenderResult};

macro_rules! require {
    ($cond:expr, $($msg:tt)*) => {
        if !($cond) {
            let reason = format!($($msg)*);
            error!("validation failed: {reason}");
            return Err(RenderError::Validation(reason));
        }
    };
}

fn validate_plane(plane: &Plane, need_renderable: bool, what: &str) -> RenderResult<()> {
    let params = plane.texture.params();
    require!(
        params.sampleable || need_renderable,
        "{what} plane texture is not sampleable"
    );
    if need_renderable {
        require!(params.renderable, "{what} plane texture is not renderable");
    }
    require!(
        plane.components >= 1 && plane.components <= 4,
        "{what} plane has invalid component count {}",
        plane.components
    );
    Ok(())
}

/// Basic validity checks on incoming frames, to catch obvious API misuse.
/// Not exhaustive; the goal is catching common logic bugs, not memory
/// corruption.
fn validate_structs(image: &Frame, target: &Frame) -> RenderResult<()> {
    // Rendering from/to a frame with no planes is technically
    // representable but surely an error worth catching
    require!(
        !image.planes.is_empty() && image.planes.len() <= MAX_PLANES,
        "image has {} planes",
        image.planes.len()
    );
    require!(
        !target.planes.is_empty() && target.planes.len() <= MAX_PLANES,
        "target has {} planes",
        target.planes.len()
    );
    for plane in &image.planes {
        validate_plane(plane, false, "image")?;
    }
    for plane in &target.planes {
        validate_plane(plane, true, "target")?;
    }

    // A crop that is zero-area on one axis but not the other is rejected
    // rather than silently replaced by the full texture size
    let (src_w, src_h) = (image.crop.w(), image.crop.h());
    require!(
        (src_w == 0.0) == (src_h == 0.0),
        "image crop is zero-area on exactly one axis"
    );
    let (dst_w, dst_h) = (target.crop.w(), target.crop.h());
    require!(
        (dst_w == 0.0) == (dst_h == 0.0),
        "target crop is zero-area on exactly one axis"
    );

    for overlay in image.overlays.iter().chain(&target.overlays) {
        validate_plane(&overlay.plane, false, "overlay")?;
        require!(
            overlay.rect.w() != 0 && overlay.rect.h() != 0,
            "overlay rect is zero-area"
        );
    }

    Ok(())
}

/// Finds the reference planes and normalizes the rendering rects.
fn fix_refs_and_rects(st: &mut PassState, adjust_rects: bool) -> RenderResult<()> {
    // Find the reference planes and plane types
    for (i, plane) in st.image.planes.iter().enumerate() {
        st.src_type[i] = detect_plane_type(plane, &st.image.repr);
        if st.src_type[i].is_ref() {
            st.src_ref = i;
        }
    }
    for (i, plane) in st.target.planes.iter().enumerate() {
        st.dst_type[i] = detect_plane_type(plane, &st.target.repr);
        if st.dst_type[i].is_ref() {
            st.dst_ref = i;
        }
    }
    require!(
        st.src_type[st.src_ref].is_ref(),
        "image has no plane carrying the reference sample grid"
    );
    require!(
        st.dst_type[st.dst_ref].is_ref(),
        "target has no plane carrying the reference sample grid"
    );

    let src_params = st.image.planes[st.src_ref].texture.params().clone();
    let dst_params = st.target.planes[st.dst_ref].texture.params().clone();

    // Unset crops default to the full reference texture
    if st.image.crop.is_zero() {
        st.image.crop = RectF::new(0.0, 0.0, src_params.w as f32, src_params.h as f32);
    }
    if st.target.crop.is_zero() {
        st.target.crop = RectF::new(0.0, 0.0, dst_params.w as f32, dst_params.h as f32);
    }

    if adjust_rects {
        let src = &mut st.image.crop;
        let dst = &mut st.target.crop;

        // Keep track of whether the end-to-end rendering is flipped
        let flipped_x = (src.x0 > src.x1) != (dst.x0 > dst.x1);
        let flipped_y = (src.y0 > src.y1) != (dst.y0 > dst.y1);

        src.normalize();
        dst.normalize();

        // Round the output rect and clip it to the framebuffer
        let rx0 = dst.x0.max(0.0).round();
        let ry0 = dst.y0.max(0.0).round();
        let rx1 = dst.x1.min(dst_params.w as f32).round();
        let ry1 = dst.y1.min(dst_params.h as f32).round();

        // Adjust the src rect to the rounded crop proportionally
        let scale_x = src.w() / dst.w();
        let scale_y = src.h() / dst.h();
        let (base_x, base_y) = (src.x0, src.y0);
        src.x0 = base_x + (rx0 - dst.x0) * scale_x;
        src.x1 = base_x + (rx1 - dst.x0) * scale_x;
        src.y0 = base_y + (ry0 - dst.y0) * scale_y;
        src.y1 = base_y + (ry1 - dst.y0) * scale_y;

        // Re-apply the flip to the (rounded) dst rect rather than the src,
        // which keeps compute-based polar samplers viable
        *dst = RectF {
            x0: if flipped_x { rx1 } else { rx0 },
            y0: if flipped_y { ry1 } else { ry0 },
            x1: if flipped_x { rx0 } else { rx1 },
            y1: if flipped_y { ry0 } else { ry1 },
        };
    }

    st.ref_rect = st.image.crop;
    st.dst_rect = Rect::new(
        st.target.crop.x0 as i32,
        st.target.crop.y0 as i32,
        st.target.crop.x1 as i32,
        st.target.crop.y1 as i32,
    );
    Ok(())
}

/// Infers missing color metadata from the reference texture.
fn fix_color_space(frame: &mut Frame) {
    let Some(ref_plane) = frame.ref_plane() else {
        return;
    };
    let params = ref_plane.texture.params().clone();

    // Guess unknown primaries from the resolution
    if frame.color.primaries == Primaries::Unknown {
        frame.color.primaries = Primaries::guess(params.w, params.h);
    }
    frame.color.infer();

    // For UNORM formats the sampled bit depth follows from the texture;
    // for other types the logic doesn't work out, so leave the metadata
    // alone unless the user filled it in
    let bits = &mut frame.repr.bits;
    if bits.sample_depth == 0 && params.format.ty == FormatType::Unorm {
        // The first component's depth is canonical
        bits.sample_depth = params.format.depth();

        if bits.color_depth == 0 {
            bits.color_depth = bits.sample_depth;
        }
        bits.color_depth = bits.color_depth.min(bits.sample_depth);
        bits.bit_shift += bits.sample_depth - bits.color_depth;
    }
}

impl Renderer {
    pub(crate) fn pass_infer_state(
        &self,
        st: &mut PassState,
        adjust_rects: bool,
    ) -> RenderResult<()> {
        validate_structs(&st.image, &st.target)?;
        fix_refs_and_rects(st, adjust_rects)?;
        fix_color_space(&mut st.image);

        // Infer the target color space from the image's
        let image_color = st.image.color;
        if st.target.color.primaries == Primaries::Unknown {
            st.target.color.primaries = image_color.primaries;
        }
        if st.target.color.transfer == glint_core::Transfer::Unknown {
            st.target.color.transfer = image_color.transfer;
        }
        fix_color_space(&mut st.target);
        Ok(())
    }

    pub(crate) fn new_pass_state(&self, image: Frame, target: Frame) -> PassState {
        PassState {
            img: Img::default(),
            ref_rect: RectF::default(),
            dst_rect: Rect::default(),
            image,
            target,
            src_type: [PlaneType::Invalid; MAX_PLANES],
            dst_type: [PlaneType::Invalid; MAX_PLANES],
            src_ref: 0,
            dst_ref: 0,
            fbos_used: Vec::new(),
        }
    }

    /// Renders one image to one target, planning and executing the full
    /// pass sequence. See the crate docs for the phase breakdown.
    pub fn render_image(
        &mut self,
        image: &Frame,
        target: &Frame,
        params: &RenderParams,
    ) -> RenderResult<()> {
        if self.gpu.is_failed() {
            return Err(RenderError::Gpu(glint_gpu::GpuError::DeviceLost));
        }

        let mut st = self.new_pass_state(image.clone(), target.clone());
        self.pass_infer_state(&mut st, true)?;

        self.dp.reset_frame();
        for hook in &params.hooks {
            hook.reset();
        }

        let result = self
            .pass_read_image(&mut st, params)
            .and_then(|()| self.pass_scale_main(&mut st, params))
            .and_then(|()| self.pass_output_target(&mut st, params));

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(sh) = st.img.sh.take() {
                    self.dp.abort(sh);
                }
                error!("failed rendering image: {err}");
                Err(err)
            }
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // Quiesce pending GPU work before the pools and caches release
        // their textures
        self.gpu.finish();
    }
}
