//! The in-flight image.
//!
//! While a frame works its way through the pipeline it is either an
//! unfinished shader (producing the image when dispatched) or a texture
//! (holding an already materialized intermediate), never both. The
//! renderer swaps between the two states through its `img_tex` /
//! `img_sh` operations: materializing dispatches the shader into a pool
//! texture, sampling begins a new shader that reads the texture.

use std::sync::Arc;

use glint_core::{ColorRepr, ColorSpace, RectF};
use glint_dispatch::ShaderBuilder;
use glint_gpu::{Format, Texture};

/// An image in the process of being rendered. See the module docs.
#[derive(Default)]
pub struct Img {
    /// Effective size, always set.
    pub w: u32,
    pub h: u32,

    /// Recommended materialization format; falls back to the renderer's
    /// intermediate format when unset. Only meaningful in shader state.
    pub fmt: Option<Arc<Format>>,

    /// Exactly one of these two is set.
    pub sh: Option<ShaderBuilder>,
    pub tex: Option<Arc<dyn Texture>>,

    /// Current effective source area, to be consumed by the next sampler.
    pub rect: RectF,

    pub repr: ColorRepr,
    pub color: ColorSpace,
    /// Effective component count, 1..4.
    pub comps: usize,
}

impl Img {
    /// An image backed by a texture.
    pub fn from_tex(tex: Arc<dyn Texture>, repr: ColorRepr, color: ColorSpace, comps: usize) -> Self {
        let params = tex.params();
        Self {
            w: params.w,
            h: params.h,
            fmt: None,
            sh: None,
            tex: Some(tex),
            rect: RectF::default(),
            repr,
            color,
            comps,
        }
    }

    /// An image backed by an unfinished shader.
    pub fn from_sh(
        sh: ShaderBuilder,
        w: u32,
        h: u32,
        repr: ColorRepr,
        color: ColorSpace,
        comps: usize,
    ) -> Self {
        Self {
            w,
            h,
            fmt: None,
            sh: Some(sh),
            tex: None,
            rect: RectF::default(),
            repr,
            color,
            comps,
        }
    }

    /// Debug check of the exclusive-state invariant.
    pub fn check(&self) {
        debug_assert!(
            self.sh.is_some() != self.tex.is_some(),
            "img must hold exactly one of shader/texture"
        );
    }
}
