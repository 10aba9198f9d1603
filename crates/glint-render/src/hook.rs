//! User shader hooks.
//!
//! Hooks are user-supplied transformations invoked at named pipeline
//! stages. A hook receives the in-flight image in the form it asked for
//! (a texture, or the shader under construction) and may transform it in
//! place, replace it, or do nothing.

use std::sync::Arc;

use bitflags::bitflags;

use glint_core::{ColorRepr, ColorSpace, Rect, RectF};
use glint_dispatch::{Dispatch, ShaderBuilder};
use glint_gpu::Texture;

use crate::RenderResult;

bitflags! {
    /// Pipeline stages a hook can attach to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HookStage: u32 {
        /// Per-plane inputs, before merging.
        const RGB_INPUT    = 1 << 0;
        const LUMA_INPUT   = 1 << 1;
        const CHROMA_INPUT = 1 << 2;
        const ALPHA_INPUT  = 1 << 3;
        const XYZ_INPUT    = 1 << 4;

        /// The merged frame, in its native representation.
        const NATIVE       = 1 << 5;
        /// After decoding to RGB.
        const RGB          = 1 << 6;
        /// After linearization (main scaler only).
        const LINEAR       = 1 << 7;
        /// After sigmoidization.
        const SIGMOID      = 1 << 8;
        /// Before overlays are drawn onto the intermediate texture.
        const PRE_OVERLAY  = 1 << 9;
        /// Right before the main scaler kernel.
        const PRE_KERNEL   = 1 << 10;
        /// Right after the main scaler kernel.
        const POST_KERNEL  = 1 << 11;
        /// After scaling and un-sigmoidization.
        const SCALED       = 1 << 12;
        /// After encoding into the target representation.
        const OUTPUT       = 1 << 13;
    }
}

impl HookStage {
    /// Whether hooks at this stage may change the image dimensions.
    pub fn resizable(self) -> bool {
        const RESIZABLE: HookStage = HookStage::RGB_INPUT
            .union(HookStage::LUMA_INPUT)
            .union(HookStage::CHROMA_INPUT)
            .union(HookStage::ALPHA_INPUT)
            .union(HookStage::XYZ_INPUT)
            .union(HookStage::NATIVE)
            .union(HookStage::RGB);
        RESIZABLE.contains(self)
    }
}

/// The form a hook wants its input in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSig {
    /// No input; the hook only observes.
    None,
    /// A materialized texture.
    Tex,
    /// The shader under construction, to be extended in place.
    Color,
}

/// Everything a hook gets to see and use.
pub struct HookParams<'a> {
    /// The dispatch engine, for running intermediate passes.
    pub dispatch: &'a mut Dispatch,
    /// Allocates an intermediate texture from the renderer's pool.
    pub get_tex: &'a mut dyn FnMut(u32, u32) -> Option<Arc<dyn Texture>>,

    pub stage: HookStage,
    /// Set for [`HookSig::Tex`] hooks.
    pub tex: Option<Arc<dyn Texture>>,
    /// Set for [`HookSig::Color`] hooks; extend it in place.
    pub sh: Option<&'a mut ShaderBuilder>,

    /// Effective size of the current image.
    pub w: u32,
    pub h: u32,
    /// Source region of the current image, in its own pixel space.
    pub rect: RectF,
    pub repr: ColorRepr,
    pub color: ColorSpace,
    pub components: usize,

    /// The overall source rect of the rendering pass.
    pub src_rect: RectF,
    /// The overall destination rect of the rendering pass.
    pub dst_rect: Rect,
}

/// What a hook did.
pub enum HookResult {
    /// Nothing (or an in-place extension of the input shader).
    None,
    /// Replaces the image with a texture.
    Tex {
        tex: Arc<dyn Texture>,
        rect: RectF,
        repr: ColorRepr,
        color: ColorSpace,
        components: usize,
    },
    /// Replaces the image with a new shader of the given output size.
    Color {
        sh: ShaderBuilder,
        w: u32,
        h: u32,
        rect: RectF,
        repr: ColorRepr,
        color: ColorSpace,
        components: usize,
    },
}

/// A user hook. Implementations are compared by identity for parameter
/// hashing purposes.
pub trait Hook {
    /// Stages this hook wants to run at.
    fn stages(&self) -> HookStage;

    /// The input form this hook requires.
    fn signature(&self) -> HookSig {
        HookSig::Color
    }

    /// Called once per frame before any stage fires.
    fn reset(&self) {}

    fn hook(&self, params: HookParams<'_>) -> RenderResult<HookResult>;
}
