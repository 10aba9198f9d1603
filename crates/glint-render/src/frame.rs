//! Frames, planes and their metadata.
//!
//! A [`Frame`] is the unit the renderer consumes and produces: an ordered
//! list of planes (one texture each) plus everything needed to interpret
//! them (color representation and space, optional ICC profile, optional
//! LUT, overlays, a crop).

use std::sync::Arc;

use smallvec::SmallVec;

use glint_core::{ColorRepr, ColorSpace, ColorSystem, Rect, RectF};
use glint_gpu::{Gpu, GpuResult, Texture};

/// Logical channel a texture component maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Channel {
    /// Unmapped; the component is ignored.
    #[default]
    None,
    Y,
    Cb,
    Cr,
    R,
    G,
    B,
    A,
}

impl Channel {
    /// Canonical slot of this channel in the working color vector
    /// (Y/R -> 0, Cb/G -> 1, Cr/B -> 2, A -> 3), or `None` for unmapped.
    pub fn index(self) -> Option<usize> {
        match self {
            Self::Y | Self::R => Some(0),
            Self::Cb | Self::G => Some(1),
            Self::Cr | Self::B => Some(2),
            Self::A => Some(3),
            Self::None => None,
        }
    }
}

/// One texture of a (possibly multi-texture) frame.
#[derive(Clone)]
pub struct Plane {
    pub texture: Arc<dyn Texture>,
    /// Number of meaningful components, 1..4.
    pub components: usize,
    /// Maps texture component index -> logical channel.
    pub component_mapping: [Channel; 4],
    /// Sub-pixel offset of this plane's sample grid relative to the
    /// reference plane (chroma siting).
    pub shift_x: f32,
    pub shift_y: f32,
}

impl Plane {
    /// A plane covering all of `texture`'s components with the identity
    /// RGBA mapping.
    pub fn from_texture(texture: Arc<dyn Texture>) -> Self {
        let components = texture.params().format.num_components;
        Self {
            texture,
            components,
            component_mapping: [Channel::R, Channel::G, Channel::B, Channel::A],
            shift_x: 0.0,
            shift_y: 0.0,
        }
    }
}

/// Semantic type of a plane, ordered by increasing reference priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PlaneType {
    #[default]
    Invalid,
    Alpha,
    Chroma,
    Luma,
    Rgb,
    Xyz,
}

impl PlaneType {
    /// Whether planes of this type can carry the reference sample grid.
    pub fn is_ref(self) -> bool {
        matches!(self, Self::Luma | Self::Rgb | Self::Xyz)
    }
}

/// Derives a plane's type from its component mapping and the frame's color
/// system.
pub fn detect_plane_type(plane: &Plane, repr: &ColorRepr) -> PlaneType {
    if repr.sys.is_ycbcr_like() {
        let mut ty = PlaneType::Invalid;
        for c in 0..plane.components {
            match plane.component_mapping[c] {
                Channel::Y => ty = ty.max(PlaneType::Luma),
                Channel::A => ty = ty.max(PlaneType::Alpha),
                Channel::Cb | Channel::Cr => ty = ty.max(PlaneType::Chroma),
                _ => {}
            }
        }
        return ty;
    }

    // Exclusive alpha plane
    if plane.components == 1 && plane.component_mapping[0] == Channel::A {
        return PlaneType::Alpha;
    }

    match repr.sys {
        ColorSystem::Xyz => PlaneType::Xyz,
        _ => PlaneType::Rgb,
    }
}

/// How an overlay's color channels are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayMode {
    /// The plane carries the full overlay color.
    Normal,
    /// The plane's first channel is an alpha mask over `base_color`.
    Monochrome,
}

/// A picture blended on top of the rendered frame.
#[derive(Clone)]
pub struct Overlay {
    pub plane: Plane,
    /// Where to place the overlay, in target pixel space.
    pub rect: Rect,
    pub mode: OverlayMode,
    /// Fill color for monochrome overlays.
    pub base_color: [f32; 3],
    pub repr: ColorRepr,
    pub color: ColorSpace,
}

/// How a frame's LUT is meant to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LutKind {
    /// Applied in the source's native encoding.
    Native,
    /// Applied in linear light, normalized to [0, 1].
    Normalized,
    /// Performs the source -> target conversion outright.
    Conversion,
}

/// A 3D color lookup table attached to a frame or the render parameters.
#[derive(Clone)]
pub struct FrameLut {
    /// Stable identity for caching and parameter hashing.
    pub signature: u64,
    /// Grid dimensions.
    pub size: [usize; 3],
    /// `size[0] * size[1] * size[2]` RGB triples.
    pub samples: Arc<Vec<f32>>,
    /// Representation the LUT expects its input in.
    pub repr_in: ColorRepr,
    /// Representation the LUT produces.
    pub repr_out: ColorRepr,
    /// Color space the LUT expects (used for conversion LUTs).
    pub color_in: ColorSpace,
    pub color_out: ColorSpace,
}

/// Guesses the kind of a frame's LUT when the frame doesn't declare one.
pub fn guess_lut_kind(frame: &Frame, reversed: bool) -> Option<LutKind> {
    let lut = frame.lut.as_ref()?;
    if let Some(kind) = frame.lut_kind {
        return Some(kind);
    }

    let (mut sys_in, mut sys_out) = (lut.repr_in.sys, lut.repr_out.sys);
    if reversed {
        std::mem::swap(&mut sys_in, &mut sys_out);
    }

    if sys_in == ColorSystem::Rgb && sys_out == sys_in {
        return Some(LutKind::Normalized);
    }
    if sys_in == frame.repr.sys && sys_out == ColorSystem::Rgb {
        return Some(LutKind::Conversion);
    }

    Some(LutKind::Native)
}

/// An ICC profile attached to a frame. Only the signature participates in
/// comparisons; the payload is opaque.
#[derive(Clone)]
pub struct IccProfile {
    pub signature: u64,
    pub data: Arc<Vec<u8>>,
}

impl PartialEq for IccProfile {
    fn eq(&self, other: &Self) -> bool {
        self.signature == other.signature
    }
}

impl Eq for IccProfile {}

/// AV1 film grain synthesis metadata, carried alongside a decoded frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GrainData {
    pub seed: u16,
    /// Log2 shift applied to the scaling values.
    pub scaling_shift: u8,
    /// Piecewise-linear luma scaling points `(intensity, scaling)`.
    pub y_points: Vec<[u8; 2]>,
    /// Per-chroma-channel scaling points.
    pub uv_points: [Vec<[u8; 2]>; 2],
    /// Whether chroma scaling is derived from luma.
    pub chroma_scaling_from_luma: bool,
    pub grain_scale: f32,
}

/// Standard chroma siting positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChromaLocation {
    #[default]
    Unknown,
    /// MPEG-2/4, H.264 default.
    Left,
    /// MPEG-1, JPEG.
    Center,
    TopLeft,
    Top,
    BottomLeft,
    Bottom,
}

impl ChromaLocation {
    /// Sub-pixel offset of this siting relative to centered sampling.
    pub fn offset(self) -> (f32, f32) {
        match self {
            Self::Unknown | Self::Center => (0.0, 0.0),
            Self::Left => (-0.5, 0.0),
            Self::TopLeft => (-0.5, -0.5),
            Self::Top => (0.0, -0.5),
            Self::BottomLeft => (-0.5, 0.5),
            Self::Bottom => (0.0, 0.5),
        }
    }
}

/// A multi-plane source or target frame. See the module docs.
#[derive(Clone, Default)]
pub struct Frame {
    pub planes: SmallVec<[Plane; 4]>,
    pub repr: ColorRepr,
    pub color: ColorSpace,
    pub icc: Option<IccProfile>,
    pub lut: Option<Arc<FrameLut>>,
    pub lut_kind: Option<LutKind>,
    pub overlays: Vec<Overlay>,
    /// Source/destination region, in reference-plane pixel space. The zero
    /// rect means the full frame. May be flipped.
    pub crop: RectF,
    pub grain: Option<GrainData>,
}

impl Frame {
    /// A single-plane frame wrapping one texture, with the identity
    /// component mapping and a full crop.
    pub fn from_texture(texture: Arc<dyn Texture>) -> Self {
        let params = texture.params();
        let crop = RectF::new(0.0, 0.0, params.w as f32, params.h as f32);
        Self {
            planes: smallvec::smallvec![Plane::from_texture(texture)],
            crop,
            ..Default::default()
        }
    }

    /// The plane carrying the reference sample grid: the first luma, RGB
    /// or XYZ plane, falling back to plane 0.
    pub fn ref_plane(&self) -> Option<&Plane> {
        self.planes
            .iter()
            .find(|p| detect_plane_type(p, &self.repr).is_ref())
            .or_else(|| self.planes.first())
    }

    /// Applies a chroma siting to all subsampled planes. For frames whose
    /// reference dimensions are known, only actually-subsampled planes are
    /// shifted.
    pub fn set_chroma_location(&mut self, loc: ChromaLocation) {
        let (sx, sy) = loc.offset();
        let ref_dims = self
            .ref_plane()
            .map(|p| (p.texture.params().w, p.texture.params().h));

        let repr = self.repr;
        for plane in &mut self.planes {
            let apply = match ref_dims {
                Some((rw, rh)) => {
                    let params = plane.texture.params();
                    params.w < rw || params.h < rh
                }
                None => detect_plane_type(plane, &repr) == PlaneType::Chroma,
            };
            if apply {
                plane.shift_x = sx;
                plane.shift_y = sy;
            }
        }
    }

    /// Whether the crop covers less than the full reference plane.
    pub fn is_cropped(&self) -> bool {
        let Some(r) = self.ref_plane() else {
            return false;
        };
        let params = r.texture.params();

        let x0 = self.crop.x0.min(self.crop.x1).round() as i32;
        let y0 = self.crop.y0.min(self.crop.y1).round() as i32;
        let mut x1 = self.crop.x0.max(self.crop.x1).round() as i32;
        let mut y1 = self.crop.y0.max(self.crop.y1).round() as i32;
        if x0 == 0 && x1 == 0 {
            x1 = params.w as i32;
        }
        if y0 == 0 && y1 == 0 {
            y1 = params.h as i32;
        }

        x0 > 0 || y0 > 0 || x1 < params.w as i32 || y1 < params.h as i32
    }

    /// Clears every plane to the given RGB color, encoded through the
    /// inverse of this frame's color representation.
    pub fn clear(&self, gpu: &dyn Gpu, rgb: [f32; 3]) -> GpuResult<()> {
        let mut repr = self.repr;
        let scale = repr.normalize();
        let encoded = crate::shaders::color::encode_rgb_reference(&self.repr, rgb);

        for plane in &self.planes {
            let mut clear = [0.0, 0.0, 0.0, 1.0];
            for c in 0..plane.components {
                match plane.component_mapping[c].index() {
                    Some(idx) if idx < 3 => clear[c] = encoded[idx] / scale,
                    _ => {}
                }
            }
            gpu.tex_clear(&plane.texture, clear)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glint_gpu::{SoftGpu, TexParams};

    fn tex(gpu: &SoftGpu, w: u32, h: u32) -> Arc<dyn Texture> {
        gpu.tex_create(&TexParams::new_2d(w, h, gpu.format("rgba8")))
            .unwrap()
    }

    #[test]
    fn test_plane_type_detection() {
        let gpu = SoftGpu::new();
        let yuv = ColorRepr {
            sys: ColorSystem::Bt709,
            ..Default::default()
        };

        let mut plane = Plane::from_texture(tex(&gpu, 64, 64));
        plane.components = 1;
        plane.component_mapping = [Channel::Y, Channel::None, Channel::None, Channel::None];
        assert_eq!(detect_plane_type(&plane, &yuv), PlaneType::Luma);

        plane.components = 2;
        plane.component_mapping = [Channel::Cb, Channel::Cr, Channel::None, Channel::None];
        assert_eq!(detect_plane_type(&plane, &yuv), PlaneType::Chroma);

        let rgb = ColorRepr {
            sys: ColorSystem::Rgb,
            ..Default::default()
        };
        plane.components = 3;
        plane.component_mapping = [Channel::R, Channel::G, Channel::B, Channel::None];
        assert_eq!(detect_plane_type(&plane, &rgb), PlaneType::Rgb);

        plane.components = 1;
        plane.component_mapping = [Channel::A, Channel::None, Channel::None, Channel::None];
        assert_eq!(detect_plane_type(&plane, &rgb), PlaneType::Alpha);
    }

    #[test]
    fn test_chroma_location_subsampled_only() {
        let gpu = SoftGpu::new();
        let mut frame = Frame {
            planes: smallvec::smallvec![
                Plane::from_texture(tex(&gpu, 128, 128)),
                Plane::from_texture(tex(&gpu, 64, 64)),
            ],
            repr: ColorRepr {
                sys: ColorSystem::Bt709,
                ..Default::default()
            },
            ..Default::default()
        };
        frame.planes[0].components = 1;
        frame.planes[0].component_mapping =
            [Channel::Y, Channel::None, Channel::None, Channel::None];
        frame.planes[1].components = 2;
        frame.planes[1].component_mapping =
            [Channel::Cb, Channel::Cr, Channel::None, Channel::None];

        frame.set_chroma_location(ChromaLocation::Left);
        assert_eq!(frame.planes[0].shift_x, 0.0);
        assert_eq!(frame.planes[1].shift_x, -0.5);
    }

    #[test]
    fn test_is_cropped() {
        let gpu = SoftGpu::new();
        let mut frame = Frame::from_texture(tex(&gpu, 100, 50));
        assert!(!frame.is_cropped());

        frame.crop = RectF::new(0.0, 0.0, 50.0, 50.0);
        assert!(frame.is_cropped());

        // Unset crop counts as full
        frame.crop = RectF::default();
        assert!(!frame.is_cropped());
    }

    #[test]
    fn test_guess_lut_kind() {
        let gpu = SoftGpu::new();
        let mut frame = Frame::from_texture(tex(&gpu, 8, 8));
        assert_eq!(guess_lut_kind(&frame, false), None);

        let mk_lut = |sys_in, sys_out| {
            Arc::new(FrameLut {
                signature: 1,
                size: [2, 2, 2],
                samples: Arc::new(vec![0.0; 24]),
                repr_in: ColorRepr {
                    sys: sys_in,
                    ..Default::default()
                },
                repr_out: ColorRepr {
                    sys: sys_out,
                    ..Default::default()
                },
                color_in: ColorSpace::default(),
                color_out: ColorSpace::default(),
            })
        };

        frame.repr.sys = ColorSystem::Bt709;
        frame.lut = Some(mk_lut(ColorSystem::Rgb, ColorSystem::Rgb));
        assert_eq!(guess_lut_kind(&frame, false), Some(LutKind::Normalized));

        frame.lut = Some(mk_lut(ColorSystem::Bt709, ColorSystem::Rgb));
        assert_eq!(guess_lut_kind(&frame, false), Some(LutKind::Conversion));

        frame.lut = Some(mk_lut(ColorSystem::Xyz, ColorSystem::Bt601));
        assert_eq!(guess_lut_kind(&frame, false), Some(LutKind::Native));

        frame.lut_kind = Some(LutKind::Normalized);
        assert_eq!(guess_lut_kind(&frame, false), Some(LutKind::Normalized));
    }
}
