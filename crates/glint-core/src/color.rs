//! Color metadata: representation (encoding) and space (meaning).
//!
//! A [`ColorRepr`] describes how color values are *encoded* in a texture:
//! the color system (RGB, a YCbCr variant, XYZ), the signal levels, the
//! alpha mode and the bit encoding. A [`ColorSpace`] describes what decoded
//! RGB values *mean*: primaries, transfer function and signal peak.
//!
//! Luminance-relative values are normalized against [`REF_WHITE`] cd/m2,
//! so an SDR signal always has a nominal peak of 1.0.

/// Reference white level, in cd/m2. HDR peaks are expressed relative to it.
pub const REF_WHITE: f32 = 100.0;

/// Color coding system, i.e. the meaning of raw texture channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSystem {
    /// Unknown; treated as RGB for decoding purposes.
    #[default]
    Unknown,
    /// ITU-R Rec. BT.601 (SD)
    Bt601,
    /// ITU-R Rec. BT.709 (HD)
    Bt709,
    /// SMPTE-240M
    Smpte240m,
    /// ITU-R Rec. BT.2020 non-constant luminance
    Bt2020Nc,
    /// ITU-R Rec. BT.2020 constant luminance
    Bt2020C,
    /// YCgCo
    YCgCo,
    /// Plain RGB
    Rgb,
    /// CIE 1931 XYZ (gamma-encoded, as in digital cinema)
    Xyz,
}

impl ColorSystem {
    /// Whether the system stores color as luma + chroma offsets.
    pub fn is_ycbcr_like(self) -> bool {
        matches!(
            self,
            Self::Bt601
                | Self::Bt709
                | Self::Smpte240m
                | Self::Bt2020Nc
                | Self::Bt2020C
                | Self::YCgCo
        )
    }

    /// Whether the system is linearly representable as a matrix transform.
    pub fn is_linear(self) -> bool {
        !matches!(self, Self::Bt2020C | Self::Xyz)
    }
}

/// Signal level range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorLevels {
    #[default]
    Unknown,
    /// Studio/TV range, e.g. 16-235 for 8-bit luma.
    Limited,
    /// Full range, 0-255 for 8-bit.
    Full,
}

/// How the alpha channel (if any) relates to the color channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlphaMode {
    #[default]
    Unknown,
    /// Color channels are independent of alpha.
    Independent,
    /// Color channels are premultiplied by alpha.
    Premultiplied,
}

/// Bit-level encoding of texture samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitEncoding {
    /// Depth the texture samples at (0 = unknown).
    pub sample_depth: u8,
    /// Depth the significant color bits occupy (0 = unknown).
    pub color_depth: u8,
    /// Number of bits the color values are left-shifted by.
    pub bit_shift: u8,
}

/// Complete description of how color values are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorRepr {
    pub sys: ColorSystem,
    pub levels: ColorLevels,
    pub alpha: AlphaMode,
    pub bits: BitEncoding,
}

impl ColorRepr {
    /// Guesses the level range when unset: YCbCr-like systems default to
    /// limited range, everything else to full range.
    pub fn effective_levels(&self) -> ColorLevels {
        match self.levels {
            ColorLevels::Unknown if self.sys.is_ycbcr_like() => ColorLevels::Limited,
            ColorLevels::Unknown => ColorLevels::Full,
            other => other,
        }
    }

    /// Returns the multiplier that renormalizes encoded values to cover the
    /// texture's nominal [0, 1] range, and canonicalizes `bits` accordingly.
    ///
    /// This absorbs bit shifts and sample/color depth mismatches so that
    /// downstream shader math can assume a canonical encoding.
    pub fn normalize(&mut self) -> f32 {
        let mut scale = 1.0f32;
        if self.bits.bit_shift != 0 {
            scale /= (1u64 << self.bits.bit_shift) as f32;
            self.bits.bit_shift = 0;
        }

        let tex_bits = if self.bits.sample_depth != 0 {
            self.bits.sample_depth
        } else {
            8
        };
        let col_bits = if self.bits.color_depth != 0 {
            self.bits.color_depth
        } else {
            tex_bits
        };

        if self.effective_levels() == ColorLevels::Limited {
            // Limited range is defined in terms of absolute code values, so
            // the depth mismatch is a plain power-of-two shift
            scale *= (1u64 << tex_bits) as f32 / (1u64 << col_bits) as f32;
        } else {
            // Full range stretches to the maximum representable code value
            scale *= ((1u64 << tex_bits) - 1) as f32 / ((1u64 << col_bits) - 1) as f32;
        }

        self.bits.sample_depth = col_bits;
        self.bits.color_depth = col_bits;
        scale
    }
}

/// Color primaries (gamut).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Primaries {
    #[default]
    Unknown,
    /// ITU-R Rec. BT.601 525-line (NTSC)
    Bt601_525,
    /// ITU-R Rec. BT.601 625-line (PAL)
    Bt601_625,
    /// ITU-R Rec. BT.709
    Bt709,
    /// ITU-R Rec. BT.2020
    Bt2020,
    /// DCI-P3 (theater)
    DciP3,
    /// Display-P3 (D65)
    DisplayP3,
    /// Adobe RGB (1998)
    AdobeRgb,
}

impl Primaries {
    /// Guesses primaries from the video resolution, for sources that don't
    /// tag them. SD content is assumed to be BT.601, everything else BT.709.
    pub fn guess(width: u32, height: u32) -> Self {
        if width >= 1280 || height > 576 {
            return Self::Bt709;
        }
        match height {
            576 => Self::Bt601_625,
            480 | 486 => Self::Bt601_525,
            _ => Self::Bt709,
        }
    }

    /// Whether the gamut is wider than BT.709.
    pub fn is_wide_gamut(self) -> bool {
        matches!(
            self,
            Self::Bt2020 | Self::DciP3 | Self::DisplayP3 | Self::AdobeRgb
        )
    }
}

/// Opto-electronic transfer characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transfer {
    #[default]
    Unknown,
    /// IEC 61966-2-4 (sRGB)
    Srgb,
    /// ITU-R Rec. BT.1886 (approximated as pure power 2.4)
    Bt1886,
    /// Linear light
    Linear,
    /// Pure power gamma 1.8 (historical Apple)
    Gamma18,
    /// Pure power gamma 2.2
    Gamma22,
    /// Pure power gamma 2.8 (historical PAL)
    Gamma28,
    /// ProPhoto RGB (ROMM)
    ProPhoto,
    /// SMPTE ST 2084 Perceptual Quantizer (HDR)
    Pq,
    /// ITU-R Rec. BT.2100 Hybrid Log-Gamma (HDR)
    Hlg,
    /// Panasonic V-Log (HDR)
    VLog,
    /// Sony S-Log1 (HDR)
    SLog1,
    /// Sony S-Log2 (HDR)
    SLog2,
}

impl Transfer {
    /// Whether the transfer encodes a peak above reference white.
    pub fn is_hdr(self) -> bool {
        matches!(
            self,
            Self::Pq | Self::Hlg | Self::VLog | Self::SLog1 | Self::SLog2
        )
    }

    /// Nominal peak of the transfer, relative to [`REF_WHITE`].
    pub fn nominal_peak(self) -> f32 {
        match self {
            Self::Pq => 10000.0 / REF_WHITE,
            Self::Hlg => 12.0,
            Self::VLog => 46.0855,
            Self::SLog1 => 10.0,
            Self::SLog2 => 155.84,
            _ => 1.0,
        }
    }
}

/// Complete description of what decoded color values mean.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ColorSpace {
    pub primaries: Primaries,
    pub transfer: Transfer,
    /// Signal peak relative to [`REF_WHITE`] (0 = unknown).
    pub sig_peak: f32,
    /// Average signal level relative to [`REF_WHITE`] (0 = unknown).
    pub sig_avg: f32,
    /// Additional scale applied on top of the encoding (0 = unknown = 1.0).
    pub sig_scale: f32,
}

impl ColorSpace {
    /// sRGB / BT.709 SDR space, the canonical display default.
    pub fn srgb() -> Self {
        Self {
            primaries: Primaries::Bt709,
            transfer: Transfer::Srgb,
            ..Default::default()
        }
        .inferred()
    }

    /// BT.2020 + PQ, the common HDR10 signal space.
    pub fn hdr10() -> Self {
        Self {
            primaries: Primaries::Bt2020,
            transfer: Transfer::Pq,
            ..Default::default()
        }
        .inferred()
    }

    /// Whether this space carries a peak above reference white.
    pub fn is_hdr(&self) -> bool {
        self.sig_peak * self.effective_scale() > 1.0 || self.transfer.is_hdr()
    }

    /// `sig_scale` with the unknown value defaulted to 1.0.
    pub fn effective_scale(&self) -> f32 {
        if self.sig_scale == 0.0 {
            1.0
        } else {
            self.sig_scale
        }
    }

    /// Fills in unknown fields with sensible defaults.
    pub fn infer(&mut self) {
        if self.primaries == Primaries::Unknown {
            self.primaries = Primaries::Bt709;
        }
        if self.transfer == Transfer::Unknown {
            self.transfer = Transfer::Bt1886;
        }
        if self.sig_peak == 0.0 {
            self.sig_peak = self.transfer.nominal_peak();
        }
        if self.sig_avg == 0.0 {
            self.sig_avg = 0.25;
        }
        if self.sig_scale == 0.0 {
            self.sig_scale = 1.0;
        }
    }

    /// Inferred copy.
    pub fn inferred(mut self) -> Self {
        self.infer();
        self
    }

    /// Fills unknown fields from `other` (without touching known ones).
    pub fn merge(&mut self, other: &ColorSpace) {
        if self.primaries == Primaries::Unknown {
            self.primaries = other.primaries;
        }
        if self.transfer == Transfer::Unknown {
            self.transfer = other.transfer;
        }
        if self.sig_peak == 0.0 {
            self.sig_peak = other.sig_peak;
        }
        if self.sig_avg == 0.0 {
            self.sig_avg = other.sig_avg;
        }
        if self.sig_scale == 0.0 {
            self.sig_scale = other.sig_scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_guess() {
        let yuv = ColorRepr {
            sys: ColorSystem::Bt709,
            ..Default::default()
        };
        assert_eq!(yuv.effective_levels(), ColorLevels::Limited);

        let rgb = ColorRepr {
            sys: ColorSystem::Rgb,
            ..Default::default()
        };
        assert_eq!(rgb.effective_levels(), ColorLevels::Full);
    }

    #[test]
    fn test_normalize_bit_shift() {
        // 10-bit color left-shifted inside 16-bit samples, full range
        let mut repr = ColorRepr {
            sys: ColorSystem::Rgb,
            bits: BitEncoding {
                sample_depth: 16,
                color_depth: 10,
                bit_shift: 6,
            },
            ..Default::default()
        };
        let scale = repr.normalize();
        let expect = (1.0 / 64.0) * (65535.0 / 1023.0);
        assert!((scale - expect).abs() < 1e-4, "scale {scale} != {expect}");
        assert_eq!(repr.bits.bit_shift, 0);
        assert_eq!(repr.bits.sample_depth, 10);
    }

    #[test]
    fn test_normalize_identity() {
        let mut repr = ColorRepr {
            sys: ColorSystem::Rgb,
            bits: BitEncoding {
                sample_depth: 8,
                color_depth: 8,
                bit_shift: 0,
            },
            ..Default::default()
        };
        assert_eq!(repr.normalize(), 1.0);
    }

    #[test]
    fn test_primaries_guess() {
        assert_eq!(Primaries::guess(1920, 1080), Primaries::Bt709);
        assert_eq!(Primaries::guess(720, 576), Primaries::Bt601_625);
        assert_eq!(Primaries::guess(720, 480), Primaries::Bt601_525);
    }

    #[test]
    fn test_hdr_detect() {
        assert!(ColorSpace::hdr10().is_hdr());
        assert!(!ColorSpace::srgb().is_hdr());
    }

    #[test]
    fn test_infer_fills_peak() {
        let mut csp = ColorSpace {
            transfer: Transfer::Pq,
            ..Default::default()
        };
        csp.infer();
        assert_eq!(csp.sig_peak, 10000.0 / REF_WHITE);
        assert_eq!(csp.sig_scale, 1.0);
    }
}
