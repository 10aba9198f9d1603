//! Reconstruction filter kernels for scaling and frame mixing.

/// A filter kernel or window function.
pub struct FilterFunction {
    /// Support radius; the weight is zero outside `[-radius, radius]`.
    pub radius: f32,
    /// Weight at offset `x` (callers pass `|x| <= radius`).
    pub weight: fn(f32) -> f32,
}

/// A complete filter configuration.
pub struct FilterConfig {
    pub name: &'static str,
    /// Main kernel. `None` marks the degenerate "oversample" mixer, which
    /// weights frames by vsync coverage instead of filtering.
    pub kernel: Option<&'static FilterFunction>,
    /// Optional window multiplied over the kernel, rescaled to its radius.
    pub window: Option<&'static FilterFunction>,
    /// Polar (EWA) filters weight by the 2D euclidean distance and are
    /// evaluated in a single pass; orthogonal filters run separably.
    pub polar: bool,
}

impl FilterConfig {
    pub fn radius(&self) -> f32 {
        self.kernel.map_or(0.0, |k| k.radius)
    }

    /// Stable identity of this configuration, by pointer. Presets are
    /// statics, so this doubles as a cheap equality check.
    pub fn is(&'static self, other: &'static FilterConfig) -> bool {
        std::ptr::eq(self, other)
    }
}

/// Samples a filter at offset `x`, applying the window if any.
pub fn filter_sample(config: &FilterConfig, x: f32) -> f32 {
    let Some(kernel) = config.kernel else {
        return 0.0;
    };
    let x = x.abs();
    if x >= kernel.radius {
        return 0.0;
    }

    let mut w = (kernel.weight)(x);
    if let Some(window) = config.window {
        w *= (window.weight)(x * window.radius / kernel.radius);
    }
    w
}

fn box_weight(_: f32) -> f32 {
    1.0
}

fn triangle_weight(x: f32) -> f32 {
    1.0 - x
}

/// Mitchell-Netravali cubic family.
fn cubic_weight(x: f32, b: f32, c: f32) -> f32 {
    let x2 = x * x;
    let x3 = x2 * x;
    if x < 1.0 {
        ((12.0 - 9.0 * b - 6.0 * c) * x3 + (-18.0 + 12.0 * b + 6.0 * c) * x2
            + (6.0 - 2.0 * b))
            / 6.0
    } else {
        ((-b - 6.0 * c) * x3 + (6.0 * b + 30.0 * c) * x2 + (-12.0 * b - 48.0 * c) * x
            + (8.0 * b + 24.0 * c))
            / 6.0
    }
}

fn bspline_weight(x: f32) -> f32 {
    cubic_weight(x, 1.0, 0.0)
}

fn mitchell_weight(x: f32) -> f32 {
    cubic_weight(x, 1.0 / 3.0, 1.0 / 3.0)
}

fn spline36_weight(x: f32) -> f32 {
    if x < 1.0 {
        ((13.0 / 11.0 * x - 453.0 / 209.0) * x - 3.0 / 209.0) * x + 1.0
    } else if x < 2.0 {
        let x = x - 1.0;
        ((-6.0 / 11.0 * x + 270.0 / 209.0) * x - 156.0 / 209.0) * x
    } else {
        let x = x - 2.0;
        ((1.0 / 11.0 * x - 45.0 / 209.0) * x + 26.0 / 209.0) * x
    }
}

fn sinc(x: f32) -> f32 {
    if x.abs() < 1e-6 {
        return 1.0;
    }
    let x = x * std::f32::consts::PI;
    x.sin() / x
}

/// Bessel function of the first kind, order one, via the Abramowitz &
/// Stegun rational approximations.
fn bessel_j1(x: f32) -> f32 {
    let x = x as f64;
    let ax = x.abs();
    if ax < 8.0 {
        let y = x * x;
        let p1 = x
            * (72362614232.0
                + y * (-7895059235.0
                    + y * (242396853.1 + y * (-2972611.439 + y * (15704.48260 + y * -30.16036606)))));
        let p2 = 144725228442.0
            + y * (2300535178.0 + y * (18583304.74 + y * (99447.43394 + y * (376.9991397 + y))));
        (p1 / p2) as f32
    } else {
        let z = 8.0 / ax;
        let y = z * z;
        let xx = ax - 2.356194491;
        let p1 = 1.0 + y * (0.183105e-2 + y * (-0.3516396496e-4 + y * (0.2457520174e-5 + y * -0.240337019e-6)));
        let p2 = 0.04687499995
            + y * (-0.2002690873e-3 + y * (0.8449199096e-5 + y * (-0.88228987e-6 + y * 0.105787412e-6)));
        let ans = (0.636619772 / ax).sqrt() * (xx.cos() * p1 - z * xx.sin() * p2);
        (if x < 0.0 { -ans } else { ans }) as f32
    }
}

fn jinc(x: f32) -> f32 {
    if x.abs() < 1e-6 {
        return 1.0;
    }
    let x = x * std::f32::consts::PI;
    2.0 * bessel_j1(x) / x
}

fn jinc3_weight(x: f32) -> f32 {
    jinc(x)
}

fn sinc3_weight(x: f32) -> f32 {
    sinc(x)
}

static BOX_FN: FilterFunction = FilterFunction {
    radius: 0.5,
    weight: box_weight,
};

static TRIANGLE_FN: FilterFunction = FilterFunction {
    radius: 1.0,
    weight: triangle_weight,
};

static BSPLINE_FN: FilterFunction = FilterFunction {
    radius: 2.0,
    weight: bspline_weight,
};

static MITCHELL_FN: FilterFunction = FilterFunction {
    radius: 2.0,
    weight: mitchell_weight,
};

static SPLINE36_FN: FilterFunction = FilterFunction {
    radius: 3.0,
    weight: spline36_weight,
};

/// Jinc with its third zero crossing as the radius.
static JINC3_FN: FilterFunction = FilterFunction {
    radius: 3.2383154,
    weight: jinc3_weight,
};

static SINC3_FN: FilterFunction = FilterFunction {
    radius: 3.0,
    weight: sinc3_weight,
};

/// Nearest-neighbour "filter".
pub static NEAREST: FilterConfig = FilterConfig {
    name: "nearest",
    kernel: Some(&BOX_FN),
    window: None,
    polar: false,
};

pub static BILINEAR: FilterConfig = FilterConfig {
    name: "bilinear",
    kernel: Some(&TRIANGLE_FN),
    window: None,
    polar: false,
};

/// B-spline bicubic; smooth enough to run on the GPU's built-in bilinear
/// sampler with the 4-tap trick.
pub static BICUBIC: FilterConfig = FilterConfig {
    name: "bicubic",
    kernel: Some(&BSPLINE_FN),
    window: None,
    polar: false,
};

pub static MITCHELL: FilterConfig = FilterConfig {
    name: "mitchell",
    kernel: Some(&MITCHELL_FN),
    window: None,
    polar: false,
};

/// Mitchell with clamping, useful as a ringing-free frame mixer.
pub static MITCHELL_CLAMP: FilterConfig = FilterConfig {
    name: "mitchell_clamp",
    kernel: Some(&MITCHELL_FN),
    window: None,
    polar: false,
};

pub static SPLINE36: FilterConfig = FilterConfig {
    name: "spline36",
    kernel: Some(&SPLINE36_FN),
    window: None,
    polar: false,
};

/// EWA Lanczos: jinc windowed by jinc, evaluated polar.
pub static EWA_LANCZOS: FilterConfig = FilterConfig {
    name: "ewa_lanczos",
    kernel: Some(&JINC3_FN),
    window: Some(&JINC3_FN),
    polar: true,
};

pub static LANCZOS: FilterConfig = FilterConfig {
    name: "lanczos",
    kernel: Some(&SINC3_FN),
    window: Some(&SINC3_FN),
    polar: false,
};

/// The oversample frame mixer: no kernel, frames are weighted by their
/// visible fraction of the vsync interval.
pub static OVERSAMPLE: FilterConfig = FilterConfig {
    name: "oversample",
    kernel: None,
    window: None,
    polar: false,
};

/// Frame mixer presets, for enumeration by players.
pub fn frame_mixer_presets() -> &'static [(&'static str, Option<&'static FilterConfig>)] {
    static PRESETS: [(&str, Option<&FilterConfig>); 3] = [
        ("none", None),
        ("oversample", Some(&OVERSAMPLE)),
        ("mitchell_clamp", Some(&MITCHELL_CLAMP)),
    ];
    &PRESETS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernels_peak_at_zero() {
        for config in [&BILINEAR, &BICUBIC, &MITCHELL, &SPLINE36, &LANCZOS] {
            let peak = filter_sample(config, 0.0);
            assert!(peak > 0.9, "{} peak {peak}", config.name);
            for i in 1..8 {
                let x = i as f32 / 8.0 * config.radius();
                assert!(
                    filter_sample(config, x).abs() <= peak,
                    "{} at {x}",
                    config.name
                );
            }
        }
    }

    #[test]
    fn test_zero_outside_radius() {
        assert_eq!(filter_sample(&MITCHELL, 2.5), 0.0);
        assert_eq!(filter_sample(&MITCHELL, -2.5), 0.0);
    }

    #[test]
    fn test_oversample_has_no_kernel() {
        assert!(OVERSAMPLE.kernel.is_none());
        assert_eq!(filter_sample(&OVERSAMPLE, 0.0), 0.0);
    }

    #[test]
    fn test_spline36_continuity() {
        // Piecewise segments meet
        let eps = 1e-3;
        let at = |x: f32| filter_sample(&SPLINE36, x);
        assert!((at(1.0 - eps) - at(1.0 + eps)).abs() < 0.01);
        assert!((at(2.0 - eps) - at(2.0 + eps)).abs() < 0.01);
        assert!(at(3.0 - eps).abs() < 0.01);
    }

    #[test]
    fn test_jinc_first_zero() {
        // First zero of jinc is at ~1.2197
        assert!(jinc(1.21).abs() < 0.02);
        assert!(jinc(0.0) > 0.99);
    }
}
