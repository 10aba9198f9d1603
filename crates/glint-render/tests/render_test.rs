//! Render planner tests against the software backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use glint_core::{BitEncoding, ColorRepr, ColorSpace, ColorSystem, Primaries, RectF, Transfer};
use glint_gpu::{Gpu, SoftGpu, TexParams, Texture};
use glint_render::{
    Channel, Frame, FrameMix, GrainData, Hook, HookParams, HookResult, HookSig, HookStage,
    IccParams, IccProfile, Plane, RenderError, RenderParams, Renderer,
};

fn gpu() -> Arc<SoftGpu> {
    Arc::new(SoftGpu::new())
}

fn sampleable(gpu: &SoftGpu, name: &str, w: u32, h: u32) -> Arc<dyn Texture> {
    gpu.tex_create(&TexParams::new_2d(w, h, gpu.format(name)))
        .unwrap()
}

fn renderable(gpu: &SoftGpu, name: &str, w: u32, h: u32) -> Arc<dyn Texture> {
    let fmt = gpu.format(name);
    let storable = fmt
        .caps
        .contains(glint_gpu::FormatCaps::STORABLE);
    gpu.tex_create(&TexParams {
        renderable: true,
        storable,
        ..TexParams::new_2d(w, h, fmt)
    })
    .unwrap()
}

fn bt709_repr() -> ColorRepr {
    ColorRepr {
        sys: ColorSystem::Bt709,
        bits: BitEncoding {
            sample_depth: 8,
            color_depth: 8,
            bit_shift: 0,
        },
        ..Default::default()
    }
}

/// 3-plane 4:2:0 YUV frame (Y, Cb, Cr).
fn yuv420_frame(gpu: &SoftGpu, w: u32, h: u32) -> Frame {
    let mk_plane = |tex: Arc<dyn Texture>, mapping: [Channel; 4], comps: usize| Plane {
        texture: tex,
        components: comps,
        component_mapping: mapping,
        shift_x: 0.0,
        shift_y: 0.0,
    };

    let mut frame = Frame::default();
    frame.planes.push(mk_plane(
        sampleable(gpu, "r8", w, h),
        [Channel::Y, Channel::None, Channel::None, Channel::None],
        1,
    ));
    frame.planes.push(mk_plane(
        sampleable(gpu, "r8", w / 2, h / 2),
        [Channel::Cb, Channel::None, Channel::None, Channel::None],
        1,
    ));
    frame.planes.push(mk_plane(
        sampleable(gpu, "r8", w / 2, h / 2),
        [Channel::Cr, Channel::None, Channel::None, Channel::None],
        1,
    ));
    frame.repr = bt709_repr();
    frame.color = ColorSpace {
        primaries: Primaries::Bt709,
        transfer: Transfer::Bt1886,
        ..Default::default()
    };
    frame.crop = RectF::new(0.0, 0.0, w as f32, h as f32);
    frame
}

fn rgb_target(gpu: &SoftGpu, name: &str, w: u32, h: u32) -> Frame {
    let mut frame = Frame::from_texture(renderable(gpu, name, w, h));
    frame.repr.sys = ColorSystem::Rgb;
    frame.color = ColorSpace::srgb();
    frame
}

#[test]
fn test_yuv420_downscale() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let image = yuv420_frame(&gpu, 1920, 1080);
    let target = rgb_target(&gpu, "rgba8", 1280, 720);

    let params = RenderParams {
        downscaler: Some(&glint_render::filter::BICUBIC),
        dither: None,
        ..Default::default()
    };
    rr.render_image(&image, &target, &params).unwrap();

    let runs = gpu.runs();
    assert!(runs.len() >= 3, "merge + scale + output, got {}", runs.len());

    // The final pass writes the real target
    let target_id = SoftGpu::tex_id(&target.planes[0].texture).unwrap();
    assert_eq!(runs.last().unwrap().target, Some(target_id));

    // Everything still enabled
    let feats = rr.disabled_features();
    assert!(!feats.sampling);
    assert!(!feats.compute);
}

#[test]
fn test_noop_render_is_single_pass() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let mut image = Frame::from_texture(sampleable(&gpu, "rgba8", 256, 256));
    image.repr.sys = ColorSystem::Rgb;
    image.color = ColorSpace::srgb();
    let target = rgb_target(&gpu, "rgba8", 256, 256);

    let params = RenderParams {
        dither: None,
        ..Default::default()
    };
    rr.render_image(&image, &target, &params).unwrap();

    assert_eq!(
        gpu.pass_runs(),
        1,
        "an identity render collapses into a single pass"
    );
}

#[test]
fn test_hdr_to_sdr_with_peak_detect() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let mut image = Frame::from_texture(sampleable(&gpu, "rgba16f", 3840, 2160));
    image.repr.sys = ColorSystem::Rgb;
    image.color = ColorSpace::hdr10();
    let target = rgb_target(&gpu, "rgba16", 1920, 1080);

    let params = RenderParams::default();
    rr.render_image(&image, &target, &params).unwrap();

    let feats = rr.disabled_features();
    assert!(!feats.peak_detect, "peak detection stayed enabled");
    assert!(gpu.buf_creates() >= 1, "peak state buffer was allocated");
    assert!(gpu.pass_runs() >= 2, "detect/scale + output");

    // A second frame reuses the compiled passes
    let creates = gpu.pass_creates();
    rr.render_image(&image, &target, &params).unwrap();
    assert_eq!(gpu.pass_creates(), creates, "second frame is fully cached");
}

#[test]
fn test_validation_rejects_bad_frames() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);
    let target = rgb_target(&gpu, "rgba8", 64, 64);

    // No planes at all
    let empty = Frame::default();
    let err = rr.render_image(&empty, &target, &RenderParams::default());
    assert!(matches!(err, Err(RenderError::Validation(_))));

    // Chroma-only frame carries no reference sample grid
    let mut chroma_only = yuv420_frame(&gpu, 64, 64);
    chroma_only.planes.remove(0);
    let err = rr.render_image(&chroma_only, &target, &RenderParams::default());
    assert!(matches!(err, Err(RenderError::Validation(_))));

    // A crop that is zero-area on exactly one axis is an error, not a
    // fallback to the full texture
    let mut bad_crop = yuv420_frame(&gpu, 64, 64);
    bad_crop.crop = RectF::new(0.0, 0.0, 64.0, 0.0);
    let err = rr.render_image(&bad_crop, &target, &RenderParams::default());
    assert!(matches!(err, Err(RenderError::Validation(_))));

    // Valid calls still work afterwards (no side effects on caches)
    let good = yuv420_frame(&gpu, 64, 64);
    rr.render_image(&good, &target, &RenderParams::default()).unwrap();
}

#[test]
fn test_allocation_failure_latches_and_degrades() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let image = yuv420_frame(&gpu, 1920, 1080);
    let target = rgb_target(&gpu, "rgba8", 1280, 720);
    let params = RenderParams::default();

    // Force the first intermediate allocation to fail mid-render
    gpu.fail_next_tex_creates(1);
    let result = rr.render_image(&image, &target, &params);
    assert!(result.is_err(), "the failing render surfaces an error");

    // Subsequent renders succeed with degraded output
    rr.render_image(&image, &target, &params).unwrap();

    // With intermediates gone, HDR peak detection latches off for good
    let mut hdr = Frame::from_texture(sampleable(&gpu, "rgba16f", 640, 360));
    hdr.repr.sys = ColorSystem::Rgb;
    hdr.color = ColorSpace::hdr10();
    rr.render_image(&hdr, &target, &params).unwrap();
    assert!(rr.disabled_features().peak_detect);
}

#[test]
fn test_film_grain() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let mut image = yuv420_frame(&gpu, 320, 180);
    image.grain = Some(GrainData {
        seed: 1234,
        y_points: vec![[0, 16], [128, 32], [255, 16]],
        ..Default::default()
    });
    let target = rgb_target(&gpu, "rgba8", 320, 180);

    rr.render_image(&image, &target, &RenderParams::default()).unwrap();
    assert!(!rr.disabled_features().grain);

    let any_grain = gpu
        .created_passes()
        .iter()
        .any(|p| p.glsl_shader.contains("grain"));
    assert!(any_grain, "a grain shader was compiled");
}

#[test]
fn test_deband() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let image = yuv420_frame(&gpu, 640, 360);
    let target = rgb_target(&gpu, "rgba8", 640, 360);
    let params = RenderParams::high_quality();

    rr.render_image(&image, &target, &params).unwrap();
    assert!(!rr.disabled_features().debanding);
}

#[test]
fn test_icc_profiles() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let mut image = Frame::from_texture(sampleable(&gpu, "rgba8", 128, 128));
    image.repr.sys = ColorSystem::Rgb;
    image.color = ColorSpace::srgb();
    image.icc = Some(IccProfile {
        signature: 0xaaaa,
        data: Arc::new(vec![1, 2, 3]),
    });
    let mut target = rgb_target(&gpu, "rgba8", 128, 128);
    target.icc = Some(IccProfile {
        signature: 0xbbbb,
        data: Arc::new(vec![4, 5, 6]),
    });

    let params = RenderParams {
        icc: Some(IccParams::default()),
        ..Default::default()
    };
    rr.render_image(&image, &target, &params).unwrap();
    assert!(!rr.disabled_features().icc);

    // Matching profiles skip the conversion entirely
    target.icc = image.icc.clone();
    rr.render_image(&image, &target, &params).unwrap();
}

// =============================================================================
// Hooks
// =============================================================================

struct TintHook {
    fired: AtomicBool,
    resize: bool,
}

impl Hook for TintHook {
    fn stages(&self) -> HookStage {
        HookStage::SCALED
    }

    fn signature(&self) -> HookSig {
        HookSig::Color
    }

    fn hook(&self, params: HookParams<'_>) -> glint_render::RenderResult<HookResult> {
        self.fired.store(true, Ordering::Relaxed);
        if self.resize {
            // Deliberately violates the non-resizable contract
            let sh = params.dispatch.begin(false);
            return Ok(HookResult::Color {
                sh,
                w: params.w / 2,
                h: params.h / 2,
                rect: params.rect,
                repr: params.repr,
                color: params.color,
                components: params.components,
            });
        }
        if let Some(sh) = params.sh {
            glint_dispatch::glsl!(sh, "color.rgb *= vec3(0.9, 1.0, 1.0);\n");
        }
        Ok(HookResult::None)
    }
}

#[test]
fn test_color_hook_runs_in_place() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let hook = Arc::new(TintHook {
        fired: AtomicBool::new(false),
        resize: false,
    });
    let params = RenderParams {
        hooks: vec![hook.clone()],
        ..Default::default()
    };

    let image = yuv420_frame(&gpu, 320, 180);
    let target = rgb_target(&gpu, "rgba8", 640, 360);
    rr.render_image(&image, &target, &params).unwrap();

    assert!(hook.fired.load(Ordering::Relaxed));
    assert!(!rr.disabled_features().hooks);
}

#[test]
fn test_resizing_hook_at_fixed_stage_disables_hooks() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let hook = Arc::new(TintHook {
        fired: AtomicBool::new(false),
        resize: true,
    });
    let params = RenderParams {
        hooks: vec![hook.clone()],
        ..Default::default()
    };

    let image = yuv420_frame(&gpu, 320, 180);
    let target = rgb_target(&gpu, "rgba8", 640, 360);
    // The render itself still completes (degraded)
    let _ = rr.render_image(&image, &target, &params);

    assert!(hook.fired.load(Ordering::Relaxed));
    assert!(rr.disabled_features().hooks, "hooks latched off");

    // And the latch persists across calls
    rr.render_image(&image, &target, &params).unwrap();
    assert!(rr.disabled_features().hooks);
}
