//! Frame mixing and frame cache tests.

use std::sync::Arc;

use glint_core::{ColorSpace, ColorSystem};
use glint_gpu::{Gpu, SoftGpu, TexParams, Texture};
use glint_render::{filter, Frame, FrameMix, RenderParams, Renderer};

fn gpu() -> Arc<SoftGpu> {
    Arc::new(SoftGpu::new())
}

fn rgb_frame(gpu: &SoftGpu, w: u32, h: u32) -> Frame {
    let tex: Arc<dyn Texture> = gpu
        .tex_create(&TexParams::new_2d(w, h, gpu.format("rgba8")))
        .unwrap();
    let mut frame = Frame::from_texture(tex);
    frame.repr.sys = ColorSystem::Rgb;
    frame.color = ColorSpace::srgb();
    frame
}

fn rgb_target(gpu: &SoftGpu, w: u32, h: u32) -> Frame {
    let fmt = gpu.format("rgba8");
    let tex: Arc<dyn Texture> = gpu
        .tex_create(&TexParams {
            renderable: true,
            storable: true,
            ..TexParams::new_2d(w, h, fmt)
        })
        .unwrap();
    let mut frame = Frame::from_texture(tex);
    frame.repr.sys = ColorSystem::Rgb;
    frame.color = ColorSpace::srgb();
    frame
}

fn sorted_sigs(rr: &Renderer) -> Vec<u64> {
    let mut sigs = rr.cached_frame_signatures();
    sigs.sort_unstable();
    sigs
}

#[test]
fn test_oversample_weights_and_cache() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let frames: Vec<Frame> = (0..4).map(|_| rgb_frame(&gpu, 64, 64)).collect();
    let target = rgb_target(&gpu, 64, 64);
    let params = RenderParams {
        dither: None,
        ..Default::default()
    };

    // Frames at -0.5 / -0.3 / 0.0 / 0.2 of a 0.4-unit vsync: only the
    // frames visible within [0, 0.4] contribute
    let mix = FrameMix {
        frames: &frames,
        signatures: &[1, 2, 3, 4],
        timestamps: &[-0.5, -0.3, 0.0, 0.2],
        vsync_duration: 0.4,
    };
    rr.render_image_mix(&mix, &target, &params).unwrap();

    assert!(!rr.disabled_features().mixing);
    assert_eq!(sorted_sigs(&rr), vec![3, 4], "only contributing frames cached");
}

#[test]
fn test_cache_gc_evicts_stale_entries() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let frames: Vec<Frame> = (0..2).map(|_| rgb_frame(&gpu, 64, 64)).collect();
    let target = rgb_target(&gpu, 64, 64);
    let params = RenderParams {
        dither: None,
        ..Default::default()
    };

    let mix = FrameMix {
        frames: &frames,
        signatures: &[10, 11],
        timestamps: &[0.0, 0.5],
        vsync_duration: 1.0,
    };
    rr.render_image_mix(&mix, &target, &params).unwrap();
    assert_eq!(sorted_sigs(&rr), vec![10, 11]);

    let tex_creates = gpu.tex_creates();

    // A new window with one new signature: the stale entry is evicted and
    // its texture recycled for the new one
    let new_frames: Vec<Frame> = vec![frames[1].clone(), rgb_frame(&gpu, 64, 64)];
    let mix = FrameMix {
        frames: &new_frames,
        signatures: &[11, 12],
        timestamps: &[0.0, 0.5],
        vsync_duration: 1.0,
    };
    rr.render_image_mix(&mix, &target, &params).unwrap();
    assert_eq!(sorted_sigs(&rr), vec![11, 12]);
    assert_eq!(
        gpu.tex_creates(),
        tex_creates + 1,
        "only the new source texture; the cache texture was recycled"
    );
}

#[test]
fn test_cache_reuse_avoids_rerendering() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let frames: Vec<Frame> = (0..2).map(|_| rgb_frame(&gpu, 64, 64)).collect();
    let target = rgb_target(&gpu, 64, 64);
    let params = RenderParams {
        dither: None,
        ..Default::default()
    };

    let mix = FrameMix {
        frames: &frames,
        signatures: &[1, 2],
        timestamps: &[0.0, 0.5],
        vsync_duration: 1.0,
    };
    rr.render_image_mix(&mix, &target, &params).unwrap();
    let runs_first = gpu.pass_runs();

    // Same inputs and params: both cached textures are reused, so only
    // the mix itself runs again
    rr.render_image_mix(&mix, &target, &params).unwrap();
    let runs_second = gpu.pass_runs() - runs_first;
    assert!(
        runs_second < runs_first,
        "cached frames were not re-rendered ({runs_second} vs {runs_first})"
    );
}

#[test]
fn test_params_change_invalidates_cache_unless_preserved() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let frames: Vec<Frame> = (0..2).map(|_| rgb_frame(&gpu, 128, 128)).collect();
    let target = rgb_target(&gpu, 64, 64);
    let params = RenderParams {
        dither: None,
        ..Default::default()
    };
    let mix = FrameMix {
        frames: &frames,
        signatures: &[1, 2],
        timestamps: &[0.0, 0.5],
        vsync_duration: 1.0,
    };

    rr.render_image_mix(&mix, &target, &params).unwrap();
    let baseline = gpu.pass_runs();

    // Changed params without preserve: entries are repopulated
    let changed = RenderParams {
        downscaler: Some(&filter::BICUBIC),
        dither: None,
        ..Default::default()
    };
    rr.render_image_mix(&mix, &target, &changed).unwrap();
    let repopulated = gpu.pass_runs() - baseline;

    // Changed params with preserve: stale entries are reused verbatim
    let preserved = RenderParams {
        upscaler: Some(&filter::LANCZOS),
        dither: None,
        preserve_mixing_cache: true,
        ..Default::default()
    };
    let before = gpu.pass_runs();
    rr.render_image_mix(&mix, &target, &preserved).unwrap();
    let reused = gpu.pass_runs() - before;

    assert!(
        reused < repopulated,
        "preserve_mixing_cache skips repopulation ({reused} vs {repopulated})"
    );
}

#[test]
fn test_no_mixer_falls_back_to_single_frame() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let frames: Vec<Frame> = (0..2).map(|_| rgb_frame(&gpu, 64, 64)).collect();
    let target = rgb_target(&gpu, 64, 64);
    let params = RenderParams {
        frame_mixer: None,
        dither: None,
        ..Default::default()
    };

    let mix = FrameMix {
        frames: &frames,
        signatures: &[1, 2],
        timestamps: &[0.0, 0.5],
        vsync_duration: 1.0,
    };
    rr.render_image_mix(&mix, &target, &params).unwrap();

    assert!(rr.cached_frame_signatures().is_empty(), "no mixing happened");
    assert!(!rr.disabled_features().mixing, "fallback is not a failure");
}

#[test]
fn test_kernel_mixer_weights() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let frames: Vec<Frame> = (0..3).map(|_| rgb_frame(&gpu, 64, 64)).collect();
    let target = rgb_target(&gpu, 64, 64);
    let params = RenderParams {
        frame_mixer: Some(&filter::MITCHELL_CLAMP),
        dither: None,
        ..Default::default()
    };

    // Radius 2 kernel: the frame at t = 2.5 is outside the footprint
    let mix = FrameMix {
        frames: &frames,
        signatures: &[7, 8, 9],
        timestamps: &[-0.5, 0.5, 2.5],
        vsync_duration: 1.0,
    };
    rr.render_image_mix(&mix, &target, &params).unwrap();
    assert_eq!(sorted_sigs(&rr), vec![7, 8]);
}

#[test]
fn test_flush_cache() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let frames: Vec<Frame> = vec![rgb_frame(&gpu, 64, 64)];
    let target = rgb_target(&gpu, 64, 64);
    let params = RenderParams {
        dither: None,
        ..Default::default()
    };
    let mix = FrameMix {
        frames: &frames,
        signatures: &[5],
        timestamps: &[0.0],
        vsync_duration: 1.0,
    };
    rr.render_image_mix(&mix, &target, &params).unwrap();
    assert!(!rr.cached_frame_signatures().is_empty());

    rr.flush_cache();
    assert!(rr.cached_frame_signatures().is_empty());
}

#[test]
fn test_unsorted_timestamps_rejected() {
    let gpu = gpu();
    let mut rr = Renderer::new(gpu.clone() as Arc<dyn Gpu>);

    let frames: Vec<Frame> = (0..2).map(|_| rgb_frame(&gpu, 64, 64)).collect();
    let target = rgb_target(&gpu, 64, 64);
    let mix = FrameMix {
        frames: &frames,
        signatures: &[1, 2],
        timestamps: &[0.5, 0.0],
        vsync_duration: 1.0,
    };
    assert!(rr
        .render_image_mix(&mix, &target, &RenderParams::default())
        .is_err());
}
