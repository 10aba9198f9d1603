//! Dispatch engine tests against the software backend.

use std::sync::Arc;

use glint_core::Rect;
use glint_dispatch::{
    glsl, ComputeDispatchParams, Dispatch, DispatchError, DispatchParams, ShaderBuilder,
    ShaderSig, UserVertexAttrib, VertexCoords, VertexDispatchParams,
};
use glint_gpu::{
    BlendParams, Gpu, GpuCaps, PassType, PrimitiveType, SoftGpu, TexParams, Texture,
};

fn gpu() -> Arc<SoftGpu> {
    Arc::new(SoftGpu::new())
}

fn raster_gpu() -> Arc<SoftGpu> {
    // No parallel compute: fragment shaders stay fragment shaders
    Arc::new(
        SoftGpu::builder()
            .caps(GpuCaps::COMPUTE | GpuCaps::INPUT_VARIABLES)
            .build(),
    )
}

fn target(gpu: &SoftGpu, name: &str, w: u32, h: u32, storable: bool) -> Arc<dyn Texture> {
    let params = TexParams {
        renderable: true,
        storable,
        ..TexParams::new_2d(w, h, gpu.format(name))
    };
    gpu.tex_create(&params).unwrap()
}

/// A minimal color-producing shader with one dynamic variable.
fn color_shader(dp: &mut Dispatch, value: f32, body: &str) -> ShaderBuilder {
    let mut sh = dp.begin(false);
    sh.require(ShaderSig::None, 0, 0);
    let v = sh.var_f32("value", value, true);
    glsl!(sh, "vec4 color = vec4({v});\n");
    glsl!(sh, "{body}");
    sh
}

#[test]
fn test_signature_stability() {
    let gpu = gpu();
    let mut dp1 = Dispatch::new(gpu.clone());
    let mut dp2 = Dispatch::new(gpu.clone());

    let a = color_shader(&mut dp1, 1.0, "color.r += 0.5;\n");
    let b = color_shader(&mut dp2, 2.0, "color.r += 0.5;\n");
    // Same source and declarations, different data and engine: same hash
    assert_eq!(a.signature(), b.signature());

    let mut c = color_shader(&mut dp2, 2.0, "color.g += 0.5;\n");
    assert_ne!(a.signature(), c.signature());

    // Additional variables change the signature
    let sig_before = c.signature();
    let v = c.var_f32("extra", 0.0, false);
    glsl!(c, "color.b += {v};\n");
    assert_ne!(sig_before, c.signature());

    dp1.abort(a);
    dp2.abort(b);
    dp2.abort(c);
}

#[test]
fn test_raster_dispatch_and_pass_reuse() {
    let gpu = raster_gpu();
    let mut dp = Dispatch::new(gpu.clone() as Arc<dyn Gpu>);
    let tex = target(&gpu, "rgba8", 64, 64, false);

    for _ in 0..3 {
        let sh = color_shader(&mut dp, 0.5, "");
        dp.finish(DispatchParams {
            shader: sh,
            target: tex.clone(),
            rect: Rect::default(),
            blend: None,
            timer: None,
        })
        .unwrap();
    }

    assert_eq!(gpu.pass_creates(), 1, "identical dispatches share one pass");
    assert_eq!(gpu.pass_runs(), 3);
    let runs = gpu.runs();
    assert!(runs.iter().all(|r| r.ty == PassType::Raster));
    assert_eq!(runs[0].scissors, Rect::new(0, 0, 64, 64));
}

#[test]
fn test_cache_key_includes_target_and_blend() {
    let gpu = raster_gpu();
    let mut dp = Dispatch::new(gpu.clone() as Arc<dyn Gpu>);
    let t8 = target(&gpu, "rgba8", 64, 64, false);
    let t16 = target(&gpu, "rgba16f", 64, 64, false);

    let run = |dp: &mut Dispatch, tex: &Arc<dyn Texture>, blend| {
        let sh = color_shader(dp, 0.5, "");
        dp.finish(DispatchParams {
            shader: sh,
            target: tex.clone(),
            rect: Rect::default(),
            blend,
            timer: None,
        })
        .unwrap();
    };

    run(&mut dp, &t8, None);
    run(&mut dp, &t16, None);
    assert_eq!(gpu.pass_creates(), 2, "target format is part of the key");

    run(&mut dp, &t8, Some(BlendParams::ALPHA_OVERLAY));
    assert_eq!(gpu.pass_creates(), 3, "blending is part of the key");

    run(&mut dp, &t8, None);
    run(&mut dp, &t16, None);
    assert_eq!(gpu.pass_creates(), 3, "all variants stay cached");

    // Every cached pass was constructed against the key it's looked up by
    for pass in gpu.created_passes() {
        assert!(pass.target_format.is_some());
        assert_eq!(pass.ty, PassType::Raster);
    }
}

#[test]
fn test_compute_promotion_on_storable_target() {
    let gpu = gpu(); // parallel compute available
    let mut dp = Dispatch::new(gpu.clone() as Arc<dyn Gpu>);
    let tex = target(&gpu, "rgba8", 64, 64, true);

    let sh = color_shader(&mut dp, 0.5, "");
    dp.finish(DispatchParams {
        shader: sh,
        target: tex,
        rect: Rect::default(),
        blend: None,
        timer: None,
    })
    .unwrap();

    let runs = gpu.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].ty, PassType::Compute, "promoted to compute");
    assert_eq!(runs[0].compute_groups, [4, 4, 1], "64x64 in 16x16 groups");

    let pass = &gpu.created_passes()[0];
    assert_eq!(pass.compute_group_size, [16, 16]);
    assert!(
        pass.glsl_shader.contains("imageStore"),
        "target is written as a storage image"
    );
}

#[test]
fn test_push_constant_budget_respected() {
    let gpu = Arc::new(SoftGpu::builder().max_pushc_size(16).build());
    let mut dp = Dispatch::new(gpu.clone() as Arc<dyn Gpu>);
    let tex = target(&gpu, "rgba8", 8, 8, false);

    let mut sh = dp.begin(false);
    sh.require(ShaderSig::None, 0, 0);
    let a = sh.var_vec4("a", [0.0; 4], true);
    let b = sh.var_vec4("b", [1.0; 4], true);
    let m = sh.var_mat3("m", [[0.0; 3]; 3]);
    glsl!(sh, "vec4 color = vec4({a}.x + {b}.y + {m}[0][0]);\n");
    dp.finish(DispatchParams {
        shader: sh,
        target: tex,
        rect: Rect::default(),
        blend: None,
        timer: None,
    })
    .unwrap();

    let pass = &gpu.created_passes()[0];
    assert!(
        pass.push_constants_size <= 16,
        "push constants within budget: {}",
        pass.push_constants_size
    );
    // The remaining variables went somewhere else: UBO desc or globals
    let has_ubo = pass
        .descriptors
        .iter()
        .any(|d| d.ty == glint_gpu::DescType::BufUniform);
    assert!(
        has_ubo || !pass.variables.is_empty(),
        "spilled variables are bound through a UBO or globals"
    );
}

#[test]
fn test_variable_placement_failure() {
    let gpu = Arc::new(
        SoftGpu::builder()
            .caps(GpuCaps::COMPUTE)
            .max_pushc_size(16)
            .max_ubo_size(16)
            .build(),
    );
    let mut dp = Dispatch::new(gpu.clone() as Arc<dyn Gpu>);
    let tex = target(&gpu, "rgba8", 8, 8, false);

    let mut sh = dp.begin(false);
    sh.require(ShaderSig::None, 0, 0);
    let m = sh.var_mat3("m", [[0.0; 3]; 3]);
    glsl!(sh, "vec4 color = vec4({m}[0][0]);\n");
    let err = dp
        .finish(DispatchParams {
            shader: sh,
            target: tex.clone(),
            rect: Rect::default(),
            blend: None,
            timer: None,
        })
        .unwrap_err();
    assert!(matches!(err, DispatchError::PassFailed), "{err}");

    // The failure is cached: a second dispatch short-circuits without
    // touching the backend
    let creates = gpu.pass_creates();
    let mut sh = dp.begin(false);
    sh.require(ShaderSig::None, 0, 0);
    let m = sh.var_mat3("m", [[0.0; 3]; 3]);
    glsl!(sh, "vec4 color = vec4({m}[0][0]);\n");
    let err = dp
        .finish(DispatchParams {
            shader: sh,
            target: tex,
            rect: Rect::default(),
            blend: None,
            timer: None,
        })
        .unwrap_err();
    assert!(matches!(err, DispatchError::PassFailed));
    assert_eq!(gpu.pass_creates(), creates);
    assert_eq!(gpu.pass_runs(), 0);
}

#[test]
fn test_cache_save_load_round_trip() {
    let gpu1 = raster_gpu();
    let mut dp1 = Dispatch::new(gpu1.clone() as Arc<dyn Gpu>);
    let tex1 = target(&gpu1, "rgba8", 32, 32, false);

    let bodies = ["color.r += 0.1;\n", "color.g += 0.2;\n", "color.b += 0.3;\n"];
    for body in bodies {
        let sh = color_shader(&mut dp1, 0.5, body);
        dp1.finish(DispatchParams {
            shader: sh,
            target: tex1.clone(),
            rect: Rect::default(),
            blend: None,
            timer: None,
        })
        .unwrap();
    }
    assert_eq!(gpu1.program_compiles(), 3);

    let blob = dp1.save();
    assert!(!blob.is_empty());
    assert_eq!(&blob[0..4], b"PLDP");
    drop(dp1);

    // Fresh engine: loading then saving reproduces the blob bit-for-bit
    let gpu2 = raster_gpu();
    let mut dp2 = Dispatch::new(gpu2.clone() as Arc<dyn Gpu>);
    dp2.load(&blob);
    assert_eq!(dp2.save(), blob);

    // Compiling the same shaders hits the restored binaries, so the
    // backend never compiles a program
    let tex2 = target(&gpu2, "rgba8", 32, 32, false);
    for body in bodies {
        let sh = color_shader(&mut dp2, 0.5, body);
        dp2.finish(DispatchParams {
            shader: sh,
            target: tex2.clone(),
            rect: Rect::default(),
            blend: None,
            timer: None,
        })
        .unwrap();
    }
    assert_eq!(gpu2.pass_creates(), 3);
    assert_eq!(gpu2.program_compiles(), 0, "all programs restored from cache");
}

#[test]
fn test_load_rejects_bad_blobs() {
    let gpu = gpu();
    let mut dp = Dispatch::new(gpu.clone() as Arc<dyn Gpu>);

    dp.load(b"NOPE\x01\x00\x00\x00\x00\x00\x00\x00");
    dp.load(b"PLDP\x63\x00\x00\x00\x00\x00\x00\x00"); // wrong version
    dp.load(b"PL"); // truncated
    assert_eq!(dp.save().len(), 12, "nothing was loaded");
}

#[test]
fn test_pass_eviction_keeps_cache_bounded() {
    let gpu = raster_gpu();
    let mut dp = Dispatch::new(gpu.clone() as Arc<dyn Gpu>);
    let tex = target(&gpu, "rgba8", 8, 8, false);

    for i in 0..140u32 {
        let body = format!("color.r += {:.6};\n", i as f32 / 1000.0);
        let sh = color_shader(&mut dp, 0.5, &body);
        dp.finish(DispatchParams {
            shader: sh,
            target: tex.clone(),
            rect: Rect::default(),
            blend: None,
            timer: None,
        })
        .unwrap();
        dp.reset_frame();
    }

    assert!(
        dp.num_passes() < 140,
        "old passes were evicted ({} remain)",
        dp.num_passes()
    );
}

#[test]
fn test_targetless_compute_dispatch() {
    let gpu = gpu();
    let mut dp = Dispatch::new(gpu.clone() as Arc<dyn Gpu>);

    let mut sh = dp.begin(false);
    assert!(sh.try_compute(8, 8, false, 0, gpu.caps(), gpu.limits()));
    glsl!(sh, "float x = float(gl_GlobalInvocationID.x);\n");
    dp.dispatch_compute(ComputeDispatchParams {
        shader: sh,
        dispatch_size: [4, 2, 1],
        width: 0,
        height: 0,
        timer: None,
    })
    .unwrap();

    let runs = gpu.runs();
    assert_eq!(runs[0].ty, PassType::Compute);
    assert_eq!(runs[0].compute_groups, [4, 2, 1]);
    let pass = &gpu.created_passes()[0];
    assert!(pass.glsl_shader.contains("local_size_x = 8"));
}

#[test]
fn test_vertex_dispatch() {
    let gpu = raster_gpu();
    let mut dp = Dispatch::new(gpu.clone() as Arc<dyn Gpu>);
    let tex = target(&gpu, "rgba8", 100, 50, false);

    let mut sh = dp.begin(false);
    sh.require(ShaderSig::None, 0, 0);
    glsl!(sh, "vec4 color = vec4(coord, 0.0, 1.0);\n");

    // Two triangles worth of (pos, coord) pairs in absolute coordinates
    let verts: Vec<f32> = (0..6).flat_map(|i| [i as f32, i as f32, 0.0, 1.0]).collect();
    dp.dispatch_vertex(VertexDispatchParams {
        shader: sh,
        target: tex,
        scissors: Rect::new(0, 0, 100, 50),
        blend: None,
        vertex_attribs: vec![
            UserVertexAttrib {
                name: "pos".into(),
                components: 2,
                offset: 0,
            },
            UserVertexAttrib {
                name: "coord".into(),
                components: 2,
                offset: 8,
            },
        ],
        vertex_position_idx: 0,
        vertex_stride: 16,
        vertex_type: PrimitiveType::TriangleList,
        vertex_coords: VertexCoords::Absolute,
        vertex_flipped: false,
        vertex_data: bytemuck_bytes(&verts),
        vertex_count: 6,
        timer: None,
    })
    .unwrap();

    let runs = gpu.runs();
    assert_eq!(runs[0].vertex_count, 6);
    let pass = &gpu.created_passes()[0];
    assert_eq!(pass.vertex_type, PrimitiveType::TriangleList);
    assert_eq!(pass.vertex_stride, 16);
    let vs = pass.vertex_shader.as_ref().unwrap();
    assert!(vs.contains("gl_Position"), "vertex shader emits a position");
    assert!(
        pass.glsl_shader.contains("in vec2 coord"),
        "non-position attributes are forwarded as varyings"
    );
}

#[test]
fn test_generated_source_shape() {
    let gpu = raster_gpu();
    let mut dp = Dispatch::new(gpu.clone() as Arc<dyn Gpu>);
    let tex = target(&gpu, "rgba8", 16, 16, false);
    let sampled = gpu
        .tex_create(&TexParams::new_2d(16, 16, gpu.format("rgba8")))
        .unwrap();

    let mut sh = dp.begin(false);
    sh.require(ShaderSig::None, 0, 0);
    let t = sh.bind_tex("tex", sampled);
    glsl!(sh, "vec4 color = texture({t}, vec2(0.5));\n");
    dp.finish(DispatchParams {
        shader: sh,
        target: tex,
        rect: Rect::default(),
        blend: None,
        timer: None,
    })
    .unwrap();

    let pass = &gpu.created_passes()[0];
    let src = &pass.glsl_shader;
    assert!(src.starts_with("#version 450\n"));
    assert!(src.contains("uniform sampler2D"));
    assert!(src.contains("layout(location=0) out vec4 out_color;"));
    assert!(src.contains("void main()"));
}

fn bytemuck_bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|v| v.to_ne_bytes()).collect()
}
