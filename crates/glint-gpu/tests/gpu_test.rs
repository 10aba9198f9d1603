//! Backend abstraction tests against the software backend.

use std::sync::Arc;

use glint_gpu::{
    find_format, BufParams, FormatCaps, FormatType, Gpu, GpuCaps, SoftGpu, TexParams,
};

#[test]
fn test_find_format_prefers_first_match() {
    let gpu = SoftGpu::new();
    let fmt = find_format(
        &gpu,
        FormatType::Float,
        4,
        16,
        FormatCaps::RENDERABLE | FormatCaps::LINEAR,
    )
    .expect("rgba16f exists");
    assert_eq!(fmt.name, "rgba16f");

    // Unsatisfiable requests return nothing
    assert!(find_format(&gpu, FormatType::Sint, 4, 8, FormatCaps::SAMPLEABLE).is_none());
}

#[test]
fn test_format_caps_stripping() {
    let gpu = SoftGpu::builder()
        .strip_format_caps(FormatCaps::STORABLE)
        .build();
    assert!(find_format(&gpu, FormatType::Float, 4, 16, FormatCaps::STORABLE).is_none());
    assert!(find_format(&gpu, FormatType::Float, 4, 16, FormatCaps::RENDERABLE).is_some());
}

#[test]
fn test_tex_create_validates_against_format() {
    let gpu = SoftGpu::new();

    // rgb16f is not storable in the default table
    let err = gpu.tex_create(&TexParams {
        storable: true,
        ..TexParams::new_2d(16, 16, gpu.format("rgb16f"))
    });
    assert!(err.is_err());

    let ok = gpu.tex_create(&TexParams::new_2d(16, 16, gpu.format("rgb16f")));
    assert!(ok.is_ok());
}

#[test]
fn test_buffer_read_write() {
    let gpu = SoftGpu::new();
    let buf = gpu.buf_create(&BufParams::storage(64)).unwrap();

    gpu.buf_write(&buf, 8, &[1, 2, 3, 4]).unwrap();
    let mut out = [0u8; 4];
    gpu.buf_read(&buf, 8, &mut out).unwrap();
    assert_eq!(out, [1, 2, 3, 4]);

    assert!(gpu.buf_write(&buf, 62, &[0; 4]).is_err(), "out of bounds");
}

#[test]
fn test_failure_injection() {
    let gpu = SoftGpu::new();
    gpu.fail_next_tex_creates(2);

    let params = TexParams::new_2d(8, 8, gpu.format("rgba8"));
    assert!(gpu.tex_create(&params).is_err());
    assert!(gpu.tex_create(&params).is_err());
    assert!(gpu.tex_create(&params).is_ok());
}

#[test]
fn test_device_loss() {
    let gpu = Arc::new(SoftGpu::new());
    assert!(!gpu.is_failed());
    gpu.set_failed();
    assert!(gpu.is_failed());
    assert!(gpu.caps().contains(GpuCaps::COMPUTE));
}
