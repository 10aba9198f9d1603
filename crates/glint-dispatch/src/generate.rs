//! Complete GLSL source generation for compiled passes.
//!
//! Assembles, in order: a preamble (shading-language version, the subset of
//! extensions the descriptor list actually needs, embedded-profile
//! precision qualifiers), the push-constant block, every descriptor
//! binding, loose global uniforms, the accumulated shader code, and a
//! `main()` stub matching the pass type. Raster passes additionally get a
//! passthrough vertex shader.

use std::fmt::Write;

use glint_gpu::{
    DescType, Gpu, MemoryFlags, PassParams, PassType, SamplerType, Var, VarLayout,
};

use crate::engine::{PassVar, VarPlacement};
use crate::shader::{ShaderBuilder, ShaderRes};

/// Scratch buffers reused across pass compilations, so the string-heavy
/// assembly doesn't reallocate per pass.
#[derive(Default)]
pub(crate) struct GenBuffers {
    prelude: String,
    main: String,
    vert_head: String,
    vert_body: String,
}

impl GenBuffers {
    pub(crate) fn reset(&mut self) {
        self.prelude.clear();
        self.main.clear();
        self.vert_head.clear();
        self.vert_body.clear();
    }
}

fn add_var_decl(out: &mut String, var: &Var) {
    let _ = write!(out, "{} {}", var.glsl_type_name(), var.name);
    if var.dim_a > 1 {
        let _ = write!(out, "[{}]", var.dim_a);
    }
    out.push_str(";\n");
}

/// Emits a buffer block body with members sorted by offset, attaching
/// explicit offsets where the GLSL version allows them.
fn add_buffer_vars(out: &mut String, vars: &[(Var, VarLayout)], explicit_offsets: bool) {
    let mut sorted: Vec<&(Var, VarLayout)> = vars.iter().collect();
    sorted.sort_by_key(|(_, layout)| layout.offset);

    out.push_str("{\n");
    for (var, layout) in sorted {
        if explicit_offsets {
            let _ = write!(out, "    layout(offset={}) ", layout.offset);
        } else {
            out.push_str("    ");
        }
        add_var_decl(out, var);
    }
    out.push_str("};\n");
}

/// Generates the complete shader sources for a pass, filling in
/// `params.glsl_shader` and (for raster passes) `params.vertex_shader`.
pub(crate) fn generate_shaders(
    gpu: &dyn Gpu,
    bufs: &mut GenBuffers,
    sh: &ShaderBuilder,
    res: &ShaderRes,
    pass_vars: &[PassVar],
    params: &mut PassParams,
    vert_pos: Option<&str>,
    out_proj: Option<&str>,
) {
    bufs.reset();
    let glsl = gpu.glsl();
    let pre = &mut bufs.prelude;

    let _ = write!(
        pre,
        "#version {}{}\n",
        glsl.version,
        if glsl.gles && glsl.version > 100 { " es" } else { "" }
    );
    if params.ty == PassType::Compute {
        pre.push_str("#extension GL_ARB_compute_shader : enable\n");
    }

    // Enabled unconditionally when supported, since there is no way of
    // knowing whether the accumulated code uses subgroup operations
    if gpu.caps().contains(glint_gpu::GpuCaps::SUBGROUPS) {
        pre.push_str(
            "#extension GL_KHR_shader_subgroup_basic : enable\n\
             #extension GL_KHR_shader_subgroup_vote : enable\n\
             #extension GL_KHR_shader_subgroup_arithmetic : enable\n\
             #extension GL_KHR_shader_subgroup_ballot : enable\n\
             #extension GL_KHR_shader_subgroup_shuffle : enable\n",
        );
    }

    // Enable only the extensions needed by the actual descriptor list
    let mut has_ubo = false;
    let mut has_ssbo = false;
    let mut has_img = false;
    let mut has_texel = false;
    let mut has_ext = false;
    let mut has_nofmt = false;
    for sd in &sh.descs {
        match sd.desc.ty {
            DescType::BufUniform => has_ubo = true,
            DescType::BufStorage => has_ssbo = true,
            DescType::BufTexelUniform => has_texel = true,
            DescType::BufTexelStorage => {
                has_texel = true;
                if let Some(buf) = sd.binding.object.as_buffer() {
                    let nofmt = buf
                        .params()
                        .format
                        .as_ref()
                        .map_or(true, |f| f.glsl_format.is_none());
                    has_nofmt |= nofmt;
                }
            }
            DescType::StorageImg => {
                has_img = true;
                if let Some(tex) = sd.binding.object.as_texture() {
                    has_nofmt |= tex.params().format.glsl_format.is_none();
                }
            }
            DescType::SampledTex => {
                if let Some(tex) = sd.binding.object.as_texture() {
                    has_ext |= tex.sampler_type() == SamplerType::External;
                }
            }
        }
    }

    if has_img {
        pre.push_str("#extension GL_ARB_shader_image_load_store : enable\n");
    }
    if has_ubo {
        pre.push_str("#extension GL_ARB_uniform_buffer_object : enable\n");
    }
    if has_ssbo {
        pre.push_str("#extension GL_ARB_shader_storage_buffer_object : enable\n");
    }
    if has_texel {
        pre.push_str("#extension GL_ARB_texture_buffer_object : enable\n");
    }
    if has_ext {
        pre.push_str("#extension GL_OES_EGL_image_external : enable\n");
    }
    if has_nofmt {
        pre.push_str("#extension GL_EXT_shader_image_load_formatted : enable\n");
    }

    if glsl.gles {
        // 32-bit float precision where available, 16-bit samplers always
        pre.push_str(
            "#ifdef GL_FRAGMENT_PRECISION_HIGH\n\
             precision highp float;\n\
             #else\n\
             precision mediump float;\n\
             #endif\n\
             precision mediump sampler2D;\n",
        );
        if gpu.limits().max_tex_1d_dim > 0 {
            pre.push_str("precision mediump sampler1D;\n");
        }
        if gpu.limits().max_tex_3d_dim > 0 && glsl.version > 100 {
            pre.push_str("precision mediump sampler3D;\n");
        }
    }

    // Push constant block, with members sorted by offset (placement order
    // and offset order can differ)
    if params.push_constants_size > 0 {
        let pc_vars: Vec<(Var, VarLayout)> = sh
            .vars
            .iter()
            .zip(pass_vars)
            .filter_map(|(sv, pv)| match pv.placement {
                Some(VarPlacement::Push(layout)) => Some((sv.var.clone(), layout)),
                _ => None,
            })
            .collect();
        pre.push_str("layout(std430, push_constant) uniform PushC ");
        add_buffer_vars(pre, &pc_vars, true);
    }

    // Descriptor bindings
    for (sd, desc) in sh.descs.iter().zip(&params.descriptors) {
        match desc.ty {
            DescType::SampledTex => {
                let tex = sd.binding.object.as_texture().expect("sampled texture");
                let tpars = tex.params();
                let sampler = match (tex.sampler_type(), tpars.dimension()) {
                    (SamplerType::Normal, 1) => "sampler1D",
                    (SamplerType::Normal, 2) => "sampler2D",
                    (SamplerType::Normal, 3) => "sampler3D",
                    (SamplerType::Rect, _) => "sampler2DRect",
                    (SamplerType::External, _) => "samplerExternalOES",
                    (SamplerType::Normal, _) => unreachable!(),
                };
                let prefix = match tpars.format.ty {
                    glint_gpu::FormatType::Uint => "u",
                    glint_gpu::FormatType::Sint => "i",
                    _ => "",
                };
                let prec = if !prefix.is_empty() && glsl.gles { "highp " } else { "" };
                // Vulkan requires explicit bindings; GL assigns them at
                // link time instead
                if glsl.vulkan {
                    let _ = write!(pre, "layout(binding={}) ", desc.binding);
                }
                let _ = write!(pre, "uniform {prec}{prefix}{sampler} {};\n", desc.name);
            }
            DescType::StorageImg => {
                let tex = sd.binding.object.as_texture().expect("storage image");
                let tpars = tex.params();
                let image = match tpars.dimension() {
                    1 => "image1D",
                    2 => "image2D",
                    _ => "image3D",
                };
                let format = tpars.format.glsl_format;
                if glsl.vulkan {
                    match format {
                        Some(f) => {
                            let _ = write!(pre, "layout(binding={}, {f}) ", desc.binding);
                        }
                        None => {
                            let _ = write!(pre, "layout(binding={}) ", desc.binding);
                        }
                    }
                } else if glsl.version >= 130 {
                    if let Some(f) = format {
                        let _ = write!(pre, "layout({f}) ");
                    }
                }
                let _ = write!(
                    pre,
                    "{}{}{} restrict uniform {image} {};\n",
                    desc.access.glsl_name(),
                    if sd.memory.contains(MemoryFlags::COHERENT) { " coherent" } else { "" },
                    if sd.memory.contains(MemoryFlags::VOLATILE) { " volatile" } else { "" },
                    desc.name,
                );
            }
            DescType::BufUniform => {
                if glsl.vulkan {
                    let _ = write!(pre, "layout(std140, binding={}) ", desc.binding);
                } else {
                    pre.push_str("layout(std140) ");
                }
                let _ = write!(pre, "uniform {} ", desc.name);
                add_buffer_vars(pre, &sd.buffer_vars, glsl.version >= 440);
            }
            DescType::BufStorage => {
                if glsl.vulkan {
                    let _ = write!(pre, "layout(std430, binding={}) ", desc.binding);
                } else if glsl.version >= 140 {
                    pre.push_str("layout(std430) ");
                }
                let _ = write!(
                    pre,
                    "{}{}{} restrict buffer {} ",
                    desc.access.glsl_name(),
                    if sd.memory.contains(MemoryFlags::COHERENT) { " coherent" } else { "" },
                    if sd.memory.contains(MemoryFlags::VOLATILE) { " volatile" } else { "" },
                    desc.name,
                );
                add_buffer_vars(pre, &sd.buffer_vars, glsl.version >= 440);
            }
            DescType::BufTexelUniform => {
                if glsl.vulkan {
                    let _ = write!(pre, "layout(binding={}) ", desc.binding);
                }
                let _ = write!(pre, "uniform samplerBuffer {};\n", desc.name);
            }
            DescType::BufTexelStorage => {
                let buf = sd.binding.object.as_buffer().expect("texel buffer");
                let format = buf.params().format.as_ref().and_then(|f| f.glsl_format);
                if glsl.vulkan {
                    match format {
                        Some(f) => {
                            let _ = write!(pre, "layout(binding={}, {f}) ", desc.binding);
                        }
                        None => {
                            let _ = write!(pre, "layout(binding={}) ", desc.binding);
                        }
                    }
                } else if let Some(f) = format {
                    let _ = write!(pre, "layout({f}) ");
                }
                let _ = write!(
                    pre,
                    "{}{}{} restrict uniform imageBuffer {};\n",
                    desc.access.glsl_name(),
                    if sd.memory.contains(MemoryFlags::COHERENT) { " coherent" } else { "" },
                    if sd.memory.contains(MemoryFlags::VOLATILE) { " volatile" } else { "" },
                    desc.name,
                );
            }
        }
    }

    // Remaining (global) input variables
    for (sv, pv) in sh.vars.iter().zip(pass_vars) {
        if !matches!(pv.placement, Some(VarPlacement::Global { .. })) {
            continue;
        }
        pre.push_str("uniform ");
        add_var_decl(pre, &sv.var);
    }

    let vert_in = if glsl.version >= 130 { "in" } else { "attribute" };
    let vert_out = if glsl.version >= 130 { "out" } else { "varying" };
    let frag_in = if glsl.version >= 130 { "in" } else { "varying" };

    let main = &mut bufs.main;
    main.push_str(pre);

    let mut out_color = "gl_FragColor";
    match params.ty {
        PassType::Raster => {
            let vert_pos = vert_pos.expect("raster pass without position attribute");
            let vert_head = &mut bufs.vert_head;
            let vert_body = &mut bufs.vert_body;

            vert_head.push_str(pre);
            vert_body.push_str("void main() {\n");
            for (va, attr) in sh.vas.iter().zip(&params.vertex_attribs) {
                let ty = attr.glsl_type();
                // The unmangled name stays in the fragment shader; the
                // vertex-side name has been suffixed to avoid colliding
                let loc = if glsl.version >= 430 {
                    format!("layout(location={}) ", attr.location)
                } else {
                    String::new()
                };
                let _ = write!(vert_head, "{loc}{vert_in} {ty} {};\n", attr.name);

                if va.name == vert_pos {
                    match out_proj {
                        Some(proj) => {
                            let _ = write!(
                                vert_body,
                                "gl_Position = vec4(({proj} * vec3({}, 1.0)).xy, 0.0, 1.0);\n",
                                attr.name
                            );
                        }
                        None => {
                            let _ = write!(
                                vert_body,
                                "gl_Position = vec4({}, 0.0, 1.0);\n",
                                attr.name
                            );
                        }
                    }
                } else {
                    // Everything else is blindly forwarded as a varying
                    let _ = write!(vert_head, "{loc}{vert_out} {ty} {};\n", va.name);
                    let _ = write!(vert_body, "{} = {};\n", va.name, attr.name);
                    let _ = write!(main, "{loc}{frag_in} {ty} {};\n", va.name);
                }
            }
            vert_body.push_str("}\n");
            vert_head.push_str(vert_body);
            params.vertex_shader = Some(vert_head.clone());

            // GLSL 130+ lost the magic gl_FragColor
            if glsl.version >= 130 {
                out_color = "out_color";
                let _ = write!(
                    main,
                    "{}out vec4 {out_color};\n",
                    if glsl.version >= 430 { "layout(location=0) " } else { "" }
                );
            }
        }
        PassType::Compute => {
            let _ = write!(
                main,
                "layout (local_size_x = {}, local_size_y = {}) in;\n",
                params.compute_group_size[0], params.compute_group_size[1]
            );
        }
    }

    // Accumulated helper functions, the shader function itself, and the
    // entry point stub
    main.push_str(&sh.header);
    match sh.output_sig() {
        crate::shader::ShaderSig::Color => {
            let _ = write!(main, "vec4 {}() {{\n{}return color;\n}}\n", res.name, sh.body);
        }
        crate::shader::ShaderSig::None => {
            let _ = write!(main, "void {}() {{\n{}}}\n", res.name, sh.body);
        }
    }

    main.push_str("void main() {\n");
    match params.ty {
        PassType::Raster => {
            let _ = write!(main, "{out_color} = {}();\n", res.name);
        }
        PassType::Compute => {
            let _ = write!(main, "{}();\n", res.name);
        }
    }
    main.push_str("}\n");

    params.glsl_shader = main.clone();
}
