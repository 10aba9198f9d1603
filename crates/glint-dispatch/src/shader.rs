//! The shader-under-construction type.
//!
//! A [`ShaderBuilder`] accumulates a GLSL function body plus everything the
//! engine needs to compile it: input variables (with their current data),
//! descriptor bindings, vertex attributes, compute requirements and an
//! input/output signature. Builders are pooled by the [`Dispatch`] engine
//! and reset between uses to avoid reallocating their string buffers.
//!
//! [`Dispatch`]: crate::engine::Dispatch

use std::fmt;
use std::sync::Arc;

use glint_core::hash::ContentHasher;
use glint_core::RectF;
use glint_gpu::{
    BindingObject, Desc, DescBinding, GpuCaps, GpuLimits, MemoryFlags, Texture, Var, VarLayout,
};

/// Data-flow signature of a shader function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShaderSig {
    /// No input / no output (side effects only).
    #[default]
    None,
    /// Produces (or consumes) a `vec4 color`.
    Color,
}

/// An input variable attached to a shader, with its current data.
#[derive(Debug, Clone)]
pub struct ShaderVar {
    pub var: Var,
    /// Host-layout bytes of the current value.
    pub data: Vec<u8>,
    /// Expected to change frequently; steers placement towards push
    /// constants and away from UBOs.
    pub dynamic: bool,
}

/// A descriptor attached to a shader, with its bound object.
#[derive(Clone)]
pub struct ShaderDesc {
    pub desc: Desc,
    pub binding: DescBinding,
    pub memory: MemoryFlags,
    /// Member variables, for buffer blocks (UBO/SSBO) only.
    pub buffer_vars: Vec<(Var, VarLayout)>,
}

/// A vertex attribute attached to a shader, with per-corner data for the
/// implicit full-quad vertex stream.
#[derive(Debug, Clone)]
pub struct ShaderVa {
    pub name: String,
    /// Component count of the attribute (vec`N` of f32).
    pub components: usize,
    /// Data for the 4 quad corners, in triangle-strip order.
    pub data: [Vec<u8>; 4],
}

impl ShaderVa {
    /// Size of one vertex's worth of this attribute.
    pub fn texel_size(&self) -> usize {
        self.components * 4
    }

    /// GLSL type of the attribute.
    pub fn glsl_type(&self) -> &'static str {
        match self.components {
            1 => "float",
            2 => "vec2",
            3 => "vec3",
            _ => "vec4",
        }
    }
}

/// Compute execution requirements of a shader.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComputeInfo {
    pub active: bool,
    /// Workgroup size.
    pub group_size: [u32; 2],
    /// Shared memory requirement, in bytes.
    pub shmem: usize,
    /// Whether the group size may still be adjusted by later merges.
    pub flexible: bool,
}

/// Finalized shader function: the mangled entry point name. The body and
/// header are read directly off the builder by the source generator.
#[derive(Debug, Clone)]
pub struct ShaderRes {
    pub name: String,
}

/// A shader in the process of being built. See the module docs.
pub struct ShaderBuilder {
    id: u8,
    fresh: u32,

    failed: bool,
    fail_reason: String,

    output: ShaderSig,
    output_w: u32,
    output_h: u32,

    pub(crate) vars: Vec<ShaderVar>,
    pub(crate) descs: Vec<ShaderDesc>,
    pub(crate) vas: Vec<ShaderVa>,

    pub(crate) header: String,
    pub(crate) body: String,

    compute: ComputeInfo,
    name: Option<String>,
}

impl ShaderBuilder {
    pub(crate) fn new(id: u8) -> Self {
        Self {
            id,
            fresh: 0,
            failed: false,
            fail_reason: String::new(),
            output: ShaderSig::None,
            output_w: 0,
            output_h: 0,
            vars: Vec::new(),
            descs: Vec::new(),
            vas: Vec::new(),
            header: String::new(),
            body: String::new(),
            compute: ComputeInfo::default(),
            name: None,
        }
    }

    /// Resets the builder for reuse, retaining buffer allocations.
    pub(crate) fn reset(&mut self, id: u8) {
        self.id = id;
        self.fresh = 0;
        self.failed = false;
        self.fail_reason.clear();
        self.output = ShaderSig::None;
        self.output_w = 0;
        self.output_h = 0;
        self.vars.clear();
        self.descs.clear();
        self.vas.clear();
        self.header.clear();
        self.body.clear();
        self.compute = ComputeInfo::default();
        self.name = None;
    }

    // =========================================================================
    // State queries
    // =========================================================================

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Why the shader failed, for logging.
    pub fn fail_reason(&self) -> &str {
        &self.fail_reason
    }

    pub fn output_sig(&self) -> ShaderSig {
        self.output
    }

    pub fn is_compute(&self) -> bool {
        self.compute.active
    }

    pub fn compute_group_size(&self) -> [u32; 2] {
        self.compute.group_size
    }

    pub fn compute_shmem(&self) -> usize {
        self.compute.shmem
    }

    /// Fixed output size, if the shader has declared one.
    pub fn output_size(&self) -> Option<(u32, u32)> {
        if self.output_w > 0 && self.output_h > 0 {
            Some((self.output_w, self.output_h))
        } else {
            None
        }
    }

    /// Marks the shader as failed. All further mutation is ignored and any
    /// dispatch of this builder returns an error.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.failed {
            self.failed = true;
            self.fail_reason = reason.into();
        }
    }

    // =========================================================================
    // Signature chaining
    // =========================================================================

    /// Declares an operation on this shader: the current output signature
    /// must match `input`, and the output size must be compatible with
    /// `w`x`h` (0 = don't care). On success the output becomes `Color`.
    pub fn require(&mut self, input: ShaderSig, w: u32, h: u32) -> bool {
        if self.failed {
            return false;
        }
        if (w > 0 && self.output_w > 0 && self.output_w != w)
            || (h > 0 && self.output_h > 0 && self.output_h != h)
        {
            self.fail(format!(
                "incompatible output size requirements {}x{} vs {w}x{h}",
                self.output_w, self.output_h
            ));
            return false;
        }
        if self.output != input {
            self.fail("missing or incompatible input signature");
            return false;
        }

        self.output = ShaderSig::Color;
        if self.output_w == 0 {
            self.output_w = w;
        }
        if self.output_h == 0 {
            self.output_h = h;
        }
        true
    }

    /// Forces the output signature (used by the engine when translating
    /// raster shaders to compute, where the color is consumed by an
    /// explicit image store).
    pub(crate) fn set_output_sig(&mut self, sig: ShaderSig) {
        self.output = sig;
    }

    pub(crate) fn set_output_size(&mut self, w: u32, h: u32) {
        self.output_w = w;
        self.output_h = h;
    }

    /// Requests compute execution with the given workgroup size. Returns
    /// false (without failing the shader) if the device can't satisfy the
    /// request or it conflicts with an earlier, inflexible one.
    pub fn try_compute(
        &mut self,
        bw: u32,
        bh: u32,
        flexible: bool,
        shmem: usize,
        caps: GpuCaps,
        limits: &GpuLimits,
    ) -> bool {
        if self.failed {
            return false;
        }
        if !caps.contains(GpuCaps::COMPUTE) {
            return false;
        }
        if bw * bh > limits.max_group_threads || self.compute.shmem + shmem > limits.max_shmem_size
        {
            return false;
        }

        if self.compute.active && self.compute.group_size != [bw, bh] {
            // Incompatible group sizes: the flexible side yields
            if !flexible && !self.compute.flexible {
                return false;
            }
            if !flexible {
                self.compute.group_size = [bw, bh];
                self.compute.flexible = false;
            }
        } else {
            self.compute.group_size = [bw, bh];
            self.compute.flexible = flexible;
        }

        self.compute.active = true;
        self.compute.shmem += shmem;
        true
    }

    // =========================================================================
    // Identifiers and source accumulation
    // =========================================================================

    /// Returns a fresh identifier mangled with this builder's namespace.
    pub fn fresh(&mut self, name: &str) -> String {
        let ident = format!("{}_{}_{}", name, self.id, self.fresh);
        self.fresh += 1;
        ident
    }

    /// Appends to the function body. Use via the [`glsl!`](crate::glsl) macro.
    pub fn append_body(&mut self, args: fmt::Arguments<'_>) {
        use fmt::Write;
        let _ = self.body.write_fmt(args);
    }

    /// Appends to the global header. Use via [`glsl_h!`](crate::glsl_h).
    pub fn append_header(&mut self, args: fmt::Arguments<'_>) {
        use fmt::Write;
        let _ = self.header.write_fmt(args);
    }

    // =========================================================================
    // Inputs
    // =========================================================================

    /// Attaches an input variable, returning its mangled identifier.
    pub fn var(&mut self, var: Var, data: Vec<u8>, dynamic: bool) -> String {
        let name = self.fresh(&var.name);
        let var = Var { name: name.clone(), ..var };
        self.vars.push(ShaderVar { var, data, dynamic });
        name
    }

    pub fn var_f32(&mut self, name: &str, value: f32, dynamic: bool) -> String {
        self.var(Var::float(name), value.to_ne_bytes().to_vec(), dynamic)
    }

    pub fn var_int(&mut self, name: &str, value: i32, dynamic: bool) -> String {
        self.var(Var::int(name), value.to_ne_bytes().to_vec(), dynamic)
    }

    pub fn var_vec2(&mut self, name: &str, value: [f32; 2], dynamic: bool) -> String {
        self.var(
            Var::vec2(name),
            bytemuck::cast_slice(&value).to_vec(),
            dynamic,
        )
    }

    pub fn var_vec3(&mut self, name: &str, value: [f32; 3], dynamic: bool) -> String {
        self.var(
            Var::vec3(name),
            bytemuck::cast_slice(&value).to_vec(),
            dynamic,
        )
    }

    pub fn var_vec4(&mut self, name: &str, value: [f32; 4], dynamic: bool) -> String {
        self.var(
            Var::vec4(name),
            bytemuck::cast_slice(&value).to_vec(),
            dynamic,
        )
    }

    pub fn var_ivec2(&mut self, name: &str, value: [i32; 2], dynamic: bool) -> String {
        self.var(
            Var::ivec2(name),
            bytemuck::cast_slice(&value).to_vec(),
            dynamic,
        )
    }

    /// Column-major 3x3 matrix variable.
    pub fn var_mat3(&mut self, name: &str, columns: [[f32; 3]; 3]) -> String {
        let mut data = Vec::with_capacity(36);
        for col in &columns {
            data.extend_from_slice(bytemuck::cast_slice(col));
        }
        self.var(Var::mat3(name), data, false)
    }

    /// Attaches a descriptor, returning its mangled identifier.
    pub fn desc(&mut self, desc: Desc, object: BindingObject) -> String {
        let name = self.fresh(&desc.name);
        let desc = Desc { name: name.clone(), ..desc };
        self.descs.push(ShaderDesc {
            desc,
            binding: DescBinding { object },
            memory: MemoryFlags::empty(),
            buffer_vars: Vec::new(),
        });
        name
    }

    pub(crate) fn desc_raw(&mut self, sd: ShaderDesc) -> String {
        let name = self.fresh(&sd.desc.name);
        let mut sd = sd;
        sd.desc.name = name.clone();
        self.descs.push(sd);
        name
    }

    /// Attaches a buffer block descriptor (UBO/SSBO) with its member
    /// variables, returning the block's mangled identifier. Member names
    /// live in global scope in GLSL, so callers should mangle them with
    /// [`ShaderBuilder::fresh`].
    pub fn desc_buffer(
        &mut self,
        desc: Desc,
        buffer: Arc<dyn glint_gpu::Buffer>,
        buffer_vars: Vec<(Var, VarLayout)>,
    ) -> String {
        let name = self.fresh(&desc.name);
        let desc = Desc { name: name.clone(), ..desc };
        self.descs.push(ShaderDesc {
            desc,
            binding: DescBinding {
                object: BindingObject::Buffer(buffer),
            },
            memory: MemoryFlags::empty(),
            buffer_vars,
        });
        name
    }

    /// Binds a texture for sampling, returning its identifier.
    pub fn bind_tex(&mut self, name: &str, tex: Arc<dyn Texture>) -> String {
        self.desc(Desc::sampled(name), BindingObject::Texture(tex))
    }

    /// Binds a texture for sampling together with a position attribute
    /// covering `rect` (in pixels of the texture), returning
    /// `(texture ident, position ident)`. The position is normalized to the
    /// texture's coordinate space.
    pub fn bind_tex_pos(
        &mut self,
        name: &str,
        tex: Arc<dyn Texture>,
        rect: RectF,
    ) -> (String, String) {
        let (w, h) = (tex.params().w as f32, tex.params().h as f32);
        let ident = self.bind_tex(name, tex);
        let pos = self.attr_vec2(
            &format!("{name}_pos"),
            RectF {
                x0: rect.x0 / w,
                y0: rect.y0 / h,
                x1: rect.x1 / w,
                y1: rect.y1 / h,
            },
        );
        (ident, pos)
    }

    /// Attaches a vec2 vertex attribute spanning the given rect over the
    /// implicit full quad, returning its mangled identifier.
    pub fn attr_vec2(&mut self, name: &str, rect: RectF) -> String {
        let name = self.fresh(name);
        let corner = |x: f32, y: f32| bytemuck::cast_slice(&[x, y]).to_vec();
        self.vas.push(ShaderVa {
            name: name.clone(),
            components: 2,
            data: [
                corner(rect.x0, rect.y0),
                corner(rect.x1, rect.y0),
                corner(rect.x0, rect.y1),
                corner(rect.x1, rect.y1),
            ],
        });
        name
    }

    /// Attaches a raw vertex attribute (no quad data), for user-supplied
    /// vertex streams.
    pub(crate) fn attr_raw(&mut self, name: String, components: usize) {
        self.vas.push(ShaderVa {
            name,
            components,
            data: Default::default(),
        });
    }

    // =========================================================================
    // Merging and finalization
    // =========================================================================

    /// Merges a completed sub-shader into this one as a callable function,
    /// returning the function's identifier. Returns `None` when merging is
    /// not possible (the caller should round-trip through a texture
    /// instead): mismatched namespaces, incompatible compute requirements,
    /// or conflicting fixed output sizes.
    pub fn subpass(&mut self, sub: &ShaderBuilder) -> Option<String> {
        if self.failed || sub.failed {
            return None;
        }
        if sub.output != ShaderSig::Color {
            return None;
        }
        // Distinct namespaces are required so mangled identifiers can't
        // collide; only uniquely-identified builders can merge
        if self.id == sub.id {
            return None;
        }
        if let (Some((w, h)), Some((sw, sh))) = (self.output_size(), sub.output_size()) {
            if (w, h) != (sw, sh) {
                return None;
            }
        }
        if sub.compute.active {
            if self.compute.active && self.compute.group_size != sub.compute.group_size {
                return None;
            }
            self.compute.active = true;
            self.compute.group_size = sub.compute.group_size;
            self.compute.flexible = self.compute.flexible && sub.compute.flexible;
            self.compute.shmem += sub.compute.shmem;
        }
        if let Some((w, h)) = sub.output_size() {
            self.output_w = w;
            self.output_h = h;
        }

        self.vars.extend(sub.vars.iter().cloned());
        self.descs.extend(sub.descs.iter().cloned());
        self.vas.extend(sub.vas.iter().cloned());

        let name = self.fresh("sub");
        self.header.push_str(&sub.header);
        use fmt::Write;
        let _ = write!(
            self.header,
            "vec4 {name}() {{\n{}return color;\n}}\n",
            sub.body
        );
        Some(name)
    }

    /// Finalizes the shader: fixes the entry point name. Idempotent.
    pub(crate) fn finalize(&mut self) -> ShaderRes {
        if self.name.is_none() {
            self.name = Some(self.fresh("sh_main"));
        }
        ShaderRes {
            name: self.name.clone().unwrap(),
        }
    }

    /// Stable content signature of this shader.
    ///
    /// Two builders that accumulated identical source and declared
    /// identical variables/descriptors/vertex attributes (and compute
    /// requirements) hash identically, regardless of the variable *data*.
    pub fn signature(&self) -> u64 {
        let mut h = ContentHasher::new();
        h.write_str(&self.header);
        h.write_str(&self.body);

        h.write_u64(self.vars.len() as u64);
        for sv in &self.vars {
            h.write_str(&sv.var.name);
            h.write_u8(match sv.var.ty {
                glint_gpu::VarType::Sint => 0,
                glint_gpu::VarType::Uint => 1,
                glint_gpu::VarType::Float => 2,
            });
            h.write_u64(sv.var.dim_v as u64);
            h.write_u64(sv.var.dim_m as u64);
            h.write_u64(sv.var.dim_a as u64);
            h.write_bool(sv.dynamic);
        }

        h.write_u64(self.descs.len() as u64);
        for sd in &self.descs {
            h.write_str(&sd.desc.name);
            h.write_u8(match sd.desc.ty {
                glint_gpu::DescType::SampledTex => 0,
                glint_gpu::DescType::StorageImg => 1,
                glint_gpu::DescType::BufUniform => 2,
                glint_gpu::DescType::BufStorage => 3,
                glint_gpu::DescType::BufTexelUniform => 4,
                glint_gpu::DescType::BufTexelStorage => 5,
            });
            h.write_u8(match sd.desc.access {
                glint_gpu::DescAccess::ReadOnly => 0,
                glint_gpu::DescAccess::WriteOnly => 1,
                glint_gpu::DescAccess::ReadWrite => 2,
            });
            h.write_u32(sd.memory.bits());
        }

        h.write_u64(self.vas.len() as u64);
        for va in &self.vas {
            h.write_str(&va.name);
            h.write_u64(va.components as u64);
        }

        h.write_u8(match self.output {
            ShaderSig::None => 0,
            ShaderSig::Color => 1,
        });
        h.write_u32(self.output_w);
        h.write_u32(self.output_h);
        h.write_bool(self.compute.active);
        h.write_u32(self.compute.group_size[0]);
        h.write_u32(self.compute.group_size[1]);
        h.write_u64(self.compute.shmem as u64);

        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glsl;

    #[test]
    fn test_fresh_idents_are_unique() {
        let mut sh = ShaderBuilder::new(1);
        let a = sh.fresh("x");
        let b = sh.fresh("x");
        assert_ne!(a, b);
    }

    #[test]
    fn test_require_chaining() {
        let mut sh = ShaderBuilder::new(0);
        assert!(sh.require(ShaderSig::None, 64, 64));
        assert_eq!(sh.output_sig(), ShaderSig::Color);
        assert!(sh.require(ShaderSig::Color, 64, 64));
        // Conflicting size
        assert!(!sh.require(ShaderSig::Color, 32, 32));
        assert!(sh.is_failed());
    }

    #[test]
    fn test_signature_ignores_var_data() {
        let mk = |val: f32| {
            let mut sh = ShaderBuilder::new(0);
            sh.require(ShaderSig::None, 0, 0);
            let v = sh.var_f32("scale", val, true);
            glsl!(sh, "vec4 color = vec4({v});\n");
            sh
        };
        // Identical structure, different data: same signature
        let mut a = mk(1.0);
        let mut b = mk(2.0);
        a.finalize();
        b.finalize();
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_signature_depends_on_body() {
        let mut a = ShaderBuilder::new(0);
        let mut b = ShaderBuilder::new(0);
        glsl!(a, "vec4 color = vec4(1.0);\n");
        glsl!(b, "vec4 color = vec4(0.0);\n");
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn test_subpass_requires_unique_namespaces() {
        let mut a = ShaderBuilder::new(0);
        let mut sub = ShaderBuilder::new(0);
        sub.require(ShaderSig::None, 0, 0);
        assert!(a.subpass(&sub).is_none());

        let mut sub2 = ShaderBuilder::new(1);
        sub2.require(ShaderSig::None, 0, 0);
        glsl!(sub2, "vec4 color = vec4(1.0);\n");
        let ident = a.subpass(&sub2).expect("mergeable");
        assert!(a.header.contains(&format!("vec4 {ident}()")));
    }
}
