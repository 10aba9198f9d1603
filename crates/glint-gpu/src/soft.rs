//! Pure-software GPU backend used by the test suites.
//!
//! `SoftGpu` does not execute any shader code. It validates parameters,
//! tracks resource creation, and records every pass run so tests can make
//! assertions about *what* the upper layers dispatched (pass counts,
//! compute promotion, binding budgets, cache behavior) without a real
//! device. Program "binaries" are synthesized deterministically from the
//! shader source so the dispatch cache save/load path is exercised
//! end-to-end.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use glint_core::hash::hash_bytes;
use glint_core::Rect;

use crate::buf::{BufParams, Buffer};
use crate::format::{Format, FormatCaps, FormatType};
use crate::gpu::{GlslVersion, Gpu, GpuCaps, GpuLimits};
use crate::pass::{Pass, PassParams, PassRunParams, PassType};
use crate::tex::{TexParams, Texture};
use crate::{GpuError, GpuResult};

static NEXT_TEX_ID: AtomicU64 = AtomicU64::new(1);

/// Texture handle created by [`SoftGpu`].
pub struct SoftTexture {
    id: u64,
    params: TexParams,
}

impl SoftTexture {
    /// Unique id of this texture, for test assertions.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Texture for SoftTexture {
    fn params(&self) -> &TexParams {
        &self.params
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Buffer handle created by [`SoftGpu`]. Reads and writes are real, backed
/// by host memory.
pub struct SoftBuffer {
    params: BufParams,
    data: RefCell<Vec<u8>>,
}

impl Buffer for SoftBuffer {
    fn params(&self) -> &BufParams {
        &self.params
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Pass handle created by [`SoftGpu`].
pub struct SoftPass {
    params: PassParams,
    program: Vec<u8>,
}

impl Pass for SoftPass {
    fn params(&self) -> &PassParams {
        &self.params
    }

    fn cached_program(&self) -> Option<&[u8]> {
        Some(&self.program)
    }
}

/// One recorded `pass_run` invocation.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub ty: PassType,
    /// Id of the target texture, for raster passes.
    pub target: Option<u64>,
    pub scissors: Rect,
    pub compute_groups: [u32; 3],
    pub push_constants_len: usize,
    pub var_updates: usize,
    pub vertex_count: usize,
}

#[derive(Debug, Default, Clone)]
struct Counters {
    tex_creates: u64,
    buf_creates: u64,
    pass_creates: u64,
    /// Pass creations that had no cached program attached, i.e. would have
    /// hit the backend shader compiler.
    program_compiles: u64,
    pass_runs: u64,
}

/// Builder for a [`SoftGpu`] with non-default capabilities.
pub struct SoftGpuBuilder {
    caps: GpuCaps,
    glsl: GlslVersion,
    limits: GpuLimits,
    formats: Vec<Arc<Format>>,
}

impl SoftGpuBuilder {
    pub fn caps(mut self, caps: GpuCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn glsl(mut self, glsl: GlslVersion) -> Self {
        self.glsl = glsl;
        self
    }

    pub fn limits(mut self, limits: GpuLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn max_pushc_size(mut self, size: usize) -> Self {
        self.limits.max_pushc_size = size;
        self
    }

    pub fn max_ubo_size(mut self, size: usize) -> Self {
        self.limits.max_ubo_size = size;
        self
    }

    /// Replaces the format table.
    pub fn formats(mut self, formats: Vec<Arc<Format>>) -> Self {
        self.formats = formats;
        self
    }

    /// Strips a capability from every format (e.g. `STORABLE` to model a
    /// device without image load/store).
    pub fn strip_format_caps(mut self, caps: FormatCaps) -> Self {
        self.formats = self
            .formats
            .iter()
            .map(|fmt| {
                let mut f = (**fmt).clone();
                f.caps.remove(caps);
                Arc::new(f)
            })
            .collect();
        self
    }

    pub fn build(self) -> SoftGpu {
        SoftGpu {
            caps: self.caps,
            glsl: self.glsl,
            limits: self.limits,
            formats: self.formats,
            counters: RefCell::new(Counters::default()),
            runs: RefCell::new(Vec::new()),
            passes: RefCell::new(Vec::new()),
            fail_tex_creates: Cell::new(0),
            fail_pass_creates: Cell::new(0),
            failed: Cell::new(false),
        }
    }
}

/// The software backend. See the module docs.
pub struct SoftGpu {
    caps: GpuCaps,
    glsl: GlslVersion,
    limits: GpuLimits,
    formats: Vec<Arc<Format>>,

    counters: RefCell<Counters>,
    runs: RefCell<Vec<RunRecord>>,
    passes: RefCell<Vec<PassParams>>,

    fail_tex_creates: Cell<u32>,
    fail_pass_creates: Cell<u32>,
    failed: Cell<bool>,
}

impl Default for SoftGpu {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SoftGpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> SoftGpuBuilder {
        SoftGpuBuilder {
            caps: GpuCaps::COMPUTE
                | GpuCaps::PARALLEL_COMPUTE
                | GpuCaps::INPUT_VARIABLES
                | GpuCaps::SUBGROUPS,
            glsl: GlslVersion::default(),
            limits: GpuLimits::default(),
            formats: Self::default_formats(),
        }
    }

    /// The default format table, sorted best-first within each class.
    pub fn default_formats() -> Vec<Arc<Format>> {
        fn fmt(
            name: &'static str,
            ty: FormatType,
            comps: usize,
            depth: u8,
            caps: FormatCaps,
            glsl_type: &'static str,
            glsl_format: Option<&'static str>,
        ) -> Arc<Format> {
            let mut component_depth = [0u8; 4];
            component_depth[..comps].fill(depth);
            Arc::new(Format {
                name,
                ty,
                num_components: comps,
                component_depth,
                texel_size: comps * (depth as usize).div_ceil(8),
                caps,
                glsl_type,
                glsl_format,
            })
        }

        use FormatType::*;
        let sample = FormatCaps::SAMPLEABLE | FormatCaps::LINEAR | FormatCaps::BLITTABLE;
        let render = sample
            | FormatCaps::RENDERABLE
            | FormatCaps::BLENDABLE
            | FormatCaps::HOST_READABLE;
        let storage = render | FormatCaps::STORABLE;

        vec![
            fmt("r8", Unorm, 1, 8, render, "float", Some("r8")),
            fmt("rg8", Unorm, 2, 8, render, "vec2", Some("rg8")),
            fmt("rgb8", Unorm, 3, 8, sample | FormatCaps::RENDERABLE, "vec3", None),
            fmt("rgba8", Unorm, 4, 8, storage, "vec4", Some("rgba8")),
            fmt("r16", Unorm, 1, 16, render, "float", Some("r16")),
            fmt("rg16", Unorm, 2, 16, render, "vec2", Some("rg16")),
            fmt("rgba16", Unorm, 4, 16, storage, "vec4", Some("rgba16")),
            fmt("r16f", Float, 1, 16, storage, "float", Some("r16f")),
            fmt("rg16f", Float, 2, 16, storage, "vec2", Some("rg16f")),
            fmt("rgb16f", Float, 3, 16, sample | FormatCaps::RENDERABLE, "vec3", None),
            fmt("rgba16f", Float, 4, 16, storage, "vec4", Some("rgba16f")),
            fmt("r32f", Float, 1, 32, storage, "float", Some("r32f")),
            fmt("rgba32f", Float, 4, 32, storage, "vec4", Some("rgba32f")),
        ]
    }

    /// Looks up a format by name; panics if absent (test convenience).
    pub fn format(&self, name: &str) -> Arc<Format> {
        self.formats
            .iter()
            .find(|f| f.name == name)
            .unwrap_or_else(|| panic!("SoftGpu has no format named {name:?}"))
            .clone()
    }

    /// Makes the next `n` texture creations fail.
    pub fn fail_next_tex_creates(&self, n: u32) {
        self.fail_tex_creates.set(n);
    }

    /// Makes the next `n` pass creations fail.
    pub fn fail_next_pass_creates(&self, n: u32) {
        self.fail_pass_creates.set(n);
    }

    /// Marks the device as lost.
    pub fn set_failed(&self) {
        self.failed.set(true);
    }

    pub fn tex_creates(&self) -> u64 {
        self.counters.borrow().tex_creates
    }

    pub fn buf_creates(&self) -> u64 {
        self.counters.borrow().buf_creates
    }

    pub fn pass_creates(&self) -> u64 {
        self.counters.borrow().pass_creates
    }

    /// Number of pass creations that required backend shader compilation
    /// (no cached program was attached).
    pub fn program_compiles(&self) -> u64 {
        self.counters.borrow().program_compiles
    }

    pub fn pass_runs(&self) -> u64 {
        self.counters.borrow().pass_runs
    }

    /// All recorded runs, in submission order.
    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.borrow().clone()
    }

    /// Parameters of every created pass, in creation order.
    pub fn created_passes(&self) -> Vec<PassParams> {
        self.passes.borrow().clone()
    }

    pub fn reset_recording(&self) {
        *self.counters.borrow_mut() = Counters::default();
        self.runs.borrow_mut().clear();
        self.passes.borrow_mut().clear();
    }

    /// Id of a texture handle created by this backend.
    pub fn tex_id(tex: &Arc<dyn Texture>) -> Option<u64> {
        tex.as_any().downcast_ref::<SoftTexture>().map(|t| t.id)
    }
}

impl Gpu for SoftGpu {
    fn caps(&self) -> GpuCaps {
        self.caps
    }

    fn glsl(&self) -> GlslVersion {
        self.glsl
    }

    fn limits(&self) -> &GpuLimits {
        &self.limits
    }

    fn formats(&self) -> &[Arc<Format>] {
        &self.formats
    }

    fn tex_create(&self, params: &TexParams) -> GpuResult<Arc<dyn Texture>> {
        if self.fail_tex_creates.get() > 0 {
            self.fail_tex_creates.set(self.fail_tex_creates.get() - 1);
            return Err(GpuError::TexCreate("injected failure".into()));
        }
        if params.w == 0 || params.w > self.limits.max_tex_2d_dim {
            return Err(GpuError::TexCreate(format!("bad width {}", params.w)));
        }
        if params.renderable && !params.format.caps.contains(FormatCaps::RENDERABLE) {
            return Err(GpuError::TexCreate(format!(
                "format {} is not renderable",
                params.format.name
            )));
        }
        if params.storable && !params.format.caps.contains(FormatCaps::STORABLE) {
            return Err(GpuError::TexCreate(format!(
                "format {} is not storable",
                params.format.name
            )));
        }

        self.counters.borrow_mut().tex_creates += 1;
        Ok(Arc::new(SoftTexture {
            id: NEXT_TEX_ID.fetch_add(1, Ordering::Relaxed),
            params: params.clone(),
        }))
    }

    fn tex_clear(&self, _tex: &Arc<dyn Texture>, _color: [f32; 4]) -> GpuResult<()> {
        Ok(())
    }

    fn tex_blit(
        &self,
        _dst: &Arc<dyn Texture>,
        _dst_rect: Rect,
        _src: &Arc<dyn Texture>,
        _src_rect: Rect,
    ) -> GpuResult<()> {
        Ok(())
    }

    fn tex_upload(&self, _tex: &Arc<dyn Texture>, _data: &[u8]) -> GpuResult<()> {
        Ok(())
    }

    fn tex_download(&self, _tex: &Arc<dyn Texture>, _data: &mut [u8]) -> GpuResult<()> {
        Ok(())
    }

    fn buf_create(&self, params: &BufParams) -> GpuResult<Arc<dyn Buffer>> {
        if params.size == 0 || params.size > self.limits.max_buf_size {
            return Err(GpuError::BufCreate(format!("bad size {}", params.size)));
        }
        self.counters.borrow_mut().buf_creates += 1;
        Ok(Arc::new(SoftBuffer {
            params: params.clone(),
            data: RefCell::new(vec![0; params.size]),
        }))
    }

    fn buf_write(&self, buf: &Arc<dyn Buffer>, offset: usize, data: &[u8]) -> GpuResult<()> {
        let soft = buf
            .as_any()
            .downcast_ref::<SoftBuffer>()
            .ok_or_else(|| GpuError::Transfer("foreign buffer handle".into()))?;
        let mut store = soft.data.borrow_mut();
        if offset + data.len() > store.len() {
            return Err(GpuError::Transfer("write out of bounds".into()));
        }
        store[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn buf_read(&self, buf: &Arc<dyn Buffer>, offset: usize, out: &mut [u8]) -> GpuResult<()> {
        let soft = buf
            .as_any()
            .downcast_ref::<SoftBuffer>()
            .ok_or_else(|| GpuError::Transfer("foreign buffer handle".into()))?;
        let store = soft.data.borrow();
        if offset + out.len() > store.len() {
            return Err(GpuError::Transfer("read out of bounds".into()));
        }
        out.copy_from_slice(&store[offset..offset + out.len()]);
        Ok(())
    }

    fn buf_copy(
        &self,
        dst: &Arc<dyn Buffer>,
        dst_offset: usize,
        src: &Arc<dyn Buffer>,
        src_offset: usize,
        size: usize,
    ) -> GpuResult<()> {
        let mut tmp = vec![0; size];
        self.buf_read(src, src_offset, &mut tmp)?;
        self.buf_write(dst, dst_offset, &tmp)
    }

    fn pass_create(&self, params: PassParams) -> GpuResult<Arc<dyn Pass>> {
        if self.fail_pass_creates.get() > 0 {
            self.fail_pass_creates.set(self.fail_pass_creates.get() - 1);
            return Err(GpuError::PassCreate("injected failure".into()));
        }
        if params.push_constants_size > self.limits.max_pushc_size {
            return Err(GpuError::PassCreate(format!(
                "push constants {} exceed limit {}",
                params.push_constants_size, self.limits.max_pushc_size
            )));
        }
        if params.ty == PassType::Raster && params.target_format.is_none() {
            return Err(GpuError::PassCreate("raster pass without target format".into()));
        }

        // Deterministic stand-in for a driver-compiled binary
        let program = match &params.cached_program {
            Some(cached) => cached.clone(),
            None => {
                self.counters.borrow_mut().program_compiles += 1;
                let h = hash_bytes(params.glsl_shader.as_bytes());
                h.to_le_bytes()
                    .iter()
                    .chain(h.to_be_bytes().iter())
                    .copied()
                    .collect()
            }
        };

        self.counters.borrow_mut().pass_creates += 1;
        self.passes.borrow_mut().push(params.clone());
        Ok(Arc::new(SoftPass { params, program }))
    }

    fn pass_run(&self, params: &PassRunParams) -> GpuResult<()> {
        let pass_params = params.pass.params();
        self.counters.borrow_mut().pass_runs += 1;
        self.runs.borrow_mut().push(RunRecord {
            ty: pass_params.ty,
            target: params.target.as_ref().and_then(SoftGpu::tex_id),
            scissors: params.scissors,
            compute_groups: params.compute_groups,
            push_constants_len: params.push_constants.len(),
            var_updates: params.var_updates.len(),
            vertex_count: params.vertex_count,
        });
        Ok(())
    }

    fn finish(&self) {}

    fn is_failed(&self) -> bool {
        self.failed.get()
    }
}
