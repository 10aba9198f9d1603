//! The dispatch engine: pass compilation, caching and execution.

use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use glint_core::Rect;
use glint_gpu::{
    host_layout, memcpy_layout, std140_layout, std430_layout, BindingObject, BlendParams, Buffer,
    BufParams, Desc, DescAccess, Gpu, GpuCaps, PassParams, PassRunParams, PassType, PrimitiveType,
    Texture, Timer, Var, VarLayout, VarUpdate, VertexAttrib,
};

use crate::generate::{generate_shaders, GenBuffers};
use crate::shader::{ShaderBuilder, ShaderSig, ShaderVar};
use crate::{glsl, glsl_h, DispatchError, DispatchResult};

/// Maximum number of compiled passes to keep around at once. When full,
/// passes older than [`MIN_AGE`] are evicted to make room; failing that,
/// the cache size doubles.
const MAX_PASSES: usize = 100;
const MIN_AGE: u8 = 10;

/// Where a variable ended up being bound.
#[derive(Debug, Clone, Copy)]
pub(crate) enum VarPlacement {
    /// Loose/global uniform, by index into the pass variable list.
    Global { index: usize },
    /// Uniform buffer, at the given std140 layout.
    Ubo(VarLayout),
    /// Push constants, at the given std430 layout.
    Push(VarLayout),
}

/// Cached placement and last-uploaded data for one variable.
pub(crate) struct PassVar {
    pub(crate) placement: Option<VarPlacement>,
    cached: Option<Vec<u8>>,
}

/// A compiled (or failed) pass, cached under its signature.
struct CompiledPass {
    signature: u64,
    /// `None` when compilation failed; kept so lookup short-circuits.
    pass: Option<Arc<dyn glint_gpu::Pass>>,
    last_index: u8,

    vars: Vec<PassVar>,
    ubo: Option<Arc<dyn Buffer>>,

    /// Pre-allocated run parameters, reused across runs.
    run: Option<PassRunParams>,
    /// Placed offset of each vertex attribute, for quad streaming.
    va_offsets: Vec<usize>,
}

/// A program binary loaded from a cache blob, not yet attached to a pass.
struct CachedProgram {
    signature: u64,
    program: Vec<u8>,
}

/// Parameters for [`Dispatch::finish`].
pub struct DispatchParams {
    pub shader: ShaderBuilder,
    pub target: Arc<dyn Texture>,
    /// Render region; the zero rect means the whole target. May be flipped.
    pub rect: Rect,
    pub blend: Option<BlendParams>,
    pub timer: Option<Arc<dyn Timer>>,
}

/// Parameters for [`Dispatch::dispatch_compute`].
pub struct ComputeDispatchParams {
    pub shader: ShaderBuilder,
    /// Dispatch size in workgroups. All-zero means "derive from
    /// `width`/`height` and the workgroup size".
    pub dispatch_size: [u32; 3],
    /// Effective render area, required when the shader uses vertex
    /// attributes or an implicit dispatch size.
    pub width: u32,
    pub height: u32,
    pub timer: Option<Arc<dyn Timer>>,
}

/// Coordinate space of user-supplied vertex positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexCoords {
    /// Pixel coordinates of the target.
    Absolute,
    /// [0, 1] relative to the target.
    Relative,
    /// Native NDC, [-1, 1].
    Normalized,
}

/// A vertex attribute description for user vertex streams.
#[derive(Debug, Clone)]
pub struct UserVertexAttrib {
    pub name: String,
    /// Component count, 1..4 (32-bit floats).
    pub components: usize,
    /// Byte offset within one vertex.
    pub offset: usize,
}

/// Parameters for [`Dispatch::dispatch_vertex`].
pub struct VertexDispatchParams {
    pub shader: ShaderBuilder,
    pub target: Arc<dyn Texture>,
    pub scissors: Rect,
    pub blend: Option<BlendParams>,

    pub vertex_attribs: Vec<UserVertexAttrib>,
    /// Index into `vertex_attribs` of the position (must be a vec2).
    pub vertex_position_idx: usize,
    pub vertex_stride: usize,
    pub vertex_type: PrimitiveType,
    pub vertex_coords: VertexCoords,
    /// Whether the coordinates are flipped along Y.
    pub vertex_flipped: bool,

    pub vertex_data: Vec<u8>,
    pub vertex_count: usize,

    pub timer: Option<Arc<dyn Timer>>,
}

/// Extra lookup key material for vertex dispatches.
struct VertexKey {
    vertex_type: PrimitiveType,
    vertex_stride: usize,
}

/// The shader dispatch engine. See the crate docs.
pub struct Dispatch {
    gpu: Arc<dyn Gpu>,

    /// Builder free-list, to avoid reallocating their buffers.
    shaders: Vec<ShaderBuilder>,
    passes: Vec<CompiledPass>,
    cached_programs: Vec<CachedProgram>,

    current_ident: u8,
    current_index: u8,
    max_passes: usize,

    gen_bufs: GenBuffers,
    /// Scratch for strided UBO uploads.
    tmp: Vec<u8>,
}

impl Dispatch {
    pub fn new(gpu: Arc<dyn Gpu>) -> Self {
        Self {
            gpu,
            shaders: Vec::new(),
            passes: Vec::new(),
            cached_programs: Vec::new(),
            current_ident: 0,
            current_index: 0,
            max_passes: MAX_PASSES,
            gen_bufs: GenBuffers::default(),
            tmp: Vec::new(),
        }
    }

    pub fn gpu(&self) -> &Arc<dyn Gpu> {
        &self.gpu
    }

    /// Number of cached compiled passes (including failed ones).
    pub fn num_passes(&self) -> usize {
        self.passes.len()
    }

    /// Returns a builder from the free-list. With `unique`, the builder
    /// gets a fresh identifier namespace, which is required for shaders
    /// that will be merged into others as sub-passes.
    pub fn begin(&mut self, unique: bool) -> ShaderBuilder {
        let id = if unique {
            self.current_ident = self.current_ident.wrapping_add(1);
            self.current_ident
        } else {
            0
        };

        match self.shaders.pop() {
            Some(mut sh) => {
                sh.reset(id);
                sh
            }
            None => ShaderBuilder::new(id),
        }
    }

    /// Returns a builder to the free-list without dispatching it.
    pub fn abort(&mut self, shader: ShaderBuilder) {
        self.shaders.push(shader);
    }

    /// Marks a frame boundary: resets per-frame identifier allocation and
    /// bumps the epoch used for pass-cache eviction.
    pub fn reset_frame(&mut self) {
        self.current_ident = 0;
        self.current_index = self.current_index.wrapping_add(1);
    }

    // =========================================================================
    // Dispatch entry points
    // =========================================================================

    /// Compiles and runs a shader so that it renders to a 2D region of a
    /// renderable target. On storable targets, fragment shaders may be
    /// transparently promoted to 16x16 compute shaders when the device
    /// supports parallel compute.
    pub fn finish(&mut self, params: DispatchParams) -> DispatchResult<()> {
        let DispatchParams {
            mut shader,
            target,
            rect,
            blend,
            timer,
        } = params;
        let result = self.finish_inner(&mut shader, target, rect, blend, timer);
        self.abort(shader);
        result
    }

    fn finish_inner(
        &mut self,
        sh: &mut ShaderBuilder,
        target: Arc<dyn Texture>,
        rect: Rect,
        blend: Option<BlendParams>,
        timer: Option<Arc<dyn Timer>>,
    ) -> DispatchResult<()> {
        if sh.is_failed() {
            error!("trying to dispatch a failed shader: {}", sh.fail_reason());
            return Err(DispatchError::FailedShader);
        }
        if sh.output_sig() != ShaderSig::Color {
            return Err(DispatchError::Incompatible(
                "dispatch target requires a color-producing shader".into(),
            ));
        }

        let tpars = target.params().clone();
        if tpars.dimension() != 2 || !tpars.renderable {
            return Err(DispatchError::BadTarget(
                "target must be a renderable 2D texture".into(),
            ));
        }

        let caps = self.gpu.caps();
        if sh.is_compute() && !tpars.storable {
            return Err(DispatchError::BadTarget(
                "compute shaders require a storable target".into(),
            ));
        } else if tpars.storable && caps.contains(GpuCaps::PARALLEL_COMPUTE) && !sh.is_compute() {
            if sh.try_compute(16, 16, true, 0, caps, self.gpu.limits()) {
                trace!("upgrading fragment shader to compute shader");
            }
        }

        let mut rc = rect;
        if rc.w() == 0 {
            rc.x0 = 0;
            rc.x1 = tpars.w as i32;
        }
        if rc.h() == 0 {
            rc.y0 = 0;
            rc.y1 = tpars.h as i32;
        }

        let (tw, th) = (rc.w().unsigned_abs(), rc.h().unsigned_abs());
        if let Some((w, h)) = sh.output_size() {
            if (w, h) != (tw, th) {
                return Err(DispatchError::Incompatible(format!(
                    "shader requires output size {w}x{h}, target rect is {tw}x{th}"
                )));
            }
        }

        let vert_pos = if sh.is_compute() {
            translate_compute_shader(sh, rc, &target, blend.as_ref());
            None
        } else {
            // Vertex positions encoding the render region in NDC
            Some(sh.attr_vec2(
                "position",
                glint_core::RectF {
                    x0: 2.0 * rc.x0 as f32 / tpars.w as f32 - 1.0,
                    y0: 2.0 * rc.y0 as f32 / tpars.h as f32 - 1.0,
                    x1: 2.0 * rc.x1 as f32 / tpars.w as f32 - 1.0,
                    y1: 2.0 * rc.y1 as f32 / tpars.h as f32 - 1.0,
                },
            ))
        };

        // The target must be loaded when blending, or when rendering to a
        // scissored sub-rect
        let full = Rect::new(0, 0, tpars.w as i32, tpars.h as i32);
        let mut rc_norm = rc.normalized();
        rc_norm.x0 = rc_norm.x0.max(0);
        rc_norm.y0 = rc_norm.y0.max(0);
        rc_norm.x1 = rc_norm.x1.min(tpars.w as i32);
        rc_norm.y1 = rc_norm.y1.min(tpars.h as i32);
        let load = blend.is_some() || rc_norm != full;

        let idx = self.find_pass(sh, Some(&target), vert_pos.as_deref(), blend, load, None, None)?;
        if self.passes[idx].pass.is_none() {
            return Err(DispatchError::PassFailed);
        }

        self.update_run_state(idx, sh)?;
        let cp = &mut self.passes[idx];
        let run = cp.run.as_mut().expect("compiled pass has run params");

        // Stream the quad corner data at the placed offsets
        if !run.vertex_data.is_empty() {
            let stride = run.vertex_data.len() / 4;
            for (va, &offset) in sh.vas.iter().zip(&cp.va_offsets) {
                let size = va.texel_size();
                for corner in 0..4 {
                    let at = corner * stride + offset;
                    run.vertex_data[at..at + size].copy_from_slice(&va.data[corner]);
                }
            }
        }

        if sh.is_compute() {
            // Round up so no part of the target is left off
            let [bw, bh] = sh.compute_group_size();
            run.compute_groups = [tw.div_ceil(bw), th.div_ceil(bh), 1];
        } else {
            run.scissors = rc_norm;
        }

        run.target = Some(target);
        run.timer = timer;
        self.gpu.pass_run(run)?;
        Ok(())
    }

    /// Dispatches a compute shader without a framebuffer target.
    pub fn dispatch_compute(&mut self, params: ComputeDispatchParams) -> DispatchResult<()> {
        let ComputeDispatchParams {
            mut shader,
            dispatch_size,
            width,
            height,
            timer,
        } = params;
        let result = self.compute_inner(&mut shader, dispatch_size, width, height, timer);
        self.abort(shader);
        result
    }

    fn compute_inner(
        &mut self,
        sh: &mut ShaderBuilder,
        dispatch_size: [u32; 3],
        width: u32,
        height: u32,
        timer: Option<Arc<dyn Timer>>,
    ) -> DispatchResult<()> {
        if sh.is_failed() {
            error!("trying to dispatch a failed shader: {}", sh.fail_reason());
            return Err(DispatchError::FailedShader);
        }
        if !sh.is_compute() {
            return Err(DispatchError::Incompatible(
                "dispatch_compute requires a compute shader".into(),
            ));
        }
        if !sh.vas.is_empty() {
            if width == 0 || height == 0 {
                return Err(DispatchError::Incompatible(
                    "compute shaders using vertex attributes require an effective render area"
                        .into(),
                ));
            }
            compute_vertex_attribs(sh, width, height);
        }

        let idx = self.find_pass(sh, None, None, None, false, None, None)?;
        if self.passes[idx].pass.is_none() {
            return Err(DispatchError::PassFailed);
        }

        self.update_run_state(idx, sh)?;
        let cp = &mut self.passes[idx];
        let run = cp.run.as_mut().expect("compiled pass has run params");

        let groups: u32 = dispatch_size.iter().product();
        if groups > 0 {
            run.compute_groups = dispatch_size;
        } else {
            debug_assert!(width > 0 && height > 0);
            let [bw, bh] = sh.compute_group_size();
            run.compute_groups = [width.div_ceil(bw), height.div_ceil(bh), 1];
        }

        run.target = None;
        run.timer = timer;
        self.gpu.pass_run(run)?;
        Ok(())
    }

    /// Dispatches a shader against a user-supplied vertex stream.
    pub fn dispatch_vertex(&mut self, params: VertexDispatchParams) -> DispatchResult<()> {
        let VertexDispatchParams {
            mut shader,
            target,
            scissors,
            blend,
            vertex_attribs,
            vertex_position_idx,
            vertex_stride,
            vertex_type,
            vertex_coords,
            vertex_flipped,
            vertex_data,
            vertex_count,
            timer,
        } = params;
        let result = self.vertex_inner(
            &mut shader,
            target,
            scissors,
            blend,
            &vertex_attribs,
            vertex_position_idx,
            vertex_stride,
            vertex_type,
            vertex_coords,
            vertex_flipped,
            vertex_data,
            vertex_count,
            timer,
        );
        self.abort(shader);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn vertex_inner(
        &mut self,
        sh: &mut ShaderBuilder,
        target: Arc<dyn Texture>,
        scissors: Rect,
        blend: Option<BlendParams>,
        vertex_attribs: &[UserVertexAttrib],
        vertex_position_idx: usize,
        vertex_stride: usize,
        vertex_type: PrimitiveType,
        vertex_coords: VertexCoords,
        vertex_flipped: bool,
        vertex_data: Vec<u8>,
        vertex_count: usize,
        timer: Option<Arc<dyn Timer>>,
    ) -> DispatchResult<()> {
        if sh.is_failed() {
            error!("trying to dispatch a failed shader: {}", sh.fail_reason());
            return Err(DispatchError::FailedShader);
        }
        if sh.output_sig() != ShaderSig::Color {
            return Err(DispatchError::Incompatible(
                "vertex dispatch requires a color-producing shader".into(),
            ));
        }
        if sh.is_compute() {
            return Err(DispatchError::Incompatible(
                "cannot dispatch a compute shader with vertices".into(),
            ));
        }
        if !sh.vas.is_empty() {
            return Err(DispatchError::BadVertices(
                "shader already has attached vertex attributes".into(),
            ));
        }
        let tpars = target.params().clone();
        if tpars.dimension() != 2 || !tpars.renderable {
            return Err(DispatchError::BadTarget(
                "target must be a renderable 2D texture".into(),
            ));
        }
        if vertex_position_idx >= vertex_attribs.len() {
            return Err(DispatchError::BadVertices(
                "vertex position index out of range".into(),
            ));
        }

        // Attach the user attributes manually (no implicit quad data)
        for attr in vertex_attribs {
            sh.attr_raw(attr.name.clone(), attr.components);
        }

        // Coordinate projection into NDC
        let (w, h) = (tpars.w as f32, tpars.h as f32);
        let mut mat = [1.0f32, 1.0];
        let mut off = [0.0f32, 0.0];
        match vertex_coords {
            VertexCoords::Absolute => {
                mat = [2.0 / w, 2.0 / h];
                off = [-1.0, -1.0];
            }
            VertexCoords::Relative => {
                mat = [2.0, 2.0];
                off = [-1.0, -1.0];
            }
            VertexCoords::Normalized => {}
        }
        if vertex_flipped {
            mat[1] = -mat[1];
            off[1] += 2.0;
        }

        let identity = mat == [1.0, 1.0] && off == [0.0, 0.0];
        let out_proj = if identity {
            None
        } else {
            // Row-major 3x3 projection, stored column-major for GLSL
            Some(sh.var_mat3(
                "proj",
                [
                    [mat[0], 0.0, 0.0],
                    [0.0, mat[1], 0.0],
                    [off[0], off[1], 1.0],
                ],
            ))
        };

        let vert_pos = vertex_attribs[vertex_position_idx].name.clone();
        let key = VertexKey {
            vertex_type,
            vertex_stride,
        };
        let idx = self.find_pass(
            sh,
            Some(&target),
            Some(&vert_pos),
            blend,
            true,
            Some((&key, vertex_attribs)),
            out_proj.as_deref(),
        )?;
        if self.passes[idx].pass.is_none() {
            return Err(DispatchError::PassFailed);
        }

        self.update_run_state(idx, sh)?;
        let cp = &mut self.passes[idx];
        let run = cp.run.as_mut().expect("compiled pass has run params");

        let mut sc = scissors;
        if vertex_flipped {
            sc.y0 = tpars.h as i32 - sc.y0;
            sc.y1 = tpars.h as i32 - sc.y1;
        }
        run.scissors = sc.normalized();
        run.vertex_data = vertex_data;
        run.vertex_count = vertex_count;
        run.target = Some(target);
        run.timer = timer;
        self.gpu.pass_run(run)?;
        Ok(())
    }

    // =========================================================================
    // Pass lookup and creation
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    fn find_pass(
        &mut self,
        sh: &mut ShaderBuilder,
        target: Option<&Arc<dyn Texture>>,
        vert_pos: Option<&str>,
        blend: Option<BlendParams>,
        load: bool,
        vparams: Option<(&VertexKey, &[UserVertexAttrib])>,
        out_proj: Option<&str>,
    ) -> DispatchResult<usize> {
        let signature = sh.signature();

        for (i, p) in self.passes.iter_mut().enumerate() {
            if p.signature != signature {
                continue;
            }

            // Failed passes match on signature alone
            let Some(pass) = &p.pass else {
                p.last_index = self.current_index;
                return Ok(i);
            };

            if sh.is_compute() {
                p.last_index = self.current_index;
                return Ok(i);
            }

            let pp = pass.params();
            let target = target.expect("raster lookup without target");
            let mut ok = match &pp.target_format {
                Some(fmt) => fmt.is(&target.params().format),
                None => false,
            };
            ok &= pp.blend == blend;
            ok &= pp.load_target == load;
            if let Some((key, _)) = vparams {
                ok &= pp.vertex_type == key.vertex_type;
                ok &= pp.vertex_stride == key.vertex_stride;
            }
            if ok {
                p.last_index = self.current_index;
                return Ok(i);
            }
        }

        self.create_pass(sh, signature, target, vert_pos, blend, load, vparams, out_proj)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_pass(
        &mut self,
        sh: &mut ShaderBuilder,
        signature: u64,
        target: Option<&Arc<dyn Texture>>,
        vert_pos: Option<&str>,
        blend: Option<BlendParams>,
        load: bool,
        vparams: Option<(&VertexKey, &[UserVertexAttrib])>,
        out_proj: Option<&str>,
    ) -> DispatchResult<usize> {
        let is_compute = sh.is_compute();
        let mut params = PassParams {
            ty: if is_compute { PassType::Compute } else { PassType::Raster },
            glsl_shader: String::new(),
            vertex_shader: None,
            variables: Vec::new(),
            descriptors: Vec::new(),
            vertex_attribs: Vec::new(),
            vertex_stride: vparams.map_or(0, |(key, _)| key.vertex_stride),
            vertex_type: vparams.map_or(PrimitiveType::TriangleStrip, |(key, _)| key.vertex_type),
            push_constants_size: 0,
            blend,
            load_target: load,
            target_format: target.map(|t| t.params().format.clone()),
            compute_group_size: sh.compute_group_size(),
            compute_shmem: sh.compute_shmem(),
            cached_program: None,
        };

        // Re-attach a previously loaded program binary, if any
        if let Some(pos) = self
            .cached_programs
            .iter()
            .position(|c| c.signature == signature)
        {
            debug!("re-using cached program with signature {signature:#018x}");
            params.cached_program = Some(self.cached_programs.swap_remove(pos).program);
        }

        // Vertex attribute placement
        let mut va_offsets = Vec::new();
        if !is_compute {
            let mut va_loc = 0usize;
            for (i, va) in sh.vas.iter().enumerate() {
                let offset = match vparams {
                    Some((_, attribs)) => attribs[i].offset,
                    None => {
                        let at = params.vertex_stride;
                        params.vertex_stride += va.texel_size();
                        at
                    }
                };
                va_offsets.push(offset);

                params.vertex_attribs.push(VertexAttrib {
                    // Mangled so it can't conflict with the fragment-side
                    // varying of the same attribute
                    name: format!("{}_v", va.name),
                    components: va.components,
                    offset,
                    location: va_loc,
                });

                // Each attribute consumes one location per vec4 it spans
                va_loc += va.texel_size().div_ceil(16);
            }
        }

        // Variable placement: first pass places only what definitely
        // belongs in push constants, the second greedily places the rest
        let mut pass_vars: Vec<PassVar> = sh
            .vars
            .iter()
            .map(|_| PassVar {
                placement: None,
                cached: None,
            })
            .collect();
        let mut ubo_size = 0usize;

        let mut placement_err = None;
        for greedy in [false, true] {
            for (sv, pv) in sh.vars.iter().zip(pass_vars.iter_mut()) {
                if let Err(err) =
                    self.place_var(&mut params, &mut ubo_size, sv, pv, greedy)
                {
                    placement_err = Some(err);
                    break;
                }
            }
            if placement_err.is_some() {
                break;
            }
        }

        // Create and attach the UBO if necessary
        let mut ubo = None;
        let mut create_failed = placement_err.is_some();
        if let Some(err) = &placement_err {
            error!("{err}");
        }
        if !create_failed && ubo_size > 0 {
            match self.gpu.buf_create(&BufParams::uniform(ubo_size)) {
                Ok(buf) => {
                    let buffer_vars: Vec<(Var, VarLayout)> = sh
                        .vars
                        .iter()
                        .zip(&pass_vars)
                        .filter_map(|(sv, pv)| match pv.placement {
                            Some(VarPlacement::Ubo(layout)) => Some((sv.var.clone(), layout)),
                            _ => None,
                        })
                        .collect();
                    sh.desc_raw(crate::shader::ShaderDesc {
                        desc: Desc::buf_uniform("UBO"),
                        binding: glint_gpu::DescBinding {
                            object: BindingObject::Buffer(buf.clone()),
                        },
                        memory: glint_gpu::MemoryFlags::empty(),
                        buffer_vars,
                    });
                    ubo = Some(buf);
                }
                Err(err) => {
                    error!("failed creating uniform buffer for dispatch: {err}");
                    create_failed = true;
                }
            }
        }

        // Assign descriptor bindings within their namespaces
        let mut namespaces = std::collections::HashMap::new();
        for sd in &sh.descs {
            let ns = self.gpu.desc_namespace(sd.desc.ty);
            let counter = namespaces.entry(ns).or_insert(0usize);
            let mut desc = sd.desc.clone();
            desc.binding = *counter;
            *counter += 1;
            params.descriptors.push(desc);
        }

        params.push_constants_size = (params.push_constants_size + 3) / 4 * 4;

        // Generate the full sources and create the backend pass
        let res = sh.finalize();
        generate_shaders(
            self.gpu.as_ref(),
            &mut self.gen_bufs,
            sh,
            &res,
            &pass_vars,
            &mut params,
            vert_pos,
            out_proj,
        );

        let pass = if create_failed {
            None
        } else {
            match self.gpu.pass_create(params.clone()) {
                Ok(pass) => Some(pass),
                Err(err) => {
                    error!("failed creating pass for dispatch: {err}");
                    None
                }
            }
        };

        let run = pass.as_ref().map(|pass| PassRunParams {
            pass: pass.clone(),
            desc_bindings: Vec::new(),
            var_updates: Vec::new(),
            push_constants: vec![0; params.push_constants_size],
            vertex_data: if !is_compute && vparams.is_none() {
                vec![0; params.vertex_stride * 4]
            } else {
                Vec::new()
            },
            vertex_count: if !is_compute && vparams.is_none() { 4 } else { 0 },
            scissors: Rect::default(),
            target: None,
            compute_groups: [0; 3],
            timer: None,
        });

        self.garbage_collect_passes();
        self.passes.push(CompiledPass {
            signature,
            pass,
            last_index: self.current_index,
            vars: pass_vars,
            ubo,
            run,
            va_offsets,
        });
        Ok(self.passes.len() - 1)
    }

    /// Decides the placement of a single variable. With `greedy` false,
    /// only variables that definitely belong in push constants are placed;
    /// everything else is deferred so small dynamic values get first pick
    /// of the push-constant budget.
    fn place_var(
        &self,
        params: &mut PassParams,
        ubo_size: &mut usize,
        sv: &ShaderVar,
        pv: &mut PassVar,
        greedy: bool,
    ) -> DispatchResult<()> {
        if pv.placement.is_some() {
            return Ok(());
        }

        let caps = self.gpu.caps();
        let glsl = self.gpu.glsl();
        let limits = self.gpu.limits();

        // Large values like matrices would blow the push-constant budget,
        // so they only get in during the greedy pass
        let try_pushc =
            greedy || (sv.var.dim_m == 1 && sv.var.dim_a == 1) || sv.dynamic;
        if try_pushc && glsl.vulkan && limits.max_pushc_size > 0 {
            let layout = std430_layout(params.push_constants_size, &sv.var);
            let new_size = layout.offset + layout.size;
            if new_size <= limits.max_pushc_size {
                params.push_constants_size = new_size;
                pv.placement = Some(VarPlacement::Push(layout));
                return Ok(());
            }
        }

        if !greedy {
            return Ok(());
        }

        // Uniform buffer next. Requires GLSL >= 440 for explicit member
        // offsets. Highly dynamic values stay out of the UBO when globals
        // are available, since UBO writes need per-frame synchronization
        let try_ubo = !caps.contains(GpuCaps::INPUT_VARIABLES) || !sv.dynamic;
        if try_ubo && glsl.version >= 440 && limits.max_ubo_size > 0 {
            let layout = std140_layout(*ubo_size, &sv.var);
            if layout.offset + layout.size <= limits.max_ubo_size {
                *ubo_size = layout.offset + layout.size;
                pv.placement = Some(VarPlacement::Ubo(layout));
                return Ok(());
            }
        }

        // Loose global uniforms as the last resort
        if caps.contains(GpuCaps::INPUT_VARIABLES) {
            pv.placement = Some(VarPlacement::Global {
                index: params.variables.len(),
            });
            params.variables.push(sv.var.clone());
            return Ok(());
        }

        Err(DispatchError::VarPlacement(sv.var.name.clone()))
    }

    /// Refreshes a pass's run state from the shader: descriptor bindings
    /// and changed variables.
    fn update_run_state(&mut self, idx: usize, sh: &ShaderBuilder) -> DispatchResult<()> {
        let cp = &mut self.passes[idx];
        let ubo = cp.ubo.clone();
        let run = cp.run.as_mut().expect("compiled pass has run params");

        // Overwrite the leading bindings only: an internally created UBO
        // binding sits past the shader's own descriptors and must survive
        // cache hits (the looked-up shader doesn't re-declare it)
        for (i, sd) in sh.descs.iter().enumerate() {
            if i < run.desc_bindings.len() {
                run.desc_bindings[i] = sd.binding.clone();
            } else {
                run.desc_bindings.push(sd.binding.clone());
            }
        }

        run.var_updates.clear();
        for (sv, pv) in sh.vars.iter().zip(cp.vars.iter_mut()) {
            let host = host_layout(0, &sv.var);
            debug_assert_eq!(host.size, sv.data.len());

            // Skip the upload when the data hasn't changed
            if pv.cached.as_deref() == Some(sv.data.as_slice()) {
                continue;
            }
            match &mut pv.cached {
                Some(cached) => {
                    cached.clear();
                    cached.extend_from_slice(&sv.data);
                }
                None => pv.cached = Some(sv.data.clone()),
            }

            match pv.placement.expect("placed variable") {
                VarPlacement::Global { index } => {
                    run.var_updates.push(VarUpdate {
                        index,
                        data: sv.data.clone(),
                    });
                }
                VarPlacement::Ubo(layout) => {
                    let ubo = ubo.as_ref().expect("UBO placement without UBO");
                    if host.stride == layout.stride {
                        self.gpu.buf_write(ubo, layout.offset, &sv.data)?;
                    } else {
                        // Coalesce the strided write into one upload by
                        // assembling the device layout in scratch memory
                        self.tmp.clear();
                        self.tmp.resize(layout.size, 0);
                        memcpy_layout(&mut self.tmp, layout, &sv.data, host);
                        self.gpu.buf_write(ubo, layout.offset, &self.tmp)?;
                    }
                }
                VarPlacement::Push(layout) => {
                    let dst = &mut run.push_constants[layout.offset..layout.offset + layout.size];
                    memcpy_layout(dst, layout, &sv.data, host);
                }
            }
        }
        Ok(())
    }

    /// Evicts old passes once the cache exceeds its high-water mark: the
    /// older half is scanned and everything beyond the minimum age is
    /// dropped. If nothing is old enough, the mark doubles instead.
    fn garbage_collect_passes(&mut self) {
        if self.passes.len() <= self.max_passes {
            return;
        }

        let current = self.current_index;
        self.passes
            .sort_by_key(|p| current.wrapping_sub(p.last_index));

        let mut idx = self.passes.len() / 2;
        while idx < self.passes.len()
            && current.wrapping_sub(self.passes[idx].last_index) < MIN_AGE
        {
            idx += 1;
        }

        let evicted = self.passes.len() - idx;
        self.passes.truncate(idx);

        if evicted > 0 {
            debug!("evicted {evicted} passes from dispatch cache, consider using more dynamic shaders");
        } else {
            self.max_passes *= 2;
        }
    }

    // =========================================================================
    // Program binary cache
    // =========================================================================

    /// Serializes all known program binaries into a cache blob.
    pub fn save(&self) -> Vec<u8> {
        let mut entries: Vec<(u64, &[u8])> = Vec::new();
        for cp in &self.passes {
            let Some(pass) = &cp.pass else { continue };
            if let Some(program) = pass.cached_program() {
                if !program.is_empty() {
                    entries.push((cp.signature, program));
                }
            }
        }
        // Re-save loaded but not-yet-compiled programs, so load followed
        // by save round-trips
        for c in &self.cached_programs {
            entries.push((c.signature, &c.program));
        }

        let mut out = Vec::new();
        out.extend_from_slice(CACHE_MAGIC);
        out.extend_from_slice(&CACHE_VERSION.to_le_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (signature, program) in entries {
            debug!(
                "saving {} bytes of cached program with signature {signature:#018x}",
                program.len()
            );
            out.extend_from_slice(&signature.to_le_bytes());
            out.extend_from_slice(&(program.len() as u64).to_le_bytes());
            out.extend_from_slice(program);
        }
        out
    }

    /// Restores program binaries from a cache blob. Malformed input is
    /// rejected with a warning; unknown entries are ignored; duplicate
    /// signatures are deduplicated preferring the already-compiled version.
    pub fn load(&mut self, cache: &[u8]) {
        let mut rd = Reader(cache);

        let Some(magic) = rd.bytes(4) else {
            error!("failed loading dispatch cache: truncated header");
            return;
        };
        if magic != CACHE_MAGIC {
            error!("failed loading dispatch cache: invalid magic bytes");
            return;
        }
        let Some(version) = rd.u32() else {
            error!("failed loading dispatch cache: truncated header");
            return;
        };
        if version != CACHE_VERSION {
            warn!("failed loading dispatch cache: wrong version {version}");
            return;
        }
        let Some(num) = rd.u32() else {
            error!("failed loading dispatch cache: truncated header");
            return;
        };

        for _ in 0..num {
            let (Some(signature), Some(size)) = (rd.u64(), rd.u64()) else {
                warn!("dispatch cache truncated, ignoring rest");
                return;
            };
            let Some(program) = rd.bytes(size as usize) else {
                warn!("dispatch cache truncated, ignoring rest");
                return;
            };
            if program.is_empty() {
                continue;
            }

            // Prefer already-compiled passes over loaded binaries
            if self
                .passes
                .iter()
                .any(|p| p.signature == signature && p.pass.is_some())
            {
                debug!("skipping already compiled pass with signature {signature:#018x}");
                continue;
            }

            debug!(
                "loading {size} bytes of cached program with signature {signature:#018x}"
            );
            match self
                .cached_programs
                .iter_mut()
                .find(|c| c.signature == signature)
            {
                Some(existing) => existing.program = program.to_vec(),
                None => self.cached_programs.push(CachedProgram {
                    signature,
                    program: program.to_vec(),
                }),
            }
        }
    }
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        // Quiesce asynchronous GPU work before the cached passes and their
        // buffers are released
        self.gpu.finish();
    }
}

const CACHE_MAGIC: &[u8; 4] = b"PLDP";
const CACHE_VERSION: u32 = 1;

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Some(head)
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes(4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn u64(&mut self) -> Option<u64> {
        self.bytes(8).map(|b| u64::from_le_bytes(b.try_into().unwrap()))
    }
}

// =============================================================================
// Compute translation
// =============================================================================

/// Synthesizes vertex-attribute interpolation for compute shaders: every
/// attribute becomes 4 corner variables interpolated bilinearly from the
/// global invocation id.
fn compute_vertex_attribs(sh: &mut ShaderBuilder, width: u32, height: u32) -> String {
    let out_scale = sh.var_vec2(
        "out_scale",
        [1.0 / width as f32, 1.0 / height as f32],
        true,
    );

    glsl_h!(
        sh,
        "#define frag_pos(id) (vec2(id) + vec2(0.5))\n\
         #define frag_map(id) ({out_scale} * frag_pos(id))\n\
         #define gl_FragCoord vec4(frag_pos(gl_GlobalInvocationID), 0.0, 1.0)\n"
    );

    let vas: Vec<(String, usize, [Vec<u8>; 4])> = sh
        .vas
        .iter()
        .map(|va| (va.name.clone(), va.components, va.data.clone()))
        .collect();
    for (name, components, data) in vas {
        let mut points = Vec::with_capacity(4);
        for corner in data {
            points.push(sh.var(Var::vec("p", components), corner, false));
        }
        glsl_h!(
            sh,
            "#define {name}_map(id) \
             (mix(mix({}, {}, frag_map(id).x), \
                  mix({}, {}, frag_map(id).x), \
             frag_map(id).y))\n\
             #define {name} ({name}_map(gl_GlobalInvocationID))\n",
            points[0],
            points[1],
            points[2],
            points[3],
        );
    }

    out_scale
}

/// Rewrites a compute shader dispatched to a render region so that it
/// writes the target through a storage image: derives integer coordinates
/// from the invocation id and the rect origin, clips against the rect, and
/// synthesizes blending with explicit factor expressions when requested.
fn translate_compute_shader(
    sh: &mut ShaderBuilder,
    rc: Rect,
    target: &Arc<dyn Texture>,
    blend: Option<&BlendParams>,
) {
    let width = rc.w().unsigned_abs();
    let height = rc.h().unsigned_abs();
    let out_scale = compute_vertex_attribs(sh, width, height);

    debug_assert!(target.params().storable);
    let access = if blend.is_some() {
        DescAccess::ReadWrite
    } else {
        DescAccess::WriteOnly
    };
    let fbo = sh.desc(
        Desc::storage_img("out_image", access),
        BindingObject::Texture(target.clone()),
    );

    let base = sh.var_ivec2("base", [rc.x0, rc.y0], true);

    let dx: i32 = if rc.x0 > rc.x1 { -1 } else { 1 };
    let dy: i32 = if rc.y0 > rc.y1 { -1 } else { 1 };
    // Not worth a variable, the direction is part of the signature anyway
    glsl!(sh, "ivec2 dir = ivec2({dx}, {dy});\n");
    glsl!(sh, "ivec2 pos = {base} + dir * ivec2(gl_GlobalInvocationID);\n");
    glsl!(sh, "vec2 fpos = {out_scale} * vec2(gl_GlobalInvocationID);\n");
    glsl!(sh, "if (max(fpos.x, fpos.y) < 1.0) {{\n");
    if let Some(blend) = blend {
        glsl!(sh, "vec4 orig = imageLoad({fbo}, pos);\n");
        glsl!(
            sh,
            "color = vec4(color.rgb * vec3({}), color.a * {})\n\
             \x20     + vec4(orig.rgb  * vec3({}), orig.a  * {});\n",
            blend.src_rgb.glsl_expr(),
            blend.src_alpha.glsl_expr(),
            blend.dst_rgb.glsl_expr(),
            blend.dst_alpha.glsl_expr(),
        );
    }
    glsl!(sh, "imageStore({fbo}, pos, color);\n");
    glsl!(sh, "}}\n");
    sh.set_output_sig(ShaderSig::None);
}
