//! The backend GPU trait.

use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use glint_core::Rect;

use crate::buf::{BufParams, Buffer};
use crate::desc::DescType;
use crate::format::Format;
use crate::pass::{Pass, PassParams, PassRunParams};
use crate::tex::{TexParams, Texture};
use crate::GpuResult;

bitflags! {
    /// Optional device capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GpuCaps: u32 {
        /// Compute shaders are available.
        const COMPUTE           = 1 << 0;
        /// Compute dispatch performance is comparable to raster (desktop
        /// class); gates transparent fragment -> compute promotion.
        const PARALLEL_COMPUTE  = 1 << 1;
        /// Loose/global input variables are supported.
        const INPUT_VARIABLES   = 1 << 2;
        /// Subgroup operations are supported.
        const SUBGROUPS         = 1 << 3;
    }
}

/// Shading language dialect the backend consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlslVersion {
    /// GLSL version number, e.g. 450.
    pub version: u32,
    /// OpenGL ES dialect (precision qualifiers required).
    pub gles: bool,
    /// Vulkan dialect (explicit bindings, push constants).
    pub vulkan: bool,
}

impl Default for GlslVersion {
    fn default() -> Self {
        Self {
            version: 450,
            gles: false,
            vulkan: true,
        }
    }
}

/// Hard device limits.
#[derive(Debug, Clone, Copy)]
pub struct GpuLimits {
    pub max_tex_1d_dim: u32,
    pub max_tex_2d_dim: u32,
    pub max_tex_3d_dim: u32,
    /// Maximum push constant region size; 0 if unsupported.
    pub max_pushc_size: usize,
    /// Maximum uniform buffer size; 0 if unsupported.
    pub max_ubo_size: usize,
    /// Maximum storage buffer size; 0 if unsupported.
    pub max_ssbo_size: usize,
    pub max_buf_size: usize,
    /// Maximum compute dispatch size per dimension.
    pub max_dispatch: [u32; 3],
    /// Maximum threads per workgroup.
    pub max_group_threads: u32,
    /// Maximum compute shared memory per workgroup.
    pub max_shmem_size: usize,
}

impl Default for GpuLimits {
    fn default() -> Self {
        Self {
            max_tex_1d_dim: 16384,
            max_tex_2d_dim: 16384,
            max_tex_3d_dim: 2048,
            max_pushc_size: 128,
            max_ubo_size: 65536,
            max_ssbo_size: 1 << 27,
            max_buf_size: 1 << 30,
            max_dispatch: [65535; 3],
            max_group_threads: 1024,
            max_shmem_size: 32768,
        }
    }
}

/// GPU pass timer handle.
pub trait Timer {
    /// Result of the most recent timed run, if it has finished.
    fn query(&self) -> Option<Duration>;
}

/// The backend GPU abstraction.
///
/// One instance per logical device. All methods take `&self`; backends are
/// expected to serialize command submission internally. The library is
/// single-threaded per engine instance, so implementations may use interior
/// mutability freely.
///
/// Object lifetimes: every handle created through this trait must drop
/// before the `Gpu` itself; [`Gpu::finish`] is called at teardown to
/// quiesce asynchronous work first.
pub trait Gpu {
    fn caps(&self) -> GpuCaps;
    fn glsl(&self) -> GlslVersion;
    fn limits(&self) -> &GpuLimits;

    /// Supported formats, sorted best-first.
    fn formats(&self) -> &[Arc<Format>];

    /// Binding namespace for a descriptor type. Backends with a shared
    /// binding namespace (Vulkan) return the same value for every type.
    fn desc_namespace(&self, ty: DescType) -> usize {
        let _ = ty;
        0
    }

    fn tex_create(&self, params: &TexParams) -> GpuResult<Arc<dyn Texture>>;

    /// Marks the texture's contents as undefined, allowing the backend to
    /// skip preserving them.
    fn tex_invalidate(&self, tex: &Arc<dyn Texture>) {
        let _ = tex;
    }

    fn tex_clear(&self, tex: &Arc<dyn Texture>, color: [f32; 4]) -> GpuResult<()>;

    fn tex_blit(
        &self,
        dst: &Arc<dyn Texture>,
        dst_rect: Rect,
        src: &Arc<dyn Texture>,
        src_rect: Rect,
    ) -> GpuResult<()>;

    fn tex_upload(&self, tex: &Arc<dyn Texture>, data: &[u8]) -> GpuResult<()>;
    fn tex_download(&self, tex: &Arc<dyn Texture>, data: &mut [u8]) -> GpuResult<()>;

    /// Whether the texture is still in use by the GPU after `timeout`.
    fn tex_poll(&self, tex: &Arc<dyn Texture>, timeout: Duration) -> bool {
        let _ = (tex, timeout);
        false
    }

    fn buf_create(&self, params: &BufParams) -> GpuResult<Arc<dyn Buffer>>;
    fn buf_write(&self, buf: &Arc<dyn Buffer>, offset: usize, data: &[u8]) -> GpuResult<()>;
    fn buf_read(&self, buf: &Arc<dyn Buffer>, offset: usize, out: &mut [u8]) -> GpuResult<()>;
    fn buf_copy(
        &self,
        dst: &Arc<dyn Buffer>,
        dst_offset: usize,
        src: &Arc<dyn Buffer>,
        src_offset: usize,
        size: usize,
    ) -> GpuResult<()>;

    /// Whether the buffer is still in use by the GPU after `timeout`.
    fn buf_poll(&self, buf: &Arc<dyn Buffer>, timeout: Duration) -> bool {
        let _ = (buf, timeout);
        false
    }

    fn pass_create(&self, params: PassParams) -> GpuResult<Arc<dyn Pass>>;
    fn pass_run(&self, params: &PassRunParams) -> GpuResult<()>;

    fn timer_create(&self) -> Option<Arc<dyn Timer>> {
        None
    }

    /// Flushes queued work for execution.
    fn flush(&self) {}

    /// Blocks until all queued work has finished.
    fn finish(&self);

    /// Whether the device has been lost. Once true, all further operations
    /// fail and the instance must be torn down.
    fn is_failed(&self) -> bool {
        false
    }
}
