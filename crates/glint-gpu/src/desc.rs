//! Shader descriptors: sampled textures, storage images and buffers.

use std::sync::Arc;

use bitflags::bitflags;

use crate::buf::Buffer;
use crate::tex::Texture;

/// Type of a shader descriptor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescType {
    /// A texture sampled through a combined image sampler.
    SampledTex,
    /// A texture bound for image load/store.
    StorageImg,
    /// A uniform buffer block.
    BufUniform,
    /// A shader storage buffer block.
    BufStorage,
    /// A texel buffer sampled like a 1D texture.
    BufTexelUniform,
    /// A texel buffer bound for image load/store.
    BufTexelStorage,
}

/// Access pattern declared for writable descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl DescAccess {
    /// Matching GLSL memory qualifier (empty for read-write).
    pub fn glsl_name(self) -> &'static str {
        match self {
            Self::ReadOnly => "readonly",
            Self::WriteOnly => "writeonly",
            Self::ReadWrite => "",
        }
    }
}

bitflags! {
    /// Extra memory qualifiers for storage bindings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryFlags: u32 {
        const COHERENT = 1 << 0;
        const VOLATILE = 1 << 1;
    }
}

/// A descriptor declaration, as it appears in pass parameters.
#[derive(Debug, Clone)]
pub struct Desc {
    /// Name the shader refers to this binding by.
    pub name: String,
    pub ty: DescType,
    /// Binding index within the type's namespace; assigned at pass creation.
    pub binding: usize,
    pub access: DescAccess,
    pub memory: MemoryFlags,
}

impl Desc {
    pub fn sampled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: DescType::SampledTex,
            binding: 0,
            access: DescAccess::ReadOnly,
            memory: MemoryFlags::empty(),
        }
    }

    pub fn storage_img(name: impl Into<String>, access: DescAccess) -> Self {
        Self {
            name: name.into(),
            ty: DescType::StorageImg,
            binding: 0,
            access,
            memory: MemoryFlags::empty(),
        }
    }

    pub fn buf_uniform(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: DescType::BufUniform,
            binding: 0,
            access: DescAccess::ReadOnly,
            memory: MemoryFlags::empty(),
        }
    }

    pub fn buf_storage(name: impl Into<String>, access: DescAccess) -> Self {
        Self {
            name: name.into(),
            ty: DescType::BufStorage,
            binding: 0,
            access,
            memory: MemoryFlags::empty(),
        }
    }
}

/// The GPU object a descriptor is bound to at run time.
#[derive(Clone)]
pub enum BindingObject {
    Texture(Arc<dyn Texture>),
    Buffer(Arc<dyn Buffer>),
}

impl BindingObject {
    pub fn as_texture(&self) -> Option<&Arc<dyn Texture>> {
        match self {
            Self::Texture(tex) => Some(tex),
            Self::Buffer(_) => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Arc<dyn Buffer>> {
        match self {
            Self::Buffer(buf) => Some(buf),
            Self::Texture(_) => None,
        }
    }
}

impl std::fmt::Debug for BindingObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Texture(_) => f.write_str("BindingObject::Texture"),
            Self::Buffer(_) => f.write_str("BindingObject::Buffer"),
        }
    }
}

/// A descriptor together with its run-time binding.
#[derive(Debug, Clone)]
pub struct DescBinding {
    pub object: BindingObject,
}
