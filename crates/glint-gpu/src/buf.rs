//! Buffer handles and creation parameters.

use std::sync::Arc;

use crate::format::Format;

/// Buffer creation parameters.
#[derive(Debug, Clone, Default)]
pub struct BufParams {
    pub size: usize,
    /// Usable as a uniform buffer.
    pub uniform: bool,
    /// Usable as a storage buffer.
    pub storable: bool,
    pub host_writable: bool,
    pub host_readable: bool,
    /// Texel format, for texel buffers only.
    pub format: Option<Arc<Format>>,
}

impl BufParams {
    /// A host-writable uniform buffer of the given size.
    pub fn uniform(size: usize) -> Self {
        Self {
            size,
            uniform: true,
            host_writable: true,
            ..Default::default()
        }
    }

    /// A storage buffer of the given size.
    pub fn storage(size: usize) -> Self {
        Self {
            size,
            storable: true,
            host_writable: true,
            host_readable: true,
            ..Default::default()
        }
    }
}

/// Opaque backend buffer handle.
pub trait Buffer {
    fn params(&self) -> &BufParams;

    /// Downcasting support for backends that need to recover their concrete
    /// handle type from a trait object.
    fn as_any(&self) -> &dyn std::any::Any;
}
