//! # glint-core
//!
//! Core value types for the glint GPU rendering library.
//!
//! This crate provides the foundational, GPU-agnostic types used throughout
//! the glint ecosystem:
//!
//! - [`Rect`], [`RectF`] - pixel-space rectangles (integer and fractional)
//! - [`ColorRepr`] - how color values are *encoded* (system, levels, bits)
//! - [`ColorSpace`] - what color values *mean* (primaries, transfer, peak)
//! - [`hash`] - stable 64-bit content hashing for signatures and caches
//!
//! ## Crate Structure
//!
//! This crate is the foundation of glint and has no internal dependencies.
//! All other glint crates depend on `glint-core`:
//!
//! ```text
//! glint-core (this crate)
//!    ^
//!    |
//!    +-- glint-gpu (backend abstraction)
//!    +-- glint-dispatch (shader dispatch engine)
//!    +-- glint-render (render pipeline planner)
//! ```

pub mod color;
pub mod hash;
pub mod rect;

pub use color::{
    AlphaMode, BitEncoding, ColorLevels, ColorRepr, ColorSpace, ColorSystem, Primaries, Transfer,
    REF_WHITE,
};
pub use rect::{Rect, RectF};
