//! Dense tensor views and element types
//!
//! The attention kernels operate on flat row-major buffers owned by the caller.
//! These types carry shape information alongside the buffer so that every
//! batch/head offset is derived from one place.

pub mod element;
pub mod view;

pub use element::{DType, Element};
pub use view::{Layout, MAX_RANK, Tensor, TensorView, TensorViewMut};
