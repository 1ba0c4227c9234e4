//! Element types accepted by the attention kernels.
//!
//! Storage may be `f32`, `f16` or `bf16`; all arithmetic runs in `f32`.
//! The row helpers let `f32` take the SIMD path without a conversion copy,
//! while half-precision types widen element by element.

use std::fmt;

use half::{bf16, f16};

use crate::ops::kernels;

/// Storage dtype tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
        };
        f.write_str(name)
    }
}

/// A floating point storage element.
pub trait Element: bytemuck::Pod + Default + Send + Sync + fmt::Debug + 'static {
    const DTYPE: DType;

    fn to_f32(self) -> f32;

    fn from_f32(value: f32) -> Self;

    /// `sum(q[i] * row[i])`
    #[inline]
    fn dot_f32(q: &[f32], row: &[Self]) -> f32 {
        debug_assert_eq!(q.len(), row.len());
        q.iter().zip(row).map(|(&a, &b)| a * b.to_f32()).sum()
    }

    /// `out[i] += weight * row[i]`
    #[inline]
    fn axpy_f32(out: &mut [f32], weight: f32, row: &[Self]) {
        debug_assert_eq!(out.len(), row.len());
        for (o, &r) in out.iter_mut().zip(row) {
            *o += weight * r.to_f32();
        }
    }

    #[inline]
    fn widen_into(dst: &mut [f32], src: &[Self]) {
        debug_assert_eq!(dst.len(), src.len());
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = s.to_f32();
        }
    }

    #[inline]
    fn narrow_into(dst: &mut [Self], src: &[f32]) {
        debug_assert_eq!(dst.len(), src.len());
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = Self::from_f32(s);
        }
    }
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }

    #[inline]
    fn dot_f32(q: &[f32], row: &[f32]) -> f32 {
        kernels::dot(q, row)
    }

    #[inline]
    fn axpy_f32(out: &mut [f32], weight: f32, row: &[f32]) {
        kernels::axpy(out, weight, row);
    }

    #[inline]
    fn widen_into(dst: &mut [f32], src: &[f32]) {
        dst.copy_from_slice(src);
    }

    #[inline]
    fn narrow_into(dst: &mut [f32], src: &[f32]) {
        dst.copy_from_slice(src);
    }
}

impl Element for f16 {
    const DTYPE: DType = DType::F16;

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl Element for bf16 {
    const DTYPE: DType = DType::BF16;

    #[inline]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }
}
