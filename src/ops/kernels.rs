//! Row kernels shared by the score and value passes
//!
//! Every pass reduces to two primitives over `head_size`-long f32 rows:
//!
//! ```text
//!   dot(q, k_row)              score of one key
//!   axpy(out, w, v_row)        out += w * v_row
//! ```
//!
//! On x86_64 both use 8-wide AVX2 FMA blocks when the CPU has them; the
//! block tail and other targets take the scalar path.

/// Sum of `a[i] * b[i]` over the common length.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let len = a.len().min(b.len());
    let (a, b) = (&a[..len], &b[..len]);

    #[cfg(target_arch = "x86_64")]
    {
        if avx::available() {
            // SAFETY: AVX2 and FMA were detected at runtime.
            return unsafe { avx::dot(a, b) };
        }
    }
    scalar_dot(a, b)
}

/// `out[i] += weight * v[i]` over the common length.
#[inline]
pub fn axpy(out: &mut [f32], weight: f32, v: &[f32]) {
    debug_assert_eq!(out.len(), v.len());
    let len = out.len().min(v.len());
    let (out, v) = (&mut out[..len], &v[..len]);

    #[cfg(target_arch = "x86_64")]
    {
        if avx::available() {
            // SAFETY: AVX2 and FMA were detected at runtime.
            unsafe { avx::axpy(out, weight, v) };
            return;
        }
    }
    scalar_axpy(out, weight, v);
}

#[inline]
fn scalar_dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

#[inline]
fn scalar_axpy(out: &mut [f32], weight: f32, v: &[f32]) {
    for (o, &x) in out.iter_mut().zip(v) {
        *o += weight * x;
    }
}

#[cfg(target_arch = "x86_64")]
mod avx {
    use std::arch::x86_64::{_mm256_fmadd_ps, _mm256_loadu_ps, _mm256_set1_ps, _mm256_setzero_ps, _mm256_storeu_ps};

    const WIDTH: usize = 8;

    #[inline]
    pub(super) fn available() -> bool {
        is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
    }

    /// # Safety
    ///
    /// The CPU must support AVX2 and FMA; `a` and `b` have equal length.
    #[target_feature(enable = "avx2,fma")]
    pub(super) unsafe fn dot(a: &[f32], b: &[f32]) -> f32 {
        let a_blocks = a.chunks_exact(WIDTH);
        let b_blocks = b.chunks_exact(WIDTH);
        let tail = super::scalar_dot(a_blocks.remainder(), b_blocks.remainder());

        let mut lanes = [0.0f32; WIDTH];
        unsafe {
            let mut acc = _mm256_setzero_ps();
            for (x, y) in a_blocks.zip(b_blocks) {
                acc = _mm256_fmadd_ps(_mm256_loadu_ps(x.as_ptr()), _mm256_loadu_ps(y.as_ptr()), acc);
            }
            _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
        }
        // pairwise: (0+4, 1+5, 2+6, 3+7) then halves
        let quad = [lanes[0] + lanes[4], lanes[1] + lanes[5], lanes[2] + lanes[6], lanes[3] + lanes[7]];
        (quad[0] + quad[2]) + (quad[1] + quad[3]) + tail
    }

    /// # Safety
    ///
    /// The CPU must support AVX2 and FMA; `out` and `v` have equal length.
    #[target_feature(enable = "avx2,fma")]
    pub(super) unsafe fn axpy(out: &mut [f32], weight: f32, v: &[f32]) {
        let mut out_blocks = out.chunks_exact_mut(WIDTH);
        let mut v_blocks = v.chunks_exact(WIDTH);
        unsafe {
            let w = _mm256_set1_ps(weight);
            for (o, x) in (&mut out_blocks).zip(&mut v_blocks) {
                let sum = _mm256_fmadd_ps(w, _mm256_loadu_ps(x.as_ptr()), _mm256_loadu_ps(o.as_ptr()));
                _mm256_storeu_ps(o.as_mut_ptr(), sum);
            }
        }
        super::scalar_axpy(out_blocks.into_remainder(), weight, v_blocks.remainder());
    }
}
