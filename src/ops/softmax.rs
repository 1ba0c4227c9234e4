//! Row-wise softmax over the key axis.

/// Stable softmax of one row in place: find max, exponentiate, normalize.
///
/// A row whose maximum is `-inf` (every position excluded) becomes all
/// zeros instead of NaN.
#[inline]
pub fn softmax_row(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY || max.is_nan() {
        row.fill(0.0);
        return;
    }

    let mut sum = 0.0f32;
    for x in row.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    let inv = 1.0 / sum;
    for x in row.iter_mut() {
        *x *= inv;
    }
}
