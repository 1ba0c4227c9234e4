//! Strided views over flat row-major buffers.
//!
//! All attention buffers are dense row-major, so a view is just a slice plus a
//! [`Layout`]. Offsets are computed once from the layout and checked against the
//! shape, which keeps head/batch arithmetic out of the kernels.

use std::fmt;

use crate::error::{Error, Result};

/// Highest tensor rank any attention input uses (packed QKV is 5D).
pub const MAX_RANK: usize = 5;

/// Shape and row-major strides of a dense tensor
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    dims: [usize; MAX_RANK],
    strides: [usize; MAX_RANK],
    rank: usize,
}

impl Layout {
    pub fn contiguous(shape: &[usize]) -> Result<Self> {
        if shape.len() > MAX_RANK {
            return Err(Error::invalid(
                "shape",
                format!("rank {} exceeds maximum of {MAX_RANK}", shape.len()),
            ));
        }
        let mut dims = [0usize; MAX_RANK];
        let mut strides = [0usize; MAX_RANK];
        dims[..shape.len()].copy_from_slice(shape);

        let mut stride = 1usize;
        for axis in (0..shape.len()).rev() {
            strides[axis] = stride;
            stride = stride.checked_mul(shape[axis]).ok_or_else(|| {
                Error::invalid("shape", format!("element count of {shape:?} overflows"))
            })?;
        }

        Ok(Self {
            dims,
            strides,
            rank: shape.len(),
        })
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.dims[..self.rank]
    }

    #[inline]
    pub fn strides(&self) -> &[usize] {
        &self.strides[..self.rank]
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Flat offset of `index`. A shorter index addresses the start of the
    /// sub-tensor it selects. `None` if any coordinate is out of bounds.
    #[inline]
    pub fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() > self.rank {
            return None;
        }
        let mut offset = 0usize;
        for (axis, &i) in index.iter().enumerate() {
            if i >= self.dims[axis] {
                return None;
            }
            offset += i * self.strides[axis];
        }
        Some(offset)
    }

    /// Number of elements in the sub-tensor selected by an index of `prefix_len` coordinates.
    #[inline]
    pub fn span(&self, prefix_len: usize) -> usize {
        self.shape()[prefix_len.min(self.rank)..].iter().product()
    }
}

impl fmt::Debug for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.shape())
    }
}

fn check_len(arg: &'static str, len: usize, layout: &Layout) -> Result<()> {
    if len != layout.numel() {
        return Err(Error::invalid(
            arg,
            format!(
                "buffer holds {len} elements but shape {:?} needs {}",
                layout.shape(),
                layout.numel()
            ),
        ));
    }
    Ok(())
}

/// Read-only view of a dense tensor
#[derive(Clone, Copy)]
pub struct TensorView<'a, T> {
    data: &'a [T],
    layout: Layout,
}

impl<'a, T: Copy> TensorView<'a, T> {
    pub fn new(data: &'a [T], shape: &[usize]) -> Result<Self> {
        let layout = Layout::contiguous(shape)?;
        check_len("data", data.len(), &layout)?;
        Ok(Self { data, layout })
    }

    /// Zero-copy view over raw bytes (e.g. a memory-mapped weight file).
    pub fn from_bytes(bytes: &'a [u8], shape: &[usize]) -> Result<Self>
    where
        T: bytemuck::Pod,
    {
        let data: &'a [T] = bytemuck::try_cast_slice(bytes)
            .map_err(|e| Error::invalid("bytes", format!("cannot reinterpret buffer: {e}")))?;
        Self::new(data, shape)
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    #[inline]
    pub fn dim(&self, axis: usize) -> usize {
        self.layout.shape()[axis]
    }

    #[inline]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &'a [T] {
        self.data
    }

    /// Scalar or one-element 1D tensor
    pub fn is_single_element(&self) -> bool {
        self.rank() <= 1 && self.numel() == 1
    }

    #[inline]
    pub fn get(&self, index: &[usize]) -> Option<T> {
        if index.len() != self.rank() {
            return None;
        }
        self.layout.offset(index).map(|o| self.data[o])
    }

    /// Contiguous sub-tensor selected by a leading index.
    #[inline]
    pub fn sub(&self, prefix: &[usize]) -> Option<&'a [T]> {
        let start = self.layout.offset(prefix)?;
        let len = self.layout.span(prefix.len());
        Some(&self.data[start..start + len])
    }
}

impl<T> fmt::Debug for TensorView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorView")
            .field("shape", &self.layout)
            .finish()
    }
}

/// Mutable view of a dense tensor
pub struct TensorViewMut<'a, T> {
    data: &'a mut [T],
    layout: Layout,
}

impl<'a, T: Copy> TensorViewMut<'a, T> {
    pub fn new(data: &'a mut [T], shape: &[usize]) -> Result<Self> {
        let layout = Layout::contiguous(shape)?;
        check_len("data", data.len(), &layout)?;
        Ok(Self { data, layout })
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    #[inline]
    pub fn dim(&self, axis: usize) -> usize {
        self.layout.shape()[axis]
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &*self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut *self.data
    }

    pub fn into_mut_slice(self) -> &'a mut [T] {
        self.data
    }

    /// Reborrow as a read-only view
    #[inline]
    pub fn view(&self) -> TensorView<'_, T> {
        TensorView {
            data: &*self.data,
            layout: self.layout,
        }
    }

    /// Shorter-lived mutable reborrow
    #[inline]
    pub fn reborrow(&mut self) -> TensorViewMut<'_, T> {
        TensorViewMut {
            data: &mut *self.data,
            layout: self.layout,
        }
    }

    #[inline]
    pub fn get(&self, index: &[usize]) -> Option<T> {
        self.view().get(index)
    }

    pub fn set(&mut self, index: &[usize], value: T) -> Result<()> {
        let offset = (index.len() == self.rank())
            .then(|| self.layout.offset(index))
            .flatten()
            .ok_or_else(|| {
                Error::invalid(
                    "index",
                    format!("{index:?} out of bounds for shape {:?}", self.shape()),
                )
            })?;
        self.data[offset] = value;
        Ok(())
    }

    #[inline]
    pub fn sub_mut(&mut self, prefix: &[usize]) -> Option<&mut [T]> {
        let start = self.layout.offset(prefix)?;
        let len = self.layout.span(prefix.len());
        Some(&mut self.data[start..start + len])
    }
}

impl<T> fmt::Debug for TensorViewMut<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorViewMut")
            .field("shape", &self.layout)
            .finish()
    }
}

/// Owned dense tensor, mainly for callers and tests that need backing storage.
#[derive(Clone)]
pub struct Tensor<T> {
    data: Vec<T>,
    layout: Layout,
}

impl<T: Copy> Tensor<T> {
    pub fn from_vec(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let layout = Layout::contiguous(shape)?;
        check_len("data", data.len(), &layout)?;
        Ok(Self { data, layout })
    }

    pub fn from_slice(data: &[T], shape: &[usize]) -> Result<Self> {
        Self::from_vec(data.to_vec(), shape)
    }

    pub fn full(shape: &[usize], value: T) -> Result<Self> {
        let layout = Layout::contiguous(shape)?;
        Ok(Self {
            data: vec![value; layout.numel()],
            layout,
        })
    }

    pub fn zeros(shape: &[usize]) -> Result<Self>
    where
        T: Default,
    {
        Self::full(shape, T::default())
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.data.clone()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    #[inline]
    pub fn view(&self) -> TensorView<'_, T> {
        TensorView {
            data: &self.data,
            layout: self.layout,
        }
    }

    #[inline]
    pub fn view_mut(&mut self) -> TensorViewMut<'_, T> {
        TensorViewMut {
            data: &mut self.data,
            layout: self.layout,
        }
    }
}

impl<T> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor").field("shape", &self.layout).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        let layout = Layout::contiguous(&[2, 3, 4]).unwrap();
        assert_eq!(layout.strides(), &[12, 4, 1]);
        assert_eq!(layout.offset(&[1, 2, 3]), Some(23));
        assert_eq!(layout.offset(&[1]), Some(12));
        assert_eq!(layout.offset(&[2]), None);
        assert_eq!(layout.offset(&[0, 3]), None);
        assert_eq!(layout.span(1), 12);
        assert_eq!(layout.span(3), 1);
    }

    #[test]
    fn test_rank_limit() {
        assert!(Layout::contiguous(&[1, 1, 1, 1, 1, 1]).is_err());
    }

    #[test]
    fn test_view_length_mismatch() {
        let data = [0.0f32; 5];
        let err = TensorView::new(&data, &[2, 3]).unwrap_err();
        assert!(err.to_string().contains("needs 6"));
    }

    #[test]
    fn test_sub_and_get() {
        let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let view = TensorView::new(&data, &[2, 3, 4]).unwrap();
        assert_eq!(view.sub(&[1, 1]).unwrap(), &[16.0, 17.0, 18.0, 19.0]);
        assert_eq!(view.get(&[0, 2, 1]), Some(9.0));
        assert_eq!(view.get(&[0, 2]), None);
        assert!(view.sub(&[0, 3]).is_none());
    }

    #[test]
    fn test_view_mut_writes() {
        let mut t = Tensor::<f32>::zeros(&[2, 2]).unwrap();
        {
            let mut v = t.view_mut();
            v.set(&[1, 0], 3.0).unwrap();
            v.sub_mut(&[0]).unwrap().copy_from_slice(&[1.0, 2.0]);
            assert!(v.set(&[2, 0], 1.0).is_err());
        }
        assert_eq!(t.as_slice(), &[1.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_from_bytes() {
        let values = [1.5f32, -2.0, 0.25, 8.0];
        let bytes: &[u8] = bytemuck::cast_slice(&values);
        let view = TensorView::<f32>::from_bytes(bytes, &[2, 2]).unwrap();
        assert_eq!(view.get(&[1, 1]), Some(8.0));
        assert!(TensorView::<f32>::from_bytes(&bytes[..7], &[1]).is_err());
    }
}
