pub mod kernels;
pub(crate) mod mask;
pub mod softmax;

pub use kernels::{axpy, dot};
pub use softmax::softmax_row;
