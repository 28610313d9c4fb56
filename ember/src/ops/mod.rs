//! Kernel operations on a [`GpuContext`](crate::GpuContext).
//!
//! Each operation validates its shape, picks a variant from the device
//! capabilities, packs its uniforms and dispatches. All tensors are `f32`
//! storage buffers in row-major layout; results are new pooled buffers the
//! caller releases.

mod activation;
mod attention;
mod autotune;
mod dequant;
mod embed;
mod matmul;
mod norm;
mod residual;
mod rope;
mod softmax;

pub use attention::AttentionOptions;
pub use autotune::TuneTarget;
pub use matmul::MatmulOptions;
pub use rope::RopeParams;

use crate::backend::ComputeDevice;
use crate::buffer_pool::Buffer;
use crate::{Error, Result};

/// A non-zero dimension that fits the `u32` uniform fields.
pub(crate) fn dim(value: usize, name: &str) -> Result<u32> {
    if value == 0 {
        return Err(Error::InvalidShape(format!("{name} must be non-zero")));
    }
    u32::try_from(value)
        .map_err(|_| Error::InvalidShape(format!("{name} = {value} does not fit in u32")))
}

/// Check that `buffer` holds at least the `f32`/`u32` elements of `shape`.
pub(crate) fn expect_elems<D: ComputeDevice>(buffer: &Buffer<D>, shape: &[usize]) -> Result<()> {
    let elems: usize = shape.iter().product();
    if buffer.size() < (elems as u64) * 4 {
        return Err(Error::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![usize::try_from(buffer.size() / 4).unwrap_or(usize::MAX)],
        });
    }
    Ok(())
}

/// Output size in bytes for `elems` four-byte elements.
pub(crate) fn bytes(elems: usize) -> u64 {
    elems as u64 * 4
}
