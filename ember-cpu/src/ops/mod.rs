//! Host implementations of every registered kernel.
//!
//! Each kernel decodes the same packed uniform block its shader reads and
//! computes the whole problem in one call; workgroup shapes and counts
//! only matter on real hardware. Outputs are written in place so elements a
//! kernel does not cover keep their previous contents, as on the GPU.

pub mod activation;
pub mod arith;
pub mod attention;
pub mod dequant;
pub mod embed;
pub mod matmul;
pub mod norm;
pub mod rope;
pub mod softmax;

use ember::kernels::KernelKey;
use ember::{Error, Result};

/// Run `kernel` over `inputs` into `output`.
///
/// # Errors
/// [`Error::Backend`] if a buffer is too small for the uniforms, or the
/// uniform block is malformed.
pub fn execute(kernel: KernelKey, inputs: &[Vec<u32>], output: &mut [u32], uniforms: &[u8]) -> Result<()> {
    if inputs.len() != kernel.input_count() {
        return Err(Error::Backend(format!(
            "{kernel} bound with {} inputs",
            inputs.len()
        )));
    }
    let out: &mut [f32] = bytemuck::cast_slice_mut(output);
    match kernel {
        KernelKey::Matmul(variant) => {
            matmul::matmul(variant, f32s(&inputs[0]), f32s(&inputs[1]), out, uniforms)
        }
        KernelKey::Dequantize(_) => dequant::dequantize(&inputs[0], out, uniforms),
        KernelKey::Attention(variant) => attention::attention(
            variant,
            f32s(&inputs[0]),
            f32s(&inputs[1]),
            f32s(&inputs[2]),
            out,
            uniforms,
        ),
        KernelKey::RmsNorm => norm::rms_norm(f32s(&inputs[0]), f32s(&inputs[1]), out, uniforms),
        KernelKey::Softmax(variant) => softmax::softmax(variant, f32s(&inputs[0]), out, uniforms),
        KernelKey::Rope(variant) => rope::rope(variant, f32s(&inputs[0]), out, uniforms),
        KernelKey::Silu(_) => activation::silu(
            f32s(&inputs[0]),
            inputs.get(1).map(|gate| f32s(gate)),
            out,
            uniforms,
        ),
        KernelKey::Gather => embed::gather(f32s(&inputs[0]), &inputs[1], out, uniforms),
        KernelKey::ResidualAdd => arith::add(f32s(&inputs[0]), f32s(&inputs[1]), out, uniforms),
    }
}

fn f32s(words: &[u32]) -> &[f32] {
    bytemuck::cast_slice(words)
}

/// Fail unless `name` holds at least `needed` elements.
pub(crate) fn check_len(name: &str, len: usize, needed: usize) -> Result<()> {
    if len < needed {
        return Err(Error::Backend(format!(
            "{name} holds {len} elements, kernel reads {needed}"
        )));
    }
    Ok(())
}

/// Decode a uniform block, reporting failures as backend errors.
pub(crate) fn decode<U: ember::uniforms::Uniforms>(bytes: &[u8]) -> Result<U> {
    U::from_bytes(bytes).map_err(|e| Error::Backend(format!("malformed uniforms: {e}")))
}

pub(crate) fn usize_of(value: u32) -> usize {
    value as usize
}
