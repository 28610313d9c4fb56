//! 4-bit block quantization.
//!
//! A block holds [`BLOCK_SIZE`] weights in [`BLOCK_WORDS`] little-endian
//! `u32` words: word 0 is the `f32` scale bits, words 1..=4 pack the codes
//! low nibble first. A code `q` in `0..16` decodes to `(q - 8) * scale`.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

use crate::{Error, Result};

/// Weights per block.
pub const BLOCK_SIZE: usize = 32;

/// `u32` words per block.
pub const BLOCK_WORDS: usize = 5;

/// Quantize `values` into blocks.
///
/// # Errors
/// [`Error::InvalidShape`] if the length is not a multiple of [`BLOCK_SIZE`].
pub fn quantize_blocks(values: &[f32]) -> Result<Vec<u32>> {
    if values.len() % BLOCK_SIZE != 0 {
        return Err(Error::InvalidShape(format!(
            "{} values is not a multiple of the block size {BLOCK_SIZE}",
            values.len()
        )));
    }
    let mut words = Vec::with_capacity(values.len() / BLOCK_SIZE * BLOCK_WORDS);
    for block in values.chunks(BLOCK_SIZE) {
        let max_abs = block.iter().map(|x| x.abs()).fold(0.0_f32, f32::max);
        let scale = if max_abs == 0.0 { 1.0 } else { max_abs / 7.0 };
        words.push(scale.to_bits());
        for group in block.chunks(8) {
            let mut packed = 0u32;
            for (j, &v) in group.iter().enumerate() {
                // [-8, 7] stored as [0, 15]
                let code = ((v / scale).round().clamp(-8.0, 7.0) as i32 + 8) as u32;
                packed |= code << (j * 4);
            }
            words.push(packed);
        }
    }
    Ok(words)
}

/// Decode the first `num_blocks` blocks of `words`.
///
/// # Errors
/// [`Error::ShapeMismatch`] if `words` holds fewer blocks.
pub fn dequantize_blocks(words: &[u32], num_blocks: usize) -> Result<Vec<f32>> {
    if words.len() < num_blocks * BLOCK_WORDS {
        return Err(Error::ShapeMismatch {
            expected: vec![num_blocks, BLOCK_WORDS],
            got: vec![words.len()],
        });
    }
    let mut out = Vec::with_capacity(num_blocks * BLOCK_SIZE);
    for block in words.chunks(BLOCK_WORDS).take(num_blocks) {
        let scale = f32::from_bits(block[0]);
        for lane in 0..BLOCK_SIZE {
            let code = (block[1 + lane / 8] >> ((lane % 8) * 4)) & 0xf;
            out.push((code as f32 - 8.0) * scale);
        }
    }
    Ok(out)
}
