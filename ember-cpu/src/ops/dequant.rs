use ember::quant::{BLOCK_SIZE, BLOCK_WORDS};
use ember::uniforms::DequantUniforms;
use ember::Result;

use super::{check_len, decode, usize_of};

/// Decode `num_blocks` blocks into `out[output_offset..]`. All four shader
/// variants produce the same values.
pub fn dequantize(words: &[u32], out: &mut [f32], uniforms: &[u8]) -> Result<()> {
    let u: DequantUniforms = decode(uniforms)?;
    let blocks = usize_of(u.num_blocks);
    let offset = usize_of(u.output_offset);
    check_len("blocks", words.len(), blocks * BLOCK_WORDS)?;
    check_len("output", out.len(), offset + blocks * BLOCK_SIZE)?;

    for (block, chunk) in words.chunks_exact(BLOCK_WORDS).take(blocks).enumerate() {
        let scale = f32::from_bits(chunk[0]);
        let base = offset + block * BLOCK_SIZE;
        for lane in 0..BLOCK_SIZE {
            let code = (chunk[1 + lane / 8] >> ((lane % 8) * 4)) & 0xf;
            #[allow(clippy::cast_precision_loss)]
            let value = (code as f32 - 8.0) * scale;
            out[base + lane] = value;
        }
    }
    Ok(())
}
