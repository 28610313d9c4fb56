use ember::kernels::RopeVariant;
use ember::rope::apply_rope;
use ember::uniforms::RopeUniforms;
use ember::Result;

use super::{check_len, decode, usize_of};

pub fn rope(variant: RopeVariant, x: &[f32], y: &mut [f32], uniforms: &[u8]) -> Result<()> {
    let u: RopeUniforms = decode(uniforms)?;
    let (seq, heads, dim) = (
        usize_of(u.seq_len),
        usize_of(u.num_heads),
        usize_of(u.head_dim),
    );
    let elems = seq * heads * dim;
    check_len("x", x.len(), elems)?;
    check_len("y", y.len(), elems)?;
    let rotated = apply_rope(
        variant,
        &x[..elems],
        seq,
        heads,
        dim,
        u.start_pos,
        u.rope_base,
        u.rope_scale,
    );
    y[..elems].copy_from_slice(&rotated);
    Ok(())
}
