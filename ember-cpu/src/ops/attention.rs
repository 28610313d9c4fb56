//! Fused attention, delegating to the streaming algorithms in
//! [`ember::attention`].

use ember::attention::{decode as decode_attention, prefill, AttentionShape};
use ember::kernels::AttentionVariant;
use ember::uniforms::AttentionUniforms;
use ember::{Error, Result};

use super::{check_len, decode, usize_of};

pub fn attention(
    variant: AttentionVariant,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    out: &mut [f32],
    uniforms: &[u8],
) -> Result<()> {
    let u: AttentionUniforms = decode(uniforms)?;
    let shape = AttentionShape {
        seq_len: usize_of(u.seq_len),
        kv_len: usize_of(u.kv_len),
        num_heads: usize_of(u.num_heads),
        num_kv_heads: usize_of(u.num_kv_heads),
        head_dim: usize_of(u.head_dim),
    };
    check_len("output", out.len(), shape.q_elems())?;
    let result = match variant {
        AttentionVariant::Prefill => prefill(q, k, v, &shape, u.scale, u.causal),
        AttentionVariant::Decode => decode_attention(q, k, v, &shape, u.scale),
    }
    .map_err(|e| Error::Backend(format!("attention: {e}")))?;
    out[..result.len()].copy_from_slice(&result);
    Ok(())
}
