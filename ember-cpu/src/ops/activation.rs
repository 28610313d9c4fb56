use ember::uniforms::ElementwiseUniforms;
use ember::Result;

use super::{check_len, decode, usize_of};

fn silu_of(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// `silu(x)`, or `silu(gate) * x` when a gate is bound.
pub fn silu(x: &[f32], gate: Option<&[f32]>, y: &mut [f32], uniforms: &[u8]) -> Result<()> {
    let u: ElementwiseUniforms = decode(uniforms)?;
    let size = usize_of(u.size);
    check_len("x", x.len(), size)?;
    check_len("y", y.len(), size)?;
    match gate {
        Some(gate) => {
            check_len("gate", gate.len(), size)?;
            for ((o, &v), &g) in y[..size].iter_mut().zip(x).zip(gate) {
                *o = silu_of(g) * v;
            }
        }
        None => {
            for (o, &v) in y[..size].iter_mut().zip(x) {
                *o = silu_of(v);
            }
        }
    }
    Ok(())
}
