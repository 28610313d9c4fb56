use ember::uniforms::ElementwiseUniforms;
use ember::Result;

use super::{check_len, decode, usize_of};

pub fn add(a: &[f32], b: &[f32], y: &mut [f32], uniforms: &[u8]) -> Result<()> {
    let u: ElementwiseUniforms = decode(uniforms)?;
    let size = usize_of(u.size);
    check_len("a", a.len(), size)?;
    check_len("b", b.len(), size)?;
    check_len("y", y.len(), size)?;
    for ((o, &l), &r) in y[..size].iter_mut().zip(a).zip(b) {
        *o = l + r;
    }
    Ok(())
}
