use ember::uniforms::RmsNormUniforms;
use ember::Result;

use super::{check_len, decode, usize_of};

/// `y = x * rsqrt(mean(x^2) + eps) * w` per row.
pub fn rms_norm(x: &[f32], w: &[f32], y: &mut [f32], uniforms: &[u8]) -> Result<()> {
    let u: RmsNormUniforms = decode(uniforms)?;
    let (rows, hidden) = (usize_of(u.batch_size), usize_of(u.hidden_size));
    check_len("x", x.len(), rows * hidden)?;
    check_len("weight", w.len(), hidden)?;
    check_len("y", y.len(), rows * hidden)?;

    #[allow(clippy::cast_precision_loss)]
    let n = hidden as f32;
    for (row_in, row_out) in x
        .chunks_exact(hidden)
        .zip(y.chunks_exact_mut(hidden))
        .take(rows)
    {
        let sum_sq: f32 = row_in.iter().map(|v| v * v).sum();
        let inv_rms = 1.0 / (sum_sq / n + u.eps).sqrt();
        for ((o, &v), &g) in row_out.iter_mut().zip(row_in).zip(w) {
            *o = v * inv_rms * g;
        }
    }
    Ok(())
}
