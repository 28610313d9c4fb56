//! `C = alpha * A @ B`, with half-precision products for the f16 variants.

use ember::kernels::MatmulVariant;
use ember::uniforms::MatmulUniforms;
use ember::Result;
use half::f16;

use super::{check_len, decode, usize_of};

/// The product as the f16 shaders form it: both operands and the product
/// are rounded to half precision.
fn half_product(a: f32, b: f32) -> f32 {
    let product = f16::from_f32(a).to_f32() * f16::from_f32(b).to_f32();
    f16::from_f32(product).to_f32()
}

pub fn matmul(
    variant: MatmulVariant,
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    uniforms: &[u8],
) -> Result<()> {
    let u: MatmulUniforms = decode(uniforms)?;
    let (m, n, k) = (usize_of(u.m), usize_of(u.n), usize_of(u.k));
    check_len("A", a.len(), m * k)?;
    check_len("B", b.len(), k * n)?;
    check_len("C", c.len(), m * n)?;

    let product: fn(f32, f32) -> f32 = match variant {
        MatmulVariant::F32 => |x: f32, y: f32| x * y,
        MatmulVariant::F16 | MatmulVariant::F16Vec4 => half_product,
    };
    for row in 0..m {
        let a_row = &a[row * k..(row + 1) * k];
        for col in 0..n {
            let mut acc = 0.0f32;
            for (i, &x) in a_row.iter().enumerate() {
                acc += product(x, b[i * n + col]);
            }
            c[row * n + col] = acc * u.alpha;
        }
    }
    Ok(())
}
