use ember::kernels::SoftmaxVariant;
use ember::uniforms::SoftmaxUniforms;
use ember::Result;

use super::{check_len, decode, usize_of};

/// Row softmax of `x / temperature`.
///
/// `Online` uses the single-pass running maximum of its shader, the other
/// variants an explicit max pass.
pub fn softmax(variant: SoftmaxVariant, x: &[f32], y: &mut [f32], uniforms: &[u8]) -> Result<()> {
    let u: SoftmaxUniforms = decode(uniforms)?;
    let (rows, size) = (usize_of(u.batch_size), usize_of(u.size));
    check_len("x", x.len(), rows * size)?;
    check_len("y", y.len(), rows * size)?;

    for (row_in, row_out) in x.chunks_exact(size).zip(y.chunks_exact_mut(size)).take(rows) {
        let (max, sum) = match variant {
            SoftmaxVariant::Online => running_max_sum(row_in, u.temperature),
            SoftmaxVariant::Small | SoftmaxVariant::Default => {
                let max = row_in
                    .iter()
                    .map(|v| v / u.temperature)
                    .fold(f32::NEG_INFINITY, f32::max);
                let sum: f32 = row_in.iter().map(|v| (v / u.temperature - max).exp()).sum();
                (max, sum)
            }
        };
        for (o, &v) in row_out.iter_mut().zip(row_in) {
            *o = (v / u.temperature - max).exp() / sum;
        }
    }
    Ok(())
}

/// One pass over the row, rescaling the sum whenever the maximum grows.
fn running_max_sum(row: &[f32], temperature: f32) -> (f32, f32) {
    let mut max = f32::NEG_INFINITY;
    let mut sum = 0.0f32;
    for &v in row {
        let value = v / temperature;
        if value > max {
            sum = sum * (max - value).exp() + 1.0;
            max = value;
        } else {
            sum += (value - max).exp();
        }
    }
    (max, sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember::uniforms::Uniforms;

    #[test]
    fn test_online_matches_two_pass() {
        let x: Vec<f32> = (0..50).map(|i| ((i * 37) % 11) as f32 - 4.0).collect();
        let u = SoftmaxUniforms {
            batch_size: 2,
            size: 25,
            temperature: 0.7,
        }
        .to_bytes();
        let mut two_pass = vec![0.0; 50];
        let mut online = vec![0.0; 50];
        softmax(SoftmaxVariant::Default, &x, &mut two_pass, &u).unwrap();
        softmax(SoftmaxVariant::Online, &x, &mut online, &u).unwrap();
        for (a, b) in two_pass.iter().zip(&online) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
        let row_sum: f32 = online[..25].iter().sum();
        assert!((row_sum - 1.0).abs() < 1e-5);
    }
}
