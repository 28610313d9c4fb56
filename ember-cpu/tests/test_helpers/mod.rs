//! Shared helpers for host-backend integration tests: deterministic data,
//! naive reference kernels and tolerance checks.

#![allow(dead_code)]

use ember::{GpuContext, RuntimeConfig};
use ember_cpu::HostBackend;

/// Host context with half precision disabled, so matmul results are exact
/// `f32` sums.
pub async fn full_precision_context() -> GpuContext<HostBackend> {
    let config = RuntimeConfig {
        prefer_f16: false,
        ..RuntimeConfig::default()
    };
    GpuContext::create(HostBackend::new(), config)
        .await
        .expect("host context")
}

pub async fn default_context() -> GpuContext<HostBackend> {
    GpuContext::new(HostBackend::new()).await.expect("host context")
}

/// Deterministic values in `[-1, 1)`.
pub fn pseudo_random(len: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state % 20_000) as f32 / 10_000.0 - 1.0
        })
        .collect()
}

#[track_caller]
pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol * (1.0 + e.abs()),
            "element {i}: got {a}, expected {e} (tol {tol})"
        );
    }
}

pub fn matmul_reference(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut c = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            c[i * n + j] = (0..k).map(|l| a[i * k + l] * b[l * n + j]).sum();
        }
    }
    c
}

/// Plain softmax attention over `[seq, heads, dim]` queries and
/// `[kv, kv_heads, dim]` keys and values.
#[allow(clippy::too_many_arguments)]
pub fn attention_reference(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    seq: usize,
    kv: usize,
    heads: usize,
    kv_heads: usize,
    dim: usize,
    causal: bool,
) -> Vec<f32> {
    let scale = 1.0 / (dim as f32).sqrt();
    let group = heads / kv_heads;
    let mut out = vec![0.0; seq * heads * dim];
    for s in 0..seq {
        let position = kv - seq + s;
        for h in 0..heads {
            let kh = h / group;
            let qrow = &q[(s * heads + h) * dim..][..dim];
            let visible = if causal { position + 1 } else { kv };
            let scores: Vec<f32> = (0..visible)
                .map(|j| {
                    let krow = &k[(j * kv_heads + kh) * dim..][..dim];
                    qrow.iter().zip(krow).map(|(a, b)| a * b).sum::<f32>() * scale
                })
                .collect();
            let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let weights: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
            let total: f32 = weights.iter().sum();
            let orow = &mut out[(s * heads + h) * dim..][..dim];
            for (j, w) in weights.iter().enumerate() {
                let vrow = &v[(j * kv_heads + kh) * dim..][..dim];
                for d in 0..dim {
                    orow[d] += w / total * vrow[d];
                }
            }
        }
    }
    out
}
