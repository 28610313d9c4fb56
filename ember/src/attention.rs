//! Scaled dot-product attention with a streaming softmax.
//!
//! Two paths compute the same function:
//!
//! - [`prefill`] walks query tiles and, for each, key/value tiles of
//!   [`PREFILL_TILE`] positions, keeping a running max and sum per query
//!   row and rescaling the accumulator by `exp(old_max - new_max)` whenever
//!   the max grows. The full score matrix is never materialized.
//! - [`decode`] handles a single query position by striding the keys over
//!   [`DECODE_WORKERS`] workers, combining per-worker max and sum with tree
//!   reductions, and finally summing the per-worker partial outputs.
//!
//! Layouts: Q and the output are `[seq_len, num_heads, head_dim]`, K and V
//! are `[kv_len, num_kv_heads, head_dim]`. With a KV cache
//! (`kv_len > seq_len`) query row `i` sits at absolute position
//! `kv_len - seq_len + i`. Query head `h` reads KV head
//! `h / (num_heads / num_kv_heads)`.
//!
//! These functions are the host implementation of the attention kernels
//! and the reference the GPU shaders are checked against.

#![allow(clippy::cast_precision_loss, clippy::needless_range_loop)]

use crate::{Error, Result};

/// Capacity of the per-worker output accumulators.
pub const MAX_HEAD_DIM: usize = 256;

/// Query and key tile length of the prefill path.
pub const PREFILL_TILE: usize = 32;

/// Workers sharing the key sequence in the decode path.
pub const DECODE_WORKERS: usize = 256;

/// Dimensions of one attention call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    pub seq_len: usize,
    pub kv_len: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl AttentionShape {
    /// Shape without a KV cache (`kv_len == seq_len`) and without GQA.
    #[must_use]
    pub fn new(seq_len: usize, num_heads: usize, head_dim: usize) -> Self {
        Self {
            seq_len,
            kv_len: seq_len,
            num_heads,
            num_kv_heads: num_heads,
            head_dim,
        }
    }

    #[must_use]
    pub fn with_kv(mut self, kv_len: usize, num_kv_heads: usize) -> Self {
        self.kv_len = kv_len;
        self.num_kv_heads = num_kv_heads;
        self
    }

    /// # Errors
    /// [`Error::Configuration`] if `head_dim` exceeds [`MAX_HEAD_DIM`];
    /// [`Error::InvalidShape`] for zero sizes, a head count not divisible
    /// by the KV head count, or fewer keys than queries.
    pub fn validate(&self) -> Result<()> {
        if self.head_dim > MAX_HEAD_DIM {
            return Err(Error::Configuration(format!(
                "head_dim {} exceeds the attention accumulator capacity of {MAX_HEAD_DIM}",
                self.head_dim
            )));
        }
        if self.seq_len == 0 || self.num_heads == 0 || self.num_kv_heads == 0 || self.head_dim == 0
        {
            return Err(Error::InvalidShape(format!(
                "attention dimensions must be non-zero: {self:?}"
            )));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(Error::InvalidShape(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.kv_len < self.seq_len {
            return Err(Error::InvalidShape(format!(
                "kv_len ({}) must be at least seq_len ({})",
                self.kv_len, self.seq_len
            )));
        }
        Ok(())
    }

    /// KV head read by query head `head`.
    #[must_use]
    pub fn kv_head(&self, head: usize) -> usize {
        head / (self.num_heads / self.num_kv_heads)
    }

    #[must_use]
    pub fn q_elems(&self) -> usize {
        self.seq_len * self.num_heads * self.head_dim
    }

    #[must_use]
    pub fn kv_elems(&self) -> usize {
        self.kv_len * self.num_kv_heads * self.head_dim
    }

    /// Absolute position of query row `row`.
    #[must_use]
    pub fn query_position(&self, row: usize) -> usize {
        self.kv_len - self.seq_len + row
    }
}

/// `1 / sqrt(head_dim)`
#[must_use]
pub fn default_scale(head_dim: usize) -> f32 {
    1.0 / (head_dim as f32).sqrt()
}

fn check_lengths(q: &[f32], k: &[f32], v: &[f32], shape: &AttentionShape) -> Result<()> {
    shape.validate()?;
    if q.len() < shape.q_elems() {
        return Err(Error::ShapeMismatch {
            expected: vec![shape.seq_len, shape.num_heads, shape.head_dim],
            got: vec![q.len()],
        });
    }
    for kv in [k, v] {
        if kv.len() < shape.kv_elems() {
            return Err(Error::ShapeMismatch {
                expected: vec![shape.kv_len, shape.num_kv_heads, shape.head_dim],
                got: vec![kv.len()],
            });
        }
    }
    Ok(())
}

fn dot_scaled(q: &[f32], k: &[f32], scale: f32) -> f32 {
    let mut acc = 0.0f32;
    for d in 0..q.len() {
        acc += q[d] * k[d];
    }
    acc * scale
}

struct RowState {
    max: f32,
    sum: f32,
    acc: [f32; MAX_HEAD_DIM],
}

impl RowState {
    fn new() -> Self {
        Self {
            max: f32::NEG_INFINITY,
            sum: 0.0,
            acc: [0.0; MAX_HEAD_DIM],
        }
    }
}

/// Tiled online-softmax attention.
///
/// # Errors
/// See [`AttentionShape::validate`]; [`Error::ShapeMismatch`] if a slice is
/// shorter than its shape.
pub fn prefill(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    shape: &AttentionShape,
    scale: f32,
    causal: bool,
) -> Result<Vec<f32>> {
    check_lengths(q, k, v, shape)?;
    let dim = shape.head_dim;
    let kv_stride = shape.num_kv_heads * dim;
    let mut output = vec![0.0f32; shape.q_elems()];
    let mut scores = [0.0f32; PREFILL_TILE];

    for h in 0..shape.num_heads {
        let kv_h = shape.kv_head(h);
        for q_start in (0..shape.seq_len).step_by(PREFILL_TILE) {
            let q_end = (q_start + PREFILL_TILE).min(shape.seq_len);
            let last_pos = shape.query_position(q_end - 1);
            let mut rows: Vec<RowState> = (q_start..q_end).map(|_| RowState::new()).collect();

            for k_start in (0..shape.kv_len).step_by(PREFILL_TILE) {
                if causal && k_start > last_pos {
                    break;
                }
                let k_end = (k_start + PREFILL_TILE).min(shape.kv_len);

                for (r, state) in rows.iter_mut().enumerate() {
                    let row = q_start + r;
                    let q_pos = shape.query_position(row);
                    let q_off = (row * shape.num_heads + h) * dim;
                    let q_vec = &q[q_off..q_off + dim];

                    let mut tile_max = f32::NEG_INFINITY;
                    let mut live = false;
                    for j in k_start..k_end {
                        if causal && j > q_pos {
                            continue;
                        }
                        let k_off = j * kv_stride + kv_h * dim;
                        let s = dot_scaled(q_vec, &k[k_off..k_off + dim], scale);
                        scores[j - k_start] = s;
                        tile_max = tile_max.max(s);
                        live = true;
                    }
                    if !live {
                        continue;
                    }

                    let new_max = state.max.max(tile_max);
                    let correction = (state.max - new_max).exp();
                    state.sum *= correction;
                    for d in 0..dim {
                        state.acc[d] *= correction;
                    }

                    for j in k_start..k_end {
                        if causal && j > q_pos {
                            continue;
                        }
                        let p = (scores[j - k_start] - new_max).exp();
                        state.sum += p;
                        let v_off = j * kv_stride + kv_h * dim;
                        for d in 0..dim {
                            state.acc[d] += p * v[v_off + d];
                        }
                    }
                    state.max = new_max;
                }
            }

            for (r, state) in rows.iter().enumerate() {
                let o_off = ((q_start + r) * shape.num_heads + h) * dim;
                // A row masked against every key keeps a zero sum; leave it zero.
                if state.sum > 0.0 {
                    for d in 0..dim {
                        output[o_off + d] = state.acc[d] / state.sum;
                    }
                }
            }
        }
    }

    Ok(output)
}

/// Pairwise tree reduction over a power-of-two number of lanes.
fn tree_reduce(values: &mut [f32], op: impl Fn(f32, f32) -> f32) -> f32 {
    let mut stride = values.len() / 2;
    while stride > 0 {
        for i in 0..stride {
            values[i] = op(values[i], values[i + stride]);
        }
        stride /= 2;
    }
    values[0]
}

/// Single-query attention with worker-partitioned keys.
///
/// The query is the last position, so every key is visible and no causal
/// mask applies.
///
/// # Errors
/// As [`prefill`], plus [`Error::InvalidShape`] if `seq_len != 1`.
pub fn decode(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    shape: &AttentionShape,
    scale: f32,
) -> Result<Vec<f32>> {
    check_lengths(q, k, v, shape)?;
    if shape.seq_len != 1 {
        return Err(Error::InvalidShape(format!(
            "decode attention takes one query position, got {}",
            shape.seq_len
        )));
    }
    let dim = shape.head_dim;
    let kv_stride = shape.num_kv_heads * dim;
    let mut output = vec![0.0f32; shape.q_elems()];
    let mut lanes = [0.0f32; DECODE_WORKERS];
    let mut partial = vec![0.0f32; DECODE_WORKERS * dim];

    for h in 0..shape.num_heads {
        let kv_h = shape.kv_head(h);
        let q_vec = &q[h * dim..(h + 1) * dim];
        let score = |j: usize| {
            let k_off = j * kv_stride + kv_h * dim;
            dot_scaled(q_vec, &k[k_off..k_off + dim], scale)
        };

        for (w, lane) in lanes.iter_mut().enumerate() {
            *lane = (w..shape.kv_len)
                .step_by(DECODE_WORKERS)
                .map(score)
                .fold(f32::NEG_INFINITY, f32::max);
        }
        let global_max = tree_reduce(&mut lanes, f32::max);

        partial.fill(0.0);
        for w in 0..DECODE_WORKERS {
            let acc = &mut partial[w * dim..(w + 1) * dim];
            let mut local_sum = 0.0f32;
            for j in (w..shape.kv_len).step_by(DECODE_WORKERS) {
                let p = (score(j) - global_max).exp();
                local_sum += p;
                let v_off = j * kv_stride + kv_h * dim;
                for d in 0..dim {
                    acc[d] += p * v[v_off + d];
                }
            }
            lanes[w] = local_sum;
        }
        let global_sum = tree_reduce(&mut lanes, |a, b| a + b);

        // Serial per-dimension sum over workers.
        let o_off = h * dim;
        for d in 0..dim {
            let mut total = 0.0f32;
            for w in 0..DECODE_WORKERS {
                total += partial[w * dim + d];
            }
            if global_sum > 0.0 {
                output[o_off + d] = total / global_sum;
            }
        }
    }

    Ok(output)
}
