//! RoPE (Rotary Positional Embeddings) frequencies and host reference.
//!
//! The kernels compute angles on the fly; the functions here compute the
//! same values on the host and serve as the reference implementation.

#![allow(clippy::cast_precision_loss)]

use serde::{Deserialize, Serialize};

use crate::kernels::RopeVariant;

/// RoPE scaling configuration (the `rope_scaling` field of a model config).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RopeScaling {
    #[default]
    None,
    /// Positions are divided by `factor` (position interpolation).
    Linear { factor: f32 },
    /// The base is stretched to `base * factor^(d / (d - 2))`.
    Ntk { factor: f32 },
}

impl RopeScaling {
    /// Value written to the `rope_scale` uniform field.
    #[must_use]
    pub fn factor(self) -> f32 {
        match self {
            Self::None => 1.0,
            Self::Linear { factor } | Self::Ntk { factor } => factor,
        }
    }
}

/// Rotation angle for pair `i` at absolute `position`.
#[must_use]
pub fn rope_angle(
    variant: RopeVariant,
    position: u32,
    i: usize,
    head_dim: usize,
    base: f32,
    scale: f32,
) -> f32 {
    let dim = head_dim as f32;
    let exponent = -((2 * i) as f32) / dim;
    match variant {
        RopeVariant::Default => position as f32 * base.powf(exponent),
        RopeVariant::Linear => position as f32 / scale * base.powf(exponent),
        RopeVariant::Ntk => {
            let stretched = base * scale.powf(dim / (dim - 2.0));
            position as f32 * stretched.powf(exponent)
        }
    }
}

/// Rotate `x` (`[seq_len, num_heads, head_dim]`) in the half-split layout.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn apply_rope(
    variant: RopeVariant,
    x: &[f32],
    seq_len: usize,
    num_heads: usize,
    head_dim: usize,
    start_pos: u32,
    base: f32,
    scale: f32,
) -> Vec<f32> {
    let half_dim = head_dim / 2;
    let mut y = x.to_vec();
    for s in 0..seq_len {
        let position = start_pos + s as u32;
        for h in 0..num_heads {
            let row = (s * num_heads + h) * head_dim;
            for i in 0..half_dim {
                let angle = rope_angle(variant, position, i, head_dim, base, scale);
                let (sin, cos) = angle.sin_cos();
                let x0 = x[row + i];
                let x1 = x[row + i + half_dim];
                y[row + i] = x0 * cos - x1 * sin;
                y[row + i + half_dim] = x0 * sin + x1 * cos;
            }
        }
    }
    y
}
