//! Fused scaled dot-product attention

#![allow(clippy::cast_possible_truncation)]

use crate::attention::{default_scale, AttentionShape};
use crate::backend::ComputeBackend;
use crate::context::{DeviceBuffer, GpuContext};
use crate::dispatch::{Grid, Launch};
use crate::kernels::{AttentionVariant, KernelKey, Operation, SelectionHints};
use crate::ops::{bytes, dim, expect_elems};
use crate::uniforms::{AttentionUniforms, Uniforms};
use crate::Result;

/// Per-call attention settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionOptions {
    pub causal: bool,
    /// Defaults to `1 / sqrt(head_dim)`.
    pub scale: Option<f32>,
}

impl Default for AttentionOptions {
    fn default() -> Self {
        Self {
            causal: true,
            scale: None,
        }
    }
}

impl<B: ComputeBackend> GpuContext<B> {
    pub(crate) fn plan_attention(
        &self,
        shape: &AttentionShape,
        options: AttentionOptions,
    ) -> Result<Launch> {
        shape.validate()?;
        let hints = SelectionHints {
            seq_len: shape.seq_len,
            ..SelectionHints::default()
        };
        let kernel = self.select_variant(Operation::Attention, &hints)?;
        let seq_len = dim(shape.seq_len, "seq_len")?;
        let num_heads = dim(shape.num_heads, "num_heads")?;
        let grid = match kernel {
            KernelKey::Attention(AttentionVariant::Decode) => Grid::Workgroups([num_heads, 1, 1]),
            _ => Grid::Extent([seq_len, num_heads, 1]),
        };
        Ok(Launch {
            kernel,
            uniforms: AttentionUniforms {
                seq_len,
                kv_len: dim(shape.kv_len, "kv_len")?,
                num_heads,
                num_kv_heads: dim(shape.num_kv_heads, "num_kv_heads")?,
                head_dim: dim(shape.head_dim, "head_dim")?,
                scale: options.scale.unwrap_or_else(|| default_scale(shape.head_dim)),
                causal: options.causal,
                has_mask: false,
            }
            .to_bytes(),
            output_size: bytes(shape.q_elems()),
            output_label: "attention",
            grid,
            work: shape.q_elems() as u64,
        })
    }

    /// Attention over `q` (`[seq_len, num_heads, head_dim]`) and `k`, `v`
    /// (`[kv_len, num_kv_heads, head_dim]`).
    ///
    /// A single query position runs the decode kernel, anything longer the
    /// tiled prefill kernel. See [`crate::attention`] for the algorithm.
    ///
    /// # Errors
    /// [`Error::Configuration`](crate::Error) if `head_dim` exceeds
    /// [`MAX_HEAD_DIM`](crate::attention::MAX_HEAD_DIM); shape errors; dispatch errors.
    pub async fn run_attention(
        &self,
        q: &DeviceBuffer<B>,
        k: &DeviceBuffer<B>,
        v: &DeviceBuffer<B>,
        shape: &AttentionShape,
        options: AttentionOptions,
    ) -> Result<DeviceBuffer<B>> {
        let launch = self.plan_attention(shape, options)?;
        expect_elems(q, &[shape.seq_len, shape.num_heads, shape.head_dim])?;
        expect_elems(k, &[shape.kv_len, shape.num_kv_heads, shape.head_dim])?;
        expect_elems(v, &[shape.kv_len, shape.num_kv_heads, shape.head_dim])?;
        self.launch(launch, &[q, k, v], None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::MAX_HEAD_DIM;
    use crate::capabilities::PowerPreference;
    use crate::testing::MockBackend;
    use crate::Error;

    async fn context() -> GpuContext<MockBackend> {
        GpuContext::new(MockBackend::with_adapter_for(PowerPreference::HighPerformance))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_variant_by_query_length() {
        let ctx = context().await;
        let decode = ctx
            .plan_attention(&AttentionShape::new(1, 8, 64).with_kv(100, 2), AttentionOptions::default())
            .unwrap();
        assert_eq!(decode.kernel, KernelKey::Attention(AttentionVariant::Decode));
        assert_eq!(decode.grid, Grid::Workgroups([8, 1, 1]));

        let prefill = ctx
            .plan_attention(&AttentionShape::new(40, 8, 64), AttentionOptions::default())
            .unwrap();
        assert_eq!(prefill.kernel, KernelKey::Attention(AttentionVariant::Prefill));
        // ceil(40 / 32) x 8 workgroups with the 32-row tile.
        assert_eq!(prefill.grid.workgroups([32, 1, 1]), [2, 8, 1]);
    }

    #[tokio::test]
    async fn test_uniform_fields() {
        let ctx = context().await;
        let plan = ctx
            .plan_attention(
                &AttentionShape::new(3, 4, 16).with_kv(10, 2),
                AttentionOptions {
                    causal: false,
                    scale: Some(0.5),
                },
            )
            .unwrap();
        let u = AttentionUniforms::from_bytes(&plan.uniforms).unwrap();
        assert_eq!((u.seq_len, u.kv_len, u.num_heads, u.num_kv_heads), (3, 10, 4, 2));
        assert_eq!(u.head_dim, 16);
        assert_eq!(u.scale, 0.5);
        assert!(!u.causal);
        assert!(!u.has_mask);
    }

    #[tokio::test]
    async fn test_head_dim_bound_is_configuration_error() {
        let ctx = context().await;
        let err = ctx
            .plan_attention(
                &AttentionShape::new(1, 1, MAX_HEAD_DIM + 1),
                AttentionOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "got {err:?}");
    }
}
