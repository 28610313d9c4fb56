//! Rotary position embedding

use serde::{Deserialize, Serialize};

use crate::backend::ComputeBackend;
use crate::context::{DeviceBuffer, GpuContext};
use crate::dispatch::{Grid, Launch};
use crate::kernels::{Operation, SelectionHints};
use crate::ops::{bytes, dim, expect_elems};
use crate::rope::RopeScaling;
use crate::uniforms::{RopeUniforms, Uniforms};
use crate::{Error, Result};

/// Shape and frequency settings of one RoPE call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RopeParams {
    pub seq_len: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    /// Absolute position of the first row (the KV cache length).
    pub start_pos: u32,
    #[serde(default = "default_rope_base")]
    pub base: f32,
    #[serde(default)]
    pub scaling: RopeScaling,
}

fn default_rope_base() -> f32 {
    10000.0
}

impl<B: ComputeBackend> GpuContext<B> {
    pub(crate) fn plan_rope(&self, params: &RopeParams) -> Result<Launch> {
        let head_dim = dim(params.head_dim, "head_dim")?;
        if head_dim % 2 != 0 {
            return Err(Error::InvalidShape(format!(
                "RoPE needs an even head_dim, got {head_dim}"
            )));
        }
        if matches!(params.scaling, RopeScaling::Ntk { .. }) && head_dim <= 2 {
            return Err(Error::Configuration(
                "NTK scaling needs head_dim > 2".into(),
            ));
        }
        if params.scaling.factor() <= 0.0 {
            return Err(Error::Configuration(format!(
                "RoPE scaling factor must be positive, got {}",
                params.scaling.factor()
            )));
        }
        let seq_len = dim(params.seq_len, "seq_len")?;
        let num_heads = dim(params.num_heads, "num_heads")?;
        let hints = SelectionHints {
            rope_scaling: params.scaling,
            ..SelectionHints::default()
        };
        let kernel = self.select_variant(Operation::Rope, &hints)?;
        let elems = params.seq_len * params.num_heads * params.head_dim;
        Ok(Launch {
            kernel,
            uniforms: RopeUniforms {
                seq_len,
                num_heads,
                head_dim,
                start_pos: params.start_pos,
                rope_base: params.base,
                rope_scale: params.scaling.factor(),
            }
            .to_bytes(),
            output_size: bytes(elems),
            output_label: "rope",
            grid: Grid::Extent([head_dim / 2, num_heads, seq_len]),
            work: elems as u64 / 2,
        })
    }

    /// Rotate `x` (`[seq_len, num_heads, head_dim]`) into a new buffer.
    ///
    /// # Errors
    /// [`Error::InvalidShape`] for an odd `head_dim`, [`Error::Configuration`]
    /// for unusable scaling, and dispatch errors.
    pub async fn run_rope(&self, x: &DeviceBuffer<B>, params: &RopeParams) -> Result<DeviceBuffer<B>> {
        let launch = self.plan_rope(params)?;
        expect_elems(x, &[params.seq_len, params.num_heads, params.head_dim])?;
        self.launch(launch, &[x], None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::PowerPreference;
    use crate::kernels::{KernelKey, RopeVariant};
    use crate::testing::MockBackend;

    fn params(head_dim: usize, scaling: RopeScaling) -> RopeParams {
        RopeParams {
            seq_len: 5,
            num_heads: 2,
            head_dim,
            start_pos: 7,
            base: 10000.0,
            scaling,
        }
    }

    #[tokio::test]
    async fn test_plan() {
        let ctx = GpuContext::new(MockBackend::with_adapter_for(PowerPreference::HighPerformance))
            .await
            .unwrap();
        let plan = ctx.plan_rope(&params(8, RopeScaling::Linear { factor: 2.0 })).unwrap();
        assert_eq!(plan.kernel, KernelKey::Rope(RopeVariant::Linear));
        assert_eq!(plan.grid, Grid::Extent([4, 2, 5]));
        let u = RopeUniforms::from_bytes(&plan.uniforms).unwrap();
        assert_eq!(u.start_pos, 7);
        assert_eq!(u.rope_scale, 2.0);

        assert!(matches!(
            ctx.plan_rope(&params(7, RopeScaling::None)),
            Err(Error::InvalidShape(_))
        ));
        assert!(matches!(
            ctx.plan_rope(&params(2, RopeScaling::Ntk { factor: 4.0 })),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_params_serde_defaults() {
        let p: RopeParams =
            serde_json::from_str(r#"{"seq_len":1,"num_heads":1,"head_dim":4,"start_pos":0}"#)
                .unwrap();
        assert_eq!(p.base, 10000.0);
        assert_eq!(p.scaling, RopeScaling::None);
    }
}
