//! 4-bit block dequantization into an `f32` buffer

#![allow(clippy::cast_possible_truncation)]

use crate::backend::ComputeBackend;
use crate::context::{DeviceBuffer, GpuContext};
use crate::dispatch::{Grid, Launch};
use crate::kernels::{DequantVariant, KernelKey, Operation, SelectionHints};
use crate::ops::{bytes, dim, expect_elems};
use crate::quant::{BLOCK_SIZE, BLOCK_WORDS};
use crate::uniforms::{DequantUniforms, Uniforms};
use crate::{Error, Result};

impl<B: ComputeBackend> GpuContext<B> {
    pub(crate) fn plan_dequantize(&self, num_blocks: usize, output_offset: usize) -> Result<Launch> {
        let blocks32 = dim(num_blocks, "num_blocks")?;
        let offset32 = u32::try_from(output_offset)
            .map_err(|_| Error::InvalidShape(format!("output_offset {output_offset} too large")))?;
        let values = num_blocks * BLOCK_SIZE;
        let values32 = dim(values, "num_blocks * 32")?;
        let hints = SelectionHints {
            vectorize: output_offset % 4 == 0,
            ..SelectionHints::default()
        };
        let kernel = self.select_variant(Operation::Dequantize, &hints)?;
        let invocations = match kernel {
            KernelKey::Dequantize(DequantVariant::SubgroupVec4 | DequantVariant::SharedVec4) => {
                values32 / 4
            }
            _ => values32,
        };
        Ok(Launch {
            kernel,
            uniforms: DequantUniforms {
                num_blocks: blocks32,
                output_offset: offset32,
            }
            .to_bytes(),
            output_size: bytes(output_offset + values),
            output_label: "dequantize",
            grid: Grid::linear(invocations),
            work: values as u64,
        })
    }

    /// Decode `num_blocks` quantized blocks (see [`crate::quant`]) into a new
    /// buffer, writing value `i` at element `output_offset + i`. Elements
    /// before the offset are left unwritten.
    ///
    /// # Errors
    /// [`Error::InvalidShape`] for zero blocks, [`Error::ShapeMismatch`] if
    /// `blocks` is too small, and dispatch errors.
    pub async fn dequantize(
        &self,
        blocks: &DeviceBuffer<B>,
        num_blocks: usize,
        output_offset: usize,
    ) -> Result<DeviceBuffer<B>> {
        let launch = self.plan_dequantize(num_blocks, output_offset)?;
        expect_elems(blocks, &[num_blocks, BLOCK_WORDS])?;
        self.launch(launch, &[blocks], None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{Features, PowerPreference};
    use crate::testing::MockBackend;

    async fn context(features: Features) -> GpuContext<MockBackend> {
        let backend =
            MockBackend::with_adapter_for(PowerPreference::HighPerformance).with_features(features);
        GpuContext::new(backend).await.unwrap()
    }

    #[tokio::test]
    async fn test_subgroup_variant_when_available() {
        let ctx = context(Features::SUBGROUPS).await;
        let plan = ctx.plan_dequantize(4, 0).unwrap();
        assert_eq!(plan.kernel, KernelKey::Dequantize(DequantVariant::SubgroupVec4));
        assert_eq!(plan.grid, Grid::linear(32));
        let plan = ctx.plan_dequantize(4, 2).unwrap();
        assert_eq!(plan.kernel, KernelKey::Dequantize(DequantVariant::Subgroup));
        assert_eq!(plan.grid, Grid::linear(128));
        assert_eq!(plan.output_size, (2 + 128) * 4);
    }

    #[tokio::test]
    async fn test_shared_fallback() {
        let ctx = context(Features::empty()).await;
        let plan = ctx.plan_dequantize(1, 8).unwrap();
        assert_eq!(plan.kernel, KernelKey::Dequantize(DequantVariant::SharedVec4));
        let plan = ctx.plan_dequantize(1, 1).unwrap();
        assert_eq!(plan.kernel, KernelKey::Dequantize(DequantVariant::Shared));
    }
}
