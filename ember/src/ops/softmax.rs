//! Row-wise softmax with temperature

use crate::backend::ComputeBackend;
use crate::context::{DeviceBuffer, GpuContext};
use crate::dispatch::{Grid, Launch};
use crate::kernels::{KernelKey, Operation, SelectionHints, SoftmaxVariant};
use crate::ops::{bytes, dim, expect_elems};
use crate::uniforms::{SoftmaxUniforms, Uniforms};
use crate::{Error, Result};

impl<B: ComputeBackend> GpuContext<B> {
    pub(crate) fn plan_softmax(&self, batch: usize, size: usize, temperature: f32) -> Result<Launch> {
        if temperature.is_nan() || temperature <= 0.0 {
            return Err(Error::InvalidShape(format!(
                "temperature must be positive, got {temperature}"
            )));
        }
        let batch32 = dim(batch, "batch")?;
        let hints = SelectionHints {
            row_size: size,
            ..SelectionHints::default()
        };
        let kernel = self.select_variant(Operation::Softmax, &hints)?;
        let grid = match kernel {
            // One invocation per row.
            KernelKey::Softmax(SoftmaxVariant::Small) => Grid::linear(batch32),
            _ => Grid::Workgroups([batch32, 1, 1]),
        };
        Ok(Launch {
            kernel,
            uniforms: SoftmaxUniforms {
                batch_size: batch32,
                size: dim(size, "size")?,
                temperature,
            }
            .to_bytes(),
            output_size: bytes(batch * size),
            output_label: "softmax",
            grid,
            work: size as u64,
        })
    }

    /// `softmax(x / temperature)` over each row of `x` (`[batch, size]`).
    ///
    /// Short rows run one invocation per row; long rows a workgroup per row,
    /// streaming max and sum in a single pass above 4096 elements.
    ///
    /// # Errors
    /// Shape errors, a non-positive temperature, and dispatch errors.
    pub async fn run_softmax(
        &self,
        x: &DeviceBuffer<B>,
        batch: usize,
        size: usize,
        temperature: f32,
    ) -> Result<DeviceBuffer<B>> {
        let launch = self.plan_softmax(batch, size, temperature)?;
        expect_elems(x, &[batch, size])?;
        self.launch(launch, &[x], None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::PowerPreference;
    use crate::testing::MockBackend;

    #[tokio::test]
    async fn test_grid_per_variant() {
        let ctx = GpuContext::new(MockBackend::with_adapter_for(PowerPreference::HighPerformance))
            .await
            .unwrap();
        let small = ctx.plan_softmax(100, 32, 1.0).unwrap();
        assert_eq!(small.kernel, KernelKey::Softmax(SoftmaxVariant::Small));
        assert_eq!(small.grid.workgroups([64, 1, 1]), [2, 1, 1]);

        let online = ctx.plan_softmax(3, 10_000, 1.0).unwrap();
        assert_eq!(online.kernel, KernelKey::Softmax(SoftmaxVariant::Online));
        assert_eq!(online.grid.workgroups([256, 1, 1]), [3, 1, 1]);

        assert!(matches!(
            ctx.plan_softmax(1, 8, 0.0),
            Err(Error::InvalidShape(_))
        ));
    }
}
