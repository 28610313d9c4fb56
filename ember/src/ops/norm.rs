//! RMS normalization: `y = x / sqrt(mean(x^2) + eps) * w`

use crate::backend::ComputeBackend;
use crate::context::{DeviceBuffer, GpuContext};
use crate::dispatch::{Grid, Launch};
use crate::kernels::KernelKey;
use crate::ops::{bytes, dim, expect_elems};
use crate::uniforms::{RmsNormUniforms, Uniforms};
use crate::{Error, Result};

impl<B: ComputeBackend> GpuContext<B> {
    pub(crate) fn plan_rms_norm(&self, batch: usize, hidden: usize, eps: f32) -> Result<Launch> {
        if eps.is_nan() || eps <= 0.0 {
            return Err(Error::InvalidShape(format!("eps must be positive, got {eps}")));
        }
        Ok(Launch {
            kernel: KernelKey::RmsNorm,
            uniforms: RmsNormUniforms {
                batch_size: dim(batch, "batch")?,
                hidden_size: dim(hidden, "hidden")?,
                eps,
            }
            .to_bytes(),
            output_size: bytes(batch * hidden),
            output_label: "rms_norm",
            // One workgroup per row.
            grid: Grid::Workgroups([dim(batch, "batch")?, 1, 1]),
            work: hidden as u64,
        })
    }

    /// Normalize each of the `batch` rows of `x` (`[batch, hidden]`) and
    /// scale by `weight` (`[hidden]`).
    ///
    /// # Errors
    /// Shape errors and dispatch errors.
    pub async fn run_rms_norm(
        &self,
        x: &DeviceBuffer<B>,
        weight: &DeviceBuffer<B>,
        batch: usize,
        hidden: usize,
        eps: f32,
    ) -> Result<DeviceBuffer<B>> {
        let launch = self.plan_rms_norm(batch, hidden, eps)?;
        expect_elems(x, &[batch, hidden])?;
        expect_elems(weight, &[hidden])?;
        self.launch(launch, &[x, weight], None).await
    }
}
