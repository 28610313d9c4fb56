use crate::backend::ComputeBackend;
use crate::context::{DeviceBuffer, GpuContext};
use crate::dispatch::{Grid, Launch};
use crate::kernels::KernelKey;
use crate::ops::{bytes, dim, expect_elems};
use crate::uniforms::{ElementwiseUniforms, Uniforms};
use crate::Result;

impl<B: ComputeBackend> GpuContext<B> {
    pub(crate) fn plan_residual_add(&self, size: usize) -> Result<Launch> {
        let size32 = dim(size, "size")?;
        Ok(Launch {
            kernel: KernelKey::ResidualAdd,
            uniforms: ElementwiseUniforms { size: size32 }.to_bytes(),
            output_size: bytes(size),
            output_label: "residual",
            grid: Grid::linear(size32),
            work: size as u64,
        })
    }

    /// Element-wise `a + b` into a new buffer.
    ///
    /// # Errors
    /// Shape and dispatch errors.
    pub async fn run_residual_add(
        &self,
        a: &DeviceBuffer<B>,
        b: &DeviceBuffer<B>,
        size: usize,
    ) -> Result<DeviceBuffer<B>> {
        let launch = self.plan_residual_add(size)?;
        expect_elems(a, &[size])?;
        expect_elems(b, &[size])?;
        self.launch(launch, &[a, b], None).await
    }
}
