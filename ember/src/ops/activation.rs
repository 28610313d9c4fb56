//! SiLU and gated SiLU

use crate::backend::ComputeBackend;
use crate::context::{DeviceBuffer, GpuContext};
use crate::dispatch::{Grid, Launch};
use crate::kernels::{Operation, SelectionHints};
use crate::ops::{bytes, dim, expect_elems};
use crate::uniforms::{ElementwiseUniforms, Uniforms};
use crate::Result;

impl<B: ComputeBackend> GpuContext<B> {
    pub(crate) fn plan_silu(&self, size: usize, gated: bool) -> Result<Launch> {
        let size32 = dim(size, "size")?;
        let hints = SelectionHints {
            gated,
            ..SelectionHints::default()
        };
        Ok(Launch {
            kernel: self.select_variant(Operation::Silu, &hints)?,
            uniforms: ElementwiseUniforms { size: size32 }.to_bytes(),
            output_size: bytes(size),
            output_label: "silu",
            grid: Grid::linear(size32),
            work: size as u64,
        })
    }

    /// `y = x * sigmoid(x)`, or `y = silu(gate) * x` when `gate` is given
    /// (the SwiGLU feed-forward form).
    ///
    /// # Errors
    /// Shape and dispatch errors.
    pub async fn run_silu(
        &self,
        x: &DeviceBuffer<B>,
        gate: Option<&DeviceBuffer<B>>,
        size: usize,
    ) -> Result<DeviceBuffer<B>> {
        let launch = self.plan_silu(size, gate.is_some())?;
        expect_elems(x, &[size])?;
        match gate {
            Some(gate) => {
                expect_elems(gate, &[size])?;
                self.launch(launch, &[x, gate], None).await
            }
            None => self.launch(launch, &[x], None).await,
        }
    }
}
