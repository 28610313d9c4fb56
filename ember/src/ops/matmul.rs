//! Matrix multiplication: `C = alpha * A @ B`

#![allow(clippy::cast_possible_truncation)]

use crate::backend::ComputeBackend;
use crate::context::{DeviceBuffer, GpuContext};
use crate::dispatch::{Grid, Launch};
use crate::kernels::{KernelKey, MatmulVariant, Operation, SelectionHints};
use crate::ops::{bytes, dim, expect_elems};
use crate::uniforms::{MatmulUniforms, Uniforms};
use crate::Result;

/// Per-call matmul settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatmulOptions {
    pub alpha: f32,
    /// Override [`RuntimeConfig::prefer_f16`](crate::RuntimeConfig) for this
    /// call. Routing passes `Some(false)` to keep full precision.
    pub prefer_f16: Option<bool>,
}

impl Default for MatmulOptions {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            prefer_f16: None,
        }
    }
}

impl<B: ComputeBackend> GpuContext<B> {
    pub(crate) fn plan_matmul(
        &self,
        m: usize,
        n: usize,
        k: usize,
        options: MatmulOptions,
    ) -> Result<Launch> {
        let (m32, n32, k32) = (dim(m, "m")?, dim(n, "n")?, dim(k, "k")?);
        let hints = SelectionHints {
            prefer_f16: options.prefer_f16.unwrap_or(self.config().prefer_f16),
            vectorize: n % 4 == 0,
            ..SelectionHints::default()
        };
        let kernel = self.select_variant(Operation::Matmul, &hints)?;
        let columns = if kernel == KernelKey::Matmul(MatmulVariant::F16Vec4) {
            n32 / 4
        } else {
            n32
        };
        Ok(Launch {
            kernel,
            uniforms: MatmulUniforms {
                m: m32,
                n: n32,
                k: k32,
                alpha: options.alpha,
            }
            .to_bytes(),
            output_size: bytes(m * n),
            output_label: "matmul",
            grid: Grid::Extent([columns, m32, 1]),
            work: (m * n) as u64,
        })
    }

    /// Multiply `a` (`[m, k]`) by `b` (`[k, n]`) into a new `[m, n]` buffer.
    ///
    /// Uses the half-precision kernel when the device has `SHADER_F16` and
    /// half precision is preferred; products are then rounded to `f16` and
    /// accumulated in `f32`.
    ///
    /// # Errors
    /// [`Error::InvalidShape`](crate::Error) for zero dimensions,
    /// [`Error::ShapeMismatch`](crate::Error) for undersized inputs, and
    /// dispatch errors.
    pub async fn run_matmul(
        &self,
        a: &DeviceBuffer<B>,
        b: &DeviceBuffer<B>,
        m: usize,
        n: usize,
        k: usize,
        options: MatmulOptions,
    ) -> Result<DeviceBuffer<B>> {
        let launch = self.plan_matmul(m, n, k, options)?;
        expect_elems(a, &[m, k])?;
        expect_elems(b, &[k, n])?;
        self.launch(launch, &[a, b], None).await
    }
}
