//! Workgroup-size auto-tuning.
//!
//! Each target is timed at every configured candidate size and the fastest
//! shape is recorded in the context's [`TuningTable`](crate::tuning::TuningTable),
//! where later dispatches of the same kernel and size class pick it up.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::backend::{ComputeBackend, ComputeDevice};
use crate::context::{DeviceBuffer, GpuContext};
use crate::dispatch::Launch;
use crate::ops::MatmulOptions;
use crate::tuning::{shape_like, size_class, TuneResult};
use crate::Result;

/// A kernel and problem size to tune.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TuneTarget {
    Matmul { m: usize, n: usize, k: usize },
    RmsNorm { batch: usize, hidden: usize },
    Softmax { batch: usize, size: usize },
    Silu { size: usize },
    ResidualAdd { size: usize },
}

impl<B: ComputeBackend> GpuContext<B> {
    fn plan_target(&self, target: TuneTarget) -> Result<(Launch, Vec<usize>)> {
        Ok(match target {
            TuneTarget::Matmul { m, n, k } => (
                self.plan_matmul(m, n, k, MatmulOptions::default())?,
                vec![m * k, k * n],
            ),
            TuneTarget::RmsNorm { batch, hidden } => (
                self.plan_rms_norm(batch, hidden, 1e-6)?,
                vec![batch * hidden, hidden],
            ),
            TuneTarget::Softmax { batch, size } => {
                (self.plan_softmax(batch, size, 1.0)?, vec![batch * size])
            }
            TuneTarget::Silu { size } => (self.plan_silu(size, false)?, vec![size]),
            TuneTarget::ResidualAdd { size } => {
                (self.plan_residual_add(size)?, vec![size, size])
            }
        })
    }

    /// Time every configured candidate workgroup size for each target and
    /// record the winners. Returns an empty list when auto-tuning is
    /// disabled in the config.
    ///
    /// # Errors
    /// Shape errors for a bad target; allocation, compile and backend errors.
    pub async fn autotune_kernels(&self, targets: &[TuneTarget]) -> Result<Vec<TuneResult>> {
        let settings = &self.config().autotune;
        if !settings.enabled {
            tracing::debug!("autotune disabled, skipping {} targets", targets.len());
            return Ok(Vec::new());
        }

        let mut results = Vec::with_capacity(targets.len());
        for &target in targets {
            let (launch, input_sizes) = self.plan_target(target)?;
            let mut inputs = Vec::with_capacity(input_sizes.len());
            for len in input_sizes {
                inputs.push(self.upload_f32(&vec![0.0; len], "autotune-input")?);
            }
            let timed = self.time_candidates(&launch, &inputs).await;
            for input in inputs {
                self.release_buffer(input);
            }
            if let Some((workgroup, elapsed)) = timed? {
                self.tuning().record(launch.kernel, launch.work, workgroup);
                tracing::debug!(
                    kernel = %launch.kernel,
                    work = launch.work,
                    ?workgroup,
                    ?elapsed,
                    "tuned workgroup"
                );
                results.push(TuneResult {
                    kernel: launch.kernel.to_string(),
                    size_class: size_class(launch.work),
                    workgroup,
                    elapsed,
                });
            }
        }
        Ok(results)
    }

    /// Fastest `(workgroup, mean time per launch)`, or `None` when no
    /// candidate fits the device limits.
    async fn time_candidates(
        &self,
        launch: &Launch,
        inputs: &[DeviceBuffer<B>],
    ) -> Result<Option<([u32; 3], Duration)>> {
        let settings = &self.config().autotune;
        let session = self.session()?;
        let limits = session.capabilities.limits;
        let device = &session.device;
        let refs: Vec<&DeviceBuffer<B>> = inputs.iter().collect();
        let default = launch.kernel.descriptor().workgroup;

        let mut best: Option<([u32; 3], Duration)> = None;
        for &candidate in &settings.candidates {
            let workgroup = shape_like(default, candidate);
            if !limits.fits_workgroup(workgroup) {
                tracing::debug!(kernel = %launch.kernel, ?workgroup, "candidate exceeds limits");
                continue;
            }

            // First launch compiles the pipeline.
            let warmup = self.launch(launch.clone(), &refs, Some(workgroup)).await?;
            self.release_buffer(warmup);
            device.wait_idle().await?;

            let start = Instant::now();
            for _ in 0..settings.iterations {
                let output = self.launch(launch.clone(), &refs, Some(workgroup)).await?;
                self.release_buffer(output);
            }
            device.wait_idle().await?;
            let elapsed = start.elapsed() / settings.iterations;

            match best {
                Some((_, fastest)) if fastest <= elapsed => {}
                _ => best = Some((workgroup, elapsed)),
            }
        }
        Ok(best)
    }
}
