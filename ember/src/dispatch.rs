//! Kernel dispatch.
//!
//! One dispatch resolves the workgroup shape (auto-tuned or descriptor
//! default), fetches or compiles the pipeline, acquires the output buffer,
//! uploads a transient uniform buffer and submits. Bindings are laid out as
//! `inputs.., output, uniform`.

use std::sync::Arc;

use crate::backend::{BufferUsage, ComputeBackend, ComputeDevice};
use crate::buffer_pool::{align_up, Buffer, UNIFORM_ALIGNMENT};
use crate::context::{DeviceBuffer, GpuContext, Session};
use crate::kernels::KernelKey;
use crate::pipeline_cache::PipelineKey;
use crate::{Error, Result};

/// How many workgroups to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grid {
    /// Invocation extent per axis; divided by the workgroup shape.
    Extent([u32; 3]),
    /// Explicit workgroup counts, independent of the workgroup shape.
    Workgroups([u32; 3]),
}

impl Grid {
    /// One-dimensional invocation extent.
    #[must_use]
    pub fn linear(size: u32) -> Self {
        Self::Extent([size, 1, 1])
    }

    /// Workgroup counts for a pipeline compiled with `workgroup`.
    #[must_use]
    pub fn workgroups(self, workgroup: [u32; 3]) -> [u32; 3] {
        match self {
            Self::Extent(extent) => [
                extent[0].div_ceil(workgroup[0]),
                extent[1].div_ceil(workgroup[1]),
                extent[2].div_ceil(workgroup[2]),
            ],
            Self::Workgroups(counts) => counts,
        }
    }
}

/// Fit workgroup counts under `max_per_dimension`.
///
/// With `foldable`, a one-dimensional count above the limit is folded into
/// two dimensions; such kernels index the grid as `x + y * num_workgroups.x`.
/// Any other kernel reads only its own axes, so an oversized count is an
/// error rather than a silently truncated launch.
///
/// # Errors
/// [`Error::Configuration`] if the grid exceeds the limit after folding.
pub fn fold_workgroups(
    counts: [u32; 3],
    max_per_dimension: u32,
    foldable: bool,
) -> Result<[u32; 3]> {
    let mut counts = counts;
    if foldable && counts[0] > max_per_dimension && counts[1] == 1 && counts[2] == 1 {
        let rows = counts[0].div_ceil(max_per_dimension);
        counts = [counts[0].div_ceil(rows), rows, 1];
    }
    if counts.iter().any(|&c| c > max_per_dimension) {
        return Err(Error::Configuration(format!(
            "dispatch of {counts:?} workgroups exceeds {max_per_dimension} per dimension"
        )));
    }
    Ok(counts)
}

/// One kernel launch.
pub struct DispatchRequest<'a, D: ComputeDevice> {
    pub kernel: KernelKey,
    pub inputs: &'a [&'a Buffer<D>],
    /// Packed uniform bytes, see [`crate::uniforms`].
    pub uniforms: Vec<u8>,
    pub output_size: u64,
    pub output_label: &'a str,
    pub grid: Grid,
    /// Problem size used to look up auto-tuned workgroups.
    pub work: u64,
    /// Force a workgroup shape instead of the tuned or default one.
    pub workgroup: Option<[u32; 3]>,
}

/// A planned launch: everything but the input buffers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Launch {
    pub kernel: KernelKey,
    pub uniforms: Vec<u8>,
    pub output_size: u64,
    pub output_label: &'static str,
    pub grid: Grid,
    pub work: u64,
}

impl<B: ComputeBackend> GpuContext<B> {
    pub(crate) async fn launch(
        &self,
        launch: Launch,
        inputs: &[&DeviceBuffer<B>],
        workgroup: Option<[u32; 3]>,
    ) -> Result<DeviceBuffer<B>> {
        self.dispatch(DispatchRequest {
            kernel: launch.kernel,
            inputs,
            uniforms: launch.uniforms,
            output_size: launch.output_size,
            output_label: launch.output_label,
            grid: launch.grid,
            work: launch.work,
            workgroup,
        })
        .await
    }

    /// The compiled pipeline for `kernel` at `workgroup`, compiling it on
    /// first use. Concurrent callers share one compile.
    ///
    /// # Errors
    /// [`Error::UnsupportedFeature`] if the device lacks a feature the
    /// kernel requires; [`Error::PipelineCompile`] on shader errors;
    /// [`Error::DeviceLost`] if the device was lost during the compile.
    pub async fn get_or_compile_pipeline(
        &self,
        kernel: KernelKey,
        workgroup: [u32; 3],
    ) -> Result<Arc<<B::Device as ComputeDevice>::Pipeline>> {
        let session = self.session()?;
        self.pipeline(&session, kernel, workgroup).await
    }

    async fn pipeline(
        &self,
        session: &Session<B::Device>,
        kernel: KernelKey,
        workgroup: [u32; 3],
    ) -> Result<Arc<<B::Device as ComputeDevice>::Pipeline>> {
        let descriptor = kernel.descriptor();
        let missing = session.capabilities.missing(descriptor.required_features);
        if !missing.is_empty() {
            return Err(Error::UnsupportedFeature {
                kernel: descriptor.label(),
                missing,
            });
        }
        if !session.capabilities.limits.fits_workgroup(workgroup) {
            return Err(Error::Configuration(format!(
                "workgroup {workgroup:?} for {kernel} exceeds device limits"
            )));
        }
        let device = Arc::clone(&session.device);
        let pipeline = session
            .pipelines
            .get_or_compile(PipelineKey::new(kernel, workgroup), || async move {
                let source = descriptor.render(workgroup);
                device.compile_pipeline(descriptor, workgroup, &source).await
            })
            .await?;
        self.ensure_current(session)?;
        Ok(pipeline)
    }

    fn resolve_workgroup(&self, session: &Session<B::Device>, kernel: KernelKey, work: u64) -> [u32; 3] {
        let descriptor = kernel.descriptor();
        if !descriptor.tunable {
            return descriptor.workgroup;
        }
        self.tuning()
            .lookup(kernel, work)
            .filter(|wg| session.capabilities.limits.fits_workgroup(*wg))
            .unwrap_or(descriptor.workgroup)
    }

    /// Launch a kernel and return its freshly acquired output buffer.
    ///
    /// The caller owns the output and releases it with
    /// [`release_buffer`](Self::release_buffer).
    ///
    /// # Errors
    /// [`Error::InvalidShape`] for a wrong input count; the errors of
    /// [`get_or_compile_pipeline`](Self::get_or_compile_pipeline);
    /// allocation and backend errors.
    pub async fn dispatch(&self, request: DispatchRequest<'_, B::Device>) -> Result<DeviceBuffer<B>> {
        let kernel = request.kernel;
        if request.inputs.len() != kernel.input_count() {
            return Err(Error::InvalidShape(format!(
                "{kernel} takes {} inputs, got {}",
                kernel.input_count(),
                request.inputs.len()
            )));
        }

        let session = self.session()?;
        let workgroup = request
            .workgroup
            .unwrap_or_else(|| self.resolve_workgroup(&session, kernel, request.work));
        let pipeline = self.pipeline(&session, kernel, workgroup).await?;
        let counts = fold_workgroups(
            request.grid.workgroups(workgroup),
            session.capabilities.limits.max_compute_workgroups_per_dimension,
            kernel.descriptor().foldable,
        )?;

        let output = session
            .pool
            .acquire_storage(request.output_size, request.output_label)?;
        let device = &session.device;
        let uniform = match device.create_buffer(
            align_up(request.uniforms.len() as u64, UNIFORM_ALIGNMENT),
            BufferUsage::Uniform,
            "uniforms",
        ) {
            Ok(uniform) => uniform,
            Err(e) => {
                session.pool.release(output);
                return Err(e);
            }
        };

        let submitted = device
            .write_buffer(&uniform, 0, &request.uniforms)
            .and_then(|()| {
                let mut bindings: Vec<&<B::Device as ComputeDevice>::Buffer> =
                    request.inputs.iter().map(|b| b.raw()).collect();
                bindings.push(output.raw());
                bindings.push(&uniform);
                device.dispatch(&pipeline, &bindings, counts)
            });
        device.destroy_buffer(&uniform);

        if let Err(e) = submitted {
            session.pool.release(output);
            return Err(e);
        }
        Ok(output)
    }
}
