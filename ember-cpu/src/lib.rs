//! Host backend for Ember.
//!
//! Implements the device traits in host memory and runs every registered
//! kernel on the CPU, reading the same packed uniforms the WGSL shaders
//! read. Half precision is emulated with the `half` crate, so the
//! `SHADER_F16` and subgroup variants are selectable too.
//!
//! This backend is the CPU fallback device and the reference for tests. It
//! is not optimised for throughput.

#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod buffer;
pub mod ops;

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ember::kernels::{KernelDescriptor, KernelKey};
use ember::{
    AdapterInfo, BufferUsage, ComputeAdapter, ComputeBackend, ComputeDevice, DeviceLimits,
    DeviceRequest, Error, Features, LostCallback, PowerPreference, Result,
};
use parking_lot::Mutex;

pub use buffer::HostBuffer;

/// Features the host device can emulate.
pub const HOST_FEATURES: Features = Features::SHADER_F16
    .union(Features::SUBGROUPS)
    .union(Features::SUBGROUPS_F16);

/// Entry point handing out the single host adapter.
#[derive(Debug, Clone)]
pub struct HostBackend {
    features: Features,
    limits: DeviceLimits,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            features: HOST_FEATURES,
            limits: DeviceLimits::default(),
        }
    }

    /// Offer only `features`, e.g. to exercise the full-precision paths.
    #[must_use]
    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features & HOST_FEATURES;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[async_trait]
impl ComputeBackend for HostBackend {
    type Adapter = HostAdapter;
    type Device = HostDevice;

    async fn request_adapter(&self, _preference: PowerPreference) -> Option<HostAdapter> {
        Some(HostAdapter {
            features: self.features,
            limits: self.limits,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HostAdapter {
    features: Features,
    limits: DeviceLimits,
}

#[async_trait]
impl ComputeAdapter for HostAdapter {
    type Device = HostDevice;

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: "ember host device".into(),
            backend: "host".into(),
            device_type: "cpu".into(),
            driver: env!("CARGO_PKG_VERSION").into(),
        }
    }

    fn features(&self) -> Features {
        self.features
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    async fn request_device(&self, request: &DeviceRequest) -> Result<HostDevice> {
        let unsupported = request.features - self.features;
        if !unsupported.is_empty() {
            return Err(Error::Backend(format!(
                "host adapter cannot grant {unsupported:?}"
            )));
        }
        Ok(HostDevice::new(
            request.features,
            request.limits.unwrap_or(self.limits),
        ))
    }
}

/// A compiled host "pipeline": the kernel to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPipeline {
    pub kernel: KernelKey,
    pub workgroup: [u32; 3],
}

pub struct HostDevice {
    features: Features,
    limits: DeviceLimits,
    lost_reason: Mutex<Option<String>>,
    lost_callback: Mutex<Option<LostCallback>>,
    live_buffers: AtomicUsize,
    compiles: AtomicUsize,
    dispatches: AtomicUsize,
}

impl HostDevice {
    fn new(features: Features, limits: DeviceLimits) -> Self {
        Self {
            features,
            limits,
            lost_reason: Mutex::new(None),
            lost_callback: Mutex::new(None),
            live_buffers: AtomicUsize::new(0),
            compiles: AtomicUsize::new(0),
            dispatches: AtomicUsize::new(0),
        }
    }

    /// Mark the device lost and fire the lost callback once. Later calls
    /// are ignored.
    pub fn simulate_loss(&self, reason: &str) {
        {
            let mut lost = self.lost_reason.lock();
            if lost.is_some() {
                return;
            }
            *lost = Some(reason.to_string());
        }
        tracing::info!(reason, "host device lost");
        let callback = self.lost_callback.lock().take();
        if let Some(callback) = callback {
            callback(reason.to_string());
        }
    }

    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost_reason.lock().is_some()
    }

    /// Buffers created and not yet destroyed.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn dispatch_count(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> Result<()> {
        match self.lost_reason.lock().as_ref() {
            Some(reason) => Err(Error::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ComputeDevice for HostDevice {
    type Buffer = HostBuffer;
    type Pipeline = HostPipeline;

    fn features(&self) -> Features {
        self.features
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage, label: &str) -> Result<HostBuffer> {
        self.check_alive()?;
        if size > self.limits.max_buffer_size {
            return Err(Error::Backend(format!(
                "buffer {label} of {size} bytes exceeds the device maximum"
            )));
        }
        let buffer = HostBuffer::new(size, usage, label)?;
        self.live_buffers.fetch_add(1, Ordering::SeqCst);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: &HostBuffer) {
        if !buffer.is_destroyed() {
            buffer.destroy();
            self.live_buffers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn write_buffer(&self, buffer: &HostBuffer, offset: u64, data: &[u8]) -> Result<()> {
        self.check_alive()?;
        buffer.write(offset, data)
    }

    async fn compile_pipeline(
        &self,
        descriptor: &KernelDescriptor,
        workgroup: [u32; 3],
        source: &str,
    ) -> Result<HostPipeline> {
        self.check_alive()?;
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let missing = descriptor.required_features - self.features;
        if !missing.is_empty() {
            return Err(Error::PipelineCompile {
                kernel: descriptor.label(),
                message: format!("shader needs {missing:?}, not enabled on this device"),
            });
        }
        if source.contains("{{") {
            return Err(Error::PipelineCompile {
                kernel: descriptor.label(),
                message: "unresolved workgroup placeholder".into(),
            });
        }
        tracing::debug!(kernel = %descriptor.key, ?workgroup, "host pipeline ready");
        Ok(HostPipeline {
            kernel: descriptor.key,
            workgroup,
        })
    }

    fn dispatch(
        &self,
        pipeline: &HostPipeline,
        bindings: &[&HostBuffer],
        _workgroups: [u32; 3],
    ) -> Result<()> {
        self.check_alive()?;
        let inputs = pipeline.kernel.input_count();
        let [input_buffers @ .., output, uniform] = bindings else {
            return Err(Error::Backend(format!(
                "{} needs output and uniform bindings",
                pipeline.kernel
            )));
        };
        if input_buffers.len() != inputs {
            return Err(Error::Backend(format!(
                "{} takes {inputs} inputs, bound {}",
                pipeline.kernel,
                input_buffers.len()
            )));
        }
        let input_words = input_buffers
            .iter()
            .map(|b| b.words())
            .collect::<Result<Vec<_>>>()?;
        let uniform_bytes = uniform.read(uniform.size())?;
        let mut out = output.lock()?;
        ops::execute(pipeline.kernel, &input_words, &mut out, &uniform_bytes)?;
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn copy_buffer(&self, src: &HostBuffer, dst: &HostBuffer, size: u64) -> Result<()> {
        self.check_alive()?;
        let bytes = src.read(size)?;
        dst.write(0, &bytes)
    }

    async fn map_read(&self, buffer: &HostBuffer, size: u64) -> Result<Vec<u8>> {
        self.check_alive()?;
        buffer.read(size)
    }

    async fn wait_idle(&self) -> Result<()> {
        self.check_alive()
    }

    fn set_lost_callback(&self, callback: LostCallback) {
        *self.lost_callback.lock() = Some(callback);
    }
}
