//! Device seam.
//!
//! [`GpuContext`](crate::GpuContext) is generic over a [`ComputeBackend`].
//! A backend hands out adapters, an adapter creates a device, and the
//! device owns raw buffers, compiled pipelines and the command queue.
//! Everything above this seam (pooling, caching, variant selection,
//! uniform packing) is backend-agnostic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capabilities::{AdapterInfo, DeviceLimits, DeviceRequest, Features, PowerPreference};
use crate::kernels::KernelDescriptor;
use crate::Result;

/// How a buffer is used; buffers of different usage never share a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BufferUsage {
    /// Read/write shader storage, also a copy source and destination.
    Storage,
    /// Uniform parameters.
    Uniform,
    /// Copy destination mappable for CPU reads.
    StagingRead,
    /// CPU-writable copy source.
    StagingWrite,
}

impl BufferUsage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Uniform => "uniform",
            Self::StagingRead => "staging-read",
            Self::StagingWrite => "staging-write",
        }
    }
}

/// Called at most once, with a human-readable reason, when a device is lost.
pub type LostCallback = Box<dyn Fn(String) + Send + Sync + 'static>;

/// Entry point of a compute API (an "instance").
#[async_trait]
pub trait ComputeBackend: Send + Sync + 'static {
    type Adapter: ComputeAdapter<Device = Self::Device>;
    type Device: ComputeDevice;

    /// Look for an adapter matching `preference`.
    async fn request_adapter(&self, preference: PowerPreference) -> Option<Self::Adapter>;
}

/// A physical or software adapter that can create devices.
#[async_trait]
pub trait ComputeAdapter: Send + Sync {
    type Device: ComputeDevice;

    fn info(&self) -> AdapterInfo;

    /// Optional features the adapter could grant.
    fn features(&self) -> Features;

    /// The adapter's maximal limits.
    fn limits(&self) -> DeviceLimits;

    async fn request_device(&self, request: &DeviceRequest) -> Result<Self::Device>;
}

/// A logical device with its command queue.
///
/// Commands are executed in submission order; `dispatch` and `copy_buffer`
/// are fire-and-forget, while `map_read` and `wait_idle` resolve once all
/// previously submitted work is complete.
#[async_trait]
pub trait ComputeDevice: Send + Sync + 'static {
    /// Cheap, clonable handle to device memory.
    type Buffer: Clone + Send + Sync + 'static;
    type Pipeline: Send + Sync + 'static;

    /// Features actually granted to this device.
    fn features(&self) -> Features;

    /// Limits actually granted to this device.
    fn limits(&self) -> DeviceLimits;

    fn create_buffer(&self, size: u64, usage: BufferUsage, label: &str) -> Result<Self::Buffer>;

    fn destroy_buffer(&self, buffer: &Self::Buffer);

    /// Queue a host-to-device write at `offset`.
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Compile `source` (already specialized for `workgroup`) into a
    /// pipeline. Shader errors surface as [`Error::PipelineCompile`](crate::Error).
    async fn compile_pipeline(
        &self,
        descriptor: &KernelDescriptor,
        workgroup: [u32; 3],
        source: &str,
    ) -> Result<Self::Pipeline>;

    /// Bind `bindings` at indices `0..n` and dispatch `workgroups`.
    fn dispatch(
        &self,
        pipeline: &Self::Pipeline,
        bindings: &[&Self::Buffer],
        workgroups: [u32; 3],
    ) -> Result<()>;

    fn copy_buffer(&self, src: &Self::Buffer, dst: &Self::Buffer, size: u64) -> Result<()>;

    /// Map the first `size` bytes of a staging-read buffer and copy them out.
    async fn map_read(&self, buffer: &Self::Buffer, size: u64) -> Result<Vec<u8>>;

    /// Resolve once every submitted command has finished.
    async fn wait_idle(&self) -> Result<()>;

    fn set_lost_callback(&self, callback: LostCallback);
}
