//! Ember: a GPU compute runtime for transformer inference
//!
//! The core is backend-agnostic. A device implementation plugs in through the
//! [`ComputeBackend`], [`ComputeAdapter`] and [`ComputeDevice`] traits; the
//! `ember-wgpu` crate provides the GPU one and `ember-cpu` a host one.
//!
//! [`GpuContext`] ties the pieces together: it negotiates a device from the
//! adapter's capabilities, owns the [`BufferPool`] and pipeline cache, and
//! exposes the kernel operations (`run_matmul`, `run_attention`, ...).

pub mod attention;
#[allow(clippy::missing_errors_doc)]
pub mod backend;
pub mod buffer_pool;
pub mod capabilities;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod kernels;
pub mod moe;
pub mod ops;
pub mod pipeline_cache;
pub mod quant;
pub mod rope;
pub mod tuning;
pub mod uniforms;

#[cfg(test)]
pub(crate) mod testing;

pub use attention::AttentionShape;
pub use backend::{BufferUsage, ComputeAdapter, ComputeBackend, ComputeDevice, LostCallback};
pub use buffer_pool::{Buffer, BufferId, BufferPool, PoolStats, ScopedBuffer};
pub use capabilities::{
    AdapterInfo, Capabilities, DeviceLimits, DeviceRequest, Features, PowerPreference,
};
pub use config::{AutotuneConfig, PoolConfig, RuntimeConfig};
pub use context::{DeviceBuffer, GpuContext};
pub use dispatch::{DispatchRequest, Grid};
pub use error::{Error, Result};
pub use kernels::{KernelDescriptor, KernelKey, Operation, SelectionHints};
pub use moe::{ExpertSelection, LoadBalanceStats, MoeConfig, MoeRouter};
pub use ops::{AttentionOptions, MatmulOptions, RopeParams, TuneTarget};
pub use rope::RopeScaling;
pub use tuning::TuneResult;
