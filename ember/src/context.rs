//! GPU context: device session, buffer helpers and device-loss handling.
//!
//! A [`GpuContext`] owns everything tied to one negotiated device in a
//! [`Session`]: the device handle, its capability snapshot, its buffer pool
//! and its pipeline cache. The session is swapped as a whole, so when the
//! device is lost the capabilities and the compiled pipelines become
//! unreachable in the same step. Operations that started on a session that
//! is no longer current fail with [`Error::DeviceLost`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use half::f16;
use parking_lot::{Mutex, RwLock};

use crate::backend::{BufferUsage, ComputeBackend, ComputeDevice};
use crate::buffer_pool::{Buffer, BufferPool, PoolStats};
use crate::capabilities::{negotiate_device, probe_adapter, Capabilities};
use crate::config::RuntimeConfig;
use crate::kernels::{select_variant, KernelKey, Operation, SelectionHints};
use crate::pipeline_cache::PipelineCache;
use crate::tuning::TuningTable;
use crate::{Error, Result};

/// A pooled buffer on the device of backend `B`.
pub type DeviceBuffer<B> = Buffer<<B as ComputeBackend>::Device>;

/// Everything that belongs to one negotiated device.
pub(crate) struct Session<D: ComputeDevice> {
    pub(crate) device: Arc<D>,
    pub(crate) pool: BufferPool<D>,
    pub(crate) capabilities: Arc<Capabilities>,
    pub(crate) pipelines: PipelineCache<D::Pipeline>,
    generation: u64,
}

struct LostDevice<D: ComputeDevice> {
    reason: String,
    // Held so the lost device is not dropped from inside its own callback.
    _retired: Arc<Session<D>>,
}

struct SharedState<D: ComputeDevice> {
    session: RwLock<Option<Arc<Session<D>>>>,
    lost: Mutex<Option<LostDevice<D>>>,
    generation: AtomicU64,
}

fn on_device_lost<D: ComputeDevice>(shared: &Weak<SharedState<D>>, generation: u64, reason: String) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut session = shared.session.write();
    if !session.as_ref().is_some_and(|s| s.generation == generation) {
        tracing::debug!(generation, %reason, "loss reported for a retired device");
        return;
    }
    if let Some(retired) = session.take() {
        retired.pipelines.clear();
        tracing::info!(
            generation,
            adapter = %retired.capabilities.adapter.name,
            %reason,
            "GPU device lost, capabilities and pipelines invalidated"
        );
        *shared.lost.lock() = Some(LostDevice {
            reason,
            _retired: retired,
        });
    }
}

/// Owns the device session and exposes the kernel operations.
///
/// Construct with [`GpuContext::create`]; every operation takes `&self`, so
/// a context can be shared between tasks behind an `Arc`.
pub struct GpuContext<B: ComputeBackend> {
    backend: B,
    config: RuntimeConfig,
    shared: Arc<SharedState<B::Device>>,
    tuning: TuningTable,
    recovering: tokio::sync::Mutex<()>,
}

impl<B: ComputeBackend> GpuContext<B> {
    /// Probe for an adapter and negotiate a device.
    ///
    /// # Errors
    /// [`Error::Configuration`] for an invalid `config`;
    /// [`Error::DeviceUnavailable`] if no adapter matches or device creation
    /// fails even with the minimal request.
    pub async fn create(backend: B, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let ctx = Self {
            backend,
            config,
            shared: Arc::new(SharedState {
                session: RwLock::new(None),
                lost: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
            tuning: TuningTable::new(),
            recovering: tokio::sync::Mutex::new(()),
        };
        ctx.negotiate().await?;
        Ok(ctx)
    }

    /// [`create`](Self::create) with the default configuration.
    ///
    /// # Errors
    /// See [`GpuContext::create`].
    pub async fn new(backend: B) -> Result<Self> {
        Self::create(backend, RuntimeConfig::default()).await
    }

    async fn negotiate(&self) -> Result<()> {
        let adapter = probe_adapter(&self.backend, &self.config.power_preferences)
            .await
            .ok_or_else(|| {
                Error::DeviceUnavailable(format!(
                    "no adapter for power preferences {:?}",
                    self.config.power_preferences
                ))
            })?;
        let (device, capabilities) = negotiate_device(&adapter).await?;
        self.install(device, capabilities);
        Ok(())
    }

    fn install(&self, device: B::Device, capabilities: Capabilities) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let device = Arc::new(device);
        let pool = BufferPool::new(
            Arc::clone(&device),
            capabilities.limits,
            self.config.pool.clone(),
        );
        let session = Arc::new(Session {
            device: Arc::clone(&device),
            pool,
            capabilities: Arc::new(capabilities),
            pipelines: PipelineCache::new(),
            generation,
        });
        {
            let mut current = self.shared.session.write();
            *current = Some(session);
            *self.shared.lost.lock() = None;
        }
        let weak = Arc::downgrade(&self.shared);
        device.set_lost_callback(Box::new(move |reason| {
            on_device_lost(&weak, generation, reason);
        }));
    }

    /// Re-negotiate after a device loss. A no-op while a device is live.
    ///
    /// Buffers from the lost device are gone; releasing them afterwards
    /// only logs a warning.
    ///
    /// # Errors
    /// See [`GpuContext::create`].
    pub async fn recover(&self) -> Result<()> {
        let _guard = self.recovering.lock().await;
        if self.shared.session.read().is_some() {
            return Ok(());
        }
        tracing::info!(reason = ?self.lost_reason(), "re-negotiating GPU device");
        self.negotiate().await
    }

    pub(crate) fn session(&self) -> Result<Arc<Session<B::Device>>> {
        if let Some(session) = self.shared.session.read().as_ref() {
            return Ok(Arc::clone(session));
        }
        Err(self.unavailable_error())
    }

    fn unavailable_error(&self) -> Error {
        match self.shared.lost.lock().as_ref() {
            Some(lost) => Error::DeviceLost(lost.reason.clone()),
            None => Error::DeviceNotInitialized,
        }
    }

    /// Fail with [`Error::DeviceLost`] if `session` has been replaced.
    pub(crate) fn ensure_current(&self, session: &Session<B::Device>) -> Result<()> {
        let current = self
            .shared
            .session
            .read()
            .as_ref()
            .is_some_and(|s| s.generation == session.generation);
        if current {
            return Ok(());
        }
        Err(Error::DeviceLost(
            self.lost_reason()
                .unwrap_or_else(|| "device replaced during operation".into()),
        ))
    }

    /// The capability snapshot of the current device.
    ///
    /// # Errors
    /// [`Error::DeviceNotInitialized`] after a device loss, until
    /// [`recover`](Self::recover) succeeds.
    pub fn capabilities(&self) -> Result<Arc<Capabilities>> {
        self.shared
            .session
            .read()
            .as_ref()
            .map(|s| Arc::clone(&s.capabilities))
            .ok_or(Error::DeviceNotInitialized)
    }

    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.shared.lost.lock().is_some()
    }

    /// Reason given by the driver for the last device loss.
    #[must_use]
    pub fn lost_reason(&self) -> Option<String> {
        self.shared.lost.lock().as_ref().map(|l| l.reason.clone())
    }

    /// # Errors
    /// [`Error::DeviceLost`] or [`Error::DeviceNotInitialized`] without a device.
    pub fn device(&self) -> Result<Arc<B::Device>> {
        self.session().map(|s| Arc::clone(&s.device))
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Auto-tuning results consulted by dispatch.
    #[must_use]
    pub fn tuning(&self) -> &TuningTable {
        &self.tuning
    }

    /// # Errors
    /// [`Error::DeviceLost`] or [`Error::DeviceNotInitialized`] without a device.
    pub fn pool_stats(&self) -> Result<PoolStats> {
        self.session().map(|s| s.pool.stats())
    }

    /// Compiled pipelines cached for the current device.
    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.session().map_or(0, |s| s.pipelines.len())
    }

    /// Pipeline compiles started on the current device.
    #[must_use]
    pub fn compile_count(&self) -> u64 {
        self.session().map_or(0, |s| s.pipelines.compile_count())
    }

    /// Pick the kernel variant for `operation` on the current device.
    ///
    /// # Errors
    /// [`Error::DeviceLost`] or [`Error::DeviceNotInitialized`] without a device.
    pub fn select_variant(&self, operation: Operation, hints: &SelectionHints) -> Result<KernelKey> {
        let session = self.session()?;
        Ok(select_variant(operation, &session.capabilities, hints))
    }

    /// # Errors
    /// See [`BufferPool::acquire`].
    pub fn acquire_buffer(&self, size: u64, usage: BufferUsage, label: &str) -> Result<DeviceBuffer<B>> {
        self.session()?.pool.acquire(size, usage, label)
    }

    /// Return a buffer to the pool of the current device.
    pub fn release_buffer(&self, buffer: DeviceBuffer<B>) {
        match self.shared.session.read().as_ref() {
            Some(session) => session.pool.release(buffer),
            None => tracing::warn!(
                label = buffer.label(),
                "buffer released without a live device, dropped"
            ),
        }
    }

    /// Destroy every free pooled buffer.
    pub fn clear_pool(&self) {
        if let Some(session) = self.shared.session.read().as_ref() {
            session.pool.clear_pool();
        }
    }

    /// Copy `data` into a new storage buffer.
    ///
    /// # Errors
    /// Allocation errors or a failed write.
    pub fn upload_data(&self, data: &[u8], label: &str) -> Result<DeviceBuffer<B>> {
        let session = self.session()?;
        let buffer = session.pool.acquire_storage(data.len() as u64, label)?;
        if let Err(e) = session.device.write_buffer(buffer.raw(), 0, data) {
            session.pool.release(buffer);
            return Err(e);
        }
        Ok(buffer)
    }

    /// # Errors
    /// See [`GpuContext::upload_data`].
    pub fn upload_f32(&self, data: &[f32], label: &str) -> Result<DeviceBuffer<B>> {
        self.upload_data(bytemuck::cast_slice(data), label)
    }

    /// # Errors
    /// See [`GpuContext::upload_data`].
    pub fn upload_u32(&self, data: &[u32], label: &str) -> Result<DeviceBuffer<B>> {
        self.upload_data(bytemuck::cast_slice(data), label)
    }

    /// # Errors
    /// See [`GpuContext::upload_data`].
    pub fn upload_f16(&self, data: &[f16], label: &str) -> Result<DeviceBuffer<B>> {
        self.upload_data(bytemuck::cast_slice(data), label)
    }

    /// Read the first `size` bytes of `buffer` back to the host.
    ///
    /// Copies into a pooled staging buffer, awaits the map, and releases the
    /// staging buffer once the bytes are out.
    ///
    /// # Errors
    /// [`Error::InvalidShape`] if `size` exceeds the buffer; backend errors;
    /// [`Error::DeviceLost`] if the device was lost while waiting.
    pub async fn read_buffer(&self, buffer: &DeviceBuffer<B>, size: u64) -> Result<Vec<u8>> {
        let session = self.session()?;
        if size > buffer.size() {
            return Err(Error::InvalidShape(format!(
                "read of {size} bytes from a {}-byte buffer",
                buffer.size()
            )));
        }
        let staging = session
            .pool
            .scoped(size, BufferUsage::StagingRead, "staging-read")?;
        session.device.copy_buffer(buffer.raw(), staging.raw(), size)?;
        let bytes = session.device.map_read(staging.raw(), size).await?;
        self.ensure_current(&session)?;
        Ok(bytes)
    }

    /// # Errors
    /// See [`GpuContext::read_buffer`].
    pub async fn read_f32(&self, buffer: &DeviceBuffer<B>, len: usize) -> Result<Vec<f32>> {
        let bytes = self.read_buffer(buffer, (len * 4) as u64).await?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// # Errors
    /// See [`GpuContext::read_buffer`].
    pub async fn read_u32(&self, buffer: &DeviceBuffer<B>, len: usize) -> Result<Vec<u32>> {
        let bytes = self.read_buffer(buffer, (len * 4) as u64).await?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// # Errors
    /// See [`GpuContext::read_buffer`].
    pub async fn read_f16(&self, buffer: &DeviceBuffer<B>, len: usize) -> Result<Vec<f16>> {
        let bytes = self.read_buffer(buffer, (len * 2) as u64).await?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }
}
