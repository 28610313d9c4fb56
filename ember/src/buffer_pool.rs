//! Pooled GPU buffer allocation
//!
//! Eliminates per-op buffer creation by caching released buffers and
//! reusing them for later requests of the same usage and bucket size.
//!
//! Requests are aligned to [`BUFFER_ALIGNMENT`] and rounded up to a
//! power-of-two bucket, so similarly-sized tensors share buffers. Free
//! buffers live in LIFO stacks keyed by `(usage, bucket)`. Two caps bound
//! the memory held: a per-bucket cap and a global pooled-buffer cap. A
//! released buffer that would exceed either is destroyed instead of queued.
//!
//! The pool is interior-mutable and cheap to clone, so it can be shared
//! with [`ScopedBuffer`] guards and across tasks.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::backend::{BufferUsage, ComputeDevice};
use crate::capabilities::DeviceLimits;
use crate::config::PoolConfig;
use crate::{Error, Result};

/// Every request is aligned up to this before bucketing.
pub const BUFFER_ALIGNMENT: u64 = 256;

/// Uniform buffers use the device's minimum uniform offset alignment.
pub const UNIFORM_ALIGNMENT: u64 = 256;

/// Smallest bucket handed out.
pub const MIN_BUCKET_SIZE: u64 = 256;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Round `size` up to a multiple of `alignment`.
#[must_use]
pub fn align_up(size: u64, alignment: u64) -> u64 {
    size.div_ceil(alignment).saturating_mul(alignment)
}

/// Bucket a request falls into: `max(256, next_pow2(align_up(size, 256)))`.
///
/// Saturates at `u64::MAX` for requests no device could satisfy, which the
/// limit checks then reject.
#[must_use]
pub fn bucket_size(size: u64) -> u64 {
    align_up(size, BUFFER_ALIGNMENT)
        .checked_next_power_of_two()
        .unwrap_or(u64::MAX)
        .max(MIN_BUCKET_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

/// A buffer handed out by a [`BufferPool`].
///
/// Ownership of this value is ownership of the allocation: give it back
/// with [`BufferPool::release`] once every submitted command using it has
/// logically completed.
pub struct Buffer<D: ComputeDevice> {
    id: BufferId,
    pool_id: u64,
    size: u64,
    usage: BufferUsage,
    label: String,
    raw: D::Buffer,
}

impl<D: ComputeDevice> Buffer<D> {
    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Bucketed byte size; at least the requested size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The backend handle, for binding.
    #[must_use]
    pub fn raw(&self) -> &D::Buffer {
        &self.raw
    }
}

impl<D: ComputeDevice> fmt::Debug for Buffer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Buffers created on the device.
    pub allocations: u64,
    /// Requests served from a free list.
    pub reuses: u64,
    /// Released buffers destroyed because a cap was reached.
    pub evictions: u64,
    pub active_buffers: usize,
    pub pooled_buffers: usize,
    /// Bytes held by active buffers.
    pub bytes_in_use: u64,
    /// High-water mark of `bytes_in_use`.
    pub peak_bytes: u64,
    /// Bytes held by free buffers.
    pub pooled_bytes: u64,
}

/// A pool of reusable device buffers.
pub struct BufferPool<D: ComputeDevice> {
    shared: Arc<PoolShared<D>>,
}

impl<D: ComputeDevice> Clone for BufferPool<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct PoolShared<D: ComputeDevice> {
    id: u64,
    device: Arc<D>,
    config: PoolConfig,
    limits: DeviceLimits,
    inner: Mutex<PoolInner<D>>,
}

struct PoolInner<D: ComputeDevice> {
    /// Free buffers indexed by (usage, bucket). Each entry is a LIFO stack.
    free: HashMap<(BufferUsage, u64), Vec<D::Buffer>>,
    /// Handles of buffers currently owned by callers.
    active: HashMap<BufferId, ActiveBuffer<D>>,
    pooled_count: usize,
    next_id: u64,
    allocations: u64,
    reuses: u64,
    evictions: u64,
    bytes_in_use: u64,
    peak_bytes: u64,
    pooled_bytes: u64,
}

struct ActiveBuffer<D: ComputeDevice> {
    raw: D::Buffer,
    size: u64,
}

impl<D: ComputeDevice> PoolInner<D> {
    fn activate(&mut self, raw: D::Buffer, size: u64) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.active.insert(
            id,
            ActiveBuffer {
                raw: raw.clone(),
                size,
            },
        );
        self.bytes_in_use += size;
        self.peak_bytes = self.peak_bytes.max(self.bytes_in_use);
        id
    }
}

impl<D: ComputeDevice> Drop for PoolShared<D> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for (_, stack) in inner.free.drain() {
            for raw in stack {
                self.device.destroy_buffer(&raw);
            }
        }
    }
}

impl<D: ComputeDevice> BufferPool<D> {
    /// Create a pool allocating from `device`, enforcing `limits`.
    pub fn new(device: Arc<D>, limits: DeviceLimits, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                device,
                config,
                limits,
                inner: Mutex::new(PoolInner {
                    free: HashMap::new(),
                    active: HashMap::new(),
                    pooled_count: 0,
                    next_id: 0,
                    allocations: 0,
                    reuses: 0,
                    evictions: 0,
                    bytes_in_use: 0,
                    peak_bytes: 0,
                    pooled_bytes: 0,
                }),
            }),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<D> {
        &self.shared.device
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    fn check_limits(&self, requested: u64, bucket: u64, usage: BufferUsage) -> Result<()> {
        let limits = &self.shared.limits;
        let exceeded = |limit: u64, limit_name: &'static str| {
            tracing::warn!(requested, bucket, limit, limit_name, "allocation exceeds device limit");
            Err(Error::AllocationLimitExceeded {
                requested: bucket,
                limit,
                limit_name,
            })
        };
        if bucket > limits.max_buffer_size {
            return exceeded(limits.max_buffer_size, "max_buffer_size");
        }
        match usage {
            BufferUsage::Storage if bucket > limits.max_storage_buffer_binding_size => exceeded(
                limits.max_storage_buffer_binding_size,
                "max_storage_buffer_binding_size",
            ),
            BufferUsage::Uniform if bucket > limits.max_uniform_buffer_binding_size => exceeded(
                limits.max_uniform_buffer_binding_size,
                "max_uniform_buffer_binding_size",
            ),
            _ => Ok(()),
        }
    }

    /// Get a buffer of at least `size` bytes.
    ///
    /// # Errors
    /// [`Error::AllocationLimitExceeded`] if the bucket exceeds a device
    /// limit; backend errors from buffer creation.
    pub fn acquire(&self, size: u64, usage: BufferUsage, label: &str) -> Result<Buffer<D>> {
        let bucket = bucket_size(size);
        self.check_limits(size, bucket, usage)?;

        if self.shared.config.enabled {
            let mut inner = self.shared.inner.lock();
            let reused = inner
                .free
                .get_mut(&(usage, bucket))
                .and_then(Vec::pop);
            if let Some(raw) = reused {
                inner.pooled_count -= 1;
                inner.pooled_bytes -= bucket;
                inner.reuses += 1;
                let id = inner.activate(raw.clone(), bucket);
                return Ok(self.wrap(id, bucket, usage, label, raw));
            }
        }

        let raw = self.shared.device.create_buffer(bucket, usage, label)?;
        let mut inner = self.shared.inner.lock();
        inner.allocations += 1;
        let id = inner.activate(raw.clone(), bucket);
        Ok(self.wrap(id, bucket, usage, label, raw))
    }

    fn wrap(
        &self,
        id: BufferId,
        size: u64,
        usage: BufferUsage,
        label: &str,
        raw: D::Buffer,
    ) -> Buffer<D> {
        Buffer {
            id,
            pool_id: self.shared.id,
            size,
            usage,
            label: label.to_string(),
            raw,
        }
    }

    /// Storage buffer; the common case for kernel inputs and outputs.
    ///
    /// # Errors
    /// See [`BufferPool::acquire`].
    pub fn acquire_storage(&self, size: u64, label: &str) -> Result<Buffer<D>> {
        self.acquire(size, BufferUsage::Storage, label)
    }

    /// # Errors
    /// See [`BufferPool::acquire`].
    pub fn acquire_staging_read(&self, size: u64) -> Result<Buffer<D>> {
        self.acquire(size, BufferUsage::StagingRead, "staging-read")
    }

    /// # Errors
    /// See [`BufferPool::acquire`].
    pub fn acquire_staging_write(&self, size: u64) -> Result<Buffer<D>> {
        self.acquire(size, BufferUsage::StagingWrite, "staging-write")
    }

    /// Uniform buffer aligned to [`UNIFORM_ALIGNMENT`].
    ///
    /// # Errors
    /// See [`BufferPool::acquire`].
    pub fn acquire_uniform(&self, size: u64, label: &str) -> Result<Buffer<D>> {
        self.acquire(align_up(size, UNIFORM_ALIGNMENT), BufferUsage::Uniform, label)
    }

    /// Return a buffer to the pool.
    ///
    /// Buffers that are not active in this pool (released after
    /// [`destroy`](Self::destroy), or acquired from another pool) are
    /// logged and ignored.
    pub fn release(&self, buffer: Buffer<D>) {
        let mut inner = self.shared.inner.lock();
        let entry = if buffer.pool_id == self.shared.id {
            inner.active.remove(&buffer.id)
        } else {
            None
        };
        let Some(entry) = entry else {
            tracing::warn!(
                id = buffer.id.0,
                label = %buffer.label,
                "release of buffer not active in this pool ignored"
            );
            return;
        };
        inner.bytes_in_use -= entry.size;

        let config = &self.shared.config;
        if !config.enabled {
            self.shared.device.destroy_buffer(&entry.raw);
            return;
        }

        let key = (buffer.usage, entry.size);
        let bucket_len = inner.free.get(&key).map_or(0, Vec::len);
        if bucket_len >= config.max_buffers_per_bucket
            || inner.pooled_count >= config.max_pooled_buffers
        {
            inner.evictions += 1;
            tracing::debug!(
                usage = buffer.usage.as_str(),
                bucket = entry.size,
                bucket_len,
                pooled = inner.pooled_count,
                "pool full, destroying released buffer"
            );
            self.shared.device.destroy_buffer(&entry.raw);
            return;
        }

        inner.free.entry(key).or_default().push(entry.raw);
        inner.pooled_count += 1;
        inner.pooled_bytes += entry.size;
    }

    /// Acquire a buffer that is released when the guard drops.
    ///
    /// # Errors
    /// See [`BufferPool::acquire`].
    pub fn scoped(&self, size: u64, usage: BufferUsage, label: &str) -> Result<ScopedBuffer<D>> {
        let buffer = self.acquire(size, usage, label)?;
        Ok(ScopedBuffer {
            pool: self.clone(),
            buffer: Some(buffer),
        })
    }

    /// Run `op` with a temporary buffer, releasing it on every exit path.
    ///
    /// # Errors
    /// Acquisition errors, or whatever `op` returns.
    pub async fn with_buffer<T, F>(
        &self,
        size: u64,
        usage: BufferUsage,
        label: &str,
        op: F,
    ) -> Result<T>
    where
        F: for<'b> FnOnce(&'b Buffer<D>) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'b>>,
    {
        let scoped = self.scoped(size, usage, label)?;
        op(&*scoped).await
    }

    /// Destroy every free buffer. Active buffers are untouched.
    pub fn clear_pool(&self) {
        let mut inner = self.shared.inner.lock();
        let mut destroyed = 0usize;
        for (_, stack) in inner.free.drain() {
            for raw in stack {
                self.shared.device.destroy_buffer(&raw);
                destroyed += 1;
            }
        }
        inner.pooled_count = 0;
        inner.pooled_bytes = 0;
        tracing::debug!(destroyed, "buffer pool cleared");
    }

    /// Destroy every buffer, free and active.
    ///
    /// Outstanding [`Buffer`] values must not be used afterwards; releasing
    /// them only logs a warning.
    pub fn destroy(&self) {
        self.clear_pool();
        let mut inner = self.shared.inner.lock();
        for (_, entry) in inner.active.drain() {
            self.shared.device.destroy_buffer(&entry.raw);
        }
        inner.bytes_in_use = 0;
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock();
        PoolStats {
            allocations: inner.allocations,
            reuses: inner.reuses,
            evictions: inner.evictions,
            active_buffers: inner.active.len(),
            pooled_buffers: inner.pooled_count,
            bytes_in_use: inner.bytes_in_use,
            peak_bytes: inner.peak_bytes,
            pooled_bytes: inner.pooled_bytes,
        }
    }

    /// Whether `buffer` is currently owned by a caller of this pool.
    #[must_use]
    pub fn is_active(&self, buffer: &Buffer<D>) -> bool {
        buffer.pool_id == self.shared.id && self.shared.inner.lock().active.contains_key(&buffer.id)
    }
}

/// A pooled buffer released back to its pool on drop, unwinding included.
pub struct ScopedBuffer<D: ComputeDevice> {
    pool: BufferPool<D>,
    buffer: Option<Buffer<D>>,
}

impl<D: ComputeDevice> ScopedBuffer<D> {
    /// Keep the buffer past the guard's scope; the caller now releases it.
    #[must_use]
    pub fn into_inner(mut self) -> Buffer<D> {
        match self.buffer.take() {
            Some(buffer) => buffer,
            None => unreachable!("ScopedBuffer holds its buffer until drop"),
        }
    }
}

impl<D: ComputeDevice> Deref for ScopedBuffer<D> {
    type Target = Buffer<D>;

    fn deref(&self) -> &Buffer<D> {
        match &self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("ScopedBuffer holds its buffer until drop"),
        }
    }
}

impl<D: ComputeDevice> Drop for ScopedBuffer<D> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}
