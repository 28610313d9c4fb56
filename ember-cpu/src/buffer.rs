//! Host-memory buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ember::{BufferUsage, Error, Result};
use parking_lot::{Mutex, MutexGuard};

struct Inner {
    label: String,
    size: u64,
    usage: BufferUsage,
    /// Word storage keeps `f32`/`u32` views aligned.
    words: Mutex<Vec<u32>>,
    destroyed: AtomicBool,
}

/// A shared handle to host memory. Clones alias the same storage.
#[derive(Clone)]
pub struct HostBuffer {
    inner: Arc<Inner>,
}

impl HostBuffer {
    pub(crate) fn new(size: u64, usage: BufferUsage, label: &str) -> Result<Self> {
        let words = usize::try_from(size.div_ceil(4))
            .map_err(|_| Error::Backend(format!("buffer {label} of {size} bytes is too large")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                label: label.to_string(),
                size,
                usage,
                words: Mutex::new(vec![0; words]),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    #[must_use]
    pub fn usage(&self) -> BufferUsage {
        self.inner.usage
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::Release);
        let mut words = self.inner.words.lock();
        words.clear();
        words.shrink_to_fit();
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Vec<u32>>> {
        if self.is_destroyed() {
            return Err(Error::Backend(format!(
                "buffer {} used after destroy",
                self.inner.label
            )));
        }
        Ok(self.inner.words.lock())
    }

    /// Snapshot of the contents as words.
    pub(crate) fn words(&self) -> Result<Vec<u32>> {
        Ok(self.lock()?.clone())
    }

    /// Copy `data` in at byte `offset`.
    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > self.size() {
            return Err(Error::Backend(format!(
                "write of {} bytes at {offset} overruns {} ({} bytes)",
                data.len(),
                self.label(),
                self.size()
            )));
        }
        let mut words = self.lock()?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
        #[allow(clippy::cast_possible_truncation)]
        bytes[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// The first `size` bytes.
    pub(crate) fn read(&self, size: u64) -> Result<Vec<u8>> {
        if size > self.size() {
            return Err(Error::Backend(format!(
                "read of {size} bytes overruns {} ({} bytes)",
                self.label(),
                self.size()
            )));
        }
        let words = self.lock()?;
        let bytes: &[u8] = bytemuck::cast_slice(words.as_slice());
        #[allow(clippy::cast_possible_truncation)]
        Ok(bytes[..size as usize].to_vec())
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("label", &self.inner.label)
            .field("size", &self.inner.size)
            .field("usage", &self.inner.usage)
            .finish_non_exhaustive()
    }
}
