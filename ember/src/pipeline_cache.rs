//! Compiled pipeline cache.
//!
//! Entries are keyed by kernel and workgroup shape. Each entry is an async
//! once-cell: the first caller runs the compile, and callers arriving while
//! it is in flight await the same result instead of compiling again. A
//! failed compile leaves the cell empty so a later call can retry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::kernels::KernelKey;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub kernel: KernelKey,
    pub workgroup: [u32; 3],
}

impl PipelineKey {
    #[must_use]
    pub fn new(kernel: KernelKey, workgroup: [u32; 3]) -> Self {
        Self { kernel, workgroup }
    }
}

type Entry<P> = Arc<OnceCell<Arc<P>>>;

pub struct PipelineCache<P> {
    entries: Mutex<HashMap<PipelineKey, Entry<P>>>,
    compiles: AtomicU64,
}

impl<P> Default for PipelineCache<P> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            compiles: AtomicU64::new(0),
        }
    }
}

impl<P> PipelineCache<P> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached pipeline for `key`, running `compile` on a miss.
    ///
    /// # Errors
    /// Whatever `compile` returns; the entry stays unresolved.
    pub async fn get_or_compile<F, Fut>(&self, key: PipelineKey, compile: F) -> Result<Arc<P>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<P>>,
    {
        let cell = Arc::clone(self.entries.lock().entry(key).or_default());
        let pipeline = cell
            .get_or_try_init(|| async move {
                self.compiles.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(kernel = %key.kernel, workgroup = ?key.workgroup, "compiling pipeline");
                compile().await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(pipeline))
    }

    /// A resolved pipeline, if one is cached.
    #[must_use]
    pub fn get(&self, key: &PipelineKey) -> Option<Arc<P>> {
        self.entries
            .lock()
            .get(key)
            .and_then(|cell| cell.get().cloned())
    }

    /// Number of resolved pipelines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compiles started since creation, including failed ones.
    #[must_use]
    pub fn compile_count(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }

    /// Drop every entry. Compiles still in flight finish into detached
    /// cells and are not cached.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
