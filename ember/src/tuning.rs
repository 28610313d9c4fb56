//! Auto-tuned workgroup sizes.
//!
//! Results are keyed by kernel and a size class (`ceil(log2(work))`), so a
//! shape tuned at 4096 elements also serves 3000 or 4000. Lookups are
//! advisory: a miss means "use the descriptor default".

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::kernels::KernelKey;

/// `ceil(log2(work))`, with 0 and 1 both in class 0.
#[must_use]
pub fn size_class(work: u64) -> u32 {
    if work <= 1 {
        0
    } else {
        64 - (work - 1).leading_zeros()
    }
}

/// Shape a workgroup of `invocations` the way `default` is shaped: flat
/// kernels stay one-dimensional, square kernels stay roughly square.
#[must_use]
pub fn shape_like(default: [u32; 3], invocations: u32) -> [u32; 3] {
    if default[1] == 1 && default[2] == 1 {
        return [invocations, 1, 1];
    }
    let log = invocations.trailing_zeros();
    let x = 1u32 << log.div_ceil(2);
    [x, invocations / x, 1]
}

/// Outcome of tuning one kernel at one size class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuneResult {
    pub kernel: String,
    pub size_class: u32,
    pub workgroup: [u32; 3],
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct TuningTable {
    entries: Mutex<HashMap<(KernelKey, u32), [u32; 3]>>,
}

impl TuningTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lookup(&self, kernel: KernelKey, work: u64) -> Option<[u32; 3]> {
        self.entries.lock().get(&(kernel, size_class(work))).copied()
    }

    pub fn record(&self, kernel: KernelKey, work: u64, workgroup: [u32; 3]) {
        self.entries
            .lock()
            .insert((kernel, size_class(work)), workgroup);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
