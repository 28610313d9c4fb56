//! In-crate mock backend for unit tests.
//!
//! The mock device counts buffer creation, destruction and pipeline
//! compiles, records dispatches, and can fire its device-lost callback on
//! demand. It executes nothing: `map_read` returns zeroed bytes.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{BufferUsage, ComputeAdapter, ComputeBackend, ComputeDevice, LostCallback};
use crate::capabilities::{AdapterInfo, DeviceLimits, DeviceRequest, Features, PowerPreference};
use crate::kernels::{KernelDescriptor, KernelKey};
use crate::{Error, Result};

pub(crate) struct MockBackend {
    adapter_for: Option<PowerPreference>,
    features: Features,
    requested: Mutex<Vec<PowerPreference>>,
}

impl MockBackend {
    pub(crate) fn with_adapter_for(preference: PowerPreference) -> Self {
        Self {
            adapter_for: Some(preference),
            features: Features::empty(),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn without_adapter() -> Self {
        Self {
            adapter_for: None,
            features: Features::empty(),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub(crate) fn requested_preferences(&self) -> Vec<PowerPreference> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl ComputeBackend for MockBackend {
    type Adapter = MockAdapter;
    type Device = MockDevice;

    async fn request_adapter(&self, preference: PowerPreference) -> Option<MockAdapter> {
        self.requested.lock().push(preference);
        (self.adapter_for == Some(preference)).then(|| MockAdapter::new(self.features))
    }
}

pub(crate) struct MockAdapter {
    features: Features,
    reject_full: bool,
    reject_all: bool,
    requests: AtomicUsize,
}

impl MockAdapter {
    pub(crate) fn new(features: Features) -> Self {
        Self {
            features,
            reject_full: false,
            reject_all: false,
            requests: AtomicUsize::new(0),
        }
    }

    pub(crate) fn rejecting_full_requests(mut self) -> Self {
        self.reject_full = true;
        self
    }

    pub(crate) fn rejecting_all_requests(mut self) -> Self {
        self.reject_all = true;
        self
    }

    pub(crate) fn device_requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeAdapter for MockAdapter {
    type Device = MockDevice;

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: "mock".into(),
            backend: "mock".into(),
            device_type: "virtual".into(),
            driver: String::new(),
        }
    }

    fn features(&self) -> Features {
        self.features
    }

    fn limits(&self) -> DeviceLimits {
        DeviceLimits::default()
    }

    async fn request_device(&self, request: &DeviceRequest) -> Result<MockDevice> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.reject_all || (self.reject_full && *request != DeviceRequest::minimal()) {
            return Err(Error::Backend("device request rejected".into()));
        }
        Ok(MockDevice::new(
            request.features,
            request.limits.unwrap_or_default(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MockBuffer {
    pub id: u64,
    pub size: u64,
}

#[derive(Debug)]
pub(crate) struct MockPipeline {
    pub kernel: KernelKey,
    pub workgroup: [u32; 3],
}

pub(crate) struct MockDevice {
    features: Features,
    limits: DeviceLimits,
    next_id: AtomicU64,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    compiles: AtomicUsize,
    fail_compiles: AtomicBool,
    dispatches: Mutex<Vec<(KernelKey, [u32; 3], [u32; 3])>>,
    lost: Mutex<Option<LostCallback>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new(Features::empty(), DeviceLimits::default())
    }
}

impl MockDevice {
    pub(crate) fn new(features: Features, limits: DeviceLimits) -> Self {
        Self {
            features,
            limits,
            next_id: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            compiles: AtomicUsize::new(0),
            fail_compiles: AtomicBool::new(false),
            dispatches: Mutex::new(Vec::new()),
            lost: Mutex::new(None),
        }
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_compiles(&self, fail: bool) {
        self.fail_compiles.store(fail, Ordering::SeqCst);
    }

    /// `(kernel, pipeline workgroup, dispatched workgroup counts)` per dispatch.
    pub(crate) fn dispatches(&self) -> Vec<(KernelKey, [u32; 3], [u32; 3])> {
        self.dispatches.lock().clone()
    }

    /// Fire the registered device-lost callback.
    pub(crate) fn lose(&self, reason: &str) {
        if let Some(callback) = self.lost.lock().as_ref() {
            callback(reason.to_string());
        }
    }
}

#[async_trait]
impl ComputeDevice for MockDevice {
    type Buffer = MockBuffer;
    type Pipeline = MockPipeline;

    fn features(&self) -> Features {
        self.features
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, size: u64, _usage: BufferUsage, _label: &str) -> Result<MockBuffer> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockBuffer {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            size,
        })
    }

    fn destroy_buffer(&self, _buffer: &MockBuffer) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn write_buffer(&self, buffer: &MockBuffer, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > buffer.size {
            return Err(Error::Backend("write past end of buffer".into()));
        }
        Ok(())
    }

    async fn compile_pipeline(
        &self,
        descriptor: &KernelDescriptor,
        workgroup: [u32; 3],
        _source: &str,
    ) -> Result<MockPipeline> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        // Suspend like a real driver compile so concurrent callers interleave.
        tokio::task::yield_now().await;
        if self.fail_compiles.load(Ordering::SeqCst) {
            return Err(Error::PipelineCompile {
                kernel: descriptor.label(),
                message: "mock compile failure".into(),
            });
        }
        Ok(MockPipeline {
            kernel: descriptor.key,
            workgroup,
        })
    }

    fn dispatch(
        &self,
        pipeline: &MockPipeline,
        _bindings: &[&MockBuffer],
        workgroups: [u32; 3],
    ) -> Result<()> {
        self.dispatches
            .lock()
            .push((pipeline.kernel, pipeline.workgroup, workgroups));
        Ok(())
    }

    fn copy_buffer(&self, _src: &MockBuffer, _dst: &MockBuffer, _size: u64) -> Result<()> {
        Ok(())
    }

    async fn map_read(&self, _buffer: &MockBuffer, size: u64) -> Result<Vec<u8>> {
        Ok(vec![0; usize::try_from(size).map_err(|e| Error::Backend(e.to_string()))?])
    }

    async fn wait_idle(&self) -> Result<()> {
        Ok(())
    }

    fn set_lost_callback(&self, callback: LostCallback) {
        *self.lost.lock() = Some(callback);
    }
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a thread-local subscriber and return what it logged.
pub(crate) fn capture_logs(f: impl FnOnce()) -> String {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    let bytes = buffer.0.lock().clone();
    String::from_utf8_lossy(&bytes).into_owned()
}
