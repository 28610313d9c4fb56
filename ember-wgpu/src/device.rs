//! The wgpu device: buffers, pipelines, dispatch and read-back.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use ember::buffer_pool::align_up;
use ember::kernels::{KernelDescriptor, KernelKey};
use ember::{
    BufferUsage, ComputeDevice, DeviceLimits, Error, Features, LostCallback, Result,
};
use futures::channel::oneshot;
use parking_lot::Mutex;

use crate::convert;

/// Shared handle to a wgpu buffer.
#[derive(Debug, Clone)]
pub struct WgpuBuffer {
    raw: Arc<wgpu::Buffer>,
}

impl WgpuBuffer {
    #[must_use]
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.raw
    }
}

#[derive(Debug)]
pub struct WgpuPipeline {
    pub kernel: KernelKey,
    pub workgroup: [u32; 3],
    raw: wgpu::ComputePipeline,
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    features: Features,
    limits: DeviceLimits,
    lost: Arc<Mutex<Option<String>>>,
}

impl WgpuDevice {
    pub(crate) fn new(device: wgpu::Device, queue: wgpu::Queue, features: Features) -> Self {
        let limits = convert::limits_from_wgpu(&device.limits());
        device.on_uncaptured_error(Box::new(|error| {
            tracing::error!(%error, "uncaptured wgpu error");
        }));
        Self {
            device,
            queue,
            features,
            limits,
            lost: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn raw(&self) -> &wgpu::Device {
        &self.device
    }

    fn check_alive(&self) -> Result<()> {
        match self.lost.lock().as_ref() {
            Some(reason) => Err(Error::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn wait(&self) {
        let _ = self.device.poll(wgpu::Maintain::Wait);
    }
}

#[async_trait]
impl ComputeDevice for WgpuDevice {
    type Buffer = WgpuBuffer;
    type Pipeline = WgpuPipeline;

    fn features(&self) -> Features {
        self.features
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage, label: &str) -> Result<WgpuBuffer> {
        self.check_alive()?;
        let raw = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: align_up(size, wgpu::COPY_BUFFER_ALIGNMENT),
            usage: convert::buffer_usages(usage),
            mapped_at_creation: false,
        });
        Ok(WgpuBuffer { raw: Arc::new(raw) })
    }

    fn destroy_buffer(&self, buffer: &WgpuBuffer) {
        buffer.raw.destroy();
    }

    fn write_buffer(&self, buffer: &WgpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        self.check_alive()?;
        let padded_len = align_up(data.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT);
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || offset + padded_len > buffer.raw.size() {
            return Err(Error::Backend(format!(
                "write of {} bytes at {offset} does not fit a {}-byte buffer",
                data.len(),
                buffer.raw.size()
            )));
        }
        if padded_len == data.len() as u64 {
            self.queue.write_buffer(&buffer.raw, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(usize::try_from(padded_len).unwrap_or(data.len()), 0);
            self.queue.write_buffer(&buffer.raw, offset, &padded);
        }
        Ok(())
    }

    async fn compile_pipeline(
        &self,
        descriptor: &KernelDescriptor,
        workgroup: [u32; 3],
        source: &str,
    ) -> Result<WgpuPipeline> {
        self.check_alive()?;
        let label = descriptor.label();
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
            });
        let raw = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&label),
                layout: None,
                module: &module,
                entry_point: Some(descriptor.entry_point),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
        if let Some(error) = self.device.pop_error_scope().await {
            return Err(Error::PipelineCompile {
                kernel: label,
                message: error.to_string(),
            });
        }
        tracing::debug!(kernel = %label, ?workgroup, "compute pipeline compiled");
        Ok(WgpuPipeline {
            kernel: descriptor.key,
            workgroup,
            raw,
        })
    }

    fn dispatch(
        &self,
        pipeline: &WgpuPipeline,
        bindings: &[&WgpuBuffer],
        workgroups: [u32; 3],
    ) -> Result<()> {
        self.check_alive()?;
        let layout = pipeline.raw.get_bind_group_layout(0);
        let entries: Vec<wgpu::BindGroupEntry<'_>> = bindings
            .iter()
            .zip(0u32..)
            .map(|(buffer, binding)| wgpu::BindGroupEntry {
                binding,
                resource: buffer.raw.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ember bindings"),
            layout: &layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("ember dispatch"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("ember compute"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline.raw);
            pass.set_bind_group(0, &bind_group, &[]);
            let [x, y, z] = workgroups;
            pass.dispatch_workgroups(x, y, z);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn copy_buffer(&self, src: &WgpuBuffer, dst: &WgpuBuffer, size: u64) -> Result<()> {
        self.check_alive()?;
        let size = align_up(size, wgpu::COPY_BUFFER_ALIGNMENT);
        if size > src.raw.size() || size > dst.raw.size() {
            return Err(Error::Backend(format!(
                "copy of {size} bytes exceeds a buffer ({} -> {})",
                src.raw.size(),
                dst.raw.size()
            )));
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("ember copy"),
            });
        encoder.copy_buffer_to_buffer(&src.raw, 0, &dst.raw, 0, size);
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    async fn map_read(&self, buffer: &WgpuBuffer, size: u64) -> Result<Vec<u8>> {
        self.check_alive()?;
        let mapped = align_up(size, wgpu::MAP_ALIGNMENT).min(buffer.raw.size());
        let slice = buffer.raw.slice(0..mapped);
        let (tx, rx) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait();
        rx.await
            .map_err(|_| Error::Backend("map_async callback dropped".into()))?
            .map_err(|e| {
                self.check_alive()
                    .err()
                    .unwrap_or_else(|| Error::Backend(format!("map_async: {e}")))
            })?;

        let mut bytes = slice.get_mapped_range().to_vec();
        buffer.raw.unmap();
        bytes.truncate(usize::try_from(size).unwrap_or(bytes.len()));
        Ok(bytes)
    }

    async fn wait_idle(&self) -> Result<()> {
        self.check_alive()?;
        self.wait();
        self.check_alive()
    }

    fn set_lost_callback(&self, callback: LostCallback) {
        let lost = Arc::clone(&self.lost);
        self.device
            .set_device_lost_callback(move |reason, message| {
                let reason = format!("{reason:?}: {message}");
                *lost.lock() = Some(reason.clone());
                callback(reason);
            });
    }
}
