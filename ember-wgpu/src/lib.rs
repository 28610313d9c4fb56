//! wgpu backend for Ember.
//!
//! Runs the registry's WGSL kernels on any adapter wgpu can open (Vulkan,
//! Metal, DX12, or WebGPU in the browser).

#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod convert;
mod device;

use async_trait::async_trait;
use ember::{
    AdapterInfo, ComputeAdapter, ComputeBackend, DeviceLimits, DeviceRequest, Error, Features,
    PowerPreference, Result,
};

pub use device::{WgpuBuffer, WgpuDevice, WgpuPipeline};

/// A wgpu instance.
pub struct WgpuBackend {
    instance: wgpu::Instance,
    shader_f16: bool,
}

impl Default for WgpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WgpuBackend {
    /// An instance over every native backend.
    ///
    /// Half-precision shaders are not offered until enabled with
    /// [`with_shader_f16`](Self::with_shader_f16): the bundled shader
    /// compiler rejects `enable f16;`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            instance: wgpu::Instance::default(),
            shader_f16: false,
        }
    }

    #[must_use]
    pub fn with_shader_f16(mut self, enabled: bool) -> Self {
        self.shader_f16 = enabled;
        self
    }
}

#[async_trait]
impl ComputeBackend for WgpuBackend {
    type Adapter = WgpuAdapter;
    type Device = WgpuDevice;

    async fn request_adapter(&self, preference: PowerPreference) -> Option<WgpuAdapter> {
        let adapter = self
            .instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: convert::power_preference(preference),
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await?;
        Some(WgpuAdapter {
            adapter,
            shader_f16: self.shader_f16,
        })
    }
}

pub struct WgpuAdapter {
    adapter: wgpu::Adapter,
    shader_f16: bool,
}

#[async_trait]
impl ComputeAdapter for WgpuAdapter {
    type Device = WgpuDevice;

    fn info(&self) -> AdapterInfo {
        let info = self.adapter.get_info();
        AdapterInfo {
            name: info.name,
            backend: format!("{:?}", info.backend),
            device_type: format!("{:?}", info.device_type),
            driver: format!("{} {}", info.driver, info.driver_info).trim().to_string(),
        }
    }

    fn features(&self) -> Features {
        let mut features = convert::features_from_wgpu(self.adapter.features());
        if !self.shader_f16 {
            features -= Features::SHADER_F16 | Features::SUBGROUPS_F16;
        }
        features
    }

    fn limits(&self) -> DeviceLimits {
        convert::limits_from_wgpu(&self.adapter.limits())
    }

    async fn request_device(&self, request: &DeviceRequest) -> Result<WgpuDevice> {
        let required_limits = match &request.limits {
            Some(limits) => convert::limits_to_wgpu(limits, self.adapter.limits()),
            None => wgpu::Limits::default(),
        };
        let (device, queue) = self
            .adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("ember device"),
                    required_features: convert::features_to_wgpu(request.features),
                    required_limits,
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(|e| Error::Backend(format!("request_device: {e}")))?;
        Ok(WgpuDevice::new(device, queue, request.features))
    }
}
