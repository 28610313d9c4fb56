//! Device capability model and negotiation.
//!
//! Negotiation happens once per device: the adapter is probed with a list
//! of power preferences, optional features are intersected with
//! [`FEATURE_PRIORITY`], and every limit that matters for kernel execution
//! is requested at the adapter's maximum. The result is an immutable
//! [`Capabilities`] snapshot that the dispatcher and the variant-selection
//! functions take by reference.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::backend::{ComputeAdapter, ComputeBackend, ComputeDevice};
use crate::error::{Error, Result};

bitflags! {
    /// Optional device features a kernel variant may depend on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Features: u32 {
        /// Half-precision arithmetic in shaders.
        const SHADER_F16 = 1 << 0;
        /// Subgroup (wave/warp) operations.
        const SUBGROUPS = 1 << 1;
        /// Subgroup operations on half-precision values.
        const SUBGROUPS_F16 = 1 << 2;
        /// GPU timestamp queries.
        const TIMESTAMP_QUERY = 1 << 3;
    }
}

/// Order in which optional features are requested.
pub const FEATURE_PRIORITY: [Features; 4] = [
    Features::SHADER_F16,
    Features::SUBGROUPS,
    Features::SUBGROUPS_F16,
    Features::TIMESTAMP_QUERY,
];

/// Adapter selection hint, tried in the order given by
/// [`RuntimeConfig::power_preferences`](crate::config::RuntimeConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerPreference {
    HighPerformance,
    LowPower,
    Default,
}

/// Numeric device limits relevant to kernel execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
    pub max_buffer_size: u64,
    pub max_storage_buffer_binding_size: u64,
    pub max_uniform_buffer_binding_size: u64,
    pub max_compute_workgroup_size_x: u32,
    pub max_compute_workgroup_size_y: u32,
    pub max_compute_workgroup_size_z: u32,
    pub max_compute_invocations_per_workgroup: u32,
    pub max_compute_workgroup_storage_size: u32,
    pub max_storage_buffers_per_shader_stage: u32,
    pub max_compute_workgroups_per_dimension: u32,
}

impl Default for DeviceLimits {
    /// The WebGPU baseline every conforming adapter guarantees.
    fn default() -> Self {
        Self {
            max_buffer_size: 256 << 20,
            max_storage_buffer_binding_size: 128 << 20,
            max_uniform_buffer_binding_size: 64 << 10,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_storage_size: 16 << 10,
            max_storage_buffers_per_shader_stage: 8,
            max_compute_workgroups_per_dimension: 65535,
        }
    }
}

impl DeviceLimits {
    /// Whether a workgroup shape fits within these limits.
    #[must_use]
    pub fn fits_workgroup(&self, workgroup: [u32; 3]) -> bool {
        let [x, y, z] = workgroup;
        x <= self.max_compute_workgroup_size_x
            && y <= self.max_compute_workgroup_size_y
            && z <= self.max_compute_workgroup_size_z
            && u64::from(x) * u64::from(y) * u64::from(z)
                <= u64::from(self.max_compute_invocations_per_workgroup)
    }
}

/// Descriptive adapter information, reported as-is by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub name: String,
    pub backend: String,
    pub device_type: String,
    pub driver: String,
}

/// What to ask for when creating a device.
///
/// `limits: None` means "adapter defaults", used by the minimal fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub features: Features,
    pub limits: Option<DeviceLimits>,
}

impl DeviceRequest {
    /// A request with no optional requirements.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            features: Features::empty(),
            limits: None,
        }
    }

    /// Every prioritized feature the adapter offers, and its maximal limits.
    #[must_use]
    pub fn full(available: Features, adapter_limits: DeviceLimits) -> Self {
        Self {
            features: feature_request(available),
            limits: Some(adapter_limits),
        }
    }
}

/// Immutable capability snapshot captured once per negotiated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub adapter: AdapterInfo,
    pub features: Features,
    pub limits: DeviceLimits,
}

impl Capabilities {
    #[must_use]
    pub fn new(adapter: AdapterInfo, features: Features, limits: DeviceLimits) -> Self {
        Self {
            adapter,
            features,
            limits,
        }
    }

    #[must_use]
    pub fn has_f16(&self) -> bool {
        self.features.contains(Features::SHADER_F16)
    }

    #[must_use]
    pub fn has_subgroups(&self) -> bool {
        self.features.contains(Features::SUBGROUPS)
    }

    #[must_use]
    pub fn has_subgroups_f16(&self) -> bool {
        self.features.contains(Features::SUBGROUPS_F16)
    }

    #[must_use]
    pub fn has_timestamp_query(&self) -> bool {
        self.features.contains(Features::TIMESTAMP_QUERY)
    }

    /// Features in `required` that this device lacks.
    #[must_use]
    pub fn missing(&self, required: Features) -> Features {
        required.difference(self.features)
    }
}

/// Intersect [`FEATURE_PRIORITY`] with what the adapter reports.
///
/// `SUBGROUPS_F16` is only requested alongside both of its parts.
#[must_use]
pub fn feature_request(available: Features) -> Features {
    let mut requested = Features::empty();
    for feature in FEATURE_PRIORITY {
        if !available.contains(feature) {
            continue;
        }
        if feature == Features::SUBGROUPS_F16
            && !requested.contains(Features::SHADER_F16 | Features::SUBGROUPS)
        {
            continue;
        }
        requested |= feature;
    }
    requested
}

/// Try each power preference in order and return the first adapter found.
///
/// `None` is an expected outcome (no capable device), not an error.
pub async fn probe_adapter<B: ComputeBackend>(
    backend: &B,
    preferences: &[PowerPreference],
) -> Option<B::Adapter> {
    for &preference in preferences {
        if let Some(adapter) = backend.request_adapter(preference).await {
            tracing::debug!(?preference, name = %adapter.info().name, "adapter found");
            return Some(adapter);
        }
        tracing::debug!(?preference, "no adapter for power preference");
    }
    None
}

/// Create a device with every useful optional feature and maximal limits,
/// retrying once with a minimal request if that fails.
pub async fn negotiate_device<A: ComputeAdapter>(
    adapter: &A,
) -> Result<(A::Device, Capabilities)> {
    let info = adapter.info();
    let full = DeviceRequest::full(adapter.features(), adapter.limits());

    let device = match adapter.request_device(&full).await {
        Ok(device) => device,
        Err(e) => {
            tracing::warn!(
                adapter = %info.name,
                error = %e,
                "device creation with optional features failed, retrying with minimal request"
            );
            adapter
                .request_device(&DeviceRequest::minimal())
                .await
                .map_err(|e| Error::DeviceUnavailable(format!("{}: {e}", info.name)))?
        }
    };

    let capabilities = Capabilities::new(info, device.features(), device.limits());
    tracing::info!(
        adapter = %capabilities.adapter.name,
        backend = %capabilities.adapter.backend,
        features = ?capabilities.features,
        max_buffer_size = capabilities.limits.max_buffer_size,
        max_storage_binding = capabilities.limits.max_storage_buffer_binding_size,
        "device negotiated"
    );
    Ok((device, capabilities))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAdapter, MockBackend};
    use proptest::prelude::*;

    #[test]
    fn test_feature_request_intersects_priority() {
        let available = Features::SHADER_F16 | Features::TIMESTAMP_QUERY;
        assert_eq!(feature_request(available), available);
        assert_eq!(feature_request(Features::empty()), Features::empty());
    }

    #[test]
    fn test_subgroups_f16_requires_both_parts() {
        let available = Features::SUBGROUPS | Features::SUBGROUPS_F16;
        let requested = feature_request(available);
        assert!(requested.contains(Features::SUBGROUPS));
        assert!(!requested.contains(Features::SUBGROUPS_F16));

        let requested = feature_request(Features::all());
        assert_eq!(requested, Features::all());
    }

    #[test]
    fn test_missing_features() {
        let caps = Capabilities::new(
            AdapterInfo::default(),
            Features::SUBGROUPS,
            DeviceLimits::default(),
        );
        assert_eq!(
            caps.missing(Features::SHADER_F16 | Features::SUBGROUPS),
            Features::SHADER_F16
        );
        assert!(caps.missing(Features::SUBGROUPS).is_empty());
    }

    #[test]
    fn test_fits_workgroup() {
        let limits = DeviceLimits::default();
        assert!(limits.fits_workgroup([256, 1, 1]));
        assert!(limits.fits_workgroup([16, 16, 1]));
        assert!(!limits.fits_workgroup([512, 1, 1]));
        assert!(!limits.fits_workgroup([32, 32, 1]));
    }

    #[tokio::test]
    async fn test_probe_walks_preferences_in_order() {
        let backend = MockBackend::with_adapter_for(PowerPreference::LowPower);
        let prefs = [
            PowerPreference::HighPerformance,
            PowerPreference::LowPower,
            PowerPreference::Default,
        ];
        let adapter = probe_adapter(&backend, &prefs).await;
        assert!(adapter.is_some());
        assert_eq!(
            backend.requested_preferences(),
            vec![PowerPreference::HighPerformance, PowerPreference::LowPower]
        );
    }

    #[tokio::test]
    async fn test_probe_without_adapter_is_none() {
        let backend = MockBackend::without_adapter();
        assert!(probe_adapter(&backend, &[PowerPreference::Default])
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_negotiate_requests_available_features() {
        let adapter = MockAdapter::new(Features::SHADER_F16 | Features::SUBGROUPS);
        let (_device, caps) = negotiate_device(&adapter).await.unwrap();
        assert!(caps.has_f16());
        assert!(caps.has_subgroups());
        assert!(!caps.has_timestamp_query());
        assert_eq!(adapter.device_requests(), 1);
    }

    #[tokio::test]
    async fn test_negotiate_falls_back_to_minimal() {
        let adapter = MockAdapter::new(Features::SHADER_F16).rejecting_full_requests();
        let (_device, caps) = negotiate_device(&adapter).await.unwrap();
        assert_eq!(caps.features, Features::empty());
        assert_eq!(adapter.device_requests(), 2);
    }

    #[tokio::test]
    async fn test_negotiate_fails_when_minimal_fails() {
        let adapter = MockAdapter::new(Features::empty()).rejecting_all_requests();
        let err = negotiate_device(&adapter).await.err().unwrap();
        assert!(matches!(err, Error::DeviceUnavailable(_)), "got {err:?}");
        assert_eq!(adapter.device_requests(), 2);
    }

    proptest! {
        #[test]
        fn feature_request_is_subset_of_available(bits in 0u32..16) {
            let available = Features::from_bits_truncate(bits);
            let requested = feature_request(available);
            prop_assert!(available.contains(requested));
        }
    }
}
