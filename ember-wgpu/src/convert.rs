//! Mapping between ember's capability model and wgpu's.

use ember::{BufferUsage, DeviceLimits, Features, PowerPreference};

pub(crate) fn power_preference(preference: PowerPreference) -> wgpu::PowerPreference {
    match preference {
        PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
        PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
        PowerPreference::Default => wgpu::PowerPreference::None,
    }
}

/// Ember features offered by an adapter with `features`.
pub(crate) fn features_from_wgpu(features: wgpu::Features) -> Features {
    let mut out = Features::empty();
    if features.contains(wgpu::Features::SHADER_F16) {
        out |= Features::SHADER_F16;
    }
    if features.contains(wgpu::Features::SUBGROUP) {
        out |= Features::SUBGROUPS;
    }
    if out.contains(Features::SHADER_F16 | Features::SUBGROUPS) {
        out |= Features::SUBGROUPS_F16;
    }
    if features.contains(wgpu::Features::TIMESTAMP_QUERY) {
        out |= Features::TIMESTAMP_QUERY;
    }
    out
}

/// The wgpu features backing `features`.
pub(crate) fn features_to_wgpu(features: Features) -> wgpu::Features {
    let mut out = wgpu::Features::empty();
    if features.intersects(Features::SHADER_F16 | Features::SUBGROUPS_F16) {
        out |= wgpu::Features::SHADER_F16;
    }
    if features.intersects(Features::SUBGROUPS | Features::SUBGROUPS_F16) {
        out |= wgpu::Features::SUBGROUP;
    }
    if features.contains(Features::TIMESTAMP_QUERY) {
        out |= wgpu::Features::TIMESTAMP_QUERY;
    }
    out
}

pub(crate) fn limits_from_wgpu(limits: &wgpu::Limits) -> DeviceLimits {
    DeviceLimits {
        max_buffer_size: limits.max_buffer_size,
        max_storage_buffer_binding_size: u64::from(limits.max_storage_buffer_binding_size),
        max_uniform_buffer_binding_size: u64::from(limits.max_uniform_buffer_binding_size),
        max_compute_workgroup_size_x: limits.max_compute_workgroup_size_x,
        max_compute_workgroup_size_y: limits.max_compute_workgroup_size_y,
        max_compute_workgroup_size_z: limits.max_compute_workgroup_size_z,
        max_compute_invocations_per_workgroup: limits.max_compute_invocations_per_workgroup,
        max_compute_workgroup_storage_size: limits.max_compute_workgroup_storage_size,
        max_storage_buffers_per_shader_stage: limits.max_storage_buffers_per_shader_stage,
        max_compute_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
    }
}

/// `base` with the compute limits replaced by `limits`.
pub(crate) fn limits_to_wgpu(limits: &DeviceLimits, base: wgpu::Limits) -> wgpu::Limits {
    let clamp = |v: u64| u32::try_from(v).unwrap_or(u32::MAX);
    wgpu::Limits {
        max_buffer_size: limits.max_buffer_size,
        max_storage_buffer_binding_size: clamp(limits.max_storage_buffer_binding_size),
        max_uniform_buffer_binding_size: clamp(limits.max_uniform_buffer_binding_size),
        max_compute_workgroup_size_x: limits.max_compute_workgroup_size_x,
        max_compute_workgroup_size_y: limits.max_compute_workgroup_size_y,
        max_compute_workgroup_size_z: limits.max_compute_workgroup_size_z,
        max_compute_invocations_per_workgroup: limits.max_compute_invocations_per_workgroup,
        max_compute_workgroup_storage_size: limits.max_compute_workgroup_storage_size,
        max_storage_buffers_per_shader_stage: limits.max_storage_buffers_per_shader_stage,
        max_compute_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
        ..base
    }
}

pub(crate) fn buffer_usages(usage: BufferUsage) -> wgpu::BufferUsages {
    use wgpu::BufferUsages as U;
    match usage {
        BufferUsage::Storage => U::STORAGE | U::COPY_SRC | U::COPY_DST,
        BufferUsage::Uniform => U::UNIFORM | U::COPY_DST,
        BufferUsage::StagingRead => U::MAP_READ | U::COPY_DST,
        BufferUsage::StagingWrite => U::MAP_WRITE | U::COPY_SRC,
    }
}
