//! Kernel registry
//!
//! Every (operation, variant) pair maps to a static [`KernelDescriptor`]
//! holding its WGSL template, entry point, default workgroup shape and the
//! device features it needs. Templates carry `{{WG_X}}`, `{{WG_Y}}` and
//! `{{WG_Z}}` placeholders so alternative workgroup sizes can be compiled.

mod select;

pub use select::{
    select_attention_variant, select_dequant_variant, select_matmul_variant,
    select_rope_variant, select_softmax_variant, select_variant, SelectionHints,
};

use std::fmt;

use crate::capabilities::Features;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Matmul,
    Dequantize,
    Attention,
    RmsNorm,
    Softmax,
    Rope,
    Silu,
    Gather,
    ResidualAdd,
}

impl Operation {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Matmul => "matmul",
            Self::Dequantize => "dequantize",
            Self::Attention => "attention",
            Self::RmsNorm => "rms_norm",
            Self::Softmax => "softmax",
            Self::Rope => "rope",
            Self::Silu => "silu",
            Self::Gather => "gather",
            Self::ResidualAdd => "residual_add",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatmulVariant {
    F32,
    F16,
    /// Four output columns per invocation; needs `N % 4 == 0`.
    F16Vec4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DequantVariant {
    Subgroup,
    SubgroupVec4,
    Shared,
    SharedVec4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttentionVariant {
    Prefill,
    Decode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SoftmaxVariant {
    /// One invocation per row.
    Small,
    /// One workgroup per row, three passes.
    Default,
    /// One workgroup per row, streaming max/sum in a single pass.
    Online,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RopeVariant {
    Default,
    Linear,
    Ntk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SiluVariant {
    /// `y = silu(x)`
    Plain,
    /// `y = silu(gate) * x`
    Gated,
}

/// Structured registry key: an operation tagged with its variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelKey {
    Matmul(MatmulVariant),
    Dequantize(DequantVariant),
    Attention(AttentionVariant),
    RmsNorm,
    Softmax(SoftmaxVariant),
    Rope(RopeVariant),
    Silu(SiluVariant),
    Gather,
    ResidualAdd,
}

impl KernelKey {
    #[must_use]
    pub fn operation(self) -> Operation {
        match self {
            Self::Matmul(_) => Operation::Matmul,
            Self::Dequantize(_) => Operation::Dequantize,
            Self::Attention(_) => Operation::Attention,
            Self::RmsNorm => Operation::RmsNorm,
            Self::Softmax(_) => Operation::Softmax,
            Self::Rope(_) => Operation::Rope,
            Self::Silu(_) => Operation::Silu,
            Self::Gather => Operation::Gather,
            Self::ResidualAdd => Operation::ResidualAdd,
        }
    }

    #[must_use]
    pub fn variant_name(self) -> &'static str {
        match self {
            Self::Matmul(MatmulVariant::F32) => "f32",
            Self::Matmul(MatmulVariant::F16) => "f16",
            Self::Matmul(MatmulVariant::F16Vec4) => "f16_vec4",
            Self::Dequantize(DequantVariant::Subgroup) => "subgroup",
            Self::Dequantize(DequantVariant::SubgroupVec4) => "subgroup_vec4",
            Self::Dequantize(DequantVariant::Shared) => "shared",
            Self::Dequantize(DequantVariant::SharedVec4) => "shared_vec4",
            Self::Attention(AttentionVariant::Prefill) => "prefill",
            Self::Attention(AttentionVariant::Decode) => "decode",
            Self::Softmax(SoftmaxVariant::Small) => "small",
            Self::Softmax(SoftmaxVariant::Default) => "default",
            Self::Softmax(SoftmaxVariant::Online) => "online",
            Self::Rope(RopeVariant::Default) => "default",
            Self::Rope(RopeVariant::Linear) => "linear",
            Self::Rope(RopeVariant::Ntk) => "ntk",
            Self::Silu(SiluVariant::Plain) => "plain",
            Self::Silu(SiluVariant::Gated) => "gated",
            Self::RmsNorm | Self::Gather | Self::ResidualAdd => "default",
        }
    }

    /// Number of input bindings. Bindings are laid out as
    /// `inputs.., output, uniform`.
    #[must_use]
    pub fn input_count(self) -> usize {
        match self {
            Self::Dequantize(_)
            | Self::Softmax(_)
            | Self::Rope(_)
            | Self::Silu(SiluVariant::Plain) => 1,
            Self::Matmul(_)
            | Self::RmsNorm
            | Self::Silu(SiluVariant::Gated)
            | Self::Gather
            | Self::ResidualAdd => 2,
            Self::Attention(_) => 3,
        }
    }

    #[must_use]
    pub fn descriptor(self) -> &'static KernelDescriptor {
        match self {
            Self::Matmul(MatmulVariant::F32) => &MATMUL_F32,
            Self::Matmul(MatmulVariant::F16) => &MATMUL_F16,
            Self::Matmul(MatmulVariant::F16Vec4) => &MATMUL_F16_VEC4,
            Self::Dequantize(DequantVariant::Subgroup) => &DEQUANT_SUBGROUP,
            Self::Dequantize(DequantVariant::SubgroupVec4) => &DEQUANT_SUBGROUP_VEC4,
            Self::Dequantize(DequantVariant::Shared) => &DEQUANT_SHARED,
            Self::Dequantize(DequantVariant::SharedVec4) => &DEQUANT_SHARED_VEC4,
            Self::Attention(AttentionVariant::Prefill) => &ATTENTION_PREFILL,
            Self::Attention(AttentionVariant::Decode) => &ATTENTION_DECODE,
            Self::RmsNorm => &RMS_NORM,
            Self::Softmax(SoftmaxVariant::Small) => &SOFTMAX_SMALL,
            Self::Softmax(SoftmaxVariant::Default) => &SOFTMAX_DEFAULT,
            Self::Softmax(SoftmaxVariant::Online) => &SOFTMAX_ONLINE,
            Self::Rope(RopeVariant::Default) => &ROPE_DEFAULT,
            Self::Rope(RopeVariant::Linear) => &ROPE_LINEAR,
            Self::Rope(RopeVariant::Ntk) => &ROPE_NTK,
            Self::Silu(SiluVariant::Plain) => &SILU_PLAIN,
            Self::Silu(SiluVariant::Gated) => &SILU_GATED,
            Self::Gather => &GATHER,
            Self::ResidualAdd => &RESIDUAL_ADD,
        }
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.operation().name(), self.variant_name())
    }
}

/// Static description of one kernel variant.
#[derive(Debug)]
pub struct KernelDescriptor {
    pub key: KernelKey,
    /// WGSL template with workgroup-size placeholders.
    pub source: &'static str,
    pub entry_point: &'static str,
    pub workgroup: [u32; 3],
    pub required_features: Features,
    /// Whether the auto-tuner may substitute another workgroup size.
    pub tunable: bool,
    /// The shader linearizes `x + y * num_workgroups.x`, so a 1-D grid
    /// over the per-dimension limit may be folded into two dimensions.
    pub foldable: bool,
}

impl KernelDescriptor {
    /// `"operation:variant"`, used for pipeline labels and errors.
    #[must_use]
    pub fn label(&self) -> String {
        self.key.to_string()
    }

    /// Specialize the template for `workgroup`.
    #[must_use]
    pub fn render(&self, workgroup: [u32; 3]) -> String {
        self.source
            .replace("{{WG_X}}", &workgroup[0].to_string())
            .replace("{{WG_Y}}", &workgroup[1].to_string())
            .replace("{{WG_Z}}", &workgroup[2].to_string())
    }
}

const NONE: Features = Features::empty();

static MATMUL_F32: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Matmul(MatmulVariant::F32),
    source: include_str!("wgsl/matmul_f32.wgsl"),
    entry_point: "main",
    workgroup: [16, 16, 1],
    required_features: NONE,
    tunable: true,
    foldable: false,
};

static MATMUL_F16: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Matmul(MatmulVariant::F16),
    source: include_str!("wgsl/matmul_f16.wgsl"),
    entry_point: "main",
    workgroup: [16, 16, 1],
    required_features: Features::SHADER_F16,
    tunable: true,
    foldable: false,
};

static MATMUL_F16_VEC4: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Matmul(MatmulVariant::F16Vec4),
    source: include_str!("wgsl/matmul_f16_vec4.wgsl"),
    entry_point: "main",
    workgroup: [16, 16, 1],
    required_features: Features::SHADER_F16,
    tunable: true,
    foldable: false,
};

static DEQUANT_SUBGROUP: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Dequantize(DequantVariant::Subgroup),
    source: include_str!("wgsl/dequant_subgroup.wgsl"),
    entry_point: "main",
    workgroup: [256, 1, 1],
    required_features: Features::SUBGROUPS,
    tunable: true,
    foldable: true,
};

static DEQUANT_SUBGROUP_VEC4: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Dequantize(DequantVariant::SubgroupVec4),
    source: include_str!("wgsl/dequant_subgroup_vec4.wgsl"),
    entry_point: "main",
    workgroup: [256, 1, 1],
    required_features: Features::SUBGROUPS,
    tunable: true,
    foldable: true,
};

static DEQUANT_SHARED: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Dequantize(DequantVariant::Shared),
    source: include_str!("wgsl/dequant_shared.wgsl"),
    entry_point: "main",
    workgroup: [256, 1, 1],
    required_features: NONE,
    tunable: true,
    foldable: true,
};

static DEQUANT_SHARED_VEC4: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Dequantize(DequantVariant::SharedVec4),
    source: include_str!("wgsl/dequant_shared_vec4.wgsl"),
    entry_point: "main",
    workgroup: [256, 1, 1],
    required_features: NONE,
    tunable: true,
    foldable: true,
};

static ATTENTION_PREFILL: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Attention(AttentionVariant::Prefill),
    source: include_str!("wgsl/attention_prefill.wgsl"),
    entry_point: "main",
    workgroup: [crate::attention::PREFILL_TILE as u32, 1, 1],
    required_features: NONE,
    tunable: false,
    foldable: false,
};

static ATTENTION_DECODE: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Attention(AttentionVariant::Decode),
    source: include_str!("wgsl/attention_decode.wgsl"),
    entry_point: "main",
    workgroup: [crate::attention::DECODE_WORKERS as u32, 1, 1],
    required_features: NONE,
    tunable: false,
    foldable: false,
};

static RMS_NORM: KernelDescriptor = KernelDescriptor {
    key: KernelKey::RmsNorm,
    source: include_str!("wgsl/rms_norm.wgsl"),
    entry_point: "main",
    workgroup: [256, 1, 1],
    required_features: NONE,
    tunable: true,
    foldable: false,
};

static SOFTMAX_SMALL: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Softmax(SoftmaxVariant::Small),
    source: include_str!("wgsl/softmax_small.wgsl"),
    entry_point: "main",
    workgroup: [64, 1, 1],
    required_features: NONE,
    tunable: true,
    foldable: false,
};

static SOFTMAX_DEFAULT: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Softmax(SoftmaxVariant::Default),
    source: include_str!("wgsl/softmax_default.wgsl"),
    entry_point: "main",
    workgroup: [256, 1, 1],
    required_features: NONE,
    tunable: true,
    foldable: false,
};

static SOFTMAX_ONLINE: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Softmax(SoftmaxVariant::Online),
    source: include_str!("wgsl/softmax_online.wgsl"),
    entry_point: "main",
    workgroup: [256, 1, 1],
    required_features: NONE,
    tunable: true,
    foldable: false,
};

static ROPE_DEFAULT: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Rope(RopeVariant::Default),
    source: include_str!("wgsl/rope_default.wgsl"),
    entry_point: "main",
    workgroup: [64, 1, 1],
    required_features: NONE,
    tunable: true,
    foldable: false,
};

static ROPE_LINEAR: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Rope(RopeVariant::Linear),
    source: include_str!("wgsl/rope_linear.wgsl"),
    entry_point: "main",
    workgroup: [64, 1, 1],
    required_features: NONE,
    tunable: true,
    foldable: false,
};

static ROPE_NTK: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Rope(RopeVariant::Ntk),
    source: include_str!("wgsl/rope_ntk.wgsl"),
    entry_point: "main",
    workgroup: [64, 1, 1],
    required_features: NONE,
    tunable: true,
    foldable: false,
};

static SILU_PLAIN: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Silu(SiluVariant::Plain),
    source: include_str!("wgsl/silu.wgsl"),
    entry_point: "main",
    workgroup: [256, 1, 1],
    required_features: NONE,
    tunable: true,
    foldable: true,
};

static SILU_GATED: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Silu(SiluVariant::Gated),
    source: include_str!("wgsl/silu_gated.wgsl"),
    entry_point: "main",
    workgroup: [256, 1, 1],
    required_features: NONE,
    tunable: true,
    foldable: true,
};

static GATHER: KernelDescriptor = KernelDescriptor {
    key: KernelKey::Gather,
    source: include_str!("wgsl/gather.wgsl"),
    entry_point: "main",
    workgroup: [64, 1, 1],
    required_features: NONE,
    tunable: true,
    foldable: false,
};

static RESIDUAL_ADD: KernelDescriptor = KernelDescriptor {
    key: KernelKey::ResidualAdd,
    source: include_str!("wgsl/residual_add.wgsl"),
    entry_point: "main",
    workgroup: [256, 1, 1],
    required_features: NONE,
    tunable: true,
    foldable: true,
};

/// Every registered kernel, in registry order.
pub const ALL_KERNELS: [KernelKey; 20] = [
    KernelKey::Matmul(MatmulVariant::F32),
    KernelKey::Matmul(MatmulVariant::F16),
    KernelKey::Matmul(MatmulVariant::F16Vec4),
    KernelKey::Dequantize(DequantVariant::Subgroup),
    KernelKey::Dequantize(DequantVariant::SubgroupVec4),
    KernelKey::Dequantize(DequantVariant::Shared),
    KernelKey::Dequantize(DequantVariant::SharedVec4),
    KernelKey::Attention(AttentionVariant::Prefill),
    KernelKey::Attention(AttentionVariant::Decode),
    KernelKey::RmsNorm,
    KernelKey::Softmax(SoftmaxVariant::Small),
    KernelKey::Softmax(SoftmaxVariant::Default),
    KernelKey::Softmax(SoftmaxVariant::Online),
    KernelKey::Rope(RopeVariant::Default),
    KernelKey::Rope(RopeVariant::Linear),
    KernelKey::Rope(RopeVariant::Ntk),
    KernelKey::Silu(SiluVariant::Plain),
    KernelKey::Silu(SiluVariant::Gated),
    KernelKey::Gather,
    KernelKey::ResidualAdd,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_descriptor_keys_match() {
        for key in ALL_KERNELS {
            assert_eq!(key.descriptor().key, key, "descriptor for {key} has wrong key");
        }
    }

    #[test]
    fn test_labels_are_unique() {
        let labels: HashSet<String> = ALL_KERNELS.iter().map(|k| k.to_string()).collect();
        assert_eq!(labels.len(), ALL_KERNELS.len());
    }

    #[test]
    fn test_render_substitutes_workgroup() {
        for key in ALL_KERNELS {
            let desc = key.descriptor();
            let source = desc.render([128, 1, 1]);
            assert!(!source.contains("{{"), "{key} has unsubstituted placeholders");
            assert!(source.contains("@compute"), "{key} has no compute entry");
            assert!(
                source.contains(&format!("fn {}(", desc.entry_point)),
                "{key} missing entry point"
            );
        }
        let rendered = MATMUL_F32.render([8, 8, 1]);
        assert!(rendered.contains("@workgroup_size(8, 8, 1)"));
    }

    #[test]
    fn test_f16_sources_enable_f16() {
        for key in ALL_KERNELS {
            let desc = key.descriptor();
            let enables = desc.source.contains("enable f16;");
            assert_eq!(
                enables,
                desc.required_features.contains(Features::SHADER_F16),
                "{key}: f16 directive does not match required features"
            );
        }
    }

    #[test]
    fn test_subgroup_shuffles_stay_in_range() {
        for variant in [DequantVariant::Subgroup, DequantVariant::SubgroupVec4] {
            let source = KernelKey::Dequantize(variant).descriptor().source;
            for line in source.lines().filter(|l| l.contains("subgroupShuffle(")) {
                assert!(
                    line.contains("subgroupShuffle(scale_bits, source)"),
                    "{variant:?}: unguarded shuffle `{}`",
                    line.trim()
                );
            }
            assert!(source.contains("let source = select(sg_lane, "), "{variant:?}");
            assert!(!source.contains("subgroup_size"), "{variant:?}");
        }
    }

    #[test]
    fn test_uniform_binding_follows_output() {
        for key in ALL_KERNELS {
            let uniform_binding = key.input_count() + 1;
            let needle = format!("@binding({uniform_binding}) var<uniform>");
            assert!(
                key.descriptor().source.contains(&needle),
                "{key}: uniform is not bound at {uniform_binding}"
            );
        }
    }

    #[test]
    fn test_default_workgroups_fit_baseline_limits() {
        let limits = crate::capabilities::DeviceLimits::default();
        for key in ALL_KERNELS {
            assert!(limits.fits_workgroup(key.descriptor().workgroup), "{key}");
        }
    }
}
