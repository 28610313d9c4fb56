//! Capability-gated variant selection.
//!
//! These functions are pure: the same capabilities and hints always give
//! the same variant, and a variant is never returned unless its required
//! features are present.

use crate::capabilities::Capabilities;
use crate::rope::RopeScaling;

use super::{
    AttentionVariant, DequantVariant, KernelKey, MatmulVariant, Operation, RopeVariant,
    SiluVariant, SoftmaxVariant,
};

/// Rows at or below this length use [`SoftmaxVariant::Small`].
pub const SOFTMAX_SMALL_MAX: usize = 256;

/// Rows above this length use [`SoftmaxVariant::Online`].
pub const SOFTMAX_ONLINE_MIN: usize = 4096;

/// Caller-side facts that influence selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionHints {
    /// Half precision is allowed (matmul only).
    pub prefer_f16: bool,
    /// The shape admits four-wide vector access.
    pub vectorize: bool,
    /// Query length, for attention.
    pub seq_len: usize,
    /// Row length, for softmax.
    pub row_size: usize,
    pub rope_scaling: RopeScaling,
    /// A gate tensor is supplied, for SiLU.
    pub gated: bool,
}

impl Default for SelectionHints {
    fn default() -> Self {
        Self {
            prefer_f16: true,
            vectorize: false,
            seq_len: 1,
            row_size: 0,
            rope_scaling: RopeScaling::None,
            gated: false,
        }
    }
}

#[must_use]
pub fn select_matmul_variant(
    caps: &Capabilities,
    prefer_f16: bool,
    vectorize: bool,
) -> MatmulVariant {
    match (caps.has_f16() && prefer_f16, vectorize) {
        (true, true) => MatmulVariant::F16Vec4,
        (true, false) => MatmulVariant::F16,
        (false, _) => MatmulVariant::F32,
    }
}

#[must_use]
pub fn select_dequant_variant(caps: &Capabilities, vectorize: bool) -> DequantVariant {
    match (caps.has_subgroups(), vectorize) {
        (true, true) => DequantVariant::SubgroupVec4,
        (true, false) => DequantVariant::Subgroup,
        (false, true) => DequantVariant::SharedVec4,
        (false, false) => DequantVariant::Shared,
    }
}

#[must_use]
pub fn select_attention_variant(seq_len: usize) -> AttentionVariant {
    if seq_len == 1 {
        AttentionVariant::Decode
    } else {
        AttentionVariant::Prefill
    }
}

#[must_use]
pub fn select_softmax_variant(row_size: usize) -> SoftmaxVariant {
    if row_size <= SOFTMAX_SMALL_MAX {
        SoftmaxVariant::Small
    } else if row_size > SOFTMAX_ONLINE_MIN {
        SoftmaxVariant::Online
    } else {
        SoftmaxVariant::Default
    }
}

#[must_use]
pub fn select_rope_variant(scaling: RopeScaling) -> RopeVariant {
    match scaling {
        RopeScaling::None => RopeVariant::Default,
        RopeScaling::Linear { .. } => RopeVariant::Linear,
        RopeScaling::Ntk { .. } => RopeVariant::Ntk,
    }
}

/// Pick the kernel for `operation` on a device with `caps`.
#[must_use]
pub fn select_variant(
    operation: Operation,
    caps: &Capabilities,
    hints: &SelectionHints,
) -> KernelKey {
    match operation {
        Operation::Matmul => KernelKey::Matmul(select_matmul_variant(
            caps,
            hints.prefer_f16,
            hints.vectorize,
        )),
        Operation::Dequantize => {
            KernelKey::Dequantize(select_dequant_variant(caps, hints.vectorize))
        }
        Operation::Attention => KernelKey::Attention(select_attention_variant(hints.seq_len)),
        Operation::RmsNorm => KernelKey::RmsNorm,
        Operation::Softmax => KernelKey::Softmax(select_softmax_variant(hints.row_size)),
        Operation::Rope => KernelKey::Rope(select_rope_variant(hints.rope_scaling)),
        Operation::Silu => KernelKey::Silu(if hints.gated {
            SiluVariant::Gated
        } else {
            SiluVariant::Plain
        }),
        Operation::Gather => KernelKey::Gather,
        Operation::ResidualAdd => KernelKey::ResidualAdd,
    }
}
