//! Mixture-of-experts routing.
//!
//! A router scores every token against `num_experts` gate columns, keeps the
//! `top_k` most probable experts per token and tracks how evenly tokens are
//! spread across experts. Logits are computed on the GPU through
//! [`GpuContext::run_matmul`] at full precision, or on the host.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::ComputeBackend;
use crate::context::GpuContext;
use crate::ops::MatmulOptions;
use crate::{Error, Result};

/// Router shape and selection policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoeConfig {
    pub num_experts: usize,
    /// Experts selected per token.
    pub top_k: usize,
    pub hidden_size: usize,
    /// Rescale the selected weights to sum to one.
    #[serde(default = "default_true")]
    pub normalize_weights: bool,
}

fn default_true() -> bool {
    true
}

impl MoeConfig {
    /// # Errors
    /// [`Error::Configuration`] for zero sizes or `top_k > num_experts`.
    pub fn validate(&self) -> Result<()> {
        if self.num_experts == 0 || self.hidden_size == 0 {
            return Err(Error::Configuration(
                "num_experts and hidden_size must be non-zero".into(),
            ));
        }
        if self.top_k == 0 || self.top_k > self.num_experts {
            return Err(Error::Configuration(format!(
                "top_k must be in 1..={}, got {}",
                self.num_experts, self.top_k
            )));
        }
        Ok(())
    }
}

/// Routing result for one token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpertSelection {
    /// Exactly `top_k` expert indices, most probable first.
    pub experts: Vec<usize>,
    /// Probability of each selected expert, renormalized if configured.
    pub weights: Vec<f32>,
    /// Raw router logits for this token, all experts.
    pub logits: Vec<f32>,
}

/// Tokens and weights routed to one expert.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExpertAssignment {
    /// Ascending token indices.
    pub token_indices: Vec<usize>,
    pub weights: Vec<f32>,
}

/// Expert index to its assigned tokens. Experts with no tokens are absent.
pub type ExpertExecutionPlan = BTreeMap<usize, ExpertAssignment>;

/// Running per-expert selection counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadBalanceStats {
    pub expert_counts: Vec<u64>,
    pub total_tokens: u64,
}

impl LoadBalanceStats {
    fn new(num_experts: usize) -> Self {
        Self {
            expert_counts: vec![0; num_experts],
            total_tokens: 0,
        }
    }
}

pub struct MoeRouter {
    config: MoeConfig,
    /// `[hidden_size, num_experts]`, row-major.
    gate_weights: Option<Vec<f32>>,
    stats: LoadBalanceStats,
}

impl MoeRouter {
    /// # Errors
    /// [`Error::Configuration`] if `config` fails validation.
    pub fn new(config: MoeConfig) -> Result<Self> {
        config.validate()?;
        let stats = LoadBalanceStats::new(config.num_experts);
        Ok(Self {
            config,
            gate_weights: None,
            stats,
        })
    }

    #[must_use]
    pub fn config(&self) -> &MoeConfig {
        &self.config
    }

    /// Install gate weights laid out `[hidden_size, num_experts]`.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the length is wrong.
    pub fn load_gate_weights(&mut self, weights: Vec<f32>) -> Result<()> {
        let shape = [self.config.hidden_size, self.config.num_experts];
        if weights.len() != shape[0] * shape[1] {
            return Err(Error::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![weights.len()],
            });
        }
        self.gate_weights = Some(weights);
        Ok(())
    }

    #[must_use]
    pub fn has_gate_weights(&self) -> bool {
        self.gate_weights.is_some()
    }

    fn gate_weights(&self) -> Result<&[f32]> {
        self.gate_weights
            .as_deref()
            .ok_or_else(|| Error::Configuration("router gate weights not loaded".into()))
    }

    fn check_hidden(&self, hidden_states: &[f32], num_tokens: usize) -> Result<()> {
        let expected = [num_tokens, self.config.hidden_size];
        if num_tokens == 0 || hidden_states.len() != expected[0] * expected[1] {
            return Err(Error::ShapeMismatch {
                expected: expected.to_vec(),
                got: vec![hidden_states.len()],
            });
        }
        Ok(())
    }

    /// `[num_tokens, num_experts]` logits computed on the host.
    ///
    /// # Errors
    /// [`Error::Configuration`] without gate weights; shape errors.
    pub fn compute_router_logits(&self, hidden_states: &[f32], num_tokens: usize) -> Result<Vec<f32>> {
        let gate = self.gate_weights()?;
        self.check_hidden(hidden_states, num_tokens)?;
        let (hidden, experts) = (self.config.hidden_size, self.config.num_experts);

        let mut logits = vec![0.0f32; num_tokens * experts];
        for (token, row) in hidden_states.chunks_exact(hidden).enumerate() {
            let out = &mut logits[token * experts..(token + 1) * experts];
            for (&h, gate_row) in row.iter().zip(gate.chunks_exact(experts)) {
                for (o, &g) in out.iter_mut().zip(gate_row) {
                    *o += h * g;
                }
            }
        }
        Ok(logits)
    }

    /// The same logits computed on `ctx` at full precision.
    ///
    /// # Errors
    /// [`Error::Configuration`] without gate weights; shape errors;
    /// [`Error::DeviceUnavailable`] if `ctx` has no usable device (never
    /// negotiated, or lost and not recovered); dispatch errors from `ctx`.
    pub async fn compute_router_logits_gpu<B: ComputeBackend>(
        &self,
        ctx: &GpuContext<B>,
        hidden_states: &[f32],
        num_tokens: usize,
    ) -> Result<Vec<f32>> {
        self.gpu_logits(ctx, hidden_states, num_tokens)
            .await
            .map_err(|e| match e {
                Error::DeviceNotInitialized => {
                    Error::DeviceUnavailable("router device not initialized".into())
                }
                Error::DeviceLost(reason) => {
                    Error::DeviceUnavailable(format!("router device lost: {reason}"))
                }
                other => other,
            })
    }

    async fn gpu_logits<B: ComputeBackend>(
        &self,
        ctx: &GpuContext<B>,
        hidden_states: &[f32],
        num_tokens: usize,
    ) -> Result<Vec<f32>> {
        let gate = self.gate_weights()?;
        self.check_hidden(hidden_states, num_tokens)?;
        let (hidden, experts) = (self.config.hidden_size, self.config.num_experts);

        let a = ctx.upload_f32(hidden_states, "moe-hidden")?;
        let b = match ctx.upload_f32(gate, "moe-gate") {
            Ok(b) => b,
            Err(e) => {
                ctx.release_buffer(a);
                return Err(e);
            }
        };
        let full_precision = MatmulOptions {
            prefer_f16: Some(false),
            ..MatmulOptions::default()
        };
        let logits = match ctx.run_matmul(&a, &b, num_tokens, experts, hidden, full_precision).await {
            Ok(out) => {
                let read = ctx.read_f32(&out, num_tokens * experts).await;
                ctx.release_buffer(out);
                read
            }
            Err(e) => Err(e),
        };
        ctx.release_buffer(a);
        ctx.release_buffer(b);
        logits
    }

    /// Softmax over one token's logits, then the `top_k` most probable
    /// experts. Ties go to the lower expert index.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] unless `logits` has `num_experts` entries.
    pub fn select_experts_for_token(&self, logits: &[f32]) -> Result<ExpertSelection> {
        if logits.len() != self.config.num_experts {
            return Err(Error::ShapeMismatch {
                expected: vec![self.config.num_experts],
                got: vec![logits.len()],
            });
        }
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
        let sum: f32 = exps.iter().sum();

        let mut ranked: Vec<(usize, f32)> = exps.iter().map(|&e| e / sum).enumerate().collect();
        // sort_by is stable, so equal probabilities keep index order.
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(self.config.top_k);

        let mut weights: Vec<f32> = ranked.iter().map(|&(_, p)| p).collect();
        if self.config.normalize_weights {
            let total: f32 = weights.iter().sum();
            if total > 0.0 {
                for w in &mut weights {
                    *w /= total;
                }
            }
        }
        Ok(ExpertSelection {
            experts: ranked.iter().map(|&(e, _)| e).collect(),
            weights,
            logits: logits.to_vec(),
        })
    }

    fn select_all(&mut self, logits: &[f32]) -> Result<Vec<ExpertSelection>> {
        let selections = logits
            .chunks_exact(self.config.num_experts)
            .map(|row| self.select_experts_for_token(row))
            .collect::<Result<Vec<_>>>()?;
        for selection in &selections {
            for &expert in &selection.experts {
                self.stats.expert_counts[expert] += 1;
            }
        }
        self.stats.total_tokens += selections.len() as u64;
        Ok(selections)
    }

    /// Route `num_tokens` tokens on the host, updating the load statistics.
    ///
    /// # Errors
    /// See [`compute_router_logits`](Self::compute_router_logits).
    pub fn route(&mut self, hidden_states: &[f32], num_tokens: usize) -> Result<Vec<ExpertSelection>> {
        let logits = self.compute_router_logits(hidden_states, num_tokens)?;
        self.select_all(&logits)
    }

    /// Route with GPU logits.
    ///
    /// # Errors
    /// See [`compute_router_logits_gpu`](Self::compute_router_logits_gpu).
    pub async fn route_gpu<B: ComputeBackend>(
        &mut self,
        ctx: &GpuContext<B>,
        hidden_states: &[f32],
        num_tokens: usize,
    ) -> Result<Vec<ExpertSelection>> {
        let logits = self
            .compute_router_logits_gpu(ctx, hidden_states, num_tokens)
            .await?;
        self.select_all(&logits)
    }

    /// Route on `ctx` when one is given and its device is usable, otherwise
    /// on the host.
    ///
    /// # Errors
    /// Configuration and shape errors; dispatch errors other than device
    /// unavailability.
    pub async fn route_auto<B: ComputeBackend>(
        &mut self,
        ctx: Option<&GpuContext<B>>,
        hidden_states: &[f32],
        num_tokens: usize,
    ) -> Result<Vec<ExpertSelection>> {
        let Some(ctx) = ctx else {
            return self.route(hidden_states, num_tokens);
        };
        match self
            .compute_router_logits_gpu(ctx, hidden_states, num_tokens)
            .await
        {
            Ok(logits) => self.select_all(&logits),
            Err(e @ Error::DeviceUnavailable(_)) => {
                tracing::warn!("GPU routing unavailable ({e}), routing on the host");
                self.route(hidden_states, num_tokens)
            }
            Err(e) => Err(e),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &LoadBalanceStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = LoadBalanceStats::new(self.config.num_experts);
    }

    /// `E * sum_i (f_i - 1/E)^2`, where `f_i` is expert `i`'s share of all
    /// selections so far. Zero for perfectly even routing or no routing.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute_load_balance_loss(&self) -> f32 {
        let assignments: u64 = self.stats.expert_counts.iter().sum();
        if assignments == 0 {
            return 0.0;
        }
        let experts = self.config.num_experts as f32;
        let ideal = 1.0 / experts;
        let deviation: f32 = self
            .stats
            .expert_counts
            .iter()
            .map(|&c| {
                let d = c as f32 / assignments as f32 - ideal;
                d * d
            })
            .sum();
        experts * deviation
    }
}

/// Group tokens by the experts they were routed to.
///
/// # Errors
/// [`Error::InvalidShape`] if a selection names an expert `>= num_experts`.
pub fn create_expert_execution_plan(
    selections: &[ExpertSelection],
    num_experts: usize,
) -> Result<ExpertExecutionPlan> {
    let mut plan = ExpertExecutionPlan::new();
    for (token, selection) in selections.iter().enumerate() {
        for (&expert, &weight) in selection.experts.iter().zip(&selection.weights) {
            if expert >= num_experts {
                return Err(Error::InvalidShape(format!(
                    "token {token} routed to expert {expert} of {num_experts}"
                )));
            }
            let entry = plan.entry(expert).or_default();
            entry.token_indices.push(token);
            entry.weights.push(weight);
        }
    }
    Ok(plan)
}

/// Weighted sum of expert outputs per token.
///
/// `expert_outputs[e]` holds `[n_e, hidden_size]` rows in the order of the
/// execution plan, i.e. one row per token routed to `e`, ascending by token.
///
/// # Errors
/// [`Error::InvalidShape`] if a selected expert has no output,
/// [`Error::ShapeMismatch`] if an output has too few rows.
pub fn combine_expert_outputs(
    expert_outputs: &BTreeMap<usize, Vec<f32>>,
    selections: &[ExpertSelection],
    hidden_size: usize,
) -> Result<Vec<f32>> {
    let mut output = vec![0.0f32; selections.len() * hidden_size];
    let mut cursors: BTreeMap<usize, usize> = BTreeMap::new();

    for (token, selection) in selections.iter().enumerate() {
        let out = &mut output[token * hidden_size..(token + 1) * hidden_size];
        for (&expert, &weight) in selection.experts.iter().zip(&selection.weights) {
            let rows = expert_outputs
                .get(&expert)
                .ok_or_else(|| Error::InvalidShape(format!("no output for expert {expert}")))?;
            let cursor = cursors.entry(expert).or_insert(0);
            let start = *cursor * hidden_size;
            let row = rows.get(start..start + hidden_size).ok_or_else(|| {
                Error::ShapeMismatch {
                    expected: vec![*cursor + 1, hidden_size],
                    got: vec![rows.len()],
                }
            })?;
            *cursor += 1;
            for (o, &r) in out.iter_mut().zip(row) {
                *o += weight * r;
            }
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(num_experts: usize, top_k: usize) -> MoeRouter {
        MoeRouter::new(MoeConfig {
            num_experts,
            top_k,
            hidden_size: 2,
            normalize_weights: true,
        })
        .unwrap()
    }

    #[test]
    fn test_top_k_selection() {
        let r = router(4, 2);
        let sel = r.select_experts_for_token(&[1.0, 2.0, 3.0, 0.0]).unwrap();
        assert_eq!(sel.experts, vec![2, 1]);
        let sum: f32 = sel.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(sel.weights[0] > sel.weights[1]);
        assert_eq!(sel.logits, vec![1.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_ties_prefer_lower_index() {
        let r = router(4, 2);
        let sel = r.select_experts_for_token(&[0.5, 1.0, 1.0, 1.0]).unwrap();
        assert_eq!(sel.experts, vec![1, 2]);
    }

    #[test]
    fn test_unnormalized_weights_are_probabilities() {
        let r = MoeRouter::new(MoeConfig {
            num_experts: 2,
            top_k: 1,
            hidden_size: 1,
            normalize_weights: false,
        })
        .unwrap();
        let sel = r.select_experts_for_token(&[0.0, 0.0]).unwrap();
        assert_eq!(sel.experts, vec![0]);
        assert!((sel.weights[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_large_logits_are_stable() {
        let r = router(3, 1);
        let sel = r.select_experts_for_token(&[1000.0, 999.0, -1000.0]).unwrap();
        assert_eq!(sel.experts, vec![0]);
        assert!(sel.weights[0].is_finite());
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(
            MoeRouter::new(MoeConfig {
                num_experts: 4,
                top_k: 5,
                hidden_size: 8,
                normalize_weights: true
            }),
            Err(Error::Configuration(_))
        ));
        let config: MoeConfig =
            serde_json::from_str(r#"{"num_experts":8,"top_k":2,"hidden_size":16}"#).unwrap();
        assert!(config.normalize_weights);
    }

    #[test]
    fn test_route_without_weights_fails() {
        let mut r = router(4, 2);
        let err = r.route(&[1.0, 2.0], 1).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_route_accumulates_stats() {
        let mut r = router(2, 1);
        // Column 0 scores h[0], column 1 scores h[1].
        r.load_gate_weights(vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let sel = r.route(&[5.0, 0.0, 0.0, 5.0, 5.0, 0.0], 3).unwrap();
        assert_eq!(sel[0].experts, vec![0]);
        assert_eq!(sel[1].experts, vec![1]);
        assert_eq!(r.stats().expert_counts, vec![2, 1]);
        assert_eq!(r.stats().total_tokens, 3);
        assert!(r.compute_load_balance_loss() > 0.0);

        r.route(&[0.0, 5.0], 1).unwrap();
        assert_eq!(r.stats().expert_counts, vec![2, 2]);
        assert_eq!(r.compute_load_balance_loss(), 0.0);

        r.reset_stats();
        assert_eq!(r.stats().total_tokens, 0);
    }

    #[test]
    fn test_loss_grows_with_imbalance() {
        let mut r = router(4, 1);
        let mut losses = Vec::new();
        for counts in [[2, 2, 2, 2], [3, 2, 2, 1], [5, 1, 1, 1], [8, 0, 0, 0]] {
            r.stats.expert_counts = counts.to_vec();
            losses.push(r.compute_load_balance_loss());
        }
        assert_eq!(losses[0], 0.0);
        assert!(losses.windows(2).all(|w| w[0] < w[1]), "{losses:?}");
    }

    #[test]
    fn test_plan_and_combine() {
        let selections = vec![
            ExpertSelection {
                experts: vec![1, 0],
                weights: vec![0.75, 0.25],
                logits: vec![],
            },
            ExpertSelection {
                experts: vec![1, 2],
                weights: vec![0.5, 0.5],
                logits: vec![],
            },
        ];
        let plan = create_expert_execution_plan(&selections, 3).unwrap();
        assert_eq!(plan[&1].token_indices, vec![0, 1]);
        assert_eq!(plan[&1].weights, vec![0.75, 0.5]);
        assert_eq!(plan[&0].token_indices, vec![0]);
        assert!(!plan.contains_key(&3));

        let outputs: BTreeMap<usize, Vec<f32>> = [
            (0, vec![4.0, 4.0]),
            (1, vec![1.0, 1.0, 2.0, 2.0]),
            (2, vec![10.0, 0.0]),
        ]
        .into_iter()
        .collect();
        let combined = combine_expert_outputs(&outputs, &selections, 2).unwrap();
        assert_eq!(combined, vec![1.75, 1.75, 6.0, 1.0]);

        assert!(create_expert_execution_plan(&selections, 2).is_err());
    }
}
