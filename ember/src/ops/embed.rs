//! Embedding lookup

use crate::backend::ComputeBackend;
use crate::context::{DeviceBuffer, GpuContext};
use crate::dispatch::{Grid, Launch};
use crate::kernels::KernelKey;
use crate::ops::{bytes, dim, expect_elems};
use crate::uniforms::{GatherUniforms, Uniforms};
use crate::Result;

impl<B: ComputeBackend> GpuContext<B> {
    pub(crate) fn plan_gather(
        &self,
        num_tokens: usize,
        hidden_size: usize,
        vocab_size: usize,
    ) -> Result<Launch> {
        let tokens = dim(num_tokens, "num_tokens")?;
        let hidden = dim(hidden_size, "hidden_size")?;
        Ok(Launch {
            kernel: KernelKey::Gather,
            uniforms: GatherUniforms {
                num_tokens: tokens,
                hidden_size: hidden,
                vocab_size: dim(vocab_size, "vocab_size")?,
            }
            .to_bytes(),
            output_size: bytes(num_tokens * hidden_size),
            output_label: "embeddings",
            grid: Grid::Extent([hidden, tokens, 1]),
            work: (num_tokens * hidden_size) as u64,
        })
    }

    /// Copy row `ids[t]` of `table` (`[vocab_size, hidden_size]`) to row `t`
    /// of the output. Ids outside the vocabulary produce a zero row.
    ///
    /// # Errors
    /// Shape and dispatch errors.
    pub async fn run_gather(
        &self,
        table: &DeviceBuffer<B>,
        ids: &DeviceBuffer<B>,
        num_tokens: usize,
        hidden_size: usize,
        vocab_size: usize,
    ) -> Result<DeviceBuffer<B>> {
        let launch = self.plan_gather(num_tokens, hidden_size, vocab_size)?;
        expect_elems(table, &[vocab_size, hidden_size])?;
        expect_elems(ids, &[num_tokens])?;
        self.launch(launch, &[table, ids], None).await
    }
}
