//! Packed uniform layouts.
//!
//! Each kernel reads its parameters from a fixed little-endian struct. The
//! field order and byte offsets here must match the `Params` structs in the
//! WGSL sources exactly. All layouts are 16 or 32 bytes: four-byte fields,
//! padded to a 16-byte multiple.

use crate::{Error, Result};

/// Little-endian uniform encoder.
#[derive(Debug, Default)]
pub struct UniformWriter {
    bytes: Vec<u8>,
}

impl UniformWriter {
    #[must_use]
    pub fn with_capacity(size: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(size),
        }
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn f32(&mut self, value: f32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.u32(u32::from(value))
    }

    pub fn pad(&mut self, words: usize) -> &mut Self {
        self.bytes.resize(self.bytes.len() + words * 4, 0);
        self
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Little-endian uniform decoder, used by host-side kernel execution.
#[derive(Debug)]
pub struct UniformReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> UniformReader<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn word(&mut self) -> Result<[u8; 4]> {
        let end = self.offset + 4;
        let word = self
            .bytes
            .get(self.offset..end)
            .and_then(|s| <[u8; 4]>::try_from(s).ok())
            .ok_or_else(|| {
                Error::InvalidShape(format!(
                    "uniform buffer too short: need {end} bytes, have {}",
                    self.bytes.len()
                ))
            })?;
        self.offset = end;
        Ok(word)
    }

    /// # Errors
    /// Returns [`Error::InvalidShape`] if the buffer is exhausted
    pub fn u32(&mut self) -> Result<u32> {
        self.word().map(u32::from_le_bytes)
    }

    /// # Errors
    /// Returns [`Error::InvalidShape`] if the buffer is exhausted
    pub fn f32(&mut self) -> Result<f32> {
        self.word().map(f32::from_le_bytes)
    }

    /// # Errors
    /// Returns [`Error::InvalidShape`] if the buffer is exhausted
    pub fn bool(&mut self) -> Result<bool> {
        self.u32().map(|v| v != 0)
    }

    /// # Errors
    /// Returns [`Error::InvalidShape`] if the buffer is exhausted
    pub fn skip(&mut self, words: usize) -> Result<()> {
        for _ in 0..words {
            self.word()?;
        }
        Ok(())
    }
}

/// A kernel parameter block with a fixed byte layout.
pub trait Uniforms: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    fn write(&self, w: &mut UniformWriter);

    /// # Errors
    /// Returns [`Error::InvalidShape`] if `r` holds fewer than `SIZE` bytes
    fn read(r: &mut UniformReader<'_>) -> Result<Self>;

    #[must_use]
    fn to_bytes(&self) -> Vec<u8> {
        let mut w = UniformWriter::with_capacity(Self::SIZE);
        self.write(&mut w);
        let bytes = w.finish();
        debug_assert_eq!(bytes.len(), Self::SIZE);
        bytes
    }

    /// # Errors
    /// Returns [`Error::InvalidShape`] if `bytes` is too short
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read(&mut UniformReader::new(bytes))
    }
}

/// `u32 M, u32 N, u32 K, f32 alpha`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatmulUniforms {
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub alpha: f32,
}

impl Uniforms for MatmulUniforms {
    const SIZE: usize = 16;

    fn write(&self, w: &mut UniformWriter) {
        w.u32(self.m).u32(self.n).u32(self.k).f32(self.alpha);
    }

    fn read(r: &mut UniformReader<'_>) -> Result<Self> {
        Ok(Self {
            m: r.u32()?,
            n: r.u32()?,
            k: r.u32()?,
            alpha: r.f32()?,
        })
    }
}

/// `u32 numBlocks, u32 outputOffset, u32 pad, u32 pad`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequantUniforms {
    pub num_blocks: u32,
    pub output_offset: u32,
}

impl Uniforms for DequantUniforms {
    const SIZE: usize = 16;

    fn write(&self, w: &mut UniformWriter) {
        w.u32(self.num_blocks).u32(self.output_offset).pad(2);
    }

    fn read(r: &mut UniformReader<'_>) -> Result<Self> {
        let u = Self {
            num_blocks: r.u32()?,
            output_offset: r.u32()?,
        };
        r.skip(2)?;
        Ok(u)
    }
}

/// `u32 seqLen, u32 kvLen, u32 numHeads, u32 numKVHeads, u32 headDim,
/// f32 scale, u32 causal, u32 hasMask`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionUniforms {
    pub seq_len: u32,
    pub kv_len: u32,
    pub num_heads: u32,
    pub num_kv_heads: u32,
    pub head_dim: u32,
    pub scale: f32,
    pub causal: bool,
    pub has_mask: bool,
}

impl Uniforms for AttentionUniforms {
    const SIZE: usize = 32;

    fn write(&self, w: &mut UniformWriter) {
        w.u32(self.seq_len)
            .u32(self.kv_len)
            .u32(self.num_heads)
            .u32(self.num_kv_heads)
            .u32(self.head_dim)
            .f32(self.scale)
            .bool(self.causal)
            .bool(self.has_mask);
    }

    fn read(r: &mut UniformReader<'_>) -> Result<Self> {
        Ok(Self {
            seq_len: r.u32()?,
            kv_len: r.u32()?,
            num_heads: r.u32()?,
            num_kv_heads: r.u32()?,
            head_dim: r.u32()?,
            scale: r.f32()?,
            causal: r.bool()?,
            has_mask: r.bool()?,
        })
    }
}

/// `u32 batchSize, u32 hiddenSize, f32 eps, u32 pad`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmsNormUniforms {
    pub batch_size: u32,
    pub hidden_size: u32,
    pub eps: f32,
}

impl Uniforms for RmsNormUniforms {
    const SIZE: usize = 16;

    fn write(&self, w: &mut UniformWriter) {
        w.u32(self.batch_size)
            .u32(self.hidden_size)
            .f32(self.eps)
            .pad(1);
    }

    fn read(r: &mut UniformReader<'_>) -> Result<Self> {
        let u = Self {
            batch_size: r.u32()?,
            hidden_size: r.u32()?,
            eps: r.f32()?,
        };
        r.skip(1)?;
        Ok(u)
    }
}

/// `u32 batchSize, u32 size, f32 temperature, u32 pad`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftmaxUniforms {
    pub batch_size: u32,
    pub size: u32,
    pub temperature: f32,
}

impl Uniforms for SoftmaxUniforms {
    const SIZE: usize = 16;

    fn write(&self, w: &mut UniformWriter) {
        w.u32(self.batch_size)
            .u32(self.size)
            .f32(self.temperature)
            .pad(1);
    }

    fn read(r: &mut UniformReader<'_>) -> Result<Self> {
        let u = Self {
            batch_size: r.u32()?,
            size: r.u32()?,
            temperature: r.f32()?,
        };
        r.skip(1)?;
        Ok(u)
    }
}

/// `u32 seqLen, u32 numHeads, u32 headDim, u32 startPos, f32 ropeBase,
/// f32 ropeScale, u32 pad, u32 pad`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeUniforms {
    pub seq_len: u32,
    pub num_heads: u32,
    pub head_dim: u32,
    pub start_pos: u32,
    pub rope_base: f32,
    pub rope_scale: f32,
}

impl Uniforms for RopeUniforms {
    const SIZE: usize = 32;

    fn write(&self, w: &mut UniformWriter) {
        w.u32(self.seq_len)
            .u32(self.num_heads)
            .u32(self.head_dim)
            .u32(self.start_pos)
            .f32(self.rope_base)
            .f32(self.rope_scale)
            .pad(2);
    }

    fn read(r: &mut UniformReader<'_>) -> Result<Self> {
        let u = Self {
            seq_len: r.u32()?,
            num_heads: r.u32()?,
            head_dim: r.u32()?,
            start_pos: r.u32()?,
            rope_base: r.f32()?,
            rope_scale: r.f32()?,
        };
        r.skip(2)?;
        Ok(u)
    }
}

/// `u32 size, u32 pad, u32 pad, u32 pad`, shared by SiLU and residual add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementwiseUniforms {
    pub size: u32,
}

impl Uniforms for ElementwiseUniforms {
    const SIZE: usize = 16;

    fn write(&self, w: &mut UniformWriter) {
        w.u32(self.size).pad(3);
    }

    fn read(r: &mut UniformReader<'_>) -> Result<Self> {
        let u = Self { size: r.u32()? };
        r.skip(3)?;
        Ok(u)
    }
}

/// `u32 numTokens, u32 hiddenSize, u32 vocabSize, u32 pad`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatherUniforms {
    pub num_tokens: u32,
    pub hidden_size: u32,
    pub vocab_size: u32,
}

impl Uniforms for GatherUniforms {
    const SIZE: usize = 16;

    fn write(&self, w: &mut UniformWriter) {
        w.u32(self.num_tokens)
            .u32(self.hidden_size)
            .u32(self.vocab_size)
            .pad(1);
    }

    fn read(r: &mut UniformReader<'_>) -> Result<Self> {
        let u = Self {
            num_tokens: r.u32()?,
            hidden_size: r.u32()?,
            vocab_size: r.u32()?,
        };
        r.skip(1)?;
        Ok(u)
    }
}
