use anyhow::{ensure, Result};
use candle_core::{Module, Tensor, D};
use candle_nn::{Embedding, Init, Linear, VarBuilder};

use crate::config::Config;
use crate::utils::{scaled_dot_product, Dropout, Mode, ScaledDotProductCfg};

/// Builds a linear map whose weight and bias start at zero.
fn zeroed_linear(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", Init::Const(0.0))?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

struct LayerNorm {
    eps: f64,
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    pub fn load(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
        Ok(Self { eps, weight, bias })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_sub(&mean)?;
        let x_d = x
            .sqr()?
            .mean_keepdim(D::Minus1)?
            .broadcast_add(&Tensor::new(self.eps as f32, x.device())?.to_dtype(x.dtype())?)?
            .sqrt()?;
        let x = x
            .broadcast_div(&x_d)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?;
        Ok(x)
    }
}

struct Attention {
    key: Linear,
    query: Linear,
    value: Linear,
    proj: Linear,
    attn_drop: Dropout,
    resid_drop: Dropout,
    n_head: usize,
    head_dim: usize,
    span: tracing::Span,
}

impl Attention {
    /// Fails when `n_embd` does not split evenly across `n_head` heads. The
    /// error is returned rather than panicking; callers treat it as fatal.
    pub fn load(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        ensure!(cfg.n_head > 0, "n_head must be positive");
        ensure!(
            cfg.n_embd % cfg.n_head == 0,
            "n_embd ({}) must be divisible by n_head ({})",
            cfg.n_embd,
            cfg.n_head
        );
        let dim = cfg.n_embd;
        let key = zeroed_linear(dim, dim, true, vb.pp("key"))?;
        let query = zeroed_linear(dim, dim, true, vb.pp("query"))?;
        let value = zeroed_linear(dim, dim, true, vb.pp("value"))?;
        let proj = zeroed_linear(dim, dim, true, vb.pp("proj"))?;
        Ok(Self {
            key,
            query,
            value,
            proj,
            attn_drop: Dropout::new(cfg.attn_pdrop),
            resid_drop: Dropout::new(cfg.resid_pdrop),
            n_head: cfg.n_head,
            head_dim: cfg.head_dim(),
            span: tracing::span!(tracing::Level::TRACE, "attn"),
        })
    }

    pub fn forward(&self, x: &Tensor, mode: &mut Mode) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (bsz, seqlen, dim) = x.dims3()?;

        // (b, t, c) -> (b, t, h, d) -> (b, h, t, d)
        let split_heads = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((bsz, seqlen, self.n_head, self.head_dim))?
                .transpose(1, 2)?)
        };
        let k = split_heads(self.key.forward(x)?)?;
        let q = split_heads(self.query.forward(x)?)?;
        let v = split_heads(self.value.forward(x)?)?;

        let y = scaled_dot_product(
            &q,
            &k,
            &v,
            &ScaledDotProductCfg {
                dropout: self.attn_drop,
            },
            mode,
        )?;

        let y = y.transpose(1, 2)?.contiguous()?.reshape((bsz, seqlen, dim))?;
        let y = self.proj.forward(&y)?;
        self.resid_drop.forward(&y, mode)
    }
}

/// Bottleneck feed-forward: down to `n_embd / 16`, back up, then dropout.
/// There is no activation between the two projections.
struct FeedForward {
    w1: Linear,
    w2: Linear,
    drop: Dropout,
}

impl FeedForward {
    pub fn load(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let w1 = zeroed_linear(cfg.n_embd, cfg.ffn_dim(), true, vb.pp("w1"))?;
        let w2 = zeroed_linear(cfg.ffn_dim(), cfg.n_embd, true, vb.pp("w2"))?;
        Ok(Self {
            w1,
            w2,
            drop: Dropout::new(cfg.resid_pdrop),
        })
    }

    pub fn forward(&self, x: &Tensor, mode: &mut Mode) -> Result<Tensor> {
        let x = x.apply(&self.w1)?.apply(&self.w2)?;
        self.drop.forward(&x, mode)
    }
}

struct TransformerBlock {
    attention: Attention,
    ffn: FeedForward,
    attention_norm: LayerNorm,
    ffn_norm: LayerNorm,
    span: tracing::Span,
}

impl TransformerBlock {
    pub fn load(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let attention = Attention::load(cfg, vb.pp("attn"))?;
        let ffn = FeedForward::load(cfg, vb.pp("mlp"))?;
        let attention_norm = LayerNorm::load(cfg.n_embd, cfg.norm_eps, vb.pp("norm1"))?;
        let ffn_norm = LayerNorm::load(cfg.n_embd, cfg.norm_eps, vb.pp("norm2"))?;
        Ok(Self {
            attention,
            ffn,
            attention_norm,
            ffn_norm,
            span: tracing::span!(tracing::Level::TRACE, "block"),
        })
    }

    pub fn forward(&self, x: &Tensor, mode: &mut Mode) -> Result<Tensor> {
        let _enter = self.span.enter();
        let h = (x + self
            .attention
            .forward(&self.attention_norm.forward(x)?, mode)?)?;
        let out = (&h + self.ffn.forward(&self.ffn_norm.forward(&h)?, mode)?)?;
        Ok(out)
    }
}

pub struct LanguageModel {
    tok_embeddings: Embedding,
    layers: Vec<TransformerBlock>,
    norm: LayerNorm,
    head: Linear,
    seq_len: usize,
    span: tracing::Span,
}

impl LanguageModel {
    /// Fails, like [`Attention::load`], only on a width that heads cannot split.
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;

        let embeddings = vb.pp("tok_emb").get_with_hints(
            (cfg.vocab_size, cfg.n_embd),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        let tok_embeddings = Embedding::new(embeddings, cfg.n_embd);
        let layers = (0..cfg.n_layer)
            .map(|i| TransformerBlock::load(cfg, vb.pp(format!("blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm = LayerNorm::load(cfg.n_embd, cfg.norm_eps, vb.pp("norm_f"))?;
        let head = zeroed_linear(cfg.n_embd, cfg.vocab_size, false, vb.pp("head"))?;

        tracing::debug!(
            n_layer = cfg.n_layer,
            n_head = cfg.n_head,
            n_embd = cfg.n_embd,
            vocab_size = cfg.vocab_size,
            "built language model"
        );

        Ok(Self {
            tok_embeddings,
            layers,
            norm,
            head,
            seq_len: cfg.seq_len,
            span: tracing::span!(tracing::Level::TRACE, "model"),
        })
    }

    /// Returns `(logits, loss)` with shapes `(b, t, vocab)` and `(b, t)`.
    ///
    /// `idx` and `targets` are `u32` tensors of shape `(b, t)` with `t` no
    /// larger than the configured maximum sequence length. A longer input is a
    /// precondition violation: it is returned as an error instead of a panic
    /// and is not meant to be recovered from.
    pub fn forward(
        &self,
        idx: &Tensor,
        targets: &Tensor,
        mode: &mut Mode,
    ) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let (_b, t) = idx.dims2()?;
        ensure!(
            t <= self.seq_len,
            "Cannot forward, sequence length {t} exceeds the model block size {}",
            self.seq_len
        );
        ensure!(
            targets.dims() == idx.dims(),
            "targets shape {:?} does not match inputs shape {:?}",
            targets.dims(),
            idx.dims()
        );

        let mut x = self.tok_embeddings.forward(idx)?;
        for layer in &self.layers {
            x = layer.forward(&x, mode)?;
        }
        let x = self.norm.forward(&x)?;
        let logits = self.head.forward(&x)?;
        let loss = cross_entropy_per_position(&logits, targets)?;
        Ok((logits, loss))
    }
}

/// Cross-entropy at every position, with no reduction.
///
/// `logits` is `(b, t, vocab)` and `targets` is `(b, t)`; the result is `(b, t)`.
pub fn cross_entropy_per_position(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let targets = targets.unsqueeze(D::Minus1)?.contiguous()?;
    let loss = log_probs.gather(&targets, D::Minus1)?.squeeze(D::Minus1)?.neg()?;
    Ok(loss)
}
