use anyhow::{ensure, Result};
use candle_core::{Tensor, D};
use rand::{distributions::Bernoulli, distributions::Distribution, rngs::StdRng, SeedableRng};

/// Whether a forward pass is regularized.
///
/// Training mode owns the random source that drives every dropout mask, so a
/// fixed seed reproduces the same masks for the same sequence of calls.
#[derive(Debug)]
pub enum Mode {
    Train(StdRng),
    Eval,
}

impl Mode {
    pub fn train(seed: u64) -> Self {
        Mode::Train(StdRng::seed_from_u64(seed))
    }

    pub fn is_train(&self) -> bool {
        matches!(self, Mode::Train(_))
    }
}

/// Inverted dropout: kept activations are scaled by `1 / (1 - p)`.
#[derive(Clone, Copy, Debug)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        Self { p }
    }

    pub fn forward(&self, xs: &Tensor, mode: &mut Mode) -> Result<Tensor> {
        let rng = match mode {
            Mode::Train(rng) if self.p > 0.0 => rng,
            _ => return Ok(xs.clone()),
        };
        if self.p >= 1.0 {
            return Ok(xs.zeros_like()?);
        }

        let keep = Bernoulli::new(1.0 - self.p as f64).map_err(candle_core::Error::wrap)?;
        let scale = 1.0 / (1.0 - self.p);
        let mask: Vec<f32> = (0..xs.elem_count())
            .map(|_| if keep.sample(rng) { scale } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(mask, xs.dims(), xs.device())?.to_dtype(xs.dtype())?;
        Ok(xs.mul(&mask)?)
    }
}

pub struct ScaledDotProductCfg {
    pub dropout: Dropout,
}

/// Multi-head dot-product attention without score normalization.
///
/// Scores are scaled by `1/sqrt(head_dim)` and dropout is applied to the raw
/// scores. There is no softmax and no causal mask: every position mixes the
/// values of every other position, future ones included.
pub fn scaled_dot_product(
    query: &Tensor, // (b, h, t, d)
    key: &Tensor,   // (b, h, t, d)
    value: &Tensor, // (b, h, t, d)
    cfg: &ScaledDotProductCfg,
    mode: &mut Mode,
) -> Result<Tensor> {
    let (bq, hq, _, dq) = query.dims4()?;
    let (bk, hk, tk, dk) = key.dims4()?;
    let (bv, hv, tv, dv) = value.dims4()?;
    ensure!(bq == bk && bq == bv, "Batch sizes must be equal");
    ensure!(hq == hk && hq == hv, "Head counts must be equal");
    ensure!(dq == dk && dq == dv, "Head dimensions must be equal");
    ensure!(tk == tv, "Key and value sequence lengths must be equal");

    let scale = 1.0 / (dk as f64).sqrt();

    // att = einsum(query, key, "b h n d, b h s d -> b h n s") / sqrt(d)
    let key_t = key.transpose(D::Minus2, D::Minus1)?.contiguous()?;
    let att = (query.contiguous()?.matmul(&key_t)? * scale)?;

    let att = cfg.dropout.forward(&att, mode)?;

    // out = einsum(att, value, "b h n s, b h s d -> b h n d")
    let out = att.matmul(&value.contiguous()?)?;
    Ok(out)
}
