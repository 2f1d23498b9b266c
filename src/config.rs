use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// The feed-forward sublayer projects down to `n_embd / FFN_BOTTLENECK` units.
pub const FFN_BOTTLENECK: usize = 16;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub n_head: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    /// Maximum sequence length accepted by the model.
    pub seq_len: usize,
    /// Carried for configuration compatibility; the embedding stem applies no dropout.
    pub embd_pdrop: f32,
    pub resid_pdrop: f32,
    pub attn_pdrop: f32,
    pub vocab_size: usize,
    pub norm_eps: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n_head: 12,
            n_embd: 768,
            n_layer: 12,
            seq_len: 32,
            embd_pdrop: 0.5,
            resid_pdrop: 0.5,
            attn_pdrop: 0.5,
            vocab_size: 1024,
            norm_eps: 1e-5,
        }
    }
}

impl Config {
    /// Reads a (possibly partial) JSON config; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    /// Rejects a width that does not split evenly across the heads.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.n_head > 0 && self.n_embd % self.n_head == 0,
            "n_embd ({}) must be divisible by n_head ({})",
            self.n_embd,
            self.n_head
        );
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    pub fn ffn_dim(&self) -> usize {
        self.n_embd / FFN_BOTTLENECK
    }

    /// A small configuration that keeps unit tests fast.
    #[cfg(test)]
    pub(crate) fn tiny() -> Self {
        Self {
            n_head: 4,
            n_embd: 32,
            n_layer: 2,
            seq_len: 8,
            embd_pdrop: 0.0,
            resid_pdrop: 0.0,
            attn_pdrop: 0.0,
            vocab_size: 16,
            norm_eps: 1e-5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.head_dim(), 64);
        assert_eq!(cfg.ffn_dim(), 48);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_indivisible_width() {
        let cfg = Config {
            n_head: 5,
            ..Config::tiny()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("divisible"));
    }

    #[test]
    fn accepts_degenerate_sizes() {
        let cfg = Config {
            n_head: 2,
            n_embd: 8,
            n_layer: 0,
            ..Config::tiny()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.ffn_dim(), 0);
        assert!(Config { n_head: 0, ..Config::tiny() }.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"n_layer": 2, "seq_len": 16}"#).unwrap();
        assert_eq!(cfg.n_layer, 2);
        assert_eq!(cfg.seq_len, 16);
        assert_eq!(cfg.n_embd, 768);
        assert_eq!(cfg.vocab_size, 1024);
    }
}
