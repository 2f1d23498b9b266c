use anyhow::Result;
use candle_nn::{Optimizer, VarMap, SGD};

use crate::batch::Batch;
use crate::model::LanguageModel;
use crate::utils::Mode;

pub struct TrainConfig {
    pub steps: usize,
    pub learning_rate: f64,
    pub log_every: usize,
}

/// Plain gradient descent on a single batch.
///
/// Each step reduces the per-position loss to its mean before backprop.
/// Returns the mean loss seen at every step.
pub fn train(
    model: &LanguageModel,
    varmap: &VarMap,
    batch: &Batch,
    mode: &mut Mode,
    cfg: TrainConfig,
) -> Result<Vec<f32>> {
    let mut sgd = SGD::new(varmap.all_vars(), cfg.learning_rate)?;
    let mut losses = Vec::with_capacity(cfg.steps);

    for step in 0..cfg.steps {
        let (_, loss) = model.forward(&batch.inputs, &batch.targets, mode)?;
        let loss = loss.mean_all()?;
        sgd.backward_step(&loss)?;

        let loss = loss.to_scalar::<f32>()?;
        if cfg.log_every > 0 && step % cfg.log_every == 0 {
            tracing::info!(step, loss, "train step");
        }
        losses.push(loss);
    }

    Ok(losses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::vocab::Vocab;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    #[test]
    fn gradient_descent_lowers_loss() -> Result<()> {
        let cfg = Config::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = LanguageModel::new(&cfg, vb)?;
        let batch = Batch::from_texts(
            &["Мама мыла раму", "Компьютер сгенерировал текст"],
            &Vocab::demo(),
            cfg.seq_len,
            &Device::Cpu,
        )?;

        let losses = train(
            &model,
            &varmap,
            &batch,
            &mut Mode::Eval,
            TrainConfig {
                steps: 5,
                learning_rate: 0.05,
                log_every: 0,
            },
        )?;

        assert_eq!(losses.len(), 5);
        assert!((losses[0] - (cfg.vocab_size as f32).ln()).abs() < 1e-4);
        assert!(losses[4] < losses[0], "{losses:?}");
        Ok(())
    }

    #[test]
    fn zero_steps_record_no_losses() -> Result<()> {
        let cfg = Config::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = LanguageModel::new(&cfg, vb)?;
        let batch = Batch::from_texts(&["мама"], &Vocab::demo(), cfg.seq_len, &Device::Cpu)?;
        let losses = train(
            &model,
            &varmap,
            &batch,
            &mut Mode::train(1),
            TrainConfig {
                steps: 0,
                learning_rate: 0.1,
                log_every: 1,
            },
        )?;
        assert!(losses.is_empty());
        Ok(())
    }
}
