use std::path::PathBuf;

use anyhow::Result;
use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device,
};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;

use crate::{
    batch::Batch,
    config::Config,
    model::LanguageModel,
    train::{train, TrainConfig},
    utils::Mode,
    vocab::Vocab,
};

mod batch;
mod config;
mod model;
mod train;
mod utils;
mod vocab;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// Run on CPU rather than on GPU.
    #[arg(long, default_value = "false")]
    cpu: bool,

    /// JSON file overriding the default model configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed for the dropout masks.
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Run the forward pass in evaluation mode (no dropout).
    #[arg(long)]
    eval: bool,

    /// Gradient descent steps to run after the first backward pass.
    #[arg(long, default_value = "0")]
    steps: usize,

    /// The learning rate for gradient descent.
    #[arg(long, default_value = "0.01")]
    learning_rate: f64,

    /// Texts forming the batch.
    #[arg(default_values_t = [
        "Мама мыла раму".to_string(),
        "Компьютер сгенерировал длинный текст".to_string(),
    ])]
    texts: Vec<String>,
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry()
            .with(chrome_layer)
            .with(fmt::layer().with_filter(filter))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_filter(filter))
            .init();
        None
    };

    let config = match &args.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    config.validate()?;
    tracing::info!(?config, "model configuration");

    let device = if args.cpu {
        Device::Cpu
    } else if cuda_is_available() {
        Device::new_cuda(0)?
    } else if metal_is_available() {
        Device::new_metal(0)?
    } else {
        Device::Cpu
    };

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = LanguageModel::new(&config, vb)?;

    let vocab = Vocab::demo();
    let batch = Batch::from_texts(&args.texts, &vocab, config.seq_len, &device)?;

    let mut mode = if args.eval {
        Mode::Eval
    } else {
        Mode::train(args.seed)
    };
    tracing::info!(
        train = mode.is_train(),
        batch = args.texts.len(),
        vocab = vocab.len(),
        "forward pass"
    );

    let (logits, loss) = model.forward(&batch.inputs, &batch.targets, &mut mode)?;
    println!("{:?}", loss.dims());
    let mean = loss.mean_all()?;
    let grads = mean.backward()?;
    tracing::debug!(
        tensors = varmap.all_vars().iter().filter(|v| grads.get(v).is_some()).count(),
        "backward pass"
    );
    println!("{logits}\n{loss}");

    if args.steps > 0 {
        let losses = train(
            &model,
            &varmap,
            &batch,
            &mut mode,
            TrainConfig {
                steps: args.steps,
                learning_rate: args.learning_rate,
                log_every: 1,
            },
        )?;
        if let (Some(first), Some(last)) = (losses.first(), losses.last()) {
            tracing::info!(first, last, "training finished");
        }
    }

    Ok(())
}
