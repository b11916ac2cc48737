// GenVQA - generative visual question answering
// Main entry point

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;

use genvqa::config::{load_config, Config};
use genvqa::data::{FsvqaSampler, GenVqaDataset, VqaDataset, SAMPLER_CHANNEL};
use genvqa::errors::wrap_error_with_suggestion;
use genvqa::logging::{FileRunLog, RunLog};
use genvqa::models::{
    build_model, select_device, AttentionKind, AttentionMethod, DecoderKind, EncoderKind,
    ModelConfig, RnnKind, TextCodec, TextTokenizer,
};
use genvqa::training::{train_channel, TrainerOptions, VqaTrainer};
use tracing_subscriber::prelude::*;

const DEFAULT_SEED: u64 = 8956;

#[derive(Parser, Debug)]
#[command(name = "genvqa")]
#[command(about = "Generative VQA: FSVQA subset sampling and answer-generator training", version)]
struct Cli {
    /// Path to a TOML config (default: ~/.genvqa/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample k annotation/question pairs into a cache directory
    Sample(SampleArgs),
    /// Train an answer generator
    Train(TrainArgs),
}

#[derive(Args, Debug)]
struct SampleArgs {
    /// FSVQA annotations JSON
    #[arg(long)]
    annotations: PathBuf,

    /// FSVQA questions JSON
    #[arg(long)]
    questions: PathBuf,

    /// Number of instances to sample
    #[arg(long)]
    k: usize,

    /// Output directory for annotations.pickle / questions.pickle
    #[arg(long = "out_dir")]
    out_dir: PathBuf,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Seeds weight initialisation, shuffling and teacher forcing
    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// rnn or bag (pretrained lxmert/visualbert are not available)
    #[arg(long = "encoder_type", default_value = "rnn")]
    encoder_type: EncoderKind,

    /// rnn, attn-rnn or transformer
    #[arg(long = "decoder_type", default_value = "rnn")]
    decoder_type: DecoderKind,

    /// lstm or gru
    #[arg(long = "rnn_type", default_value = "lstm")]
    rnn_type: RnnKind,

    #[arg(long = "num_rnn_layers", default_value_t = 1)]
    num_rnn_layers: usize,

    #[arg(long)]
    bidirectional: bool,

    /// bahdanau or luong
    #[arg(long = "attn_type", default_value = "bahdanau")]
    attn_type: AttentionKind,

    /// Luong scoring: dot, general or concat
    #[arg(long = "attn_method", default_value = "dot")]
    attn_method: AttentionMethod,

    #[arg(long, default_value_t = 12)]
    nheads: usize,

    #[arg(long = "num_transformer_layers", default_value_t = 6)]
    num_transformer_layers: usize,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long = "batch_size")]
    batch_size: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    /// Skip the validation split
    #[arg(long = "no_validation")]
    no_validation: bool,

    /// Force CPU even when CUDA is available
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let outcome = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Command::Sample(args) => run_sample(&config, args),
        Command::Train(args) => run_train(config, args),
    });

    if let Err(e) = outcome {
        eprintln!("{}", wrap_error_with_suggestion(&e));
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    // Check if debug logging should be enabled
    let show_debug = std::env::var("GENVQA_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    // Default: INFO level, can be overridden with RUST_LOG env var
    let env_filter = if show_debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Bridge log crate → tracing (tokenizers logs through `log`)
    tracing_log::LogTracer::init().ok();
}

fn run_sample(config: &Config, args: SampleArgs) -> Result<()> {
    let sampler = FsvqaSampler::load(&args.annotations, &args.questions)
        .context("Failed to load FSVQA corpus")?;
    let run_log = FileRunLog::new(&config.paths.logs_dir, SAMPLER_CHANNEL)?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let subset = sampler
        .select_and_save(args.k, &args.out_dir, &mut rng, &run_log)
        .context("Failed to sample FSVQA subset")?;

    println!(
        "Wrote {} annotations ({} distinct questions) to {}",
        subset.annotations.len(),
        subset.questions.len(),
        args.out_dir.display()
    );
    Ok(())
}

fn run_train(mut config: Config, args: TrainArgs) -> Result<()> {
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if let Some(lr) = args.lr {
        config.training.learning_rate = lr;
    }

    let device = select_device(config.training.use_cuda && !args.cpu);
    if let Err(e) = device.set_seed(args.seed) {
        // CPU has no seedable generator; weights are reseeded in build_model
        tracing::debug!("Device RNG not seeded: {}", e);
    }

    let tokenizer = TextTokenizer::from_file(&config.model.tokenizer_path)?;
    let special = tokenizer.special_tokens();
    let codec: Arc<dyn TextCodec> = Arc::new(tokenizer);

    let model_config = ModelConfig {
        vocab_size: codec.vocab_size(),
        hidden_dim: config.model.hidden_dim,
        feature_dim: config.model.feature_dim,
        max_answer_len: config.model.max_answer_len,
        pad_id: special.pad,
        bos_id: special.bos,
        eos_id: special.eos,
        encoder: args.encoder_type,
        decoder: args.decoder_type,
        rnn_type: args.rnn_type,
        num_rnn_layers: args.num_rnn_layers,
        bidirectional: args.bidirectional,
        attn_type: args.attn_type,
        attn_method: args.attn_method,
        nheads: args.nheads,
        num_transformer_layers: args.num_transformer_layers,
        seed: args.seed,
    };
    let model = build_model(&model_config, &device)?;

    let data = &config.data;
    let train_dset: Arc<dyn VqaDataset> = Arc::new(GenVqaDataset::open(
        &data.train_cache_dir,
        &data.train_image_dir,
        codec.clone(),
        config.model.max_answer_len,
    )?);
    let val_dset: Option<Arc<dyn VqaDataset>> = if args.no_validation {
        None
    } else {
        Some(Arc::new(GenVqaDataset::open(
            &data.val_cache_dir,
            &data.val_image_dir,
            codec.clone(),
            config.model.max_answer_len,
        )?))
    };

    let run_id = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let run_log: Arc<dyn RunLog> =
        Arc::new(FileRunLog::new(&config.paths.logs_dir, train_channel(&run_id))?);

    let mut trainer = VqaTrainer::new(
        run_id,
        model,
        codec,
        train_dset,
        val_dset,
        TrainerOptions::from_config(&config, args.seed),
        device,
        run_log,
    )?;
    let summary = trainer.train()?;

    println!(
        "Finished {} epochs ({} log points). Best train accuracy {:.3}. {} checkpoints in {}",
        summary.epochs,
        summary.log_points,
        summary.best_accuracy,
        summary.checkpoints_written,
        trainer.checkpoints().run_dir().display()
    );
    println!("Validation results: {}", summary.results_path.display());
    Ok(())
}
