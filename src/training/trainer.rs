// Training orchestrator
//
// Drives epochs over the training loader, runs validation at log points, keeps
// the BEST checkpoint and periodic epoch checkpoints, and writes the
// per-epoch validation results at the end of the run.

use anyhow::{Context, Result};
use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;

use super::checkpoint::CheckpointManager;
use super::loss::masked_cross_entropy;
use super::state::{Averages, BestAccuracy, EpochResult, RunningStats, ValidationResults};
use crate::config::Config;
use crate::data::{BatchLoader, VqaBatch, VqaDataset};
use crate::decoding::GreedyDecoder;
use crate::errors::VqaError;
use crate::logging::RunLog;
use crate::metrics::{batch_accuracy, batch_f1, MetricCalculator};
use crate::models::{CheckpointTag, TextCodec, VqaModel};

/// Probability of feeding the gold token during training steps
pub const TRAIN_TEACHER_FORCE_RATIO: f64 = 0.5;

/// Run log channel for a training run
pub fn train_channel(run_id: &str) -> String {
    format!("Train_{}", run_id)
}

#[derive(Debug, Clone)]
pub struct TrainerOptions {
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub log_every: usize,
    pub save_every: usize,
    /// Seeds the training shuffle
    pub seed: u64,
    pub show_progress: bool,
    /// Parent of the per-run checkpoint directory
    pub checkpoints_dir: PathBuf,
}

impl TrainerOptions {
    pub fn from_config(config: &Config, seed: u64) -> Self {
        let training = &config.training;
        Self {
            batch_size: training.batch_size,
            epochs: training.epochs,
            learning_rate: training.learning_rate,
            log_every: training.log_every,
            save_every: training.save_every,
            seed,
            show_progress: training.show_progress,
            checkpoints_dir: config.paths.checkpoints_dir.clone(),
        }
    }

    fn validate(&self) -> Result<(), VqaError> {
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("epochs", self.epochs),
            ("log_every", self.log_every),
            ("save_every", self.save_every),
        ] {
            if value == 0 {
                return Err(VqaError::invalid(format!("{} must be positive", name)));
            }
        }
        if !(self.learning_rate > 0.0) {
            return Err(VqaError::invalid(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Result of one optimization or validation step
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: f64,
    pub accuracy: f64,
    pub f1: f64,
    /// Decoded targets, validation only
    pub references: Option<Vec<String>>,
    /// Greedy predictions, validation only
    pub predictions: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub log_points: usize,
    pub best_accuracy: f64,
    pub checkpoints_written: usize,
    pub results_path: PathBuf,
}

struct ValidationPass {
    averages: Averages,
    predictions: Vec<String>,
    references: Vec<String>,
}

pub struct VqaTrainer {
    run_id: String,
    model: Box<dyn VqaModel>,
    optimizer: AdamW,
    decoder: GreedyDecoder,
    pad_id: u32,
    train_loader: BatchLoader,
    val_loader: Option<BatchLoader>,
    options: TrainerOptions,
    checkpoints: CheckpointManager,
    metric_calculator: MetricCalculator,
    run_log: Arc<dyn RunLog>,
    running: RunningStats,
    best: BestAccuracy,
}

impl VqaTrainer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: impl Into<String>,
        model: Box<dyn VqaModel>,
        codec: Arc<dyn TextCodec>,
        train_dset: Arc<dyn VqaDataset>,
        val_dset: Option<Arc<dyn VqaDataset>>,
        options: TrainerOptions,
        device: Device,
        run_log: Arc<dyn RunLog>,
    ) -> Result<Self> {
        let run_id = run_id.into();
        options.validate()?;
        let pad_id = codec.special_tokens().pad;

        let train_loader = BatchLoader::new(
            train_dset,
            options.batch_size,
            true,
            options.seed,
            pad_id,
            device.clone(),
        )?;
        if train_loader.num_batches() == 0 {
            return Err(VqaError::invalid(format!(
                "training dataset yields no full batch of size {}",
                options.batch_size
            ))
            .into());
        }

        let val_loader = match val_dset {
            Some(dataset) => {
                let loader =
                    BatchLoader::new(dataset, options.batch_size, false, options.seed, pad_id, device)?;
                if loader.num_batches() == 0 {
                    return Err(VqaError::invalid(format!(
                        "validation dataset yields no full batch of size {}",
                        options.batch_size
                    ))
                    .into());
                }
                Some(loader)
            }
            None => None,
        };

        // Adam: AdamW without weight decay
        let optimizer = AdamW::new(
            model.trainable_vars(),
            ParamsAdamW {
                lr: options.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )
        .context("Failed to create optimizer")?;

        let checkpoints = CheckpointManager::new(&options.checkpoints_dir, &run_id)?;

        tracing::info!(
            run_id = %run_id,
            decoder = %model.kind(),
            train_batches = train_loader.num_batches(),
            val_batches = val_loader.as_ref().map(|l| l.num_batches()).unwrap_or(0),
            epochs = options.epochs,
            lr = options.learning_rate,
            run_dir = %checkpoints.run_dir().display(),
            "Trainer initialized"
        );

        Ok(Self {
            run_id,
            model,
            optimizer,
            decoder: GreedyDecoder::new(codec),
            pad_id,
            train_loader,
            val_loader,
            options,
            checkpoints,
            metric_calculator: MetricCalculator::new(),
            run_log,
            running: RunningStats::default(),
            best: BestAccuracy::default(),
        })
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// One forward pass; training steps also update the weights
    pub fn step(&mut self, batch: &VqaBatch, validation: bool) -> Result<StepOutput> {
        let ratio = if validation { 0.0 } else { TRAIN_TEACHER_FORCE_RATIO };

        let logits = self.model.forward(batch, ratio)?;
        let loss = masked_cross_entropy(&logits, &batch.targets, self.pad_id)?;

        let (references, predictions) = if validation {
            (
                Some(self.decoder.batch_decode(&batch.targets)?),
                Some(self.decoder.decode_from_logits(&logits)?),
            )
        } else {
            self.optimizer.backward_step(&loss)?;
            (None, None)
        };

        let predicted = GreedyDecoder::predicted_ids(&logits)?;
        let targets = batch.targets.t()?.contiguous()?.to_vec2::<u32>()?;
        let accuracy = batch_accuracy(&predicted, &targets, self.pad_id);
        let f1 = batch_f1(&predicted, &targets, self.pad_id);
        assert!(
            (0.0..=1.0).contains(&accuracy),
            "batch accuracy {} outside [0, 1]",
            accuracy
        );
        assert!((0.0..=1.0).contains(&f1), "batch F1 {} outside [0, 1]", f1);

        Ok(StepOutput {
            loss: loss.to_scalar::<f32>()? as f64,
            accuracy,
            f1,
            references,
            predictions,
        })
    }

    pub fn train(&mut self) -> Result<TrainingSummary> {
        let mut results = ValidationResults::new();
        let mut log_points = 0;
        let log_every = self.options.log_every;
        let save_every = self.options.save_every;

        for epoch in 0..self.options.epochs {
            self.train_epoch(epoch)?;

            if epoch % log_every == log_every - 1 {
                self.log_point(epoch, &mut results)?;
                log_points += 1;
            }

            if epoch % save_every == save_every - 1 {
                self.checkpoints
                    .save(self.model.as_ref(), CheckpointTag::Epoch(epoch))?;
            }
        }

        let results_path = self.checkpoints.write_results(&results)?;

        let summary = TrainingSummary {
            epochs: self.options.epochs,
            log_points,
            best_accuracy: self.best.get(),
            checkpoints_written: self.checkpoints.written(),
            results_path,
        };
        tracing::info!(
            run_id = %self.run_id,
            epochs = summary.epochs,
            best_accuracy = summary.best_accuracy,
            checkpoints = summary.checkpoints_written,
            "Training finished"
        );
        Ok(summary)
    }

    fn progress_bar(&self, len: usize, epoch: usize) -> Result<ProgressBar> {
        if !self.options.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>5}/{len:5} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_prefix(format!("Epoch {}", epoch));
        Ok(pb)
    }

    fn train_epoch(&mut self, epoch: usize) -> Result<()> {
        let plan = self.train_loader.epoch_plan();
        let pb = self.progress_bar(plan.len(), epoch)?;
        let mut epoch_stats = RunningStats::default();

        for (i, indices) in plan.iter().enumerate() {
            let batch = self.train_loader.load(indices)?;
            let out = self
                .step(&batch, false)
                .with_context(|| format!("Training step failed at epoch {} batch {}", epoch, i))?;

            self.running.add(out.loss, out.accuracy, out.f1);
            epoch_stats.add(out.loss, out.accuracy, out.f1);

            let avg = epoch_stats.averages();
            pb.set_message(format!("loss={:.4} accuracy={:.4}", avg.loss, avg.accuracy));
            pb.inc(1);
            tracing::debug!(epoch, batch = i, loss = out.loss, accuracy = out.accuracy, "Training step");
        }

        pb.finish_and_clear();
        Ok(())
    }

    fn load_validation(&self, indices: &[usize]) -> Result<VqaBatch> {
        self.val_loader
            .as_ref()
            .context("No validation loader configured")?
            .load(indices)
    }

    fn validate(&mut self, epoch: usize) -> Result<Option<ValidationPass>> {
        let plan = match self.val_loader.as_mut() {
            Some(loader) => loader.epoch_plan(),
            None => return Ok(None),
        };

        let mut stats = RunningStats::default();
        let mut predictions = Vec::new();
        let mut references = Vec::new();
        for (i, indices) in plan.iter().enumerate() {
            let batch = self.load_validation(indices)?;
            let out = self
                .step(&batch, true)
                .with_context(|| format!("Validation step failed at epoch {} batch {}", epoch, i))?;
            stats.add(out.loss, out.accuracy, out.f1);
            predictions.extend(out.predictions.unwrap_or_default());
            references.extend(out.references.unwrap_or_default());
        }

        Ok(Some(ValidationPass {
            averages: stats.averages(),
            predictions,
            references,
        }))
    }

    fn log_point(&mut self, epoch: usize, results: &mut ValidationResults) -> Result<()> {
        let validation = self.validate(epoch)?;

        if let Some(pass) = &validation {
            tracing::info!(epoch, samples = pass.predictions.len(), "Calculating qualification metrics");
            let metrics = self
                .metric_calculator
                .compute(&pass.predictions, &pass.references);
            results.insert(
                epoch,
                EpochResult {
                    qualification_metrics: metrics,
                    loss: pass.averages.loss,
                    accuracy: pass.averages.accuracy,
                    f1: pass.averages.f1,
                },
            );
        }

        let train = self.running.averages();
        let line = match &validation {
            Some(pass) => format!(
                "Training epoch {}: Train loss {:.3}. Val loss: {:.3}. Train accuracy {:.3}. \
                 Val accuracy: {:.3}. Train F1-Score: {:.3}. Validation F1-Score: {:.3}",
                epoch,
                train.loss,
                pass.averages.loss,
                train.accuracy,
                pass.averages.accuracy,
                train.f1,
                pass.averages.f1
            ),
            None => format!(
                "Training epoch {}: Train loss {:.3}. Train accuracy {:.3}. Train F1-Score: {:.3}",
                epoch, train.loss, train.accuracy, train.f1
            ),
        };
        self.run_log.log(&line)?;

        if self.best.improve(train.accuracy) {
            self.checkpoints.save(self.model.as_ref(), CheckpointTag::Best)?;
        }

        self.running.reset();
        Ok(())
    }
}
