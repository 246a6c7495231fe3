//! Training and evaluation loops.

use dpresnet_core::{
    clipped_fraction, BatchSelectionStrategy, DpError, GradientTransform, PoissonSampling,
    Result, SequentialBatching, Tensor,
};
use dpresnet_data::{DataLoader, IndexedDataset};
use dpresnet_nn::{argmax, cross_entropy, ModuleValidator, ResNet};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{OptimizerChoice, TrainConfig};
use crate::engine::{PrivacyEngine, PrivacySettings, PrivateSetup};
use crate::memory::BatchMemoryManager;
use crate::optimizer::DpOptimizer;
use crate::report::ExperimentRecord;

/// Training metrics of one epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Mean of the per-physical-batch mean losses.
    pub loss: f64,
    /// Mean of the per-physical-batch accuracies, as a fraction.
    pub accuracy: f64,
    /// Epsilon spent at the end of the epoch.
    pub epsilon: f64,
    /// Optimizer steps taken in the epoch.
    pub steps: u64,
    /// Physical batches processed, empty ones included.
    pub physical_batches: usize,
    /// Fraction of examples whose gradient was clipped.
    pub clipped_fraction: f64,
}

/// Test-set metrics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvalMetrics {
    /// Mean of per-batch mean losses.
    pub loss: f64,
    /// Mean of per-batch accuracies, as a fraction.
    pub accuracy: f64,
}

/// Fraction of predictions equal to their label.
pub fn accuracy(preds: &[usize], labels: &[usize]) -> f64 {
    if preds.is_empty() {
        return 0.0;
    }
    let correct = preds.iter().zip(labels).filter(|(p, l)| p == l).count();
    correct as f64 / preds.len() as f64
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Runs private training epochs.
#[derive(Clone, Copy, Debug)]
pub struct Trainer {
    memory: BatchMemoryManager,
    delta: f64,
    log_every: usize,
}

impl Trainer {
    /// Trainer logging once per epoch after `log_every` physical batches.
    pub fn new(memory: BatchMemoryManager, delta: f64, log_every: usize) -> Result<Self> {
        if log_every == 0 {
            return Err(DpError::invalid("log_every must be positive"));
        }
        Ok(Self {
            memory,
            delta,
            log_every,
        })
    }

    /// One pass of Poisson-sampled logical batches.
    ///
    /// Each logical batch is split by the memory manager; every physical
    /// chunk contributes clipped per-example gradients, and the last chunk
    /// of a logical batch triggers the noisy optimizer step.
    pub fn train_epoch<D, O, R>(
        &self,
        epoch: usize,
        model: &mut ResNet,
        loader: &DataLoader<'_, D, PoissonSampling>,
        optimizer: &mut DpOptimizer<O, Vec<Tensor>>,
        rng: &mut R,
    ) -> Result<EpochMetrics>
    where
        D: IndexedDataset + ?Sized,
        O: GradientTransform<Vec<Tensor>>,
        R: Rng + ?Sized,
    {
        let logical = loader.epoch_indices(rng);
        let physical = self.memory.split_epoch(&logical);
        let steps_before = optimizer.steps_taken();

        let mut losses = Vec::new();
        let mut top1_acc = Vec::new();
        let mut logged = false;
        let mut clip_reports = Vec::new();

        for (i, chunk) in physical.iter().enumerate() {
            let batch = loader.fetch(&chunk.indices)?;
            if batch.is_empty() {
                warn!(epoch, batch = i, "empty physical batch");
            } else {
                let mut total_loss = 0.0;
                let mut preds = Vec::with_capacity(batch.len());
                for (image, &label) in batch.images.iter().zip(&batch.labels) {
                    let (loss, logits, grads) = model.per_example_gradient(image, label)?;
                    clip_reports.extend(optimizer.accumulate(std::slice::from_ref(&grads))?);
                    total_loss += loss;
                    preds.push(argmax(&logits));
                }
                losses.push(total_loss / batch.len() as f64);
                top1_acc.push(accuracy(&preds, &batch.labels));
            }

            if chunk.is_last {
                let params = optimizer.step(model.params(), rng)?;
                model.set_params(params)?;
            } else {
                optimizer.skip_step();
            }

            if (i + 1) % self.log_every == 0 && !logged {
                logged = true;
                let epsilon = optimizer.epsilon(self.delta);
                info!(
                    "\tTrain Epoch: {} \tLoss: {:.6} Acc@1: {:.6} (ε = {:.2}, δ = {:e})",
                    epoch,
                    mean(&losses),
                    mean(&top1_acc) * 100.0,
                    epsilon,
                    self.delta
                );
            }
        }

        let metrics = EpochMetrics {
            epoch,
            loss: mean(&losses),
            accuracy: mean(&top1_acc),
            epsilon: optimizer.epsilon(self.delta),
            steps: optimizer.steps_taken() - steps_before,
            physical_batches: physical.len(),
            clipped_fraction: clipped_fraction(&clip_reports),
        };
        debug!(?metrics, "epoch finished");
        Ok(metrics)
    }
}

/// Evaluate without gradients; metrics are means of per-batch means.
pub fn evaluate<D, S, R>(
    model: &ResNet,
    loader: &DataLoader<'_, D, S>,
    rng: &mut R,
) -> Result<EvalMetrics>
where
    D: IndexedDataset + ?Sized,
    S: BatchSelectionStrategy,
    R: Rng + ?Sized,
{
    if loader.dataset().is_empty() {
        return Err(DpError::dataset("test set is empty"));
    }
    let mut losses = Vec::new();
    let mut top1_acc = Vec::new();
    for batch in loader.iter(rng) {
        let batch = batch?;
        if batch.is_empty() {
            continue;
        }
        let mut total_loss = 0.0;
        let mut preds = Vec::with_capacity(batch.len());
        for (image, &label) in batch.images.iter().zip(&batch.labels) {
            let logits = model.forward(image)?;
            let (loss, _) = cross_entropy(&logits, label)?;
            total_loss += loss;
            preds.push(argmax(&logits));
        }
        losses.push(total_loss / batch.len() as f64);
        top1_acc.push(accuracy(&preds, &batch.labels));
    }

    let metrics = EvalMetrics {
        loss: mean(&losses),
        accuracy: mean(&top1_acc),
    };
    info!(
        "\tTest set:Loss: {:.6} Acc: {:.6} ",
        metrics.loss,
        metrics.accuracy * 100.0
    );
    Ok(metrics)
}

/// Result of [`fit`].
#[derive(Debug)]
pub struct TrainingRun {
    /// Summary of the run.
    pub record: ExperimentRecord,
    /// Trained network.
    pub model: ResNet,
}

fn epoch_progress(epochs: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(epochs as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("Epoch {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta_precise}] {msg}")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar
}

/// Train privately on `train`, then evaluate on `test`.
///
/// The model described by the config is validated and fixed first, so a
/// BatchNorm ResNet-18 is trained with GroupNorm in its place.
pub fn fit<Dtr, Dte>(
    config: &TrainConfig,
    train: &Dtr,
    test: &Dte,
    show_progress: bool,
) -> Result<TrainingRun>
where
    Dtr: IndexedDataset + ?Sized,
    Dte: IndexedDataset + ?Sized,
{
    config.validate()?;
    let written = config.model.resnet_config();
    let issues = ModuleValidator::validate(&written);
    if !issues.is_empty() {
        info!(count = issues.len(), "replacing modules incompatible with DP-SGD");
        for issue in &issues {
            debug!(%issue, "incompatible module");
        }
    }
    let resnet_config = ModuleValidator::fix(&written);
    ModuleValidator::validate_strict(&resnet_config)?;

    let mut init_rng = ChaCha8Rng::seed_from_u64(config.seed);
    let model = ResNet::new(resnet_config, &mut init_rng)?;
    info!(parameters = model.num_parameters(), "model ready");

    match config.optimizer {
        OptimizerChoice::Rmsprop => {
            let rmsprop = config.rmsprop();
            rmsprop.validate()?;
            run(config, model, rmsprop, train, test, show_progress)
        }
        OptimizerChoice::Sgd => run(config, model, config.sgd(), train, test, show_progress),
    }
}

fn run<O, Dtr, Dte>(
    config: &TrainConfig,
    mut model: ResNet,
    inner: O,
    train: &Dtr,
    test: &Dte,
    show_progress: bool,
) -> Result<TrainingRun>
where
    O: GradientTransform<Vec<Tensor>>,
    Dtr: IndexedDataset + ?Sized,
    Dte: IndexedDataset + ?Sized,
{
    let engine = PrivacyEngine::new(config.accountant.into())
        .with_epsilon_tolerance(config.epsilon_tolerance);
    let settings = PrivacySettings {
        num_samples: train.len(),
        batch_size: config.batch_size,
        epochs: config.epochs,
        max_grad_norm: config.clipping_threshold,
    };
    let PrivateSetup {
        mut optimizer,
        sampler,
        noise_multiplier,
        ..
    } = engine.make_private_with_epsilon(
        inner,
        model.params(),
        &settings,
        config.epsilon,
        config.delta,
    )?;
    info!(
        "Using sigma={} and C={}",
        noise_multiplier, config.clipping_threshold
    );

    let trainer = Trainer::new(
        BatchMemoryManager::new(config.max_physical_batch_size)?,
        config.delta,
        config.log_every,
    )?;
    let train_loader = DataLoader::new(train, sampler);
    let test_loader = DataLoader::new(
        test,
        SequentialBatching {
            batch_size: config.eval_batch_size,
            shuffle: false,
        },
    );

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(1));
    let progress = epoch_progress(config.epochs, show_progress);
    let mut history = Vec::with_capacity(config.epochs);
    for epoch in 1..=config.epochs {
        let metrics =
            trainer.train_epoch(epoch, &mut model, &train_loader, &mut optimizer, &mut rng)?;
        progress.set_message(format!("ε = {:.2}", metrics.epsilon));
        progress.inc(1);
        history.push(metrics);
    }
    progress.finish_and_clear();

    let eval = evaluate(&model, &test_loader, &mut rng)?;
    let record = ExperimentRecord {
        epsilon: config.epsilon,
        delta: config.delta,
        clipping_threshold: config.clipping_threshold,
        step_size: config.step_size,
        test_loss: eval.loss,
        test_accuracy: eval.accuracy * 100.0,
        noise_multiplier: Some(noise_multiplier),
        epochs: config.epochs,
        spent_epsilon: Some(engine.get_epsilon(config.delta)),
        history,
    };
    Ok(TrainingRun { record, model })
}
