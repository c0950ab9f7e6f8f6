/// Logger for training.
pub mod logger;

use std::fmt::Write;

use anyhow::{bail, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressState, ProgressStyle};
use rand::Rng;
use tch::nn::{self, OptimizerConfig};
use tch::Device;

use crate::config::LearnConfig;
use crate::data::{teacher_forcing, SentenceLoader};
use crate::estimate;
use crate::estimate::{LossEstimates, LossEstimator};
use crate::model::rnn::Rnn;
use crate::model::sentence_loss;
use crate::tokenizer::Tokenizer;

/// A trait for reporting progress during training.
#[allow(unused_variables)]
pub trait ProgressReporter: estimate::ProgressReporter {
    /// Called before the first epoch starts.
    fn epoch_start(&mut self, run_name: String, n_epochs: usize, sentences_per_epoch: usize) {}
    /// Called when some sentences have been processed.
    fn epoch_progress(&mut self, current_sentence: usize) {}
    /// Called when all epochs have been processed.
    fn epoch_end(&mut self) {}

    /// Called when the training starts.
    fn train_start(&mut self, n_train_sentences: usize) {}
    /// Called when some sentences have been processed.
    fn train_progress(&mut self, current_train_sentences: usize) {}
    /// Called with the loss of every sentence the model is trained on.
    fn train_loss(&mut self, current_sentence: usize, loss: f64) {}
    /// Called when the training ends.
    fn train_end(&mut self) {}

    /// Called when the loss estimation starts.
    fn estimate_start(&mut self) {}
    /// Called when a stage of the loss estimation are completed.
    fn estimate_progress(&mut self) {}
    /// Called when the loss estimation ends.
    fn estimate_end(&mut self, loss_estimates: LossEstimates) {}
}

/// Training observer.
#[derive(Default)]
pub struct Observer {
    reporters: Vec<Box<dyn ProgressReporter>>,
}

impl Observer {
    /// Add a reporter to the observer.
    pub fn with(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }
}

impl ProgressReporter for Observer {
    fn epoch_start(&mut self, run_name: String, n_epochs: usize, sentences_per_epoch: usize) {
        for reporter in &mut self.reporters {
            reporter.epoch_start(run_name.clone(), n_epochs, sentences_per_epoch);
        }
    }

    fn epoch_progress(&mut self, current_sentence: usize) {
        for reporter in &mut self.reporters {
            reporter.epoch_progress(current_sentence);
        }
    }

    fn epoch_end(&mut self) {
        for reporter in &mut self.reporters {
            reporter.epoch_end();
        }
    }

    fn train_start(&mut self, n_train_sentences: usize) {
        for reporter in &mut self.reporters {
            reporter.train_start(n_train_sentences);
        }
    }

    fn train_progress(&mut self, current_train_sentences: usize) {
        for reporter in &mut self.reporters {
            reporter.train_progress(current_train_sentences);
        }
    }

    fn train_loss(&mut self, current_sentence: usize, loss: f64) {
        for reporter in &mut self.reporters {
            reporter.train_loss(current_sentence, loss);
        }
    }

    fn train_end(&mut self) {
        for reporter in &mut self.reporters {
            reporter.train_end();
        }
    }

    fn estimate_start(&mut self) {
        for reporter in &mut self.reporters {
            reporter.estimate_start();
        }
    }

    fn estimate_progress(&mut self) {
        for reporter in &mut self.reporters {
            reporter.estimate_progress();
        }
    }

    fn estimate_end(&mut self, loss_estimates: LossEstimates) {
        for reporter in &mut self.reporters {
            reporter.estimate_end(loss_estimates.clone());
        }
    }
}

impl estimate::ProgressReporter for Observer {
    fn train_loss_start(&mut self, total_train_sentences: usize) {
        for reporter in &mut self.reporters {
            reporter.train_loss_start(total_train_sentences);
        }
    }

    fn train_loss_progress(&mut self, current_train_sentences: usize) {
        for reporter in &mut self.reporters {
            reporter.train_loss_progress(current_train_sentences);
        }
    }

    fn train_loss_end(&mut self, train_loss: f64) {
        for reporter in &mut self.reporters {
            reporter.train_loss_end(train_loss);
        }
    }

    fn valid_loss_start(&mut self, total_valid_sentences: usize) {
        for reporter in &mut self.reporters {
            reporter.valid_loss_start(total_valid_sentences);
        }
    }

    fn valid_loss_progress(&mut self, current_valid_sentences: usize) {
        for reporter in &mut self.reporters {
            reporter.valid_loss_progress(current_valid_sentences);
        }
    }

    fn valid_loss_end(&mut self, valid_loss: f64) {
        for reporter in &mut self.reporters {
            reporter.valid_loss_end(valid_loss);
        }
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .with_key(
            "per_sec_short",
            |state: &ProgressState, w: &mut dyn Write| {
                let _ = write!(w, "{:>7.1}/s", state.per_sec());
            },
        )
        .progress_chars("##-")
}

/// Progress reporter that uses the `indicatif` crate to display progress bars.
///
/// We want progress bar like: ```[198/200 35:16 < 00:21, 0.09/s]```
pub struct PbProgressReporter {
    mb: MultiProgress,
    epoch_bar: Option<ProgressBar>,
    train_bar: Option<ProgressBar>,
    estimate_bar: Option<ProgressBar>,
    estimate_train_bar: Option<ProgressBar>,
    estimate_valid_bar: Option<ProgressBar>,
    current_epoch: f32,
    sentences_per_epoch: usize,
    train_loss: f64,
    valid_loss: f64,
}

impl Default for PbProgressReporter {
    fn default() -> Self {
        let mb = MultiProgress::new();
        PbProgressReporter {
            mb,
            epoch_bar: None,
            train_bar: None,
            estimate_bar: None,
            estimate_train_bar: None,
            estimate_valid_bar: None,
            current_epoch: 0.,
            sentences_per_epoch: 0,
            train_loss: 0.0,
            valid_loss: 0.0,
        }
    }
}

impl ProgressReporter for PbProgressReporter {
    fn epoch_start(&mut self, _run_name: String, n_epochs: usize, sentences_per_epoch: usize) {
        let epoch_bar = self
            .mb
            .add(ProgressBar::new((n_epochs * sentences_per_epoch) as u64));
        epoch_bar.set_style(
            bar_style("{spinner:.green} MASTER   {bar:20.cyan/blue} [{pos:>7}/{len:7} {elapsed_precise} < {eta_precise}, {per_sec_short:.2}, Epoch {epoch_progress}] {msg}")
                .with_key(
                    "epoch_progress",
                    move |state: &ProgressState, w: &mut dyn Write| {
                        let _ = write!(
                            w,
                            "{:>4.1}/{}",
                            state.pos() as f32 / sentences_per_epoch.max(1) as f32,
                            n_epochs
                        );
                    },
                ),
        );

        epoch_bar.tick();
        self.epoch_bar = Some(epoch_bar);
        self.current_epoch = 0.;
        self.sentences_per_epoch = sentences_per_epoch;
    }

    fn epoch_progress(&mut self, current_sentence: usize) {
        if let Some(epoch_bar) = &self.epoch_bar {
            epoch_bar.set_position(current_sentence as u64);
        }

        self.current_epoch = current_sentence as f32 / self.sentences_per_epoch.max(1) as f32;
    }

    fn epoch_end(&mut self) {
        if let Some(epoch_bar) = &self.epoch_bar {
            epoch_bar.finish_and_clear();
        }
        self.epoch_bar = None;
    }

    fn train_start(&mut self, n_train_sentences: usize) {
        let train_bar = self.mb.add(ProgressBar::new(n_train_sentences as u64));
        train_bar.set_style(bar_style("{spinner:.green} TRAINING {bar:20.green/blue} [{pos:>7}/{len:7} {elapsed_precise} < {eta_precise}, {per_sec_short:.2}] {msg}"));
        train_bar.tick();
        self.train_bar = Some(train_bar);
    }

    fn train_progress(&mut self, current_train_sentences: usize) {
        if let Some(train_bar) = &self.train_bar {
            train_bar.set_position(current_train_sentences as u64);
        }
    }

    fn train_loss(&mut self, _current_sentence: usize, loss: f64) {
        if let Some(train_bar) = &self.train_bar {
            train_bar.set_message(format!("loss: {:.4}", loss));
        }
    }

    fn train_end(&mut self) {
        if let Some(train_bar) = &self.train_bar {
            train_bar.finish_and_clear();
        }
        self.train_bar = None;
    }

    fn estimate_start(&mut self) {
        let estimate_bar = self.mb.add(ProgressBar::new(2));
        estimate_bar.set_style(bar_style("{spinner:.green} EVAL     {bar:20.magenta/blue} [{pos:>7}/{len:7} {elapsed_precise} < {eta_precise}, {per_sec_short:.2}] {msg}"));
        estimate_bar.tick();
        self.estimate_bar = Some(estimate_bar);
    }

    fn estimate_progress(&mut self) {
        if let Some(estimate_bar) = &self.estimate_bar {
            estimate_bar.inc(1);
        }
    }

    fn estimate_end(&mut self, loss_estimates: LossEstimates) {
        if let Some(estimate_bar) = &self.estimate_bar {
            estimate_bar.set_message(format!(
                "Epoch {:>4.1}, Train loss: {:.4}, Valid loss: {:.4}",
                self.current_epoch, loss_estimates.train_loss, loss_estimates.valid_loss
            ));
            estimate_bar.finish(); // keep the bar
        }
        self.estimate_bar = None;
    }
}

impl estimate::ProgressReporter for PbProgressReporter {
    fn train_loss_start(&mut self, total_train_sentences: usize) {
        let train_loss_bar = self.mb.add(ProgressBar::new(total_train_sentences as u64));
        train_loss_bar.set_style(bar_style("{spinner:.green}        T {bar:20.yellow/blue} [{pos:>7}/{len:7} {elapsed_precise} < {eta_precise}, {per_sec_short:.2}] {msg}"));
        self.estimate_train_bar = Some(train_loss_bar);
    }

    fn train_loss_progress(&mut self, current_train_sentences: usize) {
        if let Some(estimate_train_bar) = &self.estimate_train_bar {
            estimate_train_bar.set_position(current_train_sentences as u64);
        }
    }

    fn train_loss_end(&mut self, train_loss: f64) {
        if let Some(estimate_train_bar) = &self.estimate_train_bar {
            estimate_train_bar.finish_and_clear();
        }
        self.estimate_train_bar = None;

        if let Some(estimate_bar) = &self.estimate_bar {
            estimate_bar.set_message(format!(
                "Epoch {:>4.1}, Train loss: {:.4}",
                self.current_epoch, train_loss
            ));
        }

        self.train_loss = train_loss;

        // progress on the estimate bar
        ProgressReporter::estimate_progress(self);
    }

    fn valid_loss_start(&mut self, total_valid_sentences: usize) {
        let valid_loss_bar = self.mb.add(ProgressBar::new(total_valid_sentences as u64));
        valid_loss_bar.set_style(bar_style("{spinner:.green}        E {bar:20.yellow/blue} [{pos:>7}/{len:7} {elapsed_precise} < {eta_precise}, {per_sec_short:.2}] {msg}"));
        self.estimate_valid_bar = Some(valid_loss_bar);
    }

    fn valid_loss_progress(&mut self, current_valid_sentences: usize) {
        if let Some(estimate_valid_bar) = &self.estimate_valid_bar {
            estimate_valid_bar.set_position(current_valid_sentences as u64);
        }
    }

    fn valid_loss_end(&mut self, valid_loss: f64) {
        if let Some(estimate_valid_bar) = &self.estimate_valid_bar {
            estimate_valid_bar.finish_and_clear();
        }
        self.estimate_valid_bar = None;

        if let Some(estimate_bar) = &self.estimate_bar {
            estimate_bar.set_message(format!(
                "Epoch {:>4.1}, Train loss: {:.4}, valid loss: {:.4}",
                self.current_epoch, self.train_loss, valid_loss
            ));
        }

        self.valid_loss = valid_loss;
        ProgressReporter::estimate_progress(self);
    }
}

/// Train the model on one sentence.
///
/// The hidden state starts at zero and is carried from token to token. The
/// cross entropy of every next token prediction is summed over the sentence
/// before a single optimizer step.
///
/// Returns the sentence loss, or `None` if the sentence has no transition.
pub fn train_sentence(
    model: &Rnn,
    tokens: &[i64],
    opt: &mut nn::Optimizer,
    max_grad_norm: Option<f64>,
    device: Device,
) -> Result<Option<f64>> {
    let Some((xs, ys)) = teacher_forcing(tokens, device) else {
        return Ok(None);
    };

    let (logits, _) = model.forward_sequence(&xs, None);
    let loss = sentence_loss(&logits, &ys);

    opt.zero_grad();
    loss.backward();
    if let Some(max_grad_norm) = max_grad_norm {
        opt.clip_grad_norm(max_grad_norm);
    }
    opt.step();

    Ok(Some(f64::try_from(loss)?))
}

/// Train the model
///
/// Every epoch goes through the shuffled batches of sentences, one optimizer
/// step per sentence. Returns the loss of every sentence trained on.
#[allow(clippy::too_many_arguments)]
pub fn learn<R: Rng>(
    learn_config: LearnConfig,
    run_name: String,
    train_dataloader: &mut SentenceLoader,
    valid_dataloader: &mut SentenceLoader,
    tokenizer: &dyn Tokenizer,
    mut rng: &mut R,
    vs: &nn::VarStore,
    model: &Rnn,
    observer: &mut impl ProgressReporter,
) -> Result<Vec<f64>> {
    let LearnConfig {
        n_epochs,
        lr,
        mut steps_between_loss_estimation,
        mut loss_estimation_steps,
        max_grad_norm,
    } = learn_config;

    if train_dataloader.is_empty() {
        bail!("no sentence to train on");
    }

    let device = vs.device();

    // clones the dataloaders for the loss estimation
    let mut train_dataloader_loss = train_dataloader.clone();
    let mut valid_dataloader_loss = valid_dataloader.clone();

    let sentences_per_epoch = train_dataloader.len();
    let n_steps = sentences_per_epoch * n_epochs;

    // adjust the steps between loss estimation if necessary
    if n_steps <= steps_between_loss_estimation {
        tracing::info!(
            "steps between loss estimation ({}) is larger than the number of steps ({}). Adjusting.",
            steps_between_loss_estimation,
            n_steps
        );
        steps_between_loss_estimation = (n_steps / 5).max(1);
    }

    // 0 estimates the losses once, at the end of the training
    if steps_between_loss_estimation == 0 {
        steps_between_loss_estimation = n_steps;
    }

    // adjust the loss estimation steps if necessary
    if loss_estimation_steps > steps_between_loss_estimation {
        tracing::info!(
            "loss estimation steps ({}) is larger than the steps between loss estimation ({}). Adjusting.",
            loss_estimation_steps,
            steps_between_loss_estimation
        );
        loss_estimation_steps = (steps_between_loss_estimation / 10).max(1);
    }

    let mut opt = nn::AdamW::default().build(vs, lr)?;

    observer.epoch_start(run_name, n_epochs, sentences_per_epoch);
    observer.train_start(steps_between_loss_estimation);

    let mut losses = Vec::with_capacity(n_steps);
    let mut step = 0;
    let mut skipped = 0;

    for epoch in 0..n_epochs {
        train_dataloader.shuffle(&mut rng);
        tracing::debug!(epoch, batches = train_dataloader.n_batches(), "epoch start");

        while let Some(batch) = train_dataloader.next_batch() {
            for sentence in batch {
                let tokens = tokenizer.encode(sentence)?;
                match train_sentence(model, &tokens, &mut opt, max_grad_norm, device)? {
                    Some(loss) => {
                        losses.push(loss);
                        observer.train_loss(step, loss);
                    }
                    None => skipped += 1,
                }

                step += 1;

                if step % 10 == 0 {
                    observer.train_progress(step % steps_between_loss_estimation);
                    observer.epoch_progress(step);
                }

                if step % steps_between_loss_estimation == 0 || step == n_steps {
                    observer.train_end();
                    observer.estimate_start();

                    // Reshuffle the sentences
                    train_dataloader_loss.shuffle(&mut rng);
                    valid_dataloader_loss.shuffle(&mut rng);

                    let mut estimator = LossEstimator::new(
                        &mut train_dataloader_loss,
                        &mut valid_dataloader_loss,
                        tokenizer,
                        device,
                    );
                    let loss_estimates = estimator.estimate_loss(
                        model,
                        loss_estimation_steps, /* use the same number of sentences for
                                                * training and validation */
                        loss_estimation_steps,
                        step,
                        observer,
                    )?;

                    tracing::debug!(
                        step,
                        train_loss = loss_estimates.train_loss,
                        valid_loss = loss_estimates.valid_loss,
                        "loss estimates"
                    );
                    observer.estimate_end(loss_estimates);

                    if step != n_steps {
                        observer.train_start(steps_between_loss_estimation);
                    }
                }
            }
        }
    }

    observer.epoch_end();

    if skipped > 0 {
        tracing::warn!(skipped, "sentences without any transition were skipped");
    }

    Ok(losses)
}
