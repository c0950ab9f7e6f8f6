use anyhow::Result;
use tch::Device;

use crate::data::{teacher_forcing, SentenceLoader};
use crate::model::rnn::Rnn;
use crate::model::sentence_loss;
use crate::tokenizer::Tokenizer;

/// Estimates of the loss on the training and validation sets.
///
/// Losses are per sentence (summed over the time steps), averaged over the
/// evaluated sentences. `NaN` if no sentence was evaluated.
#[derive(Debug, Clone)]
pub struct LossEstimates {
    /// Loss on the training set.
    pub train_loss: f64,
    /// Loss on the validation set.
    pub valid_loss: f64,
    /// Number of sentences the model has been trained on.
    pub current_sentence: usize,
}

/// Interface for a progress reporter.
pub trait ProgressReporter {
    /// Called at the start of the loss estimation for the training sets.
    fn train_loss_start(&mut self, total_train_sentences: usize);
    /// Called to update the progress of the loss estimation for the training
    /// sets.
    fn train_loss_progress(&mut self, current_train_sentences: usize);
    /// Called at the end of the loss estimation for the training sets.
    fn train_loss_end(&mut self, train_loss: f64);
    /// Called at the start of the loss estimation for the validation sets.
    fn valid_loss_start(&mut self, total_valid_sentences: usize);
    /// Called to update the progress of the loss estimation for the validation
    /// sets.
    fn valid_loss_progress(&mut self, current_valid_sentences: usize);
    /// Called at the end of the loss estimation for the validation sets.
    fn valid_loss_end(&mut self, valid_loss: f64);
}

/// A progress reporter that does nothing.
pub struct NullProgressReporter;

impl ProgressReporter for NullProgressReporter {
    fn train_loss_start(&mut self, _total_train_sentences: usize) {}

    fn train_loss_progress(&mut self, _current_train_sentences: usize) {}

    fn train_loss_end(&mut self, _train_loss: f64) {}

    fn valid_loss_start(&mut self, _total_valid_sentences: usize) {}

    fn valid_loss_progress(&mut self, _current_valid_sentences: usize) {}

    fn valid_loss_end(&mut self, _valid_loss: f64) {}
}

/// Loss estimator.
pub struct LossEstimator<'a> {
    train_dataloader: &'a mut SentenceLoader,
    valid_dataloader: &'a mut SentenceLoader,
    tokenizer: &'a dyn Tokenizer,
    device: Device,
}

impl<'a> LossEstimator<'a> {
    /// Create a new loss estimator.
    pub fn new(
        train_dataloader: &'a mut SentenceLoader,
        valid_dataloader: &'a mut SentenceLoader,
        tokenizer: &'a dyn Tokenizer,
        device: Device,
    ) -> Self {
        Self {
            train_dataloader,
            valid_dataloader,
            tokenizer,
            device,
        }
    }

    /// Estimate the loss of a model on the training and validation sets.
    pub fn estimate_loss(
        &mut self,
        model: &Rnn,
        train_iters: usize,
        eval_iters: usize,
        current_sentence: usize,
        progress_callback: &mut impl ProgressReporter,
    ) -> Result<LossEstimates> {
        progress_callback.train_loss_start(train_iters);
        let train_loss = mean_loss(
            model,
            self.tokenizer,
            self.train_dataloader,
            train_iters,
            self.device,
            |n| progress_callback.train_loss_progress(n),
        )?;
        progress_callback.train_loss_end(train_loss);

        progress_callback.valid_loss_start(eval_iters);
        let valid_loss = mean_loss(
            model,
            self.tokenizer,
            self.valid_dataloader,
            eval_iters,
            self.device,
            |n| progress_callback.valid_loss_progress(n),
        )?;
        progress_callback.valid_loss_end(valid_loss);

        Ok(LossEstimates {
            train_loss,
            valid_loss,
            current_sentence,
        })
    }
}

/// Mean sentence loss over (at most) `iters` sentences of a loader.
fn mean_loss(
    model: &Rnn,
    tokenizer: &dyn Tokenizer,
    dataloader: &mut SentenceLoader,
    iters: usize,
    device: Device,
    mut progress: impl FnMut(usize),
) -> Result<f64> {
    let mut total = 0.0;
    let mut n_sentences = 0;

    'batches: while let Some(batch) = dataloader.next_batch() {
        for sentence in batch {
            if n_sentences >= iters {
                break 'batches;
            }

            let tokens = tokenizer.encode(sentence)?;
            let Some((xs, ys)) = teacher_forcing(&tokens, device) else {
                continue;
            };

            let loss = tch::no_grad(|| {
                let (logits, _) = model.forward_sequence(&xs, None);
                sentence_loss(&logits, &ys)
            });
            total += f64::try_from(loss)?;
            n_sentences += 1;

            if n_sentences % 10 == 0 {
                progress(n_sentences);
            }
        }
    }

    if n_sentences == 0 {
        return Ok(f64::NAN);
    }
    Ok(total / n_sentences as f64)
}
