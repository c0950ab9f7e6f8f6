use std::path::Path;

use tensorboard_rs::summary_writer::SummaryWriter;

use crate::estimate;
use crate::estimate::LossEstimates;
use crate::learn::ProgressReporter;

/// Reporter for Tensorboard
///
/// Records the loss of every sentence and the loss estimates, indexed by the
/// number of sentences trained on.
pub struct TensorboardReporter {
    writer: Option<SummaryWriter>,
    base_dir: String,
}

impl TensorboardReporter {
    /// Create a new TensorboardReporter
    pub fn new(base_dir: &str) -> Self {
        Self {
            writer: None,
            base_dir: base_dir.to_string(),
        }
    }
}

impl estimate::ProgressReporter for TensorboardReporter {
    fn train_loss_start(&mut self, _total_train_sentences: usize) {}

    fn train_loss_progress(&mut self, _current_train_sentences: usize) {}

    fn train_loss_end(&mut self, _train_loss: f64) {}

    fn valid_loss_start(&mut self, _total_valid_sentences: usize) {}

    fn valid_loss_progress(&mut self, _current_valid_sentences: usize) {}

    fn valid_loss_end(&mut self, _valid_loss: f64) {}
}

impl ProgressReporter for TensorboardReporter {
    fn epoch_start(&mut self, run_name: String, n_epochs: usize, sentences_per_epoch: usize) {
        let run_name = format!("run_{}_{}_{}", run_name, n_epochs, sentences_per_epoch);
        let logdir = Path::new(&self.base_dir).join(run_name);
        tracing::info!(logdir = %logdir.display(), "tensorboard logging");
        // create a new writer
        self.writer = Some(SummaryWriter::new(&logdir));
    }

    fn epoch_end(&mut self) {
        if let Some(writer) = &mut self.writer {
            writer.flush();
        }
        // close the writer
        self.writer = None;
    }

    fn train_loss(&mut self, current_sentence: usize, loss: f64) {
        if let Some(writer) = &mut self.writer {
            writer.add_scalar("sentence_loss", loss as f32, current_sentence);
        }
    }

    fn estimate_end(&mut self, loss_estimates: LossEstimates) {
        if let Some(writer) = &mut self.writer {
            writer.add_scalar(
                "train_loss",
                loss_estimates.train_loss as f32,
                loss_estimates.current_sentence,
            );
            if !loss_estimates.valid_loss.is_nan() {
                writer.add_scalar(
                    "valid_loss",
                    loss_estimates.valid_loss as f32,
                    loss_estimates.current_sentence,
                );
            }
        }
    }
}
