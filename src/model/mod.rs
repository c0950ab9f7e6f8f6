/// Vanilla RNN model.
pub mod rnn;

use tch::{Kind, Reduction, Tensor};

/// LanguageModel is a recurrent language model.
pub trait LanguageModel {
    /// Generate a sequence of tokens from a starting sequence of tokens
    /// and a maximum length.
    ///
    /// # Arguments
    /// - xs: the starting sequence of tokens of shape \[t\]; t >= 1
    /// - max_len: the maximum number of generated tokens
    /// - stop: a token that ends the generation when sampled
    ///
    /// # Returns
    /// the generated tokens of shape \[n\]; n <= max_len, `stop` included
    fn generate(&self, xs: &Tensor, max_len: i64, stop: Option<i64>) -> Tensor;

    /// Compute the probability of the next token
    ///
    /// # Arguments
    /// - xs: the sequence of input tokens of shape \[t\]; t >= 1
    ///
    /// # Returns
    /// the probability of the next token of shape \[vocab_size\]
    /// as a detached tensor.
    fn probabilities(&self, xs: &Tensor) -> Tensor;
}

/// Compute the loss of a sentence
///
/// Cross entropy of every time step, summed over the sentence.
///
/// # Arguments
/// - logits: shape \[t, vocab_size\]
/// - targets: shape \[t\]
pub fn sentence_loss(logits: &Tensor, targets: &Tensor) -> Tensor {
    let logits = logits.to_kind(Kind::Float);
    let targets = targets.to_kind(Kind::Int64);

    logits.cross_entropy_loss::<Tensor>(&targets, None, Reduction::Sum, -100, 0.)
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_sentence_loss_sums_time_steps() {
        let vocab_size = 7;
        let t = 4;

        // uniform logits: every step costs ln(vocab_size)
        let logits = Tensor::zeros([t, vocab_size], (Kind::Float, tch::Device::Cpu));
        let targets = Tensor::from_slice(&[0i64, 3, 6, 2]);

        let loss: f64 = sentence_loss(&logits, &targets).try_into().unwrap();
        let expected = t as f64 * (vocab_size as f64).ln();
        assert!((loss - expected).abs() < 1e-4, "{} != {}", loss, expected);
    }

    #[test]
    #[serial]
    fn test_sentence_loss_matches_per_step_sum() {
        tch::manual_seed(7);
        let logits = Tensor::randn([3, 5], (Kind::Float, tch::Device::Cpu));
        let targets = Tensor::from_slice(&[1i64, 4, 0]);

        let total: f64 = sentence_loss(&logits, &targets).try_into().unwrap();

        let mut per_step = 0.;
        for i in 0..3 {
            let step = logits
                .narrow(0, i, 1)
                .cross_entropy_for_logits(&targets.narrow(0, i, 1));
            per_step += f64::try_from(step).unwrap();
        }

        assert!((total - per_step).abs() < 1e-4);
    }
}
