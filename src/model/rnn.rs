use tch::{nn, IndexOp, Kind, Tensor};

use crate::model::LanguageModel;

/// Rnn configuration.
#[derive(Debug, Clone, Copy)]
pub struct RnnConfig {
    /// The vocabulary size.
    pub vocab_size: i64,
    /// The token embedding size.
    pub in_embd: i64,
    /// The hidden state size.
    pub h_embd: i64,
}

/// Rnn is a single layer Elman network over token embeddings.
///
/// At every time step:
/// - `h = tanh(i2h(embedding(x)) + h2h(h_prev))`
/// - `logits = h2o(h)`
#[derive(Debug)]
pub struct Rnn {
    /// The embedding layer
    x_embd: nn::Embedding,
    /// Input to hidden
    i2h: nn::Linear,
    /// Hidden to hidden
    h2h: nn::Linear,
    /// Hidden to output (logits)
    h2o: nn::Linear,
    /// The hidden state size
    h_embd: i64,
    /// The vocabulary size
    vocab_size: i64,
}

impl Rnn {
    /// Create a new Rnn
    /// # Arguments
    /// * `vs` - The path to the module.
    /// * `config` - The model configuration. See [RnnConfig].
    /// # Returns
    /// A new Rnn.
    pub fn new(vs: &nn::Path, config: RnnConfig) -> Self {
        let RnnConfig {
            vocab_size,
            in_embd,
            h_embd,
        } = config;

        let x_embd = nn::embedding(vs / "x_embd", vocab_size, in_embd, Default::default());
        let i2h = nn::linear(vs / "i2h", in_embd, h_embd, Default::default());
        let h2h = nn::linear(vs / "h2h", h_embd, h_embd, Default::default());
        let h2o = nn::linear(vs / "h2o", h_embd, vocab_size, Default::default());

        Self {
            x_embd,
            i2h,
            h2h,
            h2o,
            h_embd,
            vocab_size,
        }
    }

    /// Zero hidden state of shape \[1, h_embd\].
    pub fn init_hidden(&self) -> Tensor {
        Tensor::zeros([1, self.h_embd], (Kind::Float, self.h2h.ws.device()))
    }

    /// One time step.
    ///
    /// # Arguments
    /// - x: the previous token, shape \[1\]
    /// - h_prev: the previous hidden state, shape \[1, h_embd\]
    ///
    /// # Returns
    /// the new hidden state \[1, h_embd\] and the logits \[1, vocab_size\]
    pub fn step(&self, x: &Tensor, h_prev: &Tensor) -> (Tensor, Tensor) {
        let x_embd = x.apply(&self.x_embd); // [1, in_embd]
        let h = (x_embd.apply(&self.i2h) + h_prev.apply(&self.h2h)).tanh();
        let logits = h.apply(&self.h2o);
        (h, logits)
    }

    /// Run the recurrence over a sequence of tokens.
    ///
    /// # Arguments
    /// - xs: the tokens, shape \[t\]; t >= 1
    /// - h0: the initial hidden state; zeros if `None`
    ///
    /// # Returns
    /// the logits of every step \[t, vocab_size\] and the last hidden state.
    pub fn forward_sequence(&self, xs: &Tensor, h0: Option<Tensor>) -> (Tensor, Tensor) {
        let t = xs.size()[0];
        assert!(t > 0, "cannot run the recurrence on an empty sequence");

        let mut h = h0.unwrap_or_else(|| self.init_hidden());
        let mut outputs = Vec::with_capacity(t as usize);
        for i in 0..t {
            let (h_next, logits) = self.step(&xs.i(i..i + 1), &h);
            h = h_next;
            outputs.push(logits);
        }

        let logits = Tensor::cat(&outputs, 0);
        assert_eq!(logits.size(), &[t, self.vocab_size]);
        (logits, h)
    }

    /// Return the hidden state size.
    pub fn h_embd(&self) -> i64 {
        self.h_embd
    }
}

impl LanguageModel for Rnn {
    fn generate(&self, xs: &Tensor, max_len: i64, stop: Option<i64>) -> Tensor {
        let device = xs.device();
        tch::no_grad(|| {
            let (logits, mut h) = self.forward_sequence(xs, None);
            let mut probs = logits.i(-1).softmax(-1, Kind::Float);

            let mut outputs = Vec::with_capacity(max_len as usize);
            for _ in 0..max_len {
                // sample the next token
                let next_token = probs.multinomial(1, true); // [1]
                let token = next_token.int64_value(&[0]);
                outputs.push(token);

                if Some(token) == stop {
                    break;
                }

                let (h_next, logits) = self.step(&next_token, &h);
                h = h_next;
                probs = logits.i(0).softmax(-1, Kind::Float);
            }

            Tensor::from_slice(&outputs).to(device)
        })
    }

    fn probabilities(&self, xs: &Tensor) -> Tensor {
        tch::no_grad(|| {
            let (logits, _) = self.forward_sequence(xs, None);
            // take the last logits
            logits.i(-1).softmax(-1, Kind::Float)
        })
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tch::nn::OptimizerConfig;

    use super::*;
    use crate::model::sentence_loss;

    fn model(vs: &nn::VarStore) -> Rnn {
        let config = RnnConfig {
            vocab_size: 20,
            in_embd: 10,
            h_embd: 12,
        };
        Rnn::new(&vs.root(), config)
    }

    #[test]
    fn test_rnn_parameters() {
        let vs = nn::VarStore::new(tch::Device::Cpu);
        let _model = model(&vs);

        let mut names = vs
            .variables()
            .into_iter()
            .map(|(name, t)| (name, t.size()))
            .collect::<Vec<_>>();
        names.sort();

        assert_eq!(
            names,
            vec![
                ("h2h.bias".to_string(), vec![12]),
                ("h2h.weight".to_string(), vec![12, 12]),
                ("h2o.bias".to_string(), vec![20]),
                ("h2o.weight".to_string(), vec![20, 12]),
                ("i2h.bias".to_string(), vec![12]),
                ("i2h.weight".to_string(), vec![12, 10]),
                ("x_embd.weight".to_string(), vec![20, 10]),
            ]
        );
    }

    #[test]
    fn test_rnn_step() {
        let vs = nn::VarStore::new(tch::Device::Cpu);
        let model = model(&vs);

        let h0 = model.init_hidden();
        assert_eq!(h0.size(), &[1, 12]);
        assert_eq!(f64::try_from(h0.abs().sum(Kind::Float)).unwrap(), 0.);

        let x = Tensor::from_slice(&[3i64]);
        let (h, logits) = model.step(&x, &h0);
        assert_eq!(h.size(), &[1, 12]);
        assert_eq!(logits.size(), &[1, 20]);

        // tanh keeps the hidden state in [-1, 1]
        let max: f64 = h.abs().max().try_into().unwrap();
        assert!(max <= 1.);
    }

    #[test]
    fn test_rnn_forward_sequence_matches_steps() {
        let vs = nn::VarStore::new(tch::Device::Cpu);
        let model = model(&vs);

        let xs = Tensor::from_slice(&[0i64, 5, 7, 1]);
        let (logits, h_last) = model.forward_sequence(&xs, None);
        assert_eq!(logits.size(), &[4, 20]);

        let mut h = model.init_hidden();
        for i in 0..4 {
            let (h_next, step_logits) = model.step(&xs.i(i..i + 1), &h);
            let diff: f64 = (&step_logits - logits.i(i..i + 1))
                .abs()
                .max()
                .try_into()
                .unwrap();
            assert!(diff < 1e-6);
            h = h_next;
        }

        let diff: f64 = (h - h_last).abs().max().try_into().unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_rnn_hidden_state_carries_context() {
        let vs = nn::VarStore::new(tch::Device::Cpu);
        let model = model(&vs);

        // same last token, different history
        let a = model.probabilities(&Tensor::from_slice(&[1i64, 2, 3]));
        let b = model.probabilities(&Tensor::from_slice(&[4i64, 5, 3]));
        assert_eq!(a.size(), &[20]);

        let total: f64 = a.sum(Kind::Float).try_into().unwrap();
        assert!((total - 1.).abs() < 1e-5);

        let diff: f64 = (a - b).abs().max().try_into().unwrap();
        assert!(diff > 0.);
    }

    #[test]
    #[serial]
    fn test_rnn_generate() {
        tch::manual_seed(42);
        let vs = nn::VarStore::new(tch::Device::Cpu);
        let model = model(&vs);

        let ys = model.generate(&Tensor::from_slice(&[0i64]), 10, None);
        assert_eq!(ys.size(), &[10]);
        let ys: Vec<i64> = ys.try_into().unwrap();
        assert!(ys.iter().all(|&y| (0..20).contains(&y)));

        // every token is a stop token
        let first = ys[0];
        tch::manual_seed(42);
        let ys = model.generate(&Tensor::from_slice(&[0i64]), 10, Some(first));
        let ys: Vec<i64> = ys.try_into().unwrap();
        assert_eq!(ys, vec![first]);
    }

    #[test]
    fn test_rnn_sampling_builds_no_graph() {
        let vs = nn::VarStore::new(tch::Device::Cpu);
        let model = model(&vs);
        let xs = Tensor::from_slice(&[0i64, 3]);

        let (logits, _) = model.forward_sequence(&xs, None);
        assert!(logits.requires_grad());

        assert!(!model.probabilities(&xs).requires_grad());
        assert_eq!(model.generate(&xs, 5, None).size(), &[5]);
    }

    #[test]
    #[serial]
    fn test_rnn_learns_a_sequence() {
        tch::manual_seed(1337);
        let vs = nn::VarStore::new(tch::Device::Cpu);
        let model = model(&vs);
        let mut opt = nn::AdamW::default().build(&vs, 1e-2).unwrap();

        let tokens = Tensor::from_slice(&[0i64, 4, 8, 15, 16, 2, 1]);
        let xs = tokens.narrow(0, 0, 6);
        let ys = tokens.narrow(0, 1, 6);

        let initial: f64 = {
            let (logits, _) = model.forward_sequence(&xs, None);
            sentence_loss(&logits, &ys).try_into().unwrap()
        };

        for _ in 0..200 {
            let (logits, _) = model.forward_sequence(&xs, None);
            let loss = sentence_loss(&logits, &ys);
            opt.zero_grad();
            loss.backward();
            opt.step();
        }

        let (logits, _) = model.forward_sequence(&xs, None);
        let last: f64 = sentence_loss(&logits, &ys).try_into().unwrap();
        assert!(last < initial / 4., "{} -> {}", initial, last);
    }
}
