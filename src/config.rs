use clap::{Parser, ValueEnum};

/// Torch device to use.
#[derive(ValueEnum, Debug, Clone, Copy, Default)]
pub enum Device {
    /// CPU
    #[default]
    Cpu,
    /// CUDA if available
    Cuda,
    /// MPS
    #[cfg(target_arch = "aarch64")]
    Mps,
}

impl From<Device> for tch::Device {
    fn from(device: Device) -> Self {
        match device {
            Device::Cpu => tch::Device::Cpu,
            Device::Cuda => tch::Device::cuda_if_available(),
            #[cfg(target_arch = "aarch64")]
            Device::Mps => tch::Device::Mps,
        }
    }
}

/// Where the sentences come from.
#[derive(Parser, Debug, Clone)]
pub struct CorpusArgs {
    /// Corpus file, one sentence per line
    #[arg(long, default_value = "data/sentences.txt")]
    pub corpus_path: String,
    /// Number of sentences per batch
    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,
    /// Number of sentences to load - rounded down to a whole number of
    /// batches
    #[arg(long, default_value_t = 10000)]
    pub num_sentences: usize,
    /// Rng seed for the dataloader
    #[arg(long, default_value_t = 142)]
    pub dataloader_rng_seed: u64,
}

impl Default for CorpusArgs {
    fn default() -> Self {
        Self {
            corpus_path: "data/sentences.txt".to_string(),
            batch_size: 32,
            num_sentences: 10000,
            dataloader_rng_seed: 142,
        }
    }
}

/// Arguments for the tokenizer training.
#[derive(Parser, Debug, Clone)]
pub struct TokenizerArgs {
    /// The sentences to train on
    #[command(flatten)]
    pub corpus: CorpusArgs,
    /// Output tokenizer JSON file
    #[arg(long, default_value = "byteBPE.json")]
    pub tokenizer_path: String,
    /// Target vocabulary size
    #[arg(long, default_value_t = 30000)]
    pub vocab_size: usize,
    /// Minimum frequency of a pair to be merged
    #[arg(long, default_value_t = 2)]
    pub min_frequency: u64,
}

/// Arguments for the RNN model.
#[derive(Parser, Debug, Clone, Copy)]
pub struct RnnArgs {
    /// The size of the token embedding
    #[arg(short = 'I', long, default_value_t = 10)]
    pub in_embd: i64,
    /// The size of the hidden state
    #[arg(short = 'H', long, default_value_t = 12)]
    pub h_embd: i64,
}

impl Default for RnnArgs {
    fn default() -> Self {
        Self {
            in_embd: 10,
            h_embd: 12,
        }
    }
}

/// Training parameters.
#[derive(Parser, Debug, Clone)]
pub struct TrainingParameters {
    /// The sentences to train on
    #[command(flatten)]
    pub corpus: CorpusArgs,

    /// Tokenizer JSON file
    #[arg(long, default_value = "byteBPE.json")]
    pub tokenizer_path: String,

    /// The model
    #[command(flatten)]
    pub model: RnnArgs,

    /// Learning rate
    #[arg(long, default_value_t = 1e-3)]
    pub lr: f64,
    /// Number of epochs
    #[arg(long, default_value_t = 1)]
    pub n_epochs: usize,

    /// Maximum gradient norm - 0.0 means no clipping.
    #[arg(long, default_value_t = 0.0)]
    pub max_grad_norm: f64,

    /// Fraction of the sentences held out to estimate the validation loss -
    /// 0.0 trains on all of them.
    #[arg(long, default_value_t = 0.0)]
    pub valid_fraction: f64,
    /// Number of sentences trained on before evaluating the losses on the
    /// training and validation sets - 0 evaluates them once, at the end.
    #[arg(long, default_value_t = 1000)]
    pub steps_between_loss_estimation: usize,
    /// Number of sentences to use for estimating the losses.
    #[arg(long, default_value_t = 100)]
    pub loss_estimation_steps: usize,

    /// Prompt to use for an example after the training
    #[arg(long)]
    pub prompt: Option<String>,
    /// Maximum number of tokens generated from the prompt
    #[arg(long, default_value_t = 50)]
    pub max_new_tokens: usize,
    /// Number of most likely next tokens of the prompt to print - 0 prints
    /// none.
    #[arg(long, default_value_t = 0)]
    pub top_k: usize,

    /// Name of the run
    #[arg(long)]
    pub run_name: Option<String>,

    /// Path to the tensorboard directory
    /// If not provided, no tensorboard logging will be done.
    #[arg(long)]
    pub tensorboard_dir: Option<String>,
}

impl Default for TrainingParameters {
    fn default() -> Self {
        Self {
            corpus: CorpusArgs::default(),
            tokenizer_path: "byteBPE.json".to_string(),
            model: RnnArgs::default(),
            lr: 1e-3,
            n_epochs: 1,
            max_grad_norm: 0.0,
            valid_fraction: 0.0,
            steps_between_loss_estimation: 1000,
            loss_estimation_steps: 100,
            prompt: None,
            max_new_tokens: 50,
            top_k: 0,
            run_name: None,
            tensorboard_dir: None,
        }
    }
}

/// The configuration for the learning process
#[derive(Debug, Clone)]
pub struct LearnConfig {
    /// The number of epochs to train
    pub n_epochs: usize,
    /// The learning rate
    pub lr: f64,
    /// The number of sentences between loss estimation
    pub steps_between_loss_estimation: usize,
    /// The number of sentences to estimate the loss
    pub loss_estimation_steps: usize,
    /// The maximum gradient norm
    pub max_grad_norm: Option<f64>,
}

impl From<&TrainingParameters> for LearnConfig {
    fn from(training_params: &TrainingParameters) -> Self {
        Self {
            n_epochs: training_params.n_epochs,
            lr: training_params.lr,
            steps_between_loss_estimation: training_params.steps_between_loss_estimation,
            loss_estimation_steps: training_params.loss_estimation_steps,
            max_grad_norm: if training_params.max_grad_norm > 0. {
                Some(training_params.max_grad_norm)
            } else {
                None
            },
        }
    }
}
