//! rnnlm: train a byte-level BPE tokenizer and a vanilla RNN language model.
use anyhow::Result;
use clap::{Parser, Subcommand};
use rnnlm::actions;
use rnnlm::config::{Device, TokenizerArgs, TrainingParameters};

/// What to do.
#[derive(Subcommand, Debug, Clone)]
enum Action {
    /// Train the byte-level BPE tokenizer on the corpus
    Tokenizer {
        /// The tokenizer arguments
        #[command(flatten)]
        args: TokenizerArgs,
    },
    /// Train the RNN on the corpus, one sentence at a time
    Train {
        /// The training parameters
        #[command(flatten)]
        training_params: TrainingParameters,
    },
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The device to use
    #[arg(short, long, default_value = "cpu")]
    device: Device,

    /// The action to perform
    #[command(subcommand)]
    action: Action,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rnnlm=info")),
        )
        .init();

    let args = Args::parse();
    let device = tch::Device::from(args.device);

    // if not built in release mode, print a big warning
    #[cfg(debug_assertions)]
    {
        tracing::warn!("This is a debug build. It will be very slow.");
    }

    match args.action {
        Action::Tokenizer { args } => {
            actions::train_tokenizer(args)?;
        }
        Action::Train { training_params } => {
            tracing::info!(?device, "training");
            actions::train(device, training_params)?;
        }
    }

    Ok(())
}
