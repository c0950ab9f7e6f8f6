use anyhow::{bail, Result};
use rand::SeedableRng;
use tch::nn::VarStore;
use tch::{Device, Tensor};

use crate::config::{CorpusArgs, LearnConfig, RnnArgs, TokenizerArgs, TrainingParameters};
use crate::data::{load_sentences, split, SentenceLoader};
use crate::learn::logger::TensorboardReporter;
use crate::learn::{learn, Observer, PbProgressReporter};
use crate::model::rnn::{Rnn, RnnConfig};
use crate::model::LanguageModel;
use crate::tokenizer::{train_bpe, BpeTokenizer, Tokenizer, TokenizerConfig, END_TOKEN};

/// Next token probabilities
pub fn next_token(
    device: Device,
    model: &dyn LanguageModel,
    tokenizer: &dyn Tokenizer,
    xs: &str,
) -> Result<Vec<(usize, f64)>> {
    let xs = prompt_tokens(tokenizer, xs)?;
    let xs = Tensor::from_slice(&xs).to(device);
    let probs = model.probabilities(&xs);
    let probs: Vec<f64> = probs.to(Device::Cpu).to_kind(tch::Kind::Double).try_into()?;

    // zip the vocab and the probs
    Ok(probs.into_iter().enumerate().collect::<Vec<_>>())
}

/// The `k` most likely next tokens, decoded, with their probability
pub fn top_next_tokens(
    device: Device,
    model: &dyn LanguageModel,
    tokenizer: &dyn Tokenizer,
    xs: &str,
    k: usize,
) -> Result<Vec<(String, f64)>> {
    let mut probs = next_token(device, model, tokenizer, xs)?;
    probs.sort_by(|(_, a), (_, b)| b.total_cmp(a));

    probs
        .into_iter()
        .take(k)
        .map(|(id, p)| Ok((tokenizer.decode(&[id as i64])?, p)))
        .collect()
}

/// Generate text
///
/// The generation stops at the end of sentence token or after `max_len`
/// tokens.
pub fn generate(
    device: Device,
    model: &dyn LanguageModel,
    tokenizer: &dyn Tokenizer,
    xs: &str,
    max_len: usize,
) -> Result<String> {
    let xs = prompt_tokens(tokenizer, xs)?;
    let xs = Tensor::from_slice(&xs).to(device);
    let ys = model.generate(&xs, max_len as i64, tokenizer.token_id(END_TOKEN));

    // decode the generated sequence of tokens
    let ys: Vec<i64> = ys.to(Device::Cpu).try_into()?;
    tokenizer.decode(&ys)
}

/// Tokens of a prompt: the encoded sentence without its closing tokens, so
/// that the model continues it.
fn prompt_tokens(tokenizer: &dyn Tokenizer, prompt: &str) -> Result<Vec<i64>> {
    let mut tokens = tokenizer.encode(prompt)?;
    // drop [SEP] [END]
    tokens.truncate(tokens.len().saturating_sub(2));
    if tokens.is_empty() {
        bail!("the tokenizer produced no token for {:?}", prompt);
    }
    Ok(tokens)
}

fn shuffled_sentences(corpus: &CorpusArgs) -> Result<Vec<String>> {
    let sentences = load_sentences(
        &corpus.corpus_path,
        corpus.batch_size,
        corpus.num_sentences,
    )?;
    if sentences.is_empty() {
        bail!("no sentence in '{}'", corpus.corpus_path);
    }

    let mut loader = SentenceLoader::new(sentences, corpus.batch_size);
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(corpus.dataloader_rng_seed);
    loader.shuffle(&mut rng);

    Ok(loader.sentences().map(String::from).collect())
}

/// Train the byte-level BPE tokenizer and save it
pub fn train_tokenizer(args: TokenizerArgs) -> Result<BpeTokenizer> {
    let sentences = shuffled_sentences(&args.corpus)?;

    tracing::info!(
        sentences = sentences.len(),
        vocab_size = args.vocab_size,
        min_frequency = args.min_frequency,
        "Starting training tokenizer"
    );

    let config = TokenizerConfig {
        vocab_size: args.vocab_size,
        min_frequency: args.min_frequency,
        show_progress: true,
    };
    let tokenizer = train_bpe(sentences.iter(), &config)?;

    tokenizer.save(&args.tokenizer_path)?;
    tracing::info!(path = %args.tokenizer_path, "tokenizer saved");

    Ok(tokenizer)
}

/// Create the model for a vocabulary size
pub fn create_model(vs: &VarStore, args: RnnArgs, vocab_size: usize) -> Rnn {
    let RnnArgs { in_embd, h_embd } = args;
    let config = RnnConfig {
        vocab_size: vocab_size as i64,
        in_embd,
        h_embd,
    };
    Rnn::new(&vs.root(), config)
}

/// Train the model
///
/// Returns the loss of every sentence trained on.
pub fn train(device: Device, training_params: TrainingParameters) -> Result<Vec<f64>> {
    let tokenizer = BpeTokenizer::from_file(&training_params.tokenizer_path)?;
    tracing::info!(
        path = %training_params.tokenizer_path,
        vocab_size = tokenizer.vocab_size(),
        "tokenizer loaded"
    );

    let vs = VarStore::new(device);
    let model = create_model(&vs, training_params.model, tokenizer.vocab_size());

    // print the names of the parameters
    vs.variables().iter().for_each(|(name, t)| {
        tracing::debug!("{}: {:?}", name, t.size());
    });

    // number of parameters
    let nb_params = vs
        .trainable_variables()
        .iter()
        .map(|t| t.size().iter().product::<i64>())
        .sum::<i64>();
    tracing::info!(nb_params, h_embd = model.h_embd(), "model created");

    let corpus = &training_params.corpus;
    let sentences = load_sentences(&corpus.corpus_path, corpus.batch_size, corpus.num_sentences)?;
    let (train_sentences, valid_sentences) = split(sentences, training_params.valid_fraction);
    tracing::info!(
        train = train_sentences.len(),
        valid = valid_sentences.len(),
        "sentences"
    );

    let mut train_dataloader = SentenceLoader::new(train_sentences, corpus.batch_size);
    let mut valid_dataloader = SentenceLoader::new(valid_sentences, corpus.batch_size);

    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(corpus.dataloader_rng_seed);

    // Initialize the progress bars
    let mut observer = Observer::default().with(Box::<PbProgressReporter>::default());
    if let Some(tensorboard_dir) = &training_params.tensorboard_dir {
        observer = observer.with(Box::new(TensorboardReporter::new(tensorboard_dir)));
    }

    let run_name = training_params
        .run_name
        .clone()
        .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());

    tracing::info!(run_name = %run_name, "Starting Training");

    let losses = learn(
        LearnConfig::from(&training_params),
        run_name,
        &mut train_dataloader,
        &mut valid_dataloader,
        &tokenizer,
        &mut rng,
        &vs,
        &model,
        &mut observer,
    )?;

    let n = losses.len().min(100);
    let recent = losses[losses.len() - n..].iter().sum::<f64>() / n.max(1) as f64;
    tracing::info!(
        sentences = losses.len(),
        mean_recent_loss = recent,
        "Done training"
    );

    if let Some(prompt) = &training_params.prompt {
        let gen = generate(
            device,
            &model,
            &tokenizer,
            prompt,
            training_params.max_new_tokens,
        )?;
        tracing::info!("after training: [{}]...{}", prompt, gen);

        if training_params.top_k > 0 {
            for (token, p) in top_next_tokens(
                device,
                &model,
                &tokenizer,
                prompt,
                training_params.top_k,
            )? {
                tracing::info!("next token {:?}: {:.4}", token, p);
            }
        }
    }

    Ok(losses)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;

    use super::*;

    fn corpus_file(name: &str) -> String {
        let path = std::env::temp_dir().join(format!(
            "rnnlm-actions-{}-{}.txt",
            name,
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        for _ in 0..5 {
            writeln!(file, "the cat sat on the mat.").unwrap();
            writeln!(file, "``the dog sat on the log").unwrap();
            writeln!(file, "a cat saw a dog.").unwrap();
            writeln!(file, "the end").unwrap();
        }
        path.to_string_lossy().to_string()
    }

    #[test]
    #[serial]
    fn test_train_tokenizer_then_model() {
        tch::manual_seed(42);
        let corpus_path = corpus_file("pipeline");
        let tokenizer_path = std::env::temp_dir()
            .join(format!("rnnlm-actions-{}.json", std::process::id()))
            .to_string_lossy()
            .to_string();

        let corpus = CorpusArgs {
            corpus_path: corpus_path.clone(),
            batch_size: 4,
            num_sentences: 20,
            dataloader_rng_seed: 7,
        };

        let tokenizer = train_tokenizer(TokenizerArgs {
            corpus: corpus.clone(),
            tokenizer_path: tokenizer_path.clone(),
            vocab_size: 300,
            min_frequency: 2,
        })
        .unwrap();
        assert!(std::path::Path::new(&tokenizer_path).exists());
        // periods and backticks were removed before training
        assert_eq!(
            tokenizer.decode(&tokenizer.encode("the cat").unwrap()).unwrap(),
            "the cat"
        );

        let training_params = TrainingParameters {
            corpus,
            tokenizer_path: tokenizer_path.clone(),
            n_epochs: 2,
            valid_fraction: 0.2,
            steps_between_loss_estimation: 8,
            loss_estimation_steps: 2,
            prompt: Some("the".to_string()),
            max_new_tokens: 5,
            top_k: 3,
            ..Default::default()
        };

        let losses = train(Device::Cpu, training_params).unwrap();
        // 16 training sentences, 2 epochs
        assert_eq!(losses.len(), 32);
        assert!(losses.iter().all(|l| l.is_finite() && *l > 0.));

        std::fs::remove_file(corpus_path).unwrap();
        std::fs::remove_file(tokenizer_path).unwrap();
    }

    #[test]
    #[serial]
    fn test_next_token_and_generate() {
        tch::manual_seed(1337);
        let sentences = ["the cat sat", "the dog sat", "a cat"]
            .map(String::from)
            .to_vec();
        let tokenizer = train_bpe(sentences.iter(), &TokenizerConfig::default()).unwrap();

        let vs = VarStore::new(Device::Cpu);
        let model = create_model(&vs, RnnArgs::default(), tokenizer.vocab_size());

        let probs = next_token(Device::Cpu, &model, &tokenizer, "the cat").unwrap();
        assert_eq!(probs.len(), tokenizer.vocab_size());
        let total: f64 = probs.iter().map(|(_, p)| p).sum();
        assert!((total - 1.).abs() < 1e-4);

        let top = top_next_tokens(Device::Cpu, &model, &tokenizer, "the cat", 3).unwrap();
        assert_eq!(top.len(), 3);
        assert!(top[0].1 >= top[1].1 && top[1].1 >= top[2].1);
        assert_eq!(top[0].1, probs.iter().map(|(_, p)| *p).fold(0., f64::max));

        let gen = generate(Device::Cpu, &model, &tokenizer, "the", 8).unwrap();
        // special tokens are skipped when decoding
        assert!(!gen.contains(END_TOKEN));
    }

    #[test]
    fn test_missing_tokenizer() {
        let training_params = TrainingParameters {
            tokenizer_path: "does/not/exist.json".to_string(),
            ..Default::default()
        };
        assert!(train(Device::Cpu, training_params).is_err());
    }
}
