use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use tokenizers::models::bpe::{BpeTrainerBuilder, BPE};
use tokenizers::normalizers::NormalizerWrapper;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::processors::template::TemplateProcessing;
use tokenizers::{AddedToken, TokenizerBuilder, TokenizerImpl};

/// Start of sentence.
pub const START_TOKEN: &str = "[START]";
/// End of sentence.
pub const END_TOKEN: &str = "[END]";
/// Separator.
pub const SEP_TOKEN: &str = "[SEP]";
/// Padding.
pub const PAD_TOKEN: &str = "[PAD]";

/// The special tokens, in the order of their ids.
pub const SPECIAL_TOKENS: [&str; 4] = [START_TOKEN, END_TOKEN, SEP_TOKEN, PAD_TOKEN];

/// Tokenizer interface used by the training loop.
pub trait Tokenizer {
    /// Encode a sentence, special tokens included.
    fn encode(&self, s: &str) -> Result<Vec<i64>>;
    /// Decode a sequence of tokens, special tokens skipped.
    fn decode(&self, tokens: &[i64]) -> Result<String>;
    /// Return the size of the vocabulary.
    fn vocab_size(&self) -> usize;
    /// Return the id of a token if it is in the vocabulary.
    fn token_id(&self, token: &str) -> Option<i64>;
}

/// Parameters of the BPE training.
#[derive(Debug, Clone)]
pub struct TokenizerConfig {
    /// Target vocabulary size, special tokens and byte alphabet included.
    pub vocab_size: usize,
    /// Minimum number of occurrences of a pair to be merged.
    pub min_frequency: u64,
    /// Show the progress bars of the trainer.
    pub show_progress: bool,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30000,
            min_frequency: 2,
            show_progress: false,
        }
    }
}

/// Byte-level BPE tokenizer.
///
/// A sentence `s` is encoded as `[START] s [SEP] [END]`. The closing
/// `[END]` comes from the saved template, so files whose post-processor only
/// produces `[START] s [SEP]` (e.g. `BertProcessing`) are not loaded.
pub struct BpeTokenizer {
    tokenizer: BpeTokenizerImpl,
}

type BpeTokenizerImpl =
    TokenizerImpl<BPE, NormalizerWrapper, ByteLevel, TemplateProcessing, ByteLevel>;

fn post_processor() -> Result<TemplateProcessing> {
    let id = |token: &str| {
        SPECIAL_TOKENS
            .iter()
            .position(|t| *t == token)
            .map(|i| i as u32)
            .ok_or_else(|| anyhow!("{} is not a special token", token))
    };

    let template = TemplateProcessing::builder()
        .try_single(format!("{START_TOKEN} $A {SEP_TOKEN} {END_TOKEN}"))
        .map_err(|e| anyhow!("invalid single template: {}", e))?
        .try_pair(format!(
            "{START_TOKEN} $A {SEP_TOKEN} $B:1 {SEP_TOKEN}:1 {END_TOKEN}:1"
        ))
        .map_err(|e| anyhow!("invalid pair template: {}", e))?
        .special_tokens(vec![
            (START_TOKEN, id(START_TOKEN)?),
            (SEP_TOKEN, id(SEP_TOKEN)?),
            (END_TOKEN, id(END_TOKEN)?),
        ])
        .build()
        .map_err(|e| anyhow!("cannot build the post processor: {}", e))?;

    Ok(template)
}

/// Train a byte-level BPE tokenizer on sentences.
pub fn train_bpe<I, S>(sentences: I, config: &TokenizerConfig) -> Result<BpeTokenizer>
where
    I: Iterator<Item = S> + Send,
    S: AsRef<str> + Send,
{
    let mut trainer = BpeTrainerBuilder::new()
        .show_progress(config.show_progress)
        .vocab_size(config.vocab_size)
        .min_frequency(config.min_frequency)
        .initial_alphabet(ByteLevel::alphabet())
        .special_tokens(
            SPECIAL_TOKENS
                .iter()
                .map(|t| AddedToken::from(t.to_string(), true))
                .collect(),
        )
        .build();

    let mut tokenizer: BpeTokenizerImpl = TokenizerBuilder::new()
        .with_model(BPE::default())
        .with_normalizer(None)
        .with_pre_tokenizer(Some(ByteLevel::default().add_prefix_space(false)))
        .with_post_processor(Some(post_processor()?))
        .with_decoder(Some(ByteLevel::default()))
        .build()
        .map_err(|e| anyhow!("cannot build the tokenizer: {}", e))?;

    // the trainer has no way to report an empty corpus
    let mut n_sentences = 0usize;
    let sentences = sentences.inspect(|_| n_sentences += 1);

    tokenizer
        .train(&mut trainer, sentences)
        .map_err(|e| anyhow!("BPE training failed: {}", e))?;

    if n_sentences == 0 {
        bail!("cannot train a tokenizer without sentences");
    }

    // ids of the special tokens are hardcoded in the post processor
    for (i, token) in SPECIAL_TOKENS.iter().enumerate() {
        if tokenizer.token_to_id(token) != Some(i as u32) {
            bail!("special token {} was not assigned id {}", token, i);
        }
    }

    tracing::info!(
        sentences = n_sentences,
        vocab_size = tokenizer.get_vocab_size(true),
        "BPE tokenizer trained"
    );

    Ok(BpeTokenizer { tokenizer })
}

impl BpeTokenizer {
    /// Load a tokenizer from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = BpeTokenizerImpl::from_file(path)
            .map_err(|e| anyhow!("Cannot load tokenizer from '{}': {}", path.display(), e))?;

        for token in SPECIAL_TOKENS {
            tokenizer
                .token_to_id(token)
                .with_context(|| format!("'{}' has no {} token", path.display(), token))?;
        }

        Ok(Self { tokenizer })
    }

    /// Save the tokenizer to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.tokenizer
            .save(path, false)
            .map_err(|e| anyhow!("Cannot save tokenizer to '{}': {}", path.display(), e))
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode(&self, s: &str) -> Result<Vec<i64>> {
        let encoding = self
            .tokenizer
            .encode(s, true)
            .map_err(|e| anyhow!("cannot encode {:?}: {}", s, e))?;
        Ok(encoding.get_ids().iter().map(|&id| id as i64).collect())
    }

    fn decode(&self, tokens: &[i64]) -> Result<String> {
        let ids = tokens.iter().map(|&id| id as u32).collect::<Vec<_>>();
        self.tokenizer
            .decode(&ids, true)
            .map_err(|e| anyhow!("cannot decode {:?}: {}", tokens, e))
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    fn token_id(&self, token: &str) -> Option<i64> {
        self.tokenizer.token_to_id(token).map(|id| id as i64)
    }
}
