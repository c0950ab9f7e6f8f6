use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use rand::prelude::*;
use rayon::prelude::*;
use tch::{Device, Tensor};

/// Characters stripped from every sentence before tokenization.
const STRIPPED_CHARS: [char; 2] = ['`', '.'];

/// Remove the backticks and periods of a sentence.
pub fn clean_sentence(sentence: &str) -> String {
    sentence.replace(STRIPPED_CHARS, "")
}

/// Stream the sentences of a corpus file (one sentence per line).
///
/// Lines are read in batches of `batch_size`, cleaned with
/// [`clean_sentence`], and reading stops after `num_sentences / batch_size`
/// batches. The last batch may be partial if the file ends first.
///
/// A quota of zero batches (`num_sentences < batch_size`) does not limit the
/// number of batches: the whole file is read.
pub fn load_sentences<P: AsRef<Path>>(
    path: P,
    batch_size: usize,
    num_sentences: usize,
) -> Result<Vec<String>> {
    if batch_size == 0 {
        bail!("batch size must be positive");
    }

    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Cannot open corpus file '{}'", path.display()))?;
    let lines = BufReader::new(file).lines();

    let max_batches = num_sentences / batch_size;
    if max_batches == 0 {
        tracing::warn!(
            num_sentences,
            batch_size,
            "fewer sentences requested than a batch holds - reading the whole corpus"
        );
    }

    let mut sentences = Vec::new();
    let mut n_batches = 0;
    for batch in &lines.chunks(batch_size) {
        let batch = batch
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("Cannot read corpus file '{}'", path.display()))?;

        sentences.par_extend(batch.par_iter().map(|s| clean_sentence(s)));

        n_batches += 1;
        if n_batches == max_batches {
            break;
        }
    }

    tracing::info!(
        path = %path.display(),
        sentences = sentences.len(),
        batches = n_batches,
        "corpus loaded"
    );

    Ok(sentences)
}

/// Split the sentences into a training and a validation set.
///
/// The validation set is the last `valid_fraction` of the sentences.
pub fn split(mut sentences: Vec<String>, valid_fraction: f64) -> (Vec<String>, Vec<String>) {
    let valid_fraction = valid_fraction.clamp(0., 1.);
    let n_valid = (sentences.len() as f64 * valid_fraction) as usize;
    let valid = sentences.split_off(sentences.len() - n_valid);
    (sentences, valid)
}

/// Teacher forcing inputs and targets of an encoded sentence.
///
/// The inputs are all the tokens but the last one, the targets are all the
/// tokens but the first one. Returns `None` when the sentence has less than
/// two tokens, i.e. no transition to learn.
///
/// For example, [0, 7, 9, 2, 1] gives the inputs [0, 7, 9, 2] and the targets
/// [7, 9, 2, 1].
pub fn teacher_forcing(tokens: &[i64], device: Device) -> Option<(Tensor, Tensor)> {
    if tokens.len() < 2 {
        return None;
    }

    let n = tokens.len();
    let xs = Tensor::from_slice(&tokens[..n - 1]).to(device);
    let ys = Tensor::from_slice(&tokens[1..]).to(device);
    Some((xs, ys))
}

/// Dataloader for sentences.
///
/// Batches are made of `batch_size` sentences. The last batch holds the
/// remaining sentences and may be shorter.
///
/// For example, with the sentences [a, b, c, d, e] and `batch_size` 2, the
/// loader returns [a, b], [c, d] and [e].
#[derive(Clone, Debug)]
pub struct SentenceLoader {
    sentences: Vec<String>,
    batch_size: usize,
    /// The order of the sentences
    order: Option<Vec<usize>>,
    /// The current position in the order
    pos: usize,
}

impl SentenceLoader {
    /// Create a new data loader
    pub fn new(sentences: Vec<String>, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be positive");
        Self {
            sentences,
            batch_size,
            order: None,
            pos: 0,
        }
    }

    /// Return the number of sentences
    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    /// True if there are no sentences
    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    /// Return the number of batches, the last one included even if partial
    pub fn n_batches(&self) -> usize {
        self.sentences.len().div_ceil(self.batch_size)
    }

    /// Pick a random order for the sentences and rewind
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        let mut order: Vec<usize> = (0..self.sentences.len()).collect();
        order.shuffle(rng);
        self.order = Some(order);
        self.pos = 0;
    }

    fn index(&self, i: usize) -> usize {
        match &self.order {
            Some(order) => order[i],
            None => i,
        }
    }

    /// Returns the next batch.
    /// If `shuffle` has been called, the order of the sentences is random.
    /// Otherwise, the sentences are returned in the order of the data.
    pub fn next_batch(&mut self) -> Option<Vec<&str>> {
        if self.pos >= self.sentences.len() {
            return None;
        }

        let end = (self.pos + self.batch_size).min(self.sentences.len());
        let batch = (self.pos..end)
            .map(|i| self.sentences[self.index(i)].as_str())
            .collect();
        self.pos = end;

        Some(batch)
    }

    /// Iterate over all the sentences in the current order
    pub fn sentences(&self) -> impl Iterator<Item = &str> + Send + '_ {
        (0..self.sentences.len()).map(move |i| self.sentences[self.index(i)].as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn corpus_file(name: &str, lines: &[&str]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "rnnlm-data-{}-{}.txt",
            name,
            std::process::id()
        ));
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    #[test]
    fn test_clean_sentence() {
        assert_eq!(
            clean_sentence("``he said. `yes`..."),
            "he said yes"
        );
        assert_eq!(clean_sentence("no change"), "no change");
        assert_eq!(clean_sentence(""), "");
    }

    #[test]
    fn test_load_sentences_limits_to_whole_batches() {
        let path = corpus_file("limit", &["a.", "b", "c", "d", "e", "f", "g"]);

        // 5 / 2 = 2 batches
        let sentences = load_sentences(&path, 2, 5).unwrap();
        assert_eq!(sentences, vec!["a", "b", "c", "d"]);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_load_sentences_short_file() {
        let path = corpus_file("short", &["a", "b", "c"]);

        // the last batch is partial
        let sentences = load_sentences(&path, 2, 100).unwrap();
        assert_eq!(sentences, vec!["a", "b", "c"]);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_load_sentences_zero_quota_reads_everything() {
        let path = corpus_file("zero", &["a", "b", "c", "d", "e"]);

        let sentences = load_sentences(&path, 4, 3).unwrap();
        assert_eq!(sentences.len(), 5);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_load_sentences_errors() {
        assert!(load_sentences("does/not/exist.txt", 2, 10).is_err());

        let path = corpus_file("batch0", &["a"]);
        assert!(load_sentences(&path, 0, 10).is_err());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_split() {
        let sentences: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let (train, valid) = split(sentences.clone(), 0.2);
        assert_eq!(train, sentences[..8]);
        assert_eq!(valid, sentences[8..]);

        let (train, valid) = split(sentences.clone(), 0.);
        assert_eq!(train.len(), 10);
        assert!(valid.is_empty());
    }

    #[test]
    fn test_teacher_forcing() {
        let (xs, ys) = teacher_forcing(&[0, 7, 9, 2, 1], Device::Cpu).unwrap();
        assert_eq!(Vec::<i64>::try_from(xs).unwrap(), vec![0, 7, 9, 2]);
        assert_eq!(Vec::<i64>::try_from(ys).unwrap(), vec![7, 9, 2, 1]);

        assert!(teacher_forcing(&[0], Device::Cpu).is_none());
        assert!(teacher_forcing(&[], Device::Cpu).is_none());
    }

    #[test]
    fn test_sentence_loader() {
        let sentences = ["a", "b", "c", "d", "e"].map(String::from).to_vec();
        let mut loader = SentenceLoader::new(sentences, 2);

        assert_eq!(loader.len(), 5);
        assert_eq!(loader.n_batches(), 3);

        assert_eq!(loader.next_batch().unwrap(), vec!["a", "b"]);
        assert_eq!(loader.next_batch().unwrap(), vec!["c", "d"]);
        assert_eq!(loader.next_batch().unwrap(), vec!["e"]);
        assert!(loader.next_batch().is_none());
    }

    #[test]
    fn test_sentence_loader_shuffle() {
        let sentences = ["a", "b", "c", "d", "e", "f", "g"]
            .map(String::from)
            .to_vec();
        let mut loader = SentenceLoader::new(sentences, 3);
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(123);

        loader.shuffle(&mut rng);

        let mut seen = Vec::new();
        while let Some(batch) = loader.next_batch() {
            assert!(batch.len() <= 3);
            seen.extend(batch.into_iter().map(String::from));
        }
        assert_eq!(seen, loader.sentences().collect::<Vec<_>>());

        // every sentence exactly once
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d", "e", "f", "g"]);

        // the same seed gives the same order
        let mut other = loader.clone();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(123);
        other.shuffle(&mut rng);
        assert_eq!(
            other.sentences().collect::<Vec<_>>(),
            loader.sentences().collect::<Vec<_>>()
        );
    }
}
