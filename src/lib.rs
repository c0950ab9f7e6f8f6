//! # The `rnnlm` crate
//!
//! A byte-level BPE tokenizer trained on a sentence corpus and a vanilla RNN
//! language model trained one sentence at a time on its tokens.

/// The `actions` module contains the top level operations of the command line.
pub mod actions;

/// The `config` module contains the command line arguments.
pub mod config;

/// The `data` module contains the structs and functions for loading the
/// sentences and generating batches.
pub mod data;

/// The `estimate` module estimates the loss of the model on held out sentences.
pub mod estimate;

/// The `learn` module contains the structs and functions for training the model.
pub mod learn;

/// The `model` module contains the structs and functions for the model.
pub mod model;

/// The `tokenizer` module trains and loads the byte-level BPE tokenizer.
pub mod tokenizer;
