//! CTC prefix beam-search decoding: turns a time x class matrix of acoustic probabilities
//! into ranked text hypotheses, optionally guided by an n-gram language model, a lexicon
//! FST, and a hot-words table.

use std::env;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod alphabet;
pub mod batch;
pub mod decoder;
pub mod dictionary;
pub mod error;
pub mod lm;
pub mod scorer;
pub mod timestep_tree;
pub mod trie;

pub use decoder::{DecoderState, Output};
pub use error::{DecoderError, Result};

/// Convenience function to setup logging for any binaries I create. Automatically sets all
/// binaries and this crate to `info` logging by default.
pub fn setup_logging() {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("ctc_decoder=info,decode=info,build_scorer=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber).unwrap();
}
