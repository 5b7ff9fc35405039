//! Typed error boundary for the decoder core.
//!
//! `OutOfVocabulary` and `DictionaryMiss` are absorbed internally by the `Scorer` and
//! `PrefixTrie` respectively; they exist as variants so the internal helpers that can hit
//! either condition have a typed way to signal it to the one caller responsible for
//! absorbing it, not because callers of the public API ever see them surface.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("precondition violated: {detail}")]
    PreconditionViolation { detail: String },

    #[error("token absent from language model vocabulary")]
    OutOfVocabulary,

    #[error("extension would leave the lexicon dictionary")]
    DictionaryMiss,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DecoderError>;

impl DecoderError {
    pub fn precondition(detail: impl Into<String>) -> Self {
        DecoderError::PreconditionViolation {
            detail: detail.into(),
        }
    }
}
