//! Lexicon FST: a deterministic, minimised finite-state acceptor over alphabet labels.
//!
//! Construction recipe and arc-labelling convention (`alphabet_label + 1`, `0` reserved for
//! the FST start state) grounded in
//! `examples/original_source/native_client/ctcdecode/scorer.cpp::fill_dictionary` and
//! `decoder_utils.cpp::add_word_to_fst`/`add_word_to_dictionary`. The `fst::Set`/raw-node
//! walk pattern is grounded in `examples/meilisearch-meilisearch/crates/milli/src/index.rs`
//! and `search/fst_utils.rs`, the strongest `fst`-crate usage in the example pack.

use fst::raw::Fst;
use fst::SetBuilder;

use crate::alphabet::Alphabet;
use crate::error::{DecoderError, Result};

/// Converts a vocabulary word into the byte key the lexicon FST indexes: each label in the
/// word's encoding shifted by one, with a trailing space-label byte in word mode (bare
/// codepoint spellings in UTF-8 mode). Returns `None` if the word contains a unit the
/// alphabet cannot encode — such words are silently dropped from the dictionary at build
/// time (distinct from the runtime `DictionaryMiss` the decoder absorbs while walking).
pub fn encode_word(alphabet: &Alphabet, word: &str, is_utf8_mode: bool) -> Option<Vec<u8>> {
    let labels = alphabet.encode(word)?;
    let mut key = Vec::with_capacity(labels.len() + 1);
    for label in labels {
        key.push(u8::try_from(label + 1).ok()?);
    }
    if !is_utf8_mode {
        let space = alphabet.space_label()?;
        key.push(u8::try_from(space + 1).ok()?);
    }
    Some(key)
}

/// An immutable, shareable lexicon FST plus the per-prefix state-walk helpers the decoder
/// needs. Built via insert (sorted, deduplicated) / the `fst` crate's own minimisation —
/// `fst::SetBuilder` already produces a minimal deterministic automaton, so no separate
/// rmepsilon/determinize/minimize pass is needed on top of it.
pub struct Dictionary {
    fst: fst::Set<Vec<u8>>,
}

impl Dictionary {
    pub fn build(words: impl IntoIterator<Item = Vec<u8>>) -> Result<Self> {
        let mut keys: Vec<Vec<u8>> = words.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut builder = SetBuilder::memory();
        for key in &keys {
            builder
                .insert(key)
                .map_err(|e| DecoderError::precondition(format!("building lexicon fst: {e}")))?;
        }
        let bytes = builder
            .into_inner()
            .map_err(|e| DecoderError::precondition(format!("finalising lexicon fst: {e}")))?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let fst = fst::Set::new(bytes)
            .map_err(|e| DecoderError::precondition(format!("invalid lexicon fst: {e}")))?;
        Ok(Dictionary { fst })
    }

    pub fn to_bytes(&self) -> &[u8] {
        self.fst.as_fst().as_bytes()
    }

    fn raw(&self) -> &Fst<Vec<u8>> {
        self.fst.as_fst()
    }

    pub fn root_state(&self) -> u64 {
        self.raw().root().addr() as u64
    }

    /// Walks one arc labelled `alphabet_label + 1` from `state`. Returns `None` if the label
    /// leaves the dictionary's accepted language at this point (a dictionary miss).
    pub fn transition(&self, state: u64, alphabet_label: u32) -> Option<u64> {
        let arc_label = u8::try_from(alphabet_label + 1).ok()?;
        let node = self.raw().node(state as usize);
        let idx = node.find_input(arc_label)?;
        Some(node.transition(idx).addr as u64)
    }

    pub fn is_final(&self, state: u64) -> bool {
        self.raw().node(state as usize).is_final()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn walks_accepted_words_and_rejects_others() {
        let alphabet = Alphabet::from_reader(Cursor::new("a\nb\n \n")).unwrap();
        let cat = encode_word(&alphabet, "ab", false).unwrap();
        let dict = Dictionary::build(vec![cat.clone()]).unwrap();

        let mut state = dict.root_state();
        for &byte in &cat {
            let label = byte as u32 - 1;
            state = dict.transition(state, label).expect("word should be accepted");
        }
        assert!(dict.is_final(state));

        let fresh = dict.root_state();
        assert!(dict.transition(fresh, 5).is_none());
    }

    #[test]
    fn words_with_unencodable_units_are_dropped_at_build_time() {
        let alphabet = Alphabet::from_reader(Cursor::new("a\nb\n \n")).unwrap();
        assert!(encode_word(&alphabet, "xyz", false).is_none());
    }
}
