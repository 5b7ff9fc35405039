//! n-gram scoring, lexicon FST walk, hot-word boost, and boundary detection.
//!
//! Grounded on `examples/original_source/native_client/ctcdecode/scorer.cpp` in full
//! (`is_scoring_boundary`, `make_ngram`, `get_log_cond_prob`, `load_trie_impl`,
//! `save_dictionary`) and `decoder_utils.cpp` (`get_utf8_str_len`, `split_into_codepoints`).

use std::collections::HashMap;
use std::io::{Read, Write};

use crate::alphabet::{codepoint_len, Alphabet};
use crate::dictionary::Dictionary;
use crate::error::{DecoderError, Result};
use crate::lm::{BackoffNgramModel, NgramModel, OOV_SCORE};
use crate::trie::{PrefixId, PrefixTrie, ROOT_CHARACTER};

const MAGIC: &[u8; 4] = b"TRIE";
const FILE_VERSION: u32 = 6;

pub struct Scorer {
    pub alpha: f64,
    pub beta: f64,
    max_order: usize,
    is_utf8_mode: bool,
    language_model: Box<dyn NgramModel>,
    dictionary: Option<Dictionary>,
    /// Opt-in resolution of open question 9(a): when `true`, an extension leaving the
    /// lexicon FST is treated as a dictionary miss (no child created). Default behaviour
    /// (`false`) never gates extension on the FST walk.
    constrained: bool,
    hot_words: HashMap<String, f32>,
}

impl Scorer {
    pub fn new(
        alpha: f64,
        beta: f64,
        is_utf8_mode: bool,
        language_model: Box<dyn NgramModel>,
        dictionary: Option<Dictionary>,
        constrained: bool,
        hot_words: HashMap<String, f32>,
    ) -> Self {
        let max_order = language_model.order();
        Scorer {
            alpha,
            beta,
            max_order,
            is_utf8_mode,
            language_model,
            dictionary,
            constrained,
            hot_words,
        }
    }

    pub fn is_utf8_mode(&self) -> bool {
        self.is_utf8_mode
    }

    pub fn max_order(&self) -> usize {
        self.max_order
    }

    pub fn dictionary(&self) -> Option<&Dictionary> {
        self.dictionary.as_ref()
    }

    pub fn constrained(&self) -> bool {
        self.constrained
    }

    /// `is_scoring_boundary`: word mode checks the label about to be emitted
    /// against `space_label`; UTF-8 mode walks back from `scoring_ref` to the nearest
    /// codepoint-leading byte and checks the accumulated byte count matches what that
    /// leading byte's bit pattern demands.
    pub fn is_scoring_boundary(
        &self,
        trie: &PrefixTrie,
        alphabet: &Alphabet,
        scoring_ref: PrefixId,
        new_label: u32,
    ) -> bool {
        if !self.is_utf8_mode {
            return alphabet.space_label() == Some(new_label);
        }
        match distance_to_codepoint_boundary(trie, alphabet, scoring_ref) {
            Some((distance, boundary_byte)) => distance == codepoint_len(boundary_byte),
            None => false,
        }
    }

    /// Walks backward from `tail` up to `max_order` word-or-codepoint boundaries,
    /// concatenating labels between boundaries and decoding each group, returned oldest
    /// first.
    pub fn make_ngram(&self, trie: &PrefixTrie, alphabet: &Alphabet, tail: PrefixId) -> Vec<String> {
        let mut groups = Vec::new();
        let mut node = Some(tail);
        while groups.len() < self.max_order {
            let current = match node {
                Some(n) => n,
                None => break,
            };
            let (mut labels, next) = self.prev_group(trie, alphabet, current);
            labels.reverse();
            if !labels.is_empty() {
                groups.push(alphabet.decode(&labels));
            }
            node = next;
        }
        groups.reverse();
        groups
    }

    /// Walks backward from `start`, collecting labels until a boundary, returning the
    /// collected labels in tail-to-head order and the node just past the boundary (where
    /// the next group's walk resumes), or `None` if it reached the root.
    fn prev_group(
        &self,
        trie: &PrefixTrie,
        alphabet: &Alphabet,
        start: PrefixId,
    ) -> (Vec<u32>, Option<PrefixId>) {
        let mut labels = Vec::new();
        let mut node = start;
        loop {
            let character = trie.node(node).character;
            if character == ROOT_CHARACTER {
                return (labels, None);
            }
            if !self.is_utf8_mode && alphabet.space_label() == Some(character) {
                return (labels, trie.node(node).parent);
            }
            labels.push(character);
            if self.is_utf8_mode {
                let mut forward = labels.clone();
                forward.reverse();
                if is_complete_codepoint(alphabet, &forward) {
                    return (labels, trie.node(node).parent);
                }
            }
            match trie.node(node).parent {
                Some(p) => node = p,
                None => return (labels, None),
            }
        }
    }

    /// Natural-log conditional probability of `tokens`, with hot-word boosts folded in and
    /// OOV short-circuiting.
    pub fn hot_boosted_log_prob(&self, tokens: &[String], bos: bool, eos: bool) -> f64 {
        let hot_boost: f64 = tokens
            .iter()
            .filter_map(|token| self.hot_words.get(token))
            .map(|&boost| boost as f64)
            .sum();

        let mut state = self.language_model.start(!bos);
        let mut total = hot_boost;
        for token in tokens {
            let (next_state, lp) = self.language_model.score(&state, token);
            total += lp;
            if lp <= OOV_SCORE {
                return total;
            }
            state = next_state;
        }
        if eos {
            total += self.language_model.finish(&state);
        }
        total
    }

    /// Writes the binary trie file: 4-byte magic, `FILE_VERSION`, `is_utf8_mode`, `alpha`,
    /// `beta`, then the lexicon FST bytes.
    pub fn save_trie(&self, mut w: impl Write) -> Result<()> {
        let dictionary = self
            .dictionary
            .as_ref()
            .ok_or_else(|| DecoderError::precondition("no dictionary attached to save"))?;
        w.write_all(MAGIC)?;
        w.write_all(&FILE_VERSION.to_le_bytes())?;
        w.write_all(&[self.is_utf8_mode as u8])?;
        w.write_all(&self.alpha.to_le_bytes())?;
        w.write_all(&self.beta.to_le_bytes())?;
        w.write_all(dictionary.to_bytes())?;
        Ok(())
    }

    /// Reads the binary trie file header plus the trailing FST, returning
    /// `(is_utf8_mode, alpha, beta, dictionary)`. A magic or version mismatch is a fatal
    /// `PreconditionViolation`.
    pub fn load_trie(mut r: impl Read) -> Result<(bool, f64, f64, Dictionary)> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(DecoderError::precondition("scorer file has invalid magic"));
        }
        let mut version_buf = [0u8; 4];
        r.read_exact(&mut version_buf)?;
        let version = u32::from_le_bytes(version_buf);
        if version != FILE_VERSION {
            return Err(DecoderError::precondition(format!(
                "scorer file version {version} != expected {FILE_VERSION}"
            )));
        }
        let mut flag = [0u8; 1];
        r.read_exact(&mut flag)?;
        let is_utf8_mode = flag[0] != 0;

        let mut f64_buf = [0u8; 8];
        r.read_exact(&mut f64_buf)?;
        let alpha = f64::from_le_bytes(f64_buf);
        r.read_exact(&mut f64_buf)?;
        let beta = f64::from_le_bytes(f64_buf);

        let mut fst_bytes = Vec::new();
        r.read_to_end(&mut fst_bytes)?;
        let dictionary = Dictionary::from_bytes(fst_bytes)?;

        Ok((is_utf8_mode, alpha, beta, dictionary))
    }

    /// Loads an ARPA n-gram model together with a previously-saved binary trie file,
    /// producing a ready-to-use `Scorer`.
    pub fn load(
        lm_reader: impl std::io::BufRead,
        trie_reader: impl Read,
        hot_words: HashMap<String, f32>,
        constrained: bool,
    ) -> Result<Self> {
        let model = BackoffNgramModel::from_reader(lm_reader)?;
        let (is_utf8_mode, alpha, beta, dictionary) = Self::load_trie(trie_reader)?;
        Ok(Scorer::new(
            alpha,
            beta,
            is_utf8_mode,
            Box::new(model),
            Some(dictionary),
            constrained,
            hot_words,
        ))
    }
}

fn distance_to_codepoint_boundary(
    trie: &PrefixTrie,
    alphabet: &Alphabet,
    start: PrefixId,
) -> Option<(usize, u8)> {
    let mut node = start;
    let mut collected = 0usize;
    loop {
        let character = trie.node(node).character;
        if character == ROOT_CHARACTER {
            return None;
        }
        let unit = alphabet.decode_single(character)?;
        collected += unit.len();
        let first_byte = unit[0];
        if (first_byte & 0xC0) != 0x80 {
            return Some((collected, first_byte));
        }
        node = trie.node(node).parent?;
    }
}

fn is_complete_codepoint(alphabet: &Alphabet, labels: &[u32]) -> bool {
    let mut bytes = Vec::new();
    for &label in labels {
        match alphabet.decode_single(label) {
            Some(unit) => bytes.extend_from_slice(unit),
            None => return false,
        }
    }
    match bytes.first() {
        Some(&first) => codepoint_len(first) == bytes.len(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::LmState;
    use std::io::Cursor;

    struct FixedModel {
        order: usize,
        known: Vec<&'static str>,
    }

    impl NgramModel for FixedModel {
        fn order(&self) -> usize {
            self.order
        }
        fn start(&self, _start_with_nothing: bool) -> LmState {
            LmState::default()
        }
        fn score(&self, state: &LmState, word: &str) -> (LmState, f64) {
            if self.known.contains(&word) {
                (state.clone(), -0.5)
            } else {
                (state.clone(), OOV_SCORE)
            }
        }
        fn finish(&self, _state: &LmState) -> f64 {
            0.0
        }
    }

    fn scorer(is_utf8_mode: bool, hot_words: HashMap<String, f32>) -> Scorer {
        Scorer::new(
            1.0,
            0.5,
            is_utf8_mode,
            Box::new(FixedModel {
                order: 3,
                known: vec!["ab"],
            }),
            None,
            false,
            hot_words,
        )
    }

    #[test]
    fn word_mode_boundary_is_the_space_label() {
        let alphabet = Alphabet::from_reader(Cursor::new("a\nb\n \n")).unwrap();
        let mut trie = PrefixTrie::new(crate::timestep_tree::TimestepTree::new().root());
        let root = trie.root();
        let a = trie.get_or_create_child(root, 0, -0.1);
        let s = scorer(false, HashMap::new());
        assert!(s.is_scoring_boundary(&trie, &alphabet, a, 2));
        assert!(!s.is_scoring_boundary(&trie, &alphabet, a, 0));
    }

    #[test]
    fn hot_word_boost_adds_to_log_prob() {
        let s_plain = scorer(false, HashMap::new());
        let mut hot = HashMap::new();
        hot.insert("ab".to_string(), 5.0);
        let s_boosted = scorer(false, hot);
        let tokens = vec!["ab".to_string()];
        let plain = s_plain.hot_boosted_log_prob(&tokens, true, false);
        let boosted = s_boosted.hot_boosted_log_prob(&tokens, true, false);
        assert!((boosted - plain - 5.0).abs() < 1e-9);
    }

    // S5 - two candidates tied under the language model; boosting one as a hot word flips
    // which scores higher.
    #[test]
    fn scenario_s5_hot_word_boost_flips_top_candidate() {
        let model_words = vec!["cat", "cab"];
        let make = |hot_words: HashMap<String, f32>| {
            Scorer::new(
                1.0,
                0.5,
                false,
                Box::new(FixedModel {
                    order: 3,
                    known: model_words.clone(),
                }),
                None,
                false,
                hot_words,
            )
        };

        let plain = make(HashMap::new());
        let cat = vec!["cat".to_string()];
        let cab = vec!["cab".to_string()];
        assert_eq!(
            plain.hot_boosted_log_prob(&cat, true, false),
            plain.hot_boosted_log_prob(&cab, true, false)
        );

        let mut hot_words = HashMap::new();
        hot_words.insert("cab".to_string(), 5.0);
        let boosted = make(hot_words);
        assert!(
            boosted.hot_boosted_log_prob(&cab, true, false)
                > boosted.hot_boosted_log_prob(&cat, true, false)
        );
    }

    #[test]
    fn oov_terminates_scoring() {
        let s = scorer(false, HashMap::new());
        let tokens = vec!["ab".to_string(), "zzz".to_string(), "ab".to_string()];
        let total = s.hot_boosted_log_prob(&tokens, true, false);
        // -0.5 (ab) + OOV_SCORE (zzz), terminating before the second "ab".
        assert!((total - (-0.5 + OOV_SCORE)).abs() < 1e-9);
    }

    #[test]
    fn trie_file_round_trips() {
        use crate::dictionary::{encode_word, Dictionary};
        let alphabet = Alphabet::from_reader(Cursor::new("a\nb\n \n")).unwrap();
        let word = encode_word(&alphabet, "ab", false).unwrap();
        let dictionary = Dictionary::build(vec![word]).unwrap();
        let s = Scorer::new(
            1.5,
            0.25,
            false,
            Box::new(FixedModel {
                order: 2,
                known: vec!["ab"],
            }),
            Some(dictionary),
            false,
            HashMap::new(),
        );
        let mut buf = Vec::new();
        s.save_trie(&mut buf).unwrap();
        let (is_utf8_mode, alpha, beta, _dict) = Scorer::load_trie(Cursor::new(buf)).unwrap();
        assert!(!is_utf8_mode);
        assert_eq!(alpha, 1.5);
        assert_eq!(beta, 0.25);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 20];
        assert!(Scorer::load_trie(Cursor::new(buf)).is_err());
    }
}
