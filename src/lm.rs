//! n-gram language model collaborator.
//!
//! The `NgramModel` trait is the only thing the core mandates; `BackoffNgramModel` is this
//! crate's one concrete implementation, parsing the standard ARPA text format. The trait's
//! shape is grounded in `scorer.cpp`'s `start`/`score`/`finish`/`get_log_cond_prob` (which
//! threads a `lm::ngram::State` through KenLM calls); the ARPA parser itself is new, since the
//! historical backend vendors a third-party KenLM model this crate does not reproduce.

use std::collections::HashMap;
use std::io::{self, BufRead};

/// Large negative constant returned for an out-of-vocabulary token.
pub const OOV_SCORE: f64 = -1000.0;

/// `log10(x) * NUM_FLT_LOGE == ln(x)`; named after the historical conversion constant in
/// `scorer.cpp::get_log_cond_prob` (`cond_prob / NUM_FLT_LOGE`), inverted here because this
/// crate's ARPA loader starts from log10 text rather than a log10-internally KenLM model.
pub const NUM_FLT_LOGE: f64 = std::f64::consts::LN_10;

pub const BOS: &str = "<s>";
pub const EOS: &str = "</s>";
const UNK: &str = "<unk>";

/// Opaque per-decode LM state: the trailing context words, most recent last. Cheap to clone,
/// never cached on the `Scorer` itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LmState {
    context: Vec<String>,
}

pub trait NgramModel: Send + Sync {
    fn order(&self) -> usize;
    fn start(&self, start_with_nothing: bool) -> LmState;
    fn score(&self, state: &LmState, word: &str) -> (LmState, f64);
    fn finish(&self, state: &LmState) -> f64;
}

#[derive(Default)]
struct NgramEntry {
    log_prob: f64,
    backoff: f64,
}

/// Katz-style backoff n-gram model loaded from an ARPA text file.
pub struct BackoffNgramModel {
    order: usize,
    // key: context words (oldest..newest) + trailing word, joined by '\u{1}'.
    entries: HashMap<String, NgramEntry>,
    vocab: HashMap<String, ()>,
}

fn ngram_key(context: &[String], word: &str) -> String {
    let mut key = context.join("\u{1}");
    if !key.is_empty() {
        key.push('\u{1}');
    }
    key.push_str(word);
    key
}

impl BackoffNgramModel {
    /// Parses an ARPA file: a `\data\` header with `ngram N=count` lines, one `\N-grams:`
    /// section per order (`log10prob word... [log10backoff]`), terminated by `\end\`.
    pub fn from_reader(reader: impl BufRead) -> io::Result<Self> {
        let mut order = 1usize;
        let mut entries = HashMap::new();
        let mut vocab = HashMap::new();
        let mut current_order = 0usize;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line == "\\data\\" || line == "\\end\\" {
                continue;
            }
            if let Some(rest) = line.strip_prefix("ngram ") {
                if let Some((n, _count)) = rest.split_once('=') {
                    if let Ok(n) = n.trim().parse::<usize>() {
                        order = order.max(n);
                    }
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix('\\') {
                if let Some(n) = rest.strip_suffix("-grams:") {
                    current_order = n.parse().unwrap_or(0);
                }
                continue;
            }
            if current_order == 0 {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 1 + current_order {
                tracing::warn!(%line, "skipping malformed ARPA n-gram line");
                continue;
            }
            let log10_prob: f64 = match fields[0].parse() {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!(%line, "skipping ARPA line with unparsable probability");
                    continue;
                }
            };
            let words = &fields[1..1 + current_order];
            let backoff: f64 = fields
                .get(1 + current_order)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);

            let (context, word) = words.split_at(words.len() - 1);
            let word = word[0].to_string();
            let context: Vec<String> = context.iter().map(|s| s.to_string()).collect();

            for w in context.iter().chain(std::iter::once(&word)) {
                vocab.insert(w.clone(), ());
            }

            entries.insert(
                ngram_key(&context, &word),
                NgramEntry {
                    log_prob: log10_prob * NUM_FLT_LOGE,
                    backoff: backoff * NUM_FLT_LOGE,
                },
            );
        }

        Ok(BackoffNgramModel {
            order,
            entries,
            vocab,
        })
    }

    fn backoff_weight(&self, context: &[String]) -> f64 {
        if context.is_empty() {
            return 0.0;
        }
        self.entries
            .get(&ngram_key(&context[..context.len() - 1], &context[context.len() - 1]))
            .map(|e| e.backoff)
            .unwrap_or(0.0)
    }

    fn log_prob(&self, context: &[String], word: &str) -> f64 {
        if let Some(entry) = self.entries.get(&ngram_key(context, word)) {
            return entry.log_prob;
        }
        if context.is_empty() {
            // Unigram floor: an in-vocabulary word with no explicit unigram row is
            // vanishingly unlikely in a well-formed ARPA file; callers only reach this
            // branch for vocabulary mismatches, not normal backoff recursion.
            return OOV_SCORE;
        }
        self.backoff_weight(context) + self.log_prob(&context[1..], word)
    }
}

impl NgramModel for BackoffNgramModel {
    fn order(&self) -> usize {
        self.order
    }

    fn start(&self, start_with_nothing: bool) -> LmState {
        if start_with_nothing {
            LmState::default()
        } else {
            LmState {
                context: vec![BOS.to_string()],
            }
        }
    }

    fn score(&self, state: &LmState, word: &str) -> (LmState, f64) {
        if !self.vocab.contains_key(word) {
            return (state.clone(), OOV_SCORE);
        }
        let context_len = self.order.saturating_sub(1);
        let start = state.context.len().saturating_sub(context_len);
        let log_p = self.log_prob(&state.context[start..], word);

        let mut next_context = state.context.clone();
        next_context.push(word.to_string());
        let keep_from = next_context.len().saturating_sub(context_len);
        let next_context = next_context[keep_from..].to_vec();

        (
            LmState {
                context: next_context,
            },
            log_p,
        )
    }

    fn finish(&self, state: &LmState) -> f64 {
        self.log_prob(&state.context, EOS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const ARPA: &str = "\\data\\\nngram 1=4\nngram 2=2\n\n\\1-grams:\n-1.0\t<unk>\n-0.1\t<s>\t-0.3\n-0.2\t</s>\n-0.5\thello\t-0.2\n\n\\2-grams:\n-0.05\t<s> hello\n-0.05\thello </s>\n\n\\end\\\n";

    #[test]
    fn parses_arpa_and_scores_known_word() {
        let model = BackoffNgramModel::from_reader(Cursor::new(ARPA)).unwrap();
        let state = model.start(false);
        let (state, lp) = model.score(&state, "hello");
        assert!(lp.is_finite());
        assert!(lp > OOV_SCORE);
        let eos_lp = model.finish(&state);
        assert!(eos_lp.is_finite());
    }

    #[test]
    fn oov_word_returns_oov_score_and_does_not_panic() {
        let model = BackoffNgramModel::from_reader(Cursor::new(ARPA)).unwrap();
        let state = model.start(true);
        let (_next, lp) = model.score(&state, "zzzznotinvocab");
        assert_eq!(lp, OOV_SCORE);
    }

    #[test]
    fn backoff_recursion_falls_back_to_unigram() {
        let model = BackoffNgramModel::from_reader(Cursor::new(ARPA)).unwrap();
        let state = LmState {
            context: vec!["hello".to_string(), "hello".to_string()],
        };
        let (_next, lp) = model.score(&state, "hello");
        assert!(lp.is_finite());
    }
}
