//! Per-utterance beam-search driver: tracks a bounded set of candidate prefixes across
//! frames, extending each by the blank, repeat, or extension recurrence and pruning back to
//! the beam width after every frame.

use std::cmp::Ordering;
use std::sync::Arc;

use ndarray::ArrayView2;

use crate::alphabet::Alphabet;
use crate::error::{DecoderError, Result};
use crate::scorer::Scorer;
use crate::timestep_tree::TimestepTree;
use crate::trie::{log_sum_exp, PrefixId, PrefixTrie, ROOT_CHARACTER};

/// Frames with `prob[blank] >= DELAYED_START_THRESHOLD` are skipped until the first frame
/// drops below it, so the first emitted timestep doesn't include leading near-blank frames.
const DELAYED_START_THRESHOLD: f64 = 0.999;

#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub tokens: Vec<u32>,
    pub timesteps: Vec<u32>,
    pub confidence: f64,
}

pub struct DecoderState {
    alphabet: Arc<Alphabet>,
    scorer: Option<Arc<Scorer>>,
    beam_size: usize,
    cutoff_prob: f64,
    cutoff_top_n: usize,
    blank_id: u32,

    trie: PrefixTrie,
    timesteps: TimestepTree,
    prefixes: Vec<PrefixId>,
    start_expanding: bool,
    abs_time_step: u32,
}

impl DecoderState {
    pub fn new(
        alphabet: Arc<Alphabet>,
        beam_size: usize,
        cutoff_prob: f64,
        cutoff_top_n: usize,
        scorer: Option<Arc<Scorer>>,
    ) -> Result<Self> {
        if beam_size == 0 {
            return Err(DecoderError::precondition("beam_size must be > 0"));
        }
        if cutoff_top_n == 0 {
            return Err(DecoderError::precondition("cutoff_top_n must be > 0"));
        }
        if !(0.0..=1.0).contains(&cutoff_prob) {
            return Err(DecoderError::precondition("cutoff_prob must be in [0, 1]"));
        }

        let mut timesteps = TimestepTree::new();
        let mut trie = PrefixTrie::new(timesteps.root());
        if let Some(dictionary) = scorer.as_ref().and_then(|s| s.dictionary()) {
            let root = trie.root();
            trie.node_mut(root).fst_state = Some(dictionary.root_state());
        }
        let root = trie.root();
        let blank_id = alphabet.size() as u32;

        tracing::debug!(beam_size, cutoff_prob, cutoff_top_n, "decoder initialised");

        Ok(DecoderState {
            alphabet,
            scorer,
            beam_size,
            cutoff_prob,
            cutoff_top_n,
            blank_id,
            trie,
            timesteps,
            prefixes: vec![root],
            start_expanding: false,
            abs_time_step: 0,
        })
    }

    /// Feeds `time_dim` frames of `class_dim` class probabilities (`class_dim` must equal
    /// `alphabet.size() + 1`, the `+1` being the implicit blank column) through the beam
    /// search.
    pub fn next(&mut self, probs: ArrayView2<f64>) -> Result<()> {
        let (time_dim, class_dim) = probs.dim();
        if class_dim != self.alphabet.size() + 1 {
            return Err(DecoderError::precondition(format!(
                "class_dim {class_dim} != alphabet.size()+1 ({})",
                self.alphabet.size() + 1
            )));
        }

        for t in 0..time_dim {
            let row = probs.row(t);

            if !self.start_expanding {
                if row[self.blank_id as usize] < DELAYED_START_THRESHOLD {
                    self.start_expanding = true;
                } else {
                    self.abs_time_step += 1;
                    continue;
                }
            }

            self.step_frame(row);
            self.abs_time_step += 1;
        }

        tracing::trace!(time_dim, alive = self.prefixes.len(), "processed frame batch");
        Ok(())
    }

    fn step_frame(&mut self, row: ndarray::ArrayView1<f64>) {
        let pruned = pruned_log_probs(row.as_slice().expect("contiguous row"), self.cutoff_prob, self.cutoff_top_n);

        let scorer = self.scorer.clone();
        let (min_cutoff, full_beam) = match &scorer {
            Some(scorer) => {
                let mut sorted = self.prefixes.clone();
                sorted.sort_by(|&a, &b| compare_prefixes(&self.trie, a, b));
                let score_at_beam_size = sorted
                    .get(self.beam_size - 1)
                    .or_else(|| sorted.last())
                    .map(|&id| self.trie.node(id).score)
                    .unwrap_or(f64::NEG_INFINITY);
                let min_cutoff = score_at_beam_size
                    + row[self.blank_id as usize].ln()
                    - scorer.beta.max(0.0);
                (min_cutoff, sorted.len() == self.beam_size)
            }
            None => (f64::NEG_INFINITY, false),
        };

        let mut ordered_prefixes = self.prefixes.clone();
        ordered_prefixes.sort_by(|&a, &b| compare_prefixes(&self.trie, a, b));

        for &(class, lp_c) in &pruned {
            for &prefix_id in &ordered_prefixes {
                let prefix_score = self.trie.node(prefix_id).score;
                if full_beam && lp_c + prefix_score < min_cutoff {
                    break;
                }
                if prefix_score == f64::NEG_INFINITY {
                    continue;
                }

                if class == self.blank_id {
                    self.blank_branch(prefix_id, lp_c, prefix_score);
                } else {
                    self.repeat_branch(prefix_id, class, lp_c);
                    self.extension_branch(prefix_id, class, lp_c, prefix_score, scorer.as_deref());
                }
            }
        }

        self.prefixes = self.trie.iterate(&mut self.timesteps);
        self.prune_beam();
    }

    fn blank_branch(&mut self, prefix_id: PrefixId, lp_c: f64, prefix_score: f64) {
        let log_p = lp_c + prefix_score;
        let node = self.trie.node_mut(prefix_id);
        if log_p > node.log_p_nb_cur {
            node.pending_timestep_parent = None;
        }
        node.log_p_b_cur = log_sum_exp(node.log_p_b_cur, log_p);
    }

    fn repeat_branch(&mut self, prefix_id: PrefixId, class: u32, lp_c: f64) {
        let node = self.trie.node(prefix_id);
        if class != node.character {
            return;
        }
        let log_p = lp_c + node.log_p_nb_prev;
        let node = self.trie.node_mut(prefix_id);
        if log_p > node.log_p_nb_cur {
            node.pending_timestep_parent = None;
        }
        node.log_p_nb_cur = log_sum_exp(node.log_p_nb_cur, log_p);
    }

    fn extension_branch(
        &mut self,
        prefix_id: PrefixId,
        class: u32,
        lp_c: f64,
        prefix_score: f64,
        scorer: Option<&Scorer>,
    ) {
        let prefix = self.trie.node(prefix_id);
        let prefix_character = prefix.character;
        let prefix_log_p_b_prev = prefix.log_p_b_prev;
        let prefix_timesteps = prefix.timesteps;
        let prefix_fst_state = prefix.fst_state;

        let mut next_fst_state = None;
        let mut dictionary_miss = false;
        if let Some(dictionary) = scorer.and_then(|s| s.dictionary()) {
            next_fst_state = prefix_fst_state.and_then(|state| dictionary.transition(state, class));
            if scorer.map_or(false, |s| s.constrained()) && next_fst_state.is_none() {
                dictionary_miss = true;
            }
        }
        if dictionary_miss {
            return;
        }

        let new_id = self.trie.get_or_create_child(prefix_id, class, lp_c);
        self.trie.node_mut(new_id).fst_state = next_fst_state;

        let mut log_p = if class == prefix_character && prefix_log_p_b_prev > f64::NEG_INFINITY {
            lp_c + prefix_log_p_b_prev
        } else if class != prefix_character {
            lp_c + prefix_score
        } else {
            f64::NEG_INFINITY
        };

        if let Some(scorer) = scorer {
            let scoring_ref = if scorer.is_utf8_mode() { new_id } else { prefix_id };
            if scorer.is_scoring_boundary(&self.trie, &self.alphabet, scoring_ref, class) {
                let ngram = scorer.make_ngram(&self.trie, &self.alphabet, scoring_ref);
                let bos = ngram.len() < scorer.max_order();
                let lm = scorer.hot_boosted_log_prob(&ngram, bos, false);
                log_p += scorer.alpha * lm + scorer.beta;
            }
        }

        let node = self.trie.node_mut(new_id);
        if log_p > node.log_p_nb_cur {
            node.pending_timestep_parent = Some(prefix_timesteps);
            node.pending_new_timestep = Some(self.abs_time_step);
        }
        node.log_p_nb_cur = log_sum_exp(node.log_p_nb_cur, log_p);
    }

    fn prune_beam(&mut self) {
        if self.prefixes.len() <= self.beam_size {
            return;
        }
        let mut sorted = self.prefixes.clone();
        sorted.sort_by(|&a, &b| compare_prefixes(&self.trie, a, b));
        let (keep, drop) = sorted.split_at(self.beam_size);
        for &id in drop {
            self.trie.remove(id);
        }
        self.prefixes = keep.to_vec();
    }

    fn tail_is_scoring_boundary(&self, scorer: &Scorer, id: PrefixId) -> bool {
        let character = self.trie.node(id).character;
        if character == ROOT_CHARACTER {
            return true;
        }
        scorer.is_scoring_boundary(&self.trie, &self.alphabet, id, character)
    }

    /// Returns up to `num_results` ranked hypotheses from the current beam
    /// `decode`). May be called repeatedly; does not mutate decoder state other than reading
    /// it, so further `next`/`decode` calls remain valid.
    pub fn decode(&self, num_results: usize) -> Vec<Output> {
        let mut scored: Vec<(PrefixId, f64)> = self
            .prefixes
            .iter()
            .map(|&id| (id, self.trie.node(id).score))
            .collect();

        if let Some(scorer) = &self.scorer {
            for (id, score) in scored.iter_mut() {
                if self.tail_is_scoring_boundary(scorer, *id) {
                    continue;
                }
                let ngram = scorer.make_ngram(&self.trie, &self.alphabet, *id);
                let bos = ngram.len() < scorer.max_order();
                let lm = scorer.hot_boosted_log_prob(&ngram, bos, true);
                *score += scorer.alpha * lm + scorer.beta;
            }
        }

        scored.sort_by(|(ida, a), (idb, b)| match b.partial_cmp(a).unwrap_or(Ordering::Equal) {
            Ordering::Equal => self.trie.node(*ida).character.cmp(&self.trie.node(*idb).character),
            other => other,
        });

        scored
            .into_iter()
            .take(num_results)
            .map(|(id, score)| self.build_output(id, score))
            .collect()
    }

    fn build_output(&self, id: PrefixId, confidence: f64) -> Output {
        let tokens = self.trie.path(id);
        let timesteps = self
            .timesteps
            .history(self.trie.node(id).timesteps, self.timesteps.root());
        debug_assert_eq!(tokens.len(), timesteps.len());
        Output {
            tokens,
            timesteps,
            confidence,
        }
    }
}

fn compare_prefixes(trie: &PrefixTrie, a: PrefixId, b: PrefixId) -> Ordering {
    let (score_a, char_a) = {
        let node = trie.node(a);
        (node.score, node.character)
    };
    let (score_b, char_b) = {
        let node = trie.node(b);
        (node.score, node.character)
    };
    match score_b.partial_cmp(&score_a).unwrap_or(Ordering::Equal) {
        Ordering::Equal => char_a.cmp(&char_b),
        other => other,
    }
}

/// Class-axis pruning: converts `row` to per-class natural-log
/// probabilities, drops classes once cumulative probability mass exceeds `cutoff_prob`, and
/// keeps at most `cutoff_top_n`, sorted by descending log-probability.
fn pruned_log_probs(row: &[f64], cutoff_prob: f64, cutoff_top_n: usize) -> Vec<(u32, f64)> {
    let mut indexed: Vec<(u32, f64)> = row
        .iter()
        .enumerate()
        .map(|(i, &p)| (i as u32, p.ln()))
        .collect();

    if cutoff_prob >= 1.0 && cutoff_top_n >= indexed.len() {
        return indexed;
    }

    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let mut cutoff_len = indexed.len();
    if cutoff_prob < 1.0 {
        let mut cum_prob = 0.0;
        cutoff_len = 0;
        for &(_, log_p) in &indexed {
            cum_prob += log_p.exp();
            cutoff_len += 1;
            if cum_prob >= cutoff_prob {
                break;
            }
        }
    }
    cutoff_len = cutoff_len.min(cutoff_top_n);
    indexed.truncate(cutoff_len);
    indexed
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Cursor;

    fn alphabet_ab_space() -> Arc<Alphabet> {
        Arc::new(Alphabet::from_reader(Cursor::new("a\nb\n \n")).unwrap())
    }

    fn alphabet_a_space() -> Arc<Alphabet> {
        Arc::new(Alphabet::from_reader(Cursor::new("a\n \n")).unwrap())
    }

    fn top1(decoder: &DecoderState) -> Output {
        decoder.decode(1).into_iter().next().unwrap()
    }

    // S1 - Trivial greedy.
    #[test]
    fn scenario_s1_trivial_greedy() {
        let alphabet = alphabet_ab_space();
        let mut decoder = DecoderState::new(alphabet.clone(), 1, 1.0, 4, None).unwrap();
        let probs = array![[0.1, 0.8, 0.05, 0.05], [0.7, 0.1, 0.1, 0.1]];
        decoder.next(probs.view()).unwrap();
        let out = top1(&decoder);
        assert_eq!(alphabet.decode(&out.tokens), "ba");
        assert_eq!(out.timesteps, vec![0, 1]);
    }

    // S2 - Blank collapse: a single emitted "a" followed by two strongly blank-dominant
    // frames stays a single "a" rather than being extended again.
    #[test]
    fn scenario_s2_blank_collapse() {
        let alphabet = alphabet_ab_space();
        let mut decoder = DecoderState::new(alphabet.clone(), 1, 1.0, 4, None).unwrap();
        let probs = array![
            [0.9, 0.03, 0.03, 0.04],
            [0.02, 0.02, 0.02, 0.94],
            [0.02, 0.02, 0.02, 0.94],
        ];
        decoder.next(probs.view()).unwrap();
        let out = top1(&decoder);
        assert_eq!(alphabet.decode(&out.tokens), "a");
        assert_eq!(out.timesteps, vec![0]);
    }

    // S3 - Repeat through blank.
    #[test]
    fn scenario_s3_repeat_through_blank() {
        let alphabet = alphabet_a_space();
        let mut decoder = DecoderState::new(alphabet.clone(), 1, 1.0, 3, None).unwrap();
        let probs = array![[0.9, 0.05, 0.05], [0.05, 0.05, 0.9], [0.9, 0.05, 0.05]];
        decoder.next(probs.view()).unwrap();
        let out = top1(&decoder);
        assert_eq!(alphabet.decode(&out.tokens), "aa");
        assert_eq!(out.timesteps, vec![0, 2]);
    }

    #[test]
    fn precondition_checks_reject_bad_init_and_class_dim() {
        let alphabet = alphabet_ab_space();
        assert!(DecoderState::new(alphabet.clone(), 0, 1.0, 4, None).is_err());
        assert!(DecoderState::new(alphabet.clone(), 1, 1.5, 4, None).is_err());
        assert!(DecoderState::new(alphabet.clone(), 1, 1.0, 0, None).is_err());

        let mut decoder = DecoderState::new(alphabet, 1, 1.0, 4, None).unwrap();
        let probs = array![[0.25, 0.25, 0.25]];
        assert!(decoder.next(probs.view()).is_err());
    }

    #[test]
    fn alive_prefix_count_never_exceeds_beam_size() {
        let alphabet = alphabet_ab_space();
        let mut decoder = DecoderState::new(alphabet, 2, 1.0, 4, None).unwrap();
        let probs = array![
            [0.3, 0.3, 0.3, 0.1],
            [0.3, 0.3, 0.3, 0.1],
            [0.3, 0.3, 0.3, 0.1],
        ];
        decoder.next(probs.view()).unwrap();
        assert!(decoder.prefixes.len() <= 2);
    }

    // S4 - cutoff_top_n keeps exactly the top-n classes, independent of cutoff_prob.
    #[test]
    fn scenario_s4_cutoff_top_n_keeps_only_highest_classes() {
        let row = vec![0.12, 0.08, 0.09, 0.07, 0.11, 0.1, 0.13, 0.1, 0.1, 0.1];
        let pruned = pruned_log_probs(&row, 1.0, 2);
        assert_eq!(pruned.len(), 2);
        let mut kept: Vec<u32> = pruned.iter().map(|&(c, _)| c).collect();
        kept.sort_unstable();
        // classes 0 (0.12) and 6 (0.13) are the two highest.
        assert_eq!(kept, vec![0, 6]);
    }

    // S6 - batch determinism is covered end-to-end in batch.rs; here the same single
    // DecoderState invoked four times on identical input produces four identical Outputs.
    #[test]
    fn scenario_s6_identical_inputs_decode_identically() {
        let alphabet = alphabet_ab_space();
        let probs = array![[0.1, 0.8, 0.05, 0.05], [0.7, 0.1, 0.1, 0.1]];

        let outputs: Vec<Output> = (0..4)
            .map(|_| {
                let mut decoder = DecoderState::new(alphabet.clone(), 4, 1.0, 4, None).unwrap();
                decoder.next(probs.view()).unwrap();
                top1(&decoder)
            })
            .collect();

        assert!(outputs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn next_on_whole_batch_matches_successive_single_frame_calls() {
        let alphabet = alphabet_ab_space();
        let probs = array![
            [0.1, 0.8, 0.05, 0.05],
            [0.7, 0.1, 0.1, 0.1],
            [0.05, 0.05, 0.8, 0.1],
        ];

        let mut whole = DecoderState::new(alphabet.clone(), 4, 1.0, 4, None).unwrap();
        whole.next(probs.view()).unwrap();

        let mut stepwise = DecoderState::new(alphabet.clone(), 4, 1.0, 4, None).unwrap();
        for t in 0..probs.nrows() {
            stepwise.next(probs.slice(ndarray::s![t..t + 1, ..])).unwrap();
        }

        let whole_out = whole.decode(4);
        let stepwise_out = stepwise.decode(4);
        assert_eq!(whole_out, stepwise_out);
    }
}
