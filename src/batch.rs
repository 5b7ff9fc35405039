//! Fixed-size worker pool for decoding a batch of utterances concurrently.
//!
//! Grounded on the `rayon::ThreadPoolBuilder::new().num_threads(...).build()` pattern in
//! `examples/meilisearch-meilisearch/http-ui/src/main.rs`. Each task gets its own
//! `DecoderState`; `Alphabet`/`Scorer` are shared read-only behind `Arc`.

use std::sync::Arc;

use ndarray::{s, Array2};
use rayon::prelude::*;

use crate::alphabet::Alphabet;
use crate::decoder::{DecoderState, Output};
use crate::error::{DecoderError, Result};
use crate::scorer::Scorer;

pub struct BatchRunner {
    alphabet: Arc<Alphabet>,
    scorer: Option<Arc<Scorer>>,
    beam_size: usize,
    cutoff_prob: f64,
    cutoff_top_n: usize,
    num_results: usize,
    pool: rayon::ThreadPool,
}

impl BatchRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        alphabet: Arc<Alphabet>,
        scorer: Option<Arc<Scorer>>,
        beam_size: usize,
        cutoff_prob: f64,
        cutoff_top_n: usize,
        num_results: usize,
        num_processes: usize,
    ) -> Result<Self> {
        if num_processes == 0 {
            return Err(DecoderError::precondition("num_processes must be > 0"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_processes)
            .build()
            .map_err(|e| DecoderError::precondition(format!("building worker pool: {e}")))?;

        Ok(BatchRunner {
            alphabet,
            scorer,
            beam_size,
            cutoff_prob,
            cutoff_top_n,
            num_results,
            pool,
        })
    }

    /// Decodes each `probs[i][..seq_lengths[i]]` independently across the pool, returning
    /// results in input order.
    pub fn batch_decode(
        &self,
        probs: &[Array2<f64>],
        seq_lengths: &[usize],
    ) -> Result<Vec<Vec<Output>>> {
        if probs.len() != seq_lengths.len() {
            return Err(DecoderError::precondition(format!(
                "probs batch size {} != seq_lengths length {}",
                probs.len(),
                seq_lengths.len()
            )));
        }

        tracing::debug!(batch_size = probs.len(), threads = self.pool.current_num_threads(), "starting batch decode");

        self.pool.install(|| {
            probs
                .par_iter()
                .enumerate()
                .map(|(i, p)| {
                    let len = seq_lengths[i];
                    let mut decoder = DecoderState::new(
                        self.alphabet.clone(),
                        self.beam_size,
                        self.cutoff_prob,
                        self.cutoff_top_n,
                        self.scorer.clone(),
                    )?;
                    decoder.next(p.slice(s![0..len, ..]))?;
                    Ok(decoder.decode(self.num_results))
                })
                .collect::<Result<Vec<_>>>()
        })
    }
}
