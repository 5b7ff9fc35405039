use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ctc_decoder::alphabet::Alphabet;
use ctc_decoder::scorer::Scorer;
use ctc_decoder::{DecoderState, Output};
use ndarray::Array2;
use tracing::info;

#[derive(Parser, Debug)]
pub struct Args {
    /// Path to the alphabet text file (one output unit per line).
    #[clap(long)]
    alphabet: PathBuf,
    /// Use the built-in 255-byte UTF-8 alphabet instead of loading `--alphabet` from disk.
    #[clap(long)]
    utf8_alphabet: bool,
    /// Path to a `.npy` file holding a `time x class` matrix of acoustic probabilities.
    #[clap(long)]
    probs: PathBuf,
    /// ARPA-format n-gram language model. Requires `--trie`.
    #[clap(long, requires = "trie")]
    lm: Option<PathBuf>,
    /// Binary trie/scorer file produced by `build_scorer`. Requires `--lm`.
    #[clap(long, requires = "lm")]
    trie: Option<PathBuf>,
    /// Optional `word boost` lines, one per line, added to that word's language-model score.
    #[clap(long)]
    hot_words: Option<PathBuf>,
    /// Gate lexicon-FST-violating extensions instead of merely tracking the walk state.
    #[clap(long)]
    constrained: bool,
    #[clap(long, default_value_t = 100)]
    beam_size: usize,
    #[clap(long, default_value_t = 1.0)]
    cutoff_prob: f64,
    #[clap(long, default_value_t = 40)]
    cutoff_top_n: usize,
    #[clap(long, default_value_t = 1)]
    num_results: usize,
}

fn load_hot_words(path: Option<&PathBuf>) -> anyhow::Result<HashMap<String, f32>> {
    let mut hot_words = HashMap::new();
    let Some(path) = path else {
        return Ok(hot_words);
    };
    for line in std::io::BufRead::lines(BufReader::new(File::open(path)?)) {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((word, boost)) = line.rsplit_once(char::is_whitespace) {
            hot_words.insert(word.to_string(), boost.parse()?);
        }
    }
    Ok(hot_words)
}

fn load_scorer(args: &Args) -> anyhow::Result<Option<Arc<Scorer>>> {
    let (Some(lm), Some(trie)) = (&args.lm, &args.trie) else {
        return Ok(None);
    };
    let lm_reader = BufReader::new(File::open(lm)?);
    let trie_reader = BufReader::new(File::open(trie)?);
    let hot_words = load_hot_words(args.hot_words.as_ref())?;
    let scorer = Scorer::load(lm_reader, trie_reader, hot_words, args.constrained)?;
    Ok(Some(Arc::new(scorer)))
}

fn main() -> anyhow::Result<()> {
    ctc_decoder::setup_logging();
    let args = Args::parse();

    let alphabet = if args.utf8_alphabet {
        Alphabet::utf8_byte_alphabet()
    } else {
        Alphabet::load(&args.alphabet)?
    };
    let alphabet = Arc::new(alphabet);

    let scorer = load_scorer(&args)?;
    let probs: Array2<f64> = ndarray_npy::read_npy(&args.probs)?;

    info!(time_steps = probs.nrows(), classes = probs.ncols(), "decoding");

    let mut decoder = DecoderState::new(
        alphabet.clone(),
        args.beam_size,
        args.cutoff_prob,
        args.cutoff_top_n,
        scorer,
    )?;
    decoder.next(probs.view())?;

    for (rank, hyp) in decoder.decode(args.num_results).into_iter().enumerate() {
        println!("{rank}\t{:.4}\t{}", hyp.confidence, decode_text(&alphabet, &hyp));
    }

    Ok(())
}

fn decode_text(alphabet: &Alphabet, hyp: &Output) -> String {
    alphabet.decode(&hyp.tokens)
}
