use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::PathBuf;

use clap::Parser;
use ctc_decoder::alphabet::Alphabet;
use ctc_decoder::dictionary::{encode_word, Dictionary};
use ctc_decoder::lm::BackoffNgramModel;
use ctc_decoder::scorer::Scorer;
use tracing::info;

/// Builds a binary trie/scorer file from a vocabulary word list and an ARPA
/// language model, ready for `decode --lm ... --trie ...`.
#[derive(Parser, Debug)]
pub struct Args {
    /// Path to the alphabet text file (one output unit per line).
    #[clap(long)]
    alphabet: PathBuf,
    /// Use the built-in 255-byte UTF-8 alphabet instead of loading `--alphabet` from disk.
    #[clap(long)]
    utf8_alphabet: bool,
    /// One vocabulary word per line.
    #[clap(long)]
    vocabulary: PathBuf,
    /// ARPA-format n-gram language model, used only to validate it parses and to report its
    /// order; the trie file itself does not embed the model.
    #[clap(long)]
    lm: PathBuf,
    #[clap(long, default_value_t = 1.0)]
    alpha: f64,
    #[clap(long, default_value_t = 0.0)]
    beta: f64,
    /// Where to write the binary trie/scorer file.
    #[clap(long, default_value = "scorer.trie")]
    output: PathBuf,
}

fn main() -> anyhow::Result<()> {
    ctc_decoder::setup_logging();
    let args = Args::parse();

    let alphabet = if args.utf8_alphabet {
        Alphabet::utf8_byte_alphabet()
    } else {
        Alphabet::load(&args.alphabet)?
    };
    let is_utf8_mode = args.utf8_alphabet;

    let model = BackoffNgramModel::from_reader(BufReader::new(File::open(&args.lm)?))?;
    info!(order = model.order(), "loaded language model");

    let words: Vec<Vec<u8>> = BufReader::new(File::open(&args.vocabulary)?)
        .lines()
        .filter_map(|line| {
            let word = line.ok()?;
            let word = word.trim();
            if word.is_empty() {
                return None;
            }
            let key = encode_word(&alphabet, word, is_utf8_mode);
            if key.is_none() {
                tracing::warn!(%word, "dropping vocabulary word the alphabet cannot encode");
            }
            key
        })
        .collect();
    info!(count = words.len(), "built lexicon keys");

    let dictionary = Dictionary::build(words)?;
    let scorer = Scorer::new(
        args.alpha,
        args.beta,
        is_utf8_mode,
        Box::new(model),
        Some(dictionary),
        false,
        HashMap::new(),
    );

    scorer.save_trie(BufWriter::new(File::create(&args.output)?))?;
    info!(path = %args.output.display(), "wrote trie file");

    Ok(())
}
