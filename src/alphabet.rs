//! Bidirectional mapping between integer labels and output-unit byte strings.
//!
//! Two variants exist: a *codepoint* alphabet loaded from a text file (one unit per line,
//! `#` comments, `\#` escape) and a *UTF-8 byte* alphabet with a fixed `label = byte - 1`
//! mapping and no input file. See `examples/original_source/native_client/alphabet.cc` for
//! the historical C++ this is grounded on.

use std::collections::HashMap;
use std::io::{self, BufRead, Read, Write};

use crate::error::Result;

/// Sentinel meaning "this alphabet has no space entry".
const NO_SPACE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphabetKind {
    Codepoint,
    Utf8Byte,
}

#[derive(Debug, Clone)]
pub struct Alphabet {
    kind: AlphabetKind,
    label_to_unit: Vec<Vec<u8>>,
    unit_to_label: HashMap<Vec<u8>, u32>,
    space_label: u32,
}

impl Alphabet {
    /// Loads a codepoint alphabet from a text file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(Self::from_reader(io::BufReader::new(file))?)
    }

    /// Parses a codepoint alphabet from an in-memory reader, so tests don't need to
    /// clutter the repo with fixture files (mirrors `CmuDictionary::from_reader`).
    pub fn from_reader(reader: impl BufRead) -> io::Result<Self> {
        let mut label_to_unit = Vec::new();
        let mut unit_to_label = HashMap::new();
        let mut space_label = NO_SPACE;
        let mut label = 0u32;

        for line in split_lines(reader)? {
            if line.starts_with('#') {
                continue;
            }
            let entry = if line == "\\#" {
                "#".to_string()
            } else if line.is_empty() {
                continue;
            } else {
                line
            };

            if entry == " " {
                space_label = label;
            }

            let bytes = entry.into_bytes();
            unit_to_label.insert(bytes.clone(), label);
            label_to_unit.push(bytes);
            label += 1;
        }

        Ok(Alphabet {
            kind: AlphabetKind::Codepoint,
            label_to_unit,
            unit_to_label,
            space_label,
        })
    }

    /// Fixed UTF-8 byte alphabet: label `i` in `0..255` maps to raw byte `i + 1`.
    /// Byte `0x00` is never used, so nothing is wasted mapping it.
    pub fn utf8_byte_alphabet() -> Self {
        let mut label_to_unit = Vec::with_capacity(255);
        let mut unit_to_label = HashMap::with_capacity(255);
        for idx in 0u32..255 {
            let byte = (idx + 1) as u8;
            label_to_unit.push(vec![byte]);
            unit_to_label.insert(vec![byte], idx);
        }
        Alphabet {
            kind: AlphabetKind::Utf8Byte,
            label_to_unit,
            unit_to_label,
            space_label: (b' ' - 1) as u32,
        }
    }

    pub fn kind(&self) -> AlphabetKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.label_to_unit.len()
    }

    pub fn space_label(&self) -> Option<u32> {
        if self.space_label == NO_SPACE {
            None
        } else {
            Some(self.space_label)
        }
    }

    pub fn is_space(&self, label: u32) -> bool {
        self.space_label() == Some(label)
    }

    pub fn decode_single(&self, label: u32) -> Option<&[u8]> {
        self.label_to_unit.get(label as usize).map(Vec::as_slice)
    }

    pub fn decode(&self, labels: &[u32]) -> String {
        let mut bytes = Vec::new();
        for &label in labels {
            if let Some(unit) = self.decode_single(label) {
                bytes.extend_from_slice(unit);
            }
        }
        String::from_utf8(bytes.clone())
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn can_encode_single(&self, unit: &[u8]) -> bool {
        match self.kind {
            AlphabetKind::Utf8Byte => true,
            AlphabetKind::Codepoint => self.unit_to_label.contains_key(unit),
        }
    }

    pub fn can_encode(&self, s: &str) -> bool {
        match self.kind {
            AlphabetKind::Utf8Byte => true,
            AlphabetKind::Codepoint => {
                split_into_codepoints(s.as_bytes()).all(|cp| self.can_encode_single(cp))
            }
        }
    }

    pub fn encode_single(&self, unit: &[u8]) -> Option<u32> {
        match self.kind {
            AlphabetKind::Utf8Byte => {
                debug_assert_eq!(unit.len(), 1);
                unit.first().map(|&b| b as u32 - 1)
            }
            AlphabetKind::Codepoint => self.unit_to_label.get(unit).copied(),
        }
    }

    /// Splits `s` into labels; for a codepoint alphabet by UTF-8 codepoint boundary, for a
    /// byte alphabet one label per raw byte. Returns `None` if any unit is absent (codepoint
    /// mode only; byte mode can always encode).
    pub fn encode(&self, s: &str) -> Option<Vec<u32>> {
        match self.kind {
            AlphabetKind::Utf8Byte => Some(s.as_bytes().iter().map(|&b| b as u32 - 1).collect()),
            AlphabetKind::Codepoint => split_into_codepoints(s.as_bytes())
                .map(|cp| self.encode_single(cp))
                .collect(),
        }
    }

    /// Length-prefixed binary round-trip: `u32` count, then per entry a `u16` byte length
    /// and raw bytes, then an `i64` holding `space_label` (`-1` for "no space").
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.label_to_unit.len() as u32).to_le_bytes());
        for unit in &self.label_to_unit {
            out.extend_from_slice(&(unit.len() as u16).to_le_bytes());
            out.extend_from_slice(unit);
        }
        let space: i64 = match self.space_label() {
            Some(l) => l as i64,
            None => -1,
        };
        out.extend_from_slice(&space.to_le_bytes());
        out
    }

    pub fn from_bytes(mut r: impl Read) -> io::Result<Self> {
        let mut u32_buf = [0u8; 4];
        r.read_exact(&mut u32_buf)?;
        let count = u32::from_le_bytes(u32_buf);

        let mut label_to_unit = Vec::with_capacity(count as usize);
        let mut unit_to_label = HashMap::with_capacity(count as usize);
        for label in 0..count {
            let mut len_buf = [0u8; 2];
            r.read_exact(&mut len_buf)?;
            let len = u16::from_le_bytes(len_buf) as usize;
            let mut unit = vec![0u8; len];
            r.read_exact(&mut unit)?;
            unit_to_label.insert(unit.clone(), label);
            label_to_unit.push(unit);
        }

        let mut i64_buf = [0u8; 8];
        r.read_exact(&mut i64_buf)?;
        let space = i64::from_le_bytes(i64_buf);
        let space_label = if space < 0 { NO_SPACE } else { space as u32 };

        Ok(Alphabet {
            kind: AlphabetKind::Codepoint,
            label_to_unit,
            unit_to_label,
            space_label,
        })
    }
}

/// Reads lines split on `\n`, `\r\n` or bare `\r`, tolerating a final line with no
/// terminator. Comment lines and blank lines are filtered by the caller, not here.
fn split_lines(mut reader: impl BufRead) -> io::Result<Vec<String>> {
    let mut raw = String::new();
    reader.read_to_string(&mut raw)?;
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => {
                lines.push(std::mem::take(&mut current));
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                lines.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    Ok(lines)
}

/// Groups raw bytes into UTF-8 codepoints, as `decoder_utils.cpp::split_into_codepoints`
/// does: a byte starts a new codepoint unless its top two bits are `10`.
pub fn split_into_codepoints(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut start = 0;
    let mut boundaries = Vec::new();
    for (i, &b) in bytes.iter().enumerate() {
        if i > 0 && (b & 0xC0) != 0x80 {
            boundaries.push((start, i));
            start = i;
        }
    }
    if start < bytes.len() || bytes.is_empty() {
        boundaries.push((start, bytes.len()));
    }
    boundaries.into_iter().map(move |(s, e)| &bytes[s..e])
}

/// Number of bytes in the UTF-8 codepoint that starts with `first_byte`, based on its
/// leading bits (`0xxxxxxx` -> 1, `110xxxxx` -> 2, `1110xxxx` -> 3, `11110xxx` -> 4).
pub fn codepoint_len(first_byte: u8) -> usize {
    if first_byte >> 7 == 0x00 {
        1
    } else if first_byte >> 5 == 0x06 {
        2
    } else if first_byte >> 4 == 0x0E {
        3
    } else if first_byte >> 3 == 0x1E {
        4
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_text_alphabet() {
        let text = "a\nb\n \n#comment\n\\#\n";
        let alphabet = Alphabet::from_reader(Cursor::new(text)).unwrap();
        assert_eq!(alphabet.size(), 4);
        assert_eq!(alphabet.space_label(), Some(2));
        assert_eq!(alphabet.decode_single(0), Some(b"a".as_slice()));
        assert_eq!(alphabet.decode_single(3), Some(b"#".as_slice()));
    }

    #[test]
    fn tolerates_mixed_line_endings_and_missing_trailing_newline() {
        let text = "a\r\nb\rc";
        let alphabet = Alphabet::from_reader(Cursor::new(text)).unwrap();
        assert_eq!(alphabet.size(), 3);
        assert_eq!(alphabet.decode_single(2), Some(b"c".as_slice()));
    }

    #[test]
    fn round_trips_through_binary() {
        let text = "a\nb\n \n";
        let alphabet = Alphabet::from_reader(Cursor::new(text)).unwrap();
        let bytes = alphabet.to_bytes();
        let restored = Alphabet::from_bytes(Cursor::new(bytes)).unwrap();
        assert_eq!(restored.size(), alphabet.size());
        assert_eq!(restored.space_label(), alphabet.space_label());
        for label in 0..alphabet.size() as u32 {
            assert_eq!(restored.decode_single(label), alphabet.decode_single(label));
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let text = "a\nb\n \n";
        let alphabet = Alphabet::from_reader(Cursor::new(text)).unwrap();
        let labels = alphabet.encode("ba b").unwrap();
        assert_eq!(alphabet.decode(&labels), "ba b");
    }

    #[test]
    fn utf8_byte_alphabet_is_permissive() {
        let alphabet = Alphabet::utf8_byte_alphabet();
        assert_eq!(alphabet.size(), 255);
        assert!(alphabet.can_encode("anything \u{1F600}"));
        let labels = alphabet.encode("hi").unwrap();
        assert_eq!(alphabet.decode(&labels), "hi");
        assert_eq!(alphabet.space_label(), Some(31));
    }
}
