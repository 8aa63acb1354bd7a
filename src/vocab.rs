//! Move vocabulary: the index space of `move_probs`.
//!
//! The generated vocabulary lists, for every from-square in a1..h8 order,
//! each queen-ray or knight destination in square order, followed by every
//! seventh-rank pawn push or capture with each promotion piece (q, r, b, n).

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::board::{Square, PROMOTION_PIECES};

/// Size of the generated vocabulary
pub const VOCAB_SIZE: usize = 1880;

const QUEEN_DIRECTIONS: [(isize, isize); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (1, -1),
    (-1, 1),
    (-1, -1),
];

const KNIGHT_JUMPS: [(isize, isize); 8] = [
    (2, 1),
    (2, -1),
    (-2, 1),
    (-2, -1),
    (1, 2),
    (1, -2),
    (-1, 2),
    (-1, -2),
];

#[derive(Debug, Error)]
pub enum VocabError {
    #[error("vocabulary {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("vocabulary {} is not a JSON list of strings: {reason}", path.display())]
    Json { path: PathBuf, reason: String },
    #[error("'{entry}' is not a UCI move")]
    Malformed { entry: String },
    #[error("'{entry}' appears more than once")]
    Duplicate { entry: String },
    #[error("vocabulary is empty")]
    Empty,
    #[error("vocabulary has {found} moves but the model predicts {expected}")]
    SizeMismatch { expected: usize, found: usize },
}

static STANDARD: Lazy<MoveVocabulary> = Lazy::new(MoveVocabulary::generate);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MoveVocabulary {
    moves: Vec<String>,
    index: HashMap<String, usize>,
}

impl MoveVocabulary {
    /// Build the standard vocabulary.
    #[must_use]
    pub fn generate() -> Self {
        let mut moves = Vec::with_capacity(VOCAB_SIZE);
        for from in Square::all() {
            let mut targets: Vec<Square> = QUEEN_DIRECTIONS
                .iter()
                .flat_map(|&(dr, df)| {
                    (1..8).map_while(move |step| from.offset(dr * step, df * step))
                })
                .chain(KNIGHT_JUMPS.iter().filter_map(|&(dr, df)| from.offset(dr, df)))
                .collect();
            targets.sort_by_key(|sq| sq.as_index());
            moves.extend(targets.into_iter().map(|to| format!("{from}{to}")));
        }
        for file in 0..8 {
            let Some(from) = Square::new(6, file) else { continue };
            for df in [-1, 0, 1] {
                if let Some(to) = from.offset(1, df) {
                    for piece in PROMOTION_PIECES {
                        moves.push(format!("{from}{to}{}", piece.to_char()));
                    }
                }
            }
        }
        Self::from_moves_unchecked(moves)
    }

    /// The lazily built standard vocabulary, shared process-wide.
    #[must_use]
    pub fn standard() -> &'static MoveVocabulary {
        &STANDARD
    }

    fn from_moves_unchecked(moves: Vec<String>) -> Self {
        let index = moves.iter().enumerate().map(|(i, m)| (m.clone(), i)).collect();
        MoveVocabulary { moves, index }
    }

    /// Build from an explicit list, rejecting malformed or repeated moves.
    pub fn from_moves(moves: Vec<String>) -> Result<Self, VocabError> {
        if moves.is_empty() {
            return Err(VocabError::Empty);
        }
        let mut index = HashMap::with_capacity(moves.len());
        for (i, mv) in moves.iter().enumerate() {
            if !is_uci(mv) {
                return Err(VocabError::Malformed { entry: mv.clone() });
            }
            if index.insert(mv.clone(), i).is_some() {
                return Err(VocabError::Duplicate { entry: mv.clone() });
            }
        }
        Ok(MoveVocabulary { moves, index })
    }

    /// Read a JSON array of UCI strings.
    pub fn load(path: &Path) -> Result<Self, VocabError> {
        let text = fs::read_to_string(path).map_err(|source| VocabError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let moves: Vec<String> = serde_json::from_str(&text).map_err(|e| VocabError::Json {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_moves(moves)
    }

    /// Write as a compact JSON array, creating parent directories.
    pub fn save_json(&self, path: &Path) -> Result<(), VocabError> {
        let io_err = |source| VocabError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string(&self.moves).map_err(|e| VocabError::Json {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs::write(path, json).map_err(io_err)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&str> {
        self.moves.get(index).map(String::as_str)
    }

    #[must_use]
    pub fn index_of(&self, mv: &str) -> Option<usize> {
        self.index.get(mv).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.moves.iter().map(String::as_str)
    }

    /// Fail unless this vocabulary indexes exactly `expected` moves.
    pub fn ensure_size(&self, expected: usize) -> Result<(), VocabError> {
        if self.len() != expected {
            return Err(VocabError::SizeMismatch {
                expected,
                found: self.len(),
            });
        }
        Ok(())
    }
}

fn is_square(s: &[u8]) -> bool {
    s.len() == 2 && (b'a'..=b'h').contains(&s[0]) && (b'1'..=b'8').contains(&s[1])
}

fn is_uci(mv: &str) -> bool {
    let b = mv.as_bytes();
    let base = b.len() >= 4 && is_square(&b[0..2]) && is_square(&b[2..4]) && b[0..2] != b[2..4];
    match b.len() {
        4 => base,
        5 => base && matches!(b[4], b'q' | b'r' | b'b' | b'n'),
        _ => false,
    }
}

/// Flip a UCI move between the two sides' points of view (ranks mirrored,
/// files kept). Malformed input is returned unchanged.
#[must_use]
pub fn mirror_uci(mv: &str) -> String {
    if !is_uci(mv) {
        return mv.to_string();
    }
    mv.chars()
        .enumerate()
        .map(|(i, c)| {
            if (i == 1 || i == 3) && c.is_ascii_digit() {
                (b'1' + b'8' - c as u8) as char
            } else {
                c
            }
        })
        .collect()
}
