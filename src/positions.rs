//! Verification positions.
//!
//! Parity is always checked on a structurally diverse set so that mistakes
//! in piece planes, castling planes, mirroring or the batch axis show up.

use std::fs;
use std::path::Path;

use log::debug;

use crate::error::PipelineError;

/// Built-in verification positions with a short label each.
pub const DEFAULT_POSITIONS: [(&str, &str); 6] = [
    ("opening", "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1"),
    (
        "early middlegame",
        "r1bqkb1r/pppp1ppp/2n2n2/4p3/2B1P3/5N2/PPPP1PPP/RNBQK2R w KQkq - 4 4",
    ),
    (
        "complex middlegame",
        "r2q1rk1/pp2bppp/2n1pn2/3p4/2PP4/2N1PN2/PP2BPPP/R2QK2R w KQ - 0 9",
    ),
    ("king and pawn endgame", "8/5k2/8/3P4/8/8/5K2/8 w - - 0 1"),
    ("asymmetric material", "r3k2r/ppp2ppp/8/8/8/8/PPP2PPP/1N2K3 w kq - 0 1"),
    (
        "black to move",
        "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1",
    ),
];

#[must_use]
pub fn default_positions() -> Vec<String> {
    DEFAULT_POSITIONS.iter().map(|(_, fen)| (*fen).to_string()).collect()
}

/// Read FENs from a JSON list or a newline-delimited file. Blank lines and
/// lines starting with `#` are skipped.
pub fn load_positions(path: &Path) -> Result<Vec<String>, PipelineError> {
    let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    let fens: Vec<String> = if text.trim_start().starts_with('[') {
        serde_json::from_str(&text)
            .map_err(|e| PipelineError::config(format!("{}: {e}", path.display())))?
    } else {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    };
    if fens.is_empty() {
        return Err(PipelineError::config(format!(
            "{} contains no positions",
            path.display()
        )));
    }
    debug!("loaded {} positions from {}", fens.len(), path.display());
    Ok(fens)
}

/// The default set followed by `extra`, without repeats.
#[must_use]
pub fn verification_positions(extra: &[String]) -> Vec<String> {
    let mut fens = default_positions();
    for fen in extra {
        if !fens.contains(fen) {
            fens.push(fen.clone());
        }
    }
    fens
}
