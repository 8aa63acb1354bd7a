//! Error types for position parsing.

use std::fmt;

use super::{Color, Square};

/// Error type for FEN parsing failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenError {
    /// FEN string does not have exactly six fields
    WrongFieldCount { found: usize },
    /// Piece placement does not describe exactly eight ranks
    InvalidRankCount { found: usize },
    /// Invalid piece character in position string
    InvalidPiece { char: char },
    /// A rank does not cover exactly eight files
    BadRankLength { rank: usize, files: usize },
    /// Invalid side to move (must be 'w' or 'b')
    InvalidSideToMove { found: String },
    /// Invalid castling character
    InvalidCastling { char: char },
    /// Invalid en passant square
    InvalidEnPassant { found: String },
    /// Halfmove clock or fullmove number is not a valid counter
    InvalidCounter { field: &'static str, found: String },
    /// Each side needs exactly one king
    KingCount { color: Color, found: u32 },
    /// Pawns cannot stand on the first or eighth rank
    PawnOnBackRank { square: Square },
}

impl fmt::Display for FenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FenError::WrongFieldCount { found } => {
                write!(f, "FEN must have exactly 6 fields, found {found}")
            }
            FenError::InvalidRankCount { found } => {
                write!(f, "piece placement must have 8 ranks, found {found}")
            }
            FenError::InvalidPiece { char } => {
                write!(f, "Invalid piece character '{char}' in FEN")
            }
            FenError::BadRankLength { rank, files } => {
                write!(f, "rank {} covers {files} files, expected 8", 8 - rank)
            }
            FenError::InvalidSideToMove { found } => {
                write!(f, "Invalid side to move '{found}', expected 'w' or 'b'")
            }
            FenError::InvalidCastling { char } => {
                write!(f, "Invalid castling character '{char}' in FEN")
            }
            FenError::InvalidEnPassant { found } => {
                write!(f, "Invalid en passant square '{found}'")
            }
            FenError::InvalidCounter { field, found } => {
                write!(f, "Invalid {field} '{found}'")
            }
            FenError::KingCount { color, found } => {
                write!(f, "{color} has {found} kings, expected exactly 1")
            }
            FenError::PawnOnBackRank { square } => {
                write!(f, "pawn on back rank square {square}")
            }
        }
    }
}

impl std::error::Error for FenError {}

/// Error type for square parsing failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SquareError {
    /// Rank out of bounds (must be 0-7)
    RankOutOfBounds { rank: usize },
    /// File out of bounds (must be 0-7)
    FileOutOfBounds { file: usize },
    /// Invalid algebraic notation
    InvalidNotation { notation: String },
}

impl fmt::Display for SquareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SquareError::RankOutOfBounds { rank } => {
                write!(f, "Rank {rank} out of bounds (must be 0-7)")
            }
            SquareError::FileOutOfBounds { file } => {
                write!(f, "File {file} out of bounds (must be 0-7)")
            }
            SquareError::InvalidNotation { notation } => {
                write!(f, "Invalid square notation '{notation}'")
            }
        }
    }
}

impl std::error::Error for SquareError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fen_error_wrong_field_count() {
        let err = FenError::WrongFieldCount { found: 4 };
        assert!(err.to_string().contains('4'));
        assert!(err.to_string().contains('6'));
    }

    #[test]
    fn test_fen_error_invalid_piece() {
        let err = FenError::InvalidPiece { char: 'z' };
        assert!(err.to_string().contains("'z'"));
    }

    #[test]
    fn test_fen_error_bad_rank_length_names_rank() {
        let err = FenError::BadRankLength { rank: 0, files: 7 };
        assert!(err.to_string().contains("rank 8"));
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn test_fen_error_invalid_counter() {
        let err = FenError::InvalidCounter {
            field: "halfmove clock",
            found: "x".to_string(),
        };
        assert!(err.to_string().contains("halfmove clock"));
    }

    #[test]
    fn test_fen_error_king_count() {
        let err = FenError::KingCount {
            color: Color::Black,
            found: 0,
        };
        assert!(err.to_string().contains("Black"));
    }

    #[test]
    fn test_square_error_invalid_notation() {
        let err = SquareError::InvalidNotation {
            notation: "xyz".to_string(),
        };
        assert!(err.to_string().contains("xyz"));
    }

    #[test]
    fn test_error_clone() {
        let err = FenError::InvalidPiece { char: 'x' };
        assert_eq!(err.clone(), err);
    }
}
