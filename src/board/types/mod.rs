//! Core chess types.
//!
//! - `Piece` and `Color` - chess piece types and colors
//! - `Square` - (rank, file) board square
//! - `Bitboard` - 64-bit piece sets
//! - `CastlingRights` - castling state

mod bitboard;
mod castling;
mod piece;
mod square;

pub use bitboard::{Bitboard, BitboardIter};
pub use castling::CastlingRights;
pub use piece::{Color, Piece};
pub use square::Square;

pub(crate) use piece::PROMOTION_PIECES;
