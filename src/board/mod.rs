//! Chess position representation and FEN parsing.
//!
//! Positions are parsed strictly: every FEN field must be present and valid,
//! since the encoder feeds them straight into the network inputs.
//!
//! # Example
//! ```
//! use policy_export::board::Position;
//!
//! let position = Position::try_from_fen(
//!     "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
//! ).unwrap();
//! assert_eq!(position.piece_count(), 32);
//! ```

mod error;
mod fen;
mod state;
mod types;

pub use error::{FenError, SquareError};
pub use state::Position;
pub use types::{Bitboard, BitboardIter, CastlingRights, Color, Piece, Square};

pub(crate) use types::PROMOTION_PIECES;
