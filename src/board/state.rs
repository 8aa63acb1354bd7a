use super::{Bitboard, CastlingRights, Color, Piece, Square};

/// A fully specified chess position: placement plus the FEN state fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Position {
    pub(crate) pieces: [[Bitboard; 6]; 2],
    pub(crate) white_to_move: bool,
    pub(crate) castling_rights: CastlingRights,
    pub(crate) en_passant_target: Option<Square>,
    pub(crate) halfmove_clock: u32,
    pub(crate) fullmove_number: u32,
}

impl Default for Position {
    fn default() -> Self {
        Position::new()
    }
}

impl Position {
    /// The standard starting position.
    #[must_use]
    pub fn new() -> Self {
        let mut position = Position::empty();
        let back_rank = [
            Piece::Rook,
            Piece::Knight,
            Piece::Bishop,
            Piece::Queen,
            Piece::King,
            Piece::Bishop,
            Piece::Knight,
            Piece::Rook,
        ];
        for (i, piece) in back_rank.iter().enumerate() {
            position.set_piece(Square(0, i), Color::White, *piece);
            position.set_piece(Square(7, i), Color::Black, *piece);
            position.set_piece(Square(1, i), Color::White, Piece::Pawn);
            position.set_piece(Square(6, i), Color::Black, Piece::Pawn);
        }
        position.castling_rights = CastlingRights::all();
        position
    }

    pub(crate) fn empty() -> Self {
        Position {
            pieces: [[Bitboard::EMPTY; 6]; 2],
            white_to_move: true,
            castling_rights: CastlingRights::none(),
            en_passant_target: None,
            halfmove_clock: 0,
            fullmove_number: 1,
        }
    }

    pub(crate) fn set_piece(&mut self, sq: Square, color: Color, piece: Piece) {
        self.pieces[color.index()][piece.index()].insert(sq);
    }

    /// The piece standing on `sq`, if any.
    #[must_use]
    pub fn piece_at(&self, sq: Square) -> Option<(Color, Piece)> {
        for color in Color::BOTH {
            for piece in Piece::ALL {
                if self.pieces[color.index()][piece.index()].contains(sq) {
                    return Some((color, piece));
                }
            }
        }
        None
    }

    /// All squares holding `piece` of `color`.
    #[inline]
    #[must_use]
    pub fn pieces(&self, color: Color, piece: Piece) -> Bitboard {
        self.pieces[color.index()][piece.index()]
    }

    #[inline]
    #[must_use]
    pub fn white_to_move(&self) -> bool {
        self.white_to_move
    }

    #[inline]
    #[must_use]
    pub fn side_to_move(&self) -> Color {
        if self.white_to_move {
            Color::White
        } else {
            Color::Black
        }
    }

    #[inline]
    #[must_use]
    pub fn castling_rights(&self) -> CastlingRights {
        self.castling_rights
    }

    #[inline]
    #[must_use]
    pub fn en_passant_target(&self) -> Option<Square> {
        self.en_passant_target
    }

    #[inline]
    #[must_use]
    pub fn halfmove_clock(&self) -> u32 {
        self.halfmove_clock
    }

    #[inline]
    #[must_use]
    pub fn fullmove_number(&self) -> u32 {
        self.fullmove_number
    }

    /// Colour-swapped, rank-flipped copy of the position.
    ///
    /// The side to move flips too, so mirroring a black-to-move position
    /// yields the equivalent white-to-move position.
    #[must_use]
    pub fn mirror(&self) -> Position {
        let mut mirrored = Position::empty();
        for color in Color::BOTH {
            for piece in Piece::ALL {
                mirrored.pieces[color.opponent().index()][piece.index()] =
                    self.pieces[color.index()][piece.index()].flip_vertical();
            }
        }
        mirrored.white_to_move = !self.white_to_move;
        mirrored.castling_rights = self.castling_rights.swap_colors();
        mirrored.en_passant_target = self.en_passant_target.map(Square::flip_vertical);
        mirrored.halfmove_clock = self.halfmove_clock;
        mirrored.fullmove_number = self.fullmove_number;
        mirrored
    }

    /// Total number of pieces on the board.
    #[must_use]
    pub fn piece_count(&self) -> u32 {
        self.pieces
            .iter()
            .flat_map(|sets| sets.iter())
            .map(|bb| bb.popcount())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_position_layout() {
        let pos = Position::new();
        assert_eq!(pos.piece_count(), 32);
        assert_eq!(pos.piece_at(Square(0, 4)), Some((Color::White, Piece::King)));
        assert_eq!(pos.piece_at(Square(7, 3)), Some((Color::Black, Piece::Queen)));
        assert_eq!(pos.piece_at(Square(4, 4)), None);
        assert!(pos.white_to_move());
    }

    #[test]
    fn test_start_position_is_mirror_symmetric_apart_from_side() {
        let pos = Position::new();
        let mirrored = pos.mirror();
        assert_eq!(mirrored.pieces, pos.pieces);
        assert_eq!(mirrored.castling_rights, pos.castling_rights);
        assert!(!mirrored.white_to_move());
    }

    #[test]
    fn test_mirror_twice_is_identity() {
        let pos = Position::try_from_fen("4k3/8/8/3pP3/8/8/8/4K2R w K d6 0 3").unwrap();
        assert_eq!(pos.mirror().mirror(), pos);
        assert_eq!(
            pos.mirror().en_passant_target().map(|sq| sq.to_string()),
            Some("d3".to_string())
        );
    }
}
