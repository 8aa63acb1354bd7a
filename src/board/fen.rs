use std::str::FromStr;

use super::error::FenError;
use super::{Bitboard, Color, Piece, Position, Square};

impl Position {
    /// Parse a position from FEN notation.
    ///
    /// All six fields are mandatory and validated; nothing is defaulted.
    pub fn try_from_fen(fen: &str) -> Result<Self, FenError> {
        let mut position = Position::empty();
        let parts: Vec<&str> = fen.split_whitespace().collect();

        if parts.len() != 6 {
            return Err(FenError::WrongFieldCount { found: parts.len() });
        }

        // Piece placement, rank 8 first
        let ranks: Vec<&str> = parts[0].split('/').collect();
        if ranks.len() != 8 {
            return Err(FenError::InvalidRankCount { found: ranks.len() });
        }
        for (rank_idx, rank_str) in ranks.iter().enumerate() {
            let mut file = 0;
            for c in rank_str.chars() {
                if let Some(skip) = c.to_digit(10) {
                    if skip == 0 || skip > 8 {
                        return Err(FenError::InvalidPiece { char: c });
                    }
                    file += skip as usize;
                } else {
                    let color = if c.is_ascii_uppercase() {
                        Color::White
                    } else {
                        Color::Black
                    };
                    let piece = Piece::from_char(c).ok_or(FenError::InvalidPiece { char: c })?;
                    if file >= 8 {
                        return Err(FenError::BadRankLength {
                            rank: rank_idx,
                            files: file + 1,
                        });
                    }
                    position.set_piece(Square(7 - rank_idx, file), color, piece);
                    file += 1;
                }
            }
            if file != 8 {
                return Err(FenError::BadRankLength {
                    rank: rank_idx,
                    files: file,
                });
            }
        }

        // Side to move
        match parts[1] {
            "w" => position.white_to_move = true,
            "b" => position.white_to_move = false,
            other => {
                return Err(FenError::InvalidSideToMove {
                    found: other.to_string(),
                })
            }
        }

        // Castling rights
        if parts[2] != "-" {
            for c in parts[2].chars() {
                match c {
                    'K' => position.castling_rights.set(Color::White, true),
                    'Q' => position.castling_rights.set(Color::White, false),
                    'k' => position.castling_rights.set(Color::Black, true),
                    'q' => position.castling_rights.set(Color::Black, false),
                    _ => return Err(FenError::InvalidCastling { char: c }),
                }
            }
        }

        // En passant target: rank 6 when White moves, rank 3 when Black moves
        position.en_passant_target = if parts[3] == "-" {
            None
        } else {
            let sq: Square = parts[3].parse().map_err(|_| FenError::InvalidEnPassant {
                found: parts[3].to_string(),
            })?;
            let expected_rank = if position.white_to_move { 5 } else { 2 };
            if sq.rank() != expected_rank {
                return Err(FenError::InvalidEnPassant {
                    found: parts[3].to_string(),
                });
            }
            Some(sq)
        };

        position.halfmove_clock = parse_counter(parts[4], "halfmove clock")?;
        position.fullmove_number = parse_counter(parts[5], "fullmove number")?;
        if position.fullmove_number == 0 {
            return Err(FenError::InvalidCounter {
                field: "fullmove number",
                found: parts[5].to_string(),
            });
        }

        position.check_material()?;
        Ok(position)
    }

    fn check_material(&self) -> Result<(), FenError> {
        for color in Color::BOTH {
            let kings = self.pieces(color, Piece::King).popcount();
            if kings != 1 {
                return Err(FenError::KingCount {
                    color,
                    found: kings,
                });
            }
            let back_ranks = Bitboard(Bitboard::RANK_1.0 | Bitboard::RANK_8.0);
            if let Some(square) = self.pieces(color, Piece::Pawn).and(back_ranks).iter().next() {
                return Err(FenError::PawnOnBackRank { square });
            }
        }
        Ok(())
    }

    /// Convert the position to FEN notation.
    #[must_use]
    pub fn to_fen(&self) -> String {
        let mut rows: Vec<String> = Vec::with_capacity(8);
        for rank in (0..8).rev() {
            let mut row = String::new();
            let mut empty = 0;
            for file in 0..8 {
                if let Some((color, piece)) = self.piece_at(Square(rank, file)) {
                    if empty > 0 {
                        row.push_str(&empty.to_string());
                        empty = 0;
                    }
                    row.push(piece.to_fen_char(color));
                } else {
                    empty += 1;
                }
            }
            if empty > 0 {
                row.push_str(&empty.to_string());
            }
            rows.push(row);
        }

        let active = if self.white_to_move { "w" } else { "b" };
        let mut castling = String::new();
        for (color, kingside, c) in [
            (Color::White, true, 'K'),
            (Color::White, false, 'Q'),
            (Color::Black, true, 'k'),
            (Color::Black, false, 'q'),
        ] {
            if self.castling_rights.has(color, kingside) {
                castling.push(c);
            }
        }
        if castling.is_empty() {
            castling.push('-');
        }
        let ep = self
            .en_passant_target
            .map_or_else(|| "-".to_string(), |sq| sq.to_string());

        format!(
            "{} {} {} {} {} {}",
            rows.join("/"),
            active,
            castling,
            ep,
            self.halfmove_clock,
            self.fullmove_number
        )
    }
}

fn parse_counter(field: &str, name: &'static str) -> Result<u32, FenError> {
    field.parse().map_err(|_| FenError::InvalidCounter {
        field: name,
        found: field.to_string(),
    })
}

impl FromStr for Position {
    type Err = FenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Position::try_from_fen(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    #[test]
    fn test_fen_round_trip() {
        let position = Position::try_from_fen(START).unwrap();
        assert_eq!(position.to_fen(), START);
        assert_eq!(position, Position::new());
    }

    #[test]
    fn test_fen_black_to_move() {
        let fen = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1";
        let position = Position::try_from_fen(fen).unwrap();
        assert!(!position.white_to_move());
        assert_eq!(position.en_passant_target(), Some(Square(2, 4)));
        assert_eq!(position.to_fen(), fen);
    }

    #[test]
    fn test_fen_requires_all_six_fields() {
        let result = Position::try_from_fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq -");
        assert_eq!(result, Err(FenError::WrongFieldCount { found: 4 }));
        let result =
            Position::try_from_fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1 x");
        assert_eq!(result, Err(FenError::WrongFieldCount { found: 7 }));
    }

    #[test]
    fn test_fen_error_invalid_piece() {
        let result =
            Position::try_from_fen("rnbqkbnr/ppppxppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1");
        assert!(matches!(result, Err(FenError::InvalidPiece { char: 'x' })));
    }

    #[test]
    fn test_fen_error_short_rank() {
        let result =
            Position::try_from_fen("rnbqkbnr/ppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1");
        assert!(matches!(
            result,
            Err(FenError::BadRankLength { rank: 1, files: 7 })
        ));
    }

    #[test]
    fn test_fen_error_rank_count() {
        let result = Position::try_from_fen("rnbqkbnr/pppppppp/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1");
        assert!(matches!(result, Err(FenError::InvalidRankCount { found: 7 })));
    }

    #[test]
    fn test_fen_error_invalid_side_to_move() {
        let result =
            Position::try_from_fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR x KQkq - 0 1");
        assert!(matches!(result, Err(FenError::InvalidSideToMove { .. })));
    }

    #[test]
    fn test_fen_error_invalid_castling() {
        let result =
            Position::try_from_fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w XQkq - 0 1");
        assert!(matches!(result, Err(FenError::InvalidCastling { char: 'X' })));
    }

    #[test]
    fn test_fen_error_invalid_en_passant() {
        let result =
            Position::try_from_fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq z9 0 1");
        assert!(matches!(result, Err(FenError::InvalidEnPassant { .. })));
        // e3 is only a valid target when Black is to move
        let result =
            Position::try_from_fen("rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR w KQkq e3 0 1");
        assert!(matches!(result, Err(FenError::InvalidEnPassant { .. })));
    }

    #[test]
    fn test_fen_counters_are_strict() {
        let result = Position::try_from_fen("4k3/8/8/8/8/8/8/4K3 w - - x 1");
        assert!(matches!(
            result,
            Err(FenError::InvalidCounter {
                field: "halfmove clock",
                ..
            })
        ));
        let result = Position::try_from_fen("4k3/8/8/8/8/8/8/4K3 w - - 0 0");
        assert!(matches!(
            result,
            Err(FenError::InvalidCounter {
                field: "fullmove number",
                ..
            })
        ));
        let position = Position::try_from_fen("4k3/8/8/8/8/8/8/4K3 w - - 42 60").unwrap();
        assert_eq!(position.halfmove_clock(), 42);
        assert_eq!(position.fullmove_number(), 60);
    }

    #[test]
    fn test_fen_requires_one_king_each() {
        let result = Position::try_from_fen("8/8/8/8/8/8/8/4K3 w - - 0 1");
        assert_eq!(
            result,
            Err(FenError::KingCount {
                color: Color::Black,
                found: 0
            })
        );
    }

    #[test]
    fn test_fen_rejects_back_rank_pawns() {
        let result = Position::try_from_fen("P3k3/8/8/8/8/8/8/4K3 w - - 0 1");
        assert!(matches!(result, Err(FenError::PawnOnBackRank { .. })));
    }

    #[test]
    fn test_no_castling() {
        let position =
            Position::try_from_fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w - - 0 1").unwrap();
        assert!(position.castling_rights().is_empty());
    }

    #[test]
    fn test_from_str_trait() {
        let position: Position = START.parse().unwrap();
        assert!(position.white_to_move());
    }
}
