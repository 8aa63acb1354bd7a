//! Position encoding.
//!
//! A position becomes an `(18, 8, 8)` plane stack: twelve piece planes
//! (white pawn..king, then black pawn..king), a side-to-move plane, four
//! castling-right planes (K, Q, k, q) and an en-passant plane. Row index is
//! the rank (rank 1 is row 0), column index the file.
//!
//! Black-to-move positions are mirrored first, so the network always sees
//! the side to move as white.

pub mod rating;

use std::fmt;

use thiserror::Error;

use crate::board::{Color, FenError, Piece, Position};
use crate::graph::{BOARD_INPUT, ELO_OPPO, ELO_SELF};
use crate::tensor::Tensor;

pub use rating::{bucket_for, RatingBucket, RATING_BUCKETS};

/// Planes per position
pub const BOARD_CHANNELS: usize = 18;
/// Values per position tensor
pub const BOARD_FEATURES: usize = BOARD_CHANNELS * 64;

const SIDE_TO_MOVE_PLANE: usize = 12;
const CASTLING_PLANE: usize = 13;
const EN_PASSANT_PLANE: usize = 17;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("invalid FEN '{fen}': {source}")]
    Fen {
        fen: String,
        #[source]
        source: FenError,
    },
    #[error("rating must be positive, got {rating}")]
    NonPositiveRating { rating: i64 },
    #[error("a sample batch needs at least one position")]
    EmptyBatch,
    #[error("batch columns differ in length: {boards} boards, {elo_self} self ratings, {elo_oppo} opponent ratings")]
    LengthMismatch {
        boards: usize,
        elo_self: usize,
        elo_oppo: usize,
    },
}

/// Encoded position, channel-major.
#[derive(Clone, PartialEq)]
pub struct PositionTensor(Box<[f32; BOARD_FEATURES]>);

impl PositionTensor {
    fn zeros() -> Self {
        PositionTensor(Box::new([0.0; BOARD_FEATURES]))
    }

    #[inline]
    fn set(&mut self, channel: usize, rank: usize, file: usize) {
        self.0[channel * 64 + rank * 8 + file] = 1.0;
    }

    fn fill(&mut self, channel: usize) {
        self.0[channel * 64..(channel + 1) * 64].fill(1.0);
    }

    #[inline]
    #[must_use]
    pub fn get(&self, channel: usize, rank: usize, file: usize) -> f32 {
        self.0[channel * 64 + rank * 8 + file]
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.0[..]
    }
}

impl fmt::Debug for PositionTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = self.0.iter().filter(|&&v| v != 0.0).count();
        write!(f, "PositionTensor({BOARD_CHANNELS}x8x8, {set} set)")
    }
}

/// Encode an already parsed position.
#[must_use]
pub fn encode_position(position: &Position) -> PositionTensor {
    let mirrored;
    let position = if position.white_to_move() {
        position
    } else {
        mirrored = position.mirror();
        &mirrored
    };

    let mut tensor = PositionTensor::zeros();
    for color in Color::BOTH {
        for piece in Piece::ALL {
            let channel = color.index() * 6 + piece.index();
            for sq in position.pieces(color, piece).iter() {
                tensor.set(channel, sq.rank(), sq.file());
            }
        }
    }
    if position.white_to_move() {
        tensor.fill(SIDE_TO_MOVE_PLANE);
    }
    let rights = position.castling_rights();
    let flags = [
        rights.has(Color::White, true),
        rights.has(Color::White, false),
        rights.has(Color::Black, true),
        rights.has(Color::Black, false),
    ];
    for (i, held) in flags.into_iter().enumerate() {
        if held {
            tensor.fill(CASTLING_PLANE + i);
        }
    }
    if let Some(sq) = position.en_passant_target() {
        tensor.set(EN_PASSANT_PLANE, sq.rank(), sq.file());
    }
    tensor
}

/// Parse `fen` and encode it together with the bucket of `rating`.
pub fn encode(fen: &str, rating: i64) -> Result<(PositionTensor, RatingBucket), EncodingError> {
    if rating <= 0 {
        return Err(EncodingError::NonPositiveRating { rating });
    }
    let position = Position::try_from_fen(fen).map_err(|source| EncodingError::Fen {
        fen: fen.to_string(),
        source,
    })?;
    Ok((encode_position(&position), bucket_for(rating)))
}

/// One verification or inference sample.
#[derive(Clone, Debug)]
pub struct Sample {
    pub fen: String,
    pub elo_self: i64,
    pub elo_oppo: i64,
}

/// Batch-major model inputs plus the FENs they came from.
#[derive(Clone, Debug)]
pub struct SampleBatch {
    board: Tensor,
    elo_self: Tensor,
    elo_oppo: Tensor,
    fens: Vec<String>,
}

impl SampleBatch {
    /// Assemble a batch from encoded columns.
    pub fn new(
        positions: &[PositionTensor],
        elo_self: &[RatingBucket],
        elo_oppo: &[RatingBucket],
        fens: Vec<String>,
    ) -> Result<Self, EncodingError> {
        let n = positions.len();
        if n != elo_self.len() || n != elo_oppo.len() || n != fens.len() {
            return Err(EncodingError::LengthMismatch {
                boards: n,
                elo_self: elo_self.len(),
                elo_oppo: elo_oppo.len(),
            });
        }
        if n == 0 {
            return Err(EncodingError::EmptyBatch);
        }
        let ids = |buckets: &[RatingBucket]| -> Tensor {
            buckets.iter().map(|b| b.index() as i64).collect::<Vec<_>>().into()
        };
        Ok(SampleBatch {
            board: Tensor::from_fn(vec![n, BOARD_CHANNELS, 8, 8], |i| {
                positions[i / BOARD_FEATURES].0[i % BOARD_FEATURES]
            }),
            elo_self: ids(elo_self),
            elo_oppo: ids(elo_oppo),
            fens,
        })
    }

    /// Encode every sample.
    pub fn from_samples(samples: &[Sample]) -> Result<Self, EncodingError> {
        let mut positions = Vec::with_capacity(samples.len());
        let mut own = Vec::with_capacity(samples.len());
        let mut oppo = Vec::with_capacity(samples.len());
        for sample in samples {
            let (tensor, bucket) = encode(&sample.fen, sample.elo_self)?;
            if sample.elo_oppo <= 0 {
                return Err(EncodingError::NonPositiveRating {
                    rating: sample.elo_oppo,
                });
            }
            positions.push(tensor);
            own.push(bucket);
            oppo.push(bucket_for(sample.elo_oppo));
        }
        let fens = samples.iter().map(|s| s.fen.clone()).collect();
        Self::new(&positions, &own, &oppo, fens)
    }

    /// Encode `fens`, all with the same rating on both sides.
    pub fn from_fens<S: AsRef<str>>(fens: &[S], rating: i64) -> Result<Self, EncodingError> {
        let samples: Vec<Sample> = fens
            .iter()
            .map(|fen| Sample {
                fen: fen.as_ref().to_string(),
                elo_self: rating,
                elo_oppo: rating,
            })
            .collect();
        Self::from_samples(&samples)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fens.is_empty()
    }

    #[must_use]
    pub fn board(&self) -> &Tensor {
        &self.board
    }

    #[must_use]
    pub fn elo_self(&self) -> &Tensor {
        &self.elo_self
    }

    #[must_use]
    pub fn elo_oppo(&self) -> &Tensor {
        &self.elo_oppo
    }

    #[must_use]
    pub fn fens(&self) -> &[String] {
        &self.fens
    }

    /// Graph feeds in input order.
    #[must_use]
    pub fn feeds(&self) -> [(&'static str, &Tensor); 3] {
        [
            (BOARD_INPUT, &self.board),
            (ELO_SELF, &self.elo_self),
            (ELO_OPPO, &self.elo_oppo),
        ]
    }
}

#[cfg(test)]
mod tests;
