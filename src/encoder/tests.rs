//! Encoder tests: plane layout, mirroring, strict input handling and
//! property tests for determinism and bucket monotonicity.

use super::*;
use crate::board::FenError;
use proptest::prelude::*;

const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

fn plane_sum(t: &PositionTensor, channel: usize) -> f32 {
    t.as_slice()[channel * 64..(channel + 1) * 64].iter().sum()
}

#[test]
fn test_start_position_planes() {
    let (t, bucket) = encode(START_FEN, 1500).unwrap();
    assert_eq!(bucket.index(), 5);
    for file in 0..8 {
        assert_eq!(t.get(0, 1, file), 1.0, "white pawn on file {file}");
        assert_eq!(t.get(6, 6, file), 1.0, "black pawn on file {file}");
    }
    assert_eq!(t.get(5, 0, 4), 1.0);
    assert_eq!(t.get(11, 7, 4), 1.0);
    assert_eq!(t.get(4, 0, 3), 1.0);
    assert_eq!(plane_sum(&t, 12), 64.0);
    for channel in 13..17 {
        assert_eq!(plane_sum(&t, channel), 64.0);
    }
    assert_eq!(plane_sum(&t, 17), 0.0);
    let pieces: f32 = (0..12).map(|c| plane_sum(&t, c)).sum();
    assert_eq!(pieces, 32.0);
}

#[test]
fn test_black_to_move_is_mirrored() {
    let (t, _) = encode(
        "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1",
        1500,
    )
    .unwrap();
    // The white pawn on e4 is now an opponent pawn on e5
    assert_eq!(t.get(6, 4, 4), 1.0);
    assert_eq!(t.get(0, 3, 4), 0.0);
    // Black's intact pawn rank is now the side to move's second rank
    for file in 0..8 {
        assert_eq!(t.get(0, 1, file), 1.0);
    }
    assert_eq!(t.get(5, 0, 4), 1.0);
    assert_eq!(plane_sum(&t, 12), 64.0);
    assert_eq!(t.get(17, 5, 4), 1.0);
    assert_eq!(plane_sum(&t, 17), 1.0);
}

#[test]
fn test_partial_castling_rights() {
    let (t, _) = encode("r3k2r/8/8/8/8/8/8/R3K2R w Kq - 0 1", 1200).unwrap();
    assert_eq!(plane_sum(&t, 13), 64.0);
    assert_eq!(plane_sum(&t, 14), 0.0);
    assert_eq!(plane_sum(&t, 15), 0.0);
    assert_eq!(plane_sum(&t, 16), 64.0);

    // Mirroring swaps which side holds which right
    let (t, _) = encode("r3k2r/8/8/8/8/8/8/R3K2R b Kq - 0 1", 1200).unwrap();
    assert_eq!(plane_sum(&t, 13), 0.0);
    assert_eq!(plane_sum(&t, 14), 64.0);
    assert_eq!(plane_sum(&t, 15), 64.0);
    assert_eq!(plane_sum(&t, 16), 0.0);
}

#[test]
fn test_incomplete_fen_is_rejected() {
    let err = encode("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq -", 1500).unwrap_err();
    assert!(matches!(
        err,
        EncodingError::Fen {
            source: FenError::WrongFieldCount { found: 4 },
            ..
        }
    ));
    assert!(matches!(
        encode("8/8/8/8/8/8/8/8 w - - 0 1", 1500),
        Err(EncodingError::Fen { .. })
    ));
}

#[test]
fn test_rating_must_be_positive() {
    assert_eq!(
        encode(START_FEN, 0).unwrap_err(),
        EncodingError::NonPositiveRating { rating: 0 }
    );
    assert!(encode(START_FEN, -1500).is_err());
}

#[test]
fn test_sample_batch_columns() {
    let fens = [
        START_FEN,
        "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1",
    ];
    let batch = SampleBatch::from_fens(&fens, 1500).unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.board().shape(), &[2, BOARD_CHANNELS, 8, 8]);
    assert_eq!(batch.elo_self().as_i64().unwrap(), &[5, 5]);
    assert_eq!(batch.elo_oppo().as_i64().unwrap(), &[5, 5]);
    assert_eq!(batch.fens()[1], fens[1]);

    let first = &batch.board().as_f32().unwrap()[..BOARD_FEATURES];
    assert_eq!(first, encode(START_FEN, 1500).unwrap().0.as_slice());
}

#[test]
fn test_sample_batch_mixed_ratings() {
    let samples = [
        Sample {
            fen: START_FEN.to_string(),
            elo_self: 1000,
            elo_oppo: 2500,
        },
        Sample {
            fen: START_FEN.to_string(),
            elo_self: 1650,
            elo_oppo: 1100,
        },
    ];
    let batch = SampleBatch::from_samples(&samples).unwrap();
    assert_eq!(batch.elo_self().as_i64().unwrap(), &[0, 6]);
    assert_eq!(batch.elo_oppo().as_i64().unwrap(), &[10, 1]);
}

#[test]
fn test_sample_batch_rejects_bad_shapes() {
    let empty: [&str; 0] = [];
    assert_eq!(
        SampleBatch::from_fens(&empty, 1500).unwrap_err(),
        EncodingError::EmptyBatch
    );

    let (t, b) = encode(START_FEN, 1500).unwrap();
    let err = SampleBatch::new(&[t.clone(), t], &[b], &[b, b], vec![START_FEN.to_string(); 2]).unwrap_err();
    assert_eq!(
        err,
        EncodingError::LengthMismatch {
            boards: 2,
            elo_self: 1,
            elo_oppo: 2
        }
    );
}

/// Random position with one king per side, no pawns on the back ranks.
fn random_fen(seed: u64) -> String {
    use rand::prelude::*;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut board = [None; 64];
    let white_king = rng.gen_range(0..64);
    let mut black_king = rng.gen_range(0..64);
    while black_king == white_king {
        black_king = rng.gen_range(0..64);
    }
    board[white_king] = Some('K');
    board[black_king] = Some('k');
    for (idx, slot) in board.iter_mut().enumerate() {
        if slot.is_some() || !rng.gen_bool(0.25) {
            continue;
        }
        let rank = idx / 8;
        let choices: &[char] = if rank == 0 || rank == 7 {
            &['N', 'B', 'R', 'Q', 'n', 'b', 'r', 'q']
        } else {
            &['P', 'N', 'B', 'R', 'Q', 'p', 'n', 'b', 'r', 'q']
        };
        *slot = choices.choose(&mut rng).copied();
    }

    let mut placement = String::new();
    for rank in (0..8).rev() {
        let mut empty = 0;
        for file in 0..8 {
            match board[rank * 8 + file] {
                Some(c) => {
                    if empty > 0 {
                        placement.push_str(&empty.to_string());
                        empty = 0;
                    }
                    placement.push(c);
                }
                None => empty += 1,
            }
        }
        if empty > 0 {
            placement.push_str(&empty.to_string());
        }
        if rank > 0 {
            placement.push('/');
        }
    }
    let side = if rng.gen_bool(0.5) { "w" } else { "b" };
    let castling = ["-", "K", "Qk", "KQkq", "q"].choose(&mut rng).copied().unwrap_or("-");
    format!("{placement} {side} {castling} - {} {}", rng.gen_range(0..50), rng.gen_range(1..120))
}

proptest! {
    /// Property: identical inputs give bit-identical tensors and buckets
    #[test]
    fn prop_encode_is_deterministic(seed in any::<u64>(), rating in 1i64..4000) {
        let fen = random_fen(seed);
        let (a, bucket_a) = encode(&fen, rating).unwrap();
        let (b, bucket_b) = encode(&fen, rating).unwrap();
        prop_assert_eq!(bucket_a, bucket_b);
        let bits_a: Vec<u32> = a.as_slice().iter().map(|v| v.to_bits()).collect();
        let bits_b: Vec<u32> = b.as_slice().iter().map(|v| v.to_bits()).collect();
        prop_assert_eq!(bits_a, bits_b);
    }

    /// Property: the encoding depends only on the position, not its spelling
    #[test]
    fn prop_encode_survives_fen_round_trip(seed in any::<u64>()) {
        let fen = random_fen(seed);
        let position = Position::try_from_fen(&fen).unwrap();
        let reparsed = Position::try_from_fen(&position.to_fen()).unwrap();
        prop_assert!(encode_position(&position) == encode_position(&reparsed));
    }

    /// Property: the side to move always lands on the all-ones plane
    #[test]
    fn prop_side_to_move_plane_is_set(seed in any::<u64>()) {
        let fen = random_fen(seed);
        let (t, _) = encode(&fen, 1500).unwrap();
        prop_assert_eq!(plane_sum(&t, 12), 64.0);
    }

    /// Property: buckets are monotonic in the rating
    #[test]
    fn prop_bucket_monotonic(a in any::<i64>(), b in any::<i64>()) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(bucket_for(lo) <= bucket_for(hi));
        prop_assert!(bucket_for(hi).index() < RATING_BUCKETS);
    }

    /// Property: every rating falls inside its bucket's range
    #[test]
    fn prop_bucket_contains_rating(rating in -10_000i64..10_000) {
        let (low, high) = bucket_for(rating).range();
        prop_assert!(low.map_or(true, |l| rating >= l));
        prop_assert!(high.map_or(true, |h| rating < h));
    }
}
