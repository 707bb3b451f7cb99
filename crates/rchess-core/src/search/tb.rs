// Syzygy endgame tablebase probing.
//
// Wraps shakmaty-syzygy. WDL probes feed the search directly; at the root
// the moves are ranked by DTZ (falling back to WDL) so that the driver can
// keep only preserving moves in the principal group.

use std::path::Path;

use shakmaty_syzygy::{Tablebase, Wdl};

use crate::position::Position;
use crate::search::types::RootMoves;
use crate::types::{Depth, Value, MAX_PLY, PAWN_EG};

/// Wrapper around the shakmaty-syzygy tablebase.
pub struct SyzygyTb {
    tb: Tablebase<shakmaty::Chess>,
    max_pieces: u32,
}

/// TB configuration resolved from the options at root.
#[derive(Clone, Copy, Debug)]
pub struct TbConfig {
    pub cardinality: i32,
    pub probe_depth: Depth,
    pub use_rule50: bool,
}

impl SyzygyTb {
    /// Load tables from a directory. Returns the number of tables found.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<(Self, usize), std::io::Error> {
        let mut tb = Tablebase::new();
        let count = tb.add_directory(path.as_ref())?;
        let max_pieces = tb.max_pieces() as u32;
        log::info!("syzygy: {} tables, up to {} pieces", count, max_pieces);
        Ok((Self { tb, max_pieces }, count))
    }

    #[inline]
    pub fn max_pieces(&self) -> u32 {
        self.max_pieces
    }

    /// WDL for the side to move, as a signed integer in −2..=2
    /// (loss, blessed loss, draw, cursed win, win). `None` on probe failure;
    /// the search falls through to a normal search in that case.
    pub fn probe_wdl(&self, pos: &Position) -> Option<i32> {
        match self.tb.probe_wdl_after_zeroing(pos.board()) {
            Ok(wdl) => Some(match wdl {
                Wdl::Loss => -2,
                Wdl::BlessedLoss => -1,
                Wdl::Draw => 0,
                Wdl::CursedWin => 1,
                Wdl::Win => 2,
            }),
            Err(_) => None,
        }
    }

    /// Rank root moves with DTZ (or WDL) information. Returns whether the
    /// root is a TB position; on success every root move carries `tb_rank`
    /// and `tb_score` and the list is sorted by rank.
    pub fn rank_root_moves(&self, pos: &mut Position, root_moves: &mut RootMoves) -> bool {
        if pos.piece_count() > self.max_pieces || pos.has_castling_rights() {
            return false;
        }

        let mut any = false;
        for i in 0..root_moves.len() {
            let m = root_moves[i].mv();
            pos.do_move(m);
            let ranked = match self.tb.probe_dtz(pos.board()) {
                Ok(dtz) => {
                    // After our move the score is from the opponent's view.
                    let dtz = -dtz.ignore_rounding().0;
                    let rank = if dtz > 0 {
                        (1000 - dtz.min(900)) + 1
                    } else if dtz < 0 {
                        (-1000 - dtz.max(-900)) - 1
                    } else {
                        0
                    };
                    root_moves[i].tb_rank = rank;
                    root_moves[i].tb_score = dtz_to_value(dtz);
                    true
                }
                Err(_) => match self.probe_wdl_after(pos) {
                    Some(wdl) => {
                        root_moves[i].tb_rank = wdl * 1000;
                        root_moves[i].tb_score = wdl_to_value(wdl);
                        true
                    }
                    None => false,
                },
            };
            pos.undo_move();
            if !ranked {
                // Missing table: give up and clear partial ranks.
                for j in 0..root_moves.len() {
                    root_moves[j].tb_rank = 0;
                }
                return false;
            }
            any = true;
        }

        if any {
            root_moves.sort_by_tb_rank();
        }
        any
    }

    fn probe_wdl_after(&self, pos: &Position) -> Option<i32> {
        // Score after our move, negated back to our point of view.
        self.probe_wdl(pos).map(|w| -w)
    }
}

fn wdl_to_value(wdl: i32) -> Value {
    match wdl {
        2 => Value::TB_WIN - MAX_PLY,
        1 => Value::new(PAWN_EG / 2),
        -1 => Value::new(-PAWN_EG / 2),
        -2 => -Value::TB_WIN + MAX_PLY,
        _ => Value::DRAW,
    }
}

fn dtz_to_value(dtz: i32) -> Value {
    if dtz > 0 {
        Value::TB_WIN - dtz
    } else if dtz < 0 {
        -Value::TB_WIN - dtz
    } else {
        Value::DRAW
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wdl_to_value_ordering() {
        assert!(wdl_to_value(2) > wdl_to_value(1));
        assert!(wdl_to_value(1) > wdl_to_value(0));
        assert!(wdl_to_value(0) > wdl_to_value(-1));
        assert!(wdl_to_value(-1) > wdl_to_value(-2));
        assert!(wdl_to_value(2).is_win());
        assert!(wdl_to_value(-2).is_loss());
    }

    #[test]
    fn test_dtz_to_value_prefers_short_wins() {
        assert!(dtz_to_value(3) > dtz_to_value(10));
        assert!(dtz_to_value(-10) > dtz_to_value(-3));
    }
}
