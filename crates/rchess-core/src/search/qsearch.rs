//! 静止探索 (Quiescence Search)
//!
//! 駒取り・成り（王手中は全回避手、depth 0 では王手も）だけを読み、
//! 局面が静かになったところで stand pat 評価を返す。

use std::sync::atomic::Ordering;

use rand::RngCore;

use crate::position::Position;
use crate::search::alpha_beta::SearchWorker;
use crate::search::movepicker::MovePicker;
use crate::search::types::{value_from_tt, value_to_tt, PV};
use crate::types::{
    piece_value_eg, Bound, Depth, Move, MoveKind, Value, DEPTH_NONE, DEPTH_QS_CHECKS,
    DEPTH_QS_NO_CHECKS, MAX_PLY, PAWN_EG,
};

/// 静止探索
///
/// `depth <= 0`。fail-soft。
pub(crate) fn qsearch<const NT: u8>(
    w: &mut SearchWorker,
    pos: &mut Position,
    mut alpha: Value,
    beta: Value,
    depth: Depth,
    ply: i32,
) -> Value {
    let pv_node = NT == PV;

    debug_assert!(alpha >= -Value::INFINITE && alpha < beta && beta <= Value::INFINITE);
    debug_assert!(pv_node || alpha == beta - 1);
    debug_assert!(depth <= 0);

    let old_alpha = alpha;
    let in_check = pos.in_check();
    let mut game_cycle = false;

    if pv_node {
        w.stack.get_mut(ply).pv.clear();
    }
    w.stack.get_mut(ply).in_check = in_check;
    w.nodes.fetch_add(1, Ordering::Relaxed);

    if w.thread_id == 0 {
        w.check_time();
    }
    if w.stop.load(Ordering::Relaxed) {
        return Value::ZERO;
    }

    if pos.has_game_cycle(ply) {
        if Value::DRAW >= beta {
            return Value::DRAW;
        }
        alpha = alpha.max(Value::DRAW);
        game_cycle = true;
    }

    if pos.is_draw(ply) {
        return Value::DRAW;
    }

    if ply >= MAX_PLY {
        return if !in_check { w.eval(pos) } else { Value::DRAW };
    }

    if alpha >= Value::mate_in(ply + 1) {
        return Value::mate_in(ply + 1);
    }

    debug_assert!((0..MAX_PLY).contains(&ply));

    // 置換表の深さ区分は「王手を読んだか」で2種類だけ
    let tt_depth = if in_check || depth >= DEPTH_QS_CHECKS {
        DEPTH_QS_CHECKS
    } else {
        DEPTH_QS_NO_CHECKS
    };

    let pos_key = pos.key();
    let probe = w.tt.probe(pos_key);
    let tt_hit = probe.found;
    w.stack.get_mut(ply).tt_hit = tt_hit;
    let tt_data = probe.data;
    let tt_value = if tt_hit {
        value_from_tt(tt_data.value, ply, pos.rule50_count())
    } else {
        Value::NONE
    };
    let tt_move = if tt_hit { tt_data.mv } else { Move::NONE };
    let pv_hit = tt_hit && tt_data.is_pv;

    if !pv_node
        && tt_hit
        && !game_cycle
        && pos.rule50_count() < 88
        && tt_data.depth >= tt_depth
        && tt_value != Value::NONE
        && (tt_value != Value::DRAW || Value::DRAW >= beta)
        && tt_data.bound.can_cutoff(tt_value, beta)
    {
        return tt_value;
    }

    // stand pat 評価
    let mut best_move = Move::NONE;
    let mut best_value;
    let futility_base;

    if in_check {
        w.stack.get_mut(ply).static_eval = Value::NONE;
        best_value = -Value::INFINITE;
        futility_base = -Value::INFINITE;
    } else {
        let mut v;
        if tt_hit {
            v = tt_data.eval;
            if v == Value::NONE {
                v = w.eval(pos);
            }
            best_value = v;
            // 置換表の値の方が精度が高ければそちらを使う
            if tt_value != Value::NONE {
                let matches = if tt_value > best_value {
                    tt_data.bound.is_lower()
                } else {
                    tt_data.bound.is_upper()
                };
                if matches {
                    best_value = tt_value;
                }
            }
        } else {
            // null move の直後は符号反転した親の評価
            v = if w.stack.get(ply - 1).current_move != Move::NULL {
                w.eval(pos)
            } else {
                -w.stack.get(ply - 1).static_eval
            };
            best_value = v;
        }

        let damp = |x: Value, r50: i32| Value::new(x.raw() * (100 - r50).max(0) / 100);
        best_value = damp(best_value, pos.rule50_count());
        if game_cycle {
            best_value = damp(best_value, pos.rule50_count());
        }
        w.stack.get_mut(ply).static_eval = best_value;

        // stand pat: 静的評価だけで beta を超えるなら打ち切り
        if best_value >= beta {
            if !tt_hit {
                probe.write(
                    pos_key,
                    value_to_tt(best_value, ply),
                    false,
                    Bound::Lower,
                    DEPTH_NONE,
                    Move::NONE,
                    w.stack.get(ply).static_eval,
                    w.tt.generation(),
                );
            }
            return best_value;
        }

        if pv_node && best_value > alpha {
            alpha = best_value;
        }

        futility_base = best_value + 155;
    }

    let prev_move = w.stack.get(ply - 1).current_move;
    let prev_sq = if prev_move.is_ok() {
        Some(prev_move.to_sq())
    } else {
        None
    };

    let mut mp = {
        let cont = w.cont_refs(ply);
        MovePicker::new_qsearch(pos, tt_move, depth, &w.histories, &cont, prev_sq)
    };

    let mut move_count = 0;

    loop {
        let m = mp.next_move(pos, false);
        if m.is_none() {
            break;
        }

        let gives_check = pos.gives_check(m);
        let capture_or_promotion = pos.capture_or_promotion(m);

        move_count += 1;

        if !pv_node && best_value > Value::TB_LOSS_IN_MAX_PLY {
            // Futility と手数による枝刈り
            if !gives_check
                && futility_base > -Value::KNOWN_WIN
                && m.kind() != MoveKind::Promotion
            {
                if move_count > 2 {
                    continue;
                }

                let captured_value = pos.role_on(m.to_sq()).map_or(0, piece_value_eg);
                let futility_value = futility_base + captured_value;

                if futility_value <= alpha {
                    best_value = best_value.max(futility_value);
                    continue;
                }

                if futility_base <= alpha && !pos.see_ge(m, Value::new(1)) {
                    best_value = best_value.max(futility_base);
                    continue;
                }
            }

            // 負の SEE の手は読まない
            if !pos.see_ge(m, Value::ZERO) {
                continue;
            }
        }

        w.stack.get_mut(ply).current_move = m;
        w.set_cont_hist(
            ply,
            in_check,
            capture_or_promotion,
            pos.moved_piece(m),
            m.to_sq(),
        );

        // continuation history による枝刈り
        if !capture_or_promotion && !pv_node && best_value > Value::TB_LOSS_IN_MAX_PLY {
            let pc = pos.moved_piece(m);
            if w.cont_hist_value(ply - 1, pc, m.to_sq()) < 0
                && w.cont_hist_value(ply - 2, pc, m.to_sq()) < 0
            {
                continue;
            }
        }

        w.tt.prefetch(pos.key_after(m));

        pos.do_move(m);
        let value = -qsearch::<NT>(w, pos, -beta, -alpha, depth - 1, ply + 1);
        pos.undo_move();

        if w.stop.load(Ordering::Relaxed) {
            return Value::ZERO;
        }

        debug_assert!(value > -Value::INFINITE && value < Value::INFINITE);

        if value > best_value {
            best_value = value;

            if value > alpha {
                best_move = m;

                if pv_node {
                    w.stack.update_pv(ply, m);
                }

                if pv_node && value < beta {
                    alpha = value;
                } else {
                    break; // fail high
                }
            }
        }
    }

    // 序盤のバリエーション: 互角圏内の評価に小さなノイズを足す
    if w.options.variety > 0
        && best_value + w.options.variety * PAWN_EG / 100 >= Value::ZERO
        && best_value > -Value::INFINITE
    {
        best_value += Value::new((w.rng.next_u32() % (w.options.variety as u32 + 1)) as i32);
    }

    // 王手で合法手がなければ詰み
    if in_check && best_value == -Value::INFINITE {
        debug_assert!(pos.legal_moves().is_empty());
        return Value::mated_in(ply);
    }

    let bound = if best_value >= beta {
        Bound::Lower
    } else if pv_node && best_value > old_alpha {
        Bound::Exact
    } else {
        Bound::Upper
    };
    probe.write(
        pos_key,
        value_to_tt(best_value, ply),
        pv_hit,
        bound,
        tt_depth,
        best_move,
        w.stack.get(ply).static_eval,
        w.tt.generation(),
    );

    debug_assert!(best_value > -Value::INFINITE && best_value < Value::INFINITE);

    best_value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::limits::LimitsType;
    use crate::search::types::{NON_PV, PV};
    use crate::search::SearchOptions;
    use crate::tt::TranspositionTable;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn test_worker() -> Box<SearchWorker> {
        let mut w = SearchWorker::new(
            0,
            Arc::new(TranspositionTable::new(1)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(true)),
        );
        w.prepare_search(&SearchOptions::default(), &LimitsType::default());
        w
    }

    fn repetition_position() -> Position {
        let mut pos = Position::new();
        for uci in ["g1f3", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6", "f3g1", "f6g8"] {
            let m = pos
                .legal_moves()
                .into_iter()
                .find(|m| m.to_uci() == uci)
                .unwrap();
            pos.do_move(m);
        }
        pos
    }

    #[test]
    fn test_qsearch_repetition_draw_when_beta_below_draw() {
        let mut w = test_worker();
        let mut pos = repetition_position();
        let v = qsearch::<NON_PV>(&mut w, &mut pos, Value::new(-50), Value::new(-49), 0, 0);
        assert_eq!(v, Value::DRAW);
    }

    #[test]
    fn test_qsearch_repetition_draw_wide_window() {
        let mut w = test_worker();
        let mut pos = repetition_position();
        let v = qsearch::<PV>(&mut w, &mut pos, Value::new(-50), Value::new(50), 0, 0);
        assert_eq!(v, Value::DRAW);
    }

    #[test]
    fn test_qsearch_stand_pat_cutoff() {
        let mut w = test_worker();
        // 白がルーク1枚得で静かな局面
        let mut pos = Position::from_fen("4k3/8/8/8/8/8/8/R3K3 w - - 0 1").unwrap();
        let beta = Value::new(50);
        let v = qsearch::<NON_PV>(&mut w, &mut pos, beta - 1, beta, 0, 0);
        assert!(v >= beta);
    }
}
