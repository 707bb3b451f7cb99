//! MovePicker（指し手オーダリング）
//!
//! カットオフを起こしやすい手から順に返す。段階（Stage）は
//!
//! ### 通常探索（王手なし）
//! 1. MainTT - 置換表の指し手
//! 2. GoodCapture - 良い捕獲手（SEE が閾値以上）
//! 3. Refutation - キラー2手 + カウンター手
//! 4. Quiet - 静かな手（History順）
//! 5. BadCapture - 悪い捕獲手
//!
//! ### 王手回避 / 静止探索 / ProbCut
//! それぞれ TT手 → 生成 → 選択 の短い系列。
//!
//! History への参照は構築時のスコアリングにのみ使い、フィールドには
//! 保持しない。探索ループ中の可変借用と衝突しないための設計。

use shakmaty::Square;

use crate::position::Position;
use crate::search::history::{Histories, PieceToHistory, MAX_LPH};
use crate::types::{piece_value_mg, Depth, Move, Value, DEPTH_QS_CHECKS};

/// 静止探索で取り返しのみに絞る深さ
const DEPTH_QS_RECAPTURES: Depth = -5;

/// 既に返した手を示す番兵スコア
const USED: i32 = i32::MIN;

/// スコア付き指し手
#[derive(Clone, Copy)]
struct ExtMove {
    mv: Move,
    value: i32,
}

/// 指し手生成の段階
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stage {
    MainTT,
    GoodCapture,
    Refutation,
    Quiet,
    BadCapture,

    EvasionTT,
    Evasion,

    QsTT,
    QCapture,
    QCheck,

    ProbCutTT,
    ProbCut,

    End,
}

/// 指し手オーダリング器
pub struct MovePicker {
    stage: Stage,
    tt_move: Move,
    refutations: [Move; 3],
    refutation_idx: usize,
    depth: Depth,
    threshold: Value,

    captures: Vec<ExtMove>,
    quiets: Vec<ExtMove>,
    bad_captures: Vec<ExtMove>,
    checks: Vec<Move>,
    cur: usize,
}

impl MovePicker {
    /// 通常探索用コンストラクタ
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pos: &Position,
        tt_move: Move,
        depth: Depth,
        hist: &Histories,
        cont: &[&PieceToHistory; 6],
        counter: Move,
        killers: [Move; 2],
        ply: i32,
    ) -> Self {
        let in_check = pos.in_check();
        let tt_ok = tt_move.is_some() && pos.is_legal(tt_move);

        let mut mp = Self {
            stage: Stage::End,
            tt_move: if tt_ok { tt_move } else { Move::NONE },
            refutations: [killers[0], killers[1], counter],
            refutation_idx: 0,
            depth,
            threshold: Value::ZERO,
            captures: Vec::new(),
            quiets: Vec::new(),
            bad_captures: Vec::new(),
            checks: Vec::new(),
            cur: 0,
        };

        if in_check {
            mp.generate_evasions(pos, hist, cont, ply);
            mp.stage = if tt_ok { Stage::EvasionTT } else { Stage::Evasion };
        } else {
            mp.generate_main(pos, hist, cont, ply);
            mp.stage = if tt_ok { Stage::MainTT } else { Stage::GoodCapture };
        }
        mp
    }

    /// 静止探索用コンストラクタ
    pub fn new_qsearch(
        pos: &Position,
        tt_move: Move,
        depth: Depth,
        hist: &Histories,
        cont: &[&PieceToHistory; 6],
        prev_sq: Option<Square>,
    ) -> Self {
        let in_check = pos.in_check();
        // 静止探索のTT手は、王手回避以外では捕獲/成りに限る
        let tt_ok = tt_move.is_some()
            && pos.is_legal(tt_move)
            && (in_check || pos.capture_or_promotion(tt_move));

        let mut mp = Self {
            stage: Stage::End,
            tt_move: if tt_ok { tt_move } else { Move::NONE },
            refutations: [Move::NONE; 3],
            refutation_idx: 0,
            depth,
            threshold: Value::ZERO,
            captures: Vec::new(),
            quiets: Vec::new(),
            bad_captures: Vec::new(),
            checks: Vec::new(),
            cur: 0,
        };

        if in_check {
            mp.generate_evasions(pos, hist, cont, 0);
            mp.stage = if tt_ok { Stage::EvasionTT } else { Stage::Evasion };
            return mp;
        }

        let recapture_sq = if depth <= DEPTH_QS_RECAPTURES {
            prev_sq
        } else {
            None
        };
        for m in pos.legal_moves() {
            if pos.capture_or_promotion(m) {
                if let Some(sq) = recapture_sq {
                    if m.to_sq() != sq {
                        continue;
                    }
                }
                let captured = pos.role_on(m.to_sq());
                let value = captured.map_or(0, piece_value_mg) * 6
                    + hist
                        .capture_history
                        .get(pos.moved_piece(m), m.to_sq(), captured) as i32;
                mp.captures.push(ExtMove { mv: m, value });
            } else if depth >= DEPTH_QS_CHECKS && recapture_sq.is_none() && pos.gives_check(m) {
                mp.checks.push(m);
            }
        }
        sort_descending(&mut mp.captures);
        mp.stage = if tt_ok { Stage::QsTT } else { Stage::QCapture };
        mp
    }

    /// ProbCut専用コンストラクタ（SEE が threshold 以上の捕獲のみ）
    pub fn new_probcut(
        pos: &Position,
        tt_move: Move,
        threshold: Value,
        hist: &Histories,
    ) -> Self {
        debug_assert!(!pos.in_check());
        let tt_ok = tt_move.is_some()
            && pos.is_legal(tt_move)
            && pos.is_capture(tt_move)
            && pos.see_ge(tt_move, threshold);

        let mut mp = Self {
            stage: Stage::End,
            tt_move: if tt_ok { tt_move } else { Move::NONE },
            refutations: [Move::NONE; 3],
            refutation_idx: 0,
            depth: 0,
            threshold,
            captures: Vec::new(),
            quiets: Vec::new(),
            bad_captures: Vec::new(),
            checks: Vec::new(),
            cur: 0,
        };

        for m in pos.legal_moves() {
            if !pos.capture_or_promotion(m) {
                continue;
            }
            let captured = pos.role_on(m.to_sq());
            let value = captured.map_or(0, piece_value_mg) * 6
                + hist
                    .capture_history
                    .get(pos.moved_piece(m), m.to_sq(), captured) as i32;
            mp.captures.push(ExtMove { mv: m, value });
        }
        sort_descending(&mut mp.captures);
        mp.stage = if tt_ok { Stage::ProbCutTT } else { Stage::ProbCut };
        mp
    }

    fn generate_main(
        &mut self,
        pos: &Position,
        hist: &Histories,
        cont: &[&PieceToHistory; 6],
        ply: i32,
    ) {
        let us = pos.side_to_move();
        for m in pos.legal_moves() {
            if pos.capture_or_promotion(m) {
                let captured = pos.role_on(m.to_sq());
                let value = captured.map_or(0, piece_value_mg) * 6
                    + hist
                        .capture_history
                        .get(pos.moved_piece(m), m.to_sq(), captured) as i32;
                self.captures.push(ExtMove { mv: m, value });
            } else {
                let pc = pos.moved_piece(m);
                let to = m.to_sq();
                let mut value = hist.main_history.get(us, m) as i32
                    + 2 * cont[0].get(pc, to) as i32
                    + 2 * cont[1].get(pc, to) as i32
                    + 2 * cont[3].get(pc, to) as i32
                    + cont[5].get(pc, to) as i32;
                if (ply as usize) < MAX_LPH {
                    value +=
                        (self.depth / 3).min(4) * hist.low_ply_history.get(ply as usize, m) as i32;
                }
                self.quiets.push(ExtMove { mv: m, value });
            }
        }
        sort_descending(&mut self.captures);
        partial_insertion_sort(&mut self.quiets, -3000 * self.depth);
    }

    fn generate_evasions(
        &mut self,
        pos: &Position,
        hist: &Histories,
        cont: &[&PieceToHistory; 6],
        ply: i32,
    ) {
        let us = pos.side_to_move();
        for m in pos.legal_moves() {
            let value = if pos.is_capture(m) {
                let captured = pos.role_on(m.to_sq());
                captured.map_or(0, piece_value_mg) + (1 << 28)
            } else {
                let pc = pos.moved_piece(m);
                let mut v = hist.main_history.get(us, m) as i32 + cont[0].get(pc, m.to_sq()) as i32;
                if (ply as usize) < MAX_LPH {
                    v += 2 * hist.low_ply_history.get(ply as usize, m) as i32 / (1 + ply);
                }
                v
            };
            // 回避手はすべて captures バッファに入れて一括ソート
            self.captures.push(ExtMove { mv: m, value });
        }
        sort_descending(&mut self.captures);
    }

    /// 次の指し手を返す。尽きたら `Move::NONE`。
    ///
    /// `skip_quiets` が真のあいだは静かな手（Refutation含む）を飛ばす。
    /// 悪い捕獲手は残る。
    pub fn next_move(&mut self, pos: &Position, skip_quiets: bool) -> Move {
        loop {
            match self.stage {
                Stage::MainTT | Stage::EvasionTT | Stage::QsTT | Stage::ProbCutTT => {
                    self.stage = match self.stage {
                        Stage::MainTT => Stage::GoodCapture,
                        Stage::EvasionTT => Stage::Evasion,
                        Stage::QsTT => Stage::QCapture,
                        _ => Stage::ProbCut,
                    };
                    return self.tt_move;
                }

                Stage::GoodCapture => {
                    while self.cur < self.captures.len() {
                        let ext = self.captures[self.cur];
                        self.cur += 1;
                        if ext.mv == self.tt_move {
                            continue;
                        }
                        // SEE が悪い捕獲手は後回し
                        if pos.see_ge(ext.mv, Value::new(-ext.value / 18)) {
                            return ext.mv;
                        }
                        self.bad_captures.push(ext);
                    }
                    self.cur = 0;
                    self.stage = Stage::Refutation;
                }

                Stage::Refutation => {
                    if skip_quiets {
                        self.cur = 0;
                        self.stage = Stage::BadCapture;
                        continue;
                    }
                    while self.refutation_idx < 3 {
                        let m = self.refutations[self.refutation_idx];
                        self.refutation_idx += 1;
                        if m.is_none() || m == self.tt_move {
                            continue;
                        }
                        // 既知の静かな手の中にあるもののみ（= 合法な静かな手）
                        if let Some(slot) =
                            self.quiets.iter_mut().find(|e| e.mv == m && e.value != USED)
                        {
                            slot.value = USED;
                            return m;
                        }
                    }
                    self.cur = 0;
                    self.stage = Stage::Quiet;
                }

                Stage::Quiet => {
                    if skip_quiets {
                        self.cur = 0;
                        self.stage = Stage::BadCapture;
                        continue;
                    }
                    while self.cur < self.quiets.len() {
                        let ext = self.quiets[self.cur];
                        self.cur += 1;
                        if ext.mv == self.tt_move || ext.value == USED {
                            continue;
                        }
                        return ext.mv;
                    }
                    self.cur = 0;
                    self.stage = Stage::BadCapture;
                }

                Stage::BadCapture => {
                    while self.cur < self.bad_captures.len() {
                        let ext = self.bad_captures[self.cur];
                        self.cur += 1;
                        if ext.mv == self.tt_move {
                            continue;
                        }
                        return ext.mv;
                    }
                    return Move::NONE;
                }

                Stage::Evasion | Stage::QCapture => {
                    while self.cur < self.captures.len() {
                        let ext = self.captures[self.cur];
                        self.cur += 1;
                        if ext.mv == self.tt_move {
                            continue;
                        }
                        return ext.mv;
                    }
                    if self.stage == Stage::QCapture && self.depth >= DEPTH_QS_CHECKS {
                        self.cur = 0;
                        self.stage = Stage::QCheck;
                        continue;
                    }
                    return Move::NONE;
                }

                Stage::QCheck => {
                    while self.cur < self.checks.len() {
                        let m = self.checks[self.cur];
                        self.cur += 1;
                        if m == self.tt_move {
                            continue;
                        }
                        return m;
                    }
                    return Move::NONE;
                }

                Stage::ProbCut => {
                    while self.cur < self.captures.len() {
                        let ext = self.captures[self.cur];
                        self.cur += 1;
                        if ext.mv == self.tt_move {
                            continue;
                        }
                        if pos.see_ge(ext.mv, self.threshold) {
                            return ext.mv;
                        }
                    }
                    return Move::NONE;
                }

                Stage::End => return Move::NONE,
            }
        }
    }
}

/// スコア降順で全体をソート
fn sort_descending(moves: &mut [ExtMove]) {
    moves.sort_by(|a, b| b.value.cmp(&a.value));
}

/// `limit` 以上の要素のみ先頭に降順で集める部分挿入ソート
///
/// 閾値未満の手は生成順のまま後方に残る。
fn partial_insertion_sort(moves: &mut [ExtMove], limit: i32) {
    let mut sorted_end = 0;
    for i in 0..moves.len() {
        if moves[i].value >= limit {
            let tmp = moves[i];
            moves[i] = moves[sorted_end];
            let mut j = sorted_end;
            while j > 0 && moves[j - 1].value < tmp.value {
                moves[j] = moves[j - 1];
                j -= 1;
            }
            moves[j] = tmp;
            sorted_end += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::history::{ContHistKey, Histories};

    fn cont_refs(hist: &Histories) -> [&PieceToHistory; 6] {
        let sentinel = hist.continuation_history.table(ContHistKey::default());
        [sentinel; 6]
    }

    fn collect_all(pos: &Position, mp: &mut MovePicker) -> Vec<Move> {
        let mut out = Vec::new();
        loop {
            let m = mp.next_move(pos, false);
            if m.is_none() {
                break;
            }
            out.push(m);
        }
        out
    }

    #[test]
    fn test_picker_yields_all_legal_moves_once() {
        let pos = Position::new();
        let hist = Histories::new();
        let cont = cont_refs(&hist);
        let mut mp = MovePicker::new(
            &pos,
            Move::NONE,
            8,
            &hist,
            &cont,
            Move::NONE,
            [Move::NONE; 2],
            0,
        );
        let mut moves = collect_all(&pos, &mut mp);
        moves.sort_by_key(|m| m.to_u16());
        let mut legal = pos.legal_moves();
        legal.sort_by_key(|m| m.to_u16());
        assert_eq!(moves, legal);
    }

    #[test]
    fn test_picker_tt_move_first_and_not_repeated() {
        let pos = Position::new();
        let hist = Histories::new();
        let cont = cont_refs(&hist);
        let tt = pos
            .legal_moves()
            .into_iter()
            .find(|m| m.to_uci() == "d2d4")
            .unwrap();
        let mut mp = MovePicker::new(&pos, tt, 8, &hist, &cont, Move::NONE, [Move::NONE; 2], 0);
        let moves = collect_all(&pos, &mut mp);
        assert_eq!(moves[0], tt);
        assert_eq!(moves.iter().filter(|&&m| m == tt).count(), 1);
        assert_eq!(moves.len(), 20);
    }

    #[test]
    fn test_picker_captures_before_quiets() {
        // 白: Qxd5（良い捕獲）あり
        let pos = Position::from_fen("4k3/8/8/3q4/8/8/3Q4/4K3 w - - 0 1").unwrap();
        let hist = Histories::new();
        let cont = cont_refs(&hist);
        let mut mp = MovePicker::new(
            &pos,
            Move::NONE,
            8,
            &hist,
            &cont,
            Move::NONE,
            [Move::NONE; 2],
            0,
        );
        let first = mp.next_move(&pos, false);
        assert_eq!(first.to_uci(), "d2d5");
    }

    #[test]
    fn test_picker_killer_before_ordinary_quiets() {
        let pos = Position::new();
        let hist = Histories::new();
        let cont = cont_refs(&hist);
        let killer = pos
            .legal_moves()
            .into_iter()
            .find(|m| m.to_uci() == "h2h3")
            .unwrap();
        let mut mp = MovePicker::new(
            &pos,
            Move::NONE,
            8,
            &hist,
            &cont,
            Move::NONE,
            [killer, Move::NONE],
            0,
        );
        let moves = collect_all(&pos, &mut mp);
        // 捕獲はないのでキラーが先頭
        assert_eq!(moves[0], killer);
        assert_eq!(moves.iter().filter(|&&m| m == killer).count(), 1);
    }

    #[test]
    fn test_picker_skip_quiets_keeps_captures() {
        let pos = Position::from_fen("4k3/8/8/3p4/4P3/8/8/4K3 w - - 0 1").unwrap();
        let hist = Histories::new();
        let cont = cont_refs(&hist);
        let mut mp = MovePicker::new(
            &pos,
            Move::NONE,
            8,
            &hist,
            &cont,
            Move::NONE,
            [Move::NONE; 2],
            0,
        );
        let mut moves = Vec::new();
        loop {
            let m = mp.next_move(&pos, true);
            if m.is_none() {
                break;
            }
            moves.push(m);
        }
        assert!(moves.iter().all(|m| pos.capture_or_promotion(*m)));
        assert!(moves.iter().any(|m| m.to_uci() == "e4d5"));
    }

    #[test]
    fn test_picker_qsearch_only_noisy() {
        let pos = Position::from_fen("4k3/8/8/3p4/4P3/8/8/4K3 w - - 0 1").unwrap();
        let hist = Histories::new();
        let cont = cont_refs(&hist);
        let mut mp = MovePicker::new_qsearch(&pos, Move::NONE, -1, &hist, &cont, None);
        let moves = collect_all(&pos, &mut mp);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].to_uci(), "e4d5");
    }

    #[test]
    fn test_picker_probcut_respects_threshold() {
        // QxP は SEE で歩1枚分のみ
        let pos = Position::from_fen("4k3/8/8/3p4/8/8/3Q4/4K3 w - - 0 1").unwrap();
        let hist = Histories::new();
        let mut mp = MovePicker::new_probcut(
            &pos,
            Move::NONE,
            Value::new(crate::types::PAWN_MG + 1),
            &hist,
        );
        let m = mp.next_move(&pos, false);
        assert!(m.is_none());

        let mut mp = MovePicker::new_probcut(&pos, Move::NONE, Value::new(50), &hist);
        let m = mp.next_move(&pos, false);
        assert_eq!(m.to_uci(), "d2d5");
    }

    #[test]
    fn test_partial_insertion_sort_limit() {
        let mut moves: Vec<ExtMove> = [5, -100, 40, 7, -3]
            .iter()
            .enumerate()
            .map(|(i, &v)| ExtMove {
                mv: Move::new(
                    shakmaty::Square::new(8 + i as u32),
                    shakmaty::Square::new(16 + i as u32),
                ),
                value: v,
            })
            .collect();
        partial_insertion_sort(&mut moves, 0);
        let values: Vec<i32> = moves.iter().map(|e| e.value).collect();
        assert_eq!(&values[..3], &[40, 7, 5]);
        assert!(values[3..].contains(&-100));
        assert!(values[3..].contains(&-3));
    }
}
