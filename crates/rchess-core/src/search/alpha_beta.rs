//! Alpha-Beta探索の実装
//!
//! Stockfish 系の探索骨格:
//! - Principal Variation Search（Root / PV / NonPV の const generic）
//! - 置換表カットオフ、テーブルベース、静的評価
//! - 各種枝刈り: Futility, Null Move（検証探索付き）, ProbCut, LMP, SEE
//! - Singular / Check / ゲームサイクル延長、LMR
//!
//! `SearchWorker` は1スレッド分の状態（履歴・スタック・ルート手）を持ち、
//! 対局をまたいで再利用される。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use shakmaty::Square;
use smallvec::SmallVec;

use crate::eval::evaluate;
use crate::position::Position;
use crate::search::breadcrumbs::ThreadHolding;
use crate::search::history::{stat_bonus, ContHistKey, Histories, PieceToHistory, MAX_LPH};
use crate::search::limits::LimitsType;
use crate::search::movepicker::MovePicker;
use crate::search::pruning::{
    futility_margin, futility_move_count, prune_shallow_move, reduction, ShallowPruningContext,
};
use crate::search::qsearch::qsearch;
use crate::search::tb::SyzygyTb;
use crate::search::time_manager::TimeManagement;
use crate::search::types::{
    make_key, value_from_tt, value_to_tt, RootMoves, SearchStack, NON_PV, PV, ROOT,
};
use crate::search::SearchOptions;
use crate::tt::TranspositionTable;
use crate::types::{Bound, Depth, Move, Piece, Value, DEPTH_NONE, MAX_PLY, PAWN_EG, PAWN_MG};

// =============================================================================
// 定数
// =============================================================================

/// ttHit 移動平均の窓
pub const TT_HIT_AVERAGE_WINDOW: u64 = 4096;
/// ttHit 移動平均の分解能
pub const TT_HIT_AVERAGE_RESOLUTION: u64 = 1024;

// =============================================================================
// SearchWorker
// =============================================================================

/// 探索用のワーカー状態
///
/// Workerはゲーム全体で再利用される。履歴統計は直接メンバとして保持し、
/// `ucinewgame` でクリア、`go` では保持する。
pub struct SearchWorker {
    /// スレッドID（0 = main）
    pub thread_id: usize,
    /// 置換表への共有参照
    pub tt: Arc<TranspositionTable>,
    /// テーブルベース（未設定なら None）
    pub tb: Option<Arc<SyzygyTb>>,
    /// 停止フラグ（全スレッド共有）
    pub stop: Arc<AtomicBool>,
    /// ponder中フラグ（全スレッド共有）
    pub ponder: Arc<AtomicBool>,
    /// 次イテレーションで深さを伸ばすか（全スレッド共有）
    pub increase_depth: Arc<AtomicBool>,
    /// 探索ノード数（このスレッド分）
    pub nodes: Arc<AtomicU64>,
    /// TBヒット数（このスレッド分）
    pub tb_hits: Arc<AtomicU64>,
    /// 全スレッドのノードカウンタ（mainのみ、時間管理用）
    pub node_counters: Vec<Arc<AtomicU64>>,

    /// 履歴/統計テーブル群
    pub histories: Box<Histories>,
    /// オプションのスナップショット
    pub options: SearchOptions,
    /// go制限のスナップショット
    pub limits: LimitsType,
    /// 時間管理（mainスレッドのみ）
    pub tm: Option<TimeManagement>,
    /// ponderhit後に停止する予約（mainのみ）
    pub stop_on_ponderhit: bool,
    /// bestmove 出力前の currmove 情報を出すか
    pub report_currmove: bool,

    // =========================================================================
    // 探索状態
    // =========================================================================
    pub stack: SearchStack,
    pub root_moves: RootMoves,
    pub root_depth: Depth,
    pub completed_depth: Depth,
    pub sel_depth: i32,
    pub pv_idx: usize,
    pub pv_last: usize,
    pub best_move_changes: f64,
    pub tt_hit_average: u64,
    /// Null move 検証探索中フラグ
    pub nmp_guard: bool,
    /// このスレッドは枝刈りと延長を使わず全幅で読む
    pub full_search: bool,
    /// check_time の呼び出し間引きカウンタ
    pub calls_cnt: i32,
    /// 動的コンテンポ（白視点の mg, eg）
    pub trend: (i32, i32),
    /// Variety ノイズ用の乱数（テスト再現性のため固定シード）
    pub rng: Xoshiro256PlusPlus,

    // ルートで解決された TB 設定
    pub tb_cardinality: i32,
    pub tb_probe_depth: Depth,
    pub tb_use_rule50: bool,
    pub root_in_tb: bool,
}

impl SearchWorker {
    pub fn new(
        thread_id: usize,
        tt: Arc<TranspositionTable>,
        stop: Arc<AtomicBool>,
        ponder: Arc<AtomicBool>,
        increase_depth: Arc<AtomicBool>,
    ) -> Box<Self> {
        Box::new(Self {
            thread_id,
            tt,
            tb: None,
            stop,
            ponder,
            increase_depth,
            nodes: Arc::new(AtomicU64::new(0)),
            tb_hits: Arc::new(AtomicU64::new(0)),
            node_counters: Vec::new(),
            histories: Histories::new(),
            options: SearchOptions::default(),
            limits: LimitsType::default(),
            tm: None,
            stop_on_ponderhit: false,
            report_currmove: false,
            stack: SearchStack::new(),
            root_moves: RootMoves::new(),
            root_depth: 0,
            completed_depth: 0,
            sel_depth: 0,
            pv_idx: 0,
            pv_last: 0,
            best_move_changes: 0.0,
            tt_hit_average: 0,
            nmp_guard: false,
            full_search: false,
            calls_cnt: 0,
            trend: (0, 0),
            rng: Xoshiro256PlusPlus::seed_from_u64(thread_id as u64),
            tb_cardinality: 0,
            tb_probe_depth: 1,
            tb_use_rule50: true,
            root_in_tb: false,
        })
    }

    /// `ucinewgame` 相当: 全履歴をクリア
    pub fn clear(&mut self) {
        self.histories.clear();
    }

    /// `go` 毎のリセット（履歴はクリアしない）
    pub fn prepare_search(&mut self, options: &SearchOptions, limits: &LimitsType) {
        self.options = options.clone();
        self.limits = limits.clone();
        self.nodes.store(0, Ordering::Relaxed);
        self.tb_hits.store(0, Ordering::Relaxed);
        self.stack.reset();
        self.root_depth = 0;
        self.completed_depth = 0;
        self.sel_depth = 0;
        self.pv_idx = 0;
        self.pv_last = 0;
        self.best_move_changes = 0.0;
        self.tt_hit_average = TT_HIT_AVERAGE_WINDOW * TT_HIT_AVERAGE_RESOLUTION / 2;
        self.nmp_guard = false;
        self.calls_cnt = 0;
        self.stop_on_ponderhit = false;
        self.trend = (0, 0);
        self.full_search = self.thread_id > 0 && self.thread_id <= options.full_depth_threads;
        self.histories.low_ply_history.age();
        self.rng = Xoshiro256PlusPlus::seed_from_u64(self.thread_id as u64);
    }

    /// 静的評価の呼び出し（コンテンポ込み）
    #[inline]
    pub(super) fn eval(&self, pos: &Position) -> Value {
        evaluate(pos, self.trend)
    }

    /// 全スレッド合計の探索ノード数
    pub fn total_nodes(&self) -> u64 {
        if self.node_counters.is_empty() {
            self.nodes.load(Ordering::Relaxed)
        } else {
            self.node_counters
                .iter()
                .map(|n| n.load(Ordering::Relaxed))
                .sum()
        }
    }

    /// 時間切れ・ノード上限の監視（mainスレッドのみ呼ばれる）
    pub(super) fn check_time(&mut self) {
        self.calls_cnt -= 1;
        if self.calls_cnt > 0 {
            return;
        }
        // nodes 指定時は 0.1% 粒度を下回らない頻度で確認する
        self.calls_cnt = if self.limits.nodes > 0 {
            ((self.limits.nodes / 1024) as i32).clamp(1, 1024)
        } else {
            1024
        };

        // ponder中はGUIの指示があるまで止めない
        if self.ponder.load(Ordering::Relaxed) {
            return;
        }

        let nodes = self.total_nodes();
        let Some(tm) = &self.tm else {
            if self.limits.nodes > 0 && nodes >= self.limits.nodes {
                self.stop.store(true, Ordering::Relaxed);
            }
            return;
        };
        let elapsed = tm.elapsed(nodes);

        if (self.limits.use_time_management()
            && tm.maximum() > 0
            && (elapsed > tm.maximum() - 10 || self.stop_on_ponderhit))
            || (self.limits.movetime > 0 && elapsed >= self.limits.movetime)
            || (self.limits.nodes > 0 && nodes >= self.limits.nodes)
        {
            self.stop.store(true, Ordering::Relaxed);
        }
    }

    // =========================================================================
    // continuation history ヘルパー
    // =========================================================================

    #[inline]
    pub(super) fn set_cont_hist(
        &mut self,
        ply: i32,
        in_check: bool,
        capture: bool,
        piece: Piece,
        to: Square,
    ) {
        self.stack.get_mut(ply).cont_hist = ContHistKey {
            in_check,
            capture,
            piece,
            to,
        };
    }

    /// 探索スタックの (ss-1,-2,-4,-6) が指す continuation テーブル
    ///
    /// 添字 2, 4 は未使用スロット（番兵）。
    pub(super) fn cont_refs(&self, ply: i32) -> [&PieceToHistory; 6] {
        let ch = &self.histories.continuation_history;
        [
            ch.table(self.stack.get(ply - 1).cont_hist),
            ch.table(self.stack.get(ply - 2).cont_hist),
            ch.table(ContHistKey::default()),
            ch.table(self.stack.get(ply - 4).cont_hist),
            ch.table(ContHistKey::default()),
            ch.table(self.stack.get(ply - 6).cont_hist),
        ]
    }

    /// `ply` のスロットが指す continuation テーブルの (pc, to) 値
    #[inline]
    pub(super) fn cont_hist_value(&self, ply: i32, pc: Piece, to: Square) -> i32 {
        self.histories
            .continuation_history
            .table(self.stack.get(ply).cont_hist)
            .get(pc, to) as i32
    }

    /// ply −1,−2,−4,−6 の continuation history に bonus を加える
    ///
    /// 王手中は −4, −6 を飛ばす。番兵スロットは current_move が
    /// 無効なので自然に除外される。
    pub(super) fn update_continuation_histories(
        &mut self,
        ply: i32,
        pc: Piece,
        to: Square,
        bonus: i32,
    ) {
        let in_check = self.stack.get(ply).in_check;
        for i in [1, 2, 4, 6] {
            if in_check && i > 2 {
                break;
            }
            if self.stack.get(ply - i).current_move.is_ok() {
                let key = self.stack.get(ply - i).cont_hist;
                self.histories
                    .continuation_history
                    .table_mut(key)
                    .update(pc, to, bonus);
            }
        }
    }

    /// 静かな手のカットオフ時の統計更新
    pub(super) fn update_quiet_stats(
        &mut self,
        pos: &Position,
        ply: i32,
        mv: Move,
        bonus: i32,
        depth: Depth,
    ) {
        let slot = self.stack.get_mut(ply);
        if slot.killers[0] != mv {
            slot.killers[1] = slot.killers[0];
            slot.killers[0] = mv;
        }

        let us = pos.side_to_move();
        self.histories.main_history.update(us, mv, bonus);
        self.update_continuation_histories(ply, pos.moved_piece(mv), mv.to_sq(), bonus);

        // 歩以外は逆向きの手にペナルティ
        if !pos.moved_piece(mv).is_pawn() {
            self.histories.main_history.update(us, mv.reverse(), -bonus);
        }

        let prev = self.stack.get(ply - 1).current_move;
        if prev.is_ok() {
            let prev_sq = prev.to_sq();
            self.histories
                .counter_moves
                .set(pos.piece_on(prev_sq), prev_sq, mv);
        }

        if depth > 11 && (ply as usize) < MAX_LPH {
            self.histories
                .low_ply_history
                .update(ply as usize, mv, stat_bonus(depth - 7));
        }
    }

    /// bestMove 確定時の統計一括更新
    #[allow(clippy::too_many_arguments)]
    pub(super) fn update_all_stats(
        &mut self,
        pos: &Position,
        ply: i32,
        best_move: Move,
        best_value: Value,
        beta: Value,
        prev_sq: Square,
        quiets: &[Move],
        captures: &[Move],
        depth: Depth,
    ) {
        let us = pos.side_to_move();
        let moved_piece = pos.moved_piece(best_move);
        let captured = pos.role_on(best_move.to_sq());

        let bonus1 = stat_bonus(depth + 1);
        let bonus2 = if best_value > beta + PAWN_MG {
            bonus1
        } else {
            bonus1.min(stat_bonus(depth))
        };

        if !pos.capture_or_promotion(best_move) {
            self.update_quiet_stats(pos, ply, best_move, bonus2, depth);

            for &q in quiets {
                self.histories.main_history.update(us, q, -bonus2);
                self.update_continuation_histories(ply, pos.moved_piece(q), q.to_sq(), -bonus2);
            }
        } else {
            self.histories
                .capture_history
                .update(moved_piece, best_move.to_sq(), captured, bonus1);
        }

        // 直前の静かな早指し手が反駁されたときの追加ペナルティ
        let prev_move = self.stack.get(ply - 1).current_move;
        let prev_move_count = self.stack.get(ply - 1).move_count;
        let prev_tt_hit = self.stack.get(ply - 1).tt_hit;
        let prev_killer = self.stack.get(ply - 1).killers[0];
        if (prev_move_count == 1 + prev_tt_hit as i32 || prev_move == prev_killer)
            && pos.captured_piece().is_none()
            && prev_move.is_ok()
        {
            let pc = pos.piece_on(prev_sq);
            self.update_continuation_histories(ply - 1, pc, prev_sq, -bonus1);
        }

        for &c in captures {
            let mp = pos.moved_piece(c);
            let cap = pos.role_on(c.to_sq());
            self.histories
                .capture_history
                .update(mp, c.to_sq(), cap, -bonus1);
        }
    }
}

// =============================================================================
// search
// =============================================================================

/// メインの再帰探索
///
/// fail-soft。`NT` は NodeType、`cut_node` は実行時フラグ。
pub(crate) fn search<const NT: u8>(
    w: &mut SearchWorker,
    pos: &mut Position,
    mut alpha: Value,
    beta: Value,
    mut depth: Depth,
    cut_node: bool,
    ply: i32,
) -> Value {
    let pv_node = NT != NON_PV;
    let root_node = NT == ROOT;
    let max_next_depth = if root_node { depth } else { depth + 1 };

    // 深さが尽きたら静止探索へ
    if depth <= 0 {
        return if pv_node {
            qsearch::<PV>(w, pos, alpha, beta, 0, ply)
        } else {
            qsearch::<NON_PV>(w, pos, alpha, beta, 0, ply)
        };
    }

    debug_assert!(-Value::INFINITE <= alpha && alpha < beta && beta <= Value::INFINITE);
    debug_assert!(pv_node || alpha == beta - 1);
    debug_assert!(0 < depth && depth < MAX_PLY);
    debug_assert!(!(pv_node && cut_node));

    // Step 1. ノード初期化
    let in_check = pos.in_check();
    let prior_capture = pos.captured_piece().is_some();
    let us = pos.side_to_move();
    let mut move_count = 0;
    w.stack.get_mut(ply).move_count = 0;
    w.stack.get_mut(ply).in_check = in_check;
    let mut best_value = -Value::INFINITE;
    let mut best_move = Move::NONE;
    let mut game_cycle = false;
    let mut king_danger = false;
    let root_depth = w.root_depth;
    let mut improving = w.full_search;

    if w.thread_id == 0 {
        w.check_time();
    }
    w.nodes.fetch_add(1, Ordering::Relaxed);

    if pv_node && w.sel_depth < ply + 1 {
        w.sel_depth = ply + 1;
    }

    // Step 2. 置換表参照
    //
    // singular 探索中は部分探索の値で完全探索の値を潰さないよう、
    // 除外手で撹乱した別キーを使う。
    let excluded_move = w.stack.get(ply).excluded_move;
    let pos_key = if excluded_move.is_none() {
        pos.key()
    } else {
        pos.key() ^ make_key(excluded_move.to_u16() as u64)
    };
    let probe = w.tt.probe(pos_key);
    let tt_hit = probe.found;
    w.stack.get_mut(ply).tt_hit = tt_hit;
    let tt_data = probe.data;
    let tt_value = if tt_hit {
        value_from_tt(tt_data.value, ply, pos.rule50_count())
    } else {
        Value::NONE
    };
    let tt_depth = tt_data.depth;
    let tt_bound = tt_data.bound;
    let tt_move = if root_node {
        w.root_moves[w.pv_idx].mv()
    } else if tt_hit {
        tt_data.mv
    } else {
        Move::NONE
    };
    if excluded_move.is_none() {
        let v = pv_node || (tt_hit && tt_data.is_pv);
        w.stack.get_mut(ply).tt_pv = v;
    }

    // ルート付近のPV局面では直前の手に low ply history ボーナス
    if w.stack.get(ply).tt_pv
        && depth > 12
        && ply >= 1
        && ((ply - 1) as usize) < MAX_LPH
        && !prior_capture
        && w.stack.get(ply - 1).current_move.is_ok()
    {
        let prev = w.stack.get(ply - 1).current_move;
        w.histories
            .low_ply_history
            .update((ply - 1) as usize, prev, stat_bonus(depth - 5));
    }

    // ttHit の移動平均
    w.tt_hit_average = (TT_HIT_AVERAGE_WINDOW - 1) * w.tt_hit_average / TT_HIT_AVERAGE_WINDOW
        + TT_HIT_AVERAGE_RESOLUTION * tt_hit as u64;

    if !root_node {
        // 繰り返しに入れる局面は引き分け値で抑える
        if pos.has_game_cycle(ply) {
            if Value::DRAW >= beta {
                probe.write(
                    pos_key,
                    Value::DRAW,
                    w.stack.get(ply).tt_pv,
                    Bound::Upper,
                    depth,
                    Move::NONE,
                    Value::NONE,
                    w.tt.generation(),
                );
                return Value::DRAW;
            }
            game_cycle = true;
            alpha = alpha.max(Value::DRAW);
        }

        // Step 3. 中断と引き分けの確認
        if pos.is_draw(ply) {
            return Value::DRAW;
        }

        if w.stop.load(Ordering::Relaxed) || ply >= MAX_PLY {
            return if ply >= MAX_PLY && !in_check {
                w.eval(pos)
            } else {
                Value::DRAW
            };
        }

        // Step 4. 詰み距離による枝刈り
        if alpha >= Value::mate_in(ply + 1) {
            return Value::mate_in(ply + 1);
        }
    }

    debug_assert!((0..MAX_PLY).contains(&ply));

    w.stack.get_mut(ply + 1).tt_pv = false;
    w.stack.get_mut(ply + 1).excluded_move = Move::NONE;
    w.stack.get_mut(ply + 2).killers = [Move::NONE; 2];
    let de = w.stack.get(ply - 1).double_extensions;
    w.stack.get_mut(ply).double_extensions = de;
    let prev_move = w.stack.get(ply - 1).current_move;
    let prev_sq = prev_move.to_sq();

    // statScore は孫ノード間で共有される（最初の孫だけ0から始まる）
    if !root_node {
        w.stack.get_mut(ply + 2).stat_score = 0;
    }

    // Step 5. 非PVノードの置換表カットオフ
    if !pv_node
        && tt_hit
        && !game_cycle
        && pos.rule50_count() < 88
        && tt_depth >= depth
        && tt_value != Value::NONE
        && (tt_value != Value::DRAW || Value::DRAW >= beta)
        && tt_bound.can_cutoff(tt_value, beta)
    {
        // 置換表の手で並べ替え統計を更新してから返す
        if tt_move.is_some() {
            if tt_value >= beta {
                if !pos.capture_or_promotion(tt_move) {
                    w.update_quiet_stats(pos, ply, tt_move, stat_bonus(depth), depth);
                }
                // 直前の静かな早指し手への追加ペナルティ
                if w.stack.get(ply - 1).move_count <= 2 && !prior_capture && prev_move.is_ok() {
                    let pc = pos.piece_on(prev_sq);
                    w.update_continuation_histories(ply - 1, pc, prev_sq, -stat_bonus(depth + 1));
                }
            } else if !pos.capture_or_promotion(tt_move) {
                let penalty = -stat_bonus(depth);
                w.histories.main_history.update(us, tt_move, penalty);
                w.update_continuation_histories(
                    ply,
                    pos.moved_piece(tt_move),
                    tt_move.to_sq(),
                    penalty,
                );
            }
        }
        return tt_value;
    }

    // Step 6. テーブルベース参照
    if !root_node && w.tb_cardinality > 0 {
        let pieces = pos.piece_count() as i32;

        if pieces <= w.tb_cardinality
            && (pieces < w.tb_cardinality || depth >= w.tb_probe_depth)
            && pos.rule50_count() == 0
            && !pos.has_castling_rights()
        {
            if let Some(tb) = w.tb.clone() {
                if let Some(wdl) = tb.probe_wdl(pos) {
                    // 次の機会に時間確認を強制する
                    if w.thread_id == 0 {
                        w.calls_cnt = 0;
                    }
                    w.tb_hits.fetch_add(1, Ordering::Relaxed);

                    let draw_score = if w.tb_use_rule50 { 1 } else { 0 };
                    let centi_ply = PAWN_EG * ply / 100;
                    let v = wdl;

                    let tb_value = if v < -draw_score {
                        -Value::TB_WIN
                            + centi_ply
                            + PAWN_EG * pos.piece_count_of(pos.side_to_move()) as i32
                    } else if v > draw_score {
                        Value::TB_WIN
                            - centi_ply
                            - PAWN_EG * pos.piece_count_of(!pos.side_to_move()) as i32
                    } else if v < 0 {
                        Value::new(-56)
                    } else {
                        Value::DRAW
                    };

                    if v.abs() <= draw_score
                        || !tt_hit
                        || (v < -draw_score && beta > tb_value + 19)
                        || (v > draw_score && alpha < tb_value - 19)
                    {
                        let bound = if v > draw_score {
                            Bound::Lower
                        } else if v < -draw_score {
                            Bound::Upper
                        } else {
                            Bound::Exact
                        };
                        probe.write(
                            pos_key,
                            tb_value,
                            w.stack.get(ply).tt_pv,
                            bound,
                            depth,
                            Move::NONE,
                            Value::NONE,
                            w.tt.generation(),
                        );
                        return tb_value;
                    }
                }
            }
        }
    }

    // Step 7. 静的評価
    let mut eval;
    if in_check {
        w.stack.get_mut(ply).static_eval = Value::NONE;
        eval = Value::NONE;
        improving = w.full_search;
    } else {
        let mut v;
        if tt_hit {
            v = tt_data.eval;
            if v == Value::NONE {
                v = w.eval(pos);
            }
            eval = v;
            // 置換表の値で評価を精緻化できるか
            if tt_value != Value::NONE {
                let b = if tt_value > eval {
                    tt_bound.is_lower()
                } else {
                    tt_bound.is_upper()
                };
                if b {
                    eval = tt_value;
                }
            }
        } else {
            // null move の直後は符号反転した親の評価を使う
            if prev_move != Move::NULL {
                v = w.eval(pos);
            } else {
                v = -w.stack.get(ply - 1).static_eval;
            }
            eval = v;
        }

        // 50手ルールが近いほど評価を絞る（サイクル時は二重に）
        let damp = |x: Value, r50: i32| Value::new(x.raw() * (100 - r50).max(0) / 100);
        eval = damp(eval, pos.rule50_count());
        if game_cycle {
            eval = damp(eval, pos.rule50_count());
        }
        w.stack.get_mut(ply).static_eval = eval;

        if !tt_hit && excluded_move.is_none() {
            probe.write(
                pos_key,
                Value::NONE,
                w.stack.get(ply).tt_pv,
                Bound::None,
                DEPTH_NONE,
                Move::NONE,
                eval,
                w.tt.generation(),
            );
        }

        // 評価の落差で直前の相手の静かな手の並び順を補正
        if prev_move.is_ok() && !w.stack.get(ply - 1).in_check && !prior_capture {
            let prev_eval = w.stack.get(ply - 1).static_eval;
            if prev_eval != Value::NONE {
                let bonus = (-depth * 4 * (prev_eval.raw() + eval.raw())).clamp(-1000, 1000);
                w.histories.main_history.update(!us, prev_move, bonus);
            }
        }

        if !w.full_search {
            // Step 8. improving の判定
            improving = if w.stack.get(ply - 2).static_eval == Value::NONE {
                w.stack.get(ply).static_eval > w.stack.get(ply - 4).static_eval
                    || w.stack.get(ply - 4).static_eval == Value::NONE
            } else {
                w.stack.get(ply).static_eval > w.stack.get(ply - 2).static_eval
            };

            // Step 9. 早期枝刈り
            if !pv_node
                && excluded_move.is_none()
                && !game_cycle
                && !w.nmp_guard
                && eval.raw().abs() < 2 * Value::KNOWN_WIN.raw()
            {
                if root_depth > 10 {
                    king_danger = pos.king_danger();
                }

                // Futility（子ノード）
                if depth < 6
                    && !king_danger
                    && alpha.raw().abs() < Value::KNOWN_WIN.raw()
                    && eval - futility_margin(depth, improving) >= beta
                    && eval < Value::KNOWN_WIN
                {
                    return eval;
                }

                // Null move（検証探索付き）
                if prev_move != Move::NULL
                    && w.stack.get(ply - 1).stat_score < 23767
                    && eval >= beta
                    && eval >= w.stack.get(ply).static_eval
                    && w.stack.get(ply).static_eval
                        >= beta - 20 * depth - 22 * improving as i32
                            + 168 * w.stack.get(ply).tt_pv as i32
                            + 159
                    && pos.non_pawn_material(us) > 0
                    && !king_danger
                    && !(root_depth > 10 && pos.legal_moves().len() < 6)
                {
                    debug_assert!(eval >= beta);

                    // 深さと評価差に応じた動的な削減量
                    let r = ((eval - beta).raw() / 205).min(3) + depth / 3 + 4;

                    if depth < 11 || tt_value >= beta || tt_depth < depth - r || !tt_bound.is_upper()
                    {
                        w.stack.get_mut(ply).current_move = Move::NULL;
                        w.stack.get_mut(ply).cont_hist = ContHistKey::default();

                        pos.do_null_move();
                        let null_value =
                            -search::<NON_PV>(w, pos, -beta, -beta + 1, depth - r, !cut_node, ply + 1);
                        pos.undo_null_move();

                        if null_value >= beta {
                            // 証明されていない詰み/TBスコアは返さない
                            let null_value = null_value.min(Value::TB_WIN_IN_MAX_PLY);

                            if beta.raw().abs() < Value::KNOWN_WIN.raw()
                                && depth < 11
                                && beta <= qsearch::<NON_PV>(w, pos, beta - 1, beta, 0, ply)
                            {
                                return null_value;
                            }

                            // 高い深さでは同じ窓で検証探索を行う
                            w.nmp_guard = true;
                            let v = search::<NON_PV>(w, pos, beta - 1, beta, depth - r, false, ply);
                            w.nmp_guard = false;

                            if v >= beta {
                                return null_value;
                            }
                        }
                    }
                }

                // Step 10. ProbCut
                let probcut_beta = beta + 209 - 44 * improving as i32;
                if depth > 4
                    && beta.raw().abs() < Value::TB_WIN_IN_MAX_PLY.raw()
                    && !(tt_hit && tt_depth >= depth - 3)
                {
                    debug_assert!(probcut_beta < Value::INFINITE);

                    let threshold = probcut_beta - w.stack.get(ply).static_eval;
                    let mut mp = MovePicker::new_probcut(pos, tt_move, threshold, &w.histories);
                    let mut probcut_count = 0;
                    let saved_tt_pv = w.stack.get(ply).tt_pv;
                    w.stack.get_mut(ply).tt_pv = false;

                    loop {
                        let m = mp.next_move(pos, false);
                        if m.is_none() || probcut_count >= 2 + 2 * cut_node as i32 {
                            break;
                        }
                        if m == excluded_move {
                            continue;
                        }
                        probcut_count += 1;

                        w.stack.get_mut(ply).current_move = m;
                        w.set_cont_hist(ply, in_check, true, pos.moved_piece(m), m.to_sq());
                        pos.do_move(m);

                        // まず静止探索で持ちこたえるか確かめる
                        let mut value =
                            -qsearch::<NON_PV>(w, pos, -probcut_beta, -probcut_beta + 1, 0, ply + 1);

                        if value >= probcut_beta {
                            value = -search::<NON_PV>(
                                w,
                                pos,
                                -probcut_beta,
                                -probcut_beta + 1,
                                depth - 4,
                                !cut_node,
                                ply + 1,
                            );
                        }
                        pos.undo_move();

                        if value >= probcut_beta {
                            let value = value.min(Value::TB_WIN_IN_MAX_PLY);
                            probe.write(
                                pos_key,
                                value_to_tt(value, ply),
                                saved_tt_pv,
                                Bound::Lower,
                                depth - 3,
                                m,
                                w.stack.get(ply).static_eval,
                                w.tt.generation(),
                            );
                            w.stack.get_mut(ply).tt_pv = saved_tt_pv;
                            return value;
                        }
                    }
                    w.stack.get_mut(ply).tt_pv = saved_tt_pv;
                }
            }
        }
    }

    // Step 11. IIR: 置換表に手がないPVノードは深さを下げる
    if !w.full_search && pv_node && depth >= 6 && tt_move.is_none() {
        depth -= 2;
    }

    // Step 12. 指し手ループの準備
    let tt_capture = tt_move.is_some() && pos.capture_or_promotion(tt_move);
    let counter_move = if prev_move.is_ok() {
        w.histories.counter_moves.get(pos.piece_on(prev_sq), prev_sq)
    } else {
        Move::NONE
    };
    let killers = w.stack.get(ply).killers;

    let mut mp = {
        let cont = w.cont_refs(ply);
        MovePicker::new(
            pos,
            tt_move,
            depth,
            &w.histories,
            &cont,
            counter_move,
            killers,
            ply,
        )
    };

    // ルート付近で他スレッドと同じ局面を読んでいないかの目印
    let holding = ThreadHolding::new(w.thread_id, pos_key, ply);

    let mut value = best_value;
    let mut singular_quiet_lmr = false;
    let mut move_count_pruning = false;
    let mut double_extension = false;

    // 同じ深さ以上で fail low した形跡のあるPVノード
    let likely_fail_low =
        pv_node && tt_move.is_some() && tt_bound.is_upper() && tt_depth >= depth;

    let mut quiets_searched: SmallVec<[Move; 64]> = SmallVec::new();
    let mut captures_searched: SmallVec<[Move; 32]> = SmallVec::new();

    // Step 13. 指し手ループ
    loop {
        let m = mp.next_move(pos, move_count_pruning);
        if m.is_none() {
            break;
        }

        if m == excluded_move {
            continue;
        }

        // ルートでは searchmoves と現在のPV範囲のみ
        if root_node && !w.root_moves.contains_in(m, w.pv_idx, w.pv_last) {
            continue;
        }

        move_count += 1;
        w.stack.get_mut(ply).move_count = move_count;

        if root_node && w.thread_id == 0 && w.report_currmove {
            if let Some(tm) = &w.tm {
                if tm.elapsed(w.total_nodes()) > 3000 {
                    println!(
                        "info depth {} currmove {} currmovenumber {}",
                        depth,
                        m.to_uci(),
                        move_count as usize + w.pv_idx
                    );
                }
            }
        }

        if pv_node {
            w.stack.get_mut(ply + 1).pv.clear();
        }

        let mut extension: Depth = 0;
        let capture_or_promotion = pos.capture_or_promotion(m);
        let moved_piece = pos.moved_piece(m);
        let gives_check = pos.gives_check(m);

        // 王手なら1手詰みを直接確かめる（探索せず詰みスコアを得る）
        let mut is_mate = false;
        if gives_check {
            pos.do_move(m);
            is_mate = pos.legal_moves().is_empty();
            pos.undo_move();
        }

        if is_mate {
            w.stack.get_mut(ply).current_move = m;
            w.set_cont_hist(ply, in_check, capture_or_promotion, moved_piece, m.to_sq());
            value = Value::mate_in(ply + 1);

            if pv_node && (move_count == 1 || (value > alpha && (root_node || value < beta))) {
                w.stack.get_mut(ply + 1).pv.clear();
            }
        } else {
            let mut new_depth = depth - 1;

            if !w.full_search {
                // Step 14. 浅い深さでの枝刈り
                if !root_node
                    && !pv_node
                    && pos.non_pawn_material(us) > 0
                    && best_value > Value::TB_LOSS_IN_MAX_PLY
                {
                    move_count_pruning = move_count >= futility_move_count(improving, depth);

                    let lmr_depth = (new_depth - reduction(improving, depth, move_count)).max(0);
                    let cont = w.cont_refs(ply);
                    let captured = pos.role_on(m.to_sq());
                    let ctx = ShallowPruningContext {
                        pos,
                        mv: m,
                        moved_piece,
                        depth,
                        lmr_depth,
                        is_capture_or_promotion: capture_or_promotion,
                        gives_check,
                        in_check,
                        static_eval: w.stack.get(ply).static_eval,
                        alpha,
                        cont_hist_0: cont[0],
                        cont_hist_1: cont[1],
                        cont_hist_3: cont[3],
                        capture_history_value: w.histories.capture_history.get(
                            moved_piece,
                            m.to_sq(),
                            captured,
                        ) as i32,
                    };
                    if prune_shallow_move(&ctx) {
                        continue;
                    }
                }

                // Step 15. 延長
                if game_cycle && (depth < 5 || pv_node) {
                    extension = 2;
                } else if !root_node
                    && depth >= 7
                    && m == tt_move
                    && excluded_move.is_none()
                    && tt_value != Value::NONE
                    && beta.raw().abs() < Value::TB_WIN_IN_MAX_PLY.raw()
                    && tt_bound.is_lower()
                    && tt_depth >= depth - 3
                {
                    // Singular: 他のすべての手が margin 付きで fail low するなら延長
                    let singular_beta =
                        (tt_value - 2 * depth).max(Value::TB_LOSS_IN_MAX_PLY);
                    let singular_depth = (depth - 1) / 2;

                    w.stack.get_mut(ply).excluded_move = m;
                    let v = search::<NON_PV>(
                        w,
                        pos,
                        singular_beta - 1,
                        singular_beta,
                        singular_depth,
                        cut_node,
                        ply,
                    );
                    w.stack.get_mut(ply).excluded_move = Move::NONE;

                    if v < singular_beta {
                        extension = 1;
                        singular_quiet_lmr = !tt_capture;

                        // 二重延長は3回まで
                        if !pv_node
                            && v < singular_beta - 93
                            && w.stack.get(ply).double_extensions < 3
                        {
                            extension = 2;
                            double_extension = true;
                        }
                    } else if !pv_node
                        && !((ply & 1) == 1 && w.stack.get(ply - 1).move_count > 1)
                    {
                        // Multi-cut: ttMove 抜きでも fail high するなら部分木ごと刈る
                        if singular_beta >= beta {
                            return singular_beta.min(Value::TB_WIN_IN_MAX_PLY);
                        } else if tt_value >= beta {
                            w.stack.get_mut(ply).excluded_move = m;
                            let v = search::<NON_PV>(
                                w,
                                pos,
                                beta - 1,
                                beta,
                                (depth + 3) / 2,
                                cut_node,
                                ply,
                            );
                            w.stack.get_mut(ply).excluded_move = Move::NONE;
                            if v >= beta {
                                return beta;
                            }
                        }
                    }
                }

                // 王手延長
                if extension == 0
                    && gives_check
                    && depth > 6
                    && w.stack.get(ply).static_eval.raw().abs() > 100
                {
                    extension = 1;
                }

                new_depth += extension;
                let de = w.stack.get(ply - 1).double_extensions + (extension == 2) as i32;
                w.stack.get_mut(ply).double_extensions = de;
            }

            // Step 16. 手を進める
            w.tt.prefetch(pos.key_after(m));
            w.stack.get_mut(ply).current_move = m;
            w.set_cont_hist(ply, in_check, capture_or_promotion, moved_piece, m.to_sq());
            pos.do_move(m);

            let do_lmr_step = !w.full_search;
            let mut did_lmr = false;
            let do_full_depth_search;

            // Step 17. Late Move Reduction
            if do_lmr_step
                && depth >= 3
                && !game_cycle
                && !gives_check
                && move_count > 1 + 2 * root_node as i32
                && w.sel_depth > depth
                && (!pv_node || ply > 1 || w.thread_id % 4 != 3)
                && (!capture_or_promotion || (cut_node && w.stack.get(ply - 1).move_count > 1))
            {
                let mut r = reduction(improving, depth, move_count);

                if pv_node || w.stack.get(ply - 1).move_count == 1 {
                    r -= 1;
                }

                // ttHit の移動平均が高ければ減らす
                if w.tt_hit_average
                    > 537 * TT_HIT_AVERAGE_RESOLUTION * TT_HIT_AVERAGE_WINDOW / 1024
                {
                    r -= 1;
                }

                // PV上にある（あった）局面で fail low の形跡がなければ大きく減らす
                if w.stack.get(ply).tt_pv && !likely_fail_low {
                    r -= 2;
                }

                // 他スレッドが同じ局面を探索中なら任せ気味にする
                if holding.marked() {
                    r += 1;
                }

                if root_depth > 10 && pos.king_danger() {
                    r -= 1;
                }

                if w.stack.get(ply - 1).move_count > 13 {
                    r -= 1;
                }

                if singular_quiet_lmr {
                    r -= 1;
                }

                // cut node は強めに刈る
                if cut_node && m != killers[0] {
                    r += 2;
                }

                if tt_capture {
                    r += 1;
                }

                let stat_score = w.histories.main_history.get(us, m) as i32
                    + w.cont_hist_value(ply - 1, moved_piece, m.to_sq())
                    + w.cont_hist_value(ply - 2, moved_piece, m.to_sq())
                    + w.cont_hist_value(ply - 4, moved_piece, m.to_sq())
                    - 4923;
                w.stack.get_mut(ply).stat_score = stat_score;

                r -= stat_score / 14721;

                if !pv_node && w.stack.get(ply - 1).move_count > 1 {
                    let rr = (new_depth as f64 / (2.0 + ply as f64 / 2.8)) as Depth;
                    r -= rr;
                }

                // 通常は newDepth が上限だが、reduction が大きく負で
                // 手数が少ないときだけ1ply超過を許す
                let bonus = (r < -1
                    && (move_count <= 5 || (depth > 6 && pv_node))
                    && !double_extension) as Depth;
                let d = (new_depth - r).clamp(1, new_depth + bonus);

                value = -search::<NON_PV>(w, pos, -(alpha + 1), -alpha, d, true, ply + 1);

                do_full_depth_search = value > alpha && d < new_depth;
                did_lmr = true;
            } else {
                do_full_depth_search = !do_lmr_step || !pv_node || move_count > 1;
            }

            // Step 18. LMR省略時・fail high時の全深さ探索
            if do_full_depth_search {
                value =
                    -search::<NON_PV>(w, pos, -(alpha + 1), -alpha, new_depth, !cut_node, ply + 1);

                if did_lmr && !capture_or_promotion {
                    let bonus = if value > alpha {
                        stat_bonus(new_depth)
                    } else {
                        -stat_bonus(new_depth)
                    };
                    w.update_continuation_histories(ply, moved_piece, m.to_sq(), bonus);
                }
            } else if !did_lmr {
                value = best_value;
            }

            // PVノードは最初の手と fail high 直後のみ全窓で読み直す
            if pv_node && (move_count == 1 || (value > alpha && (root_node || value < beta))) {
                w.stack.get_mut(ply + 1).pv.clear();
                value = -search::<PV>(
                    w,
                    pos,
                    -beta,
                    -alpha,
                    new_depth.min(max_next_depth),
                    false,
                    ply + 1,
                );
            }

            // Step 19. 手を戻す
            pos.undo_move();
        }

        debug_assert!(value > -Value::INFINITE && value < Value::INFINITE);

        // Step 20. 新しい最善手の確認
        //
        // 停止後の値は信用できないので、TTも統計も触らずに戻る。
        if w.stop.load(Ordering::Relaxed) {
            return Value::ZERO;
        }

        if root_node {
            let idx = w
                .root_moves
                .find(m)
                .expect("root move list out of sync");

            if move_count == 1 || value > alpha {
                let avg = w.root_moves[idx].average_score;
                w.root_moves[idx].score = value;
                w.root_moves[idx].sel_depth = w.sel_depth;
                w.root_moves[idx].average_score = if avg == -Value::INFINITE {
                    value
                } else {
                    (value * 2 + avg) / 3
                };
                w.root_moves[idx].pv.truncate(1);
                let child_pv = w.stack.get(ply + 1).pv.clone();
                w.root_moves[idx].pv.extend(child_pv);

                // 最善手の入れ替わり回数は時間管理が参照する
                if move_count > 1 {
                    w.best_move_changes += 1.0;
                }
            } else {
                // 安定ソートが並びを保てるよう、PV以外は最低値に落とす
                w.root_moves[idx].score = -Value::INFINITE;
            }
        }

        if value > best_value {
            best_value = value;

            if value > alpha {
                best_move = m;

                if pv_node && !root_node {
                    w.stack.update_pv(ply, m);
                }

                if pv_node && value < beta {
                    alpha = value;
                } else {
                    debug_assert!(value >= beta);
                    break;
                }
            }
        }

        // 統計更新のため、最善以外の手を覚えておく（あふれは黙って捨てる）
        if m != best_move {
            if capture_or_promotion && captures_searched.len() < 32 {
                captures_searched.push(m);
            } else if !capture_or_promotion && quiets_searched.len() < 64 {
                quiets_searched.push(m);
            }
        }
    }

    // Step 21. 詰み・ステイルメイトの判定
    if move_count == 0 {
        best_value = if excluded_move.is_some() {
            alpha
        } else if in_check {
            Value::mated_in(ply)
        } else {
            Value::DRAW
        };
    } else if best_move.is_some() {
        w.update_all_stats(
            pos,
            ply,
            best_move,
            best_value,
            beta,
            prev_sq,
            &quiets_searched,
            &captures_searched,
            depth,
        );
    } else if (depth >= 3 || pv_node) && !prior_capture && prev_move.is_ok() {
        // fail low を導いた直前のカウンター手にボーナス
        let pc = pos.piece_on(prev_sq);
        w.update_continuation_histories(ply - 1, pc, prev_sq, stat_bonus(depth));
    }

    // ttPv の粘着: fail low は親から引き継ぎ、fail high は子と合流
    if best_value <= alpha {
        let v = w.stack.get(ply).tt_pv || (w.stack.get(ply - 1).tt_pv && depth > 3);
        w.stack.get_mut(ply).tt_pv = v;
    } else if depth > 3 {
        let v = w.stack.get(ply).tt_pv && w.stack.get(ply + 1).tt_pv;
        w.stack.get_mut(ply).tt_pv = v;
    }

    // Step 22. 置換表への保存
    if excluded_move.is_none() && !(root_node && w.pv_idx > 0) {
        let bound = if best_value >= beta {
            Bound::Lower
        } else if pv_node && best_move.is_some() {
            Bound::Exact
        } else {
            Bound::Upper
        };
        probe.write(
            pos_key,
            value_to_tt(best_value, ply),
            w.stack.get(ply).tt_pv,
            bound,
            depth,
            best_move,
            w.stack.get(ply).static_eval,
            w.tt.generation(),
        );
    }

    debug_assert!(best_value > -Value::INFINITE && best_value < Value::INFINITE);

    best_value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::types::ROOT;

    fn test_worker(tt: Arc<TranspositionTable>) -> Box<SearchWorker> {
        let mut w = SearchWorker::new(
            0,
            tt,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(true)),
        );
        w.prepare_search(&SearchOptions::default(), &LimitsType::default());
        w
    }

    #[test]
    fn test_stop_returns_zero_and_leaves_tt_untouched() {
        let tt = Arc::new(TranspositionTable::new(1));
        let mut w = test_worker(Arc::clone(&tt));
        let mut pos = Position::new();

        w.root_moves = RootMoves::from_legal_moves(&pos.legal_moves(), &[]);
        w.pv_idx = 0;
        w.pv_last = w.root_moves.len();
        w.root_depth = 3;
        w.stop.store(true, Ordering::Relaxed);

        let v = search::<ROOT>(&mut w, &mut pos, -Value::INFINITE, Value::INFINITE, 3, false, 0);
        assert_eq!(v, Value::ZERO);
        // 停止後のサブツリーからは探索結果が書かれない。ルートの
        // 静的評価のみのエントリ（DEPTH_NONE, BOUND_NONE）だけは許される。
        let probe = tt.probe(pos.key());
        if probe.found {
            assert_eq!(probe.data.depth, crate::types::DEPTH_NONE);
            assert_eq!(probe.data.bound, Bound::None);
            assert!(probe.data.mv.is_none());
        }
    }

    #[test]
    fn test_nonpv_returns_bound_outside_window() {
        let tt = Arc::new(TranspositionTable::new(1));
        let mut w = test_worker(tt);
        // 白ルーク1枚得: ゼロ窓 (0, 1) に対して下限側で返るはず
        let mut pos = Position::from_fen("4k3/8/8/8/8/8/8/R3K3 w - - 0 1").unwrap();
        w.root_depth = 2;
        let beta = Value::new(1);
        let v = search::<NON_PV>(&mut w, &mut pos, beta - 1, beta, 2, false, 0);
        assert!(v >= beta || v <= beta - 1);
        assert!(v >= beta, "rook-up position should fail high on a zero window at 0");
    }

    #[test]
    fn test_search_finds_hanging_queen() {
        let tt = Arc::new(TranspositionTable::new(1));
        let mut w = test_worker(tt);
        let mut pos = Position::from_fen("4k3/8/8/3q4/8/8/3R4/4K3 w - - 0 1").unwrap();
        w.root_moves = RootMoves::from_legal_moves(&pos.legal_moves(), &[]);
        w.pv_idx = 0;
        w.pv_last = w.root_moves.len();
        w.root_depth = 4;

        let v = search::<ROOT>(&mut w, &mut pos, -Value::INFINITE, Value::INFINITE, 4, false, 0);
        assert!(v.raw() > 800, "should be at least a rook up after RxQ, got {v:?}");
        let len = w.root_moves.len();
        w.root_moves.stable_sort_range(0, len);
        assert_eq!(w.root_moves[0].mv().to_uci(), "d2d5");
    }
}
