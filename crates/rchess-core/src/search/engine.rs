//! 探索エンジンのエントリポイント
//!
//! `Search` が go 1回ぶんのライフサイクルを司る:
//! 置換表の世代更新、TBルートランキング、ヘルパースレッドの起動、
//! メインスレッドの反復深化、最善スレッドの選出、bestmove の決定。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::position::Position;
use crate::search::alpha_beta::{search, SearchWorker};
use crate::search::limits::LimitsType;
use crate::search::tb::SyzygyTb;
use crate::search::thread::{SearchProgress, SearchTask, ThreadPool};
use crate::search::time_manager::TimeManagement;
use crate::search::types::{RootMoves, ROOT};
use crate::search::SearchOptions;
use crate::tt::TranspositionTable;
use crate::types::{Bound, Depth, Move, Value, MAX_PLY, PAWN_EG};

// =============================================================================
// SearchInfo
// =============================================================================

/// 探索情報（UCI info 出力用）
#[derive(Debug, Clone)]
pub struct SearchInfo {
    pub depth: Depth,
    pub sel_depth: i32,
    pub multi_pv: usize,
    pub score: Value,
    /// aspiration の途中経過なら上下限の向き
    pub bound: Option<Bound>,
    /// UCI_ShowWDL 有効時の (win, draw, loss) 千分率
    pub wdl: Option<(i32, i32, i32)>,
    pub nodes: u64,
    pub nps: u64,
    pub time_ms: i64,
    pub hashfull: i32,
    pub tb_hits: u64,
    pub pv: Vec<Move>,
}

impl SearchInfo {
    /// UCI形式の info 文字列を生成
    pub fn to_uci_string(&self) -> String {
        let score_str = if self.score.is_mate_win() {
            format!("mate {}", (self.score.mate_ply() + 1) / 2)
        } else if self.score.is_mate_loss() {
            format!("mate -{}", (self.score.mate_ply() + 1) / 2)
        } else {
            format!("cp {}", self.score.raw())
        };

        let mut s = format!(
            "info depth {} seldepth {} multipv {} score {}",
            self.depth, self.sel_depth, self.multi_pv, score_str
        );

        match self.bound {
            Some(Bound::Lower) => s.push_str(" lowerbound"),
            Some(Bound::Upper) => s.push_str(" upperbound"),
            _ => {}
        }

        if let Some((w, d, l)) = self.wdl {
            s.push_str(&format!(" wdl {w} {d} {l}"));
        }

        s.push_str(&format!(" nodes {} nps {}", self.nodes, self.nps));

        if self.time_ms > 1000 {
            s.push_str(&format!(" hashfull {}", self.hashfull));
        }

        s.push_str(&format!(" tbhits {} time {}", self.tb_hits, self.time_ms));

        if !self.pv.is_empty() {
            s.push_str(" pv");
            for m in &self.pv {
                s.push(' ');
                s.push_str(&m.to_uci());
            }
        }

        s
    }
}

/// fail high/low 後の aspiration window の広げ方
#[inline]
pub(crate) fn widen_delta(delta: Value) -> Value {
    delta + delta / 4 + 5
}

/// 単純なロジスティックモデルで評価値を WDL 千分率へ写す
fn wdl_model(v: Value, ply: i32) -> (i32, i32, i32) {
    // 手数が進むほど引き分けに寄せる
    let scale = 1.0 + (ply as f64 / 120.0).min(1.0);
    let win = 1000.0 / (1.0 + (-(v.raw() as f64) / (180.0 * scale)).exp());
    let loss = 1000.0 / (1.0 + (v.raw() as f64 / (180.0 * scale)).exp());
    let w = win as i32;
    let l = loss as i32;
    (w, (1000 - w - l).max(0), l)
}

// =============================================================================
// SearchResult
// =============================================================================

/// 探索結果
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub best_move: Move,
    pub ponder_move: Move,
    pub score: Value,
    pub depth: Depth,
    pub nodes: u64,
}

// =============================================================================
// 反復深化
// =============================================================================

/// メインスレッド専用の文脈（時間方策と info 出力）
pub(crate) struct MainLoop<'a> {
    pub best_previous_score: &'a mut Value,
    pub iter_value: &'a mut [Value; 4],
    pub previous_time_reduction: &'a mut f64,
    pub pool: &'a ThreadPool,
    pub on_info: &'a mut dyn FnMut(&SearchInfo),
}

/// PV情報を組み立てて出力する
#[allow(clippy::too_many_arguments)]
fn emit_pv(
    w: &SearchWorker,
    main: &mut MainLoop<'_>,
    depth: Depth,
    multi_pv: usize,
    alpha: Value,
    beta: Value,
    tb_hits: u64,
) {
    let nodes = w.total_nodes();
    let time_ms = w.tm.as_ref().map_or(0, |tm| tm.elapsed(nodes)).max(1);
    let nps = nodes.saturating_mul(1000) / time_ms.max(1) as u64;
    let hashfull = w.tt.hashfull();

    for i in 0..multi_pv.min(w.root_moves.len()) {
        let rm = &w.root_moves[i];
        let updated = rm.score != -Value::INFINITE;

        if depth == 1 && !updated && i > 0 {
            continue;
        }

        let d = if updated { depth } else { (depth - 1).max(1) };
        let mut v = if updated { rm.score } else { rm.previous_score };
        if v == -Value::INFINITE {
            v = Value::ZERO;
        }

        let tb = w.root_in_tb && v.raw().abs() < Value::TB_WIN.raw() - 6 * PAWN_EG;
        let v = if tb { rm.tb_score } else { v };

        let bound = if !tb && i == w.pv_idx {
            if v >= beta {
                Some(Bound::Lower)
            } else if v <= alpha {
                Some(Bound::Upper)
            } else {
                None
            }
        } else {
            None
        };

        let info = SearchInfo {
            depth: d,
            sel_depth: rm.sel_depth,
            multi_pv: i + 1,
            score: v,
            bound,
            wdl: if w.options.show_wdl {
                Some(wdl_model(v, 0))
            } else {
                None
            },
            nodes,
            nps,
            time_ms,
            hashfull,
            tb_hits,
            pv: rm.pv.clone(),
        };
        (main.on_info)(&info);
    }
}

/// 反復深化のメインループ
///
/// main と helper の両方が使う。`main` が Some のときだけ時間方策・
/// info 出力・increase_depth の制御を行う。
pub(crate) fn iterative_deepening(
    w: &mut SearchWorker,
    pos: &mut Position,
    mut main: Option<MainLoop<'_>>,
    progress: Option<&SearchProgress>,
) {
    let is_main = main.is_some();
    let mut last_best_move = Move::NONE;
    let mut last_best_move_depth: Depth = 0;
    let mut time_reduction = 1.0f64;
    let mut tot_best_move_changes = 0.0f64;
    let mut iter_idx = 0usize;
    let mut search_again_counter: Depth = 0;
    let mut best_value = -Value::INFINITE;

    if let Some(m) = &mut main {
        let seed = if *m.best_previous_score == Value::INFINITE {
            Value::ZERO
        } else {
            *m.best_previous_score
        };
        *m.iter_value = [seed; 4];
    }

    let mut multi_pv = w.options.multi_pv.max(1);
    if w.options.tactical > 0 {
        multi_pv = multi_pv.max(1usize << w.options.tactical);
    }
    let multi_pv = multi_pv.min(w.root_moves.len());

    let us = pos.side_to_move();

    while w.root_depth + 1 < MAX_PLY
        && !w.stop.load(Ordering::Relaxed)
        && !(w.limits.depth > 0 && is_main && w.root_depth + 1 > w.limits.depth)
    {
        w.root_depth += 1;

        // PV変動量は世代ごとに減衰させる
        if is_main {
            tot_best_move_changes /= 2.0;
        }

        // 新しいPVが決まる前に前回スコアを退避する
        for rm in w.root_moves.iter_mut() {
            rm.previous_score = rm.score;
        }

        let mut pv_first = 0usize;
        w.pv_last = 0;

        if !w.increase_depth.load(Ordering::Relaxed) {
            search_again_counter += 1;
        }

        // MultiPVループ: PVラインごとにルート探索をやり直す
        let mut pv_idx = 0usize;
        while pv_idx < multi_pv && !w.stop.load(Ordering::Relaxed) {
            w.pv_idx = pv_idx;

            // TBランクの同じグループ内だけを読む
            if pv_idx == w.pv_last {
                pv_first = w.pv_last;
                w.pv_last += 1;
                while w.pv_last < w.root_moves.len()
                    && w.root_moves[w.pv_last].tb_rank == w.root_moves[pv_first].tb_rank
                {
                    w.pv_last += 1;
                }
            }

            w.sel_depth = 0;

            // Aspiration Window
            let mut delta = Value::INFINITE;
            let mut alpha = -Value::INFINITE;
            let mut beta = Value::INFINITE;

            if w.root_depth >= 4 {
                let prev = w.root_moves[pv_idx].previous_score;
                delta = Value::new(17);
                alpha = (prev - delta).max(-Value::INFINITE);
                beta = (prev + delta).min(Value::INFINITE);

                // 動的コンテンポ: 形勢に比例した引き分け忌避
                let dt = w.options.dynamic_contempt;
                let tr = dt * (113 * prev.raw() / (prev.raw().abs() + 147));
                w.trend = if us == shakmaty::Color::White {
                    (tr, tr / 2)
                } else {
                    (-tr, -tr / 2)
                };
            }

            loop {
                let adjusted_depth = (w.root_depth - search_again_counter).max(1);
                best_value = search::<ROOT>(w, pos, alpha, beta, adjusted_depth, false, 0);

                // 安定ソートで新しい最善だけが前に出る
                w.root_moves.stable_sort_range(pv_idx, w.pv_last);

                if w.stop.load(Ordering::Relaxed) {
                    break;
                }

                // 窓を外したときは途中経過を流してから読み直す
                if is_main
                    && multi_pv == 1
                    && (best_value <= alpha || best_value >= beta)
                    && w.tm.as_ref().map_or(0, |tm| tm.elapsed(w.total_nodes())) > 3000
                {
                    let tb_hits = w.tb_hits.load(Ordering::Relaxed);
                    if let Some(m) = &mut main {
                        emit_pv(w, m, w.root_depth, multi_pv, alpha, beta, tb_hits);
                    }
                }

                if best_value <= alpha {
                    beta = (alpha + beta) / 2;
                    alpha = (best_value - delta).max(-Value::INFINITE);
                    if is_main {
                        w.stop_on_ponderhit = false;
                    }
                } else if best_value >= beta {
                    beta = (best_value + delta).min(Value::INFINITE);
                } else {
                    break;
                }

                delta = widen_delta(delta);

                debug_assert!(alpha >= -Value::INFINITE && beta <= Value::INFINITE);
            }

            w.root_moves.stable_sort_range(pv_first, pv_idx + 1);

            let emit_now = w.stop.load(Ordering::Relaxed)
                || pv_idx + 1 == multi_pv
                || w.tm.as_ref().map_or(0, |tm| tm.elapsed(w.total_nodes())) > 3000;
            if is_main && emit_now {
                let tb_hits = w.tb_hits.load(Ordering::Relaxed);
                if let Some(m) = &mut main {
                    emit_pv(w, m, w.root_depth, multi_pv, alpha, beta, tb_hits);
                }
            }

            pv_idx += 1;
        }

        if !w.stop.load(Ordering::Relaxed) {
            w.completed_depth = w.root_depth;
        }

        if w.root_moves[0].mv() != last_best_move {
            last_best_move = w.root_moves[0].mv();
            last_best_move_depth = w.root_depth;
        }

        // go mate: 指定手数以内の詰みを読み切ったら止める
        if w.limits.mate > 0
            && best_value >= Value::MATE_IN_MAX_PLY
            && Value::MATE.raw() - best_value.raw() <= 2 * w.limits.mate
        {
            w.stop.store(true, Ordering::Relaxed);
        }

        // ヘルパーは進捗を公開して次の深さへ
        let Some(m) = &mut main else {
            if let Some(p) = progress {
                p.update(w.nodes.load(Ordering::Relaxed), w.best_move_changes);
                w.best_move_changes = 0.0;
            }
            continue;
        };

        // 時間方策: 次の深さを読む時間があるか
        if w.limits.use_time_management()
            && !w.stop.load(Ordering::Relaxed)
            && !w.stop_on_ponderhit
        {
            let falling_eval = ((318
                + 6 * (m.best_previous_score.raw() - best_value.raw())
                + 6 * (m.iter_value[iter_idx].raw() - best_value.raw()))
                as f64
                / 825.0)
                .clamp(0.5, 1.5);

            // 最善手が安定しているほど時間を削る
            time_reduction = if last_best_move_depth + 9 < w.completed_depth {
                1.92
            } else {
                0.95
            };
            let reduction = (1.47 + *m.previous_time_reduction) / (2.32 * time_reduction);

            tot_best_move_changes += w.best_move_changes + m.pool.harvest_best_move_changes();
            w.best_move_changes = 0.0;

            let instability = 1.073
                + (2.25 - 9.9 / w.root_depth as f64).max(1.0) * tot_best_move_changes
                    / m.pool.thread_count() as f64;

            if let Some(tm) = &w.tm {
                let elapsed = tm.elapsed(w.total_nodes());
                let optimum = tm.optimum();
                let budget = optimum as f64 * falling_eval * reduction * instability;

                if (w.root_moves.len() == 1 && elapsed > optimum / 16)
                    || elapsed as f64 > budget
                {
                    // ponder中はGUIの合図まで止めず、合図が来た瞬間に止める
                    if w.ponder.load(Ordering::Relaxed) {
                        w.stop_on_ponderhit = true;
                    } else {
                        w.stop.store(true, Ordering::Relaxed);
                    }
                } else if w.increase_depth.load(Ordering::Relaxed)
                    && !w.ponder.load(Ordering::Relaxed)
                    && (elapsed as f64) > budget * 0.58
                {
                    w.increase_depth.store(false, Ordering::Relaxed);
                } else {
                    w.increase_depth.store(true, Ordering::Relaxed);
                }
            }
        }

        m.iter_value[iter_idx] = best_value;
        iter_idx = (iter_idx + 1) & 3;
    }

    if let Some(m) = main {
        *m.previous_time_reduction = time_reduction;
    }
}

// =============================================================================
// Search（ドライバ）
// =============================================================================

/// 探索エンジン本体
pub struct Search {
    tt: Arc<TranspositionTable>,
    tt_size_mb: usize,
    tb: Option<Arc<SyzygyTb>>,
    stop: Arc<AtomicBool>,
    ponder: Arc<AtomicBool>,
    increase_depth: Arc<AtomicBool>,
    options: SearchOptions,
    num_threads: usize,
    pool: ThreadPool,
    /// mainワーカー（対局をまたいで再利用し、履歴を保持する）
    worker: Option<Box<SearchWorker>>,

    best_previous_score: Value,
    iter_value: [Value; 4],
    previous_time_reduction: f64,
}

impl Search {
    pub fn new(tt_size_mb: usize) -> Self {
        let tt = Arc::new(TranspositionTable::new(tt_size_mb));
        let stop = Arc::new(AtomicBool::new(false));
        let ponder = Arc::new(AtomicBool::new(false));
        let increase_depth = Arc::new(AtomicBool::new(true));
        let pool = ThreadPool::new(
            1,
            Arc::clone(&tt),
            Arc::clone(&stop),
            Arc::clone(&ponder),
            Arc::clone(&increase_depth),
        );

        Self {
            tt,
            tt_size_mb,
            tb: None,
            stop,
            ponder,
            increase_depth,
            options: SearchOptions::default(),
            num_threads: 1,
            pool,
            worker: None,
            best_previous_score: Value::INFINITE,
            iter_value: [Value::ZERO; 4],
            previous_time_reduction: 0.85,
        }
    }

    pub fn set_options(&mut self, options: SearchOptions) {
        self.options = options;
    }

    pub fn options(&self) -> &SearchOptions {
        &self.options
    }

    pub fn resize_tt(&mut self, size_mb: usize) {
        self.tt = Arc::new(TranspositionTable::new(size_mb));
        self.tt_size_mb = size_mb;
        if let Some(worker) = &mut self.worker {
            worker.tt = Arc::clone(&self.tt);
        }
        self.pool.update_tt(Arc::clone(&self.tt));
    }

    pub fn set_num_threads(&mut self, num: usize) {
        self.num_threads = num.clamp(1, 512);
        self.pool
            .set_num_threads(self.num_threads, Arc::clone(&self.tt));
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn set_tb_path(&mut self, path: &str) -> Result<usize, std::io::Error> {
        let (tb, count) = SyzygyTb::new(path)?;
        self.tb = Some(Arc::new(tb));
        Ok(count)
    }

    /// `ucinewgame` 相当: 履歴と置換表を初期化
    pub fn clear(&mut self) {
        if !self.options.never_clear_hash {
            self.tt = Arc::new(TranspositionTable::new(self.tt_size_mb));
            if let Some(worker) = &mut self.worker {
                worker.tt = Arc::clone(&self.tt);
            }
            self.pool.update_tt(Arc::clone(&self.tt));
        }
        if let Some(worker) = &mut self.worker {
            worker.clear();
        }
        self.pool.clear_histories();
        self.best_previous_score = Value::INFINITE;
        self.previous_time_reduction = 0.85;
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn ponderhit(&self) {
        self.ponder.store(false, Ordering::SeqCst);
    }

    /// 停止フラグへのハンドル（別スレッドからの stop 用）
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// ponderフラグへのハンドル（別スレッドからの ponderhit 用）
    pub fn ponder_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ponder)
    }

    pub fn hashfull(&self) -> i32 {
        self.tt.hashfull()
    }

    /// 探索を実行して bestmove を返す
    ///
    /// `on_info` には深さ完了ごとの PV 情報が渡る。
    pub fn go<F>(&mut self, pos: &mut Position, mut limits: LimitsType, mut on_info: F) -> SearchResult
    where
        F: FnMut(&SearchInfo),
    {
        self.stop.store(false, Ordering::SeqCst);
        self.ponder.store(limits.ponder, Ordering::SeqCst);
        self.increase_depth.store(true, Ordering::SeqCst);
        self.tt.new_search();

        // ルート手の列挙。合法手がなければ深さ0の info だけ返す。
        let legal = pos.legal_moves();
        let mut root_moves = RootMoves::from_legal_moves(&legal, &limits.search_moves);

        if root_moves.is_empty() {
            let score = if pos.in_check() {
                Value::mated_in(0)
            } else {
                Value::DRAW
            };
            let info = SearchInfo {
                depth: 0,
                sel_depth: 0,
                multi_pv: 1,
                score,
                bound: None,
                wdl: None,
                nodes: 0,
                nps: 0,
                time_ms: 0,
                hashfull: 0,
                tb_hits: 0,
                pv: Vec::new(),
            };
            on_info(&info);
            return SearchResult {
                best_move: Move::NONE,
                ponder_move: Move::NONE,
                score,
                depth: 0,
                nodes: 0,
            };
        }

        // TBのルートランキング
        let mut root_in_tb = false;
        let mut tb_cardinality = 0;
        let mut tb_probe_depth = self.options.syzygy_probe_depth;
        if let Some(tb) = &self.tb {
            tb_cardinality = (self.options.syzygy_probe_limit.min(tb.max_pieces())) as i32;
            if (self.options.syzygy_probe_limit as i32) > tb_cardinality {
                tb_probe_depth = 0;
            }
            if tb_cardinality >= pos.piece_count() as i32 && !pos.has_castling_rights() {
                root_in_tb = tb.rank_root_moves(pos, &mut root_moves);
            }
            if root_in_tb {
                // ルートで既にTBが効いているなら探索中の probe は止める
                tb_cardinality = 0;
            }
        }

        // mainワーカーの準備
        let tt = Arc::clone(&self.tt);
        let stop = Arc::clone(&self.stop);
        let ponder = Arc::clone(&self.ponder);
        let increase_depth = Arc::clone(&self.increase_depth);
        let worker = self
            .worker
            .get_or_insert_with(|| SearchWorker::new(0, tt, stop, ponder, increase_depth));

        worker.prepare_search(&self.options, &limits);
        worker.tb = self.tb.clone();
        worker.tb_cardinality = tb_cardinality;
        worker.tb_probe_depth = tb_probe_depth;
        worker.tb_use_rule50 = self.options.syzygy_50_move_rule;
        worker.root_in_tb = root_in_tb;
        worker.root_moves = root_moves.clone();
        worker.report_currmove = true;

        // 時間管理はこの go の間は不変のスナップショット
        let mut tm = TimeManagement::new();
        tm.set_move_overhead(self.options.move_overhead);
        tm.set_ponder_enabled(self.options.ponder_enabled);
        if let Some(prev) = worker.tm.take() {
            tm.available_nodes = prev.available_nodes;
        }
        tm.init(&mut limits, pos.side_to_move(), pos.game_ply());
        worker.tm = Some(tm);
        worker.limits = limits.clone();

        // ノードカウンタを集約できるようにしておく（helperはidle中）
        let mut counters: Vec<Arc<AtomicU64>> = vec![Arc::clone(&worker.nodes)];
        for t in self.pool.helper_threads() {
            counters.push(t.with_worker(|hw| Arc::clone(&hw.nodes)));
        }
        worker.node_counters = counters;

        // ヘルパーを起こす
        if self.num_threads > 1 {
            let options = self.options.clone();
            let tb = self.tb.clone();
            let use_rule50 = self.options.syzygy_50_move_rule;
            let limits_for_helpers = limits.clone();
            let pos_snapshot = pos.clone();
            let root_clone = root_moves;
            self.pool.start_thinking(move |_id| SearchTask {
                pos: pos_snapshot.clone(),
                limits: limits_for_helpers.clone(),
                options: options.clone(),
                tb: tb.clone(),
                tb_cardinality,
                tb_probe_depth,
                tb_use_rule50: use_rule50,
                root_in_tb,
                root_moves: root_clone.clone(),
            });
        }

        // メインスレッドの探索
        {
            let mut worker = self.worker.take().expect("main worker exists");
            let main = MainLoop {
                best_previous_score: &mut self.best_previous_score,
                iter_value: &mut self.iter_value,
                previous_time_reduction: &mut self.previous_time_reduction,
                pool: &self.pool,
                on_info: &mut on_info,
            };
            iterative_deepening(&mut worker, pos, Some(main), None);
            self.worker = Some(worker);
        }

        // ponder / infinite のときは GUI の指示があるまで bestmove を出さない
        while !self.stop.load(Ordering::Relaxed)
            && (self.ponder.load(Ordering::Relaxed) || limits.infinite)
        {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        self.stop.store(true, Ordering::SeqCst);
        self.pool.wait_for_search_finished();

        let worker = self.worker.as_mut().expect("main worker exists");

        // nodes as time: 使った分を残量から引き継ぐ
        let searched = worker.total_nodes();
        if let Some(tm) = &mut worker.tm {
            let us_idx = crate::search::history::color_index(pos.side_to_move());
            tm.consume_available_nodes(searched, limits.inc[us_idx]);
        }

        // 最善スレッドの選出
        let (mut best_move, mut ponder_move, mut score, mut depth);
        {
            let main_score = worker.root_moves[0].score;
            let main_depth = worker.completed_depth;
            best_move = worker.root_moves[0].mv();
            ponder_move = worker.root_moves[0].pv.get(1).copied().unwrap_or(Move::NONE);
            score = main_score;
            depth = main_depth;

            if self.options.multi_pv == 1
                && self.options.tactical == 0
                && limits.depth == 0
                && best_move.is_some()
            {
                let mut best_metric = i64::MIN;
                let mut from_helper: Option<(Move, Move, Value, Depth)> = None;
                for t in self.pool.helper_threads() {
                    let summary = t.with_worker(|hw| {
                        if hw.root_moves.is_empty() {
                            None
                        } else {
                            Some((
                                hw.root_moves[0].mv(),
                                hw.root_moves[0].pv.get(1).copied().unwrap_or(Move::NONE),
                                hw.root_moves[0].score,
                                hw.completed_depth,
                            ))
                        }
                    });
                    if let Some((m, p, s, d)) = summary {
                        // mainよりスコアも深さも勝るスレッドだけが乗っ取れる
                        if s > main_score && (d >= main_depth || s.is_mate_win()) {
                            let metric = (s.raw() - main_score.raw()) as i64
                                * (d - main_depth).max(1) as i64;
                            if metric > best_metric || (metric == best_metric && d > depth) {
                                best_metric = metric;
                                from_helper = Some((m, p, s, d));
                            }
                        }
                    }
                }
                if let Some((m, p, s, d)) = from_helper {
                    best_move = m;
                    ponder_move = p;
                    score = s;
                    depth = d;
                }
            }
        }

        // ponder 手が無ければ置換表から補う
        if ponder_move.is_none() && best_move.is_some() {
            ponder_move = extract_ponder_from_tt(&self.tt, pos, best_move);
        }

        self.best_previous_score = score;

        SearchResult {
            best_move,
            ponder_move,
            score,
            depth,
            nodes: searched,
        }
    }
}

/// fail high 中に探索が止まった場合など、PVが1手しかないときに
/// 置換表から ponder 手を復元する
pub fn extract_ponder_from_tt(
    tt: &TranspositionTable,
    pos: &mut Position,
    best_move: Move,
) -> Move {
    if best_move.is_none() || !pos.is_legal(best_move) {
        return Move::NONE;
    }

    pos.do_move(best_move);
    let probe = tt.probe(pos.key());
    let mut ponder = Move::NONE;
    if probe.found && probe.data.mv.is_some() && pos.is_legal(probe.data.mv) {
        ponder = probe.data.mv;
    }
    pos.undo_move();
    ponder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widen_delta_growth() {
        // fail のたびに delta が delta/4 + 5 ずつ広がる
        let mut delta = Value::new(17);
        let expected = [26, 37, 51, 68];
        for e in expected {
            delta = widen_delta(delta);
            assert_eq!(delta.raw(), e);
        }
    }

    #[test]
    fn test_wdl_model_symmetry() {
        let (w, d, l) = wdl_model(Value::ZERO, 0);
        assert_eq!(w, l);
        assert!(d > 0);
        assert_eq!(w + d + l, 1000);

        let (w2, _, l2) = wdl_model(Value::new(300), 0);
        assert!(w2 > l2);
        let (w3, _, l3) = wdl_model(Value::new(-300), 0);
        assert_eq!(w3, l2);
        assert_eq!(l3, w2);
    }

    #[test]
    fn test_info_string_mate_and_bounds() {
        let mut info = SearchInfo {
            depth: 12,
            sel_depth: 20,
            multi_pv: 1,
            score: Value::mate_in(3),
            bound: None,
            wdl: None,
            nodes: 1000,
            nps: 500_000,
            time_ms: 2,
            hashfull: 0,
            tb_hits: 0,
            pv: vec![Move::new(shakmaty::Square::A1, shakmaty::Square::A8)],
        };
        let s = info.to_uci_string();
        assert!(s.contains("score mate 2"));
        assert!(s.contains("pv a1a8"));
        assert!(!s.contains("hashfull"));

        info.score = Value::mated_in(4);
        info.bound = Some(Bound::Lower);
        let s = info.to_uci_string();
        assert!(s.contains("score mate -2"));
        assert!(s.contains("lowerbound"));
    }
}
