//! 探索のエンドツーエンドテスト
//!
//! 1スレッド・置換表1MB・Variety 0 で決定的に動かす。

use rchess_core::position::Position;
use rchess_core::search::{LimitsType, Search};
use rchess_core::{Move, Value};

fn depth_limits(depth: i32) -> LimitsType {
    LimitsType {
        depth,
        ..Default::default()
    }
}

#[test]
fn test_mate_in_one() {
    let mut search = Search::new(1);
    let mut pos = Position::from_fen("4k3/8/4K3/8/8/8/8/7R w - - 0 1").unwrap();

    let result = search.go(&mut pos, depth_limits(2), |_| {});
    assert_eq!(result.best_move.to_uci(), "h1h8");
    assert_eq!(result.score, Value::mate_in(1));
}

#[test]
fn test_back_rank_mate() {
    let mut search = Search::new(1);
    let mut pos = Position::from_fen("6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1").unwrap();

    let mut last_pv: Vec<Move> = Vec::new();
    let result = search.go(&mut pos, depth_limits(4), |info| {
        last_pv = info.pv.clone();
    });
    assert_eq!(result.best_move.to_uci(), "a1a8");
    assert!(result.score.is_mate_win());
    assert!(result.score >= Value::mate_in(3));
    assert_eq!(last_pv[0].to_uci(), "a1a8");
}

#[test]
fn test_stalemate_reports_depth_zero() {
    let mut search = Search::new(1);
    // 黒番、合法手なし、王手もなし
    let mut pos = Position::from_fen("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1").unwrap();
    assert!(pos.legal_moves().is_empty());
    assert!(!pos.in_check());

    let mut infos = Vec::new();
    let result = search.go(&mut pos, depth_limits(1), |info| {
        infos.push(info.clone());
    });

    assert!(result.best_move.is_none());
    assert_eq!(result.score, Value::DRAW);
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].depth, 0);
    assert_eq!(infos[0].score, Value::ZERO);
    assert!(infos[0].to_uci_string().contains("depth 0"));
    assert!(infos[0].to_uci_string().contains("cp 0"));
}

#[test]
fn test_checkmated_root_reports_mate() {
    let mut search = Search::new(1);
    // 黒番、詰まされている
    let mut pos = Position::from_fen("R3k3/8/4K3/8/8/8/8/8 b - - 0 1").unwrap();
    assert!(pos.legal_moves().is_empty());
    assert!(pos.in_check());

    let result = search.go(&mut pos, depth_limits(1), |_| {});
    assert!(result.best_move.is_none());
    assert!(result.score.is_mate_loss());
}

#[test]
fn test_serial_search_is_deterministic() {
    let fen = "r1bqkbnr/pppp1ppp/2n5/4p3/4P3/5N2/PPPP1PPP/RNBQKB1R w KQkq - 2 3";

    let mut first = Search::new(1);
    let mut pos1 = Position::from_fen(fen).unwrap();
    let r1 = first.go(&mut pos1, depth_limits(6), |_| {});

    let mut second = Search::new(1);
    let mut pos2 = Position::from_fen(fen).unwrap();
    let r2 = second.go(&mut pos2, depth_limits(6), |_| {});

    assert_eq!(r1.best_move, r2.best_move);
    assert_eq!(r1.score, r2.score);
    assert_eq!(r1.nodes, r2.nodes);
}

#[test]
fn test_nodes_limit_terminates() {
    let mut search = Search::new(1);
    let mut pos = Position::new();
    let limits = LimitsType {
        nodes: 20_000,
        ..Default::default()
    };

    let result = search.go(&mut pos, limits, |_| {});
    assert!(result.best_move.is_some());
    // 確認間隔ぶんの超過は許す
    assert!(result.nodes < 200_000);
}

#[test]
fn test_searchmoves_restricts_root() {
    let mut search = Search::new(1);
    let mut pos = Position::new();
    let only = pos
        .legal_moves()
        .into_iter()
        .find(|m| m.to_uci() == "a2a3")
        .unwrap();
    let limits = LimitsType {
        depth: 4,
        search_moves: vec![only],
        ..Default::default()
    };

    let result = search.go(&mut pos, limits, |_| {});
    assert_eq!(result.best_move, only);
}

#[test]
fn test_multipv_reports_distinct_lines() {
    let mut search = Search::new(1);
    let mut opts = rchess_core::SearchOptions::default();
    opts.multi_pv = 3;
    search.set_options(opts);

    let mut pos = Position::new();
    let mut seen = Vec::new();
    search.go(&mut pos, depth_limits(5), |info| {
        if info.depth == 5 {
            seen.push((info.multi_pv, info.pv.first().copied()));
        }
    });

    let firsts: Vec<_> = seen
        .iter()
        .filter_map(|(_, m)| *m)
        .collect();
    assert!(firsts.len() >= 3);
    let mut uniq = firsts.clone();
    uniq.sort_by_key(|m| m.to_u16());
    uniq.dedup();
    assert_eq!(uniq.len(), firsts.len(), "multipv lines must be distinct");
}

#[test]
fn test_deeper_search_not_worse_in_won_position() {
    // クイーン得の局面で深さを上げても勝ち評価を失わない
    let fen = "4k3/8/8/3q4/8/8/3R4/4K3 b - - 0 1";
    for depth in [4, 6] {
        let mut search = Search::new(1);
        let mut pos = Position::from_fen(fen).unwrap();
        let r = search.go(&mut pos, depth_limits(depth), |_| {});
        assert!(
            r.score.raw() > 600,
            "queen-up side to move should stay winning at depth {depth}: {:?}",
            r.score
        );
    }
}

#[test]
fn test_go_twice_reuses_engine() {
    let mut search = Search::new(1);
    let mut pos = Position::new();
    let r1 = search.go(&mut pos, depth_limits(4), |_| {});
    assert!(r1.best_move.is_some());

    // 1手進めて再探索
    pos.do_move(r1.best_move);
    let r2 = search.go(&mut pos, depth_limits(4), |_| {});
    assert!(r2.best_move.is_some());
    assert!(pos.is_legal(r2.best_move));
}
