//! 時間管理（TimeManagement）
//!
//! 使用可能な残り時間・加算・手数から、この1手に費やす最適時間
//! （optimum）と上限時間（maximum）を計算する。反復深化側の
//! 停止判定（fallingEval 等）は driver が行い、ここは時計と
//! nodes as time の換算のみを担う。

use std::time::Instant;

use shakmaty::Color;

use super::limits::LimitsType;
use crate::search::history::color_index;

/// ミリ秒
pub type TimePoint = i64;

/// 着手までの最低猶予（ミリ秒）
const MOVE_OVERHEAD_DEFAULT: TimePoint = 10;

/// 時間管理
pub struct TimeManagement {
    start_time: Instant,
    optimum_time: TimePoint,
    maximum_time: TimePoint,
    /// nodes as time モードの換算係数（0 = 無効）
    npmsec: i64,
    /// nodes as time モードで持ち越す残ノード数
    pub available_nodes: i64,
    move_overhead: TimePoint,
    ponder_bonus: bool,
}

impl TimeManagement {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            optimum_time: 0,
            maximum_time: 0,
            npmsec: 0,
            available_nodes: 0,
            move_overhead: MOVE_OVERHEAD_DEFAULT,
            ponder_bonus: false,
        }
    }

    pub fn set_move_overhead(&mut self, ms: TimePoint) {
        self.move_overhead = ms.max(0);
    }

    pub fn set_ponder_enabled(&mut self, enabled: bool) {
        self.ponder_bonus = enabled;
    }

    /// go受信時に呼び、この1手の optimum / maximum を確定する
    ///
    /// 探索中は不変（スナップショット方式）。
    pub fn init(&mut self, limits: &mut LimitsType, us: Color, ply: i32) {
        self.start_time = Instant::now();
        self.npmsec = limits.npmsec;

        // nodes as time: 時計の代わりに探索ノード数を「時間」として使う。
        // 対局開始時に残ノードを貯め、以降は引き継いだ残量で計算する。
        if limits.npmsec != 0 {
            if self.available_nodes == 0 {
                self.available_nodes = limits.npmsec * limits.time[color_index(us)];
            }
            limits.time[color_index(us)] = self.available_nodes / limits.npmsec;
        }

        let my_time = limits.time[color_index(us)];
        let my_inc = limits.inc[color_index(us)];

        if my_time == 0 {
            // movetime / depth / nodes 制限のみの探索
            self.optimum_time = 0;
            self.maximum_time = 0;
            return;
        }

        let mtg = if limits.movestogo > 0 {
            limits.movestogo.min(50)
        } else {
            0
        };

        let time_left = (my_time
            + my_inc * (mtg.max(1) as i64 - 1)
            - self.move_overhead * (2 + mtg.max(1) as i64))
        .max(1);

        let (opt_scale, max_scale) = if mtg == 0 {
            let opt = (0.0084 + ((ply as f64 + 3.0).sqrt()) * 0.0042)
                .min(0.2 * my_time as f64 / time_left as f64);
            let max = (4.0 + ply as f64 / 12.0).min(7.0);
            (opt, max)
        } else {
            let opt = ((0.8 + ply as f64 / 128.0) / mtg as f64)
                .min(0.8 * my_time as f64 / time_left as f64);
            let max = (1.5 + 0.11 * mtg as f64).min(6.3);
            (opt, max)
        };

        self.optimum_time = (opt_scale * time_left as f64) as TimePoint;
        self.maximum_time = ((0.8 * my_time as f64 - self.move_overhead as f64) as TimePoint)
            .min((max_scale * self.optimum_time as f64) as TimePoint)
            .max(1);

        if self.ponder_bonus {
            self.optimum_time += self.optimum_time / 4;
        }
    }

    /// 最適思考時間（ミリ秒）
    #[inline]
    pub fn optimum(&self) -> TimePoint {
        self.optimum_time
    }

    /// 上限思考時間（ミリ秒）
    #[inline]
    pub fn maximum(&self) -> TimePoint {
        self.maximum_time
    }

    /// 経過時間（ミリ秒）。nodes as time モードでは探索ノード数。
    #[inline]
    pub fn elapsed(&self, nodes: u64) -> TimePoint {
        if self.npmsec != 0 {
            nodes as TimePoint
        } else {
            self.start_time.elapsed().as_millis() as TimePoint
        }
    }

    /// 探索終了時の nodes as time 残量更新
    pub fn consume_available_nodes(&mut self, searched: u64, inc: i64) {
        if self.npmsec != 0 {
            self.available_nodes += inc - searched as i64;
        }
    }
}

impl Default for TimeManagement {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_clock_means_no_budget() {
        let mut tm = TimeManagement::new();
        let mut limits = LimitsType {
            depth: 12,
            ..Default::default()
        };
        tm.init(&mut limits, Color::White, 0);
        assert_eq!(tm.optimum(), 0);
        assert_eq!(tm.maximum(), 0);
    }

    #[test]
    fn test_budget_scales_sanely() {
        let mut tm = TimeManagement::new();
        let mut limits = LimitsType {
            time: [60_000, 60_000],
            inc: [1_000, 1_000],
            ..Default::default()
        };
        tm.init(&mut limits, Color::White, 20);
        assert!(tm.optimum() > 0);
        assert!(tm.maximum() >= tm.optimum());
        assert!(tm.maximum() < 60_000);
    }

    #[test]
    fn test_movestogo_budget() {
        let mut tm = TimeManagement::new();
        let mut limits = LimitsType {
            time: [30_000, 30_000],
            movestogo: 10,
            ..Default::default()
        };
        tm.init(&mut limits, Color::Black, 40);
        // 10手で30秒なら1手あたり数秒のオーダー
        assert!(tm.optimum() >= 1_000);
        assert!(tm.optimum() <= 10_000);
    }

    #[test]
    fn test_nodes_as_time() {
        let mut tm = TimeManagement::new();
        let mut limits = LimitsType {
            time: [1_000, 1_000],
            npmsec: 1_000,
            ..Default::default()
        };
        tm.init(&mut limits, Color::White, 0);
        // 経過「時間」はノード数で測られる
        assert_eq!(tm.elapsed(12_345), 12_345);
        assert_eq!(tm.available_nodes, 1_000_000);
    }
}
