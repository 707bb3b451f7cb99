//! 探索制限（go コマンドのパラメータ）

use crate::types::{Depth, Move};

/// UCI `go` の制限一式
#[derive(Clone, Debug, Default)]
pub struct LimitsType {
    /// 残り時間（ミリ秒）[白, 黒]
    pub time: [i64; 2],
    /// 加算（ミリ秒）[白, 黒]
    pub inc: [i64; 2],
    /// 次の時間管理までの手数（0 = sudden death）
    pub movestogo: i32,
    /// 深さ制限（0 = なし）
    pub depth: Depth,
    /// 1手の思考時間（ミリ秒、0 = なし）
    pub movetime: i64,
    /// 詰み探索の手数（0 = なし）
    pub mate: i32,
    /// ノード数制限（0 = なし）
    pub nodes: u64,
    /// nodes as time モード（1ミリ秒あたりのノード数、0 = 無効）
    pub npmsec: i64,
    /// 無制限探索
    pub infinite: bool,
    /// ponder 探索として開始
    pub ponder: bool,
    /// searchmoves 指定（空 = 全合法手）
    pub search_moves: Vec<Move>,
}

impl LimitsType {
    /// 時間管理を使う探索か
    ///
    /// 深さ・ノード・詰み・movetime・infinite のいずれかが指定されて
    /// いれば時間管理は無効。
    #[inline]
    pub fn use_time_management(&self) -> bool {
        self.mate == 0
            && self.movetime == 0
            && self.depth == 0
            && self.nodes == 0
            && !self.infinite
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_use_time_management() {
        let mut limits = LimitsType::default();
        assert!(limits.use_time_management());

        limits.depth = 10;
        assert!(!limits.use_time_management());

        let mut limits = LimitsType::default();
        limits.infinite = true;
        assert!(!limits.use_time_management());

        let mut limits = LimitsType::default();
        limits.nodes = 10_000;
        assert!(!limits.use_time_management());
    }
}
