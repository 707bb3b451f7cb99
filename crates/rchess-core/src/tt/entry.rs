//! 置換表エントリー
//!
//! TTEntry: 16バイトのエントリ構造（key 8B + データ 8B）
//! TTData: 読み取り用のスナップショット

use super::{GENERATION_CYCLE, GENERATION_MASK};
use crate::types::{Bound, Depth, Move, Value, DEPTH_OFFSET};

/// 置換表エントリー
///
/// 16バイト × 3 エントリ + パディングで 1 クラスターが
/// キャッシュライン（64バイト）に収まる。
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct TTEntry {
    /// ハッシュキー（衝突検出用。読み手は再検証する）
    key: u64,
    /// 最善手（16bit形式）
    move16: u16,
    /// 探索値（ノード相対の詰み表現）
    value16: i16,
    /// 静的評価値
    eval16: i16,
    /// 探索深さ（DEPTH_OFFSETを引いた値、0 = 未使用）
    depth8: u8,
    /// generation(5bit) | pv(1bit) | bound(2bit)
    gen_bound8: u8,
}

// エントリサイズが16バイトであることを保証
const _: () = assert!(std::mem::size_of::<TTEntry>() == 16);

impl TTEntry {
    /// 新しい空のエントリを作成
    #[inline]
    pub const fn new() -> Self {
        Self {
            key: 0,
            move16: 0,
            value16: 0,
            eval16: 0,
            depth8: 0,
            gen_bound8: 0,
        }
    }

    /// エントリが使用されているか
    #[inline]
    pub fn is_occupied(&self) -> bool {
        self.depth8 != 0
    }

    /// キーを取得
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// 保存されている生のdepth8を取得
    #[inline]
    pub fn depth8(&self) -> u8 {
        self.depth8
    }

    /// エントリを読み取る
    pub fn read(&self) -> TTData {
        TTData {
            mv: Move::from_u16_checked(self.move16).unwrap_or(Move::NONE),
            // VALUE_NONE (32002) は i16 に収まるのでそのまま往復する
            value: if self.is_occupied() {
                Value::new(self.value16 as i32)
            } else {
                Value::NONE
            },
            eval: Value::new(self.eval16 as i32),
            depth: self.depth8 as Depth + DEPTH_OFFSET,
            bound: Bound::from_u8(self.gen_bound8 & 0x3),
            is_pv: (self.gen_bound8 & 0x4) != 0,
        }
    }

    /// エントリに保存
    ///
    /// 上書き条件:
    /// - BOUND_EXACT（確定値）
    /// - 異なるキー
    /// - 既存より深い探索（PVノードは +2 ply 分優遇）
    /// - 古い世代のエントリ
    ///
    /// PVフラグは同一キーの上書きで粘着する（新旧のOR）。
    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &mut self,
        key: u64,
        value: Value,
        is_pv: bool,
        bound: Bound,
        depth: Depth,
        mv: Move,
        eval: Value,
        generation8: u8,
    ) {
        let same_key = key == self.key;

        // 新しい手がない場合は古い手を保持
        if mv.is_some() || !same_key {
            self.move16 = mv.to_u16();
        }

        let is_pv = is_pv || (same_key && (self.gen_bound8 & 0x4) != 0);
        let d8 = depth - DEPTH_OFFSET;
        debug_assert!(d8 > 0 && d8 < 256);

        if bound == Bound::Exact
            || !same_key
            || d8 + 2 * (is_pv as Depth) > self.depth8 as Depth - 4
            || self.relative_age(generation8) != 0
        {
            self.key = key;
            self.depth8 = d8 as u8;
            self.gen_bound8 = generation8 | ((is_pv as u8) << 2) | bound as u8;
            self.value16 = value.raw() as i16;
            self.eval16 = eval.raw() as i16;
        }
    }

    /// 相対的な世代（0 = 最新）
    #[inline]
    pub fn relative_age(&self, generation8: u8) -> u8 {
        let age = GENERATION_CYCLE
            .wrapping_add(generation8 as u16)
            .wrapping_sub(self.gen_bound8 as u16);
        (age & GENERATION_MASK) as u8
    }
}

/// 置換表から読み取ったデータ
///
/// ミス時は `probe` の置換候補のスナップショットであり、書き込み経路
/// 以外では意味を持たない。
#[derive(Clone, Copy, Debug)]
pub struct TTData {
    /// 最善手
    pub mv: Move,
    /// 探索値（ノード相対）
    pub value: Value,
    /// 静的評価値
    pub eval: Value,
    /// 探索深さ
    pub depth: Depth,
    /// 境界タイプ
    pub bound: Bound,
    /// PVノードかどうか
    pub is_pv: bool,
}

impl TTData {
    /// 空のデータ
    pub const EMPTY: Self = Self {
        mv: Move::NONE,
        value: Value::NONE,
        eval: Value::NONE,
        depth: DEPTH_OFFSET,
        bound: Bound::None,
        is_pv: false,
    };
}

impl Default for TTData {
    fn default() -> Self {
        Self::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shakmaty::Square;

    #[test]
    fn test_tt_entry_new() {
        let entry = TTEntry::new();
        assert!(!entry.is_occupied());
        assert_eq!(entry.key(), 0);
        assert_eq!(entry.read().value, Value::NONE);
    }

    #[test]
    fn test_tt_entry_save_and_read() {
        let mut entry = TTEntry::new();
        let mv = Move::new(Square::G1, Square::F3);

        entry.save(
            0x1234_5678_9abc_def0,
            Value::new(100),
            true,
            Bound::Exact,
            10,
            mv,
            Value::new(-50),
            8,
        );

        assert!(entry.is_occupied());
        assert_eq!(entry.key(), 0x1234_5678_9abc_def0);

        let data = entry.read();
        assert_eq!(data.value.raw(), 100);
        assert_eq!(data.eval.raw(), -50);
        assert_eq!(data.depth, 10);
        assert_eq!(data.bound, Bound::Exact);
        assert_eq!(data.mv, mv);
        assert!(data.is_pv);
    }

    #[test]
    fn test_tt_entry_keeps_move_on_same_key() {
        let mut entry = TTEntry::new();
        let mv = Move::new(Square::E2, Square::E4);
        entry.save(42, Value::new(10), false, Bound::Lower, 8, mv, Value::ZERO, 0);
        // 同一キーで手なし保存: 既存の手を保持
        entry.save(42, Value::new(20), false, Bound::Lower, 12, Move::NONE, Value::ZERO, 0);
        assert_eq!(entry.read().mv, mv);
    }

    #[test]
    fn test_tt_entry_pv_sticky() {
        let mut entry = TTEntry::new();
        entry.save(42, Value::new(10), true, Bound::Exact, 8, Move::NONE, Value::ZERO, 0);
        assert!(entry.read().is_pv);
        // 同一キーに is_pv=false で上書きしてもPVフラグは残る
        entry.save(42, Value::new(5), false, Bound::Exact, 9, Move::NONE, Value::ZERO, 0);
        assert!(entry.read().is_pv);
        // キーが変わればリセット
        entry.save(43, Value::new(5), false, Bound::Exact, 9, Move::NONE, Value::ZERO, 0);
        assert!(!entry.read().is_pv);
    }

    #[test]
    fn test_tt_entry_preserves_deeper() {
        let mut entry = TTEntry::new();
        entry.save(42, Value::new(10), false, Bound::Lower, 20, Move::NONE, Value::ZERO, 0);
        // 同一キー・同一世代・浅い非EXACTは書き込まれない
        entry.save(42, Value::new(99), false, Bound::Lower, 4, Move::NONE, Value::ZERO, 0);
        assert_eq!(entry.read().value.raw(), 10);
        assert_eq!(entry.read().depth, 20);
        // EXACTなら上書き
        entry.save(42, Value::new(99), false, Bound::Exact, 4, Move::NONE, Value::ZERO, 0);
        assert_eq!(entry.read().value.raw(), 99);
    }

    #[test]
    fn test_tt_entry_relative_age() {
        let mut entry = TTEntry::new();
        entry.save(0, Value::ZERO, false, Bound::Lower, 10, Move::NONE, Value::ZERO, 8);
        assert_eq!(entry.relative_age(8), 0);
        assert_eq!(entry.relative_age(16), 8);
    }
}
