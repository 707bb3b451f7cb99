//! History統計
//!
//! 探索中の手の成功/失敗を記録し、手の順序付けに利用する。
//!
//! - `StatsEntry`: 範囲制限付き履歴エントリ
//! - `ButterflyHistory`: [Color][from_to] -> score
//! - `LowPlyHistory`: [ply][from_to] -> score
//! - `CapturePieceToHistory`: [piece][to][captured_role] -> score
//! - `PieceToHistory`: [piece][to] -> score
//! - `ContinuationHistory`: [in_check][capture][piece][to] -> PieceToHistory
//! - `CounterMoveHistory`: [piece][square] -> Move

use shakmaty::{Color, Role, Square};

use crate::types::{Depth, Move, Piece, FROM_TO_SIZE, PIECE_NB};

// =============================================================================
// 定数
// =============================================================================

/// LowPlyHistoryのサイズ（ルート付近のply数）
pub const MAX_LPH: usize = 4;

/// 駒種の数（captured 用、None含む）
const ROLE_NB: usize = 7;

// =============================================================================
// StatsEntry
// =============================================================================

/// 履歴統計の1エントリ
///
/// 値の範囲を [-D, D] に制限しながら更新できる。
#[derive(Clone, Copy)]
pub struct StatsEntry<const D: i32> {
    value: i16,
}

impl<const D: i32> Default for StatsEntry<D> {
    fn default() -> Self {
        Self { value: 0 }
    }
}

impl<const D: i32> StatsEntry<D> {
    /// 値を取得
    #[inline]
    pub fn get(&self) -> i16 {
        self.value
    }

    /// 値を設定
    #[inline]
    pub fn set(&mut self, v: i16) {
        self.value = v;
    }

    /// ボーナス値を加算（範囲制限付き）
    ///
    /// 更新式: entry += clamp(bonus, -D, D) - entry * |clamp(bonus, -D, D)| / D
    ///
    /// bonus == D のとき entry が D に収束し、|entry| は D を超えない。
    #[inline]
    pub fn update(&mut self, bonus: i32) {
        let clamped = bonus.clamp(-D, D);
        let delta = clamped - (self.value as i32) * clamped.abs() / D;
        self.value = (self.value as i32 + delta) as i16;
        debug_assert!(
            self.value.abs() <= D as i16,
            "StatsEntry out of range: {} (D={})",
            self.value,
            D
        );
    }
}

// =============================================================================
// ButterflyHistory
// =============================================================================

/// ButterflyHistory: [Color][from_to] -> score
///
/// 静かな手の成功/失敗を記録。手の移動元と移動先でインデックス。
pub struct ButterflyHistory {
    table: Box<[[StatsEntry<7183>; FROM_TO_SIZE]; 2]>,
}

/// Color の添字（White = 0, Black = 1）
#[inline]
pub fn color_index(color: Color) -> usize {
    if color == Color::White {
        0
    } else {
        1
    }
}

impl ButterflyHistory {
    pub fn new() -> Self {
        Self {
            table: Box::new([[StatsEntry::default(); FROM_TO_SIZE]; 2]),
        }
    }

    #[inline]
    pub fn get(&self, color: Color, mv: Move) -> i16 {
        self.table[color_index(color)][mv.from_to()].get()
    }

    #[inline]
    pub fn update(&mut self, color: Color, mv: Move, bonus: i32) {
        self.table[color_index(color)][mv.from_to()].update(bonus);
    }

    pub fn clear(&mut self) {
        for color_table in self.table.iter_mut() {
            for entry in color_table.iter_mut() {
                entry.set(0);
            }
        }
    }
}

impl Default for ButterflyHistory {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// LowPlyHistory
// =============================================================================

/// LowPlyHistory: [ply][from_to] -> score
///
/// ルート付近での手の順序を改善するための履歴。
/// 反復深化の開始時に2段ずらして持ち越す（`age`）。
pub struct LowPlyHistory {
    table: Box<[[StatsEntry<7183>; FROM_TO_SIZE]; MAX_LPH]>,
}

impl LowPlyHistory {
    pub fn new() -> Self {
        Self {
            table: Box::new([[StatsEntry::default(); FROM_TO_SIZE]; MAX_LPH]),
        }
    }

    #[inline]
    pub fn get(&self, ply: usize, mv: Move) -> i16 {
        if ply < MAX_LPH {
            self.table[ply][mv.from_to()].get()
        } else {
            0
        }
    }

    #[inline]
    pub fn update(&mut self, ply: usize, mv: Move, bonus: i32) {
        if ply < MAX_LPH {
            self.table[ply][mv.from_to()].update(bonus);
        }
    }

    /// 反復深化の次イテレーションに向けて2段ずらす
    ///
    /// 行0..MAX_LPH-2 に行2..MAX_LPH をコピーし、末尾2行をゼロにする。
    pub fn age(&mut self) {
        for ply in 0..MAX_LPH - 2 {
            self.table[ply] = self.table[ply + 2];
        }
        for ply in MAX_LPH - 2..MAX_LPH {
            for entry in self.table[ply].iter_mut() {
                entry.set(0);
            }
        }
    }

    pub fn clear(&mut self) {
        for ply_table in self.table.iter_mut() {
            for entry in ply_table.iter_mut() {
                entry.set(0);
            }
        }
    }
}

impl Default for LowPlyHistory {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CapturePieceToHistory
// =============================================================================

/// CapturePieceToHistory: [piece][to][captured_role] -> score
pub struct CapturePieceToHistory {
    table: Box<[[[StatsEntry<10692>; ROLE_NB]; 64]; PIECE_NB]>,
}

impl CapturePieceToHistory {
    pub fn new() -> Self {
        Self {
            table: Box::new([[[StatsEntry::default(); ROLE_NB]; 64]; PIECE_NB]),
        }
    }

    #[inline]
    fn role_index(captured: Option<Role>) -> usize {
        captured.map_or(0, |r| r as usize)
    }

    #[inline]
    pub fn get(&self, pc: Piece, to: Square, captured: Option<Role>) -> i16 {
        self.table[pc.index()][to as usize][Self::role_index(captured)].get()
    }

    #[inline]
    pub fn update(&mut self, pc: Piece, to: Square, captured: Option<Role>, bonus: i32) {
        self.table[pc.index()][to as usize][Self::role_index(captured)].update(bonus);
    }

    pub fn clear(&mut self) {
        for pc_table in self.table.iter_mut() {
            for sq_table in pc_table.iter_mut() {
                for entry in sq_table.iter_mut() {
                    entry.set(0);
                }
            }
        }
    }
}

impl Default for CapturePieceToHistory {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// PieceToHistory
// =============================================================================

/// PieceToHistory: [piece][to] -> score
///
/// ContinuationHistory の内側テーブル。
pub struct PieceToHistory {
    table: [[StatsEntry<29952>; 64]; PIECE_NB],
}

impl PieceToHistory {
    pub fn new() -> Self {
        Self {
            table: [[StatsEntry::default(); 64]; PIECE_NB],
        }
    }

    #[inline]
    pub fn get(&self, pc: Piece, to: Square) -> i16 {
        self.table[pc.index()][to as usize].get()
    }

    #[inline]
    pub fn update(&mut self, pc: Piece, to: Square, bonus: i32) {
        self.table[pc.index()][to as usize].update(bonus);
    }

    pub fn clear(&mut self) {
        for pc_table in &mut self.table {
            for entry in pc_table.iter_mut() {
                entry.set(0);
            }
        }
    }
}

impl Default for PieceToHistory {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// ContinuationHistory
// =============================================================================

/// 探索スタックに保存する continuation history の選択キー
///
/// テーブルへの参照を持ち回る代わりに、(in_check, capture, piece, to) の
/// 添字を保持して必要なときに引く。番兵は NONE 駒の行を指し、更新経路は
/// `current_move` の有無で番兵を弾くため読み取り専用のゼロのまま保たれる。
#[derive(Clone, Copy)]
pub struct ContHistKey {
    pub in_check: bool,
    pub capture: bool,
    pub piece: Piece,
    pub to: Square,
}

impl Default for ContHistKey {
    fn default() -> Self {
        Self {
            in_check: false,
            capture: false,
            piece: Piece::NONE,
            to: Square::A1,
        }
    }
}

/// ContinuationHistory: [in_check][capture] -> [piece][to] -> PieceToHistory
///
/// 直前の数手（ply −1,−2,−4,−6）との組み合わせ履歴。
pub struct ContinuationHistory {
    table: Box<[[Vec<PieceToHistory>; 2]; 2]>,
}

impl ContinuationHistory {
    pub fn new() -> Self {
        let make = || {
            let mut v = Vec::with_capacity(PIECE_NB * 64);
            v.resize_with(PIECE_NB * 64, PieceToHistory::new);
            v
        };
        Self {
            table: Box::new([[make(), make()], [make(), make()]]),
        }
    }

    #[inline]
    fn slot(in_check: bool, capture: bool) -> (usize, usize) {
        (in_check as usize, capture as usize)
    }

    /// キーで選択された内側テーブルを取得
    #[inline]
    pub fn table(&self, key: ContHistKey) -> &PieceToHistory {
        let (c, p) = Self::slot(key.in_check, key.capture);
        &self.table[c][p][key.piece.index() * 64 + key.to as usize]
    }

    /// キーで選択された内側テーブルを可変で取得
    #[inline]
    pub fn table_mut(&mut self, key: ContHistKey) -> &mut PieceToHistory {
        let (c, p) = Self::slot(key.in_check, key.capture);
        &mut self.table[c][p][key.piece.index() * 64 + key.to as usize]
    }

    pub fn clear(&mut self) {
        for a in self.table.iter_mut() {
            for b in a.iter_mut() {
                for t in b.iter_mut() {
                    t.clear();
                }
            }
        }
    }
}

impl Default for ContinuationHistory {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CounterMoveHistory
// =============================================================================

/// CounterMoveHistory: [piece][square] -> Move
///
/// 直前の相手の手に対するカウンター手。
pub struct CounterMoveHistory {
    table: Box<[[Move; 64]; PIECE_NB]>,
}

impl CounterMoveHistory {
    pub fn new() -> Self {
        Self {
            table: Box::new([[Move::NONE; 64]; PIECE_NB]),
        }
    }

    #[inline]
    pub fn get(&self, pc: Piece, sq: Square) -> Move {
        self.table[pc.index()][sq as usize]
    }

    #[inline]
    pub fn set(&mut self, pc: Piece, sq: Square, mv: Move) {
        self.table[pc.index()][sq as usize] = mv;
    }

    pub fn clear(&mut self) {
        for pc_table in self.table.iter_mut() {
            for entry in pc_table.iter_mut() {
                *entry = Move::NONE;
            }
        }
    }
}

impl Default for CounterMoveHistory {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Histories（スレッドローカルな履歴一式）
// =============================================================================

/// 1ワーカー分の履歴テーブル一式
pub struct Histories {
    pub main_history: ButterflyHistory,
    pub low_ply_history: LowPlyHistory,
    pub capture_history: CapturePieceToHistory,
    pub continuation_history: ContinuationHistory,
    pub counter_moves: CounterMoveHistory,
}

impl Histories {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            main_history: ButterflyHistory::new(),
            low_ply_history: LowPlyHistory::new(),
            capture_history: CapturePieceToHistory::new(),
            continuation_history: ContinuationHistory::new(),
            counter_moves: CounterMoveHistory::new(),
        })
    }

    /// 全履歴をクリア（新規対局時）
    pub fn clear(&mut self) {
        self.main_history.clear();
        self.low_ply_history.clear();
        self.capture_history.clear();
        self.continuation_history.clear();
        self.counter_moves.clear();
    }
}

// =============================================================================
// ボーナス計算
// =============================================================================

/// History更新用のボーナスを計算
#[inline]
pub fn stat_bonus(depth: Depth) -> i32 {
    if depth > 14 {
        73
    } else {
        6 * depth * depth + 229 * depth - 215
    }
}

// =============================================================================
// テスト
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_entry_default() {
        let entry = StatsEntry::<1000>::default();
        assert_eq!(entry.get(), 0);
    }

    #[test]
    fn test_stats_entry_update_convergence() {
        let mut entry = StatsEntry::<1000>::default();

        // 繰り返し更新してもDを超えない
        for _ in 0..100 {
            entry.update(1000);
        }
        assert!(entry.get() <= 1000);
        assert!(entry.get() > 900);
    }

    #[test]
    fn test_stats_entry_update_negative() {
        let mut entry = StatsEntry::<1000>::default();
        for _ in 0..100 {
            entry.update(-1000);
        }
        assert!(entry.get() >= -1000);
        assert!(entry.get() < -900);
    }

    #[test]
    fn test_stats_entry_bounded_for_any_bonus() {
        let mut entry = StatsEntry::<7183>::default();
        for bonus in [-100_000, -7183, -1, 0, 1, 5000, 7183, 100_000] {
            entry.update(bonus);
            assert!(entry.get().abs() <= 7183);
        }
    }

    #[test]
    fn test_butterfly_history() {
        let mut history = ButterflyHistory::new();
        let mv = Move::new(Square::E2, Square::E4);

        assert_eq!(history.get(Color::White, mv), 0);
        history.update(Color::White, mv, 100);
        assert!(history.get(Color::White, mv) > 0);
        assert_eq!(history.get(Color::Black, mv), 0);
    }

    #[test]
    fn test_low_ply_history_age() {
        let mut history = LowPlyHistory::new();
        let mv = Move::new(Square::G1, Square::F3);

        history.update(2, mv, 1000);
        let v = history.get(2, mv);
        assert!(v > 0);

        history.age();
        assert_eq!(history.get(0, mv), v);
        assert_eq!(history.get(2, mv), 0);
        assert_eq!(history.get(MAX_LPH, mv), 0);
    }

    #[test]
    fn test_capture_history() {
        let mut history = CapturePieceToHistory::new();
        let pc = Piece::new(Color::White, Role::Knight);

        history.update(pc, Square::D5, Some(Role::Pawn), 500);
        assert!(history.get(pc, Square::D5, Some(Role::Pawn)) > 0);
        assert_eq!(history.get(pc, Square::D5, Some(Role::Rook)), 0);
    }

    #[test]
    fn test_continuation_history_sentinel_stays_zero() {
        let history = ContinuationHistory::new();
        let sentinel = ContHistKey::default();
        let pc = Piece::new(Color::White, Role::Queen);
        assert_eq!(history.table(sentinel).get(pc, Square::H8), 0);
    }

    #[test]
    fn test_counter_move_history() {
        let mut history = CounterMoveHistory::new();
        let mv = Move::new(Square::B8, Square::C6);
        let pc = Piece::new(Color::White, Role::Pawn);

        assert!(history.get(pc, Square::E4).is_none());
        history.set(pc, Square::E4, mv);
        assert_eq!(history.get(pc, Square::E4), mv);
    }

    #[test]
    fn test_stat_bonus() {
        assert_eq!(stat_bonus(1), 6 + 229 - 215);
        assert_eq!(stat_bonus(14), 6 * 196 + 229 * 14 - 215);
        assert_eq!(stat_bonus(15), 73);
        assert_eq!(stat_bonus(100), 73);
    }
}
