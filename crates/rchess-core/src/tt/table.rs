//! TranspositionTable本体
//!
//! - Cluster: 3エントリのグループ（64バイト = キャッシュライン）
//! - probe/write操作（ロックフリー、書き込みは生ポインタ経由）

use std::sync::atomic::{AtomicU8, Ordering};

use super::entry::{TTData, TTEntry};
use super::{CLUSTER_SIZE, GENERATION_DELTA};
use crate::types::{Bound, Depth, Move, Value};

/// クラスター構造
/// 同じハッシュインデックスに対して複数のエントリを持つ
/// 16bytes × 3 + 16 = 64 bytes（キャッシュライン）
#[repr(C, align(64))]
struct Cluster {
    entries: [TTEntry; CLUSTER_SIZE],
    _padding: [u8; 16],
}

impl Cluster {
    const fn new() -> Self {
        Self {
            entries: [TTEntry::new(); CLUSTER_SIZE],
            _padding: [0; 16],
        }
    }
}

// クラスターは64バイトであることを保証（キャッシュラインサイズ）
const _: () = assert!(std::mem::size_of::<Cluster>() == 64);

/// 置換表
pub struct TranspositionTable {
    /// クラスターの配列
    table: Vec<Cluster>,
    /// 世代カウンター（下位3bitは使用しない）
    generation8: AtomicU8,
}

// 生ポインタ経由の並行書き込みを許容する（読み手はキーを再検証する）
unsafe impl Sync for TranspositionTable {}
unsafe impl Send for TranspositionTable {}

impl TranspositionTable {
    /// 新しい置換表を作成（サイズはMB単位）
    pub fn new(mb_size: usize) -> Self {
        let cluster_count = (mb_size * 1024 * 1024 / std::mem::size_of::<Cluster>()).max(2);
        let mut table = Vec::with_capacity(cluster_count);
        table.resize_with(cluster_count, Cluster::new);
        Self {
            table,
            generation8: AtomicU8::new(0),
        }
    }

    /// サイズを変更
    pub fn resize(&mut self, mb_size: usize) {
        let new_count = (mb_size * 1024 * 1024 / std::mem::size_of::<Cluster>()).max(2);
        if new_count != self.table.len() {
            self.table = Vec::new();
            self.table.reserve_exact(new_count);
            self.table.resize_with(new_count, Cluster::new);
        }
    }

    /// クリア
    pub fn clear(&mut self) {
        self.generation8.store(0, Ordering::Relaxed);
        for cluster in self.table.iter_mut() {
            *cluster = Cluster::new();
        }
    }

    /// 新しい探索を開始（世代を進める）
    pub fn new_search(&self) {
        self.generation8.fetch_add(GENERATION_DELTA, Ordering::Relaxed);
    }

    /// 現在の世代を取得
    #[inline]
    pub fn generation(&self) -> u8 {
        self.generation8.load(Ordering::Relaxed)
    }

    /// 置換表を検索
    ///
    /// ヒットしなくても置換候補を指す書き込み用ポインタを必ず返す。
    /// ミス時の `data` は置換候補のスナップショットであり、書き込み
    /// 経路以外では意味を持たない。
    pub fn probe(&self, key: u64) -> ProbeResult {
        let cluster = self.first_entry(key);

        for entry in &cluster.entries {
            if entry.key() == key {
                let data = entry.read();
                // 引き裂き読み対策: 読み取り後にキーを再検証する
                if entry.key() != key {
                    continue;
                }
                return ProbeResult {
                    found: entry.is_occupied(),
                    data,
                    writer: entry as *const _ as *mut TTEntry,
                };
            }
        }

        // 置換するエントリを選択（depth8 - relative_age が最小のもの）
        let gen8 = self.generation();
        let mut replace = &cluster.entries[0] as *const _ as *mut TTEntry;
        let mut min_value = i32::MAX;

        for entry in &cluster.entries {
            let value = entry.depth8() as i32 - entry.relative_age(gen8) as i32;
            if value < min_value {
                min_value = value;
                replace = entry as *const _ as *mut TTEntry;
            }
        }

        ProbeResult {
            found: false,
            data: TTData::EMPTY,
            writer: replace,
        }
    }

    /// 置換表の使用率を1000分率で返す
    pub fn hashfull(&self) -> i32 {
        let gen8 = self.generation();
        let sample = 1000.min(self.table.len());
        let mut count = 0;
        for cluster in self.table.iter().take(sample) {
            for entry in &cluster.entries {
                if entry.is_occupied() && entry.relative_age(gen8) == 0 {
                    count += 1;
                }
            }
        }
        count * 1000 / (sample as i32 * CLUSTER_SIZE as i32)
    }

    /// クラスターインデックスを計算（key × count / 2^64）
    #[inline]
    fn cluster_index(&self, key: u64) -> usize {
        ((key as u128 * self.table.len() as u128) >> 64) as usize
    }

    #[inline]
    fn first_entry(&self, key: u64) -> &Cluster {
        &self.table[self.cluster_index(key)]
    }

    /// 指定キーのクラスターをプリフェッチ
    #[inline]
    pub fn prefetch(&self, key: u64) {
        let cluster = self.first_entry(key);

        #[cfg(target_arch = "x86_64")]
        unsafe {
            use std::arch::x86_64::_mm_prefetch;
            _mm_prefetch(cluster as *const _ as *const i8, 3); // _MM_HINT_T0
        }

        #[cfg(not(target_arch = "x86_64"))]
        let _ = cluster;
    }
}

/// probe結果
pub struct ProbeResult {
    /// ヒットしたか
    pub found: bool,
    /// 読み取ったデータ
    pub data: TTData,
    /// 書き込み用エントリ
    writer: *mut TTEntry,
}

impl ProbeResult {
    /// エントリに書き込む
    ///
    /// # Safety
    /// writerポインタは probe() で取得した有効なポインタであり、
    /// テーブルが生存している間のみ使用できる。
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        key: u64,
        value: Value,
        is_pv: bool,
        bound: Bound,
        depth: Depth,
        mv: Move,
        eval: Value,
        generation8: u8,
    ) {
        // SAFETY: writerはprobe()で取得した有効なポインタ
        unsafe {
            (*self.writer).save(key, value, is_pv, bound, depth, mv, eval, generation8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tt_new() {
        let tt = TranspositionTable::new(1);
        assert!(tt.table.len() >= 2);
        assert_eq!(tt.generation(), 0);
    }

    #[test]
    fn test_tt_new_search() {
        let tt = TranspositionTable::new(1);
        tt.new_search();
        assert_eq!(tt.generation(), GENERATION_DELTA);
        tt.new_search();
        assert_eq!(tt.generation(), GENERATION_DELTA * 2);
    }

    #[test]
    fn test_tt_probe_and_write() {
        let tt = TranspositionTable::new(1);
        let key = 0xdead_beef_cafe_f00du64;

        let probe1 = tt.probe(key);
        assert!(!probe1.found);

        probe1.write(
            key,
            Value::new(50),
            true,
            Bound::Exact,
            10,
            Move::NONE,
            Value::ZERO,
            tt.generation(),
        );

        let probe2 = tt.probe(key);
        assert!(probe2.found);
        assert_eq!(probe2.data.value.raw(), 50);
        assert_eq!(probe2.data.depth, 10);
        assert_eq!(probe2.data.bound, Bound::Exact);
        assert!(probe2.data.is_pv);
    }

    #[test]
    fn test_tt_replacement_prefers_shallow_and_old() {
        let tt = TranspositionTable::new(1);
        // 同一クラスターに落ちる3キーを探す
        let base = 0x1111_2222_3333_4444u64;
        let idx = tt.cluster_index(base);
        let mut keys = vec![base];
        let mut k = base;
        while keys.len() < 4 {
            k = k.wrapping_add(0x9e37_79b9_7f4a_7c15);
            if tt.cluster_index(k) == idx {
                keys.push(k);
            }
        }

        // 3エントリを深さ違いで埋める
        for (i, &key) in keys[..3].iter().enumerate() {
            tt.probe(key).write(
                key,
                Value::new(i as i32),
                false,
                Bound::Lower,
                10 + 4 * i as Depth,
                Move::NONE,
                Value::ZERO,
                tt.generation(),
            );
        }
        // 4つ目のキーは最浅エントリを置換する
        tt.probe(keys[3]).write(
            keys[3],
            Value::new(99),
            false,
            Bound::Lower,
            30,
            Move::NONE,
            Value::ZERO,
            tt.generation(),
        );

        assert!(tt.probe(keys[3]).found);
        // 最浅（keys[0], depth=10）が追い出されている
        assert!(!tt.probe(keys[0]).found);
        assert!(tt.probe(keys[1]).found);
        assert!(tt.probe(keys[2]).found);
    }

    #[test]
    fn test_tt_clear_and_hashfull() {
        let mut tt = TranspositionTable::new(1);
        assert_eq!(tt.hashfull(), 0);

        let key = 0xaaaa_bbbb_cccc_ddddu64;
        tt.probe(key).write(
            key,
            Value::new(1),
            false,
            Bound::Lower,
            10,
            Move::NONE,
            Value::ZERO,
            tt.generation(),
        );
        tt.clear();
        assert!(!tt.probe(key).found);
        assert_eq!(tt.hashfull(), 0);
    }
}
