//! Breadcrumbs（スレッド衝突検出）
//!
//! ルート付近のノードに「どのスレッドが探索中か」の目印を残す。
//! 別スレッドが同じ局面に入ったことを検出したら、そのノードの LMR を
//! 弱める側のヒントとして使う。Relaxed な原子操作のみで、競合しても
//! 失われるのはヒントだけ。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// セル数（2のべき乗）
const BREADCRUMB_SIZE: usize = 1024;

/// 目印を残す最大ply
const MARK_MAX_PLY: i32 = 8;

struct Breadcrumb {
    /// 0 = 空き、それ以外は thread_id + 1
    thread: AtomicUsize,
    key: AtomicU64,
}

static BREADCRUMBS: [Breadcrumb; BREADCRUMB_SIZE] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: Breadcrumb = Breadcrumb {
        thread: AtomicUsize::new(0),
        key: AtomicU64::new(0),
    };
    [EMPTY; BREADCRUMB_SIZE]
};

/// ノード滞在中の目印。move ループ突入時に作り、抜けるときに Drop で解放する。
pub struct ThreadHolding {
    location: Option<&'static Breadcrumb>,
    other_thread: bool,
    owning: bool,
}

impl ThreadHolding {
    pub fn new(thread_id: usize, pos_key: u64, ply: i32) -> Self {
        let mut holding = Self {
            location: None,
            other_thread: false,
            owning: false,
        };
        if ply >= MARK_MAX_PLY {
            return holding;
        }

        let cell = &BREADCRUMBS[(pos_key as usize) & (BREADCRUMB_SIZE - 1)];
        holding.location = Some(cell);

        // 空きなら自分の目印を置き、他スレッドの同一キーなら衝突フラグを立てる
        let tid = thread_id + 1;
        let tmp = cell.thread.load(Ordering::Relaxed);
        if tmp == 0 {
            cell.thread.store(tid, Ordering::Relaxed);
            cell.key.store(pos_key, Ordering::Relaxed);
            holding.owning = true;
        } else if tmp != tid && cell.key.load(Ordering::Relaxed) == pos_key {
            holding.other_thread = true;
        }
        holding
    }

    /// 別スレッドが同じ局面を探索中か
    #[inline]
    pub fn marked(&self) -> bool {
        self.other_thread
    }
}

impl Drop for ThreadHolding {
    fn drop(&mut self) {
        if self.owning {
            if let Some(cell) = self.location {
                cell.thread.store(0, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holding_claims_and_releases() {
        let key = 0x1234_5678_0000_0042u64;
        {
            let h = ThreadHolding::new(0, key, 0);
            assert!(!h.marked());
            // 同キー別スレッドは衝突を検出
            let other = ThreadHolding::new(1, key, 0);
            assert!(other.marked());
            // 同キー同スレッドは検出しない
            let same = ThreadHolding::new(0, key, 0);
            assert!(!same.marked());
        }
        // 解放後は再度所有できる
        let h = ThreadHolding::new(2, key, 0);
        assert!(!h.marked());
        drop(h);
        let cell = &BREADCRUMBS[(key as usize) & (BREADCRUMB_SIZE - 1)];
        assert_eq!(cell.thread.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_holding_deep_ply_is_noop() {
        let key = 0x9999_0000_0000_0999u64;
        let h = ThreadHolding::new(0, key, MARK_MAX_PLY);
        assert!(!h.marked());
        drop(h);
        // 目印は置かれていない
        let other = ThreadHolding::new(1, key, 0);
        assert!(!other.marked());
    }
}
