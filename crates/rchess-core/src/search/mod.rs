//! 探索エンジン
//!
//! - `alpha_beta` / `qsearch`: 再帰探索本体
//! - `history` / `movepicker` / `breadcrumbs`: 並べ替えヒューリスティクス
//! - `engine`: 反復深化ドライバと Aspiration Window
//! - `thread`: Lazy SMP のスレッドプール
//! - `time_manager` / `limits`: 時間管理
//! - `tb`: Syzygy テーブルベース

pub mod alpha_beta;
pub mod breadcrumbs;
pub mod engine;
pub mod history;
pub mod limits;
pub mod movepicker;
pub mod pruning;
pub mod qsearch;
pub mod tb;
pub mod thread;
pub mod time_manager;
pub mod types;

pub use alpha_beta::SearchWorker;
pub use engine::{Search, SearchInfo, SearchResult};
pub use limits::LimitsType;
pub use movepicker::MovePicker;
pub use tb::SyzygyTb;
pub use thread::ThreadPool;
pub use time_manager::TimeManagement;
pub use types::{RootMove, RootMoves};

use crate::types::Depth;

/// エンジンオプションのスナップショット
///
/// `go` の開始時に固定され、探索中は不変。
#[derive(Clone, Debug)]
pub struct SearchOptions {
    /// 同時に読むルートPVの本数
    pub multi_pv: usize,
    /// MultiPV を 2^n 本に広げるタクティカルモード
    pub tactical: u32,
    /// 静止探索の stand pat に乗せるノイズの幅（0 = 無効）
    pub variety: i32,
    /// 動的コンテンポの係数
    pub dynamic_contempt: i32,
    /// info 行に WDL を付ける
    pub show_wdl: bool,
    /// `clear` で置換表を消さない
    pub never_clear_hash: bool,
    /// 50手ルールを考慮した TB スコアリング
    pub syzygy_50_move_rule: bool,
    /// TB を引く最小深さ
    pub syzygy_probe_depth: Depth,
    /// TB を引く最大駒数
    pub syzygy_probe_limit: u32,
    /// 着手送信までのマージン（ミリ秒）
    pub move_overhead: i64,
    /// Ponder を許可（時間配分が変わる）
    pub ponder_enabled: bool,
    /// 枝刈りなしで読むスレッド数（helper の先頭から割り当て）
    pub full_depth_threads: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            multi_pv: 1,
            tactical: 0,
            variety: 0,
            dynamic_contempt: 21,
            show_wdl: false,
            never_clear_hash: false,
            syzygy_50_move_rule: true,
            syzygy_probe_depth: 1,
            syzygy_probe_limit: 7,
            move_overhead: 10,
            ponder_enabled: false,
            full_depth_threads: 0,
        }
    }
}
