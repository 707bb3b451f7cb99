//! rchess-core: Alpha-Beta チェス探索コア
//!
//! 盤面・合法手生成は shakmaty に委ね、このクレートは探索
//! （反復深化、置換表、並べ替えヒューリスティクス、Lazy SMP）と
//! その周辺だけを実装する。
//!
//! ```no_run
//! use rchess_core::position::Position;
//! use rchess_core::search::{LimitsType, Search};
//!
//! let mut search = Search::new(16);
//! let mut pos = Position::new();
//! let limits = LimitsType {
//!     depth: 8,
//!     ..Default::default()
//! };
//! let result = search.go(&mut pos, limits, |info| {
//!     println!("{}", info.to_uci_string());
//! });
//! println!("bestmove {}", result.best_move.to_uci());
//! ```

pub mod eval;
pub mod perft;
pub mod position;
pub mod search;
pub mod tt;
pub mod types;

pub use position::Position;
pub use search::{LimitsType, Search, SearchInfo, SearchOptions, SearchResult};
pub use types::{Bound, Depth, Move, Value};
