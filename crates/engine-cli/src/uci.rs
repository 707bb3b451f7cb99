// UCI protocol loop.
//
// stdin is read on the main thread; the engine runs on a dedicated thread
// that owns the Search and the current Position. `stop` and `ponderhit`
// bypass the command queue through the shared atomic flags so that they
// take effect while a `go` is still running.

use std::io::BufRead;
use std::thread;

use anyhow::Result;
use crossbeam_channel::unbounded;

use rchess_core::perft::perft_divide;
use rchess_core::position::Position;
use rchess_core::search::{LimitsType, Search, SearchOptions};

const ENGINE_NAME: &str = "rchess";
const ENGINE_AUTHOR: &str = "SH11235";

enum Command {
    Uci,
    IsReady,
    NewGame,
    SetOption { name: String, value: String },
    Position(Box<Position>),
    Go(Box<LimitsType>),
    Perft(i32),
    Quit,
}

fn send(tx: &crossbeam_channel::Sender<Command>, cmd: Command) {
    // Failure here only means the engine thread is already gone.
    let _ = tx.send(cmd);
}

pub fn run(threads: usize, hash_mb: usize) -> Result<()> {
    let (tx, rx) = unbounded::<Command>();

    let mut search = Search::new(hash_mb);
    search.set_num_threads(threads);
    let stop = search.stop_flag();
    let ponder = search.ponder_flag();

    let engine = thread::Builder::new()
        .name("engine".into())
        .spawn(move || engine_loop(search, rx))?;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let cmd = tokens.next().unwrap_or_default();

        match cmd {
            "uci" => send(&tx, Command::Uci),
            "isready" => send(&tx, Command::IsReady),
            "ucinewgame" => send(&tx, Command::NewGame),
            "setoption" => {
                if let Some((name, value)) = parse_setoption(line) {
                    send(&tx, Command::SetOption { name, value });
                }
            }
            "position" => match parse_position(line) {
                Ok(pos) => send(&tx, Command::Position(Box::new(pos))),
                Err(e) => log::warn!("{e}"),
            },
            "go" => {
                let rest: Vec<&str> = tokens.collect();
                if rest.first() == Some(&"perft") {
                    let depth = rest.get(1).and_then(|d| d.parse().ok()).unwrap_or(1);
                    send(&tx, Command::Perft(depth));
                } else {
                    send(&tx, Command::Go(Box::new(parse_go(&rest))));
                }
            }
            "stop" => stop.store(true, std::sync::atomic::Ordering::SeqCst),
            "ponderhit" => ponder.store(false, std::sync::atomic::Ordering::SeqCst),
            "quit" => {
                stop.store(true, std::sync::atomic::Ordering::SeqCst);
                send(&tx, Command::Quit);
                break;
            }
            _ => log::debug!("unknown command: {line}"),
        }
    }

    drop(tx);
    let _ = engine.join();
    Ok(())
}

fn engine_loop(mut search: Search, rx: crossbeam_channel::Receiver<Command>) {
    let mut pos = Position::new();
    let mut options = SearchOptions::default();
    let mut pending_hash: Option<usize> = None;
    let mut pending_threads: Option<usize> = None;

    while let Ok(cmd) = rx.recv() {
        match cmd {
            Command::Uci => {
                println!("id name {ENGINE_NAME}");
                println!("id author {ENGINE_AUTHOR}");
                println!("option name Hash type spin default 16 min 1 max 33554432");
                println!("option name Threads type spin default 1 min 1 max 512");
                println!("option name MultiPV type spin default 1 min 1 max 500");
                println!("option name Ponder type check default false");
                println!("option name Move Overhead type spin default 10 min 0 max 5000");
                println!("option name NeverClearHash type check default false");
                println!("option name UCI_ShowWDL type check default false");
                println!("option name SyzygyPath type string default <empty>");
                println!("option name Syzygy50MoveRule type check default true");
                println!("option name SyzygyProbeDepth type spin default 1 min 1 max 100");
                println!("option name SyzygyProbeLimit type spin default 7 min 0 max 7");
                println!("option name Variety type spin default 0 min 0 max 40");
                println!("option name multiPV Search type spin default 0 min 0 max 5");
                println!("option name Dynamic Contempt type spin default 21 min -100 max 100");
                println!("option name Full Depth Threads type spin default 0 min 0 max 512");
                println!("uciok");
            }
            Command::IsReady => {
                if let Some(mb) = pending_hash.take() {
                    search.resize_tt(mb);
                }
                if let Some(n) = pending_threads.take() {
                    search.set_num_threads(n);
                }
                search.set_options(options.clone());
                println!("readyok");
            }
            Command::NewGame => {
                search.set_options(options.clone());
                search.clear();
            }
            Command::SetOption { name, value } => {
                apply_option(
                    &mut search,
                    &mut options,
                    &mut pending_hash,
                    &mut pending_threads,
                    &name,
                    &value,
                );
            }
            Command::Position(p) => pos = *p,
            Command::Go(limits) => {
                search.set_options(options.clone());
                let result = search.go(&mut pos, *limits, |info| {
                    println!("{}", info.to_uci_string());
                });
                let mut line = format!("bestmove {}", result.best_move.to_uci());
                if result.ponder_move.is_some() {
                    line.push_str(&format!(" ponder {}", result.ponder_move.to_uci()));
                }
                println!("{line}");
            }
            Command::Perft(depth) => {
                let started = std::time::Instant::now();
                let divide = perft_divide(&mut pos, depth);
                let mut total = 0u64;
                for (m, n) in &divide {
                    println!("{}: {}", m.to_uci(), n);
                    total += n;
                }
                println!();
                println!("Nodes searched: {total}");
                log::info!("perft {} in {:?}", depth, started.elapsed());
            }
            Command::Quit => break,
        }
    }
}

fn apply_option(
    search: &mut Search,
    options: &mut SearchOptions,
    pending_hash: &mut Option<usize>,
    pending_threads: &mut Option<usize>,
    name: &str,
    value: &str,
) {
    match name.to_ascii_lowercase().as_str() {
        "hash" => *pending_hash = value.parse().ok(),
        "threads" => *pending_threads = value.parse().ok(),
        "multipv" => options.multi_pv = value.parse().unwrap_or(1),
        "ponder" => options.ponder_enabled = value == "true",
        "move overhead" => options.move_overhead = value.parse().unwrap_or(10),
        "neverclearhash" => options.never_clear_hash = value == "true",
        "uci_showwdl" => options.show_wdl = value == "true",
        "syzygypath" => {
            if !value.is_empty() && value != "<empty>" {
                match search.set_tb_path(value) {
                    Ok(count) => log::info!("loaded {count} syzygy tables"),
                    Err(e) => log::warn!("syzygy path {value}: {e}"),
                }
            }
        }
        "syzygy50moverule" => options.syzygy_50_move_rule = value == "true",
        "syzygyprobedepth" => options.syzygy_probe_depth = value.parse().unwrap_or(1),
        "syzygyprobelimit" => options.syzygy_probe_limit = value.parse().unwrap_or(7),
        "variety" => options.variety = value.parse().unwrap_or(0),
        "multipv search" => options.tactical = value.parse().unwrap_or(0),
        "dynamic contempt" => options.dynamic_contempt = value.parse().unwrap_or(21),
        "full depth threads" => options.full_depth_threads = value.parse().unwrap_or(0),
        _ => log::debug!("unknown option: {name}"),
    }
}

fn parse_setoption(line: &str) -> Option<(String, String)> {
    // setoption name <name...> [value <value...>]
    let rest = line.strip_prefix("setoption")?.trim();
    let rest = rest.strip_prefix("name")?.trim();
    match rest.split_once(" value ") {
        Some((name, value)) => Some((name.trim().to_string(), value.trim().to_string())),
        None => Some((rest.to_string(), String::new())),
    }
}

fn parse_position(line: &str) -> Result<Position> {
    let rest = line.strip_prefix("position").unwrap_or(line).trim();

    let (mut pos, moves_part) = if let Some(after) = rest.strip_prefix("startpos") {
        (Position::new(), after.trim())
    } else if let Some(after) = rest.strip_prefix("fen") {
        let after = after.trim();
        let (fen, moves) = match after.find(" moves ") {
            Some(idx) => (&after[..idx], &after[idx..]),
            None => (after, ""),
        };
        (
            Position::from_fen(fen.trim()).map_err(|e| anyhow::anyhow!("{e}"))?,
            moves,
        )
    } else {
        anyhow::bail!("malformed position command: {line}");
    };

    if let Some(moves) = moves_part.trim().strip_prefix("moves") {
        for token in moves.split_whitespace() {
            let found = pos.legal_moves().into_iter().find(|m| m.to_uci() == token);
            match found {
                Some(m) => pos.do_move(m),
                None => anyhow::bail!("illegal move in position command: {token}"),
            }
        }
    }
    Ok(pos)
}

fn parse_go(tokens: &[&str]) -> LimitsType {
    let mut limits = LimitsType::default();
    let mut iter = tokens.iter();

    fn number(iter: &mut std::slice::Iter<'_, &str>) -> i64 {
        iter.next().and_then(|t| t.parse::<i64>().ok()).unwrap_or(0)
    }

    while let Some(&token) = iter.next() {
        match token {
            "wtime" => limits.time[0] = number(&mut iter),
            "btime" => limits.time[1] = number(&mut iter),
            "winc" => limits.inc[0] = number(&mut iter),
            "binc" => limits.inc[1] = number(&mut iter),
            "movestogo" => limits.movestogo = number(&mut iter) as i32,
            "depth" => limits.depth = number(&mut iter) as i32,
            "nodes" => limits.nodes = number(&mut iter) as u64,
            "movetime" => limits.movetime = number(&mut iter),
            "mate" => limits.mate = number(&mut iter) as i32,
            "infinite" => limits.infinite = true,
            "ponder" => limits.ponder = true,
            "searchmoves" => {
                // Remaining tokens are move strings; resolved against the
                // position at go time by matching the UCI text.
                for &mv in iter.by_ref() {
                    if let Some(parsed) = parse_uci_move_token(mv) {
                        limits.search_moves.push(parsed);
                    }
                }
            }
            _ => {}
        }
    }
    limits
}

/// Parse a bare UCI move string into the 16-bit encoding without board
/// context (castling arrives as a king move, which matches the internal
/// encoding).
fn parse_uci_move_token(s: &str) -> Option<rchess_core::Move> {
    use shakmaty::{Role, Square};

    if s.len() < 4 {
        return None;
    }
    let from: Square = s[0..2].parse().ok()?;
    let to: Square = s[2..4].parse().ok()?;
    if let Some(promo) = s.chars().nth(4) {
        let role = match promo {
            'n' => Role::Knight,
            'b' => Role::Bishop,
            'r' => Role::Rook,
            'q' => Role::Queen,
            _ => return None,
        };
        Some(rchess_core::Move::new_promotion(from, to, role))
    } else {
        Some(rchess_core::Move::new(from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setoption() {
        let (name, value) = parse_setoption("setoption name Hash value 64").unwrap();
        assert_eq!(name, "Hash");
        assert_eq!(value, "64");

        let (name, value) = parse_setoption("setoption name Dynamic Contempt value -10").unwrap();
        assert_eq!(name, "Dynamic Contempt");
        assert_eq!(value, "-10");

        let (name, value) = parse_setoption("setoption name NeverClearHash").unwrap();
        assert_eq!(name, "NeverClearHash");
        assert!(value.is_empty());
    }

    #[test]
    fn test_parse_go_clock() {
        let limits = parse_go(&["wtime", "60000", "btime", "55000", "winc", "1000", "binc", "900"]);
        assert_eq!(limits.time, [60_000, 55_000]);
        assert_eq!(limits.inc, [1_000, 900]);
        assert!(limits.use_time_management());
    }

    #[test]
    fn test_parse_go_fixed() {
        let limits = parse_go(&["depth", "12"]);
        assert_eq!(limits.depth, 12);
        assert!(!limits.use_time_management());

        let limits = parse_go(&["movetime", "2500"]);
        assert_eq!(limits.movetime, 2_500);

        let limits = parse_go(&["infinite"]);
        assert!(limits.infinite);
    }

    #[test]
    fn test_parse_position_startpos_moves() {
        let pos = parse_position("position startpos moves e2e4 e7e5 g1f3").unwrap();
        assert_eq!(pos.game_ply(), 3);
        assert!(parse_position("position startpos moves e2e5").is_err());
    }

    #[test]
    fn test_parse_position_fen() {
        let pos =
            parse_position("position fen 4k3/8/4K3/8/8/8/8/7R w - - 0 1 moves h1h8").unwrap();
        assert!(pos.in_check());
    }
}
