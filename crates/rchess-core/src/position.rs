// Board collaborator adapter over shakmaty.
//
// The search only sees this surface: do/undo (copy-make with a StateInfo
// stack), zobrist keys, rule-50, repetition and cycle detection, checks,
// SEE, and a handful of cheap queries. Castling is encoded as the king
// move (e1g1 style) so that from_to indexing stays within 12 bits.

use shakmaty::fen::Fen;
use shakmaty::zobrist::{Zobrist64, ZobristHash};
use shakmaty::{
    attacks, Bitboard, CastlingMode, CastlingSide, Chess, Color, EnPassantMode, File,
    Move as SmMove, Position as _, Role, Square,
};

use crate::types::{piece_value_mg, Move, MoveKind, Piece, Value, PIECE_VALUE_MG};

/// Everything needed to take back one move.
struct StateInfo {
    board: Chess,
    key: u64,
    captured: Option<Role>,
}

/// Search-facing position.
pub struct Position {
    board: Chess,
    key: u64,
    states: Vec<StateInfo>,
    /// Keys of all prior positions (game history plus search path),
    /// excluding the current one. Used for repetition detection.
    keys: Vec<u64>,
    base_game_ply: i32,
}

#[derive(Debug)]
pub struct FenError(pub String);

impl std::fmt::Display for FenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid fen: {}", self.0)
    }
}

impl std::error::Error for FenError {}

impl Clone for Position {
    fn clone(&self) -> Self {
        // Helper threads get an independent copy rooted at the current
        // position; the undo stack does not travel with it.
        let mut p = Position {
            board: self.board.clone(),
            key: self.key,
            states: Vec::new(),
            keys: self.keys.clone(),
            base_game_ply: self.game_ply(),
        };
        p.states.reserve(64);
        p
    }
}

fn zobrist(board: &Chess) -> u64 {
    let h: Zobrist64 = board.zobrist_hash(EnPassantMode::Legal);
    h.0
}

impl Position {
    /// Starting position.
    pub fn new() -> Position {
        let board = Chess::default();
        let key = zobrist(&board);
        Position {
            board,
            key,
            states: Vec::new(),
            keys: Vec::new(),
            base_game_ply: 0,
        }
    }

    /// Position from a FEN string.
    pub fn from_fen(fen: &str) -> Result<Position, FenError> {
        let parsed: Fen = fen.parse().map_err(|_| FenError(fen.to_string()))?;
        let board: Chess = parsed
            .into_position(CastlingMode::Standard)
            .map_err(|_| FenError(fen.to_string()))?;
        let base_game_ply = 2 * (board.fullmoves().get() as i32 - 1)
            + if board.turn() == Color::Black { 1 } else { 0 };
        let key = zobrist(&board);
        Ok(Position {
            board,
            key,
            states: Vec::new(),
            keys: Vec::new(),
            base_game_ply,
        })
    }

    #[inline]
    pub fn board(&self) -> &Chess {
        &self.board
    }

    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    #[inline]
    pub fn side_to_move(&self) -> Color {
        self.board.turn()
    }

    #[inline]
    pub fn rule50_count(&self) -> i32 {
        self.board.halfmoves() as i32
    }

    #[inline]
    pub fn game_ply(&self) -> i32 {
        self.base_game_ply + self.states.len() as i32
    }

    #[inline]
    pub fn in_check(&self) -> bool {
        self.board.is_check()
    }

    #[inline]
    pub fn checkers(&self) -> Bitboard {
        self.board.checkers()
    }

    /// Piece captured by the most recent `do_move`, if any.
    #[inline]
    pub fn captured_piece(&self) -> Option<Role> {
        self.states.last().and_then(|st| st.captured)
    }

    #[inline]
    pub fn piece_count(&self) -> u32 {
        self.board.board().occupied().count() as u32
    }

    #[inline]
    pub fn piece_count_of(&self, color: Color) -> u32 {
        self.board.board().by_color(color).count() as u32
    }

    #[inline]
    pub fn has_castling_rights(&self) -> bool {
        !self.board.castles().is_empty()
    }

    /// Piece on a square, as the history-table piece representation.
    #[inline]
    pub fn piece_on(&self, sq: Square) -> Piece {
        match self.board.board().piece_at(sq) {
            Some(p) => Piece::new(p.color, p.role),
            None => Piece::NONE,
        }
    }

    /// Role on a square.
    #[inline]
    pub fn role_on(&self, sq: Square) -> Option<Role> {
        self.board.board().role_at(sq)
    }

    /// Piece that `m` would move.
    #[inline]
    pub fn moved_piece(&self, m: Move) -> Piece {
        self.piece_on(m.from_sq())
    }

    /// Non-pawn material for one side, on the midgame scale.
    pub fn non_pawn_material(&self, color: Color) -> i32 {
        let b = self.board.board();
        let side = b.by_color(color);
        let mut total = 0;
        for role in [Role::Knight, Role::Bishop, Role::Rook, Role::Queen] {
            total += (side & b.by_role(role)).count() as i32 * PIECE_VALUE_MG[role as usize - 1];
        }
        total
    }

    /// Is `m` a capture (including en passant)?
    #[inline]
    pub fn is_capture(&self, m: Move) -> bool {
        match m.kind() {
            MoveKind::EnPassant => true,
            MoveKind::Castling => false,
            _ => self.board.board().occupied().contains(m.to_sq()),
        }
    }

    /// Is `m` a capture or a promotion?
    #[inline]
    pub fn capture_or_promotion(&self, m: Move) -> bool {
        m.kind() == MoveKind::Promotion || self.is_capture(m)
    }

    // =========================================================================
    // Move list and conversion
    // =========================================================================

    fn encode(m: &SmMove) -> Move {
        match m {
            SmMove::Normal {
                from,
                to,
                promotion: Some(p),
                ..
            } => Move::new_promotion(*from, *to, *p),
            SmMove::Normal { from, to, .. } => Move::new(*from, *to),
            SmMove::EnPassant { from, to } => Move::new_en_passant(*from, *to),
            SmMove::Castle { king, rook } => {
                let file = if rook.file() > king.file() {
                    File::G
                } else {
                    File::C
                };
                Move::new_castling(*king, Square::from_coords(file, king.rank()))
            }
            _ => Move::NONE,
        }
    }

    /// Reconstruct the shakmaty move without scanning the legal-move list.
    /// The caller must pass a move that is legal here (picker output, or a
    /// TT move vetted through `is_legal`).
    fn decode(&self, m: Move) -> Option<SmMove> {
        if !m.is_ok() {
            return None;
        }
        let b = self.board.board();
        match m.kind() {
            MoveKind::Normal | MoveKind::Promotion => {
                let role = b.role_at(m.from_sq())?;
                Some(SmMove::Normal {
                    role,
                    from: m.from_sq(),
                    capture: b.role_at(m.to_sq()),
                    to: m.to_sq(),
                    promotion: m.promotion(),
                })
            }
            MoveKind::EnPassant => Some(SmMove::EnPassant {
                from: m.from_sq(),
                to: m.to_sq(),
            }),
            MoveKind::Castling => {
                let side = if m.to_sq().file() > m.from_sq().file() {
                    CastlingSide::KingSide
                } else {
                    CastlingSide::QueenSide
                };
                let rook = self.board.castles().rook(self.board.turn(), side)?;
                Some(SmMove::Castle {
                    king: m.from_sq(),
                    rook,
                })
            }
        }
    }

    /// All legal moves in the 16-bit encoding.
    pub fn legal_moves(&self) -> Vec<Move> {
        self.board.legal_moves().iter().map(Self::encode).collect()
    }

    /// Is `m` legal in the current position?
    #[inline]
    pub fn is_legal(&self, m: Move) -> bool {
        m.is_ok()
            && self
                .board
                .legal_moves()
                .iter()
                .any(|lm| Self::encode(lm) == m)
    }

    /// Does `m` give check?
    pub fn gives_check(&self, m: Move) -> bool {
        match self.decode(m) {
            Some(sm) => {
                let mut b = self.board.clone();
                b.play_unchecked(&sm);
                b.is_check()
            }
            None => false,
        }
    }

    // =========================================================================
    // Make / unmake
    // =========================================================================

    /// Play `m`. The move must be legal.
    pub fn do_move(&mut self, m: Move) {
        let sm = self.decode(m).expect("do_move: illegal move");
        let captured = match &sm {
            SmMove::EnPassant { .. } => Some(Role::Pawn),
            SmMove::Normal { capture, .. } => *capture,
            _ => None,
        };
        self.states.push(StateInfo {
            board: self.board.clone(),
            key: self.key,
            captured,
        });
        self.keys.push(self.key);
        self.board.play_unchecked(&sm);
        self.key = zobrist(&self.board);
    }

    /// Take back the last move (or null move).
    pub fn undo_move(&mut self) {
        let st = self.states.pop().expect("undo_move: empty stack");
        self.keys.pop();
        self.board = st.board;
        self.key = st.key;
    }

    /// Pass the turn. Only valid when not in check.
    pub fn do_null_move(&mut self) {
        debug_assert!(!self.in_check());
        self.states.push(StateInfo {
            board: self.board.clone(),
            key: self.key,
            captured: None,
        });
        self.keys.push(self.key);
        self.board = self
            .board
            .clone()
            .swap_turn()
            .expect("do_null_move: side to move in check");
        self.key = zobrist(&self.board);
    }

    pub fn undo_null_move(&mut self) {
        self.undo_move();
    }

    /// Zobrist key of the position after `m`, without making it.
    pub fn key_after(&self, m: Move) -> u64 {
        match self.decode(m) {
            Some(sm) => {
                let mut b = self.board.clone();
                b.play_unchecked(&sm);
                zobrist(&b)
            }
            None => self.key,
        }
    }

    // =========================================================================
    // Draw and cycle detection
    // =========================================================================

    /// Draw by repetition or the fifty-move rule.
    ///
    /// A repetition inside the search tree (closer than `ply`) counts
    /// immediately; one that straddles the root needs a second occurrence.
    pub fn is_draw(&self, ply: i32) -> bool {
        if self.rule50_count() >= 100 {
            return !self.in_check() || !self.board.legal_moves().is_empty();
        }

        let horizon = self.rule50_count().min(self.keys.len() as i32);
        let mut count = 0;
        let mut i = 4;
        while i <= horizon {
            let idx = self.keys.len() - i as usize;
            if self.keys[idx] == self.key {
                count += 1;
                if i < ply || count == 2 {
                    return true;
                }
            }
            i += 2;
        }
        false
    }

    /// Has the position already occurred on the current line? Used as the
    /// draw-cycle hint before probing the TT.
    pub fn has_game_cycle(&self, ply: i32) -> bool {
        let horizon = self.rule50_count().min(self.keys.len() as i32);
        let mut i = 4;
        while i <= horizon {
            let idx = self.keys.len() - i as usize;
            if self.keys[idx] == self.key {
                return true;
            }
            i += 2;
        }
        let _ = ply;
        false
    }

    // =========================================================================
    // Static exchange evaluation
    // =========================================================================

    fn attackers_to(&self, sq: Square, occupied: Bitboard) -> Bitboard {
        let b = self.board.board();
        let mut att = Bitboard::EMPTY;
        att |= attacks::pawn_attacks(Color::Black, sq) & b.by_color(Color::White) & b.pawns();
        att |= attacks::pawn_attacks(Color::White, sq) & b.by_color(Color::Black) & b.pawns();
        att |= attacks::knight_attacks(sq) & b.knights();
        att |= attacks::king_attacks(sq) & b.kings();
        att |= attacks::bishop_attacks(sq, occupied) & (b.bishops() | b.queens());
        att |= attacks::rook_attacks(sq, occupied) & (b.rooks() | b.queens());
        att & occupied
    }

    /// Static exchange evaluation: does the exchange sequence started by
    /// `m` keep at least `threshold`? Swap algorithm on midgame values.
    pub fn see_ge(&self, m: Move, threshold: Value) -> bool {
        if m.kind() != MoveKind::Normal {
            return Value::ZERO >= threshold;
        }

        let from = m.from_sq();
        let to = m.to_sq();
        let b = self.board.board();

        let mut swap = match b.role_at(to) {
            Some(r) => piece_value_mg(r),
            None => 0,
        } - threshold.raw();
        if swap < 0 {
            return false;
        }

        let moved = match b.role_at(from) {
            Some(r) => r,
            None => return false,
        };
        swap = piece_value_mg(moved) - swap;
        if swap <= 0 {
            return true;
        }

        let mut occupied = b.occupied() ^ Bitboard::from(from) ^ Bitboard::from(to);
        let mut stm = self.board.turn();
        let mut res: i32 = 1;

        loop {
            stm = !stm;
            let attackers = self.attackers_to(to, occupied);
            let stm_attackers = attackers & b.by_color(stm);
            if stm_attackers.is_empty() {
                break;
            }
            res ^= 1;

            // Least valuable attacker recaptures; the king only if the
            // opponent has no defender left.
            let mut picked = None;
            for role in [
                Role::Pawn,
                Role::Knight,
                Role::Bishop,
                Role::Rook,
                Role::Queen,
            ] {
                let bb = stm_attackers & b.by_role(role);
                if let Some(sq) = bb.first() {
                    picked = Some((role, sq));
                    break;
                }
            }
            match picked {
                Some((role, sq)) => {
                    swap = piece_value_mg(role) - swap;
                    if swap < res {
                        break;
                    }
                    occupied ^= Bitboard::from(sq);
                }
                None => {
                    // King capture: legal only if no enemy attacker remains.
                    let others = attackers & !b.by_color(stm);
                    return if others.is_empty() { res != 0 } else { res == 0 };
                }
            }
        }
        res != 0
    }

    // =========================================================================
    // King danger
    // =========================================================================

    /// Cheap king-safety predicate for pruning gates: two or more enemy
    /// non-pawn attackers to the king ring, or an enemy queen attacking it.
    pub fn king_danger(&self) -> bool {
        let us = self.board.turn();
        let b = self.board.board();
        let king = match b.king_of(us) {
            Some(sq) => sq,
            None => return false,
        };
        let ring = attacks::king_attacks(king) | Bitboard::from(king);
        let occupied = b.occupied();
        let them = b.by_color(!us);

        let mut attackers = 0;
        let mut queen_hit = false;
        for sq in them & !b.pawns() & !b.kings() {
            let role = b.role_at(sq).unwrap();
            let att = match role {
                Role::Knight => attacks::knight_attacks(sq),
                Role::Bishop => attacks::bishop_attacks(sq, occupied),
                Role::Rook => attacks::rook_attacks(sq, occupied),
                Role::Queen => attacks::queen_attacks(sq, occupied),
                _ => Bitboard::EMPTY,
            };
            if !(att & ring).is_empty() {
                attackers += 1;
                queen_hit |= role == Role::Queen;
            }
        }
        attackers >= 2 || queen_hit
    }
}

impl Default for Position {
    fn default() -> Self {
        Position::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(pos: &Position, uci: &str) -> Move {
        pos.legal_moves()
            .into_iter()
            .find(|m| m.to_uci() == uci)
            .unwrap_or_else(|| panic!("move {uci} not legal"))
    }

    #[test]
    fn test_startpos() {
        let pos = Position::new();
        assert_eq!(pos.side_to_move(), Color::White);
        assert_eq!(pos.rule50_count(), 0);
        assert_eq!(pos.game_ply(), 0);
        assert_eq!(pos.legal_moves().len(), 20);
        assert!(!pos.in_check());
    }

    #[test]
    fn test_do_undo_restores_key() {
        let mut pos = Position::new();
        let key0 = pos.key();
        let m = mv(&pos, "e2e4");
        pos.do_move(m);
        assert_ne!(pos.key(), key0);
        assert_eq!(pos.game_ply(), 1);
        pos.undo_move();
        assert_eq!(pos.key(), key0);
        assert_eq!(pos.game_ply(), 0);
    }

    #[test]
    fn test_null_move_roundtrip() {
        let mut pos = Position::new();
        let key0 = pos.key();
        pos.do_null_move();
        assert_eq!(pos.side_to_move(), Color::Black);
        assert_ne!(pos.key(), key0);
        pos.undo_null_move();
        assert_eq!(pos.key(), key0);
        assert_eq!(pos.side_to_move(), Color::White);
    }

    #[test]
    fn test_capture_and_captured_piece() {
        let mut pos = Position::from_fen("4k3/8/8/3p4/4P3/8/8/4K3 w - - 0 1").unwrap();
        let m = mv(&pos, "e4d5");
        assert!(pos.is_capture(m));
        assert!(pos.capture_or_promotion(m));
        pos.do_move(m);
        assert_eq!(pos.captured_piece(), Some(Role::Pawn));
    }

    #[test]
    fn test_gives_check() {
        let pos = Position::from_fen("4k3/8/4K3/8/8/8/8/7R w - - 0 1").unwrap();
        assert!(pos.gives_check(mv(&pos, "h1h8")));
        assert!(!pos.gives_check(mv(&pos, "h1h2")));
    }

    #[test]
    fn test_key_after_matches_do_move() {
        let mut pos = Position::new();
        let m = mv(&pos, "g1f3");
        let predicted = pos.key_after(m);
        pos.do_move(m);
        assert_eq!(pos.key(), predicted);
    }

    #[test]
    fn test_repetition_draw() {
        let mut pos = Position::new();
        for uci in ["g1f3", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6", "f3g1", "f6g8"] {
            let m = mv(&pos, uci);
            pos.do_move(m);
        }
        // Position has now occurred three times counting the start.
        assert!(pos.is_draw(0));
        assert!(pos.has_game_cycle(0));
    }

    #[test]
    fn test_see_simple() {
        use crate::types::PAWN_MG;

        // Rook takes undefended pawn: wins a pawn.
        let pos = Position::from_fen("4k3/8/8/3p4/8/8/3R4/4K3 w - - 0 1").unwrap();
        let m = mv(&pos, "d2d5");
        assert!(pos.see_ge(m, Value::ZERO));
        assert!(pos.see_ge(m, Value::new(PAWN_MG)));
        assert!(!pos.see_ge(m, Value::new(PAWN_MG + 1)));

        // Rook takes defended pawn: loses the exchange.
        let pos = Position::from_fen("4k3/8/4p3/3p4/8/8/3R4/4K3 w - - 0 1").unwrap();
        let m = mv(&pos, "d2d5");
        assert!(!pos.see_ge(m, Value::ZERO));

        // Quiet move: SEE holds at zero, fails for positive thresholds.
        let pos = Position::new();
        let m = mv(&pos, "g1f3");
        assert!(pos.see_ge(m, Value::ZERO));
    }

    #[test]
    fn test_non_pawn_material() {
        let pos = Position::from_fen("4k3/8/8/8/8/8/8/4K2R w K - 0 1").unwrap();
        assert_eq!(
            pos.non_pawn_material(Color::White),
            crate::types::PIECE_VALUE_MG[Role::Rook as usize - 1]
        );
        assert_eq!(pos.non_pawn_material(Color::Black), 0);
    }

    #[test]
    fn test_castling_encoding() {
        let pos =
            Position::from_fen("r3k2r/pppppppp/8/8/8/8/PPPPPPPP/R3K2R w KQkq - 0 1").unwrap();
        let moves = pos.legal_moves();
        assert!(moves.iter().any(|m| m.to_uci() == "e1g1"));
        assert!(moves.iter().any(|m| m.to_uci() == "e1c1"));
        assert!(pos.has_castling_rights());
    }
}
