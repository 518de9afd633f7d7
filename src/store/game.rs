use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{info, warn};

use crate::crypto;
use crate::store::db::{self, is_unique_violation, transact};
use crate::store::player::PlayerRef;
use crate::store::types::{
    LeaderInfo, Stock, StoreError, StoreResult, STARTING_CASH, STARTING_VALUE, STOCK_TYPES,
};

/// Names a recycled slot can take. A fresh name is always drawn excluding
/// the names currently listed.
pub(crate) const NAME_POOL: [&str; 12] = [
    "Coffee", "Soybeans", "Corn", "Wheat", "Cocoa", "Gold", "Silver", "Platinum", "Oil",
    "Natural Gas", "Cotton", "Sugar",
];

/// Handle to an open ledger store. Owns the database connection, the cached
/// signing key (immutable once created), and the simulation RNG. Share
/// between tasks with `Arc`.
pub struct Game {
    pub(crate) conn: Mutex<Connection>,
    pub(crate) rng: Mutex<StdRng>,
    key: Vec<u8>,
}

impl Game {
    /// Create a new empty game at `path`. Fails with `AlreadyInitialized`
    /// if a game already lives there.
    pub fn create(path: &str) -> StoreResult<Game> {
        let mut conn = db::open(path)?;
        if read_key(&conn)?.is_some() {
            return Err(StoreError::AlreadyInitialized);
        }
        conn.execute_batch(db::SCHEMA)?;

        let key = crypto::new_key();
        let mut rng = StdRng::from_entropy();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO game (k, v) VALUES ('Key', ?1)",
            [&key[..]],
        )?;
        set_last_tick(&tx, chrono::Utc::now().timestamp())?;
        reset_market(&tx, &mut rng)?;
        tx.commit()?;

        info!(path, "created game store");
        Ok(Game {
            conn: Mutex::new(conn),
            rng: Mutex::new(rng),
            key: key.to_vec(),
        })
    }

    /// Open an existing game at `path`. Fails with `NotInitialized` if no
    /// valid signing key is present.
    pub fn open(path: &str) -> StoreResult<Game> {
        let conn = db::open(path)?;
        let key = read_key(&conn)?.ok_or(StoreError::NotInitialized)?;
        Ok(Game {
            conn: Mutex::new(conn),
            rng: Mutex::new(StdRng::from_entropy()),
            key,
        })
    }

    /// Start the autonomous market scheduler for this store. The task runs
    /// for the life of the process; dropping the handle does not stop it.
    pub fn run(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        crate::market::scheduler::spawn(self)
    }

    /// Keyed digest of `name` under `purpose`, as an opaque token string.
    pub fn hash(&self, purpose: &str, name: &str) -> String {
        crypto::token::derive(&self.key, purpose, name)
    }

    /// Constant-time check of a presented token.
    pub fn verify_token(&self, purpose: &str, name: &str, token: &str) -> bool {
        crypto::token::verify(&self.key, purpose, name, token)
    }

    /// Look up a player by name.
    pub fn player(&self, name: &str) -> Option<PlayerRef<'_>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT id FROM players WHERE name = ?1",
                [name],
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .ok()
            .flatten()?;
        Some(PlayerRef { game: self, id })
    }

    pub fn has_player(&self, name: &str) -> bool {
        self.player(name).is_some()
    }

    /// Authenticate a returning player: recompute the cookie digest for the
    /// claimed name, compare in constant time, then look the player up.
    pub fn player_by_token(&self, name: &str, token: &str) -> Option<PlayerRef<'_>> {
        if !self.verify_token("cookie", name, token) {
            return None;
        }
        self.player(name)
    }

    /// Register a new player with starting cash and no shares. Uniqueness
    /// is enforced by the store itself, not a pre-check.
    pub fn new_player(&self, name: &str) -> StoreResult<PlayerRef<'_>> {
        let id = transact(&self.conn, |tx| {
            let r = tx
                .prepare_cached("INSERT INTO players (name, cash) VALUES (?1, ?2) RETURNING id")?
                .query_row(params![name, STARTING_CASH as i64], |r| r.get::<_, i64>(0));
            match r {
                Ok(id) => Ok(id),
                Err(e) if is_unique_violation(&e) => {
                    Err(StoreError::AlreadyExists(name.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        })?;
        info!(player = name, id, "registered player");
        Ok(PlayerRef { game: self, id })
    }

    /// Remove a player and all their holdings. Returns whether anything
    /// was deleted.
    pub fn delete_player(&self, name: &str) -> bool {
        transact(&self.conn, |tx| {
            Ok(tx.execute("DELETE FROM players WHERE name = ?1", [name])? > 0)
        })
        .unwrap_or(false)
    }

    /// Current slot contents, in slot order.
    pub fn list_stocks(&self) -> Vec<Stock> {
        let conn = self.conn.lock();
        let r = (|| -> StoreResult<Vec<Stock>> {
            let mut stmt = conn.prepare_cached("SELECT name, value FROM stocks ORDER BY idx")?;
            let rows = stmt.query_map([], |r| {
                Ok(Stock {
                    name: r.get(0)?,
                    value: r.get::<_, i64>(1)? as u64,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })();
        r.unwrap_or_else(|e| {
            warn!(error = %e, "failed to list stocks");
            Vec::new()
        })
    }

    /// Leaderboard by net worth, descending; ties break by name so the
    /// order is reproducible.
    pub fn leaders(&self) -> Vec<LeaderInfo> {
        let conn = self.conn.lock();
        leaders_on(&conn).unwrap_or_else(|e| {
            warn!(error = %e, "failed to compute leaderboard");
            Vec::new()
        })
    }

    /// Today's news, oldest line first. Replaced wholesale by each tick.
    pub fn news(&self) -> Vec<String> {
        self.lines("SELECT line FROM news ORDER BY id")
    }

    /// Season history, append-only since the store was created.
    pub fn history(&self) -> Vec<String> {
        self.lines("SELECT line FROM history ORDER BY id")
    }

    fn lines(&self, sql: &str) -> Vec<String> {
        let conn = self.conn.lock();
        let r = (|| -> StoreResult<Vec<String>> {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })();
        r.unwrap_or_else(|e| {
            warn!(error = %e, "failed to read lines");
            Vec::new()
        })
    }

    pub(crate) fn last_tick(&self) -> StoreResult<i64> {
        let conn = self.conn.lock();
        last_tick_on(&conn)
    }
}

fn read_key(conn: &Connection) -> StoreResult<Option<Vec<u8>>> {
    // the table may not exist yet; that just means "never initialized"
    let mut stmt = match conn.prepare("SELECT v FROM game WHERE k = 'Key'") {
        Ok(stmt) => stmt,
        Err(_) => return Ok(None),
    };
    let key: Option<Vec<u8>> = stmt.query_row([], |r| r.get(0)).optional()?;
    Ok(key.filter(|k| k.len() >= crypto::MIN_KEY_LEN))
}

pub(crate) fn last_tick_on(conn: &Connection) -> StoreResult<i64> {
    let t: Option<i64> = conn
        .query_row("SELECT v FROM game WHERE k = 'LastTick'", [], |r| r.get(0))
        .optional()?;
    Ok(t.unwrap_or(0))
}

pub(crate) fn set_last_tick(tx: &Transaction, secs: i64) -> StoreResult<()> {
    tx.execute(
        "INSERT OR REPLACE INTO game (k, v) VALUES ('LastTick', ?1)",
        [secs],
    )?;
    Ok(())
}

/// Net worth per player, computed in the store so a concurrent trade can
/// never be half-counted.
pub(crate) fn leaders_on(conn: &Connection) -> StoreResult<Vec<LeaderInfo>> {
    let mut stmt = conn.prepare_cached(
        "SELECT p.name, p.cash + COALESCE(SUM(h.shares * s.value), 0) AS worth \
         FROM players p \
         LEFT JOIN holdings h ON h.player = p.id \
         LEFT JOIN stocks s ON s.idx = h.stock \
         GROUP BY p.id \
         ORDER BY worth DESC, p.name ASC",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok(LeaderInfo {
            name: r.get(0)?,
            worth: r.get::<_, i64>(1)? as u64,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Resolve a stock name to its slot index and current value. Always called
/// inside the transaction that acts on the result; a stale externally-read
/// value is never trusted.
pub(crate) fn find_stock(tx: &Transaction, name: &str) -> StoreResult<Option<(i64, u64)>> {
    let r = tx
        .prepare_cached("SELECT idx, value FROM stocks WHERE name = ?1")?
        .query_row([name], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)? as u64)))
        .optional()?;
    Ok(r)
}

/// Draw an unused name from the pool. The pool is twice the slot count, so
/// a free name always exists.
pub(crate) fn pick_name(tx: &Transaction, rng: &mut impl Rng) -> StoreResult<String> {
    let used: Vec<String> = {
        let mut stmt = tx.prepare_cached("SELECT name FROM stocks")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    loop {
        let candidate = NAME_POOL[rng.gen_range(0..NAME_POOL.len())];
        if !used.iter().any(|n| n == candidate) {
            return Ok(candidate.to_string());
        }
    }
}

/// Reset the economy: everyone back to starting cash, all holdings cleared,
/// six freshly named stocks at the baseline value. Used at creation and at
/// every season rollover.
pub(crate) fn reset_market(tx: &Transaction, rng: &mut impl Rng) -> StoreResult<()> {
    tx.execute("UPDATE players SET cash = ?1", [STARTING_CASH as i64])?;
    tx.execute("DELETE FROM holdings", [])?;
    tx.execute("DELETE FROM stocks", [])?;
    for idx in 1..=STOCK_TYPES as i64 {
        let name = pick_name(tx, rng)?;
        tx.execute(
            "INSERT INTO stocks (idx, name, value) VALUES (?1, ?2, ?3)",
            params![idx, name, STARTING_VALUE as i64],
        )?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::store::db::testing::temp_path;
    use crate::store::types::{LOT, STARTING_CASH};

    pub(crate) fn mem_game() -> Game {
        Game::create(":memory:").unwrap()
    }

    /// Pin a slot to a known name/value so trades are deterministic. The
    /// seeded names are random, so first move any slot already holding
    /// the name out of the way.
    pub(crate) fn pin_stock(game: &Game, idx: i64, name: &str, value: u64) {
        let conn = game.conn.lock();
        conn.execute(
            "UPDATE stocks SET name = 'Slot ' || idx WHERE name = ?1 AND idx != ?2",
            params![name, idx],
        )
        .unwrap();
        conn.execute(
            "UPDATE stocks SET name = ?2, value = ?3 WHERE idx = ?1",
            params![idx, name, value as i64],
        )
        .unwrap();
    }

    #[test]
    fn test_create_seeds_market() {
        let game = mem_game();
        let stocks = game.list_stocks();
        assert_eq!(stocks.len(), STOCK_TYPES);
        let names: HashSet<_> = stocks.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names.len(), STOCK_TYPES, "names must be unique");
        for s in &stocks {
            assert_eq!(s.value, STARTING_VALUE);
            assert!(NAME_POOL.contains(&s.name.as_str()));
        }
        assert!(game.news().is_empty());
        assert!(game.history().is_empty());
    }

    #[test]
    fn test_open_requires_initialized_store() {
        assert!(matches!(
            Game::open(":memory:"),
            Err(StoreError::NotInitialized)
        ));
    }

    #[test]
    fn test_create_refuses_existing_store() {
        let path = temp_path("create-twice");
        Game::create(&path).unwrap();
        assert!(matches!(
            Game::create(&path),
            Err(StoreError::AlreadyInitialized)
        ));
        Game::open(&path).unwrap();
    }

    #[test]
    fn test_register_and_lookup() {
        let game = mem_game();
        assert!(!game.has_player("alice"));
        game.new_player("alice").unwrap();
        assert!(game.has_player("alice"));
        let holdings = game.player("alice").unwrap().holdings();
        assert_eq!(holdings.cash, STARTING_CASH);
        assert_eq!(holdings.shares, [0; STOCK_TYPES]);
    }

    #[test]
    fn test_register_duplicate_fails() {
        let game = mem_game();
        game.new_player("alice").unwrap();
        assert!(matches!(
            game.new_player("alice"),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_delete_player_cascades_holdings() {
        let game = mem_game();
        game.new_player("alice").unwrap();
        pin_stock(&game, 1, "Corn", 100);
        game.player("alice").unwrap().buy("Corn", 1).unwrap();
        assert!(game.delete_player("alice"));
        assert!(!game.has_player("alice"));
        let orphans: i64 = game
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM holdings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
        assert!(!game.delete_player("alice"));
    }

    #[test]
    fn test_leaders_sorted_with_name_tie_break() {
        let game = mem_game();
        game.new_player("carol").unwrap();
        game.new_player("alice").unwrap();
        game.new_player("bob").unwrap();
        pin_stock(&game, 1, "Corn", 200);
        // carol converts cash into shares; her worth must count them
        game.player("carol").unwrap().buy("Corn", 2).unwrap();
        let leaders = game.leaders();
        let names: Vec<_> = leaders.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
        assert!(leaders.iter().all(|l| l.worth == STARTING_CASH));
    }

    #[test]
    fn test_tokens_differ_across_stores() {
        let a = mem_game();
        let b = mem_game();
        assert_ne!(a.hash("invite", "alice"), b.hash("invite", "alice"));
        assert_ne!(a.hash("invite", "alice"), a.hash("cookie", "alice"));
    }

    #[test]
    fn test_player_by_token() {
        let game = mem_game();
        game.new_player("alice").unwrap();
        let token = game.hash("cookie", "alice");
        assert!(game.player_by_token("alice", &token).is_some());
        assert!(game.player_by_token("bob", &token).is_none());
        assert!(game.player_by_token("alice", "forged").is_none());
    }

    #[test]
    fn test_concurrent_buys_never_overspend() {
        let path = temp_path("concurrent");
        let game = Arc::new(Game::create(&path).unwrap());
        game.new_player("alice").unwrap();
        pin_stock(&game, 1, "Corn", 100);

        // 24 attempted lots at 10_000 each against 100_000 cash: exactly
        // 10 can succeed no matter how the threads interleave
        let mut workers = Vec::new();
        for _ in 0..8 {
            let game = Arc::clone(&game);
            workers.push(std::thread::spawn(move || {
                let mut bought = 0u64;
                let p = game.player("alice").unwrap();
                for _ in 0..3 {
                    match p.buy("Corn", 1) {
                        Ok(()) => bought += 1,
                        Err(StoreError::InsufficientFunds { .. }) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                bought
            }));
        }
        let bought: u64 = workers.into_iter().map(|w| w.join().unwrap()).sum();

        assert_eq!(bought, 10);
        let holdings = game.player("alice").unwrap().holdings();
        assert_eq!(holdings.cash, 0);
        assert_eq!(holdings.shares[0], bought * LOT);
    }
}
