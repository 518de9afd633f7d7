use rusqlite::{params, OptionalExtension};
use tracing::{info, instrument, warn};

use crate::crypto::password;
use crate::store::db::transact;
use crate::store::game::{self, Game};
use crate::store::types::{PlayerHoldings, StoreError, StoreResult, LOT, STOCK_TYPES};

/// Opaque handle to one player in an open store. Obtained from
/// [`Game::player`], [`Game::new_player`] or [`Game::player_by_token`];
/// holds no player state itself.
pub struct PlayerRef<'g> {
    pub(crate) game: &'g Game,
    pub(crate) id: i64,
}

impl PlayerRef<'_> {
    /// Buy `lots` lots of `stock`. The stock's slot and value are
    /// re-resolved inside the transaction, so a quote the caller saw
    /// earlier cannot go stale between read and debit.
    #[instrument(skip(self), fields(player = self.id))]
    pub fn buy(&self, stock: &str, lots: u64) -> StoreResult<()> {
        let shares = checked_shares(lots).ok_or_else(|| StoreError::InsufficientFunds {
            stock: stock.to_string(),
            shares: u64::MAX,
        })?;
        transact(&self.game.conn, |tx| {
            let (idx, value) = game::find_stock(tx, stock)?
                .ok_or_else(|| StoreError::UnknownStock(stock.to_string()))?;
            let cost = (shares as u64)
                .checked_mul(value)
                .and_then(|c| i64::try_from(c).ok())
                .ok_or_else(|| StoreError::InsufficientFunds {
                    stock: stock.to_string(),
                    shares: shares as u64,
                })?;
            let cash: i64 = tx
                .prepare_cached("UPDATE players SET cash = cash - ?1 WHERE id = ?2 RETURNING cash")?
                .query_row(params![cost, self.id], |r| r.get(0))?;
            if cash < 0 {
                return Err(StoreError::InsufficientFunds {
                    stock: stock.to_string(),
                    shares: shares as u64,
                });
            }
            tx.prepare_cached(
                "INSERT INTO holdings (player, stock, shares) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (player, stock) DO UPDATE SET shares = shares + excluded.shares",
            )?
            .execute(params![self.id, idx, shares])?;
            Ok(())
        })?;
        metrics::counter!("bourse_trades").increment(1);
        info!(stock, lots, "bought");
        Ok(())
    }

    /// Sell `lots` lots of `stock`; the symmetric operation.
    #[instrument(skip(self), fields(player = self.id))]
    pub fn sell(&self, stock: &str, lots: u64) -> StoreResult<()> {
        let shares = checked_shares(lots).ok_or_else(|| StoreError::InsufficientShares {
            stock: stock.to_string(),
            shares: u64::MAX,
        })?;
        transact(&self.game.conn, |tx| {
            let (idx, value) = game::find_stock(tx, stock)?
                .ok_or_else(|| StoreError::UnknownStock(stock.to_string()))?;
            // the guard rides on the statement itself: no row is updated
            // unless enough shares are held
            let remaining: Option<i64> = tx
                .prepare_cached(
                    "UPDATE holdings SET shares = shares - ?3 \
                     WHERE player = ?1 AND stock = ?2 AND shares >= ?3 RETURNING shares",
                )?
                .query_row(params![self.id, idx, shares], |r| r.get(0))
                .optional()?;
            if remaining.is_none() {
                return Err(StoreError::InsufficientShares {
                    stock: stock.to_string(),
                    shares: shares as u64,
                });
            }
            let proceeds = (shares as u64).saturating_mul(value) as i64;
            tx.prepare_cached("UPDATE players SET cash = cash + ?1 WHERE id = ?2")?
                .execute(params![proceeds, self.id])?;
            Ok(())
        })?;
        metrics::counter!("bourse_trades").increment(1);
        info!(stock, lots, "sold");
        Ok(())
    }

    /// Cash and per-slot share counts. Missing rows read as zero.
    pub fn holdings(&self) -> PlayerHoldings {
        let conn = self.game.conn.lock();
        let mut rv = PlayerHoldings::default();
        rv.cash = conn
            .query_row(
                "SELECT cash FROM players WHERE id = ?1",
                [self.id],
                |r| r.get::<_, i64>(0),
            )
            .map(|c| c.max(0) as u64)
            .unwrap_or(0);
        let r = (|| -> StoreResult<()> {
            let mut stmt =
                conn.prepare_cached("SELECT stock, shares FROM holdings WHERE player = ?1")?;
            let rows = stmt.query_map([self.id], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (stock, shares) = row?;
                if (1..=STOCK_TYPES as i64).contains(&stock) {
                    rv.shares[(stock - 1) as usize] = shares.max(0) as u64;
                }
            }
            Ok(())
        })();
        if let Err(e) = r {
            warn!(error = %e, "failed to read holdings");
        }
        rv
    }

    /// Store a fresh salted memory-hard hash of `password`.
    pub fn set_password(&self, password: &str) -> StoreResult<()> {
        let salt = password::new_salt();
        let hash = password::hash(&salt, password);
        transact(&self.game.conn, |tx| {
            tx.prepare_cached(
                "UPDATE players SET pw_algo = ?2, pw_salt = ?3, pw_hash = ?4 WHERE id = ?1",
            )?
            .execute(params![self.id, password::ALGO, &salt[..], &hash[..]])?;
            Ok(())
        })
    }

    /// Recompute with the stored salt and compare in constant time. A
    /// missing credential or unknown algorithm tag never verifies.
    pub fn check_password(&self, password: &str) -> bool {
        let row = {
            let conn = self.game.conn.lock();
            conn.query_row(
                "SELECT pw_algo, pw_salt, pw_hash FROM players WHERE id = ?1",
                [self.id],
                |r| {
                    Ok((
                        r.get::<_, Option<String>>(0)?,
                        r.get::<_, Option<Vec<u8>>>(1)?,
                        r.get::<_, Option<Vec<u8>>>(2)?,
                    ))
                },
            )
            .optional()
            .ok()
            .flatten()
        };
        match row {
            Some((Some(algo), Some(salt), Some(hash))) => {
                password::verify(&algo, &salt, &hash, password)
            }
            _ => false,
        }
    }

    pub fn is_admin(&self) -> bool {
        let conn = self.game.conn.lock();
        conn.query_row(
            "SELECT admin FROM players WHERE id = ?1",
            [self.id],
            |r| r.get::<_, bool>(0),
        )
        .unwrap_or(false)
    }

    pub fn set_admin(&self, is: bool) -> StoreResult<()> {
        transact(&self.game.conn, |tx| {
            tx.prepare_cached("UPDATE players SET admin = ?2 WHERE id = ?1")?
                .execute(params![self.id, is])?;
            Ok(())
        })
    }
}

/// Lots to shares with the i64 range enforced, so an absurd lot count can
/// never wrap into a negative bind value.
fn checked_shares(lots: u64) -> Option<i64> {
    lots.checked_mul(LOT).and_then(|s| i64::try_from(s).ok())
}
