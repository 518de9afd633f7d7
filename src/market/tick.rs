//! One market day, applied as a single transaction.
//!
//! Fifteen randomized adjustment rounds move the six stocks, splits and
//! bankruptcies recycle slots, dividends mint cash for holders, and the
//! day ends with a fresh news list. Crossing a UTC month boundary settles
//! the season and resets the economy. The tick re-checks the last-tick
//! stamp inside the transaction, so running it twice in one day (or from
//! two processes at once) applies the day exactly once.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use rand::Rng;
use rusqlite::{params, Transaction};
use tracing::info;

use crate::store::db::transact;
use crate::store::game::{self, Game};
use crate::store::types::{StoreResult, SPLIT_VALUE, STARTING_VALUE, STOCK_TYPES};

/// Randomized adjustment rounds per market day.
pub(crate) const ROUNDS: usize = 15;

/// Magnitude of one adjustment: round(uniform(1.2, 2.0)^5), an integer in
/// 2..=32.
fn magnitude(rng: &mut impl Rng) -> u64 {
    rng.gen_range(1.2f64..2.0).powi(5).round() as u64
}

/// Advance the market by one day if no tick has completed today (UTC).
/// Returns whether a day was actually applied.
pub(crate) fn run(game: &Game, now: DateTime<Utc>) -> StoreResult<bool> {
    let mut rng = game.rng.lock();
    let rng = &mut *rng;
    let ran = transact(&game.conn, |tx| tick_tx(tx, rng, now))?;
    if ran {
        metrics::counter!("bourse_market_ticks").increment(1);
        info!("market day applied");
    }
    Ok(ran)
}

fn tick_tx(tx: &Transaction, rng: &mut impl Rng, now: DateTime<Utc>) -> StoreResult<bool> {
    let last_secs = game::last_tick_on(tx)?;
    let last = Utc
        .timestamp_opt(last_secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    if last.date_naive() >= now.date_naive() {
        return Ok(false); // already ticked today
    }

    // start-of-day values, for the end-of-day summary
    let mut before = [0u64; STOCK_TYPES];
    {
        let mut stmt = tx.prepare_cached("SELECT idx, value FROM stocks")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (idx, value) = row?;
            before[(idx - 1) as usize] = value.max(0) as u64;
        }
    }

    let mut news: Vec<String> = Vec::new();
    let mut dividends = [0u64; STOCK_TYPES];

    for _ in 0..ROUNDS {
        let idx = rng.gen_range(1..=STOCK_TYPES as i64);
        let mag = magnitude(rng);
        match rng.gen_range(0..3) {
            0 => rise(tx, idx, mag, &mut before, &mut news)?,
            1 => fall(tx, rng, idx, mag, &mut before, &mut news)?,
            _ => dividend(tx, idx, mag, &mut dividends)?,
        }
    }

    summarize(tx, &before, &dividends, &mut news)?;

    if (last.year(), last.month()) != (now.year(), now.month()) {
        season_rollover(tx, rng, &mut news)?;
    }

    tx.execute("DELETE FROM news", [])?;
    {
        let mut stmt = tx.prepare_cached("INSERT INTO news (line) VALUES (?1)")?;
        for line in &news {
            stmt.execute([line])?;
        }
    }
    game::set_last_tick(tx, now.timestamp())?;
    Ok(true)
}

/// Value up by `mag`; reaching twice the baseline triggers a 2-for-1
/// split: price halves, every holder's shares double, and the reporting
/// baseline halves with it.
fn rise(
    tx: &Transaction,
    idx: i64,
    mag: u64,
    before: &mut [u64; STOCK_TYPES],
    news: &mut Vec<String>,
) -> StoreResult<()> {
    let (name, value): (String, i64) = tx
        .prepare_cached("UPDATE stocks SET value = value + ?2 WHERE idx = ?1 RETURNING name, value")?
        .query_row(params![idx, mag as i64], |r| Ok((r.get(0)?, r.get(1)?)))?;
    if value as u64 >= SPLIT_VALUE {
        tx.prepare_cached("UPDATE stocks SET value = value / 2 WHERE idx = ?1")?
            .execute([idx])?;
        tx.prepare_cached("UPDATE holdings SET shares = shares * 2 WHERE stock = ?1")?
            .execute([idx])?;
        let i = (idx - 1) as usize;
        before[i] = (before[i] / 2).max(1);
        news.push(format!("{name} split 2 for 1"));
    }
    Ok(())
}

/// Value down by `mag`; a fall that would not leave a positive value
/// bankrupts the slot: holders are wiped out and the slot is recycled
/// under a fresh name at the baseline value.
fn fall(
    tx: &Transaction,
    rng: &mut impl Rng,
    idx: i64,
    mag: u64,
    before: &mut [u64; STOCK_TYPES],
    news: &mut Vec<String>,
) -> StoreResult<()> {
    let (name, value): (String, i64) = tx
        .prepare_cached("SELECT name, value FROM stocks WHERE idx = ?1")?
        .query_row([idx], |r| Ok((r.get(0)?, r.get(1)?)))?;
    if value <= mag as i64 {
        tx.prepare_cached("DELETE FROM holdings WHERE stock = ?1")?
            .execute([idx])?;
        let fresh = game::pick_name(tx, rng)?;
        tx.prepare_cached("UPDATE stocks SET name = ?2, value = ?3 WHERE idx = ?1")?
            .execute(params![idx, fresh, STARTING_VALUE as i64])?;
        before[(idx - 1) as usize] = STARTING_VALUE;
        news.push(format!("{name} has gone bankrupt and left the market"));
        news.push(format!("{fresh} has joined the market at {STARTING_VALUE}"));
    } else {
        tx.prepare_cached("UPDATE stocks SET value = value - ?2 WHERE idx = ?1")?
            .execute(params![idx, mag as i64])?;
    }
    Ok(())
}

/// At or above the baseline, pay `mag` per share to every holder. The
/// cash is minted, not moved; aggregate net worth goes up.
fn dividend(
    tx: &Transaction,
    idx: i64,
    mag: u64,
    dividends: &mut [u64; STOCK_TYPES],
) -> StoreResult<()> {
    let value: i64 = tx
        .prepare_cached("SELECT value FROM stocks WHERE idx = ?1")?
        .query_row([idx], |r| r.get(0))?;
    if value as u64 >= STARTING_VALUE {
        tx.prepare_cached(
            "UPDATE players SET cash = cash + ?2 * COALESCE(\
             (SELECT shares FROM holdings WHERE player = players.id AND stock = ?1), 0)",
        )?
        .execute(params![idx, mag as i64])?;
        dividends[(idx - 1) as usize] += mag;
    }
    Ok(())
}

/// One line per slot comparing the end-of-day value to the start-of-day
/// value, with a dividend note where one was paid.
fn summarize(
    tx: &Transaction,
    before: &[u64; STOCK_TYPES],
    dividends: &[u64; STOCK_TYPES],
    news: &mut Vec<String>,
) -> StoreResult<()> {
    let stocks: Vec<(i64, String, i64)> = {
        let mut stmt = tx.prepare_cached("SELECT idx, name, value FROM stocks ORDER BY idx")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
        rows.collect::<Result<_, _>>()?
    };
    for (idx, name, value) in stocks {
        let i = (idx - 1) as usize;
        let end = value.max(0) as u64;
        let mut line = if end == before[i] {
            format!("{name} did not change price")
        } else {
            let pct = (end as f64 - before[i] as f64) * 100.0 / before[i].max(1) as f64;
            if pct > 0.0 {
                format!("{name} rose {pct:.1}%")
            } else {
                format!("{name} fell {:.1}%", -pct)
            }
        };
        if dividends[i] > 0 {
            line.push_str(&format!(", and paid a dividend of {} per share", dividends[i]));
        }
        news.push(line);
    }
    Ok(())
}

/// Settle the season: name the winner in the news and the permanent
/// history, summarize the rest of the field, then reset the economy.
fn season_rollover(
    tx: &Transaction,
    rng: &mut impl Rng,
    news: &mut Vec<String>,
) -> StoreResult<()> {
    let leaders = game::leaders_on(tx)?;
    if let Some(winner) = leaders.first() {
        let line = format!(
            "{} won the season with a net worth of {}",
            winner.name, winner.worth
        );
        tx.prepare_cached("INSERT INTO history (line) VALUES (?1)")?
            .execute([&line])?;
        news.push(line);
    }
    if leaders.len() > 1 {
        let rest = leaders[1..]
            .iter()
            .map(|l| format!("{} ({})", l.name, l.worth))
            .collect::<Vec<_>>()
            .join(", ");
        news.push(format!("The rest of the field: {rest}"));
    }
    game::reset_market(tx, rng)
}
