use serde::Serialize;
use thiserror::Error;

/// Number of tradable stock slots. The count is invariant; slots are
/// renamed on bankruptcy or season reset, never added or removed.
pub const STOCK_TYPES: usize = 6;

/// Value a stock starts (and restarts) at.
pub const STARTING_VALUE: u64 = 100;

/// Reaching twice the baseline triggers a 2-for-1 split.
pub const SPLIT_VALUE: u64 = STARTING_VALUE * 2;

/// Cash a player registers with, and returns to on season reset.
pub const STARTING_CASH: u64 = 100_000;

/// Shares per traded lot.
pub const LOT: u64 = 100;

/// One market slot as currently listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stock {
    pub name: String,
    pub value: u64,
}

/// A player's cash plus per-slot share counts. Shares are always
/// non-negative multiples of [`LOT`]; cash is never negative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlayerHoldings {
    pub cash: u64,
    pub shares: [u64; STOCK_TYPES],
}

/// Leaderboard row: net worth = cash + Σ shares × value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderInfo {
    pub name: String,
    pub worth: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} is not on the market")]
    UnknownStock(String),

    #[error("not enough cash to buy {shares} shares of {stock}")]
    InsufficientFunds { stock: String, shares: u64 },

    #[error("not enough shares of {stock} to sell {shares}")]
    InsufficientShares { stock: String, shares: u64 },

    #[error("{0} is already registered")]
    AlreadyExists(String),

    #[error("store holds no game; create one first")]
    NotInitialized,

    #[error("store already holds a game")]
    AlreadyInitialized,

    #[error("storage: {0}")]
    Db(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
