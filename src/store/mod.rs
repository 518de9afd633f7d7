pub mod types;          // public read models + error taxonomy
pub(crate) mod db;      // connection setup, schema, busy-retry discipline
pub mod game;           // store lifecycle + game-wide operations
pub mod player;         // per-player operations

pub use game::Game;
pub use player::PlayerRef;
pub use types::{LeaderInfo, PlayerHoldings, Stock, StoreError, StoreResult};
