pub mod scheduler;  // wake-time computation and the long-lived daily task
pub mod tick;       // the market-day transaction: rounds, news, season rollover
