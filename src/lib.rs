pub mod crypto;     // signing key, keyed-digest tokens, password hashing
pub mod market;     // autonomous daily market evolution + season rollover
pub mod store;      // durable ledger: players, stocks, holdings, news, history
pub mod telemetry;  // tracing + optional metrics exporter
