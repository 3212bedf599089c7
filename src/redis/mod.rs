//! Thin wrapper around the `redis` crate's cluster-capable async client: owns a
//! [`redis::aio::ConnectionManager`] and exposes only the primitives the streaming engine needs
//! (bootstrap, pipelined `XADD`, `XREADGROUP`, pipelined `XACK`+`XDEL`). No batching, retry, or
//! lifecycle policy lives here — that belongs to [`crate::producer`] and [`crate::consumer`].

mod store;

pub use store::Store;
