//! HTTP API: the synchronous entry point into the stock ledger.

pub mod app;
pub mod context;
pub mod middleware;
