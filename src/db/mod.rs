//! Database module for StatMon.
//!
//! Provides the SQLite station directory and the append-only probe and
//! measurement ledger, with embedded migrations.

mod models;
mod params;
mod store;

pub use models::*;
pub use params::*;
pub use store::*;
