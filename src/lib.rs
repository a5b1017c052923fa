//! StatMon - Station Monitoring
//!
//! Pings registered monitoring stations, keeps an append-only ledger of
//! probe results and readings, and flags stations that are stale or failing.

pub mod alerting;
pub mod config;
pub mod db;
pub mod health;
pub mod monitor;
pub mod probe;
pub mod scheduler;
