//! PARLOR: community economy and gambling ledger engine
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod error;
pub mod storage;
pub mod economy;
pub mod gambling;
pub mod dashboard;
