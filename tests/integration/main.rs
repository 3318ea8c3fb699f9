//! Integration tests over the public `parlor` API.

mod flaky_store;
mod simulation;
