//! Games of chance and the settlement path they share.

pub mod blackjack;
pub mod blackjack_table;
pub mod race_track;
pub mod racing;
pub mod rng;
pub mod settlement;
pub mod slots;

pub use blackjack_table::BlackjackTables;
pub use race_track::RaceTrack;
pub use rng::RngSource;
pub use settlement::{PlayerStats, Settlement, SettlementRequest};
pub use slots::SlotMachine;
