//! Economy: credit scoring, loans, banking and the weekly jobs.

pub mod banking;
pub mod credit;
pub mod loans;
pub mod scheduler;

pub use banking::{BalanceSummary, Bank};
pub use loans::{LoanDesk, LoanQuote, PaymentReceipt};
