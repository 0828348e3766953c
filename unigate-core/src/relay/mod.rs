//! Relay engine
//!
//! Channel selection, quota reservation, failover and settlement for a single
//! caller request. [`Relay`] is the entry point; the other types are exposed
//! for callers that assemble their own pipeline or inspect ledger state.

pub mod error;
pub mod health;
pub mod ledger;
pub mod orchestrator;
pub mod pricing;
pub mod retry;
pub mod selector;
mod stream;

pub use error::{RelayError, RelayErrorKind};
pub use health::ChannelHealth;
pub use ledger::{LedgerError, LedgerTotals, QuotaLedger, Reservation, ReservationGuard, Settlement};
pub use orchestrator::{Relay, RelayBuilder, RelayOutcome};
pub use pricing::{QuotaPricing, TokenRatioPricing};
pub use retry::RetryPolicy;
pub use selector::{select_weighted, ChannelSelector};
pub use stream::RelayStream;
