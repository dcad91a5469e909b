//! Common types used throughout tigerbank: the closed currency set, balance
//! buckets, journal entries, payout records, wallet views, and the engine
//! error surface.

pub mod balance;
pub mod currency;
pub mod error;
pub mod journal;
pub mod observation;
pub mod payout;
pub mod view;

pub use balance::{quantize_down, BalanceCell, BalanceSnapshot, Bucket, SystemCell, SystemSnapshot};
pub use currency::{Chain, Currency};
pub use error::EngineError;
pub use journal::{ConversionLeg, JournalEntry, JournalKind};
pub use observation::{ChainObservation, RateQuote};
pub use payout::{Payout, PayoutState};
pub use view::{
    BalanceSource, ConvertReceipt, CurrencyView, DepositCredit, PayoutStatus, PromoteReceipt,
    SettleReceipt, WalletView, WithdrawReceipt,
};

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
