//! Built-in indicator implementations provided by the crate.

pub mod bollinger;
pub mod ema;
pub mod roc;
pub mod rsi;
pub mod sma;

pub use bollinger::{BollingerBands, BollingerBandsOutput, BollingerParams};
pub use ema::{Ema, EmaParams};
pub use roc::{RateOfChange, RocParams};
pub use rsi::{Rsi, RsiParams};
pub use sma::{Sma, SmaParams};
