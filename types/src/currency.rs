//! The closed set of supported assets and their home chains.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A supported asset. The set is closed: every balance cell, rate quote, and
/// payout references one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    /// Native utility token of the casino (SPL token on Solana).
    Crt,
    Doge,
    Trx,
    /// USD-pegged stablecoin.
    Usdc,
    /// Gas asset of the CRT home chain.
    Sol,
}

/// A home chain for one or more currencies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Solana,
    Dogecoin,
    Tron,
}

impl Currency {
    /// Every supported currency, in canonical (symbol-lexicographic) order.
    pub const ALL: [Currency; 5] = [
        Currency::Crt,
        Currency::Doge,
        Currency::Sol,
        Currency::Trx,
        Currency::Usdc,
    ];

    pub fn symbol(&self) -> &'static str {
        match self {
            Currency::Crt => "CRT",
            Currency::Doge => "DOGE",
            Currency::Trx => "TRX",
            Currency::Usdc => "USDC",
            Currency::Sol => "SOL",
        }
    }

    pub fn full_name(&self) -> &'static str {
        match self {
            Currency::Crt => "Casino Reward Token",
            Currency::Doge => "Dogecoin",
            Currency::Trx => "Tron",
            Currency::Usdc => "USD Coin",
            Currency::Sol => "Solana",
        }
    }

    /// Fixed-point scale for balances and conversion outputs.
    pub fn decimals(&self) -> u32 {
        match self {
            Currency::Crt => 6,
            Currency::Doge => 8,
            Currency::Trx => 6,
            Currency::Usdc => 6,
            Currency::Sol => 9,
        }
    }

    pub fn home_chain(&self) -> Chain {
        match self {
            Currency::Crt | Currency::Sol => Chain::Solana,
            Currency::Doge => Chain::Dogecoin,
            Currency::Trx | Currency::Usdc => Chain::Tron,
        }
    }

    /// Whether the USD price may be hard-pinned to 1.
    pub fn is_stable(&self) -> bool {
        matches!(self, Currency::Usdc)
    }

    /// Smallest representable unit at this currency's scale.
    pub fn smallest_unit(&self) -> Decimal {
        Decimal::new(1, self.decimals())
    }

    /// Minimum payout quantity the processor accepts for this currency.
    pub fn min_withdrawal(&self) -> Decimal {
        match self {
            Currency::Crt => Decimal::ONE,
            Currency::Doge => Decimal::TEN,
            Currency::Trx => Decimal::TEN,
            Currency::Usdc => Decimal::new(5, 0),
            Currency::Sol => Decimal::new(1, 1),
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Currency> {
        match symbol.to_ascii_uppercase().as_str() {
            "CRT" => Some(Currency::Crt),
            "DOGE" => Some(Currency::Doge),
            "TRX" => Some(Currency::Trx),
            "USDC" => Some(Currency::Usdc),
            "SOL" => Some(Currency::Sol),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl Chain {
    pub fn name(&self) -> &'static str {
        match self {
            Chain::Solana => "solana",
            Chain::Dogecoin => "dogecoin",
            Chain::Tron => "tron",
        }
    }

    pub fn from_name(name: &str) -> Option<Chain> {
        match name {
            "solana" => Some(Chain::Solana),
            "dogecoin" => Some(Chain::Dogecoin),
            "tron" => Some(Chain::Tron),
            _ => None,
        }
    }

    /// Validate an address against this chain's format before any network
    /// call is made on its behalf. Checks prefix, length, and charset only;
    /// full checksum verification is the processor's job.
    pub fn validate_address(&self, address: &str) -> bool {
        match self {
            // Base58, 32-44 chars, no 0/O/I/l.
            Chain::Solana => {
                (32..=44).contains(&address.len()) && address.chars().all(is_base58_char)
            }
            // Mainnet P2PKH addresses start with 'D', 34 chars.
            Chain::Dogecoin => {
                address.len() == 34
                    && address.starts_with('D')
                    && address.chars().all(is_base58_char)
            }
            // Base58check, 34 chars, 'T' prefix.
            Chain::Tron => {
                address.len() == 34
                    && address.starts_with('T')
                    && address.chars().all(is_base58_char)
            }
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn is_base58_char(c: char) -> bool {
    c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l')
}
