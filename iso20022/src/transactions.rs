//! Normalized transaction model
//!
//! The canonical shape every camt entry is flattened into, shared by the
//! ingestion pipeline and the reconciliation matcher.

use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Money direction as seen from the booking account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// CRDT
    Credit,
    /// DBIT
    Debit,
}

impl Direction {
    pub fn from_camt(s: &str) -> Result<Self> {
        match s {
            "CRDT" => Ok(Direction::Credit),
            "DBIT" => Ok(Direction::Debit),
            other => Err(Error::CamtParse(format!(
                "unknown credit/debit indicator '{}'",
                other
            ))),
        }
    }

    pub fn as_camt(&self) -> &'static str {
        match self {
            Direction::Credit => "CRDT",
            Direction::Debit => "DBIT",
        }
    }
}

/// Entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// BOOK
    Booked,
    /// PDNG
    Pending,
}

impl EntryStatus {
    pub fn from_camt(s: &str) -> Result<Self> {
        match s {
            "BOOK" => Ok(EntryStatus::Booked),
            "PDNG" => Ok(EntryStatus::Pending),
            other => Err(Error::CamtParse(format!("unknown entry status '{}'", other))),
        }
    }

    pub fn as_camt(&self) -> &'static str {
        match self {
            EntryStatus::Booked => "BOOK",
            EntryStatus::Pending => "PDNG",
        }
    }
}

/// Bank transaction code in both flavors a statement may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankTransactionCode {
    /// ISO form `domain/family/subfamily`
    pub iso: Option<String>,
    /// Proprietary form `issuer:code`
    pub proprietary: Option<String>,
}

/// One normalized transaction derived from a camt entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    /// IBAN of the booking account
    pub account_iban: String,
    /// Bank entry reference; upsert key together with the account IBAN
    pub entry_ref: String,
    pub counterpart_iban: Option<String>,
    pub counterpart_bic: Option<String>,
    pub counterpart_name: Option<String>,
    /// Magnitude; see [`NormalizedTransaction::signed_amount`]
    pub amount: Decimal,
    pub currency: String,
    /// Booking date in unix milliseconds
    pub booking_date_ms: Option<i64>,
    /// Value date in unix milliseconds
    pub value_date_ms: Option<i64>,
    /// Unstructured remittance, `Ustrd` lines concatenated in order
    pub subject: String,
    pub direction: Direction,
    pub status: EntryStatus,
    /// True iff the entry carried more than one transaction detail
    pub is_batch: bool,
    pub bank_transaction_code: BankTransactionCode,
    pub end_to_end_id: Option<String>,
}

impl NormalizedTransaction {
    /// Amount signed by direction: credits positive, debits negative.
    pub fn signed_amount(&self) -> Decimal {
        match self.direction {
            Direction::Credit => self.amount,
            Direction::Debit => -self.amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn direction_and_status_mappings() {
        assert_eq!(Direction::from_camt("CRDT").unwrap(), Direction::Credit);
        assert_eq!(Direction::from_camt("DBIT").unwrap(), Direction::Debit);
        assert!(Direction::from_camt("SIDEWAYS").is_err());

        assert_eq!(EntryStatus::from_camt("BOOK").unwrap(), EntryStatus::Booked);
        assert_eq!(EntryStatus::from_camt("PDNG").unwrap(), EntryStatus::Pending);
        assert!(EntryStatus::from_camt("INFO").is_err());
    }

    #[test]
    fn signed_amount_follows_direction() {
        let tx = NormalizedTransaction {
            account_iban: "DE75512108001245126199".to_string(),
            entry_ref: "REF-1".to_string(),
            counterpart_iban: None,
            counterpart_bic: None,
            counterpart_name: None,
            amount: dec!(12.50),
            currency: "EUR".to_string(),
            booking_date_ms: None,
            value_date_ms: None,
            subject: String::new(),
            direction: Direction::Debit,
            status: EntryStatus::Booked,
            is_batch: false,
            bank_transaction_code: BankTransactionCode::default(),
            end_to_end_id: None,
        };
        assert_eq!(tx.signed_amount(), dec!(-12.50));
    }
}
