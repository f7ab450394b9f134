//! # Moneta ISO 20022 translator
//!
//! Two directions:
//! - camt.052/053 account reports and statements are flattened into the
//!   normalized transaction model the ledger stores;
//! - high-level payment initiations are rendered as pain.001.001.03
//!   credit transfers for upload.

#![forbid(unsafe_code)]

pub mod camt;
pub mod error;
pub mod pain;
pub mod transactions;

pub use camt::{parse_camt, CamtDocument, CamtKind, CamtStatement};
pub use error::{Error, Result};
pub use pain::{emit_pain001, parse_pain001, validate, PaymentInitiation};
pub use transactions::{BankTransactionCode, Direction, EntryStatus, NormalizedTransaction};
