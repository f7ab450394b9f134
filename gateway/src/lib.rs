//! # Moneta gateway
//!
//! The payment lifecycle around the EBICS engine: bank connections with
//! their key handshake, bank accounts, prepared payments and the
//! submission sweep, statement ingestion with deduplication, quarantine
//! and reconciliation, and the scheduler that ticks it all.
//!
//! The JSON HTTP surface and the persistence substrate live outside this
//! crate; [`store::Store`] models the latter as a transactional key/row
//! store.

#![forbid(unsafe_code)]

pub mod backup;
pub mod clock;
pub mod config;
pub mod connections;
pub mod error;
pub mod ingestion;
pub mod payments;
pub mod scheduler;
pub mod store;

pub use backup::EbicsBackup;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GatewayConfig;
pub use connections::{Gateway, HttpTransportFactory, TransportFactory};
pub use error::{Error, Result};
pub use ingestion::IngestOutcome;
pub use payments::PaymentRequest;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{
    BankAccount, BankConnection, ConnectionProtocol, EbicsConfig, KeyExchangeState,
    PreparedPayment, RawBankMessage, TransactionRecord,
};
