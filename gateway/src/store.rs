//! Persistent state, modelled in memory
//!
//! The real deployment owns a transactional key/row store; this module
//! stands in for it with typed tables behind one `RwLock`. A closure
//! passed to [`Store::read`]/[`Store::write`] is one transaction; the
//! per-connection mutex in the gateway serializes multi-step flows that
//! span transactions.

use chrono::{DateTime, Utc};
use moneta_ebics::keys::KeyPair;
use moneta_iso20022::NormalizedTransaction;
use rsa::RsaPublicKey;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// INI/HIA progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyExchangeState {
    /// Not known, e.g. right after a backup import
    Unknown,
    /// Keys exist locally but were never sent
    NotSent,
    /// The bank accepted the upload
    Sent,
}

/// EBICS parameters of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EbicsConfig {
    pub url: String,
    pub host_id: String,
    pub partner_id: String,
    pub user_id: String,
    pub system_id: Option<String>,
}

/// Which upstream dialect a connection speaks. Loopback is a stub kept
/// for wiring tests of the surrounding machinery.
#[derive(Debug, Clone)]
pub enum ConnectionProtocol {
    Ebics(EbicsConfig),
    Loopback,
}

/// A named bank connection with its key material and subscriber state.
#[derive(Debug, Clone)]
pub struct BankConnection {
    pub connection_id: String,
    pub protocol: ConnectionProtocol,
    pub auth_key: KeyPair,
    pub enc_key: KeyPair,
    pub sig_key: KeyPair,
    pub bank_auth: Option<RsaPublicKey>,
    pub bank_enc: Option<RsaPublicKey>,
    pub ini_state: KeyExchangeState,
    pub hia_state: KeyExchangeState,
}

impl BankConnection {
    /// Data exchange is possible once HPB delivered both bank keys.
    pub fn is_ready(&self) -> bool {
        self.bank_auth.is_some() && self.bank_enc.is_some()
    }
}

/// A bank account bound to a connection.
#[derive(Debug, Clone)]
pub struct BankAccount {
    pub connection_id: String,
    pub iban: String,
    pub bic: String,
    pub holder: String,
    /// Ingest sequence of the newest raw message that touched this
    /// account; advances atomically with ingestion.
    pub highest_seen_bank_message_id: u64,
}

/// A locally prepared credit transfer awaiting upload.
#[derive(Debug, Clone)]
pub struct PreparedPayment {
    pub payment_id: Uuid,
    pub connection_id: String,
    pub debtor_iban: String,
    pub creditor_iban: String,
    pub creditor_bic: String,
    pub creditor_name: String,
    pub amount: Decimal,
    pub currency: String,
    pub subject: String,
    pub prepared_at: DateTime<Utc>,
    pub end_to_end_id: String,
    pub payment_information_id: String,
    /// pain.001 MsgId of the most recent submission attempt
    pub message_id: String,
    pub submitted: bool,
    pub invalid: bool,
    pub submission_timestamp: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// One downloaded camt document, kept verbatim for audit.
#[derive(Debug, Clone)]
pub struct RawBankMessage {
    pub connection_id: String,
    /// Bank-assigned message id; dedup key within the connection
    pub message_id: String,
    /// Per-connection ingest sequence, strictly monotonic
    pub sequence: u64,
    pub xml: String,
    /// Stored but not parsed into the ledger; re-ingestable after a fix
    pub quarantined: bool,
}

/// One normalized ledger row, with its reconciliation link.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub connection_id: String,
    pub transaction: NormalizedTransaction,
    /// Set exactly once, when a booked debit matches a prepared payment
    pub linked_payment: Option<Uuid>,
}

/// All tables.
#[derive(Default)]
pub struct StoreState {
    pub connections: HashMap<String, BankConnection>,
    /// Keyed by IBAN
    pub accounts: HashMap<String, BankAccount>,
    pub payments: HashMap<Uuid, PreparedPayment>,
    /// Keyed by (connection id, bank message id)
    pub raw_messages: HashMap<(String, String), RawBankMessage>,
    /// Keyed by (account IBAN, bank entry reference)
    pub transactions: HashMap<(String, String), TransactionRecord>,
    /// Per-connection scalar state, e.g. the end of the last fetch range
    pub scalars: HashMap<(String, String), String>,
    message_sequences: HashMap<String, u64>,
}

impl StoreState {
    /// Next ingest sequence for a connection.
    pub fn next_message_sequence(&mut self, connection_id: &str) -> u64 {
        let counter = self
            .message_sequences
            .entry(connection_id.to_string())
            .or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn scalar(&self, connection_id: &str, key: &str) -> Option<&str> {
        self.scalars
            .get(&(connection_id.to_string(), key.to_string()))
            .map(String::as_str)
    }

    pub fn set_scalar(&mut self, connection_id: &str, key: &str, value: String) {
        self.scalars
            .insert((connection_id.to_string(), key.to_string()), value);
    }
}

/// The transactional store.
#[derive(Default)]
pub struct Store {
    state: RwLock<StoreState>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// One read transaction.
    pub async fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        let state = self.state.read().await;
        f(&state)
    }

    /// One write transaction; the closure sees a consistent snapshot and
    /// its updates become visible atomically.
    pub async fn write<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut state = self.state.write().await;
        f(&mut state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_sequences_are_monotonic_per_connection() {
        let store = Store::new();
        let (a1, a2, b1) = store
            .write(|state| {
                (
                    state.next_message_sequence("a"),
                    state.next_message_sequence("a"),
                    state.next_message_sequence("b"),
                )
            })
            .await;
        assert_eq!((a1, a2, b1), (1, 2, 1));
    }

    #[tokio::test]
    async fn scalars_roundtrip() {
        let store = Store::new();
        store
            .write(|state| state.set_scalar("conn", "last_fetch_end", "2024-06-01".to_string()))
            .await;
        let value = store
            .read(|state| state.scalar("conn", "last_fetch_end").map(str::to_string))
            .await;
        assert_eq!(value.as_deref(), Some("2024-06-01"));
    }
}
