//! Statement ingestion and reconciliation
//!
//! Downloads camt documents, stores each verbatim as a raw bank message
//! (deduplicated on the bank's message id), parses new ones into the
//! normalized ledger keyed by (account IBAN, entry reference), and links
//! booked debits back to prepared payments by end-to-end id. Unparseable
//! documents are quarantined, not dropped, so a parser fix can re-ingest
//! them.

use crate::store::{RawBankMessage, TransactionRecord};
use crate::{Error, Gateway, Result};
use chrono::{Duration, NaiveDate};
use moneta_ebics::{EbicsClient, OrderType};
use moneta_iso20022::{parse_camt, Direction, EntryStatus};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Scalar key holding the end of the last fetched range.
pub const LAST_FETCH_END: &str = "last_fetch_end";

/// Counters of one ingestion run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub new_messages: u32,
    pub duplicates: u32,
    pub quarantined: u32,
    pub transactions: u32,
    pub reconciled: u32,
}

impl Gateway {
    /// Fetch statements for `(last_fetch_end, now)` (or the given range)
    /// and ingest them. The connection must be ready.
    pub async fn fetch_statements(
        &self,
        connection_id: &str,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<IngestOutcome> {
        let lock = self.connection_lock(connection_id).await;
        let _guard = lock.lock().await;
        self.fetch_statements_locked(connection_id, range, OrderType::C53)
            .await
    }

    /// Intraday variant of [`Gateway::fetch_statements`] (C52).
    pub async fn fetch_reports(
        &self,
        connection_id: &str,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<IngestOutcome> {
        let lock = self.connection_lock(connection_id).await;
        let _guard = lock.lock().await;
        self.fetch_statements_locked(connection_id, range, OrderType::C52)
            .await
    }

    pub(crate) async fn fetch_statements_locked(
        &self,
        connection_id: &str,
        range: Option<(NaiveDate, NaiveDate)>,
        order_type: OrderType,
    ) -> Result<IngestOutcome> {
        let connection = self.connection(connection_id).await?;
        if !connection.is_ready() {
            return Err(Error::State(format!(
                "connection '{}' has no bank keys yet (run HPB first)",
                connection_id
            )));
        }

        let today = self.clock.now().date_naive();
        let range = match range {
            Some(range) => range,
            None => {
                let start = self
                    .store
                    .read(|state| {
                        state
                            .scalars
                            .get(&(connection_id.to_string(), LAST_FETCH_END.to_string()))
                            .and_then(|value| NaiveDate::parse_from_str(value, "%Y-%m-%d").ok())
                    })
                    .await
                    .unwrap_or_else(|| today - Duration::days(self.fetch_window_days));
                (start, today)
            }
        };

        let (subscriber, transport) = self.ebics_session(connection_id).await?;
        let client = EbicsClient::new(transport.as_ref(), &subscriber);
        let documents = client
            .download_documents(order_type, Some(range), self.clock.now())
            .await?;

        let mut outcome = IngestOutcome::default();
        for document in &documents {
            self.ingest_one(connection_id, document, &mut outcome).await;
        }

        self.store
            .write(|state| {
                state.set_scalar(
                    connection_id,
                    LAST_FETCH_END,
                    range.1.format("%Y-%m-%d").to_string(),
                )
            })
            .await;

        info!(
            connection = %connection_id,
            order = %order_type,
            new = outcome.new_messages,
            duplicates = outcome.duplicates,
            quarantined = outcome.quarantined,
            transactions = outcome.transactions,
            reconciled = outcome.reconciled,
            "ingestion complete"
        );
        Ok(outcome)
    }

    /// Ingest one camt document directly (admin/re-ingest seam).
    pub async fn ingest_document(
        &self,
        connection_id: &str,
        xml: &str,
    ) -> Result<IngestOutcome> {
        self.connection(connection_id).await?;
        let lock = self.connection_lock(connection_id).await;
        let _guard = lock.lock().await;
        let mut outcome = IngestOutcome::default();
        self.ingest_one(connection_id, xml, &mut outcome).await;
        Ok(outcome)
    }

    /// Store, deduplicate and normalize one document. Parse failures
    /// quarantine the raw message and never propagate.
    async fn ingest_one(&self, connection_id: &str, xml: &str, outcome: &mut IngestOutcome) {
        match parse_camt(xml) {
            Ok(document) => {
                let stats = self
                    .store
                    .write(|state| {
                        let key = (connection_id.to_string(), document.message_id.clone());
                        if state.raw_messages.contains_key(&key) {
                            return (0u32, 0u32, true);
                        }
                        let sequence = state.next_message_sequence(connection_id);
                        state.raw_messages.insert(
                            key,
                            RawBankMessage {
                                connection_id: connection_id.to_string(),
                                message_id: document.message_id.clone(),
                                sequence,
                                xml: xml.to_string(),
                                quarantined: false,
                            },
                        );

                        let mut upserted = 0u32;
                        let mut reconciled = 0u32;
                        for tx in document.transactions() {
                            let row_key = (tx.account_iban.clone(), tx.entry_ref.clone());
                            let existing_link = state
                                .transactions
                                .get(&row_key)
                                .and_then(|record| record.linked_payment);

                            let mut record = TransactionRecord {
                                connection_id: connection_id.to_string(),
                                transaction: tx.clone(),
                                linked_payment: existing_link,
                            };

                            if record.linked_payment.is_none()
                                && tx.direction == Direction::Debit
                                && tx.status == EntryStatus::Booked
                            {
                                if let Some(end_to_end) = &tx.end_to_end_id {
                                    let matched = state
                                        .payments
                                        .values()
                                        .find(|p| {
                                            p.connection_id == connection_id
                                                && p.end_to_end_id == *end_to_end
                                        })
                                        .map(|p| p.payment_id);
                                    if let Some(payment_id) = matched {
                                        record.linked_payment = Some(payment_id);
                                        reconciled += 1;
                                    }
                                }
                            }

                            state.transactions.insert(row_key, record);
                            upserted += 1;

                            if let Some(account) = state.accounts.get_mut(&tx.account_iban) {
                                if sequence > account.highest_seen_bank_message_id {
                                    account.highest_seen_bank_message_id = sequence;
                                }
                            }
                        }
                        (upserted, reconciled, false)
                    })
                    .await;

                let (upserted, reconciled, duplicate) = stats;
                if duplicate {
                    outcome.duplicates += 1;
                } else {
                    outcome.new_messages += 1;
                    outcome.transactions += upserted;
                    outcome.reconciled += reconciled;
                }
            }
            Err(err) => {
                warn!(connection = %connection_id, "quarantining unparseable bank message: {}", err);
                let digest = Sha256::digest(xml.as_bytes());
                let fallback_id: String = digest
                    .iter()
                    .take(8)
                    .map(|b| format!("{:02x}", b))
                    .collect();
                let message_id = format!("unparsed-{}", fallback_id);

                let duplicate = self
                    .store
                    .write(|state| {
                        let key = (connection_id.to_string(), message_id.clone());
                        if state.raw_messages.contains_key(&key) {
                            return true;
                        }
                        let sequence = state.next_message_sequence(connection_id);
                        state.raw_messages.insert(
                            key,
                            RawBankMessage {
                                connection_id: connection_id.to_string(),
                                message_id,
                                sequence,
                                xml: xml.to_string(),
                                quarantined: true,
                            },
                        );
                        false
                    })
                    .await;
                if duplicate {
                    outcome.duplicates += 1;
                } else {
                    outcome.quarantined += 1;
                }
            }
        }
    }

    /// Raw bank messages of one connection, audit view.
    pub async fn raw_messages(&self, connection_id: &str) -> Vec<crate::store::RawBankMessage> {
        self.store
            .read(|state| {
                let mut messages: Vec<_> = state
                    .raw_messages
                    .values()
                    .filter(|message| message.connection_id == connection_id)
                    .cloned()
                    .collect();
                messages.sort_by_key(|message| message.sequence);
                messages
            })
            .await
    }

    /// Ledger rows of one account.
    pub async fn transactions_for_account(&self, iban: &str) -> Vec<TransactionRecord> {
        self.store
            .read(|state| {
                state
                    .transactions
                    .values()
                    .filter(|record| record.transaction.account_iban == iban)
                    .cloned()
                    .collect()
            })
            .await
    }
}
