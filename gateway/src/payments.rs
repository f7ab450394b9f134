//! Prepared payments and the submission sweep
//!
//! A payment is immutable at creation except for its lifecycle flags.
//! Submission selects `submitted=false AND invalid=false`, re-serializes
//! the pain.001 with a fresh MsgId, and uploads CCT. Fatal bank codes
//! poison the payment (`invalid=true`); transient failures leave it for
//! the next tick.

use crate::store::{BankAccount, PreparedPayment};
use crate::{Error, Gateway, Result};
use chrono::{DateTime, Utc};
use moneta_iso20022::{emit_pain001, PaymentInitiation};
use moneta_ebics::{EbicsClient, OrderType};
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

/// Caller-facing payment creation request.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub connection_id: String,
    pub debtor_iban: String,
    pub creditor_iban: String,
    pub creditor_bic: String,
    pub creditor_name: String,
    pub amount: Decimal,
    pub currency: String,
    pub subject: String,
    /// Generated when absent, so reconciliation always has a handle
    pub end_to_end_id: Option<String>,
}

impl Gateway {
    /// Persist a prepared payment. Local checks cover what the gateway
    /// can know (debtor account, amount and currency shape, non-empty
    /// fields); creditor IBAN/BIC are ultimately the bank's verdict and
    /// surface through submission.
    pub async fn prepare_payment(&self, request: PaymentRequest) -> Result<Uuid> {
        if request.amount <= Decimal::ZERO {
            return Err(Error::BadRequest(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        if request.currency.len() != 3
            || !request.currency.chars().all(|c| c.is_ascii_uppercase())
        {
            return Err(Error::BadRequest(format!(
                "invalid currency code: {}",
                request.currency
            )));
        }
        for (label, value) in [
            ("creditor IBAN", &request.creditor_iban),
            ("creditor BIC", &request.creditor_bic),
            ("creditor name", &request.creditor_name),
        ] {
            if value.trim().is_empty() {
                return Err(Error::BadRequest(format!("missing {}", label)));
            }
        }
        self.connection(&request.connection_id).await?;

        let payment_id = Uuid::new_v4();
        let prepared_at = self.clock.now();
        let payment = PreparedPayment {
            payment_id,
            connection_id: request.connection_id.clone(),
            debtor_iban: request.debtor_iban.clone(),
            creditor_iban: request.creditor_iban,
            creditor_bic: request.creditor_bic,
            creditor_name: request.creditor_name,
            amount: request.amount,
            currency: request.currency,
            subject: request.subject,
            prepared_at,
            end_to_end_id: request
                .end_to_end_id
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            payment_information_id: Uuid::new_v4().simple().to_string(),
            message_id: Uuid::new_v4().simple().to_string(),
            submitted: false,
            invalid: false,
            submission_timestamp: None,
            failure_reason: None,
        };

        let debtor_iban = request.debtor_iban;
        let connection_id = request.connection_id;
        self.store
            .write(|state| {
                let account = state.accounts.get(&debtor_iban).ok_or_else(|| {
                    Error::NotFound(format!("bank account '{}'", debtor_iban))
                })?;
                if account.connection_id != connection_id {
                    return Err(Error::BadRequest(format!(
                        "account '{}' does not belong to connection '{}'",
                        debtor_iban, connection_id
                    )));
                }
                state.payments.insert(payment_id, payment);
                Ok(())
            })
            .await?;
        info!(payment = %payment_id, "payment prepared");
        Ok(payment_id)
    }

    pub async fn payment(&self, payment_id: Uuid) -> Result<PreparedPayment> {
        self.store
            .read(|state| {
                state
                    .payments
                    .get(&payment_id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("payment '{}'", payment_id)))
            })
            .await
    }

    /// Submit every pending payment of a connection; returns how many the
    /// bank accepted. Transient failures abort the sweep (the tick
    /// retries); fatal bank codes mark the individual payment invalid.
    pub async fn submit_pending_payments(&self, connection_id: &str) -> Result<u32> {
        let lock = self.connection_lock(connection_id).await;
        let _guard = lock.lock().await;
        self.submit_pending_locked(connection_id).await
    }

    pub(crate) async fn submit_pending_locked(&self, connection_id: &str) -> Result<u32> {
        let pending: Vec<PreparedPayment> = self
            .store
            .read(|state| {
                state
                    .payments
                    .values()
                    .filter(|p| {
                        p.connection_id == connection_id && !p.submitted && !p.invalid
                    })
                    .cloned()
                    .collect()
            })
            .await;
        if pending.is_empty() {
            return Ok(0);
        }

        let (subscriber, transport) = self.ebics_session(connection_id).await?;
        let client = EbicsClient::new(transport.as_ref(), &subscriber);
        let mut accepted = 0;

        for payment in pending {
            let account = self
                .store
                .read(|state| state.accounts.get(&payment.debtor_iban).cloned())
                .await
                .ok_or_else(|| {
                    Error::NotFound(format!("bank account '{}'", payment.debtor_iban))
                })?;

            // A fresh MsgId per attempt keeps retried uploads unambiguous
            // on the bank side.
            let message_id = Uuid::new_v4().simple().to_string();
            self.store
                .write(|state| {
                    if let Some(p) = state.payments.get_mut(&payment.payment_id) {
                        p.message_id = message_id.clone();
                    }
                })
                .await;

            let now = self.clock.now();
            let initiation = initiation_for(&payment, &account, &message_id, now);
            let pain_xml = emit_pain001(&initiation)?;

            match client.upload(OrderType::Cct, pain_xml.as_bytes(), now).await {
                Ok(()) => {
                    self.store
                        .write(|state| {
                            if let Some(p) = state.payments.get_mut(&payment.payment_id) {
                                p.submitted = true;
                                p.submission_timestamp = Some(now);
                            }
                        })
                        .await;
                    accepted += 1;
                    info!(payment = %payment.payment_id, "payment submitted");
                }
                Err(err) => {
                    let err: Error = err.into();
                    if err.is_retryable() {
                        // Next tick retries the whole sweep.
                        return Err(err);
                    }
                    let reason = err.to_string();
                    warn!(payment = %payment.payment_id, %reason, "payment rejected, marking invalid");
                    self.store
                        .write(|state| {
                            if let Some(p) = state.payments.get_mut(&payment.payment_id) {
                                p.invalid = true;
                                p.failure_reason = Some(reason.clone());
                            }
                        })
                        .await;
                }
            }
        }
        Ok(accepted)
    }
}

fn initiation_for(
    payment: &PreparedPayment,
    account: &BankAccount,
    message_id: &str,
    now: DateTime<Utc>,
) -> PaymentInitiation {
    PaymentInitiation {
        message_id: message_id.to_string(),
        payment_information_id: payment.payment_information_id.clone(),
        end_to_end_id: Some(payment.end_to_end_id.clone()),
        creation_timestamp: now,
        execution_date: now.date_naive(),
        debtor_name: account.holder.clone(),
        debtor_iban: account.iban.clone(),
        debtor_bic: account.bic.clone(),
        creditor_name: payment.creditor_name.clone(),
        creditor_iban: payment.creditor_iban.clone(),
        creditor_bic: payment.creditor_bic.clone(),
        amount: payment.amount,
        currency: payment.currency.clone(),
        subject: payment.subject.clone(),
    }
}
