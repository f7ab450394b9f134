//! End-to-end tests against the in-process sandbox host
//!
//! The full protocol runs here: real keys, signed envelopes, encrypted
//! and compressed payloads, both directions. Only the network is
//! replaced, by the sandbox loopback transport.

use chrono::Utc;
use moneta_ebics::EbicsTransport;
use moneta_gateway::{
    Clock, ConnectionProtocol, EbicsConfig, Gateway, KeyExchangeState, ManualClock,
    PaymentRequest, Scheduler, SchedulerConfig, TransportFactory,
};
use moneta_iso20022::Direction;
use moneta_sandbox::{DemoAccount, EbicsHost, LoopbackTransport};
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const CONNECTION: &str = "my-ebics";
const IBAN: &str = "GB33BUKB20201555555555";
const BIC: &str = "BUKBGB22";
const HOLDER: &str = "Oliver Smith";
const OTHER_IBAN: &str = "DE75512108001245126199";

/// Factory that can be switched to a dead transport mid-test.
struct SandboxFactory {
    host: Arc<EbicsHost>,
    fail: AtomicBool,
}

struct DeadTransport;

#[async_trait::async_trait]
impl EbicsTransport for DeadTransport {
    async fn post(&self, _body: String) -> moneta_ebics::Result<String> {
        Err(moneta_ebics::Error::Transport("connection refused".to_string()))
    }
}

impl TransportFactory for SandboxFactory {
    fn transport_for(
        &self,
        _config: &EbicsConfig,
    ) -> moneta_gateway::Result<Arc<dyn EbicsTransport>> {
        if self.fail.load(Ordering::Relaxed) {
            Ok(Arc::new(DeadTransport))
        } else {
            Ok(Arc::new(LoopbackTransport::new(self.host.clone())))
        }
    }
}

struct Fixture {
    host: Arc<EbicsHost>,
    gateway: Arc<Gateway>,
    clock: Arc<ManualClock>,
    factory: Arc<SandboxFactory>,
}

async fn fixture() -> Fixture {
    let host = Arc::new(EbicsHost::new("HOST01", "EUR").unwrap());
    host.register_subscriber("PARTNER1", "USER1");
    host.add_account(
        "PARTNER1",
        "USER1",
        DemoAccount {
            iban: IBAN.to_string(),
            bic: BIC.to_string(),
            holder: HOLDER.to_string(),
            currency: "EUR".to_string(),
        },
    );

    // The sandbox books at wall-clock time, so the manual clock starts
    // there too; tests advance it explicitly where pacing matters.
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let factory = Arc::new(SandboxFactory {
        host: host.clone(),
        fail: AtomicBool::new(false),
    });
    let clock_handle: Arc<dyn Clock> = clock.clone();
    let factory_handle: Arc<dyn TransportFactory> = factory.clone();
    let gateway = Arc::new(Gateway::new(clock_handle, factory_handle));

    gateway
        .create_connection(
            CONNECTION,
            ConnectionProtocol::Ebics(EbicsConfig {
                url: "http://localhost:5000/ebicsweb".to_string(),
                host_id: "HOST01".to_string(),
                partner_id: "PARTNER1".to_string(),
                user_id: "USER1".to_string(),
                system_id: None,
            }),
        )
        .await
        .unwrap();
    gateway
        .create_account(CONNECTION, IBAN, BIC, HOLDER)
        .await
        .unwrap();

    Fixture {
        host,
        gateway,
        clock,
        factory,
    }
}

fn payment_request(creditor_bic: &str, currency: &str) -> PaymentRequest {
    PaymentRequest {
        connection_id: CONNECTION.to_string(),
        debtor_iban: IBAN.to_string(),
        creditor_iban: OTHER_IBAN.to_string(),
        creditor_bic: creditor_bic.to_string(),
        creditor_name: "Jane Doe".to_string(),
        amount: dec!(25.50),
        currency: currency.to_string(),
        subject: "rent June".to_string(),
        end_to_end_id: None,
    }
}

#[tokio::test]
async fn hev_probe_reports_h004() {
    let fx = fixture().await;
    let versions = fx.gateway.probe_versions(CONNECTION).await.unwrap();
    assert_eq!(versions, vec![("H004".to_string(), "02.50".to_string())]);
}

#[tokio::test]
async fn hpb_happy_path_stores_the_bank_keys() {
    let fx = fixture().await;
    fx.gateway.connect(CONNECTION).await.unwrap();

    let connection = fx.gateway.connection(CONNECTION).await.unwrap();
    assert_eq!(connection.ini_state, KeyExchangeState::Sent);
    assert_eq!(connection.hia_state, KeyExchangeState::Sent);
    assert!(connection.is_ready());
    assert_eq!(connection.bank_auth.unwrap(), fx.host.bank_auth_public());
    assert_eq!(connection.bank_enc.unwrap(), fx.host.bank_enc_public());
}

#[tokio::test]
async fn hpb_before_ini_and_hia_is_rejected() {
    let fx = fixture().await;
    let err = fx.gateway.fetch_bank_keys(CONNECTION).await.unwrap_err();
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn download_before_hpb_is_a_state_error() {
    let fx = fixture().await;
    let err = fx.gateway.fetch_statements(CONNECTION, None).await.unwrap_err();
    assert!(matches!(err, moneta_gateway::Error::State(_)));
}

#[tokio::test]
async fn submit_ingest_and_reconcile_roundtrip() {
    let fx = fixture().await;
    fx.gateway.connect(CONNECTION).await.unwrap();

    let payment_id = fx
        .gateway
        .prepare_payment(payment_request("SOGEDEFF", "EUR"))
        .await
        .unwrap();

    // First sweep uploads the pain.001.
    let accepted = fx.gateway.submit_pending_payments(CONNECTION).await.unwrap();
    assert_eq!(accepted, 1);
    let payment = fx.gateway.payment(payment_id).await.unwrap();
    assert!(payment.submitted);
    assert!(!payment.invalid);
    assert!(payment.submission_timestamp.is_some());

    // Second sweep is a no-op: submitted=true suppresses resubmission.
    let accepted = fx.gateway.submit_pending_payments(CONNECTION).await.unwrap();
    assert_eq!(accepted, 0);

    // The statement for today carries the booked debit.
    let outcome = fx.gateway.fetch_statements(CONNECTION, None).await.unwrap();
    assert_eq!(outcome.new_messages, 1);
    assert_eq!(outcome.transactions, 1);
    assert_eq!(outcome.reconciled, 1);
    assert_eq!(outcome.quarantined, 0);

    let rows = fx.gateway.transactions_for_account(IBAN).await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.transaction.direction, Direction::Debit);
    assert_eq!(row.transaction.amount, dec!(25.50));
    assert_eq!(row.transaction.subject, "rent June");
    assert_eq!(
        row.transaction.end_to_end_id.as_deref(),
        Some(payment.end_to_end_id.as_str())
    );
    assert_eq!(row.linked_payment, Some(payment_id));

    // Fetching the same range again deduplicates on the bank message id.
    let outcome = fx.gateway.fetch_statements(CONNECTION, None).await.unwrap();
    assert_eq!(outcome.new_messages, 0);
    assert_eq!(outcome.duplicates, 1);
    assert_eq!(fx.gateway.transactions_for_account(IBAN).await.len(), 1);

    let account = fx
        .gateway
        .accounts(CONNECTION)
        .await
        .into_iter()
        .find(|a| a.iban == IBAN)
        .unwrap();
    assert!(account.highest_seen_bank_message_id > 0);
}

#[tokio::test]
async fn forbidden_debtor_marks_the_payment_invalid() {
    let fx = fixture().await;
    fx.gateway.connect(CONNECTION).await.unwrap();

    // Known to the gateway, but the bank never authorised this debtor.
    fx.gateway
        .create_account(CONNECTION, OTHER_IBAN, "SOGEDEFF", "Jane Doe")
        .await
        .unwrap();
    let mut request = payment_request("AGRIFRPP", "EUR");
    request.debtor_iban = OTHER_IBAN.to_string();
    request.creditor_iban = IBAN.to_string();
    let payment_id = fx.gateway.prepare_payment(request).await.unwrap();

    let accepted = fx.gateway.submit_pending_payments(CONNECTION).await.unwrap();
    assert_eq!(accepted, 0);

    let payment = fx.gateway.payment(payment_id).await.unwrap();
    assert!(payment.invalid);
    assert!(!payment.submitted);
    assert!(payment
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("090003"));
}

#[tokio::test]
async fn invalid_bic_poisons_the_payment_once() {
    let fx = fixture().await;
    fx.gateway.connect(CONNECTION).await.unwrap();

    let payment_id = fx
        .gateway
        .prepare_payment(payment_request("not-a-BIC", "EUR"))
        .await
        .unwrap();

    let accepted = fx.gateway.submit_pending_payments(CONNECTION).await.unwrap();
    assert_eq!(accepted, 0);
    let payment = fx.gateway.payment(payment_id).await.unwrap();
    assert!(payment.invalid);

    // A second sweep does not touch the poisoned payment.
    let accepted = fx.gateway.submit_pending_payments(CONNECTION).await.unwrap();
    assert_eq!(accepted, 0);
}

#[tokio::test]
async fn unsupported_currency_is_a_processing_error() {
    let fx = fixture().await;
    fx.gateway.connect(CONNECTION).await.unwrap();

    let payment_id = fx
        .gateway
        .prepare_payment(payment_request("SOGEDEFF", "CHF"))
        .await
        .unwrap();
    fx.gateway.submit_pending_payments(CONNECTION).await.unwrap();

    let payment = fx.gateway.payment(payment_id).await.unwrap();
    assert!(payment.invalid);
    assert!(payment
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("091116"));
}

#[tokio::test]
async fn empty_range_is_success_without_data() {
    let fx = fixture().await;
    fx.gateway.connect(CONNECTION).await.unwrap();

    let range = (
        chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        chrono::NaiveDate::from_ymd_opt(2020, 1, 31).unwrap(),
    );
    let outcome = fx
        .gateway
        .fetch_statements(CONNECTION, Some(range))
        .await
        .unwrap();
    assert_eq!(outcome, moneta_gateway::IngestOutcome::default());
}

#[tokio::test]
async fn htd_imports_the_bank_account_list() {
    let fx = fixture().await;
    fx.gateway.connect(CONNECTION).await.unwrap();

    let imported = fx.gateway.import_accounts(CONNECTION).await.unwrap();
    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].iban, IBAN);
    assert_eq!(imported[0].bic, BIC);
    assert_eq!(imported[0].holder, HOLDER);
}

#[tokio::test]
async fn backup_roundtrip_restores_a_working_connection() {
    let fx = fixture().await;

    let backup = fx.gateway.export_backup(CONNECTION, "secret").await.unwrap();
    assert_eq!(backup.backup_type, "ebics");

    fx.gateway
        .import_backup("my-ebics-restored", &backup, "secret")
        .await
        .unwrap();
    let restored = fx.gateway.connection("my-ebics-restored").await.unwrap();
    assert_eq!(restored.ini_state, KeyExchangeState::Unknown);
    assert_eq!(restored.hia_state, KeyExchangeState::Unknown);

    // The restored keys drive the handshake end to end.
    fx.gateway.connect("my-ebics-restored").await.unwrap();
    assert!(fx
        .gateway
        .connection("my-ebics-restored")
        .await
        .unwrap()
        .is_ready());
}

#[tokio::test]
async fn backup_with_wrong_passphrase_fails() {
    let fx = fixture().await;
    let backup = fx.gateway.export_backup(CONNECTION, "secret").await.unwrap();
    let err = fx
        .gateway
        .import_backup("restored", &backup, "wrong")
        .await
        .unwrap_err();
    assert!(matches!(err, moneta_gateway::Error::Crypto(_)));
}

#[tokio::test]
async fn garbage_documents_are_quarantined_not_dropped() {
    let fx = fixture().await;
    let outcome = fx
        .gateway
        .ingest_document(CONNECTION, "<Document><Broken/></Document>")
        .await
        .unwrap();
    assert_eq!(outcome.quarantined, 1);

    let raw = fx.gateway.raw_messages(CONNECTION).await;
    assert_eq!(raw.len(), 1);
    assert!(raw[0].quarantined);
    assert!(fx.gateway.transactions_for_account(IBAN).await.is_empty());

    // Re-ingesting the same garbage is deduplicated by content.
    let outcome = fx
        .gateway
        .ingest_document(CONNECTION, "<Document><Broken/></Document>")
        .await
        .unwrap();
    assert_eq!(outcome.duplicates, 1);
}

#[tokio::test]
async fn key_rotation_resets_the_handshake() {
    let fx = fixture().await;
    fx.gateway.connect(CONNECTION).await.unwrap();
    assert!(fx.gateway.connection(CONNECTION).await.unwrap().is_ready());

    fx.gateway.rotate_keys(CONNECTION).await.unwrap();
    let connection = fx.gateway.connection(CONNECTION).await.unwrap();
    assert_eq!(connection.ini_state, KeyExchangeState::NotSent);
    assert!(!connection.is_ready());

    // Re-running the handshake with the new keys succeeds.
    fx.gateway.connect(CONNECTION).await.unwrap();
    assert!(fx.gateway.connection(CONNECTION).await.unwrap().is_ready());
}

#[tokio::test]
async fn scheduler_tick_drives_submission_and_ingestion() {
    let fx = fixture().await;
    fx.gateway.connect(CONNECTION).await.unwrap();
    let payment_id = fx
        .gateway
        .prepare_payment(payment_request("SOGEDEFF", "EUR"))
        .await
        .unwrap();

    let scheduler = Scheduler::new(fx.gateway.clone(), SchedulerConfig::default());
    scheduler.tick().await;

    assert_eq!(scheduler.failure_count(), 0);
    let payment = fx.gateway.payment(payment_id).await.unwrap();
    assert!(payment.submitted);
    assert_eq!(fx.gateway.transactions_for_account(IBAN).await.len(), 1);
}

#[tokio::test]
async fn scheduler_swallows_failures_and_backs_off() {
    let fx = fixture().await;
    fx.gateway.connect(CONNECTION).await.unwrap();

    fx.factory.fail.store(true, Ordering::Relaxed);
    let scheduler = Scheduler::new(fx.gateway.clone(), SchedulerConfig::default());

    scheduler.tick().await;
    assert_eq!(scheduler.failure_count(), 1);

    // Still inside the backoff window: the connection is skipped.
    scheduler.tick().await;
    assert_eq!(scheduler.failure_count(), 1);

    // Past the window the scheduler tries again.
    fx.clock.advance(chrono::Duration::seconds(30));
    scheduler.tick().await;
    assert_eq!(scheduler.failure_count(), 2);

    // The bank comes back; the next attempt succeeds and clears backoff.
    fx.factory.fail.store(false, Ordering::Relaxed);
    fx.clock.advance(chrono::Duration::seconds(60));
    scheduler.tick().await;
    assert_eq!(scheduler.failure_count(), 2);
}
