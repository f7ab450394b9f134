//! The EBICS host simulator
//!
//! Speaks the server side of every exchange the client engine knows:
//! HEV, INI/HIA/HPB, signed download transactions (C52/C53/HTD) and
//! signed uploads (CCT), with real key material and the same envelope
//! module as the client. State lives in memory; admin seams replace the
//! real bank's operator console.

use crate::ledger::{DemoAccount, DemoLedger};
use moneta_ebics::envelope::{
    self, EbicsClientRequest, HtdAccount, ResponseSpec, SubscriberIds, TransactionPhase,
};
use moneta_ebics::keys::{self, KeyPair};
use moneta_ebics::{pack, retcodes, EbicsTransport, OrderType, ReturnCode};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use moneta_xml::Element;
use rsa::RsaPublicKey;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// EBICS_SIGNATURE_VERIFICATION_FAILED; fatal class, order signature did
/// not match the INI key.
const SIGNATURE_VERIFICATION_FAILED: &str = "091301";

/// Ciphertext bytes served per download segment.
const SEGMENT_SIZE: usize = 1024 * 1024;

#[derive(Debug, Default)]
struct SubscriberState {
    sig_pub: Option<RsaPublicKey>,
    auth_pub: Option<RsaPublicKey>,
    enc_pub: Option<RsaPublicKey>,
    account_ibans: Vec<String>,
}

impl SubscriberState {
    fn initialised(&self) -> bool {
        self.sig_pub.is_some() && self.auth_pub.is_some() && self.enc_pub.is_some()
    }
}

enum Session {
    Download {
        subscriber: (String, String),
        segments: Vec<String>,
    },
    Upload {
        subscriber: (String, String),
        num_segments: u32,
        transaction_key: Vec<u8>,
        signature_data: Vec<u8>,
        chunks: Vec<Vec<u8>>,
    },
}

struct HostState {
    subscribers: HashMap<(String, String), SubscriberState>,
    sessions: HashMap<String, Session>,
    processed_message_ids: HashSet<String>,
    ledger: DemoLedger,
}

/// One simulated EBICS host plus its demo bank.
pub struct EbicsHost {
    host_id: String,
    auth_key: KeyPair,
    enc_key: KeyPair,
    state: Mutex<HostState>,
}

impl EbicsHost {
    pub fn new(host_id: impl Into<String>, accepted_currency: impl Into<String>) -> moneta_ebics::Result<Self> {
        Ok(Self {
            host_id: host_id.into(),
            auth_key: KeyPair::generate()?,
            enc_key: KeyPair::generate()?,
            state: Mutex::new(HostState {
                subscribers: HashMap::new(),
                sessions: HashMap::new(),
                processed_message_ids: HashSet::new(),
                ledger: DemoLedger::new(accepted_currency),
            }),
        })
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// The bank's X002 public key, as HPB will deliver it.
    pub fn bank_auth_public(&self) -> RsaPublicKey {
        self.auth_key.public().clone()
    }

    /// The bank's E002 public key, as HPB will deliver it.
    pub fn bank_enc_public(&self) -> RsaPublicKey {
        self.enc_key.public().clone()
    }

    /// Admin seam: create a subscriber (the real bank does this out of
    /// band when the contract is signed).
    pub fn register_subscriber(&self, partner_id: &str, user_id: &str) {
        let mut state = self.state.lock().expect("host state");
        state
            .subscribers
            .entry((partner_id.to_string(), user_id.to_string()))
            .or_default();
    }

    /// Admin seam: attach a bank account to a subscriber.
    pub fn add_account(&self, partner_id: &str, user_id: &str, account: DemoAccount) {
        let mut state = self.state.lock().expect("host state");
        if let Some(subscriber) = state
            .subscribers
            .get_mut(&(partner_id.to_string(), user_id.to_string()))
        {
            subscriber.account_ibans.push(account.iban.clone());
        }
        state.ledger.add_account(account);
    }

    /// Test seam: mutate the demo ledger directly.
    pub fn with_ledger<R>(&self, f: impl FnOnce(&mut DemoLedger) -> R) -> R {
        let mut state = self.state.lock().expect("host state");
        f(&mut state.ledger)
    }

    /// Handle one POSTed EBICS document and produce the response body.
    pub fn handle(&self, request_xml: &str) -> String {
        let root_name = match Element::parse(request_xml) {
            Ok(root) => root.local_name().to_string(),
            Err(err) => {
                warn!("unparseable request: {}", err);
                return self.km_error(retcodes::INVALID_REQUEST, "request is not XML");
            }
        };
        match root_name.as_str() {
            "ebicsHEVRequest" => self.handle_hev(request_xml),
            "ebicsUnsecuredRequest" => self.handle_unsecured(request_xml),
            "ebicsNoPubKeyDigestsRequest" => self.handle_hpb(request_xml),
            "ebicsRequest" => self.handle_request(request_xml),
            other => {
                warn!("unsupported request root '{}'", other);
                self.km_error(retcodes::INVALID_REQUEST, "unsupported request type")
            }
        }
    }

    fn handle_hev(&self, request_xml: &str) -> String {
        match envelope::parse_hev_request(request_xml) {
            Ok(host_id) if host_id == self.host_id => envelope::hev_response(&[(
                "H004".to_string(),
                "02.50".to_string(),
            )])
            .to_document(),
            _ => self.km_error(retcodes::INVALID_REQUEST, "unknown host"),
        }
    }

    fn handle_unsecured(&self, request_xml: &str) -> String {
        let request = match envelope::parse_unsecured_request(request_xml) {
            Ok(request) => request,
            Err(err) => {
                return self.km_error(retcodes::INVALID_REQUEST, &err.to_string());
            }
        };
        let key = (request.ids.partner_id.clone(), request.ids.user_id.clone());
        let order_xml = match String::from_utf8(request.order_data) {
            Ok(xml) => xml,
            Err(_) => {
                return self.km_error(retcodes::INVALID_ORDER_DATA_FORMAT, "order data not UTF-8");
            }
        };

        let mut state = self.state.lock().expect("host state");
        let Some(subscriber) = state.subscribers.get_mut(&key) else {
            return self.km_error(retcodes::INVALID_USER_OR_USER_STATE, "unknown subscriber");
        };

        let outcome = match request.order_type {
            OrderType::Ini => envelope::parse_signature_pubkey_order_data(&order_xml)
                .map(|public| subscriber.sig_pub = Some(public)),
            OrderType::Hia => envelope::parse_hia_order_data(&order_xml).map(|(auth, enc)| {
                subscriber.auth_pub = Some(auth);
                subscriber.enc_pub = Some(enc);
            }),
            other => {
                return self.km_error(
                    retcodes::INVALID_REQUEST,
                    &format!("order type {} is not a key upload", other),
                );
            }
        };

        match outcome {
            Ok(()) => {
                info!(order = %request.order_type, user = %key.1, "key upload accepted");
                self.km_ok(None)
            }
            Err(err) => self.km_error(retcodes::INVALID_ORDER_DATA_FORMAT, &err.to_string()),
        }
    }

    fn handle_hpb(&self, request_xml: &str) -> String {
        let ids = match envelope::parse_hpb_request(request_xml) {
            Ok(ids) => ids,
            Err(err) => return self.km_error(retcodes::INVALID_REQUEST, &err.to_string()),
        };
        let key = (ids.partner_id.clone(), ids.user_id.clone());

        let state = self.state.lock().expect("host state");
        let Some(subscriber) = state.subscribers.get(&key) else {
            return self.km_error(retcodes::INVALID_USER_OR_USER_STATE, "unknown subscriber");
        };
        if !subscriber.initialised() {
            return self.km_error(
                retcodes::INVALID_USER_OR_USER_STATE,
                "INI and HIA must be accepted first",
            );
        }
        let enc_pub = subscriber.enc_pub.clone().expect("checked above");
        drop(state);

        let order_data = envelope::hpb_order_data(
            &self.host_id,
            self.auth_key.public(),
            self.enc_key.public(),
        )
        .to_document();
        match keys::encrypt_e002(&pack::deflate(order_data.as_bytes()), &enc_pub) {
            Ok(payload) => self.km_ok(Some(&payload)),
            Err(err) => self.km_error(retcodes::INTERNAL_ERROR, &err.to_string()),
        }
    }

    fn handle_request(&self, request_xml: &str) -> String {
        let request = match envelope::parse_request(request_xml) {
            Ok(request) => request,
            Err(err) => {
                return self.signed_error(retcodes::INVALID_REQUEST, &err.to_string());
            }
        };
        if request.host_id != self.host_id {
            return self.signed_error(retcodes::INVALID_REQUEST, "unknown host");
        }
        match request.phase {
            TransactionPhase::Initialisation => self.handle_init(request),
            TransactionPhase::Transfer => self.handle_transfer(request),
            TransactionPhase::Receipt => self.handle_receipt(request),
        }
    }

    fn handle_init(&self, request: EbicsClientRequest) -> String {
        let Some(ids) = request.ids.clone() else {
            return self.signed_error(retcodes::INVALID_REQUEST, "initialisation without ids");
        };
        let key = (ids.partner_id.clone(), ids.user_id.clone());

        let auth_pub = {
            let state = self.state.lock().expect("host state");
            let Some(subscriber) = state.subscribers.get(&key) else {
                return self.business_error(
                    retcodes::INVALID_USER_OR_USER_STATE,
                    TransactionPhase::Initialisation,
                    "unknown subscriber",
                );
            };
            match &subscriber.auth_pub {
                Some(public) => public.clone(),
                None => {
                    return self.business_error(
                        retcodes::INVALID_USER_OR_USER_STATE,
                        TransactionPhase::Initialisation,
                        "subscriber keys not initialised",
                    );
                }
            }
        };
        if let Err(err) = envelope::verify_envelope(&request.envelope, &auth_pub) {
            return self.signed_error(retcodes::AUTHENTICATION_FAILED, &err.to_string());
        }

        match request.order_type {
            Some(OrderType::C52) | Some(OrderType::C53) | Some(OrderType::Htd) => {
                self.start_download(&ids, &request)
            }
            Some(OrderType::Cct) => self.start_upload(&key, &request),
            _ => self.signed_error(retcodes::INVALID_REQUEST, "unsupported order type"),
        }
    }

    fn start_download(&self, ids: &SubscriberIds, request: &EbicsClientRequest) -> String {
        let key = (ids.partner_id.clone(), ids.user_id.clone());
        let now = Utc::now();

        let state = self.state.lock().expect("host state");
        let subscriber = state.subscribers.get(&key).expect("checked by caller");
        let enc_pub = subscriber.enc_pub.clone().expect("checked by caller");

        let payload = match request.order_type.expect("checked by caller") {
            OrderType::Htd => {
                let accounts: Vec<HtdAccount> = subscriber
                    .account_ibans
                    .iter()
                    .filter_map(|iban| state.ledger.account(iban))
                    .map(|account| HtdAccount {
                        iban: account.iban.clone(),
                        bic: account.bic.clone(),
                        holder: account.holder.clone(),
                        currency: Some(account.currency.clone()),
                    })
                    .collect();
                envelope::htd_order_data(&ids.user_id, &accounts)
                    .to_document()
                    .into_bytes()
            }
            _ => {
                // The demo ledger reports the same booked entries for the
                // intraday (C52) and end-of-day (C53) orders.
                let statements =
                    state
                        .ledger
                        .statements(&subscriber.account_ibans, request.date_range, now);
                if statements.is_empty() {
                    drop(state);
                    return self.business_error(
                        retcodes::NO_DOWNLOAD_DATA_AVAILABLE,
                        TransactionPhase::Initialisation,
                        "no documents in range",
                    );
                }
                let documents: Vec<(String, Vec<u8>)> = statements
                    .into_iter()
                    .map(|(message_id, xml)| (format!("{}.xml", message_id), xml.into_bytes()))
                    .collect();
                match pack::zip_pack(&documents) {
                    Ok(archive) => archive,
                    Err(err) => {
                        drop(state);
                        return self.signed_error(retcodes::INTERNAL_ERROR, &err.to_string());
                    }
                }
            }
        };
        drop(state);

        let envelope_data = match keys::encrypt_e002(&pack::deflate(&payload), &enc_pub) {
            Ok(data) => data,
            Err(err) => return self.signed_error(retcodes::INTERNAL_ERROR, &err.to_string()),
        };
        let segments: Vec<String> = envelope_data
            .ciphertext
            .chunks(SEGMENT_SIZE)
            .map(|chunk| BASE64.encode(chunk))
            .collect();
        let total = segments.len() as u32;
        let transaction_id = Uuid::new_v4().simple().to_string();

        let mut state = self.state.lock().expect("host state");
        state.sessions.insert(
            transaction_id.clone(),
            Session::Download {
                subscriber: key,
                segments: segments.clone(),
            },
        );
        drop(state);

        self.signed_response(&ResponseSpec {
            transaction_id: Some(transaction_id),
            num_segments: Some(total),
            phase: Some(TransactionPhase::Initialisation),
            segment_number: Some((1, total == 1)),
            order_data_b64: Some(segments[0].clone()),
            encryption: Some((
                BASE64.encode(envelope_data.recipient_key_digest),
                BASE64.encode(&envelope_data.wrapped_key),
            )),
            ..ResponseSpec::default()
        })
    }

    fn start_upload(&self, key: &(String, String), request: &EbicsClientRequest) -> String {
        let (Some(transaction_key), Some(signature_data)) = (
            request.transaction_key.clone(),
            request.signature_data.clone(),
        ) else {
            return self.signed_error(
                retcodes::INVALID_ORDER_DATA_FORMAT,
                "upload without encryption info",
            );
        };
        let transaction_id = Uuid::new_v4().simple().to_string();

        let mut state = self.state.lock().expect("host state");
        state.sessions.insert(
            transaction_id.clone(),
            Session::Upload {
                subscriber: key.clone(),
                num_segments: request.num_segments.unwrap_or(1),
                transaction_key,
                signature_data,
                chunks: Vec::new(),
            },
        );
        drop(state);

        self.signed_response(&ResponseSpec {
            transaction_id: Some(transaction_id),
            phase: Some(TransactionPhase::Initialisation),
            ..ResponseSpec::default()
        })
    }

    fn handle_transfer(&self, request: EbicsClientRequest) -> String {
        let Some(transaction_id) = request.transaction_id.clone() else {
            return self.signed_error(retcodes::INVALID_REQUEST, "transfer without transaction id");
        };
        let Some(segment) = request.segment_number else {
            return self.signed_error(retcodes::INVALID_REQUEST, "transfer without segment number");
        };

        let mut guard = self.state.lock().expect("host state");
        let state = &mut *guard;
        if let Err(response) = self.verify_session_envelope(state, &transaction_id, &request) {
            return response;
        }
        let Some(session) = state.sessions.get_mut(&transaction_id) else {
            return self.signed_error(retcodes::INVALID_REQUEST, "unknown transaction");
        };

        match session {
            Session::Download { segments, .. } => {
                let total = segments.len() as u32;
                let Some(body) = segments.get(segment as usize - 1).cloned() else {
                    return self.signed_error(retcodes::INVALID_REQUEST, "segment out of range");
                };
                self.signed_response(&ResponseSpec {
                    transaction_id: Some(transaction_id),
                    phase: Some(TransactionPhase::Transfer),
                    segment_number: Some((segment, segment == total)),
                    order_data_b64: Some(body),
                    ..ResponseSpec::default()
                })
            }
            Session::Upload {
                subscriber,
                num_segments,
                transaction_key,
                signature_data,
                chunks,
            } => {
                let Some(chunk) = request.order_data.clone() else {
                    return self.signed_error(
                        retcodes::INVALID_ORDER_DATA_FORMAT,
                        "upload transfer without order data",
                    );
                };
                chunks.push(chunk);
                let complete = request.last_segment || chunks.len() as u32 >= *num_segments;
                if !complete {
                    return self.signed_response(&ResponseSpec {
                        transaction_id: Some(transaction_id),
                        phase: Some(TransactionPhase::Transfer),
                        segment_number: Some((segment, false)),
                        ..ResponseSpec::default()
                    });
                }

                let subscriber = subscriber.clone();
                let transaction_key = transaction_key.clone();
                let signature_data = signature_data.clone();
                let ciphertext: Vec<u8> = chunks.concat();
                state.sessions.remove(&transaction_id);

                let outcome = self.process_upload(
                    state,
                    &subscriber,
                    &transaction_key,
                    &signature_data,
                    &ciphertext,
                );
                match outcome {
                    Ok(()) => self.signed_response(&ResponseSpec {
                        transaction_id: Some(transaction_id),
                        phase: Some(TransactionPhase::Transfer),
                        segment_number: Some((segment, true)),
                        ..ResponseSpec::default()
                    }),
                    Err(code) => {
                        self.business_error(code, TransactionPhase::Transfer, "order rejected")
                    }
                }
            }
        }
    }

    /// Every transfer and receipt must be signed by the same subscriber
    /// that opened the session.
    fn verify_session_envelope(
        &self,
        state: &HostState,
        transaction_id: &str,
        request: &EbicsClientRequest,
    ) -> std::result::Result<(), String> {
        let Some(session) = state.sessions.get(transaction_id) else {
            return Err(self.signed_error(retcodes::INVALID_REQUEST, "unknown transaction"));
        };
        let subscriber = match session {
            Session::Download { subscriber, .. } | Session::Upload { subscriber, .. } => subscriber,
        };
        let auth_pub = state
            .subscribers
            .get(subscriber)
            .and_then(|s| s.auth_pub.clone());
        let Some(auth_pub) = auth_pub else {
            return Err(self.signed_error(
                retcodes::INVALID_USER_OR_USER_STATE,
                "subscriber keys not initialised",
            ));
        };
        envelope::verify_envelope(&request.envelope, &auth_pub)
            .map_err(|err| self.signed_error(retcodes::AUTHENTICATION_FAILED, &err.to_string()))
    }

    /// Decrypt, verify and book an uploaded pain.001. Returns the
    /// business return code on rejection.
    fn process_upload(
        &self,
        state: &mut HostState,
        subscriber: &(String, String),
        transaction_key: &[u8],
        signature_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<(), &'static str> {
        let session_key = self
            .enc_key
            .unwrap_transaction_key(transaction_key)
            .map_err(|_| retcodes::INVALID_ORDER_DATA_FORMAT)?;

        let order_data = keys::aes_decrypt(&session_key, ciphertext)
            .and_then(|compressed| pack::inflate(&compressed))
            .map_err(|_| retcodes::INVALID_ORDER_DATA_FORMAT)?;
        let signature_doc = keys::aes_decrypt(&session_key, signature_data)
            .and_then(|compressed| pack::inflate(&compressed))
            .map_err(|_| retcodes::INVALID_ORDER_DATA_FORMAT)?;
        let signature_xml = String::from_utf8(signature_doc)
            .map_err(|_| retcodes::INVALID_ORDER_DATA_FORMAT)?;
        let signature = envelope::parse_user_signature_data(&signature_xml)
            .map_err(|_| retcodes::INVALID_ORDER_DATA_FORMAT)?;

        let subscriber_state = state
            .subscribers
            .get(subscriber)
            .ok_or(retcodes::INVALID_USER_OR_USER_STATE)?;
        let sig_pub = subscriber_state
            .sig_pub
            .as_ref()
            .ok_or(retcodes::INVALID_USER_OR_USER_STATE)?;
        if !keys::verify_a006(&signature, &order_data, sig_pub) {
            return Err(SIGNATURE_VERIFICATION_FAILED);
        }

        let pain_xml =
            String::from_utf8(order_data).map_err(|_| retcodes::INVALID_ORDER_DATA_FORMAT)?;
        let payment = moneta_iso20022::parse_pain001(&pain_xml)
            .map_err(|_| retcodes::INVALID_ORDER_DATA_FORMAT)?;
        moneta_iso20022::validate(&payment)
            .map_err(|_| retcodes::INVALID_ORDER_DATA_FORMAT)?;

        if !subscriber_state
            .account_ibans
            .iter()
            .any(|iban| *iban == payment.debtor_iban)
        {
            return Err(retcodes::ACCOUNT_AUTHORISATION_FAILED);
        }
        if payment.currency != state.ledger.accepted_currency() {
            return Err(retcodes::PROCESSING_ERROR);
        }

        // Booking is idempotent per pain.001 MsgId.
        if state.processed_message_ids.contains(&payment.message_id) {
            info!(message = %payment.message_id, "duplicate upload ignored");
            return Ok(());
        }
        state.processed_message_ids.insert(payment.message_id.clone());
        state.ledger.book_credit_transfer(&payment, Utc::now());
        info!(
            message = %payment.message_id,
            amount = %payment.amount,
            "credit transfer booked"
        );
        Ok(())
    }

    fn handle_receipt(&self, request: EbicsClientRequest) -> String {
        let Some(transaction_id) = request.transaction_id.clone() else {
            return self.signed_error(retcodes::INVALID_REQUEST, "receipt without transaction id");
        };
        let mut guard = self.state.lock().expect("host state");
        let state = &mut *guard;
        if let Err(response) = self.verify_session_envelope(state, &transaction_id, &request) {
            return response;
        }
        state.sessions.remove(&transaction_id);
        self.signed_response(&ResponseSpec {
            transaction_id: Some(transaction_id),
            phase: Some(TransactionPhase::Receipt),
            ..ResponseSpec::default()
        })
    }

    fn km_ok(&self, payload: Option<&keys::E002Envelope>) -> String {
        envelope::key_management_response(&ReturnCode::ok(), &ReturnCode::ok(), "[EBICS_OK]", payload)
            .to_document()
    }

    fn km_error(&self, code: &str, report: &str) -> String {
        let code = ReturnCode::new(code);
        envelope::key_management_response(&code, &code, report, None).to_document()
    }

    /// Error detected before or beside the business layer; technical code
    /// carries it.
    fn signed_error(&self, code: &str, report: &str) -> String {
        self.signed_response(&ResponseSpec {
            technical: Some(ReturnCode::new(code)),
            business: Some(ReturnCode::new(code)),
            report: report.to_string(),
            ..ResponseSpec::default()
        })
    }

    /// Transport fine, order rejected: technical OK, business code set.
    fn business_error(&self, code: &str, phase: TransactionPhase, report: &str) -> String {
        self.signed_response(&ResponseSpec {
            technical: Some(ReturnCode::ok()),
            business: Some(ReturnCode::new(code)),
            report: report.to_string(),
            phase: Some(phase),
            ..ResponseSpec::default()
        })
    }

    fn signed_response(&self, spec: &ResponseSpec) -> String {
        let mut response = envelope::build_response(spec);
        // The host always owns a working key; signing cannot fail except
        // on RNG exhaustion.
        if let Err(err) = envelope::sign_envelope(&mut response, &self.auth_key) {
            warn!("response signing failed: {}", err);
        }
        response.to_document()
    }
}

/// In-process transport: hands the request body straight to a host.
/// End-to-end tests run the full protocol without a network.
pub struct LoopbackTransport {
    host: Arc<EbicsHost>,
}

impl LoopbackTransport {
    pub fn new(host: Arc<EbicsHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl EbicsTransport for LoopbackTransport {
    async fn post(&self, body: String) -> moneta_ebics::Result<String> {
        Ok(self.host.handle(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moneta_ebics::{EbicsClient, Subscriber};
    use moneta_iso20022::{emit_pain001, parse_camt, PaymentInitiation};
    use rust_decimal_macros::dec;

    const IBAN: &str = "GB33BUKB20201555555555";

    fn test_host() -> Arc<EbicsHost> {
        let host = Arc::new(EbicsHost::new("HOST01", "EUR").unwrap());
        host.register_subscriber("PARTNER1", "USER1");
        host.add_account(
            "PARTNER1",
            "USER1",
            crate::ledger::DemoAccount {
                iban: IBAN.to_string(),
                bic: "BUKBGB22".to_string(),
                holder: "Oliver Smith".to_string(),
                currency: "EUR".to_string(),
            },
        );
        host
    }

    fn test_subscriber(host: &EbicsHost) -> Subscriber {
        Subscriber::generate(SubscriberIds {
            host_id: host.host_id().to_string(),
            partner_id: "PARTNER1".to_string(),
            user_id: "USER1".to_string(),
            system_id: None,
        })
        .unwrap()
    }

    fn test_payment(now: chrono::DateTime<Utc>) -> PaymentInitiation {
        PaymentInitiation {
            message_id: "MSG-1".to_string(),
            payment_information_id: "PMT-1".to_string(),
            end_to_end_id: Some("E2E-1".to_string()),
            creation_timestamp: now,
            execution_date: now.date_naive(),
            debtor_name: "Oliver Smith".to_string(),
            debtor_iban: IBAN.to_string(),
            debtor_bic: "BUKBGB22".to_string(),
            creditor_name: "Jane Doe".to_string(),
            creditor_iban: "DE75512108001245126199".to_string(),
            creditor_bic: "SOGEDEFF".to_string(),
            amount: dec!(10.00),
            currency: "EUR".to_string(),
            subject: "test transfer".to_string(),
        }
    }

    #[tokio::test]
    async fn full_protocol_happy_path() {
        let host = test_host();
        let transport = LoopbackTransport::new(host.clone());
        let mut subscriber = test_subscriber(&host);
        let now = Utc::now();

        {
            let client = EbicsClient::new(&transport, &subscriber);
            let versions = client.probe_versions().await.unwrap();
            assert_eq!(versions[0].0, "H004");

            client.send_ini(now).await.unwrap();
            client.send_hia(now).await.unwrap();
            let (bank_auth, bank_enc) = client.fetch_bank_keys(now).await.unwrap();
            assert_eq!(bank_auth, host.bank_auth_public());
            assert_eq!(bank_enc, host.bank_enc_public());
            subscriber.bank_auth = Some(bank_auth);
            subscriber.bank_enc = Some(bank_enc);
        }

        let client = EbicsClient::new(&transport, &subscriber);
        let pain = emit_pain001(&test_payment(now)).unwrap();
        client
            .upload(OrderType::Cct, pain.as_bytes(), now)
            .await
            .unwrap();

        let today = now.date_naive();
        let documents = client
            .download_documents(OrderType::C53, Some((today, today)), now)
            .await
            .unwrap();
        assert_eq!(documents.len(), 1);

        let statement = parse_camt(&documents[0]).unwrap();
        let transactions: Vec<_> = statement.transactions().collect();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].amount, dec!(10.00));
        assert_eq!(transactions[0].end_to_end_id.as_deref(), Some("E2E-1"));
    }

    #[tokio::test]
    async fn duplicate_upload_books_once() {
        let host = test_host();
        let transport = LoopbackTransport::new(host.clone());
        let mut subscriber = test_subscriber(&host);
        let now = Utc::now();

        {
            let client = EbicsClient::new(&transport, &subscriber);
            client.send_ini(now).await.unwrap();
            client.send_hia(now).await.unwrap();
            let (auth, enc) = client.fetch_bank_keys(now).await.unwrap();
            subscriber.bank_auth = Some(auth);
            subscriber.bank_enc = Some(enc);
        }
        let client = EbicsClient::new(&transport, &subscriber);
        let pain = emit_pain001(&test_payment(now)).unwrap();
        client.upload(OrderType::Cct, pain.as_bytes(), now).await.unwrap();
        client.upload(OrderType::Cct, pain.as_bytes(), now).await.unwrap();

        let today = now.date_naive();
        let documents = client
            .download_documents(OrderType::C53, Some((today, today)), now)
            .await
            .unwrap();
        let statement = parse_camt(&documents[0]).unwrap();
        assert_eq!(statement.transactions().count(), 1);
    }

    #[tokio::test]
    async fn unknown_subscriber_is_rejected() {
        let host = Arc::new(EbicsHost::new("HOST01", "EUR").unwrap());
        let transport = LoopbackTransport::new(host.clone());
        let subscriber = test_subscriber(&host);
        let client = EbicsClient::new(&transport, &subscriber);
        assert!(client.send_ini(Utc::now()).await.is_err());
    }
}
