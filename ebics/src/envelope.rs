//! H004 envelope construction and destructuring
//!
//! Builders produce [`Element`] trees (signed afterwards where the exchange
//! requires it); parsers accept the peer's serialized form. The sandbox
//! uses the same module from the bank side, which keeps the two ends of
//! the wire in agreement about canonicalization.

use crate::codes::{OrderType, ReturnCode};
use crate::keys::{self, E002Envelope, KeyPair};
use crate::pack;
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use moneta_xml::{c14n, Element, Node};
use rand::RngCore;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};

/// EBICS 2.5 envelope namespace.
pub const NS_H004: &str = "urn:org:ebics:H004";
/// Namespace of the HEV (host version) exchange.
pub const NS_HEV: &str = "http://www.ebics.org/H000";
/// XML-DSig namespace.
pub const NS_DS: &str = "http://www.w3.org/2000/09/xmldsig#";
/// Namespace of A006 order signature documents.
pub const NS_S001: &str = "http://www.ebics.org/S001";

const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const XMLENC_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

/// The identifiers naming one subscriber at one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberIds {
    pub host_id: String,
    pub partner_id: String,
    pub user_id: String,
    pub system_id: Option<String>,
}

/// Phase of an EBICS transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Initialisation,
    Transfer,
    Receipt,
}

impl TransactionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionPhase::Initialisation => "Initialisation",
            TransactionPhase::Transfer => "Transfer",
            TransactionPhase::Receipt => "Receipt",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "Initialisation" => Ok(TransactionPhase::Initialisation),
            "Transfer" => Ok(TransactionPhase::Transfer),
            "Receipt" => Ok(TransactionPhase::Receipt),
            other => Err(Error::Xml(moneta_xml::Error::Structure(format!(
                "unknown transaction phase '{}'",
                other
            )))),
        }
    }
}

fn iso_seconds(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn fresh_nonce() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    hex::encode(nonce)
}

// ---------------------------------------------------------------------
// HEV version probe
// ---------------------------------------------------------------------

pub fn hev_request(host_id: &str) -> Element {
    Element::new("ebicsHEVRequest")
        .attr("xmlns", NS_HEV)
        .child(Element::leaf("HostID", host_id))
}

pub fn parse_hev_request(xml: &str) -> Result<String> {
    let doc = Element::parse(xml)?;
    let root = doc.require_root("ebicsHEVRequest")?;
    Ok(root.require_child_text("HostID")?)
}

/// `(protocol, version)` pairs, e.g. `("H004", "02.50")`.
pub fn hev_response(versions: &[(String, String)]) -> Element {
    let mut root = Element::new("ebicsHEVResponse")
        .attr("xmlns", NS_HEV)
        .child(
            Element::new("SystemReturnCode")
                .child(Element::leaf("ReturnCode", "000000"))
                .child(Element::leaf("ReportText", "[EBICS_OK]")),
        );
    for (protocol, version) in versions {
        root = root.child(
            Element::new("VersionNumber")
                .attr("ProtocolVersion", protocol.clone())
                .text(version.clone()),
        );
    }
    root
}

pub fn parse_hev_response(xml: &str) -> Result<Vec<(String, String)>> {
    let doc = Element::parse(xml)?;
    let root = doc.require_root("ebicsHEVResponse")?;
    let code = root
        .require_unique_child("SystemReturnCode")?
        .require_child_text("ReturnCode")?;
    let code = ReturnCode::new(code);
    if !code.is_ok() {
        return Err(Error::protocol(
            code.clone(),
            code,
            "HEV probe rejected".to_string(),
        ));
    }
    Ok(root.map_each_child("VersionNumber", |el| {
        let protocol = el.attribute("ProtocolVersion").ok_or_else(|| {
            moneta_xml::Error::Structure("VersionNumber without ProtocolVersion".to_string())
        })?;
        Ok((protocol.to_string(), el.trimmed_text()))
    })?)
}

// ---------------------------------------------------------------------
// Key management: INI / HIA / HPB
// ---------------------------------------------------------------------

/// `ebicsUnsecuredRequest` carrying zlib-compressed, base64-encoded order
/// data (INI and HIA).
pub fn unsecured_request(ids: &SubscriberIds, order_type: OrderType, order_data: &[u8]) -> Element {
    let mut static_el = Element::new("static")
        .child(Element::leaf("HostID", &ids.host_id))
        .child(Element::leaf("PartnerID", &ids.partner_id))
        .child(Element::leaf("UserID", &ids.user_id));
    if let Some(system_id) = &ids.system_id {
        static_el = static_el.child(Element::leaf("SystemID", system_id));
    }
    static_el = static_el
        .child(
            Element::new("OrderDetails")
                .child(Element::leaf("OrderType", order_type.as_str()))
                .child(Element::leaf("OrderAttribute", "DZNNN")),
        )
        .child(Element::leaf("SecurityMedium", "0000"));

    Element::new("ebicsUnsecuredRequest")
        .attr("xmlns", NS_H004)
        .attr("Version", "H004")
        .attr("Revision", "1")
        .child(
            Element::new("header")
                .attr("authenticate", "true")
                .child(static_el)
                .child(Element::new("mutable")),
        )
        .child(
            Element::new("body").child(
                Element::new("DataTransfer").child(Element::leaf(
                    "OrderData",
                    BASE64.encode(pack::deflate(order_data)),
                )),
            ),
        )
}

/// A parsed `ebicsUnsecuredRequest`; `order_data` is already inflated.
#[derive(Debug)]
pub struct UnsecuredRequest {
    pub ids: SubscriberIds,
    pub order_type: OrderType,
    pub order_data: Vec<u8>,
}

pub fn parse_unsecured_request(xml: &str) -> Result<UnsecuredRequest> {
    let doc = Element::parse(xml)?;
    let root = doc.require_root("ebicsUnsecuredRequest")?;
    let static_el = root
        .require_unique_child("header")?
        .require_unique_child("static")?;
    let ids = parse_static_ids(static_el)?;
    let order_type_text = static_el
        .require_unique_child("OrderDetails")?
        .require_child_text("OrderType")?;
    let order_type = OrderType::from_str(&order_type_text).ok_or_else(|| {
        moneta_xml::Error::Structure(format!("unknown order type '{}'", order_type_text))
    })?;
    let order_data_b64 = root
        .require_unique_child("body")?
        .require_unique_child("DataTransfer")?
        .require_child_text("OrderData")?;
    let packed = BASE64
        .decode(order_data_b64.as_bytes())
        .map_err(|e| moneta_xml::Error::Structure(format!("bad base64 order data: {}", e)))?;
    Ok(UnsecuredRequest {
        ids,
        order_type,
        order_data: pack::inflate(&packed)?,
    })
}

fn parse_static_ids(static_el: &Element) -> Result<SubscriberIds> {
    Ok(SubscriberIds {
        host_id: static_el.require_child_text("HostID")?,
        partner_id: static_el.require_child_text("PartnerID")?,
        user_id: static_el.require_child_text("UserID")?,
        system_id: static_el.maybe_child_text("SystemID")?,
    })
}

/// `ebicsNoPubKeyDigestsRequest` for HPB.
pub fn hpb_request(ids: &SubscriberIds, now: DateTime<Utc>) -> Element {
    let mut static_el = Element::new("static")
        .child(Element::leaf("HostID", &ids.host_id))
        .child(Element::leaf("Nonce", fresh_nonce()))
        .child(Element::leaf("Timestamp", iso_seconds(now)))
        .child(Element::leaf("PartnerID", &ids.partner_id))
        .child(Element::leaf("UserID", &ids.user_id));
    if let Some(system_id) = &ids.system_id {
        static_el = static_el.child(Element::leaf("SystemID", system_id));
    }
    static_el = static_el
        .child(
            Element::new("OrderDetails")
                .child(Element::leaf("OrderType", "HPB"))
                .child(Element::leaf("OrderAttribute", "DZHNN")),
        )
        .child(Element::leaf("SecurityMedium", "0000"));

    Element::new("ebicsNoPubKeyDigestsRequest")
        .attr("xmlns", NS_H004)
        .attr("Version", "H004")
        .attr("Revision", "1")
        .child(
            Element::new("header")
                .attr("authenticate", "true")
                .child(static_el)
                .child(Element::new("mutable")),
        )
        .child(Element::new("body"))
}

pub fn parse_hpb_request(xml: &str) -> Result<SubscriberIds> {
    let doc = Element::parse(xml)?;
    let root = doc.require_root("ebicsNoPubKeyDigestsRequest")?;
    let static_el = root
        .require_unique_child("header")?
        .require_unique_child("static")?;
    parse_static_ids(static_el)
}

/// `ebicsKeyManagementResponse`; the payload (HPB only) is E002-encrypted
/// compressed order data.
pub fn key_management_response(
    technical: &ReturnCode,
    business: &ReturnCode,
    report: &str,
    payload: Option<&E002Envelope>,
) -> Element {
    let mut body = Element::new("body");
    if let Some(envelope) = payload {
        body = body.child(
            Element::new("DataTransfer")
                .child(
                    Element::new("DataEncryptionInfo")
                        .attr("authenticate", "true")
                        .child(
                            Element::new("EncryptionPubKeyDigest")
                                .attr("Version", "E002")
                                .attr("Algorithm", XMLENC_SHA256)
                                .text(BASE64.encode(envelope.recipient_key_digest)),
                        )
                        .child(Element::leaf(
                            "TransactionKey",
                            BASE64.encode(&envelope.wrapped_key),
                        )),
                )
                .child(Element::leaf(
                    "OrderData",
                    BASE64.encode(&envelope.ciphertext),
                )),
        );
    }
    body = body.child(
        Element::new("ReturnCode")
            .attr("authenticate", "true")
            .text(business.as_str()),
    );

    Element::new("ebicsKeyManagementResponse")
        .attr("xmlns", NS_H004)
        .attr("Version", "H004")
        .attr("Revision", "1")
        .child(
            Element::new("header").attr("authenticate", "true").child(
                Element::new("mutable")
                    .child(Element::leaf("ReturnCode", technical.as_str()))
                    .child(Element::leaf("ReportText", report)),
            ),
        )
        .child(body)
}

/// Parsed key-management response; payload still encrypted and compressed.
#[derive(Debug)]
pub struct KeyManagementResponse {
    pub technical: ReturnCode,
    pub business: ReturnCode,
    pub report: String,
    pub payload: Option<(Vec<u8>, Vec<u8>)>,
}

pub fn parse_key_management_response(xml: &str) -> Result<KeyManagementResponse> {
    let doc = Element::parse(xml)?;
    let root = doc.require_root("ebicsKeyManagementResponse")?;
    let mutable = root
        .require_unique_child("header")?
        .require_unique_child("mutable")?;
    let technical = ReturnCode::new(mutable.require_child_text("ReturnCode")?);
    let report = mutable.maybe_child_text("ReportText")?.unwrap_or_default();
    let body = root.require_unique_child("body")?;
    let business = match body.maybe_unique_child("ReturnCode")? {
        Some(el) => ReturnCode::new(el.trimmed_text()),
        None => technical.clone(),
    };
    let payload = match body.maybe_unique_child("DataTransfer")? {
        Some(transfer) => {
            let info = transfer.require_unique_child("DataEncryptionInfo")?;
            let wrapped = decode_b64(&info.require_child_text("TransactionKey")?)?;
            let ciphertext = decode_b64(&transfer.require_child_text("OrderData")?)?;
            Some((wrapped, ciphertext))
        }
        None => None,
    };
    Ok(KeyManagementResponse {
        technical,
        business,
        report,
        payload,
    })
}

fn decode_b64(text: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(text.as_bytes())
        .map_err(|e| Error::Xml(moneta_xml::Error::Structure(format!("bad base64: {}", e))))
}

// ---------------------------------------------------------------------
// Order data documents
// ---------------------------------------------------------------------

fn rsa_key_value(public: &RsaPublicKey) -> Element {
    let (modulus, exponent) = keys::public_key_components(public);
    Element::new("ds:RSAKeyValue")
        .attr("xmlns:ds", NS_DS)
        .child(Element::leaf("ds:Modulus", BASE64.encode(modulus)))
        .child(Element::leaf("ds:Exponent", BASE64.encode(exponent)))
}

fn parse_rsa_key_value(el: &Element) -> Result<RsaPublicKey> {
    let key_value = el.find_first("RSAKeyValue").ok_or_else(|| {
        moneta_xml::Error::Structure(format!("no RSAKeyValue under '{}'", el.local_name()))
    })?;
    let modulus = decode_b64(&key_value.require_child_text("Modulus")?)?;
    let exponent = decode_b64(&key_value.require_child_text("Exponent")?)?;
    keys::public_key_from_components(&modulus, &exponent)
}

fn pub_key_info(tag: &str, version_tag: &str, version: &str, public: &RsaPublicKey) -> Element {
    Element::new(tag)
        .child(Element::new("PubKeyValue").child(rsa_key_value(public)))
        .child(Element::leaf(version_tag, version))
}

/// INI order data: the subscriber's A006 signature key.
pub fn signature_pubkey_order_data(
    public: &RsaPublicKey,
    ids: &SubscriberIds,
    _now: DateTime<Utc>,
) -> Element {
    Element::new("SignaturePubKeyOrderData")
        .attr("xmlns", NS_S001)
        .child(pub_key_info(
            "SignaturePubKeyInfo",
            "SignatureVersion",
            "A006",
            public,
        ))
        .child(Element::leaf("PartnerID", &ids.partner_id))
        .child(Element::leaf("UserID", &ids.user_id))
}

pub fn parse_signature_pubkey_order_data(xml: &str) -> Result<RsaPublicKey> {
    let doc = Element::parse(xml)?;
    let root = doc.require_root("SignaturePubKeyOrderData")?;
    parse_rsa_key_value(root.require_unique_child("SignaturePubKeyInfo")?)
}

/// HIA order data: the subscriber's X002 and E002 keys.
pub fn hia_order_data(
    auth: &RsaPublicKey,
    enc: &RsaPublicKey,
    ids: &SubscriberIds,
    _now: DateTime<Utc>,
) -> Element {
    Element::new("HIARequestOrderData")
        .attr("xmlns", NS_H004)
        .child(pub_key_info(
            "AuthenticationPubKeyInfo",
            "AuthenticationVersion",
            "X002",
            auth,
        ))
        .child(pub_key_info(
            "EncryptionPubKeyInfo",
            "EncryptionVersion",
            "E002",
            enc,
        ))
        .child(Element::leaf("PartnerID", &ids.partner_id))
        .child(Element::leaf("UserID", &ids.user_id))
}

pub fn parse_hia_order_data(xml: &str) -> Result<(RsaPublicKey, RsaPublicKey)> {
    let doc = Element::parse(xml)?;
    let root = doc.require_root("HIARequestOrderData")?;
    let auth = parse_rsa_key_value(root.require_unique_child("AuthenticationPubKeyInfo")?)?;
    let enc = parse_rsa_key_value(root.require_unique_child("EncryptionPubKeyInfo")?)?;
    Ok((auth, enc))
}

/// HPB order data: the bank's X002 and E002 keys.
pub fn hpb_order_data(host_id: &str, auth: &RsaPublicKey, enc: &RsaPublicKey) -> Element {
    Element::new("HPBResponseOrderData")
        .attr("xmlns", NS_H004)
        .child(pub_key_info(
            "AuthenticationPubKeyInfo",
            "AuthenticationVersion",
            "X002",
            auth,
        ))
        .child(pub_key_info(
            "EncryptionPubKeyInfo",
            "EncryptionVersion",
            "E002",
            enc,
        ))
        .child(Element::leaf("HostID", host_id))
}

pub fn parse_hpb_order_data(xml: &str) -> Result<(RsaPublicKey, RsaPublicKey)> {
    let doc = Element::parse(xml)?;
    let root = doc.require_root("HPBResponseOrderData")?;
    let auth = parse_rsa_key_value(root.require_unique_child("AuthenticationPubKeyInfo")?)?;
    let enc = parse_rsa_key_value(root.require_unique_child("EncryptionPubKeyInfo")?)?;
    Ok((auth, enc))
}

/// One bank account as reported by HTD. The shape is internal to this
/// workspace, not a wire contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtdAccount {
    pub iban: String,
    pub bic: String,
    pub holder: String,
    pub currency: Option<String>,
}

pub fn htd_order_data(user_id: &str, accounts: &[HtdAccount]) -> Element {
    let mut partner_info = Element::new("PartnerInfo");
    for account in accounts {
        let mut info = Element::new("AccountInfo");
        if let Some(currency) = &account.currency {
            info = info.attr("Currency", currency.clone());
        }
        partner_info = partner_info.child(
            info.child(
                Element::new("AccountNumber")
                    .attr("international", "true")
                    .text(&account.iban),
            )
            .child(
                Element::new("BankCode")
                    .attr("international", "true")
                    .text(&account.bic),
            )
            .child(Element::leaf("AccountHolder", &account.holder)),
        );
    }
    Element::new("HTDResponseOrderData")
        .attr("xmlns", NS_H004)
        .child(partner_info)
        .child(Element::new("UserInfo").child(
            Element::new("UserID").attr("Status", "1").text(user_id),
        ))
}

pub fn parse_htd_order_data(xml: &str) -> Result<Vec<HtdAccount>> {
    let doc = Element::parse(xml)?;
    let root = doc.require_root("HTDResponseOrderData")?;
    let partner_info = root.require_unique_child("PartnerInfo")?;
    Ok(partner_info.map_each_child("AccountInfo", |info| {
        Ok(HtdAccount {
            iban: info.require_child_text("AccountNumber")?,
            bic: info.require_child_text("BankCode")?,
            holder: info.require_child_text("AccountHolder")?,
            currency: info.attribute("Currency").map(str::to_string),
        })
    })?)
}

/// A006 order signature document sent alongside an upload.
pub fn user_signature_data(ids: &SubscriberIds, signature: &[u8]) -> Element {
    Element::new("UserSignatureData")
        .attr("xmlns", NS_S001)
        .child(
            Element::new("OrderSignatureData")
                .child(Element::leaf("SignatureVersion", "A006"))
                .child(Element::leaf("SignatureValue", BASE64.encode(signature)))
                .child(Element::leaf("PartnerID", &ids.partner_id))
                .child(Element::leaf("UserID", &ids.user_id)),
        )
}

/// Extract the A006 signature bytes from a `UserSignatureData` document.
pub fn parse_user_signature_data(xml: &str) -> Result<Vec<u8>> {
    let doc = Element::parse(xml)?;
    let root = doc.require_root("UserSignatureData")?;
    let order_sig = root.require_unique_child("OrderSignatureData")?;
    let version = order_sig.require_child_text("SignatureVersion")?;
    if version != "A006" {
        return Err(Error::Crypto(format!(
            "unsupported order signature version '{}'",
            version
        )));
    }
    decode_b64(&order_sig.require_child_text("SignatureValue")?)
}

// ---------------------------------------------------------------------
// AuthSignature
// ---------------------------------------------------------------------

/// SHA-256 over the canonical forms of every `authenticate="true"`
/// element, in document order.
fn authenticated_digest(envelope: &Element) -> [u8; 32] {
    let targets = envelope.find_all(&|el| el.attribute("authenticate") == Some("true"));
    let mut hasher = Sha256::new();
    for el in targets {
        hasher.update(c14n::canonicalize(el));
    }
    hasher.finalize().into()
}

fn signed_info(digest_b64: &str) -> Element {
    Element::new("ds:SignedInfo")
        .child(Element::new("ds:CanonicalizationMethod").attr("Algorithm", EXC_C14N))
        .child(Element::new("ds:SignatureMethod").attr("Algorithm", RSA_SHA256))
        .child(
            Element::new("ds:Reference")
                .attr("URI", "#xpointer(//*[@authenticate='true'])")
                .child(
                    Element::new("ds:Transforms")
                        .child(Element::new("ds:Transform").attr("Algorithm", EXC_C14N)),
                )
                .child(Element::new("ds:DigestMethod").attr("Algorithm", XMLENC_SHA256))
                .child(Element::leaf("ds:DigestValue", digest_b64)),
        )
}

/// Compute and attach the `AuthSignature` (X002) to a request or response
/// envelope. Must run after the envelope is otherwise complete.
pub fn sign_envelope(envelope: &mut Element, auth_key: &KeyPair) -> Result<()> {
    let digest = authenticated_digest(envelope);
    let info = signed_info(&BASE64.encode(digest));
    let signature = auth_key.sign_x002(&c14n::canonicalize(&info))?;

    let auth_signature = Element::new("AuthSignature")
        .attr("xmlns:ds", NS_DS)
        .child(info)
        .child(Element::leaf("ds:SignatureValue", BASE64.encode(signature)));

    let header_pos = envelope
        .children
        .iter()
        .position(|node| matches!(node, Node::Element(el) if el.local_name() == "header"))
        .ok_or_else(|| Error::State("envelope has no header to sign".to_string()))?;
    envelope
        .children
        .insert(header_pos + 1, Node::Element(auth_signature));
    Ok(())
}

/// Verify the `AuthSignature` of a parsed envelope against the peer's
/// X002 key: the digest over the authenticated nodes and the signature
/// over the canonical `ds:SignedInfo`.
pub fn verify_envelope(envelope: &Element, auth_pub: &RsaPublicKey) -> Result<()> {
    let auth_signature = envelope
        .maybe_unique_child("AuthSignature")?
        .ok_or_else(|| Error::Crypto("envelope carries no AuthSignature".to_string()))?;
    let info = auth_signature.require_unique_child("SignedInfo")?;
    let digest_b64 = info
        .require_unique_child("Reference")?
        .require_child_text("DigestValue")?;
    let claimed_digest = decode_b64(&digest_b64)?;
    if claimed_digest != authenticated_digest(envelope) {
        return Err(Error::Crypto(
            "authenticated-node digest mismatch".to_string(),
        ));
    }
    let signature = decode_b64(&auth_signature.require_child_text("SignatureValue")?)?;
    if !keys::verify_x002(&signature, &c14n::canonicalize(info), auth_pub) {
        return Err(Error::Crypto("authentication signature invalid".to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// ebicsRequest / ebicsResponse
// ---------------------------------------------------------------------

/// Base64 digests of the bank keys the client believes in; echoed in every
/// signed request so the bank can detect stale key state.
#[derive(Debug, Clone)]
pub struct BankDigests {
    pub auth_b64: String,
    pub enc_b64: String,
}

impl BankDigests {
    pub fn of(bank_auth: &RsaPublicKey, bank_enc: &RsaPublicKey) -> Self {
        BankDigests {
            auth_b64: BASE64.encode(keys::public_key_digest(bank_auth)),
            enc_b64: BASE64.encode(keys::public_key_digest(bank_enc)),
        }
    }
}

fn bank_pub_key_digests(digests: &BankDigests) -> Element {
    Element::new("BankPubKeyDigests")
        .child(
            Element::new("Authentication")
                .attr("Version", "X002")
                .attr("Algorithm", XMLENC_SHA256)
                .text(&digests.auth_b64),
        )
        .child(
            Element::new("Encryption")
                .attr("Version", "E002")
                .attr("Algorithm", XMLENC_SHA256)
                .text(&digests.enc_b64),
        )
}

fn request_envelope(header: Element, body: Element) -> Element {
    Element::new("ebicsRequest")
        .attr("xmlns", NS_H004)
        .attr("Version", "H004")
        .attr("Revision", "1")
        .child(header)
        .child(body)
}

fn init_static(
    ids: &SubscriberIds,
    order_details: Element,
    digests: &BankDigests,
    num_segments: Option<u32>,
    now: DateTime<Utc>,
) -> Element {
    let mut static_el = Element::new("static")
        .child(Element::leaf("HostID", &ids.host_id))
        .child(Element::leaf("Nonce", fresh_nonce()))
        .child(Element::leaf("Timestamp", iso_seconds(now)))
        .child(Element::leaf("PartnerID", &ids.partner_id))
        .child(Element::leaf("UserID", &ids.user_id));
    if let Some(system_id) = &ids.system_id {
        static_el = static_el.child(Element::leaf("SystemID", system_id));
    }
    static_el = static_el
        .child(order_details)
        .child(bank_pub_key_digests(digests))
        .child(Element::leaf("SecurityMedium", "0000"));
    if let Some(n) = num_segments {
        static_el = static_el.child(Element::leaf("NumSegments", n.to_string()));
    }
    static_el
}

/// Initialisation request of a download transaction. Unsigned; run
/// [`sign_envelope`] on the result.
pub fn download_init_request(
    ids: &SubscriberIds,
    order_type: OrderType,
    range: Option<(NaiveDate, NaiveDate)>,
    digests: &BankDigests,
    now: DateTime<Utc>,
) -> Element {
    let mut params = Element::new("StandardOrderParams");
    if let Some((start, end)) = range {
        params = params.child(
            Element::new("DateRange")
                .child(Element::leaf("Start", start.format("%Y-%m-%d").to_string()))
                .child(Element::leaf("End", end.format("%Y-%m-%d").to_string())),
        );
    }
    let order_details = Element::new("OrderDetails")
        .child(Element::leaf("OrderType", order_type.as_str()))
        .child(Element::leaf("OrderAttribute", "DZHNN"))
        .child(params);

    let header = Element::new("header")
        .attr("authenticate", "true")
        .child(init_static(ids, order_details, digests, None, now))
        .child(
            Element::new("mutable").child(Element::leaf(
                "TransactionPhase",
                TransactionPhase::Initialisation.as_str(),
            )),
        );
    request_envelope(header, Element::new("body"))
}

/// Initialisation request of an upload transaction. Unsigned.
#[allow(clippy::too_many_arguments)]
pub fn upload_init_request(
    ids: &SubscriberIds,
    order_type: OrderType,
    num_segments: u32,
    digests: &BankDigests,
    transaction_key_b64: &str,
    signature_data_b64: &str,
    now: DateTime<Utc>,
) -> Element {
    let order_details = Element::new("OrderDetails")
        .child(Element::leaf("OrderType", order_type.as_str()))
        .child(Element::leaf("OrderAttribute", "OZHNN"))
        .child(Element::new("StandardOrderParams"));

    let header = Element::new("header")
        .attr("authenticate", "true")
        .child(init_static(
            ids,
            order_details,
            digests,
            Some(num_segments),
            now,
        ))
        .child(
            Element::new("mutable").child(Element::leaf(
                "TransactionPhase",
                TransactionPhase::Initialisation.as_str(),
            )),
        );

    let body = Element::new("body").child(
        Element::new("DataTransfer")
            .child(
                Element::new("DataEncryptionInfo")
                    .attr("authenticate", "true")
                    .child(
                        Element::new("EncryptionPubKeyDigest")
                            .attr("Version", "E002")
                            .attr("Algorithm", XMLENC_SHA256)
                            .text(&digests.enc_b64),
                    )
                    .child(Element::leaf("TransactionKey", transaction_key_b64)),
            )
            .child(
                Element::new("SignatureData")
                    .attr("authenticate", "true")
                    .text(signature_data_b64),
            ),
    );
    request_envelope(header, body)
}

/// Transfer-phase request; `order_data_b64` is present for uploads only.
pub fn transfer_request(
    host_id: &str,
    transaction_id: &str,
    segment: u32,
    last: bool,
    order_data_b64: Option<&str>,
) -> Element {
    let header = Element::new("header")
        .attr("authenticate", "true")
        .child(
            Element::new("static")
                .child(Element::leaf("HostID", host_id))
                .child(Element::leaf("TransactionID", transaction_id)),
        )
        .child(
            Element::new("mutable")
                .child(Element::leaf(
                    "TransactionPhase",
                    TransactionPhase::Transfer.as_str(),
                ))
                .child(
                    Element::new("SegmentNumber")
                        .attr("lastSegment", if last { "true" } else { "false" })
                        .text(segment.to_string()),
                ),
        );
    let body = match order_data_b64 {
        Some(data) => Element::new("body").child(
            Element::new("DataTransfer").child(Element::leaf("OrderData", data)),
        ),
        None => Element::new("body"),
    };
    request_envelope(header, body)
}

/// Receipt-phase request closing a download.
pub fn receipt_request(host_id: &str, transaction_id: &str, receipt_code: u32) -> Element {
    let header = Element::new("header")
        .attr("authenticate", "true")
        .child(
            Element::new("static")
                .child(Element::leaf("HostID", host_id))
                .child(Element::leaf("TransactionID", transaction_id)),
        )
        .child(Element::new("mutable").child(Element::leaf(
            "TransactionPhase",
            TransactionPhase::Receipt.as_str(),
        )));
    let body = Element::new("body").child(
        Element::new("TransferReceipt")
            .attr("authenticate", "true")
            .child(Element::leaf("ReceiptCode", receipt_code.to_string())),
    );
    request_envelope(header, body)
}

/// Server-side view of a parsed `ebicsRequest`.
#[derive(Debug)]
pub struct EbicsClientRequest {
    pub envelope: Element,
    pub phase: TransactionPhase,
    pub host_id: String,
    pub ids: Option<SubscriberIds>,
    pub order_type: Option<OrderType>,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub num_segments: Option<u32>,
    pub transaction_id: Option<String>,
    pub segment_number: Option<u32>,
    pub last_segment: bool,
    pub order_data: Option<Vec<u8>>,
    pub transaction_key: Option<Vec<u8>>,
    pub signature_data: Option<Vec<u8>>,
    pub receipt_code: Option<u32>,
}

pub fn parse_request(xml: &str) -> Result<EbicsClientRequest> {
    let envelope = Element::parse(xml)?;
    envelope.require_root("ebicsRequest")?;
    let header = envelope.require_unique_child("header")?;
    let static_el = header.require_unique_child("static")?;
    let mutable = header.require_unique_child("mutable")?;

    let phase = TransactionPhase::from_str(&mutable.require_child_text("TransactionPhase")?)?;
    let host_id = static_el.require_child_text("HostID")?;

    let (ids, order_type, date_range, num_segments) = match phase {
        TransactionPhase::Initialisation => {
            let ids = parse_static_ids(static_el)?;
            let details = static_el.require_unique_child("OrderDetails")?;
            let order_type_text = details.require_child_text("OrderType")?;
            let order_type = OrderType::from_str(&order_type_text).ok_or_else(|| {
                moneta_xml::Error::Structure(format!("unknown order type '{}'", order_type_text))
            })?;
            let date_range = match details
                .maybe_unique_child("StandardOrderParams")?
                .map(|params| params.maybe_unique_child("DateRange"))
                .transpose()?
                .flatten()
            {
                Some(range) => {
                    let start = parse_date(&range.require_child_text("Start")?)?;
                    let end = parse_date(&range.require_child_text("End")?)?;
                    Some((start, end))
                }
                None => None,
            };
            let num_segments = static_el
                .maybe_child_text("NumSegments")?
                .map(|n| parse_u32(&n))
                .transpose()?;
            (Some(ids), Some(order_type), date_range, num_segments)
        }
        _ => (None, None, None, None),
    };

    let transaction_id = static_el.maybe_child_text("TransactionID")?;
    let (segment_number, last_segment) = match mutable.maybe_unique_child("SegmentNumber")? {
        Some(el) => (
            Some(parse_u32(&el.trimmed_text())?),
            el.attribute("lastSegment") == Some("true"),
        ),
        None => (None, false),
    };

    let body = envelope.require_unique_child("body")?;
    let mut order_data = None;
    let mut transaction_key = None;
    let mut signature_data = None;
    if let Some(transfer) = body.maybe_unique_child("DataTransfer")? {
        if let Some(data) = transfer.maybe_child_text("OrderData")? {
            order_data = Some(decode_b64(&data)?);
        }
        if let Some(info) = transfer.maybe_unique_child("DataEncryptionInfo")? {
            transaction_key = Some(decode_b64(&info.require_child_text("TransactionKey")?)?);
        }
        if let Some(sig) = transfer.maybe_child_text("SignatureData")? {
            signature_data = Some(decode_b64(&sig)?);
        }
    }
    let receipt_code = match body.maybe_unique_child("TransferReceipt")? {
        Some(receipt) => Some(parse_u32(&receipt.require_child_text("ReceiptCode")?)?),
        None => None,
    };

    Ok(EbicsClientRequest {
        phase,
        host_id,
        ids,
        order_type,
        date_range,
        num_segments,
        transaction_id,
        segment_number,
        last_segment,
        order_data,
        transaction_key,
        signature_data,
        receipt_code,
        envelope,
    })
}

fn parse_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| Error::Xml(moneta_xml::Error::Structure(format!("bad date '{}': {}", text, e))))
}

fn parse_u32(text: &str) -> Result<u32> {
    text.parse::<u32>()
        .map_err(|e| Error::Xml(moneta_xml::Error::Structure(format!("bad number '{}': {}", text, e))))
}

/// Everything the server needs to render an `ebicsResponse`. Unsigned;
/// the host signs with its X002 key afterwards.
#[derive(Debug, Default)]
pub struct ResponseSpec {
    pub technical: Option<ReturnCode>,
    pub business: Option<ReturnCode>,
    pub report: String,
    pub transaction_id: Option<String>,
    pub num_segments: Option<u32>,
    pub phase: Option<TransactionPhase>,
    pub segment_number: Option<(u32, bool)>,
    pub order_data_b64: Option<String>,
    pub encryption: Option<(String, String)>,
}

pub fn build_response(spec: &ResponseSpec) -> Element {
    let technical = spec.technical.clone().unwrap_or_else(ReturnCode::ok);
    let business = spec.business.clone().unwrap_or_else(ReturnCode::ok);

    let mut static_el = Element::new("static");
    if let Some(tx) = &spec.transaction_id {
        static_el = static_el.child(Element::leaf("TransactionID", tx));
    }
    if let Some(n) = spec.num_segments {
        static_el = static_el.child(Element::leaf("NumSegments", n.to_string()));
    }

    let mut mutable = Element::new("mutable");
    if let Some(phase) = spec.phase {
        mutable = mutable.child(Element::leaf("TransactionPhase", phase.as_str()));
    }
    if let Some((segment, last)) = spec.segment_number {
        mutable = mutable.child(
            Element::new("SegmentNumber")
                .attr("lastSegment", if last { "true" } else { "false" })
                .text(segment.to_string()),
        );
    }
    mutable = mutable
        .child(Element::leaf("ReturnCode", technical.as_str()))
        .child(Element::leaf(
            "ReportText",
            format!("[{}] {}", technical.symbol(), spec.report),
        ));

    let mut body = Element::new("body");
    if spec.order_data_b64.is_some() || spec.encryption.is_some() {
        let mut transfer = Element::new("DataTransfer");
        if let Some((digest_b64, key_b64)) = &spec.encryption {
            transfer = transfer.child(
                Element::new("DataEncryptionInfo")
                    .attr("authenticate", "true")
                    .child(
                        Element::new("EncryptionPubKeyDigest")
                            .attr("Version", "E002")
                            .attr("Algorithm", XMLENC_SHA256)
                            .text(digest_b64),
                    )
                    .child(Element::leaf("TransactionKey", key_b64)),
            );
        }
        if let Some(data) = &spec.order_data_b64 {
            transfer = transfer.child(Element::leaf("OrderData", data));
        }
        body = body.child(transfer);
    }
    body = body.child(
        Element::new("ReturnCode")
            .attr("authenticate", "true")
            .text(business.as_str()),
    );

    Element::new("ebicsResponse")
        .attr("xmlns", NS_H004)
        .attr("Version", "H004")
        .attr("Revision", "1")
        .child(
            Element::new("header")
                .attr("authenticate", "true")
                .child(static_el)
                .child(mutable),
        )
        .child(body)
}

/// Client-side view of a parsed `ebicsResponse`.
#[derive(Debug)]
pub struct EbicsResponse {
    pub envelope: Element,
    pub technical: ReturnCode,
    pub business: ReturnCode,
    pub report: String,
    pub transaction_id: Option<String>,
    pub num_segments: Option<u32>,
    pub segment: Option<Vec<u8>>,
    pub last_segment: bool,
    pub transaction_key: Option<Vec<u8>>,
}

pub fn parse_response(xml: &str) -> Result<EbicsResponse> {
    let envelope = Element::parse(xml)?;
    envelope.require_root("ebicsResponse")?;
    let header = envelope.require_unique_child("header")?;
    let static_el = header.require_unique_child("static")?;
    let mutable = header.require_unique_child("mutable")?;

    let technical = ReturnCode::new(mutable.require_child_text("ReturnCode")?);
    let report = mutable.maybe_child_text("ReportText")?.unwrap_or_default();
    let transaction_id = static_el.maybe_child_text("TransactionID")?;
    let num_segments = static_el
        .maybe_child_text("NumSegments")?
        .map(|n| parse_u32(&n))
        .transpose()?;
    let last_segment = match mutable.maybe_unique_child("SegmentNumber")? {
        Some(el) => el.attribute("lastSegment") == Some("true"),
        None => false,
    };

    let body = envelope.require_unique_child("body")?;
    let business = match body.maybe_unique_child("ReturnCode")? {
        Some(el) => ReturnCode::new(el.trimmed_text()),
        None => technical.clone(),
    };
    let mut segment = None;
    let mut transaction_key = None;
    if let Some(transfer) = body.maybe_unique_child("DataTransfer")? {
        if let Some(data) = transfer.maybe_child_text("OrderData")? {
            segment = Some(decode_b64(&data)?);
        }
        if let Some(info) = transfer.maybe_unique_child("DataEncryptionInfo")? {
            transaction_key = Some(decode_b64(&info.require_child_text("TransactionKey")?)?);
        }
    }

    Ok(EbicsResponse {
        envelope,
        technical,
        business,
        report,
        transaction_id,
        num_segments,
        segment,
        last_segment,
        transaction_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ids() -> SubscriberIds {
        SubscriberIds {
            host_id: "HOST01".to_string(),
            partner_id: "PARTNER1".to_string(),
            user_id: "USER1".to_string(),
            system_id: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn hev_roundtrip() {
        let request = hev_request("HOST01").to_document();
        assert_eq!(parse_hev_request(&request).unwrap(), "HOST01");

        let versions = vec![("H004".to_string(), "02.50".to_string())];
        let response = hev_response(&versions).to_document();
        assert_eq!(parse_hev_response(&response).unwrap(), versions);
    }

    #[test]
    fn unsecured_request_roundtrip() {
        let key = KeyPair::generate().unwrap();
        let order_data = signature_pubkey_order_data(key.public(), &ids(), now()).to_document();
        let request =
            unsecured_request(&ids(), OrderType::Ini, order_data.as_bytes()).to_document();

        let parsed = parse_unsecured_request(&request).unwrap();
        assert_eq!(parsed.order_type, OrderType::Ini);
        assert_eq!(parsed.ids, ids());

        let recovered =
            parse_signature_pubkey_order_data(&String::from_utf8(parsed.order_data).unwrap())
                .unwrap();
        assert_eq!(&recovered, key.public());
    }

    #[test]
    fn hia_order_data_roundtrip() {
        let auth = KeyPair::generate().unwrap();
        let enc = KeyPair::generate().unwrap();
        let doc = hia_order_data(auth.public(), enc.public(), &ids(), now()).to_document();
        let (parsed_auth, parsed_enc) = parse_hia_order_data(&doc).unwrap();
        assert_eq!(&parsed_auth, auth.public());
        assert_eq!(&parsed_enc, enc.public());
    }

    #[test]
    fn htd_order_data_roundtrip() {
        let accounts = vec![HtdAccount {
            iban: "GB33BUKB20201555555555".to_string(),
            bic: "BUKBGB22".to_string(),
            holder: "Oliver Smith".to_string(),
            currency: Some("EUR".to_string()),
        }];
        let doc = htd_order_data("USER1", &accounts).to_document();
        assert_eq!(parse_htd_order_data(&doc).unwrap(), accounts);
    }

    #[test]
    fn signed_envelope_verifies_after_reparse() {
        let auth = KeyPair::generate().unwrap();
        let bank_auth = KeyPair::generate().unwrap();
        let bank_enc = KeyPair::generate().unwrap();
        let digests = BankDigests::of(bank_auth.public(), bank_enc.public());

        let mut envelope = download_init_request(&ids(), OrderType::C53, None, &digests, now());
        sign_envelope(&mut envelope, &auth).unwrap();

        let wire = envelope.to_document();
        let reparsed = Element::parse(&wire).unwrap();
        verify_envelope(&reparsed, auth.public()).unwrap();
    }

    #[test]
    fn tampered_envelope_fails_verification() {
        let auth = KeyPair::generate().unwrap();
        let bank = KeyPair::generate().unwrap();
        let digests = BankDigests::of(bank.public(), bank.public());

        let mut envelope = download_init_request(&ids(), OrderType::C53, None, &digests, now());
        sign_envelope(&mut envelope, &auth).unwrap();

        let wire = envelope.to_document().replace("USER1", "USER2");
        let reparsed = Element::parse(&wire).unwrap();
        assert!(verify_envelope(&reparsed, auth.public()).is_err());
    }

    #[test]
    fn envelope_rejects_wrong_signer() {
        let auth = KeyPair::generate().unwrap();
        let other = KeyPair::generate().unwrap();
        let bank = KeyPair::generate().unwrap();
        let digests = BankDigests::of(bank.public(), bank.public());

        let mut envelope = download_init_request(&ids(), OrderType::C53, None, &digests, now());
        sign_envelope(&mut envelope, &auth).unwrap();
        let reparsed = Element::parse(&envelope.to_document()).unwrap();
        assert!(verify_envelope(&reparsed, other.public()).is_err());
    }

    #[test]
    fn download_init_request_parses_on_the_server() {
        let bank = KeyPair::generate().unwrap();
        let digests = BankDigests::of(bank.public(), bank.public());
        let range = (
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
        );
        let envelope =
            download_init_request(&ids(), OrderType::C53, Some(range), &digests, now());

        let parsed = parse_request(&envelope.to_document()).unwrap();
        assert_eq!(parsed.phase, TransactionPhase::Initialisation);
        assert_eq!(parsed.order_type, Some(OrderType::C53));
        assert_eq!(parsed.date_range, Some(range));
        assert_eq!(parsed.ids.as_ref().unwrap().user_id, "USER1");
    }

    #[test]
    fn transfer_and_receipt_requests_parse() {
        let transfer = transfer_request("HOST01", "TX42", 2, true, Some("c2Vn"));
        let parsed = parse_request(&transfer.to_document()).unwrap();
        assert_eq!(parsed.phase, TransactionPhase::Transfer);
        assert_eq!(parsed.transaction_id.as_deref(), Some("TX42"));
        assert_eq!(parsed.segment_number, Some(2));
        assert!(parsed.last_segment);
        assert_eq!(parsed.order_data.as_deref(), Some(&b"seg"[..]));

        let receipt = receipt_request("HOST01", "TX42", 0);
        let parsed = parse_request(&receipt.to_document()).unwrap();
        assert_eq!(parsed.phase, TransactionPhase::Receipt);
        assert_eq!(parsed.receipt_code, Some(0));
    }

    #[test]
    fn response_roundtrip() {
        let spec = ResponseSpec {
            transaction_id: Some("TX1".to_string()),
            num_segments: Some(3),
            phase: Some(TransactionPhase::Initialisation),
            segment_number: Some((1, false)),
            order_data_b64: Some(BASE64.encode(b"segment-1")),
            encryption: Some(("ZGln".to_string(), BASE64.encode(b"wrapped"))),
            ..ResponseSpec::default()
        };
        let parsed = parse_response(&build_response(&spec).to_document()).unwrap();
        assert!(parsed.technical.is_ok());
        assert!(parsed.business.is_ok());
        assert_eq!(parsed.transaction_id.as_deref(), Some("TX1"));
        assert_eq!(parsed.num_segments, Some(3));
        assert_eq!(parsed.segment.as_deref(), Some(&b"segment-1"[..]));
        assert_eq!(parsed.transaction_key.as_deref(), Some(&b"wrapped"[..]));
        assert!(!parsed.last_segment);
    }

    #[test]
    fn error_response_carries_both_codes() {
        let spec = ResponseSpec {
            technical: Some(ReturnCode::ok()),
            business: Some(ReturnCode::new(crate::codes::retcodes::ACCOUNT_AUTHORISATION_FAILED)),
            report: "account not authorised".to_string(),
            phase: Some(TransactionPhase::Initialisation),
            ..ResponseSpec::default()
        };
        let parsed = parse_response(&build_response(&spec).to_document()).unwrap();
        assert!(parsed.technical.is_ok());
        assert_eq!(parsed.business.as_str(), "090003");
    }
}
