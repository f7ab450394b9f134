//! EBICS client engine
//!
//! A [`Subscriber`] owns the three key pairs and the bank keys learned via
//! HPB; an [`EbicsClient`] borrows a subscriber and a transport and runs
//! the exchanges. Sessions (transaction id, segment counters) exist only
//! inside a single method call.

pub mod download;
pub mod keymgmt;
pub mod transport;
pub mod upload;

pub use transport::{EbicsTransport, HttpTransport};

use crate::codes::ReturnCode;
use crate::envelope::{self, BankDigests, EbicsResponse, SubscriberIds};
use crate::keys::KeyPair;
use crate::{Error, Result};
use moneta_xml::Element;
use rsa::RsaPublicKey;

/// One EBICS subscriber: identifiers, owned key triple, learned bank keys.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub ids: SubscriberIds,
    /// X002 authentication key
    pub auth_key: KeyPair,
    /// E002 encryption key
    pub enc_key: KeyPair,
    /// A006 order signature key
    pub sig_key: KeyPair,
    /// Bank X002 key, learned via HPB
    pub bank_auth: Option<RsaPublicKey>,
    /// Bank E002 key, learned via HPB
    pub bank_enc: Option<RsaPublicKey>,
}

impl Subscriber {
    /// Fresh subscriber with newly generated keys and no bank keys yet.
    pub fn generate(ids: SubscriberIds) -> Result<Self> {
        Ok(Self {
            ids,
            auth_key: KeyPair::generate()?,
            enc_key: KeyPair::generate()?,
            sig_key: KeyPair::generate()?,
            bank_auth: None,
            bank_enc: None,
        })
    }

    /// Data exchange requires both bank keys (HPB done).
    pub fn is_ready(&self) -> bool {
        self.bank_auth.is_some() && self.bank_enc.is_some()
    }

    pub(crate) fn bank_auth(&self) -> Result<&RsaPublicKey> {
        self.bank_auth
            .as_ref()
            .ok_or_else(|| Error::State("bank authentication key not yet fetched (run HPB)".to_string()))
    }

    pub(crate) fn bank_enc(&self) -> Result<&RsaPublicKey> {
        self.bank_enc
            .as_ref()
            .ok_or_else(|| Error::State("bank encryption key not yet fetched (run HPB)".to_string()))
    }

    pub(crate) fn bank_digests(&self) -> Result<BankDigests> {
        Ok(BankDigests::of(self.bank_auth()?, self.bank_enc()?))
    }
}

/// Borrowed view running the protocol for one subscriber.
pub struct EbicsClient<'a> {
    pub(crate) transport: &'a dyn EbicsTransport,
    pub(crate) subscriber: &'a Subscriber,
}

impl<'a> EbicsClient<'a> {
    pub fn new(transport: &'a dyn EbicsTransport, subscriber: &'a Subscriber) -> Self {
        Self {
            transport,
            subscriber,
        }
    }

    /// HEV: ask the host which protocol versions it speaks. No state
    /// change on either side.
    pub async fn probe_versions(&self) -> Result<Vec<(String, String)>> {
        let request = envelope::hev_request(&self.subscriber.ids.host_id);
        let response = self.transport.post(request.to_document()).await?;
        envelope::parse_hev_response(&response)
    }

    /// Sign, post and parse one `ebicsRequest`, verifying the bank's
    /// response signature once the bank keys are known.
    pub(crate) async fn exchange(&self, mut envelope: Element) -> Result<EbicsResponse> {
        envelope::sign_envelope(&mut envelope, &self.subscriber.auth_key)?;
        let response_xml = self.transport.post(envelope.to_document()).await?;
        let response = envelope::parse_response(&response_xml)?;
        if let Some(bank_auth) = &self.subscriber.bank_auth {
            envelope::verify_envelope(&response.envelope, bank_auth)?;
        }
        Ok(response)
    }
}

/// Both codes must be EBICS_OK for an exchange to count as successful.
pub(crate) fn ensure_ok(response: &EbicsResponse) -> Result<()> {
    if response.technical.is_ok() && response.business.is_ok() {
        Ok(())
    } else {
        Err(Error::protocol(
            response.technical.clone(),
            response.business.clone(),
            response.report.clone(),
        ))
    }
}

pub(crate) fn ensure_km_ok(
    technical: &ReturnCode,
    business: &ReturnCode,
    report: &str,
) -> Result<()> {
    if technical.is_ok() && business.is_ok() {
        Ok(())
    } else {
        Err(Error::protocol(
            technical.clone(),
            business.clone(),
            report.to_string(),
        ))
    }
}
