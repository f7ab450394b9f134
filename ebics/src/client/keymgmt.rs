//! Key-exchange handshake: INI, HIA and HPB

use super::{ensure_km_ok, EbicsClient};
use crate::codes::OrderType;
use crate::envelope;
use crate::keys;
use crate::pack;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rsa::RsaPublicKey;
use tracing::info;

impl<'a> EbicsClient<'a> {
    /// INI: upload the subscriber's A006 signature public key.
    pub async fn send_ini(&self, now: DateTime<Utc>) -> Result<()> {
        let ids = &self.subscriber.ids;
        let order_data =
            envelope::signature_pubkey_order_data(self.subscriber.sig_key.public(), ids, now)
                .to_document();
        self.send_unsecured(OrderType::Ini, order_data.as_bytes())
            .await?;
        info!(user = %ids.user_id, "INI accepted by host {}", ids.host_id);
        Ok(())
    }

    /// HIA: upload the subscriber's X002 and E002 public keys.
    pub async fn send_hia(&self, now: DateTime<Utc>) -> Result<()> {
        let ids = &self.subscriber.ids;
        let order_data = envelope::hia_order_data(
            self.subscriber.auth_key.public(),
            self.subscriber.enc_key.public(),
            ids,
            now,
        )
        .to_document();
        self.send_unsecured(OrderType::Hia, order_data.as_bytes())
            .await?;
        info!(user = %ids.user_id, "HIA accepted by host {}", ids.host_id);
        Ok(())
    }

    async fn send_unsecured(&self, order_type: OrderType, order_data: &[u8]) -> Result<()> {
        let request = envelope::unsecured_request(&self.subscriber.ids, order_type, order_data);
        let response_xml = self.transport.post(request.to_document()).await?;
        let response = envelope::parse_key_management_response(&response_xml)?;
        ensure_km_ok(&response.technical, &response.business, &response.report)
    }

    /// HPB: download the bank's X002 and E002 public keys. The caller
    /// persists them on the connection; the subscriber is "ready" from
    /// then on.
    pub async fn fetch_bank_keys(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(RsaPublicKey, RsaPublicKey)> {
        let ids = &self.subscriber.ids;
        let request = envelope::hpb_request(ids, now);
        let response_xml = self.transport.post(request.to_document()).await?;
        let response = envelope::parse_key_management_response(&response_xml)?;
        ensure_km_ok(&response.technical, &response.business, &response.report)?;

        let (wrapped_key, ciphertext) = response
            .payload
            .ok_or_else(|| Error::State("HPB response carried no order data".to_string()))?;
        let compressed = keys::decrypt_e002(&wrapped_key, &ciphertext, &self.subscriber.enc_key)?;
        let xml = String::from_utf8(pack::inflate(&compressed)?)
            .map_err(|_| Error::Xml(moneta_xml::Error::Parse("HPB payload is not UTF-8".to_string())))?;
        let (bank_auth, bank_enc) = envelope::parse_hpb_order_data(&xml)?;
        info!(user = %ids.user_id, "HPB delivered bank keys for host {}", ids.host_id);
        Ok((bank_auth, bank_enc))
    }
}
