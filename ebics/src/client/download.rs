//! Download transaction state machine
//!
//! initialisation -> transfer (2..N) -> receipt. The payload is the
//! concatenation of all segments, E002-decrypted and inflated. C5x orders
//! deliver a ZIP of camt documents, HTD a single XML.

use super::{ensure_ok, EbicsClient};
use crate::codes::OrderType;
use crate::envelope;
use crate::keys;
use crate::pack;
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info};

impl<'a> EbicsClient<'a> {
    /// Run one download transaction. `Ok(None)` means the bank had no
    /// documents for the requested range (EBICS_NO_DOWNLOAD_DATA_AVAILABLE).
    pub async fn download(
        &self,
        order_type: OrderType,
        range: Option<(NaiveDate, NaiveDate)>,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<u8>>> {
        let ids = &self.subscriber.ids;
        let digests = self.subscriber.bank_digests()?;

        let init =
            envelope::download_init_request(ids, order_type, range, &digests, now);
        let response = self.exchange(init).await?;
        if response.technical.is_no_download_data() || response.business.is_no_download_data() {
            debug!(order = %order_type, "no download data available");
            return Ok(None);
        }
        ensure_ok(&response)?;

        let transaction_id = response
            .transaction_id
            .clone()
            .ok_or_else(|| Error::State("initialisation response without transaction id".to_string()))?;
        let num_segments = response.num_segments.unwrap_or(1).max(1);
        let wrapped_key = response
            .transaction_key
            .clone()
            .ok_or_else(|| Error::State("download response without transaction key".to_string()))?;

        let mut ciphertext = response
            .segment
            .ok_or_else(|| Error::State("initialisation response without segment 1".to_string()))?;

        for segment in 2..=num_segments {
            let request = envelope::transfer_request(
                &ids.host_id,
                &transaction_id,
                segment,
                segment == num_segments,
                None,
            );
            let response = self.exchange(request).await?;
            ensure_ok(&response)?;
            ciphertext.extend(response.segment.ok_or_else(|| {
                Error::State(format!("transfer response without segment {}", segment))
            })?);
        }

        let receipt = envelope::receipt_request(&ids.host_id, &transaction_id, 0);
        let response = self.exchange(receipt).await?;
        ensure_ok(&response)?;

        let compressed = keys::decrypt_e002(&wrapped_key, &ciphertext, &self.subscriber.enc_key)?;
        let payload = pack::inflate(&compressed)?;
        info!(
            order = %order_type,
            transaction = %transaction_id,
            segments = num_segments,
            bytes = payload.len(),
            "download complete"
        );
        Ok(Some(payload))
    }

    /// Download and unpack into individual XML documents: the ZIP entries
    /// for C5x orders, the payload itself otherwise.
    pub async fn download_documents(
        &self,
        order_type: OrderType,
        range: Option<(NaiveDate, NaiveDate)>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let payload = match self.download(order_type, range, now).await? {
            Some(payload) => payload,
            None => return Ok(Vec::new()),
        };
        let raw_documents = if order_type.is_zipped_download() {
            pack::zip_unpack(&payload)?
        } else {
            vec![payload]
        };
        raw_documents
            .into_iter()
            .map(|bytes| {
                String::from_utf8(bytes).map_err(|_| {
                    Error::Xml(moneta_xml::Error::Parse(
                        "downloaded document is not UTF-8".to_string(),
                    ))
                })
            })
            .collect()
    }
}
