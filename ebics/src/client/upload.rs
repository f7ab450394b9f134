//! Upload transaction state machine
//!
//! initialisation -> transfer. The order data is A006-signed (over the
//! stripped bytes), compressed, encrypted under a fresh session key, and
//! shipped in 1 MB ciphertext segments. The bank books only on the final
//! segment acknowledgement, so an aborted upload never half-submits.

use super::{ensure_ok, EbicsClient};
use crate::codes::OrderType;
use crate::envelope;
use crate::keys;
use crate::pack;
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use tracing::info;

/// Ciphertext bytes per transfer segment.
pub const SEGMENT_SIZE: usize = 1024 * 1024;

impl<'a> EbicsClient<'a> {
    /// Run one upload transaction (CCT carrying a pain.001). Idempotence
    /// is the caller's business: one unique pain.001 MsgId per attempt.
    pub async fn upload(
        &self,
        order_type: OrderType,
        order_data: &[u8],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ids = &self.subscriber.ids;
        let digests = self.subscriber.bank_digests()?;
        let bank_enc = self.subscriber.bank_enc()?;

        let order_signature = self.subscriber.sig_key.sign_a006(order_data)?;
        let signature_doc = envelope::user_signature_data(ids, &order_signature).to_document();

        let session_key = keys::generate_transaction_key();
        let wrapped_key = keys::wrap_transaction_key(&session_key, bank_enc)?;
        let ciphertext = keys::aes_encrypt(&session_key, &pack::deflate(order_data));
        let signature_data =
            keys::aes_encrypt(&session_key, &pack::deflate(signature_doc.as_bytes()));

        let num_segments = ciphertext.len().div_ceil(SEGMENT_SIZE).max(1) as u32;

        let init = envelope::upload_init_request(
            ids,
            order_type,
            num_segments,
            &digests,
            &BASE64.encode(&wrapped_key),
            &BASE64.encode(&signature_data),
            now,
        );
        let response = self.exchange(init).await?;
        ensure_ok(&response)?;
        let transaction_id = response
            .transaction_id
            .ok_or_else(|| Error::State("initialisation response without transaction id".to_string()))?;

        for (index, chunk) in ciphertext.chunks(SEGMENT_SIZE).enumerate() {
            let segment = index as u32 + 1;
            let request = envelope::transfer_request(
                &ids.host_id,
                &transaction_id,
                segment,
                segment == num_segments,
                Some(&BASE64.encode(chunk)),
            );
            let response = self.exchange(request).await?;
            ensure_ok(&response)?;
        }

        info!(
            order = %order_type,
            transaction = %transaction_id,
            segments = num_segments,
            "upload complete"
        );
        Ok(())
    }
}
