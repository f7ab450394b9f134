//! Cryptographic operations for EBICS subscribers
//!
//! This module provides:
//! - RSA key pair generation and PKCS#8 load/store
//! - A006 order signatures (RSA-PSS, SHA-256, MGF1-SHA-256, salt 32)
//! - X002 authentication signatures (RSASSA-PKCS1-v1_5, SHA-256)
//! - E002 hybrid encryption (AES-128-CBC, zero IV, RSAES-PKCS1-v1_5 wrap)
//! - the EBICS public key digest used in `BankPubKeyDigests`
//! - passphrase-based key wrapping for backup export/import

use crate::{Error, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// EBICS mandates 2048-bit subscriber keys.
pub const KEY_BITS: usize = 2048;

/// A006 salt length in bytes.
const A006_SALT_LEN: usize = 32;

/// PBKDF2 rounds for backup key wrapping.
const WRAP_ROUNDS: u32 = 100_000;

/// An RSA key pair owned by a subscriber (or by the bank side of the
/// sandbox).
#[derive(Debug, Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl KeyPair {
    /// Generate a fresh 2048-bit key pair.
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| Error::Crypto(format!("key generation failed: {}", e)))?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// Load from a PKCS#8 DER blob.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| Error::Crypto(format!("PKCS#8 parse failed: {}", e)))?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// Serialize to a PKCS#8 DER blob.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
        Ok(self
            .private
            .to_pkcs8_der()
            .map_err(|e| Error::Crypto(format!("PKCS#8 encode failed: {}", e)))?
            .as_bytes()
            .to_vec())
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    /// A006 order signature over the canonicalized order bytes.
    pub fn sign_a006(&self, order_bytes: &[u8]) -> Result<Vec<u8>> {
        let digest = digest_for_signing(order_bytes);
        let mut rng = rand::thread_rng();
        self.private
            .sign_with_rng(&mut rng, Pss::new_with_salt::<Sha256>(A006_SALT_LEN), &digest)
            .map_err(|e| Error::Crypto(format!("A006 signing failed: {}", e)))
    }

    /// X002 authentication signature over arbitrary bytes (the canonical
    /// `ds:SignedInfo` in practice).
    pub fn sign_x002(&self, data: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(data);
        self.private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| Error::Crypto(format!("X002 signing failed: {}", e)))
    }

    /// Unwrap an E002 transaction key addressed to this key pair.
    pub fn unwrap_transaction_key(&self, wrapped: &[u8]) -> Result<[u8; 16]> {
        let raw = self
            .private
            .decrypt(Pkcs1v15Encrypt, wrapped)
            .map_err(|e| Error::Crypto(format!("transaction key unwrap failed: {}", e)))?;
        if raw.len() != 16 {
            return Err(Error::Crypto(format!(
                "transaction key has {} bytes, expected 16",
                raw.len()
            )));
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&raw);
        Ok(key)
    }
}

/// Verify an A006 signature.
pub fn verify_a006(signature: &[u8], order_bytes: &[u8], public: &RsaPublicKey) -> bool {
    let digest = digest_for_signing(order_bytes);
    public
        .verify(Pss::new_with_salt::<Sha256>(A006_SALT_LEN), &digest, signature)
        .is_ok()
}

/// Verify an X002 signature.
pub fn verify_x002(signature: &[u8], data: &[u8], public: &RsaPublicKey) -> bool {
    let digest = Sha256::digest(data);
    public
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .is_ok()
}

/// SHA-256 of the order bytes with every 0x0D, 0x0A and 0x1A stripped.
/// The strip is mandated by A006; it must match the bank byte-for-byte.
pub fn digest_for_signing(order_bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    let mut run_start = 0;
    for (i, b) in order_bytes.iter().enumerate() {
        if matches!(b, 0x0d | 0x0a | 0x1a) {
            hasher.update(&order_bytes[run_start..i]);
            run_start = i + 1;
        }
    }
    hasher.update(&order_bytes[run_start..]);
    hasher.finalize().into()
}

/// The EBICS digest of an RSA public key: exponent and modulus rendered
/// as lowercase hex of their minimal big-endian byte encodings (no
/// leading zero byte), joined by one ASCII space, then SHA-256. HPB key
/// verification depends on this exact formatting, byte for byte.
pub fn public_key_digest(public: &RsaPublicKey) -> [u8; 32] {
    let formatted = format!(
        "{} {}",
        hex::encode(public.e().to_bytes_be()),
        hex::encode(public.n().to_bytes_be())
    );
    Sha256::digest(formatted.as_bytes()).into()
}

/// Reassemble a public key from its big-endian component bytes (as carried
/// in `ds:RSAKeyValue`).
pub fn public_key_from_components(modulus: &[u8], exponent: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from_bytes_be(exponent),
    )
    .map_err(|e| Error::Crypto(format!("invalid RSA public key: {}", e)))
}

/// Big-endian component bytes of a public key.
pub fn public_key_components(public: &RsaPublicKey) -> (Vec<u8>, Vec<u8>) {
    (public.n().to_bytes_be(), public.e().to_bytes_be())
}

/// A fresh 128-bit E002 transaction key.
pub fn generate_transaction_key() -> [u8; 16] {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// AES-128-CBC encryption with the all-zero IV E002 prescribes.
pub fn aes_encrypt(key: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    let iv = [0u8; 16];
    Aes128CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Inverse of [`aes_encrypt`]. Padding failures are non-retryable.
pub fn aes_decrypt(key: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let iv = [0u8; 16];
    Aes128CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| Error::Crypto(format!("AES decryption failed: {}", e)))
}

/// Wrap a transaction key to the recipient's encryption key.
pub fn wrap_transaction_key(key: &[u8; 16], recipient: &RsaPublicKey) -> Result<Vec<u8>> {
    let mut rng = rand::thread_rng();
    recipient
        .encrypt(&mut rng, Pkcs1v15Encrypt, key)
        .map_err(|e| Error::Crypto(format!("transaction key wrap failed: {}", e)))
}

/// An E002 hybrid encryption result.
#[derive(Debug, Clone)]
pub struct E002Envelope {
    /// The AES transaction key wrapped to the recipient
    pub wrapped_key: Vec<u8>,
    /// [`public_key_digest`] of the recipient key
    pub recipient_key_digest: [u8; 32],
    /// AES-128-CBC ciphertext, zero IV, PKCS#7 padding
    pub ciphertext: Vec<u8>,
}

/// E002 hybrid encryption with a fresh transaction key.
pub fn encrypt_e002(plaintext: &[u8], recipient: &RsaPublicKey) -> Result<E002Envelope> {
    let key = generate_transaction_key();
    Ok(E002Envelope {
        wrapped_key: wrap_transaction_key(&key, recipient)?,
        recipient_key_digest: public_key_digest(recipient),
        ciphertext: aes_encrypt(&key, plaintext),
    })
}

/// E002 hybrid decryption.
pub fn decrypt_e002(wrapped_key: &[u8], ciphertext: &[u8], own: &KeyPair) -> Result<Vec<u8>> {
    let key = own.unwrap_transaction_key(wrapped_key)?;
    aes_decrypt(&key, ciphertext)
}

/// Passphrase-wrap a private key for backup export. The blob carries the
/// PBKDF2 salt and the AES-GCM nonce ahead of the ciphertext.
pub fn wrap_private_key(key: &KeyPair, passphrase: &str) -> Result<Vec<u8>> {
    let der = key.to_pkcs8_der()?;

    let mut salt = [0u8; 16];
    let mut nonce = [0u8; 12];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce);

    let cipher = wrap_cipher(passphrase, &salt);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), der.as_slice())
        .map_err(|e| Error::Crypto(format!("key wrapping failed: {}", e)))?;

    let mut blob = Vec::with_capacity(salt.len() + nonce.len() + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Inverse of [`wrap_private_key`]. A wrong passphrase fails the GCM tag
/// check and is reported as a crypto error.
pub fn unwrap_private_key(blob: &[u8], passphrase: &str) -> Result<KeyPair> {
    if blob.len() < 28 {
        return Err(Error::Crypto("key backup blob is truncated".to_string()));
    }
    let (salt, rest) = blob.split_at(16);
    let (nonce, ciphertext) = rest.split_at(12);

    let cipher = wrap_cipher(passphrase, salt);
    let der = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Crypto("key unwrapping failed (wrong passphrase?)".to_string()))?;
    KeyPair::from_pkcs8_der(&der)
}

fn wrap_cipher(passphrase: &str, salt: &[u8]) -> Aes256Gcm {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, WRAP_ROUNDS, &mut key);
    Aes256Gcm::new_from_slice(&key).expect("32-byte key")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> KeyPair {
        KeyPair::generate().unwrap()
    }

    #[test]
    fn a006_sign_and_verify() {
        let key = test_key();
        let message = b"<Document>pain.001 order data</Document>";

        let signature = key.sign_a006(message).unwrap();
        assert!(verify_a006(&signature, message, key.public()));

        let tampered = b"<Document>pain.001 order data!</Document>";
        assert!(!verify_a006(&signature, tampered, key.public()));

        let wrong_key = test_key();
        assert!(!verify_a006(&signature, message, wrong_key.public()));
    }

    #[test]
    fn a006_digest_strips_cr_lf_sub() {
        let with_noise = b"line one\r\nline two\x1aend";
        let without = b"line oneline twoend";
        assert_eq!(digest_for_signing(with_noise), digest_for_signing(without));

        let expected: [u8; 32] = Sha256::digest(without).into();
        assert_eq!(digest_for_signing(with_noise), expected);
    }

    #[test]
    fn a006_signature_ignores_line_ending_flavor() {
        let key = test_key();
        let crlf = b"<a>\r\n<b/></a>";
        let lf = b"<a>\n<b/></a>";
        let signature = key.sign_a006(crlf).unwrap();
        assert!(verify_a006(&signature, lf, key.public()));
    }

    #[test]
    fn x002_sign_and_verify() {
        let key = test_key();
        let data = b"<ds:SignedInfo>canonical</ds:SignedInfo>";
        let signature = key.sign_x002(data).unwrap();
        assert!(verify_x002(&signature, data, key.public()));
        assert!(!verify_x002(&signature, b"other", key.public()));
    }

    #[test]
    fn e002_roundtrip() {
        let recipient = test_key();
        let plaintext = b"arbitrary payload, not block aligned...";

        let envelope = encrypt_e002(plaintext, recipient.public()).unwrap();
        assert_eq!(
            envelope.recipient_key_digest,
            public_key_digest(recipient.public())
        );

        let recovered =
            decrypt_e002(&envelope.wrapped_key, &envelope.ciphertext, &recipient).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn e002_rejects_wrong_recipient() {
        let recipient = test_key();
        let other = test_key();
        let envelope = encrypt_e002(b"secret", recipient.public()).unwrap();
        assert!(decrypt_e002(&envelope.wrapped_key, &envelope.ciphertext, &other).is_err());
    }

    #[test]
    fn public_key_digest_uses_byte_wise_hex() {
        let key = test_key();
        let (n, e) = public_key_components(key.public());

        // The standard exponent 65537 is the three bytes 0x01 0x00 0x01;
        // its hex form keeps the full leading byte.
        assert_eq!(hex::encode(&e), "010001");
        // A 2048-bit modulus has its high bit set: exactly 256 bytes,
        // no leading zero byte.
        assert_eq!(n.len(), 256);
        assert_ne!(n[0], 0);

        let formatted = format!("{} {}", hex::encode(&e), hex::encode(&n));
        let expected: [u8; 32] = Sha256::digest(formatted.as_bytes()).into();
        assert_eq!(public_key_digest(key.public()), expected);
    }

    #[test]
    fn key_components_roundtrip() {
        let key = test_key();
        let (n, e) = public_key_components(key.public());
        let rebuilt = public_key_from_components(&n, &e).unwrap();
        assert_eq!(&rebuilt, key.public());
    }

    #[test]
    fn pkcs8_roundtrip() {
        let key = test_key();
        let der = key.to_pkcs8_der().unwrap();
        let reloaded = KeyPair::from_pkcs8_der(&der).unwrap();
        assert_eq!(reloaded.public(), key.public());
    }

    #[test]
    fn backup_wrap_roundtrip() {
        let key = test_key();
        let blob = wrap_private_key(&key, "secret").unwrap();
        let restored = unwrap_private_key(&blob, "secret").unwrap();
        assert_eq!(restored.public(), key.public());
    }

    #[test]
    fn backup_wrap_rejects_wrong_passphrase() {
        let key = test_key();
        let blob = wrap_private_key(&key, "secret").unwrap();
        assert!(unwrap_private_key(&blob, "not-secret").is_err());
    }
}
