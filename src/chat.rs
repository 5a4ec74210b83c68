//! Chat message encryption
//!
//! A thin wrapper around the authenticated-box construct used for
//! direct messages: a fresh 24-byte nonce is prepended to the
//! ciphertext and the whole thing is base64-coded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};

use crate::error::AppError;

const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Generate a fresh box keypair, base64-coded (public, secret).
pub fn generate_keys() -> (String, String) {
    let secret = SecretKey::generate(&mut OsRng);
    let public = secret.public_key();
    (
        BASE64.encode(public.as_bytes()),
        BASE64.encode(secret.to_bytes()),
    )
}

/// Decode a base64 32-byte public key.
pub fn key_from_b64(data: &str) -> Result<PublicKey, AppError> {
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|_| AppError::Corrupt("bad key encoding".to_string()))?;
    let arr: [u8; KEY_LEN] = bytes
        .try_into()
        .map_err(|_| AppError::Corrupt("bad key size".to_string()))?;
    Ok(PublicKey::from(arr))
}

/// Decode a base64 32-byte secret key.
pub fn secret_from_b64(data: &str) -> Result<SecretKey, AppError> {
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|_| AppError::Corrupt("bad key encoding".to_string()))?;
    let arr: [u8; KEY_LEN] = bytes
        .try_into()
        .map_err(|_| AppError::Corrupt("bad key size".to_string()))?;
    Ok(SecretKey::from(arr))
}

/// Seal a message to a peer.
pub fn encrypt_string(
    plain: &str,
    seckey: &SecretKey,
    pubkey: &PublicKey,
) -> Result<String, AppError> {
    let salsa = SalsaBox::new(pubkey, seckey);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let sealed = salsa
        .encrypt(&nonce, plain.as_bytes())
        .map_err(|_| AppError::Internal(anyhow::anyhow!("box seal failed")))?;
    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(BASE64.encode(out))
}

/// Open a message from a peer.
pub fn decrypt_string(
    encoded: &str,
    seckey: &SecretKey,
    pubkey: &PublicKey,
) -> Result<String, AppError> {
    let data = BASE64
        .decode(encoded.trim())
        .map_err(|_| AppError::Corrupt("bad chat encoding".to_string()))?;
    if data.len() < NONCE_LEN {
        return Err(AppError::Corrupt("not enough data".to_string()));
    }
    let (nonce, sealed) = data.split_at(NONCE_LEN);
    let nonce = crypto_box::aead::generic_array::GenericArray::clone_from_slice(nonce);
    let salsa = SalsaBox::new(pubkey, seckey);
    let plain = salsa
        .decrypt(&nonce, sealed)
        .map_err(|_| AppError::Rejected("error decrypting chonk".to_string()))?;
    String::from_utf8(plain).map_err(|_| AppError::Corrupt("chat message not utf8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_between_two_parties() {
        let (alice_pub, alice_sec) = generate_keys();
        let (bob_pub, bob_sec) = generate_keys();

        let alice_sec = secret_from_b64(&alice_sec).unwrap();
        let bob_sec = secret_from_b64(&bob_sec).unwrap();
        let alice_pub = key_from_b64(&alice_pub).unwrap();
        let bob_pub = key_from_b64(&bob_pub).unwrap();

        let sealed = encrypt_string("psst", &alice_sec, &bob_pub).expect("seal");
        let opened = decrypt_string(&sealed, &bob_sec, &alice_pub).expect("open");
        assert_eq!(opened, "psst");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let (_, alice_sec) = generate_keys();
        let (bob_pub, _) = generate_keys();
        let (mallory_pub, mallory_sec) = generate_keys();

        let alice_sec = secret_from_b64(&alice_sec).unwrap();
        let bob_pub = key_from_b64(&bob_pub).unwrap();
        let mallory_sec = secret_from_b64(&mallory_sec).unwrap();
        let mallory_pub = key_from_b64(&mallory_pub).unwrap();

        let sealed = encrypt_string("psst", &alice_sec, &bob_pub).expect("seal");
        assert!(decrypt_string(&sealed, &mallory_sec, &mallory_pub).is_err());
    }

    #[test]
    fn short_payload_is_rejected() {
        let (pub_b64, sec_b64) = generate_keys();
        let sec = secret_from_b64(&sec_b64).unwrap();
        let public = key_from_b64(&pub_b64).unwrap();
        assert!(decrypt_string("AAAA", &sec, &public).is_err());
    }

    #[test]
    fn bad_key_sizes_are_rejected() {
        assert!(key_from_b64("AAAA").is_err());
        assert!(secret_from_b64("notbase64!!!").is_err());
    }
}
