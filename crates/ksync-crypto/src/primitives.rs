//! Low-level primitives: AES-256-CBC, HMAC-SHA256, HKDF-Expand, friendly base32
//!
//! Everything above this module treats these as black boxes; key and IV
//! sizes are fixed by the types here.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::SecretString;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::{IV_SIZE, KEY_SIZE, SYNC_KEY_SIZE};

/// HMAC-SHA256 state keyed and ready to absorb data.
///
/// This is the prepared key object cached by every key bundle; cloning it is
/// cheaper than re-keying for each record.
pub type HmacSha256 = Hmac<Sha256>;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Size of an HMAC-SHA256 output in bytes
pub const HMAC_SIZE: usize = 32;

/// Generate a random 256-bit key.
pub fn random_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Generate a random 128-bit IV.
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// AES-256-CBC encrypt with PKCS#7 padding.
pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// AES-256-CBC decrypt and strip PKCS#7 padding.
pub fn decrypt(ciphertext: &[u8], key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> CryptoResult<Vec<u8>> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptionFormat("invalid block length or padding".into()))
}

/// Key an HMAC-SHA256 instance.
pub fn prepare_hmac_key(key: &[u8]) -> CryptoResult<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(format!("HMAC key: {e}")))
}

/// Key an HMAC-SHA256 instance with a fixed-size bundle key.
pub fn hmac_key_object(key: &[u8; KEY_SIZE]) -> HmacSha256 {
    let Ok(mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac
}

/// HMAC-SHA256 of `data` under a prepared key.
pub fn hmac_sha256(data: &[u8], prepared: &HmacSha256) -> [u8; HMAC_SIZE] {
    let mut mac = prepared.clone();
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// HKDF-Expand (RFC 5869 section 2.3) with SHA-256.
///
/// Sync keys are 16 bytes, shorter than the hash output, so the PRK is
/// used as an HMAC key directly instead of going through `Hkdf::from_prk`,
/// which rejects PRKs shorter than 32 bytes.
pub fn hkdf_expand(prk: &[u8], info: &[u8], len: usize) -> CryptoResult<Zeroizing<Vec<u8>>> {
    if len > 255 * HMAC_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "HKDF output too long: {len} bytes (maximum {})",
            255 * HMAC_SIZE
        )));
    }

    let prepared = prepare_hmac_key(prk)?;
    let mut okm = Zeroizing::new(Vec::with_capacity(len));
    let mut block: Vec<u8> = Vec::new();
    let mut counter: u8 = 1;

    while okm.len() < len {
        let mut mac = prepared.clone();
        mac.update(&block);
        mac.update(info);
        mac.update(&[counter]);
        block.zeroize();
        block = mac.finalize().into_bytes().to_vec();

        let take = (len - okm.len()).min(block.len());
        okm.extend_from_slice(&block[..take]);
        counter = counter.wrapping_add(1);
    }
    block.zeroize();

    Ok(okm)
}

/// Decode a user-facing sync key into its 16 raw key bytes.
///
/// Accepts the hyphenated lowercase form, with `8` standing for `l` and `9`
/// for `o`. Whitespace, hyphens and trailing `=` padding are ignored. Any
/// input that does not decode to exactly [`SYNC_KEY_SIZE`] bytes is rejected.
pub fn decode_key_base32(key: &str) -> CryptoResult<Zeroizing<Vec<u8>>> {
    let normalized: Zeroizing<String> = Zeroizing::new(
        key.chars()
            .filter(|c| *c != '-' && !c.is_whitespace())
            .map(|c| match c.to_ascii_uppercase() {
                '8' => 'L',
                '9' => 'O',
                other => other,
            })
            .collect::<String>()
            .trim_end_matches('=')
            .to_string(),
    );

    let decoded = BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::InvalidKey(format!("sync key is not valid base32: {e}")))?;

    if decoded.len() != SYNC_KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "sync key has wrong size: {} bytes (expected {SYNC_KEY_SIZE})",
            decoded.len()
        )));
    }
    Ok(decoded)
}

/// Encode raw key bytes in the user-facing sync key form.
///
/// A 16-byte key becomes `x-xxxxx-xxxxx-xxxxx-xxxxx-xxxxx`.
pub fn encode_key_base32(key: &[u8]) -> String {
    let friendly: String = BASE32_NOPAD
        .encode(key)
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            'l' => '8',
            'o' => '9',
            other => other,
        })
        .collect();

    let mut chars = friendly.chars();
    let mut out = String::with_capacity(friendly.len() + friendly.len() / 5);
    if let Some(first) = chars.next() {
        out.push(first);
    }
    for (i, c) in chars.enumerate() {
        if i % 5 == 0 {
            out.push('-');
        }
        out.push(c);
    }
    out
}

/// Generate a new random sync key in its user-facing form.
pub fn generate_sync_key() -> SecretString {
    let mut raw = [0u8; SYNC_KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut raw);
    let encoded = encode_key_base32(&raw);
    raw.zeroize();
    SecretString::from(encoded)
}
