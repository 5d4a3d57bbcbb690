//! Find My location payload codec (identifier derivation & record decrypt).
//!
//! A sighting payload returned by the crowdsourced network carries:
//! - bytes `[0..4)`: big-endian seconds since 2001-01-01 UTC (outside the
//!   encrypted envelope),
//! - an ephemeral SECP224R1 public point (SEC1 uncompressed, 57 octets),
//! - 10 octets of AES-128-GCM ciphertext,
//! - the 16-octet GCM tag.
//!
//! Newer finder firmware ships a few extra header octets; the whole layout
//! shifts right by `adj = len - 88`, so an 88-byte packet decodes at the
//! classic offsets and longer packets at shifted ones.
//!
//! Decryption: ECDH between the tracker's private scalar and the ephemeral
//! point, then a single-counter SHA-256 KDF over
//! `shared || 0x00000001 || ephemeral_point` whose 32-byte output splits into
//! AES key (first half) and GCM IV (second half).

use base64::Engine;
use serde::Serialize;
use tracing::debug;

use crate::crypto::{self, CryptoError};
use crate::date::EPOCH_DIFF;

/// Shortest valid payload; anything extra shifts the field offsets.
pub const MIN_PAYLOAD_LEN: usize = 88;

/// KDF counter block, fixed at 1 for the single 32-byte output round.
const KDF_COUNTER: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// A decoded plaintext fix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub lat: f64,
    pub lon: f64,
    pub conf: u8,
    pub status: u8,
}

/// SHA-256 of the tracker's public X coordinate.
pub fn hashed_public_key(private_key: &[u8]) -> Result<[u8; 32], CryptoError> {
    let public_x = crypto::derive_public_x(private_key)?;
    Ok(crypto::sha256(&public_x))
}

/// Base64 form of [`hashed_public_key`]; this is the identifier the fetch
/// endpoint is queried with and the join key for returned sightings.
pub fn hashed_public_key_b64(private_key: &[u8]) -> Result<String, CryptoError> {
    Ok(base64::engine::general_purpose::STANDARD.encode(hashed_public_key(private_key)?))
}

/// Recover the 10-octet plaintext fix from a raw payload.
pub fn decrypt_payload(private_key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < MIN_PAYLOAD_LEN {
        debug!(
            len = data.len(),
            head = %hex::encode(&data[..data.len().min(8)]),
            "payload shorter than the minimum layout"
        );
        return Err(CryptoError::PayloadTooShort(data.len()));
    }
    let adj = data.len() - MIN_PAYLOAD_LEN;
    let ephemeral_point = &data[5 + adj..62 + adj];
    let shared = crypto::ecdh(private_key, ephemeral_point)?;
    debug!(adj, eph_prefix = %hex::encode(&ephemeral_point[..4]), "derived shared secret");

    let mut kdf_input = Vec::with_capacity(shared.len() + KDF_COUNTER.len() + ephemeral_point.len());
    kdf_input.extend_from_slice(&shared);
    kdf_input.extend_from_slice(&KDF_COUNTER);
    kdf_input.extend_from_slice(ephemeral_point);
    let symmetric = crypto::sha256(&kdf_input);
    let (key, iv) = symmetric.split_at(16);

    let ciphertext = &data[62 + adj..72 + adj];
    let tag = &data[72 + adj..];
    crypto::aes_gcm_decrypt(key, iv, ciphertext, tag)
}

/// Decode a plaintext fix: two signed big-endian 1e-7 degree coordinates,
/// a confidence byte and a status byte.
pub fn decode_fix(plaintext: &[u8]) -> Result<Report, CryptoError> {
    if plaintext.len() != 10 {
        return Err(CryptoError::FixLength);
    }
    let mut be = [0u8; 4];
    be.copy_from_slice(&plaintext[0..4]);
    let lat = i32::from_be_bytes(be);
    be.copy_from_slice(&plaintext[4..8]);
    let lon = i32::from_be_bytes(be);
    Ok(Report {
        lat: lat as f64 / 10_000_000.0,
        lon: lon as f64 / 10_000_000.0,
        conf: plaintext[8],
        status: plaintext[9],
    })
}

/// Decrypt and decode in one step.
pub fn decode_report(private_key: &[u8], data: &[u8]) -> Result<Report, CryptoError> {
    decode_fix(&decrypt_payload(private_key, data)?)
}

/// Sighting time from the unencrypted payload head, converted to Unix seconds.
pub fn payload_timestamp(data: &[u8]) -> Result<i64, CryptoError> {
    if data.len() < 4 {
        return Err(CryptoError::PayloadTooShort(data.len()));
    }
    Ok(crypto::bytes_to_int(&data[0..4]) as i64 + EPOCH_DIFF)
}

/// Build an encrypted payload the way a finder device would, for tests.
/// `padding` widens the header region to exercise the shifted layout.
#[cfg(test)]
pub(crate) fn encrypt_test_payload(
    private_key: &[u8],
    fix: &[u8; 10],
    timestamp_2001: u32,
    padding: usize,
) -> Vec<u8> {
    use p224::elliptic_curve::sec1::ToEncodedPoint;
    use p224::SecretKey;

    let tracker = SecretKey::from_slice(private_key).expect("tracker key");
    let ephemeral = SecretKey::from_slice(&[0x2au8; crypto::SCALAR_LEN]).expect("ephemeral key");
    let ephemeral_point = ephemeral
        .public_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec();

    // The finder side of the same agreement: ephemeral scalar x tracker point.
    let shared = p224::ecdh::diffie_hellman(
        ephemeral.to_nonzero_scalar(),
        tracker.public_key().as_affine(),
    );
    let mut kdf_input = shared.raw_secret_bytes().to_vec();
    kdf_input.extend_from_slice(&KDF_COUNTER);
    kdf_input.extend_from_slice(&ephemeral_point);
    let symmetric = crypto::sha256(&kdf_input);
    let (key, iv) = symmetric.split_at(16);
    let sealed = crypto::aes_gcm_encrypt(key, iv, fix);

    let mut data = Vec::with_capacity(MIN_PAYLOAD_LEN + padding);
    data.extend_from_slice(&timestamp_2001.to_be_bytes());
    data.push(0x00);
    data.extend(std::iter::repeat(0xAA).take(padding));
    data.extend_from_slice(&ephemeral_point);
    data.extend_from_slice(&sealed);
    data
}
