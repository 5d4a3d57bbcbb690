//! Cryptographic primitives for tracker payload recovery.
//!
//! Everything the codec needs lives here:
//! - big-endian integer <-> byte conversions,
//! - SHA-256 and HMAC-MD5 digests,
//! - AES-128-GCM decryption with a detached tag and a 16-byte IV,
//! - AES-128-CBC (manual block chaining) with PKCS7 unpadding,
//! - SECP224R1 public-X derivation and ECDH key agreement.
//!
//! The GCM IV here is 16 bytes, not the usual 12; the finder network derives
//! it from the same SHA-256 block as the AES key, so the cipher type is
//! instantiated with a 16-byte nonce.

use aes::cipher::consts::U16;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes128;
use aes_gcm::aead::Aead;
use aes_gcm::AesGcm;
use hmac::{Hmac, Mac};
use md5::Md5;
use p224::ecdh::diffie_hellman;
use p224::elliptic_curve::sec1::ToEncodedPoint;
use p224::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

type Aes128Gcm16 = AesGcm<Aes128, U16>;
type HmacMd5 = Hmac<Md5>;

/// Length of a SECP224R1 scalar and of a coordinate, in octets.
pub const SCALAR_LEN: usize = 28;

/// SEC1 uncompressed point length: 0x04 prefix plus X and Y coordinates.
pub const SEC1_POINT_LEN: usize = 1 + 2 * SCALAR_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("private key is not a valid 28-byte scalar")]
    InvalidScalar,
    #[error("not a valid SECP224R1 point")]
    InvalidPoint,
    #[error("key or iv has the wrong length")]
    KeyLength,
    #[error("ciphertext is not block aligned")]
    BlockAlignment,
    #[error("gcm tag verification failed")]
    TagMismatch,
    #[error("invalid pkcs7 padding")]
    BadPadding,
    #[error("payload too short: {0} bytes")]
    PayloadTooShort(usize),
    #[error("decrypted fix has the wrong length")]
    FixLength,
}

/// Interpret up to 8 bytes as a big-endian unsigned integer.
pub fn bytes_to_int(bytes: &[u8]) -> u64 {
    debug_assert!(bytes.len() <= 8);
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Big-endian encoding of `n` into exactly `length` bytes.
pub fn int_to_bytes(n: u64, length: usize) -> Vec<u8> {
    let mut out = vec![0u8; length];
    for (i, byte) in out.iter_mut().rev().enumerate().take(8) {
        *byte = (n >> (8 * i)) as u8;
    }
    out
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// HMAC-MD5 digest; the key length is unrestricted.
pub fn hmac_md5(key: &[u8], data: &[u8]) -> Result<[u8; 16], CryptoError> {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// AES-128-GCM decrypt with a detached authentication tag and 16-byte IV.
pub fn aes_gcm_decrypt(
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != 16 {
        return Err(CryptoError::KeyLength);
    }
    let cipher = Aes128Gcm16::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
    let mut sealed = Vec::with_capacity(ciphertext.len() + tag.len());
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);
    cipher
        .decrypt(GenericArray::from_slice(iv), sealed.as_slice())
        .map_err(|_| {
            debug!(ct_len = ciphertext.len(), tag_len = tag.len(), "gcm decrypt failed");
            CryptoError::TagMismatch
        })
}

/// Decrypt AES-128-CBC by chaining single-block decrypts, leaving any padding
/// in place for the caller to strip.
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != 16 {
        return Err(CryptoError::KeyLength);
    }
    if ciphertext.len() % 16 != 0 {
        return Err(CryptoError::BlockAlignment);
    }
    let cipher = Aes128::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
    let mut out = vec![0u8; ciphertext.len()];
    let mut prev = [0u8; 16];
    prev.copy_from_slice(iv);
    for (i, chunk) in ciphertext.chunks(16).enumerate() {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        out[i * 16..(i + 1) * 16].copy_from_slice(&block);
        prev.copy_from_slice(chunk);
    }
    Ok(out)
}

/// Remove PKCS7 padding from a mutable buffer.
pub fn pkcs7_unpad(data: &mut Vec<u8>, block_size: usize) -> Result<(), CryptoError> {
    let Some(&last) = data.last() else {
        debug!("pkcs7_unpad: empty data");
        return Err(CryptoError::BadPadding);
    };
    let pad = last as usize;
    if pad == 0 || pad > block_size || pad > data.len() {
        debug!(pad, len = data.len(), "pkcs7_unpad: invalid pad value");
        return Err(CryptoError::BadPadding);
    }
    let len = data.len();
    if !data[len - pad..].iter().all(|&b| b as usize == pad) {
        debug!(pad, len, "pkcs7_unpad: pad bytes mismatch");
        return Err(CryptoError::BadPadding);
    }
    data.truncate(len - pad);
    Ok(())
}

/// Big-endian X coordinate of `priv * G` on SECP224R1.
pub fn derive_public_x(private_key: &[u8]) -> Result<[u8; SCALAR_LEN], CryptoError> {
    let secret = SecretKey::from_slice(private_key).map_err(|_| CryptoError::InvalidScalar)?;
    let point = secret.public_key().to_encoded_point(false);
    let x = point.x().ok_or(CryptoError::InvalidPoint)?;
    let mut out = [0u8; SCALAR_LEN];
    out.copy_from_slice(x);
    Ok(out)
}

/// ECDH shared secret (28-byte X coordinate) between our scalar and a peer
/// point in SEC1 uncompressed form. Off-curve points are rejected.
pub fn ecdh(private_key: &[u8], peer_point: &[u8]) -> Result<[u8; SCALAR_LEN], CryptoError> {
    let secret = SecretKey::from_slice(private_key).map_err(|_| CryptoError::InvalidScalar)?;
    let peer = PublicKey::from_sec1_bytes(peer_point).map_err(|_| CryptoError::InvalidPoint)?;
    let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    let mut out = [0u8; SCALAR_LEN];
    out.copy_from_slice(shared.raw_secret_bytes().as_slice());
    Ok(out)
}

/// Encrypt helper for building test payloads; mirrors [`aes_gcm_decrypt`] and
/// returns ciphertext with the 16-byte tag appended.
#[cfg(test)]
pub(crate) fn aes_gcm_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes128Gcm16::new_from_slice(key).expect("aes-128 key");
    cipher
        .encrypt(GenericArray::from_slice(iv), plaintext)
        .expect("gcm encrypt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncrypt;

    #[test]
    fn int_codec_round_trips() {
        assert_eq!(bytes_to_int(&[0x01, 0x02]), 0x0102);
        assert_eq!(bytes_to_int(&[0xFF, 0xFF, 0xFF, 0xFF]), 0xFFFF_FFFF);
        assert_eq!(int_to_bytes(0x0102, 2), vec![0x01, 0x02]);
        assert_eq!(int_to_bytes(1, 4), vec![0, 0, 0, 1]);
        let n = 0xDEAD_BEEFu64;
        assert_eq!(bytes_to_int(&int_to_bytes(n, 8)), n);
    }

    #[test]
    fn sha256_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hmac_md5_rfc2202_vector() {
        let key = [0x0bu8; 16];
        let digest = hmac_md5(&key, b"Hi There").expect("hmac");
        assert_eq!(hex::encode(digest), "9294727a3638bb1c13f48ef8158bfc9d");
    }

    #[test]
    fn pkcs7_unpad_strips_valid_padding() {
        let mut data = b"hello\x03\x03\x03".to_vec();
        pkcs7_unpad(&mut data, 16).expect("valid padding");
        assert_eq!(data, b"hello");
    }

    #[test]
    fn pkcs7_unpad_rejects_garbage() {
        let mut zero = b"hello\x00".to_vec();
        assert_eq!(pkcs7_unpad(&mut zero, 16), Err(CryptoError::BadPadding));
        let mut oversized = b"ab\x11".to_vec();
        assert_eq!(pkcs7_unpad(&mut oversized, 16), Err(CryptoError::BadPadding));
        let mut mixed = b"hello\x02\x03".to_vec();
        assert_eq!(pkcs7_unpad(&mut mixed, 16), Err(CryptoError::BadPadding));
        let mut empty = Vec::new();
        assert_eq!(pkcs7_unpad(&mut empty, 16), Err(CryptoError::BadPadding));
    }

    fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
        // Reference encryptor for the decrypt test: XOR-then-encrypt chaining.
        let cipher = Aes128::new_from_slice(key).unwrap();
        let mut prev = *iv;
        let mut out = Vec::with_capacity(plaintext.len());
        for chunk in plaintext.chunks(16) {
            let mut block = [0u8; 16];
            block.copy_from_slice(chunk);
            for (b, p) in block.iter_mut().zip(prev.iter()) {
                *b ^= p;
            }
            let mut ga = GenericArray::clone_from_slice(&block);
            cipher.encrypt_block(&mut ga);
            out.extend_from_slice(&ga);
            prev.copy_from_slice(&ga);
        }
        out
    }

    #[test]
    fn cbc_decrypt_inverts_encrypt() {
        let key = [0x42u8; 16];
        let iv = [0x07u8; 16];
        let plaintext = b"two blocks of very secret data!!";
        assert_eq!(plaintext.len(), 32);
        let ciphertext = cbc_encrypt(&key, &iv, plaintext);
        let decrypted = aes_cbc_decrypt(&key, &iv, &ciphertext).expect("decrypt");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn cbc_decrypt_rejects_misaligned_input() {
        let err = aes_cbc_decrypt(&[0u8; 16], &[0u8; 16], &[0u8; 17]);
        assert_eq!(err, Err(CryptoError::BlockAlignment));
    }

    #[test]
    fn gcm_round_trip_and_tag_check() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let sealed = aes_gcm_encrypt(&key, &iv, b"0123456789");
        let (ct, tag) = sealed.split_at(sealed.len() - 16);
        assert_eq!(aes_gcm_decrypt(&key, &iv, ct, tag).unwrap(), b"0123456789");

        let mut bad_tag = tag.to_vec();
        bad_tag[0] ^= 0x01;
        assert_eq!(
            aes_gcm_decrypt(&key, &iv, ct, &bad_tag),
            Err(CryptoError::TagMismatch)
        );
    }

    #[test]
    fn public_x_is_deterministic() {
        let private_key = [0x11u8; SCALAR_LEN];
        let first = derive_public_x(&private_key).unwrap();
        let second = derive_public_x(&private_key).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, [0u8; SCALAR_LEN]);
    }

    #[test]
    fn invalid_scalar_is_rejected() {
        assert_eq!(
            derive_public_x(&[0u8; SCALAR_LEN]),
            Err(CryptoError::InvalidScalar)
        );
        assert_eq!(derive_public_x(&[1, 2, 3]), Err(CryptoError::InvalidScalar));
    }

    #[test]
    fn ecdh_agreement_is_symmetric() {
        let a_priv = [0x11u8; SCALAR_LEN];
        let b_priv = [0x2au8; SCALAR_LEN];
        let a_pub = {
            let secret = SecretKey::from_slice(&a_priv).unwrap();
            secret.public_key().to_encoded_point(false).as_bytes().to_vec()
        };
        let b_pub = {
            let secret = SecretKey::from_slice(&b_priv).unwrap();
            secret.public_key().to_encoded_point(false).as_bytes().to_vec()
        };
        assert_eq!(a_pub.len(), SEC1_POINT_LEN);
        let ab = ecdh(&a_priv, &b_pub).unwrap();
        let ba = ecdh(&b_priv, &a_pub).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn ecdh_rejects_off_curve_point() {
        let mut garbage = vec![0x04u8];
        garbage.extend_from_slice(&[0xABu8; 2 * SCALAR_LEN]);
        assert_eq!(
            ecdh(&[0x11u8; SCALAR_LEN], &garbage),
            Err(CryptoError::InvalidPoint)
        );
    }
}
