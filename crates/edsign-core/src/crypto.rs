//! Ed25519 group primitives: scalar derivation, Schnorr verification and
//! the deal encryption used by the key generation protocol.
//!
//! The scheme is EdDSA-compatible: private scalars are derived from an
//! Ed25519 seed exactly as RFC 8032 does, and the Schnorr challenge is the
//! SHA-512 of `R ‖ Y ‖ m` wide-reduced, so an aggregated signature under a
//! distributed key verifies as a plain Ed25519 signature.

pub mod poly;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use curve25519_dalek::{edwards::CompressedEdwardsY, EdwardsPoint, Scalar};
use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

/// Byte length of an encoded point, scalar or session id.
pub const ELEMENT_LENGTH: usize = 32;

/// Byte length of a Schnorr or EdDSA signature.
pub const SIGNATURE_LENGTH: usize = 64;

/// Derive the private curve scalar from an Ed25519 seed: first half of
/// SHA-512, clamped per RFC 8032, reduced mod the group order.
pub fn derive_scalar(seed: &[u8; 32]) -> Scalar {
    let digest = Sha512::digest(seed);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest[..32]);
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
    Scalar::from_bytes_mod_order(bytes)
}

/// Derive the X25519 exchange key from an Ed25519 seed. The clamping is
/// left to the exchange function.
pub fn derive_exchange_key(seed: &[u8; 32]) -> [u8; 32] {
    let digest = Sha512::digest(seed);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest[..32]);
    bytes
}

/// Convert an Ed25519 public key to its X25519 (Montgomery) form.
pub fn ed25519_to_x25519(public: &[u8; 32]) -> Result<[u8; 32]> {
    let point = decode_point(public)?;
    Ok(point.to_montgomery().to_bytes())
}

/// Decode a compressed Edwards point.
pub fn decode_point(bytes: &[u8; 32]) -> Result<EdwardsPoint> {
    CompressedEdwardsY(*bytes)
        .decompress()
        .ok_or_else(|| Error::Codec("invalid point encoding".into()))
}

/// Decode a canonical scalar.
pub fn decode_scalar(bytes: &[u8; 32]) -> Result<Scalar> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes))
        .ok_or_else(|| Error::Codec("non-canonical scalar encoding".into()))
}

/// Schnorr challenge `H(R ‖ Y ‖ m)`, wide-reduced as in RFC 8032.
pub fn challenge(nonce_point: &EdwardsPoint, public: &EdwardsPoint, message: &[u8]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(nonce_point.compress().as_bytes());
    hasher.update(public.compress().as_bytes());
    hasher.update(message);
    Scalar::from_bytes_mod_order_wide(&hasher.finalize().into())
}

/// Verify a Schnorr signature `R ‖ s` against a public key:
/// `s·G == R + H(R ‖ Y ‖ m)·Y`.
pub fn schnorr_verify(public: &EdwardsPoint, message: &[u8], signature: &[u8]) -> Result<()> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(Error::Protocol(format!(
            "signature must be {SIGNATURE_LENGTH} bytes, got {}",
            signature.len()
        )));
    }
    let mut r_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&signature[..32]);
    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&signature[32..]);

    let r = decode_point(&r_bytes)?;
    let s = decode_scalar(&s_bytes)?;
    let c = challenge(&r, public, message);

    let recovered = EdwardsPoint::vartime_double_scalar_mul_basepoint(&-c, public, &s);
    if recovered == r {
        Ok(())
    } else {
        Err(Error::Protocol("invalid schnorr signature".into()))
    }
}

/// Symmetric key for one dealer→verifier share, bound to the session and
/// both endpoints. The underlying X25519 secret is the ECDH of the two
/// peers' converted Ed25519 keys, so each key is used exactly once.
pub fn deal_key(
    shared: &[u8; 32],
    session_id: &[u8; 32],
    dealer: &[u8; 32],
    verifier: &[u8; 32],
) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(session_id), shared);
    let mut info = Vec::with_capacity(11 + 64);
    info.extend_from_slice(b"edsign-deal");
    info.extend_from_slice(dealer);
    info.extend_from_slice(verifier);
    let mut key = [0u8; 32];
    hk.expand(&info, &mut key)
        .expect("32 bytes is a valid hkdf output length");
    key
}

/// Encrypt a 32-byte share under a one-time deal key.
pub fn seal_share(key: &[u8; 32], share: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), share.as_slice())
        .map_err(|_| Error::Internal("share encryption failed".into()))
}

/// Decrypt a share sealed with [`seal_share`].
pub fn open_share(key: &[u8; 32], ciphertext: &[u8]) -> Result<[u8; 32]> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plain = cipher
        .decrypt(Nonce::from_slice(&[0u8; 12]), ciphertext)
        .map_err(|_| Error::Protocol("share decryption failed".into()))?;
    plain
        .try_into()
        .map_err(|_| Error::Protocol("decrypted share has wrong length".into()))
}
