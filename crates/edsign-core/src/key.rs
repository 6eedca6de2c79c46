//! Cryptographic material: local key pairs, self-signed identities and
//! distributed shares.

use curve25519_dalek::{EdwardsPoint, Scalar};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto;
use crate::error::{Error, Result};

/// Public information identifying a participant.
///
/// Identities are self-signed: the signature covers the public key and the
/// address, and the `id` fingerprint is the hex SHA-256 of that signature.
/// Two identities are equal when their public keys are equal.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Identity {
    /// Ed25519 public key
    #[serde(with = "hex::serde")]
    pub key: [u8; 32],
    /// EdDSA self-signature over `key ‖ address`
    #[serde(with = "hex::serde")]
    pub signature: [u8; 64],
    /// Hex SHA-256 fingerprint of the self-signature
    pub id: String,
    /// Reachable address, empty when peers are dialed out of band
    pub address: String,
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Identity {}

impl Identity {
    fn self_signed_payload(key: &[u8; 32], address: &str) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32 + address.len());
        payload.extend_from_slice(key);
        payload.extend_from_slice(address.as_bytes());
        payload
    }

    /// The EdDSA verification key.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.key)
            .map_err(|_| Error::Codec("invalid identity public key".into()))
    }

    /// The public key as a curve point.
    pub fn point(&self) -> Result<EdwardsPoint> {
        crypto::decode_point(&self.key)
    }

    /// The X25519 form of the public key, used for deal encryption.
    pub fn exchange_key(&self) -> Result<[u8; 32]> {
        crypto::ed25519_to_x25519(&self.key)
    }

    /// Check the self-signature and the fingerprint.
    pub fn verify_self(&self) -> Result<()> {
        let payload = Self::self_signed_payload(&self.key, &self.address);
        self.verify(&payload, &self.signature)?;
        let expected = hex::encode(Sha256::digest(self.signature));
        if self.id != expected {
            return Err(Error::Protocol("identity fingerprint mismatch".into()));
        }
        Ok(())
    }

    /// Verify an EdDSA signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<()> {
        self.verifying_key()?
            .verify(message, &Signature::from_bytes(signature))
            .map_err(|_| Error::Protocol("invalid signature".into()))
    }

    /// Short fingerprint prefix for logging.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}

/// The local private key pair: an Ed25519 seed and the matching identity.
pub struct Private {
    signing: SigningKey,
    identity: Identity,
}

impl Private {
    /// Generate a fresh key pair self-signed over the given address.
    pub fn generate<R: RngCore + CryptoRng>(address: &str, rng: &mut R) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self::from_seed(seed, address)
    }

    /// Rebuild the key pair and identity from a stored seed.
    pub fn from_seed(seed: [u8; 32], address: &str) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let key = signing.verifying_key().to_bytes();
        let payload = Identity::self_signed_payload(&key, address);
        let signature = signing.sign(&payload).to_bytes();
        let identity = Identity {
            key,
            signature,
            id: hex::encode(Sha256::digest(signature)),
            address: address.to_string(),
        };
        Private { signing, identity }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The private curve scalar used in DKG and DSS.
    pub fn scalar(&self) -> Scalar {
        crypto::derive_scalar(&self.signing.to_bytes())
    }

    /// The X25519 secret used for deal encryption.
    pub fn exchange_key(&self) -> [u8; 32] {
        crypto::derive_exchange_key(&self.signing.to_bytes())
    }

    /// Sign a message with the long-term EdDSA key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

#[derive(Serialize, Deserialize)]
struct PrivateFile {
    #[serde(with = "hex::serde")]
    seed: [u8; 32],
    address: String,
}

impl Serialize for Private {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        PrivateFile {
            seed: self.signing.to_bytes(),
            address: self.identity.address.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Private {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let file = PrivateFile::deserialize(deserializer)?;
        Ok(Private::from_seed(file.seed, &file.address))
    }
}

/// Position of an identity in an ordered participant list.
pub fn index_of(list: &[Identity], who: &Identity) -> Option<u32> {
    list.iter().position(|id| id == who).map(|i| i as u32)
}

/// True when no public key appears twice in the list.
pub fn distinct(list: &[Identity]) -> bool {
    list.iter()
        .enumerate()
        .all(|(i, id)| !list[..i].contains(id))
}

/// A participant's piece of a distributed secret: its index, its private
/// evaluation and the public polynomial of the group.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Share {
    pub index: u32,
    #[serde(with = "scalar_serde")]
    pub private: Scalar,
    #[zeroize(skip)]
    #[serde(with = "points_serde")]
    pub commits: Vec<EdwardsPoint>,
}

impl Share {
    /// The distributed public key.
    pub fn public(&self) -> &EdwardsPoint {
        &self.commits[0]
    }

    /// The public polynomial over the commitments.
    pub fn public_poly(&self) -> crypto::poly::PublicPolynomial {
        crypto::poly::PublicPolynomial::new(self.commits.clone())
    }
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("index", &self.index)
            .field("public", &hex::encode(self.commits[0].compress().as_bytes()))
            .finish_non_exhaustive()
    }
}

/// The persisted long-term share together with the key metadata it was
/// created under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedPrivate {
    pub key_id: String,
    pub full_name: String,
    pub email: String,
    pub extra: String,
    pub share: Share,
}

impl SharedPrivate {
    /// Key id of a distributed public key: its hex encoding.
    pub fn key_id_for(public: &EdwardsPoint) -> String {
        hex::encode(public.compress().as_bytes())
    }
}

mod scalar_serde {
    use curve25519_dalek::Scalar;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(scalar: &Scalar, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(scalar.as_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Scalar, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes: [u8; 32] = hex::decode(&raw)
            .map_err(serde::de::Error::custom)?
            .try_into()
            .map_err(|_| serde::de::Error::custom("scalar must be 32 bytes"))?;
        Option::from(Scalar::from_canonical_bytes(bytes))
            .ok_or_else(|| serde::de::Error::custom("non-canonical scalar"))
    }
}

mod points_serde {
    use curve25519_dalek::{edwards::CompressedEdwardsY, EdwardsPoint};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        points: &[EdwardsPoint],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(points.iter().map(|p| hex::encode(p.compress().as_bytes())))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<EdwardsPoint>, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|s| {
                let bytes: [u8; 32] = hex::decode(&s)
                    .map_err(serde::de::Error::custom)?
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("point must be 32 bytes"))?;
                CompressedEdwardsY(bytes)
                    .decompress()
                    .ok_or_else(|| serde::de::Error::custom("invalid point"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn identity_self_signature_verifies() {
        let private = Private::generate("127.0.0.1:7000", &mut OsRng);
        private.identity().verify_self().unwrap();

        let mut forged = private.identity().clone();
        forged.address = "127.0.0.1:7001".into();
        assert!(forged.verify_self().is_err());
    }

    #[test]
    fn scalar_matches_identity_point() {
        let private = Private::generate("", &mut OsRng);
        let point = EdwardsPoint::mul_base(&private.scalar());
        assert_eq!(point, private.identity().point().unwrap());
    }

    #[test]
    fn index_and_distinct() {
        let list: Vec<Identity> = (0..3)
            .map(|i| Private::generate(&format!("peer{i}"), &mut OsRng).identity().clone())
            .collect();
        assert!(distinct(&list));
        assert_eq!(index_of(&list, &list[2]), Some(2));

        let mut dup = list.clone();
        dup.push(list[0].clone());
        assert!(!distinct(&dup));
    }

    #[test]
    fn shared_private_json_roundtrip() {
        let poly = crypto::poly::SecretPolynomial::random(2, &mut OsRng);
        let share = Share {
            index: 1,
            private: poly.evaluate(1),
            commits: poly.commitment().into_points(),
        };
        let sp = SharedPrivate {
            key_id: SharedPrivate::key_id_for(share.public()),
            full_name: "Group Key".into(),
            email: "group@example.org".into(),
            extra: String::new(),
            share,
        };
        let json = serde_json::to_string(&sp).unwrap();
        let back: SharedPrivate = serde_json::from_str(&json).unwrap();
        assert_eq!(back.share.index, 1);
        assert_eq!(back.share.private, sp.share.private);
        assert_eq!(back.share.commits, sp.share.commits);
        assert_eq!(back.key_id, sp.key_id);
    }
}
