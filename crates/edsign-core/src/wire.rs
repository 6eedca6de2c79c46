//! Wire format: one tagged outer envelope for every protocol packet,
//! encoded deterministically with bincode. Every level of nesting carries
//! exactly one variant; anything else is rejected on decode.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keygen::DkgPacket;
use crate::sign::PartialSig;

/// Routing key of one sub-protocol run, chosen by the initiator.
pub type SessionId = [u8; 32];

/// Hex prefix of a session id for logging.
pub fn session_tag(session_id: &SessionId) -> String {
    hex::encode(&session_id[..4])
}

/// The outer envelope carried by every frame between peers.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct ProtocolPacket {
    pub new_key_pair: Option<NewKeyPair>,
    pub new_signature: Option<NewSignature>,
}

/// Packets of a long-term key pair creation.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct NewKeyPair {
    pub session_id: SessionId,
    pub proposal: Option<LongtermProposal>,
    pub longterm: Option<DkgPacket>,
    pub signing: Option<Signing>,
}

/// Metadata of the key pair to create, shown to the validator hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LongtermProposal {
    pub full_name: String,
    pub email: String,
    pub extra: String,
}

/// Packets of a distributed signature over one message.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct NewSignature {
    pub session_id: SessionId,
    pub info: Option<SignatureInfo>,
    pub signing: Option<Signing>,
}

/// What to sign, shown to the validator hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct SignatureInfo {
    pub key_id: String,
    pub kind: u32,
    pub message: Vec<u8>,
}

/// The signing sub-protocol: a DKG packet for the ephemeral nonce key, or
/// a partial signature.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct Signing {
    pub random: Option<DkgPacket>,
    pub signature: Option<PartialSig>,
}

impl ProtocolPacket {
    pub fn longterm_proposal(session_id: SessionId, proposal: LongtermProposal) -> Self {
        Self::keypair(NewKeyPair {
            session_id,
            proposal: Some(proposal),
            longterm: None,
            signing: None,
        })
    }

    pub fn longterm_dkg(session_id: SessionId, packet: DkgPacket) -> Self {
        Self::keypair(NewKeyPair {
            session_id,
            proposal: None,
            longterm: Some(packet),
            signing: None,
        })
    }

    pub fn signature_info(session_id: SessionId, info: SignatureInfo) -> Self {
        Self::signature(NewSignature { session_id, info: Some(info), signing: None })
    }

    pub fn signature_random(session_id: SessionId, packet: DkgPacket) -> Self {
        Self::signature(NewSignature {
            session_id,
            info: None,
            signing: Some(Signing { random: Some(packet), signature: None }),
        })
    }

    pub fn signature_partial(session_id: SessionId, partial: PartialSig) -> Self {
        Self::signature(NewSignature {
            session_id,
            info: None,
            signing: Some(Signing { random: None, signature: Some(partial) }),
        })
    }

    fn keypair(inner: NewKeyPair) -> Self {
        ProtocolPacket { new_key_pair: Some(inner), new_signature: None }
    }

    fn signature(inner: NewSignature) -> Self {
        ProtocolPacket { new_key_pair: None, new_signature: Some(inner) }
    }

    /// Enforce the exactly-one rule at every nesting level.
    pub fn validate(&self) -> Result<()> {
        match (&self.new_key_pair, &self.new_signature) {
            (Some(kp), None) => kp.validate(),
            (None, Some(sig)) => sig.validate(),
            _ => Err(malformed("envelope")),
        }
    }
}

impl NewKeyPair {
    fn validate(&self) -> Result<()> {
        match (&self.proposal, &self.longterm, &self.signing) {
            (Some(_), None, None) => Ok(()),
            (None, Some(dkg), None) => validate_dkg(dkg),
            (None, None, Some(signing)) => signing.validate(),
            _ => Err(malformed("new_key_pair")),
        }
    }
}

impl NewSignature {
    fn validate(&self) -> Result<()> {
        match (&self.info, &self.signing) {
            (Some(_), None) => Ok(()),
            (None, Some(signing)) => signing.validate(),
            _ => Err(malformed("new_signature")),
        }
    }
}

impl Signing {
    fn validate(&self) -> Result<()> {
        match (&self.random, &self.signature) {
            (Some(dkg), None) => validate_dkg(dkg),
            (None, Some(_)) => Ok(()),
            _ => Err(malformed("signing")),
        }
    }
}

fn validate_dkg(packet: &DkgPacket) -> Result<()> {
    if packet.is_well_formed() {
        Ok(())
    } else {
        Err(malformed("dkg packet"))
    }
}

fn malformed(level: &str) -> Error {
    Error::Protocol(format!("{level} must carry exactly one variant"))
}

/// Encode a packet for the wire.
pub fn encode_packet(packet: &ProtocolPacket) -> Result<Vec<u8>> {
    bincode::encode_to_vec(packet, bincode::config::standard())
        .map_err(|e| Error::Codec(e.to_string()))
}

/// Decode and validate an inbound packet.
pub fn decode_packet(bytes: &[u8]) -> Result<ProtocolPacket> {
    let (packet, used): (ProtocolPacket, usize) =
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| Error::Codec(e.to_string()))?;
    if used != bytes.len() {
        return Err(Error::Codec("trailing bytes after packet".into()));
    }
    packet.validate()?;
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::{Deal, Justification, Response};

    fn sample_deal() -> DkgPacket {
        DkgPacket::deal(Deal {
            dealer: 2,
            encrypted_share: vec![9u8; 48],
            commits: vec![[1u8; 32], [2u8; 32], [3u8; 32]],
        })
    }

    #[test]
    fn every_packet_shape_round_trips() {
        let session = [5u8; 32];
        let packets = vec![
            ProtocolPacket::longterm_proposal(
                session,
                LongtermProposal {
                    full_name: "Release Key".into(),
                    email: "release@example.org".into(),
                    extra: String::new(),
                },
            ),
            ProtocolPacket::longterm_dkg(session, sample_deal()),
            ProtocolPacket::longterm_dkg(
                session,
                DkgPacket::response(Response {
                    dealer: 1,
                    verifier: 0,
                    approved: false,
                    signature: [4u8; 64],
                }),
            ),
            ProtocolPacket::longterm_dkg(
                session,
                DkgPacket::justification(Justification {
                    dealer: 1,
                    verifier: 0,
                    share: [6u8; 32],
                    commits: vec![[7u8; 32]],
                    signature: [8u8; 64],
                }),
            ),
            ProtocolPacket::signature_info(
                session,
                SignatureInfo { key_id: "abcd".into(), kind: 0, message: b"hello".to_vec() },
            ),
            ProtocolPacket::signature_random(session, sample_deal()),
            ProtocolPacket::signature_partial(
                session,
                PartialSig { index: 3, value: [1u8; 32], signature: [2u8; 64] },
            ),
        ];
        for packet in packets {
            let bytes = encode_packet(&packet).unwrap();
            assert_eq!(decode_packet(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn empty_and_doubled_envelopes_are_rejected() {
        let empty = ProtocolPacket { new_key_pair: None, new_signature: None };
        assert!(decode_packet(&encode_packet(&empty).unwrap()).is_err());

        let mut doubled = ProtocolPacket::longterm_dkg([0u8; 32], sample_deal());
        doubled.new_signature = Some(NewSignature {
            session_id: [0u8; 32],
            info: None,
            signing: Some(Signing { random: Some(sample_deal()), signature: None }),
        });
        assert!(decode_packet(&encode_packet(&doubled).unwrap()).is_err());
    }

    #[test]
    fn doubled_inner_variants_are_rejected() {
        let mut packet = ProtocolPacket::longterm_dkg([0u8; 32], sample_deal());
        packet.new_key_pair.as_mut().unwrap().proposal = Some(LongtermProposal::default());
        assert!(decode_packet(&encode_packet(&packet).unwrap()).is_err());

        let mut signing = ProtocolPacket::signature_random([0u8; 32], sample_deal());
        signing
            .new_signature
            .as_mut()
            .unwrap()
            .signing
            .as_mut()
            .unwrap()
            .signature = Some(PartialSig { index: 0, value: [0u8; 32], signature: [0u8; 64] });
        assert!(decode_packet(&encode_packet(&signing).unwrap()).is_err());
    }

    #[test]
    fn truncated_and_padded_buffers_are_rejected() {
        let bytes = encode_packet(&ProtocolPacket::signature_random([1u8; 32], sample_deal()))
            .unwrap();
        assert!(decode_packet(&bytes[..bytes.len() - 1]).is_err());

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(decode_packet(&padded).is_err());
    }
}
