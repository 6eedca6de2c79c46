//! Distributed Schnorr signing: partial signatures and their aggregation.

mod handler;

pub use handler::{DssConfig, DssHandler, SignNetwork, SignatureSink};

/// One peer's contribution to a distributed signature, authenticated with
/// the peer's long-term EdDSA key.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct PartialSig {
    pub index: u32,
    pub value: [u8; 32],
    pub signature: [u8; 64],
}

pub(crate) fn partial_transcript(
    session_id: &[u8; 32],
    nonce_point: &[u8; 32],
    public: &[u8; 32],
    index: u32,
    value: &[u8; 32],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + 32 + 64 + 4 + 32);
    out.extend_from_slice(b"edsign-partial");
    out.extend_from_slice(session_id);
    out.extend_from_slice(nonce_point);
    out.extend_from_slice(public);
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(value);
    out
}
