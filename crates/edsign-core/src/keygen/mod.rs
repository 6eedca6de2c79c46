//! Distributed key generation: Pedersen DKG packets and engine.

mod handler;

pub use handler::{DkgConfig, DkgHandler, DkgNetwork, ErrorSink, ShareSink};

/// A message of one DKG protocol run. Exactly one field is set.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct DkgPacket {
    pub deal: Option<Deal>,
    pub response: Option<Response>,
    pub justification: Option<Justification>,
}

impl DkgPacket {
    pub fn deal(deal: Deal) -> Self {
        DkgPacket { deal: Some(deal), response: None, justification: None }
    }

    pub fn response(response: Response) -> Self {
        DkgPacket { deal: None, response: Some(response), justification: None }
    }

    pub fn justification(justification: Justification) -> Self {
        DkgPacket { deal: None, response: None, justification: Some(justification) }
    }

    /// True when exactly one variant is set.
    pub fn is_well_formed(&self) -> bool {
        [
            self.deal.is_some(),
            self.response.is_some(),
            self.justification.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
            == 1
    }
}

/// A dealer's message to one verifier: the encrypted share evaluation plus
/// the public polynomial commitments.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct Deal {
    pub dealer: u32,
    pub encrypted_share: Vec<u8>,
    pub commits: Vec<[u8; 32]>,
}

/// A verifier's broadcast verdict on one dealer's deal.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct Response {
    pub dealer: u32,
    pub verifier: u32,
    pub approved: bool,
    pub signature: [u8; 64],
}

/// A dealer's reply to a complaint: the plaintext share and the
/// commitments it must verify against.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct Justification {
    pub dealer: u32,
    pub verifier: u32,
    pub share: [u8; 32],
    pub commits: Vec<[u8; 32]>,
    pub signature: [u8; 64],
}

pub(crate) fn response_transcript(
    session_id: &[u8; 32],
    dealer: u32,
    verifier: u32,
    approved: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + 32 + 9);
    out.extend_from_slice(b"edsign-verdict");
    out.extend_from_slice(session_id);
    out.extend_from_slice(&dealer.to_be_bytes());
    out.extend_from_slice(&verifier.to_be_bytes());
    out.push(approved as u8);
    out
}

pub(crate) fn justification_transcript(
    session_id: &[u8; 32],
    dealer: u32,
    verifier: u32,
    share: &[u8; 32],
    commits: &[[u8; 32]],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + 32 + 8 + 32 + commits.len() * 32);
    out.extend_from_slice(b"edsign-justification");
    out.extend_from_slice(session_id);
    out.extend_from_slice(&dealer.to_be_bytes());
    out.extend_from_slice(&verifier.to_be_bytes());
    out.extend_from_slice(share);
    for c in commits {
        out.extend_from_slice(c);
    }
    out
}
