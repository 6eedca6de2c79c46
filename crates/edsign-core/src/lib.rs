//! # edsign-core
//!
//! Distributed Schnorr signing over Ed25519. A fixed group of peers
//! generates one long-term distributed key pair with a Pedersen DKG, then
//! issues signatures collaboratively: each signature runs a fresh
//! ephemeral DKG for the nonce and aggregates `t` partial signatures by
//! Lagrange interpolation. The private key never exists in one place.
//!
//! ## Layout
//!
//! - [`crypto`]: Ed25519 group arithmetic, Schnorr verification, threshold
//!   polynomials and deal encryption
//! - [`key`]: local key pairs, self-signed identities, distributed shares
//! - [`keygen`]: the Pedersen DKG engine
//! - [`sign`]: the partial-signature engine
//! - [`session`]: the orchestrator tying engines to sessions and peers
//! - [`net`]: gateway contract, framing, in-memory and TCP transports
//! - [`store`]: persistence and validation contracts
//! - [`wire`]: the deterministic packet envelope
//!
//! ## Example
//!
//! ```rust,ignore
//! let (node, mut events) = Node::new(config, gateway, store, validator).await?;
//! node.start_new_longterm(proposal).await?;
//! // ... Event::LongtermReady arrives on every peer ...
//! let (_, signature) = node.new_signature(info).await?;
//! let signature = signature.await?;
//! ```

pub mod crypto;
pub mod error;
pub mod key;
pub mod keygen;
pub mod net;
pub mod session;
pub mod sign;
pub mod store;
pub mod wire;

pub use error::{Error, Result};
pub use key::{Identity, Private, Share, SharedPrivate};
pub use session::{Event, Node, NodeConfig};
pub use wire::{LongtermProposal, SessionId, SignatureInfo};
