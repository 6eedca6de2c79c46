//! The distributed Schnorr signature engine.
//!
//! Combines a long-term share with a freshly generated ephemeral share
//! (the nonce) into a Schnorr signature over one message. Mutex policy is
//! the same as the DKG engine: mutate under the lock, send after release.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use curve25519_dalek::{EdwardsPoint, Scalar};
use tracing::{debug, info};

use crate::crypto::{self, poly};
use crate::error::{Error, Result};
use crate::key::{self, Identity, Private, Share};
use crate::wire::SessionId;

use super::{partial_transcript, PartialSig};

/// Outbound side of the engine, implemented by the session layer.
#[async_trait]
pub trait SignNetwork: Send + Sync {
    async fn send(&self, to: &Identity, partial: PartialSig) -> Result<()>;
}

/// Called exactly once with the final signature `R ‖ s`.
pub type SignatureSink = Box<dyn FnOnce(Vec<u8>) + Send>;

/// Sink for terminal engine failures.
pub type ErrorSink = Box<dyn Fn(Error) + Send + Sync>;

/// Parameters of one signing run. `longterm` and `random` must come from
/// DKG runs over the same list and threshold.
pub struct DssConfig {
    pub private: Arc<Private>,
    pub list: Vec<Identity>,
    pub threshold: usize,
    pub longterm: Share,
    pub random: Share,
    pub message: Vec<u8>,
}

struct SignState {
    partials: BTreeMap<u32, Scalar>,
    /// Peers we have heard from, valid partial or not.
    heard: BTreeSet<u32>,
    sent: bool,
    done: bool,
}

/// Stateful handler collecting partial signatures until `t` of them
/// aggregate into a verifiable signature.
pub struct DssHandler<N> {
    conf: DssConfig,
    index: u32,
    session_id: SessionId,
    net: N,
    /// `R`, the ephemeral public key the signature commits to.
    nonce_point: EdwardsPoint,
    /// `Y`, the long-term distributed public key.
    public: EdwardsPoint,
    challenge: Scalar,
    longterm_poly: poly::PublicPolynomial,
    random_poly: poly::PublicPolynomial,
    state: Mutex<SignState>,
    on_signature: Mutex<Option<SignatureSink>>,
    on_error: ErrorSink,
}

impl<N: SignNetwork> DssHandler<N> {
    pub fn new(
        conf: DssConfig,
        session_id: SessionId,
        net: N,
        on_signature: SignatureSink,
        on_error: ErrorSink,
    ) -> Result<Self> {
        let n = conf.list.len();
        if conf.threshold < 1 || conf.threshold > n {
            return Err(Error::Config(format!(
                "threshold {} out of range for {} participants",
                conf.threshold, n
            )));
        }
        if !key::distinct(&conf.list) {
            return Err(Error::Config("duplicate identity in participant list".into()));
        }
        let index = key::index_of(&conf.list, conf.private.identity())
            .ok_or_else(|| Error::Config("own identity not in participant list".into()))?;
        if conf.longterm.index != index || conf.random.index != index {
            return Err(Error::Config("share index does not match list position".into()));
        }
        if conf.longterm.commits.len() != conf.threshold
            || conf.random.commits.len() != conf.threshold
        {
            return Err(Error::Config("share commitments do not match the threshold".into()));
        }

        let nonce_point = *conf.random.public();
        let public = *conf.longterm.public();
        let challenge = crypto::challenge(&nonce_point, &public, &conf.message);

        // our own partial: ps = r + c·x
        let own = conf.random.private + challenge * conf.longterm.private;

        let mut partials = BTreeMap::new();
        partials.insert(index, own);
        let mut heard = BTreeSet::new();
        heard.insert(index);

        Ok(DssHandler {
            longterm_poly: conf.longterm.public_poly(),
            random_poly: conf.random.public_poly(),
            conf,
            index,
            session_id,
            net,
            nonce_point,
            public,
            challenge,
            state: Mutex::new(SignState { partials, heard, sent: false, done: false }),
            on_signature: Mutex::new(Some(on_signature)),
            on_error,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Broadcast our partial signature. Idempotent; also triggered by the
    /// first inbound partial, so only one peer has to start.
    pub async fn start(&self) {
        let (outbound, emission) = {
            let mut st = self.state.lock().unwrap();
            if st.sent || st.done {
                return;
            }
            st.sent = true;
            (self.broadcast_partial(&st), self.check_done(&mut st))
        };
        self.dispatch(outbound).await;
        self.settle(emission);
    }

    /// Feed one inbound partial signature into the engine.
    pub async fn process(&self, from: &Identity, partial: PartialSig) {
        let Some(from_index) = key::index_of(&self.conf.list, from) else {
            debug!(peer = from.short_id(), "partial from peer outside the group");
            return;
        };
        if partial.index != from_index {
            debug!(claimed = partial.index, from_index, "partial index does not match sender");
            return;
        }
        let transcript = partial_transcript(
            &self.session_id,
            self.nonce_point.compress().as_bytes(),
            self.public.compress().as_bytes(),
            partial.index,
            &partial.value,
        );
        if from.verify(&transcript, &partial.signature).is_err() {
            debug!(index = partial.index, "partial signature not authenticated, discarded");
            return;
        }

        let (outbound, emission) = {
            let mut st = self.state.lock().unwrap();
            if st.done {
                return;
            }
            st.heard.insert(partial.index);
            if st.partials.contains_key(&partial.index) {
                debug!(index = partial.index, "duplicate partial dropped");
                return;
            }
            match self.validate_partial(&partial) {
                Ok(value) => {
                    st.partials.insert(partial.index, value);
                    debug!(index = partial.index, count = st.partials.len(), "partial accepted");
                }
                Err(e) => {
                    debug!(index = partial.index, error = %e, "invalid partial discarded");
                }
            }
            let mut outbound = Vec::new();
            if !st.sent {
                st.sent = true;
                outbound = self.broadcast_partial(&st);
                debug!("sent own partial on first inbound partial");
            }
            (outbound, self.check_done(&mut st))
        };
        self.dispatch(outbound).await;
        self.settle(emission);
    }

    /// `ps_i · G == R_i + c · Y_i` against the public polynomial
    /// evaluations of peer `i`.
    fn validate_partial(&self, partial: &PartialSig) -> Result<Scalar> {
        let value = crypto::decode_scalar(&partial.value)?;
        let expected =
            self.random_poly.evaluate(partial.index) + self.longterm_poly.evaluate(partial.index) * self.challenge;
        if EdwardsPoint::mul_base(&value) == expected {
            Ok(value)
        } else {
            Err(Error::Protocol("partial does not match public evaluations".into()))
        }
    }

    fn check_done(&self, st: &mut SignState) -> Option<std::result::Result<Vec<u8>, Error>> {
        if st.done {
            return None;
        }
        let t = self.conf.threshold;
        if st.partials.len() >= t {
            st.done = true;
            // aggregate over the t lowest indices; any t-subset interpolates
            // to the same value
            let subset: Vec<(u32, Scalar)> =
                st.partials.iter().take(t).map(|(i, v)| (*i, *v)).collect();
            let indices: Vec<u32> = subset.iter().map(|(i, _)| *i).collect();
            let s: Scalar = subset
                .iter()
                .map(|(i, v)| poly::lagrange_basis(&indices, *i) * v)
                .sum();
            let mut signature = Vec::with_capacity(crypto::SIGNATURE_LENGTH);
            signature.extend_from_slice(self.nonce_point.compress().as_bytes());
            signature.extend_from_slice(s.as_bytes());
            return Some(Ok(signature));
        }
        if st.heard.len() == self.conf.list.len() {
            // every peer answered and the valid partials still fall short
            st.done = true;
            return Some(Err(Error::NotEnoughPartials {
                required: t,
                actual: st.partials.len(),
            }));
        }
        None
    }

    fn settle(&self, emission: Option<std::result::Result<Vec<u8>, Error>>) {
        match emission {
            Some(Ok(signature)) => {
                info!(index = self.index, "signature aggregated");
                if let Some(sink) = self.on_signature.lock().unwrap().take() {
                    sink(signature);
                }
            }
            Some(Err(e)) => (self.on_error)(e),
            None => {}
        }
    }

    fn broadcast_partial(&self, st: &SignState) -> Vec<(Identity, PartialSig)> {
        let value = st.partials[&self.index].to_bytes();
        let transcript = partial_transcript(
            &self.session_id,
            self.nonce_point.compress().as_bytes(),
            self.public.compress().as_bytes(),
            self.index,
            &value,
        );
        let partial = PartialSig {
            index: self.index,
            value,
            signature: self.conf.private.sign(&transcript),
        };
        self.conf
            .list
            .iter()
            .enumerate()
            .filter(|(j, _)| *j as u32 != self.index)
            .map(|(_, id)| (id.clone(), partial.clone()))
            .collect()
    }

    async fn dispatch(&self, outbound: Vec<(Identity, PartialSig)>) {
        for (to, partial) in outbound {
            if let Err(e) = self.net.send(&to, partial).await {
                debug!(peer = to.short_id(), error = %e, "failed to send partial");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::poly::SecretPolynomial;
    use rand::rngs::OsRng;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    type Queue = Arc<StdMutex<VecDeque<(usize, usize, PartialSig)>>>;

    struct TestNet {
        from: usize,
        list: Vec<Identity>,
        queue: Queue,
    }

    #[async_trait]
    impl SignNetwork for TestNet {
        async fn send(&self, to: &Identity, partial: PartialSig) -> Result<()> {
            let to = key::index_of(&self.list, to).unwrap() as usize;
            self.queue.lock().unwrap().push_back((self.from, to, partial));
            Ok(())
        }
    }

    const SESSION: SessionId = [9u8; 32];

    /// A valid t-of-n sharing from a single random polynomial; equivalent
    /// to a completed DKG for test purposes.
    fn gen_shares(n: usize, t: usize) -> Vec<Share> {
        let poly = SecretPolynomial::random(t, &mut OsRng);
        let commits = poly.commitment().into_points();
        (0..n as u32)
            .map(|i| Share { index: i, private: poly.evaluate(i), commits: commits.clone() })
            .collect()
    }

    struct Fixture {
        list: Vec<Identity>,
        handlers: Vec<Arc<DssHandler<TestNet>>>,
        queue: Queue,
        signatures: Arc<StdMutex<Vec<Vec<u8>>>>,
        errors: Arc<StdMutex<Vec<Error>>>,
        public: EdwardsPoint,
    }

    fn fixture(n: usize, t: usize, message: &[u8]) -> Fixture {
        let privates: Vec<Arc<Private>> = (0..n)
            .map(|i| Arc::new(Private::generate(&format!("peer{i}"), &mut OsRng)))
            .collect();
        let list: Vec<Identity> = privates.iter().map(|p| p.identity().clone()).collect();
        let longterms = gen_shares(n, t);
        let randoms = gen_shares(n, t);
        let public = *longterms[0].public();
        let queue: Queue = Arc::new(StdMutex::new(VecDeque::new()));
        let signatures = Arc::new(StdMutex::new(Vec::new()));
        let errors = Arc::new(StdMutex::new(Vec::new()));

        let handlers = (0..n)
            .map(|i| {
                let signatures = signatures.clone();
                let errors = errors.clone();
                Arc::new(
                    DssHandler::new(
                        DssConfig {
                            private: privates[i].clone(),
                            list: list.clone(),
                            threshold: t,
                            longterm: longterms[i].clone(),
                            random: randoms[i].clone(),
                            message: message.to_vec(),
                        },
                        SESSION,
                        TestNet { from: i, list: list.clone(), queue: queue.clone() },
                        Box::new(move |sig| signatures.lock().unwrap().push(sig)),
                        Box::new(move |err| errors.lock().unwrap().push(err)),
                    )
                    .unwrap(),
                )
            })
            .collect();

        Fixture { list, handlers, queue, signatures, errors, public }
    }

    impl Fixture {
        async fn drain(&self, dead: &[usize]) {
            loop {
                let next = self.queue.lock().unwrap().pop_front();
                let Some((from, to, partial)) = next else { break };
                if dead.contains(&to) || dead.contains(&from) {
                    continue;
                }
                self.handlers[to].process(&self.list[from], partial).await;
            }
        }
    }

    #[tokio::test]
    async fn single_initiator_produces_verifiable_signature() {
        let message = b"Hello World";
        let fx = fixture(5, 3, message);
        fx.handlers[0].start().await;
        fx.drain(&[]).await;

        let signatures = fx.signatures.lock().unwrap();
        assert_eq!(signatures.len(), 5);
        for sig in signatures.iter() {
            assert_eq!(sig, &signatures[0]);
            crypto::schnorr_verify(&fx.public, message, sig).unwrap();
        }
    }

    #[tokio::test]
    async fn degenerate_single_party_is_plain_eddsa() {
        let message = b"solo";
        let fx = fixture(1, 1, message);
        fx.handlers[0].start().await;

        let signatures = fx.signatures.lock().unwrap();
        assert_eq!(signatures.len(), 1);
        crypto::schnorr_verify(&fx.public, message, &signatures[0]).unwrap();

        use ed25519_dalek::Verifier;
        let vk =
            ed25519_dalek::VerifyingKey::from_bytes(fx.public.compress().as_bytes()).unwrap();
        let sig_bytes: [u8; 64] = signatures[0].clone().try_into().unwrap();
        vk.verify(message, &ed25519_dalek::Signature::from_bytes(&sig_bytes))
            .unwrap();
    }

    #[tokio::test]
    async fn tampered_partial_is_discarded_and_rest_still_sign() {
        let message = b"tamper";
        let fx = fixture(3, 2, message);
        fx.handlers[0].start().await;

        // corrupt the first partial 0 → 1; the outer signature no longer
        // matches the value, so the partial is discarded on arrival
        let mut first = true;
        loop {
            let next = fx.queue.lock().unwrap().pop_front();
            let Some((from, to, mut partial)) = next else { break };
            if first && from == 0 && to == 1 {
                first = false;
                partial.value[0] ^= 1;
            }
            fx.handlers[to].process(&fx.list[from], partial).await;
        }

        let signatures = fx.signatures.lock().unwrap();
        assert_eq!(signatures.len(), 3);
        for sig in signatures.iter() {
            crypto::schnorr_verify(&fx.public, message, sig).unwrap();
        }
    }

    #[tokio::test]
    async fn not_enough_partials_surfaces_after_everyone_answered() {
        let message = b"short";
        let fx = fixture(3, 3, message);
        fx.handlers[0].start().await;

        // peer 2 sends garbage partials instead of valid ones
        loop {
            let next = fx.queue.lock().unwrap().pop_front();
            let Some((from, to, mut partial)) = next else { break };
            if from == 2 {
                partial.value[0] ^= 0xff;
                // re-authenticate so only the algebraic check fails
                let transcript = partial_transcript(
                    &SESSION,
                    fx.handlers[from].nonce_point.compress().as_bytes(),
                    fx.handlers[from].public.compress().as_bytes(),
                    partial.index,
                    &partial.value,
                );
                partial.signature = fx.handlers[from].conf.private.sign(&transcript);
            }
            fx.handlers[to].process(&fx.list[from], partial).await;
        }

        // peers 0 and 1 saw only two valid partials each; peer 2 holds its
        // own uncorrupted partial and still completes
        assert_eq!(fx.signatures.lock().unwrap().len(), 1);
        let errors = fx.errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(matches!(
            errors[0],
            Error::NotEnoughPartials { required: 3, actual: 2 }
        ));
    }

    #[tokio::test]
    async fn same_longterm_key_fresh_nonce_per_message() {
        let (n, t) = (3, 2);
        let privates: Vec<Arc<Private>> = (0..n)
            .map(|i| Arc::new(Private::generate(&format!("peer{i}"), &mut OsRng)))
            .collect();
        let list: Vec<Identity> = privates.iter().map(|p| p.identity().clone()).collect();
        let longterms = gen_shares(n, t);
        let public = *longterms[0].public();

        let run = |message: &'static [u8]| {
            let privates = privates.clone();
            let list = list.clone();
            let longterms = longterms.clone();
            async move {
                let randoms = gen_shares(n, t);
                let queue: Queue = Arc::new(StdMutex::new(VecDeque::new()));
                let signatures = Arc::new(StdMutex::new(Vec::new()));
                let handlers: Vec<Arc<DssHandler<TestNet>>> = (0..n)
                    .map(|i| {
                        let signatures = signatures.clone();
                        Arc::new(
                            DssHandler::new(
                                DssConfig {
                                    private: privates[i].clone(),
                                    list: list.clone(),
                                    threshold: t,
                                    longterm: longterms[i].clone(),
                                    random: randoms[i].clone(),
                                    message: message.to_vec(),
                                },
                                SESSION,
                                TestNet { from: i, list: list.clone(), queue: queue.clone() },
                                Box::new(move |sig| signatures.lock().unwrap().push(sig)),
                                Box::new(|_| {}),
                            )
                            .unwrap(),
                        )
                    })
                    .collect();
                handlers[0].start().await;
                loop {
                    let next = queue.lock().unwrap().pop_front();
                    let Some((from, to, partial)) = next else { break };
                    handlers[to].process(&list[from], partial).await;
                }
                let sig = signatures.lock().unwrap()[0].clone();
                sig
            }
        };

        let sig1 = run(b"first").await;
        let sig2 = run(b"second").await;

        crypto::schnorr_verify(&public, b"first", &sig1).unwrap();
        crypto::schnorr_verify(&public, b"second", &sig2).unwrap();
        // an independent ephemeral key per run changes both halves
        assert_ne!(sig1[..32], sig2[..32]);
        assert_ne!(sig1[32..], sig2[32..]);
    }
}
