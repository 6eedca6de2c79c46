//! The Pedersen DKG engine.
//!
//! One handler runs one generation for one participant. All state lives
//! behind a single mutex; network sends always happen after the lock is
//! released, so a slow peer cannot stall state transitions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use curve25519_dalek::{EdwardsPoint, Scalar};
use rand::rngs::OsRng;
use tracing::{debug, info, warn};

use crate::crypto::{
    self,
    poly::{PublicPolynomial, SecretPolynomial},
};
use crate::error::{Error, Result};
use crate::key::{self, Identity, Private, Share};
use crate::wire::SessionId;

use super::{
    justification_transcript, response_transcript, Deal, DkgPacket, Justification, Response,
};

/// Outbound side of the engine: one send primitive, implemented by the
/// session layer over the gateway.
#[async_trait]
pub trait DkgNetwork: Send + Sync {
    async fn send(&self, to: &Identity, packet: DkgPacket) -> Result<()>;
}

/// Called exactly once with the distributed share on success.
pub type ShareSink = Box<dyn FnOnce(Share) + Send>;

/// Called on unrecoverable failure; the engine never emits a share after.
pub type ErrorSink = Box<dyn Fn(Error) + Send + Sync>;

/// Parameters of one DKG run.
pub struct DkgConfig {
    pub private: Arc<Private>,
    pub list: Vec<Identity>,
    pub threshold: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Approved,
    Complained,
}

/// Everything this node knows about one dealer's deal.
struct DealerState {
    commits: PublicPolynomial,
    /// Our decrypted share of this dealer's polynomial; `None` while our
    /// complaint stands.
    share: Option<Scalar>,
    /// Settled verdicts by verifier index. A complaint flips to approval
    /// when a valid justification lands.
    verdicts: BTreeMap<u32, Verdict>,
    /// Set when a justification failed verification; final for this run.
    excluded: bool,
}

struct EngineState {
    secret: SecretPolynomial,
    dealers: HashMap<u32, DealerState>,
    /// Responses that arrived before their dealer's deal, keyed by dealer.
    early: HashMap<u32, Vec<Response>>,
    deals_sent: bool,
    timed_out: bool,
    done: bool,
}

/// Stateful handler running one Pedersen DKG with the group.
pub struct DkgHandler<N> {
    conf: DkgConfig,
    index: u32,
    session_id: SessionId,
    net: N,
    state: Mutex<EngineState>,
    on_share: Mutex<Option<ShareSink>>,
    on_error: ErrorSink,
}

impl<N: DkgNetwork> DkgHandler<N> {
    /// Build a handler. Fails when this node is not in the list, the
    /// threshold is out of range or the list holds duplicate identities.
    pub fn new(
        conf: DkgConfig,
        session_id: SessionId,
        net: N,
        on_share: ShareSink,
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

        let secret = SecretPolynomial::random(conf.threshold, &mut OsRng);
        let commits = secret.commitment();
        let own_share = secret.evaluate(index);

        let mut verdicts = BTreeMap::new();
        verdicts.insert(index, Verdict::Approved);
        let mut dealers = HashMap::new();
        dealers.insert(
            index,
            DealerState { commits, share: Some(own_share), verdicts, excluded: false },
        );

        Ok(DkgHandler {
            conf,
            index,
            session_id,
            net,
            state: Mutex::new(EngineState {
                secret,
                dealers,
                early: HashMap::new(),
                deals_sent: false,
                timed_out: false,
                done: false,
            }),
            on_share: Mutex::new(Some(on_share)),
            on_error,
        })
    }

    /// Index of this node in the participant list.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Broadcast our deals. Idempotent; a node that never calls this still
    /// sends its deals once a first inbound deal arrives.
    pub async fn start(&self) {
        let (outbound, emission) = {
            let mut st = self.state.lock().unwrap();
            if st.deals_sent || st.done {
                return;
            }
            st.deals_sent = true;
            // check_certified covers the single-participant group, which is
            // certified the moment it starts
            (self.make_deals(&st), self.check_certified(&mut st))
        };
        self.send_deals(outbound).await;
        if let Some(share) = emission {
            self.emit_share(share);
        }
    }

    /// Feed one inbound packet from peer `from` into the engine.
    pub async fn process(&self, from: &Identity, packet: DkgPacket) {
        let Some(from_index) = key::index_of(&self.conf.list, from) else {
            debug!(peer = from.short_id(), "dkg packet from peer outside the group");
            return;
        };
        if !packet.is_well_formed() {
            debug!(peer = from.short_id(), "malformed dkg packet");
            return;
        }
        if let Some(deal) = packet.deal {
            self.process_deal(from_index, deal).await;
        } else if let Some(response) = packet.response {
            self.process_response(from_index, response).await;
        } else if let Some(justification) = packet.justification {
            self.process_justification(from_index, justification).await;
        }
    }

    /// Force termination with the currently qualified dealers. One-shot;
    /// fewer than `t` qualified dealers aborts with `ThresholdNotMet`.
    pub fn set_timeout(&self) {
        let outcome = {
            let mut st = self.state.lock().unwrap();
            if st.done || st.timed_out {
                return;
            }
            st.timed_out = true;
            match self.finalize(&mut st) {
                Ok(share) => Ok(share),
                Err(actual) => {
                    st.done = true;
                    Err(actual)
                }
            }
        };
        match outcome {
            Ok(share) => self.emit_share(share),
            Err(actual) => {
                warn!(
                    required = self.conf.threshold,
                    actual, "dkg timed out below threshold"
                );
                (self.on_error)(Error::ThresholdNotMet {
                    required: self.conf.threshold,
                    actual,
                });
            }
        }
    }

    async fn process_deal(&self, from: u32, deal: Deal) {
        let mut outbound: Vec<(Identity, DkgPacket)> = Vec::new();
        let emission = {
            let mut st = self.state.lock().unwrap();
            if st.done {
                return;
            }
            if deal.dealer != from {
                debug!(claimed = deal.dealer, from, "deal dealer index does not match sender");
                return;
            }
            if st.dealers.contains_key(&deal.dealer) {
                debug!(dealer = deal.dealer, "duplicate deal dropped");
                return;
            }

            let t = self.conf.threshold;
            let dealer_id = &self.conf.list[deal.dealer as usize];
            let (commits, mut approved) = match decode_commits(&deal.commits, t) {
                Ok(commits) => (commits, true),
                Err(e) => {
                    debug!(dealer = deal.dealer, error = %e, "undecodable deal commitments");
                    (PublicPolynomial::placeholder(t), false)
                }
            };
            let mut share = None;
            if approved {
                match self.open_deal(dealer_id, &deal) {
                    Ok(s) if commits.evaluate(self.index) == EdwardsPoint::mul_base(&s) => {
                        share = Some(s)
                    }
                    Ok(_) => {
                        debug!(dealer = deal.dealer, "deal share does not match commitments");
                        approved = false;
                    }
                    Err(e) => {
                        debug!(dealer = deal.dealer, error = %e, "deal share could not be opened");
                        approved = false;
                    }
                }
            }

            let mut verdicts = BTreeMap::new();
            verdicts.insert(deal.dealer, Verdict::Approved);
            verdicts.insert(
                self.index,
                if approved { Verdict::Approved } else { Verdict::Complained },
            );
            st.dealers.insert(
                deal.dealer,
                DealerState { commits, share, verdicts, excluded: false },
            );
            debug!(
                dealer = deal.dealer,
                approved,
                processed = st.dealers.len(),
                "processed deal"
            );

            // lazy broadcast: a non-initiator deals once, on the first
            // inbound deal
            if !st.deals_sent {
                st.deals_sent = true;
                outbound.extend(self.make_deals(&st));
                debug!("sent own deals on first inbound deal");
            }

            let transcript =
                response_transcript(&self.session_id, deal.dealer, self.index, approved);
            let response = Response {
                dealer: deal.dealer,
                verifier: self.index,
                approved,
                signature: self.conf.private.sign(&transcript),
            };
            outbound.extend(self.broadcast(DkgPacket::response(response)));

            if let Some(early) = st.early.remove(&deal.dealer) {
                debug!(
                    dealer = deal.dealer,
                    count = early.len(),
                    "draining buffered responses"
                );
                for response in early {
                    if let Some(justification) = self.apply_response(&mut st, &response) {
                        outbound.extend(self.broadcast(DkgPacket::justification(justification)));
                    }
                }
            }

            self.check_certified(&mut st)
        };
        self.dispatch(outbound).await;
        if let Some(share) = emission {
            self.emit_share(share);
        }
    }

    async fn process_response(&self, from: u32, response: Response) {
        let n = self.conf.list.len() as u32;
        if response.verifier != from {
            debug!(claimed = response.verifier, from, "response verifier does not match sender");
            return;
        }
        if response.dealer >= n {
            debug!(dealer = response.dealer, "response about out-of-range dealer");
            return;
        }
        let transcript = response_transcript(
            &self.session_id,
            response.dealer,
            response.verifier,
            response.approved,
        );
        let verifier_id = &self.conf.list[response.verifier as usize];
        if verifier_id.verify(&transcript, &response.signature).is_err() {
            debug!(verifier = response.verifier, "response signature invalid");
            return;
        }

        let (outbound, emission) = {
            let mut st = self.state.lock().unwrap();
            if st.done {
                return;
            }
            if !st.dealers.contains_key(&response.dealer) {
                // never drop an early response; park it until the deal lands
                let early = st.early.entry(response.dealer).or_default();
                if early.len() < self.conf.list.len() {
                    debug!(dealer = response.dealer, "storing early response for unknown deal");
                    early.push(response);
                }
                return;
            }
            let mut outbound = Vec::new();
            if let Some(justification) = self.apply_response(&mut st, &response) {
                outbound = self.broadcast(DkgPacket::justification(justification));
            }
            (outbound, self.check_certified(&mut st))
        };
        self.dispatch(outbound).await;
        if let Some(share) = emission {
            self.emit_share(share);
        }
    }

    async fn process_justification(&self, from: u32, justification: Justification) {
        let n = self.conf.list.len() as u32;
        if justification.dealer != from {
            debug!(from, "justification not sent by its dealer");
            return;
        }
        if justification.verifier >= n {
            debug!("justification about out-of-range verifier");
            return;
        }
        let transcript = justification_transcript(
            &self.session_id,
            justification.dealer,
            justification.verifier,
            &justification.share,
            &justification.commits,
        );
        let dealer_id = &self.conf.list[justification.dealer as usize];
        if dealer_id.verify(&transcript, &justification.signature).is_err() {
            debug!(dealer = justification.dealer, "justification signature invalid");
            return;
        }

        let emission = {
            let mut st = self.state.lock().unwrap();
            if st.done {
                return;
            }
            let Some(ds) = st.dealers.get_mut(&justification.dealer) else {
                debug!(dealer = justification.dealer, "justification for unprocessed deal");
                return;
            };
            if ds.excluded {
                return;
            }

            let verified = decode_commits(&justification.commits, self.conf.threshold)
                .and_then(|commits| {
                    let share = crypto::decode_scalar(&justification.share)?;
                    if commits.evaluate(justification.verifier) == EdwardsPoint::mul_base(&share) {
                        Ok((commits, share))
                    } else {
                        Err(Error::Protocol("revealed share does not match commitments".into()))
                    }
                });

            match verified {
                Err(e) => {
                    info!(dealer = justification.dealer, error = %e, "dealer excluded after invalid justification");
                    ds.excluded = true;
                }
                Ok((commits, share)) if justification.verifier == self.index => {
                    // our complaint was wrong or our deal copy was corrupted
                    // in flight; adopt the dealer's published record
                    ds.commits = commits;
                    ds.share = Some(share);
                    ds.verdicts.insert(self.index, Verdict::Approved);
                    debug!(dealer = justification.dealer, "adopted justified share");
                }
                Ok((commits, _)) if ds.commits == commits => {
                    ds.verdicts.insert(justification.verifier, Verdict::Approved);
                    debug!(
                        dealer = justification.dealer,
                        verifier = justification.verifier,
                        "complaint resolved by justification"
                    );
                }
                Ok(_) if ds.share.is_some() => {
                    // the dealer published commitments that contradict the
                    // valid deal we hold
                    info!(dealer = justification.dealer, "dealer excluded after equivocation");
                    ds.excluded = true;
                }
                Ok(_) => {
                    // we complained ourselves and hold no authoritative
                    // record; the verdict settles, our own copy waits for
                    // the justification addressed to us
                    ds.verdicts.insert(justification.verifier, Verdict::Approved);
                }
            }
            self.check_certified(&mut st)
        };
        if let Some(share) = emission {
            self.emit_share(share);
        }
    }

    /// Settle one verified response. Returns the justification to broadcast
    /// when the response is a complaint about our own deal.
    fn apply_response(&self, st: &mut EngineState, response: &Response) -> Option<Justification> {
        let own_deal = response.dealer == self.index;
        {
            let ds = st
                .dealers
                .get_mut(&response.dealer)
                .expect("apply_response called before deal was processed");
            if ds.verdicts.contains_key(&response.verifier) {
                debug!(
                    dealer = response.dealer,
                    verifier = response.verifier,
                    "duplicate response dropped"
                );
                return None;
            }
            let verdict = if response.approved || own_deal {
                // a complaint about our own deal is answered immediately
                // with a reveal, so it settles as approved on our side
                Verdict::Approved
            } else {
                Verdict::Complained
            };
            ds.verdicts.insert(response.verifier, verdict);
        }
        if !(own_deal && !response.approved) {
            return None;
        }

        info!(verifier = response.verifier, "justifying our deal after complaint");
        let share = st.secret.evaluate(response.verifier);
        let commits = encode_commits(&st.dealers[&self.index].commits);
        let transcript = justification_transcript(
            &self.session_id,
            self.index,
            response.verifier,
            share.as_bytes(),
            &commits,
        );
        Some(Justification {
            dealer: self.index,
            verifier: response.verifier,
            share: share.to_bytes(),
            commits,
            signature: self.conf.private.sign(&transcript),
        })
    }

    /// Normal-path termination: all deals processed, a settled verdict from
    /// every verifier for every live dealer, and enough qualified dealers.
    /// Deterministic across peers when every packet is delivered.
    fn check_certified(&self, st: &mut EngineState) -> Option<Share> {
        if st.done || st.dealers.len() < self.conf.list.len() {
            return None;
        }
        let n = self.conf.list.len();
        for ds in st.dealers.values() {
            if ds.excluded {
                continue;
            }
            if ds.verdicts.len() < n
                || ds.verdicts.values().any(|v| *v == Verdict::Complained)
            {
                return None;
            }
        }
        self.finalize(st).ok()
    }

    /// Compute QUAL and the share. `Err` carries the number of qualified
    /// dealers when it is below the threshold.
    fn finalize(&self, st: &mut EngineState) -> std::result::Result<Share, usize> {
        let t = self.conf.threshold;
        let mut qual: Vec<u32> = st
            .dealers
            .iter()
            .filter(|(_, ds)| {
                !ds.excluded
                    && ds.share.is_some()
                    && !ds.verdicts.values().any(|v| *v == Verdict::Complained)
                    && ds.verdicts.values().filter(|v| **v == Verdict::Approved).count() >= t
            })
            .map(|(index, _)| *index)
            .collect();
        qual.sort_unstable();
        if qual.len() < t {
            return Err(qual.len());
        }

        st.done = true;
        let mut private = Scalar::ZERO;
        let mut commits = PublicPolynomial::placeholder(t);
        for dealer in &qual {
            let ds = &st.dealers[dealer];
            private += ds.share.expect("qualified dealer has a share");
            commits.add_assign(&ds.commits);
        }
        info!(qual = ?qual, index = self.index, "dkg certified");
        Ok(Share {
            index: self.index,
            private,
            commits: commits.into_points(),
        })
    }

    fn make_deals(&self, st: &EngineState) -> Vec<(Identity, DkgPacket)> {
        let commits = encode_commits(&st.dealers[&self.index].commits);
        let exchange = self.conf.private.exchange_key();
        let own_key = &self.conf.private.identity().key;

        let mut deals = Vec::with_capacity(self.conf.list.len() - 1);
        for (j, peer) in self.conf.list.iter().enumerate() {
            let j = j as u32;
            if j == self.index {
                continue;
            }
            let sealed = peer
                .exchange_key()
                .map(|peer_exchange| x25519_dalek::x25519(exchange, peer_exchange))
                .and_then(|shared| {
                    let key = crypto::deal_key(&shared, &self.session_id, own_key, &peer.key);
                    crypto::seal_share(&key, st.secret.evaluate(j).as_bytes())
                });
            match sealed {
                Ok(encrypted_share) => deals.push((
                    peer.clone(),
                    DkgPacket::deal(Deal {
                        dealer: self.index,
                        encrypted_share,
                        commits: commits.clone(),
                    }),
                )),
                Err(e) => debug!(peer = peer.short_id(), error = %e, "cannot seal deal"),
            }
        }
        deals
    }

    fn open_deal(&self, dealer: &Identity, deal: &Deal) -> Result<Scalar> {
        let shared = x25519_dalek::x25519(self.conf.private.exchange_key(), dealer.exchange_key()?);
        let key = crypto::deal_key(
            &shared,
            &self.session_id,
            &dealer.key,
            &self.conf.private.identity().key,
        );
        let bytes = crypto::open_share(&key, &deal.encrypted_share)?;
        crypto::decode_scalar(&bytes)
    }

    fn broadcast(&self, packet: DkgPacket) -> Vec<(Identity, DkgPacket)> {
        self.conf
            .list
            .iter()
            .enumerate()
            .filter(|(j, _)| *j as u32 != self.index)
            .map(|(_, id)| (id.clone(), packet.clone()))
            .collect()
    }

    async fn send_deals(&self, deals: Vec<(Identity, DkgPacket)>) {
        let mut good = 1;
        let total = self.conf.list.len();
        for (to, packet) in deals {
            match self.net.send(&to, packet).await {
                Ok(()) => good += 1,
                Err(e) => debug!(peer = to.short_id(), error = %e, "failed to send deal"),
            }
        }
        if good < self.conf.threshold {
            warn!(
                reached = good,
                total,
                threshold = self.conf.threshold,
                "deals reached fewer peers than the threshold"
            );
        } else {
            info!(reached = good - 1, "deals sent");
        }
    }

    async fn dispatch(&self, outbound: Vec<(Identity, DkgPacket)>) {
        for (to, packet) in outbound {
            if let Err(e) = self.net.send(&to, packet).await {
                debug!(peer = to.short_id(), error = %e, "failed to send dkg packet");
            }
        }
    }

    fn emit_share(&self, share: Share) {
        if let Some(sink) = self.on_share.lock().unwrap().take() {
            sink(share);
        }
    }
}

fn decode_commits(commits: &[[u8; 32]], threshold: usize) -> Result<PublicPolynomial> {
    if commits.len() != threshold {
        return Err(Error::Protocol(format!(
            "expected {threshold} commitments, got {}",
            commits.len()
        )));
    }
    let points = commits
        .iter()
        .map(crypto::decode_point)
        .collect::<Result<Vec<_>>>()?;
    Ok(PublicPolynomial::new(points))
}

fn encode_commits(poly: &PublicPolynomial) -> Vec<[u8; 32]> {
    poly.points().iter().map(|p| p.compress().to_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::poly;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    type Queue = Arc<StdMutex<VecDeque<(usize, usize, DkgPacket)>>>;

    struct TestNet {
        from: usize,
        list: Vec<Identity>,
        queue: Queue,
    }

    #[async_trait]
    impl DkgNetwork for TestNet {
        async fn send(&self, to: &Identity, packet: DkgPacket) -> Result<()> {
            let to = key::index_of(&self.list, to).unwrap() as usize;
            self.queue.lock().unwrap().push_back((self.from, to, packet));
            Ok(())
        }
    }

    struct Fixture {
        list: Vec<Identity>,
        handlers: Vec<Arc<DkgHandler<TestNet>>>,
        queue: Queue,
        shares: Arc<StdMutex<Vec<Share>>>,
        errors: Arc<StdMutex<Vec<Error>>>,
    }

    const SESSION: SessionId = [7u8; 32];

    fn fixture(n: usize, t: usize) -> Fixture {
        let privates: Vec<Arc<Private>> = (0..n)
            .map(|i| Arc::new(Private::generate(&format!("peer{i}"), &mut OsRng)))
            .collect();
        let list: Vec<Identity> = privates.iter().map(|p| p.identity().clone()).collect();
        let queue: Queue = Arc::new(StdMutex::new(VecDeque::new()));
        let shares = Arc::new(StdMutex::new(Vec::new()));
        let errors = Arc::new(StdMutex::new(Vec::new()));

        let handlers = (0..n)
            .map(|i| {
                let shares = shares.clone();
                let errors = errors.clone();
                Arc::new(
                    DkgHandler::new(
                        DkgConfig {
                            private: privates[i].clone(),
                            list: list.clone(),
                            threshold: t,
                        },
                        SESSION,
                        TestNet { from: i, list: list.clone(), queue: queue.clone() },
                        Box::new(move |share| shares.lock().unwrap().push(share)),
                        Box::new(move |err| errors.lock().unwrap().push(err)),
                    )
                    .unwrap(),
                )
            })
            .collect();

        Fixture { list, handlers, queue, shares, errors }
    }

    impl Fixture {
        /// Deliver queued packets until quiescent, skipping dead peers.
        async fn drain(&self, dead: &[usize]) {
            loop {
                let next = self.queue.lock().unwrap().pop_front();
                let Some((from, to, packet)) = next else { break };
                if dead.contains(&to) || dead.contains(&from) {
                    continue;
                }
                self.handlers[to].process(&self.list[from], packet).await;
            }
        }

        fn assert_consistent(&self, expected: usize, t: usize) {
            let shares = self.shares.lock().unwrap();
            assert_eq!(shares.len(), expected);
            for s in shares.iter() {
                assert_eq!(s.commits, shares[0].commits);
            }
            // any t shares reconstruct the secret behind commits[0]
            let subset: Vec<(u32, curve25519_dalek::Scalar)> =
                shares.iter().take(t).map(|s| (s.index, s.private)).collect();
            let secret = poly::recover_secret(&subset);
            assert_eq!(EdwardsPoint::mul_base(&secret), shares[0].commits[0]);
        }
    }

    #[tokio::test]
    async fn all_peers_start_and_certify() {
        let fx = fixture(5, 3);
        for h in &fx.handlers {
            h.start().await;
        }
        fx.drain(&[]).await;
        fx.assert_consistent(5, 3);
        let shares = fx.shares.lock().unwrap();
        let mut indices: Vec<u32> = shares.iter().map(|s| s.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn lazy_deal_broadcast_from_single_initiator() {
        let fx = fixture(5, 3);
        fx.handlers[0].start().await;
        fx.drain(&[]).await;
        fx.assert_consistent(5, 3);
    }

    #[tokio::test]
    async fn single_participant_group() {
        let fx = fixture(1, 1);
        fx.handlers[0].start().await;
        fx.assert_consistent(1, 1);
    }

    #[tokio::test]
    async fn responses_buffered_until_deal_arrives() {
        let fx = fixture(5, 3);
        for h in &fx.handlers {
            h.start().await;
        }
        // hold back every deal from dealer 3 to peer 2 until everything
        // else has been delivered, so peer 2 sees responses about dealer 3
        // first
        let mut stalled: Vec<(usize, usize, DkgPacket)> = Vec::new();
        loop {
            let next = fx.queue.lock().unwrap().pop_front();
            let Some((from, to, packet)) = next else {
                if stalled.is_empty() {
                    break;
                }
                for (from, to, packet) in stalled.drain(..) {
                    fx.handlers[to].process(&fx.list[from], packet).await;
                }
                continue;
            };
            if from == 3 && to == 2 && packet.deal.is_some() {
                stalled.push((from, to, packet));
                continue;
            }
            fx.handlers[to].process(&fx.list[from], packet).await;
        }
        fx.assert_consistent(5, 3);
    }

    #[tokio::test]
    async fn dark_peer_times_out_with_reduced_qual() {
        let fx = fixture(5, 3);
        for (i, h) in fx.handlers.iter().enumerate() {
            if i != 4 {
                h.start().await;
            }
        }
        fx.drain(&[4]).await;
        assert!(fx.shares.lock().unwrap().is_empty());
        for (i, h) in fx.handlers.iter().enumerate() {
            if i != 4 {
                h.set_timeout();
            }
        }
        fx.assert_consistent(4, 3);
    }

    #[tokio::test]
    async fn threshold_equals_n_aborts_when_one_peer_is_dark() {
        let fx = fixture(3, 3);
        fx.handlers[0].start().await;
        fx.handlers[1].start().await;
        fx.drain(&[2]).await;
        fx.handlers[0].set_timeout();
        fx.handlers[1].set_timeout();
        assert!(fx.shares.lock().unwrap().is_empty());
        let errors = fx.errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        // with t = N a dealer needs approvals from everyone, so no dealer
        // qualifies once a peer is lost
        assert!(matches!(
            errors[0],
            Error::ThresholdNotMet { required: 3, actual: 0 }
        ));
    }

    #[tokio::test]
    async fn tampered_deal_is_justified_and_dealer_stays_qualified() {
        let fx = fixture(5, 3);
        for h in &fx.handlers {
            h.start().await;
        }
        // corrupt the commitment list of dealer 4's deal to peer 1 with a
        // different valid point; peer 1 complains, dealer 4 reveals
        let mut tampered = false;
        loop {
            let next = fx.queue.lock().unwrap().pop_front();
            let Some((from, to, mut packet)) = next else { break };
            if from == 4 && to == 1 && !tampered {
                if let Some(deal) = packet.deal.as_mut() {
                    let point = crypto::decode_point(&deal.commits[1]).unwrap();
                    deal.commits[1] = (point
                        + curve25519_dalek::constants::ED25519_BASEPOINT_POINT)
                        .compress()
                        .to_bytes();
                    tampered = true;
                }
            }
            fx.handlers[to].process(&fx.list[from], packet).await;
        }
        assert!(tampered);
        // dealer 4 is still qualified everywhere: all five commit sums match
        fx.assert_consistent(5, 3);
    }

    #[tokio::test]
    async fn replayed_packets_are_idempotent() {
        let fx = fixture(3, 2);
        for h in &fx.handlers {
            h.start().await;
        }
        let mut seen = Vec::new();
        loop {
            let next = fx.queue.lock().unwrap().pop_front();
            let Some((from, to, packet)) = next else { break };
            seen.push((from, to, packet.clone()));
            fx.handlers[to].process(&fx.list[from], packet).await;
        }
        let first: Vec<Share> = fx.shares.lock().unwrap().clone();
        assert_eq!(first.len(), 3);

        for (from, to, packet) in seen {
            fx.handlers[to].process(&fx.list[from], packet).await;
        }
        fx.drain(&[]).await;
        let replayed = fx.shares.lock().unwrap();
        assert_eq!(replayed.len(), 3);
        for (a, b) in first.iter().zip(replayed.iter()) {
            assert_eq!(a.private, b.private);
        }
    }

    #[tokio::test]
    async fn rejects_bad_configurations() {
        let privates: Vec<Arc<Private>> = (0..3)
            .map(|i| Arc::new(Private::generate(&format!("peer{i}"), &mut OsRng)))
            .collect();
        let list: Vec<Identity> = privates.iter().map(|p| p.identity().clone()).collect();
        let queue: Queue = Arc::new(StdMutex::new(VecDeque::new()));
        let build = |private: Arc<Private>, list: Vec<Identity>, t: usize| {
            DkgHandler::new(
                DkgConfig { private, list: list.clone(), threshold: t },
                SESSION,
                TestNet { from: 0, list, queue: queue.clone() },
                Box::new(|_| {}),
                Box::new(|_| {}),
            )
        };

        assert!(matches!(
            build(privates[0].clone(), list.clone(), 0),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            build(privates[0].clone(), list.clone(), 4),
            Err(Error::Config(_))
        ));

        let outsider = Arc::new(Private::generate("outsider", &mut OsRng));
        assert!(matches!(
            build(outsider, list.clone(), 2),
            Err(Error::Config(_))
        ));

        let mut duplicated = list.clone();
        duplicated[2] = list[0].clone();
        assert!(matches!(
            build(privates[0].clone(), duplicated, 2),
            Err(Error::Config(_))
        ));
    }
}
