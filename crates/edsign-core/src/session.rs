//! Session orchestration.
//!
//! A [`Node`] ties protocol engines to session ids and the gateway. The
//! long-term key pair is one DKG run; every signature is a nested
//! ephemeral DKG followed by a partial-signature exchange. Inbound packets
//! are dispatched by session id and envelope variant; packets racing ahead
//! of their session announcement are buffered and replayed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use rand::{rngs::OsRng, RngCore};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::key::{self, Identity, Private, Share, SharedPrivate};
use crate::keygen::{DkgConfig, DkgHandler, DkgNetwork, DkgPacket};
use crate::net::{Gateway, Processor};
use crate::sign::{DssConfig, DssHandler, PartialSig, SignNetwork};
use crate::store::{Store, Validator};
use crate::wire::{
    self, LongtermProposal, ProtocolPacket, SessionId, SignatureInfo,
};

use async_trait::async_trait;

/// Sessions whose announcement has not arrived hold at most this many
/// buffered packets.
const PENDING_PACKETS: usize = 128;
/// At most this many unknown sessions are buffered at once.
const PENDING_SESSIONS: usize = 32;

/// Terminal session outcomes, delivered off the processing threads.
#[derive(Debug)]
pub enum Event {
    /// The long-term share was generated and persisted.
    LongtermReady { key_id: String },
    /// A signature run completed; also delivered to every non-initiating
    /// participant.
    SignatureReady { session_id: SessionId, signature: Vec<u8> },
    /// A session aborted. Other sessions are unaffected.
    SessionFailed { session_id: SessionId, error: Error },
}

/// Static configuration of one node: its key pair and the fixed group.
pub struct NodeConfig {
    pub private: Arc<Private>,
    pub list: Vec<Identity>,
    pub threshold: usize,
    /// Armed on every DKG run when set. The partial-signature exchange has
    /// no timeout and stalls until the session is torn down.
    pub dkg_timeout: Option<Duration>,
}

/// One running edsign node.
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    /// Handle to ourselves for engine callbacks; sessions never keep the
    /// orchestrator alive.
    weak: Weak<Inner>,
    conf: NodeConfig,
    gateway: Arc<dyn Gateway>,
    validator: Arc<dyn Validator>,
    longterm: Mutex<Option<Arc<SharedPrivate>>>,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    pending: Mutex<HashMap<SessionId, Vec<(Identity, Inbound)>>>,
    events: mpsc::UnboundedSender<Event>,
    flush: mpsc::UnboundedSender<(SessionId, SharedPrivate)>,
}

enum Session {
    Longterm(LongtermSession),
    Signing(SigningSession),
}

struct LongtermSession {
    dkg: Arc<DkgHandler<SessionNet>>,
}

struct SigningSession {
    info: SignatureInfo,
    initiator: bool,
    dkg: Arc<DkgHandler<SessionNet>>,
    dss: Mutex<Option<Arc<DssHandler<SessionNet>>>>,
    /// Partials that arrived before our ephemeral DKG finished.
    pending_partials: Mutex<Vec<(Identity, PartialSig)>>,
    reply: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
}

/// Routed inbound payloads after envelope validation.
enum Inbound {
    LongtermDkg(DkgPacket),
    RandomDkg(DkgPacket),
    Partial(PartialSig),
    KeypairSigning,
}

/// Send port handed to the engines: wraps their packets into the right
/// envelope for this session.
#[derive(Clone)]
struct SessionNet {
    gateway: Arc<dyn Gateway>,
    session_id: SessionId,
    kind: NetKind,
}

#[derive(Clone, Copy)]
enum NetKind {
    Longterm,
    Random,
}

#[async_trait]
impl DkgNetwork for SessionNet {
    async fn send(&self, to: &Identity, packet: DkgPacket) -> Result<()> {
        let wrapped = match self.kind {
            NetKind::Longterm => ProtocolPacket::longterm_dkg(self.session_id, packet),
            NetKind::Random => ProtocolPacket::signature_random(self.session_id, packet),
        };
        self.gateway.send(to, wire::encode_packet(&wrapped)?).await
    }
}

#[async_trait]
impl SignNetwork for SessionNet {
    async fn send(&self, to: &Identity, partial: PartialSig) -> Result<()> {
        let wrapped = ProtocolPacket::signature_partial(self.session_id, partial);
        self.gateway.send(to, wire::encode_packet(&wrapped)?).await
    }
}

impl Node {
    /// Start a node: load any persisted long-term share, spawn the store
    /// flush task and hook the gateway. Returns the node and its event
    /// stream.
    pub async fn new(
        conf: NodeConfig,
        gateway: Arc<dyn Gateway>,
        store: Arc<dyn Store>,
        validator: Arc<dyn Validator>,
    ) -> Result<(Node, mpsc::UnboundedReceiver<Event>)> {
        let n = conf.list.len();
        if conf.threshold < 1 || conf.threshold > n {
            return Err(Error::Config(format!(
                "threshold {} out of range for {n} participants",
                conf.threshold
            )));
        }
        if !key::distinct(&conf.list) {
            return Err(Error::Config("duplicate identity in participant list".into()));
        }
        if key::index_of(&conf.list, conf.private.identity()).is_none() {
            return Err(Error::Config("own identity not in participant list".into()));
        }

        let longterm = store.load_longterm()?.map(Arc::new);
        if let Some(share) = &longterm {
            info!(key_id = %share.key_id, "loaded longterm share");
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|weak| Inner {
            weak: weak.clone(),
            conf,
            gateway: gateway.clone(),
            validator,
            longterm: Mutex::new(longterm),
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            events: events_tx.clone(),
            flush: flush_tx,
        });

        // a single task serializes every store write
        tokio::spawn(flush_loop(store, flush_rx, events_tx));

        let weak = Arc::downgrade(&inner);
        let processor: Processor = Arc::new(move |from, payload| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.receive(from, payload).await;
                }
            }
            .boxed()
        });
        gateway.start(processor).await?;

        Ok((Node { inner }, events_rx))
    }

    /// The long-term share, once generated or loaded.
    pub fn longterm(&self) -> Option<Arc<SharedPrivate>> {
        self.inner.longterm.lock().unwrap().clone()
    }

    /// Initiate the creation of the distributed long-term key pair.
    /// Completion is reported as [`Event::LongtermReady`].
    pub async fn start_new_longterm(&self, proposal: LongtermProposal) -> Result<SessionId> {
        if self.inner.longterm.lock().unwrap().is_some() {
            return Err(Error::Config("a longterm share already exists".into()));
        }
        let (ok, reason) = self.inner.validator.validate_longterm_info(&proposal);
        if !ok {
            return Err(Error::Rejected(reason));
        }
        let (session_id, dkg) = self.inner.create_longterm_session(None, proposal.clone())?;
        info!(session = %wire::session_tag(&session_id), "starting longterm generation");
        // announce first: per-pair FIFO puts the proposal ahead of our deals
        self.inner
            .broadcast(ProtocolPacket::longterm_proposal(session_id, proposal))
            .await;
        dkg.start().await;
        Ok(session_id)
    }

    /// Initiate a distributed signature over `info.message`. The receiver
    /// resolves with the signature; failures surface on the event stream
    /// and drop the sender.
    pub async fn new_signature(
        &self,
        info: SignatureInfo,
    ) -> Result<(SessionId, oneshot::Receiver<Vec<u8>>)> {
        if self.inner.longterm.lock().unwrap().is_none() {
            return Err(Error::Config("no longterm share to sign with".into()));
        }
        let (ok, reason) = self.inner.validator.validate_signature_info(&info);
        if !ok {
            return Err(Error::Rejected(reason));
        }
        let (session_id, dkg, reply) =
            self.inner.create_signing_session(None, info.clone(), true)?;
        info!(session = %wire::session_tag(&session_id), "starting signature");
        self.inner
            .broadcast(ProtocolPacket::signature_info(session_id, info))
            .await;
        dkg.start().await;
        Ok((session_id, reply.expect("initiator session has a reply channel")))
    }

    /// Tear the node down: close the gateway and drop every session.
    pub async fn stop(&self) {
        self.inner.gateway.stop().await;
        self.inner.sessions.lock().unwrap().clear();
        self.inner.pending.lock().unwrap().clear();
    }
}

impl Inner {
    async fn receive(&self, from: Identity, payload: Vec<u8>) {
        if key::index_of(&self.conf.list, &from).is_none() {
            debug!(peer = from.short_id(), "packet from peer outside the group");
            return;
        }
        let packet = match wire::decode_packet(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(peer = from.short_id(), error = %e, "sent malformed packet");
                return;
            }
        };
        self.dispatch(from, packet).await;
    }

    async fn dispatch(&self, from: Identity, packet: ProtocolPacket) {
        if let Some(kp) = packet.new_key_pair {
            if let Some(proposal) = kp.proposal {
                self.handle_longterm_proposal(from, kp.session_id, proposal).await;
            } else if let Some(dkg) = kp.longterm {
                self.route(from, kp.session_id, Inbound::LongtermDkg(dkg)).await;
            } else if kp.signing.is_some() {
                self.route(from, kp.session_id, Inbound::KeypairSigning).await;
            }
        } else if let Some(ns) = packet.new_signature {
            if let Some(info) = ns.info {
                self.handle_signature_info(from, ns.session_id, info).await;
            } else if let Some(signing) = ns.signing {
                if let Some(dkg) = signing.random {
                    self.route(from, ns.session_id, Inbound::RandomDkg(dkg)).await;
                } else if let Some(partial) = signing.signature {
                    self.route(from, ns.session_id, Inbound::Partial(partial)).await;
                }
            }
        }
    }

    async fn handle_longterm_proposal(
        &self,
        from: Identity,
        session_id: SessionId,
        proposal: LongtermProposal,
    ) {
        if self.longterm.lock().unwrap().is_some() {
            debug!(peer = from.short_id(), "longterm creation requested but a share exists");
            return;
        }
        if self.sessions.lock().unwrap().contains_key(&session_id) {
            debug!(session = %wire::session_tag(&session_id), "duplicate proposal");
            return;
        }
        let (ok, reason) = self.validator.validate_longterm_info(&proposal);
        if !ok {
            info!(peer = from.short_id(), %reason, "rejected longterm proposal");
            return;
        }
        match self.create_longterm_session(Some(session_id), proposal) {
            Ok(_) => {
                info!(
                    session = %wire::session_tag(&session_id),
                    peer = from.short_id(),
                    "joined longterm generation"
                );
                self.drain_pending(session_id).await;
            }
            Err(e) => debug!(error = %e, "cannot join longterm generation"),
        }
    }

    async fn handle_signature_info(
        &self,
        from: Identity,
        session_id: SessionId,
        info: SignatureInfo,
    ) {
        if self.longterm.lock().unwrap().is_none() {
            debug!(peer = from.short_id(), "signature requested but no longterm share");
            return;
        }
        if self.sessions.lock().unwrap().contains_key(&session_id) {
            debug!(session = %wire::session_tag(&session_id), "duplicate signature info");
            return;
        }
        let (ok, reason) = self.validator.validate_signature_info(&info);
        if !ok {
            info!(peer = from.short_id(), %reason, "rejected signature request");
            return;
        }
        match self.create_signing_session(Some(session_id), info, false) {
            Ok(_) => {
                info!(
                    session = %wire::session_tag(&session_id),
                    peer = from.short_id(),
                    "joined signature"
                );
                self.drain_pending(session_id).await;
            }
            Err(e) => debug!(error = %e, "cannot join signature"),
        }
    }

    async fn route(&self, from: Identity, session_id: SessionId, inbound: Inbound) {
        let session = self.sessions.lock().unwrap().get(&session_id).cloned();
        let Some(session) = session else {
            if matches!(inbound, Inbound::KeypairSigning) {
                debug!("longterm self-certification packet ignored");
                return;
            }
            self.buffer_pending(session_id, from, inbound);
            return;
        };
        match (&*session, inbound) {
            (Session::Longterm(lt), Inbound::LongtermDkg(packet)) => {
                lt.dkg.process(&from, packet).await;
            }
            (Session::Signing(sig), Inbound::RandomDkg(packet)) => {
                sig.dkg.process(&from, packet).await;
            }
            (Session::Signing(sig), Inbound::Partial(partial)) => {
                // lock order pending → dss matches the install in
                // ephemeral_done, so a partial is either buffered before
                // the drain or sees the installed engine
                let direct = {
                    let mut pending = sig.pending_partials.lock().unwrap();
                    match sig.dss.lock().unwrap().clone() {
                        Some(dss) => Some(dss),
                        None => {
                            debug!("partial before ephemeral share, buffered");
                            pending.push((from.clone(), partial.clone()));
                            None
                        }
                    }
                };
                if let Some(dss) = direct {
                    dss.process(&from, partial).await;
                }
            }
            (_, Inbound::KeypairSigning) => {
                debug!("longterm self-certification packet ignored");
            }
            _ => {
                // a session id reused by a different sub-protocol is a
                // protocol abort for that session
                self.session_failed(
                    session_id,
                    Error::Protocol("session id used by a different sub-protocol".into()),
                );
            }
        }
    }

    fn buffer_pending(&self, session_id: SessionId, from: Identity, inbound: Inbound) {
        let mut pending = self.pending.lock().unwrap();
        if !pending.contains_key(&session_id) && pending.len() >= PENDING_SESSIONS {
            debug!("too many unannounced sessions, packet dropped");
            return;
        }
        let queue = pending.entry(session_id).or_default();
        if queue.len() >= PENDING_PACKETS {
            debug!(session = %wire::session_tag(&session_id), "pending queue full, packet dropped");
            return;
        }
        debug!(
            session = %wire::session_tag(&session_id),
            "buffering packet for unannounced session"
        );
        queue.push((from, inbound));
    }

    async fn drain_pending(&self, session_id: SessionId) {
        let drained = self.pending.lock().unwrap().remove(&session_id).unwrap_or_default();
        for (from, inbound) in drained {
            self.route(from, session_id, inbound).await;
        }
    }

    fn create_longterm_session(
        &self,
        session_id: Option<SessionId>,
        proposal: LongtermProposal,
    ) -> Result<(SessionId, Arc<DkgHandler<SessionNet>>)> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.values().any(|s| matches!(**s, Session::Longterm(_))) {
            return Err(Error::Config("a longterm generation is already running".into()));
        }
        let session_id = self.claim_session_id(&sessions, session_id)?;

        let weak = self.weak.clone();
        let on_share = Box::new(move |share: Share| {
            if let Some(inner) = weak.upgrade() {
                inner.longterm_done(session_id, proposal, share);
            }
        });
        let weak = self.weak.clone();
        let on_error = Box::new(move |error: Error| {
            if let Some(inner) = weak.upgrade() {
                inner.session_failed(session_id, error);
            }
        });

        let dkg = Arc::new(DkgHandler::new(
            self.dkg_config(),
            session_id,
            self.net(session_id, NetKind::Longterm),
            on_share,
            on_error,
        )?);
        sessions.insert(
            session_id,
            Arc::new(Session::Longterm(LongtermSession { dkg: dkg.clone() })),
        );
        drop(sessions);
        self.arm_timeout(session_id);
        Ok((session_id, dkg))
    }

    fn create_signing_session(
        &self,
        session_id: Option<SessionId>,
        info: SignatureInfo,
        initiator: bool,
    ) -> Result<(
        SessionId,
        Arc<DkgHandler<SessionNet>>,
        Option<oneshot::Receiver<Vec<u8>>>,
    )> {
        let mut sessions = self.sessions.lock().unwrap();
        let session_id = self.claim_session_id(&sessions, session_id)?;

        let weak = self.weak.clone();
        let on_share = Box::new(move |share: Share| {
            if let Some(inner) = weak.upgrade() {
                // constructing the signing engine sends packets, which
                // cannot happen on the emitting thread
                tokio::spawn(async move { inner.ephemeral_done(session_id, share).await });
            }
        });
        let weak = self.weak.clone();
        let on_error = Box::new(move |error: Error| {
            if let Some(inner) = weak.upgrade() {
                inner.session_failed(session_id, error);
            }
        });

        let dkg = Arc::new(DkgHandler::new(
            self.dkg_config(),
            session_id,
            self.net(session_id, NetKind::Random),
            on_share,
            on_error,
        )?);
        let (reply_tx, reply_rx) = if initiator {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        sessions.insert(
            session_id,
            Arc::new(Session::Signing(SigningSession {
                info,
                initiator,
                dkg: dkg.clone(),
                dss: Mutex::new(None),
                pending_partials: Mutex::new(Vec::new()),
                reply: Mutex::new(reply_tx),
            })),
        );
        drop(sessions);
        self.arm_timeout(session_id);
        Ok((session_id, dkg, reply_rx))
    }

    /// The ephemeral DKG finished: build the signing engine over the
    /// long-term and fresh shares, then replay buffered partials.
    async fn ephemeral_done(&self, session_id: SessionId, random: Share) {
        let session = self.sessions.lock().unwrap().get(&session_id).cloned();
        let Some(session) = session else { return };
        let Session::Signing(signing) = &*session else { return };

        let Some(longterm) = self.longterm.lock().unwrap().clone() else {
            self.session_failed(session_id, Error::Config("longterm share disappeared".into()));
            return;
        };

        let weak = self.weak.clone();
        let on_signature = Box::new(move |signature: Vec<u8>| {
            if let Some(inner) = weak.upgrade() {
                inner.signature_done(session_id, signature);
            }
        });
        let weak = self.weak.clone();
        let on_error = Box::new(move |error: Error| {
            if let Some(inner) = weak.upgrade() {
                inner.session_failed(session_id, error);
            }
        });

        let dss = DssHandler::new(
            DssConfig {
                private: self.conf.private.clone(),
                list: self.conf.list.clone(),
                threshold: self.conf.threshold,
                longterm: longterm.share.clone(),
                random,
                message: signing.info.message.clone(),
            },
            session_id,
            self.net(session_id, NetKind::Random),
            on_signature,
            on_error,
        );
        let dss = match dss {
            Ok(dss) => Arc::new(dss),
            Err(e) => {
                self.session_failed(session_id, e);
                return;
            }
        };

        let buffered: Vec<(Identity, PartialSig)> = {
            let mut pending = signing.pending_partials.lock().unwrap();
            *signing.dss.lock().unwrap() = Some(dss.clone());
            pending.drain(..).collect()
        };
        debug!(
            session = %wire::session_tag(&session_id),
            buffered = buffered.len(),
            "ephemeral share ready, signing"
        );
        if signing.initiator {
            dss.start().await;
        }
        for (from, partial) in buffered {
            dss.process(&from, partial).await;
        }
    }

    fn longterm_done(&self, session_id: SessionId, proposal: LongtermProposal, share: Share) {
        let shared = SharedPrivate {
            key_id: SharedPrivate::key_id_for(share.public()),
            full_name: proposal.full_name,
            email: proposal.email,
            extra: proposal.extra,
            share,
        };
        info!(key_id = %shared.key_id, "longterm share generated");
        *self.longterm.lock().unwrap() = Some(Arc::new(shared.clone()));
        // the flush task persists and emits LongtermReady
        let _ = self.flush.send((session_id, shared));
        self.remove_session(&session_id);
    }

    fn signature_done(&self, session_id: SessionId, signature: Vec<u8>) {
        info!(session = %wire::session_tag(&session_id), "signature ready");
        if let Some(session) = self.sessions.lock().unwrap().get(&session_id) {
            if let Session::Signing(signing) = &**session {
                if let Some(reply) = signing.reply.lock().unwrap().take() {
                    let _ = reply.send(signature.clone());
                }
            }
        }
        self.remove_session(&session_id);
        let _ = self.events.send(Event::SignatureReady { session_id, signature });
    }

    fn session_failed(&self, session_id: SessionId, error: Error) {
        warn!(session = %wire::session_tag(&session_id), error = %error, "session failed");
        self.remove_session(&session_id);
        let _ = self.events.send(Event::SessionFailed { session_id, error });
    }

    fn remove_session(&self, session_id: &SessionId) {
        self.sessions.lock().unwrap().remove(session_id);
        self.pending.lock().unwrap().remove(session_id);
    }

    fn claim_session_id(
        &self,
        sessions: &HashMap<SessionId, Arc<Session>>,
        session_id: Option<SessionId>,
    ) -> Result<SessionId> {
        match session_id {
            Some(session_id) => {
                if sessions.contains_key(&session_id) {
                    return Err(Error::Protocol("session id collision".into()));
                }
                Ok(session_id)
            }
            None => {
                let mut session_id = [0u8; 32];
                OsRng.fill_bytes(&mut session_id);
                // colliding with an existing session from 32 random bytes
                // means the CSPRNG is broken
                assert!(
                    !sessions.contains_key(&session_id),
                    "session id collision from fresh randomness"
                );
                Ok(session_id)
            }
        }
    }

    fn dkg_config(&self) -> DkgConfig {
        DkgConfig {
            private: self.conf.private.clone(),
            list: self.conf.list.clone(),
            threshold: self.conf.threshold,
        }
    }

    fn net(&self, session_id: SessionId, kind: NetKind) -> SessionNet {
        SessionNet { gateway: self.gateway.clone(), session_id, kind }
    }

    fn arm_timeout(&self, session_id: SessionId) {
        let Some(timeout) = self.conf.dkg_timeout else { return };
        let weak = self.weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            let session = inner.sessions.lock().unwrap().get(&session_id).cloned();
            if let Some(session) = session {
                match &*session {
                    Session::Longterm(lt) => lt.dkg.set_timeout(),
                    Session::Signing(sig) => sig.dkg.set_timeout(),
                }
            }
        });
    }

    async fn broadcast(&self, packet: ProtocolPacket) {
        let bytes = match wire::encode_packet(&packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "cannot encode broadcast");
                return;
            }
        };
        for peer in &self.conf.list {
            if peer == self.conf.private.identity() {
                continue;
            }
            if let Err(e) = self.gateway.send(peer, bytes.clone()).await {
                debug!(peer = peer.short_id(), error = %e, "broadcast send failed");
            }
        }
    }
}

async fn flush_loop(
    store: Arc<dyn Store>,
    mut rx: mpsc::UnboundedReceiver<(SessionId, SharedPrivate)>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some((session_id, shared)) = rx.recv().await {
        match store.save_longterm(&shared) {
            Ok(()) => {
                let _ = events.send(Event::LongtermReady { key_id: shared.key_id });
            }
            Err(error) => {
                // the share is still usable in memory, but the node cannot
                // resume after a restart
                warn!(error = %error, "failed to persist longterm share");
                let _ = events.send(Event::SessionFailed { session_id, error });
            }
        }
    }
}
