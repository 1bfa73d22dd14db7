//! Connection lifecycle manager
//!
//! Tracks one state machine per session, drives the bounded signaling
//! retry loops (join re-announcement and offer resend), routes inbound
//! signaling envelopes, and owns the session handles once a transport is
//! attached. Teardown is idempotent: the first call wins, repeats no-op.
//!
//! The manager never creates transports itself. The embedder performs the
//! actual NAT traversal (typically a WebRTC data channel negotiated with
//! the SDP and ICE material the manager routes) and hands the resulting
//! byte stream to [`ConnectionManager::attach_transport`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use peerlink_core::types::{PeerId, SessionId};
use peerlink_crypto::keys::SigningKeyPair;

use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, Result};
use crate::handshake::HandshakeRole;
use crate::session::{spawn_session, SessionEvent, SessionHandle};
use crate::signaling::{SignalKind, SignalPayload, SignalingEnvelope, SignalingTransport};
use crate::transport::Transport;

/// Where a session stands in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session underway
    Idle,
    /// Joined and announcing, waiting for a peer
    Waiting,
    /// Signaling exchange in progress
    Connecting,
    /// Transport attached, session task running
    Connected,
    /// Signaling retries exhausted or the session failed
    Failed,
}

/// What the manager reports to its owner
#[derive(Debug)]
pub enum ManagerEvent {
    /// A session moved to a new lifecycle state
    StateChanged {
        /// Affected session
        session_id: SessionId,
        /// New state
        state: ConnectionState,
    },
    /// A remote peer announced itself in a session we joined
    PeerJoined {
        /// Affected session
        session_id: SessionId,
        /// Announcing peer
        from: PeerId,
    },
    /// A remote offer arrived; the embedder should answer and connect
    RemoteOffer {
        /// Affected session
        session_id: SessionId,
        /// Offering peer
        from: PeerId,
        /// SDP and related material
        payload: SignalPayload,
    },
    /// A remote answer arrived; offer resends stop
    RemoteAnswer {
        /// Affected session
        session_id: SessionId,
        /// Answering peer
        from: PeerId,
        /// SDP and related material
        payload: SignalPayload,
    },
    /// A trickled ICE candidate arrived
    RemoteCandidate {
        /// Affected session
        session_id: SessionId,
        /// Originating peer
        from: PeerId,
        /// Candidate material
        payload: SignalPayload,
    },
    /// Event from an attached session
    Session {
        /// Originating session
        session_id: SessionId,
        /// The session event
        event: SessionEvent,
    },
}

struct SessionEntry {
    state: ConnectionState,
    /// Set once the remote answered; stops both retry loops
    answered: Arc<AtomicBool>,
    handle: Option<SessionHandle>,
    tasks: Vec<JoinHandle<()>>,
}

/// Per-device connection lifecycle manager
pub struct ConnectionManager {
    local_peer: PeerId,
    config: ProtocolConfig,
    signaling: Arc<dyn SignalingTransport>,
    sessions: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
    event_tx: mpsc::Sender<ManagerEvent>,
}

impl ConnectionManager {
    /// Create a manager for this device
    pub fn new(
        local_peer: PeerId,
        config: ProtocolConfig,
        signaling: Arc<dyn SignalingTransport>,
        event_tx: mpsc::Sender<ManagerEvent>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            local_peer,
            config,
            signaling,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        })
    }

    /// Current lifecycle state of a session
    pub fn state(&self, session_id: &SessionId) -> ConnectionState {
        self.sessions
            .read()
            .get(session_id)
            .map(|entry| entry.state)
            .unwrap_or(ConnectionState::Idle)
    }

    /// Handle to an attached session, if one is running
    pub fn session(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(|entry| entry.handle.clone())
    }

    /// Join a session: announce presence with bounded re-announcement
    /// until a peer answers or attempts run out.
    pub async fn join(&self, session_id: SessionId) -> Result<()> {
        let answered = self.create_entry(&session_id, ConnectionState::Waiting)?;
        self.emit(ManagerEvent::StateChanged {
            session_id: session_id.clone(),
            state: ConnectionState::Waiting,
        })
        .await;

        let task = self.spawn_retry_loop(
            session_id.clone(),
            SignalKind::Join,
            SignalPayload::default(),
            answered,
            self.config.signaling.join_announce_attempts,
            self.config.signaling.join_announce_interval_ms,
        );
        self.track_task(&session_id, task);
        Ok(())
    }

    /// Publish a local offer with bounded resends until the remote answers
    pub async fn send_offer(&self, session_id: SessionId, sdp: String) -> Result<()> {
        let answered = {
            let mut sessions = self.sessions.write();
            let entry = sessions.entry(session_id.clone()).or_insert_with(new_entry);
            entry.state = ConnectionState::Connecting;
            Arc::clone(&entry.answered)
        };
        self.emit(ManagerEvent::StateChanged {
            session_id: session_id.clone(),
            state: ConnectionState::Connecting,
        })
        .await;

        let task = self.spawn_retry_loop(
            session_id.clone(),
            SignalKind::Offer,
            SignalPayload::sdp(sdp),
            answered,
            self.config.signaling.offer_resend_attempts,
            self.config.signaling.offer_resend_interval_ms,
        );
        self.track_task(&session_id, task);
        Ok(())
    }

    /// Answer a remote offer (sent once, no retry loop)
    pub async fn send_answer(&self, session_id: &SessionId, sdp: String) -> Result<()> {
        self.signaling
            .send(SignalingEnvelope::new(
                session_id.as_str(),
                self.local_peer.clone(),
                SignalKind::Answer,
                SignalPayload::sdp(sdp),
            ))
            .await
    }

    /// Trickle a local ICE candidate to the remote peer
    pub async fn send_candidate(
        &self,
        session_id: &SessionId,
        payload: SignalPayload,
    ) -> Result<()> {
        self.signaling
            .send(SignalingEnvelope::new(
                session_id.as_str(),
                self.local_peer.clone(),
                SignalKind::IceCandidate,
                payload,
            ))
            .await
    }

    /// Route one inbound signaling envelope
    pub async fn handle_envelope(&self, envelope: SignalingEnvelope) {
        // the signaling channel may echo our own messages back
        if envelope.from == self.local_peer {
            return;
        }
        let session_id = SessionId::from_string(envelope.session_id.clone());

        match envelope.kind {
            SignalKind::Answer => {
                if let Some(entry) = self.sessions.read().get(&session_id) {
                    entry.answered.store(true, Ordering::SeqCst);
                }
                self.emit(ManagerEvent::RemoteAnswer {
                    session_id,
                    from: envelope.from,
                    payload: envelope.payload,
                })
                .await;
            }
            SignalKind::Offer => {
                self.emit(ManagerEvent::RemoteOffer {
                    session_id,
                    from: envelope.from,
                    payload: envelope.payload,
                })
                .await;
            }
            SignalKind::IceCandidate => {
                self.emit(ManagerEvent::RemoteCandidate {
                    session_id,
                    from: envelope.from,
                    payload: envelope.payload,
                })
                .await;
            }
            SignalKind::Join => {
                self.emit(ManagerEvent::PeerJoined {
                    session_id,
                    from: envelope.from,
                })
                .await;
            }
            SignalKind::Leave => {
                debug!(session = %session_id, peer = %envelope.from, "peer left");
                self.teardown(&session_id).await;
            }
        }
    }

    /// Attach a negotiated byte stream and start the session task
    pub fn attach_transport<T>(
        &self,
        session_id: SessionId,
        role: HandshakeRole,
        signing: SigningKeyPair,
        transport: T,
    ) -> Result<SessionHandle>
    where
        T: Transport + 'static,
    {
        let (session_events_tx, mut session_events) = mpsc::channel(64);
        let handle = spawn_session(
            self.config.clone(),
            role,
            signing,
            transport,
            session_events_tx,
        )?;

        // forward session events under this session's id
        let event_tx = self.event_tx.clone();
        let forward_id = session_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = session_events.recv().await {
                let _ = event_tx
                    .send(ManagerEvent::Session {
                        session_id: forward_id.clone(),
                        event,
                    })
                    .await;
            }
        });

        {
            let mut sessions = self.sessions.write();
            let entry = sessions.entry(session_id.clone()).or_insert_with(new_entry);
            entry.state = ConnectionState::Connected;
            entry.answered.store(true, Ordering::SeqCst);
            entry.handle = Some(handle.clone());
            entry.tasks.push(forwarder);
        }

        let event_tx = self.event_tx.clone();
        let changed_id = session_id.clone();
        tokio::spawn(async move {
            let _ = event_tx
                .send(ManagerEvent::StateChanged {
                    session_id: changed_id,
                    state: ConnectionState::Connected,
                })
                .await;
        });

        debug!(session = %session_id, "transport attached");
        Ok(handle)
    }

    /// Tear a session down: close the session task, stop retry loops,
    /// announce the leave, drop all state. Idempotent.
    pub async fn teardown(&self, session_id: &SessionId) {
        let Some(entry) = self.sessions.write().remove(session_id) else {
            return;
        };
        debug!(session = %session_id, "tearing down");

        entry.answered.store(true, Ordering::SeqCst);
        if let Some(handle) = entry.handle {
            handle.close().await;
        }
        for task in entry.tasks {
            task.abort();
        }

        let leave = SignalingEnvelope::new(
            session_id.as_str(),
            self.local_peer.clone(),
            SignalKind::Leave,
            SignalPayload::default(),
        );
        if let Err(err) = self.signaling.send(leave).await {
            warn!(session = %session_id, error = %err, "leave announcement failed");
        }

        self.emit(ManagerEvent::StateChanged {
            session_id: session_id.clone(),
            state: ConnectionState::Idle,
        })
        .await;
    }

    fn create_entry(&self, session_id: &SessionId, state: ConnectionState) -> Result<Arc<AtomicBool>> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(session_id) {
            return Err(ProtocolError::InvalidState(format!(
                "session {session_id} already underway"
            )));
        }
        let entry = SessionEntry {
            state,
            ..new_entry()
        };
        let answered = Arc::clone(&entry.answered);
        sessions.insert(session_id.clone(), entry);
        Ok(answered)
    }

    /// Send an envelope repeatedly with bounded attempts, stopping early
    /// once the remote answered. Exhaustion marks the session failed.
    fn spawn_retry_loop(
        &self,
        session_id: SessionId,
        kind: SignalKind,
        payload: SignalPayload,
        answered: Arc<AtomicBool>,
        attempts: u32,
        interval_ms: u64,
    ) -> JoinHandle<()> {
        let signaling = Arc::clone(&self.signaling);
        let sessions = Arc::clone(&self.sessions);
        let event_tx = self.event_tx.clone();
        let local_peer = self.local_peer.clone();

        tokio::spawn(async move {
            for attempt in 0..attempts {
                if answered.load(Ordering::SeqCst) {
                    return;
                }
                let envelope = SignalingEnvelope::new(
                    session_id.as_str(),
                    local_peer.clone(),
                    kind,
                    payload.clone(),
                );
                if let Err(err) = signaling.send(envelope).await {
                    warn!(session = %session_id, attempt, error = %err, "signaling send failed");
                }
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            }
            if answered.load(Ordering::SeqCst) {
                return;
            }

            warn!(session = %session_id, ?kind, "signaling attempts exhausted");
            if let Some(entry) = sessions.write().get_mut(&session_id) {
                entry.state = ConnectionState::Failed;
            }
            let _ = event_tx
                .send(ManagerEvent::StateChanged {
                    session_id,
                    state: ConnectionState::Failed,
                })
                .await;
        })
    }

    fn track_task(&self, session_id: &SessionId, task: JoinHandle<()>) {
        if let Some(entry) = self.sessions.write().get_mut(session_id) {
            entry.tasks.push(task);
        } else {
            // session torn down while the loop was being set up
            task.abort();
        }
    }

    async fn emit(&self, event: ManagerEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

fn new_entry() -> SessionEntry {
    SessionEntry {
        state: ConnectionState::Idle,
        answered: Arc::new(AtomicBool::new(false)),
        handle: None,
        tasks: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::config::SignalingConfig;
    use crate::transport::duplex_pair;

    #[derive(Default)]
    struct RecordingSignaling {
        sent: Mutex<Vec<SignalingEnvelope>>,
    }

    impl RecordingSignaling {
        fn count(&self, kind: SignalKind) -> usize {
            self.sent.lock().iter().filter(|e| e.kind == kind).count()
        }
    }

    #[async_trait]
    impl SignalingTransport for RecordingSignaling {
        async fn send(&self, envelope: SignalingEnvelope) -> Result<()> {
            self.sent.lock().push(envelope);
            Ok(())
        }
    }

    fn fast_config() -> ProtocolConfig {
        ProtocolConfig {
            signaling: SignalingConfig {
                join_announce_attempts: 3,
                join_announce_interval_ms: 20,
                offer_resend_attempts: 5,
                offer_resend_interval_ms: 20,
            },
            ..Default::default()
        }
    }

    fn make_manager() -> (
        ConnectionManager,
        Arc<RecordingSignaling>,
        mpsc::Receiver<ManagerEvent>,
    ) {
        let signaling = Arc::new(RecordingSignaling::default());
        let (event_tx, events) = mpsc::channel(64);
        let manager = ConnectionManager::new(
            PeerId::from_string("local-device"),
            fast_config(),
            Arc::clone(&signaling) as Arc<dyn SignalingTransport>,
            event_tx,
        )
        .unwrap();
        (manager, signaling, events)
    }

    #[tokio::test]
    async fn test_join_announces_bounded_then_fails() {
        let (manager, signaling, mut events) = make_manager();
        let session = SessionId::from_string("s-join");

        manager.join(session.clone()).await.unwrap();
        assert_eq!(manager.state(&session), ConnectionState::Waiting);

        // let all 3 attempts elapse
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(signaling.count(SignalKind::Join), 3);
        assert_eq!(manager.state(&session), ConnectionState::Failed);

        // events: Waiting, then Failed
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ManagerEvent::StateChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(states, vec![ConnectionState::Waiting, ConnectionState::Failed]);
    }

    #[tokio::test]
    async fn test_offer_resends_stop_on_answer() {
        let (manager, signaling, _events) = make_manager();
        let session = SessionId::from_string("s-offer");

        manager
            .send_offer(session.clone(), "v=0 local-sdp".to_string())
            .await
            .unwrap();
        assert_eq!(manager.state(&session), ConnectionState::Connecting);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let before_answer = signaling.count(SignalKind::Offer);
        assert!(before_answer >= 1);

        manager
            .handle_envelope(SignalingEnvelope::new(
                session.as_str(),
                PeerId::from_string("remote-device"),
                SignalKind::Answer,
                SignalPayload::sdp("v=0 remote-sdp"),
            ))
            .await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        // at most one more send could have been in flight when the answer landed
        assert!(signaling.count(SignalKind::Offer) <= before_answer + 1);
        // resends never ran to exhaustion
        assert_ne!(manager.state(&session), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_envelopes_route_to_events() {
        let (manager, _signaling, mut events) = make_manager();

        manager
            .handle_envelope(SignalingEnvelope::new(
                "s-route",
                PeerId::from_string("remote-device"),
                SignalKind::Offer,
                SignalPayload::sdp("v=0"),
            ))
            .await;

        match events.recv().await.unwrap() {
            ManagerEvent::RemoteOffer { session_id, from, payload } => {
                assert_eq!(session_id.as_str(), "s-route");
                assert_eq!(from.as_str(), "remote-device");
                assert_eq!(payload.sdp.as_deref(), Some("v=0"));
            }
            other => panic!("expected remote offer, got {other:?}"),
        }

        // our own echoes are dropped
        manager
            .handle_envelope(SignalingEnvelope::new(
                "s-route",
                PeerId::from_string("local-device"),
                SignalKind::Offer,
                SignalPayload::sdp("v=0"),
            ))
            .await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_attach_transport_runs_session() {
        let (manager, _signaling, mut events) = make_manager();
        let session = SessionId::from_string("s-attach");

        let (a, b) = duplex_pair();
        let handle = manager
            .attach_transport(
                session.clone(),
                HandshakeRole::Initiator,
                SigningKeyPair::generate(),
                a,
            )
            .unwrap();
        assert_eq!(manager.state(&session), ConnectionState::Connected);
        assert!(manager.session(&session).is_some());

        // peer side runs a bare session task
        let (peer_tx, _peer_events) = mpsc::channel(64);
        let _peer = spawn_session(
            ProtocolConfig::default(),
            HandshakeRole::Responder,
            SigningKeyPair::generate(),
            b,
            peer_tx,
        )
        .unwrap();

        // establishment surfaces through the manager's event stream
        loop {
            match events.recv().await.unwrap() {
                ManagerEvent::Session {
                    session_id,
                    event: SessionEvent::Established { .. },
                } => {
                    assert_eq!(session_id, session);
                    break;
                }
                _ => continue,
            }
        }

        handle.send_message(b"via manager".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent_and_announces_leave() {
        let (manager, signaling, _events) = make_manager();
        let session = SessionId::from_string("s-bye");

        manager.join(session.clone()).await.unwrap();
        manager.teardown(&session).await;
        manager.teardown(&session).await;
        manager.teardown(&session).await;

        assert_eq!(manager.state(&session), ConnectionState::Idle);
        // exactly one leave despite repeated teardowns
        assert_eq!(signaling.count(SignalKind::Leave), 1);

        // announcements stop once torn down
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(signaling.count(SignalKind::Join) <= 1);
    }

    #[tokio::test]
    async fn test_remote_leave_tears_down() {
        let (manager, signaling, _events) = make_manager();
        let session = SessionId::from_string("s-left");

        manager.join(session.clone()).await.unwrap();
        manager
            .handle_envelope(SignalingEnvelope::new(
                session.as_str(),
                PeerId::from_string("remote-device"),
                SignalKind::Leave,
                SignalPayload::default(),
            ))
            .await;

        assert_eq!(manager.state(&session), ConnectionState::Idle);
        assert_eq!(signaling.count(SignalKind::Leave), 1);
    }

    #[tokio::test]
    async fn test_double_join_rejected() {
        let (manager, _signaling, _events) = make_manager();
        let session = SessionId::from_string("s-twice");

        manager.join(session.clone()).await.unwrap();
        assert!(matches!(
            manager.join(session).await,
            Err(ProtocolError::InvalidState(_))
        ));
    }
}
