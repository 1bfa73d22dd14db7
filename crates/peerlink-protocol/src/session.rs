//! Session task: one task owns each session end to end
//!
//! The task multiplexes the transport, caller commands, and outbound
//! transfer traffic in a single select loop, so handshake state, the
//! secure channel, and transfer state never need shared-memory locking.
//! Callers hold a cheap [`SessionHandle`] that sends commands over a
//! channel and observe the session through [`SessionEvent`]s.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use peerlink_core::framing::{encode_frame, pad, unpad, FrameCodec};
use peerlink_core::message::{ChannelPayload, TransferMessage};
use peerlink_core::types::{TransferId, Timestamp};
use peerlink_core::wire::is_handshake_frame;
use peerlink_crypto::keys::SigningKeyPair;

use crate::channel::SecureChannel;
use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, Result, TransferError};
use crate::handshake::{HandshakeDriver, HandshakeEvent, HandshakeRole};
use crate::transfer::{AckRegistry, TransferProgress, TransferReceiver, TransferSender};
use crate::transport::Transport;

/// What the session reports to its owner
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake complete; the channel is usable
    Established {
        /// Negotiated suite wire id
        suite_id: u16,
    },
    /// Decrypted application message from the peer
    Message(Vec<u8>),
    /// Keepalive from the peer
    HeartbeatReceived {
        /// Peer's heartbeat counter
        seq: u64,
    },
    /// Inbound file transfer progress
    Transfer(TransferProgress),
    /// The session was torn down; terminal
    Closed {
        /// Why the session ended
        reason: String,
    },
}

enum Command {
    SendMessage(Vec<u8>, oneshot::Sender<Result<()>>),
    SendFile(PathBuf, oneshot::Sender<Result<TransferId>>),
    Heartbeat(oneshot::Sender<Result<u64>>),
    WatchdogFired(TransferId),
    Close,
}

/// Caller-side handle to a running session task
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
    closed: Arc<AtomicBool>,
    last_remote_activity: Arc<AtomicI64>,
}

impl SessionHandle {
    /// Encrypt and send one application message
    pub async fn send_message(&self, bytes: Vec<u8>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendMessage(bytes, tx))
            .await
            .map_err(|_| ProtocolError::SessionClosed)?;
        rx.await.map_err(|_| ProtocolError::SessionClosed)?
    }

    /// Send a file, resolving once the peer verified and persisted it
    pub async fn send_file(&self, path: PathBuf) -> Result<TransferId> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendFile(path, tx))
            .await
            .map_err(|_| ProtocolError::SessionClosed)?;
        rx.await.map_err(|_| ProtocolError::SessionClosed)?
    }

    /// Send a keepalive; rate limited by the configured minimum interval
    pub async fn send_heartbeat(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Heartbeat(tx))
            .await
            .map_err(|_| ProtocolError::SessionClosed)?;
        rx.await.map_err(|_| ProtocolError::SessionClosed)?
    }

    /// Tear the session down. Idempotent; a second call is a no-op.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }

    /// Whether the session has been torn down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// When the peer last sent authenticated traffic, if it ever has.
    /// Heartbeats, messages, and transfer traffic all count.
    pub fn last_remote_activity(&self) -> Option<Timestamp> {
        match self.last_remote_activity.load(Ordering::SeqCst) {
            0 => None,
            millis => Some(Timestamp::from_millis(millis)),
        }
    }
}

/// Spawn the session task over a transport.
///
/// The initiator side sends its opening handshake frame immediately.
pub fn spawn_session<T>(
    config: ProtocolConfig,
    role: HandshakeRole,
    signing: SigningKeyPair,
    transport: T,
    event_tx: mpsc::Sender<SessionEvent>,
) -> Result<SessionHandle>
where
    T: Transport + 'static,
{
    config.validate()?;

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (transfer_tx, transfer_rx) = mpsc::channel(64);
    let closed = Arc::new(AtomicBool::new(false));
    // zero means the peer has not sent authenticated traffic yet
    let last_remote_activity = Arc::new(AtomicI64::new(0));
    let transport: Arc<dyn Transport> = Arc::new(transport);

    let state = SessionState {
        driver: HandshakeDriver::with_signing_keys(role, config.policy.clone(), signing),
        role,
        config,
        transport: Arc::clone(&transport),
        codec: FrameCodec::new(),
        channel: None,
        receiver: None,
        acks: AckRegistry::new(),
        event_tx,
        cmd_tx: cmd_tx.clone(),
        transfer_tx,
        closed: Arc::clone(&closed),
        heartbeat_seq: 0,
        last_heartbeat: None,
        last_remote_activity: Arc::clone(&last_remote_activity),
    };

    tokio::spawn(run(state, transport, cmd_rx, transfer_rx));

    Ok(SessionHandle {
        cmd_tx,
        closed,
        last_remote_activity,
    })
}

struct SessionState {
    driver: HandshakeDriver,
    role: HandshakeRole,
    config: ProtocolConfig,
    transport: Arc<dyn Transport>,
    codec: FrameCodec,
    channel: Option<SecureChannel>,
    receiver: Option<TransferReceiver>,
    acks: AckRegistry,
    event_tx: mpsc::Sender<SessionEvent>,
    cmd_tx: mpsc::Sender<Command>,
    transfer_tx: mpsc::Sender<TransferMessage>,
    closed: Arc<AtomicBool>,
    heartbeat_seq: u64,
    last_heartbeat: Option<Instant>,
    last_remote_activity: Arc<AtomicI64>,
}

async fn run(
    mut state: SessionState,
    transport: Arc<dyn Transport>,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut transfer_rx: mpsc::Receiver<TransferMessage>,
) {
    if state.role == HandshakeRole::Initiator {
        let opening = match state.driver.start() {
            Ok(frame) => frame,
            Err(err) => {
                state.teardown(err.to_string()).await;
                return;
            }
        };
        if let Err(err) = state.send_frame(&opening).await {
            state.teardown(err.to_string()).await;
            return;
        }
    }

    loop {
        tokio::select! {
            delivery = transport.recv() => match delivery {
                Some(bytes) => {
                    if let Err(err) = state.on_bytes(&bytes).await {
                        state.teardown(err.to_string()).await;
                        return;
                    }
                }
                None => {
                    state.teardown("transport closed".to_string()).await;
                    return;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Close) | None => {
                    state.teardown("closed locally".to_string()).await;
                    return;
                }
                Some(cmd) => state.on_command(cmd).await,
            },
            Some(msg) = transfer_rx.recv() => {
                if let Err(err) = state.send_transfer(msg).await {
                    state.teardown(err.to_string()).await;
                    return;
                }
            }
        }
    }
}

impl SessionState {
    async fn on_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.codec.push(bytes);
        while let Some(frame) = self.codec.next_frame()? {
            let payload = if self.config.enable_padding {
                unpad(&frame)?
            } else {
                frame
            };
            self.on_frame(&payload).await?;
        }
        Ok(())
    }

    async fn on_frame(&mut self, payload: &[u8]) -> Result<()> {
        if self.channel.is_none() || is_handshake_frame(payload) {
            return self.on_handshake_frame(payload).await;
        }

        // channel present and not a handshake tag: must decrypt, and a
        // failure to do so is session-fatal
        let channel = match &self.channel {
            Some(channel) => channel,
            None => return Err(ProtocolError::InvalidState("no channel".to_string())),
        };
        let inner = channel.open(payload)?;
        self.on_payload(inner).await
    }

    async fn on_handshake_frame(&mut self, payload: &[u8]) -> Result<()> {
        match self.driver.handle_frame(payload)? {
            HandshakeEvent::Ignored => Ok(()),
            HandshakeEvent::Send(frame) => self.send_frame(&frame).await,
            HandshakeEvent::Established { keys, reply } => {
                if let Some(frame) = reply {
                    self.send_frame(&frame).await?;
                }
                let suite_id = keys.suite_id;
                let channel = SecureChannel::new(keys)?;
                self.receiver = Some(TransferReceiver::new(
                    self.config.transfer.clone(),
                    channel.recv_key(),
                ));
                self.channel = Some(channel);
                debug!(suite = format_args!("{suite_id:#06x}"), "session established");
                self.emit(SessionEvent::Established { suite_id }).await;
                Ok(())
            }
        }
    }

    async fn on_payload(&mut self, payload: ChannelPayload) -> Result<()> {
        self.last_remote_activity
            .store(Timestamp::now().as_millis(), Ordering::SeqCst);
        match payload {
            ChannelPayload::Message(bytes) => {
                self.emit(SessionEvent::Message(bytes)).await;
                Ok(())
            }
            ChannelPayload::Heartbeat { seq, .. } => {
                self.emit(SessionEvent::HeartbeatReceived { seq }).await;
                Ok(())
            }
            ChannelPayload::Transfer(msg) => {
                // sender-side acknowledgments first; everything else is
                // receive-side transfer traffic
                if self.acks.resolve(&msg) {
                    return Ok(());
                }
                let Some(receiver) = self.receiver.as_mut() else {
                    return Ok(());
                };
                let outcome = receiver.handle_message(msg).await;
                self.apply_receiver_outcome(outcome).await
            }
        }
    }

    async fn apply_receiver_outcome(
        &mut self,
        outcome: crate::transfer::ReceiverOutcome,
    ) -> Result<()> {
        for reply in outcome.replies {
            self.send_transfer(reply).await?;
        }
        for event in outcome.events {
            self.emit(SessionEvent::Transfer(event)).await;
        }
        if let Some(id) = outcome.arm_watchdog {
            let cmd_tx = self.cmd_tx.clone();
            let grace = Duration::from_millis(self.config.transfer.completion_watchdog_ms);
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = cmd_tx.send(Command::WatchdogFired(id)).await;
            });
        }
        Ok(())
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::SendMessage(bytes, reply) => {
                let result = self.seal_and_send(&ChannelPayload::Message(bytes)).await;
                let _ = reply.send(result);
            }
            Command::SendFile(path, reply) => {
                self.start_transfer(path, reply);
            }
            Command::Heartbeat(reply) => {
                let _ = reply.send(self.send_heartbeat().await);
            }
            Command::WatchdogFired(id) => {
                if let Some(receiver) = self.receiver.as_mut() {
                    let outcome = receiver.watchdog_fired(&id).await;
                    if let Err(err) = self.apply_receiver_outcome(outcome).await {
                        self.teardown(err.to_string()).await;
                    }
                }
            }
            // handled in the select loop
            Command::Close => {}
        }
    }

    fn start_transfer(&mut self, path: PathBuf, reply: oneshot::Sender<Result<TransferId>>) {
        let Some(channel) = &self.channel else {
            let _ = reply.send(Err(ProtocolError::InvalidState(
                "session not established".to_string(),
            )));
            return;
        };

        let sender = TransferSender::new(
            self.config.transfer.clone(),
            self.transfer_tx.clone(),
            self.acks.clone(),
            channel.send_key(),
        );
        let transfer_tx = self.transfer_tx.clone();
        let id = TransferId::new();

        tokio::spawn(async move {
            let result = sender.send_file(id.clone(), &path).await;
            if let Err(ref err) = result {
                warn!(transfer = %id, error = %err, "outbound transfer failed");
                // best effort: tell the peer to discard its partial state
                if !matches!(err, TransferError::SessionClosed) {
                    let _ = transfer_tx.send(TransferMessage::cancel(id.clone())).await;
                }
            }
            let _ = reply.send(result.map(|_| id).map_err(ProtocolError::Transfer));
        });
    }

    async fn send_heartbeat(&mut self) -> Result<u64> {
        let min_interval = Duration::from_millis(self.config.heartbeat_min_interval_ms);
        if let Some(last) = self.last_heartbeat {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                return Err(ProtocolError::RateLimited {
                    retry_in_ms: (min_interval - elapsed).as_millis() as u64,
                });
            }
        }

        self.heartbeat_seq += 1;
        let seq = self.heartbeat_seq;
        self.seal_and_send(&ChannelPayload::Heartbeat {
            seq,
            timestamp_ms: Timestamp::now().as_millis(),
        })
        .await?;
        self.last_heartbeat = Some(Instant::now());
        Ok(seq)
    }

    async fn send_transfer(&mut self, msg: TransferMessage) -> Result<()> {
        self.seal_and_send(&ChannelPayload::Transfer(msg)).await
    }

    async fn seal_and_send(&mut self, payload: &ChannelPayload) -> Result<()> {
        let channel = self.channel.as_ref().ok_or_else(|| {
            ProtocolError::InvalidState("session not established".to_string())
        })?;
        let sealed = channel.seal(payload)?;
        self.send_frame(&sealed).await
    }

    async fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        let frame = if self.config.enable_padding {
            encode_frame(&pad(payload))?
        } else {
            encode_frame(payload)?
        };
        self.transport.send(&frame).await
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Idempotent teardown: first caller wins, everything after no-ops
    async fn teardown(&mut self, reason: String) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(reason, "session teardown");

        self.acks.fail_all();
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.cleanup().await;
        }
        self.channel = None;
        self.transport.close().await;
        self.emit(SessionEvent::Closed { reason }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::duplex_pair;
    use peerlink_crypto::suite::SUITE_HYBRID_X25519_KYBER768;

    fn test_config() -> ProtocolConfig {
        ProtocolConfig {
            heartbeat_min_interval_ms: 100,
            ..Default::default()
        }
    }

    async fn established_pair() -> (
        SessionHandle,
        mpsc::Receiver<SessionEvent>,
        SessionHandle,
        mpsc::Receiver<SessionEvent>,
    ) {
        let (a, b) = duplex_pair();
        let (a_events_tx, mut a_events) = mpsc::channel(64);
        let (b_events_tx, mut b_events) = mpsc::channel(64);

        let initiator = spawn_session(
            test_config(),
            HandshakeRole::Initiator,
            SigningKeyPair::generate(),
            a,
            a_events_tx,
        )
        .unwrap();
        let responder = spawn_session(
            test_config(),
            HandshakeRole::Responder,
            SigningKeyPair::generate(),
            b,
            b_events_tx,
        )
        .unwrap();

        for events in [&mut a_events, &mut b_events] {
            match events.recv().await.unwrap() {
                SessionEvent::Established { suite_id } => {
                    assert_eq!(suite_id, SUITE_HYBRID_X25519_KYBER768);
                }
                other => panic!("expected establishment, got {other:?}"),
            }
        }

        (initiator, a_events, responder, b_events)
    }

    #[tokio::test]
    async fn test_sessions_establish_and_exchange_messages() {
        let (initiator, mut a_events, responder, mut b_events) = established_pair().await;

        initiator.send_message(b"hello".to_vec()).await.unwrap();
        match b_events.recv().await.unwrap() {
            SessionEvent::Message(m) => assert_eq!(m, b"hello"),
            other => panic!("expected message, got {other:?}"),
        }

        responder.send_message(b"right back".to_vec()).await.unwrap();
        match a_events.recv().await.unwrap() {
            SessionEvent::Message(m) => assert_eq!(m, b"right back"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_before_establishment_fails() {
        let (a, _b) = duplex_pair();
        let (events_tx, _events) = mpsc::channel(64);
        let handle = spawn_session(
            test_config(),
            HandshakeRole::Responder,
            SigningKeyPair::generate(),
            a,
            events_tx,
        )
        .unwrap();

        assert!(matches!(
            handle.send_message(b"too soon".to_vec()).await,
            Err(ProtocolError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_rate_limited() {
        let (initiator, _a_events, _responder, mut b_events) = established_pair().await;

        let seq = initiator.send_heartbeat().await.unwrap();
        assert_eq!(seq, 1);
        match b_events.recv().await.unwrap() {
            SessionEvent::HeartbeatReceived { seq } => assert_eq!(seq, 1),
            other => panic!("expected heartbeat, got {other:?}"),
        }

        // immediate second heartbeat is refused with a retry hint
        match initiator.send_heartbeat().await {
            Err(ProtocolError::RateLimited { retry_in_ms }) => {
                assert!(retry_in_ms <= 100);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(initiator.send_heartbeat().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_remote_activity() {
        let (initiator, _a_events, responder, mut b_events) = established_pair().await;

        // handshake frames are not application traffic
        assert!(responder.last_remote_activity().is_none());

        initiator.send_heartbeat().await.unwrap();
        match b_events.recv().await.unwrap() {
            SessionEvent::HeartbeatReceived { seq } => assert_eq!(seq, 1),
            other => panic!("expected heartbeat, got {other:?}"),
        }

        let seen = responder
            .last_remote_activity()
            .expect("heartbeat must stamp last activity");
        assert!(seen.elapsed_millis() < 5_000);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_notifies_peer() {
        let (initiator, mut a_events, _responder, mut b_events) = established_pair().await;

        initiator.close().await;
        initiator.close().await;

        // exactly one Closed event locally
        match a_events.recv().await.unwrap() {
            SessionEvent::Closed { .. } => {}
            other => panic!("expected close, got {other:?}"),
        }
        assert!(a_events.recv().await.is_none());

        // the peer observes the dead transport and tears down too
        match b_events.recv().await.unwrap() {
            SessionEvent::Closed { .. } => {}
            other => panic!("expected close, got {other:?}"),
        }

        assert!(initiator.is_closed());
        assert!(initiator.send_message(b"after close".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_padding_enabled_end_to_end() {
        let config = ProtocolConfig {
            enable_padding: true,
            ..test_config()
        };
        let (a, b) = duplex_pair();
        let (a_events_tx, mut a_events) = mpsc::channel(64);
        let (b_events_tx, mut b_events) = mpsc::channel(64);

        let initiator = spawn_session(
            config.clone(),
            HandshakeRole::Initiator,
            SigningKeyPair::generate(),
            a,
            a_events_tx,
        )
        .unwrap();
        let _responder = spawn_session(
            config,
            HandshakeRole::Responder,
            SigningKeyPair::generate(),
            b,
            b_events_tx,
        )
        .unwrap();

        assert!(matches!(
            a_events.recv().await.unwrap(),
            SessionEvent::Established { .. }
        ));
        assert!(matches!(
            b_events.recv().await.unwrap(),
            SessionEvent::Established { .. }
        ));

        initiator.send_message(b"padded".to_vec()).await.unwrap();
        match b_events.recv().await.unwrap() {
            SessionEvent::Message(m) => assert_eq!(m, b"padded"),
            other => panic!("expected message, got {other:?}"),
        }
    }
}
