//! Chunked, resumable, verified file transfer
//!
//! Both directions ride the established secure channel as
//! [`TransferMessage`] payloads. The sender streams chunks sequentially
//! with one chunk in flight, bounded per-chunk retries, and a final
//! `complete` carrying the whole-file hash, the Merkle root over the
//! ordered chunk hashes, and a keyed MAC binding both to the transfer id.
//! The receiver writes chunks into a partial artifact, verifies whatever
//! of the Merkle root, root MAC, and file hash the sender supplied, in
//! that order, and only then renames the artifact to its destination.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use peerlink_core::message::{TransferMessage, TransferOp, ROOT_SIGNATURE_ALG};
use peerlink_core::types::TransferId;
use peerlink_crypto::kdf::{compute_auth_tag, verify_auth_tag};

use crate::config::TransferConfig;
use crate::error::TransferError;

/// Compute the Merkle root over ordered chunk hashes.
///
/// Pairs are hashed left-to-right; an odd node at any level is paired with
/// itself. A single chunk's root is its own hash; an empty file's root is
/// all zeros.
pub fn merkle_root(hashes: &[[u8; 32]]) -> [u8; 32] {
    if hashes.is_empty() {
        return [0u8; 32];
    }
    let mut level = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            let mut hasher = Sha256::new();
            hasher.update(pair[0]);
            hasher.update(right);
            let mut out = [0u8; 32];
            out.copy_from_slice(&hasher.finalize());
            next.push(out);
        }
        level = next;
    }
    level[0]
}

/// SHA-256 of a byte slice
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// The bytes the root MAC covers: transfer id, Merkle root, file hash
fn root_signature_data(
    transfer_id: &TransferId,
    root: &[u8; 32],
    file_hash: &[u8; 32],
) -> Vec<u8> {
    let id = transfer_id.as_str().as_bytes();
    let mut data = Vec::with_capacity(id.len() + 64);
    data.extend_from_slice(id);
    data.extend_from_slice(root);
    data.extend_from_slice(file_hash);
    data
}

/// Key used to correlate an acknowledgment with its waiter
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum AckKey {
    Metadata(TransferId),
    Chunk(TransferId, u32),
    Complete(TransferId),
}

#[derive(Default)]
struct AckInner {
    waiters: Mutex<HashMap<AckKey, oneshot::Sender<TransferMessage>>>,
    closed: AtomicBool,
}

/// Routes inbound acknowledgments to the sender tasks awaiting them
#[derive(Clone, Default)]
pub struct AckRegistry {
    inner: Arc<AckInner>,
}

impl AckRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, key: AckKey) -> Result<oneshot::Receiver<TransferMessage>, TransferError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransferError::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        // a re-registered key drops the stale waiter
        self.inner.waiters.lock().insert(key, tx);
        Ok(rx)
    }

    /// Deliver an inbound message to its waiter. Returns `true` when a
    /// waiter consumed it; `false` means it belongs to the receive side.
    pub fn resolve(&self, msg: &TransferMessage) -> bool {
        let key = match msg.op {
            TransferOp::MetadataAck => AckKey::Metadata(msg.transfer_id.clone()),
            // a chunkAck without an index answers a premature `complete`
            TransferOp::ChunkAck => match msg.chunk_index {
                Some(index) => AckKey::Chunk(msg.transfer_id.clone(), index),
                None => AckKey::Complete(msg.transfer_id.clone()),
            },
            TransferOp::CompleteAck => AckKey::Complete(msg.transfer_id.clone()),
            // a chunk-scoped error asks for a retry of that chunk only
            TransferOp::Error => match msg.chunk_index {
                Some(index) => AckKey::Chunk(msg.transfer_id.clone(), index),
                None => return self.fail_transfer(&msg.transfer_id, msg),
            },
            // cancellation resolves every waiter of the transfer
            TransferOp::Cancel => {
                return self.fail_transfer(&msg.transfer_id, msg);
            }
            _ => return false,
        };

        match self.inner.waiters.lock().remove(&key) {
            Some(tx) => {
                let _ = tx.send(msg.clone());
                true
            }
            None => false,
        }
    }

    fn fail_transfer(&self, transfer_id: &TransferId, msg: &TransferMessage) -> bool {
        let mut waiters = self.inner.waiters.lock();
        let keys: Vec<AckKey> = waiters
            .keys()
            .filter(|key| match key {
                AckKey::Metadata(id) | AckKey::Chunk(id, _) | AckKey::Complete(id) => {
                    id == transfer_id
                }
            })
            .cloned()
            .collect();
        let resolved = !keys.is_empty();
        for key in keys {
            if let Some(tx) = waiters.remove(&key) {
                let _ = tx.send(msg.clone());
            }
        }
        resolved
    }

    /// Tear down: every present and future waiter observes a closed session
    pub fn fail_all(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.waiters.lock().clear();
    }
}

/// Streams one file to the peer over the session's outbound queue
pub struct TransferSender {
    config: TransferConfig,
    outbound: mpsc::Sender<TransferMessage>,
    acks: AckRegistry,
    send_key: [u8; 32],
}

impl TransferSender {
    /// Create a sender bound to a session's outbound queue and ack registry
    pub fn new(
        config: TransferConfig,
        outbound: mpsc::Sender<TransferMessage>,
        acks: AckRegistry,
        send_key: [u8; 32],
    ) -> Self {
        Self {
            config,
            outbound,
            acks,
            send_key,
        }
    }

    /// Send one file end to end: metadata, sequential chunks with bounded
    /// ack retries, then `complete` and its verification handshake.
    pub async fn send_file(
        &self,
        transfer_id: TransferId,
        path: &Path,
    ) -> Result<(), TransferError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::Io(format!("unusable file name: {}", path.display())))?
            .to_string();

        let mut file = File::open(path).await?;
        let file_size = file.metadata().await?.len();
        let chunk_size = self.config.chunk_size;
        let total_chunks = file_size.div_ceil(chunk_size as u64) as u32;

        debug!(
            transfer = %transfer_id,
            file = %file_name,
            size = file_size,
            chunks = total_chunks,
            "transfer starting"
        );

        self.announce(&transfer_id, &file_name, file_size, total_chunks)
            .await?;

        let mut chunk_hashes = Vec::with_capacity(total_chunks as usize);
        let mut file_hasher = Sha256::new();
        let mut buf = vec![0u8; chunk_size as usize];

        for index in 0..total_chunks {
            let remaining = file_size - index as u64 * chunk_size as u64;
            let this_len = remaining.min(chunk_size as u64) as usize;
            file.read_exact(&mut buf[..this_len]).await?;
            let data = buf[..this_len].to_vec();

            file_hasher.update(&data);
            let hash = sha256(&data);
            chunk_hashes.push(hash);

            self.send_chunk(&transfer_id, index, data, hash).await?;
        }

        let mut file_hash = [0u8; 32];
        file_hash.copy_from_slice(&file_hasher.finalize());
        let root = merkle_root(&chunk_hashes);
        let signature =
            compute_auth_tag(&self.send_key, &root_signature_data(&transfer_id, &root, &file_hash));

        self.finish(&transfer_id, file_hash, root, signature.to_vec(), |index| {
            let remaining = file_size - index as u64 * chunk_size as u64;
            (
                index as u64 * chunk_size as u64,
                remaining.min(chunk_size as u64) as usize,
            )
        }, path, &chunk_hashes)
        .await?;

        debug!(transfer = %transfer_id, "transfer complete");
        Ok(())
    }

    async fn announce(
        &self,
        transfer_id: &TransferId,
        file_name: &str,
        file_size: u64,
        total_chunks: u32,
    ) -> Result<(), TransferError> {
        let timeout = Duration::from_millis(self.config.chunk_ack_timeout_ms);
        for _ in 0..=self.config.chunk_retry_limit {
            let rx = self.acks.register(AckKey::Metadata(transfer_id.clone()))?;
            self.enqueue(TransferMessage::metadata(
                transfer_id.clone(),
                file_name.to_string(),
                file_size,
                self.config.chunk_size,
                total_chunks,
            ))
            .await?;

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) => return check_reply(reply),
                Ok(Err(_)) => return Err(TransferError::SessionClosed),
                Err(_) => continue,
            }
        }
        Err(TransferError::MetadataTimeout)
    }

    async fn send_chunk(
        &self,
        transfer_id: &TransferId,
        index: u32,
        data: Vec<u8>,
        hash: [u8; 32],
    ) -> Result<(), TransferError> {
        let timeout = Duration::from_millis(self.config.chunk_ack_timeout_ms);
        for attempt in 0..=self.config.chunk_retry_limit {
            if attempt > 0 {
                warn!(transfer = %transfer_id, index, attempt, "resending unacknowledged chunk");
            }
            let rx = self
                .acks
                .register(AckKey::Chunk(transfer_id.clone(), index))?;
            self.enqueue(TransferMessage::chunk(
                transfer_id.clone(),
                index,
                data.clone(),
                hash,
            ))
            .await?;

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) => {
                    // a chunk-scoped error is a retry request, not fatal
                    if reply.op == TransferOp::Error && reply.chunk_index == Some(index) {
                        warn!(transfer = %transfer_id, index, "receiver rejected chunk, retrying");
                        continue;
                    }
                    return check_reply(reply);
                }
                Ok(Err(_)) => return Err(TransferError::SessionClosed),
                Err(_) => continue,
            }
        }
        Err(TransferError::AckTimeout { index })
    }

    /// Send `complete` and settle the verification handshake. A chunkAck
    /// reply carrying a missing-chunks hint triggers a bounded
    /// resend-and-retry cycle.
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        transfer_id: &TransferId,
        file_hash: [u8; 32],
        root: [u8; 32],
        signature: Vec<u8>,
        chunk_span: impl Fn(u32) -> (u64, usize),
        path: &Path,
        chunk_hashes: &[[u8; 32]],
    ) -> Result<(), TransferError> {
        // the receiver may hold the ack until its completion watchdog settles
        let timeout = Duration::from_millis(
            self.config.completion_watchdog_ms + self.config.chunk_ack_timeout_ms,
        );
        let mut last_missing = 0usize;

        for _ in 0..=self.config.chunk_retry_limit {
            let rx = self.acks.register(AckKey::Complete(transfer_id.clone()))?;
            self.enqueue(TransferMessage::complete(
                transfer_id.clone(),
                file_hash,
                root,
                signature.clone(),
            ))
            .await?;

            let reply = match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => return Err(TransferError::SessionClosed),
                Err(_) => continue,
            };

            match reply.op {
                TransferOp::CompleteAck => return Ok(()),
                TransferOp::ChunkAck => {
                    let missing = reply.missing_chunks.unwrap_or_default();
                    if missing.is_empty() {
                        continue;
                    }
                    last_missing = missing.len();
                    warn!(
                        transfer = %transfer_id,
                        missing = missing.len(),
                        "receiver reports missing chunks, resending"
                    );
                    let mut file = File::open(path).await?;
                    for index in missing {
                        let hash = *chunk_hashes.get(index as usize).ok_or(
                            TransferError::Rejected(format!(
                                "receiver requested out-of-range chunk {index}"
                            )),
                        )?;
                        let (offset, len) = chunk_span(index);
                        let mut data = vec![0u8; len];
                        file.seek(SeekFrom::Start(offset)).await?;
                        file.read_exact(&mut data).await?;
                        self.send_chunk(transfer_id, index, data, hash).await?;
                    }
                }
                _ => return check_reply(reply),
            }
        }
        Err(TransferError::Incomplete {
            missing: last_missing,
        })
    }

    async fn enqueue(&self, msg: TransferMessage) -> Result<(), TransferError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| TransferError::SessionClosed)
    }
}

/// Map an error/cancel reply to the matching failure
fn check_reply(reply: TransferMessage) -> Result<(), TransferError> {
    match reply.op {
        TransferOp::Error => Err(TransferError::Rejected(
            reply.message.unwrap_or_else(|| "unspecified".to_string()),
        )),
        TransferOp::Cancel => Err(TransferError::Cancelled),
        _ => Ok(()),
    }
}

/// Progress events the session surfaces to its owner
#[derive(Debug)]
pub enum TransferProgress {
    /// Metadata accepted; the partial artifact exists
    Started {
        /// Transfer id
        id: TransferId,
        /// Declared file name
        file_name: String,
        /// Declared size in bytes
        file_size: u64,
    },
    /// Verification passed and the artifact was renamed into place
    Completed {
        /// Transfer id
        id: TransferId,
        /// Final artifact path
        path: PathBuf,
    },
    /// Transfer failed; partial state was discarded
    Failed {
        /// Transfer id
        id: TransferId,
        /// What went wrong
        reason: String,
    },
}

/// What the session must do after the receiver consumed a message
#[derive(Default)]
pub struct ReceiverOutcome {
    /// Messages to send back over the channel
    pub replies: Vec<TransferMessage>,
    /// Events to surface to the session owner
    pub events: Vec<TransferProgress>,
    /// Start a completion watchdog for this transfer
    pub arm_watchdog: Option<TransferId>,
}

/// Verification material from a `complete`, kept for the watchdog. Every
/// stage is optional; only supplied material is verified.
struct PendingComplete {
    file_sha256: Option<[u8; 32]>,
    merkle_root: Option<[u8; 32]>,
    signature: Option<Vec<u8>>,
}

struct InboundTransfer {
    file_name: String,
    file_size: u64,
    chunk_size: u32,
    total_chunks: u32,
    chunk_hashes: HashMap<u32, [u8; 32]>,
    received: HashSet<u32>,
    received_bytes: u64,
    partial_path: PathBuf,
    file: File,
    pending_complete: Option<PendingComplete>,
}

impl InboundTransfer {
    fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|index| !self.received.contains(index))
            .collect()
    }
}

/// Receives inbound transfers for one session
pub struct TransferReceiver {
    config: TransferConfig,
    recv_key: [u8; 32],
    transfers: HashMap<TransferId, InboundTransfer>,
}

impl TransferReceiver {
    /// Create a receiver keyed for root-MAC verification
    pub fn new(config: TransferConfig, recv_key: [u8; 32]) -> Self {
        Self {
            config,
            recv_key,
            transfers: HashMap::new(),
        }
    }

    /// Consume one inbound transfer message
    pub async fn handle_message(&mut self, msg: TransferMessage) -> ReceiverOutcome {
        match msg.op {
            TransferOp::Metadata => self.on_metadata(msg).await,
            TransferOp::Chunk => self.on_chunk(msg).await,
            TransferOp::Complete => self.on_complete(msg).await,
            TransferOp::Cancel => {
                self.abandon(&msg.transfer_id, "cancelled by peer", false)
                    .await
            }
            TransferOp::Error => {
                let reason = msg
                    .message
                    .unwrap_or_else(|| "peer reported an error".to_string());
                self.abandon(&msg.transfer_id, &reason, false).await
            }
            // sender-side replies never reach the receiver; the session
            // routes them through the ack registry first
            _ => ReceiverOutcome::default(),
        }
    }

    /// The completion watchdog for `transfer_id` elapsed.
    ///
    /// If the transfer became complete in the meantime, verification runs
    /// with the retained material; otherwise the transfer fails.
    pub async fn watchdog_fired(&mut self, transfer_id: &TransferId) -> ReceiverOutcome {
        let Some(transfer) = self.transfers.get(transfer_id) else {
            return ReceiverOutcome::default();
        };

        let missing = transfer.missing_chunks();
        if missing.is_empty() && transfer.pending_complete.is_some() {
            return self.verify_and_finish(transfer_id).await;
        }

        warn!(
            transfer = %transfer_id,
            missing = missing.len(),
            "completion watchdog fired with chunks still missing"
        );
        let reason = TransferError::Incomplete {
            missing: missing.len(),
        }
        .to_string();
        self.abandon(transfer_id, &reason, true).await
    }

    /// Discard all partial state, deleting partial artifacts. Used on
    /// session teardown.
    pub async fn cleanup(&mut self) {
        for (id, transfer) in self.transfers.drain() {
            debug!(transfer = %id, "discarding partial artifact on teardown");
            let _ = tokio::fs::remove_file(&transfer.partial_path).await;
        }
    }

    async fn on_metadata(&mut self, msg: TransferMessage) -> ReceiverOutcome {
        let id = msg.transfer_id.clone();

        // duplicate metadata re-acks with current progress
        if let Some(transfer) = self.transfers.get(&id) {
            return ReceiverOutcome {
                replies: vec![TransferMessage::metadata_ack(id, transfer.received_bytes)],
                ..Default::default()
            };
        }

        let (Some(file_name), Some(file_size), Some(chunk_size), Some(total_chunks)) =
            (msg.file_name, msg.file_size, msg.chunk_size, msg.total_chunks)
        else {
            return error_reply(id, "metadata is missing required fields");
        };
        if chunk_size == 0 || u64::from(total_chunks) != file_size.div_ceil(chunk_size as u64) {
            return error_reply(id, "metadata chunk geometry is inconsistent");
        }

        let partial_path = self.config.download_dir.join(format!(".{}.part", id));
        let file = match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&partial_path)
            .await
        {
            Ok(file) => file,
            Err(err) => return error_reply(id, format!("cannot create partial artifact: {err}")),
        };

        debug!(transfer = %id, file = %file_name, size = file_size, "inbound transfer accepted");
        let started = TransferProgress::Started {
            id: id.clone(),
            file_name: file_name.clone(),
            file_size,
        };
        self.transfers.insert(
            id.clone(),
            InboundTransfer {
                file_name,
                file_size,
                chunk_size,
                total_chunks,
                chunk_hashes: HashMap::new(),
                received: HashSet::new(),
                received_bytes: 0,
                partial_path,
                file,
                pending_complete: None,
            },
        );

        ReceiverOutcome {
            replies: vec![TransferMessage::metadata_ack(id, 0)],
            events: vec![started],
            ..Default::default()
        }
    }

    async fn on_chunk(&mut self, msg: TransferMessage) -> ReceiverOutcome {
        let id = msg.transfer_id.clone();
        let Some(transfer) = self.transfers.get_mut(&id) else {
            return error_reply(id.clone(), TransferError::UnknownTransfer(id.to_string()));
        };

        let (Some(index), Some(data), Some(declared_hash)) =
            (msg.chunk_index, msg.chunk_data, msg.chunk_sha256)
        else {
            return error_reply(id, "chunk is missing required fields");
        };
        if index >= transfer.total_chunks {
            return error_reply(id, format!("chunk index {index} out of range"));
        }

        // a corrupt chunk is never accounted; the chunk-scoped error tells
        // the sender to resend it without waiting out the ack timeout
        if sha256(&data) != declared_hash {
            warn!(transfer = %id, index, "chunk hash mismatch, requesting retry");
            let mut reply = TransferMessage::error(id, format!("chunk {index} hash mismatch"));
            reply.chunk_index = Some(index);
            return ReceiverOutcome {
                replies: vec![reply],
                ..Default::default()
            };
        }

        // duplicates re-ack without re-accounting
        if !transfer.received.contains(&index) {
            let offset = index as u64 * transfer.chunk_size as u64;
            if let Err(err) = write_chunk_at(&mut transfer.file, offset, &data).await {
                let reason = format!("cannot write chunk {index}: {err}");
                return self.abandon(&id, &reason, true).await;
            }
            transfer.received.insert(index);
            transfer.chunk_hashes.insert(index, declared_hash);
            transfer.received_bytes += data.len() as u64;
        }

        let received_bytes = transfer.received_bytes;
        ReceiverOutcome {
            replies: vec![TransferMessage::chunk_ack(id, Some(index), received_bytes)],
            ..Default::default()
        }
    }

    async fn on_complete(&mut self, msg: TransferMessage) -> ReceiverOutcome {
        let id = msg.transfer_id.clone();
        let Some(transfer) = self.transfers.get_mut(&id) else {
            return error_reply(id.clone(), TransferError::UnknownTransfer(id.to_string()));
        };

        // verification material is optional, but a signature only makes
        // sense with the fields it covers
        if msg.merkle_root_signature.is_some() {
            if msg.merkle_root_signature_alg.as_deref() != Some(ROOT_SIGNATURE_ALG) {
                return error_reply(id, "unsupported root signature algorithm");
            }
            if msg.merkle_root.is_none() || msg.file_sha256.is_none() {
                return error_reply(id, "root signature without the fields it covers");
            }
        }

        transfer.pending_complete = Some(PendingComplete {
            file_sha256: msg.file_sha256,
            merkle_root: msg.merkle_root,
            signature: msg.merkle_root_signature,
        });

        let missing = transfer.missing_chunks();
        if !missing.is_empty() {
            debug!(
                transfer = %id,
                missing = missing.len(),
                "premature complete, hinting missing chunks and arming watchdog"
            );
            let received_bytes = transfer.received_bytes;
            let mut hint = TransferMessage::chunk_ack(id.clone(), None, received_bytes);
            hint.missing_chunks = Some(missing);
            return ReceiverOutcome {
                replies: vec![hint],
                arm_watchdog: Some(id),
                ..Default::default()
            };
        }

        self.verify_and_finish(&id).await
    }

    /// All chunks present: whichever of Merkle root, root MAC, and
    /// whole-file hash the sender supplied is verified, in that order.
    /// Only then is the artifact renamed into place.
    async fn verify_and_finish(&mut self, id: &TransferId) -> ReceiverOutcome {
        let Some(transfer) = self.transfers.get_mut(id) else {
            return ReceiverOutcome::default();
        };
        let Some(pending) = transfer.pending_complete.take() else {
            return ReceiverOutcome::default();
        };

        if let Some(expected_root) = pending.merkle_root {
            let ordered: Vec<[u8; 32]> = (0..transfer.total_chunks)
                .map(|index| transfer.chunk_hashes[&index])
                .collect();
            if merkle_root(&ordered) != expected_root {
                let reason = TransferError::MerkleMismatch.to_string();
                return self.abandon(id, &reason, true).await;
            }
        }

        if let Some(signature) = &pending.signature {
            // `on_complete` admits a signature only with the fields it covers
            let (Some(root), Some(file_hash)) = (pending.merkle_root, pending.file_sha256)
            else {
                return self
                    .abandon(id, "root signature without the fields it covers", true)
                    .await;
            };
            let data = root_signature_data(id, &root, &file_hash);
            if !verify_auth_tag(&self.recv_key, &data, signature) {
                let reason = TransferError::RootSignatureMismatch.to_string();
                return self.abandon(id, &reason, true).await;
            }
        }

        if let Err(err) = transfer.file.flush().await {
            let reason = format!("cannot flush partial artifact: {err}");
            return self.abandon(id, &reason, true).await;
        }
        if let Some(expected) = pending.file_sha256 {
            let actual = match hash_file(&transfer.partial_path).await {
                Ok(hash) => hash,
                Err(err) => {
                    let reason = format!("cannot re-read partial artifact: {err}");
                    return self.abandon(id, &reason, true).await;
                }
            };
            if actual != expected {
                let reason = TransferError::FileHashMismatch.to_string();
                return self.abandon(id, &reason, true).await;
            }
        }

        let destination =
            match unique_destination(&self.config.download_dir, &transfer.file_name).await {
                Ok(path) => path,
                Err(err) => {
                    let reason = format!("cannot place artifact: {err}");
                    return self.abandon(id, &reason, true).await;
                }
            };
        if let Err(err) = tokio::fs::rename(&transfer.partial_path, &destination).await {
            let reason = format!("cannot rename artifact: {err}");
            return self.abandon(id, &reason, true).await;
        }

        debug!(transfer = %id, path = %destination.display(), "transfer verified and persisted");
        let received_bytes = transfer.received_bytes;
        self.transfers.remove(id);

        ReceiverOutcome {
            replies: vec![TransferMessage::complete_ack(id.clone(), received_bytes)],
            events: vec![TransferProgress::Completed {
                id: id.clone(),
                path: destination,
            }],
            ..Default::default()
        }
    }

    /// Drop the transfer, delete its partial artifact, surface a failure
    /// event, and optionally notify the peer.
    async fn abandon(
        &mut self,
        id: &TransferId,
        reason: &str,
        notify_peer: bool,
    ) -> ReceiverOutcome {
        let Some(transfer) = self.transfers.remove(id) else {
            return ReceiverOutcome::default();
        };
        drop(transfer.file);
        let _ = tokio::fs::remove_file(&transfer.partial_path).await;

        warn!(transfer = %id, reason, "inbound transfer abandoned");
        ReceiverOutcome {
            replies: if notify_peer {
                vec![TransferMessage::error(id.clone(), reason)]
            } else {
                Vec::new()
            },
            events: vec![TransferProgress::Failed {
                id: id.clone(),
                reason: reason.to_string(),
            }],
            ..Default::default()
        }
    }
}

fn error_reply(id: TransferId, reason: impl ToString) -> ReceiverOutcome {
    ReceiverOutcome {
        replies: vec![TransferMessage::error(id, reason.to_string())],
        ..Default::default()
    }
}

async fn write_chunk_at(file: &mut File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await
}

async fn hash_file(path: &Path) -> std::io::Result<[u8; 32]> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Ok(out)
}

/// Pick a destination path that does not collide with an existing file by
/// appending " (n)" before the extension.
async fn unique_destination(dir: &Path, file_name: &str) -> std::io::Result<PathBuf> {
    let candidate = dir.join(file_name);
    if !tokio::fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }

    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    };
    for n in 1..10_000u32 {
        let renamed = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(renamed);
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "no free destination name",
    ))
}
