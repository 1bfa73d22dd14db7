//! Full-stack file transfer: handshake, encrypted chunk stream,
//! verification, and atomic placement of the received artifact.

use std::time::Duration;

use tokio::sync::mpsc;

use peerlink_core::types::TransferId;
use peerlink_crypto::keys::SigningKeyPair;
use peerlink_protocol::{
    duplex_pair, spawn_session, HandshakeRole, ProtocolConfig, SessionEvent, SessionHandle,
    TransferProgress,
};

async fn established_pair(
    sender_config: ProtocolConfig,
    receiver_config: ProtocolConfig,
) -> (
    SessionHandle,
    mpsc::Receiver<SessionEvent>,
    SessionHandle,
    mpsc::Receiver<SessionEvent>,
) {
    let (a, b) = duplex_pair();
    let (a_events_tx, mut a_events) = mpsc::channel(1024);
    let (b_events_tx, mut b_events) = mpsc::channel(1024);

    let sender = spawn_session(
        sender_config,
        HandshakeRole::Initiator,
        SigningKeyPair::generate(),
        a,
        a_events_tx,
    )
    .unwrap();
    let receiver = spawn_session(
        receiver_config,
        HandshakeRole::Responder,
        SigningKeyPair::generate(),
        b,
        b_events_tx,
    )
    .unwrap();

    for events in [&mut a_events, &mut b_events] {
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Established { .. }
        ));
    }

    (sender, a_events, receiver, b_events)
}

/// 10 MiB in 640 chunks of 16 KiB arrives byte-identical, the sender's
/// future resolves on the receiver's verification, and no partial
/// artifact survives.
#[test_log::test(tokio::test)]
async fn ten_mebibyte_file_arrives_byte_identical() {
    let source_dir = tempfile::tempdir().unwrap();
    let download_dir = tempfile::tempdir().unwrap();

    let size = 10 * 1024 * 1024usize;
    let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let source = source_dir.path().join("dataset.bin");
    tokio::fs::write(&source, &content).await.unwrap();

    let mut receiver_config = ProtocolConfig::default();
    receiver_config.transfer.download_dir = download_dir.path().to_path_buf();

    let (sender, _a_events, _receiver, mut b_events) =
        established_pair(ProtocolConfig::default(), receiver_config).await;

    let transfer_id = tokio::time::timeout(
        Duration::from_secs(60),
        sender.send_file(source.clone()),
    )
    .await
    .expect("transfer should finish well within the timeout")
    .unwrap();

    // the receiver surfaced start and completion for the same transfer
    let mut started: Option<TransferId> = None;
    let mut completed = None;
    while completed.is_none() {
        match b_events.recv().await.unwrap() {
            SessionEvent::Transfer(TransferProgress::Started {
                id,
                file_name,
                file_size,
            }) => {
                assert_eq!(file_name, "dataset.bin");
                assert_eq!(file_size, size as u64);
                started = Some(id);
            }
            SessionEvent::Transfer(TransferProgress::Completed { id, path }) => {
                assert_eq!(id, transfer_id);
                completed = Some(path);
            }
            SessionEvent::Transfer(TransferProgress::Failed { reason, .. }) => {
                panic!("transfer failed: {reason}");
            }
            _ => continue,
        }
    }
    assert_eq!(started.as_ref(), Some(&transfer_id));

    let destination = completed.unwrap();
    assert_eq!(destination, download_dir.path().join("dataset.bin"));
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), content);

    // the partial artifact was renamed away, not copied
    let leftovers: Vec<_> = std::fs::read_dir(download_dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("dataset.bin")]);
}

/// A second transfer of the same file name lands next to the first with
/// a collision suffix instead of overwriting it.
#[test_log::test(tokio::test)]
async fn repeated_file_name_gets_collision_suffix() {
    let source_dir = tempfile::tempdir().unwrap();
    let download_dir = tempfile::tempdir().unwrap();

    let source = source_dir.path().join("notes.txt");
    tokio::fs::write(&source, b"first version").await.unwrap();

    let mut receiver_config = ProtocolConfig::default();
    receiver_config.transfer.download_dir = download_dir.path().to_path_buf();

    let (sender, _a_events, _receiver, _b_events) =
        established_pair(ProtocolConfig::default(), receiver_config).await;

    sender.send_file(source.clone()).await.unwrap();
    sender.send_file(source.clone()).await.unwrap();

    assert_eq!(
        tokio::fs::read(download_dir.path().join("notes.txt"))
            .await
            .unwrap(),
        b"first version"
    );
    assert_eq!(
        tokio::fs::read(download_dir.path().join("notes (1).txt"))
            .await
            .unwrap(),
        b"first version"
    );
}

/// Transfers work unchanged with padding enabled on both sides.
#[test_log::test(tokio::test)]
async fn transfer_with_padding_enabled() {
    let source_dir = tempfile::tempdir().unwrap();
    let download_dir = tempfile::tempdir().unwrap();

    let content: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
    let source = source_dir.path().join("padded.bin");
    tokio::fs::write(&source, &content).await.unwrap();

    let sender_config = ProtocolConfig {
        enable_padding: true,
        ..Default::default()
    };
    let mut receiver_config = ProtocolConfig {
        enable_padding: true,
        ..Default::default()
    };
    receiver_config.transfer.download_dir = download_dir.path().to_path_buf();

    let (sender, _a_events, _receiver, _b_events) =
        established_pair(sender_config, receiver_config).await;

    sender.send_file(source).await.unwrap();
    assert_eq!(
        tokio::fs::read(download_dir.path().join("padded.bin"))
            .await
            .unwrap(),
        content
    );
}

/// An empty file transfers as zero chunks and still verifies.
#[test_log::test(tokio::test)]
async fn empty_file_transfers() {
    let source_dir = tempfile::tempdir().unwrap();
    let download_dir = tempfile::tempdir().unwrap();

    let source = source_dir.path().join("empty.bin");
    tokio::fs::write(&source, b"").await.unwrap();

    let mut receiver_config = ProtocolConfig::default();
    receiver_config.transfer.download_dir = download_dir.path().to_path_buf();

    let (sender, _a_events, _receiver, _b_events) =
        established_pair(ProtocolConfig::default(), receiver_config).await;

    sender.send_file(source).await.unwrap();
    assert_eq!(
        tokio::fs::read(download_dir.path().join("empty.bin"))
            .await
            .unwrap(),
        b""
    );
}
