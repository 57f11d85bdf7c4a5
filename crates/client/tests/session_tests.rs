//! Upload engine behaviour against an in-memory server.

mod common;

use bytes::Bytes;
use common::{MemoryTransport, metadata_for, sha256_hex, test_bytes};
use std::sync::Arc;
use std::time::Duration;
use stowage_client::{
    ClientError, FileSource, SessionConfig, SessionSnapshot, Step, UploadEngine, checksum,
};
use stowage_core::UploadStatus;

const MIB: usize = 1024 * 1024;

fn config(chunk_size: usize) -> SessionConfig {
    SessionConfig {
        chunk_size: chunk_size as u64,
        ..SessionConfig::default()
    }
}

fn engine(transport: &Arc<MemoryTransport>, data: &Bytes, chunk_size: usize) -> UploadEngine {
    UploadEngine::new(
        transport.clone(),
        Arc::new(data.clone()),
        metadata_for(data),
        config(chunk_size),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_after_third_chunk_then_resume() {
    let transport = Arc::new(MemoryTransport::new());
    let data = test_bytes(10 * MIB);
    let mut engine = engine(&transport, &data, 2 * MIB);

    engine.start().await.unwrap();
    let reference = engine.session().upload_url.clone().unwrap();
    transport.disconnect_after(3);

    for expected in [2 * MIB, 4 * MIB, 6 * MIB] {
        assert_eq!(
            engine.upload_next_chunk().await.unwrap(),
            Step::Advanced(expected as u64)
        );
    }
    // Retries run out while the connection is down.
    let err = engine.upload_next_chunk().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(engine.status(), UploadStatus::Failed);
    assert_eq!(engine.offset(), 6 * MIB as u64);
    assert_eq!(engine.session().retry_state.attempt, 4);

    // Pick the session up in a "new process".
    let saved = serde_json::to_string(&engine.snapshot()).unwrap();
    drop(engine);
    let sends_before = transport.sends().len();
    transport.reconnect();

    let snapshot: SessionSnapshot = serde_json::from_str(&saved).unwrap();
    let mut restored = UploadEngine::restore(
        transport.clone(),
        Arc::new(data.clone()),
        snapshot,
        config(2 * MIB),
    )
    .unwrap();
    assert_eq!(restored.status(), UploadStatus::Paused);

    let receipt = restored.run().await.unwrap();
    assert_eq!(restored.status(), UploadStatus::Completed);
    assert_eq!(receipt.upload_id, reference);
    assert!(transport.is_finalized(&reference));

    // Nothing below the server's offset was sent again.
    let resent = &transport.sends()[sends_before..];
    assert!(resent.iter().all(|(offset, _)| *offset >= 6 * MIB as u64));
    assert_eq!(resent.len(), 2);

    let stored = transport.data(&reference);
    assert_eq!(stored.len(), data.len());
    assert_eq!(sha256_hex(&stored), sha256_hex(&data));
}

#[tokio::test(start_paused = true)]
async fn test_resume_fails_when_server_lost_acknowledged_bytes() {
    let transport = Arc::new(MemoryTransport::new());
    let data = test_bytes(MIB);
    let mut engine = engine(&transport, &data, 256 * 1024);

    engine.start().await.unwrap();
    let reference = engine.session().upload_url.clone().unwrap();
    for _ in 0..3 {
        engine.upload_next_chunk().await.unwrap();
    }
    engine.pause().unwrap();
    assert_eq!(engine.status(), UploadStatus::Paused);
    let before_pause = engine.offset();
    assert_eq!(before_pause, 768 * 1024);

    // The server dropped a chunk it had already acknowledged.
    transport.truncate(&reference, 512 * 1024);
    let err = engine.resume().await.unwrap_err();
    assert!(matches!(err, ClientError::Protocol(_)));
    assert!(!err.is_retryable());
    assert_eq!(engine.status(), UploadStatus::Failed);
    assert_eq!(engine.offset(), before_pause);
    assert!(engine.last_error().unwrap().contains("lost acknowledged bytes"));
}

#[tokio::test(start_paused = true)]
async fn test_resume_never_moves_offset_backwards() {
    let transport = Arc::new(MemoryTransport::new());
    let data = test_bytes(MIB);
    let mut engine = engine(&transport, &data, 256 * 1024);

    engine.start().await.unwrap();
    engine.upload_next_chunk().await.unwrap();
    engine.upload_next_chunk().await.unwrap();
    engine.pause().unwrap();
    let before_pause = engine.offset();

    engine.resume().await.unwrap();
    assert!(engine.offset() >= before_pause);
    engine.run().await.unwrap();
    assert_eq!(engine.status(), UploadStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let transport = Arc::new(MemoryTransport::new());
    let data = test_bytes(300 * 1024);
    let mut engine = engine(&transport, &data, 128 * 1024);

    engine.start().await.unwrap();
    transport.fail_next_sends(3);
    let started = tokio::time::Instant::now();
    assert_eq!(
        engine.upload_next_chunk().await.unwrap(),
        Step::Advanced(128 * 1024)
    );
    // Waited 0s + 1s + 3s between the four attempts.
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(4) && waited < Duration::from_secs(5));
    assert_eq!(engine.session().retry_state.attempt, 0);

    engine.run().await.unwrap();
    assert_eq!(engine.status(), UploadStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_send_waits_for_retry_after() {
    let transport = Arc::new(MemoryTransport::new());
    let data = test_bytes(256 * 1024);
    let mut engine = engine(&transport, &data, 128 * 1024);

    engine.start().await.unwrap();
    // The schedule alone would give up after 0s + 1s + 3s + 5s.
    transport.rate_limit_next_sends(2, Duration::from_secs(30));
    let started = tokio::time::Instant::now();
    assert_eq!(
        engine.upload_next_chunk().await.unwrap(),
        Step::Advanced(128 * 1024)
    );
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(61));

    engine.run().await.unwrap();
    assert_eq!(engine.status(), UploadStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_lost_ack_recovers_from_offset_conflict() {
    let transport = Arc::new(MemoryTransport::new());
    let data = test_bytes(512 * 1024);
    let mut engine = engine(&transport, &data, 128 * 1024);

    engine.start().await.unwrap();
    let reference = engine.session().upload_url.clone().unwrap();
    transport.lose_next_ack();

    // The chunk is stored but the ack never arrives; the retry hits a
    // conflict and continues from the server's offset.
    assert_eq!(
        engine.upload_next_chunk().await.unwrap(),
        Step::Advanced(256 * 1024)
    );
    engine.run().await.unwrap();
    assert_eq!(transport.data(&reference), data.to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_chunk_fails_without_retry() {
    let transport = Arc::new(MemoryTransport::new());
    let data = test_bytes(200 * 1024);
    let mut engine = engine(&transport, &data, 64 * 1024);

    engine.start().await.unwrap();
    transport.reject_with(415);
    let err = engine.upload_next_chunk().await.unwrap_err();
    assert!(matches!(err, ClientError::Status { status: 415, .. }));
    assert_eq!(engine.status(), UploadStatus::Failed);
    assert_eq!(transport.sends().len(), 1);
    assert!(engine.last_error().unwrap().contains("415"));
}

#[tokio::test(start_paused = true)]
async fn test_pause_aborts_in_flight_chunk() {
    let transport = Arc::new(MemoryTransport::new());
    transport.delay_sends(Duration::from_millis(100));
    let data = test_bytes(MIB);
    let mut engine = engine(&transport, &data, 256 * 1024);
    let handle = engine.handle();
    let mut progress = engine.subscribe_progress();

    let task = tokio::spawn(async move {
        let result = engine.run().await;
        (engine, result)
    });

    let first = progress.recv().await.unwrap();
    assert_eq!(first.loaded, 256 * 1024);
    handle.pause();

    // The second chunk was in flight and is abandoned; nothing more arrives.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let reference = "mem://uploads/1";
    assert_eq!(transport.stored_len(reference), 256 * 1024);
    assert!(progress.try_recv().is_err());

    handle.resume();
    let (engine, result) = task.await.unwrap();
    result.unwrap();
    assert_eq!(engine.status(), UploadStatus::Completed);
    assert!(engine.offset() >= first.loaded);
    assert_eq!(transport.data(reference), data.to_vec());

    let mut loaded = vec![first.loaded];
    while let Ok(event) = progress.try_recv() {
        loaded.push(event.loaded);
    }
    assert!(loaded.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(*loaded.last().unwrap(), MIB as u64);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_discards_server_bytes() {
    let transport = Arc::new(MemoryTransport::new());
    transport.delay_sends(Duration::from_millis(100));
    let data = test_bytes(MIB);
    let mut engine = engine(&transport, &data, 256 * 1024);
    let handle = engine.handle();
    let mut progress = engine.subscribe_progress();

    let task = tokio::spawn(async move {
        let result = engine.run().await;
        (engine, result)
    });
    progress.recv().await.unwrap();
    handle.cancel();

    let (mut engine, result) = task.await.unwrap();
    assert!(matches!(result, Err(ClientError::Cancelled)));
    assert_eq!(engine.status(), UploadStatus::Cancelled);
    assert_eq!(transport.discarded(), vec!["mem://uploads/1".to_string()]);

    // Terminal: nothing can restart it.
    assert!(engine.resume().await.is_err());
    assert!(engine.cancel().await.is_err());
    assert!(
        UploadEngine::restore(
            transport.clone(),
            Arc::new(data.clone()),
            engine.snapshot(),
            config(256 * 1024)
        )
        .is_err()
    );
}

#[tokio::test]
async fn test_restore_rejects_changed_source() {
    let transport = Arc::new(MemoryTransport::new());
    let data = test_bytes(300 * 1024);
    let mut engine = engine(&transport, &data, 64 * 1024);
    engine.start().await.unwrap();
    engine.upload_next_chunk().await.unwrap();

    let shorter = Arc::new(data.slice(..200 * 1024));
    let err = UploadEngine::restore(transport, shorter, engine.snapshot(), config(64 * 1024))
        .err()
        .unwrap();
    assert!(matches!(
        err,
        ClientError::SourceChanged {
            expected: 307_200,
            actual: 204_800
        }
    ));
}

#[tokio::test]
async fn test_upload_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upload.bin");
    let data = test_bytes(700 * 1024);
    std::fs::write(&path, &data).unwrap();

    let source = Arc::new(FileSource::open(&path).await.unwrap());
    let mut metadata = metadata_for(&data);
    metadata.checksum = checksum(source.as_ref(), 64 * 1024).await.unwrap().to_hex();
    assert_eq!(metadata.checksum, sha256_hex(&data));

    let transport = Arc::new(MemoryTransport::new());
    let mut engine =
        UploadEngine::new(transport.clone(), source, metadata, config(256 * 1024)).unwrap();
    let receipt = engine.run().await.unwrap();
    assert_eq!(transport.data(&receipt.upload_id), data.to_vec());
}
