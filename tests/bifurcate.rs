//! Integration tests for the literal end-to-end scenarios.
//!
//! Unlike the per-module unit tests, these drive the public [`bifurcate`]
//! entry point end-to-end over realistic sources (a byte slice, a
//! `tokio::io::duplex` pipe) rather than poking at internal buffer/branch
//! state directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use bifurcate::{bifurcate, BranchConfig, ErrorKind, SourceConfig};

#[tokio::test]
async fn min_buffer_coalesces_small_chunks_into_one_delivery() {
    let (mut writer, reader) = tokio::io::duplex(256);
    let writer_task = tokio::spawn(async move {
        for chunk in [b"ab", b"cd", b"ef", b"gh"] {
            writer.write_all(chunk).await.unwrap();
        }
    });

    let delivered_lens = Arc::new(std::sync::Mutex::new(Vec::new()));
    let delivered_lens_clone = delivered_lens.clone();

    let outcome = bifurcate(
        reader,
        SourceConfig::new().with_min_read_buffer_size(Some(4)),
        vec![BranchConfig::new(move |mut reader, _cancel| async move {
            let mut total = Vec::new();
            let mut chunk = [0u8; 64];
            loop {
                let n = reader.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                delivered_lens_clone.lock().unwrap().push(n);
                total.extend_from_slice(&chunk[..n]);
            }
            total
        })],
    )
    .await
    .unwrap();

    writer_task.await.unwrap();
    assert_eq!(
        outcome.results[0].as_deref(),
        Some(b"abcdefgh".as_slice())
    );
    let lens = delivered_lens.lock().unwrap();
    assert!(!lens.is_empty());
    assert!(
        lens[0] >= 4,
        "first delivered chunk should be coalesced to at least the minimum, got {}",
        lens[0]
    );
}

#[tokio::test]
async fn early_completion_does_not_stall_the_other_branch() {
    let source: &[u8] = &[0u8; 16];
    let outcome = bifurcate(
        source,
        SourceConfig::new(),
        vec![
            BranchConfig::new(|mut reader, _cancel| async move {
                reader.read_to_end().await.unwrap().len()
            })
            .with_block_after(16)
            .with_resume_after(8)
            .with_max_total_bytes(Some(6)),
            BranchConfig::new(|mut reader, _cancel| async move {
                reader.read_to_end().await.unwrap().len()
            }),
        ],
    )
    .await
    .unwrap();

    assert_eq!(outcome.results[0], Some(6));
    assert_eq!(outcome.results[1], Some(16));
}

#[tokio::test]
async fn cancellation_propagates_to_every_branch() {
    let (mut writer, reader) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();
    let cancel_for_writer = cancel.clone();
    let cancel_to_fire = cancel.clone();

    let writer_task = tokio::spawn(async move {
        writer.write_all(b"first chunk").await.unwrap();
        // Hold the connection open past when cancellation is expected to
        // fire, without ever sending the rest.
        tokio::select! {
            _ = cancel_for_writer.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    });

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel_to_fire.cancel();
    });

    let saw_cancel = Arc::new(AtomicUsize::new(0));
    let saw_cancel_clone = saw_cancel.clone();

    let result = bifurcate(
        reader,
        SourceConfig::new().with_cancel_token(cancel),
        vec![BranchConfig::new(move |mut reader, cancel| async move {
            let mut chunk = [0u8; 64];
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        saw_cancel_clone.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    res = reader.read(&mut chunk) => match res {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    },
                }
            }
        })],
    )
    .await;

    assert!(result.is_err());
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(saw_cancel.load(Ordering::SeqCst), 1);
    writer_task.abort();
}

#[tokio::test]
async fn single_branch_round_trip_equals_source_bytes() {
    let source: &[u8] = b"the quick brown fox jumps over the lazy dog";
    let outcome = bifurcate(
        source,
        SourceConfig::new(),
        vec![BranchConfig::new(|mut reader, _cancel| async move {
            reader.read_to_end().await.unwrap()
        })],
    )
    .await
    .unwrap();
    assert_eq!(outcome.results[0].as_deref(), Some(source));
}

#[tokio::test]
async fn bubbling_on_returns_err_instead_of_partial_results() {
    let source: &[u8] = b"Test Value";
    let err = bifurcate(
        source,
        SourceConfig::new(), // bubble_exceptions defaults to true
        vec![BranchConfig::new(|mut _reader, _cancel| async move {
            panic!("boom")
        })],
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsumerFailure);
}
