//! Store protocol tests
//!
//! Exercise `MemoryStore` through the `StoreView` contract: FIFO admission,
//! order tokens, metainfo checks, backfill and reset.

use shardstore::config::StoreConfig;
use shardstore::query::Datum;
use shardstore::store::{
    backfill_between, blob_version, version_blob, ChunkCollector, FifoStream, KeyRange,
    MemoryStore, Metainfo, MetainfoChecker, OrderSource, OrderToken, ReadRequest, ReadResponse,
    ReplTimestamp, Region, StartPoint, StateTimestamp, StoreError, StoreKey, StoreView,
    TransitionTimestamp, WriteRequest, WriteResponse,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn universe_checker() -> MetainfoChecker {
    MetainfoChecker::trivial(Region::universe())
}

fn blob(version: u64) -> Metainfo {
    Metainfo::new(Region::universe(), version_blob(version))
}

async fn put(
    store: &MemoryStore,
    key: &str,
    value: Datum,
    state: u64,
) -> Result<WriteResponse, StoreError> {
    store
        .write(
            &universe_checker(),
            blob(state + 1),
            WriteRequest::new(key, value, true),
            TransitionTimestamp::starting_from(StateTimestamp(state)),
            OrderToken::IGNORE,
            store.new_write_token(),
            &CancellationToken::new(),
        )
        .await
}

async fn ordered_put(
    store: &MemoryStore,
    order: OrderToken,
    state: u64,
) -> Result<WriteResponse, StoreError> {
    store
        .write(
            &universe_checker(),
            blob(state + 1),
            WriteRequest::new("k", Datum::from(state as i64), true),
            TransitionTimestamp::starting_from(StateTimestamp(state)),
            order,
            store.new_write_token(),
            &CancellationToken::new(),
        )
        .await
}

async fn get(store: &MemoryStore, key: &str) -> Option<Datum> {
    let response = store
        .read(
            &universe_checker(),
            ReadRequest::point(key),
            OrderToken::IGNORE,
            store.new_read_token(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    match response {
        ReadResponse::Point(value) => value,
        other => panic!("expected point response, got {:?}", other),
    }
}

// =============================================================================
// FIFO admission
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thousand_writes_apply_in_token_order() {
    let store = Arc::new(MemoryStore::new(Region::universe(), StoreConfig::test()));
    let mut tokens: Vec<_> = (0..1000u64).map(|i| (i, store.new_write_token())).collect();
    // Spawn newest first so admission, not spawn order, decides.
    tokens.reverse();

    let mut handles = Vec::new();
    for (i, token) in tokens {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .write(
                    &MetainfoChecker::trivial(Region::universe()),
                    Metainfo::new(Region::universe(), version_blob(i + 1)),
                    WriteRequest::new("counter", Datum::from(i as i64), true),
                    TransitionTimestamp::starting_from(StateTimestamp(i)),
                    OrderToken::IGNORE,
                    token,
                    &CancellationToken::new(),
                )
                .await
        }));
    }

    let all = futures::future::join_all(handles);
    let results = tokio::time::timeout(Duration::from_secs(60), all)
        .await
        .expect("writes deadlocked");
    for result in results {
        assert_eq!(result.unwrap().unwrap(), WriteResponse::Stored);
    }

    let key = StoreKey::from("counter");
    assert_eq!(store.values(&key), Some(Datum::from(999)));
    assert_eq!(store.timestamps(&key), Some(ReplTimestamp(1000)));
    assert_eq!(store.fifo().watermark(FifoStream::Write), 1000);
}

#[tokio::test]
async fn test_cancelled_operation_releases_its_token() {
    let store = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    let head = store.new_write_token();
    let stuck = store.new_write_token();

    let interruptor = CancellationToken::new();
    interruptor.cancel();
    let err = store
        .write(
            &universe_checker(),
            blob(1),
            WriteRequest::new("a", Datum::from(1), true),
            TransitionTimestamp::starting_from(StateTimestamp(0)),
            OrderToken::IGNORE,
            stuck,
            &interruptor,
        )
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::Interrupted);
    assert!(store.is_empty());

    drop(head);
    let next = tokio::time::timeout(Duration::from_secs(5), put(&store, "b", Datum::from(2), 0))
        .await
        .expect("token after a cancelled one was never admitted");
    assert_eq!(next.unwrap(), WriteResponse::Stored);
    assert_eq!(store.fifo().watermark(FifoStream::Write), 3);
}

#[tokio::test]
async fn test_waiter_cancelled_while_blocked_behind_held_token() {
    let store = Arc::new(MemoryStore::new(Region::universe(), StoreConfig::no_latency()));
    let head = store.new_write_token();
    let blocked = store.new_write_token();

    let interruptor = CancellationToken::new();
    let waiter = {
        let store = store.clone();
        let interruptor = interruptor.clone();
        tokio::spawn(async move {
            store
                .write(
                    &universe_checker(),
                    blob(1),
                    WriteRequest::new("a", Datum::from(1), true),
                    TransitionTimestamp::starting_from(StateTimestamp(0)),
                    OrderToken::IGNORE,
                    blocked,
                    &interruptor,
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished(), "write ran ahead of the held token");
    interruptor.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("cancelled waiter never woke")
        .unwrap();
    assert_eq!(result.unwrap_err(), StoreError::Interrupted);
    assert!(store.is_empty());

    drop(head);
    let next = tokio::time::timeout(Duration::from_secs(5), put(&store, "b", Datum::from(2), 0))
        .await
        .expect("token after a cancelled waiter was never admitted");
    assert_eq!(next.unwrap(), WriteResponse::Stored);
    assert_eq!(store.fifo().watermark(FifoStream::Write), 3);
}

#[tokio::test]
async fn test_reads_queue_independently_of_writes() {
    let store = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    put(&store, "a", Datum::from(1), 0).await.unwrap();

    // An outstanding write token does not hold up reads.
    let _pending = store.new_write_token();
    let value = tokio::time::timeout(Duration::from_secs(5), get(&store, "a"))
        .await
        .expect("read blocked behind a write token");
    assert_eq!(value, Some(Datum::from(1)));
}

// =============================================================================
// Writes, metainfo and order tokens
// =============================================================================

#[tokio::test]
async fn test_write_stored_then_duplicate() {
    let store = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    let never = CancellationToken::new();

    let mut responses = Vec::new();
    for (state, value) in [(0u64, 1i64), (1, 2)] {
        let response = store
            .write(
                &universe_checker(),
                blob(state + 1),
                WriteRequest::new("k", Datum::from(value), false),
                TransitionTimestamp::starting_from(StateTimestamp(state)),
                OrderToken::IGNORE,
                store.new_write_token(),
                &never,
            )
            .await
            .unwrap();
        responses.push(response);
    }
    assert_eq!(responses, vec![WriteResponse::Stored, WriteResponse::Duplicate]);
    assert_eq!(get(&store, "k").await, Some(Datum::from(1)));
    assert_eq!(store.timestamps(&StoreKey::from("k")), Some(ReplTimestamp(1)));

    let replaced = put(&store, "k", Datum::from(3), 2).await.unwrap();
    assert_eq!(replaced, WriteResponse::Stored);
    assert_eq!(get(&store, "k").await, Some(Datum::from(3)));
    assert_eq!(store.timestamps(&StoreKey::from("k")), Some(ReplTimestamp(3)));
}

#[tokio::test]
async fn test_metainfo_mismatch_rejects_write() {
    let store = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    let never = CancellationToken::new();
    store
        .set_metainfo(blob(1), OrderToken::IGNORE, store.new_write_token(), &never)
        .await
        .unwrap();

    let err = store
        .write(
            &MetainfoChecker::expecting(blob(2)),
            blob(3),
            WriteRequest::new("k", Datum::from(1), true),
            TransitionTimestamp::starting_from(StateTimestamp(2)),
            OrderToken::IGNORE,
            store.new_write_token(),
            &never,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::MetainfoMismatch { .. }), "{:?}", err);
    assert!(store.is_empty());

    let metainfo = store
        .get_metainfo(OrderToken::IGNORE, store.new_read_token(), &never)
        .await
        .unwrap();
    assert!(metainfo.agrees_with(&blob(1)));
}

#[tokio::test]
async fn test_order_violation_detected() {
    let store = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    let source = OrderSource::new(7);
    let first = source.check_in("first");
    let second = source.check_in("second");
    ordered_put(&store, second, 0).await.unwrap();
    let err = ordered_put(&store, first, 1).await.unwrap_err();
    assert_eq!(
        err,
        StoreError::OrderViolation {
            bucket: 7,
            value: 1,
            last: 2
        }
    );
    assert_eq!(store.values(&StoreKey::from("k")), Some(Datum::from(0)));
}

#[tokio::test]
async fn test_read_mode_tokens_may_repeat() {
    let store = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    let token = OrderSource::new(1).check_in("read").with_read_mode();
    let never = CancellationToken::new();

    for _ in 0..2 {
        store
            .get_metainfo(token, store.new_read_token(), &never)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_reset_data_erases_only_subregion() {
    let store = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    for (i, key) in ["a", "b", "c", "d", "e"].iter().enumerate() {
        put(&store, key, Datum::from(i as i64), i as u64).await.unwrap();
    }

    let subregion = Region::from_key_range(KeyRange::new(StoreKey::from("b"), StoreKey::from("d")));
    store
        .reset_data(
            subregion.clone(),
            Metainfo::new(subregion, version_blob(100)),
            store.new_write_token(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let keys: Vec<String> = store.contents().into_iter().map(|(k, _)| k.to_string()).collect();
    assert_eq!(keys, vec!["a", "d", "e"]);

    let metainfo = store
        .get_metainfo(OrderToken::IGNORE, store.new_read_token(), &CancellationToken::new())
        .await
        .unwrap();
    let version = |key: &str| metainfo.lookup_key(&StoreKey::from(key)).and_then(blob_version);
    assert_eq!(version("b"), Some(100));
    assert_eq!(version("e"), Some(5));
}

// =============================================================================
// Backfill
// =============================================================================

#[tokio::test]
async fn test_backfill_sends_newer_keys_with_recency() {
    let source = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    let dest = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    put(&source, "k1", Datum::from("v1"), 0).await.unwrap();

    // Destination is at state 0; the write landed at state 1.
    let start = StartPoint::new(Region::universe(), StateTimestamp(0));
    let mut collector = ChunkCollector::new();
    let sent = source
        .send_backfill(&start, &mut collector, source.new_read_token(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(sent);
    let atoms: Vec<_> = collector.atoms().cloned().collect();
    assert_eq!(atoms.len(), 1);
    assert_eq!(atoms[0].key, StoreKey::from("k1"));
    assert_eq!(atoms[0].value, Datum::from("v1"));
    assert_eq!(atoms[0].recency, ReplTimestamp(1));

    let applied = backfill_between(&source, &dest, &start, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(applied, 1);
    assert_eq!(dest.values(&StoreKey::from("k1")), Some(Datum::from("v1")));
    assert_eq!(dest.timestamps(&StoreKey::from("k1")), Some(ReplTimestamp(1)));
}

#[tokio::test]
async fn test_backfill_skips_keys_the_destination_has() {
    let source = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    for i in 0..6u64 {
        put(&source, &format!("k{}", i), Datum::from(i as i64), i).await.unwrap();
    }

    let start = StartPoint::new(Region::universe(), StateTimestamp(4));
    let mut collector = ChunkCollector::new();
    source
        .send_backfill(&start, &mut collector, source.new_read_token(), &CancellationToken::new())
        .await
        .unwrap();
    let mut keys: Vec<String> = collector.atoms().map(|a| a.key.to_string()).collect();
    keys.sort();
    assert_eq!(keys, vec!["k4", "k5"]);
}

#[tokio::test]
async fn test_backfill_transfers_metainfo() {
    let source = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    let dest = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    for i in 0..5u64 {
        put(&source, &format!("k{}", i), Datum::from(i as i64), i).await.unwrap();
    }

    let never = CancellationToken::new();
    let start = StartPoint::new(Region::universe(), StateTimestamp(0));
    backfill_between(&source, &dest, &start, &never).await.unwrap();

    let metainfo = dest
        .get_metainfo(OrderToken::IGNORE, dest.new_read_token(), &never)
        .await
        .unwrap();
    assert!(metainfo.agrees_with(&blob(5)));
    assert_eq!(dest.contents(), source.contents());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backfill_converges_under_concurrent_writes() {
    let source = Arc::new(MemoryStore::new(Region::universe(), StoreConfig::test()));
    let dest = Arc::new(MemoryStore::new(Region::universe(), StoreConfig::test()));
    for i in 0..20u64 {
        put(&source, &format!("k{:02}", i), Datum::from(i as i64), i).await.unwrap();
    }

    let writer = {
        let source = source.clone();
        tokio::spawn(async move {
            for i in 20..60u64 {
                // Overwrite old keys and add new ones while the backfill streams.
                let key = format!("k{:02}", i % 30);
                put(&source, &key, Datum::from(i as i64), i).await.unwrap();
            }
        })
    };

    let never = CancellationToken::new();
    let start = StartPoint::new(Region::universe(), StateTimestamp(0));
    let applied = tokio::time::timeout(
        Duration::from_secs(30),
        backfill_between(source.as_ref(), dest.as_ref(), &start, &never),
    )
    .await
    .expect("backfill stalled behind writes")
    .unwrap();
    assert!(applied >= 20);
    writer.await.unwrap();

    // Resume from the state the first pass delivered.
    let synced = dest
        .get_metainfo(OrderToken::IGNORE, dest.new_read_token(), &never)
        .await
        .unwrap()
        .lookup_key(&StoreKey::min())
        .and_then(blob_version)
        .unwrap();
    assert!(synced >= 20);
    let resume = StartPoint::new(Region::universe(), StateTimestamp(synced));
    backfill_between(source.as_ref(), dest.as_ref(), &resume, &never)
        .await
        .unwrap();

    assert_eq!(dest.contents(), source.contents());
    assert_eq!(source.len(), 30);
    for (key, _) in source.contents() {
        assert_eq!(dest.timestamps(&key), source.timestamps(&key), "recency of {}", key);
    }
    let metainfo = dest
        .get_metainfo(OrderToken::IGNORE, dest.new_read_token(), &never)
        .await
        .unwrap();
    assert!(metainfo.agrees_with(&blob(60)));
}

#[tokio::test]
async fn test_refusing_callback_gets_nothing() {
    let source = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    put(&source, "k1", Datum::from(1), 0).await.unwrap();

    let start = StartPoint::new(Region::universe(), StateTimestamp(0));
    let mut collector = ChunkCollector::refusing();
    let sent = source
        .send_backfill(&start, &mut collector, source.new_read_token(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!sent);
    assert!(collector.chunks.is_empty());
    // The callback still saw the source metainfo before declining.
    assert!(collector.metainfo.is_some_and(|m| m.agrees_with(&blob(1))));
}

#[tokio::test]
async fn test_backfill_rejects_destination_outside_region() {
    let source = MemoryStore::new(Region::universe(), StoreConfig::no_latency());
    let narrow = Region::from_key_range(KeyRange::new(StoreKey::from("a"), StoreKey::from("m")));
    let dest = MemoryStore::new(narrow, StoreConfig::no_latency());

    let start = StartPoint::new(Region::universe(), StateTimestamp(0));
    let err = backfill_between(&source, &dest, &start, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::RegionMismatch { .. }));
}
