use bytes::Bytes;
use parking_lot::Mutex;
use rangestore::clock::{Clock, ManualClock};
use rangestore::engine::{decode_repr, BatchOp, InMemEngine, Writer};
use rangestore::eval::{CommandArgs, EvalContext, Method};
use rangestore::keys;
use rangestore::mvcc::{mvcc_delete, mvcc_get, mvcc_put, MvccGetOptions, MvccKey};
use rangestore::replica::EvalHook;
use rangestore::{
    DeleteRequest, ErrorKind, EvalKnobs, GetRequest, GetSnapshotForMergeRequest, Header, Intent,
    PutRequest, RangeDescriptor, RangeId, Replica, Request, Settings, StoreError, Timestamp,
    TxnMeta, TxnStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn settings() -> Settings {
    Settings {
        merge_watch_min_backoff: Duration::from_millis(1),
        merge_watch_max_backoff: Duration::from_millis(20),
        merge_watch_timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    }
}

fn left_desc(end: &'static str) -> RangeDescriptor {
    RangeDescriptor::new(RangeId(1), "a", end, vec![])
}

struct TestRange {
    replica: Arc<Replica>,
    clock: Arc<ManualClock>,
}

impl TestRange {
    fn new(start: &'static str, end: &'static str) -> Self {
        Self::with_knobs(start, end, EvalKnobs::default(), settings())
    }

    fn with_knobs(
        start: &'static str,
        end: &'static str,
        knobs: EvalKnobs,
        settings: Settings,
    ) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(1_000));
        let desc = RangeDescriptor::new(RangeId(2), start, end, vec![]);
        let replica = Replica::bootstrap(
            1,
            desc,
            Arc::new(InMemEngine::new()),
            clock.clone(),
            settings,
        )
        .unwrap()
        .with_knobs(knobs);
        replica.acquire_lease().unwrap();
        Self {
            replica: Arc::new(replica),
            clock,
        }
    }

    fn now(&self) -> Header {
        Header::at(self.clock.now())
    }

    async fn put(&self, key: &'static str, value: &'static str) {
        self.replica
            .send(self.now(), PutRequest::new(key, value))
            .await
            .unwrap();
    }

    async fn get(&self, key: &'static str) -> Result<Option<Bytes>, StoreError> {
        let resp = self.replica.send(self.now(), GetRequest::new(key)).await?;
        Ok(resp.into_get().and_then(|resp| resp.value))
    }

    /// Lays the merge transaction's deletion intent on the local descriptor.
    async fn begin_merge(&self) -> TxnMeta {
        let desc = self.replica.desc();
        let txn = TxnMeta::new(Bytes::from_static(b"a"), self.clock.now());
        self.replica
            .send(Header::with_txn(txn.clone()), DeleteRequest::new(desc.local_key()))
            .await
            .unwrap();
        txn
    }

    async fn snapshot(&self, txn: &TxnMeta, left_end: &'static str) -> Result<Bytes, StoreError> {
        let resp = self
            .replica
            .send(
                Header::with_txn(txn.clone()),
                GetSnapshotForMergeRequest::new(left_desc(left_end)),
            )
            .await?;
        Ok(resp.into_snapshot().map(|resp| resp.data).unwrap_or_default())
    }

    async fn finish_merge(&self, txn: &TxnMeta, status: TxnStatus) {
        let intent = Intent::new(self.replica.desc().local_key(), txn.clone());
        let resolved = self
            .replica
            .apply_intent_resolution(&[intent], status)
            .await
            .unwrap();
        assert_eq!(resolved, 1);
    }
}

/// The user keys carried by a snapshot, in order.
fn user_keys(data: &[u8]) -> Vec<Bytes> {
    decode_repr(data)
        .unwrap()
        .into_iter()
        .filter_map(|op| match op {
            BatchOp::Put(key, _) if !keys::is_local(&key.key) && !key.is_meta() => Some(key.key),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_snapshot_without_merge_intent_fails() {
    let range = TestRange::new("a", "z");
    range.put("k", "v").await;

    let err = range
        .replica
        .send(range.now(), GetSnapshotForMergeRequest::new(left_desc("a")))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::MissingMergeIntent));
    assert!(!range.replica.is_merging());
    assert_eq!(range.get("k").await.unwrap().unwrap(), "v");
}

#[tokio::test]
async fn test_snapshot_of_merging_range() {
    let range = TestRange::new("m", "z");
    for key in ["m", "p", "q", "y"] {
        range.put(key, key).await;
    }
    let txn = range.begin_merge().await;

    let data = range.snapshot(&txn, "m").await.unwrap();
    assert_eq!(
        user_keys(&data),
        vec![
            Bytes::from_static(b"m"),
            Bytes::from_static(b"p"),
            Bytes::from_static(b"q"),
            Bytes::from_static(b"y"),
        ]
    );
    assert!(range.replica.is_merging());

    // The snapshot carries the descriptor with its deletion intent.
    let target = InMemEngine::new();
    target.apply_repr(&data).unwrap();
    let desc_key = range.replica.desc().local_key();
    let opts = MvccGetOptions {
        inconsistent: true,
        txn: None,
    };
    let (_, intents) = mvcc_get(&target, &desc_key, txn.write_timestamp, &opts).unwrap();
    assert_eq!(intents.len(), 1);
    assert_eq!(intents[0].txn.id, txn.id);
}

#[tokio::test]
async fn test_snapshot_from_non_adjacent_range_fails() {
    let range = TestRange::new("m", "z");
    range.put("p", "p").await;
    let txn = range.begin_merge().await;

    let err = range.snapshot(&txn, "n").await.unwrap_err();
    assert!(matches!(err, StoreError::RangesNotAdjacent { .. }));
    assert_eq!(err.kind(), ErrorKind::Invalid);
    assert!(!range.replica.is_merging());
}

#[tokio::test]
async fn test_snapshot_with_non_deletion_intent_fails() {
    let range = TestRange::new("m", "z");
    let desc = range.replica.desc();
    let mut updated = desc.clone();
    updated.generation += 1;
    let txn = TxnMeta::new(Bytes::from_static(b"m"), range.clock.now());
    range
        .replica
        .send(
            Header::with_txn(txn.clone()),
            PutRequest::new(desc.local_key(), updated.encode().unwrap()),
        )
        .await
        .unwrap();

    let err = range.snapshot(&txn, "m").await.unwrap_err();
    assert!(matches!(err, StoreError::NonDeletionIntent));
    assert!(!range.replica.is_merging());
}

#[tokio::test]
async fn test_snapshot_excludes_unreplicated_state() {
    let range = TestRange::new("m", "z");
    range.put("p", "p").await;
    let range_id = range.replica.range_id();
    let mut batch = range.replica.engine().new_batch();
    batch
        .put(
            MvccKey::meta(keys::raft_hard_state_key(range_id)),
            Bytes::from_static(b"hard-state"),
        )
        .unwrap();
    batch
        .put(
            MvccKey::meta(keys::range_applied_state_key(range_id)),
            Bytes::from_static(b"applied"),
        )
        .unwrap();
    batch.commit();
    let txn = range.begin_merge().await;

    let data = range.snapshot(&txn, "m").await.unwrap();
    let snapshot_keys: Vec<Bytes> = decode_repr(&data)
        .unwrap()
        .into_iter()
        .filter_map(|op| match op {
            BatchOp::Put(key, _) => Some(key.key),
            BatchOp::Clear(_) => None,
        })
        .collect();
    assert!(snapshot_keys.contains(&keys::range_applied_state_key(range_id)));
    assert!(snapshot_keys.contains(&keys::range_lease_key(range_id)));
    assert!(!snapshot_keys.contains(&keys::raft_hard_state_key(range_id)));
}

struct Ctx(RangeDescriptor, Settings);

impl EvalContext for Ctx {
    fn desc(&self) -> &RangeDescriptor {
        &self.0
    }

    fn settings(&self) -> &Settings {
        &self.1
    }
}

#[test]
fn test_repeated_snapshot_is_identical() {
    let clock = ManualClock::new(10);
    let desc = RangeDescriptor::new(RangeId(2), "m", "z", vec![]);
    let engine = InMemEngine::new();
    let mut batch = engine.new_batch();
    let ts = clock.now();
    mvcc_put(&mut batch, &desc.local_key(), ts, desc.encode().unwrap(), None).unwrap();
    for key in ["n", "o", "w"] {
        mvcc_put(&mut batch, key.as_bytes(), ts, Bytes::from(key), None).unwrap();
    }
    let txn = TxnMeta::new(Bytes::from_static(b"a"), clock.now());
    mvcc_delete(&mut batch, &desc.local_key(), txn.write_timestamp, Some(&txn)).unwrap();
    batch.commit();

    let ctx = Ctx(desc, Settings::default());
    let header = Header::with_txn(txn);
    let cancel = CancellationToken::new();
    let args = CommandArgs {
        eval_ctx: &ctx,
        header: &header,
        cancel: &cancel,
    };
    let request = Request::from(GetSnapshotForMergeRequest::new(left_desc("m")));
    let snapshot = || {
        let mut batch = engine.new_batch();
        let (resp, result) = request.eval(&mut batch, &args).unwrap();
        assert!(result.local.set_merging);
        resp.into_snapshot().unwrap().data
    };
    let first = snapshot();
    let second = snapshot();
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Start(Method),
    End(Method),
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_command_runs_during_snapshot() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let before_eval: EvalHook = {
        let events = events.clone();
        Arc::new(move |method: Method| {
            events.lock().push(Event::Start(method));
            // Widen the window in which an overlapping command would show.
            std::thread::sleep(Duration::from_millis(1));
        })
    };
    let after_eval: EvalHook = {
        let events = events.clone();
        Arc::new(move |method: Method| events.lock().push(Event::End(method)))
    };
    let knobs = EvalKnobs {
        before_eval: Some(before_eval),
        after_eval: Some(after_eval),
    };
    let range = Arc::new(TestRange::with_knobs("m", "z", knobs, settings()));
    range.put("m", "m").await;
    let txn = range.begin_merge().await;

    let writers: Vec<_> = ["n", "o", "p", "q", "r", "s", "t", "u"]
        .into_iter()
        .map(|key| {
            let range = range.clone();
            tokio::spawn(async move {
                let header = range.now();
                range
                    .replica
                    .send(header, PutRequest::new(key, key))
                    .await
            })
        })
        .collect();
    range.snapshot(&txn, "m").await.unwrap();
    range.finish_merge(&txn, TxnStatus::Aborted).await;
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    let events = events.lock().clone();
    let start = events
        .iter()
        .position(|e| *e == Event::Start(Method::GetSnapshotForMerge))
        .unwrap();
    assert_eq!(events[start + 1], Event::End(Method::GetSnapshotForMerge));
    let puts = events
        .iter()
        .filter(|e| **e == Event::End(Method::Put))
        .count();
    assert_eq!(puts, 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_committed_merge_subsumes_range() {
    let range = Arc::new(TestRange::new("m", "z"));
    range.put("p", "p").await;
    let txn = range.begin_merge().await;
    range.snapshot(&txn, "m").await.unwrap();

    let reader = {
        let range = range.clone();
        tokio::spawn(async move { range.get("p").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reader.is_finished());

    range.finish_merge(&txn, TxnStatus::Committed).await;
    let err = reader.await.unwrap().unwrap_err();
    assert!(matches!(err, StoreError::RangeSubsumed(id) if id == range.replica.range_id()));
    assert_eq!(err.kind(), ErrorKind::Closed);
    assert!(range.replica.is_subsumed());

    // Refused without another descriptor read.
    let err = range.get("p").await.unwrap_err();
    assert!(matches!(err, StoreError::RangeSubsumed(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_aborted_merge_resumes_serving() {
    let range = Arc::new(TestRange::new("m", "z"));
    range.put("p", "before").await;
    let txn = range.begin_merge().await;
    range.snapshot(&txn, "m").await.unwrap();

    let writer = {
        let range = range.clone();
        tokio::spawn(async move {
            let header = range.now();
            range
                .replica
                .send(header, PutRequest::new("p", "after"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());

    range.finish_merge(&txn, TxnStatus::Aborted).await;
    writer.await.unwrap().unwrap();
    assert!(!range.replica.is_merging());
    assert!(!range.replica.is_subsumed());
    assert_eq!(range.get("p").await.unwrap().unwrap(), "after");
}

#[tokio::test]
async fn test_wait_for_merge_times_out() {
    let settings = Settings {
        merge_watch_timeout: Some(Duration::from_millis(30)),
        ..settings()
    };
    let range = TestRange::with_knobs("m", "z", EvalKnobs::default(), settings);
    let txn = range.begin_merge().await;
    range.snapshot(&txn, "m").await.unwrap();

    let err = range.get("p").await.unwrap_err();
    assert!(matches!(err, StoreError::MergeWatchTimeout { .. }));
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(range.replica.is_merging());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successor_leaseholder_waits_for_merge() {
    let range = TestRange::new("m", "z");
    range.put("p", "p").await;
    let txn = range.begin_merge().await;
    range.snapshot(&txn, "m").await.unwrap();

    let successor = Arc::new(Replica::new(
        2,
        range.replica.desc(),
        range.replica.engine().clone(),
        range.clock.clone(),
        settings(),
    ));
    let lease = successor.acquire_lease().unwrap();
    assert_eq!(lease.replica_id, 2);

    let err = range.get("p").await.unwrap_err();
    assert!(matches!(err, StoreError::NotLeaseHolder { lease: Some(l), .. } if l == lease));

    assert!(!successor.is_merging());
    let reader = {
        let successor = successor.clone();
        let header = range.now();
        tokio::spawn(async move { successor.send(header, GetRequest::new("p")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reader.is_finished());
    assert!(successor.is_merging());

    let intent = Intent::new(successor.desc().local_key(), txn);
    successor
        .apply_intent_resolution(&[intent], TxnStatus::Committed)
        .await
        .unwrap();
    let err = reader.await.unwrap().unwrap_err();
    assert!(matches!(err, StoreError::RangeSubsumed(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reacquired_lease_reverifies_descriptor() {
    let range = Arc::new(TestRange::new("m", "z"));
    range.put("p", "p").await;

    // An intent this replica never evaluated, as left by a merge that began
    // under another leaseholder.
    let desc = range.replica.desc();
    let txn = TxnMeta::new(Bytes::from_static(b"a"), range.clock.now());
    let mut batch = range.replica.engine().new_batch();
    mvcc_delete(&mut batch, &desc.local_key(), txn.write_timestamp, Some(&txn)).unwrap();
    batch.commit();

    // The lease this replica verified under still serves.
    assert_eq!(range.get("p").await.unwrap().unwrap(), "p");

    range.replica.acquire_lease().unwrap();
    let reader = {
        let range = range.clone();
        tokio::spawn(async move { range.get("p").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reader.is_finished());

    range.finish_merge(&txn, TxnStatus::Aborted).await;
    assert_eq!(reader.await.unwrap().unwrap().unwrap(), "p");
}

#[tokio::test]
async fn test_revoked_lease_refuses_commands() {
    let range = TestRange::new("m", "z");
    range.put("p", "p").await;
    range.replica.revoke_lease();
    assert!(range.replica.lease().is_none());

    let err = range.get("p").await.unwrap_err();
    assert!(matches!(err, StoreError::NotLeaseHolder { .. }));
}

#[tokio::test]
async fn test_cancelled_snapshot_leaves_range_serving() {
    let range = TestRange::new("m", "z");
    range.put("p", "p").await;
    let txn = range.begin_merge().await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = range
        .replica
        .send_with_cancel(
            Header::with_txn(txn.clone()),
            GetSnapshotForMergeRequest::new(left_desc("m")).into(),
            cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Cancelled));
    assert!(!range.replica.is_merging());

    range.put("q", "q").await;
    assert_eq!(range.get("q").await.unwrap().unwrap(), "q");
}

#[tokio::test]
async fn test_commands_outside_range_are_rejected() {
    let range = TestRange::new("m", "z");
    let err = range.get("a").await.unwrap_err();
    assert!(matches!(err, StoreError::KeyNotInRange { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_merge_ahead_of_replica_clock_blocks_and_subsumes() {
    let range = Arc::new(TestRange::new("m", "z"));
    range.put("p", "before").await;

    // The merge transaction's timestamp is well ahead of the replica's clock.
    let txn = TxnMeta::new(Bytes::from_static(b"a"), Timestamp::new(5_000, 0));
    range
        .replica
        .send(
            Header::with_txn(txn.clone()),
            DeleteRequest::new(range.replica.desc().local_key()),
        )
        .await
        .unwrap();
    range.snapshot(&txn, "m").await.unwrap();
    assert!(range.replica.is_merging());

    let writer = {
        let range = range.clone();
        tokio::spawn(async move {
            range
                .replica
                .send(
                    Header::at(Timestamp::new(6_000, 0)),
                    PutRequest::new("p", "lost"),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());
    assert!(range.replica.is_merging());

    range.finish_merge(&txn, TxnStatus::Committed).await;
    let err = writer.await.unwrap().unwrap_err();
    assert!(matches!(err, StoreError::RangeSubsumed(_)));
    assert!(range.replica.is_subsumed());

    let resp = range
        .replica
        .send(
            Header::at(Timestamp::new(7_000, 0)),
            GetRequest::new("p"),
        )
        .await;
    assert!(matches!(resp, Err(StoreError::RangeSubsumed(_))));
}
