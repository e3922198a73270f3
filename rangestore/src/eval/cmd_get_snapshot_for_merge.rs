use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::descriptor::RangeDescriptor;
use crate::engine::{EngineIterator, InMemEngine, ReadWriter, Reader, Writer};
use crate::error::StoreError;
use crate::eval::{Command, CommandArgs, EvalResult, Header, LocalResult};
use crate::keys;
use crate::mvcc::{mvcc_get, mvcc_get_as_txn, MvccGetOptions};
use crate::rditer::ReplicaDataIterator;
use crate::spanset::{Span, SpanAccess, SpanSet};
use crate::types::{Intent, Timestamp};

/// Sent by the left-hand range of a merge to its right-hand neighbor once the
/// merge transaction has placed deletion intents on both copies of the
/// right-hand descriptor. The response carries a snapshot of the right-hand
/// range's replicated data.
///
/// When the request succeeds the right-hand replica guarantees that:
///
/// 1. it held the lease when the snapshot was taken,
/// 2. no other command was in flight while the snapshot was taken,
/// 3. the snapshot reflects the latest writes to the range,
/// 4. neither it nor any later leaseholder serves another command before
///    re-reading its descriptor, and
/// 5. a leaseholder that finds its descriptor deleted stops serving the range
///    for good.
///
/// Guarantees 4 and 5 are enforced by the replica's merge guard, driven by the
/// `set_merging` flag in the result.
#[derive(Debug, Clone)]
pub struct GetSnapshotForMergeRequest {
    /// The caller's descriptor, which must end where this range starts.
    pub left_desc: RangeDescriptor,
}

impl GetSnapshotForMergeRequest {
    pub fn new(left_desc: RangeDescriptor) -> Self {
        Self { left_desc }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetSnapshotForMergeResponse {
    /// A serialized batch, see [crate::engine::decode_repr].
    pub data: Bytes,
}

impl Command for GetSnapshotForMergeRequest {
    type Response = GetSnapshotForMergeResponse;

    /// Declares read-write access to every addressable key of the range, its
    /// range-local keys and its replicated range-ID keys. Every command
    /// declares at least one key of its range, so this conflicts with all of
    /// them. Nothing is written.
    fn declare_keys(&self, desc: &RangeDescriptor, _header: &Header, spans: &mut SpanSet) {
        spans.add(
            SpanAccess::ReadWrite,
            Span::range(desc.start_key.clone(), desc.end_key.clone()),
        );
        spans.add(
            SpanAccess::ReadWrite,
            Span::range(
                keys::make_range_key_prefix(&desc.start_key),
                keys::prefix_end(&keys::make_range_key_prefix(&desc.end_key)),
            ),
        );
        let range_id_prefix = keys::make_range_id_replicated_prefix(desc.range_id);
        let range_id_end = keys::prefix_end(&range_id_prefix);
        spans.add(
            SpanAccess::ReadWrite,
            Span::range(range_id_prefix, range_id_end),
        );
    }

    #[instrument(
        level = "debug",
        skip_all,
        fields(range_id = %args.eval_ctx.desc().range_id),
        err(level = tracing::Level::DEBUG)
    )]
    fn eval(
        &self,
        rw: &mut dyn ReadWriter,
        args: &CommandArgs<'_>,
    ) -> Result<(GetSnapshotForMergeResponse, EvalResult), StoreError> {
        let desc = args.eval_ctx.desc();

        // The merge transaction orders its operations so the ranges are
        // adjacent here. Checked anyway.
        if self.left_desc.end_key != desc.start_key {
            return Err(StoreError::RangesNotAdjacent {
                left_end: self.left_desc.end_key.clone(),
                right_start: desc.start_key.clone(),
            });
        }

        check_local_deletion_intent(&*rw, desc, args.header.timestamp)?;

        // The deletion intent on the meta2 copy of the descriptor matters as
        // much as the local one, but confirming it would cost a round trip to
        // the meta range. Its presence is assumed from the merge transaction
        // writing both intents atomically.
        debug!(
            meta_key = ?desc.meta_key(),
            "assuming merge transaction holds a deletion intent on meta descriptor"
        );

        let data = capture_snapshot(
            &*rw,
            desc,
            args.cancel,
            args.eval_ctx.settings().max_snapshot_bytes,
        )?;
        debug!(snapshot_bytes = data.len(), "captured merge snapshot");

        Ok((
            GetSnapshotForMergeResponse { data },
            EvalResult {
                local: LocalResult { set_merging: true },
            },
        ))
    }
}

/// Confirms a merge is in progress: the local descriptor must carry exactly
/// one intent, and it must be a deletion.
fn check_local_deletion_intent<R: Reader + ?Sized>(
    reader: &R,
    desc: &RangeDescriptor,
    ts: Timestamp,
) -> Result<(), StoreError> {
    let desc_key = desc.local_key();
    let opts = MvccGetOptions {
        inconsistent: true,
        txn: None,
    };
    let (_, intents) =
        mvcc_get(reader, &desc_key, ts, &opts).map_err(|e| StoreError::LocalDescriptorRead {
            source: Box::new(e),
        })?;
    let intent = single_intent(intents)?;

    let value = mvcc_get_as_txn(reader, &desc_key, ts, &intent.txn).map_err(|e| {
        StoreError::LocalDescriptorReadAsTxn {
            source: Box::new(e),
        }
    })?;
    if value.is_some() {
        return Err(StoreError::NonDeletionIntent);
    }
    Ok(())
}

/// A key holds at most one intent. More than one means the storage layer is
/// corrupt, and no snapshot built on it can be trusted.
#[allow(clippy::panic)]
fn single_intent(mut intents: Vec<Intent>) -> Result<Intent, StoreError> {
    if intents.len() > 1 {
        error!(
            count = intents.len(),
            "impossible number of intents on local range descriptor"
        );
        panic!(
            "impossible number of intents on local range descriptor ({})",
            intents.len()
        );
    }
    intents.pop().ok_or(StoreError::MissingMergeIntent)
}

/// Copies every replicated entry of the range, as raw engine keys and values,
/// into a batch over a throwaway engine and returns the batch's serialized
/// form. The walk reads through `reader`, so it sees writes made earlier in
/// the same evaluation.
// TODO: the whole range is buffered in memory; capture in bounded chunks
// once the receiving side can ingest a multi-part snapshot atomically.
fn capture_snapshot<R: Reader + ?Sized>(
    reader: &R,
    desc: &RangeDescriptor,
    cancel: &CancellationToken,
    max_snapshot_bytes: Option<usize>,
) -> Result<Bytes, StoreError> {
    let engine = InMemEngine::new();
    let mut snapshot = engine.new_batch();
    let mut iter = ReplicaDataIterator::new(desc, reader, true);
    loop {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let Some(entry) = iter.next_entry()? else {
            break;
        };
        snapshot.put(entry.key, entry.value)?;
        if let Some(limit) = max_snapshot_bytes {
            if snapshot.size_bytes() > limit {
                return Err(StoreError::SnapshotTooLarge {
                    size: snapshot.size_bytes(),
                    limit,
                });
            }
        }
    }
    Ok(snapshot.repr())
}
