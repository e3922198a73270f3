//! # Merge guard
//!
//! Once a range has handed its data to its left-hand neighbor in a merge,
//! neither the replica that produced the snapshot nor any later leaseholder
//! may serve another command for the range until the merge transaction has
//! resolved. Before serving, a leaseholder must re-read its local descriptor:
//!
//! - deleted: the merge committed and the range has been subsumed, so the
//!   replica refuses every further command;
//! - carrying an intent: the merge is still in its critical phase, so the
//!   replica waits and re-reads;
//! - live without an intent: the merge aborted (or never began), so the
//!   replica resumes.
//!
//! [MergeGuardState::precondition] is the pure check made before every
//! command. The descriptor reads and the wait live in [read_descriptor_status]
//! and [wait_for_merge_resolution].

use backon::{ExponentialBuilder, Retryable};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::descriptor::{RangeDescriptor, RangeId};
use crate::engine::{MvccKeyRange, Reader};
use crate::error::StoreError;
use crate::mvcc::{mvcc_get, MvccGetOptions, MvccKey};
use crate::types::{Intent, Timestamp};

/// Names one tenure of a replica as leaseholder. Every acquisition of the lease
/// produces a token with a higher sequence than any before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken {
    pub replica_id: u64,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// The command may be served.
    Serve,
    /// The local descriptor must be re-read before serving.
    VerifyDescriptor,
    /// The range has been subsumed. Nothing may be served.
    Refuse,
}

/// A replica's in-memory view of the range's merge state.
#[derive(Debug, Clone, Default)]
pub struct MergeGuardState {
    merging: bool,
    subsumed: bool,
    /// The lease under which the descriptor was last found live.
    verified_lease: Option<LeaseToken>,
    /// Bumped each time the range enters the critical phase.
    merge_epoch: u64,
}

impl MergeGuardState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn precondition(&self, lease: LeaseToken) -> GuardDecision {
        if self.subsumed {
            GuardDecision::Refuse
        } else if self.merging || self.verified_lease != Some(lease) {
            GuardDecision::VerifyDescriptor
        } else {
            GuardDecision::Serve
        }
    }

    pub fn is_merging(&self) -> bool {
        self.merging
    }

    pub fn is_subsumed(&self) -> bool {
        self.subsumed
    }

    pub fn merge_epoch(&self) -> u64 {
        self.merge_epoch
    }

    /// The range has entered, or has been found in, the critical phase.
    pub fn set_merging(&mut self) {
        self.merging = true;
        self.merge_epoch += 1;
    }

    /// Records that the descriptor was found live under `lease`, having read
    /// it after observing `merge_epoch`. Returns false, leaving the state
    /// unchanged, when the range entered the critical phase since then.
    pub fn mark_verified(&mut self, lease: LeaseToken, merge_epoch: u64) -> bool {
        if self.subsumed || merge_epoch != self.merge_epoch {
            return false;
        }
        self.merging = false;
        self.verified_lease = Some(lease);
        true
    }

    pub fn mark_subsumed(&mut self) {
        self.merging = false;
        self.subsumed = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorStatus {
    Live(RangeDescriptor),
    /// The descriptor carries an intent whose transaction has not resolved.
    MergeInProgress(Intent),
    Deleted,
}

/// Reads the latest state of the local descriptor of `desc`'s range with a
/// consistent read. The read is made above every timestamp, so an intent or
/// tombstone written at a time ahead of the local clock is still seen.
pub fn read_descriptor_status<R: Reader + ?Sized>(
    reader: &R,
    desc: &RangeDescriptor,
) -> Result<DescriptorStatus, StoreError> {
    let desc_key = desc.local_key();
    match mvcc_get(reader, &desc_key, Timestamp::MAX, &MvccGetOptions::default()) {
        Ok((Some(value), _)) => Ok(DescriptorStatus::Live(RangeDescriptor::decode(&value)?)),
        Ok((None, _)) => {
            // A tombstone means the descriptor was deleted. No version at all
            // means this replica never held the range.
            let mut end = BytesMut::with_capacity(desc_key.len() + 1);
            end.put_slice(&desc_key);
            end.put_u8(0);
            let mut iter = reader.iter(MvccKeyRange::new(
                MvccKey::meta(desc_key.clone()),
                MvccKey::meta(end.freeze()),
            ))?;
            match iter.next_entry()? {
                Some(_) => Ok(DescriptorStatus::Deleted),
                None => Err(StoreError::DescriptorNotFound(desc.range_id)),
            }
        }
        Err(StoreError::WriteIntent { mut intents }) => match intents.pop() {
            Some(intent) => Ok(DescriptorStatus::MergeInProgress(intent)),
            None => Err(StoreError::WriteIntent { intents }),
        },
        Err(e) => Err(e),
    }
}

/// Re-reads the descriptor with `check` until the merge it is part of has
/// resolved, and returns the resolved status. Gives up with a retryable error
/// after `merge_watch_timeout`, if one is set.
pub async fn wait_for_merge_resolution<F>(
    range_id: RangeId,
    settings: &Settings,
    check: F,
) -> Result<DescriptorStatus, StoreError>
where
    F: Fn() -> Result<DescriptorStatus, StoreError>,
{
    let backoff = ExponentialBuilder::default()
        .without_max_times()
        .with_min_delay(settings.merge_watch_min_backoff)
        .with_max_delay(settings.merge_watch_max_backoff);
    let poll = || async {
        match check()? {
            DescriptorStatus::MergeInProgress(intent) => {
                debug!(txn = %intent.txn.id, "descriptor still carries merge intent");
                Err(StoreError::MergeInProgress(range_id))
            }
            status => Ok(status),
        }
    };
    let wait = poll
        .retry(backoff)
        .notify(|err: &StoreError, duration: Duration| {
            warn!(
                range_id = %range_id,
                "waiting for merge to resolve [error={}, duration={:?}]",
                err,
                duration
            );
        })
        .when(|err| matches!(err, StoreError::MergeInProgress(_)));

    match settings.merge_watch_timeout {
        Some(timeout) => tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| StoreError::MergeWatchTimeout { range_id, timeout })?,
        None => wait.await,
    }
}
