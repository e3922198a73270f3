//! # Replica
//!
//! A replica serves commands for one range. Each command passes through:
//!
//! 1. the lease check: the replica must hold the range's current lease;
//! 2. the merge guard, which may re-read the descriptor and wait for an
//!    in-progress merge to resolve;
//! 3. key declaration and latching, which orders the command after every
//!    earlier conflicting command;
//! 4. the merge guard again, now under latches, since a merge snapshot may
//!    have been taken while this command waited;
//! 5. evaluation on a fresh batch, commit, and application of the local
//!    result.
//!
//! The replica's clock is moved forward to every request timestamp it sees,
//! so the timestamps it hands out order after the writes it has served.
//!
//! A new [Replica] over the same engine models a successor leaseholder. It
//! starts with no verified descriptor, so it re-reads the descriptor before
//! serving its first command.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::config::Settings;
use crate::descriptor::{RangeDescriptor, RangeId};
use crate::engine::{InMemEngine, Reader, Writer};
use crate::error::StoreError;
use crate::eval::{CommandArgs, EvalContext, EvalResult, Header, Method, Request, Response};
use crate::guard::{
    read_descriptor_status, wait_for_merge_resolution, DescriptorStatus, GuardDecision,
    LeaseToken, MergeGuardState,
};
use crate::keys;
use crate::mvcc::{mvcc_put, mvcc_resolve_write_intent, MvccKey};
use crate::spanlatch::LatchManager;
use crate::spanset::{Span, SpanAccess, SpanSet, SpanSetReadWriter};
use crate::types::{Intent, TxnStatus};

pub type EvalHook = Arc<dyn Fn(Method) + Send + Sync>;

/// Hooks run around command evaluation, while the command holds its latches.
#[derive(Clone, Default)]
pub struct EvalKnobs {
    pub before_eval: Option<EvalHook>,
    pub after_eval: Option<EvalHook>,
}

struct ReplicaEvalContext<'a> {
    desc: &'a RangeDescriptor,
    settings: &'a Settings,
}

impl EvalContext for ReplicaEvalContext<'_> {
    fn desc(&self) -> &RangeDescriptor {
        self.desc
    }

    fn settings(&self) -> &Settings {
        self.settings
    }
}

pub struct Replica {
    replica_id: u64,
    desc: RwLock<RangeDescriptor>,
    engine: Arc<InMemEngine>,
    latches: LatchManager,
    clock: Arc<dyn Clock>,
    settings: Settings,
    lease: Mutex<Option<LeaseToken>>,
    guard: Mutex<MergeGuardState>,
    knobs: EvalKnobs,
}

impl Replica {
    /// Opens a replica of an existing range stored in `engine`.
    pub fn new(
        replica_id: u64,
        desc: RangeDescriptor,
        engine: Arc<InMemEngine>,
        clock: Arc<dyn Clock>,
        settings: Settings,
    ) -> Self {
        Self {
            replica_id,
            desc: RwLock::new(desc),
            engine,
            latches: LatchManager::new(),
            clock,
            settings,
            lease: Mutex::new(None),
            guard: Mutex::new(MergeGuardState::new()),
            knobs: EvalKnobs::default(),
        }
    }

    /// Creates a new range: writes its local and meta descriptors to `engine`
    /// and opens a replica of it.
    pub fn bootstrap(
        replica_id: u64,
        desc: RangeDescriptor,
        engine: Arc<InMemEngine>,
        clock: Arc<dyn Clock>,
        settings: Settings,
    ) -> Result<Self, StoreError> {
        let ts = clock.now();
        let encoded = desc.encode()?;
        let mut batch = engine.new_batch();
        mvcc_put(&mut batch, &desc.local_key(), ts, encoded.clone(), None)?;
        mvcc_put(&mut batch, &desc.meta_key(), ts, encoded, None)?;
        batch.commit();
        info!(range = %desc, replica_id, "bootstrapped range");
        Ok(Self::new(replica_id, desc, engine, clock, settings))
    }

    pub fn with_knobs(mut self, knobs: EvalKnobs) -> Self {
        self.knobs = knobs;
        self
    }

    pub fn replica_id(&self) -> u64 {
        self.replica_id
    }

    pub fn range_id(&self) -> RangeId {
        self.desc.read().range_id
    }

    pub fn desc(&self) -> RangeDescriptor {
        self.desc.read().clone()
    }

    pub fn engine(&self) -> &Arc<InMemEngine> {
        &self.engine
    }

    pub fn lease(&self) -> Option<LeaseToken> {
        *self.lease.lock()
    }

    pub fn is_merging(&self) -> bool {
        self.guard.lock().is_merging()
    }

    pub fn is_subsumed(&self) -> bool {
        self.guard.lock().is_subsumed()
    }

    fn stored_lease(&self) -> Result<Option<LeaseToken>, StoreError> {
        let key = MvccKey::meta(keys::range_lease_key(self.range_id()));
        match self.engine.get(&key)? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| StoreError::InvalidLease(Arc::new(e))),
            None => Ok(None),
        }
    }

    /// Takes the lease for this replica, superseding any earlier holder.
    pub fn acquire_lease(&self) -> Result<LeaseToken, StoreError> {
        let mut held = self.lease.lock();
        let sequence = self.stored_lease()?.map_or(1, |lease| lease.sequence + 1);
        let lease = LeaseToken {
            replica_id: self.replica_id,
            sequence,
        };
        let encoded = serde_json::to_vec(&lease).map_err(|e| StoreError::InvalidLease(Arc::new(e)))?;
        let mut batch = self.engine.new_batch();
        batch.put(
            MvccKey::meta(keys::range_lease_key(self.range_id())),
            Bytes::from(encoded),
        )?;
        batch.commit();
        *held = Some(lease);
        info!(range_id = %self.range_id(), replica_id = self.replica_id, sequence, "acquired lease");
        Ok(lease)
    }

    /// Stops serving under the current lease.
    pub fn revoke_lease(&self) {
        if let Some(lease) = self.lease.lock().take() {
            info!(range_id = %self.range_id(), sequence = lease.sequence, "revoked lease");
        }
    }

    fn check_lease(&self) -> Result<LeaseToken, StoreError> {
        let held = *self.lease.lock();
        let stored = self.stored_lease()?;
        match held {
            Some(lease) if stored == Some(lease) => Ok(lease),
            _ => Err(StoreError::NotLeaseHolder {
                range_id: self.range_id(),
                lease: stored,
            }),
        }
    }

    fn read_status(&self, desc: &RangeDescriptor) -> Result<DescriptorStatus, StoreError> {
        read_descriptor_status(self.engine.as_ref(), desc)
    }

    /// Runs the merge guard until it allows serving under `lease`.
    async fn ensure_servable(&self, lease: LeaseToken) -> Result<(), StoreError> {
        loop {
            let (decision, merge_epoch) = {
                let guard = self.guard.lock();
                (guard.precondition(lease), guard.merge_epoch())
            };
            debug!(?decision, "merge guard decision");
            match decision {
                GuardDecision::Serve => return Ok(()),
                GuardDecision::Refuse => return Err(StoreError::RangeSubsumed(self.range_id())),
                GuardDecision::VerifyDescriptor => {
                    self.verify_descriptor(lease, merge_epoch).await?;
                }
            }
        }
    }

    async fn verify_descriptor(
        &self,
        lease: LeaseToken,
        mut merge_epoch: u64,
    ) -> Result<(), StoreError> {
        let desc = self.desc();
        let status = match self.read_status(&desc)? {
            DescriptorStatus::MergeInProgress(intent) => {
                info!(range_id = %desc.range_id, txn = %intent.txn.id, "range is in the critical phase of a merge; waiting");
                merge_epoch = {
                    let mut guard = self.guard.lock();
                    guard.set_merging();
                    guard.merge_epoch()
                };
                wait_for_merge_resolution(desc.range_id, &self.settings, || {
                    self.read_status(&desc)
                })
                .await?
            }
            status => status,
        };

        match status {
            DescriptorStatus::Live(current) => {
                let mut guard = self.guard.lock();
                let was_merging = guard.is_merging();
                // Fails when a merge began during the read; the caller then
                // verifies again.
                if guard.mark_verified(lease, merge_epoch) {
                    *self.desc.write() = current;
                    if was_merging {
                        info!(range_id = %desc.range_id, "merge did not commit; resuming");
                    }
                }
                Ok(())
            }
            DescriptorStatus::Deleted => {
                self.guard.lock().mark_subsumed();
                info!(range_id = %desc.range_id, "range descriptor deleted; range subsumed");
                Err(StoreError::RangeSubsumed(desc.range_id))
            }
            DescriptorStatus::MergeInProgress(_) => Err(StoreError::MergeInProgress(desc.range_id)),
        }
    }

    /// Sends `request` to the replica.
    pub async fn send(
        &self,
        header: Header,
        request: impl Into<Request>,
    ) -> Result<Response, StoreError> {
        self.send_with_cancel(header, request.into(), CancellationToken::new())
            .await
    }

    #[instrument(
        level = "debug",
        skip_all,
        fields(range_id = %self.range_id(), method = %request.method()),
        err(level = tracing::Level::DEBUG)
    )]
    pub async fn send_with_cancel(
        &self,
        header: Header,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Response, StoreError> {
        self.clock.update(header.timestamp);
        loop {
            let lease = self.check_lease()?;
            self.ensure_servable(lease).await?;

            let desc = self.desc();
            let mut spans = SpanSet::new();
            request.declare_keys(&desc, &header, &mut spans);
            check_spans_in_range(&desc, &spans)?;

            let latch = self.latches.acquire(spans.clone()).await;

            // The lease or the merge state may have changed while waiting.
            if self.check_lease()? != lease {
                continue;
            }
            let decision = self.guard.lock().precondition(lease);
            match decision {
                GuardDecision::Serve => {}
                GuardDecision::Refuse => return Err(StoreError::RangeSubsumed(desc.range_id)),
                GuardDecision::VerifyDescriptor => {
                    drop(latch);
                    continue;
                }
            }

            let response = self.evaluate(&desc, &header, &request, &spans, &cancel);
            drop(latch);
            return response;
        }
    }

    fn evaluate(
        &self,
        desc: &RangeDescriptor,
        header: &Header,
        request: &Request,
        spans: &SpanSet,
        cancel: &CancellationToken,
    ) -> Result<Response, StoreError> {
        let method = request.method();
        if let Some(hook) = &self.knobs.before_eval {
            hook(method);
        }

        let mut batch = self.engine.new_batch();
        let outcome = {
            let mut rw = SpanSetReadWriter::new(&mut batch, spans);
            let ctx = ReplicaEvalContext {
                desc,
                settings: &self.settings,
            };
            let args = CommandArgs {
                eval_ctx: &ctx,
                header,
                cancel,
            };
            request.eval(&mut rw, &args)
        };

        if let Some(hook) = &self.knobs.after_eval {
            hook(method);
        }

        let (response, result) = outcome?;
        batch.commit();
        self.apply_local_result(result);
        Ok(response)
    }

    fn apply_local_result(&self, result: EvalResult) {
        if result.local.set_merging {
            self.guard.lock().set_merging();
            info!(range_id = %self.range_id(), "range entered the critical phase of a merge");
        }
    }

    /// Applies the resolution of `intents` once their transaction has
    /// finished. Runs regardless of the merge guard, since resolving the merge
    /// transaction is what ends the critical phase. Returns the number of
    /// intents resolved.
    pub async fn apply_intent_resolution(
        &self,
        intents: &[Intent],
        status: TxnStatus,
    ) -> Result<usize, StoreError> {
        let mut spans = SpanSet::new();
        for intent in intents {
            spans.add(SpanAccess::ReadWrite, Span::point(intent.key.clone()));
        }
        let _latch = self.latches.acquire(spans).await;

        let mut batch = self.engine.new_batch();
        let mut resolved = 0;
        for intent in intents {
            if mvcc_resolve_write_intent(&mut batch, intent, status)? {
                resolved += 1;
            }
        }
        batch.commit();
        debug!(resolved, ?status, "applied intent resolution");
        Ok(resolved)
    }
}

/// Checks that every declared span lies within `desc`. Range-ID keys belong
/// to the range by construction. Range-local spans are checked by the key
/// they are addressed by.
fn check_spans_in_range(desc: &RangeDescriptor, spans: &SpanSet) -> Result<(), StoreError> {
    for (_, span) in spans.iter() {
        let Some(start) = keys::addr(&span.key)? else {
            continue;
        };
        let in_range = match &span.end_key {
            Some(end) if !keys::is_local(&span.key) => {
                desc.contains_key(&start) && end.as_ref() <= desc.end_key.as_ref()
            }
            _ => desc.contains_key(&start),
        };
        if !in_range {
            return Err(StoreError::KeyNotInRange {
                key: span.key.clone(),
                range_id: desc.range_id,
            });
        }
    }
    Ok(())
}
