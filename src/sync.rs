//! Queue replay.
//!
//! The reconciler drains the pending-operation queue against the remote
//! server, oldest first. Replays are sequential; a pass never runs
//! concurrently with itself. Per-operation failures are recorded and the
//! pass moves on, except that a failure that is terminal for an entity
//! stops draining the remaining operations of that same entity, and a
//! network-class failure aborts the whole pass (everything left stays
//! queued for the next trigger).

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::auth::UserContext;
use crate::error::DataError;
use crate::models::{
    ConsumptionEntry, EntityId, EntityKind, Goal, NewConsumption, NewGoal, NewProduct,
    OperationKind, Product, SyncOperation, UpdateConsumption, UpdateProduct,
};
use crate::remote::{RemoteApi, RemoteError, RemoteErrorKind};
use crate::store::LocalStore;

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub success: u32,
    pub failed: u32,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started { user_id: i64 },
    Finished { user_id: i64, report: SyncReport },
}

enum ApplyOutcome {
    /// Replayed; carries the entity's final id (post-remap for creates,
    /// `None` for deletes) so the pass can keep the record's sync flag
    /// honest when further operations for it are still queued.
    Done(Option<EntityId>),
    /// The operation cannot be replayed yet (its entity has no server id)
    /// and stays queued without counting as a failure.
    Deferred,
}

enum OpError {
    Remote(RemoteError),
    Store(DataError),
}

impl From<RemoteError> for OpError {
    fn from(e: RemoteError) -> Self {
        OpError::Remote(e)
    }
}

impl From<DataError> for OpError {
    fn from(e: DataError) -> Self {
        OpError::Store(e)
    }
}

impl From<serde_json::Error> for OpError {
    fn from(e: serde_json::Error) -> Self {
        OpError::Store(e.into())
    }
}

pub struct Reconciler<R: RemoteApi> {
    store: Arc<LocalStore>,
    remote: R,
    running: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<R: RemoteApi> Reconciler<R> {
    pub fn new(store: Arc<LocalStore>, remote: R) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            store,
            remote,
            running: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Replay the user's pending operations, oldest first.
    ///
    /// Returns `Ok(None)` without touching the queue when another pass is
    /// already in flight. Errors are reserved for the store itself failing;
    /// remote failures are folded into the report.
    pub async fn reconcile(&self, ctx: &UserContext) -> Result<Option<SyncReport>, DataError> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(user_id = ctx.user_id, "reconcile already running, skipping");
            return Ok(None);
        }
        let _guard = RunningGuard(&self.running);

        let _ = self.events.send(SyncEvent::Started {
            user_id: ctx.user_id,
        });

        let mut report = SyncReport::default();
        let mut halted: HashSet<(EntityKind, EntityId)> = HashSet::new();
        let mut last_seen = 0_i64;

        // Re-read the queue each step: a successful create rewrites the ids
        // inside later operations, so a snapshot taken up front goes stale.
        loop {
            let Some(op) = self
                .store
                .list_pending(ctx.user_id)?
                .into_iter()
                .find(|op| op.id > last_seen)
            else {
                break;
            };
            last_seen = op.id;

            if let Some(id) = op.entity_id
                && halted.contains(&(op.entity, id))
            {
                debug!(operation = op.id, entity = op.entity.as_str(), "skipping operation for halted entity");
                continue;
            }

            match self.apply_operation(ctx, &op).await {
                Ok(ApplyOutcome::Done(final_id)) => {
                    self.store.dequeue(op.id)?;
                    if let Some(id) = final_id
                        && self.store.has_pending_for(ctx.user_id, op.entity, id)?
                    {
                        // A later operation for this entity is still queued;
                        // the record just written through is not final.
                        self.store.set_synced(op.entity, id, false)?;
                    }
                    report.success += 1;
                }
                Ok(ApplyOutcome::Deferred) => {
                    debug!(operation = op.id, "operation deferred, entity not yet on server");
                }
                Err(OpError::Store(e)) => return Err(e),
                Err(OpError::Remote(e)) => {
                    report.failed += 1;
                    warn!(operation = op.id, entity = op.entity.as_str(), error = %e, "replay failed");
                    if e.is_terminal_for_entity()
                        && let Some(id) = op.entity_id
                    {
                        halted.insert((op.entity, id));
                    }
                    if e.is_network() {
                        // The link just died; everything left would fail the
                        // same way. Abort the pass, keep the queue.
                        break;
                    }
                }
            }
        }

        info!(
            user_id = ctx.user_id,
            success = report.success,
            failed = report.failed,
            "reconcile pass finished"
        );
        let _ = self.events.send(SyncEvent::Finished {
            user_id: ctx.user_id,
            report,
        });
        Ok(Some(report))
    }

    /// Drive reconciliation from connectivity transitions: on every
    /// offline-to-online edge, wait out the debounce window, re-check the
    /// state, and run a pass if anything is pending. Returns when the
    /// connectivity sender is dropped.
    pub async fn run_auto(
        self: Arc<Self>,
        mut connectivity: watch::Receiver<bool>,
        ctx: UserContext,
        debounce: Duration,
    ) -> Result<(), DataError> {
        loop {
            if connectivity.changed().await.is_err() {
                return Ok(());
            }
            if !*connectivity.borrow_and_update() {
                continue;
            }
            tokio::time::sleep(debounce).await;
            if !*connectivity.borrow() {
                // Flickered back offline within the window.
                continue;
            }
            if self.store.pending_count(ctx.user_id)? == 0 {
                continue;
            }
            self.reconcile(&ctx).await?;
        }
    }

    async fn apply_operation(
        &self,
        ctx: &UserContext,
        op: &SyncOperation,
    ) -> Result<ApplyOutcome, OpError> {
        match (op.entity, op.kind) {
            (EntityKind::Product, OperationKind::Create) => {
                let record: Product = serde_json::from_value(op.payload.clone())?;
                let new = NewProduct {
                    name: record.name,
                    calories: record.calories,
                    protein: record.protein,
                    fat: record.fat,
                    carbs: record.carbs,
                };
                let server = self.remote.create_product(ctx.user_id, &new).await?;
                let id = server.id;
                self.promote(ctx, EntityKind::Product, op.entity_id, &server, id)?;
                Ok(ApplyOutcome::Done(Some(id)))
            }
            (EntityKind::Product, OperationKind::Update) => {
                let Some(remote_id) = op.entity_id.and_then(EntityId::as_remote) else {
                    return Ok(ApplyOutcome::Deferred);
                };
                let update: UpdateProduct = serde_json::from_value(op.payload.clone())?;
                let server = self
                    .remote
                    .update_product(ctx.user_id, remote_id, &update)
                    .await?;
                self.store.put(&server, true)?;
                Ok(ApplyOutcome::Done(op.entity_id))
            }
            (EntityKind::Product, OperationKind::Delete) => {
                let Some(remote_id) = op.entity_id.and_then(EntityId::as_remote) else {
                    return Ok(ApplyOutcome::Deferred);
                };
                self.remote.delete_product(ctx.user_id, remote_id).await?;
                if let Some(id) = op.entity_id {
                    self.store.delete::<Product>(id)?;
                }
                Ok(ApplyOutcome::Done(None))
            }
            (EntityKind::Consumption, OperationKind::Create) => {
                let record: ConsumptionEntry = serde_json::from_value(op.payload.clone())?;
                // The product's own create may still be ahead of us or have
                // failed; without its server id this entry cannot exist
                // remotely yet.
                let Some(product_remote_id) = record.product_id.as_remote() else {
                    return Ok(ApplyOutcome::Deferred);
                };
                let new = NewConsumption {
                    product_id: record.product_id,
                    amount: record.amount,
                    date: Some(record.date),
                };
                let server = self
                    .remote
                    .create_consumption(ctx.user_id, product_remote_id, &new)
                    .await?;
                let id = server.id;
                self.promote(ctx, EntityKind::Consumption, op.entity_id, &server, id)?;
                Ok(ApplyOutcome::Done(Some(id)))
            }
            (EntityKind::Consumption, OperationKind::Update) => {
                let Some(remote_id) = op.entity_id.and_then(EntityId::as_remote) else {
                    return Ok(ApplyOutcome::Deferred);
                };
                let update: UpdateConsumption = serde_json::from_value(op.payload.clone())?;
                let server = self
                    .remote
                    .update_consumption(ctx.user_id, remote_id, &update)
                    .await?;
                self.store.put(&server, true)?;
                Ok(ApplyOutcome::Done(op.entity_id))
            }
            (EntityKind::Consumption, OperationKind::Delete) => {
                let Some(remote_id) = op.entity_id.and_then(EntityId::as_remote) else {
                    return Ok(ApplyOutcome::Deferred);
                };
                self.remote
                    .delete_consumption(ctx.user_id, remote_id)
                    .await?;
                if let Some(id) = op.entity_id {
                    self.store.delete::<ConsumptionEntry>(id)?;
                }
                Ok(ApplyOutcome::Done(None))
            }
            (EntityKind::Goal, OperationKind::Create | OperationKind::Update) => {
                let record: Goal = serde_json::from_value(op.payload.clone())?;
                let new = NewGoal {
                    daily_calories: record.daily_calories,
                    daily_protein: record.daily_protein,
                    daily_fat: record.daily_fat,
                    daily_carbs: record.daily_carbs,
                    goal_type: record.goal_type,
                };
                let server = self.remote.upsert_goal(ctx.user_id, &new).await?;
                let id = server.id;
                self.promote(ctx, EntityKind::Goal, op.entity_id, &server, id)?;
                Ok(ApplyOutcome::Done(Some(id)))
            }
            (EntityKind::Goal, OperationKind::Delete) => Err(OpError::Remote(RemoteError::new(
                RemoteErrorKind::Validation,
                "goal deletion is not supported remotely",
            ))),
        }
    }

    /// After a successful create: move the placeholder id to the server id
    /// everywhere, then overwrite the record with server truth.
    fn promote<T: crate::store::Stored>(
        &self,
        ctx: &UserContext,
        entity: EntityKind,
        placeholder: Option<EntityId>,
        server: &T,
        server_id: EntityId,
    ) -> Result<(), OpError> {
        if let Some(id) = placeholder
            && id.is_local()
        {
            self.store.remap_id(ctx.user_id, entity, id, server_id)?;
        }
        self.store.put(server, true)?;
        Ok(())
    }
}
