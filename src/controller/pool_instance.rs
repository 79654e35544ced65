//! Pool manager: the per-node reconcile loop of one PoolInstance
//!
//! Realizes the pool on the local node (import, else create), then keeps
//! it converged: raid-group expansion, disk replacement, dataset
//! properties and status.

use super::runner::{Action, Reconciler};
use crate::crd::{
    remove_condition, set_condition, Condition, ConditionStatus, PoolInstance, PoolInstanceStatus,
    PoolPhase,
    DISK_REPLACEMENT_CONDITION, DISK_UNAVAILABLE_CONDITION, POOL_EXPANSION_CONDITION,
    POOL_LOST_CONDITION, POOL_PROTECTION_FINALIZER,
};
use crate::domain::ports::{EventKind, EventRecorderRef};
use crate::error::{Error, Result, INSUFFICIENT_RESOURCES_REQUEUE, IN_PROGRESS_REQUEUE};
use crate::pool::{apply_replacement_condition, PoolEngine};
use crate::store::{ensure_finalizer, is_deleting, remove_finalizer, Stores};
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

pub struct PoolManager {
    engine: PoolEngine,
    stores: Stores,
    recorder: EventRecorderRef,
    instance_name: String,
}

impl PoolManager {
    pub fn new(
        engine: PoolEngine,
        stores: Stores,
        recorder: EventRecorderRef,
        instance_name: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            stores,
            recorder,
            instance_name: instance_name.into(),
        }
    }

    async fn event(&self, instance: &PoolInstance, kind: EventKind, reason: &str, message: String) {
        self.recorder
            .publish(instance.object_ref(&()), kind, reason, message)
            .await;
    }

    async fn get(&self) -> Result<Option<PoolInstance>> {
        self.stores.pool_instances.get(&self.instance_name).await
    }

    async fn write_status(&self, instance: &PoolInstance, status: PoolInstanceStatus) -> Result<()> {
        if instance.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let mut updated = instance.clone();
        updated.status = Some(status);
        self.stores.pool_instances.update_status(&updated).await?;
        Ok(())
    }

    async fn finalize(&self, instance: &PoolInstance) -> Result<Action> {
        if instance
            .finalizers()
            .iter()
            .any(|f| f == POOL_PROTECTION_FINALIZER)
        {
            self.engine.delete(instance).await?;
            remove_finalizer(
                self.stores.pool_instances.as_ref(),
                instance,
                POOL_PROTECTION_FINALIZER,
            )
            .await?;
            info!(instance = %instance.name(), pool = %self.engine.pool_name(), "Pool instance finalized");
        }
        Ok(Action::await_change())
    }

    /// Bring the pool onto the node. Returns false when a provisioned pool
    /// could not be found and was reported lost.
    async fn realize(&self, instance: &PoolInstance) -> Result<bool> {
        match self.engine.import(instance).await {
            Ok(()) => Ok(true),
            Err(Error::Import { reason, .. }) if instance.was_provisioned() => {
                warn!(
                    instance = %instance.name(),
                    pool = %self.engine.pool_name(),
                    reason = %reason,
                    "Provisioned pool not found on the node"
                );
                let mut status = instance.status.clone().unwrap_or_default();
                status.phase = PoolPhase::Offline;
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        POOL_LOST_CONDITION,
                        ConditionStatus::True,
                        "PoolNotFound",
                        format!("pool {} could not be imported: {}", self.engine.pool_name(), reason),
                    ),
                );
                self.write_status(instance, status).await?;
                self.event(
                    instance,
                    EventKind::Warning,
                    "PoolLost",
                    format!("pool {} could not be imported", self.engine.pool_name()),
                )
                .await;
                Ok(false)
            }
            Err(Error::Import { .. }) => {
                self.engine.create(instance).await?;
                info!(instance = %instance.name(), pool = %self.engine.pool_name(), "Pool created");
                self.event(
                    instance,
                    EventKind::Normal,
                    "PoolCreated",
                    format!("pool {} created", self.engine.pool_name()),
                )
                .await;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn converge(&self, instance: &PoolInstance) -> Result<Action> {
        let mut status = instance.status.clone().unwrap_or_default();

        match self.engine.expand(instance).await {
            Ok(0) => {}
            Ok(added) => {
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        POOL_EXPANSION_CONDITION,
                        ConditionStatus::False,
                        "PoolExpansionSuccess",
                        format!("added {} raid groups", added),
                    ),
                );
            }
            Err(e) => {
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        POOL_EXPANSION_CONDITION,
                        ConditionStatus::True,
                        "PoolExpansionFailed",
                        e.to_string(),
                    ),
                );
                self.write_status(instance, status).await?;
                return Err(e);
            }
        }

        let report = self.engine.replace_disks(instance).await?;
        apply_replacement_condition(
            &mut status.conditions,
            &report,
            instance.condition_true(DISK_REPLACEMENT_CONDITION),
        );

        let (phase, capacity) = self.engine.observe()?;
        status.read_only = self
            .engine
            .reconcile_properties(instance, capacity.used_percent())?;
        status.phase = phase;
        status.capacity = capacity;

        let unavailable = self.engine.topology()?.unavailable_devices();
        if unavailable.is_empty() {
            remove_condition(&mut status.conditions, DISK_UNAVAILABLE_CONDITION);
        } else {
            set_condition(
                &mut status.conditions,
                Condition::new(
                    DISK_UNAVAILABLE_CONDITION,
                    ConditionStatus::True,
                    "DiskUnavailable",
                    format!("unusable devices: {}", unavailable.join(", ")),
                ),
            );
        }
        remove_condition(&mut status.conditions, POOL_LOST_CONDITION);

        self.write_status(instance, status).await?;
        if report.is_outstanding() {
            return Ok(Action::requeue(IN_PROGRESS_REQUEUE));
        }
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for PoolManager {
    fn name(&self) -> &'static str {
        "pool-instance"
    }

    async fn reconcile(&self, key: &str) -> Result<Action> {
        if key != self.instance_name {
            return Ok(Action::await_change());
        }
        let Some(instance) = self.get().await? else {
            return Ok(Action::await_change());
        };
        if is_deleting(&instance) {
            return self.finalize(&instance).await;
        }
        let mut instance = ensure_finalizer(
            self.stores.pool_instances.as_ref(),
            &instance,
            POOL_PROTECTION_FINALIZER,
        )
        .await?;

        if !self.engine.exists()? {
            let realized = match self.realize(&instance).await {
                Ok(realized) => realized,
                Err(e) => {
                    if e.is_user_facing() {
                        self.event(&instance, EventKind::Warning, e.reason(), e.to_string())
                            .await;
                    }
                    return Err(e);
                }
            };
            if !realized {
                return Ok(Action::requeue(INSUFFICIENT_RESOURCES_REQUEUE));
            }
            // Import may have rewritten the instance annotations
            instance = match self.get().await? {
                Some(instance) => instance,
                None => return Ok(Action::await_change()),
            };
        }

        self.converge(&instance).await
    }
}
