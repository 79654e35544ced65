//! Disruption budgets over the pools backing HA volumes
//!
//! Every HA volume is protected by one budget selecting the pool pods that
//! host its replicas. Volumes placed on the same pool set share a budget;
//! a budget is deleted once no volume config references it any more.

use super::VolumeEngine;
use crate::crd::{VolumeConfig, CLUSTER_LABEL, DISRUPTION_BUDGET_LABEL, POOL_INSTANCE_LABEL};
use crate::domain::ports::LabelSelector;
use crate::error::{Error, Result};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector as K8sLabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::info;

/// Replica count from which a volume survives one pool outage
pub const HA_REPLICA_COUNT: usize = 3;

/// A volume is HA when it has at least three replicas
///
/// Placed volumes are judged by their confirmed pools, pending ones by the
/// requested replica count.
pub fn is_ha(vc: &VolumeConfig) -> bool {
    let pools = vc.status_pools();
    let count = if pools.is_empty() {
        vc.spec.replica_count as usize
    } else {
        pools.len()
    };
    count >= HA_REPLICA_COUNT
}

/// Selector matching the pool pods of `pools` in `cluster`
pub fn budget_selector(cluster: &str, pools: &[String]) -> K8sLabelSelector {
    let mut values = pools.to_vec();
    values.sort();
    values.dedup();

    let mut match_labels = BTreeMap::new();
    match_labels.insert(CLUSTER_LABEL.to_string(), cluster.to_string());
    K8sLabelSelector {
        match_labels: Some(match_labels),
        match_expressions: Some(vec![LabelSelectorRequirement {
            key: POOL_INSTANCE_LABEL.to_string(),
            operator: "In".to_string(),
            values: Some(values),
        }]),
    }
}

/// Evaluate a label selector against a label set
pub fn selector_matches(selector: &K8sLabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));
    if !labels_match {
        return false;
    }

    selector.match_expressions.iter().flatten().all(|req| {
        let value = labels.get(&req.key);
        let values = req.values.as_deref().unwrap_or(&[]);
        match req.operator.as_str() {
            "In" => value.map(|v| values.contains(v)).unwrap_or(false),
            "NotIn" => value.map(|v| !values.contains(v)).unwrap_or(true),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        }
    })
}

/// Sorted pool names a budget selects
pub fn budget_pools(pdb: &PodDisruptionBudget) -> Vec<String> {
    let mut pools: Vec<String> = pdb
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .and_then(|s| s.match_expressions.as_ref())
        .into_iter()
        .flatten()
        .filter(|req| req.key == POOL_INSTANCE_LABEL && req.operator == "In")
        .flat_map(|req| req.values.clone().unwrap_or_default())
        .collect();
    pools.sort();
    pools.dedup();
    pools
}

/// New budget allowing one unavailable pool pod
fn new_budget(cluster: &str, pools: &[String]) -> PodDisruptionBudget {
    let mut labels = BTreeMap::new();
    labels.insert(CLUSTER_LABEL.to_string(), cluster.to_string());
    PodDisruptionBudget {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", cluster)),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(1)),
            selector: Some(budget_selector(cluster, pools)),
            ..Default::default()
        }),
        status: None,
    }
}

fn sorted_pools(vc: &VolumeConfig) -> Vec<String> {
    let mut pools = vc.status_pools();
    pools.sort();
    pools
}

impl VolumeEngine {
    /// Make the budget label of `vc` match its current pool set
    pub async fn reconcile_budget(&self, vc: &VolumeConfig) -> Result<VolumeConfig> {
        let pools = sorted_pools(vc);
        let ha = is_ha(vc) && !pools.is_empty();

        let mut current = vc.clone();
        if let Some(name) = vc.budget_name() {
            let up_to_date = ha
                && self
                    .stores
                    .budgets
                    .get(name)
                    .await?
                    .map(|pdb| budget_pools(&pdb) == pools)
                    .unwrap_or(false);
            if up_to_date {
                return Ok(current);
            }
            current = self.release_budget(vc).await?;
        }
        if !ha {
            return Ok(current);
        }

        let budget = self.find_or_create_budget(&vc.spec.cluster, &pools).await?;
        let name = budget.name_any();
        let mut labelled = current.clone();
        labelled
            .labels_mut()
            .insert(DISRUPTION_BUDGET_LABEL.to_string(), name.clone());
        let labelled = self
            .stores
            .volume_configs
            .patch(&current, &labelled)
            .await?;
        info!(volume = %vc.name(), budget = %name, "Volume protected by disruption budget");
        Ok(labelled)
    }

    /// Drop the budget label from `vc`, deleting the budget when unused
    pub async fn release_budget(&self, vc: &VolumeConfig) -> Result<VolumeConfig> {
        let Some(name) = vc.budget_name().map(str::to_string) else {
            return Ok(vc.clone());
        };

        let mut unlabelled = vc.clone();
        unlabelled.labels_mut().remove(DISRUPTION_BUDGET_LABEL);
        let unlabelled = self.stores.volume_configs.patch(vc, &unlabelled).await?;

        let users = self
            .stores
            .volume_configs
            .list(&LabelSelector::label(DISRUPTION_BUDGET_LABEL, name.as_str()))
            .await?;
        if users.iter().all(|other| other.name() == vc.name()) {
            self.stores.budgets.delete(&name).await?;
            info!(volume = %vc.name(), budget = %name, "Disruption budget deleted");
        }
        Ok(unlabelled)
    }

    async fn find_or_create_budget(
        &self,
        cluster: &str,
        pools: &[String],
    ) -> Result<PodDisruptionBudget> {
        let existing = self
            .stores
            .budgets
            .list(&LabelSelector::label(CLUSTER_LABEL, cluster))
            .await?;
        if let Some(pdb) = existing.into_iter().find(|pdb| budget_pools(pdb) == pools) {
            return Ok(pdb);
        }
        let pdb = match self.stores.budgets.create(&new_budget(cluster, pools)).await {
            Ok(pdb) => pdb,
            Err(Error::ResourceExists { name, .. } | Error::Conflict { name, .. }) => {
                return Err(Error::BudgetConflict(format!(
                    "budget {} for pools {} clashes with an existing one",
                    name,
                    pools.join(",")
                )));
            }
            Err(e) => return Err(e),
        };
        info!(budget = %pdb.name_any(), pools = ?pools, "Disruption budget created");
        Ok(pdb)
    }
}
