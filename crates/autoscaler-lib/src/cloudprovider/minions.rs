//! Minion to instance projection
//!
//! Walks the minion resources of a kube-minions stack and derives the
//! orchestrator-visible state of each slot from the resource status and the
//! stack's refs map.

use super::api::{
    status, OrchestrationApi, StackRef, StackResource, CREATION_SENTINEL,
    MINION_DEPLOYMENT_RESOURCE, MINION_SERVER_RESOURCE,
};
use super::provider_id::{format_fake, format_openstack};
use crate::error::{ProviderError, ProviderResult};
use crate::models::{Instance, InstanceErrorInfo, InstanceState};
use std::collections::HashMap;
use tracing::{debug, trace};
use uuid::Uuid;

/// Outcome of classifying a single minion resource
#[derive(Debug, Clone, PartialEq)]
pub enum MinionDecision {
    /// Not reported to the orchestrator
    Skip,
    Report(Instance),
    /// Existing server in `UPDATE_IN_PROGRESS`. Its nested resources decide
    /// between running and creating.
    Inspect {
        provider_id: String,
        minion_stack_id: String,
    },
}

/// Returns the server UUID recorded for a minion index. Placeholders (the
/// index itself or the creation sentinel) do not count.
pub fn server_id(refs: &HashMap<String, String>, index: &str) -> Option<Uuid> {
    let value = refs.get(index)?;
    if value == CREATION_SENTINEL {
        return None;
    }
    Uuid::parse_str(value).ok()
}

/// Classifies one minion resource of group `group_id`.
pub fn classify(
    group_id: &str,
    minion: &StackResource,
    refs: &HashMap<String, String>,
) -> MinionDecision {
    let index = minion.name.as_str();
    let server = server_id(refs, index);
    let fake_id = || format_fake(group_id, index);
    let best_id = || server.as_ref().map(format_openstack).unwrap_or_else(fake_id);

    match minion.status.as_str() {
        status::DELETE_COMPLETE => MinionDecision::Skip,
        status::DELETE_IN_PROGRESS => match server {
            Some(id) => MinionDecision::Report(Instance::new(
                format_openstack(&id),
                InstanceState::Deleting,
            )),
            None => {
                debug!(minion = %index, "Minion is DELETE_IN_PROGRESS but has no server id");
                MinionDecision::Skip
            }
        },
        status::INIT_COMPLETE | status::CREATE_IN_PROGRESS => {
            MinionDecision::Report(Instance::new(best_id(), InstanceState::Creating))
        }
        status::UPDATE_IN_PROGRESS => match server {
            Some(id) => MinionDecision::Inspect {
                provider_id: format_openstack(&id),
                minion_stack_id: minion.physical_id.clone(),
            },
            None => {
                debug!(minion = %index, "Minion is UPDATE_IN_PROGRESS but has no server id");
                MinionDecision::Report(Instance::new(fake_id(), InstanceState::Creating))
            }
        },
        status::CREATE_FAILED | status::UPDATE_FAILED => {
            debug!(
                minion = %index,
                reason = %minion.status_reason,
                "Minion failed"
            );
            MinionDecision::Report(
                Instance::new(fake_id(), InstanceState::Creating)
                    .with_error(InstanceErrorInfo::from_status_reason(&minion.status_reason)),
            )
        }
        status::CREATE_COMPLETE | status::UPDATE_COMPLETE => {
            MinionDecision::Report(Instance::new(best_id(), InstanceState::Running))
        }
        other => {
            debug!(minion = %index, status = %other, "Ignoring minion in unknown state");
            MinionDecision::Skip
        }
    }
}

/// Decides the state of an updating minion from its nested resources. It is
/// running only if both the server and its configuration deployment have
/// completed creation.
pub fn nested_state(resources: &[StackResource]) -> InstanceState {
    let status_of = |name: &str| {
        resources
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.status.as_str())
    };
    let server = status_of(MINION_SERVER_RESOURCE);
    let deployment = status_of(MINION_DEPLOYMENT_RESOURCE);

    if server == Some(status::CREATE_COMPLETE) && deployment == Some(status::CREATE_COMPLETE) {
        InstanceState::Running
    } else {
        InstanceState::Creating
    }
}

/// Orders minion resources by numeric index so listings are stable.
fn sort_by_index(resources: &mut [StackResource]) {
    resources.sort_by(|a, b| {
        match (a.name.parse::<u64>(), b.name.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => a.name.cmp(&b.name),
        }
    });
}

/// Lists the instances of the minions stack `minions` belonging to `group_id`.
pub async fn list_minion_instances(
    heat: &dyn OrchestrationApi,
    group_id: &str,
    minions: &StackRef,
) -> ProviderResult<Vec<Instance>> {
    let mut resources = heat.list_stack_resources(minions).await?;
    sort_by_index(&mut resources);

    let stack = heat.get_stack(minions).await?;
    let refs = stack.refs_map().unwrap_or_default();

    let mut instances = Vec::with_capacity(resources.len());
    for minion in &resources {
        match classify(group_id, minion, &refs) {
            MinionDecision::Skip => {}
            MinionDecision::Report(instance) => instances.push(instance),
            MinionDecision::Inspect {
                provider_id,
                minion_stack_id,
            } => {
                let nested = heat
                    .find_stack_resources(&minion_stack_id)
                    .await
                    .map_err(|e| {
                        ProviderError::Unavailable(format!(
                            "could not get stack resources for minion {}: {}",
                            minion.name, e
                        ))
                    })?;
                let state = nested_state(&nested);
                trace!(minion = %minion.name, state = ?state, "Resolved updating minion");
                instances.push(Instance::new(provider_id, state));
            }
        }
    }

    Ok(instances)
}
