//! Contract builder
//!
//! Merges routing fragments into a single contract. A resource enters the
//! contract once its candidate address is ready, or when the current contract
//! already routes to it with the same ingress through the same candidate
//! address. A changed address is gated again. Resources that are not ready
//! yet are reported as pending and left out, together with any egress that
//! attaches to them. A new generation is minted only when the merged content
//! differs from the current contract.

use crate::fragment::{CandidateAddress, FragmentKind, ParentRef, RoutingFragment};
use crate::prober::Prober;
use kafka_eventing_contract::{Contract, Egress, Resource};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A resource left out of the contract because its address is not ready
#[derive(Debug, Clone, PartialEq)]
pub struct PendingResource {
    pub uid: String,
    pub address: CandidateAddress,
    /// Consecutive failed probes so far
    pub failures: u32,
}

/// An egress left out because its parent is missing or pending
#[derive(Debug, Clone, PartialEq)]
pub struct DetachedEgress {
    pub uid: String,
    pub parent: ParentRef,
}

/// Result of one build
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// The contract to publish; equal to the current one when unchanged
    pub contract: Contract,
    /// Whether a new generation was minted
    pub changed: bool,
    pub pending: Vec<PendingResource>,
    pub detached: Vec<DetachedEgress>,
    /// Every candidate address referenced by a fragment, admitted or not
    pub referenced: HashSet<CandidateAddress>,
    /// Candidate address of every resource in `contract`, by uid
    pub admitted: HashMap<String, CandidateAddress>,
}

impl BuildOutcome {
    /// Pending entry for a resource uid
    pub fn pending_resource(&self, uid: &str) -> Option<&PendingResource> {
        self.pending.iter().find(|p| p.uid == uid)
    }

    /// Detached entry for an egress uid
    pub fn detached_egress(&self, uid: &str) -> Option<&DetachedEgress> {
        self.detached.iter().find(|d| d.uid == uid)
    }
}

/// Build the next contract from `fragments`.
///
/// `admitted` holds the candidate addresses the resources of `current` were
/// admitted through, as returned by the previous build. A resource of
/// `current` missing from it (a contract loaded from storage) keeps its
/// route under whatever address it now reports.
///
/// When two fragments carry the same uid the one observed later wins; on a
/// tie the one appearing later in `fragments` wins.
pub fn build<I>(
    fragments: I,
    prober: &Prober,
    current: &Contract,
    admitted: &HashMap<String, CandidateAddress>,
) -> BuildOutcome
where
    I: IntoIterator<Item = RoutingFragment>,
{
    let mut latest: HashMap<String, RoutingFragment> = HashMap::new();
    for fragment in fragments {
        match latest.get(&fragment.uid) {
            Some(existing) if existing.observed_at > fragment.observed_at => {}
            _ => {
                latest.insert(fragment.uid.clone(), fragment);
            }
        }
    }

    let mut resources: Vec<Resource> = Vec::new();
    let mut pending = Vec::new();
    let mut egresses: Vec<(ParentRef, Egress)> = Vec::new();
    let mut referenced = HashSet::new();
    let mut routed = HashMap::new();

    for fragment in latest.into_values() {
        match fragment.kind {
            FragmentKind::Resource { resource, address } => {
                referenced.insert(address.clone());
                if carried(current, admitted, &resource, &address) || prober.is_ready(&address) {
                    routed.insert(resource.uid.clone(), address);
                    resources.push(resource);
                } else {
                    pending.push(PendingResource {
                        uid: resource.uid,
                        failures: prober.failures(&address),
                        address,
                    });
                }
            }
            FragmentKind::Egress { parent, egress } => egresses.push((parent, egress)),
        }
    }

    let mut detached = Vec::new();
    for (parent, egress) in egresses {
        match resources
            .iter_mut()
            .find(|resource| parent.matches(&resource.reference))
        {
            Some(resource) => resource.egresses.push(egress),
            None => detached.push(DetachedEgress {
                uid: egress.uid,
                parent,
            }),
        }
    }

    for resource in &mut resources {
        resource.egresses.sort_by(|a, b| a.uid.cmp(&b.uid));
    }
    resources.sort_by(|a, b| a.uid.cmp(&b.uid));
    pending.sort_by(|a, b| a.uid.cmp(&b.uid));
    detached.sort_by(|a, b| a.uid.cmp(&b.uid));

    let candidate = Contract::new(current.generation, resources);
    let (contract, changed) = if candidate.same_content(current) {
        (current.clone(), false)
    } else {
        (Contract::new(current.generation + 1, candidate.resources), true)
    };

    debug!(
        generation = contract.generation,
        changed,
        resources = contract.resources.len(),
        pending = pending.len(),
        detached = detached.len(),
        "Contract built"
    );

    BuildOutcome {
        contract,
        changed,
        pending,
        detached,
        referenced,
        admitted: routed,
    }
}

/// Already routed with the same ingress and address; not re-gated
fn carried(
    current: &Contract,
    admitted: &HashMap<String, CandidateAddress>,
    resource: &Resource,
    address: &CandidateAddress,
) -> bool {
    current
        .resource(&resource.uid)
        .is_some_and(|existing| existing.ingress == resource.ingress)
        && admitted
            .get(&resource.uid)
            .map_or(true, |previous| previous == address)
}
