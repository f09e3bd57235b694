//! # Identity Clusters
//!
//! A cluster is an ordered, non-empty collection of references believed to
//! denote one real-world entity, together with its audit state: merge
//! ledger, positive/negative cross-links, and per-member trace history.

use crate::model::{IdentityId, MergedView, RefId, Reference, Trace};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A resolved identity: its members and audit state.
///
/// A reference id belongs to at most one live cluster at any time. Merging
/// dissolves the absorbed cluster's id, but its ledger entry persists in
/// the survivor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Stable identity id, held while the cluster is alive.
    pub identity: IdentityId,
    /// True when loaded from a prior run's durable repository.
    pub persistent: bool,
    /// Creation date; merges keep the earlier of the two.
    pub created: DateTime<Utc>,
    /// Member references, in attachment order. Never empty.
    members: Vec<Reference>,
    /// Absorbed identity id -> the reference ids it contributed, for audit.
    ledger: BTreeMap<IdentityId, Vec<RefId>>,
    /// Identities positively linked to this one.
    pub positive_links: BTreeSet<IdentityId>,
    /// Identities this cluster must never be auto-merged with.
    pub negative_links: BTreeSet<IdentityId>,
    /// Per-member trace history.
    traces: BTreeMap<RefId, Vec<Trace>>,
}

impl Cluster {
    /// Create a new singleton cluster around one reference.
    pub fn new(identity: IdentityId, reference: Reference, created: DateTime<Utc>) -> Self {
        Self {
            identity,
            persistent: false,
            created,
            members: vec![reference],
            ledger: BTreeMap::new(),
            positive_links: BTreeSet::new(),
            negative_links: BTreeSet::new(),
            traces: BTreeMap::new(),
        }
    }

    /// Reconstruct a cluster from persisted parts.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        identity: IdentityId,
        persistent: bool,
        created: DateTime<Utc>,
        members: Vec<Reference>,
        ledger: BTreeMap<IdentityId, Vec<RefId>>,
        positive_links: BTreeSet<IdentityId>,
        negative_links: BTreeSet<IdentityId>,
        traces: BTreeMap<RefId, Vec<Trace>>,
    ) -> Self {
        Self {
            identity,
            persistent,
            created,
            members,
            ledger,
            positive_links,
            negative_links,
            traces,
        }
    }

    /// The member references, in attachment order.
    pub fn members(&self) -> &[Reference] {
        &self.members
    }

    /// The member reference ids, in attachment order.
    pub fn member_ids(&self) -> Vec<RefId> {
        self.members.iter().map(|member| member.id.clone()).collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// A live cluster is never empty; this only holds mid-split.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// True when the reference id is a member.
    pub fn contains(&self, ref_id: &RefId) -> bool {
        self.members.iter().any(|member| &member.id == ref_id)
    }

    /// The attribute-wise union over all members.
    pub fn merged_view(&self) -> MergedView {
        MergedView::union_of(&self.members)
    }

    /// Append a member with its attachment trace.
    pub fn add_member(&mut self, reference: Reference, trace: Trace) {
        self.traces
            .entry(reference.id.clone())
            .or_default()
            .push(trace);
        self.members.push(reference);
    }

    /// Remove a member, returning it with its trace history.
    ///
    /// Callers are responsible for never leaving a live cluster empty.
    pub fn remove_member(&mut self, ref_id: &RefId) -> Option<(Reference, Vec<Trace>)> {
        let position = self.members.iter().position(|member| &member.id == ref_id)?;
        let reference = self.members.remove(position);
        let traces = self.traces.remove(ref_id).unwrap_or_default();
        Some((reference, traces))
    }

    /// Trace history for a member.
    pub fn traces_for(&self, ref_id: &RefId) -> &[Trace] {
        self.traces.get(ref_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All trace entries, keyed by member.
    pub fn traces(&self) -> &BTreeMap<RefId, Vec<Trace>> {
        &self.traces
    }

    /// Append a trace entry for an existing member.
    pub fn record_trace(&mut self, ref_id: RefId, trace: Trace) {
        self.traces.entry(ref_id).or_default().push(trace);
    }

    /// The merge ledger: absorbed identity id -> its contributed references.
    pub fn ledger(&self) -> &BTreeMap<IdentityId, Vec<RefId>> {
        &self.ledger
    }

    /// True when this cluster carries a negative link to `other`.
    pub fn has_negative_link(&self, other: &IdentityId) -> bool {
        self.negative_links.contains(other)
    }

    /// Absorb another cluster into this one.
    ///
    /// Appends the other cluster's members, unions trace history, ledger and
    /// cross-links, records the absorbed identity id and its reference ids
    /// in this cluster's ledger, propagates persistence, and keeps the
    /// earlier creation date. The absorbed cluster's id is dissolved; the
    /// caller removes it from the entity map and re-points its links.
    pub fn absorb(&mut self, other: Cluster) {
        let Cluster {
            identity: absorbed_id,
            persistent,
            created,
            members,
            ledger,
            positive_links,
            negative_links,
            traces,
        } = other;

        self.ledger
            .insert(absorbed_id.clone(), members.iter().map(|m| m.id.clone()).collect());
        for (nested_id, refs) in ledger {
            self.ledger.entry(nested_id).or_insert(refs);
        }

        for (ref_id, mut history) in traces {
            self.traces.entry(ref_id).or_default().append(&mut history);
        }
        self.members.extend(members);

        self.positive_links.extend(positive_links);
        self.negative_links.extend(negative_links);
        self.positive_links.remove(&self.identity);
        self.positive_links.remove(&absorbed_id);
        self.negative_links.remove(&absorbed_id);

        self.persistent |= persistent;
        if created < self.created {
            self.created = created;
        }
    }
}

/// Total precedence order used on every multi-candidate decision.
///
/// `Less` means `a` wins (is the minimum identity): a non-persistent cluster
/// loses to a persistent one; within the same persistence class the earlier
/// creation date wins; remaining ties break by the fixed lexical ordering of
/// identity ids. Totality rules out 3-cycles across repeated pairwise
/// comparisons.
pub fn cluster_precedence(a: &Cluster, b: &Cluster) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.persistent, b.persistent) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a
            .created
            .cmp(&b.created)
            .then_with(|| a.identity.cmp(&b.identity)),
    }
}
