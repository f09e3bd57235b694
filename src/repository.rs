//! # Identity Repository
//!
//! Owns the four co-consistent maps of the resolution core: the entity map
//! (identity id -> cluster), the link map (reference id -> identity id), the
//! rule map (reference id -> responsible rule names), and the assert map
//! (assertion key -> reference ids), together with the value index.
//!
//! Every mutation goes through a repository operation that updates the maps
//! as one logical step; no caller observes a state where only a subset is
//! updated.

use crate::cluster::{cluster_precedence, Cluster};
use crate::idgen::{Blake3IdGenerator, IdGenerator};
use crate::index::{LcrdFilter, ValueIndex};
use crate::model::{
    AssertionKind, AttrId, IdentityId, MergedView, RefId, Reference, StringInterner, Trace,
};
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Tuning knobs for candidate retrieval.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CandidateOptions {
    /// Order candidates descending by index-hit density.
    pub sorted: bool,
    /// Apply the pre-filter only when the raw candidate count reaches this.
    pub min_filter_size: usize,
    /// Skip the pre-filter entirely.
    pub bypass_filter: bool,
    /// Expand multi-member candidates into attribute cross-products.
    pub use_shadow_combinations: bool,
    /// Upper bound on expanded combinations per candidate.
    pub shadow_cap: usize,
}

impl Default for CandidateOptions {
    fn default() -> Self {
        Self {
            sorted: true,
            min_filter_size: 8,
            bypass_filter: false,
            use_shadow_combinations: false,
            shadow_cap: 64,
        }
    }
}

/// One retrieved candidate cluster.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The owning identity.
    pub identity: IdentityId,
    /// Index-hit density: how many (attribute, token) probes landed here.
    pub hits: usize,
    /// Views to evaluate rules against (one, or shadow combinations).
    pub views: Vec<MergedView>,
}

/// Why an index hit could not be resolved to a live cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnomalyKind {
    /// The reference id has no link map entry.
    UnlinkedReference,
    /// The link map points at an identity missing from the entity map.
    MissingCluster(IdentityId),
}

/// An index hit excluded from the decision because it could not be resolved.
///
/// Anomalies are logged and reported, never fatal: the candidate is dropped
/// from the decision and processing continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateAnomaly {
    /// The unresolvable reference id.
    pub reference: RefId,
    /// What went wrong.
    pub kind: AnomalyKind,
}

/// The outcome of candidate retrieval.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    /// Resolved, de-duplicated, filtered candidates in retrieval order.
    pub candidates: Vec<Candidate>,
    /// Index hits excluded because they could not be resolved.
    pub anomalies: Vec<CandidateAnomaly>,
}

impl CandidateSet {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            candidates: Vec::with_capacity(capacity),
            anomalies: Vec::new(),
        }
    }
}

/// The repository owning all resolution state.
pub struct IdentityRepository {
    entities: hashbrown::HashMap<IdentityId, Cluster>,
    links: hashbrown::HashMap<RefId, IdentityId>,
    rules: hashbrown::HashMap<RefId, BTreeSet<String>>,
    asserts: BTreeMap<(AssertionKind, String), BTreeSet<RefId>>,
    index: ValueIndex,
    interner: StringInterner,
    idgen: Box<dyn IdGenerator>,
}

impl IdentityRepository {
    /// Create an empty repository with the default id generator.
    pub fn new() -> Self {
        Self::with_id_generator(Box::new(Blake3IdGenerator::new()))
    }

    /// Create an empty repository with an injected id generator.
    pub fn with_id_generator(idgen: Box<dyn IdGenerator>) -> Self {
        Self {
            entities: hashbrown::HashMap::new(),
            links: hashbrown::HashMap::new(),
            rules: hashbrown::HashMap::new(),
            asserts: BTreeMap::new(),
            index: ValueIndex::new(),
            interner: StringInterner::new(),
            idgen,
        }
    }

    /// The attribute interner.
    pub fn interner(&self) -> &StringInterner {
        &self.interner
    }

    /// Mutable access to the attribute interner.
    pub fn interner_mut(&mut self) -> &mut StringInterner {
        &mut self.interner
    }

    /// Number of live identities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// True when no identities exist.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Number of linked references.
    pub fn reference_count(&self) -> usize {
        self.links.len()
    }

    /// Look up a cluster by identity id.
    pub fn identity(&self, id: &IdentityId) -> Option<&Cluster> {
        self.entities.get(id)
    }

    /// Iterate all live clusters.
    pub fn identities(&self) -> impl Iterator<Item = &Cluster> {
        self.entities.values()
    }

    /// All live identity ids, in deterministic (lexical) order.
    pub fn live_identities(&self) -> Vec<IdentityId> {
        let mut ids: Vec<IdentityId> = self.entities.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The identity owning a reference, if linked.
    pub fn identity_of(&self, ref_id: &RefId) -> Option<&IdentityId> {
        self.links.get(ref_id)
    }

    /// The rule names responsible for a reference's attachment.
    pub fn rules_for(&self, ref_id: &RefId) -> Option<&BTreeSet<String>> {
        self.rules.get(ref_id)
    }

    /// Iterate the link map in arbitrary order.
    pub fn links(&self) -> impl Iterator<Item = (&RefId, &IdentityId)> {
        self.links.iter()
    }

    /// Create a new singleton identity for a reference.
    ///
    /// Allocates a deterministic content-derived id and updates the entity,
    /// link, rule and index state as one logical step.
    pub fn create_identity(
        &mut self,
        reference: Reference,
        rule_names: BTreeSet<String>,
        run_id: &str,
    ) -> Result<IdentityId> {
        if let Some(owner) = self.links.get(&reference.id) {
            bail!("reference {} already owned by identity {owner}", reference.id);
        }

        let view = MergedView::of_reference(&reference);
        let identity = self
            .idgen
            .next_id(&view, std::slice::from_ref(&reference.id), false);
        if self.entities.contains_key(&identity) {
            bail!("identity id collision for {identity}");
        }

        let ref_id = reference.id.clone();
        self.index.insert_reference(&reference);
        let mut cluster = Cluster::new(identity.clone(), reference, Utc::now());
        cluster.record_trace(ref_id.clone(), Trace::new(rule_names.clone(), run_id));
        self.entities.insert(identity.clone(), cluster);
        self.links.insert(ref_id.clone(), identity.clone());
        self.rules.entry(ref_id).or_default().extend(rule_names);

        Ok(identity)
    }

    /// Attach a reference to an existing identity.
    pub fn attach(
        &mut self,
        identity: &IdentityId,
        reference: Reference,
        rule_names: BTreeSet<String>,
        run_id: &str,
    ) -> Result<()> {
        if let Some(owner) = self.links.get(&reference.id) {
            bail!("reference {} already owned by identity {owner}", reference.id);
        }
        let cluster = self
            .entities
            .get_mut(identity)
            .ok_or_else(|| anyhow!("unknown identity {identity}"))?;

        let ref_id = reference.id.clone();
        self.index.insert_reference(&reference);
        cluster.add_member(reference, Trace::new(rule_names.clone(), run_id));
        self.links.insert(ref_id.clone(), identity.clone());
        self.rules.entry(ref_id).or_default().extend(rule_names);

        Ok(())
    }

    /// Merge the `from` identity into the `into` identity.
    ///
    /// The absorbed cluster is removed from the entity map, its members are
    /// re-linked to the survivor, and its ledger entry persists there.
    pub fn merge(&mut self, into: &IdentityId, from: &IdentityId) -> Result<()> {
        if into == from {
            return Ok(());
        }
        let absorbed = self
            .entities
            .remove(from)
            .ok_or_else(|| anyhow!("unknown identity {from}"))?;
        if !self.entities.contains_key(into) {
            self.entities.insert(from.clone(), absorbed);
            bail!("unknown identity {into}");
        }

        for ref_id in absorbed.member_ids() {
            self.links.insert(ref_id, into.clone());
        }
        self.entities
            .get_mut(into)
            .expect("survivor checked above")
            .absorb(absorbed);

        Ok(())
    }

    /// The minimum identity under the merge tie-break policy
    /// ([`cluster_precedence`]).
    pub fn min_identity(&self, a: &IdentityId, b: &IdentityId) -> IdentityId {
        let (cluster_a, cluster_b) = match (self.entities.get(a), self.entities.get(b)) {
            (Some(ca), Some(cb)) => (ca, cb),
            (Some(_), None) => return a.clone(),
            _ => return b.clone(),
        };
        match cluster_precedence(cluster_a, cluster_b) {
            std::cmp::Ordering::Greater => b.clone(),
            _ => a.clone(),
        }
    }

    /// Remove a cluster from the live maps, returning it.
    ///
    /// Used by the iterative consolidation pass; the rule map keeps its
    /// entries, since the members remain logically owned while in flight.
    pub fn detach(&mut self, identity: &IdentityId) -> Option<Cluster> {
        let cluster = self.entities.remove(identity)?;
        for member in cluster.members() {
            self.links.remove(&member.id);
            self.index.remove_reference(member);
        }
        Some(cluster)
    }

    /// Re-insert a previously detached cluster.
    pub fn insert_cluster(&mut self, cluster: Cluster) -> Result<()> {
        if self.entities.contains_key(&cluster.identity) {
            bail!("identity {} already present", cluster.identity);
        }
        for member in cluster.members() {
            if let Some(owner) = self.links.get(&member.id) {
                bail!("reference {} already owned by identity {owner}", member.id);
            }
        }

        for member in cluster.members() {
            self.links.insert(member.id.clone(), cluster.identity.clone());
            self.index.insert_reference(member);
        }
        self.entities.insert(cluster.identity.clone(), cluster);
        Ok(())
    }

    /// Retrieve, resolve, de-duplicate, and pre-filter candidates for an
    /// input view.
    ///
    /// Index hits that cannot be resolved to a live cluster are reported as
    /// anomalies and excluded from the decision; they never abort retrieval.
    pub fn candidates(
        &self,
        input: &MergedView,
        options: &CandidateOptions,
        filter: Option<&LcrdFilter>,
    ) -> CandidateSet {
        let raw = self.index.raw_candidates(input);
        let mut set = CandidateSet::with_capacity(raw.len());

        // Resolve each hit to its owning cluster and de-duplicate clusters
        // reachable through several member references.
        let mut density: FxHashMap<IdentityId, usize> = FxHashMap::default();
        for (ref_id, hits) in raw {
            match self.links.get(&ref_id) {
                Some(identity) if self.entities.contains_key(identity) => {
                    *density.entry(identity.clone()).or_insert(0) += hits;
                }
                Some(identity) => {
                    warn!(reference = %ref_id, identity = %identity, "index hit resolves to a missing cluster");
                    set.anomalies.push(CandidateAnomaly {
                        reference: ref_id,
                        kind: AnomalyKind::MissingCluster(identity.clone()),
                    });
                }
                None => {
                    warn!(reference = %ref_id, "index hit has no owning cluster");
                    set.anomalies.push(CandidateAnomaly {
                        reference: ref_id,
                        kind: AnomalyKind::UnlinkedReference,
                    });
                }
            }
        }

        let mut resolved: Vec<(IdentityId, usize, MergedView)> = density
            .into_iter()
            .map(|(identity, hits)| {
                let view = self.entities[&identity].merged_view();
                (identity, hits, view)
            })
            .collect();

        // Cheap reject before full rule evaluation, unless bypassed or the
        // candidate set is too small for the filter to pay off.
        if let Some(primary) = filter {
            let apply = !options.bypass_filter
                && !primary.is_empty()
                && resolved.len() >= options.min_filter_size;
            if apply {
                let surviving: Vec<(IdentityId, usize, MergedView)> = resolved
                    .iter()
                    .filter(|(_, _, view)| primary.accepts(input, view))
                    .cloned()
                    .collect();
                resolved = if surviving.is_empty() {
                    let secondary = primary.secondary();
                    resolved
                        .into_iter()
                        .filter(|(_, _, view)| secondary.accepts(input, view))
                        .collect()
                } else {
                    surviving
                };
            }
        }

        if options.sorted {
            resolved.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        } else {
            resolved.sort_by(|a, b| a.0.cmp(&b.0));
        }

        for (identity, hits, view) in resolved {
            let multi_member = self.entities[&identity].len() > 1;
            let views = if options.use_shadow_combinations && multi_member {
                view.combinations(options.shadow_cap)
            } else {
                vec![view]
            };
            set.candidates.push(Candidate {
                identity,
                hits,
                views,
            });
        }

        set
    }

    /// Split one reference out of its cluster into a new derived singleton.
    ///
    /// Records a symmetric negative link between the new singleton and the
    /// origin, suppressing automatic re-merging in later runs. Validation
    /// (batch gates) happens in the assertion engine before this is called.
    pub fn split(
        &mut self,
        identity: &IdentityId,
        ref_id: &RefId,
        marker: &str,
        run_id: &str,
    ) -> Result<IdentityId> {
        let origin = self
            .entities
            .get_mut(identity)
            .ok_or_else(|| anyhow!("unknown identity {identity}"))?;
        if origin.len() < 2 {
            bail!("split would empty identity {identity}");
        }
        let (reference, mut traces) = origin
            .remove_member(ref_id)
            .ok_or_else(|| anyhow!("reference {ref_id} is not a member of {identity}"))?;

        let view = MergedView::of_reference(&reference);
        let derived = self
            .idgen
            .next_id(&view, std::slice::from_ref(&reference.id), true);
        if self.entities.contains_key(&derived) {
            // Undo the removal before reporting; the repository stays intact.
            let restore = Trace::new(BTreeSet::new(), run_id);
            self.entities
                .get_mut(identity)
                .expect("origin still present")
                .add_member(reference, restore);
            bail!("identity id collision for split product {derived}");
        }

        self.entities
            .get_mut(identity)
            .expect("origin still present")
            .negative_links
            .insert(derived.clone());

        traces.push(Trace::new(
            [marker.to_string()].into_iter().collect(),
            run_id,
        ));
        let mut singleton = Cluster::new(derived.clone(), reference, Utc::now());
        singleton.negative_links.insert(identity.clone());
        for trace in traces {
            singleton.record_trace(ref_id.clone(), trace);
        }

        self.links.insert(ref_id.clone(), derived.clone());
        self.rules
            .entry(ref_id.clone())
            .or_default()
            .insert(marker.to_string());
        self.entities.insert(derived.clone(), singleton);

        Ok(derived)
    }

    /// Record a reference under an assertion key.
    ///
    /// The assert map accumulates, per assertion kind, which references
    /// carry each key value; batches are applied by the assertion engine
    /// after a pass.
    pub fn queue_assertion(&mut self, kind: AssertionKind, key: &str, ref_id: RefId) {
        self.asserts
            .entry((kind, key.to_string()))
            .or_default()
            .insert(ref_id);
    }

    /// The reference sets recorded for one assertion kind.
    pub fn assertions_for(&self, kind: AssertionKind) -> Vec<(String, BTreeSet<RefId>)> {
        self.asserts
            .iter()
            .filter(|((entry_kind, _), _)| *entry_kind == kind)
            .map(|((_, key), refs)| (key.clone(), refs.clone()))
            .collect()
    }

    /// The reference set recorded for one assertion key.
    pub fn assertion_refs(&self, kind: AssertionKind, key: &str) -> Option<&BTreeSet<RefId>> {
        self.asserts.get(&(kind, key.to_string()))
    }

    /// Record a rule marker for a reference (assertion attachments).
    pub fn record_rule(&mut self, ref_id: &RefId, rule_name: &str) {
        self.rules
            .entry(ref_id.clone())
            .or_default()
            .insert(rule_name.to_string());
    }

    /// Append a trace entry for a linked reference.
    pub fn record_trace(&mut self, ref_id: &RefId, trace: Trace) -> Result<()> {
        let identity = self
            .links
            .get(ref_id)
            .ok_or_else(|| anyhow!("reference {ref_id} is not linked"))?
            .clone();
        let cluster = self
            .entities
            .get_mut(&identity)
            .ok_or_else(|| anyhow!("unknown identity {identity}"))?;
        cluster.record_trace(ref_id.clone(), trace);
        Ok(())
    }

    /// Restore a loaded cluster during repository load.
    ///
    /// Marks it persistent and rebuilds the link, rule, and index state
    /// from its members and traces.
    pub fn restore_persistent(&mut self, mut cluster: Cluster) -> Result<()> {
        cluster.persistent = true;
        for member in cluster.members() {
            for trace in cluster.traces_for(&member.id) {
                self.rules
                    .entry(member.id.clone())
                    .or_default()
                    .extend(trace.rules.iter().cloned());
            }
        }
        self.insert_cluster(cluster)
    }

    /// The mapped attribute ids present in the index, for diagnostics.
    pub fn indexed_attrs(&self) -> BTreeSet<AttrId> {
        self.entities
            .values()
            .flat_map(|cluster| cluster.members())
            .flat_map(|member| member.attrs())
            .collect()
    }
}

impl Default for IdentityRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IdentityRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRepository")
            .field("identities", &self.entities.len())
            .field("references", &self.links.len())
            .field("postings", &self.index.len())
            .finish()
    }
}
