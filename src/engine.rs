//! # Resolution Engines
//!
//! One engine type parameterized by a consolidation strategy. All strategies
//! share the same skeleton: retrieve candidates against the live index,
//! evaluate rules per candidate in ranked order, then decide between
//! creating a new identity, absorbing into a single match, or consolidating
//! a multi-match set. They differ only in how many matches they accept and
//! how consolidation proceeds.

use crate::cluster::{cluster_precedence, Cluster};
use crate::compare::ComparatorRegistry;
use crate::index::LcrdFilter;
use crate::model::{IdentityId, MergedView, RefId, Reference, RuleId};
use crate::repository::{CandidateOptions, IdentityRepository};
use crate::rules::RuleSet;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// How an engine accepts matches and consolidates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Stop at the first firing candidate and absorb immediately.
    #[default]
    FirstMatch,
    /// Evaluate all filtered candidates, veto negative links, merge the rest.
    FullConsolidation,
    /// Streaming first-match plus a worklist-driven fixpoint pass.
    IterativeFixpoint,
}

/// Counters kept across a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// References handed to `integrate`.
    pub processed: u64,
    /// New identities created for unmatched references.
    pub new_identities: u64,
    /// References absorbed into a single existing identity.
    pub matched: u64,
    /// Multi-match consolidation events.
    pub consolidations: u64,
    /// Identities dissolved by consolidation merges.
    pub absorbed: u64,
    /// Unmatched references discarded because capture was disabled.
    pub dropped: u64,
    /// References that were already linked on arrival.
    pub already_linked: u64,
    /// Candidate index hits excluded as unresolvable.
    pub anomalies: u64,
}

/// The outcome of integrating one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No candidate fired; a new identity was created.
    New(IdentityId),
    /// Exactly one accepted match; the reference was absorbed.
    Matched {
        /// The identity the reference joined.
        identity: IdentityId,
        /// Rule names responsible for the attachment.
        rules: BTreeSet<String>,
    },
    /// Several matches were merged before the reference was attached.
    Consolidated {
        /// The surviving identity after tie-break.
        identity: IdentityId,
        /// Identities dissolved into the survivor.
        absorbed: Vec<IdentityId>,
        /// Rule names responsible across the surviving matches.
        rules: BTreeSet<String>,
    },
    /// The reference id was already linked; nothing changed.
    Existing(IdentityId),
    /// No match and capture disabled; the reference was not persisted.
    Dropped(RefId),
}

impl Resolution {
    /// The identity the reference resolved to, when it was persisted.
    pub fn identity(&self) -> Option<&IdentityId> {
        match self {
            Self::New(id) | Self::Existing(id) => Some(id),
            Self::Matched { identity, .. } | Self::Consolidated { identity, .. } => Some(identity),
            Self::Dropped(_) => None,
        }
    }
}

/// Result of an iterative-fixpoint consolidation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsolidationReport {
    /// Number of merges performed before the worklist drained.
    pub merges: usize,
    /// Live identities remaining at the fixpoint.
    pub survivors: usize,
}

/// Strategy-parameterized resolution engine.
#[derive(Debug, Clone)]
pub struct Engine {
    strategy: Strategy,
    capture: bool,
    run_id: String,
    options: CandidateOptions,
    stats: EngineStats,
    rule_fires: BTreeMap<RuleId, u64>,
}

impl Engine {
    /// Create an engine with default candidate options and capture enabled.
    pub fn new(strategy: Strategy, run_id: impl Into<String>) -> Self {
        Self::with_options(strategy, true, run_id, CandidateOptions::default())
    }

    /// Create a fully configured engine.
    pub fn with_options(
        strategy: Strategy,
        capture: bool,
        run_id: impl Into<String>,
        options: CandidateOptions,
    ) -> Self {
        Self {
            strategy,
            capture,
            run_id: run_id.into(),
            options,
            stats: EngineStats::default(),
            rule_fires: BTreeMap::new(),
        }
    }

    /// The configured strategy.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Per-rule fire counts, attributed to the declaration-order-first
    /// fired rule of each accepted match.
    pub fn rule_fires(&self) -> &BTreeMap<RuleId, u64> {
        &self.rule_fires
    }

    fn count_fire(&mut self, first_fired: Option<RuleId>) {
        if let Some(rule) = first_fired {
            *self.rule_fires.entry(rule).or_insert(0) += 1;
        }
    }

    /// Integrate one reference: decide whether it joins an existing identity
    /// or starts a new one, and mutate the repository accordingly.
    ///
    /// Integrating an already-linked reference id is a no-op returning the
    /// existing identity, so re-integration is idempotent.
    pub fn integrate(
        &mut self,
        repo: &mut IdentityRepository,
        rules: &RuleSet,
        comparators: &ComparatorRegistry,
        filter: Option<&LcrdFilter>,
        reference: Reference,
    ) -> Result<Resolution> {
        self.stats.processed += 1;

        if let Some(owner) = repo.identity_of(&reference.id) {
            self.stats.already_linked += 1;
            return Ok(Resolution::Existing(owner.clone()));
        }

        let input_view = MergedView::of_reference(&reference);
        let set = repo.candidates(&input_view, &self.options, filter);
        self.stats.anomalies += set.anomalies.len() as u64;

        match self.strategy {
            Strategy::FirstMatch | Strategy::IterativeFixpoint => {
                for candidate in &set.candidates {
                    for view in &candidate.views {
                        let verdict = rules.evaluate(&input_view, view, comparators);
                        if verdict.fired {
                            let names = rules.rule_names(&verdict.all_fired);
                            let identity = candidate.identity.clone();
                            repo.attach(&identity, reference, names.clone(), &self.run_id)?;
                            self.count_fire(verdict.first_fired);
                            self.stats.matched += 1;
                            return Ok(Resolution::Matched { identity, rules: names });
                        }
                    }
                }
                self.unmatched(repo, reference)
            }
            Strategy::FullConsolidation => {
                let mut fired: Vec<(IdentityId, BTreeSet<String>)> = Vec::new();
                for candidate in &set.candidates {
                    let mut names = BTreeSet::new();
                    let mut first_fired = None;
                    for view in &candidate.views {
                        let verdict = rules.evaluate(&input_view, view, comparators);
                        if verdict.fired {
                            names.extend(rules.rule_names(&verdict.all_fired));
                            first_fired = first_fired.or(verdict.first_fired);
                        }
                    }
                    if !names.is_empty() {
                        self.count_fire(first_fired);
                        fired.push((candidate.identity.clone(), names));
                    }
                }
                if fired.is_empty() {
                    return self.unmatched(repo, reference);
                }

                let surviving = resolve_negative_assertions(repo, fired, &BTreeSet::new());
                if surviving.is_empty() {
                    return self.unmatched(repo, reference);
                }

                let mut winner = surviving[0].0.clone();
                for (identity, _) in &surviving[1..] {
                    winner = repo.min_identity(&winner, identity);
                }

                let mut absorbed = Vec::new();
                let mut names = BTreeSet::new();
                for (identity, rule_names) in surviving {
                    names.extend(rule_names);
                    if identity != winner {
                        repo.merge(&winner, &identity)?;
                        absorbed.push(identity);
                    }
                }

                repo.attach(&winner, reference, names.clone(), &self.run_id)?;
                if absorbed.is_empty() {
                    self.stats.matched += 1;
                    Ok(Resolution::Matched {
                        identity: winner,
                        rules: names,
                    })
                } else {
                    self.stats.consolidations += 1;
                    self.stats.absorbed += absorbed.len() as u64;
                    Ok(Resolution::Consolidated {
                        identity: winner,
                        absorbed,
                        rules: names,
                    })
                }
            }
        }
    }

    fn unmatched(
        &mut self,
        repo: &mut IdentityRepository,
        reference: Reference,
    ) -> Result<Resolution> {
        if self.capture {
            let identity = repo.create_identity(reference, BTreeSet::new(), &self.run_id)?;
            self.stats.new_identities += 1;
            Ok(Resolution::New(identity))
        } else {
            debug!(reference = %reference.id, "no rule fired and capture is disabled; reference not persisted");
            self.stats.dropped += 1;
            Ok(Resolution::Dropped(reference.id))
        }
    }

    /// Run the worklist-driven fixpoint consolidation pass.
    ///
    /// Seeds a worklist from every live cluster, then repeatedly pops one,
    /// detaches it, and re-runs first-match-with-inline-consolidation
    /// against the current index, which reflects the consolidations already
    /// performed in this pass. Merge survivors re-enter the worklist. Each
    /// iteration either merges (strictly reducing the live-cluster count) or
    /// retires its item, so the pass terminates at a fixpoint where no
    /// candidate pair satisfies any rule.
    pub fn consolidate(
        &mut self,
        repo: &mut IdentityRepository,
        rules: &RuleSet,
        comparators: &ComparatorRegistry,
        filter: Option<&LcrdFilter>,
    ) -> Result<ConsolidationReport> {
        let mut options = self.options.clone();
        options.use_shadow_combinations = true;

        let mut worklist: VecDeque<IdentityId> = repo.live_identities().into();
        let mut merges = 0usize;

        while let Some(identity) = worklist.pop_front() {
            // Absorbed earlier in this same pass.
            let Some(cluster) = repo.detach(&identity) else {
                continue;
            };

            let merged = cluster.merged_view();
            let input_views = if cluster.len() > 1 {
                merged.combinations(options.shadow_cap)
            } else {
                vec![merged.clone()]
            };

            let set = repo.candidates(&merged, &options, filter);
            self.stats.anomalies += set.anomalies.len() as u64;

            let mut matched: Option<(IdentityId, BTreeSet<String>)> = None;
            'candidates: for candidate in &set.candidates {
                if negative_link_between(repo, &cluster, &candidate.identity) {
                    continue;
                }
                for input_view in &input_views {
                    for view in &candidate.views {
                        let verdict = rules.evaluate(input_view, view, comparators);
                        if verdict.fired {
                            self.count_fire(verdict.first_fired);
                            matched = Some((
                                candidate.identity.clone(),
                                rules.rule_names(&verdict.all_fired),
                            ));
                            break 'candidates;
                        }
                    }
                }
            }

            match matched {
                Some((other_id, names)) => {
                    let other = repo
                        .detach(&other_id)
                        .ok_or_else(|| anyhow!("candidate cluster {other_id} vanished mid-pass"))?;

                    let (mut survivor, dissolved) =
                        if cluster_precedence(&cluster, &other) == std::cmp::Ordering::Greater {
                            (other, cluster)
                        } else {
                            (cluster, other)
                        };
                    let dissolved_ids = dissolved.member_ids();
                    survivor.absorb(dissolved);
                    let survivor_id = survivor.identity.clone();
                    repo.insert_cluster(survivor)?;
                    for ref_id in dissolved_ids {
                        for name in &names {
                            repo.record_rule(&ref_id, name);
                        }
                    }

                    merges += 1;
                    self.stats.absorbed += 1;
                    worklist.push_back(survivor_id);
                }
                None => {
                    repo.insert_cluster(cluster)?;
                }
            }
        }

        if merges > 0 {
            self.stats.consolidations += 1;
        }
        Ok(ConsolidationReport {
            merges,
            survivors: repo.len(),
        })
    }
}

/// Drop every collected candidate that carries a negative link to another
/// collected candidate or to the input's own negative-link set.
fn resolve_negative_assertions(
    repo: &IdentityRepository,
    fired: Vec<(IdentityId, BTreeSet<String>)>,
    input_negatives: &BTreeSet<IdentityId>,
) -> Vec<(IdentityId, BTreeSet<String>)> {
    let ids: Vec<IdentityId> = fired.iter().map(|(id, _)| id.clone()).collect();
    fired
        .into_iter()
        .filter(|(id, _)| {
            if input_negatives.contains(id) {
                return false;
            }
            let Some(cluster) = repo.identity(id) else {
                return false;
            };
            !ids.iter()
                .any(|other| other != id && cluster.has_negative_link(other))
        })
        .collect()
}

fn negative_link_between(
    repo: &IdentityRepository,
    cluster: &Cluster,
    candidate: &IdentityId,
) -> bool {
    if cluster.has_negative_link(candidate) {
        return true;
    }
    repo.identity(candidate)
        .is_some_and(|other| other.has_negative_link(&cluster.identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::RESULT_EXACT;
    use crate::model::RefId;
    use crate::rules::{RuleDef, RuleTerm};
    use std::collections::BTreeMap;

    fn setup(repo: &mut IdentityRepository) -> (RuleSet, ComparatorRegistry) {
        let name = repo.interner_mut().intern_attr("name");
        let rules = RuleSet::compile(vec![RuleDef::new(
            "name-exact",
            vec![RuleTerm::new(name, RESULT_EXACT)],
        )])
        .unwrap();
        (rules, ComparatorRegistry::new())
    }

    fn reference(repo: &mut IdentityRepository, uid: &str, name_value: &str) -> Reference {
        let name = repo.interner_mut().intern_attr("name");
        Reference::new(RefId::new("test", uid), BTreeMap::new()).with_value(name, name_value)
    }

    #[test]
    fn test_first_match_absorbs() {
        let mut repo = IdentityRepository::new();
        let (rules, comparators) = setup(&mut repo);
        let mut engine = Engine::new(Strategy::FirstMatch, "run-1");

        let a = reference(&mut repo, "1", "John");
        let b = reference(&mut repo, "2", "John");

        let first = engine
            .integrate(&mut repo, &rules, &comparators, None, a)
            .unwrap();
        let second = engine
            .integrate(&mut repo, &rules, &comparators, None, b)
            .unwrap();

        let identity = first.identity().unwrap().clone();
        assert_eq!(second.identity(), Some(&identity));
        assert_eq!(repo.len(), 1);
        assert_eq!(engine.stats().matched, 1);
    }

    #[test]
    fn test_idempotent_reintegration() {
        let mut repo = IdentityRepository::new();
        let (rules, comparators) = setup(&mut repo);
        let mut engine = Engine::new(Strategy::FirstMatch, "run-1");

        let a = reference(&mut repo, "1", "John");
        let first = engine
            .integrate(&mut repo, &rules, &comparators, None, a.clone())
            .unwrap();
        let again = engine
            .integrate(&mut repo, &rules, &comparators, None, a)
            .unwrap();

        assert_eq!(first.identity(), again.identity());
        assert_eq!(repo.len(), 1);
        assert_eq!(engine.stats().already_linked, 1);
    }

    #[test]
    fn test_capture_disabled_drops_unmatched() {
        let mut repo = IdentityRepository::new();
        let (rules, comparators) = setup(&mut repo);
        let mut engine = Engine::with_options(
            Strategy::FirstMatch,
            false,
            "run-1",
            CandidateOptions::default(),
        );

        let a = reference(&mut repo, "1", "John");
        let outcome = engine
            .integrate(&mut repo, &rules, &comparators, None, a)
            .unwrap();

        assert!(matches!(outcome, Resolution::Dropped(_)));
        assert!(repo.is_empty());
        assert_eq!(engine.stats().dropped, 1);
    }

    #[test]
    fn test_full_consolidation_merges_multi_match() {
        let mut repo = IdentityRepository::new();
        let (rules, comparators) = setup(&mut repo);
        let mut engine = Engine::new(Strategy::FullConsolidation, "run-1");

        // Two disjoint identities that both match the incoming reference.
        let a = reference(&mut repo, "1", "John|Johnny");
        let b = reference(&mut repo, "2", "John|Jack");
        repo.create_identity(a, BTreeSet::new(), "run-0").unwrap();
        repo.create_identity(b, BTreeSet::new(), "run-0").unwrap();
        assert_eq!(repo.len(), 2);

        let c = reference(&mut repo, "3", "John");
        let outcome = engine
            .integrate(&mut repo, &rules, &comparators, None, c)
            .unwrap();

        match outcome {
            Resolution::Consolidated { absorbed, .. } => assert_eq!(absorbed.len(), 1),
            other => panic!("expected consolidation, got {other:?}"),
        }
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.reference_count(), 3);
    }

    #[test]
    fn test_negative_link_vetoes_consolidation() {
        let mut repo = IdentityRepository::new();
        let (rules, comparators) = setup(&mut repo);
        let mut engine = Engine::new(Strategy::FullConsolidation, "run-1");

        let a = reference(&mut repo, "1", "John|Johnny");
        let b = reference(&mut repo, "2", "John|Jack");
        let c = reference(&mut repo, "3", "John|Jill");
        let id_a = repo.create_identity(a, BTreeSet::new(), "run-0").unwrap();
        let id_b = repo.create_identity(b, BTreeSet::new(), "run-0").unwrap();
        let id_c = repo.create_identity(c, BTreeSet::new(), "run-0").unwrap();

        // a and b must never be auto-merged.
        split_link(&mut repo, &id_a, &id_b);

        let input = reference(&mut repo, "4", "John");
        let outcome = engine
            .integrate(&mut repo, &rules, &comparators, None, input)
            .unwrap();

        // Both carriers of the negative link are vetoed; the input joins the
        // remaining match and the vetoed pair stays apart.
        assert_eq!(outcome.identity(), Some(&id_c));
        assert!(repo.identity(&id_a).is_some());
        assert!(repo.identity(&id_b).is_some());
        assert_eq!(repo.len(), 3);
        assert_eq!(repo.identity(&id_c).unwrap().len(), 2);
    }

    fn split_link(repo: &mut IdentityRepository, a: &IdentityId, b: &IdentityId) {
        // Record a symmetric negative link directly for the test.
        let mut cluster_a = repo.detach(a).unwrap();
        cluster_a.negative_links.insert(b.clone());
        repo.insert_cluster(cluster_a).unwrap();
        let mut cluster_b = repo.detach(b).unwrap();
        cluster_b.negative_links.insert(a.clone());
        repo.insert_cluster(cluster_b).unwrap();
    }

    #[test]
    fn test_fixpoint_consolidation_reaches_single_cluster() {
        let mut repo = IdentityRepository::new();
        let name = repo.interner_mut().intern_attr("name");
        let ssn = repo.interner_mut().intern_attr("ssn");
        let rules = RuleSet::compile(vec![
            RuleDef::new("name-exact", vec![RuleTerm::new(name, RESULT_EXACT)]),
            RuleDef::new("ssn-exact", vec![RuleTerm::new(ssn, RESULT_EXACT)]),
        ])
        .unwrap();
        let comparators = ComparatorRegistry::new();
        let mut engine = Engine::new(Strategy::IterativeFixpoint, "run-1");

        // A chain: r1-r2 share a name, r2-r3 share an ssn. Pairwise streaming
        // in an unlucky order leaves them apart; the fixpoint pass must not.
        let r1 = Reference::new(RefId::new("test", "1"), BTreeMap::new()).with_value(name, "John");
        let r2 = Reference::new(RefId::new("test", "2"), BTreeMap::new())
            .with_value(name, "John")
            .with_value(ssn, "123");
        let r3 = Reference::new(RefId::new("test", "3"), BTreeMap::new()).with_value(ssn, "123");

        repo.create_identity(r1, BTreeSet::new(), "run-0").unwrap();
        repo.create_identity(r2, BTreeSet::new(), "run-0").unwrap();
        repo.create_identity(r3, BTreeSet::new(), "run-0").unwrap();
        assert_eq!(repo.len(), 3);

        let report = engine
            .consolidate(&mut repo, &rules, &comparators, None)
            .unwrap();

        assert_eq!(report.survivors, 1);
        assert_eq!(report.merges, 2);
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.reference_count(), 3);
    }

    #[test]
    fn test_fixpoint_respects_negative_links() {
        let mut repo = IdentityRepository::new();
        let (rules, comparators) = setup(&mut repo);
        let mut engine = Engine::new(Strategy::IterativeFixpoint, "run-1");

        let a = reference(&mut repo, "1", "John");
        let b = reference(&mut repo, "2", "John");
        let id_a = repo.create_identity(a, BTreeSet::new(), "run-0").unwrap();
        let id_b = repo.create_identity(b, BTreeSet::new(), "run-0").unwrap();
        split_link(&mut repo, &id_a, &id_b);

        let report = engine
            .consolidate(&mut repo, &rules, &comparators, None)
            .unwrap();

        assert_eq!(report.merges, 0);
        assert_eq!(repo.len(), 2);
    }
}
