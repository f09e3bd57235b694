//! # Kindred
//!
//! A rule-based entity resolution engine.
//!
//! Given a stream of reference records describing real-world entities,
//! kindred decides for each whether it belongs to an existing resolved
//! identity (cluster) or starts a new one, merges matching records under
//! three consolidation strategies, and maintains a durable mapping from
//! every reference to its resolved identity, with a manual-override
//! (assertion) subsystem that coexists safely with the automatic rules.

pub mod assertion;
pub mod cluster;
pub mod compare;
pub mod config;
pub mod engine;
pub mod error;
pub mod idgen;
pub mod index;
pub mod model;
pub mod persistence;
pub mod repository;
pub mod rules;

// Re-export main types for convenience
pub use assertion::{AssertionEngine, AssertionError, AssertionReport};
pub use cluster::Cluster;
pub use compare::{AttributeComparator, ComparatorRegistry};
pub use config::{ConfigOverrides, ResolverConfig};
pub use engine::{ConsolidationReport, Engine, EngineStats, Resolution, Strategy};
pub use error::ResolveError;
pub use idgen::{Blake3IdGenerator, IdGenerator};
pub use index::{LcrdFilter, ValueIndex};
pub use model::{
    AssertionKind, AttrId, IdentityId, MergedView, RefId, Reference, ReferenceSource, RuleId,
    StringInterner, Trace, VecSource,
};
pub use persistence::{RepositoryDocument, STORAGE_FORMAT_VERSION};
pub use repository::{CandidateOptions, CandidateSet, IdentityRepository};
pub use rules::{RuleDef, RuleSet, RuleTerm, Verdict};

use anyhow::Result;

/// The outcome of resolving a whole source.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Final (reference id, identity id) assignments, in input order.
    pub assignments: Vec<(RefId, IdentityId)>,
    /// Engine counters for the run.
    pub stats: EngineStats,
    /// Fixpoint pass report, when the strategy ran one.
    pub consolidation: Option<ConsolidationReport>,
}

/// Main API for entity resolution.
///
/// Owns the repository, the compiled rule set, the injected comparators,
/// and one engine configured from [`ResolverConfig`]. References are
/// integrated strictly sequentially; every repository mutation is visible
/// to the candidate retrieval of the next record.
pub struct Resolver {
    repo: IdentityRepository,
    rules: RuleSet,
    comparators: ComparatorRegistry,
    filter: LcrdFilter,
    engine: Engine,
    assertions: AssertionEngine,
}

impl Resolver {
    /// Create a resolver over a repository, compiled rules, and comparators.
    pub fn new(
        repo: IdentityRepository,
        rules: RuleSet,
        comparators: ComparatorRegistry,
        config: ResolverConfig,
    ) -> Self {
        let filter = LcrdFilter::from_rules(&rules, &config.exact_label);
        let engine = Engine::with_options(
            config.strategy,
            config.capture,
            config.run_id.clone(),
            config.candidates.clone(),
        );
        let assertions = AssertionEngine::new(config.run_id.clone());
        Self {
            repo,
            rules,
            comparators,
            filter,
            engine,
            assertions,
        }
    }

    /// The identity repository.
    pub fn repository(&self) -> &IdentityRepository {
        &self.repo
    }

    /// Mutable access to the identity repository.
    pub fn repository_mut(&mut self) -> &mut IdentityRepository {
        &mut self.repo
    }

    /// The compiled rule set.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Engine counters accumulated so far.
    pub fn stats(&self) -> &EngineStats {
        self.engine.stats()
    }

    /// Per-rule fire counts for the run, keyed by declaration-order rule id.
    pub fn rule_fires(&self) -> &std::collections::BTreeMap<RuleId, u64> {
        self.engine.rule_fires()
    }

    /// Integrate one reference.
    pub fn integrate(&mut self, reference: Reference) -> Result<Resolution> {
        self.engine.integrate(
            &mut self.repo,
            &self.rules,
            &self.comparators,
            Some(&self.filter),
            reference,
        )
    }

    /// Drain a source, integrating each reference in input order, then run
    /// the fixpoint pass when the strategy calls for one.
    ///
    /// Assignments reflect the final state: references absorbed during the
    /// fixpoint pass report their surviving identity.
    pub fn resolve(&mut self, source: &mut dyn ReferenceSource) -> Result<RunReport> {
        let mut assignments = Vec::new();
        while let Some(reference) = source.next_reference()? {
            let ref_id = reference.id.clone();
            let resolution = self.integrate(reference)?;
            if let Some(identity) = resolution.identity() {
                assignments.push((ref_id, identity.clone()));
            }
        }

        let consolidation = if self.engine.strategy() == Strategy::IterativeFixpoint {
            Some(self.consolidate()?)
        } else {
            None
        };

        for (ref_id, identity) in assignments.iter_mut() {
            if let Some(current) = self.repo.identity_of(ref_id) {
                *identity = current.clone();
            }
        }

        Ok(RunReport {
            assignments,
            stats: *self.engine.stats(),
            consolidation,
        })
    }

    /// Run the worklist-driven fixpoint consolidation pass.
    pub fn consolidate(&mut self) -> Result<ConsolidationReport> {
        self.engine.consolidate(
            &mut self.repo,
            &self.rules,
            &self.comparators,
            Some(&self.filter),
        )
    }

    /// Record a ref-to-ref assertion key for a reference.
    pub fn assert_ref_to_ref(&mut self, key: &str, reference: RefId) {
        self.assertions
            .assert_ref_to_ref(&mut self.repo, key, reference);
    }

    /// Record that a reference must be attached to a named identity.
    pub fn assert_ref_to_structure(&mut self, identity: &IdentityId, reference: RefId) {
        self.assertions
            .assert_ref_to_structure(&mut self.repo, identity, reference);
    }

    /// Record a structure-to-structure assertion key for a reference.
    pub fn assert_structure_to_structure(&mut self, key: &str, reference: RefId) {
        self.assertions
            .assert_structure_to_structure(&mut self.repo, key, reference);
    }

    /// Queue a split request for the next assertion apply.
    pub fn assert_split(&mut self, identity: IdentityId, reference: RefId) {
        self.assertions
            .assert_split(&mut self.repo, identity, reference);
    }

    /// Apply all pending assertions as a post-pass.
    pub fn apply_assertions(&mut self) -> std::result::Result<AssertionReport, AssertionError> {
        self.assertions.apply(&mut self.repo)
    }

    /// Save the repository as a JSON document.
    pub fn save_repository(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        persistence::save_repository(&self.repo, path)
    }

    /// Load a JSON document into the repository. Returns identities loaded.
    pub fn load_repository(&mut self, path: impl AsRef<std::path::Path>) -> Result<usize> {
        persistence::load_repository(&mut self.repo, path)
    }

    /// Save a compact binary snapshot.
    pub fn save_snapshot(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        persistence::save_snapshot(&self.repo, path)
    }

    /// Load a binary snapshot. Returns identities loaded.
    pub fn load_snapshot(&mut self, path: impl AsRef<std::path::Path>) -> Result<usize> {
        persistence::load_snapshot(&mut self.repo, path)
    }

    /// Write the link table: one row per reference id.
    pub fn write_link_table<W: std::io::Write>(&self, writer: W) -> Result<usize> {
        persistence::write_link_table(&self.repo, writer)
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("repository", &self.repo)
            .field("rules", &self.rules.len())
            .field("strategy", &self.engine.strategy())
            .finish()
    }
}
