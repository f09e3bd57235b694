//! # Assertion Engine
//!
//! Manual-override merges and splits applied independent of rule matching,
//! as a post-pass over the repository. Merge-kind assertions are recorded in
//! the repository's assert map as references arrive and batch-applied after
//! a pass; split requests are validated as a whole batch before any mutation
//! is committed.

use crate::model::{AssertionKind, IdentityId, RefId, Trace};
use crate::repository::IdentityRepository;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

/// Rule-map marker recorded for reference-to-reference attachments.
pub const MARKER_REF_TO_REF: &str = "@ref-to-ref";
/// Rule-map marker recorded for reference-to-structure attachments.
pub const MARKER_REF_TO_STRUCTURE: &str = "@ref-to-structure";
/// Rule-map marker recorded for structure-to-structure merges.
pub const MARKER_STRUCTURE_TO_STRUCTURE: &str = "@structure-to-structure";
/// Rule-map marker recorded for split products.
pub const MARKER_SPLIT: &str = "@split-structure";

/// Validation failure for an assertion batch.
///
/// Each variant carries a distinct error code; a failure aborts the entire
/// pending batch for its assertion kind, leaving the repository unmutated by
/// that batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssertionError {
    /// The pending splits would remove every member from a cluster.
    #[error("splits would remove every member from identity {identity}")]
    SplitWouldEmptyCluster {
        /// The origin cluster that would be emptied.
        identity: IdentityId,
    },
    /// An assertion names an identity that does not exist.
    #[error("assertion names unknown identity {identity}")]
    UnknownIdentity {
        /// The missing identity.
        identity: IdentityId,
    },
    /// A split names a reference that is not in the repository.
    #[error("split names unknown reference {reference}")]
    UnknownReference {
        /// The missing reference.
        reference: RefId,
    },
    /// A split names a reference that exists but belongs elsewhere.
    #[error("reference {reference} is not a member of identity {identity}")]
    ReferenceNotInIdentity {
        /// The named origin cluster.
        identity: IdentityId,
        /// The reference owned by a different cluster.
        reference: RefId,
    },
    /// A validated split still failed to commit.
    #[error("split of {reference} from {identity} failed: {message}")]
    SplitFailed {
        /// The named origin cluster.
        identity: IdentityId,
        /// The reference being split out.
        reference: RefId,
        /// The underlying failure.
        message: String,
    },
}

impl AssertionError {
    /// Stable error code for logs and caller dispatch.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SplitWouldEmptyCluster { .. } => "E-ASSERT-EMPTY",
            Self::UnknownIdentity { .. } => "E-ASSERT-IDENTITY",
            Self::UnknownReference { .. } => "E-ASSERT-REFERENCE",
            Self::ReferenceNotInIdentity { .. } => "E-ASSERT-MEMBERSHIP",
            Self::SplitFailed { .. } => "E-ASSERT-SPLIT",
        }
    }
}

/// One pending split: carve `reference` out of `identity`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SplitRequest {
    /// The origin cluster.
    pub identity: IdentityId,
    /// The member to carve out.
    pub reference: RefId,
}

/// Counts of applied assertion effects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssertionReport {
    /// Identities dissolved by forced merges.
    pub merged: usize,
    /// References attached or moved to a named identity.
    pub attached: usize,
    /// Split singletons created.
    pub split: usize,
}

/// Applies manual-override assertions as a post-pass.
#[derive(Debug)]
pub struct AssertionEngine {
    run_id: String,
    splits: BTreeSet<SplitRequest>,
}

impl AssertionEngine {
    /// Create an assertion engine for a run.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            splits: BTreeSet::new(),
        }
    }

    /// Record that a reference carries a ref-to-ref assertion key.
    ///
    /// All references sharing the key value are merged on apply, with no
    /// comparator involved.
    pub fn assert_ref_to_ref(&mut self, repo: &mut IdentityRepository, key: &str, reference: RefId) {
        repo.queue_assertion(AssertionKind::RefToRef, key, reference);
    }

    /// Record that a reference must be attached to a named identity.
    pub fn assert_ref_to_structure(
        &mut self,
        repo: &mut IdentityRepository,
        identity: &IdentityId,
        reference: RefId,
    ) {
        repo.queue_assertion(AssertionKind::RefToStructure, &identity.0, reference);
    }

    /// Record that the clusters owning references sharing a key must merge.
    pub fn assert_structure_to_structure(
        &mut self,
        repo: &mut IdentityRepository,
        key: &str,
        reference: RefId,
    ) {
        repo.queue_assertion(AssertionKind::StructureToStructure, key, reference);
    }

    /// Queue a split request for the next apply.
    pub fn assert_split(
        &mut self,
        repo: &mut IdentityRepository,
        identity: IdentityId,
        reference: RefId,
    ) {
        repo.queue_assertion(AssertionKind::SplitStructure, &identity.0, reference.clone());
        self.splits.insert(SplitRequest {
            identity,
            reference,
        });
    }

    /// The split requests queued for the next apply.
    pub fn pending_splits(&self) -> impl Iterator<Item = &SplitRequest> {
        self.splits.iter()
    }

    /// Apply all pending assertions.
    ///
    /// Kinds are applied in declaration order: ref-to-ref, ref-to-structure,
    /// structure-to-structure, then splits. Each kind validates its whole
    /// batch before mutating; a validation failure aborts that kind's batch
    /// (earlier kinds' effects stand) and leaves its queue intact so the
    /// caller can abort the run.
    pub fn apply(&mut self, repo: &mut IdentityRepository) -> Result<AssertionReport, AssertionError> {
        let mut report = AssertionReport::default();
        report.merged += self.apply_ref_to_ref(repo)?;
        report.attached += self.apply_ref_to_structure(repo)?;
        report.merged += self.apply_structure_to_structure(repo)?;
        report.split += self.apply_splits(repo)?;
        Ok(report)
    }

    fn apply_ref_to_ref(&mut self, repo: &mut IdentityRepository) -> Result<usize, AssertionError> {
        let mut merged = 0;
        for (key, refs) in repo.assertions_for(AssertionKind::RefToRef) {
            let known: Vec<RefId> = refs
                .iter()
                .filter(|reference| repo.identity_of(reference).is_some())
                .cloned()
                .collect();
            if known.len() < 2 {
                continue;
            }

            let mut owners = BTreeSet::new();
            for reference in &known {
                owners.insert(repo.identity_of(reference).cloned().expect("known above"));
            }
            merged += self.merge_owners(repo, owners, MARKER_REF_TO_REF, &known)?;
            debug!(key = %key, refs = known.len(), "applied ref-to-ref assertion");
        }
        Ok(merged)
    }

    fn apply_ref_to_structure(
        &mut self,
        repo: &mut IdentityRepository,
    ) -> Result<usize, AssertionError> {
        let batch = repo.assertions_for(AssertionKind::RefToStructure);

        // Validate every named target before any mutation.
        for (key, _) in &batch {
            let target = IdentityId::new(key.clone());
            if repo.identity(&target).is_none() {
                return Err(AssertionError::UnknownIdentity { identity: target });
            }
        }

        let mut attached = 0;
        for (key, refs) in batch {
            let target = IdentityId::new(key);
            for reference in refs {
                let Some(owner) = repo.identity_of(&reference).cloned() else {
                    // Not yet integrated; stays pending for a later pass.
                    continue;
                };
                if owner == target {
                    continue;
                }
                // The named cluster keeps its identity regardless of the
                // automatic tie-break.
                repo.merge(&target, &owner)
                    .map_err(|_| AssertionError::UnknownIdentity {
                        identity: target.clone(),
                    })?;
                attached += 1;
                repo.record_rule(&reference, MARKER_REF_TO_STRUCTURE);
                let trace = Trace::new(
                    [MARKER_REF_TO_STRUCTURE.to_string()].into_iter().collect(),
                    &self.run_id,
                );
                let _ = repo.record_trace(&reference, trace);
            }
        }
        Ok(attached)
    }

    fn apply_structure_to_structure(
        &mut self,
        repo: &mut IdentityRepository,
    ) -> Result<usize, AssertionError> {
        let mut merged = 0;
        for (key, refs) in repo.assertions_for(AssertionKind::StructureToStructure) {
            let known: Vec<RefId> = refs
                .iter()
                .filter(|reference| repo.identity_of(reference).is_some())
                .cloned()
                .collect();
            let mut owners = BTreeSet::new();
            for reference in &known {
                owners.insert(repo.identity_of(reference).cloned().expect("known above"));
            }
            if owners.len() < 2 {
                continue;
            }
            merged += self.merge_owners(repo, owners, MARKER_STRUCTURE_TO_STRUCTURE, &known)?;
            debug!(key = %key, "applied structure-to-structure assertion");
        }
        Ok(merged)
    }

    /// Merge a set of owning identities into their tie-break minimum.
    fn merge_owners(
        &self,
        repo: &mut IdentityRepository,
        owners: BTreeSet<IdentityId>,
        marker: &str,
        asserted_refs: &[RefId],
    ) -> Result<usize, AssertionError> {
        let owners: Vec<IdentityId> = owners.into_iter().collect();
        let Some(mut winner) = owners.first().cloned() else {
            return Ok(0);
        };
        for other in &owners[1..] {
            winner = repo.min_identity(&winner, other);
        }

        let mut merged = 0;
        for other in &owners {
            if other == &winner {
                continue;
            }
            repo.merge(&winner, other)
                .map_err(|_| AssertionError::UnknownIdentity {
                    identity: other.clone(),
                })?;
            merged += 1;
        }

        if merged > 0 {
            for reference in asserted_refs {
                repo.record_rule(reference, marker);
                let trace = Trace::new([marker.to_string()].into_iter().collect(), &self.run_id);
                let _ = repo.record_trace(reference, trace);
            }
        }
        Ok(merged)
    }

    fn apply_splits(&mut self, repo: &mut IdentityRepository) -> Result<usize, AssertionError> {
        if self.splits.is_empty() {
            return Ok(0);
        }

        // Gate (b): every (identity, reference) pair must exist.
        // Gate (a): no origin may lose all members, counted across the whole
        // pending batch, not just the current request.
        let mut per_identity: BTreeMap<IdentityId, usize> = BTreeMap::new();
        for request in &self.splits {
            let cluster = repo.identity(&request.identity).ok_or_else(|| {
                AssertionError::UnknownIdentity {
                    identity: request.identity.clone(),
                }
            })?;
            if !cluster.contains(&request.reference) {
                if repo.identity_of(&request.reference).is_none() {
                    return Err(AssertionError::UnknownReference {
                        reference: request.reference.clone(),
                    });
                }
                return Err(AssertionError::ReferenceNotInIdentity {
                    identity: request.identity.clone(),
                    reference: request.reference.clone(),
                });
            }
            *per_identity.entry(request.identity.clone()).or_insert(0) += 1;
        }
        for (identity, split_count) in &per_identity {
            let members = repo.identity(identity).map(|cluster| cluster.len()).unwrap_or(0);
            if members <= *split_count {
                return Err(AssertionError::SplitWouldEmptyCluster {
                    identity: identity.clone(),
                });
            }
        }

        let requests: Vec<SplitRequest> = self.splits.iter().cloned().collect();
        let mut split = 0;
        for request in requests {
            repo.split(&request.identity, &request.reference, MARKER_SPLIT, &self.run_id)
                .map_err(|error| AssertionError::SplitFailed {
                    identity: request.identity.clone(),
                    reference: request.reference.clone(),
                    message: error.to_string(),
                })?;
            split += 1;
        }
        self.splits.clear();
        Ok(split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Reference;
    use std::collections::BTreeMap;

    fn reference(repo: &mut IdentityRepository, uid: &str, name_value: &str) -> Reference {
        let name = repo.interner_mut().intern_attr("name");
        Reference::new(RefId::new("test", uid), BTreeMap::new()).with_value(name, name_value)
    }

    fn create(repo: &mut IdentityRepository, uid: &str, name_value: &str) -> (RefId, IdentityId) {
        let r = reference(repo, uid, name_value);
        let ref_id = r.id.clone();
        let identity = repo.create_identity(r, BTreeSet::new(), "run-0").unwrap();
        (ref_id, identity)
    }

    #[test]
    fn test_ref_to_ref_merges_without_comparators() {
        let mut repo = IdentityRepository::new();
        let mut engine = AssertionEngine::new("run-1");

        // Entirely dissimilar references; no rule could ever fire.
        let (ref_a, id_a) = create(&mut repo, "1", "John Smith");
        let (ref_b, id_b) = create(&mut repo, "2", "Zebra Quartz");

        engine.assert_ref_to_ref(&mut repo, "case-42", ref_a.clone());
        engine.assert_ref_to_ref(&mut repo, "case-42", ref_b.clone());
        let report = engine.apply(&mut repo).unwrap();

        assert_eq!(report.merged, 1);
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.identity_of(&ref_a), repo.identity_of(&ref_b));
        let winner = repo.identity_of(&ref_a).unwrap();
        assert!(winner == &id_a || winner == &id_b);
        assert!(repo.rules_for(&ref_a).unwrap().contains(MARKER_REF_TO_REF));

        // The assertion key's reference set retains both ids.
        let keyed = repo
            .assertion_refs(AssertionKind::RefToRef, "case-42")
            .unwrap();
        assert!(keyed.contains(&ref_a) && keyed.contains(&ref_b));
    }

    #[test]
    fn test_ref_to_structure_moves_reference() {
        let mut repo = IdentityRepository::new();
        let mut engine = AssertionEngine::new("run-1");

        let (ref_a, _) = create(&mut repo, "1", "John");
        let (_, id_b) = create(&mut repo, "2", "Target");

        engine.assert_ref_to_structure(&mut repo, &id_b, ref_a.clone());
        let report = engine.apply(&mut repo).unwrap();

        assert_eq!(report.attached, 1);
        assert_eq!(repo.identity_of(&ref_a), Some(&id_b));
        // The named target keeps its identity.
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_ref_to_structure_unknown_identity_aborts() {
        let mut repo = IdentityRepository::new();
        let mut engine = AssertionEngine::new("run-1");

        let (ref_a, id_a) = create(&mut repo, "1", "John");
        engine.assert_ref_to_structure(&mut repo, &IdentityId::new("nonexistent"), ref_a.clone());

        let error = engine.apply(&mut repo).unwrap_err();
        assert_eq!(error.code(), "E-ASSERT-IDENTITY");
        // Nothing moved.
        assert_eq!(repo.identity_of(&ref_a), Some(&id_a));
    }

    #[test]
    fn test_structure_to_structure_uses_tie_break() {
        let mut repo = IdentityRepository::new();
        let mut engine = AssertionEngine::new("run-1");

        let (ref_a, id_a) = create(&mut repo, "1", "Alpha");
        let (ref_b, id_b) = create(&mut repo, "2", "Beta");

        engine.assert_structure_to_structure(&mut repo, "household-7", ref_a.clone());
        engine.assert_structure_to_structure(&mut repo, "household-7", ref_b.clone());
        let expected = repo.min_identity(&id_a, &id_b);
        let report = engine.apply(&mut repo).unwrap();

        assert_eq!(report.merged, 1);
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.identity_of(&ref_a), Some(&expected));
        assert_eq!(repo.identity_of(&ref_b), Some(&expected));
    }

    #[test]
    fn test_split_safety_last_member() {
        let mut repo = IdentityRepository::new();
        let mut engine = AssertionEngine::new("run-1");

        let (ref_a, id_a) = create(&mut repo, "1", "John");
        engine.assert_split(&mut repo, id_a.clone(), ref_a.clone());

        let error = engine.apply(&mut repo).unwrap_err();
        assert_eq!(error.code(), "E-ASSERT-EMPTY");
        // Repository unmutated.
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.identity(&id_a).unwrap().len(), 1);
        assert_eq!(repo.identity_of(&ref_a), Some(&id_a));
    }

    #[test]
    fn test_split_batch_counted_across_requests() {
        let mut repo = IdentityRepository::new();
        let mut engine = AssertionEngine::new("run-1");

        // One cluster with two members; two splits would empty it even
        // though each request alone would pass.
        let (ref_a, id_a) = create(&mut repo, "1", "John");
        let (ref_b, id_b) = create(&mut repo, "2", "Jon");
        repo.merge(&id_a, &id_b).unwrap();

        engine.assert_split(&mut repo, id_a.clone(), ref_a.clone());
        engine.assert_split(&mut repo, id_a.clone(), ref_b.clone());

        let error = engine.apply(&mut repo).unwrap_err();
        assert_eq!(error.code(), "E-ASSERT-EMPTY");
        assert_eq!(repo.identity(&id_a).unwrap().len(), 2);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_split_unknown_pair_aborts_whole_batch() {
        let mut repo = IdentityRepository::new();
        let mut engine = AssertionEngine::new("run-1");

        let (ref_a, id_a) = create(&mut repo, "1", "John");
        let (ref_b, id_b) = create(&mut repo, "2", "Jon");
        repo.merge(&id_a, &id_b).unwrap();

        // First request is valid on its own; the second names an unknown
        // reference. Neither may be applied.
        engine.assert_split(&mut repo, id_a.clone(), ref_a.clone());
        engine.assert_split(&mut repo, id_a.clone(), RefId::new("test", "ghost"));

        let error = engine.apply(&mut repo).unwrap_err();
        assert_eq!(error.code(), "E-ASSERT-REFERENCE");
        assert_eq!(repo.identity(&id_a).unwrap().len(), 2);
        assert_eq!(repo.identity_of(&ref_b), Some(&id_a));
    }

    #[test]
    fn test_valid_split_creates_negative_linked_singleton() {
        let mut repo = IdentityRepository::new();
        let mut engine = AssertionEngine::new("run-1");

        let (ref_a, id_a) = create(&mut repo, "1", "John");
        let (ref_b, id_b) = create(&mut repo, "2", "Jon");
        repo.merge(&id_a, &id_b).unwrap();

        engine.assert_split(&mut repo, id_a.clone(), ref_b.clone());
        let report = engine.apply(&mut repo).unwrap();

        assert_eq!(report.split, 1);
        assert_eq!(repo.len(), 2);
        let new_identity = repo.identity_of(&ref_b).unwrap().clone();
        assert_ne!(new_identity, id_a);
        assert!(repo.identity(&id_a).unwrap().has_negative_link(&new_identity));
        assert!(repo.identity(&new_identity).unwrap().has_negative_link(&id_a));
        assert_eq!(repo.identity_of(&ref_a), Some(&id_a));
        // The queue drains on success.
        assert_eq!(engine.pending_splits().count(), 0);
    }

    #[test]
    fn test_error_codes_are_distinct() {
        let errors = [
            AssertionError::SplitWouldEmptyCluster {
                identity: IdentityId::new("x"),
            },
            AssertionError::UnknownIdentity {
                identity: IdentityId::new("x"),
            },
            AssertionError::UnknownReference {
                reference: RefId::new("s", "1"),
            },
            AssertionError::ReferenceNotInIdentity {
                identity: IdentityId::new("x"),
                reference: RefId::new("s", "1"),
            },
            AssertionError::SplitFailed {
                identity: IdentityId::new("x"),
                reference: RefId::new("s", "1"),
                message: "m".to_string(),
            },
        ];
        let codes: BTreeSet<&str> = errors.iter().map(AssertionError::code).collect();
        assert_eq!(codes.len(), errors.len());
    }
}
