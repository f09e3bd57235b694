//! # Value Index & Candidate Pre-Filter
//!
//! Inverted index from (attribute, token) pairs to reference ids, used for
//! blocking-key lookup during candidate retrieval, plus the
//! least-common-rule-denominator pre-filter that cheaply rejects candidates
//! before full rule evaluation.

use crate::model::{AttrId, MergedView, RefId, Reference};
use crate::rules::RuleSet;
use hashbrown::HashMap;
use rustc_hash::FxHashSet;

/// Inverted index: (attribute, value token) -> reference ids.
#[derive(Debug, Clone, Default)]
pub struct ValueIndex {
    postings: HashMap<(AttrId, String), FxHashSet<RefId>>,
}

impl ValueIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every (attribute, token) pair of a reference.
    pub fn insert_reference(&mut self, reference: &Reference) {
        for attr in reference.attrs() {
            for token in reference.tokens(attr) {
                self.postings
                    .entry((attr, token.to_string()))
                    .or_default()
                    .insert(reference.id.clone());
            }
        }
    }

    /// Remove every posting of a reference.
    pub fn remove_reference(&mut self, reference: &Reference) {
        for attr in reference.attrs() {
            for token in reference.tokens(attr) {
                let key = (attr, token.to_string());
                if let Some(refs) = self.postings.get_mut(&key) {
                    refs.remove(&reference.id);
                    if refs.is_empty() {
                        self.postings.remove(&key);
                    }
                }
            }
        }
    }

    /// Reference ids holding `token` for `attr`.
    pub fn hits(&self, attr: AttrId, token: &str) -> Option<&FxHashSet<RefId>> {
        self.postings.get(&(attr, token.to_string()))
    }

    /// Union the index hits for every (attribute, token) pair of a view,
    /// counting how many pairs each reference matched.
    pub fn raw_candidates(&self, view: &MergedView) -> HashMap<RefId, usize> {
        let mut hits: HashMap<RefId, usize> = HashMap::new();
        for (attr, token) in view.pairs() {
            if let Some(refs) = self.postings.get(&(attr, token.to_string())) {
                for ref_id in refs {
                    *hits.entry(ref_id.clone()).or_insert(0) += 1;
                }
            }
        }
        hits
    }

    /// Number of distinct (attribute, token) postings.
    pub fn len(&self) -> usize {
        self.postings.len()
    }

    /// True when the index holds no postings.
    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }
}

/// Least-common-rule-denominator pre-filter.
///
/// A candidate passes when at least one conjunction holds: for every
/// attribute in the conjunction, the input and the candidate share at least
/// one token. This is a cheap containment check, deliberately weaker than
/// full rule evaluation; it may admit candidates the rules later reject but
/// must never reject one they would accept on those attributes.
#[derive(Debug, Clone, Default)]
pub struct LcrdFilter {
    conjunctions: Vec<Vec<AttrId>>,
}

impl LcrdFilter {
    /// Build the primary filter from the exact-result terms of each rule.
    pub fn from_rules(rules: &RuleSet, exact_label: &str) -> Self {
        let mut conjunctions = rules.conjunctions_for_result(exact_label);
        conjunctions.sort();
        conjunctions.dedup();
        Self { conjunctions }
    }

    /// Build a filter from explicit conjunctions.
    pub fn from_conjunctions(conjunctions: Vec<Vec<AttrId>>) -> Self {
        Self { conjunctions }
    }

    /// The singleton relaxation used as the secondary filter: any one
    /// shared attribute token is enough.
    pub fn secondary(&self) -> Self {
        let mut attrs: Vec<AttrId> = self
            .conjunctions
            .iter()
            .flat_map(|conjunction| conjunction.iter().copied())
            .collect();
        attrs.sort();
        attrs.dedup();
        Self {
            conjunctions: attrs.into_iter().map(|attr| vec![attr]).collect(),
        }
    }

    /// True when no conjunctions are configured (filter vacuously passes).
    pub fn is_empty(&self) -> bool {
        self.conjunctions.is_empty()
    }

    /// Check whether a candidate view survives the filter.
    pub fn accepts(&self, input: &MergedView, candidate: &MergedView) -> bool {
        if self.conjunctions.is_empty() {
            return true;
        }
        self.conjunctions.iter().any(|conjunction| {
            conjunction
                .iter()
                .all(|attr| shares_token(input, candidate, *attr))
        })
    }
}

fn shares_token(input: &MergedView, candidate: &MergedView, attr: AttrId) -> bool {
    let candidate_tokens = candidate.tokens(attr);
    input
        .tokens(attr)
        .iter()
        .any(|token| candidate_tokens.iter().any(|other| other == token))
}
