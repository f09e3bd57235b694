//! # Rule Matrix & Mask Evaluator
//!
//! Compiles configured rule terms into fixed-width bitset masks over
//! (attribute item, match result) and evaluates candidates against them.
//! A rule fires iff every true cell in its mask is also true in the match
//! matrix built for the current candidate, so satisfaction is a word-wise
//! `(matrix & mask) == mask` check per rule.

use crate::compare::ComparatorRegistry;
use crate::error::ResolveError;
use crate::model::{AttrId, MergedView, RuleId};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// One term of a rule definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTerm {
    /// The attribute item being compared.
    pub item: AttrId,
    /// Additional candidate attributes to compare the input item against.
    pub compare_to: Vec<AttrId>,
    /// The match-result label this term requires.
    pub result: String,
}

impl RuleTerm {
    /// Create a term requiring `result` on `item`.
    pub fn new(item: AttrId, result: impl Into<String>) -> Self {
        Self {
            item,
            compare_to: Vec::new(),
            result: result.into(),
        }
    }

    /// Add a secondary candidate attribute to compare against.
    pub fn compare_to(mut self, attr: AttrId) -> Self {
        self.compare_to.push(attr);
        self
    }
}

/// A named rule: the conjunction of its terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDef {
    /// Unique rule name, reported in traces and link output.
    pub name: String,
    /// Terms, all of which must hold for the rule to fire.
    pub terms: Vec<RuleTerm>,
}

impl RuleDef {
    /// Create a rule definition.
    pub fn new(name: impl Into<String>, terms: Vec<RuleTerm>) -> Self {
        Self {
            name: name.into(),
            terms,
        }
    }
}

/// Fixed-width boolean grid over (item row, result column), backed by u64 words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitGrid {
    words: Vec<u64>,
    cols: usize,
}

impl BitGrid {
    /// Create an all-false grid.
    pub fn new(rows: usize, cols: usize) -> Self {
        let bits = rows * cols;
        Self {
            words: vec![0; bits.div_ceil(64)],
            cols,
        }
    }

    #[inline]
    fn bit(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    /// Set cell (row, col) true.
    #[inline]
    pub fn set(&mut self, row: usize, col: usize) {
        let bit = self.bit(row, col);
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    /// Test cell (row, col).
    #[inline]
    pub fn test(&self, row: usize, col: usize) -> bool {
        let bit = self.bit(row, col);
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    /// True when every set bit of `mask` is also set in `self`.
    #[inline]
    pub fn dominates(&self, mask: &BitGrid) -> bool {
        self.words
            .iter()
            .zip(&mask.words)
            .all(|(matrix, mask)| matrix & mask == *mask)
    }
}

/// A compiled rule: declaration-order id, name, and its bitset mask.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// Ordinal id reflecting declaration order.
    pub id: RuleId,
    /// The configured rule name.
    pub name: String,
    mask: BitGrid,
    terms: Vec<RuleTerm>,
}

/// Outcome of evaluating one candidate against the rule set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Whether any rule fired.
    pub fired: bool,
    /// The declaration-order-first fired rule, for deterministic statistics.
    pub first_fired: Option<RuleId>,
    /// Every rule that fired.
    pub all_fired: Vec<RuleId>,
}

/// The compiled rule set: matrix geometry plus one mask per rule.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    item_rows: FxHashMap<AttrId, usize>,
    items: Vec<AttrId>,
    result_cols: FxHashMap<String, usize>,
    results: Vec<String>,
}

impl RuleSet {
    /// Compile rule definitions into bitset masks.
    ///
    /// Matrix rows are the distinct attribute items referenced by any term,
    /// columns the distinct result labels, both in first-declaration order.
    pub fn compile(defs: Vec<RuleDef>) -> Result<Self, ResolveError> {
        if defs.is_empty() {
            return Err(ResolveError::configuration("rule set is empty"));
        }
        if defs.len() > u16::MAX as usize {
            return Err(ResolveError::configuration("too many rules"));
        }

        let mut items = Vec::new();
        let mut item_rows = FxHashMap::default();
        let mut results = Vec::new();
        let mut result_cols = FxHashMap::default();
        let mut seen_names = BTreeSet::new();

        for def in &defs {
            if def.terms.is_empty() {
                return Err(ResolveError::Configuration(format!(
                    "rule '{}' has no terms",
                    def.name
                )));
            }
            if !seen_names.insert(def.name.clone()) {
                return Err(ResolveError::Configuration(format!(
                    "duplicate rule name '{}'",
                    def.name
                )));
            }
            for term in &def.terms {
                item_rows.entry(term.item).or_insert_with(|| {
                    items.push(term.item);
                    items.len() - 1
                });
                if term.result.is_empty() {
                    return Err(ResolveError::Configuration(format!(
                        "rule '{}' has a term with an empty result label",
                        def.name
                    )));
                }
                result_cols.entry(term.result.clone()).or_insert_with(|| {
                    results.push(term.result.clone());
                    results.len() - 1
                });
            }
        }

        let rules = defs
            .into_iter()
            .enumerate()
            .map(|(ordinal, def)| {
                let mut mask = BitGrid::new(items.len(), results.len());
                for term in &def.terms {
                    mask.set(item_rows[&term.item], result_cols[&term.result]);
                }
                CompiledRule {
                    id: RuleId(ordinal as u16),
                    name: def.name,
                    mask,
                    terms: def.terms,
                }
            })
            .collect();

        Ok(Self {
            rules,
            item_rows,
            items,
            result_cols,
            results,
        })
    }

    /// Number of compiled rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no rules are compiled (unreachable after `compile`).
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The name of a rule by id.
    pub fn rule_name(&self, id: RuleId) -> Option<&str> {
        self.rules.get(id.0 as usize).map(|rule| rule.name.as_str())
    }

    /// Names for a set of fired rules, in declaration order.
    pub fn rule_names(&self, ids: &[RuleId]) -> BTreeSet<String> {
        ids.iter()
            .filter_map(|id| self.rule_name(*id).map(str::to_string))
            .collect()
    }

    /// The distinct attribute items referenced by any rule term.
    pub fn items(&self) -> &[AttrId] {
        &self.items
    }

    /// Per-rule conjunctions of items whose terms require `result_label`.
    ///
    /// This is the raw material for the least-common-rule-denominator
    /// pre-filter: a candidate that cannot satisfy any such conjunction by
    /// plain token containment can never fire the corresponding rule.
    pub fn conjunctions_for_result(&self, result_label: &str) -> Vec<Vec<AttrId>> {
        self.rules
            .iter()
            .filter_map(|rule| {
                let attrs: Vec<AttrId> = rule
                    .terms
                    .iter()
                    .filter(|term| term.result == result_label)
                    .map(|term| term.item)
                    .collect();
                (!attrs.is_empty()).then_some(attrs)
            })
            .collect()
    }

    /// Evaluate one candidate view against the full rule set.
    ///
    /// Builds a fresh match matrix for this candidate: for every term the
    /// full cross-product of input tokens against candidate tokens (of the
    /// item plus any compare-to attributes) is compared, and any pairing
    /// achieving a known result label sets the corresponding cell. Rules
    /// fire independent of term evaluation order; `first_fired` reflects
    /// declaration order.
    pub fn evaluate(
        &self,
        input: &MergedView,
        candidate: &MergedView,
        comparators: &ComparatorRegistry,
    ) -> Verdict {
        let mut matrix = BitGrid::new(self.items.len(), self.results.len());

        for rule in &self.rules {
            for term in &rule.terms {
                let row = self.item_rows[&term.item];
                let desired_col = self.result_cols[&term.result];
                if matrix.test(row, desired_col) {
                    continue;
                }

                let comparator = comparators.comparator_for(term.item);
                let sources = input.tokens(term.item);

                'probe: for source in sources {
                    let targets = candidate.tokens(term.item).iter().chain(
                        term.compare_to
                            .iter()
                            .flat_map(|attr| candidate.tokens(*attr).iter()),
                    );
                    for target in targets {
                        if let Some(achieved) = comparator.compare(source, target, &term.result) {
                            if let Some(&col) = self.result_cols.get(achieved.as_str()) {
                                matrix.set(row, col);
                            }
                            if matrix.test(row, desired_col) {
                                break 'probe;
                            }
                        }
                    }
                }
            }
        }

        let mut all_fired = Vec::new();
        for rule in &self.rules {
            if matrix.dominates(&rule.mask) {
                all_fired.push(rule.id);
            }
        }

        Verdict {
            fired: !all_fired.is_empty(),
            first_fired: all_fired.first().copied(),
            all_fired,
        }
    }
}
