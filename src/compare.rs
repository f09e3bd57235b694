//! # Attribute Comparators
//!
//! Injected per-attribute comparison functions. A comparator receives one
//! source token, one target token, and the match result the calling rule
//! term wants, and reports which result it actually achieved. Rule
//! evaluation marks matrix cells from the achieved results.

use crate::model::AttrId;
use hashbrown::HashMap;

/// Per-attribute comparison collaborator.
///
/// `desired` is the match-result label the rule term is probing for;
/// the comparator returns the label it achieved, or `None` for no match
/// at all. The achieved label need not equal the desired one.
pub trait AttributeComparator {
    /// Compare one source token against one target token.
    fn compare(&self, source: &str, target: &str, desired: &str) -> Option<String>;
}

/// Match-result label for exact token equality.
pub const RESULT_EXACT: &str = "exact";
/// Match-result label for equality after normalization.
pub const RESULT_CLOSE: &str = "close";
/// Match-result label for initials-tolerant name equality.
pub const RESULT_INITIAL: &str = "initial";

/// Strict byte-for-byte equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactComparator;

impl AttributeComparator for ExactComparator {
    fn compare(&self, source: &str, target: &str, _desired: &str) -> Option<String> {
        (source == target).then(|| RESULT_EXACT.to_string())
    }
}

/// Case- and whitespace-insensitive equality.
///
/// Achieves `exact` on strict equality and `close` when the values only
/// differ in case or internal whitespace runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedComparator;

fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

impl AttributeComparator for NormalizedComparator {
    fn compare(&self, source: &str, target: &str, _desired: &str) -> Option<String> {
        if source == target {
            return Some(RESULT_EXACT.to_string());
        }
        (normalize(source) == normalize(target)).then(|| RESULT_CLOSE.to_string())
    }
}

/// Name comparison tolerating abbreviated given names.
///
/// `"J Smith"` achieves `initial` against `"John Smith"`: the last words
/// must match exactly (case-insensitive) and every remaining word must be a
/// prefix of its counterpart, in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitialsComparator;

impl AttributeComparator for InitialsComparator {
    fn compare(&self, source: &str, target: &str, _desired: &str) -> Option<String> {
        if source == target {
            return Some(RESULT_EXACT.to_string());
        }

        let source_words: Vec<String> = source.split_whitespace().map(str::to_lowercase).collect();
        let target_words: Vec<String> = target.split_whitespace().map(str::to_lowercase).collect();
        if source_words.is_empty() || source_words.len() != target_words.len() {
            return None;
        }

        let last = source_words.len() - 1;
        if source_words[last] != target_words[last] {
            return None;
        }

        let given_compatible = source_words[..last]
            .iter()
            .zip(&target_words[..last])
            .all(|(a, b)| a.starts_with(b.as_str()) || b.starts_with(a.as_str()));
        if !given_compatible {
            return None;
        }

        if source_words == target_words {
            Some(RESULT_CLOSE.to_string())
        } else {
            Some(RESULT_INITIAL.to_string())
        }
    }
}

/// Registry of per-attribute comparators with an exact-match fallback.
pub struct ComparatorRegistry {
    by_attr: HashMap<AttrId, Box<dyn AttributeComparator>>,
    fallback: Box<dyn AttributeComparator>,
}

impl ComparatorRegistry {
    /// Create a registry that falls back to strict equality.
    pub fn new() -> Self {
        Self {
            by_attr: HashMap::new(),
            fallback: Box::new(ExactComparator),
        }
    }

    /// Register the comparator for an attribute.
    pub fn register(&mut self, attr: AttrId, comparator: Box<dyn AttributeComparator>) {
        self.by_attr.insert(attr, comparator);
    }

    /// Builder-style registration.
    pub fn with(mut self, attr: AttrId, comparator: Box<dyn AttributeComparator>) -> Self {
        self.register(attr, comparator);
        self
    }

    /// The comparator for an attribute, or the fallback.
    pub fn comparator_for(&self, attr: AttrId) -> &dyn AttributeComparator {
        self.by_attr
            .get(&attr)
            .map(Box::as_ref)
            .unwrap_or(self.fallback.as_ref())
    }
}

impl Default for ComparatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ComparatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComparatorRegistry")
            .field("registered", &self.by_attr.len())
            .finish()
    }
}
