//! # Data Model
//!
//! Core data structures for entity resolution: reference and identity
//! identifiers, the attribute interner, input references, and the merged
//! views used as comparison targets during rule evaluation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Separator used inside multi-valued attribute strings (`"a|b|c"`).
pub const MULTI_VALUE_SEPARATOR: char = '|';

/// Source-qualified identifier for an input reference record.
///
/// A reference id is globally unique across sources and is never reused
/// across live clusters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefId {
    /// The originating source system (e.g., "crm", "erp").
    pub source: String,
    /// Unique identifier within the source.
    pub uid: String,
}

impl RefId {
    /// Create a new source-qualified reference id.
    pub fn new(source: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            uid: uid.into(),
        }
    }

    /// Parse a `source.uid` string produced by [`fmt::Display`].
    pub fn parse(text: &str) -> Option<Self> {
        let (source, uid) = text.split_once('.')?;
        if source.is_empty() || uid.is_empty() {
            return None;
        }
        Some(Self::new(source, uid))
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source, self.uid)
    }
}

/// Stable identifier assigned to a resolved identity cluster.
///
/// Identity ids are content-derived hex strings; their lexical order is the
/// fixed deterministic ordering used as the final tie-break on merges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(pub String);

impl IdentityId {
    /// Create an identity id from a pre-computed value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compact identifier for interned attribute names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttrId(pub u32);

impl fmt::Display for AttrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/// Compact identifier for a configured rule, ordinal in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub u16);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule{}", self.0)
    }
}

/// The four kinds of manual-override assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssertionKind {
    /// Link two references sharing an assertion-key value, no comparator.
    RefToRef,
    /// Attach a reference to a named existing identity.
    RefToStructure,
    /// Force-merge identities sharing an assertion key.
    StructureToStructure,
    /// Carve one reference out of its cluster into a new singleton.
    SplitStructure,
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::RefToRef => "ref-to-ref",
            Self::RefToStructure => "ref-to-structure",
            Self::StructureToStructure => "structure-to-structure",
            Self::SplitStructure => "split-structure",
        };
        write!(f, "{label}")
    }
}

/// String interner for attribute names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StringInterner {
    attr_to_id: BTreeMap<String, AttrId>,
    id_to_attr: BTreeMap<AttrId, String>,
    next_attr_id: u32,
}

impl StringInterner {
    /// Create a new string interner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an attribute name and return its id.
    pub fn intern_attr(&mut self, attr: &str) -> AttrId {
        if let Some(&id) = self.attr_to_id.get(attr) {
            return id;
        }

        let id = AttrId(self.next_attr_id);
        self.next_attr_id += 1;

        self.attr_to_id.insert(attr.to_string(), id);
        self.id_to_attr.insert(id, attr.to_string());

        id
    }

    /// Get the name for an attribute id.
    pub fn get_attr(&self, id: AttrId) -> Option<&str> {
        self.id_to_attr.get(&id).map(String::as_str)
    }

    /// Get the id for an attribute name, if already interned.
    pub fn get_attr_id(&self, attr: &str) -> Option<AttrId> {
        self.attr_to_id.get(attr).copied()
    }

    /// All interned attribute ids.
    pub fn attr_ids(&self) -> impl Iterator<Item = AttrId> + '_ {
        self.id_to_attr.keys().copied()
    }
}

/// One input observation describing a real-world entity.
///
/// A reference carries a flat attribute-to-value map. Values may be
/// multi-valued, joined with [`MULTI_VALUE_SEPARATOR`]. References are
/// immutable once ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Globally unique, source-qualified reference id.
    pub id: RefId,
    /// Attribute values, keyed by interned attribute id.
    pub values: BTreeMap<AttrId, String>,
}

impl Reference {
    /// Create a new reference.
    pub fn new(id: RefId, values: BTreeMap<AttrId, String>) -> Self {
        Self { id, values }
    }

    /// Builder-style value insertion.
    pub fn with_value(mut self, attr: AttrId, value: impl Into<String>) -> Self {
        self.values.insert(attr, value.into());
        self
    }

    /// The raw (possibly pipe-joined) value for an attribute.
    pub fn value(&self, attr: AttrId) -> Option<&str> {
        self.values.get(&attr).map(String::as_str)
    }

    /// Individual tokens for an attribute, splitting multi-valued strings.
    pub fn tokens(&self, attr: AttrId) -> impl Iterator<Item = &str> {
        self.values
            .get(&attr)
            .into_iter()
            .flat_map(|value| value.split(MULTI_VALUE_SEPARATOR))
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    /// Attributes present on this reference.
    pub fn attrs(&self) -> impl Iterator<Item = AttrId> + '_ {
        self.values.keys().copied()
    }
}

/// A derived, read-only attribute-wise aggregate over cluster members.
///
/// The merged view is the comparison target during rule evaluation: for each
/// attribute it carries the union of member tokens, de-duplicated in
/// first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedView {
    values: BTreeMap<AttrId, Vec<String>>,
}

impl MergedView {
    /// Build a view over a single reference.
    pub fn of_reference(reference: &Reference) -> Self {
        Self::union_of(std::slice::from_ref(reference))
    }

    /// Build the attribute-wise token union over a set of members.
    pub fn union_of(members: &[Reference]) -> Self {
        let mut values: BTreeMap<AttrId, Vec<String>> = BTreeMap::new();
        for member in members {
            for attr in member.attrs() {
                let tokens = values.entry(attr).or_default();
                for token in member.tokens(attr) {
                    if !tokens.iter().any(|existing| existing == token) {
                        tokens.push(token.to_string());
                    }
                }
            }
        }
        values.retain(|_, tokens| !tokens.is_empty());
        Self { values }
    }

    /// Tokens for an attribute, empty when absent.
    pub fn tokens(&self, attr: AttrId) -> &[String] {
        self.values.get(&attr).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Attributes present in the view.
    pub fn attrs(&self) -> impl Iterator<Item = AttrId> + '_ {
        self.values.keys().copied()
    }

    /// Iterate (attribute, token) pairs in deterministic order.
    pub fn pairs(&self) -> impl Iterator<Item = (AttrId, &str)> + '_ {
        self.values
            .iter()
            .flat_map(|(attr, tokens)| tokens.iter().map(|token| (*attr, token.as_str())))
    }

    /// True when the view carries no tokens at all.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Expand the view into its per-attribute value cross-product.
    ///
    /// Each returned view holds exactly one token per attribute. Used by the
    /// iterative consolidation engine, since any single stored combination of
    /// a multi-member cluster might miss a valid match. When the product
    /// would exceed `cap`, the full union view is returned unexpanded.
    pub fn combinations(&self, cap: usize) -> Vec<MergedView> {
        let mut total: usize = 1;
        for tokens in self.values.values() {
            total = match total.checked_mul(tokens.len()) {
                Some(product) if product <= cap => product,
                _ => return vec![self.clone()],
            };
        }
        if total <= 1 {
            return vec![self.clone()];
        }

        let attrs: Vec<AttrId> = self.values.keys().copied().collect();
        let mut combos: Vec<BTreeMap<AttrId, Vec<String>>> = vec![BTreeMap::new()];
        for attr in attrs {
            let tokens = &self.values[&attr];
            let mut next = Vec::with_capacity(combos.len() * tokens.len());
            for combo in combos {
                for token in tokens {
                    let mut extended = combo.clone();
                    extended.insert(attr, vec![token.clone()]);
                    next.push(extended);
                }
            }
            combos = next;
        }

        combos
            .into_iter()
            .map(|values| MergedView { values })
            .collect()
    }
}

/// Audit entry recording which rules attached a member and in which run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    /// Names of the rules (or assertion markers) responsible.
    pub rules: std::collections::BTreeSet<String>,
    /// The run that performed the attachment.
    pub run_id: String,
}

impl Trace {
    /// Create a new trace entry.
    pub fn new(rules: std::collections::BTreeSet<String>, run_id: impl Into<String>) -> Self {
        Self {
            rules,
            run_id: run_id.into(),
        }
    }
}

/// Collaborator yielding the next reference to integrate.
///
/// Returns `Ok(None)` at end of input. Raw parsing of delimited or
/// fixed-width sources lives behind this seam.
pub trait ReferenceSource {
    /// Yield the next reference, or `None` when the input is exhausted.
    fn next_reference(&mut self) -> anyhow::Result<Option<Reference>>;
}

/// In-memory source over a pre-built list of references.
#[derive(Debug, Default)]
pub struct VecSource {
    references: std::collections::VecDeque<Reference>,
}

impl VecSource {
    /// Create a source over the given references, yielded in order.
    pub fn new(references: Vec<Reference>) -> Self {
        Self {
            references: references.into(),
        }
    }
}

impl ReferenceSource for VecSource {
    fn next_reference(&mut self) -> anyhow::Result<Option<Reference>> {
        Ok(self.references.pop_front())
    }
}
