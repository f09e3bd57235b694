//! # Deterministic Identity Ids
//!
//! Content-derived identity id generation. Identical logical content must
//! always yield the same id, across runs and machines.

use crate::model::{IdentityId, MergedView, RefId};
use std::collections::BTreeSet;

/// Collaborator producing deterministic, content-derived identity ids.
pub trait IdGenerator {
    /// Derive the id for a cluster with the given merged view and members.
    ///
    /// `derived` marks ids minted for split products so they never collide
    /// with the id the same content would receive on first integration.
    fn next_id(&self, view: &MergedView, members: &[RefId], derived: bool) -> IdentityId;
}

/// Default generator: a keyed blake3 hash over the canonical cluster content.
///
/// The hash covers the member reference ids and every (attribute, token)
/// pair of the merged view except pass-through attributes, which carry data
/// without contributing to identity.
#[derive(Debug, Clone, Default)]
pub struct Blake3IdGenerator {
    pass_through: BTreeSet<crate::model::AttrId>,
}

const DOMAIN_PRIMARY: &str = "identity.v1";
const DOMAIN_DERIVED: &str = "identity.derived.v1";

impl Blake3IdGenerator {
    /// Create a generator with no pass-through attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude the given attributes from identity hashing.
    pub fn with_pass_through(pass_through: BTreeSet<crate::model::AttrId>) -> Self {
        Self { pass_through }
    }
}

impl IdGenerator for Blake3IdGenerator {
    fn next_id(&self, view: &MergedView, members: &[RefId], derived: bool) -> IdentityId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(
            if derived {
                DOMAIN_DERIVED
            } else {
                DOMAIN_PRIMARY
            }
            .as_bytes(),
        );

        let mut member_keys: Vec<String> = members.iter().map(RefId::to_string).collect();
        member_keys.sort();
        for key in &member_keys {
            hasher.update(b"\x00r");
            hasher.update(key.as_bytes());
        }

        for attr in view.attrs() {
            if self.pass_through.contains(&attr) {
                continue;
            }
            let mut tokens: Vec<&str> = view.tokens(attr).iter().map(String::as_str).collect();
            tokens.sort_unstable();
            for token in tokens {
                hasher.update(b"\x00a");
                hasher.update(&attr.0.to_be_bytes());
                hasher.update(b"\x00v");
                hasher.update(token.as_bytes());
            }
        }

        let digest = hasher.finalize();
        IdentityId::new(digest.to_hex()[..32].to_string())
    }
}
