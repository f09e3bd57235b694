//! # Persistence
//!
//! The narrow load/save contract the resolution core needs: a document of
//! identity entries that round-trips losslessly for all core-consumed fields
//! (identity id, creation date, persistence flag, ordered member value
//! records as `tag^value` pipe-delimited pairs, cross-link lists, and
//! per-member trace history), plus a compact binary snapshot and the link
//! table output.
//!
//! The merge ledger is per-run audit state and is deliberately not part of
//! the durable format.

use crate::cluster::Cluster;
use crate::model::{IdentityId, RefId, Reference, StringInterner, Trace};
use crate::repository::IdentityRepository;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Version stamp carried by every persisted document.
pub const STORAGE_FORMAT_VERSION: u32 = 1;

/// Separator between the attribute tag and its value inside a member record.
const TAG_VALUE_SEPARATOR: char = '^';

/// The durable repository document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryDocument {
    /// Format version for compatibility checks.
    pub format_version: u32,
    /// One entry per live identity, ordered by identity id.
    pub identities: Vec<IdentityEntry>,
}

/// One persisted identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityEntry {
    /// The identity id.
    pub identity: String,
    /// Creation date.
    pub created: DateTime<Utc>,
    /// Persistence flag as of the saving run.
    pub persistent: bool,
    /// Ordered member value records.
    pub references: Vec<MemberEntry>,
    /// Positively linked identity ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positive_links: Vec<String>,
    /// Negatively linked identity ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub negative_links: Vec<String>,
    /// Per-member trace history.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<TraceEntry>,
}

/// One member: its reference id and `tag^value` pipe-delimited values.
///
/// Attribute tags and value tokens must not contain `^` or `|`; the source
/// readers normalize these out before integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberEntry {
    /// Source-qualified reference id (`source.uid`).
    pub id: String,
    /// `tag^value` pairs joined with `|`, one pair per value token.
    pub values: String,
}

/// One trace record: the rules that attached a member in a given run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// The member reference id.
    pub reference: String,
    /// Responsible rule names or assertion markers.
    pub rules: Vec<String>,
    /// The originating run.
    pub run_id: String,
}

fn encode_member(reference: &Reference, interner: &StringInterner) -> Result<MemberEntry> {
    let mut pairs = Vec::new();
    for attr in reference.attrs() {
        let tag = interner
            .get_attr(attr)
            .ok_or_else(|| anyhow!("attribute {attr} has no interned name"))?;
        for token in reference.tokens(attr) {
            pairs.push(format!("{tag}{TAG_VALUE_SEPARATOR}{token}"));
        }
    }
    Ok(MemberEntry {
        id: reference.id.to_string(),
        values: pairs.join("|"),
    })
}

fn decode_member(entry: &MemberEntry, interner: &mut StringInterner) -> Result<Reference> {
    let id = RefId::parse(&entry.id)
        .ok_or_else(|| anyhow!("malformed reference id '{}'", entry.id))?;
    let mut values: BTreeMap<crate::model::AttrId, String> = BTreeMap::new();

    for pair in entry.values.split('|').filter(|pair| !pair.is_empty()) {
        let (tag, token) = pair
            .split_once(TAG_VALUE_SEPARATOR)
            .ok_or_else(|| anyhow!("malformed value pair '{pair}' in reference {id}"))?;
        let attr = interner.intern_attr(tag);
        match values.get_mut(&attr) {
            Some(existing) => {
                existing.push(crate::model::MULTI_VALUE_SEPARATOR);
                existing.push_str(token);
            }
            None => {
                values.insert(attr, token.to_string());
            }
        }
    }

    Ok(Reference::new(id, values))
}

/// Export the repository's live identities as a document.
pub fn to_document(repo: &IdentityRepository) -> Result<RepositoryDocument> {
    let mut identities = Vec::with_capacity(repo.len());
    let mut ids = repo.live_identities();
    ids.sort();

    for id in ids {
        let cluster = repo
            .identity(&id)
            .ok_or_else(|| anyhow!("identity {id} vanished during export"))?;

        let mut references = Vec::with_capacity(cluster.len());
        for member in cluster.members() {
            references.push(encode_member(member, repo.interner())?);
        }

        let mut traces = Vec::new();
        for (ref_id, history) in cluster.traces() {
            for trace in history {
                traces.push(TraceEntry {
                    reference: ref_id.to_string(),
                    rules: trace.rules.iter().cloned().collect(),
                    run_id: trace.run_id.clone(),
                });
            }
        }

        identities.push(IdentityEntry {
            identity: cluster.identity.to_string(),
            created: cluster.created,
            persistent: cluster.persistent,
            references,
            positive_links: cluster.positive_links.iter().map(|l| l.to_string()).collect(),
            negative_links: cluster.negative_links.iter().map(|l| l.to_string()).collect(),
            traces,
        });
    }

    Ok(RepositoryDocument {
        format_version: STORAGE_FORMAT_VERSION,
        identities,
    })
}

/// Restore identities from a document into the repository.
///
/// Loaded clusters are marked persistent; the link, rule, and index maps are
/// rebuilt from members and traces. Returns the number of identities loaded.
pub fn from_document(repo: &mut IdentityRepository, document: &RepositoryDocument) -> Result<usize> {
    if document.format_version != STORAGE_FORMAT_VERSION {
        bail!(
            "unsupported repository format version {} (expected {})",
            document.format_version,
            STORAGE_FORMAT_VERSION
        );
    }

    for entry in &document.identities {
        let identity = IdentityId::new(entry.identity.clone());
        if entry.references.is_empty() {
            bail!("identity {identity} has no members");
        }

        let mut members = Vec::with_capacity(entry.references.len());
        for member in &entry.references {
            members.push(decode_member(member, repo.interner_mut())?);
        }

        let mut traces: BTreeMap<RefId, Vec<Trace>> = BTreeMap::new();
        for trace in &entry.traces {
            let ref_id = RefId::parse(&trace.reference)
                .ok_or_else(|| anyhow!("malformed trace reference '{}'", trace.reference))?;
            traces.entry(ref_id).or_default().push(Trace::new(
                trace.rules.iter().cloned().collect(),
                trace.run_id.clone(),
            ));
        }

        let positive_links: BTreeSet<IdentityId> = entry
            .positive_links
            .iter()
            .map(|link| IdentityId::new(link.clone()))
            .collect();
        let negative_links: BTreeSet<IdentityId> = entry
            .negative_links
            .iter()
            .map(|link| IdentityId::new(link.clone()))
            .collect();

        let cluster = Cluster::from_parts(
            identity,
            entry.persistent,
            entry.created,
            members,
            BTreeMap::new(),
            positive_links,
            negative_links,
            traces,
        );
        repo.restore_persistent(cluster)?;
    }

    Ok(document.identities.len())
}

/// Save the repository as a JSON document.
pub fn save_repository(repo: &IdentityRepository, path: impl AsRef<Path>) -> Result<()> {
    let document = to_document(repo)?;
    let file = File::create(path.as_ref())
        .with_context(|| format!("creating {}", path.as_ref().display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &document)
        .with_context(|| format!("writing {}", path.as_ref().display()))?;
    Ok(())
}

/// Load a JSON document into the repository. Returns identities loaded.
pub fn load_repository(repo: &mut IdentityRepository, path: impl AsRef<Path>) -> Result<usize> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("opening {}", path.as_ref().display()))?;
    let document: RepositoryDocument = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.as_ref().display()))?;
    from_document(repo, &document)
}

/// Save a compact binary snapshot of the repository document.
pub fn save_snapshot(repo: &IdentityRepository, path: impl AsRef<Path>) -> Result<()> {
    let document = to_document(repo)?;
    let file = File::create(path.as_ref())
        .with_context(|| format!("creating {}", path.as_ref().display()))?;
    bincode::serialize_into(BufWriter::new(file), &document)
        .with_context(|| format!("writing {}", path.as_ref().display()))?;
    Ok(())
}

/// Load a binary snapshot into the repository. Returns identities loaded.
pub fn load_snapshot(repo: &mut IdentityRepository, path: impl AsRef<Path>) -> Result<usize> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("opening {}", path.as_ref().display()))?;
    let document: RepositoryDocument = bincode::deserialize_from(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.as_ref().display()))?;
    from_document(repo, &document)
}

/// Write the link table: one row per reference id, tab-separated, with the
/// resolved identity id and the responsible rule names joined with `;`.
/// Returns the number of rows written.
pub fn write_link_table<W: Write>(repo: &IdentityRepository, mut writer: W) -> Result<usize> {
    let mut rows: Vec<(RefId, IdentityId)> = repo
        .links()
        .map(|(ref_id, identity)| (ref_id.clone(), identity.clone()))
        .collect();
    rows.sort();

    for (ref_id, identity) in &rows {
        let rules = repo
            .rules_for(ref_id)
            .map(|names| names.iter().cloned().collect::<Vec<_>>().join(";"))
            .unwrap_or_default();
        writeln!(writer, "{ref_id}\t{identity}\t{rules}")
            .context("writing link table row")?;
    }

    Ok(rows.len())
}
