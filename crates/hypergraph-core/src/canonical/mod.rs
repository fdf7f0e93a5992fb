//! Type-label canonicalization
//!
//! Extraction proposes free-text type labels ("Org", "organisations",
//! "Business_Partners", ...). This module collapses them to one canonical
//! label per real-world type and builds the `type_proposals` table:
//!
//! - Entity proposals come from raw entity `type` values
//! - Relationship proposals come from `<label>: description` prefixes
//! - Labels already in the configured allow-list are never proposed
//! - Output is sorted by descending occurrences, then ascending label

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::ExtractGraphConfig;
use crate::graph::{Entity, Relationship};

/// Maximum sample descriptions kept per proposal
pub const MAX_SAMPLE_DESCRIPTIONS: usize = 3;

/// Irregular forms the singularization heuristic cannot reach
const ALIASES: &[(&str, &str)] = &[
    ("org", "organization"),
    ("orgs", "organization"),
    ("organisations", "organization"),
    ("companies", "company"),
    ("people", "person"),
    ("persons", "person"),
];

fn alias(label: &str) -> Option<&'static str> {
    ALIASES
        .iter()
        .find(|(raw, _)| *raw == label)
        .map(|(_, canonical)| *canonical)
}

/// Lowercase, turn `_` `-` `/` runs into spaces, collapse whitespace
fn normalize(label: &str) -> String {
    let lowered: String = label
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .map(|c| match c {
            '_' | '-' | '/' => ' ',
            other => other,
        })
        .collect::<String>()
        .to_lowercase();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn singularize(token: &str) -> String {
    let len = token.chars().count();
    if len > 3 && token.ends_with("ies") {
        format!("{}y", &token[..token.len() - 3])
    } else if len > 3 && token.ends_with('s') && !token.ends_with("ss") && !token.ends_with("us")
    {
        token[..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}

/// Canonical form of a type label; idempotent
pub fn canonicalize_label(label: &str) -> String {
    let normalized = normalize(label);
    if normalized.is_empty() {
        return normalized;
    }
    if let Some(canonical) = alias(&normalized) {
        return canonical.to_string();
    }

    let collapsed = normalized
        .split(' ')
        .map(singularize)
        .collect::<Vec<_>>()
        .join(" ");
    match alias(&collapsed) {
        Some(canonical) => canonical.to_string(),
        None => collapsed,
    }
}

/// Label prefix of a `<label>: description` relationship description
pub fn extract_relationship_label(description: &str) -> Option<String> {
    let (candidate, _) = description.split_once(':')?;
    let label: String = candidate.chars().filter(|c| !c.is_control()).collect();
    let label = label.trim();
    (!label.is_empty()).then(|| label.to_string())
}

/// Canonical forms of an allow-list, blanks dropped
pub fn allowed_keys<S: AsRef<str>>(labels: &[S]) -> BTreeSet<String> {
    labels
        .iter()
        .map(|label| canonicalize_label(label.as_ref()))
        .filter(|key| !key.is_empty())
        .collect()
}

/// Keep up to `limit` distinct non-empty trimmed values, first occurrence wins
fn unique_non_empty<'a>(values: impl IntoIterator<Item = &'a str>, limit: usize) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for value in values {
        let value = value.trim();
        if value.is_empty() || unique.iter().any(|u| u == value) {
            continue;
        }
        unique.push(value.to_string());
        if unique.len() >= limit {
            break;
        }
    }
    unique
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    Entity,
    Relationship,
}

impl std::fmt::Display for ProposalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entity => write!(f, "entity"),
            Self::Relationship => write!(f, "relationship"),
        }
    }
}

/// One consolidated row of the `type_proposals` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeProposal {
    pub proposal_kind: ProposalKind,
    pub canonical_label: String,
    pub occurrences: u64,
    pub raw_labels: Vec<String>,
    pub sample_descriptions: Vec<String>,
}

/// One observation before grouping
#[derive(Debug, Clone)]
struct ProposalRecord {
    kind: ProposalKind,
    raw_label: String,
    canonical_label: String,
    occurrences: u64,
    sample_description: String,
}

/// Canonicalizer bound to the configured allow-lists and strictness
#[derive(Debug, Clone, Default)]
pub struct TypeCanonicalizer {
    allowed_entity: BTreeSet<String>,
    allowed_relationship: BTreeSet<String>,
    strict_entity: bool,
    strict_relationship: bool,
}

impl TypeCanonicalizer {
    pub fn new<S: AsRef<str>>(entity_types: &[S], relationship_types: &[S]) -> Self {
        Self {
            allowed_entity: allowed_keys(entity_types),
            allowed_relationship: allowed_keys(relationship_types),
            strict_entity: false,
            strict_relationship: false,
        }
    }

    pub fn from_config(config: &ExtractGraphConfig) -> Self {
        Self::new(
            config.entity_types.as_slice(),
            config.relationship_types.as_slice(),
        )
        .strict(config.strict_entity_types, config.strict_relationship_types)
    }

    /// Set strict enforcement per kind
    pub fn strict(mut self, entity: bool, relationship: bool) -> Self {
        self.strict_entity = entity;
        self.strict_relationship = relationship;
        self
    }

    pub fn is_allowed_entity_type(&self, label: &str) -> bool {
        self.allowed_entity.contains(&canonicalize_label(label))
    }

    /// True when the description's label prefix is an allowed relationship type
    pub fn is_allowed_relationship(&self, relationship: &Relationship) -> bool {
        relationship.description.iter().any(|description| {
            extract_relationship_label(description)
                .is_some_and(|label| self.allowed_relationship.contains(&canonicalize_label(&label)))
        })
    }

    /// Drop records whose types are not allowed, for kinds marked strict.
    ///
    /// Relationships left pointing at a dropped entity are dropped too.
    pub fn enforce(
        &self,
        entities: Vec<Entity>,
        relationships: Vec<Relationship>,
    ) -> (Vec<Entity>, Vec<Relationship>) {
        let entities: Vec<Entity> = if self.strict_entity {
            entities
                .into_iter()
                .filter(|e| self.is_allowed_entity_type(&e.entity_type))
                .collect()
        } else {
            entities
        };

        let titles: BTreeSet<&str> = entities.iter().map(|e| e.title.as_str()).collect();
        let relationships = relationships
            .into_iter()
            .filter(|r| !self.strict_relationship || self.is_allowed_relationship(r))
            .filter(|r| {
                !self.strict_entity
                    || (titles.contains(r.source.as_str()) && titles.contains(r.target.as_str()))
            })
            .collect();
        (entities, relationships)
    }

    /// Consolidated type proposals for the non-strict kinds
    pub fn build_proposals(
        &self,
        raw_entities: &[Entity],
        raw_relationships: &[Relationship],
    ) -> Vec<TypeProposal> {
        let mut records = Vec::new();
        if !self.strict_entity {
            records.extend(self.entity_records(raw_entities));
        }
        if !self.strict_relationship {
            records.extend(self.relationship_records(raw_relationships));
        }
        consolidate(records)
    }

    fn entity_records(&self, raw_entities: &[Entity]) -> Vec<ProposalRecord> {
        raw_entities
            .iter()
            .filter_map(|entity| {
                let raw_label = entity.entity_type.trim();
                if raw_label.is_empty() {
                    return None;
                }
                let canonical_label = canonicalize_label(raw_label);
                if self.allowed_entity.contains(&canonical_label) {
                    return None;
                }
                Some(ProposalRecord {
                    kind: ProposalKind::Entity,
                    raw_label: raw_label.to_string(),
                    canonical_label,
                    occurrences: entity.frequency,
                    sample_description: entity.description.first().cloned().unwrap_or_default(),
                })
            })
            .collect()
    }

    fn relationship_records(&self, raw_relationships: &[Relationship]) -> Vec<ProposalRecord> {
        let mut records = Vec::new();
        for relationship in raw_relationships {
            for description in &relationship.description {
                let Some(raw_label) = extract_relationship_label(description) else {
                    continue;
                };
                let canonical_label = canonicalize_label(&raw_label);
                if self.allowed_relationship.contains(&canonical_label) {
                    continue;
                }
                records.push(ProposalRecord {
                    kind: ProposalKind::Relationship,
                    raw_label,
                    canonical_label,
                    occurrences: 1,
                    sample_description: description.clone(),
                });
            }
        }
        records
    }
}

/// Group by `(kind, canonical_label)` and order most-frequent first
fn consolidate(records: Vec<ProposalRecord>) -> Vec<TypeProposal> {
    struct Group {
        occurrences: u64,
        raw_labels: BTreeSet<String>,
        samples: Vec<String>,
    }

    let mut groups: BTreeMap<(ProposalKind, String), Group> = BTreeMap::new();
    for record in records {
        let group = groups
            .entry((record.kind, record.canonical_label))
            .or_insert_with(|| Group {
                occurrences: 0,
                raw_labels: BTreeSet::new(),
                samples: Vec::new(),
            });
        group.occurrences += record.occurrences;
        group.raw_labels.insert(record.raw_label);
        group.samples.push(record.sample_description);
    }

    let mut proposals: Vec<TypeProposal> = groups
        .into_iter()
        .map(|((kind, canonical_label), group)| TypeProposal {
            proposal_kind: kind,
            canonical_label,
            occurrences: group.occurrences,
            raw_labels: group.raw_labels.into_iter().collect(),
            sample_descriptions: unique_non_empty(
                group.samples.iter().map(String::as_str),
                MAX_SAMPLE_DESCRIPTIONS,
            ),
        })
        .collect();

    proposals.sort_by(|a, b| {
        b.occurrences
            .cmp(&a.occurrences)
            .then_with(|| a.canonical_label.cmp(&b.canonical_label))
    });
    proposals
}
